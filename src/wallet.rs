use core::fmt;
use std::sync::{PoisonError, RwLock};

use bitcoin::{Amount, ScriptBuf, Txid};
use miniscript::bitcoin;

use crate::provider::{ChainAddress, ChainDataProvider, ProviderError};
use crate::{
    BuildError, Builder, ChainParams, FeeError, FeeRate, FeeRateTier, FinalizeError,
    InputSelection, MultiProviderRouter, ReserveCheck, ReservePolicy, RouterError, SignedTransaction,
    SignerError, SpendingError, SpendingKey, Tiers, TransactionSigner, UnspentOutput, UtxoSet,
    ValidationContext, ValidationError, Validator,
};

/// Fee quote for a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    /// Fee rate of each tier.
    pub rates: FeeRateTier,
    /// Absolute fee of the send at each tier, `None` where the balance cannot cover it.
    pub fees: Tiers<Option<Amount>>,
}

/// Wallet service of a single address on a UTXO chain.
///
/// Holds the chain parameters, the key that controls the address, a [`MultiProviderRouter`]
/// for all chain access and an in-memory cache of the address's unspent outputs. The cache is
/// loaded on first use, replaced as a whole by [`refresh`](Self::refresh) and dropped after
/// every broadcast.
pub struct UtxoWallet<P: ?Sized + ChainDataProvider = dyn ChainDataProvider> {
    chain: ChainParams,
    spending: SpendingKey,
    address: ChainAddress,
    router: MultiProviderRouter<P>,
    utxos: RwLock<Option<UtxoSet>>,
    validator: Validator,
}

impl<P: ?Sized + ChainDataProvider> fmt::Debug for UtxoWallet<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtxoWallet")
            .field("chain", &self.chain.kind)
            .field("address", &self.address.address)
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl<P: ?Sized + ChainDataProvider> UtxoWallet<P> {
    /// New wallet for the address of `spending`, encoded as `address`.
    ///
    /// The validator checks amount and dust, plus the chain's reserve if it has one.
    pub fn new(
        chain: ChainParams,
        spending: SpendingKey,
        address: impl Into<String>,
        router: MultiProviderRouter<P>,
    ) -> Result<Self, WalletError> {
        spending.check_chain(chain.kind)?;
        let mut validator = Validator::with_dust();
        if let Some(reserve) = chain.reserve {
            validator = validator.with(ReserveCheck::new(reserve, ReservePolicy::default()));
        }
        let address = ChainAddress::new(address, spending.script_pubkey().clone());
        Ok(Self {
            chain,
            spending,
            address,
            router,
            utxos: RwLock::new(None),
            validator,
        })
    }

    /// Replace the validator.
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Chain parameters.
    pub fn chain(&self) -> &ChainParams {
        &self.chain
    }

    /// Address of the wallet.
    pub fn address(&self) -> &ChainAddress {
        &self.address
    }

    /// Router used for every chain request.
    pub fn router(&self) -> &MultiProviderRouter<P> {
        &self.router
    }

    /// Fetch the unspent outputs of the address and replace the cache with them.
    ///
    /// Returns the spendable balance.
    pub async fn refresh(&self) -> Result<Amount, WalletError> {
        let address = &self.address;
        let fetched = self
            .router
            .execute(|provider| async move { provider.unspent_outputs(address).await })
            .await?;
        let set = UtxoSet::from_outputs(fetched);
        let balance = set.balance(self.chain.pending_policy);
        log::debug!(
            "{}: {} outputs, spendable balance {}",
            self.address.address,
            set.len(),
            balance
        );
        *self.utxos.write().unwrap_or_else(PoisonError::into_inner) = Some(set);
        Ok(balance)
    }

    /// Snapshot of the cached outputs, `None` if not loaded since the last broadcast.
    pub fn utxos(&self) -> Option<UtxoSet> {
        self.utxos
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Spendable outputs, loading the cache if needed.
    async fn spendable(&self) -> Result<Vec<UnspentOutput>, WalletError> {
        if self.utxos().is_none() {
            self.refresh().await?;
        }
        Ok(self
            .utxos()
            .map(|set| set.spendable(self.chain.pending_policy))
            .unwrap_or_default())
    }

    /// Current fee rate tiers.
    pub async fn fee_rates(&self) -> Result<FeeRateTier, WalletError> {
        let data = self
            .router
            .execute(|provider| async move { provider.fee_data().await })
            .await?;
        Ok(self.chain.fee_estimator().estimate(data)?)
    }

    /// Fee rates and the resulting fee of sending `amount` to `destination` at each tier.
    ///
    /// Outputs and fee data are fetched concurrently.
    pub async fn estimate_fee(
        &self,
        amount: Amount,
        destination: &ScriptBuf,
    ) -> Result<FeeEstimate, WalletError> {
        let (_, rates) = tokio::try_join!(self.refresh(), self.fee_rates())?;
        let utxos = self.spendable().await?;
        let fees = rates.try_map(|rate| {
            match self.quote(&utxos, amount, destination, None, rate) {
                Ok(selection) => Ok(Some(selection.fee)),
                Err(BuildError::InsufficientFunds { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })?;
        Ok(FeeEstimate { rates, fees })
    }

    fn builder(
        &self,
        utxos: &[UnspentOutput],
        amount: Amount,
        destination: &ScriptBuf,
        change: Option<&ScriptBuf>,
        fee_rate: FeeRate,
    ) -> Builder {
        let mut builder = Builder::new(self.chain.clone(), self.spending.clone());
        builder
            .recipient(destination.clone(), amount)
            .fee_rate(fee_rate)
            .add_utxos(utxos.iter().cloned());
        if let Some(change) = change {
            builder.change_to(change.clone());
        }
        builder
    }

    fn quote(
        &self,
        utxos: &[UnspentOutput],
        amount: Amount,
        destination: &ScriptBuf,
        change: Option<&ScriptBuf>,
        fee_rate: FeeRate,
    ) -> Result<InputSelection, BuildError> {
        self.builder(utxos, amount, destination, change, fee_rate)
            .select()
    }

    /// Validate, build and sign a send of `amount` to `destination`.
    ///
    /// Change goes to `change`, or back to the wallet's own address. The signer only ever
    /// sees the signing hashes.
    pub async fn build_and_sign(
        &self,
        amount: Amount,
        destination: &ScriptBuf,
        change: Option<&ScriptBuf>,
        fee_rate: FeeRate,
        signer: &dyn TransactionSigner,
    ) -> Result<SignedTransaction, WalletError> {
        let utxos = self.spendable().await?;
        let balance: Amount = utxos.iter().map(|utxo| utxo.amount).sum();

        let fee = match self.quote(&utxos, amount, destination, change, fee_rate) {
            Ok(selection) => selection.fee,
            // let the balance check report it
            Err(BuildError::InsufficientFunds { required, .. }) => {
                required.checked_sub(amount).unwrap_or(Amount::ZERO)
            }
            Err(e) => return Err(e.into()),
        };
        let ctx = ValidationContext {
            amount,
            fee,
            balance,
            fee_balance: None,
            dust_threshold: self.chain.dust_threshold,
            destination_balance: None,
        };
        for warning in self.validator.validate(&ctx)? {
            log::warn!("{}: {warning}", self.address.address);
        }

        let unsigned = self
            .builder(&utxos, amount, destination, change, fee_rate)
            .build()?;
        let signatures = signer.sign(unsigned.signing_hashes()).await?;
        Ok(unsigned.into_finalizer().finalize(&signatures)?)
    }

    /// Broadcast `tx` and drop the output cache.
    pub async fn send(&self, tx: &SignedTransaction) -> Result<Txid, WalletError> {
        let hex = tx.to_hex();
        let hex = hex.as_str();
        let (txid, via) = self
            .router
            .execute(|provider| async move {
                let txid = provider.broadcast(hex).await?;
                Ok::<_, ProviderError>((txid, provider.name().to_owned()))
            })
            .await?;
        if txid != tx.txid() {
            log::warn!("{via} reported txid {txid}, expected {}", tx.txid());
        }
        log::info!("broadcast {txid} from {} via {via}", self.address.address);
        *self.utxos.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(txid)
    }

    /// Number of confirmed transactions of the address.
    pub async fn confirmed_transaction_count(&self) -> Result<u64, WalletError> {
        let address = &self.address;
        Ok(self
            .router
            .execute(|provider| async move { provider.confirmed_transaction_count(address).await })
            .await?)
    }
}

/// Kind of failure, deciding how a caller recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// No provider could be reached. Worth retrying later.
    ProviderFailure,
    /// The request breaks a rule of the chain or the account. Retrying cannot help.
    BusinessError,
    /// The transaction could not be built. Start over with fresh outputs and fee data.
    BuildFailure,
    /// Signatures were missing or unusable. Nothing was finalized.
    SignatureError,
    /// The caller cancelled the operation.
    Cancelled,
}

/// Wallet error
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    /// Router
    #[error(transparent)]
    Router(#[from] RouterError),
    /// Fee
    #[error(transparent)]
    Fee(#[from] FeeError),
    /// Build
    #[error(transparent)]
    Build(#[from] BuildError),
    /// Finalize
    #[error(transparent)]
    Finalize(#[from] FinalizeError),
    /// Validation
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// Signer
    #[error(transparent)]
    Signer(#[from] SignerError),
    /// Spending key
    #[error(transparent)]
    Spending(#[from] SpendingError),
}

impl WalletError {
    /// Category of the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            WalletError::Router(RouterError::Business(_)) => ErrorCategory::BusinessError,
            WalletError::Router(RouterError::Cancelled) => ErrorCategory::Cancelled,
            WalletError::Router(_) => ErrorCategory::ProviderFailure,
            WalletError::Validation(_) => ErrorCategory::BusinessError,
            WalletError::Fee(_) | WalletError::Build(_) | WalletError::Spending(_) => {
                ErrorCategory::BuildFailure
            }
            WalletError::Finalize(_) | WalletError::Signer(_) => ErrorCategory::SignatureError,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::BusinessError;

    #[test]
    fn test_categories() {
        let cases = [
            (
                WalletError::from(RouterError::Exhausted {
                    attempts: 2,
                    last: ProviderError::Timeout,
                }),
                ErrorCategory::ProviderFailure,
            ),
            (
                RouterError::Business(BusinessError::AccountNotFound).into(),
                ErrorCategory::BusinessError,
            ),
            (RouterError::Cancelled.into(), ErrorCategory::Cancelled),
            (
                ValidationError::AmountBelowDust {
                    threshold: Amount::from_sat(546),
                }
                .into(),
                ErrorCategory::BusinessError,
            ),
            (FeeError::Unavailable.into(), ErrorCategory::BuildFailure),
            (
                BuildError::InsufficientFunds {
                    available: Amount::from_sat(1),
                    required: Amount::from_sat(2),
                }
                .into(),
                ErrorCategory::BuildFailure,
            ),
            (
                FinalizeError::SignatureCountMismatch {
                    expected: 2,
                    got: 1,
                }
                .into(),
                ErrorCategory::SignatureError,
            ),
        ];
        for (err, category) in cases {
            assert_eq!(err.category(), category, "{err}");
        }
    }

    #[test]
    fn test_exhausted_message_is_generic() {
        let err = WalletError::from(RouterError::Exhausted {
            attempts: 3,
            last: ProviderError::Network("connect 10.0.0.7:9130 refused".into()),
        });
        assert!(!err.to_string().contains("10.0.0.7"));
    }
}
