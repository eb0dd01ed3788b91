
use bitcoin::{
    absolute, Amount, OutPoint, ScriptBuf, Sequence, SignedAmount, Transaction, TxIn, TxOut,
    Witness,
};
use miniscript::bitcoin;

use crate::{
    select_inputs, ChainParams, FeeRate, Finalizer, InputOrdering, InputSelection,
    SelectionError, SelectionParams, SighashAlgorithm, SighashError, SigningHash, SizeModel,
    SpendingError, SpendingKey, UnspentOutput,
};

/// Transaction builder
///
/// Spends outputs locked to a single [`SpendingKey`] to one recipient, with an optional change
/// output.
///
/// ```rust,no_run
/// # use utxo_wallet::*;
/// # use utxo_wallet::bitcoin::{Amount, ScriptBuf};
/// # fn f(key: SpendingKey, utxos: Vec<UnspentOutput>, dest: ScriptBuf) -> anyhow::Result<()> {
/// let unsigned = Builder::new(ChainParams::bitcoin(), key)
///     .recipient(dest, Amount::from_sat(60_000))
///     .fee_rate(FeeRate::from_sat_per_vb_u64(10))
///     .add_utxos(utxos)
///     .build()?;
/// for hash in unsigned.signing_hashes() {
///     // sign `hash`
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    params: ChainParams,
    spending: SpendingKey,
    recipient: Option<(ScriptBuf, Amount)>,
    change_to: Option<ScriptBuf>,
    fee_rate: FeeRate,
    ordering: Option<InputOrdering>,
    utxos: Vec<UnspentOutput>,
}

impl Builder {
    /// New
    pub fn new(params: ChainParams, spending: SpendingKey) -> Self {
        Self {
            params,
            spending,
            recipient: None,
            change_to: None,
            fee_rate: FeeRate::ZERO,
            ordering: None,
            utxos: Vec::new(),
        }
    }

    /// Set the recipient
    pub fn recipient(&mut self, script: ScriptBuf, amount: Amount) -> &mut Self {
        self.recipient = Some((script, amount));
        self
    }

    /// Send change to `script` instead of back to the spending address
    pub fn change_to(&mut self, script: ScriptBuf) -> &mut Self {
        self.change_to = Some(script);
        self
    }

    /// Fee rate
    pub fn fee_rate(&mut self, fee_rate: FeeRate) -> &mut Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Override the chain's input ordering
    pub fn ordering(&mut self, ordering: InputOrdering) -> &mut Self {
        self.ordering = Some(ordering);
        self
    }

    /// Add an output that may fund the tx
    pub fn add_utxo(&mut self, utxo: UnspentOutput) -> &mut Self {
        self.utxos.push(utxo);
        self
    }

    /// Add outputs that may fund the tx
    pub fn add_utxos(&mut self, utxos: impl IntoIterator<Item = UnspentOutput>) -> &mut Self {
        self.utxos.extend(utxos);
        self
    }

    fn change_script(&self) -> &ScriptBuf {
        self.change_to
            .as_ref()
            .unwrap_or_else(|| self.spending.script_pubkey())
    }

    /// Size model of transactions paying the current recipient.
    pub fn size_model(&self) -> Result<SizeModel, BuildError> {
        let (recipient, amount) = self.recipient.as_ref().ok_or(BuildError::MissingRecipient)?;
        let vbytes = |script_pubkey: &ScriptBuf| {
            TxOut {
                value: *amount,
                script_pubkey: script_pubkey.clone(),
            }
            .weight()
            .to_vbytes_ceil()
        };
        Ok(SizeModel {
            overhead: SizeModel::OVERHEAD,
            input: self.spending.input_vbytes(),
            recipient_output: vbytes(recipient),
            change_output: vbytes(self.change_script()),
        })
    }

    /// Run input selection only, e.g. to quote the fee of a send.
    pub fn select(&self) -> Result<InputSelection, BuildError> {
        self.spending.check_chain(self.params.kind)?;
        let (_, amount) = self.recipient.as_ref().ok_or(BuildError::MissingRecipient)?;
        if let Some(utxo) = self
            .utxos
            .iter()
            .find(|utxo| &utxo.script_pubkey != self.spending.script_pubkey())
        {
            return Err(BuildError::ForeignOutput(utxo.outpoint));
        }
        let params = SelectionParams {
            amount: *amount,
            fee_rate: self.fee_rate,
            dust_threshold: self.params.dust_threshold,
            ordering: self.ordering.unwrap_or(self.params.ordering),
            size: self.size_model()?,
        };
        Ok(select_inputs(&self.utxos, &params)?)
    }

    /// Select inputs and assemble the unsigned transaction with its signing hashes.
    pub fn build(&self) -> Result<UnsignedTransaction, BuildError> {
        let selection = self.select()?;
        let (recipient, amount) = self.recipient.clone().ok_or(BuildError::MissingRecipient)?;

        let sequence = self.params.input_sequence();
        let input = selection
            .inputs
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect();

        let mut output = vec![TxOut {
            value: amount,
            script_pubkey: recipient,
        }];
        let change_index = selection.change.map(|value| {
            output.push(TxOut {
                value,
                script_pubkey: self.change_script().clone(),
            });
            output.len() - 1
        });

        let tx = Transaction {
            version: self.params.version(),
            lock_time: absolute::LockTime::ZERO,
            input,
            output,
        };

        // conservation
        let total_outputs: Amount = tx.output.iter().map(|txo| txo.value).sum();
        if total_outputs + selection.fee != selection.total {
            return Err(BuildError::NegativeFee(
                SignedAmount::from_sat(selection.total.to_sat() as i64)
                    - SignedAmount::from_sat(total_outputs.to_sat() as i64),
            ));
        }

        let sighash = self.spending.sighash_algorithm(self.params.kind);
        let signing_hashes = selection
            .inputs
            .iter()
            .enumerate()
            .map(|(index, utxo)| {
                let script_code = self.spending.script_code(utxo);
                sighash.signature_hash(&tx, index, &script_code, utxo.amount)
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "built {} with {} inputs, {} outputs, fee {} (~{} vB)",
            tx.compute_txid(),
            tx.input.len(),
            tx.output.len(),
            selection.fee,
            selection.vbytes,
        );

        Ok(UnsignedTransaction {
            tx,
            utxos: selection.inputs,
            signing_hashes,
            fee: selection.fee,
            vbytes: selection.vbytes,
            change_index,
            spending: self.spending.clone(),
            sighash,
        })
    }
}

/// A transaction whose inputs still need signatures.
///
/// Created fresh for every send attempt and never modified; a failed attempt starts over from
/// a new [`Builder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    tx: Transaction,
    utxos: Vec<UnspentOutput>,
    signing_hashes: Vec<SigningHash>,
    fee: Amount,
    vbytes: u64,
    change_index: Option<usize>,
    spending: SpendingKey,
    sighash: SighashAlgorithm,
}

impl UnsignedTransaction {
    /// The transaction with empty scriptSigs and witnesses.
    pub fn unsigned_tx(&self) -> &Transaction {
        &self.tx
    }

    /// Spent outputs and their sequence numbers, in input order.
    pub fn inputs(&self) -> impl ExactSizeIterator<Item = (&UnspentOutput, Sequence)> + '_ {
        self.utxos
            .iter()
            .zip(self.tx.input.iter().map(|txin| txin.sequence))
    }

    /// Outputs; the recipient is always first.
    pub fn outputs(&self) -> &[TxOut] {
        &self.tx.output
    }

    /// The change output, if any.
    pub fn change(&self) -> Option<&TxOut> {
        self.change_index.map(|i| &self.tx.output[i])
    }

    /// One digest to sign per input, in input order.
    pub fn signing_hashes(&self) -> &[SigningHash] {
        &self.signing_hashes
    }

    /// Absolute fee.
    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Size estimate the fee was computed for.
    pub fn estimated_vbytes(&self) -> u64 {
        self.vbytes
    }

    /// Total value of the spent outputs.
    pub fn total_input(&self) -> Amount {
        self.utxos.iter().map(|utxo| utxo.amount).sum()
    }

    /// Key that the spent outputs are locked to.
    pub fn spending_key(&self) -> &SpendingKey {
        &self.spending
    }

    /// Signature-hash algorithm used for the signing hashes.
    pub fn sighash_algorithm(&self) -> SighashAlgorithm {
        self.sighash
    }

    /// Convert into a [`Finalizer`].
    pub fn into_finalizer(self) -> Finalizer {
        Finalizer::new(self)
    }
}

/// [`Builder`] error
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// no recipient set
    #[error("no recipient")]
    MissingRecipient,
    /// an input is not locked to the spending key
    #[error("output {0} is not locked to the spending key")]
    ForeignOutput(OutPoint),
    /// the spendable outputs cannot cover amount plus fee
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds {
        /// total value of all candidates
        available: Amount,
        /// amount plus the minimal fee
        required: Amount,
    },
    /// fee arithmetic overflowed
    #[error("fee computation overflowed")]
    FeeOverflow,
    /// negative fee
    #[error("illegal tx: negative fee: {}", .0.display_dynamic())]
    NegativeFee(SignedAmount),
    /// spending key
    #[error(transparent)]
    Spending(#[from] SpendingError),
    /// signature hash
    #[error(transparent)]
    Sighash(#[from] SighashError),
}

impl From<SelectionError> for BuildError {
    fn from(e: SelectionError) -> Self {
        match e {
            SelectionError::InsufficientFunds {
                available,
                required,
            } => Self::InsufficientFunds {
                available,
                required,
            },
            SelectionError::FeeOverflow => Self::FeeOverflow,
        }
    }
}
