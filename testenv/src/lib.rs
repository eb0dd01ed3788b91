use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use utxo_wallet::bitcoin::{
    consensus, hashes::Hash, hex::FromHex, secp256k1, Amount, Network, PrivateKey,
    PublicKey, ScriptBuf, Transaction, Txid, WPubkeyHash,
};
use utxo_wallet::rust_decimal::Decimal;
use utxo_wallet::provider::{BusinessError, ChainAddress, ChainDataProvider, ProviderError};
use utxo_wallet::{AddressType, PrivateKeySigner, ProviderFeeData, SpendingKey, UnspentOutput};

/// Fixture key `n` (any non-zero byte).
pub fn private_key(n: u8) -> PrivateKey {
    let secret = secp256k1::SecretKey::from_slice(&[n; 32]).expect("non-zero fixture key");
    PrivateKey::new(secret, Network::Testnet)
}

pub fn public_key(n: u8) -> PublicKey {
    private_key(n).public_key(&secp256k1::Secp256k1::signing_only())
}

pub fn signer(n: u8) -> PrivateKeySigner {
    PrivateKeySigner::new(private_key(n))
}

/// Spending key of fixture key 1. Multisig types add fixture keys 2 and 3 as cosigners.
pub fn spending_key(address_type: AddressType) -> anyhow::Result<SpendingKey> {
    let pk = public_key(1);
    Ok(match address_type {
        AddressType::P2pkh => SpendingKey::p2pkh(pk),
        AddressType::P2wpkh => SpendingKey::p2wpkh(pk)?,
        AddressType::P2shP2wpkh => SpendingKey::p2sh_p2wpkh(pk)?,
        AddressType::P2shMultisig | AddressType::P2wshMultisig => {
            SpendingKey::multisig(address_type, pk, &[public_key(2), public_key(3)])?
        }
    })
}

/// Some P2WPKH script nobody in the fixtures controls.
pub fn recipient() -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([0xab; 20]))
}

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

/// Confirmed output `txid(n):vout` worth `sat`, locked to `spending`.
pub fn utxo(spending: &SpendingKey, n: u8, vout: u32, sat: u64) -> UnspentOutput {
    UnspentOutput::new(
        txid(n),
        vout,
        Amount::from_sat(sat),
        spending.script_pubkey().clone(),
    )
    .with_confirmations(6)
}

/// A provider answering from canned data.
///
/// Failures queued with [`fail_next`](Self::fail_next) are returned by the next calls, one
/// per call, before any canned answer.
#[derive(Debug)]
pub struct ScriptedProvider {
    pub name: String,
    utxos: Mutex<Vec<UnspentOutput>>,
    fee_data: Mutex<ProviderFeeData>,
    tx_count: u64,
    failures: Mutex<VecDeque<ProviderError>>,
    always_fail: Option<ProviderError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    broadcasts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            utxos: Mutex::new(vec![]),
            fee_data: Mutex::new(ProviderFeeData::Rates(vec![Decimal::ONE, Decimal::TWO, Decimal::from(5u8)])),
            tx_count: 0,
            failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            delay: None,
            calls: AtomicUsize::new(0),
            broadcasts: Mutex::new(vec![]),
        }
    }

    pub fn with_utxos(self, utxos: impl IntoIterator<Item = UnspentOutput>) -> Self {
        self.set_utxos(utxos);
        self
    }

    pub fn with_fee_data(self, data: ProviderFeeData) -> Self {
        *self.fee_data.lock().unwrap() = data;
        self
    }

    pub fn with_tx_count(mut self, count: u64) -> Self {
        self.tx_count = count;
        self
    }

    pub fn always_failing(mut self, err: ProviderError) -> Self {
        self.always_fail = Some(err);
        self
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_next(&self, err: ProviderError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn set_utxos(&self, utxos: impl IntoIterator<Item = UnspentOutput>) {
        *self.utxos.lock().unwrap() = utxos.into_iter().collect();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Raw transactions broadcast so far, hex encoded.
    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    async fn enter(&self) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        match &self.always_fail {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChainDataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn unspent_outputs(
        &self,
        _address: &ChainAddress,
    ) -> Result<Vec<UnspentOutput>, ProviderError> {
        self.enter().await?;
        Ok(self.utxos.lock().unwrap().clone())
    }

    async fn fee_data(&self) -> Result<ProviderFeeData, ProviderError> {
        self.enter().await?;
        Ok(self.fee_data.lock().unwrap().clone())
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ProviderError> {
        self.enter().await?;
        let tx: Transaction = Vec::<u8>::from_hex(raw_tx_hex)
            .ok()
            .and_then(|bytes| consensus::deserialize(&bytes).ok())
            .ok_or_else(|| BusinessError::Rejected("TX decode failed".into()))?;
        self.broadcasts.lock().unwrap().push(raw_tx_hex.to_owned());
        Ok(tx.compute_txid())
    }

    async fn confirmed_transaction_count(
        &self,
        _address: &ChainAddress,
    ) -> Result<u64, ProviderError> {
        self.enter().await?;
        Ok(self.tx_count)
    }
}
