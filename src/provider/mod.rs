//! Chain-data providers.
//!
//! A provider answers the few questions the wallet has about the chain: which outputs an
//! address can spend, what the current fee rate is, and it broadcasts transactions. Any number
//! of them can be combined behind a [`MultiProviderRouter`](crate::MultiProviderRouter).

use core::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bitcoin::{ScriptBuf, Txid};
use miniscript::bitcoin;

use crate::{ProviderFeeData, UnspentOutput};

#[cfg(feature = "http")]
mod blockbook;
#[cfg(feature = "http")]
mod rpc;

#[cfg(feature = "http")]
pub use blockbook::{BlockbookConfig, BlockbookProvider};
#[cfg(feature = "http")]
pub use rpc::{RpcConfig, RpcProvider};

/// An address in both of the forms providers need: the chain's string encoding for indexer
/// APIs and the output script for node APIs and for filling in [`UnspentOutput::script_pubkey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainAddress {
    /// Address string.
    pub address: String,
    /// Output script.
    pub script_pubkey: ScriptBuf,
}

impl ChainAddress {
    /// New
    pub fn new(address: impl Into<String>, script_pubkey: ScriptBuf) -> Self {
        Self {
            address: address.into(),
            script_pubkey,
        }
    }
}

/// Chain-data backend of a UTXO chain.
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Unspent outputs locked to `address`, confirmed or not.
    async fn unspent_outputs(
        &self,
        address: &ChainAddress,
    ) -> Result<Vec<UnspentOutput>, ProviderError>;

    /// Current fee rate data.
    async fn fee_data(&self) -> Result<ProviderFeeData, ProviderError>;

    /// Broadcast a hex encoded raw transaction.
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<Txid, ProviderError>;

    /// Number of confirmed transactions involving `address`.
    async fn confirmed_transaction_count(&self, address: &ChainAddress)
        -> Result<u64, ProviderError>;
}

/// Error returned by a provider.
///
/// Everything except [`ProviderError::Business`] is a provider-level failure: another provider
/// may well succeed, so the router moves on to the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Transport failure.
    #[error("network error: {0}")]
    Network(String),
    /// No response in time.
    #[error("request timed out")]
    Timeout,
    /// Server-side HTTP status (5xx), rate limiting or rejected credentials.
    #[error("HTTP status {0}")]
    Status(u16),
    /// Response could not be understood.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// Node-side failure that another node may not have, e.g. still warming up.
    #[error("node error {code}: {message}")]
    Node {
        /// error code
        code: i64,
        /// message
        message: String,
    },
    /// The provider does not offer this query.
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),
    /// The request itself cannot succeed anywhere.
    #[error(transparent)]
    Business(#[from] BusinessError),
}

/// A business-rule failure. Retrying elsewhere cannot fix it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusinessError {
    /// Unknown account.
    #[error("account not found")]
    AccountNotFound,
    /// Not enough funds on chain.
    #[error("insufficient balance")]
    InsufficientBalance,
    /// The network refused the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),
}

/// Request id generator of a provider.
///
/// Every provider owns its own sequence, starting at 1.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicU64);

impl RequestIds {
    /// New
    pub fn new() -> Self {
        Self::default()
    }

    /// Next id.
    pub fn next_id(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(feature = "http")]
fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Network(e.to_string())
    }
}
