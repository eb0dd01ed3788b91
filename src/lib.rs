//! `utxo_wallet`
//!
//! Transaction construction, fee estimation and multi-provider failover for
//! Bitcoin-family (UTXO) chains.
//!
//! The flow is: fetch unspent outputs and a fee rate through a
//! [`MultiProviderRouter`], select inputs and compute per-input signing hashes with a
//! [`Builder`], obtain signatures from an external [`TransactionSigner`], assemble the
//! broadcastable transaction with a [`Finalizer`], and broadcast it through the router again.
//! [`UtxoWallet`] ties these steps together.

#![warn(missing_docs)]

mod builder;
mod chain;
mod fee;
mod finalizer;
pub mod provider;
mod router;
mod selection;
mod sighash;
mod signer;
mod spending;
mod utxo;
mod validation;
mod wallet;

pub use builder::*;
pub use chain::*;
pub use fee::*;
pub use finalizer::*;
pub use provider::{BusinessError, ChainAddress, ChainDataProvider, ProviderError, RequestIds};
pub use router::*;
pub use selection::*;
pub use sighash::*;
pub use signer::*;
pub use spending::*;
pub use utxo::*;
pub use validation::*;
pub use wallet::*;

pub use miniscript;
pub use miniscript::bitcoin;
pub use rust_decimal;
