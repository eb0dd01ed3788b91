use async_trait::async_trait;
use bitcoin::secp256k1::{self, Message, Secp256k1};
use bitcoin::{PrivateKey, PublicKey};
use miniscript::bitcoin;
use miniscript::descriptor::{DescriptorSecretKey, KeyMap};

use crate::SigningHash;

/// Produces one signature per signing hash.
///
/// The signing backend is an external capability (an in-memory key, a hardware card, a remote
/// service) so it is only ever handed digests, never transactions. Signatures may be returned
/// as 64-byte compact `r || s` or as DER; the [`Finalizer`](crate::Finalizer) normalizes them.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Sign every hash, returning signatures in the same order.
    async fn sign(&self, hashes: &[SigningHash]) -> Result<Vec<Vec<u8>>, SignerError>;
}

/// Signs with a private key held in memory.
#[derive(Debug, Clone)]
pub struct PrivateKeySigner {
    key: PrivateKey,
    secp: Secp256k1<secp256k1::SignOnly>,
}

impl PrivateKeySigner {
    /// New signer for `key`.
    pub fn new(key: PrivateKey) -> Self {
        Self {
            key,
            secp: Secp256k1::signing_only(),
        }
    }

    /// From a WIF encoded key.
    pub fn from_wif(wif: &str) -> Result<Self, SignerError> {
        PrivateKey::from_wif(wif)
            .map(Self::new)
            .map_err(|e| SignerError::Key(e.to_string()))
    }

    /// Take the single (non-extended) key of a descriptor key map, e.g. the one obtained by
    /// parsing `wpkh(<WIF>)`.
    pub fn from_keymap(keymap: &KeyMap) -> Result<Self, SignerError> {
        let mut singles = keymap.clone().into_iter().filter_map(|(_, sk)| match sk {
            DescriptorSecretKey::Single(prv) => Some(prv.key),
            _ => None,
        });
        match (singles.next(), singles.next()) {
            (Some(key), None) => Ok(Self::new(key)),
            (None, _) => Err(SignerError::Key("no single key in key map".into())),
            (Some(_), Some(_)) => Err(SignerError::Key("more than one key in key map".into())),
        }
    }

    /// Public key of the signer.
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key(&self.secp)
    }
}

#[async_trait]
impl TransactionSigner for PrivateKeySigner {
    async fn sign(&self, hashes: &[SigningHash]) -> Result<Vec<Vec<u8>>, SignerError> {
        Ok(hashes
            .iter()
            .map(|hash| {
                self.secp
                    .sign_ecdsa(&Message::from_digest(*hash), &self.key.inner)
                    .serialize_compact()
                    .to_vec()
            })
            .collect())
    }
}

/// Signer error
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    /// The key could not be loaded.
    #[error("invalid key: {0}")]
    Key(String),
    /// The backend declined to sign.
    #[error("signing rejected: {0}")]
    Rejected(String),
}
