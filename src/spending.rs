use core::str::FromStr;

use bitcoin::script::{Builder as ScriptBuilder, PushBytesBuf};
use bitcoin::{PublicKey, ScriptBuf, Witness};
use miniscript::{bitcoin, Descriptor};
use serde::{Deserialize, Serialize};

use crate::{ChainKind, SighashAlgorithm, UnspentOutput};

/// Base weight of a transaction input (outpoint, sequence and the scriptSig length byte).
const TXIN_BASE_WEIGHT: u64 = (32 + 4 + 4 + 1) * 4;

/// Address type of the spending key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressType {
    /// Pay to public key hash.
    P2pkh,
    /// P2WPKH nested in P2SH.
    P2shP2wpkh,
    /// Native segwit v0 pay to witness public key hash.
    P2wpkh,
    /// 1-of-N bare multisig wrapped in P2SH.
    P2shMultisig,
    /// 1-of-N multisig in P2WSH.
    P2wshMultisig,
}

impl AddressType {
    /// Whether spending this type requires segregated witness.
    pub fn is_segwit(&self) -> bool {
        matches!(
            self,
            AddressType::P2shP2wpkh | AddressType::P2wpkh | AddressType::P2wshMultisig
        )
    }

    /// Signature-hash algorithm used to spend this type on `chain`.
    pub fn sighash_algorithm(&self, chain: ChainKind) -> SighashAlgorithm {
        if self.is_segwit() {
            SighashAlgorithm::SegwitV0
        } else {
            chain.legacy_sighash()
        }
    }
}

/// The key (and script, for script-hash types) that every spent output is locked to.
///
/// All per-type behavior lives here: the output script, the virtual size of one input, the
/// script code committed to by the signature hash and the unlocking data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendingKey {
    address_type: AddressType,
    public_key: PublicKey,
    script_pubkey: ScriptBuf,
    /// Redeem script (P2SH) or witness script (P2WSH) of a multisig.
    script: Option<ScriptBuf>,
    input_vbytes: u64,
}

impl SpendingKey {
    /// Legacy P2PKH.
    pub fn p2pkh(public_key: PublicKey) -> Self {
        Self {
            address_type: AddressType::P2pkh,
            public_key,
            script_pubkey: ScriptBuf::new_p2pkh(&public_key.pubkey_hash()),
            script: None,
            input_vbytes: if public_key.compressed { 148 } else { 180 },
        }
    }

    /// Native P2WPKH.
    pub fn p2wpkh(public_key: PublicKey) -> Result<Self, SpendingError> {
        let wpkh = public_key
            .wpubkey_hash()
            .map_err(|_| SpendingError::UncompressedKey)?;
        Ok(Self {
            address_type: AddressType::P2wpkh,
            public_key,
            script_pubkey: ScriptBuf::new_p2wpkh(&wpkh),
            script: None,
            input_vbytes: 68,
        })
    }

    /// P2WPKH nested in P2SH.
    pub fn p2sh_p2wpkh(public_key: PublicKey) -> Result<Self, SpendingError> {
        if !public_key.compressed {
            return Err(SpendingError::UncompressedKey);
        }
        let desc = Descriptor::<PublicKey>::from_str(&format!("sh(wpkh({public_key}))"))?;
        Ok(Self {
            address_type: AddressType::P2shP2wpkh,
            public_key,
            script_pubkey: desc.script_pubkey(),
            script: None,
            input_vbytes: 91,
        })
    }

    /// 1-of-N multisig in which `public_key` is the signing key and `cosigners` are the other
    /// keys of the script, in script order after the signer.
    pub fn multisig(
        address_type: AddressType,
        public_key: PublicKey,
        cosigners: &[PublicKey],
    ) -> Result<Self, SpendingError> {
        let wrapper = match address_type {
            AddressType::P2shMultisig => "sh",
            AddressType::P2wshMultisig => "wsh",
            other => return Err(SpendingError::NotMultisig(other)),
        };
        let keys = core::iter::once(&public_key)
            .chain(cosigners)
            .map(|pk| pk.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let desc = Descriptor::<PublicKey>::from_str(&format!("{wrapper}(multi(1,{keys}))"))?;
        let satisfaction = desc.max_weight_to_satisfy()?.to_wu();
        Ok(Self {
            address_type,
            public_key,
            script_pubkey: desc.script_pubkey(),
            script: Some(desc.explicit_script()?),
            input_vbytes: (TXIN_BASE_WEIGHT + satisfaction).div_ceil(4),
        })
    }

    /// Address type.
    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Signing public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Output script of the address.
    pub fn script_pubkey(&self) -> &ScriptBuf {
        &self.script_pubkey
    }

    /// Estimated virtual size of one input spending this address.
    pub fn input_vbytes(&self) -> u64 {
        self.input_vbytes
    }

    /// Signature-hash algorithm on `chain`.
    pub fn sighash_algorithm(&self, chain: ChainKind) -> SighashAlgorithm {
        self.address_type.sighash_algorithm(chain)
    }

    /// Error if this address type cannot be spent on `chain`.
    pub fn check_chain(&self, chain: ChainKind) -> Result<(), SpendingError> {
        if self.address_type.is_segwit() && !chain.supports_segwit() {
            return Err(SpendingError::SegwitUnsupported(chain));
        }
        Ok(())
    }

    /// Script code committed to by the signature hash of an input spending `utxo`.
    pub fn script_code(&self, utxo: &UnspentOutput) -> ScriptBuf {
        match self.address_type {
            AddressType::P2pkh => utxo.script_pubkey.clone(),
            AddressType::P2wpkh | AddressType::P2shP2wpkh => {
                ScriptBuf::new_p2pkh(&self.public_key.pubkey_hash())
            }
            AddressType::P2shMultisig | AddressType::P2wshMultisig => {
                self.script.clone().unwrap_or_default()
            }
        }
    }

    /// The scriptSig and witness of an input, given its signature with the sighash byte
    /// appended.
    pub fn unlock(&self, signature: &[u8]) -> Result<(ScriptBuf, Witness), SpendingError> {
        let sig = push_bytes(signature)?;
        let pk = self.public_key.to_bytes();
        let unlocking = match self.address_type {
            AddressType::P2pkh => (
                ScriptBuilder::new()
                    .push_slice(sig)
                    .push_key(&self.public_key)
                    .into_script(),
                Witness::new(),
            ),
            AddressType::P2wpkh => (
                ScriptBuf::new(),
                Witness::from_slice(&[signature, pk.as_slice()]),
            ),
            AddressType::P2shP2wpkh => {
                let wpkh = self
                    .public_key
                    .wpubkey_hash()
                    .map_err(|_| SpendingError::UncompressedKey)?;
                let redeem = ScriptBuf::new_p2wpkh(&wpkh);
                (
                    ScriptBuilder::new()
                        .push_slice(push_bytes(redeem.as_bytes())?)
                        .into_script(),
                    Witness::from_slice(&[signature, pk.as_slice()]),
                )
            }
            AddressType::P2shMultisig => {
                let redeem = self.script.as_ref().ok_or(SpendingError::MissingScript)?;
                (
                    ScriptBuilder::new()
                        .push_int(0)
                        .push_slice(sig)
                        .push_slice(push_bytes(redeem.as_bytes())?)
                        .into_script(),
                    Witness::new(),
                )
            }
            AddressType::P2wshMultisig => {
                let witness_script = self.script.as_ref().ok_or(SpendingError::MissingScript)?;
                (
                    ScriptBuf::new(),
                    Witness::from_slice(&[&[][..], signature, witness_script.as_bytes()]),
                )
            }
        };
        Ok(unlocking)
    }
}

fn push_bytes(data: &[u8]) -> Result<PushBytesBuf, SpendingError> {
    PushBytesBuf::try_from(data.to_vec()).map_err(|_| SpendingError::PushTooLarge(data.len()))
}

/// Errors when deriving or unlocking a spending key.
#[derive(Debug, thiserror::Error)]
pub enum SpendingError {
    /// Segwit types require a compressed key.
    #[error("segwit address types require a compressed public key")]
    UncompressedKey,
    /// Chain has no segregated witness.
    #[error("{0:?} does not support segwit address types")]
    SegwitUnsupported(ChainKind),
    /// Not a multisig type.
    #[error("{0:?} is not a multisig address type")]
    NotMultisig(AddressType),
    /// Script-hash type without its script.
    #[error("missing redeem or witness script")]
    MissingScript,
    /// Data exceeds the 520 byte push limit.
    #[error("push of {0} bytes exceeds the script element limit")]
    PushTooLarge(usize),
    /// Miniscript.
    #[error("miniscript: {0}")]
    Miniscript(#[from] miniscript::Error),
}
