use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Script, Transaction};
use miniscript::bitcoin;
use serde::{Deserialize, Serialize};

/// `SIGHASH_ALL`.
pub const SIGHASH_ALL: u8 = 0x01;

/// `SIGHASH_FORKID`, set on top of the base type by Bitcoin Cash.
pub const SIGHASH_FORKID: u8 = 0x40;

/// A 32-byte digest that must be signed to authorize one input.
pub type SigningHash = [u8; 32];

/// Signature-hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SighashAlgorithm {
    /// Original algorithm: the whole transaction is serialized with every other input's script
    /// blanked and the script code of the signed input substituted.
    Legacy,
    /// BIP-143 digest over the script code, the spent amount and the sequence.
    SegwitV0,
    /// BIP-143 digest with `SIGHASH_FORKID` (replay protection of Bitcoin Cash).
    ForkId,
}

impl SighashAlgorithm {
    /// Sighash type byte appended to every signature.
    pub fn sighash_byte(&self) -> u8 {
        match self {
            SighashAlgorithm::Legacy | SighashAlgorithm::SegwitV0 => SIGHASH_ALL,
            SighashAlgorithm::ForkId => SIGHASH_ALL | SIGHASH_FORKID,
        }
    }

    /// Compute the digest to sign for `input_index`.
    ///
    /// `script_code` is the script being satisfied: the previous output script for P2PKH, the
    /// redeem or witness script for script-hash outputs, or the P2PKH template of the key hash
    /// for P2WPKH. `value` is only committed to by the BIP-143 variants.
    ///
    /// # Errors
    ///
    /// If `input_index` is out of bounds.
    pub fn signature_hash(
        &self,
        tx: &Transaction,
        input_index: usize,
        script_code: &Script,
        value: Amount,
    ) -> Result<SigningHash, SighashError> {
        if input_index >= tx.input.len() {
            return Err(SighashError::InputIndex {
                index: input_index,
                inputs: tx.input.len(),
            });
        }
        let out_of_range = |_| SighashError::InputIndex {
            index: input_index,
            inputs: tx.input.len(),
        };
        match self {
            SighashAlgorithm::Legacy => SighashCache::new(tx)
                .legacy_signature_hash(input_index, script_code, u32::from(SIGHASH_ALL))
                .map(|h| h.to_byte_array())
                .map_err(out_of_range),
            SighashAlgorithm::SegwitV0 => SighashCache::new(tx)
                .p2wsh_signature_hash(input_index, script_code, value, EcdsaSighashType::All)
                .map(|h| h.to_byte_array())
                .map_err(out_of_range),
            SighashAlgorithm::ForkId => Ok(bip143_digest(
                tx,
                input_index,
                script_code,
                value,
                u32::from(self.sighash_byte()),
            )),
        }
    }
}

/// BIP-143 digest for `SIGHASH_ALL`-based types with an arbitrary type word.
///
/// The caller guarantees `input_index` is in range.
fn bip143_digest(
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    value: Amount,
    sighash_type: u32,
) -> SigningHash {
    let mut prevouts = Vec::with_capacity(tx.input.len() * 36);
    let mut sequences = Vec::with_capacity(tx.input.len() * 4);
    for txin in &tx.input {
        prevouts.extend(serialize(&txin.previous_output));
        sequences.extend(txin.sequence.to_consensus_u32().to_le_bytes());
    }
    let mut outputs = Vec::new();
    for txout in &tx.output {
        outputs.extend(serialize(txout));
    }
    let txin = &tx.input[input_index];

    let mut preimage = Vec::with_capacity(156 + script_code.len());
    preimage.extend(tx.version.0.to_le_bytes());
    preimage.extend(sha256d::Hash::hash(&prevouts).to_byte_array());
    preimage.extend(sha256d::Hash::hash(&sequences).to_byte_array());
    preimage.extend(serialize(&txin.previous_output));
    preimage.extend(serialize(&script_code.to_owned()));
    preimage.extend(value.to_sat().to_le_bytes());
    preimage.extend(txin.sequence.to_consensus_u32().to_le_bytes());
    preimage.extend(sha256d::Hash::hash(&outputs).to_byte_array());
    preimage.extend(tx.lock_time.to_consensus_u32().to_le_bytes());
    preimage.extend(sighash_type.to_le_bytes());

    sha256d::Hash::hash(&preimage).to_byte_array()
}

/// Signature-hash error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SighashError {
    /// Input index out of range.
    #[error("input index {index} out of range for {inputs} inputs")]
    InputIndex {
        /// requested index
        index: usize,
        /// number of inputs
        inputs: usize,
    },
}
