use bitcoin::consensus::encode::{serialize, serialize_hex};
use bitcoin::secp256k1::{ecdsa, Message, Secp256k1, VerifyOnly};
use bitcoin::{Amount, Transaction, Txid};
use miniscript::bitcoin;

use crate::{SpendingError, UnsignedTransaction};

/// Assembles a broadcastable transaction from an [`UnsignedTransaction`] and one signature per
/// input.
///
/// Signatures are matched to inputs by position. Each may be a 64-byte compact `r || s` (as
/// returned by most hardware signing backends) or DER. Either way it is checked against the
/// input's signing hash, normalized to low-S DER and suffixed with the sighash type before it
/// goes into the scriptSig or witness.
///
/// Finalizing is a pure function of its inputs: the same signatures always produce the same
/// bytes.
#[derive(Debug, Clone)]
pub struct Finalizer {
    unsigned: UnsignedTransaction,
    secp: Secp256k1<VerifyOnly>,
}

impl Finalizer {
    /// Create.
    pub fn new(unsigned: UnsignedTransaction) -> Self {
        Self {
            unsigned,
            secp: Secp256k1::verification_only(),
        }
    }

    /// The transaction being finalized.
    pub fn unsigned(&self) -> &UnsignedTransaction {
        &self.unsigned
    }

    /// Finalize every input.
    ///
    /// # Errors
    ///
    /// Nothing is returned unless every input is satisfied:
    ///
    /// - [`FinalizeError::SignatureCountMismatch`] if there is not exactly one signature per input.
    /// - [`FinalizeError::MalformedSignature`] if a signature is neither compact nor DER.
    /// - [`FinalizeError::InvalidSignature`] if a signature does not verify against the input's
    ///   signing hash and the spending key.
    pub fn finalize<S: AsRef<[u8]>>(
        &self,
        signatures: &[S],
    ) -> Result<SignedTransaction, FinalizeError> {
        let hashes = self.unsigned.signing_hashes();
        if signatures.len() != hashes.len() {
            return Err(FinalizeError::SignatureCountMismatch {
                expected: hashes.len(),
                got: signatures.len(),
            });
        }

        let spending = self.unsigned.spending_key();
        let sighash_byte = self.unsigned.sighash_algorithm().sighash_byte();
        let mut tx = self.unsigned.unsigned_tx().clone();

        for (index, (raw, hash)) in signatures.iter().zip(hashes).enumerate() {
            let sig = normalize_signature(raw.as_ref())
                .ok_or(FinalizeError::MalformedSignature { index })?;
            self.secp
                .verify_ecdsa(
                    &Message::from_digest(*hash),
                    &sig,
                    &spending.public_key().inner,
                )
                .map_err(|_| FinalizeError::InvalidSignature { index })?;

            let mut bytes = sig.serialize_der().to_vec();
            bytes.push(sighash_byte);
            let (script_sig, witness) = spending.unlock(&bytes)?;
            let txin = &mut tx.input[index];
            txin.script_sig = script_sig;
            txin.witness = witness;
        }

        Ok(SignedTransaction {
            tx,
            fee: self.unsigned.fee(),
        })
    }
}

/// Parse a compact or DER ECDSA signature and normalize it to low-S.
///
/// Returns `None` if `raw` is neither.
pub fn normalize_signature(raw: &[u8]) -> Option<ecdsa::Signature> {
    let mut sig = match raw.len() {
        64 => ecdsa::Signature::from_compact(raw).ok()?,
        _ => ecdsa::Signature::from_der(raw).ok()?,
    };
    sig.normalize_s();
    Some(sig)
}

/// A fully signed transaction, ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    tx: Transaction,
    fee: Amount,
}

impl SignedTransaction {
    /// Transaction id.
    pub fn txid(&self) -> Txid {
        self.tx.compute_txid()
    }

    /// Raw serialized bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(&self.tx)
    }

    /// Hex of the serialized transaction, as expected by broadcast APIs.
    pub fn to_hex(&self) -> String {
        serialize_hex(&self.tx)
    }

    /// Transaction.
    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Absolute fee paid.
    pub fn fee(&self) -> Amount {
        self.fee
    }

    /// Virtual size.
    pub fn vsize(&self) -> usize {
        self.tx.vsize()
    }
}

/// Finalization error
#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    /// Not exactly one signature per input.
    #[error("expected {expected} signatures, got {got}")]
    SignatureCountMismatch {
        /// number of inputs
        expected: usize,
        /// number of signatures
        got: usize,
    },
    /// Signature is neither 64-byte compact nor DER.
    #[error("malformed signature for input {index}")]
    MalformedSignature {
        /// input index
        index: usize,
    },
    /// Signature does not verify.
    #[error("invalid signature for input {index}")]
    InvalidSignature {
        /// input index
        index: usize,
    },
    /// Unlocking script could not be built.
    #[error(transparent)]
    Spending(#[from] SpendingError),
}

#[cfg(test)]
mod test {
    use super::*;

    // secp256k1 group order
    const N: [u8; 32] = [
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xfe, 0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36,
        0x41, 0x41,
    ];

    /// `(r, n - s)`
    fn high_s(compact: [u8; 64]) -> [u8; 64] {
        let mut out = compact;
        let mut borrow = 0i16;
        for i in (0..32).rev() {
            let mut d = N[i] as i16 - compact[32 + i] as i16 - borrow;
            borrow = 0;
            if d < 0 {
                d += 256;
                borrow = 1;
            }
            out[32 + i] = d as u8;
        }
        out
    }

    fn sample() -> ecdsa::Signature {
        use bitcoin::secp256k1::SecretKey;
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5; 32]).unwrap();
        secp.sign_ecdsa(&Message::from_digest([9; 32]), &sk)
    }

    #[test]
    fn compact_and_der_normalize_to_the_same_signature() {
        let sig = sample();
        let from_compact = normalize_signature(&sig.serialize_compact()).unwrap();
        let from_der = normalize_signature(&sig.serialize_der()).unwrap();
        assert_eq!(from_compact, from_der);
    }

    #[test]
    fn high_s_is_normalized() {
        let sig = sample();
        let flipped = high_s(sig.serialize_compact());
        assert_ne!(flipped, sig.serialize_compact());
        let normalized = normalize_signature(&flipped).unwrap();
        assert_eq!(normalized, sig);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(normalize_signature(&[0u8; 10]).is_none());
        assert!(normalize_signature(&[]).is_none());
    }
}
