use std::collections::HashSet;

use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use miniscript::bitcoin;
use serde::{Deserialize, Serialize};

/// An unspent output reported by a chain-data provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UnspentOutput {
    /// Outpoint (transaction hash and output index).
    pub outpoint: OutPoint,
    /// Value locked in the output.
    pub amount: Amount,
    /// Script the output is locked with.
    pub script_pubkey: ScriptBuf,
    /// Number of confirmations, 0 when unconfirmed.
    pub confirmations: u32,
}

impl UnspentOutput {
    /// New confirmed output.
    pub fn new(txid: Txid, vout: u32, amount: Amount, script_pubkey: ScriptBuf) -> Self {
        Self {
            outpoint: OutPoint::new(txid, vout),
            amount,
            script_pubkey,
            confirmations: 1,
        }
    }

    /// Set the confirmation count.
    pub fn with_confirmations(mut self, confirmations: u32) -> Self {
        self.confirmations = confirmations;
        self
    }

    /// Transaction hash in its big-endian display form.
    pub fn transaction_hash(&self) -> String {
        self.outpoint.txid.to_string()
    }

    /// Output index.
    pub fn output_index(&self) -> u32 {
        self.outpoint.vout
    }

    /// Whether the output has at least one confirmation.
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

/// Which outputs may be spent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Only outputs with at least one confirmation.
    #[default]
    ConfirmedOnly,
    /// Unconfirmed outputs are spendable too (e.g. our own pending change).
    AllowUnconfirmed,
}

impl PendingPolicy {
    /// Whether `utxo` is selectable under this policy.
    pub fn allows(&self, utxo: &UnspentOutput) -> bool {
        match self {
            PendingPolicy::ConfirmedOnly => utxo.is_confirmed(),
            PendingPolicy::AllowUnconfirmed => true,
        }
    }
}

/// The spendable outputs of an address, as of the last successful refresh.
///
/// The set is only ever replaced as a whole. Outputs from an older refresh are never
/// merged into a newer one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UtxoSet {
    utxos: Vec<UnspentOutput>,
}

impl UtxoSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from provider data.
    ///
    /// Zero-value outputs are dropped and repeated outpoints are kept once (first wins),
    /// otherwise provider order is preserved.
    pub fn from_outputs(utxos: impl IntoIterator<Item = UnspentOutput>) -> Self {
        let mut seen = HashSet::new();
        let utxos = utxos
            .into_iter()
            .filter(|utxo| {
                if utxo.amount == Amount::ZERO {
                    log::warn!("ignoring zero-value output {}", utxo.outpoint);
                    return false;
                }
                seen.insert(utxo.outpoint)
            })
            .collect();
        Self { utxos }
    }

    /// Replace the whole set with the result of a refresh.
    pub fn replace(&mut self, utxos: impl IntoIterator<Item = UnspentOutput>) {
        *self = Self::from_outputs(utxos);
    }

    /// All outputs, in provider order.
    pub fn outputs(&self) -> &[UnspentOutput] {
        &self.utxos
    }

    /// Outputs selectable under `policy`, in provider order.
    pub fn spendable(&self, policy: PendingPolicy) -> Vec<UnspentOutput> {
        self.utxos
            .iter()
            .filter(|utxo| policy.allows(utxo))
            .cloned()
            .collect()
    }

    /// Total value of the outputs selectable under `policy`.
    pub fn balance(&self, policy: PendingPolicy) -> Amount {
        self.utxos
            .iter()
            .filter(|utxo| policy.allows(utxo))
            .map(|utxo| utxo.amount)
            .sum()
    }

    /// Number of outputs.
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bitcoin::hashes::Hash;

    fn utxo(tag: u8, vout: u32, sat: u64) -> UnspentOutput {
        UnspentOutput::new(
            Txid::from_byte_array([tag; 32]),
            vout,
            Amount::from_sat(sat),
            ScriptBuf::new(),
        )
    }

    #[test]
    fn replace_is_wholesale() {
        let mut set = UtxoSet::from_outputs([utxo(1, 0, 1_000), utxo(2, 0, 2_000)]);
        set.replace([utxo(3, 1, 500)]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.outputs()[0].outpoint.vout, 1);
        assert_eq!(set.balance(PendingPolicy::ConfirmedOnly), Amount::from_sat(500));
    }

    #[test]
    fn refresh_with_identical_data_is_idempotent() {
        let data = vec![utxo(1, 0, 1_000), utxo(1, 1, 2_000), utxo(1, 0, 1_000)];
        let mut set = UtxoSet::new();
        set.replace(data.clone());
        let first = set.clone();
        set.replace(data);
        assert_eq!(set, first);
        // same tx, distinct outputs are both kept
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn zero_value_outputs_are_dropped() {
        let set = UtxoSet::from_outputs([utxo(1, 0, 0), utxo(2, 0, 10)]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn pending_policy() {
        let set = UtxoSet::from_outputs([
            utxo(1, 0, 1_000),
            utxo(2, 0, 2_000).with_confirmations(0),
        ]);
        assert_eq!(set.spendable(PendingPolicy::ConfirmedOnly).len(), 1);
        assert_eq!(
            set.balance(PendingPolicy::AllowUnconfirmed),
            Amount::from_sat(3_000)
        );
    }
}
