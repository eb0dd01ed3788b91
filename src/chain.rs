use bitcoin::{transaction, Amount, Sequence};
use miniscript::bitcoin;
use serde::{Deserialize, Serialize};

use crate::{FeeEstimator, FeeScaling, InputOrdering, PendingPolicy, SighashAlgorithm};

/// Supported Bitcoin-family chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    /// Bitcoin.
    #[default]
    Bitcoin,
    /// Litecoin.
    Litecoin,
    /// Dogecoin.
    Dogecoin,
    /// Dash.
    Dash,
    /// Bitcoin Cash.
    BitcoinCash,
    /// Ravencoin.
    Ravencoin,
}

impl ChainKind {
    /// Whether the chain has segregated witness.
    pub fn supports_segwit(&self) -> bool {
        matches!(self, ChainKind::Bitcoin | ChainKind::Litecoin)
    }

    /// Signature-hash algorithm for non-witness inputs.
    pub fn legacy_sighash(&self) -> SighashAlgorithm {
        match self {
            ChainKind::BitcoinCash => SighashAlgorithm::ForkId,
            _ => SighashAlgorithm::Legacy,
        }
    }
}

/// Per-chain parameters.
///
/// Deserializable so that wallets can ship chain settings as configuration; any missing field
/// falls back to the Bitcoin defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Chain.
    pub kind: ChainKind,
    /// Outputs below this value are not created.
    #[serde(with = "sat")]
    pub dust_threshold: Amount,
    /// Scaling of a single provider base rate into tiers.
    pub fee_scaling: FeeScaling,
    /// Decimal places of fee rates.
    pub fee_decimals: u32,
    /// Transaction version.
    pub tx_version: i32,
    /// Sequence number of every input.
    pub sequence: u32,
    /// Which outputs are spendable.
    pub pending_policy: PendingPolicy,
    /// Input ordering used during selection.
    pub ordering: InputOrdering,
    /// Minimum balance the account must keep, if any.
    #[serde(with = "opt_sat")]
    pub reserve: Option<Amount>,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::bitcoin()
    }
}

impl ChainParams {
    /// Bitcoin.
    pub fn bitcoin() -> Self {
        Self {
            kind: ChainKind::Bitcoin,
            dust_threshold: Amount::from_sat(546),
            fee_scaling: FeeScaling::Standard,
            fee_decimals: 0,
            tx_version: 2,
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME.to_consensus_u32(),
            pending_policy: PendingPolicy::ConfirmedOnly,
            ordering: InputOrdering::ListOrder,
            reserve: None,
        }
    }

    /// Litecoin.
    pub fn litecoin() -> Self {
        Self {
            kind: ChainKind::Litecoin,
            dust_threshold: Amount::from_sat(5_460),
            fee_decimals: 2,
            ..Self::bitcoin()
        }
    }

    /// Dogecoin.
    pub fn dogecoin() -> Self {
        Self {
            kind: ChainKind::Dogecoin,
            dust_threshold: Amount::from_sat(1_000_000),
            fee_scaling: FeeScaling::Congested,
            fee_decimals: 2,
            tx_version: 1,
            sequence: Sequence::MAX.to_consensus_u32(),
            ..Self::bitcoin()
        }
    }

    /// Dash.
    pub fn dash() -> Self {
        Self {
            kind: ChainKind::Dash,
            dust_threshold: Amount::from_sat(5_460),
            tx_version: 1,
            sequence: Sequence::MAX.to_consensus_u32(),
            fee_decimals: 2,
            ..Self::bitcoin()
        }
    }

    /// Bitcoin Cash.
    pub fn bitcoin_cash() -> Self {
        Self {
            kind: ChainKind::BitcoinCash,
            dust_threshold: Amount::from_sat(546),
            fee_decimals: 2,
            sequence: Sequence::MAX.to_consensus_u32(),
            ..Self::bitcoin()
        }
    }

    /// Ravencoin.
    pub fn ravencoin() -> Self {
        Self {
            kind: ChainKind::Ravencoin,
            dust_threshold: Amount::from_sat(546),
            fee_scaling: FeeScaling::Congested,
            fee_decimals: 2,
            tx_version: 1,
            sequence: Sequence::MAX.to_consensus_u32(),
            ..Self::bitcoin()
        }
    }

    /// Preset for `kind`.
    pub fn for_chain(kind: ChainKind) -> Self {
        match kind {
            ChainKind::Bitcoin => Self::bitcoin(),
            ChainKind::Litecoin => Self::litecoin(),
            ChainKind::Dogecoin => Self::dogecoin(),
            ChainKind::Dash => Self::dash(),
            ChainKind::BitcoinCash => Self::bitcoin_cash(),
            ChainKind::Ravencoin => Self::ravencoin(),
        }
    }

    /// Fee estimator configured for this chain.
    pub fn fee_estimator(&self) -> FeeEstimator {
        FeeEstimator::new(self.fee_scaling, self.fee_decimals)
    }

    /// Transaction version.
    pub fn version(&self) -> transaction::Version {
        transaction::Version(self.tx_version)
    }

    /// Input sequence.
    pub fn input_sequence(&self) -> Sequence {
        Sequence(self.sequence)
    }
}

mod sat {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &Amount, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(amount.to_sat())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Amount, D::Error> {
        u64::deserialize(d).map(Amount::from_sat)
    }
}

mod opt_sat {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &Option<Amount>, s: S) -> Result<S::Ok, S::Error> {
        amount.map(|a| a.to_sat()).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Amount>, D::Error> {
        Option::<u64>::deserialize(d).map(|sat| sat.map(Amount::from_sat))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn presets_round_trip_by_kind() {
        for kind in [
            ChainKind::Bitcoin,
            ChainKind::Litecoin,
            ChainKind::Dogecoin,
            ChainKind::Dash,
            ChainKind::BitcoinCash,
            ChainKind::Ravencoin,
        ] {
            assert_eq!(ChainParams::for_chain(kind).kind, kind);
        }
    }

    #[test]
    fn partial_config_falls_back_to_defaults() -> anyhow::Result<()> {
        let params: ChainParams = serde_json::from_str(
            r#"{ "kind": "dogecoin", "dust_threshold": 100000000, "ordering": "largest_first" }"#,
        )?;
        assert_eq!(params.kind, ChainKind::Dogecoin);
        assert_eq!(params.dust_threshold, Amount::from_sat(100_000_000));
        assert_eq!(params.ordering, InputOrdering::LargestFirst);
        assert_eq!(params.tx_version, 2);
        assert_eq!(params.reserve, None);
        Ok(())
    }

    #[test]
    fn only_bitcoin_cash_uses_forkid() {
        assert_eq!(
            ChainKind::BitcoinCash.legacy_sighash(),
            SighashAlgorithm::ForkId
        );
        assert_eq!(ChainKind::Dogecoin.legacy_sighash(), SighashAlgorithm::Legacy);
    }
}
