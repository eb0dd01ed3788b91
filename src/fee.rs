use core::fmt;
use core::str::FromStr;

use bitcoin::Amount;
use miniscript::bitcoin;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Satoshis in one coin.
const SAT_PER_COIN: i64 = 100_000_000;

/// Fee rate in satoshis per (virtual) byte.
///
/// Kept as a decimal so that chains quoting fractional rates lose no precision before the
/// final fee is rounded to whole satoshis.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FeeRate(Decimal);

impl FeeRate {
    /// Zero fee rate.
    pub const ZERO: Self = Self(Decimal::ZERO);

    /// From satoshis per vbyte.
    ///
    /// # Errors
    ///
    /// If `rate` is negative.
    pub fn from_sat_per_vb(rate: Decimal) -> Result<Self, FeeError> {
        if rate.is_sign_negative() && !rate.is_zero() {
            return Err(FeeError::NegativeRate(rate));
        }
        Ok(Self(rate))
    }

    /// From a whole number of satoshis per vbyte.
    pub fn from_sat_per_vb_u64(rate: u64) -> Self {
        Self(Decimal::from(rate))
    }

    /// From coins per 1000 bytes, the unit node fee APIs usually report.
    ///
    /// # Errors
    ///
    /// If `rate` is negative.
    pub fn from_coin_per_kvb(rate: Decimal) -> Result<Self, FeeError> {
        let sat_per_vb = rate
            .checked_mul(Decimal::from(SAT_PER_COIN))
            .and_then(|r| r.checked_div(Decimal::from(1_000)))
            .ok_or(FeeError::Overflow)?;
        Self::from_sat_per_vb(sat_per_vb)
    }

    /// Satoshis per vbyte.
    pub fn to_sat_per_vb(self) -> Decimal {
        self.0
    }

    /// Multiply by `factor`.
    pub fn scale(self, factor: Decimal) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    /// Round to `decimals` places, ties away from zero.
    pub fn round_dp(self, decimals: u32) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero),
        )
    }

    /// Fee for a transaction of `vbytes`, rounded to the nearest satoshi with ties away from
    /// zero.
    ///
    /// Returns `None` on overflow.
    pub fn fee_vb(self, vbytes: u64) -> Option<Amount> {
        self.0
            .checked_mul(Decimal::from(vbytes))?
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_u64()
            .map(Amount::from_sat)
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/vB", self.0)
    }
}

/// A value for each fee priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tiers<T> {
    /// Cheapest, slowest.
    pub minimal: T,
    /// Default.
    pub normal: T,
    /// Fastest.
    pub priority: T,
}

impl<T> Tiers<T> {
    /// Apply `f` to each tier.
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Tiers<U> {
        Tiers {
            minimal: f(self.minimal),
            normal: f(self.normal),
            priority: f(self.priority),
        }
    }

    /// Apply a fallible `f` to each tier.
    pub fn try_map<U, E>(self, mut f: impl FnMut(T) -> Result<U, E>) -> Result<Tiers<U>, E> {
        Ok(Tiers {
            minimal: f(self.minimal)?,
            normal: f(self.normal)?,
            priority: f(self.priority)?,
        })
    }
}

impl<T: PartialOrd> Tiers<T> {
    /// Whether `minimal <= normal <= priority`.
    pub fn is_monotonic(&self) -> bool {
        self.minimal <= self.normal && self.normal <= self.priority
    }
}

/// Fee rates for each priority.
pub type FeeRateTier = Tiers<FeeRate>;

/// Fee data as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFeeData {
    /// Several rates (sat/vB), in any order.
    Rates(Vec<Decimal>),
    /// A single base rate (sat/vB) to be scaled per chain convention.
    BaseRate(Decimal),
}

impl ProviderFeeData {
    /// Parse textual rates, skipping anything that is not a number.
    ///
    /// # Errors
    ///
    /// [`FeeError::Unavailable`] if nothing parses.
    pub fn parse_rates<I, S>(rates: I) -> Result<Self, FeeError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parsed = rates
            .into_iter()
            .filter_map(|s| Decimal::from_str(s.as_ref().trim()).ok())
            .collect::<Vec<_>>();
        if parsed.is_empty() {
            return Err(FeeError::Unavailable);
        }
        Ok(Self::Rates(parsed))
    }
}

/// How a single base rate is turned into three tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeScaling {
    /// `1.0x`, `1.2x`, `1.5x` of the base rate.
    #[default]
    Standard,
    /// `1.0x`, `1.0x`, `2.0x` of the base rate, for congestion-prone chains.
    Congested,
    /// Custom multipliers.
    Custom {
        /// Minimal multiplier.
        minimal: Decimal,
        /// Normal multiplier.
        normal: Decimal,
        /// Priority multiplier.
        priority: Decimal,
    },
}

impl FeeScaling {
    /// Multipliers for each tier.
    pub fn factors(&self) -> Tiers<Decimal> {
        match *self {
            FeeScaling::Standard => Tiers {
                minimal: Decimal::ONE,
                normal: Decimal::new(12, 1),
                priority: Decimal::new(15, 1),
            },
            FeeScaling::Congested => Tiers {
                minimal: Decimal::ONE,
                normal: Decimal::ONE,
                priority: Decimal::TWO,
            },
            FeeScaling::Custom {
                minimal,
                normal,
                priority,
            } => Tiers {
                minimal,
                normal,
                priority,
            },
        }
    }
}

/// Turns provider fee data into [`FeeRateTier`]s.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeEstimator {
    /// Scaling applied to a single base rate.
    pub scaling: FeeScaling,
    /// Decimal places the chain quotes rates with.
    pub decimals: u32,
}

impl FeeEstimator {
    /// New.
    pub fn new(scaling: FeeScaling, decimals: u32) -> Self {
        Self { scaling, decimals }
    }

    /// Estimate fee tiers from `data`.
    ///
    /// Several rates are sorted ascending and assigned positionally (lowest, middle,
    /// highest). A single rate is treated as a base rate. The result is always
    /// monotonically non-decreasing.
    ///
    /// # Errors
    ///
    /// - [`FeeError::Unavailable`] if there is no rate.
    /// - [`FeeError::NegativeRate`] if any rate is negative.
    pub fn estimate(&self, data: ProviderFeeData) -> Result<FeeRateTier, FeeError> {
        let tiers = match data {
            ProviderFeeData::Rates(mut rates) => {
                if rates.is_empty() {
                    return Err(FeeError::Unavailable);
                }
                if rates.len() == 1 {
                    return self.estimate(ProviderFeeData::BaseRate(rates[0]));
                }
                rates.sort();
                Tiers {
                    minimal: rates[0],
                    normal: rates[rates.len() / 2],
                    priority: rates[rates.len() - 1],
                }
                .try_map(FeeRate::from_sat_per_vb)?
            }
            ProviderFeeData::BaseRate(rate) => {
                let base = FeeRate::from_sat_per_vb(rate)?;
                let scaled = self
                    .scaling
                    .factors()
                    .try_map(|factor| base.scale(factor).ok_or(FeeError::Overflow))?;
                // custom multipliers may be out of order
                let mut sorted = [scaled.minimal, scaled.normal, scaled.priority];
                sorted.sort();
                Tiers {
                    minimal: sorted[0],
                    normal: sorted[1],
                    priority: sorted[2],
                }
            }
        };
        let tiers = tiers.map(|rate| rate.round_dp(self.decimals));
        debug_assert!(tiers.is_monotonic());
        Ok(tiers)
    }
}

/// Fee estimation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeeError {
    /// The provider returned no usable rate.
    #[error("fee rate unavailable")]
    Unavailable,
    /// A negative rate was reported.
    #[error("invalid negative fee rate: {0}")]
    NegativeRate(Decimal),
    /// Arithmetic overflow while scaling.
    #[error("fee rate overflow")]
    Overflow,
}

#[cfg(test)]
mod test {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fee_rounds_half_away_from_zero() {
        let rate = FeeRate::from_sat_per_vb(dec!(1.5)).unwrap();
        // 1.5 * 3 = 4.5 -> 5
        assert_eq!(rate.fee_vb(3), Some(Amount::from_sat(5)));
        // 1.5 * 5 = 7.5 -> 8
        assert_eq!(rate.fee_vb(5), Some(Amount::from_sat(8)));
        let rate = FeeRate::from_sat_per_vb(dec!(1.24)).unwrap();
        // 1.24 * 10 = 12.4 -> 12
        assert_eq!(rate.fee_vb(10), Some(Amount::from_sat(12)));
    }

    #[test]
    fn rates_are_sorted_and_assigned_positionally() {
        let est = FeeEstimator::default();
        let tiers = est
            .estimate(ProviderFeeData::Rates(vec![dec!(30), dec!(10), dec!(20)]))
            .unwrap();
        assert_eq!(tiers.minimal.to_sat_per_vb(), dec!(10));
        assert_eq!(tiers.normal.to_sat_per_vb(), dec!(20));
        assert_eq!(tiers.priority.to_sat_per_vb(), dec!(30));
    }

    #[test]
    fn base_rate_scaling() {
        let est = FeeEstimator::new(FeeScaling::Standard, 2);
        let tiers = est.estimate(ProviderFeeData::BaseRate(dec!(10))).unwrap();
        assert_eq!(tiers.minimal.to_sat_per_vb(), dec!(10));
        assert_eq!(tiers.normal.to_sat_per_vb(), dec!(12));
        assert_eq!(tiers.priority.to_sat_per_vb(), dec!(15));

        let est = FeeEstimator::new(FeeScaling::Congested, 0);
        let tiers = est.estimate(ProviderFeeData::BaseRate(dec!(7))).unwrap();
        assert_eq!(tiers.minimal, tiers.normal);
        assert_eq!(tiers.priority.to_sat_per_vb(), dec!(14));
    }

    #[test]
    fn tiers_are_monotonic() {
        let est = FeeEstimator::new(
            FeeScaling::Custom {
                minimal: dec!(2),
                normal: dec!(1),
                priority: dec!(0.5),
            },
            3,
        );
        for base in [dec!(0), dec!(0.001), dec!(1), dec!(13.37), dec!(250)] {
            let tiers = est.estimate(ProviderFeeData::BaseRate(base)).unwrap();
            assert!(tiers.is_monotonic(), "{tiers:?}");
        }
        for rates in [vec![dec!(5), dec!(1)], vec![dec!(9), dec!(3), dec!(3), dec!(1)]] {
            let tiers = est.estimate(ProviderFeeData::Rates(rates)).unwrap();
            assert!(tiers.is_monotonic(), "{tiers:?}");
        }
    }

    #[test]
    fn unparsable_rates_are_unavailable() {
        assert_eq!(
            ProviderFeeData::parse_rates(["", "n/a"]),
            Err(FeeError::Unavailable)
        );
        assert_eq!(
            ProviderFeeData::parse_rates(["n/a", "4.2"]),
            Ok(ProviderFeeData::Rates(vec![dec!(4.2)]))
        );
        assert_eq!(
            FeeEstimator::default().estimate(ProviderFeeData::Rates(vec![])),
            Err(FeeError::Unavailable)
        );
    }

    #[test]
    fn negative_rate_is_rejected() {
        assert!(matches!(
            FeeEstimator::default().estimate(ProviderFeeData::BaseRate(dec!(-1))),
            Err(FeeError::NegativeRate(_))
        ));
    }

    #[test]
    fn coin_per_kvb_conversion() {
        let rate = FeeRate::from_coin_per_kvb(dec!(0.0001)).unwrap();
        assert_eq!(rate.to_sat_per_vb(), dec!(10));
    }
}
