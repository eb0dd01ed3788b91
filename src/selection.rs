use bdk_coin_select::{Candidate, CoinSelector};
use bitcoin::Amount;
use core::cmp::Reverse;
use miniscript::bitcoin;
use rand::rngs::StdRng;
use rand_core::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{FeeRate, UnspentOutput};

/// Order in which unspent outputs are considered during selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputOrdering {
    /// Provider order, no reordering.
    #[default]
    ListOrder,
    /// Largest value first.
    LargestFirst,
    /// Smallest value first.
    SmallestFirst,
    /// Pseudo-random permutation derived from `seed`.
    Shuffled {
        /// RNG seed
        seed: u64,
    },
}

impl InputOrdering {
    fn apply(&self, selector: &mut CoinSelector<'_>, len: usize) {
        match *self {
            InputOrdering::ListOrder => {}
            InputOrdering::LargestFirst => {
                selector.sort_candidates_by_key(|(_, c)| Reverse(c.value))
            }
            InputOrdering::SmallestFirst => selector.sort_candidates_by_key(|(_, c)| c.value),
            InputOrdering::Shuffled { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                let keys = (0..len)
                    .map(|_| rng.next_u64())
                    .collect::<Vec<_>>();
                selector.sort_candidates_by_key(|(i, _)| keys[i]);
            }
        }
    }
}

/// Linear transaction size model, in virtual bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeModel {
    /// Version, lock time and the input and output counts.
    pub overhead: u64,
    /// Size of one input.
    pub input: u64,
    /// Size of the recipient output.
    pub recipient_output: u64,
    /// Size of the change output.
    pub change_output: u64,
}

impl SizeModel {
    /// Fixed overhead of a transaction with fewer than 253 inputs and outputs.
    pub const OVERHEAD: u64 = 10;

    /// Estimated size with `inputs` inputs, with or without a change output.
    pub fn vbytes(&self, inputs: usize, with_change: bool) -> u64 {
        let change = if with_change { self.change_output } else { 0 };
        self.overhead + self.input * inputs as u64 + self.recipient_output + change
    }
}

/// Parameters of [`select_inputs`].
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
    /// Value sent to the recipient.
    pub amount: Amount,
    /// Fee rate.
    pub fee_rate: FeeRate,
    /// Change below this value is folded into the fee.
    pub dust_threshold: Amount,
    /// Candidate order.
    pub ordering: InputOrdering,
    /// Size model.
    pub size: SizeModel,
}

/// Outcome of input selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSelection {
    /// Selected outputs, in candidate list order.
    pub inputs: Vec<UnspentOutput>,
    /// Sum of the selected values.
    pub total: Amount,
    /// Absolute fee, including any change folded into it.
    pub fee: Amount,
    /// Change value, if a change output is created.
    pub change: Option<Amount>,
    /// Estimated size the fee was computed for.
    pub vbytes: u64,
}

/// Greedily select inputs until the running total covers `amount` plus the fee of a
/// transaction with the inputs selected so far, a recipient output and a change output.
///
/// The fee is re-estimated after every added input. If every candidate is selected and the
/// total still falls short, the shape without a change output is tried before giving up.
/// Leftover value below the dust threshold never becomes an output and is added to the fee.
pub fn select_inputs(
    utxos: &[UnspentOutput],
    params: &SelectionParams,
) -> Result<InputSelection, SelectionError> {
    let SelectionParams {
        amount,
        fee_rate,
        dust_threshold,
        ordering,
        size,
    } = *params;
    let fee_for = |inputs: usize, with_change: bool| {
        fee_rate
            .fee_vb(size.vbytes(inputs, with_change))
            .ok_or(SelectionError::FeeOverflow)
    };
    let required = |fee: Amount| {
        amount
            .checked_add(fee)
            .ok_or(SelectionError::FeeOverflow)
    };

    let candidates = utxos
        .iter()
        .map(|utxo| Candidate {
            value: utxo.amount.to_sat(),
            weight: size.input * 4,
            input_count: 1,
            is_segwit: false,
        })
        .collect::<Vec<_>>();
    let mut selector = CoinSelector::new(&candidates);
    ordering.apply(&mut selector, utxos.len());

    let mut count = 0;
    let mut met = false;
    while selector.select_next() {
        count += 1;
        let fee = fee_for(count, true)?;
        if selector.selected_value() >= required(fee)?.to_sat() {
            met = true;
            break;
        }
    }

    let total = Amount::from_sat(selector.selected_value());
    let fee = if met {
        fee_for(count, true)?
    } else {
        let fee = fee_for(count.max(1), false)?;
        let required = required(fee)?;
        if count == 0 || total < required {
            return Err(SelectionError::InsufficientFunds {
                available: total,
                required,
            });
        }
        fee
    };

    let leftover = total - amount - fee;
    let (fee, change) = if met && leftover >= dust_threshold && leftover > Amount::ZERO {
        (fee, Some(leftover))
    } else {
        (total - amount, None)
    };
    let vbytes = size.vbytes(count, change.is_some());

    let inputs = selector
        .apply_selection(utxos)
        .cloned()
        .collect::<Vec<_>>();
    log::debug!(
        "selected {} of {} inputs: total {}, fee {}, change {:?}",
        inputs.len(),
        utxos.len(),
        total,
        fee,
        change
    );

    Ok(InputSelection {
        inputs,
        total,
        fee,
        change,
        vbytes,
    })
}

/// Input selection error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    /// The spendable outputs cannot cover the amount plus the minimal fee.
    #[error("insufficient funds: {available} available, {required} required")]
    InsufficientFunds {
        /// Total value of every candidate.
        available: Amount,
        /// Amount plus the fee of a transaction spending every candidate.
        required: Amount,
    },
    /// Fee arithmetic overflowed.
    #[error("fee computation overflowed")]
    FeeOverflow,
}
