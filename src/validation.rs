//! Pre-flight checks run before a transaction is built.
//!
//! A [`Validator`] always starts with [`AmountCheck`]; chains add further checks with
//! [`Validator::with`].

use core::fmt;

use bitcoin::Amount;
use miniscript::bitcoin;

/// Everything a check may look at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationContext {
    /// Value to send.
    pub amount: Amount,
    /// Fee of the send.
    pub fee: Amount,
    /// Spendable balance of the sender.
    pub balance: Amount,
    /// Balance of the resource the fee is paid in, when it is not the sent asset.
    pub fee_balance: Option<Amount>,
    /// Chain dust threshold.
    pub dust_threshold: Amount,
    /// Current balance of the receiver, `Some(ZERO)` for an account that does not exist yet
    /// and `None` when unknown.
    pub destination_balance: Option<Amount>,
}

impl ValidationContext {
    /// Sender balance left after the send, `None` if the send exceeds the balance.
    pub fn remaining(&self) -> Option<Amount> {
        let spent = match self.fee_balance {
            Some(_) => self.amount,
            None => self.amount.checked_add(self.fee)?,
        };
        self.balance.checked_sub(spent)
    }
}

/// A single pre-flight check.
pub trait Validation: fmt::Debug + Send + Sync {
    /// Check `ctx`, returning a warning the caller may override or an error that blocks the
    /// send.
    fn validate(&self, ctx: &ValidationContext)
        -> Result<Option<ValidationWarning>, ValidationError>;
}

/// Non-zero amount and enough balance for amount plus fee.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmountCheck;

impl Validation for AmountCheck {
    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<Option<ValidationWarning>, ValidationError> {
        if ctx.amount == Amount::ZERO {
            return Err(ValidationError::ZeroAmount);
        }
        match ctx.fee_balance {
            Some(fee_balance) => {
                if ctx.amount > ctx.balance {
                    return Err(ValidationError::InsufficientBalance {
                        required: ctx.amount,
                        available: ctx.balance,
                    });
                }
                if ctx.fee > fee_balance {
                    return Err(ValidationError::InsufficientFeeBalance {
                        required: ctx.fee,
                        available: fee_balance,
                    });
                }
            }
            None => {
                let required = ctx.amount.checked_add(ctx.fee).unwrap_or(Amount::MAX);
                if required > ctx.balance {
                    return Err(ValidationError::InsufficientBalance {
                        required,
                        available: ctx.balance,
                    });
                }
            }
        }
        Ok(None)
    }
}

/// Amount and leftover balance must not be dust.
#[derive(Debug, Clone, Copy, Default)]
pub struct DustCheck;

impl Validation for DustCheck {
    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<Option<ValidationWarning>, ValidationError> {
        if ctx.amount < ctx.dust_threshold {
            return Err(ValidationError::AmountBelowDust {
                threshold: ctx.dust_threshold,
            });
        }
        if let Some(change) = ctx.remaining() {
            if change > Amount::ZERO && change < ctx.dust_threshold {
                return Err(ValidationError::ChangeBelowDust {
                    change,
                    threshold: ctx.dust_threshold,
                });
            }
        }
        Ok(None)
    }
}

/// What to do when a send would break the reserve of the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReservePolicy {
    /// Fail validation.
    #[default]
    Reject,
    /// Warn and suggest a reduced amount.
    Warn,
}

/// Minimum balance an account must hold to stay open.
#[derive(Debug, Clone, Copy)]
pub struct ReserveCheck {
    /// Reserve.
    pub reserve: Amount,
    /// Handling of sender-side violations. Receiver-side violations are always errors.
    pub policy: ReservePolicy,
}

impl ReserveCheck {
    /// New check for `reserve`.
    pub fn new(reserve: Amount, policy: ReservePolicy) -> Self {
        Self { reserve, policy }
    }
}

impl Validation for ReserveCheck {
    fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<Option<ValidationWarning>, ValidationError> {
        if ctx.destination_balance == Some(Amount::ZERO) && ctx.amount < self.reserve {
            return Err(ValidationError::ReceiverBelowReserve {
                reserve: self.reserve,
            });
        }
        let remaining = ctx.remaining().unwrap_or(Amount::ZERO);
        if remaining >= self.reserve {
            return Ok(None);
        }
        let shortfall = self.reserve - remaining;
        let suggested = ctx.amount.checked_sub(shortfall).unwrap_or(Amount::ZERO);
        match self.policy {
            ReservePolicy::Reject => Err(ValidationError::SenderBelowReserve {
                reserve: self.reserve,
                suggested,
            }),
            ReservePolicy::Warn => Ok(Some(ValidationWarning::ReserveWithdrawal {
                reserve: self.reserve,
                suggested,
            })),
        }
    }
}

/// Ordered set of checks.
#[derive(Debug)]
pub struct Validator {
    checks: Vec<Box<dyn Validation>>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            checks: vec![Box::new(AmountCheck)],
        }
    }
}

impl Validator {
    /// Validator with only the amount check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Amount and dust checks.
    pub fn with_dust() -> Self {
        Self::new().with(DustCheck)
    }

    /// Append a check.
    pub fn with(mut self, check: impl Validation + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }

    /// Number of checks.
    pub fn len(&self) -> usize {
        self.checks.len()
    }

    /// Never true, the amount check is always present.
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Run every check in order, stopping at the first error.
    pub fn validate(
        &self,
        ctx: &ValidationContext,
    ) -> Result<Vec<ValidationWarning>, ValidationError> {
        let mut warnings = vec![];
        for check in &self.checks {
            if let Some(warning) = check.validate(ctx)? {
                log::debug!("validation warning: {warning}");
                warnings.push(warning);
            }
        }
        Ok(warnings)
    }
}

/// A violation that blocks the send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Zero amount.
    #[error("amount must be greater than zero")]
    ZeroAmount,
    /// Amount plus fee exceeds the balance.
    #[error("insufficient balance: {required} required, {available} available")]
    InsufficientBalance {
        /// amount plus fee (or amount alone if the fee is paid separately)
        required: Amount,
        /// spendable balance
        available: Amount,
    },
    /// Fee exceeds the fee resource balance.
    #[error("insufficient balance to pay the fee: {required} required, {available} available")]
    InsufficientFeeBalance {
        /// fee
        required: Amount,
        /// fee resource balance
        available: Amount,
    },
    /// Amount below the dust threshold.
    #[error("amount below dust threshold of {threshold}")]
    AmountBelowDust {
        /// threshold
        threshold: Amount,
    },
    /// The sender would keep a balance below the dust threshold.
    #[error("remaining balance of {change} is below dust threshold of {threshold}")]
    ChangeBelowDust {
        /// leftover balance
        change: Amount,
        /// threshold
        threshold: Amount,
    },
    /// The sender would drop below the reserve.
    #[error("balance must stay above the reserve of {reserve}; at most {suggested} can be sent")]
    SenderBelowReserve {
        /// reserve
        reserve: Amount,
        /// largest amount that keeps the reserve
        suggested: Amount,
    },
    /// A new receiving account would not be funded up to the reserve.
    #[error("a new account must receive at least {reserve}")]
    ReceiverBelowReserve {
        /// reserve
        reserve: Amount,
    },
}

/// A condition the caller should confirm before sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// Sending the amount would break the reserve.
    ReserveWithdrawal {
        /// reserve
        reserve: Amount,
        /// largest amount that keeps the reserve
        suggested: Amount,
    },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReserveWithdrawal { reserve, suggested } => write!(
                f,
                "sending this amount breaks the reserve of {reserve}, consider sending {suggested}"
            ),
        }
    }
}
