//! Fixed-point USDC amounts.
//!
//! # Invariants
//! - Amounts are never negative.
//! - Amounts carry at most [`USDC_DECIMALS`] fractional digits. Values with
//!   more precision are rejected rather than rounded, so repeated arithmetic
//!   never drifts.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USDC minor-unit precision (1 USDC = 10^6 micro-USDC).
pub const USDC_DECIMALS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("Amount cannot be negative: {0}")]
    Negative(Decimal),

    #[error("Amount {value} has {scale} decimal places; USDC supports at most 6")]
    TooPrecise { value: Decimal, scale: u32 },

    #[error("Invalid amount: {0}")]
    Invalid(String),
}

/// A non-negative USDC amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Usdc(Decimal);

impl Usdc {
    pub const ZERO: Usdc = Usdc(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(AmountError::Negative(value));
        }
        let scale = value.normalize().scale();
        if scale > USDC_DECIMALS {
            return Err(AmountError::TooPrecise { value, scale });
        }
        Ok(Self(value))
    }

    /// Whole USDC, mainly for configuration defaults and tests.
    pub fn from_whole(units: u64) -> Self {
        Self(Decimal::from(units))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_positive()
    }

    /// Amount expressed in micro-USDC.
    pub fn minor_units(&self) -> Option<u64> {
        (self.0 * Decimal::from(10u64.pow(USDC_DECIMALS))).to_u64()
    }

    /// `self * rate`, rounded half-to-even to USDC precision.
    pub fn fee(&self, rate: Decimal) -> Usdc {
        Usdc(
            (self.0 * rate)
                .round_dp_with_strategy(USDC_DECIMALS, RoundingStrategy::MidpointNearestEven)
                .max(Decimal::ZERO),
        )
    }

    /// Split evenly across `parts`, rounding down so the shares never exceed
    /// the total.
    pub fn split(&self, parts: u64) -> Usdc {
        if parts == 0 {
            return Usdc::ZERO;
        }
        Usdc((self.0 / Decimal::from(parts)).round_dp_with_strategy(USDC_DECIMALS, RoundingStrategy::ToZero))
    }
}

impl TryFrom<Decimal> for Usdc {
    type Error = AmountError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Usdc::new(value)
    }
}

impl From<Usdc> for Decimal {
    fn from(value: Usdc) -> Self {
        value.0
    }
}

impl FromStr for Usdc {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = Decimal::from_str(s.trim()).map_err(|e| AmountError::Invalid(format!("{}: {}", s, e)))?;
        Usdc::new(value)
    }
}

impl fmt::Display for Usdc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_sub_micro_precision() {
        assert!("5.000001".parse::<Usdc>().is_ok());
        assert!(matches!(
            "5.0000001".parse::<Usdc>(),
            Err(AmountError::TooPrecise { scale: 7, .. })
        ));
        // Trailing zeros do not count as precision
        assert!("5.000000000".parse::<Usdc>().is_ok());
    }

    #[test]
    fn test_rejects_negative_and_garbage() {
        assert!(matches!("-1".parse::<Usdc>(), Err(AmountError::Negative(_))));
        assert!(matches!("five".parse::<Usdc>(), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn test_platform_fee_is_exact() {
        let amount: Usdc = "5.00".parse().unwrap();
        let fee = amount.fee(Decimal::new(10, 2));
        assert_eq!(fee, "0.5".parse().unwrap());

        let odd: Usdc = "0.000015".parse().unwrap();
        // 0.0000015 rounds half-to-even to 0.000002
        assert_eq!(odd.fee(Decimal::new(10, 2)), "0.000002".parse().unwrap());
    }

    #[test]
    fn test_split_never_exceeds_total() {
        let budget: Usdc = "100".parse().unwrap();
        let share = budget.split(3);
        assert_eq!(share, "33.333333".parse().unwrap());
        assert!(share.as_decimal() * Decimal::from(3) <= budget.as_decimal());
        assert_eq!(budget.split(0), Usdc::ZERO);
    }

    #[test]
    fn test_repeated_addition_does_not_drift() {
        let cent: Usdc = "0.01".parse().unwrap();
        let mut total = Decimal::ZERO;
        for _ in 0..1000 {
            total += cent.as_decimal();
        }
        assert_eq!(total, Decimal::from(10));
    }

    #[test]
    fn test_minor_units_and_serde() {
        let amount: Usdc = "5.25".parse().unwrap();
        assert_eq!(amount.minor_units(), Some(5_250_000));

        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"5.25\"");
        let back: Usdc = serde_json::from_str("\"5.25\"").unwrap();
        assert_eq!(back, amount);
        assert!(serde_json::from_str::<Usdc>("\"-3\"").is_err());
    }
}
