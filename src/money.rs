//! Fixed-point money type
//!
//! Amounts are integer minor units (cents) paired with a currency code. There
//! is no floating-point representation anywhere; decimal display strings are
//! converted only at the boundary via `rust_decimal`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

use crate::EscrowResult;
use crate::error::EscrowError;

/// Supported ISO currency codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    /// Number of minor-unit digits (all supported currencies use two)
    pub const MINOR_DIGITS: u32 = 2;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
            Self::Gbp => "GBP",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = EscrowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            "GBP" => Ok(Self::Gbp),
            other => Err(EscrowError::invalid_amount(format!(
                "unsupported currency code: {other}"
            ))),
        }
    }
}

/// A non-negative amount of money in integer minor units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    minor: i64,
    currency: Currency,
}

impl Money {
    /// Create an amount; negative values are rejected
    pub fn new(minor: i64, currency: Currency) -> EscrowResult<Self> {
        if minor < 0 {
            return Err(EscrowError::invalid_amount(format!(
                "amount must not be negative, got {minor}"
            )));
        }
        Ok(Self { minor, currency })
    }

    /// Zero in the given currency
    pub fn zero(currency: Currency) -> Self {
        Self { minor: 0, currency }
    }

    pub fn minor(&self) -> i64 {
        self.minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    pub fn is_positive(&self) -> bool {
        self.minor > 0
    }

    fn ensure_same_currency(&self, other: &Self) -> EscrowResult<()> {
        if self.currency != other.currency {
            return Err(EscrowError::CurrencyMismatch {
                left: self.currency,
                right: other.currency,
            });
        }
        Ok(())
    }

    /// Add two amounts of the same currency
    pub fn checked_add(self, other: Self) -> EscrowResult<Self> {
        self.ensure_same_currency(&other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or(EscrowError::AmountOverflow)?;
        Ok(Self { minor, ..self })
    }

    /// Subtract; fails if the result would go below zero
    pub fn checked_sub(self, other: Self) -> EscrowResult<Self> {
        self.ensure_same_currency(&other)?;
        if other.minor > self.minor {
            return Err(EscrowError::NegativeAmount {
                have: self.minor,
                take: other.minor,
            });
        }
        Ok(Self {
            minor: self.minor - other.minor,
            ..self
        })
    }

    /// Percentage in basis points, rounded half-up to the minor unit.
    ///
    /// 1250 minor units at 500 bps (5%) is 62.5, which rounds to 63.
    pub fn percentage(self, bps: u32) -> EscrowResult<Self> {
        let product = i128::from(self.minor) * i128::from(bps);
        let minor = (product + 5_000) / 10_000;
        let minor = i64::try_from(minor).map_err(|_| EscrowError::AmountOverflow)?;
        Ok(Self { minor, ..self })
    }

    /// Compare two amounts; fails across currencies
    pub fn compare(&self, other: &Self) -> EscrowResult<Ordering> {
        self.ensure_same_currency(other)?;
        Ok(self.minor.cmp(&other.minor))
    }

    /// Decimal view for display and API responses
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.minor, Currency::MINOR_DIGITS)
    }

    /// Parse a decimal display string (e.g. `"1250.00"`) into minor units
    pub fn parse_decimal(s: &str, currency: Currency) -> EscrowResult<Self> {
        let decimal = Decimal::from_str(s)
            .map_err(|err| EscrowError::invalid_amount(format!("unparseable amount {s:?}: {err}")))?;
        let scaled = decimal * Decimal::from(10_i64.pow(Currency::MINOR_DIGITS));
        if scaled.fract() != Decimal::ZERO {
            return Err(EscrowError::invalid_amount(format!(
                "amount {s} has sub-minor-unit precision"
            )));
        }
        let minor = scaled
            .to_i64()
            .ok_or(EscrowError::AmountOverflow)?;
        Self::new(minor, currency)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.currency, self.to_decimal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(minor: i64) -> Money {
        Money::new(minor, Currency::Usd).unwrap()
    }

    #[test]
    fn rejects_negative_amounts() {
        assert!(Money::new(-1, Currency::Usd).is_err());
    }

    #[test]
    fn add_and_subtract() {
        let a = usd(500);
        let b = usd(1250);
        assert_eq!(a.checked_add(b).unwrap(), usd(1750));
        assert_eq!(b.checked_sub(a).unwrap(), usd(750));
    }

    #[test]
    fn subtract_below_zero_fails() {
        let result = usd(100).checked_sub(usd(101));
        assert!(matches!(result, Err(EscrowError::NegativeAmount { .. })));
    }

    #[test]
    fn mixed_currencies_fail() {
        let a = usd(100);
        let b = Money::new(100, Currency::Eur).unwrap();
        assert!(matches!(
            a.checked_add(b),
            Err(EscrowError::CurrencyMismatch { .. })
        ));
        assert!(a.compare(&b).is_err());
    }

    #[test]
    fn percentage_rounds_half_up() {
        // 1250 * 5% = 62.5 -> 63
        assert_eq!(usd(1250).percentage(500).unwrap(), usd(63));
        // 1000 * 5% = 50, exact
        assert_eq!(usd(1000).percentage(500).unwrap(), usd(50));
        // 1249 * 5% = 62.45 -> 62
        assert_eq!(usd(1249).percentage(500).unwrap(), usd(62));
    }

    #[test]
    fn decimal_boundary_round_trip() {
        let amount = Money::parse_decimal("1250.00", Currency::Usd).unwrap();
        assert_eq!(amount, usd(125_000));
        assert_eq!(amount.to_decimal().to_string(), "1250.00");
    }

    #[test]
    fn rejects_sub_minor_precision() {
        assert!(Money::parse_decimal("10.001", Currency::Usd).is_err());
    }

    #[test]
    fn display_includes_currency() {
        assert_eq!(usd(1313).to_string(), "USD 13.13");
    }
}
