//! Monetary amounts in integer minor units.
//!
//! Amounts are stored and transmitted as minor units (cents). Conversions from decimal
//! major units round with banker's rounding (`MidpointNearestEven`) to the currency's
//! minor unit, and the reverse conversion is exact, so a round trip never drifts.

use core::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// ISO-4217 currencies the platform settles in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Usd,
    Eur,
    Gbp,
    Jpy,
}

impl Currency {
    /// Number of decimal places in one major unit.
    pub fn minor_unit_exponent(self) -> u32 {
        match self {
            Currency::Jpy => 0,
            Currency::Usd | Currency::Eur | Currency::Gbp => 2,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
            Currency::Jpy => "JPY",
        }
    }
}

impl core::fmt::Display for Currency {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            "JPY" => Ok(Currency::Jpy),
            other => Err(DomainError::validation(format!("unsupported currency: {other}"))),
        }
    }
}

/// A non-negative amount of money.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    minor: u64,
    currency: Currency,
}


impl Money {
    pub fn from_minor(minor: u64, currency: Currency) -> Self {
        Self { minor, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self::from_minor(0, currency)
    }

    /// Convert a decimal amount in major units, rounding half-to-even at the minor unit.
    pub fn from_major(amount: Decimal, currency: Currency) -> DomainResult<Self> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(DomainError::validation("money amount must not be negative"));
        }
        let exponent = currency.minor_unit_exponent();
        let rounded = amount.round_dp_with_strategy(exponent, RoundingStrategy::MidpointNearestEven);
        let minor = (rounded * Decimal::from(10u64.pow(exponent)))
            .trunc()
            .to_u64()
            .ok_or_else(|| DomainError::invariant("money amount overflow"))?;
        Ok(Self::from_minor(minor, currency))
    }

    pub fn minor_units(&self) -> u64 {
        self.minor
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.minor == 0
    }

    /// Exact conversion back to major units.
    pub fn to_major(&self) -> Decimal {
        Decimal::from_i128_with_scale(i128::from(self.minor), self.currency.minor_unit_exponent())
    }

    pub fn checked_add(&self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let minor = self
            .minor
            .checked_add(other.minor)
            .ok_or_else(|| DomainError::invariant("money amount overflow"))?;
        Ok(Self::from_minor(minor, self.currency))
    }

    pub fn checked_sub(&self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let minor = self
            .minor
            .checked_sub(other.minor)
            .ok_or_else(|| DomainError::invariant("money amount would become negative"))?;
        Ok(Self::from_minor(minor, self.currency))
    }

    /// Multiply by a non-negative rate, rounding half-to-even at the minor unit.
    pub fn scale(&self, rate: Decimal) -> DomainResult<Money> {
        Self::from_major(self.to_major() * rate, self.currency)
    }

    fn ensure_same_currency(&self, other: Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::validation(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }
}

impl PartialOrd for Money {
    /// Amounts in different currencies are not comparable.
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        if self.currency != other.currency {
            return None;
        }
        Some(self.minor.cmp(&other.minor))
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} {}", self.to_major(), self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn from_major_rounds_half_to_even() {
        assert_eq!(Money::from_major(dec!(10.125), Currency::Usd).unwrap().minor_units(), 1012);
        assert_eq!(Money::from_major(dec!(10.135), Currency::Usd).unwrap().minor_units(), 1014);
        assert_eq!(Money::from_major(dec!(100), Currency::Usd).unwrap().minor_units(), 10_000);
        assert_eq!(Money::from_major(dec!(1500.5), Currency::Jpy).unwrap().minor_units(), 1500);
    }

    #[test]
    fn negative_amounts_are_rejected() {
        assert!(matches!(
            Money::from_major(dec!(-1), Currency::Usd),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn arithmetic_requires_matching_currency() {
        let usd = Money::from_minor(100, Currency::Usd);
        let eur = Money::from_minor(100, Currency::Eur);
        assert!(usd.checked_add(eur).is_err());
        assert_eq!(usd.partial_cmp(&eur), None);
        assert!(usd.checked_sub(Money::from_minor(101, Currency::Usd)).is_err());
    }

    #[test]
    fn display_uses_major_units() {
        assert_eq!(Money::from_minor(10_050, Currency::Usd).to_string(), "100.50 USD");
    }

    proptest! {
        /// Minor units survive a trip through major units unchanged.
        #[test]
        fn minor_to_major_is_exact(minor in 0u64..10_000_000_000u64) {
            let money = Money::from_minor(minor, Currency::Usd);
            let back = Money::from_major(money.to_major(), Currency::Usd).unwrap();
            prop_assert_eq!(back, money);
        }
    }
}
