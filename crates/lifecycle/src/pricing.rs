//! Job pricing: base rate × duration × urgency multiplier.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use jobflow_core::{Currency, DomainError, DomainResult, Money};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Standard,
    Priority,
    Emergency,
}

impl Urgency {
    pub fn multiplier(&self) -> Decimal {
        match self {
            Urgency::Standard => Decimal::ONE,
            Urgency::Priority => Decimal::new(125, 2),
            Urgency::Emergency => Decimal::new(150, 2),
        }
    }
}

/// Inputs looked up for a job before pricing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricingInput {
    /// Hourly rate in major units of `currency`.
    pub base_rate: Decimal,
    pub duration_hours: Decimal,
    pub urgency: Urgency,
    pub currency: Currency,
}

impl PricingInput {
    /// Price rounded half-to-even to the currency minor unit.
    pub fn price(&self) -> DomainResult<Money> {
        if self.base_rate <= Decimal::ZERO {
            return Err(DomainError::validation("base rate must be positive"));
        }
        if self.duration_hours <= Decimal::ZERO {
            return Err(DomainError::validation("duration must be positive"));
        }

        let amount = self
            .base_rate
            .checked_mul(self.duration_hours)
            .and_then(|v| v.checked_mul(self.urgency.multiplier()))
            .ok_or_else(|| DomainError::invariant("price overflow"))?;

        Money::from_major(amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(base_rate: Decimal, duration_hours: Decimal, urgency: Urgency) -> PricingInput {
        PricingInput {
            base_rate,
            duration_hours,
            urgency,
            currency: Currency::Usd,
        }
    }

    #[test]
    fn standard_job_is_rate_times_duration() {
        let price = input(dec!(25), dec!(4), Urgency::Standard).price().unwrap();
        assert_eq!(price, Money::from_minor(10_000, Currency::Usd));
    }

    #[test]
    fn urgency_multiplier_applies_and_rounds_to_cents() {
        // 33.33 * 1.5 * 1.25 = 62.49375 -> 62.49
        let price = input(dec!(33.33), dec!(1.5), Urgency::Priority).price().unwrap();
        assert_eq!(price.minor_units(), 6_249);

        // 10.01 * 0.5 * 1.5 = 7.5075 -> 7.51
        let price = input(dec!(10.01), dec!(0.5), Urgency::Emergency).price().unwrap();
        assert_eq!(price.minor_units(), 751);

        // 0.05 * 0.5 = 0.025 -> 0.02, the midpoint goes to the even cent
        let price = input(dec!(0.05), dec!(0.5), Urgency::Standard).price().unwrap();
        assert_eq!(price.minor_units(), 2);
    }

    #[test]
    fn non_positive_inputs_are_rejected() {
        assert!(input(dec!(0), dec!(2), Urgency::Standard).price().is_err());
        assert!(input(dec!(20), dec!(-1), Urgency::Standard).price().is_err());
    }
}
