use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use jobflow_core::{DomainError, DomainResult, Money};

/// Platform and card-processing fees charged on a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Fraction of the captured amount retained by the platform.
    pub platform_rate: Decimal,
    /// Fraction of the captured amount charged by the card processor.
    pub processing_rate: Decimal,
    /// Flat processor fee per capture, in minor units.
    pub processing_fixed_minor: u64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_rate: Decimal::new(10, 2),
            processing_rate: Decimal::new(29, 3),
            processing_fixed_minor: 30,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub platform_fee: Money,
    pub processing_fee: Money,
    /// Amount released to the worker.
    pub net: Money,
}

impl FeeSchedule {
    pub fn validate(&self) -> DomainResult<()> {
        let zero = Decimal::ZERO;
        if self.platform_rate < zero || self.processing_rate < zero {
            return Err(DomainError::validation("fee rates must not be negative"));
        }
        if self.platform_rate + self.processing_rate > Decimal::ONE {
            return Err(DomainError::validation("fee rates must not exceed 100%"));
        }
        Ok(())
    }

    /// Split `amount` into fees and net.
    ///
    /// Each fee rounds half-to-even at the minor unit. The processing fee is capped so
    /// the three parts always sum to `amount`.
    pub fn compute(&self, amount: Money) -> DomainResult<FeeBreakdown> {
        self.validate()?;
        let currency = amount.currency();

        let platform_fee = amount.scale(self.platform_rate)?;
        let variable = amount.scale(self.processing_rate)?;
        let uncapped = variable
            .minor_units()
            .checked_add(self.processing_fixed_minor)
            .ok_or_else(|| DomainError::invariant("fee overflow"))?;

        let after_platform = amount.checked_sub(platform_fee)?;
        let processing_fee =
            Money::from_minor(uncapped.min(after_platform.minor_units()), currency);
        let net = after_platform.checked_sub(processing_fee)?;

        Ok(FeeBreakdown {
            platform_fee,
            processing_fee,
            net,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::Currency;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn hundred_dollar_capture() {
        let fees = FeeSchedule::default()
            .compute(Money::from_minor(10_000, Currency::Usd))
            .unwrap();
        assert_eq!(fees.platform_fee.minor_units(), 1_000);
        // 2.9% of 100.00 = 2.90, plus 0.30
        assert_eq!(fees.processing_fee.minor_units(), 320);
        assert_eq!(fees.net.minor_units(), 8_680);
    }

    #[test]
    fn processing_fee_is_capped_for_tiny_amounts() {
        let fees = FeeSchedule::default()
            .compute(Money::from_minor(20, Currency::Usd))
            .unwrap();
        assert_eq!(fees.platform_fee.minor_units(), 2);
        assert_eq!(fees.processing_fee.minor_units(), 18);
        assert!(fees.net.is_zero());
    }

    #[test]
    fn rates_above_one_are_rejected() {
        let schedule = FeeSchedule {
            platform_rate: dec!(0.8),
            processing_rate: dec!(0.3),
            processing_fixed_minor: 0,
        };
        assert!(schedule.compute(Money::from_minor(100, Currency::Usd)).is_err());
    }

    proptest! {
        #[test]
        fn parts_sum_to_the_captured_amount(minor in 0u64..1_000_000_000u64) {
            let amount = Money::from_minor(minor, Currency::Usd);
            let fees = FeeSchedule::default().compute(amount).unwrap();
            let total = fees.platform_fee.minor_units()
                + fees.processing_fee.minor_units()
                + fees.net.minor_units();
            prop_assert_eq!(total, minor);
        }
    }
}
