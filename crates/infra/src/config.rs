//! Orchestrator configuration.
//!
//! Built explicitly and handed to the orchestrator and escrow manager at construction.
//! `from_env` overlays `JOBFLOW_*` variables on the defaults.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobflow_core::Currency;

use crate::escrow::EscrowConfig;
use crate::matching::SelectionPolicy;
use crate::retry::RetryPolicy;

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// How long a consumer has to answer an offer. Silence counts as a rejection.
    pub offer_timeout: Duration,
    /// Review collection window, measured from the moment reviews are requested.
    pub review_window: Duration,
    /// Reviews that close the window early.
    pub review_target: u32,
    /// Matching attempts and the wait between empty attempts.
    pub matching: RetryPolicy,
    pub selection: SelectionPolicy,
    /// In-execution retries of transient activity failures (offer, scheduling).
    pub activity_retry: RetryPolicy,
    /// In-execution retries of transient gateway failures on authorize/capture/refund.
    pub payment_step_retry: RetryPolicy,
    /// Out-of-band retries once a job is in `payment_failed`.
    pub payment_retry: RetryPolicy,
    pub escrow: EscrowConfig,
    pub default_currency: Currency,
    pub database_url: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(DAY),
            review_window: Duration::from_secs(7 * DAY),
            review_target: 2,
            matching: RetryPolicy::linear(5, Duration::from_secs(5 * 60)),
            selection: SelectionPolicy::default(),
            activity_retry: RetryPolicy::exponential(
                5,
                Duration::from_secs(10),
                Duration::from_secs(10 * 60),
            ),
            payment_step_retry: RetryPolicy::exponential(
                3,
                Duration::from_secs(30),
                Duration::from_secs(5 * 60),
            ),
            payment_retry: RetryPolicy::exponential(
                5,
                Duration::from_secs(60),
                Duration::from_secs(6 * HOUR),
            ),
            escrow: EscrowConfig::default(),
            default_currency: Currency::Usd,
            database_url: None,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overlaid with `JOBFLOW_*` environment variables (and `DATABASE_URL`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(secs) = parse::<u64>(&lookup, "JOBFLOW_OFFER_TIMEOUT_SECS")? {
            config.offer_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBFLOW_REVIEW_WINDOW_SECS")? {
            config.review_window = Duration::from_secs(secs);
        }
        if let Some(target) = parse::<u32>(&lookup, "JOBFLOW_REVIEW_TARGET")? {
            config.review_target = target;
        }
        if let Some(attempts) = parse::<u32>(&lookup, "JOBFLOW_MATCH_ATTEMPTS")? {
            config.matching = RetryPolicy::linear(attempts, config.matching.base_delay);
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBFLOW_MATCH_BACKOFF_SECS")? {
            config.matching =
                RetryPolicy::linear(config.matching.max_attempts, Duration::from_secs(secs));
        }
        if let Some(limit) = parse::<usize>(&lookup, "JOBFLOW_SELECTION_OLDEST_LIMIT")? {
            config.selection = SelectionPolicy::HighestRatedAmongOldest { limit };
        }
        if let Some(attempts) = parse::<u32>(&lookup, "JOBFLOW_PAYMENT_STEP_ATTEMPTS")? {
            config.payment_step_retry.max_attempts = attempts;
        }
        if let Some(attempts) = parse::<u32>(&lookup, "JOBFLOW_PAYMENT_RETRY_ATTEMPTS")? {
            config.payment_retry.max_attempts = attempts;
        }
        if let Some(secs) = parse::<u64>(&lookup, "JOBFLOW_AUTHORIZATION_VALIDITY_SECS")? {
            config.escrow.authorization_validity = Duration::from_secs(secs);
        }
        if let Some(rate) = parse::<Decimal>(&lookup, "JOBFLOW_PLATFORM_FEE_RATE")? {
            config.escrow.fees.platform_rate = rate;
        }
        if let Some(rate) = parse::<Decimal>(&lookup, "JOBFLOW_PROCESSING_FEE_RATE")? {
            config.escrow.fees.processing_rate = rate;
        }
        if let Some(fixed) = parse::<u64>(&lookup, "JOBFLOW_PROCESSING_FEE_FIXED_MINOR")? {
            config.escrow.fees.processing_fixed_minor = fixed;
        }
        if let Some(currency) = parse::<Currency>(&lookup, "JOBFLOW_CURRENCY")? {
            config.default_currency = currency;
        }
        config.database_url = lookup("DATABASE_URL").or(config.database_url);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };
        if self.review_target == 0 {
            return Err(invalid("review_target", "must be at least 1"));
        }
        for (key, policy) in [
            ("matching", &self.matching),
            ("activity_retry", &self.activity_retry),
            ("payment_step_retry", &self.payment_step_retry),
            ("payment_retry", &self.payment_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(invalid(key, "max_attempts must be at least 1"));
            }
        }
        self.escrow
            .fees
            .validate()
            .map_err(|e| invalid("escrow.fees", &e.to_string()))
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}
