//! Tracing subscriber initialization.
//!
//! The filter comes from `RUST_LOG` (default `info`). Orchestrator events carry
//! `job_id`, `transaction_id`, `state` and `attempt` fields, which the JSON format keeps
//! as separate keys.

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Json,
    /// Human-readable single-line output for local runs.
    Compact,
}

impl LogFormat {
    /// `JOBFLOW_LOG_FORMAT=compact` selects compact output; anything else is JSON.
    pub fn from_env() -> Self {
        match std::env::var("JOBFLOW_LOG_FORMAT").as_deref() {
            Ok("compact") => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Initialize the global subscriber. Returns `false` if one was already installed.
pub fn init(format: LogFormat) -> bool {
    let format = match std::env::var("JOBFLOW_LOG_FORMAT") {
        Ok(_) => LogFormat::from_env(),
        Err(_) => format,
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().try_init().is_ok(),
        LogFormat::Compact => builder.compact().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        let _ = init(LogFormat::Compact);
        assert!(!init(LogFormat::Json));
    }
}
