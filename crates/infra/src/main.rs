//! Orchestrator worker process.
//!
//! Recovers in-flight executions on start, then periodically fires due timers and runs
//! due payment retries. Uses Postgres when `DATABASE_URL` is set, memory otherwise.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobflow_infra::activities::{InMemoryJobCatalog, StandardActivities, TracingNotifier};
use jobflow_infra::config::OrchestratorConfig;
use jobflow_infra::coordinator::SystemClock;
use jobflow_infra::escrow::{PaymentGateway, SimulatedGateway};
use jobflow_infra::event_store::{EventStore, InMemoryEventStore, PostgresEventStore};
use jobflow_infra::ledger::{InMemoryLedger, LedgerStore, PostgresLedger};
use jobflow_infra::matching::InMemoryWorkerPool;
use jobflow_infra::orchestrator::{Collaborators, Orchestrator};
use jobflow_infra::retry::InMemoryRetryTaskStore;

fn main() -> anyhow::Result<()> {
    jobflow_observability::init();

    let config = OrchestratorConfig::from_env().context("loading configuration")?;
    let poll_interval = std::env::var("JOBFLOW_POLL_INTERVAL_SECS")
        .ok()
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .context("parsing JOBFLOW_POLL_INTERVAL_SECS")?
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(5));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;
    let _guard = runtime.enter();

    match config.database_url.clone() {
        Some(url) => {
            let pool = runtime
                .block_on(PgPoolOptions::new().max_connections(8).connect(&url))
                .context("connecting to postgres")?;
            tracing::info!("using postgres event store and ledger");
            run(
                PostgresEventStore::new(pool.clone()),
                PostgresLedger::new(pool),
                SimulatedGateway::new(),
                config,
                poll_interval,
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set; executions and ledger live in memory");
            run(
                InMemoryEventStore::new(),
                InMemoryLedger::new(),
                SimulatedGateway::new(),
                config,
                poll_interval,
            )
        }
    }
}

fn run<S, L, G>(
    store: S,
    ledger: L,
    gateway: G,
    config: OrchestratorConfig,
    poll_interval: Duration,
) -> anyhow::Result<()>
where
    S: EventStore,
    L: LedgerStore,
    G: PaymentGateway,
{
    let orchestrator = Orchestrator::new(
        Collaborators {
            store,
            ledger,
            gateway,
            workers: Arc::new(InMemoryWorkerPool::new()),
            activities: Arc::new(StandardActivities::new(
                InMemoryJobCatalog::new(),
                TracingNotifier,
            )),
            // Rebuilt from the execution streams by `recover` below.
            retries: Arc::new(InMemoryRetryTaskStore::new()),
            clock: Arc::new(SystemClock),
        },
        config,
    )?;

    let report = orchestrator.recover()?;
    tracing::info!(
        resumed = report.resumed.len(),
        requeued = report.requeued.len(),
        failed = report.failed.len(),
        "startup recovery complete"
    );

    loop {
        match orchestrator.fire_due_timers() {
            Ok(resumed) if !resumed.is_empty() => {
                tracing::info!(count = resumed.len(), "resumed executions")
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "timer sweep failed"),
        }
        if let Err(e) = orchestrator.run_payment_retries() {
            tracing::error!(error = %e, "payment retry sweep failed");
        }
        std::thread::sleep(poll_interval);
    }
}
