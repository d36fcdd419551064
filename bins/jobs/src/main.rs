//! Tabkeeper ledger jobs.
//!
//! Entry point for the external scheduler. Each invocation runs one fine
//! scan and one inactivity scan and exits.
//!
//! Usage:
//!   tabkeeper-jobs [--dry-run] [all|fines|inactivity]
//!
//! With `--dry-run` every change is computed and rolled back.

use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tabkeeper_core::clock::SystemClock;
use tabkeeper_core::fines::{FineEngine, IssuedFine};
use tabkeeper_core::inactivity::{ChargedCost, InactivityEngine};
use tabkeeper_core::ledger::{BalanceCache, LedgerError, LedgerWriter};
use tabkeeper_core::notify::LedgerNotifier;
use tabkeeper_core::scan::ScanReport;
use tabkeeper_db::{PgLedgerStore, connect_with};
use tabkeeper_shared::AppConfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Job {
    All,
    Fines,
    Inactivity,
}

#[derive(Debug, Parser)]
#[command(name = "tabkeeper-jobs", version, about = "Run the scheduled ledger jobs")]
struct Args {
    /// Compute every change and roll it back.
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Which scan to run.
    #[arg(value_enum, default_value_t = Job::All)]
    job: Job,
}

/// Logs every notification as a structured event for the mail relay.
struct LogNotifier;

#[async_trait]
impl LedgerNotifier for LogNotifier {
    async fn fine_issued(&self, fine: &IssuedFine) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(fine)
            .map_err(|e| LedgerError::ExternalDependency(e.to_string()))?;
        info!(target: "tabkeeper::notify", user_id = %fine.fine.user_id, %payload, "fine_issued");
        Ok(())
    }

    async fn inactivity_charged(&self, cost: &ChargedCost) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(cost)
            .map_err(|e| LedgerError::ExternalDependency(e.to_string()))?;
        info!(
            target: "tabkeeper::notify",
            user_id = %cost.cost.user_id,
            %payload,
            "inactivity_charged"
        );
        Ok(())
    }
}

fn summarize<T>(job: &str, report: &ScanReport<T>) {
    info!(
        job,
        examined = report.examined,
        processed = report.processed.len(),
        skipped = report.skipped.len(),
        settled = report.settled.len(),
        failed = report.failures.len(),
        warnings = report.warnings.len(),
        dry_run = report.dry_run,
        "Job finished"
    );
    for failure in &report.failures {
        error!(job, user_id = %failure.user_id, error = %failure.error, "User failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "tabkeeper=info,tabkeeper_core=info,tabkeeper_db=info,tabkeeper_jobs=info".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = AppConfig::load().context("Failed to load configuration")?;

    let db = connect_with(&config.database)
        .await
        .context("Failed to connect to database")?;
    info!(dry_run = args.dry_run, job = ?args.job, "Connected to database");

    let store = Arc::new(PgLedgerStore::new(db));
    let cache = BalanceCache::new(store, config.ledger.clone(), Arc::new(SystemClock));
    let writer = LedgerWriter::new(cache);
    let notifier: Arc<dyn LedgerNotifier> = Arc::new(LogNotifier);

    let mut clean = true;

    if matches!(args.job, Job::All | Job::Fines) {
        let engine = FineEngine::new(writer.clone(), config.fines.clone())
            .with_notifier(Arc::clone(&notifier));
        let report = engine.run(args.dry_run).await?;
        summarize("fines", &report);
        clean &= report.is_clean();
    }

    if matches!(args.job, Job::All | Job::Inactivity) {
        let engine = InactivityEngine::new(writer, config.inactivity.clone())
            .with_notifier(notifier);
        let report = engine.run(args.dry_run).await?;
        summarize("inactivity", &report);
        clean &= report.is_clean();
    }

    if !clean {
        bail!("some users could not be processed, see the log");
    }
    Ok(())
}
