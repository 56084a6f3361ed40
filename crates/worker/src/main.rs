use anyhow::Context;
use clap::Parser;
use rating_monitor_core::ingest::source::DataSource;
use rating_monitor_core::ingest::tradingview::TradingViewScreener;
use rating_monitor_core::monitor::{shutdown_channel, Monitor};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rating_monitor_worker")]
struct Args {
    /// Run a single poll cycle and exit.
    #[arg(long)]
    once: bool,

    /// Fetch one batch from the screener and log it without touching the database.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = rating_monitor_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(env_filter(&settings.log_level))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let source = Arc::new(TradingViewScreener::from_settings(&settings)?);

    if args.dry_run {
        let range = settings.range();
        let rows = source.fetch(range).await.context("screener fetch failed")?;
        let sample = rows.first().map(|r| serde_json::to_string(&r.fields)).transpose()?;
        tracing::info!(
            dry_run = true,
            rows = rows.len(),
            range_start = range.start,
            range_end = range.end,
            sample = sample.as_deref().unwrap_or("-"),
            "screener batch fetched (dry-run)"
        );
        return Ok(());
    }

    let pool = rating_monitor_core::storage::connect(&settings.db_path).await?;
    rating_monitor_core::storage::migrate(&pool).await?;

    let (publisher, _status) = rating_monitor_core::status::status_channel();
    let mut monitor = Monitor::new(pool, source, settings.monitor_config(), publisher);

    if args.once {
        let report = match monitor.run_cycle().await {
            Ok(report) => report,
            Err(err) => {
                let err = anyhow::Error::new(err);
                sentry_anyhow::capture_anyhow(&err);
                return Err(err.context("poll cycle failed"));
            }
        };
        tracing::info!(
            retrieved_at = %report.retrieved_at,
            outcome = ?report.outcome,
            processed = report.processed,
            changes = report.changes.len(),
            "single poll cycle finished"
        );
        return Ok(());
    }

    let (trigger, shutdown) = shutdown_channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested; finishing current cycle");
        trigger.trigger();
    });

    monitor.run(shutdown).await;
    Ok(())
}

fn env_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
}

fn init_sentry(settings: &rating_monitor_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
