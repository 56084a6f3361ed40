use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rating_monitor_core::ingest::tradingview::TradingViewScreener;
use rating_monitor_core::ingest::types::ScreenerRange;
use rating_monitor_core::monitor::{shutdown_channel, Monitor};
use rating_monitor_core::query::{
    QueryService, RatingChangePage, SymbolHistory, DEFAULT_HISTORY_LIMIT, DEFAULT_PAGE_SIZE,
};
use rating_monitor_core::status::{status_channel, RunStatus, StatusReader};
use rating_monitor_core::storage::snapshots::TimeWindow;

const DASHBOARD_HTML: &str = include_str!("dashboard.html");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = rating_monitor_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let pool = match rating_monitor_core::storage::connect(&settings.db_path).await {
        Ok(pool) => pool,
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            return Err(e);
        }
    };
    if let Err(e) = rating_monitor_core::storage::migrate(&pool).await {
        sentry_anyhow::capture_anyhow(&e);
        return Err(e);
    }

    let (trigger, shutdown) = shutdown_channel();
    let (publisher, status) = status_channel();

    let monitor_task = if settings.monitor_enabled {
        let source = Arc::new(TradingViewScreener::from_settings(&settings)?);
        let monitor = Monitor::new(pool.clone(), source, settings.monitor_config(), publisher);
        Some(tokio::spawn(monitor.run(shutdown)))
    } else {
        tracing::warn!("MONITOR_ENABLED is off; serving reads only");
        None
    };

    let state = AppState {
        queries: QueryService::new(pool),
        status,
        interval_seconds: settings.interval_seconds,
        range: settings.range(),
    };

    let app = Router::new()
        .route("/", get(dashboard))
        .route("/healthz", get(healthz))
        .route("/api/rating_changes", get(list_rating_changes))
        .route("/api/symbol/:symbol/history", get(get_symbol_history))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            trigger.trigger();
        })
        .await?;

    if let Some(task) = monitor_task {
        // Lets an in-flight commit finish before the process exits.
        task.await?;
    }

    Ok(())
}

#[derive(Debug, Clone)]
struct AppState {
    queries: QueryService,
    status: StatusReader,
    interval_seconds: u64,
    range: ScreenerRange,
}

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_HTML)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    is_running: bool,
    interval_seconds: u64,
    range: ScreenerRange,
    state: RunStatus,
    latest_snapshot: Option<DateTime<Utc>>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let run_status = state.status.current();
    let latest_snapshot = match state.queries.latest_snapshot_time().await {
        Ok(ts) => ts,
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::warn!(error = %e, "latest snapshot lookup failed");
            None
        }
    };

    Json(HealthResponse {
        status: run_status.health_label(),
        is_running: state.status.is_running(),
        interval_seconds: state.interval_seconds,
        range: state.range,
        state: run_status,
        latest_snapshot,
    })
}

#[derive(Debug, Deserialize)]
struct ChangesParams {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_rating_changes(
    State(state): State<AppState>,
    Query(params): Query<ChangesParams>,
) -> Result<Json<RatingChangePage>, StatusCode> {
    let page = params.page.unwrap_or(1);
    let page_size = params.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    let res = state
        .queries
        .list_rating_changes(page, page_size)
        .await
        .map_err(internal_error)?;

    Ok(Json(res))
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<u32>,
    start: Option<String>,
    end: Option<String>,
}

async fn get_symbol_history(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<SymbolHistory>, StatusCode> {
    let window = TimeWindow {
        start: params
            .start
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|_| StatusCode::BAD_REQUEST)?,
        end: params
            .end
            .as_deref()
            .map(parse_timestamp)
            .transpose()
            .map_err(|_| StatusCode::BAD_REQUEST)?,
    };

    let history = state
        .queries
        .symbol_history(&symbol, window, params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT))
        .await
        .map_err(internal_error)?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(history))
}

/// RFC 3339, or a naive date/datetime taken as UTC.
fn parse_timestamp(s: &str) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")?;
    let midnight = date.and_hms_opt(0, 0, 0).context("invalid date")?;
    Ok(midnight.and_utc())
}

fn internal_error(err: anyhow::Error) -> StatusCode {
    sentry_anyhow::capture_anyhow(&err);
    tracing::error!(error = %format!("{err:#}"), "request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
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
