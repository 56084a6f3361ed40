use crate::config::Settings;
use crate::domain::snapshot::normalise_rating;
use crate::ingest::source::{AdapterError, DataSource};
use crate::ingest::types::{ScreenerRange, ScreenerRow};
use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Scanner columns requested from TradingView, paired with the label stored in the raw payload.
const COLUMNS: &[(&str, &str)] = &[
    ("name", "Name"),
    ("description", "Description"),
    ("close", "Price"),
    ("change", "Change %"),
    ("volume", "Volume"),
    ("average_volume_30d_calc", "Average Volume (30 day)"),
    ("average_volume_10d_calc", "Average Volume (10 day)"),
    ("market_cap_basic", "Market Capitalization"),
    ("price_52_week_high", "52 Week High"),
    ("price_52_week_low", "52 Week Low"),
    ("sector", "Sector"),
    ("industry", "Industry"),
    ("Recommend.All", "Technical Rating"),
    ("recommendation_mark", "Analyst Rating Mark"),
];

const PRICE_COLUMN: &str = "close";
const RATING_MARK_COLUMN: &str = "recommendation_mark";

#[derive(Debug, Clone)]
pub struct TradingViewScreener {
    http: reqwest::Client,
    url: String,
}

impl TradingViewScreener {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.screener_timeout_secs))
            .build()
            .context("failed to build screener http client")?;

        Ok(Self {
            http,
            url: settings.screener_url.clone(),
        })
    }

    fn request_body(range: ScreenerRange) -> Value {
        let columns: Vec<&str> = COLUMNS.iter().map(|(col, _)| *col).collect();
        json!({
            "columns": columns,
            "filter": [],
            "options": {"lang": "en"},
            "markets": ["america"],
            "symbols": {"query": {"types": []}, "tickers": []},
            "sort": {"sortBy": "market_cap_basic", "sortOrder": "desc"},
            "range": [range.start, range.end],
        })
    }
}

#[async_trait::async_trait]
impl DataSource for TradingViewScreener {
    fn source_name(&self) -> &'static str {
        "tradingview_scanner"
    }

    async fn fetch(&self, range: ScreenerRange) -> Result<Vec<ScreenerRow>, AdapterError> {
        let res = self
            .http
            .post(&self.url)
            .json(&Self::request_body(range))
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        let text = res.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(status_error(status, text));
        }

        let rows = parse_scan_response(&text)?;
        tracing::debug!(
            rows = rows.len(),
            start = range.start,
            end = range.end,
            "screener scan fetched"
        );
        Ok(rows)
    }
}

#[derive(Debug, Deserialize)]
struct ScanResponse {
    #[serde(default)]
    data: Vec<ScanRow>,
}

#[derive(Debug, Deserialize)]
struct ScanRow {
    s: String,
    d: Vec<Value>,
}

fn parse_scan_response(text: &str) -> Result<Vec<ScreenerRow>, AdapterError> {
    let parsed = serde_json::from_str::<ScanResponse>(text)
        .map_err(|e| AdapterError::Malformed(format!("{e}")))?;

    parsed.data.into_iter().map(scan_row_to_screener_row).collect()
}

fn scan_row_to_screener_row(row: ScanRow) -> Result<ScreenerRow, AdapterError> {
    if row.d.len() != COLUMNS.len() {
        return Err(AdapterError::Malformed(format!(
            "row {} has {} values, expected {}",
            row.s,
            row.d.len(),
            COLUMNS.len()
        )));
    }

    let mut fields = Map::new();
    fields.insert("Symbol".to_string(), Value::String(row.s.clone()));

    let mut price = None;
    let mut rating_mark = None;
    for ((column, label), value) in COLUMNS.iter().zip(row.d) {
        match *column {
            PRICE_COLUMN => price = value.as_f64(),
            RATING_MARK_COLUMN => rating_mark = value.as_f64(),
            _ => {}
        }
        fields.insert(label.to_string(), value);
    }

    let analyst_rating = rating_from_mark(rating_mark);
    fields.insert(
        "Analyst Rating".to_string(),
        analyst_rating.clone().map(Value::String).unwrap_or(Value::Null),
    );

    Ok(ScreenerRow {
        symbol: row.s,
        analyst_rating,
        price,
        fields,
    })
}

/// Maps the scanner's analyst recommendation mark (1 = strong buy, 5 = strong sell) to a label.
fn rating_from_mark(mark: Option<f64>) -> Option<String> {
    let mark = mark.filter(|m| m.is_finite())?;
    let label = if mark < 1.5 {
        "Strong Buy"
    } else if mark < 2.5 {
        "Buy"
    } else if mark < 3.5 {
        "Neutral"
    } else if mark < 4.5 {
        "Sell"
    } else {
        "Strong Sell"
    };
    normalise_rating(Some(label))
}

fn transport_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Timeout
    } else {
        AdapterError::Transport(err.to_string())
    }
}

/// Upstream error pages can be whole HTML documents; only a prefix is kept.
const MAX_ERROR_BODY_CHARS: usize = 200;

fn status_error(status: StatusCode, body: String) -> AdapterError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return AdapterError::RateLimited;
    }
    AdapterError::Http {
        status: status.as_u16(),
        body: truncate_body(body.trim()),
    }
}

fn truncate_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}...", &body[..cut]),
        None => body.to_string(),
    }
}
