pub mod analytics;
pub mod domain;
pub mod ingest;
pub mod monitor;
pub mod query;
pub mod status;
pub mod storage;

pub mod config {
    use anyhow::Context;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::ingest::types::ScreenerRange;
    use crate::monitor::MonitorConfig;

    pub const DEFAULT_SCREENER_URL: &str = "https://scanner.tradingview.com/america/scan";
    const MIN_INTERVAL_SECONDS: u64 = 60;

    #[derive(Debug, Clone)]
    pub struct Settings {
        pub interval_seconds: u64,
        pub range_start: u32,
        pub range_end: u32,
        pub db_path: PathBuf,
        pub log_level: String,
        /// Maximum fetch attempts per cycle (the first try included).
        pub max_retries: u32,
        pub retry_backoff_seconds: u64,
        pub screener_url: String,
        pub screener_timeout_secs: u64,
        pub sentry_dsn: Option<String>,
        pub port: u16,
        /// Whether the API process hosts the monitor loop.
        pub monitor_enabled: bool,
    }

    impl Settings {
        pub fn from_env() -> anyhow::Result<Self> {
            Self::from_lookup(|key| std::env::var(key).ok())
        }

        pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
            let settings = Self {
                interval_seconds: parse_or(&lookup, "INTERVAL_SECONDS", 600)?,
                range_start: parse_or(&lookup, "RANGE_START", 0)?,
                range_end: parse_or(&lookup, "RANGE_END", 150)?,
                db_path: non_empty(&lookup, "DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("data/monitor.db")),
                log_level: non_empty(&lookup, "LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
                max_retries: parse_or(&lookup, "MAX_RETRIES", 3)?,
                retry_backoff_seconds: parse_or(&lookup, "RETRY_BACKOFF_SECONDS", 30)?,
                screener_url: non_empty(&lookup, "SCREENER_URL")
                    .unwrap_or_else(|| DEFAULT_SCREENER_URL.to_string()),
                screener_timeout_secs: parse_or(&lookup, "SCREENER_TIMEOUT_SECS", 30)?,
                sentry_dsn: non_empty(&lookup, "SENTRY_DSN"),
                port: parse_or(&lookup, "PORT", 8000)?,
                monitor_enabled: flag_or(&lookup, "MONITOR_ENABLED", true)?,
            };
            settings.validate()?;
            Ok(settings)
        }

        fn validate(&self) -> anyhow::Result<()> {
            anyhow::ensure!(
                self.interval_seconds >= MIN_INTERVAL_SECONDS,
                "INTERVAL_SECONDS must be >= {MIN_INTERVAL_SECONDS} (got {})",
                self.interval_seconds
            );
            anyhow::ensure!(
                self.range_end > self.range_start,
                "RANGE_END must be greater than RANGE_START (got {}..{})",
                self.range_start,
                self.range_end
            );
            Ok(())
        }

        pub fn range(&self) -> ScreenerRange {
            ScreenerRange::new(self.range_start, self.range_end)
        }

        pub fn monitor_config(&self) -> MonitorConfig {
            MonitorConfig {
                interval: Duration::from_secs(self.interval_seconds),
                range: self.range(),
                max_attempts: self.max_retries.max(1),
                retry_backoff: Duration::from_secs(self.retry_backoff_seconds),
            }
        }
    }

    fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
        lookup(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
    where
        T: std::str::FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match non_empty(lookup, key) {
            Some(v) => v
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value: {v}")),
            None => Ok(default),
        }
    }

    fn flag_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> anyhow::Result<bool> {
        let Some(v) = non_empty(lookup, key) else {
            return Ok(default);
        };
        match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} has an invalid value: {v} (expected true/false)"),
        }
    }

}
