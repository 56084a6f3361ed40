use crate::domain::snapshot::{normalise_rating, Snapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

pub const RATING_SCORE_LABELS: [(u8, &str); 5] = [
    (0, "Strong Sell"),
    (1, "Sell / Underperform"),
    (2, "Hold / Neutral"),
    (3, "Buy / Outperform"),
    (4, "Strong Buy"),
];

/// Lookup key for a rating: upper-cased with spaces and hyphens removed.
pub fn rating_key(value: Option<&str>) -> Option<String> {
    let rating = normalise_rating(value)?;
    Some(
        rating
            .chars()
            .filter(|c| *c != ' ' && *c != '-')
            .flat_map(char::to_uppercase)
            .collect(),
    )
}

/// Numeric score 0 (strong sell) ..= 4 (strong buy); unknown labels have none.
pub fn rating_to_score(value: Option<&str>) -> Option<u8> {
    let score = match rating_key(value)?.as_str() {
        "STRONGSELL" => 0,
        "SELL" | "UNDERPERFORM" | "REDUCE" | "UNDERWEIGHT" => 1,
        "HOLD" | "NEUTRAL" | "MARKETPERFORM" | "EQUALWEIGHT" | "PERFORM" => 2,
        "ACCUMULATE" | "BUY" | "OUTPERFORM" | "OVERWEIGHT" | "ADD" => 3,
        "STRONGBUY" | "CONVICTIONBUY" => 4,
        _ => return None,
    };
    Some(score)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub retrieved_at: DateTime<Utc>,
    pub analyst_rating: Option<String>,
    pub price: Option<f64>,
    pub rating_score: Option<u8>,
}

impl From<&Snapshot> for HistoryPoint {
    fn from(s: &Snapshot) -> Self {
        Self {
            retrieved_at: s.retrieved_at,
            analyst_rating: s.analyst_rating.clone(),
            price: s.price,
            rating_score: rating_to_score(s.analyst_rating.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Period {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceMetrics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub average: Option<f64>,
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub change: Option<f64>,
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RatingMetrics {
    pub counts: BTreeMap<String, usize>,
    pub current: Option<String>,
    pub score_labels: BTreeMap<u8, &'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryMetrics {
    pub period: Period,
    pub price: PriceMetrics,
    pub ratings: RatingMetrics,
}

/// Aggregates over a history already sorted ascending by time.
pub fn compute_history_metrics(history: &[Snapshot]) -> HistoryMetrics {
    let score_labels = RATING_SCORE_LABELS.into_iter().collect();
    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        return HistoryMetrics {
            ratings: RatingMetrics {
                score_labels,
                ..Default::default()
            },
            ..Default::default()
        };
    };

    let prices: Vec<f64> = history.iter().filter_map(|s| s.price).collect();
    let mut price = PriceMetrics::default();
    if let (Some(&start), Some(&end)) = (prices.first(), prices.last()) {
        price.min = prices.iter().copied().reduce(f64::min);
        price.max = prices.iter().copied().reduce(f64::max);
        price.average = Some(prices.iter().sum::<f64>() / prices.len() as f64);
        price.start = Some(start);
        price.end = Some(end);
        let change = end - start;
        price.change = Some(change);
        price.change_pct = (start != 0.0).then(|| change / start * 100.0);
    }

    let mut counts = BTreeMap::new();
    let mut current = None;
    for rating in history
        .iter()
        .filter_map(|s| normalise_rating(s.analyst_rating.as_deref()))
    {
        *counts.entry(rating.clone()).or_insert(0) += 1;
        current = Some(rating);
    }

    HistoryMetrics {
        period: Period {
            start: Some(first.retrieved_at),
            end: Some(last.retrieved_at),
        },
        price,
        ratings: RatingMetrics {
            counts,
            current,
            score_labels,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeFormat {
    Number,
    Percent,
    Compact,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileAttribute {
    pub label: &'static str,
    pub value: f64,
    pub format: AttributeFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SymbolProfile {
    pub symbol: String,
    pub name: String,
    pub description: Option<String>,
    pub sector: Option<String>,
    pub industry: Option<String>,
    pub retrieved_at: DateTime<Utc>,
    pub attributes: Vec<ProfileAttribute>,
}

const RAW_ATTRIBUTES: &[(&str, &str, AttributeFormat)] = &[
    ("Change %", "Change (Daily)", AttributeFormat::Percent),
    ("Volume", "Volume", AttributeFormat::Compact),
    ("Average Volume (30 day)", "Average Volume (30d)", AttributeFormat::Compact),
    ("Average Volume (10 day)", "Average Volume (10d)", AttributeFormat::Compact),
    ("Market Capitalization", "Market Cap", AttributeFormat::Compact),
    ("52 Week High", "52 Week High", AttributeFormat::Number),
    ("52 Week Low", "52 Week Low", AttributeFormat::Number),
];

/// Display-oriented view of the latest snapshot, read mostly from its raw payload.
pub fn build_symbol_profile(latest: &Snapshot) -> SymbolProfile {
    let raw = latest.raw.as_object();
    let text = |key: &str| {
        raw.and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let mut attributes = Vec::new();
    if let Some(price) = latest.price {
        attributes.push(ProfileAttribute {
            label: "Last Price",
            value: price,
            format: AttributeFormat::Number,
        });
    }
    for (key, label, format) in RAW_ATTRIBUTES {
        if let Some(value) = raw.and_then(|m| m.get(*key)).and_then(coerce_float) {
            attributes.push(ProfileAttribute {
                label: *label,
                value,
                format: *format,
            });
        }
    }

    SymbolProfile {
        symbol: latest.symbol.clone(),
        name: text("Name").unwrap_or_else(|| latest.symbol.clone()),
        description: text("Description"),
        sector: text("Sector"),
        industry: text("Industry"),
        retrieved_at: latest.retrieved_at,
        attributes,
    }
}

/// Accepts numbers and numeric strings such as "1,234.5" or "2.5%".
pub fn coerce_float(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned = s.trim().replace(',', "");
            let cleaned = cleaned.strip_suffix('%').unwrap_or(&cleaned);
            cleaned.parse::<f64>().ok()
        }
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn snap(day: u32, price: Option<f64>, rating: Option<&str>) -> Snapshot {
        Snapshot {
            id: i64::from(day),
            symbol: "AAPL".to_string(),
            retrieved_at: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            analyst_rating: rating.map(str::to_string),
            price,
            raw: json!({}),
        }
    }

    #[test]
    fn scores_known_labels() {
        assert_eq!(rating_to_score(Some("Buy")), Some(3));
        assert_eq!(rating_to_score(Some("Strong Sell")), Some(0));
        assert_eq!(rating_to_score(Some("strong-buy")), Some(4));
        assert_eq!(rating_to_score(Some("Hold")), Some(2));
        assert_eq!(rating_to_score(Some("Moonshot")), None);
        assert_eq!(rating_to_score(None), None);
        assert_eq!(rating_key(Some(" Market Perform ")).as_deref(), Some("MARKETPERFORM"));
    }

    #[test]
    fn history_metrics_cover_price_and_ratings() {
        let history = vec![
            snap(1, Some(100.0), Some("Buy")),
            snap(2, Some(105.0), Some("Strong Buy")),
            snap(3, Some(102.5), Some("Buy")),
        ];

        let m = compute_history_metrics(&history);
        assert_eq!(m.period.start, Some(history[0].retrieved_at));
        assert_eq!(m.period.end, Some(history[2].retrieved_at));
        assert_eq!(m.price.min, Some(100.0));
        assert_eq!(m.price.max, Some(105.0));
        assert_eq!(m.price.change, Some(2.5));
        assert!((m.price.change_pct.unwrap() - 2.5).abs() < 1e-9);
        assert!((m.price.average.unwrap() - 102.5).abs() < 1e-9);
        assert_eq!(m.ratings.counts["Buy"], 2);
        assert_eq!(m.ratings.counts["Strong Buy"], 1);
        assert_eq!(m.ratings.current.as_deref(), Some("Buy"));
    }

    #[test]
    fn history_metrics_tolerate_missing_prices_and_empty_input() {
        let m = compute_history_metrics(&[snap(1, None, None), snap(2, Some(0.0), None)]);
        assert_eq!(m.price.start, Some(0.0));
        assert_eq!(m.price.change_pct, None);
        assert!(m.ratings.counts.is_empty());

        let empty = compute_history_metrics(&[]);
        assert_eq!(empty.period, Period::default());
        assert_eq!(empty.ratings.score_labels.len(), 5);
    }

    #[test]
    fn profile_reads_raw_payload() {
        let mut latest = snap(3, Some(102.5), Some("Buy"));
        latest.raw = json!({
            "Name": "Apple Inc.",
            "Description": "Consumer electronics",
            "Sector": "Technology",
            "Industry": "Consumer Electronics",
            "Change %": "1.2%",
            "Volume": 1_000_000,
            "Market Capitalization": 2.5e12,
            "52 Week High": 199.0,
            "52 Week Low": null,
        });

        let profile = build_symbol_profile(&latest);
        assert_eq!(profile.name, "Apple Inc.");
        assert_eq!(profile.sector.as_deref(), Some("Technology"));
        assert_eq!(profile.industry.as_deref(), Some("Consumer Electronics"));
        let labels: Vec<_> = profile.attributes.iter().map(|a| a.label).collect();
        assert!(labels.contains(&"Last Price"));
        assert!(labels.contains(&"Market Cap"));
        assert!(labels.contains(&"52 Week High"));
        assert!(!labels.contains(&"52 Week Low"));
        let change = profile
            .attributes
            .iter()
            .find(|a| a.label == "Change (Daily)")
            .unwrap();
        assert_eq!(change.value, 1.2);
    }

    #[test]
    fn profile_falls_back_to_symbol_name() {
        let profile = build_symbol_profile(&snap(1, None, None));
        assert_eq!(profile.name, "AAPL");
        assert!(profile.attributes.is_empty());
    }

    #[test]
    fn coerces_numeric_strings() {
        assert_eq!(coerce_float(&json!("1,234.5")), Some(1234.5));
        assert_eq!(coerce_float(&json!("")), None);
        assert_eq!(coerce_float(&json!(true)), None);
    }
}
