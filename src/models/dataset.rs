use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;

/// Lifecycle status of a dataset. Soft delete goes through `Inactive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetStatus {
    Active,
    Inactive,
    Processing,
    Error,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Processing => "processing",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "inactive" => Some(Self::Inactive),
            "processing" => Some(Self::Processing),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Dataset metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_id: String,
    pub name: String,
    pub category: String,
    pub description: String,
    pub agency: String,
    pub priority: i64,
    pub status: DatasetStatus,
    /// Opaque structured blob; values are strings or scalars.
    pub metadata: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Analytics-side statistics derived from the observations table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsStats {
    pub record_count: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    pub territory_count: u64,
    pub measure_count: u64,
}

/// Unified view joining metadata with analytics stats.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetComplete {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub has_analytics_data: bool,
    pub analytics_stats: AnalyticsStats,
}

/// Typed user-preference value, serialized as `{kind, payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "lowercase")]
pub enum PreferenceValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Json(serde_json::Value),
}

const MIN_ID_LEN: usize = 3;
const MAX_ID_LEN: usize = 50;

fn is_separator(c: char) -> bool {
    c == '_' || c == '-'
}

/// Validate a dataset identifier: alphanumeric plus `_`/`-`, 3–50 chars,
/// no leading/trailing/consecutive separators. Failures carry a cleaned
/// suggestion so callers can self-correct.
pub fn validate_dataset_id(id: &str) -> Result<(), ApiError> {
    let valid = id.len() >= MIN_ID_LEN
        && id.len() <= MAX_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || is_separator(c))
        && !id.chars().next().is_some_and(is_separator)
        && !id.chars().last().is_some_and(is_separator)
        && !id
            .chars()
            .zip(id.chars().skip(1))
            .any(|(a, b)| is_separator(a) && is_separator(b));
    if valid {
        return Ok(());
    }
    Err(ApiError::validation_with(
        format!("invalid dataset_id {id:?}"),
        json!({
            "provided": id,
            "expected_format": "3-50 alphanumeric characters with non-consecutive '_' or '-'",
            "corrected_suggestion": clean_dataset_id(id),
            "examples": ["DCIS_POPRES1", "101_1015", "EMPLOYMENT-RATE"],
            "suggestion": "use the corrected_suggestion value or pick a compliant identifier",
        }),
    ))
}

/// Best-effort cleanup of a malformed dataset id: uppercase, whitespace runs
/// become `_`, illegal characters are dropped, separators collapsed and
/// trimmed, length clamped.
pub fn clean_dataset_id(id: &str) -> String {
    let mut cleaned = String::with_capacity(id.len());
    let mut last_was_sep = true; // swallow leading separators
    for c in id.trim().chars() {
        let mapped = if c.is_whitespace() {
            Some('_')
        } else if c.is_ascii_alphanumeric() {
            Some(c.to_ascii_uppercase())
        } else if is_separator(c) {
            Some(c)
        } else {
            None
        };
        if let Some(c) = mapped {
            if is_separator(c) {
                if !last_was_sep {
                    cleaned.push(c);
                    last_was_sep = true;
                }
            } else {
                cleaned.push(c);
                last_was_sep = false;
            }
        }
    }
    while cleaned.ends_with(is_separator) {
        cleaned.pop();
    }
    cleaned.truncate(MAX_ID_LEN);
    while cleaned.ends_with(is_separator) {
        cleaned.pop();
    }
    cleaned
}
