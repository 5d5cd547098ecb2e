use serde::{Deserialize, Serialize};

use crate::models::dataflow::Dataflow;
use crate::models::observation::Observation;

/// Where a payload came from: a live upstream fetch or the last-known-good
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Live,
    CacheFallback,
}

/// Dataflow listing returned by the ingestion client.
#[derive(Debug, Clone, Serialize)]
pub struct DataflowListing {
    pub dataflows: Vec<Dataflow>,
    pub source: PayloadSource,
    pub fetched_at: String,
}

/// A dataset payload fetched from upstream, ready for sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetPayload {
    pub dataset_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub observations: Vec<Observation>,
}

/// Quality assessment of a fetched payload.
#[derive(Debug, Clone, Serialize)]
pub struct QualityResult {
    /// Fraction of observations with a non-null value.
    pub completeness: f64,
    /// 1 minus the fraction of duplicate natural keys.
    pub consistency: f64,
    pub validation_errors: Vec<String>,
    /// Weighted 0–1 score.
    pub quality_score: f64,
}

/// Outcome of `sync_to_repository`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub dataset_id: String,
    pub records_synced: usize,
    pub records_skipped: usize,
    pub sync_time_ms: i64,
    pub timestamp: String,
}

/// Snapshot of the ingestion client state for `/api/istat/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub circuit_state: String,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
    pub cache_populated: bool,
    pub last_success: Option<String>,
}
