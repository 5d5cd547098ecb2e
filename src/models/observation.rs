use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// One observation row in the columnar store. Unique on
/// `(dataset_id, time_period, territory_code, measure_code)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Row)]
pub struct Observation {
    pub dataset_id: String,
    pub year: i32,
    pub time_period: String,
    pub territory_code: String,
    pub territory_name: String,
    pub measure_code: String,
    pub measure_name: String,
    pub obs_value: Option<f64>,
    pub obs_status: String,
}

impl Observation {
    /// Natural key used for dedup and idempotent sync.
    pub fn natural_key(&self) -> (String, String, String, String) {
        (
            self.dataset_id.clone(),
            self.time_period.clone(),
            self.territory_code.clone(),
            self.measure_code.clone(),
        )
    }
}

/// Aggregate statistics for one dataset.
#[derive(Debug, Deserialize, Row)]
pub struct DatasetStatsRow {
    pub record_count: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    pub territory_count: u64,
    pub measure_count: u64,
}

/// Single-count row.
#[derive(Debug, Deserialize, Row)]
pub struct CountRow {
    pub count: u64,
}

/// Per-dataset aggregate used when annotating dataset listings.
#[derive(Debug, Deserialize, Row)]
pub struct DatasetStatsByIdRow {
    pub dataset_id: String,
    pub record_count: u64,
    pub min_year: Option<i32>,
    pub max_year: Option<i32>,
    pub territory_count: u64,
    pub measure_count: u64,
}

/// Distinct territory row for the OData Territories entity set.
#[derive(Debug, Serialize, Deserialize, Row)]
pub struct TerritoryRow {
    pub territory_code: String,
    pub territory_name: String,
    pub observation_count: u64,
}

/// Distinct measure row for the OData Measures entity set.
#[derive(Debug, Serialize, Deserialize, Row)]
pub struct MeasureRow {
    pub measure_code: String,
    pub measure_name: String,
    pub observation_count: u64,
}

/// Territory comparison aggregate (specialized query builder output).
#[derive(Debug, Serialize, Deserialize, Row)]
pub struct TerritoryComparisonRow {
    pub territory_code: String,
    pub territory_name: String,
    pub avg_value: f64,
    pub observation_count: u64,
}

/// Per-year category trend aggregate.
#[derive(Debug, Serialize, Deserialize, Row)]
pub struct CategoryTrendRow {
    pub year: i32,
    pub dataset_count: u64,
    pub avg_value: f64,
    pub total_value: f64,
}
