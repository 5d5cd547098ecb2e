use serde::{Deserialize, Serialize};

use crate::models::rule::Category;

/// An SDMX dataflow descriptor parsed from the ISTAT dataflow list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataflow {
    pub id: String,
    pub name_it: Option<String>,
    pub name_en: Option<String>,
    pub display_name: String,
    pub description: String,
}

impl Dataflow {
    /// Italian preferred, English fallback, id last.
    pub fn display_name_from(id: &str, name_it: &Option<String>, name_en: &Option<String>) -> String {
        name_it
            .as_deref()
            .or(name_en.as_deref())
            .filter(|s| !s.is_empty())
            .unwrap_or(id)
            .to_string()
    }
}

/// Suggested Tableau connection type, by probed payload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    DirectConnection,
    GoogleSheetsImport,
    BigqueryExtract,
}

/// Suggested refresh cadence, by category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshFrequency {
    Monthly,
    Quarterly,
    Yearly,
}

/// Result of probing a dataflow's data endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataflowProbe {
    pub dataflow_id: String,
    pub data_access_success: bool,
    pub status_code: Option<u16>,
    pub size_bytes: u64,
    pub observations_count: u64,
    pub parse_error: bool,
    pub error_message: Option<String>,
}

impl DataflowProbe {
    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// A fully analyzed dataflow: categorization plus optional probe results.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyzedDataflow {
    #[serde(flatten)]
    pub dataflow: Dataflow,
    pub category: Category,
    pub relevance_score: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<DataflowProbe>,
    pub tableau_ready: bool,
    pub suggested_connection: ConnectionType,
    pub suggested_refresh: RefreshFrequency,
    pub priority: f64,
}

#[derive(Debug, Deserialize)]
pub struct AnalyzeDataflowRequest {
    pub xml_content: String,
    #[serde(default)]
    pub include_tests: bool,
    #[serde(default)]
    pub min_relevance_score: i64,
    #[serde(default)]
    pub only_tableau_ready: bool,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct BulkAnalyzeRequest {
    pub dataflow_ids: Vec<String>,
    #[serde(default)]
    pub include_tests: bool,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub total_analyzed: usize,
    pub tableau_ready_count: usize,
    pub category_stats: serde_json::Value,
    pub dataflows: Vec<AnalyzedDataflow>,
    pub timestamp: String,
}
