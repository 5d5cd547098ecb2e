use futures_util::StreamExt;
use futures_util::stream;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AnalysisConfig;
use crate::error::{ApiError, ApiResult};
use crate::metadata_db::MetadataDb;
use crate::models::dataflow::{
    AnalysisResponse, AnalyzedDataflow, ConnectionType, Dataflow, DataflowProbe, RefreshFrequency,
};
use crate::models::rule::{CategorizationRule, Category};
use crate::sdmx;

pub const MAX_BULK_IDS: usize = 50;

const MB: f64 = 1024.0 * 1024.0;

/// First active rule (already ordered by priority desc, rule_id asc) with
/// any keyword appearing in the lowercased display name + description wins.
/// The relevance score sums the lengths of that rule's matched keywords.
pub fn categorize(
    dataflow: &Dataflow,
    rules: &[CategorizationRule],
) -> (Category, i64, Vec<String>) {
    let haystack =
        format!("{} {}", dataflow.display_name, dataflow.description).to_lowercase();
    for rule in rules.iter().filter(|r| r.is_active) {
        let matched: Vec<String> = rule
            .keywords
            .iter()
            .filter(|k| !k.is_empty() && haystack.contains(k.as_str()))
            .cloned()
            .collect();
        if !matched.is_empty() {
            let score = matched.iter().map(|k| k.len() as i64).sum();
            return (rule.category, score, matched);
        }
    }
    (Category::Altri, 0, Vec::new())
}

/// Connection suggestion by probed payload size.
pub fn suggest_connection(size_bytes: u64) -> ConnectionType {
    let size_mb = size_bytes as f64 / MB;
    if size_mb > 50.0 {
        ConnectionType::BigqueryExtract
    } else if size_mb > 5.0 {
        ConnectionType::GoogleSheetsImport
    } else {
        ConnectionType::DirectConnection
    }
}

/// Refresh cadence per category.
pub fn suggest_refresh(category: Category) -> RefreshFrequency {
    match category {
        Category::Popolazione | Category::Lavoro => RefreshFrequency::Monthly,
        Category::Territorio | Category::Istruzione => RefreshFrequency::Yearly,
        Category::Economia | Category::Salute => RefreshFrequency::Quarterly,
        Category::Altri => RefreshFrequency::Quarterly,
    }
}

/// Priority: relevance plus bounded bonuses for payload size and
/// observation count.
pub fn compute_priority(relevance_score: i64, probe: Option<&DataflowProbe>) -> f64 {
    let base = relevance_score as f64;
    match probe {
        Some(p) => {
            let size_bonus = (p.size_mb() / 10.0).min(5.0);
            let obs_bonus = (p.observations_count as f64 / 1000.0).min(5.0);
            base + size_bonus + obs_bonus
        }
        None => base,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnalysisOptions {
    pub include_tests: bool,
    pub min_relevance_score: i64,
    pub only_tableau_ready: bool,
    pub max_concurrent: Option<usize>,
}

/// Parses dataflow lists, applies categorization rules, and optionally
/// probes upstream data access with bounded concurrency.
pub struct AnalysisService {
    db: Arc<MetadataDb>,
    http: reqwest::Client,
    data_base_url: String,
    config: AnalysisConfig,
}

impl AnalysisService {
    pub fn new(db: Arc<MetadataDb>, data_base_url: &str, config: AnalysisConfig) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds))
            .user_agent("osservatorio-api")
            .build()
            .map_err(|e| ApiError::internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            db,
            http,
            data_base_url: data_base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    /// Analyze an SDMX dataflows XML document.
    pub async fn analyze_xml(
        &self,
        xml: &str,
        options: AnalysisOptions,
    ) -> ApiResult<AnalysisResponse> {
        let dataflows = sdmx::parse_dataflows(xml, self.config.max_xml_size_bytes)?;
        self.analyze_dataflows(dataflows, options).await
    }

    /// Bulk analysis by dataflow id (≤ 50 per call).
    pub async fn analyze_ids(
        &self,
        dataflow_ids: &[String],
        options: AnalysisOptions,
    ) -> ApiResult<AnalysisResponse> {
        if dataflow_ids.is_empty() {
            return Err(ApiError::validation("dataflow_ids must not be empty"));
        }
        if dataflow_ids.len() > MAX_BULK_IDS {
            return Err(ApiError::validation(format!(
                "at most {MAX_BULK_IDS} dataflow ids per bulk call, got {}",
                dataflow_ids.len()
            )));
        }
        let dataflows = dataflow_ids
            .iter()
            .map(|id| Dataflow {
                id: id.clone(),
                name_it: None,
                name_en: None,
                display_name: id.clone(),
                description: String::new(),
            })
            .collect();
        self.analyze_dataflows(dataflows, options).await
    }

    async fn analyze_dataflows(
        &self,
        dataflows: Vec<Dataflow>,
        options: AnalysisOptions,
    ) -> ApiResult<AnalysisResponse> {
        let rules = self.db.list_rules(true)?;
        let concurrency = options.max_concurrent.unwrap_or(self.config.max_concurrent).clamp(1, 10);

        let mut analyzed: Vec<AnalyzedDataflow> = if options.include_tests {
            stream::iter(dataflows)
                .map(|dataflow| {
                    let rules = &rules;
                    async move {
                        let (category, score, _) = categorize(&dataflow, rules);
                        let probe = self.probe_data_access(&dataflow.id).await;
                        build_result(dataflow, category, score, Some(probe))
                    }
                })
                .buffer_unordered(concurrency)
                .collect()
                .await
        } else {
            dataflows
                .into_iter()
                .map(|dataflow| {
                    let (category, score, _) = categorize(&dataflow, &rules);
                    build_result(dataflow, category, score, None)
                })
                .collect()
        };

        analyzed.retain(|a| a.relevance_score >= options.min_relevance_score);
        if options.only_tableau_ready {
            analyzed.retain(|a| a.tableau_ready);
        }
        analyzed.sort_by(|a, b| {
            b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(build_response(analyzed))
    }

    /// HEAD-equivalent access probe: fetch the data endpoint, record status
    /// and size, and try to count observations in the body.
    async fn probe_data_access(&self, dataflow_id: &str) -> DataflowProbe {
        let url = format!("{}/data/{}", self.data_base_url, urlencoding::encode(dataflow_id));
        let mut probe = DataflowProbe { dataflow_id: dataflow_id.to_string(), ..Default::default() };
        match self.http.get(&url).send().await {
            Ok(response) => {
                probe.status_code = Some(response.status().as_u16());
                let success = response.status().is_success();
                match response.text().await {
                    Ok(body) => {
                        probe.size_bytes = body.len() as u64;
                        probe.data_access_success = success;
                        if success {
                            match sdmx::count_observations(&body) {
                                Ok(count) => probe.observations_count = count,
                                Err(err) => {
                                    probe.parse_error = true;
                                    probe.error_message = Some(err);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        probe.data_access_success = false;
                        probe.error_message = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                probe.error_message = Some(err.to_string());
            }
        }
        probe
    }
}

fn build_result(
    dataflow: Dataflow,
    category: Category,
    relevance_score: i64,
    probe: Option<DataflowProbe>,
) -> AnalyzedDataflow {
    let tableau_ready =
        probe.as_ref().is_some_and(|p| p.data_access_success && !p.parse_error);
    let suggested_connection =
        suggest_connection(probe.as_ref().map(|p| p.size_bytes).unwrap_or(0));
    let priority = compute_priority(relevance_score, probe.as_ref());
    AnalyzedDataflow {
        dataflow,
        category,
        relevance_score,
        test: probe,
        tableau_ready,
        suggested_connection,
        suggested_refresh: suggest_refresh(category),
        priority,
    }
}

fn build_response(analyzed: Vec<AnalyzedDataflow>) -> AnalysisResponse {
    let tableau_ready_count = analyzed.iter().filter(|a| a.tableau_ready).count();
    let mut stats = serde_json::Map::new();
    for category in Category::ALL {
        let count = analyzed.iter().filter(|a| a.category == category).count();
        stats.insert(category.as_str().to_string(), json!(count));
    }
    stats.insert("tableau_ready".to_string(), json!(tableau_ready_count));
    AnalysisResponse {
        total_analyzed: analyzed.len(),
        tableau_ready_count,
        category_stats: serde_json::Value::Object(stats),
        dataflows: analyzed,
        timestamp: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, category: Category, keywords: &[&str], priority: i64) -> CategorizationRule {
        CategorizationRule {
            rule_id: id.to_string(),
            category,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            priority,
            is_active: true,
            description: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn flow(id: &str, display_name: &str, description: &str) -> Dataflow {
        Dataflow {
            id: id.to_string(),
            name_it: None,
            name_en: None,
            display_name: display_name.to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn first_matching_rule_by_priority_wins() {
        // priority desc, tie broken by rule_id, as the store orders them
        let rules = vec![
            rule("eco", Category::Economia, &["pil", "economia"], 20),
            rule("pop", Category::Popolazione, &["popolazione"], 10),
        ];
        let df = flow("DF1", "Popolazione e economia", "");
        let (category, score, matched) = categorize(&df, &rules);
        assert_eq!(category, Category::Economia);
        assert_eq!(matched, vec!["economia"]);
        assert_eq!(score, "economia".len() as i64);
    }

    #[test]
    fn score_sums_matched_keyword_lengths() {
        let rules = vec![rule("pop", Category::Popolazione, &["popolazione", "residente"], 10)];
        let df = flow("DF1", "Popolazione residente", "dettaglio comunale");
        let (category, score, matched) = categorize(&df, &rules);
        assert_eq!(category, Category::Popolazione);
        assert_eq!(matched.len(), 2);
        assert_eq!(score, ("popolazione".len() + "residente".len()) as i64);
    }

    #[test]
    fn match_is_case_insensitive_and_spans_description() {
        let rules = vec![rule("sal", Category::Salute, &["ospedali"], 5)];
        let df = flow("DF1", "Strutture sanitarie", "Numero di OSPEDALI per regione");
        let (category, ..) = categorize(&df, &rules);
        assert_eq!(category, Category::Salute);
    }

    #[test]
    fn no_match_defaults_to_altri() {
        let rules = vec![rule("pop", Category::Popolazione, &["popolazione"], 10)];
        let df = flow("DF1", "Esportazioni di vino", "");
        let (category, score, matched) = categorize(&df, &rules);
        assert_eq!(category, Category::Altri);
        assert_eq!(score, 0);
        assert!(matched.is_empty());
    }

    #[test]
    fn inactive_rules_are_ignored() {
        let mut inactive = rule("pop", Category::Popolazione, &["popolazione"], 10);
        inactive.is_active = false;
        let df = flow("DF1", "Popolazione", "");
        let (category, ..) = categorize(&df, &[inactive]);
        assert_eq!(category, Category::Altri);
    }

    #[test]
    fn connection_size_thresholds() {
        assert_eq!(suggest_connection(0), ConnectionType::DirectConnection);
        assert_eq!(suggest_connection(5 * 1024 * 1024), ConnectionType::DirectConnection);
        assert_eq!(
            suggest_connection(5 * 1024 * 1024 + 1),
            ConnectionType::GoogleSheetsImport
        );
        assert_eq!(suggest_connection(50 * 1024 * 1024), ConnectionType::GoogleSheetsImport);
        assert_eq!(suggest_connection(51 * 1024 * 1024), ConnectionType::BigqueryExtract);
    }

    #[test]
    fn refresh_frequency_map() {
        assert_eq!(suggest_refresh(Category::Popolazione), RefreshFrequency::Monthly);
        assert_eq!(suggest_refresh(Category::Lavoro), RefreshFrequency::Monthly);
        assert_eq!(suggest_refresh(Category::Economia), RefreshFrequency::Quarterly);
        assert_eq!(suggest_refresh(Category::Salute), RefreshFrequency::Quarterly);
        assert_eq!(suggest_refresh(Category::Territorio), RefreshFrequency::Yearly);
        assert_eq!(suggest_refresh(Category::Istruzione), RefreshFrequency::Yearly);
        assert_eq!(suggest_refresh(Category::Altri), RefreshFrequency::Quarterly);
    }

    #[test]
    fn priority_bonuses_are_capped() {
        let probe = DataflowProbe {
            dataflow_id: "DF1".to_string(),
            data_access_success: true,
            status_code: Some(200),
            size_bytes: 500 * 1024 * 1024, // 500 MB, bonus capped at 5
            observations_count: 100_000,   // bonus capped at 5
            parse_error: false,
            error_message: None,
        };
        assert_eq!(compute_priority(10, Some(&probe)), 20.0);
        assert_eq!(compute_priority(10, None), 10.0);
    }

    #[test]
    fn tableau_ready_requires_access_and_clean_parse() {
        let ok = DataflowProbe {
            dataflow_id: "DF1".to_string(),
            data_access_success: true,
            status_code: Some(200),
            size_bytes: 1024,
            observations_count: 10,
            parse_error: false,
            error_message: None,
        };
        let result = build_result(flow("DF1", "x", ""), Category::Altri, 0, Some(ok.clone()));
        assert!(result.tableau_ready);

        let mut bad_parse = ok.clone();
        bad_parse.parse_error = true;
        let result = build_result(flow("DF1", "x", ""), Category::Altri, 0, Some(bad_parse));
        assert!(!result.tableau_ready);

        let mut no_access = ok;
        no_access.data_access_success = false;
        let result = build_result(flow("DF1", "x", ""), Category::Altri, 0, Some(no_access));
        assert!(!result.tableau_ready);

        // no probe at all
        let result = build_result(flow("DF1", "x", ""), Category::Altri, 0, None);
        assert!(!result.tableau_ready);
    }

    #[test]
    fn response_stats_cover_all_categories() {
        let analyzed = vec![
            build_result(flow("A", "x", ""), Category::Popolazione, 5, None),
            build_result(flow("B", "y", ""), Category::Popolazione, 3, None),
            build_result(flow("C", "z", ""), Category::Altri, 0, None),
        ];
        let response = build_response(analyzed);
        assert_eq!(response.total_analyzed, 3);
        assert_eq!(response.category_stats["popolazione"], 2);
        assert_eq!(response.category_stats["altri"], 1);
        assert_eq!(response.category_stats["economia"], 0);
        assert_eq!(response.category_stats["tableau_ready"], 0);
    }

    #[tokio::test]
    async fn bulk_ids_limit_is_enforced() {
        let db = Arc::new(MetadataDb::open_in_memory().unwrap());
        let service =
            AnalysisService::new(db, "http://localhost:9", AnalysisConfig::default()).unwrap();
        let too_many: Vec<String> = (0..51).map(|i| format!("DF{i}")).collect();
        let err = service.analyze_ids(&too_many, AnalysisOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        let err = service.analyze_ids(&[], AnalysisOptions::default()).await.unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn bulk_without_tests_categorizes_offline() {
        let db = Arc::new(MetadataDb::open_in_memory().unwrap());
        db.create_rule(
            "pop",
            Category::Popolazione,
            &["popres".to_string()],
            10,
            true,
            None,
            &crate::models::audit::AuditEvent::ok("rule_create", "rule", None),
        )
        .unwrap();
        let service =
            AnalysisService::new(db, "http://localhost:9", AnalysisConfig::default()).unwrap();
        let response = service
            .analyze_ids(
                &["DCIS_POPRES1".to_string(), "DCCN_PILN".to_string()],
                AnalysisOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.total_analyzed, 2);
        // id text matches the popres keyword case-insensitively
        let popres =
            response.dataflows.iter().find(|d| d.dataflow.id == "DCIS_POPRES1").unwrap();
        assert_eq!(popres.category, Category::Popolazione);
    }
}
