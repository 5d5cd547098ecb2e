use axum::Json;
use axum::extract::{Extension, Multipart, Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::analysis::AnalysisOptions;
use crate::error::{ApiError, ApiResult};
use crate::models::audit::AuditEvent;
use crate::models::auth::AuthContext;
use crate::models::dataflow::{AnalysisResponse, AnalyzeDataflowRequest, BulkAnalyzeRequest};
use crate::models::rule::{CreateRuleRequest, UpdateRuleRequest, normalize_rule_input};

/// POST /api/analysis/dataflow — analyze an SDMX dataflows document passed
/// in the request body.
pub async fn analyze_dataflow(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeDataflowRequest>,
) -> ApiResult<Json<AnalysisResponse>> {
    if request.xml_content.trim().is_empty() {
        return Err(ApiError::validation("xml_content must not be empty"));
    }
    let options = AnalysisOptions {
        include_tests: request.include_tests,
        min_relevance_score: request.min_relevance_score,
        only_tableau_ready: request.only_tableau_ready,
        max_concurrent: request.max_concurrent,
    };
    let response = state.analysis.analyze_xml(&request.xml_content, options).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    #[serde(default)]
    pub include_tests: bool,
    #[serde(default)]
    pub min_relevance_score: i64,
    #[serde(default)]
    pub only_tableau_ready: bool,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

/// POST /api/analysis/dataflow/upload — multipart upload of an SDMX XML
/// file, size-capped before parsing.
pub async fn upload_and_analyze(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> ApiResult<Json<AnalysisResponse>> {
    let max_bytes = state.config.analysis.max_xml_size_bytes;
    let mut xml: Option<String> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("file") {
            let data = field
                .bytes()
                .await
                .map_err(|e| ApiError::validation(format!("failed to read upload: {e}")))?;
            if data.len() > max_bytes {
                return Err(ApiError::validation(format!(
                    "uploaded file of {} bytes exceeds the {max_bytes} byte limit",
                    data.len()
                )));
            }
            xml = Some(
                String::from_utf8(data.to_vec())
                    .map_err(|_| ApiError::validation("uploaded file is not valid UTF-8"))?,
            );
        }
    }
    let xml = xml.ok_or_else(|| ApiError::validation("multipart field 'file' is required"))?;

    let options = AnalysisOptions {
        include_tests: query.include_tests,
        min_relevance_score: query.min_relevance_score,
        only_tableau_ready: query.only_tableau_ready,
        max_concurrent: query.max_concurrent,
    };
    let response = state.analysis.analyze_xml(&xml, options).await?;
    Ok(Json(response))
}

/// POST /api/analysis/dataflow/bulk — analyze up to 50 dataflows by id with
/// bounded-concurrency access probes.
pub async fn bulk_analyze(
    State(state): State<AppState>,
    Json(request): Json<BulkAnalyzeRequest>,
) -> ApiResult<Json<AnalysisResponse>> {
    let options = AnalysisOptions {
        include_tests: request.include_tests,
        max_concurrent: request.max_concurrent,
        ..Default::default()
    };
    let response = state.analysis.analyze_ids(&request.dataflow_ids, options).await?;
    Ok(Json(response))
}

// ── Categorization rules CRUD ──

#[derive(Debug, Deserialize)]
pub struct ListRulesQuery {
    #[serde(default)]
    pub include_inactive: bool,
}

/// GET /api/analysis/rules
pub async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<ListRulesQuery>,
) -> ApiResult<Json<Value>> {
    let rules = state.repo.metadata().list_rules(!query.include_inactive)?;
    let total = rules.len();
    Ok(Json(json!({ "rules": rules, "total_count": total })))
}

/// POST /api/analysis/rules
pub async fn create_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Json(request): Json<CreateRuleRequest>,
) -> ApiResult<Json<Value>> {
    if request.rule_id.trim().is_empty() {
        return Err(ApiError::validation("rule_id must not be empty"));
    }
    let keywords = normalize_rule_input(&request.keywords, request.priority)?;
    let audit = AuditEvent::ok("rule_create", "categorization_rule", Some(request.rule_id.clone()))
        .user(format!("key:{}", ctx.api_key_id));
    state.repo.metadata().create_rule(
        &request.rule_id,
        request.category,
        &keywords,
        request.priority,
        request.is_active,
        request.description.as_deref(),
        &audit,
    )?;
    let rule = state
        .repo
        .metadata()
        .get_rule(&request.rule_id)?
        .ok_or_else(|| ApiError::internal("rule vanished after create"))?;
    Ok(Json(json!({ "rule": rule })))
}

/// PUT /api/analysis/rules/{rule_id} — `rule_id` itself is immutable.
pub async fn update_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(rule_id): Path<String>,
    Json(request): Json<UpdateRuleRequest>,
) -> ApiResult<Json<Value>> {
    let keywords = normalize_rule_input(&request.keywords, request.priority)?;
    let audit = AuditEvent::ok("rule_update", "categorization_rule", Some(rule_id.clone()))
        .user(format!("key:{}", ctx.api_key_id));
    let updated = state.repo.metadata().update_rule(
        &rule_id,
        request.category,
        &keywords,
        request.priority,
        request.is_active,
        request.description.as_deref(),
        &audit,
    )?;
    if !updated {
        return Err(ApiError::not_found(format!("rule {rule_id} not found")));
    }
    let rule = state
        .repo
        .metadata()
        .get_rule(&rule_id)?
        .ok_or_else(|| ApiError::internal("rule vanished after update"))?;
    Ok(Json(json!({ "rule": rule })))
}

/// DELETE /api/analysis/rules/{rule_id} — hard delete.
pub async fn delete_rule(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(rule_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let audit = AuditEvent::ok("rule_delete", "categorization_rule", Some(rule_id.clone()))
        .user(format!("key:{}", ctx.api_key_id));
    let deleted = state.repo.metadata().delete_rule(&rule_id, &audit)?;
    if !deleted {
        return Err(ApiError::not_found(format!("rule {rule_id} not found")));
    }
    Ok(Json(json!({ "deleted": rule_id })))
}
