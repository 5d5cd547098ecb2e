use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::ApiResult;

/// GET /analytics/usage — audit-derived usage aggregates plus cache and
/// ingestion counters. Admin only.
pub async fn usage_analytics(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let usage = state.repo.metadata().usage_stats()?;
    Ok(Json(json!({
        "usage": usage,
        "cache": state.repo.cache().stats(),
        "istat_client": state.istat.get_status(),
    })))
}
