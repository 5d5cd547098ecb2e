use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::auth::AuthContext;
use crate::models::dataset::validate_dataset_id;

const MAX_DATAFLOW_LIMIT: usize = 100;

/// GET /api/istat/status — ingestion client state (breaker, counters, cache).
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "client": state.istat.get_status(),
        "health": state.istat.health_check().await,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DataflowsQuery {
    pub limit: Option<usize>,
}

/// GET /api/istat/dataflows — upstream listing (limit ≤ 100), with
/// last-known-good fallback when ISTAT is unreachable.
pub async fn dataflows(
    State(state): State<AppState>,
    Query(query): Query<DataflowsQuery>,
) -> ApiResult<Json<Value>> {
    if let Some(limit) = query.limit {
        if limit == 0 || limit > MAX_DATAFLOW_LIMIT {
            return Err(ApiError::unprocessable(format!(
                "limit must be between 1 and {MAX_DATAFLOW_LIMIT}"
            )));
        }
    }
    let listing = state.istat.fetch_dataflows(query.limit.or(Some(MAX_DATAFLOW_LIMIT))).await?;
    let total = listing.dataflows.len();
    Ok(Json(json!({
        "dataflows": listing.dataflows,
        "count": total,
        "source": listing.source,
        "fetched_at": listing.fetched_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct FetchDatasetQuery {
    #[serde(default)]
    pub include_data: bool,
    #[serde(default)]
    pub with_quality: bool,
}

/// GET /api/istat/dataset/{id} — fetch one upstream dataset, optionally with
/// observation data and a quality report.
pub async fn dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<FetchDatasetQuery>,
) -> ApiResult<Json<Value>> {
    validate_dataset_id(&dataset_id)?;
    if query.with_quality {
        let (payload, quality) = state.istat.fetch_with_quality_validation(&dataset_id).await?;
        let observations_count = payload.observations.len();
        return Ok(Json(json!({
            "dataset_id": payload.dataset_id,
            "observations_count": observations_count,
            "observations": payload.observations,
            "quality": quality,
        })));
    }
    let payload = state.istat.fetch_dataset(&dataset_id, query.include_data).await?;
    let observations_count = payload.observations.len();
    Ok(Json(json!({
        "dataset_id": payload.dataset_id,
        "name": payload.name,
        "observations_count": observations_count,
        "observations": if query.include_data { json!(payload.observations) } else { json!([]) },
    })))
}

/// POST /api/istat/sync/{id} — pull the dataset from ISTAT and write it
/// through to both stores. Registers the dataset on first sync.
pub async fn sync(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(dataset_id): Path<String>,
) -> ApiResult<Json<Value>> {
    validate_dataset_id(&dataset_id)?;
    let user = format!("key:{}", ctx.api_key_id);

    let payload = state.istat.fetch_dataset(&dataset_id, true).await?;
    if payload.observations.is_empty() {
        return Err(ApiError::UpstreamUnavailable(format!(
            "upstream returned no observations for {dataset_id}"
        )));
    }

    if state.repo.get_dataset_complete(&dataset_id).await?.is_none() {
        let name = payload.name.clone().unwrap_or_else(|| dataset_id.clone());
        state
            .repo
            .register_dataset_complete(
                &dataset_id,
                &name,
                payload.category.as_deref().unwrap_or("altri"),
                "",
                "ISTAT",
                5,
                None,
                Some(&user),
            )
            .await?;
    }

    let result = state.istat.sync_to_repository(&state.repo, &payload).await?;
    Ok(Json(json!({ "sync": result })))
}
