use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::dataset::validate_dataset_id;
use crate::models::observation::Observation;

const MAX_PAGE_SIZE: u64 = 1000;
const INLINE_DATA_LIMIT: u64 = 100;
const DEFAULT_TIMESERIES_LIMIT: u64 = 1000;
const MAX_TIMESERIES_LIMIT: u64 = 10_000;

#[derive(Debug, Deserialize)]
pub struct ListDatasetsQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u64,
    pub category: Option<String>,
    pub with_analytics: Option<bool>,
}

fn default_page() -> u64 {
    1
}

fn default_page_size() -> u64 {
    50
}

fn validate_pagination(page: u64, page_size: u64) -> ApiResult<()> {
    if page < 1 {
        return Err(ApiError::unprocessable("page must be >= 1"));
    }
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(ApiError::unprocessable(format!(
            "page_size must be between 1 and {MAX_PAGE_SIZE}"
        )));
    }
    Ok(())
}

fn validate_series_limit(limit: u64) -> ApiResult<u64> {
    if !(1..=MAX_TIMESERIES_LIMIT).contains(&limit) {
        return Err(ApiError::unprocessable(format!(
            "limit must be between 1 and {MAX_TIMESERIES_LIMIT}"
        )));
    }
    Ok(limit)
}

/// GET /datasets — paginated dataset listing with analytics annotations.
pub async fn list_datasets(
    State(state): State<AppState>,
    Query(query): Query<ListDatasetsQuery>,
) -> ApiResult<Json<Value>> {
    validate_pagination(query.page, query.page_size)?;
    let datasets = state
        .repo
        .list_datasets_complete(query.category.as_deref(), query.with_analytics)
        .await?;

    let total = datasets.len() as u64;
    let offset = (query.page - 1) * query.page_size;
    let page: Vec<_> = datasets
        .into_iter()
        .skip(offset as usize)
        .take(query.page_size as usize)
        .collect();

    Ok(Json(json!({
        "datasets": page,
        "total_count": total,
        "page": query.page,
        "page_size": query.page_size,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DatasetDetailQuery {
    #[serde(default)]
    pub include_data: bool,
}

/// GET /datasets/{id} — metadata joined with analytics stats, optionally
/// with inline observation rows.
pub async fn get_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<DatasetDetailQuery>,
) -> ApiResult<Json<Value>> {
    validate_dataset_id(&dataset_id)?;
    let Some(complete) = state.repo.get_dataset_complete(&dataset_id).await? else {
        return Err(ApiError::not_found(format!("dataset {dataset_id} not found")));
    };

    let mut body = serde_json::to_value(&complete)?;
    if query.include_data && complete.has_analytics_data {
        let rows: Vec<Observation> = state
            .repo
            .get_dataset_time_series(&dataset_id, None, None, None, None, INLINE_DATA_LIMIT)
            .await?;
        body["data"] = json!({
            "observations": rows,
            "limit": INLINE_DATA_LIMIT,
        });
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct TimeSeriesQuery {
    pub territory_code: Option<String>,
    pub measure_code: Option<String>,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub limit: Option<u64>,
}

/// GET /datasets/{id}/timeseries — AND-composed observation filters;
/// unknown datasets return an empty series. Responses are capped server-side
/// like the OData entity sets.
pub async fn get_timeseries(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(query): Query<TimeSeriesQuery>,
) -> ApiResult<Json<Value>> {
    validate_dataset_id(&dataset_id)?;
    if let (Some(a), Some(b)) = (query.start_year, query.end_year) {
        if a > b {
            return Err(ApiError::unprocessable("start_year must not exceed end_year"));
        }
    }
    let limit = validate_series_limit(query.limit.unwrap_or(DEFAULT_TIMESERIES_LIMIT))?;
    let rows = state
        .repo
        .get_dataset_time_series(
            &dataset_id,
            query.territory_code.as_deref(),
            query.measure_code.as_deref(),
            query.start_year,
            query.end_year,
            limit,
        )
        .await?;
    Ok(Json(json!({
        "dataset_id": dataset_id,
        "count": rows.len(),
        "limit": limit,
        "observations": rows,
    })))
}
