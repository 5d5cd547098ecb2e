use axum::Json;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use serde_json::{Value, json};
use std::collections::HashMap;

use crate::AppState;
use crate::error::{ApiError, ApiResult};
use crate::models::observation::{MeasureRow, Observation, TerritoryRow};
use crate::odata::{
    self, ODataQuery, OBSERVATION_FIELDS, apply_filter_to_builder, apply_in_memory,
    apply_orderby_to_builder, extract_dataset_id, parse_query,
};
use crate::query_builder::observations;

const DEFAULT_TOP: u64 = 100;
const MAX_TOP: u64 = 1000;

fn base_url(headers: &HeaderMap) -> String {
    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost:8000");
    format!("http://{host}/odata")
}

fn envelope(base: &str, entity_set: &str, rows: Vec<Value>, count: Option<u64>) -> Value {
    let mut body = json!({
        "@odata.context": format!("{base}/$metadata#{entity_set}"),
        "value": rows,
    });
    if let Some(total) = count {
        body["@odata.count"] = json!(total);
    }
    body
}

/// GET /odata/ — service document.
pub async fn service_document(headers: HeaderMap) -> Json<Value> {
    Json(odata::service_document(&base_url(&headers)))
}

/// GET /odata/$metadata — CSDL document (XML).
pub async fn metadata_document() -> impl IntoResponse {
    ([(CONTENT_TYPE, "application/xml; charset=utf-8")], odata::csdl_metadata())
}

/// GET /odata/Datasets — metadata-backed entity set, evaluated in memory.
pub async fn datasets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let query = parse_query(&params)?;
    let records: Vec<Value> = state
        .repo
        .list_datasets_complete(None, None)
        .await?
        .into_iter()
        .map(|c| {
            json!({
                "DatasetId": c.dataset.dataset_id,
                "Name": c.dataset.name,
                "Category": c.dataset.category,
                "Description": c.dataset.description,
                "Agency": c.dataset.agency,
                "Priority": c.dataset.priority,
                "Status": c.dataset.status,
                "HasAnalyticsData": c.has_analytics_data,
                "RecordCount": c.analytics_stats.record_count,
            })
        })
        .collect();

    let (rows, total) = apply_in_memory(records, &query);
    let count = query.count.then_some(total);
    Ok(Json(envelope(&base_url(&headers), "Datasets", rows, count)))
}

/// GET /odata/Observations — translated onto the columnar store. The filter
/// must pin a dataset (`DatasetId eq '…'`).
pub async fn observation_set(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let query = parse_query(&params)?;
    if extract_dataset_id(&query.filter).is_none() {
        return Err(ApiError::validation_with(
            "Filter by DatasetId is required for Observations queries",
            json!({
                "expected_format": "$filter=DatasetId eq '<dataset_id>'",
                "examples": ["$filter=DatasetId eq 'DCIS_POPRES1'"],
            }),
        ));
    }

    let mut builder = observations().select(&[
        "dataset_id",
        "year",
        "time_period",
        "territory_code",
        "territory_name",
        "measure_code",
        "measure_name",
        "obs_value",
        "obs_status",
    ]);
    builder = apply_filter_to_builder(builder, &query.filter, OBSERVATION_FIELDS)?;

    let count = if query.count {
        Some(builder.count(state.repo.analytics()).await?)
    } else {
        None
    };

    builder = apply_orderby_to_builder(builder, &query.orderby, OBSERVATION_FIELDS)?;
    if query.orderby.is_none() {
        builder = builder.order_by("time_period", false);
    }
    let top = query.top.unwrap_or(DEFAULT_TOP).min(MAX_TOP);
    builder = builder.limit(top);
    if let Some(skip) = query.skip {
        builder = builder.offset(skip);
    }

    let rows: Vec<Value> = builder
        .fetch_typed::<Observation>(state.repo.analytics())
        .await?
        .into_iter()
        .map(|o| {
            json!({
                "DatasetId": o.dataset_id,
                "Year": o.year,
                "TimePeriod": o.time_period,
                "TerritoryCode": o.territory_code,
                "TerritoryName": o.territory_name,
                "MeasureCode": o.measure_code,
                "MeasureName": o.measure_name,
                "ObsValue": o.obs_value,
                "ObsStatus": o.obs_status,
            })
        })
        .collect();

    // paging and filtering happened in the store; only projection remains
    let projection = ODataQuery { select: query.select.clone(), ..Default::default() };
    let (rows, _) = apply_in_memory(rows, &projection);
    Ok(Json(envelope(&base_url(&headers), "Observations", rows, count)))
}

/// GET /odata/Territories — distinct territories with observation counts.
pub async fn territories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let query = parse_query(&params)?;
    let records: Vec<Value> = observations()
        .select(&["territory_code", "territory_name", "count() AS observation_count"])
        .group_by(&["territory_code", "territory_name"])
        .order_by("territory_code", false)
        .fetch_typed::<TerritoryRow>(state.repo.analytics())
        .await?
        .into_iter()
        .map(|t| {
            json!({
                "TerritoryCode": t.territory_code,
                "TerritoryName": t.territory_name,
                "ObservationCount": t.observation_count,
            })
        })
        .collect();

    let (rows, total) = apply_in_memory(records, &query);
    let count = query.count.then_some(total);
    Ok(Json(envelope(&base_url(&headers), "Territories", rows, count)))
}

/// GET /odata/Measures — distinct measures with observation counts.
pub async fn measures(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<Json<Value>> {
    let query = parse_query(&params)?;
    let records: Vec<Value> = observations()
        .select(&["measure_code", "measure_name", "count() AS observation_count"])
        .group_by(&["measure_code", "measure_name"])
        .order_by("measure_code", false)
        .fetch_typed::<MeasureRow>(state.repo.analytics())
        .await?
        .into_iter()
        .map(|m| {
            json!({
                "MeasureCode": m.measure_code,
                "MeasureName": m.measure_name,
                "ObservationCount": m.observation_count,
            })
        })
        .collect();

    let (rows, total) = apply_in_memory(records, &query);
    let count = query.count.then_some(total);
    Ok(Json(envelope(&base_url(&headers), "Measures", rows, count)))
}
