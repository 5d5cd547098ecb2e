use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::analytics_db::AnalyticsDb;
use crate::error::{ApiError, ApiResult};
use crate::metadata_db::MetadataDb;
use crate::models::audit::AuditEvent;
use crate::models::dataset::{
    AnalyticsStats, Dataset, DatasetComplete, PreferenceValue, validate_dataset_id,
};
use crate::models::observation::{DatasetStatsByIdRow, Observation};
use crate::query_builder::{FilterOp, QueryBuilder};
use crate::query_cache::QueryCache;

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

type PrefKey = (String, String);

/// Facade over the metadata and analytics stores. Cross-store writes follow
/// the two-store consistency rule: metadata first, analytics second, with a
/// compensating metadata delete when the analytics step fails.
pub struct UnifiedRepository {
    metadata: Arc<MetadataDb>,
    analytics: AnalyticsDb,
    cache: Arc<QueryCache>,
    pref_cache: Mutex<HashMap<PrefKey, (PreferenceValue, Instant)>>,
}

impl UnifiedRepository {
    pub fn new(metadata: Arc<MetadataDb>, analytics: AnalyticsDb, cache: Arc<QueryCache>) -> Self {
        Self { metadata, analytics, cache, pref_cache: Mutex::new(HashMap::new()) }
    }

    pub fn metadata(&self) -> &MetadataDb {
        &self.metadata
    }

    pub fn analytics(&self) -> &AnalyticsDb {
        &self.analytics
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    // ── Dataset registration & views ──

    /// Register a dataset across both stores. Returns Ok only when the
    /// metadata insert and the analytics schema check both succeeded; an
    /// analytics failure rolls the metadata row back.
    pub async fn register_dataset_complete(
        &self,
        dataset_id: &str,
        name: &str,
        category: &str,
        description: &str,
        agency: &str,
        priority: i64,
        metadata: Option<serde_json::Value>,
        user_id: Option<&str>,
    ) -> ApiResult<DatasetComplete> {
        validate_dataset_id(dataset_id)?;
        if !(1..=10).contains(&priority) {
            return Err(ApiError::validation("priority must be between 1 and 10"));
        }
        let metadata = metadata.unwrap_or_else(|| json!({}));

        let mut audit =
            AuditEvent::ok("dataset_register", "dataset", Some(dataset_id.to_string()));
        if let Some(user) = user_id {
            audit = audit.user(user);
        }
        self.metadata.insert_dataset(
            dataset_id,
            name,
            category,
            description,
            agency,
            priority,
            &metadata,
            &audit,
        )?;

        if let Err(err) = self.analytics.ensure_schema().await {
            let rollback_audit = AuditEvent::failed(
                "dataset_register",
                "dataset",
                Some(dataset_id.to_string()),
                &format!("analytics schema unavailable, rolled back: {err}"),
            );
            self.metadata.delete_dataset(dataset_id, &rollback_audit)?;
            return Err(err);
        }

        let dataset = self
            .metadata
            .get_dataset(dataset_id)?
            .ok_or_else(|| ApiError::internal("dataset vanished after insert"))?;
        Ok(DatasetComplete {
            dataset,
            has_analytics_data: false,
            analytics_stats: AnalyticsStats::default(),
        })
    }

    /// Metadata joined with analytics stats; `None` when the dataset is
    /// unknown. A failing analytics store degrades to empty stats rather
    /// than failing the read.
    pub async fn get_dataset_complete(&self, dataset_id: &str) -> ApiResult<Option<DatasetComplete>> {
        let Some(dataset) = self.metadata.get_dataset(dataset_id)? else {
            return Ok(None);
        };
        let stats = match self.analytics.dataset_stats(dataset_id).await {
            Ok(row) => AnalyticsStats {
                record_count: row.record_count,
                min_year: row.min_year,
                max_year: row.max_year,
                territory_count: row.territory_count,
                measure_count: row.measure_count,
            },
            Err(err) => {
                tracing::warn!("analytics stats unavailable for {dataset_id}: {err}");
                AnalyticsStats::default()
            }
        };
        Ok(Some(DatasetComplete {
            dataset,
            has_analytics_data: stats.record_count > 0,
            analytics_stats: stats,
        }))
    }

    /// List datasets, annotated with analytics stats. `with_analytics`
    /// filters on `record_count > 0`; datasets whose stats cannot be read
    /// count as having no analytics data.
    pub async fn list_datasets_complete(
        &self,
        category: Option<&str>,
        with_analytics: Option<bool>,
    ) -> ApiResult<Vec<DatasetComplete>> {
        let datasets = self.metadata.list_datasets(category)?;
        let stats_map = match self.fetch_all_stats().await {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!("analytics stats unavailable for listing: {err}");
                HashMap::new()
            }
        };
        Ok(annotate_and_filter(datasets, &stats_map, with_analytics))
    }

    async fn fetch_all_stats(&self) -> ApiResult<HashMap<String, AnalyticsStats>> {
        let rows = self
            .analytics
            .fetch::<DatasetStatsByIdRow>(
                "SELECT dataset_id, count() AS record_count, \
                 toNullable(min(year)) AS min_year, toNullable(max(year)) AS max_year, \
                 uniqExact(territory_code) AS territory_count, \
                 uniqExact(measure_code) AS measure_count \
                 FROM istat.istat_observations FINAL GROUP BY dataset_id",
                &[],
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.dataset_id,
                    AnalyticsStats {
                        record_count: r.record_count,
                        min_year: r.min_year,
                        max_year: r.max_year,
                        territory_count: r.territory_count,
                        measure_count: r.measure_count,
                    },
                )
            })
            .collect())
    }

    // ── User preferences ──

    /// Write-through set with a per-entry in-process cache TTL.
    pub fn set_user_preference(
        &self,
        user_id: &str,
        key: &str,
        value: PreferenceValue,
        cache_minutes: u64,
    ) -> ApiResult<()> {
        self.metadata.set_preference(user_id, key, &value)?;
        let deadline = Instant::now() + Duration::from_secs(cache_minutes.max(1) * 60);
        self.pref_cache
            .lock()
            .unwrap()
            .insert((user_id.to_string(), key.to_string()), (value, deadline));
        Ok(())
    }

    pub fn get_user_preference(&self, user_id: &str, key: &str) -> ApiResult<Option<PreferenceValue>> {
        let cache_key = (user_id.to_string(), key.to_string());
        {
            let mut cache = self.pref_cache.lock().unwrap();
            match cache.get(&cache_key) {
                Some((value, deadline)) if *deadline > Instant::now() => {
                    return Ok(Some(value.clone()));
                }
                Some(_) => {
                    cache.remove(&cache_key);
                }
                None => {}
            }
        }
        self.metadata.get_preference(user_id, key)
    }

    // ── Analytics queries ──

    /// Run a builder-produced query against the analytics store, audited
    /// with its execution time; failures are always logged with the error
    /// text.
    pub async fn execute_analytics_query<T>(
        &self,
        builder: &QueryBuilder,
        user_id: Option<&str>,
        use_cache: bool,
    ) -> ApiResult<Vec<serde_json::Value>>
    where
        T: clickhouse::Row + DeserializeOwned + Serialize,
    {
        let started = Instant::now();
        let (sql, _) = builder.build_sql()?;
        let result = builder.execute::<T>(&self.analytics, &self.cache, use_cache).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let mut audit = match &result {
            Ok(rows) => AuditEvent::ok("analytics_query", "analytics", None)
                .detail(format!("rows={} sql={sql}", rows.len())),
            Err(err) => {
                tracing::error!("analytics query failed: {err} (sql={sql})");
                AuditEvent::failed("analytics_query", "analytics", None, &err.to_string())
            }
        }
        .timed(elapsed_ms);
        if let Some(user) = user_id {
            audit = audit.user(user);
        }
        if let Err(audit_err) = self.metadata.insert_audit(&audit) {
            tracing::warn!("failed to audit analytics query: {audit_err}");
        }
        result
    }

    /// Ordered observation rows for a dataset with AND-composed filters.
    /// Unknown datasets yield an empty series. The row cap is applied in the
    /// query itself so oversized series never cross the wire.
    pub async fn get_dataset_time_series(
        &self,
        dataset_id: &str,
        territory_code: Option<&str>,
        measure_code: Option<&str>,
        start_year: Option<i32>,
        end_year: Option<i32>,
        limit: u64,
    ) -> ApiResult<Vec<Observation>> {
        let mut builder = QueryBuilder::new().select_time_series(dataset_id).limit(limit);
        if let Some(territory) = territory_code {
            builder = builder.filter("territory_code", FilterOp::Eq, territory);
        }
        if let Some(measure) = measure_code {
            builder = builder.filter("measure_code", FilterOp::Eq, measure);
        }
        match (start_year, end_year) {
            (Some(a), Some(b)) => builder = builder.year_range(a, b),
            (Some(a), None) => builder = builder.filter("year", FilterOp::Gte, a),
            (None, Some(b)) => builder = builder.filter("year", FilterOp::Lte, b),
            (None, None) => {}
        }
        builder.fetch_typed::<Observation>(&self.analytics).await
    }

    // ── Sync path (ingestion client) ──

    /// Write observations then update metadata counters. Not atomic across
    /// stores; the audit entry reports the records written either way.
    pub async fn sync_observations(
        &self,
        dataset_id: &str,
        name: Option<&str>,
        category: Option<&str>,
        observations: &[Observation],
    ) -> ApiResult<()> {
        self.analytics.ensure_schema().await?;
        let written = self.analytics.insert_observations(observations).await?;
        if name.is_some() || category.is_some() {
            self.analytics
                .upsert_dataset_row(
                    dataset_id,
                    name.unwrap_or(dataset_id),
                    category.unwrap_or("altri"),
                )
                .await?;
        }

        let audit = AuditEvent::ok("dataset_sync", "dataset", Some(dataset_id.to_string()))
            .detail(format!("records_synced={written}"));
        self.metadata.update_sync_stats(dataset_id, written as i64, &audit)?;

        // cached reads may now be stale
        self.cache.clear();
        Ok(())
    }

    // ── Status & maintenance ──

    /// Per-component status; store failures are captured into the payload,
    /// never raised.
    pub async fn get_system_status(&self) -> serde_json::Value {
        let metadata = match self.metadata.stats() {
            Ok(stats) => json!({ "status": "ok", "stats": stats }),
            Err(err) => json!({ "status": "error", "detail": err.to_string() }),
        };
        let analytics = match self.analytics.ping().await {
            Ok(()) => match self.analytics.stats().await {
                Ok(stats) => json!({ "status": "ok", "stats": stats }),
                Err(err) => json!({ "status": "degraded", "detail": err.to_string() }),
            },
            Err(err) => json!({ "status": "error", "detail": err.to_string() }),
        };
        json!({
            "metadata": metadata,
            "analytics": analytics,
            "cache": self.cache.stats(),
            "timestamp": now_ts(),
        })
    }

    /// Periodic cleanup: expired cache entries, rate windows, revocations.
    pub fn run_maintenance(&self) {
        let now = chrono::Utc::now().timestamp();
        let swept = self.cache.sweep();
        let windows = self.metadata.cleanup_expired_windows(now).unwrap_or(0);
        let tokens = self.metadata.cleanup_expired_tokens(now).unwrap_or(0);
        if swept + windows + tokens > 0 {
            tracing::debug!(
                "maintenance: {swept} cache entries, {windows} rate windows, {tokens} revocations"
            );
        }
    }
}

/// Join datasets with their stats and apply the `with_analytics` filter.
fn annotate_and_filter(
    datasets: Vec<Dataset>,
    stats_map: &HashMap<String, AnalyticsStats>,
    with_analytics: Option<bool>,
) -> Vec<DatasetComplete> {
    datasets
        .into_iter()
        .map(|dataset| {
            let stats = stats_map.get(&dataset.dataset_id).cloned().unwrap_or_default();
            DatasetComplete {
                has_analytics_data: stats.record_count > 0,
                analytics_stats: stats,
                dataset,
            }
        })
        .filter(|complete| match with_analytics {
            Some(true) => complete.has_analytics_data,
            Some(false) => !complete.has_analytics_data,
            None => true,
        })
        .collect()
}
