use clickhouse::Client;
use serde::de::DeserializeOwned;

use crate::error::{ApiError, ApiResult};
use crate::models::observation::{CountRow, DatasetStatsRow, Observation};
use crate::query_builder::SqlValue;

/// Sent on a client whose session database is `default`: a fresh instance
/// rejects any query carrying a not-yet-existing session database, so this
/// cannot run through the `istat`-scoped client.
const CREATE_DATABASE: &str = "CREATE DATABASE IF NOT EXISTS istat";

/// Ordered DDL for the `istat` analytics schema. Every statement is
/// idempotent (`IF NOT EXISTS`) so safe to run on every startup.
///
/// `istat_observations` uses ReplacingMergeTree ordered by the observation
/// natural key, which is what makes `sync_to_repository` an idempotent
/// upsert: re-inserting the same key collapses to one row at merge time and
/// queries read through `FINAL`.
const MIGRATIONS: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS istat.istat_observations
(
    dataset_id     LowCardinality(String),
    year           Int32,
    time_period    String,
    territory_code LowCardinality(String),
    territory_name String,
    measure_code   LowCardinality(String),
    measure_name   String,
    obs_value      Nullable(Float64),
    obs_status     LowCardinality(String),
    inserted_at    DateTime DEFAULT now()
)
ENGINE = ReplacingMergeTree(inserted_at)
ORDER BY (dataset_id, time_period, territory_code, measure_code)
SETTINGS index_granularity = 8192",
    r"CREATE TABLE IF NOT EXISTS istat.istat_datasets
(
    dataset_id   LowCardinality(String),
    name         String,
    category     LowCardinality(String),
    updated_at   DateTime DEFAULT now()
)
ENGINE = ReplacingMergeTree(updated_at)
ORDER BY dataset_id
SETTINGS index_granularity = 8192",
];

/// Columnar store handle. The underlying HTTP connection is lazy: nothing is
/// contacted until the first query, and every failure surfaces as
/// `AnalyticsUnavailable`.
#[derive(Clone)]
pub struct AnalyticsDb {
    client: Client,
}

impl AnalyticsDb {
    pub fn new(url: &str, database: &str, user: &str, password: &str) -> Self {
        let client = Client::default()
            .with_url(url)
            .with_database(database)
            .with_user(user)
            .with_password(password);
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Run the istat schema DDL. The `CREATE DATABASE` bootstrap goes
    /// through a `default`-scoped clone of the client so it succeeds on a
    /// fresh instance; the table DDL then runs on the `istat` client.
    pub async fn ensure_schema(&self) -> ApiResult<()> {
        let bootstrap = self.client.clone().with_database("default");
        bootstrap.query(CREATE_DATABASE).execute().await.map_err(|e| {
            tracing::error!("analytics database bootstrap failed: {e}");
            ApiError::AnalyticsUnavailable(e.to_string())
        })?;
        for (i, sql) in MIGRATIONS.iter().enumerate() {
            let preview: String = sql.chars().take(60).collect();
            tracing::debug!("analytics migration {}/{}: {preview}...", i + 1, MIGRATIONS.len());
            self.client.query(sql).execute().await.map_err(|e| {
                tracing::error!("analytics migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
                ApiError::AnalyticsUnavailable(e.to_string())
            })?;
        }
        Ok(())
    }

    /// Cheap connectivity probe for health checks.
    pub async fn ping(&self) -> ApiResult<()> {
        self.client
            .query("SELECT count() AS count FROM system.one")
            .fetch_one::<CountRow>()
            .await
            .map(|_| ())
            .map_err(|e| ApiError::AnalyticsUnavailable(e.to_string()))
    }

    /// Execute a parameterized query and fetch typed rows. The SQL must come
    /// from the query builder (identifiers whitelisted, literals as `?`
    /// placeholders).
    pub async fn fetch<T>(&self, sql: &str, params: &[SqlValue]) -> ApiResult<Vec<T>>
    where
        T: clickhouse::Row + DeserializeOwned,
    {
        let mut query = self.client.query(sql);
        for param in params {
            query = match param {
                SqlValue::Str(s) => query.bind(s.as_str()),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(*b),
            };
        }
        query.fetch_all::<T>().await.map_err(ApiError::from)
    }

    /// Same as `fetch` but expects exactly one row.
    pub async fn fetch_one<T>(&self, sql: &str, params: &[SqlValue]) -> ApiResult<T>
    where
        T: clickhouse::Row + DeserializeOwned,
    {
        let mut query = self.client.query(sql);
        for param in params {
            query = match param {
                SqlValue::Str(s) => query.bind(s.as_str()),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(*b),
            };
        }
        query.fetch_one::<T>().await.map_err(ApiError::from)
    }

    /// Batch-insert observation rows. Callers dedupe by natural key first;
    /// the ReplacingMergeTree absorbs re-syncs of identical keys.
    pub async fn insert_observations(&self, rows: &[Observation]) -> ApiResult<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut insert = self
            .client
            .insert("istat.istat_observations")
            .map_err(|e| ApiError::AnalyticsUnavailable(e.to_string()))?;
        for row in rows {
            insert.write(row).await.map_err(|e| ApiError::AnalyticsUnavailable(e.to_string()))?;
        }
        insert.end().await.map_err(|e| ApiError::AnalyticsUnavailable(e.to_string()))?;
        Ok(rows.len())
    }

    /// Mirror dataset identity into the analytics store (used by sync).
    pub async fn upsert_dataset_row(
        &self,
        dataset_id: &str,
        name: &str,
        category: &str,
    ) -> ApiResult<()> {
        self.client
            .query("INSERT INTO istat.istat_datasets (dataset_id, name, category) VALUES (?, ?, ?)")
            .bind(dataset_id)
            .bind(name)
            .bind(category)
            .execute()
            .await
            .map_err(|e| ApiError::AnalyticsUnavailable(e.to_string()))
    }

    /// Aggregate stats for one dataset; `record_count = 0` means no
    /// analytics data yet.
    pub async fn dataset_stats(&self, dataset_id: &str) -> ApiResult<DatasetStatsRow> {
        self.fetch_one::<DatasetStatsRow>(
            "SELECT count() AS record_count, \
             toNullable(min(year)) AS min_year, \
             toNullable(max(year)) AS max_year, \
             uniqExact(territory_code) AS territory_count, \
             uniqExact(measure_code) AS measure_count \
             FROM istat.istat_observations FINAL WHERE dataset_id = ?",
            &[SqlValue::Str(dataset_id.to_string())],
        )
        .await
    }

    /// Store-level stats for the system status payload.
    pub async fn stats(&self) -> ApiResult<serde_json::Value> {
        let total = self
            .fetch_one::<CountRow>(
                "SELECT count() AS count FROM istat.istat_observations FINAL",
                &[],
            )
            .await?;
        let datasets = self
            .fetch_one::<CountRow>(
                "SELECT uniqExact(dataset_id) AS count FROM istat.istat_observations",
                &[],
            )
            .await?;
        Ok(serde_json::json!({
            "observations": total.count,
            "datasets_with_data": datasets.count,
        }))
    }
}
