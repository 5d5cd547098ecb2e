use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

use crate::analytics_db::AnalyticsDb;
use crate::error::{ApiError, ApiResult};
use crate::models::observation::CountRow;
use crate::query_cache::QueryCache;

/// A literal bound into a `?` placeholder. Literals never appear in SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl SqlValue {
    /// Stable text form used for cache keys.
    pub fn cache_repr(&self) -> String {
        match self {
            Self::Str(s) => format!("s:{s}"),
            Self::Int(i) => format!("i:{i}"),
            Self::Float(f) => format!("f:{f}"),
            Self::Bool(b) => format!("b:{b}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
}

impl FilterOp {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::ILike => "ILIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

impl JoinType {
    fn as_sql(&self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT JOIN",
            Self::Right => "RIGHT JOIN",
            Self::Full => "FULL JOIN",
            Self::Cross => "CROSS JOIN",
        }
    }
}

// Plain column: `ident`, `alias.ident`, optionally `AS alias`.
static COLUMN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)?( [Aa][Ss] [a-z][a-z0-9_]*)?$").unwrap()
});

// Aggregate/function expression: name(restricted charset), optional alias.
// The argument charset admits nested calls but no quoting or statement
// separators, so nothing user-controlled can smuggle SQL through.
static FUNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*\((\*|[A-Za-z0-9_.,()* ]*)\)( [Aa][Ss] [a-z][a-z0-9_]*)?$")
        .unwrap()
});

// Table reference: `ident` or `schema.ident`, optional short alias.
static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)?( [a-z][a-z0-9_]*)?$").unwrap()
});

fn valid_column(token: &str) -> bool {
    COLUMN_RE.is_match(token) || FUNC_RE.is_match(token)
}

const OBSERVATIONS_TABLE: &str = "istat.istat_observations";

/// Fluent SQL composition against the columnar store. Identifiers are
/// validated on entry; the first invalid token poisons the builder and
/// `build_sql` reports it, so a malformed query never reaches the store.
#[derive(Debug, Default, Clone)]
pub struct QueryBuilder {
    select_columns: Vec<String>,
    from_table: Option<String>,
    final_modifier: bool,
    joins: Vec<String>,
    where_clauses: Vec<String>,
    where_params: Vec<SqlValue>,
    group_by_cols: Vec<String>,
    having_clauses: Vec<String>,
    having_params: Vec<SqlValue>,
    order_by_cols: Vec<String>,
    limit_n: Option<u64>,
    offset_n: Option<u64>,
    explain_query: bool,
    cache_ttl_secs: Option<u64>,
    error: Option<String>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn poison(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }

    pub fn select(mut self, columns: &[&str]) -> Self {
        for col in columns {
            if !valid_column(col) {
                self.poison(format!("invalid select column {col:?}"));
                return self;
            }
            self.select_columns.push((*col).to_string());
        }
        self
    }

    pub fn from_table(mut self, table: &str) -> Self {
        if !TABLE_RE.is_match(table) {
            self.poison(format!("invalid table reference {table:?}"));
            return self;
        }
        self.from_table = Some(table.to_string());
        self
    }

    /// Read through ReplacingMergeTree dedup.
    pub fn final_rows(mut self) -> Self {
        self.final_modifier = true;
        self
    }

    /// `on` must be `left = right` with both sides valid column tokens.
    pub fn join(mut self, join_type: JoinType, table: &str, on: &str) -> Self {
        if !TABLE_RE.is_match(table) {
            self.poison(format!("invalid join table {table:?}"));
            return self;
        }
        if join_type == JoinType::Cross {
            self.joins.push(format!("{} {table}", join_type.as_sql()));
            return self;
        }
        let Some((left, right)) = on.split_once('=') else {
            self.poison(format!("invalid join condition {on:?}"));
            return self;
        };
        let (left, right) = (left.trim(), right.trim());
        if !COLUMN_RE.is_match(left) || !COLUMN_RE.is_match(right) {
            self.poison(format!("invalid join condition {on:?}"));
            return self;
        }
        self.joins.push(format!("{} {table} ON {left} = {right}", join_type.as_sql()));
        self
    }

    /// Generic comparison filter; the literal always becomes a placeholder.
    pub fn filter(mut self, column: &str, op: FilterOp, value: impl Into<SqlValue>) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid filter column {column:?}"));
            return self;
        }
        self.where_clauses.push(format!("{column} {} ?", op.as_sql()));
        self.where_params.push(value.into());
        self
    }

    pub fn where_in(self, column: &str, values: Vec<SqlValue>) -> Self {
        self.push_in(column, values, false)
    }

    pub fn where_not_in(self, column: &str, values: Vec<SqlValue>) -> Self {
        self.push_in(column, values, true)
    }

    fn push_in(mut self, column: &str, values: Vec<SqlValue>, negate: bool) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid filter column {column:?}"));
            return self;
        }
        if values.is_empty() {
            self.poison(format!("IN list for {column:?} must not be empty"));
            return self;
        }
        let placeholders = vec!["?"; values.len()].join(", ");
        let keyword = if negate { "NOT IN" } else { "IN" };
        self.where_clauses.push(format!("{column} {keyword} ({placeholders})"));
        self.where_params.extend(values);
        self
    }

    pub fn where_between(
        mut self,
        column: &str,
        start: impl Into<SqlValue>,
        end: impl Into<SqlValue>,
    ) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid filter column {column:?}"));
            return self;
        }
        self.where_clauses.push(format!("{column} BETWEEN ? AND ?"));
        self.where_params.push(start.into());
        self.where_params.push(end.into());
        self
    }

    pub fn where_null(mut self, column: &str) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid filter column {column:?}"));
            return self;
        }
        self.where_clauses.push(format!("{column} IS NULL"));
        self
    }

    pub fn where_not_null(mut self, column: &str) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid filter column {column:?}"));
            return self;
        }
        self.where_clauses.push(format!("{column} IS NOT NULL"));
        self
    }

    pub fn group_by(mut self, columns: &[&str]) -> Self {
        for col in columns {
            if !valid_column(col) {
                self.poison(format!("invalid group by column {col:?}"));
                return self;
            }
            self.group_by_cols.push((*col).to_string());
        }
        self
    }

    pub fn having(mut self, expr: &str, op: FilterOp, value: impl Into<SqlValue>) -> Self {
        if !valid_column(expr) {
            self.poison(format!("invalid having expression {expr:?}"));
            return self;
        }
        self.having_clauses.push(format!("{expr} {} ?", op.as_sql()));
        self.having_params.push(value.into());
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        if !valid_column(column) {
            self.poison(format!("invalid order by column {column:?}"));
            return self;
        }
        let dir = if descending { "DESC" } else { "ASC" };
        self.order_by_cols.push(format!("{column} {dir}"));
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit_n = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset_n = Some(n);
        self
    }

    pub fn explain(mut self) -> Self {
        self.explain_query = true;
        self
    }

    /// Override the cache TTL for this query.
    pub fn cache_for(mut self, seconds: u64) -> Self {
        self.cache_ttl_secs = Some(seconds);
        self
    }

    pub fn cache_ttl(&self) -> Option<u64> {
        self.cache_ttl_secs
    }

    // ── Specialized ISTAT builders ──

    /// Ordered observation rows for one dataset.
    pub fn select_time_series(self, dataset_id: &str) -> Self {
        self.select(&[
            "dataset_id",
            "year",
            "time_period",
            "territory_code",
            "territory_name",
            "measure_code",
            "measure_name",
            "obs_value",
            "obs_status",
        ])
        .from_table(OBSERVATIONS_TABLE)
        .final_rows()
        .filter("dataset_id", FilterOp::Eq, dataset_id)
        .order_by("year", false)
        .order_by("time_period", false)
    }

    /// Average value per territory for one measure and year.
    pub fn select_territory_comparison(self, measure_code: &str, year: i32) -> Self {
        self.select(&[
            "territory_code",
            "territory_name",
            "avg(assumeNotNull(obs_value)) AS avg_value",
            "count() AS observation_count",
        ])
        .from_table(OBSERVATIONS_TABLE)
        .final_rows()
        .filter("measure_code", FilterOp::Eq, measure_code)
        .filter("year", FilterOp::Eq, year)
        .where_not_null("obs_value")
        .group_by(&["territory_code", "territory_name"])
        .order_by("avg_value", true)
    }

    /// Per-year aggregates across all datasets of one category.
    pub fn select_category_trends(self, category: &str) -> Self {
        self.select(&[
            "o.year AS year",
            "uniqExact(o.dataset_id) AS dataset_count",
            "avg(assumeNotNull(o.obs_value)) AS avg_value",
            "sum(assumeNotNull(o.obs_value)) AS total_value",
        ])
        .from_table("istat.istat_observations o")
        .join(JoinType::Inner, "istat.istat_datasets d", "o.dataset_id = d.dataset_id")
        .filter("d.category", FilterOp::Eq, category)
        .where_not_null("o.obs_value")
        .group_by(&["year"])
        .order_by("year", false)
    }

    pub fn year_range(self, start_year: i32, end_year: i32) -> Self {
        self.where_between("year", start_year, end_year)
    }

    pub fn territories(self, territory_codes: &[String]) -> Self {
        let values = territory_codes.iter().map(|c| SqlValue::from(c.clone())).collect();
        self.where_in("territory_code", values)
    }

    // ── Build ──

    /// Produce `(sql, params)`. The number of `?` placeholders in the SQL
    /// always equals `params.len()`.
    pub fn build_sql(&self) -> ApiResult<(String, Vec<SqlValue>)> {
        if let Some(message) = &self.error {
            return Err(ApiError::validation(message.clone()));
        }
        let table = self
            .from_table
            .as_deref()
            .ok_or_else(|| ApiError::validation("FROM table must be specified"))?;
        if self.select_columns.is_empty() {
            return Err(ApiError::validation("SELECT columns must be specified"));
        }

        let mut parts: Vec<String> = Vec::new();
        if self.explain_query {
            parts.push("EXPLAIN".to_string());
        }
        parts.push(format!("SELECT {}", self.select_columns.join(", ")));
        parts.push(format!("FROM {table}"));
        if self.final_modifier {
            parts.push("FINAL".to_string());
        }
        parts.extend(self.joins.iter().cloned());
        if !self.where_clauses.is_empty() {
            parts.push(format!("WHERE {}", self.where_clauses.join(" AND ")));
        }
        if !self.group_by_cols.is_empty() {
            parts.push(format!("GROUP BY {}", self.group_by_cols.join(", ")));
        }
        if !self.having_clauses.is_empty() {
            parts.push(format!("HAVING {}", self.having_clauses.join(" AND ")));
        }
        if !self.order_by_cols.is_empty() {
            parts.push(format!("ORDER BY {}", self.order_by_cols.join(", ")));
        }
        if let Some(n) = self.limit_n {
            parts.push(format!("LIMIT {n}"));
        }
        if let Some(n) = self.offset_n {
            parts.push(format!("OFFSET {n}"));
        }

        let mut params = self.where_params.clone();
        params.extend(self.having_params.iter().cloned());
        Ok((parts.join(" "), params))
    }

    /// `SELECT count()` over the same filters, with grouping, ordering and
    /// paging stripped.
    pub fn build_count_sql(&self) -> ApiResult<(String, Vec<SqlValue>)> {
        if let Some(message) = &self.error {
            return Err(ApiError::validation(message.clone()));
        }
        let table = self
            .from_table
            .as_deref()
            .ok_or_else(|| ApiError::validation("FROM table must be specified"))?;

        let mut parts: Vec<String> = vec!["SELECT count() AS count".to_string()];
        parts.push(format!("FROM {table}"));
        if self.final_modifier {
            parts.push("FINAL".to_string());
        }
        parts.extend(self.joins.iter().cloned());
        if !self.where_clauses.is_empty() {
            parts.push(format!("WHERE {}", self.where_clauses.join(" AND ")));
        }
        Ok((parts.join(" "), self.where_params.clone()))
    }

    // ── Terminal operations ──

    /// Execute with optional result caching; rows are returned as JSON
    /// values so heterogeneous shapes share one cache.
    pub async fn execute<T>(
        &self,
        db: &AnalyticsDb,
        cache: &QueryCache,
        use_cache: bool,
    ) -> ApiResult<Vec<serde_json::Value>>
    where
        T: clickhouse::Row + DeserializeOwned + Serialize,
    {
        let (sql, params) = self.build_sql()?;
        let key = QueryCache::cache_key(&sql, &params);
        if use_cache {
            if let Some(rows) = cache.get(&key) {
                return Ok(rows);
            }
        }
        let rows = db.fetch::<T>(&sql, &params).await?;
        let json_rows: Vec<serde_json::Value> = rows
            .into_iter()
            .map(|r| serde_json::to_value(r).unwrap_or(serde_json::Value::Null))
            .collect();
        if use_cache {
            cache.put(&key, json_rows.clone(), self.cache_ttl_secs);
        }
        Ok(json_rows)
    }

    /// Typed fetch without caching.
    pub async fn fetch_typed<T>(&self, db: &AnalyticsDb) -> ApiResult<Vec<T>>
    where
        T: clickhouse::Row + DeserializeOwned,
    {
        let (sql, params) = self.build_sql()?;
        db.fetch::<T>(&sql, &params).await
    }

    pub async fn count(&self, db: &AnalyticsDb) -> ApiResult<u64> {
        let (sql, params) = self.build_count_sql()?;
        let row = db.fetch_one::<CountRow>(&sql, &params).await?;
        Ok(row.count)
    }

    pub async fn exists(&self, db: &AnalyticsDb) -> ApiResult<bool> {
        Ok(self.count(db).await? > 0)
    }

    /// First row, if any (`LIMIT 1` appended).
    pub async fn first<T>(&self, db: &AnalyticsDb) -> ApiResult<Option<T>>
    where
        T: clickhouse::Row + DeserializeOwned,
    {
        let mut limited = self.clone();
        limited.limit_n = Some(1);
        let (sql, params) = limited.build_sql()?;
        let rows = db.fetch::<T>(&sql, &params).await?;
        Ok(rows.into_iter().next())
    }
}

/// Convenience: builder pre-targeted at the observations table.
pub fn observations() -> QueryBuilder {
    QueryBuilder::new().from_table(OBSERVATIONS_TABLE).final_rows()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholders(sql: &str) -> usize {
        sql.matches('?').count()
    }

    #[test]
    fn basic_select_shape() {
        let (sql, params) = QueryBuilder::new()
            .select(&["dataset_id", "year", "obs_value"])
            .from_table("istat.istat_observations")
            .filter("dataset_id", FilterOp::Eq, "DCIS_POPRES1")
            .order_by("year", false)
            .limit(10)
            .offset(20)
            .build_sql()
            .unwrap();
        assert_eq!(
            sql,
            "SELECT dataset_id, year, obs_value FROM istat.istat_observations \
             WHERE dataset_id = ? ORDER BY year ASC LIMIT 10 OFFSET 20"
        );
        assert_eq!(params, vec![SqlValue::Str("DCIS_POPRES1".to_string())]);
    }

    #[test]
    fn placeholder_count_matches_params() {
        let builder = QueryBuilder::new()
            .select(&["territory_code"])
            .from_table("istat.istat_observations")
            .filter("year", FilterOp::Gte, 2020)
            .where_in(
                "territory_code",
                vec!["IT".into(), "ITC1".into(), "ITF3".into()],
            )
            .where_between("obs_value", 0.0, 100.0)
            .having("count() AS c", FilterOp::Gt, 5i64);
        let (sql, params) = builder.build_sql().unwrap();
        assert_eq!(placeholders(&sql), params.len());
        assert_eq!(params.len(), 7);
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        let err = QueryBuilder::new()
            .select(&["obs_value; DROP TABLE x"])
            .from_table("istat.istat_observations")
            .build_sql()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = QueryBuilder::new()
            .select(&["a"])
            .from_table("istat.istat_observations")
            .filter("obs_value OR 1=1", FilterOp::Eq, 1i64)
            .build_sql()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = QueryBuilder::new()
            .select(&["a"])
            .from_table("bad table'name")
            .build_sql()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn first_poison_wins() {
        let err = QueryBuilder::new()
            .select(&["bad col!"])
            .from_table("also bad!")
            .build_sql()
            .unwrap_err();
        assert!(err.to_string().contains("bad col!"));
    }

    #[test]
    fn empty_in_list_is_rejected() {
        let err = QueryBuilder::new()
            .select(&["a"])
            .from_table("t")
            .where_in("territory_code", vec![])
            .build_sql()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn missing_from_or_select_is_rejected() {
        assert!(QueryBuilder::new().select(&["a"]).build_sql().is_err());
        assert!(QueryBuilder::new().from_table("t").build_sql().is_err());
    }

    #[test]
    fn null_operators_emit_no_placeholders() {
        let (sql, params) = QueryBuilder::new()
            .select(&["a"])
            .from_table("t")
            .where_null("obs_value")
            .where_not_null("territory_code")
            .build_sql()
            .unwrap();
        assert!(sql.contains("obs_value IS NULL"));
        assert!(sql.contains("territory_code IS NOT NULL"));
        assert!(params.is_empty());
    }

    #[test]
    fn count_strips_order_limit_offset() {
        let builder = QueryBuilder::new()
            .select(&["dataset_id", "obs_value"])
            .from_table("istat.istat_observations")
            .filter("dataset_id", FilterOp::Eq, "X")
            .order_by("year", true)
            .limit(5)
            .offset(10);
        let (sql, params) = builder.build_count_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT count() AS count FROM istat.istat_observations WHERE dataset_id = ?"
        );
        assert_eq!(params.len(), 1);
        assert!(!sql.contains("ORDER BY"));
        assert!(!sql.contains("LIMIT"));
    }

    #[test]
    fn explain_prefixes_query() {
        let (sql, _) =
            QueryBuilder::new().select(&["a"]).from_table("t").explain().build_sql().unwrap();
        assert!(sql.starts_with("EXPLAIN SELECT"));
    }

    #[test]
    fn time_series_builder_shape() {
        let (sql, params) =
            QueryBuilder::new().select_time_series("DCIS_POPRES1").build_sql().unwrap();
        assert!(sql.contains("FROM istat.istat_observations FINAL"));
        assert!(sql.contains("WHERE dataset_id = ?"));
        assert!(sql.ends_with("ORDER BY year ASC, time_period ASC"));
        assert_eq!(params, vec![SqlValue::Str("DCIS_POPRES1".to_string())]);
    }

    #[test]
    fn time_series_with_range_and_territories() {
        let builder = QueryBuilder::new()
            .select_time_series("DCIS_POPRES1")
            .year_range(2019, 2023)
            .territories(&["IT".to_string(), "ITC1".to_string()]);
        let (sql, params) = builder.build_sql().unwrap();
        assert!(sql.contains("year BETWEEN ? AND ?"));
        assert!(sql.contains("territory_code IN (?, ?)"));
        assert_eq!(placeholders(&sql), params.len());
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn territory_comparison_builder_shape() {
        let (sql, params) = QueryBuilder::new()
            .select_territory_comparison("POP_TOT", 2023)
            .build_sql()
            .unwrap();
        assert!(sql.contains("avg(assumeNotNull(obs_value)) AS avg_value"));
        assert!(sql.contains("GROUP BY territory_code, territory_name"));
        assert!(sql.ends_with("ORDER BY avg_value DESC"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn category_trends_joins_datasets() {
        let (sql, params) =
            QueryBuilder::new().select_category_trends("popolazione").build_sql().unwrap();
        assert!(sql.contains(
            "INNER JOIN istat.istat_datasets d ON o.dataset_id = d.dataset_id"
        ));
        assert!(sql.contains("WHERE d.category = ?"));
        assert_eq!(params, vec![SqlValue::Str("popolazione".to_string())]);
    }

    #[test]
    fn join_condition_is_validated() {
        let err = QueryBuilder::new()
            .select(&["a"])
            .from_table("t")
            .join(JoinType::Left, "u", "a = b OR 1=1")
            .build_sql()
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn ilike_renders() {
        let (sql, _) = QueryBuilder::new()
            .select(&["a"])
            .from_table("t")
            .filter("territory_name", FilterOp::ILike, "%lombar%")
            .build_sql()
            .unwrap();
        assert!(sql.contains("territory_name ILIKE ?"));
    }
}
