use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::sync::{LazyLock, Mutex};

use crate::error::{ApiError, ApiResult};
use crate::models::audit::{AuditEntry, AuditEvent};
use crate::models::auth::{ApiKeyRecord, Scope};
use crate::models::dataset::{Dataset, DatasetStatus, PreferenceValue};
use crate::models::rule::{Category, CategorizationRule};

static SAFE_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)?$").unwrap());

/// True when a table/column token may be interpolated into SQL text.
/// Allows at most one `.` for a schema prefix. Literal values never go
/// through this path; they are always bound as parameters.
pub fn is_safe_identifier(token: &str) -> bool {
    SAFE_IDENTIFIER.is_match(token)
}

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Outcome of an atomic rate-limit check-and-increment.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub request_count: i64,
    pub window_end_epoch: i64,
}

/// Transactional row store for datasets, API keys, preferences, audit,
/// rate-limit windows, categorization rules and token revocations.
pub struct MetadataDb {
    conn: Mutex<Connection>,
}

impl MetadataDb {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.run_migrations()?;
        Ok(db)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS datasets (
                dataset_id  TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                category    TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                agency      TEXT NOT NULL DEFAULT 'ISTAT',
                priority    INTEGER NOT NULL DEFAULT 5 CHECK(priority BETWEEN 1 AND 10),
                status      TEXT NOT NULL DEFAULT 'active'
                            CHECK(status IN ('active','inactive','processing','error')),
                metadata    TEXT NOT NULL DEFAULT '{}',
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_datasets_category ON datasets(category);

            CREATE TABLE IF NOT EXISTS api_keys (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                key_hash    TEXT NOT NULL UNIQUE,
                key_prefix  TEXT NOT NULL,
                scopes      TEXT NOT NULL DEFAULT '[\"read\"]',
                rate_limit  INTEGER NOT NULL DEFAULT 100,
                is_active   INTEGER NOT NULL DEFAULT 1,
                expires_at  TEXT,
                last_used   TEXT,
                usage_count INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(key_prefix);

            CREATE TABLE IF NOT EXISTS user_preferences (
                user_id    TEXT NOT NULL,
                pref_key   TEXT NOT NULL,
                pref_value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                PRIMARY KEY (user_id, pref_key)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp         TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                user_id           TEXT,
                action            TEXT NOT NULL,
                resource_type     TEXT NOT NULL,
                resource_id       TEXT,
                details           TEXT,
                success           INTEGER NOT NULL DEFAULT 1,
                error_message     TEXT,
                execution_time_ms INTEGER,
                client_ip         TEXT,
                user_agent        TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_log(timestamp DESC);
            CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id, timestamp DESC);

            CREATE TABLE IF NOT EXISTS rate_limits (
                api_key_id    INTEGER NOT NULL,
                endpoint      TEXT NOT NULL,
                window_start  INTEGER NOT NULL,
                window_end    INTEGER NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (api_key_id, endpoint, window_start)
            );

            CREATE TABLE IF NOT EXISTS categorization_rules (
                rule_id     TEXT PRIMARY KEY,
                category    TEXT NOT NULL CHECK(category IN
                            ('popolazione','economia','lavoro','territorio',
                             'istruzione','salute','altri')),
                keywords    TEXT NOT NULL,
                priority    INTEGER NOT NULL,
                is_active   INTEGER NOT NULL DEFAULT 1,
                description TEXT,
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now')),
                updated_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );

            CREATE TABLE IF NOT EXISTS token_revocations (
                jti        TEXT PRIMARY KEY,
                exp        INTEGER NOT NULL,
                revoked_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ','now'))
            );
            ",
        )?;

        // Additive migration: sync bookkeeping columns on datasets
        {
            let has_col: bool = conn
                .prepare("SELECT COUNT(*) FROM pragma_table_info('datasets') WHERE name = 'records_synced'")?
                .query_row([], |row| row.get(0))?;
            if !has_col {
                conn.execute_batch(
                    "ALTER TABLE datasets ADD COLUMN records_synced INTEGER NOT NULL DEFAULT 0;
                     ALTER TABLE datasets ADD COLUMN last_sync_at TEXT;",
                )?;
            }
        }

        Ok(())
    }

    /// Scoped transaction: commits when `f` returns Ok, rolls back on Err.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&Transaction) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(ApiError::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(ApiError::from)?;
        Ok(out)
    }

    fn insert_audit_tx(tx: &Transaction, event: &AuditEvent) -> ApiResult<()> {
        tx.execute(
            "INSERT INTO audit_log (user_id, action, resource_type, resource_id, details, \
             success, error_message, execution_time_ms, client_ip, user_agent) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.user_id,
                event.action,
                event.resource_type,
                event.resource_id,
                event.details,
                event.success,
                event.error_message,
                event.execution_time_ms,
                event.client_ip,
                event.user_agent
            ],
        )?;
        Ok(())
    }

    // ── Dataset operations ──

    /// Insert a dataset row and its audit entry in one transaction.
    pub fn insert_dataset(
        &self,
        dataset_id: &str,
        name: &str,
        category: &str,
        description: &str,
        agency: &str,
        priority: i64,
        metadata: &serde_json::Value,
        audit: &AuditEvent,
    ) -> ApiResult<()> {
        let metadata_json = serde_json::to_string(metadata)?;
        self.transaction(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO datasets (dataset_id, name, category, description, agency, priority, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![dataset_id, name, category, description, agency, priority, metadata_json],
            )?;
            if inserted == 0 {
                return Err(ApiError::conflict(format!("dataset {dataset_id} already exists")));
            }
            Self::insert_audit_tx(tx, audit)?;
            Ok(())
        })
    }

    /// Remove a dataset row (two-store rollback path) with audit.
    pub fn delete_dataset(&self, dataset_id: &str, audit: &AuditEvent) -> ApiResult<bool> {
        self.transaction(|tx| {
            let deleted = tx.execute("DELETE FROM datasets WHERE dataset_id = ?1", params![dataset_id])?;
            Self::insert_audit_tx(tx, audit)?;
            Ok(deleted > 0)
        })
    }

    fn dataset_from_row(row: &rusqlite::Row) -> rusqlite::Result<Dataset> {
        let status_str: String = row.get(6)?;
        let metadata_str: String = row.get(7)?;
        Ok(Dataset {
            dataset_id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            description: row.get(3)?,
            agency: row.get(4)?,
            priority: row.get(5)?,
            status: DatasetStatus::parse(&status_str).unwrap_or(DatasetStatus::Error),
            metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    const DATASET_COLS: &'static str = "dataset_id, name, category, description, agency, \
         priority, status, metadata, created_at, updated_at";

    pub fn get_dataset(&self, dataset_id: &str) -> ApiResult<Option<Dataset>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM datasets WHERE dataset_id = ?1",
            Self::DATASET_COLS
        ))?;
        let row = stmt.query_row(params![dataset_id], Self::dataset_from_row).optional()?;
        Ok(row)
    }

    pub fn list_datasets(&self, category: Option<&str>) -> ApiResult<Vec<Dataset>> {
        let conn = self.conn.lock().unwrap();
        let sql = match category {
            Some(_) => format!(
                "SELECT {} FROM datasets WHERE category = ?1 ORDER BY dataset_id",
                Self::DATASET_COLS
            ),
            None => format!("SELECT {} FROM datasets ORDER BY dataset_id", Self::DATASET_COLS),
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = match category {
            Some(c) => stmt.query_map(params![c], Self::dataset_from_row)?.collect::<Result<Vec<_>, _>>()?,
            None => stmt.query_map([], Self::dataset_from_row)?.collect::<Result<Vec<_>, _>>()?,
        };
        Ok(rows)
    }

    pub fn update_dataset_status(&self, dataset_id: &str, status: DatasetStatus) -> ApiResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count = conn.execute(
            "UPDATE datasets SET status = ?2, updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') \
             WHERE dataset_id = ?1",
            params![dataset_id, status.as_str()],
        )?;
        Ok(count > 0)
    }

    /// Update sync bookkeeping after an ingestion run, with audit.
    pub fn update_sync_stats(
        &self,
        dataset_id: &str,
        records_synced: i64,
        audit: &AuditEvent,
    ) -> ApiResult<()> {
        self.transaction(|tx| {
            tx.execute(
                "UPDATE datasets SET records_synced = ?2, \
                 last_sync_at = strftime('%Y-%m-%dT%H:%M:%SZ','now'), \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE dataset_id = ?1",
                params![dataset_id, records_synced],
            )?;
            Self::insert_audit_tx(tx, audit)?;
            Ok(())
        })
    }

    // ── API key operations ──

    pub fn create_api_key(
        &self,
        name: &str,
        key_hash: &str,
        key_prefix: &str,
        scopes: &[Scope],
        rate_limit: i64,
        expires_at: Option<&str>,
        audit: &AuditEvent,
    ) -> ApiResult<i64> {
        let scopes_json = serde_json::to_string(scopes)?;
        self.transaction(|tx| {
            tx.execute(
                "INSERT INTO api_keys (name, key_hash, key_prefix, scopes, rate_limit, expires_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![name, key_hash, key_prefix, scopes_json, rate_limit, expires_at],
            )?;
            let id = tx.last_insert_rowid();
            Self::insert_audit_tx(tx, audit)?;
            Ok(id)
        })
    }

    fn api_key_from_row(row: &rusqlite::Row) -> rusqlite::Result<ApiKeyRecord> {
        let scopes_json: String = row.get(4)?;
        Ok(ApiKeyRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            key_hash: row.get(2)?,
            key_prefix: row.get(3)?,
            scopes: serde_json::from_str(&scopes_json).unwrap_or_default(),
            rate_limit: row.get(5)?,
            is_active: row.get(6)?,
            expires_at: row.get(7)?,
            last_used: row.get(8)?,
            usage_count: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    const API_KEY_COLS: &'static str = "id, name, key_hash, key_prefix, scopes, rate_limit, \
         is_active, expires_at, last_used, usage_count, created_at";

    /// Candidate rows for key verification: matching prefix, active, and not
    /// expired at `now`.
    pub fn find_keys_by_prefix(&self, key_prefix: &str, now: &str) -> ApiResult<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_keys \
             WHERE key_prefix = ?1 AND is_active = 1 AND (expires_at IS NULL OR expires_at > ?2)",
            Self::API_KEY_COLS
        ))?;
        let rows = stmt
            .query_map(params![key_prefix, now], Self::api_key_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_api_key(&self, id: i64) -> ApiResult<Option<ApiKeyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(&format!("SELECT {} FROM api_keys WHERE id = ?1", Self::API_KEY_COLS))?;
        let row = stmt.query_row(params![id], Self::api_key_from_row).optional()?;
        Ok(row)
    }

    pub fn list_api_keys(&self) -> ApiResult<Vec<ApiKeyRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM api_keys ORDER BY created_at DESC",
            Self::API_KEY_COLS
        ))?;
        let rows =
            stmt.query_map([], Self::api_key_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn touch_key_usage(&self, id: i64) -> ApiResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE api_keys SET last_used = strftime('%Y-%m-%dT%H:%M:%SZ','now'), \
             usage_count = usage_count + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Soft revoke: the key stops verifying but the row (and its audit trail)
    /// survives.
    pub fn revoke_api_key(&self, id: i64, audit: &AuditEvent) -> ApiResult<bool> {
        self.transaction(|tx| {
            let count =
                tx.execute("UPDATE api_keys SET is_active = 0 WHERE id = ?1", params![id])?;
            Self::insert_audit_tx(tx, audit)?;
            Ok(count > 0)
        })
    }

    // ── User preference operations ──

    pub fn set_preference(
        &self,
        user_id: &str,
        key: &str,
        value: &PreferenceValue,
    ) -> ApiResult<()> {
        let value_json = serde_json::to_string(value)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_preferences (user_id, pref_key, pref_value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(user_id, pref_key) DO UPDATE SET pref_value = ?3, \
             updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now')",
            params![user_id, key, value_json],
        )?;
        Ok(())
    }

    pub fn get_preference(&self, user_id: &str, key: &str) -> ApiResult<Option<PreferenceValue>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT pref_value FROM user_preferences WHERE user_id = ?1 AND pref_key = ?2",
        )?;
        let raw: Option<String> =
            stmt.query_row(params![user_id, key], |row| row.get(0)).optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    // ── Audit operations ──

    pub fn insert_audit(&self, event: &AuditEvent) -> ApiResult<()> {
        self.transaction(|tx| Self::insert_audit_tx(tx, event))
    }

    pub fn recent_audit(&self, limit: i64) -> ApiResult<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, user_id, action, resource_type, resource_id, details, \
             success, error_message, execution_time_ms, client_ip, user_agent \
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    user_id: row.get(2)?,
                    action: row.get(3)?,
                    resource_type: row.get(4)?,
                    resource_id: row.get(5)?,
                    details: row.get(6)?,
                    success: row.get(7)?,
                    error_message: row.get(8)?,
                    execution_time_ms: row.get(9)?,
                    client_ip: row.get(10)?,
                    user_agent: row.get(11)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Aggregates for the admin usage endpoint.
    pub fn usage_stats(&self) -> ApiResult<serde_json::Value> {
        let conn = self.conn.lock().unwrap();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0))?;
        let failures: i64 =
            conn.query_row("SELECT COUNT(*) FROM audit_log WHERE success = 0", [], |r| r.get(0))?;
        let last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM audit_log \
             WHERE strftime('%s','now') - strftime('%s', timestamp) < 86400",
            [],
            |r| r.get(0),
        )?;
        let avg_ms: Option<f64> = conn.query_row(
            "SELECT AVG(execution_time_ms) FROM audit_log WHERE execution_time_ms IS NOT NULL",
            [],
            |r| r.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT action, COUNT(*) as count FROM audit_log \
             GROUP BY action ORDER BY count DESC LIMIT 10",
        )?;
        let top_actions: Vec<serde_json::Value> = stmt
            .query_map([], |row| {
                Ok(serde_json::json!({
                    "action": row.get::<_, String>(0)?,
                    "count": row.get::<_, i64>(1)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT user_id, COUNT(*) as count FROM audit_log WHERE user_id IS NOT NULL \
             GROUP BY user_id ORDER BY count DESC LIMIT 10",
        )?;
        let top_users: Vec<serde_json::Value> = stmt
            .query_map([], |row| {
                Ok(serde_json::json!({
                    "user_id": row.get::<_, String>(0)?,
                    "count": row.get::<_, i64>(1)?,
                }))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(serde_json::json!({
            "total_requests": total,
            "failed_requests": failures,
            "requests_last_24h": last_24h,
            "avg_execution_time_ms": avg_ms,
            "top_actions": top_actions,
            "top_users": top_users,
        }))
    }

    // ── Rate limit operations ──

    /// Atomic check-and-increment for the `(api_key_id, endpoint)` window
    /// containing `now_epoch`. A denied request does not increment.
    pub fn rate_limit_hit(
        &self,
        api_key_id: i64,
        endpoint: &str,
        limit: i64,
        window_secs: i64,
        now_epoch: i64,
    ) -> ApiResult<RateLimitOutcome> {
        self.transaction(|tx| {
            let active: Option<(i64, i64, i64)> = tx
                .query_row(
                    "SELECT window_start, window_end, request_count FROM rate_limits \
                     WHERE api_key_id = ?1 AND endpoint = ?2 AND window_start <= ?3 AND window_end > ?3",
                    params![api_key_id, endpoint, now_epoch],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match active {
                None => {
                    let window_end = now_epoch + window_secs;
                    tx.execute(
                        "INSERT INTO rate_limits (api_key_id, endpoint, window_start, window_end, request_count) \
                         VALUES (?1, ?2, ?3, ?4, 1) \
                         ON CONFLICT(api_key_id, endpoint, window_start) \
                         DO UPDATE SET request_count = request_count + 1",
                        params![api_key_id, endpoint, now_epoch, window_end],
                    )?;
                    Ok(RateLimitOutcome {
                        allowed: limit >= 1,
                        request_count: 1,
                        window_end_epoch: window_end,
                    })
                }
                Some((window_start, window_end, count)) if count < limit => {
                    tx.execute(
                        "UPDATE rate_limits SET request_count = request_count + 1 \
                         WHERE api_key_id = ?1 AND endpoint = ?2 AND window_start = ?3",
                        params![api_key_id, endpoint, window_start],
                    )?;
                    Ok(RateLimitOutcome {
                        allowed: true,
                        request_count: count + 1,
                        window_end_epoch: window_end,
                    })
                }
                Some((_, window_end, count)) => Ok(RateLimitOutcome {
                    allowed: false,
                    request_count: count,
                    window_end_epoch: window_end,
                }),
            }
        })
    }

    pub fn cleanup_expired_windows(&self, now_epoch: i64) -> ApiResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed =
            conn.execute("DELETE FROM rate_limits WHERE window_end <= ?1", params![now_epoch])?;
        Ok(removed)
    }

    // ── Categorization rule operations ──

    fn rule_from_row(row: &rusqlite::Row) -> rusqlite::Result<CategorizationRule> {
        let category_str: String = row.get(1)?;
        let keywords_json: String = row.get(2)?;
        Ok(CategorizationRule {
            rule_id: row.get(0)?,
            category: Category::parse(&category_str).unwrap_or(Category::Altri),
            keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
            priority: row.get(3)?,
            is_active: row.get(4)?,
            description: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    const RULE_COLS: &'static str =
        "rule_id, category, keywords, priority, is_active, description, created_at, updated_at";

    pub fn create_rule(
        &self,
        rule_id: &str,
        category: Category,
        keywords: &[String],
        priority: i64,
        is_active: bool,
        description: Option<&str>,
        audit: &AuditEvent,
    ) -> ApiResult<()> {
        let keywords_json = serde_json::to_string(keywords)?;
        self.transaction(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO categorization_rules \
                 (rule_id, category, keywords, priority, is_active, description) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![rule_id, category.as_str(), keywords_json, priority, is_active, description],
            )?;
            if inserted == 0 {
                return Err(ApiError::conflict(format!("rule {rule_id} already exists")));
            }
            Self::insert_audit_tx(tx, audit)?;
            Ok(())
        })
    }

    /// Rules ordered by descending priority, ties broken by rule_id.
    pub fn list_rules(&self, active_only: bool) -> ApiResult<Vec<CategorizationRule>> {
        let conn = self.conn.lock().unwrap();
        let sql = if active_only {
            format!(
                "SELECT {} FROM categorization_rules WHERE is_active = 1 \
                 ORDER BY priority DESC, rule_id ASC",
                Self::RULE_COLS
            )
        } else {
            format!(
                "SELECT {} FROM categorization_rules ORDER BY priority DESC, rule_id ASC",
                Self::RULE_COLS
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::rule_from_row)?.collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_rule(&self, rule_id: &str) -> ApiResult<Option<CategorizationRule>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM categorization_rules WHERE rule_id = ?1",
            Self::RULE_COLS
        ))?;
        let row = stmt.query_row(params![rule_id], Self::rule_from_row).optional()?;
        Ok(row)
    }

    pub fn update_rule(
        &self,
        rule_id: &str,
        category: Category,
        keywords: &[String],
        priority: i64,
        is_active: bool,
        description: Option<&str>,
        audit: &AuditEvent,
    ) -> ApiResult<bool> {
        let keywords_json = serde_json::to_string(keywords)?;
        self.transaction(|tx| {
            let count = tx.execute(
                "UPDATE categorization_rules SET category = ?2, keywords = ?3, priority = ?4, \
                 is_active = ?5, description = ?6, \
                 updated_at = strftime('%Y-%m-%dT%H:%M:%SZ','now') WHERE rule_id = ?1",
                params![rule_id, category.as_str(), keywords_json, priority, is_active, description],
            )?;
            Self::insert_audit_tx(tx, audit)?;
            Ok(count > 0)
        })
    }

    /// Hard delete.
    pub fn delete_rule(&self, rule_id: &str, audit: &AuditEvent) -> ApiResult<bool> {
        self.transaction(|tx| {
            let count = tx
                .execute("DELETE FROM categorization_rules WHERE rule_id = ?1", params![rule_id])?;
            Self::insert_audit_tx(tx, audit)?;
            Ok(count > 0)
        })
    }

    // ── Token revocation operations ──

    pub fn revoke_token(&self, jti: &str, exp: i64) -> ApiResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO token_revocations (jti, exp) VALUES (?1, ?2) \
             ON CONFLICT(jti) DO NOTHING",
            params![jti, exp],
        )?;
        Ok(())
    }

    pub fn is_token_revoked(&self, jti: &str) -> ApiResult<bool> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM token_revocations WHERE jti = ?1", params![jti], |r| r.get(0))
            .optional()?;
        Ok(found.is_some())
    }

    /// Purge revocations past their natural expiry.
    pub fn cleanup_expired_tokens(&self, now_epoch: i64) -> ApiResult<usize> {
        let conn = self.conn.lock().unwrap();
        let removed =
            conn.execute("DELETE FROM token_revocations WHERE exp <= ?1", params![now_epoch])?;
        Ok(removed)
    }

    /// Row count for one table. The table name is interpolated into the SQL
    /// text, so it must pass the identifier whitelist.
    pub fn count_rows(&self, table: &str) -> ApiResult<i64> {
        if !is_safe_identifier(table) {
            return Err(ApiError::validation(format!("unsafe identifier {table:?}")));
        }
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(count)
    }

    /// Lightweight counts for the system status payload.
    pub fn stats(&self) -> ApiResult<serde_json::Value> {
        let keys: i64 = {
            let conn = self.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM api_keys WHERE is_active = 1", [], |r| {
                r.get(0)
            })?
        };
        Ok(serde_json::json!({
            "datasets": self.count_rows("datasets")?,
            "active_api_keys": keys,
            "categorization_rules": self.count_rows("categorization_rules")?,
            "audit_entries": self.count_rows("audit_log")?,
            "checked_at": now_ts(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn db() -> MetadataDb {
        MetadataDb::open_in_memory().unwrap()
    }

    fn audit(action: &str) -> AuditEvent {
        AuditEvent::ok(action, "test", None)
    }

    #[test]
    fn safe_identifier_whitelist() {
        assert!(is_safe_identifier("istat_observations"));
        assert!(is_safe_identifier("istat.istat_observations"));
        assert!(!is_safe_identifier("Observations"));
        assert!(!is_safe_identifier("a.b.c"));
        assert!(!is_safe_identifier("obs; DROP TABLE datasets"));
        assert!(!is_safe_identifier("1col"));
        assert!(!is_safe_identifier(""));
    }

    #[test]
    fn count_rows_rejects_unsafe_tables() {
        let db = db();
        assert_eq!(db.count_rows("datasets").unwrap(), 0);
        let err = db.count_rows("datasets; DROP TABLE api_keys").unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn dataset_insert_and_get() {
        let db = db();
        db.insert_dataset(
            "DCIS_POPRES1",
            "Popolazione residente",
            "popolazione",
            "",
            "ISTAT",
            7,
            &json!({"source": "sdmx"}),
            &audit("dataset_create"),
        )
        .unwrap();
        let got = db.get_dataset("DCIS_POPRES1").unwrap().unwrap();
        assert_eq!(got.name, "Popolazione residente");
        assert_eq!(got.status, DatasetStatus::Active);
        assert_eq!(got.metadata["source"], "sdmx");
        assert!(db.get_dataset("MISSING").unwrap().is_none());
    }

    #[test]
    fn duplicate_dataset_is_conflict() {
        let db = db();
        let meta = json!({});
        db.insert_dataset("DUP_1", "a", "test", "", "ISTAT", 5, &meta, &audit("c")).unwrap();
        let err =
            db.insert_dataset("DUP_1", "b", "test", "", "ISTAT", 5, &meta, &audit("c")).unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = db();
        let meta = json!({});
        let result = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO datasets (dataset_id, name, category) VALUES ('TX_1', 'x', 'test')",
                [],
            )
            .map_err(ApiError::from)?;
            Err::<(), _>(ApiError::internal("boom"))
        });
        assert!(result.is_err());
        assert!(db.get_dataset("TX_1").unwrap().is_none());
        // unrelated write still works afterwards
        db.insert_dataset("TX_2", "x", "test", "", "ISTAT", 5, &meta, &audit("c")).unwrap();
    }

    #[test]
    fn category_filter_lists_only_matching() {
        let db = db();
        let meta = json!({});
        db.insert_dataset("POP_1", "a", "popolazione", "", "ISTAT", 5, &meta, &audit("c")).unwrap();
        db.insert_dataset("ECO_1", "b", "economia", "", "ISTAT", 5, &meta, &audit("c")).unwrap();
        let pop = db.list_datasets(Some("popolazione")).unwrap();
        assert_eq!(pop.len(), 1);
        assert_eq!(pop[0].dataset_id, "POP_1");
        assert_eq!(db.list_datasets(None).unwrap().len(), 2);
    }

    #[test]
    fn api_key_lifecycle() {
        let db = db();
        let id = db
            .create_api_key(
                "powerbi-gateway",
                "salt$digest",
                "osv_abcd",
                &[Scope::Read, Scope::Powerbi],
                100,
                None,
                &audit("key_create"),
            )
            .unwrap();

        let now = now_ts();
        let candidates = db.find_keys_by_prefix("osv_abcd", &now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].scopes, vec![Scope::Read, Scope::Powerbi]);

        db.touch_key_usage(id).unwrap();
        let key = db.get_api_key(id).unwrap().unwrap();
        assert_eq!(key.usage_count, 1);
        assert!(key.last_used.is_some());

        assert!(db.revoke_api_key(id, &audit("key_revoke")).unwrap());
        assert!(db.find_keys_by_prefix("osv_abcd", &now).unwrap().is_empty());
    }

    #[test]
    fn expired_keys_are_not_candidates() {
        let db = db();
        db.create_api_key(
            "old",
            "h1",
            "osv_old1",
            &[Scope::Read],
            100,
            Some("2000-01-01T00:00:00Z"),
            &audit("key_create"),
        )
        .unwrap();
        assert!(db.find_keys_by_prefix("osv_old1", &now_ts()).unwrap().is_empty());
    }

    #[test]
    fn preference_round_trip() {
        let db = db();
        let value = PreferenceValue::Json(json!({"theme": "dark"}));
        db.set_preference("user1", "ui", &value).unwrap();
        assert_eq!(db.get_preference("user1", "ui").unwrap(), Some(value));
        // overwrite
        db.set_preference("user1", "ui", &PreferenceValue::Boolean(true)).unwrap();
        assert_eq!(db.get_preference("user1", "ui").unwrap(), Some(PreferenceValue::Boolean(true)));
        assert_eq!(db.get_preference("user1", "missing").unwrap(), None);
    }

    #[test]
    fn rate_limit_window_is_enforced() {
        let db = db();
        let now = 1_700_000_000;
        for i in 1..=3 {
            let out = db.rate_limit_hit(1, "/datasets", 3, 3600, now + i).unwrap();
            assert!(out.allowed, "request {i} should pass");
        }
        let denied = db.rate_limit_hit(1, "/datasets", 3, 3600, now + 10).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.request_count, 3);

        // other endpoint has its own window
        assert!(db.rate_limit_hit(1, "/odata/Datasets", 3, 3600, now + 11).unwrap().allowed);

        // a new window opens after expiry
        let fresh = db.rate_limit_hit(1, "/datasets", 3, 3600, now + 4000).unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.request_count, 1);
    }

    #[test]
    fn rate_limit_cleanup_drops_expired() {
        let db = db();
        db.rate_limit_hit(1, "/a", 10, 3600, 1000).unwrap();
        db.rate_limit_hit(2, "/b", 10, 3600, 9000).unwrap();
        let removed = db.cleanup_expired_windows(5000).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn rule_crud_and_ordering() {
        let db = db();
        db.create_rule(
            "pop",
            Category::Popolazione,
            &["popolazione".to_string()],
            10,
            true,
            None,
            &audit("rule_create"),
        )
        .unwrap();
        db.create_rule(
            "eco",
            Category::Economia,
            &["pil".to_string()],
            10,
            true,
            None,
            &audit("rule_create"),
        )
        .unwrap();
        db.create_rule(
            "lav",
            Category::Lavoro,
            &["occupazione".to_string()],
            20,
            false,
            None,
            &audit("rule_create"),
        )
        .unwrap();

        let all = db.list_rules(false).unwrap();
        assert_eq!(
            all.iter().map(|r| r.rule_id.as_str()).collect::<Vec<_>>(),
            vec!["lav", "eco", "pop"], // priority desc, ties by rule_id asc
        );
        assert_eq!(db.list_rules(true).unwrap().len(), 2);

        assert!(
            db.update_rule(
                "pop",
                Category::Popolazione,
                &["popolazione".to_string(), "residenti".to_string()],
                15,
                true,
                Some("updated"),
                &audit("rule_update"),
            )
            .unwrap()
        );
        let rule = db.get_rule("pop").unwrap().unwrap();
        assert_eq!(rule.keywords.len(), 2);
        assert_eq!(rule.priority, 15);

        assert!(db.delete_rule("pop", &audit("rule_delete")).unwrap());
        assert!(db.get_rule("pop").unwrap().is_none());
        assert!(!db.delete_rule("pop", &audit("rule_delete")).unwrap());
    }

    #[test]
    fn duplicate_rule_is_conflict() {
        let db = db();
        db.create_rule("r1", Category::Altri, &["x".to_string()], 1, true, None, &audit("c"))
            .unwrap();
        let err = db
            .create_rule("r1", Category::Altri, &["y".to_string()], 2, true, None, &audit("c"))
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFLICT");
    }

    #[test]
    fn token_revocation_round_trip() {
        let db = db();
        db.revoke_token("jti-1", 2_000_000_000).unwrap();
        db.revoke_token("jti-1", 2_000_000_000).unwrap(); // idempotent
        assert!(db.is_token_revoked("jti-1").unwrap());
        assert!(!db.is_token_revoked("jti-2").unwrap());

        db.revoke_token("jti-old", 1_000).unwrap();
        let removed = db.cleanup_expired_tokens(2_000).unwrap();
        assert_eq!(removed, 1);
        assert!(db.is_token_revoked("jti-1").unwrap());
    }

    #[test]
    fn audit_entries_accumulate() {
        let db = db();
        db.insert_audit(&AuditEvent::ok("api_request", "http", Some("/datasets".to_string())))
            .unwrap();
        db.insert_audit(&AuditEvent::failed("sync", "dataset", None, "upstream down").timed(42))
            .unwrap();
        let entries = db.recent_audit(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success);
        assert_eq!(entries[0].error_message.as_deref(), Some("upstream down"));
        assert_eq!(entries[0].execution_time_ms, Some(42));

        let stats = db.usage_stats().unwrap();
        assert_eq!(stats["total_requests"], 2);
        assert_eq!(stats["failed_requests"], 1);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = db();
        db.run_migrations().unwrap();
        db.run_migrations().unwrap();
        assert!(db.stats().is_ok());
    }
}
