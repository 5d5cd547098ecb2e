use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `osservatorio.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub istat: IstatConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for bearer tokens. When absent a fresh secret is generated
    /// at startup and logged as ephemeral.
    pub jwt_secret_key: Option<String>,
    #[serde(default = "default_token_expire_minutes")]
    pub jwt_access_token_expire_minutes: i64,
    /// Default requests/hour for newly issued API keys.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_default: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret_key: None,
            jwt_access_token_expire_minutes: default_token_expire_minutes(),
            rate_limit_default: default_rate_limit(),
        }
    }
}

fn default_token_expire_minutes() -> i64 {
    60
}

fn default_rate_limit() -> i64 {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub cache_default_ttl_seconds: u64,
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_default_ttl_seconds: default_cache_ttl(),
            cache_max_size: default_cache_max_size(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_size() -> usize {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct IstatConfig {
    #[serde(default = "default_upstream_base_url")]
    pub upstream_base_url: String,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub circuit_breaker_cooldown_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,
    /// Outbound concurrency cap towards ISTAT.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    /// Outbound requests/minute cap towards ISTAT.
    #[serde(default = "default_per_minute")]
    pub requests_per_minute: u32,
}

impl Default for IstatConfig {
    fn default() -> Self {
        Self {
            upstream_base_url: default_upstream_base_url(),
            upstream_timeout_seconds: default_upstream_timeout(),
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_cooldown_seconds: default_breaker_cooldown(),
            retry_max_attempts: default_retry_attempts(),
            max_concurrent_requests: default_max_concurrent(),
            requests_per_minute: default_per_minute(),
        }
    }
}

fn default_upstream_base_url() -> String {
    "https://sdmx.istat.it/SDMXWS/rest".to_string()
}

fn default_upstream_timeout() -> u64 {
    10
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown() -> u64 {
    60
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_max_concurrent() -> usize {
    10
}

fn default_per_minute() -> u32 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalysisConfig {
    /// Upper bound on uploaded/posted SDMX XML documents, in bytes.
    #[serde(default = "default_max_xml_bytes")]
    pub max_xml_size_bytes: usize,
    #[serde(default = "default_bulk_concurrency")]
    pub max_concurrent: usize,
    /// Per-probe timeout when testing dataflow data access.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_xml_size_bytes: default_max_xml_bytes(),
            max_concurrent: default_bulk_concurrency(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

fn default_max_xml_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_bulk_concurrency() -> usize {
    5
}

fn default_probe_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default = "default_origins")]
    pub cors_allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { cors_allowed_origins: default_origins() }
    }
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl AppConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Bulk analysis concurrency, clamped to the supported 1–10 range.
    pub fn effective_analysis_concurrency(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.analysis.max_concurrent).clamp(1, 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let config = AppConfig::default();
        assert_eq!(config.auth.jwt_access_token_expire_minutes, 60);
        assert_eq!(config.auth.rate_limit_default, 100);
        assert_eq!(config.cache.cache_default_ttl_seconds, 300);
        assert_eq!(config.cache.cache_max_size, 1000);
        assert_eq!(config.istat.circuit_breaker_threshold, 5);
        assert_eq!(config.istat.circuit_breaker_cooldown_seconds, 60);
        assert_eq!(config.istat.retry_max_attempts, 3);
        assert_eq!(config.istat.upstream_timeout_seconds, 10);
        assert_eq!(config.cors.cors_allowed_origins, vec!["*".to_string()]);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[auth]\nrate_limit_default = 500\n\n[istat]\ncircuit_breaker_threshold = 2"
        )
        .unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert_eq!(config.auth.rate_limit_default, 500);
        assert_eq!(config.auth.jwt_access_token_expire_minutes, 60);
        assert_eq!(config.istat.circuit_breaker_threshold, 2);
        assert_eq!(config.istat.retry_max_attempts, 3);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load("/nonexistent/osservatorio.toml").unwrap();
        assert_eq!(config.auth.rate_limit_default, 100);
    }

    #[test]
    fn analysis_concurrency_is_clamped() {
        let config = AppConfig::default();
        assert_eq!(config.effective_analysis_concurrency(None), 5);
        assert_eq!(config.effective_analysis_concurrency(Some(0)), 1);
        assert_eq!(config.effective_analysis_concurrency(Some(50)), 10);
    }
}
