use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::config::IstatConfig;
use crate::error::{ApiError, ApiResult};
use crate::models::dataflow::Dataflow;
use crate::models::ingest::{
    ClientStatus, DataflowListing, DatasetPayload, PayloadSource, QualityResult, SyncResult,
};
use crate::repository::UnifiedRepository;
use crate::sdmx;

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

// ── Circuit breaker ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state circuit breaker. `closed` counts consecutive failures and
/// opens at the threshold; `open` fails fast until the cooldown elapses;
/// `half_open` admits a single probe.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            threshold: threshold.max(1),
            cooldown,
        }
    }

    /// Admission check, performed before any upstream call.
    pub fn check(&self) -> ApiResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    tracing::info!("circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(ApiError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ApiError::CircuitOpen)
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Closed {
            tracing::info!("circuit breaker closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                tracing::warn!("circuit breaker re-opened after failed probe");
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    tracing::warn!(
                        "circuit breaker opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().unwrap().consecutive_failures
    }
}

// ── Upstream rate limiter ──

/// Caps outbound concurrency (semaphore) and requests/minute towards ISTAT.
/// Separate from the per-API-key limiter on the HTTP surface.
struct UpstreamLimiter {
    semaphore: Semaphore,
    minute: Mutex<(i64, u32)>,
    per_minute: u32,
}

impl UpstreamLimiter {
    fn new(max_concurrent: usize, per_minute: u32) -> Self {
        Self {
            semaphore: Semaphore::new(max_concurrent.max(1)),
            minute: Mutex::new((0, 0)),
            per_minute: per_minute.max(1),
        }
    }

    async fn acquire(&self) -> ApiResult<tokio::sync::SemaphorePermit<'_>> {
        {
            let minute_now = chrono::Utc::now().timestamp() / 60;
            let mut window = self.minute.lock().unwrap();
            if window.0 != minute_now {
                *window = (minute_now, 0);
            }
            if window.1 >= self.per_minute {
                return Err(ApiError::UpstreamUnavailable(
                    "outbound request budget exhausted for this minute".to_string(),
                ));
            }
            window.1 += 1;
        }
        self.semaphore
            .acquire()
            .await
            .map_err(|_| ApiError::internal("upstream limiter closed"))
    }
}

// ── Retry policy ──

fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Exponential backoff with jitter: 250ms * 2^attempt plus up to 100ms.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_millis(250) * 2u32.saturating_pow(attempt);
    let jitter = Duration::from_millis(rand::rng().random_range(0..100));
    base + jitter
}

// ── Client ──

#[derive(Debug, Default)]
struct ClientStats {
    total_requests: u64,
    total_failures: u64,
    last_success: Option<String>,
}

/// Resilient SDMX client for the ISTAT REST endpoints. Holds one shared
/// reqwest client; the breaker and limiter state is shared by all callers.
pub struct IstatClient {
    http: reqwest::Client,
    base_url: String,
    breaker: CircuitBreaker,
    limiter: UpstreamLimiter,
    retry_max_attempts: u32,
    max_xml_bytes: usize,
    dataflow_cache: Mutex<Option<(Vec<Dataflow>, String)>>,
    dataset_cache: Mutex<HashMap<String, DatasetPayload>>,
    stats: Mutex<ClientStats>,
}

impl IstatClient {
    pub fn new(config: &IstatConfig, max_xml_bytes: usize) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_seconds))
            .user_agent("osservatorio-api")
            .build()
            .map_err(|e| ApiError::internal(format!("http client init failed: {e}")))?;
        Ok(Self {
            http,
            base_url: config.upstream_base_url.trim_end_matches('/').to_string(),
            breaker: CircuitBreaker::new(
                config.circuit_breaker_threshold,
                Duration::from_secs(config.circuit_breaker_cooldown_seconds),
            ),
            limiter: UpstreamLimiter::new(
                config.max_concurrent_requests,
                config.requests_per_minute,
            ),
            retry_max_attempts: config.retry_max_attempts.max(1),
            max_xml_bytes,
            dataflow_cache: Mutex::new(None),
            dataset_cache: Mutex::new(HashMap::new()),
            stats: Mutex::new(ClientStats::default()),
        })
    }

    /// Resilient GET: retry with backoff inside the circuit breaker, every
    /// attempt gated by the upstream limiter and the per-attempt timeout on
    /// the shared client.
    async fn fetch_text(&self, path: &str) -> ApiResult<String> {
        self.breaker.check()?;
        self.stats.lock().unwrap().total_requests += 1;
        let url = format!("{}{path}", self.base_url);

        let mut last_error = ApiError::UpstreamUnavailable("no attempt made".to_string());
        for attempt in 0..self.retry_max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            let _permit = match self.limiter.acquire().await {
                Ok(p) => p,
                Err(e) => {
                    last_error = e;
                    continue;
                }
            };
            match self.http.get(&url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        match response.text().await {
                            Ok(body) => {
                                self.breaker.record_success();
                                self.stats.lock().unwrap().last_success = Some(now_ts());
                                return Ok(body);
                            }
                            Err(e) => {
                                last_error = ApiError::UpstreamUnavailable(e.to_string());
                            }
                        }
                    } else if is_transient_status(status) {
                        tracing::warn!("upstream {url} returned {status}, attempt {}", attempt + 1);
                        last_error = ApiError::UpstreamUnavailable(format!(
                            "upstream returned status {status}"
                        ));
                    } else {
                        // non-transient: no retry, no breaker trip
                        self.stats.lock().unwrap().total_failures += 1;
                        return Err(ApiError::UpstreamUnavailable(format!(
                            "upstream returned status {status}"
                        )));
                    }
                }
                Err(e) => {
                    tracing::warn!("upstream {url} failed: {e}, attempt {}", attempt + 1);
                    last_error = ApiError::UpstreamUnavailable(e.to_string());
                }
            }
        }
        self.breaker.record_failure();
        self.stats.lock().unwrap().total_failures += 1;
        Err(last_error)
    }

    /// List upstream dataflows. Serves the last-known-good listing when the
    /// upstream is unreachable; an open breaker propagates as-is.
    pub async fn fetch_dataflows(&self, limit: Option<usize>) -> ApiResult<DataflowListing> {
        match self.fetch_text("/dataflow/IT1").await {
            Ok(body) => {
                let mut dataflows = sdmx::parse_dataflows(&body, self.max_xml_bytes)?;
                let fetched_at = now_ts();
                *self.dataflow_cache.lock().unwrap() =
                    Some((dataflows.clone(), fetched_at.clone()));
                if let Some(n) = limit {
                    dataflows.truncate(n);
                }
                Ok(DataflowListing { dataflows, source: PayloadSource::Live, fetched_at })
            }
            Err(ApiError::CircuitOpen) => Err(ApiError::CircuitOpen),
            Err(err) => {
                let cached = self.dataflow_cache.lock().unwrap().clone();
                match cached {
                    Some((mut dataflows, fetched_at)) => {
                        tracing::warn!("serving dataflows from cache fallback: {err}");
                        if let Some(n) = limit {
                            dataflows.truncate(n);
                        }
                        Ok(DataflowListing {
                            dataflows,
                            source: PayloadSource::CacheFallback,
                            fetched_at,
                        })
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Fetch one dataset. `include_data=false` resolves only the dataflow
    /// descriptor; `true` pulls and parses the observation payload.
    pub async fn fetch_dataset(
        &self,
        dataset_id: &str,
        include_data: bool,
    ) -> ApiResult<DatasetPayload> {
        let encoded = urlencoding::encode(dataset_id);
        if !include_data {
            let body = self.fetch_text(&format!("/dataflow/IT1/{encoded}")).await?;
            let flows = sdmx::parse_dataflows(&body, self.max_xml_bytes)?;
            let flow = flows.into_iter().find(|f| f.id == dataset_id);
            return Ok(DatasetPayload {
                dataset_id: dataset_id.to_string(),
                name: flow.map(|f| f.display_name),
                category: None,
                observations: Vec::new(),
            });
        }

        match self.fetch_text(&format!("/data/{encoded}")).await {
            Ok(body) => {
                let observations =
                    sdmx::parse_observations(&body, dataset_id, self.max_xml_bytes)?;
                let payload = DatasetPayload {
                    dataset_id: dataset_id.to_string(),
                    name: None,
                    category: None,
                    observations,
                };
                self.dataset_cache
                    .lock()
                    .unwrap()
                    .insert(dataset_id.to_string(), payload.clone());
                Ok(payload)
            }
            Err(ApiError::CircuitOpen) => Err(ApiError::CircuitOpen),
            Err(err) => {
                let cached = self.dataset_cache.lock().unwrap().get(dataset_id).cloned();
                match cached {
                    Some(payload) => {
                        tracing::warn!(
                            "serving dataset {dataset_id} from cache fallback: {err}"
                        );
                        Ok(payload)
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Fetch plus quality assessment.
    pub async fn fetch_with_quality_validation(
        &self,
        dataset_id: &str,
    ) -> ApiResult<(DatasetPayload, QualityResult)> {
        let payload = self.fetch_dataset(dataset_id, true).await?;
        let quality = assess_quality(&payload);
        Ok((payload, quality))
    }

    /// Write observations into the analytics store and update metadata
    /// counters. Duplicate natural keys within the payload are dropped
    /// before insert; the store upserts on the natural key, so re-syncing an
    /// identical payload is a no-op.
    pub async fn sync_to_repository(
        &self,
        repo: &UnifiedRepository,
        payload: &DatasetPayload,
    ) -> ApiResult<SyncResult> {
        let started = Instant::now();

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(payload.observations.len());
        for obs in &payload.observations {
            if seen.insert(obs.natural_key()) {
                unique.push(obs.clone());
            }
        }
        let skipped = payload.observations.len() - unique.len();

        repo.sync_observations(
            &payload.dataset_id,
            payload.name.as_deref(),
            payload.category.as_deref(),
            &unique,
        )
        .await?;

        let elapsed_ms = started.elapsed().as_millis() as i64;
        Ok(SyncResult {
            dataset_id: payload.dataset_id.clone(),
            records_synced: unique.len(),
            records_skipped: skipped,
            sync_time_ms: elapsed_ms,
            timestamp: now_ts(),
        })
    }

    pub fn get_status(&self) -> ClientStatus {
        let stats = self.stats.lock().unwrap();
        ClientStatus {
            circuit_state: self.breaker.state().as_str().to_string(),
            consecutive_failures: self.breaker.consecutive_failures(),
            total_requests: stats.total_requests,
            total_failures: stats.total_failures,
            cache_populated: self.dataflow_cache.lock().unwrap().is_some(),
            last_success: stats.last_success.clone(),
        }
    }

    /// Quick reachability probe; never trips the breaker.
    pub async fn health_check(&self) -> serde_json::Value {
        let url = format!("{}/dataflow/IT1", self.base_url);
        let reachable = match self.http.head(&url).send().await {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 405,
            Err(_) => false,
        };
        serde_json::json!({
            "upstream_reachable": reachable,
            "circuit_state": self.breaker.state().as_str(),
            "checked_at": now_ts(),
        })
    }

}

/// Compute completeness/consistency/validation errors for a payload.
pub fn assess_quality(payload: &DatasetPayload) -> QualityResult {
    let total = payload.observations.len();
    let mut validation_errors = Vec::new();

    if total == 0 {
        return QualityResult {
            completeness: 0.0,
            consistency: 0.0,
            validation_errors: vec!["payload contains no observations".to_string()],
            quality_score: 0.0,
        };
    }

    let non_null = payload.observations.iter().filter(|o| o.obs_value.is_some()).count();
    let completeness = non_null as f64 / total as f64;

    let mut keys = HashSet::new();
    let mut duplicates = 0usize;
    for obs in &payload.observations {
        if !keys.insert(obs.natural_key()) {
            duplicates += 1;
        }
        if obs.territory_code.is_empty() {
            validation_errors.push(format!(
                "observation at {} has an empty territory code",
                obs.time_period
            ));
        }
        if obs.year == 0 {
            validation_errors.push(format!(
                "observation at {:?} has an unparseable time period",
                obs.time_period
            ));
        }
    }
    if duplicates > 0 {
        validation_errors.push(format!("{duplicates} duplicate observation keys"));
    }
    let consistency = 1.0 - duplicates as f64 / total as f64;

    let penalty = 0.1 * validation_errors.len() as f64;
    let quality_score = (0.6 * completeness + 0.4 * consistency - penalty).clamp(0.0, 1.0);

    QualityResult { completeness, consistency, validation_errors, quality_score }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::observation::Observation;

    fn obs(time: &str, territory: &str, measure: &str, value: Option<f64>) -> Observation {
        Observation {
            dataset_id: "TEST_DS".to_string(),
            year: time.get(..4).and_then(|y| y.parse().ok()).unwrap_or(0),
            time_period: time.to_string(),
            territory_code: territory.to_string(),
            territory_name: territory.to_string(),
            measure_code: measure.to_string(),
            measure_name: measure.to_string(),
            obs_value: value,
            obs_status: "A".to_string(),
        }
    }

    // ── Circuit breaker ──

    #[test]
    fn breaker_opens_at_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(60));
        for _ in 0..4 {
            breaker.check().unwrap();
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.check().unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let err = breaker.check().unwrap_err();
        assert_eq!(err.error_code(), "CIRCUIT_OPEN");
    }

    #[test]
    fn breaker_half_open_admits_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // zero cooldown: first check transitions to half-open and admits
        breaker.check().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // second caller is rejected while the probe is in flight
        assert!(breaker.check().is_err());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.check().unwrap();
    }

    #[test]
    fn breaker_reopens_on_failed_probe() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        breaker.check().unwrap(); // half-open probe
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    // ── Retry policy ──

    #[test]
    fn transient_classification() {
        assert!(is_transient_status(429));
        assert!(is_transient_status(500));
        assert!(is_transient_status(503));
        assert!(!is_transient_status(400));
        assert!(!is_transient_status(404));
        assert!(!is_transient_status(200));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let d0 = backoff_delay(0);
        let d2 = backoff_delay(2);
        assert!(d0 >= Duration::from_millis(250) && d0 < Duration::from_millis(350));
        assert!(d2 >= Duration::from_millis(1000) && d2 < Duration::from_millis(1100));
    }

    // ── Quality validation ──

    #[test]
    fn quality_of_clean_payload() {
        let payload = DatasetPayload {
            dataset_id: "TEST_DS".to_string(),
            name: None,
            category: None,
            observations: vec![
                obs("2022", "IT", "POP", Some(1.0)),
                obs("2023", "IT", "POP", Some(2.0)),
            ],
        };
        let q = assess_quality(&payload);
        assert_eq!(q.completeness, 1.0);
        assert_eq!(q.consistency, 1.0);
        assert!(q.validation_errors.is_empty());
        assert_eq!(q.quality_score, 1.0);
    }

    #[test]
    fn quality_penalizes_nulls_and_duplicates() {
        let payload = DatasetPayload {
            dataset_id: "TEST_DS".to_string(),
            name: None,
            category: None,
            observations: vec![
                obs("2022", "IT", "POP", Some(1.0)),
                obs("2022", "IT", "POP", Some(1.0)), // duplicate key
                obs("2023", "IT", "POP", None),
                obs("2024", "IT", "POP", Some(3.0)),
            ],
        };
        let q = assess_quality(&payload);
        assert_eq!(q.completeness, 0.75);
        assert_eq!(q.consistency, 0.75);
        assert_eq!(q.validation_errors.len(), 1);
        assert!(q.quality_score < 0.75);
    }

    #[test]
    fn quality_of_empty_payload_is_zero() {
        let payload = DatasetPayload {
            dataset_id: "TEST_DS".to_string(),
            name: None,
            category: None,
            observations: vec![],
        };
        let q = assess_quality(&payload);
        assert_eq!(q.quality_score, 0.0);
        assert_eq!(q.validation_errors.len(), 1);
    }

    #[test]
    fn quality_flags_bad_coordinates() {
        let payload = DatasetPayload {
            dataset_id: "TEST_DS".to_string(),
            name: None,
            category: None,
            observations: vec![obs("bad-period", "", "POP", Some(1.0))],
        };
        let q = assess_quality(&payload);
        assert_eq!(q.validation_errors.len(), 2);
        assert!(q.quality_score < 0.9);
    }
}
