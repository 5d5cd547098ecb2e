use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::metadata_db::MetadataDb;

/// One-hour sliding windows with second granularity.
pub const WINDOW_SECS: i64 = 3600;

/// Result of a rate-limit check, carrying everything needed for the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_epoch: i64,
}

impl RateDecision {
    pub fn deny_error(&self) -> ApiError {
        ApiError::RateLimited {
            limit: self.limit,
            remaining: self.remaining,
            reset: self.reset_epoch,
        }
    }
}

/// Per-key, per-endpoint sliding-window limiter. Check-and-increment is
/// atomic inside the metadata store transaction.
pub struct RateLimiter {
    db: Arc<MetadataDb>,
}

impl RateLimiter {
    pub fn new(db: Arc<MetadataDb>) -> Self {
        Self { db }
    }

    pub fn check(&self, api_key_id: i64, endpoint: &str, limit: i64) -> ApiResult<RateDecision> {
        self.check_at(api_key_id, endpoint, limit, chrono::Utc::now().timestamp())
    }

    pub fn check_at(
        &self,
        api_key_id: i64,
        endpoint: &str,
        limit: i64,
        now_epoch: i64,
    ) -> ApiResult<RateDecision> {
        let outcome =
            self.db.rate_limit_hit(api_key_id, endpoint, limit, WINDOW_SECS, now_epoch)?;
        Ok(RateDecision {
            allowed: outcome.allowed,
            limit,
            remaining: (limit - outcome.request_count).max(0),
            reset_epoch: outcome.window_end_epoch,
        })
    }

    /// Drop windows that ended before `now`; called from the maintenance
    /// sweep.
    pub fn cleanup(&self, now_epoch: i64) -> ApiResult<usize> {
        self.db.cleanup_expired_windows(now_epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MetadataDb::open_in_memory().unwrap()))
    }

    #[test]
    fn hundred_and_first_request_is_denied() {
        let limiter = limiter();
        let base = 1_700_000_000;
        for i in 0..100 {
            let decision = limiter.check_at(1, "/datasets", 100, base + i).unwrap();
            assert!(decision.allowed, "request {} should pass", i + 1);
            assert_eq!(decision.remaining, 100 - (i + 1));
        }
        let denied = limiter.check_at(1, "/datasets", 100, base + 200).unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_epoch, base + WINDOW_SECS);

        let err = denied.deny_error();
        assert_eq!(err.error_code(), "RATE_LIMITED");
    }

    #[test]
    fn denied_requests_do_not_consume_budget() {
        let limiter = limiter();
        let base = 1_700_000_000;
        for i in 0..3 {
            limiter.check_at(7, "/odata/Datasets", 3, base + i).unwrap();
        }
        for i in 0..5 {
            assert!(!limiter.check_at(7, "/odata/Datasets", 3, base + 10 + i).unwrap().allowed);
        }
        // the window still resets on schedule
        let fresh = limiter.check_at(7, "/odata/Datasets", 3, base + WINDOW_SECS + 1).unwrap();
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 2);
    }

    #[test]
    fn windows_are_per_key_and_endpoint() {
        let limiter = limiter();
        let base = 1_700_000_000;
        assert!(limiter.check_at(1, "/datasets", 1, base).unwrap().allowed);
        assert!(!limiter.check_at(1, "/datasets", 1, base + 1).unwrap().allowed);
        // different endpoint, same key
        assert!(limiter.check_at(1, "/datasets/{id}", 1, base + 2).unwrap().allowed);
        // different key, same endpoint
        assert!(limiter.check_at(2, "/datasets", 1, base + 3).unwrap().allowed);
    }
}
