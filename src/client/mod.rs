//! Rate-limited access to the places directory.
//!
//! [`PlacesApi`] is the raw transport seam. [`RateLimitedClient`] wraps one
//! transport with shared pacing, bounded retries for transient failures, and
//! a cost ledger. A single client is shared by every worker in a run.

pub mod cost;
pub mod google;
pub mod pacing;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::ServiceError;
use crate::record::{IdentityHint, PlaceDetails, PlacePhoto};

pub use cost::{CallType, CostLedger, CostSnapshot};
pub use google::GooglePlacesApi;
pub use pacing::Pacer;
pub use retry::RetryPolicy;

/// Raw capability calls against the directory service.
#[async_trait]
pub trait PlacesApi: Send + Sync {
    /// Maps an identity hint to the directory's reference for the listing.
    async fn resolve_place(&self, hint: &IdentityHint) -> Result<String, ServiceError>;

    /// Fetches the details facet for a resolved listing.
    async fn fetch_details(&self, external_ref: &str) -> Result<PlaceDetails, ServiceError>;

    /// Lists photo references for a resolved listing, in service order.
    async fn fetch_photos(&self, external_ref: &str) -> Result<Vec<PlacePhoto>, ServiceError>;
}

/// Paced, retrying wrapper around a [`PlacesApi`].
pub struct RateLimitedClient {
    api: Arc<dyn PlacesApi>,
    pacer: Pacer,
    retry: RetryPolicy,
    ledger: CostLedger,
}

impl RateLimitedClient {
    /// Wraps `api`, admitting at most `qps` attempts per second.
    pub fn new(api: Arc<dyn PlacesApi>, qps: f64, retry: RetryPolicy) -> Self {
        Self::with_pacer(api, Pacer::new(qps), retry)
    }

    /// Wraps `api` with a caller-supplied pacer.
    pub fn with_pacer(api: Arc<dyn PlacesApi>, pacer: Pacer, retry: RetryPolicy) -> Self {
        Self {
            api,
            pacer,
            retry,
            ledger: CostLedger::default(),
        }
    }

    /// Resolves a listing reference.
    pub async fn resolve_place(&self, hint: &IdentityHint) -> Result<String, ServiceError> {
        self.call(CallType::Resolve, move || self.api.resolve_place(hint))
            .await
    }

    /// Fetches details for a listing.
    pub async fn fetch_details(&self, external_ref: &str) -> Result<PlaceDetails, ServiceError> {
        self.call(CallType::Details, move || self.api.fetch_details(external_ref))
            .await
    }

    /// Lists photos for a listing.
    pub async fn fetch_photos(&self, external_ref: &str) -> Result<Vec<PlacePhoto>, ServiceError> {
        self.call(CallType::Photos, move || self.api.fetch_photos(external_ref))
            .await
    }

    /// Call counts and estimated spend so far.
    pub fn cost(&self) -> CostSnapshot {
        self.ledger.snapshot()
    }

    async fn call<T, F, Fut>(&self, call_type: CallType, mut op: F) -> Result<T, ServiceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.pacer.acquire().await;
            self.ledger.record(call_type);
            debug!(call = call_type.as_str(), attempt, "directory request");
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            call = call_type.as_str(),
                            attempt,
                            kind = %err.kind,
                            backoff_ms = delay.as_millis() as u64,
                            "transient directory failure; retrying"
                        );
                        sleep(delay).await;
                    }
                    None => return Err(err),
                },
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Replays a scripted sequence of details results.
    struct Scripted {
        details: Mutex<Vec<Result<PlaceDetails, ServiceError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut script: Vec<Result<PlaceDetails, ServiceError>>) -> Self {
            script.reverse();
            Self {
                details: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PlacesApi for Scripted {
        async fn resolve_place(&self, _hint: &IdentityHint) -> Result<String, ServiceError> {
            Ok("ref".to_string())
        }

        async fn fetch_details(&self, _external_ref: &str) -> Result<PlaceDetails, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.details
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(ServiceError::not_found("script exhausted")))
        }

        async fn fetch_photos(&self, _external_ref: &str) -> Result<Vec<PlacePhoto>, ServiceError> {
            Ok(Vec::new())
        }
    }

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let api = Arc::new(Scripted::new(vec![
            Err(ServiceError::new(FailureKind::RateLimited, "slow down")),
            Err(ServiceError::new(FailureKind::Unavailable, "502")),
            Ok(PlaceDetails {
                address: "1 Lane".into(),
                ..PlaceDetails::default()
            }),
        ]));
        let client = RateLimitedClient::new(api.clone(), 1000.0, policy(4));

        let start = Instant::now();
        let details = client.fetch_details("ref").await.expect("third attempt wins");
        assert_eq!(details.address, "1 Lane");
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
        // 100ms + 200ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(client.cost().details_calls, 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn permanent_failures_fail_immediately() {
        let api = Arc::new(Scripted::new(vec![Err(ServiceError::new(
            FailureKind::AuthDenied,
            "REQUEST_DENIED",
        ))]));
        let client = RateLimitedClient::new(api.clone(), 1000.0, policy(4));

        let err = client.fetch_details("ref").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::AuthDenied);
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn retry_budget_is_bounded() {
        let api = Arc::new(Scripted::new(vec![
            Err(ServiceError::new(FailureKind::Timeout, "t1")),
            Err(ServiceError::new(FailureKind::Timeout, "t2")),
            Err(ServiceError::new(FailureKind::Timeout, "t3")),
            Ok(PlaceDetails::default()),
        ]));
        let client = RateLimitedClient::new(api.clone(), 1000.0, policy(3));

        let err = client.fetch_details("ref").await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Timeout);
        assert_eq!(err.message, "t3");
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn calls_respect_the_rate_ceiling() {
        let api = Arc::new(Scripted::new(Vec::new()));
        let client = RateLimitedClient::new(api, 2.0, RetryPolicy::no_retry());

        let start = Instant::now();
        for _ in 0..5 {
            client.resolve_place(&hint()).await.unwrap();
        }
        // five calls at 2 qps occupy four full intervals
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(client.cost().resolve_calls, 5);
    }

    fn hint() -> IdentityHint {
        IdentityHint {
            name: "Green Farm".into(),
            address: None,
            location: None,
        }
    }
}
