//! Entitlement fetching with shared in-flight requests and bounded
//! positive-expectation retries.
//!
//! Resolution moves through three phases:
//! - `Idle`: nothing memoized; the next caller starts a resolution
//! - `InFlight`: a resolution is running; every caller awaits the same cell
//! - `Resolved`: the cell holds a result; callers get it without I/O
//!
//! Clearing the memo returns to `Idle` without cancelling anything: a stale
//! in-flight fetch still completes for the callers already awaiting it.
//!
//! Retries only cover "fetch succeeded but the page is still locked". Each
//! attempt spends one unit of budget; the loop stops on an enabling result
//! or an exhausted budget, sleeping a fixed delay in between.

use crate::client::fetcher::{entitlements_url, Fetcher};
use crate::clock::Clock;
use crate::config::EntitlementsConfig;
use crate::policy::entitlements::Entitlements;
use crate::policy::gaa::fresh_params;
use crate::protocol::models::parse_entitlements_response;
use crate::protocol::pingback::EncodedParams;
use crate::{lock_unpoisoned, PaywardenError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Injectable wait used between retries.
#[async_trait]
pub trait Delay: Send + Sync {
    /// Suspend the caller for `duration`.
    async fn wait(&self, duration: Duration);
}

/// Delay backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl Delay for TokioDelay {
    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// A memoized resolution shared by every caller that joined it.
pub type SharedResolution = Arc<OnceCell<Result<Entitlements, PaywardenError>>>;

/// Observable phase of the memo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionPhase {
    /// Nothing memoized.
    Idle,
    /// A resolution is running.
    InFlight,
    /// A result is memoized.
    Resolved,
}

/// Holder of the current shared resolution.
#[derive(Debug, Default)]
pub struct ResolutionMemo {
    slot: Mutex<Option<SharedResolution>>,
}

impl ResolutionMemo {
    /// Create an idle memo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the current resolution, creating one if idle.
    pub fn join(&self) -> SharedResolution {
        let mut slot = lock_unpoisoned(&self.slot);
        slot.get_or_insert_with(|| Arc::new(OnceCell::new())).clone()
    }

    /// Forget the current resolution.
    pub fn clear(&self) {
        *lock_unpoisoned(&self.slot) = None;
    }

    /// Current phase.
    pub fn phase(&self) -> ResolutionPhase {
        match lock_unpoisoned(&self.slot).as_ref() {
            None => ResolutionPhase::Idle,
            Some(cell) if cell.initialized() => ResolutionPhase::Resolved,
            Some(_) => ResolutionPhase::InFlight,
        }
    }
}

/// Per-request inputs that vary between resolutions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchRequest {
    /// Ask the service to decrypt this document key.
    pub encrypted_document_key: Option<String>,
    /// Continuity token from an earlier response.
    pub user_token: Option<String>,
}

/// Result of a (possibly retried) fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// The set from the last attempt.
    pub entitlements: Entitlements,
    /// Continuity token returned by the last attempt.
    pub user_token: Option<String>,
    /// Network round trips performed.
    pub attempts: u32,
}

/// Performs network resolutions for one page context.
pub struct FetchRetryCoordinator {
    fetcher: Arc<dyn Fetcher>,
    delay: Arc<dyn Delay>,
    clock: Arc<dyn Clock>,
    config: EntitlementsConfig,
    service_id: String,
}

impl FetchRetryCoordinator {
    /// Create a coordinator.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        delay: Arc<dyn Delay>,
        clock: Arc<dyn Clock>,
        config: EntitlementsConfig,
        service_id: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            delay,
            clock,
            config,
            service_id: service_id.into(),
        }
    }

    /// URL of the entitlements endpoint for `request`.
    pub fn request_url(&self, request: &FetchRequest) -> Result<String, PaywardenError> {
        let mut pairs: Vec<(&str, String)> = Vec::new();

        if let Some(key) = &request.encrypted_document_key {
            pairs.push(("crypt", key.clone()));
        }
        if let Some(token) = &request.user_token {
            pairs.push(("sut", token.clone()));
        }
        if let Some(gaa) = fresh_params(&self.config.page_query, false, self.clock.as_ref()) {
            for (name, value) in gaa.query_pairs() {
                pairs.push((name, value.to_string()));
            }
        }
        if !self.config.canonical_url.is_empty() {
            let encoded = EncodedParams::for_canonical_url(&self.config.canonical_url).encode()?;
            pairs.push(("encodedParams", encoded));
        }

        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (*k, v.as_str())).collect();
        entitlements_url(
            &self.config.service_url,
            &self.config.publication_id,
            &borrowed,
        )
    }

    /// One network round trip.
    pub async fn fetch_once(&self, request: &FetchRequest) -> Result<FetchOutcome, PaywardenError> {
        let url = self.request_url(request)?;
        let body = self.fetcher.fetch_credentialed_json(&url).await?;
        let response = parse_entitlements_response(body)?;
        let entitlements = Entitlements::from_response(
            &self.service_id,
            &response,
            self.config.product_id.clone(),
            self.clock.as_ref(),
        )?;

        Ok(FetchOutcome {
            entitlements,
            user_token: response.swg_user_token,
            attempts: 1,
        })
    }

    /// Fetch, retrying while the result does not enable the page and budget remains.
    ///
    /// A budget of 0 still performs one attempt. Hard errors are returned
    /// immediately and never retried.
    pub async fn fetch_with_retries(
        &self,
        request: &FetchRequest,
        positive_retries: u32,
    ) -> Result<FetchOutcome, PaywardenError> {
        let mut remaining = positive_retries;
        let mut attempts = 0;

        loop {
            remaining = remaining.saturating_sub(1);
            attempts += 1;

            let mut outcome = self.fetch_once(request).await?;
            outcome.attempts = attempts;

            if outcome.entitlements.enables_this() {
                debug!(attempts, "entitlements enable this page");
                return Ok(outcome);
            }
            if remaining == 0 {
                if positive_retries > 0 {
                    info!(attempts, "positive retries exhausted; page still locked");
                }
                return Ok(outcome);
            }

            debug!(
                attempts,
                remaining,
                delay_ms = self.config.retry_delay.as_millis() as u64,
                "entitlements not yet positive; retrying"
            );
            self.delay.wait(self.config.retry_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    struct ScriptedFetcher {
        responses: Mutex<VecDeque<Result<Value, PaywardenError>>>,
        urls: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn new(responses: Vec<Result<Value, PaywardenError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                urls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.urls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch_credentialed_json(&self, url: &str) -> Result<Value, PaywardenError> {
            self.urls.lock().unwrap().push(url.to_string());
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.pop_front().unwrap()
            } else {
                responses.front().cloned().unwrap()
            }
        }

        async fn send_post(&self, _url: &str, _message: &Value) -> Result<Value, PaywardenError> {
            Ok(json!({}))
        }

        fn send_beacon(&self, _url: &str, _message: &Value) {}
    }

    #[derive(Default)]
    struct RecordingDelay {
        waits: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Delay for RecordingDelay {
        async fn wait(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    const PRODUCT: &str = "news.example:basic";

    fn config() -> EntitlementsConfig {
        EntitlementsConfig::new("news.example", "https://api.example/v1").with_product(PRODUCT)
    }

    fn coordinator(
        fetcher: Arc<ScriptedFetcher>,
        delay: Arc<RecordingDelay>,
        config: EntitlementsConfig,
    ) -> FetchRetryCoordinator {
        FetchRetryCoordinator::new(
            fetcher,
            delay,
            Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z")),
            config,
            "svc",
        )
    }

    fn negative() -> Result<Value, PaywardenError> {
        Ok(json!({"entitlements": []}))
    }

    fn positive() -> Result<Value, PaywardenError> {
        Ok(json!({"entitlements": [{"source": "google", "products": [PRODUCT]}]}))
    }

    #[tokio::test]
    async fn test_no_budget_single_attempt() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![negative()]));
        let delay = Arc::new(RecordingDelay::default());
        let coordinator = coordinator(fetcher.clone(), delay.clone(), config());

        let outcome = coordinator
            .fetch_with_retries(&FetchRequest::default(), 0)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert_eq!(fetcher.calls(), 1);
        assert!(delay.waits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_exhaustion() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![negative()]));
        let delay = Arc::new(RecordingDelay::default());
        let coordinator = coordinator(fetcher.clone(), delay.clone(), config());

        let outcome = coordinator
            .fetch_with_retries(&FetchRequest::default(), 3)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(fetcher.calls(), 3);
        assert!(!outcome.entitlements.enables_this());
        assert_eq!(
            *delay.waits.lock().unwrap(),
            vec![Duration::from_millis(550); 2]
        );
    }

    #[tokio::test]
    async fn test_retry_stops_on_positive() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![negative(), positive()]));
        let delay = Arc::new(RecordingDelay::default());
        let coordinator = coordinator(fetcher.clone(), delay.clone(), config());

        let outcome = coordinator
            .fetch_with_retries(&FetchRequest::default(), 3)
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 2);
        assert!(outcome.entitlements.enables_this());
        assert_eq!(delay.waits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_not_retried() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(PaywardenError::Transport(
            "offline".to_string(),
        ))]));
        let delay = Arc::new(RecordingDelay::default());
        let coordinator = coordinator(fetcher.clone(), delay.clone(), config());

        let result = coordinator
            .fetch_with_retries(&FetchRequest::default(), 3)
            .await;
        assert!(matches!(result, Err(PaywardenError::Transport(_))));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_user_token_returned() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Ok(json!({
            "entitlements": [],
            "swgUserToken": "sut-9"
        }))]));
        let delay = Arc::new(RecordingDelay::default());
        let coordinator = coordinator(fetcher, delay, config());

        let outcome = coordinator.fetch_once(&FetchRequest::default()).await.unwrap();
        assert_eq!(outcome.user_token, Some("sut-9".to_string()));
    }

    #[test]
    fn test_request_url_params() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let expiry = format!("{:x}", clock.now_epoch_seconds() + 60);
        let config = config()
            .with_canonical_url("https://news.example/a")
            .with_page_query(format!("?gaa_at=g&gaa_n=n&gaa_sig=s&gaa_ts={}", expiry));
        let coordinator = coordinator(
            Arc::new(ScriptedFetcher::new(vec![negative()])),
            Arc::new(RecordingDelay::default()),
            config,
        );

        let url = coordinator
            .request_url(&FetchRequest {
                encrypted_document_key: Some("enc".to_string()),
                user_token: Some("sut".to_string()),
            })
            .unwrap();

        assert!(url.starts_with("https://api.example/v1/publication/news.example/entitlements?"));
        assert!(url.contains("crypt=enc"));
        assert!(url.contains("sut=sut"));
        assert!(url.contains(&format!("gaa_ts={}", expiry)));
        assert!(url.contains("encodedParams="));
    }

    #[test]
    fn test_memo_phases() {
        let memo = ResolutionMemo::new();
        assert_eq!(memo.phase(), ResolutionPhase::Idle);

        let first = memo.join();
        let second = memo.join();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(memo.phase(), ResolutionPhase::InFlight);

        first
            .set(Ok(Entitlements::empty("svc", None)))
            .unwrap();
        assert_eq!(memo.phase(), ResolutionPhase::Resolved);

        memo.clear();
        assert_eq!(memo.phase(), ResolutionPhase::Idle);
        assert!(!Arc::ptr_eq(&first, &memo.join()));
    }
}
