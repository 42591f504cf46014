//! Entitlements manager - the main public API for Paywarden.
//!
//! The `EntitlementsManager` answers "what can this visitor read on this
//! page?" and keeps that answer consistent:
//! - Cached positive answers are reused within the session
//! - Concurrent callers share one network resolution
//! - A caller expecting a positive answer (after a purchase) buys a few
//!   delayed retries
//! - Metering grants are consumed and reported at most once

use crate::cache::consistency::ConsistencyCache;
use crate::cache::file::FileStorage;
use crate::cache::storage::Storage;
use crate::client::fetcher::Fetcher;
use crate::client::http::HttpFetcher;
use crate::client::retry::{
    Delay, FetchRequest, FetchRetryCoordinator, ResolutionMemo, ResolutionPhase, TokioDelay,
};
use crate::clock::{Clock, SystemClock};
use crate::config::EntitlementsConfig;
use crate::integrations::{AnalyticsEvent, EventSink, NoopToastUi, ToastUi, TracingEventSink};
use crate::meter::consume::{ConsumeTrigger, ConsumptionProtocol, DismissCallback};
use crate::policy::entitlements::Entitlements;
use crate::protocol::pingback::ShowcaseEvent;
use crate::{lock_unpoisoned, PaywardenError};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Service id attached to every resolved set.
pub const SERVICE_ID: &str = "subscribe.google.com";

const NOTIFICATION_CAPACITY: usize = 16;

/// External capabilities the manager drives.
#[derive(Clone)]
pub struct Collaborators {
    /// Network transport.
    pub fetcher: Arc<dyn Fetcher>,
    /// Session and local key/value storage.
    pub storage: Arc<dyn Storage>,
    /// Toast presentation.
    pub toast: Arc<dyn ToastUi>,
    /// Analytics sink.
    pub events: Arc<dyn EventSink>,
}

impl Collaborators {
    /// Network and storage, with a silent toast UI and tracing analytics.
    pub fn new(fetcher: Arc<dyn Fetcher>, storage: Arc<dyn Storage>) -> Self {
        Self {
            fetcher,
            storage,
            toast: Arc::new(NoopToastUi),
            events: Arc::new(TracingEventSink),
        }
    }

    /// HTTP transport and file-backed storage under `cache_namespace`.
    pub fn http(user_agent_product: &str, cache_namespace: &str) -> Result<Self, PaywardenError> {
        Ok(Self::new(
            Arc::new(HttpFetcher::new(user_agent_product)?),
            Arc::new(FileStorage::new(cache_namespace)?),
        ))
    }

    /// Replace the toast UI.
    pub fn with_toast(mut self, toast: Arc<dyn ToastUi>) -> Self {
        self.toast = toast;
        self
    }

    /// Replace the analytics sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }
}

/// Options for one [`EntitlementsManager::get_entitlements`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetEntitlementsParams {
    /// Document key to decrypt. Forces a network resolution.
    pub encrypted_document_key: Option<String>,
}

/// One-shot suppression flag, consumed by the next resolution that reaches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Gate {
    #[default]
    Open,
    BlockNext,
}

impl Gate {
    /// Reopen the gate, returning whether it was blocking.
    fn take(&mut self) -> bool {
        std::mem::take(self) == Gate::BlockNext
    }
}

#[derive(Debug, Default)]
struct EngineState {
    positive_retries: u32,
    notification: Gate,
    toast: Gate,
}

/// Entitlement resolution and consumption for one page context.
///
/// Create one instance per page and share it; every method takes `&self`.
pub struct EntitlementsManager {
    config: EntitlementsConfig,
    memo: ResolutionMemo,
    coordinator: FetchRetryCoordinator,
    cache: Arc<ConsistencyCache>,
    protocol: Arc<ConsumptionProtocol>,
    events: Arc<dyn EventSink>,
    state: Mutex<EngineState>,
    notifications: broadcast::Sender<Entitlements>,
    followups: Mutex<Vec<JoinHandle<()>>>,
}

impl EntitlementsManager {
    /// Create a manager using the system clock and tokio timers.
    ///
    /// # Errors
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(
        config: EntitlementsConfig,
        collaborators: Collaborators,
    ) -> Result<Self, PaywardenError> {
        Self::with_seams(
            config,
            collaborators,
            Arc::new(SystemClock),
            Arc::new(TokioDelay),
        )
    }

    /// Create a manager with an explicit clock and retry delay.
    pub fn with_seams(
        config: EntitlementsConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        delay: Arc<dyn Delay>,
    ) -> Result<Self, PaywardenError> {
        config.validate()?;

        let Collaborators {
            fetcher,
            storage,
            toast,
            events,
        } = collaborators;

        let cache = Arc::new(ConsistencyCache::new(
            storage,
            clock.clone(),
            SERVICE_ID,
            config.product_id.clone(),
        ));
        let coordinator = FetchRetryCoordinator::new(
            fetcher.clone(),
            delay,
            clock.clone(),
            config.clone(),
            SERVICE_ID,
        );
        let protocol = Arc::new(ConsumptionProtocol::new(
            fetcher,
            cache.clone(),
            clock,
            toast,
            events.clone(),
            config.clone(),
        ));
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        Ok(Self {
            config,
            memo: ResolutionMemo::new(),
            coordinator,
            cache,
            protocol,
            events,
            state: Mutex::new(EngineState::default()),
            notifications,
            followups: Mutex::new(Vec::new()),
        })
    }

    /// Resolve entitlements for the page.
    ///
    /// Callers arriving while a resolution is in flight, or after it
    /// resolved, share its result; their `params` are ignored. Call
    /// [`reset`](Self::reset) to force a fresh resolution.
    ///
    /// # Errors
    /// Transport and payload errors from the fetcher propagate unchanged.
    pub async fn get_entitlements(
        &self,
        params: Option<GetEntitlementsParams>,
    ) -> Result<Entitlements, PaywardenError> {
        let resolution = self.memo.join();
        resolution
            .get_or_init(|| self.resolve(params))
            .await
            .clone()
    }

    async fn resolve(
        &self,
        params: Option<GetEntitlementsParams>,
    ) -> Result<Entitlements, PaywardenError> {
        let positive_retries = {
            let mut state = lock_unpoisoned(&self.state);
            std::mem::take(&mut state.positive_retries)
        };
        let encrypted_document_key = params.and_then(|p| p.encrypted_document_key);

        let set = match self.read_cache(encrypted_document_key.is_some()).await {
            Some(cached) => {
                debug!("entitlements served from cache");
                cached
            }
            None => {
                self.fetch(encrypted_document_key, positive_retries)
                    .await?
            }
        };

        self.on_entitlements_fetched(&set).await;
        Ok(set)
    }

    async fn read_cache(&self, needs_decryption: bool) -> Option<Entitlements> {
        if needs_decryption {
            return None;
        }
        self.cache.read().await.filter(|set| set.enables_this())
    }

    async fn fetch(
        &self,
        encrypted_document_key: Option<String>,
        positive_retries: u32,
    ) -> Result<Entitlements, PaywardenError> {
        let request = FetchRequest {
            encrypted_document_key,
            user_token: self.cache.user_token().await,
        };
        let outcome = self
            .coordinator
            .fetch_with_retries(&request, positive_retries)
            .await?;

        if let Some(token) = outcome.user_token.as_deref().filter(|t| !t.is_empty()) {
            self.cache.set_user_token(token).await;
        }
        if self.cache.write_if_cacheable(&outcome.entitlements).await {
            debug!("entitlements cached");
        }
        Ok(outcome.entitlements)
    }

    async fn on_entitlements_fetched(&self, set: &Entitlements) {
        let toast_blocked = {
            let mut state = lock_unpoisoned(&self.state);
            if state.notification.take() {
                debug!("notification suppressed for this resolution");
                return;
            }
            state.toast.take()
        };

        // No receivers is fine.
        let _ = self.notifications.send(set.clone());

        let Some(entitlement) = set.get_entitlement_for_this(None) else {
            self.events.log(AnalyticsEvent::NoEntitlements);
            return;
        };

        if entitlement.is_metering() {
            self.events.log(AnalyticsEvent::HasMeteringEntitlements);
            if self.config.default_consumption {
                let protocol = self.protocol.clone();
                let set = set.clone();
                self.spawn_followup(async move {
                    protocol.consume(&set, None).await;
                });
            }
            return;
        }

        self.events.log(AnalyticsEvent::UnlockedBySubscription);
        if self.cache.toast_shown().await {
            return;
        }
        if toast_blocked {
            debug!("access toast suppressed for this resolution");
            return;
        }
        let protocol = self.protocol.clone();
        let entitlement = entitlement.clone();
        self.spawn_followup(async move {
            protocol.show_access_toast(&entitlement).await;
        });
    }

    fn spawn_followup<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut followups = lock_unpoisoned(&self.followups);
        followups.retain(|h| !h.is_finished());
        followups.push(handle);
    }

    /// Wait for toast and consumption follow-ups started by notifications.
    pub async fn settle(&self) {
        loop {
            let pending = std::mem::take(&mut *lock_unpoisoned(&self.followups));
            if pending.is_empty() {
                return;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    warn!(error = %e, "entitlement follow-up task failed");
                }
            }
        }
    }

    /// Forget the memoized resolution.
    ///
    /// With `expect_positive`, the next resolution skips the cache and retries
    /// a negative answer a few times. An in-flight resolution is not cancelled.
    pub async fn reset(&self, expect_positive: bool) {
        self.memo.clear();
        if expect_positive {
            {
                let mut state = lock_unpoisoned(&self.state);
                state.positive_retries = state
                    .positive_retries
                    .max(self.config.expect_positive_retries);
            }
            self.cache.invalidate(true).await;
        }
    }

    /// Full reset, used on sign-out.
    pub async fn clear(&self) {
        self.memo.clear();
        {
            let mut state = lock_unpoisoned(&self.state);
            state.positive_retries = 0;
            state.notification = Gate::Open;
        }
        self.cache.invalidate(true).await;
        self.cache.set_toast_shown(false).await;
    }

    /// Cache a bundle received out of band, e.g. from a completed purchase.
    ///
    /// Returns `true` if the bundle unlocks the page now and was stored.
    pub async fn push_next_entitlements(&self, raw: &str, ready_to_pay: Option<bool>) -> bool {
        let stored = self.cache.push(raw, ready_to_pay).await;
        if stored {
            self.memo.clear();
        }
        stored
    }

    /// Suppress notification for the next resolution.
    pub fn block_next_notification(&self) {
        lock_unpoisoned(&self.state).notification = Gate::BlockNext;
    }

    /// Cancel a pending [`block_next_notification`](Self::block_next_notification).
    pub fn unblock_next_notification(&self) {
        lock_unpoisoned(&self.state).notification = Gate::Open;
    }

    /// Suppress the access toast for the next notified resolution.
    ///
    /// The next resolution that is not itself suppressed uses up the gate,
    /// whatever its outcome.
    pub fn block_next_toast(&self) {
        lock_unpoisoned(&self.state).toast = Gate::BlockNext;
    }

    /// Receive every resolved set that is not suppressed.
    pub fn subscribe(&self) -> broadcast::Receiver<Entitlements> {
        self.notifications.subscribe()
    }

    /// Acknowledge that the visitor saw the unlocked page.
    pub async fn ack(&self, set: &Entitlements) {
        self.protocol.ack(set).await;
    }

    /// Consume the page's metering grant, if that is the best match.
    pub async fn consume(
        &self,
        set: &Entitlements,
        on_dismiss: Option<DismissCallback>,
    ) -> Option<ConsumeTrigger> {
        self.protocol.consume(set, on_dismiss).await
    }

    /// Report a page-level event. Returns whether a pingback was sent.
    ///
    /// The embedder's event-stream listener calls this for every page-level
    /// event; the event also reaches the analytics sink.
    pub async fn handle_showcase_event(
        &self,
        event: ShowcaseEvent,
        is_user_registered: Option<bool>,
    ) -> bool {
        self.protocol
            .handle_showcase_event(event, is_user_registered)
            .await
    }

    /// Phase of the memoized resolution.
    pub fn resolution_phase(&self) -> ResolutionPhase {
        self.memo.phase()
    }

    /// Get the current configuration.
    pub fn config(&self) -> &EntitlementsConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::MemoryStorage;
    use crate::clock::MockClock;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct PlainFetcher {
        body: Value,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for PlainFetcher {
        async fn fetch_credentialed_json(&self, _url: &str) -> Result<Value, PaywardenError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }

        async fn send_post(&self, _url: &str, _message: &Value) -> Result<Value, PaywardenError> {
            Ok(json!({}))
        }

        fn send_beacon(&self, _url: &str, _message: &Value) {}
    }

    struct NoDelay;

    #[async_trait]
    impl Delay for NoDelay {
        async fn wait(&self, _duration: Duration) {}
    }

    fn test_config() -> EntitlementsConfig {
        EntitlementsConfig::new("news.example", "https://api.example/v1")
            .with_product("news.example:basic")
    }

    fn manager(body: Value) -> (EntitlementsManager, Arc<PlainFetcher>) {
        let fetcher = Arc::new(PlainFetcher {
            body,
            calls: AtomicUsize::new(0),
        });
        let manager = EntitlementsManager::with_seams(
            test_config(),
            Collaborators::new(fetcher.clone(), Arc::new(MemoryStorage::new())),
            Arc::new(MockClock::from_rfc3339("2025-01-15T12:00:00Z")),
            Arc::new(NoDelay),
        )
        .unwrap();
        (manager, fetcher)
    }

    #[test]
    fn test_gate_take_is_one_shot() {
        let mut gate = Gate::BlockNext;
        assert!(gate.take());
        assert!(!gate.take());
        assert_eq!(gate, Gate::Open);
    }

    #[test]
    fn test_manager_rejects_invalid_config() {
        let fetcher = Arc::new(PlainFetcher {
            body: json!({}),
            calls: AtomicUsize::new(0),
        });
        let result = EntitlementsManager::new(
            EntitlementsConfig::new("", "https://api.example/v1"),
            Collaborators::new(fetcher, Arc::new(MemoryStorage::new())),
        );
        assert!(matches!(result, Err(PaywardenError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_memoized_until_reset() {
        let (manager, fetcher) = manager(json!({"entitlements": []}));
        assert_eq!(manager.resolution_phase(), ResolutionPhase::Idle);

        let first = manager.get_entitlements(None).await.unwrap();
        assert!(!first.enables_this());
        assert_eq!(manager.resolution_phase(), ResolutionPhase::Resolved);

        manager.get_entitlements(None).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        manager.reset(false).await;
        assert_eq!(manager.resolution_phase(), ResolutionPhase::Idle);
        manager.get_entitlements(None).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_subscribe_receives_resolution() {
        let (manager, _) = manager(json!({
            "entitlements": [{"source": "google", "products": ["news.example:basic"], "subscriptionToken": "t"}]
        }));
        let mut rx = manager.subscribe();

        manager.get_entitlements(None).await.unwrap();
        manager.settle().await;

        let published = rx.try_recv().unwrap();
        assert!(published.enables_this());
    }

    #[tokio::test]
    async fn test_block_next_notification_is_one_shot() {
        let (manager, _) = manager(json!({"entitlements": []}));
        let mut rx = manager.subscribe();

        manager.block_next_notification();
        manager.get_entitlements(None).await.unwrap();
        assert!(rx.try_recv().is_err());

        manager.reset(false).await;
        manager.get_entitlements(None).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_unblock_next_notification() {
        let (manager, _) = manager(json!({"entitlements": []}));
        let mut rx = manager.subscribe();

        manager.block_next_notification();
        manager.unblock_next_notification();
        manager.get_entitlements(None).await.unwrap();
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_decryption_request_carries_crypt() {
        let (manager, _) = manager(json!({
            "entitlements": [],
            "decryptedDocumentKey": "plain-key"
        }));
        let set = manager
            .get_entitlements(Some(GetEntitlementsParams {
                encrypted_document_key: Some("enc-key".to_string()),
            }))
            .await
            .unwrap();
        assert_eq!(set.decrypted_document_key(), Some("plain-key"));
    }
}
