//! Metering consumption and the access pingback.
//!
//! Consuming a metering grant tells the entitlement service the meter was
//! spent on this page view. The pingback fires at most once per grant per
//! page view, whichever exit path of the toast gets there first.
//!
//! A pingback is only sent when the service can attribute it:
//! - self-service metering grants are always attributable
//! - any other metering grant needs fresh continuity parameters on the page
//!
//! Failures to send are logged and dropped. The authoritative grant state
//! lives server-side.
//!
//! Page-level events have no producer inside the engine. The embedder's
//! event-stream listener passes each one to
//! [`ConsumptionProtocol::handle_showcase_event`], which records it on the
//! [`EventSink`] before deciding whether to ping.

use crate::cache::consistency::ConsistencyCache;
use crate::client::fetcher::{entitlements_url, Fetcher};
use crate::clock::Clock;
use crate::config::EntitlementsConfig;
use crate::integrations::{AnalyticsEvent, EventSink, MeterToastRequest, ToastUi};
use crate::policy::entitlements::{Entitlement, Entitlements};
use crate::policy::gaa::fresh_params;
use crate::protocol::models::{MeterClientType, Timestamp};
use crate::protocol::pingback::{
    EncodedParams, EntitlementResult, EntitlementSource, EntitlementsRequest, ShowcaseEvent,
    UsedEntitlement,
};
use crate::{lock_unpoisoned, PaywardenError};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Called once the metering toast no longer blocks the page.
pub type DismissCallback = Box<dyn FnOnce() + Send>;

/// How a consumption was first settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeTrigger {
    /// The visitor dismissed the toast.
    Dismissed,
    /// The toast or its dialog was cancelled.
    Cancelled,
    /// The toast failed to show or errored while open.
    Failed,
    /// The grant did not ask for a toast.
    ToastSkipped,
    /// The grant's token could not be decoded.
    Undecodable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuardState {
    Pending,
    Handled(ConsumeTrigger),
    Reported(ConsumeTrigger),
}

/// Single-shot latch shared by every exit path of one consumption.
///
/// `Pending -> Handled` happens on the first [`trigger`](Self::trigger);
/// `Handled -> Reported` happens exactly once when the pingback is claimed.
/// The first trigger releases the report even if the toast stays open.
#[derive(Debug)]
pub struct ConsumeGuard {
    state: Mutex<GuardState>,
    settled: Notify,
}

impl Default for ConsumeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumeGuard {
    /// Create a pending guard.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GuardState::Pending),
            settled: Notify::new(),
        }
    }

    /// Settle the consumption. Returns `true` only for the first call.
    pub fn trigger(&self, trigger: ConsumeTrigger) -> bool {
        {
            let mut state = lock_unpoisoned(&self.state);
            if *state != GuardState::Pending {
                return false;
            }
            *state = GuardState::Handled(trigger);
        }
        self.settled.notify_waiters();
        true
    }

    /// Wait for the first trigger.
    pub async fn settled(&self) -> ConsumeTrigger {
        loop {
            // Registered before the check so a concurrent trigger is not missed.
            let notified = self.settled.notified();
            if let Some(trigger) = self.handled_by() {
                return trigger;
            }
            notified.await;
        }
    }

    /// The trigger that settled this consumption, if any.
    pub fn handled_by(&self) -> Option<ConsumeTrigger> {
        match *lock_unpoisoned(&self.state) {
            GuardState::Pending => None,
            GuardState::Handled(t) | GuardState::Reported(t) => Some(t),
        }
    }

    /// Claim the right to report. Yields the settling trigger at most once.
    fn claim_report(&self) -> Option<ConsumeTrigger> {
        let mut state = lock_unpoisoned(&self.state);
        match *state {
            GuardState::Handled(t) => {
                *state = GuardState::Reported(t);
                Some(t)
            }
            GuardState::Pending | GuardState::Reported(_) => None,
        }
    }
}

/// Consumption and reporting for one page context.
pub struct ConsumptionProtocol {
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<ConsistencyCache>,
    clock: Arc<dyn Clock>,
    toast: Arc<dyn ToastUi>,
    events: Arc<dyn EventSink>,
    config: EntitlementsConfig,
    /// Tokens of metering grants already reported this page view.
    reported: Mutex<HashSet<String>>,
}

impl ConsumptionProtocol {
    /// Create a protocol instance.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<ConsistencyCache>,
        clock: Arc<dyn Clock>,
        toast: Arc<dyn ToastUi>,
        events: Arc<dyn EventSink>,
        config: EntitlementsConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            clock,
            toast,
            events,
            config,
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Acknowledge that the visitor saw the page unlocked.
    pub async fn ack(&self, set: &Entitlements) {
        if set.enables_this() {
            self.cache.set_toast_shown(true).await;
        }
    }

    /// Consume the best match for the page if it is a metering grant.
    ///
    /// Returns how the consumption was settled, or `None` when the best match
    /// is not a metering grant.
    pub async fn consume(
        &self,
        set: &Entitlements,
        on_dismiss: Option<DismissCallback>,
    ) -> Option<ConsumeTrigger> {
        let Some(entitlement) = set
            .get_entitlement_for_this(None)
            .filter(|e| e.is_metering())
        else {
            debug!("nothing to consume: best match is not a metering grant");
            return None;
        };

        let guard = Arc::new(ConsumeGuard::new());

        if entitlement.token_contents().is_none() {
            guard.trigger(ConsumeTrigger::Undecodable);
        } else if entitlement.wants_toast() {
            self.events.log(AnalyticsEvent::MeterToastRequested);
            let request = MeterToastRequest {
                entitlement: entitlement.clone(),
                client_type: entitlement.meter_client_type(),
                client_user_attribute: entitlement
                    .token_contents()
                    .and_then(|c| c.metering.as_ref())
                    .and_then(|m| m.client_user_attribute.clone()),
            };
            self.await_meter_toast(request, guard.clone()).await;
        } else {
            guard.trigger(ConsumeTrigger::ToastSkipped);
        }

        let trigger = guard.claim_report()?;
        debug!(?trigger, "metering consumption settled");
        if let Some(on_dismiss) = on_dismiss {
            on_dismiss();
        }
        self.consume_meter(entitlement).await;
        Some(trigger)
    }

    /// Run the toast on its own task until any exit path settles `guard`.
    ///
    /// The toast may stay open after an early trigger; it keeps running
    /// detached and its later exits are absorbed by the guard.
    async fn await_meter_toast(&self, request: MeterToastRequest, guard: Arc<ConsumeGuard>) {
        let toast = self.toast.clone();
        let toast_guard = guard.clone();
        let mut shown = tokio::spawn(async move {
            let closed_by = match toast.show_meter_toast(request, toast_guard.clone()).await {
                Ok(()) => ConsumeTrigger::Dismissed,
                Err(e) => {
                    warn!(error = %e, "metering toast failed");
                    ConsumeTrigger::Failed
                }
            };
            toast_guard.trigger(closed_by);
        });

        tokio::select! {
            trigger = guard.settled() => {
                debug!(?trigger, "metering toast settled");
            }
            joined = &mut shown => {
                if let Err(e) = joined {
                    warn!(error = %e, "metering toast task failed");
                }
                guard.trigger(ConsumeTrigger::Failed);
            }
        }
    }

    /// Send the consumption pingback for `entitlement` if it is attributable.
    ///
    /// Returns whether a pingback was sent.
    pub async fn consume_meter(&self, entitlement: &Entitlement) -> bool {
        if !entitlement.is_metering() {
            return false;
        }

        let entitlement_source = match entitlement.meter_client_type() {
            Some(MeterClientType::MeteredByGoogle) => {
                EntitlementSource::SubscribeWithGoogleMeteringService
            }
            _ => {
                if fresh_params(&self.config.page_query, false, self.clock.as_ref()).is_none() {
                    debug!("metering grant not attributable: no fresh continuity params");
                    return false;
                }
                EntitlementSource::GoogleShowcaseMeteringService
            }
        };

        let first_report = lock_unpoisoned(&self.reported)
            .insert(entitlement.subscription_token().to_string());
        if !first_report {
            debug!("metering grant already reported this page view");
            return false;
        }

        let request = EntitlementsRequest {
            used_entitlement: Some(UsedEntitlement {
                source: entitlement.source().to_string(),
                subscription_token: entitlement.subscription_token().to_string(),
            }),
            client_event_time: self.now(),
            entitlement_result: EntitlementResult::UnlockedMeter,
            entitlement_source,
            token: self.cache.user_token().await,
            is_user_registered: None,
            subscription_timestamp: entitlement.subscription_timestamp(),
        };

        self.events.log(AnalyticsEvent::UnlockedByMeter);
        self.send_pingback(&request).await
    }

    /// Report a page-level event from the general event stream.
    ///
    /// The event is always logged as [`AnalyticsEvent::Showcase`]. Returns
    /// whether a pingback was sent.
    pub async fn handle_showcase_event(
        &self,
        event: ShowcaseEvent,
        is_user_registered: Option<bool>,
    ) -> bool {
        self.events.log(AnalyticsEvent::Showcase(event));
        let allow_all = event.allows_all_access_types();
        if fresh_params(&self.config.page_query, allow_all, self.clock.as_ref()).is_none() {
            debug!(?event, "showcase event ignored: no fresh continuity params");
            return false;
        }

        let request = EntitlementsRequest {
            used_entitlement: None,
            client_event_time: self.now(),
            entitlement_result: event.entitlement_result(),
            entitlement_source: event.entitlement_source(),
            token: self.cache.user_token().await,
            is_user_registered,
            subscription_timestamp: None,
        };
        self.send_pingback(&request).await
    }

    /// Show the access toast for a non-metering grant and remember it was shown.
    pub async fn show_access_toast(&self, entitlement: &Entitlement) {
        match self.toast.show_access_toast(entitlement).await {
            Ok(()) => {
                self.cache.set_toast_shown(true).await;
                self.events.log(AnalyticsEvent::AccessToastShown);
            }
            Err(e) => warn!(error = %e, "access toast failed"),
        }
    }

    /// URL the pingback is POSTed to.
    pub fn pingback_url(&self) -> Result<String, PaywardenError> {
        let mut pairs = Vec::new();
        if !self.config.canonical_url.is_empty() {
            pairs.push(EncodedParams::for_canonical_url(&self.config.canonical_url).encode()?);
        }
        let pairs: Vec<(&str, &str)> = pairs
            .iter()
            .map(|encoded| ("encodedParams", encoded.as_str()))
            .collect();
        entitlements_url(
            &self.config.service_url,
            &self.config.publication_id,
            &pairs,
        )
    }

    async fn send_pingback(&self, request: &EntitlementsRequest) -> bool {
        let result = async {
            let url = self.pingback_url()?;
            let body = request.to_json()?;
            self.fetcher.send_post(&url, &body).await
        }
        .await;

        match result {
            Ok(_) => {
                info!(
                    result = ?request.entitlement_result,
                    source = ?request.entitlement_source,
                    "entitlement pingback sent"
                );
                true
            }
            Err(e) => {
                warn!(error = %e, "entitlement pingback failed");
                false
            }
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.clock.now_utc().timestamp_millis())
    }
}
