//! Presentation and analytics collaborators.
//!
//! The engine never renders anything itself. It asks a [`ToastUi`] to show
//! toasts and reports what happened to an [`EventSink`].

use crate::meter::consume::{ConsumeGuard, ConsumeTrigger};
use crate::policy::entitlements::Entitlement;
use crate::protocol::models::MeterClientType;
use crate::protocol::pingback::ShowcaseEvent;
use crate::PaywardenError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// What the metering toast needs to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterToastRequest {
    /// The metering grant being spent.
    pub entitlement: Entitlement,
    /// Metering service that issued the grant, if the token says.
    pub client_type: Option<MeterClientType>,
    /// Publisher-defined attribute describing the visitor.
    pub client_user_attribute: Option<String>,
}

/// Toast presentation.
#[async_trait]
pub trait ToastUi: Send + Sync {
    /// Show the metering toast and return once it is gone.
    ///
    /// Every path that ends the toast (dismissal, cancellation, an error in
    /// the dialog) should call [`ConsumeGuard::trigger`]; only the first call
    /// counts, so calling it from several paths is expected.
    async fn show_meter_toast(
        &self,
        request: MeterToastRequest,
        guard: Arc<ConsumeGuard>,
    ) -> Result<(), PaywardenError>;

    /// Show the "access granted" toast for a non-metering grant.
    async fn show_access_toast(&self, entitlement: &Entitlement) -> Result<(), PaywardenError>;
}

/// Toast UI that shows nothing and dismisses immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopToastUi;

#[async_trait]
impl ToastUi for NoopToastUi {
    async fn show_meter_toast(
        &self,
        _request: MeterToastRequest,
        guard: Arc<ConsumeGuard>,
    ) -> Result<(), PaywardenError> {
        guard.trigger(ConsumeTrigger::Dismissed);
        Ok(())
    }

    async fn show_access_toast(&self, _entitlement: &Entitlement) -> Result<(), PaywardenError> {
        Ok(())
    }
}

/// Analytics events emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalyticsEvent {
    /// Best match for the page is a metering grant.
    HasMeteringEntitlements,
    /// Nothing unlocks the page.
    NoEntitlements,
    /// A non-metering grant unlocks the page.
    UnlockedBySubscription,
    /// A metering grant was consumed.
    UnlockedByMeter,
    /// The metering toast was requested.
    MeterToastRequested,
    /// The access toast was shown.
    AccessToastShown,
    /// A page-level event was handed to the engine, reported or not.
    Showcase(ShowcaseEvent),
}

/// One-way analytics sink.
pub trait EventSink: Send + Sync {
    /// Record an event. Must not block.
    fn log(&self, event: AnalyticsEvent);
}

/// Sink that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn log(&self, event: AnalyticsEvent) {
        info!(?event, "entitlement analytics event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_toast_triggers_guard() {
        let guard = Arc::new(ConsumeGuard::new());
        let request = MeterToastRequest {
            entitlement: Entitlement::new("google:metering", vec![], "t", None),
            client_type: None,
            client_user_attribute: None,
        };

        NoopToastUi
            .show_meter_toast(request, guard.clone())
            .await
            .unwrap();
        assert_eq!(guard.handled_by(), Some(ConsumeTrigger::Dismissed));
    }
}
