//! Consumption pingback envelope and the metering params blob.

use crate::crypto::{digest::hash_canonical_url, jwt::BASE64URL};
use crate::protocol::models::Timestamp;
use crate::PaywardenError;
use base64::Engine;
use serde::Serialize;
use serde_json::Value;

/// Outcome reported for the current page view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementResult {
    /// A subscription unlocked the page.
    UnlockedSubscriber,
    /// The page is free to read.
    UnlockedFree,
    /// A metering grant unlocked the page.
    UnlockedMeter,
    /// The page is behind a registration wall.
    LockedRegwall,
    /// The page is behind a paywall.
    LockedPaywall,
    /// The paywall was shown to an ineligible visitor.
    IneligiblePaywall,
}

/// Who ultimately granted (or withheld) access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementSource {
    /// First-party subscriber record.
    GoogleSubscriberEntitlement,
    /// Licensed (showcase) metering service.
    GoogleShowcaseMeteringService,
    /// Self-service metering.
    SubscribeWithGoogleMeteringService,
    /// The publisher's own entitlement system.
    PublisherEntitlement,
}

/// The grant being consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsedEntitlement {
    /// Issuer of the grant.
    pub source: String,
    /// Token identifying the grant.
    pub subscription_token: String,
}

/// Envelope POSTed to the entitlements endpoint when access is reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Grant being consumed; absent for page-level events.
    pub used_entitlement: Option<UsedEntitlement>,
    /// When the event happened on the client.
    pub client_event_time: Timestamp,
    /// What the visitor got.
    pub entitlement_result: EntitlementResult,
    /// Who decided it.
    pub entitlement_source: EntitlementSource,
    /// Continuity token identifying the visitor, if one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Whether the publisher knows the visitor as registered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_user_registered: Option<bool>,
    /// When the consumed grant's subscription began.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_timestamp: Option<Timestamp>,
}

impl EntitlementsRequest {
    /// Serialize into the JSON body handed to the fetcher.
    pub fn to_json(&self) -> Result<Value, PaywardenError> {
        serde_json::to_value(self).map_err(|e| {
            PaywardenError::ProtocolError(format!("Failed to serialize pingback: {}", e))
        })
    }
}

/// Page-level events from the general event stream that are reported with
/// the same envelope as a metering consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShowcaseEvent {
    /// The publisher unlocked the page for a subscriber.
    UnlockedBySubscription,
    /// The publisher served a free page.
    UnlockedFreePage,
    /// A registration wall was shown.
    NoEntitlementsRegwall,
    /// A paywall was shown.
    NoEntitlementsPaywall,
    /// A paywall was shown to a visitor who cannot use metering.
    IneligiblePaywall,
}

impl ShowcaseEvent {
    /// Result reported for this event.
    pub fn entitlement_result(self) -> EntitlementResult {
        match self {
            ShowcaseEvent::UnlockedBySubscription => EntitlementResult::UnlockedSubscriber,
            ShowcaseEvent::UnlockedFreePage => EntitlementResult::UnlockedFree,
            ShowcaseEvent::NoEntitlementsRegwall => EntitlementResult::LockedRegwall,
            ShowcaseEvent::NoEntitlementsPaywall => EntitlementResult::LockedPaywall,
            ShowcaseEvent::IneligiblePaywall => EntitlementResult::IneligiblePaywall,
        }
    }

    /// Source reported for this event.
    pub fn entitlement_source(self) -> EntitlementSource {
        match self {
            ShowcaseEvent::NoEntitlementsRegwall => EntitlementSource::GoogleShowcaseMeteringService,
            ShowcaseEvent::UnlockedBySubscription
            | ShowcaseEvent::UnlockedFreePage
            | ShowcaseEvent::NoEntitlementsPaywall
            | ShowcaseEvent::IneligiblePaywall => EntitlementSource::PublisherEntitlement,
        }
    }

    /// Locked impressions are reported even when the redirect granted no access.
    pub fn allows_all_access_types(self) -> bool {
        matches!(
            self,
            ShowcaseEvent::NoEntitlementsRegwall
                | ShowcaseEvent::NoEntitlementsPaywall
                | ShowcaseEvent::IneligiblePaywall
        )
    }
}

/// Metering parameters appended to entitlement requests as `encodedParams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncodedParams {
    /// Metering section.
    pub metering: MeteringParams,
}

/// Metering section of [`EncodedParams`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeteringParams {
    /// The page being metered.
    pub resource: MeteredResource,
}

/// Identity of a metered page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteredResource {
    /// Hex SHA-512 of the canonical page URL.
    pub hashed_canonical_url: String,
}

impl EncodedParams {
    /// Build params identifying the page by its canonical URL.
    pub fn for_canonical_url(canonical_url: &str) -> Self {
        Self {
            metering: MeteringParams {
                resource: MeteredResource {
                    hashed_canonical_url: hash_canonical_url(canonical_url),
                },
            },
        }
    }

    /// base64url(JSON) form used as the query parameter value.
    pub fn encode(&self) -> Result<String, PaywardenError> {
        let json = serde_json::to_vec(self).map_err(|e| {
            PaywardenError::ProtocolError(format!("Failed to serialize metering params: {}", e))
        })?;
        Ok(BASE64URL.encode(json))
    }
}
