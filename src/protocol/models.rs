//! Entitlement service payloads and token claims.

use crate::PaywardenError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response body of the entitlements endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementsResponse {
    /// Compact signed bundle carrying an `entitlements` claim.
    #[serde(default)]
    pub signed_entitlements: Option<String>,
    /// Plain, unsigned grants.
    #[serde(default)]
    pub entitlements: Option<GrantList>,
    /// Whether the visitor's payment method is usable.
    #[serde(default)]
    pub is_ready_to_pay: Option<bool>,
    /// Document key decrypted on request.
    #[serde(default)]
    pub decrypted_document_key: Option<String>,
    /// Continuity token identifying the visitor to the service.
    #[serde(default)]
    pub swg_user_token: Option<String>,
    /// Non-fatal warnings from the service.
    #[serde(default)]
    pub error_messages: Vec<String>,
}

/// Grants may arrive as an array or as a single object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GrantList {
    /// An array of grants.
    Many(Vec<GrantJson>),
    /// A lone grant object.
    One(GrantJson),
}

impl GrantList {
    /// Flatten into a vector, keeping order.
    pub fn into_vec(self) -> Vec<GrantJson> {
        match self {
            GrantList::Many(grants) => grants,
            GrantList::One(grant) => vec![grant],
        }
    }
}

/// One grant as it appears on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantJson {
    /// Issuer of the grant.
    #[serde(default)]
    pub source: String,
    /// Products the grant unlocks.
    #[serde(default)]
    pub products: Vec<String>,
    /// Opaque token identifying this grant.
    #[serde(default)]
    pub subscription_token: String,
    /// When the underlying subscription began.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_timestamp: Option<Timestamp>,
}

/// Protobuf-style timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Whole seconds since the epoch.
    #[serde(default)]
    pub seconds: i64,
    /// Sub-second part.
    #[serde(default)]
    pub nanos: i32,
}

impl Timestamp {
    /// Build from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self {
            seconds: millis.div_euclid(1000),
            nanos: (millis.rem_euclid(1000) * 1_000_000) as i32,
        }
    }
}

/// Claims carried in the payload of a signed entitlements bundle.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignedEntitlementsClaims {
    /// Grants carried by the bundle.
    #[serde(default)]
    pub entitlements: Option<GrantList>,
    /// Expiry, seconds since the epoch.
    #[serde(default)]
    pub exp: Option<i64>,
}

/// Decoded payload of a metering grant's subscription token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenContents {
    /// Present on grants issued by the metering service.
    #[serde(default)]
    pub metering: Option<MeteringClaims>,
}

/// Metering sub-fields of a self-issued service token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeteringClaims {
    /// Issuing metering service.
    #[serde(default)]
    pub client_type: Option<MeterClientType>,
    /// Whether consumption should show the metering toast.
    #[serde(default)]
    pub show_toast: Option<bool>,
    /// Publisher-defined attribute describing the visitor.
    #[serde(default)]
    pub client_user_attribute: Option<String>,
}

/// Which metering service issued a metering grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "i64")]
pub enum MeterClientType {
    /// Licensed access through a partner surface; requires fresh continuity params.
    LicensedByGoogle,
    /// Self-service metering run by the entitlement service itself.
    MeteredByGoogle,
    /// Any code this crate does not know.
    Unknown(i64),
}

impl From<i64> for MeterClientType {
    fn from(code: i64) -> Self {
        match code {
            1 => MeterClientType::LicensedByGoogle,
            2 => MeterClientType::MeteredByGoogle,
            other => MeterClientType::Unknown(other),
        }
    }
}

/// Parse an entitlements endpoint body.
pub fn parse_entitlements_response(body: Value) -> Result<EntitlementsResponse, PaywardenError> {
    serde_json::from_value(body).map_err(|e| {
        PaywardenError::ProtocolError(format!("Failed to parse entitlements response: {}", e))
    })
}
