//! Network capability consumed by the engine.

use crate::PaywardenError;
use async_trait::async_trait;
use serde_json::Value;

/// Credentialed JSON transport to the entitlement service.
///
/// Transport and decoding failures are returned as errors; the engine
/// propagates them unchanged.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GET `url` with credentials and decode the JSON body.
    async fn fetch_credentialed_json(&self, url: &str) -> Result<Value, PaywardenError>;

    /// POST `message` as JSON to `url` and decode the JSON reply.
    async fn send_post(&self, url: &str, message: &Value) -> Result<Value, PaywardenError>;

    /// Fire-and-forget POST. Never reports failure.
    fn send_beacon(&self, url: &str, message: &Value);
}

/// Build `{service_url}/publication/{publication_id}/entitlements?{pairs}`.
///
/// The query string is omitted entirely when `pairs` is empty.
pub fn entitlements_url(
    service_url: &str,
    publication_id: &str,
    pairs: &[(&str, &str)],
) -> Result<String, PaywardenError> {
    let mut url = url::Url::parse(service_url)
        .map_err(|e| PaywardenError::ConfigError(format!("Invalid service_url: {}", e)))?;
    url.path_segments_mut()
        .map_err(|_| PaywardenError::ConfigError("service_url cannot be a base".to_string()))?
        .pop_if_empty()
        .push("publication")
        .push(publication_id)
        .push("entitlements");
    if !pairs.is_empty() {
        url.query_pairs_mut().extend_pairs(pairs.iter().copied());
    }
    Ok(url.into())
}
