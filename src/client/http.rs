//! Reqwest-based fetcher for the entitlement service.

use crate::client::fetcher::Fetcher;
use crate::PaywardenError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// HTTP fetcher backed by a shared `reqwest::Client`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    user_agent: String,
}

impl HttpFetcher {
    /// Create a fetcher identifying itself as `product`.
    pub fn new(product: &str) -> Result<Self, PaywardenError> {
        Self::with_timeout(product, Duration::from_secs(30))
    }

    /// Create a fetcher with a custom request timeout.
    pub fn with_timeout(product: &str, timeout: Duration) -> Result<Self, PaywardenError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PaywardenError::Transport(format!("Failed to create client: {}", e)))?;

        Ok(Self {
            client,
            user_agent: build_user_agent(product),
        })
    }

    /// The User-Agent sent with every request.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, PaywardenError> {
        let status = response.status();
        if !status.is_success() {
            return Err(PaywardenError::Transport(format!(
                "Unexpected status {}",
                status.as_u16()
            )));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| PaywardenError::ProtocolError(format!("Invalid JSON body: {}", e)))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_credentialed_json(&self, url: &str) -> Result<Value, PaywardenError> {
        debug!(url, "fetching entitlements");
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| PaywardenError::Transport(format!("Request failed: {}", e)))?;
        Self::read_json(response).await
    }

    async fn send_post(&self, url: &str, message: &Value) -> Result<Value, PaywardenError> {
        debug!(url, "posting message");
        let response = self
            .client
            .post(url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json")
            .json(message)
            .send()
            .await
            .map_err(|e| PaywardenError::Transport(format!("Request failed: {}", e)))?;
        Self::read_json(response).await
    }

    fn send_beacon(&self, url: &str, message: &Value) {
        let request = self
            .client
            .post(url)
            .header(USER_AGENT, &self.user_agent)
            .json(message);
        let url = url.to_string();
        tokio::spawn(async move {
            if let Err(e) = request.send().await {
                warn!(url = %url, error = %e, "beacon failed");
            }
        });
    }
}

/// Build a User-Agent string.
///
/// Format: `<product> paywarden/<version>`
pub fn build_user_agent(product: &str) -> String {
    format!("{} paywarden/{}", product, env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_user_agent_format() {
        let ua = build_user_agent("news-reader");
        assert_eq!(
            ua,
            format!("news-reader paywarden/{}", env!("CARGO_PKG_VERSION"))
        );
    }

    #[test]
    fn test_fetcher_creation() {
        let fetcher = HttpFetcher::new("news-reader").unwrap();
        assert!(fetcher.user_agent().starts_with("news-reader paywarden/"));
    }
}
