//! Paywarden configuration.

use crate::PaywardenError;
use std::time::Duration;

/// Fixed delay between positive-expectation retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(550);

/// Retry budget granted by `reset(true)`.
pub const DEFAULT_EXPECT_POSITIVE_RETRIES: u32 = 3;

/// Configuration for entitlement resolution on one page.
///
/// Everything here is page context: which publication and product the page
/// belongs to, where the entitlement service lives, and how the page was
/// reached (its query string).
#[derive(Debug, Clone)]
pub struct EntitlementsConfig {
    /// Publication identifier (e.g. "news.example").
    pub publication_id: String,

    /// Product of the current page, `"<publication>:<sku>"`.
    /// `None` means no grant can enable this page.
    pub product_id: Option<String>,

    /// Base URL of the entitlement service API.
    pub service_url: String,

    /// Canonical URL of the page. Its SHA-512 hash identifies the metered resource.
    pub canonical_url: String,

    /// Raw query string of the page URL, with or without the leading `?`.
    /// Continuity parameters are read from here.
    pub page_query: String,

    /// Consume metering grants automatically once entitlements are fetched.
    pub default_consumption: bool,

    /// Delay between retries while a positive answer is expected.
    pub retry_delay: Duration,

    /// Retry budget applied by `reset(true)`.
    pub expect_positive_retries: u32,
}

impl EntitlementsConfig {
    /// Create a configuration with default retry policy and no page context.
    pub fn new(publication_id: impl Into<String>, service_url: impl Into<String>) -> Self {
        Self {
            publication_id: publication_id.into(),
            product_id: None,
            service_url: service_url.into(),
            canonical_url: String::new(),
            page_query: String::new(),
            default_consumption: false,
            retry_delay: DEFAULT_RETRY_DELAY,
            expect_positive_retries: DEFAULT_EXPECT_POSITIVE_RETRIES,
        }
    }

    /// Set the product of the current page.
    pub fn with_product(mut self, product_id: impl Into<String>) -> Self {
        self.product_id = Some(product_id.into());
        self
    }

    /// Set the canonical URL of the current page.
    pub fn with_canonical_url(mut self, canonical_url: impl Into<String>) -> Self {
        self.canonical_url = canonical_url.into();
        self
    }

    /// Set the page query string.
    pub fn with_page_query(mut self, page_query: impl Into<String>) -> Self {
        self.page_query = page_query.into();
        self
    }

    /// Enable or disable default metering consumption.
    pub fn with_default_consumption(mut self, enabled: bool) -> Self {
        self.default_consumption = enabled;
        self
    }

    /// Override the retry delay.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Validate configuration for obvious errors.
    pub fn validate(&self) -> Result<(), PaywardenError> {
        if self.publication_id.is_empty() {
            return Err(PaywardenError::ConfigError(
                "publication_id cannot be empty".to_string(),
            ));
        }
        let service = url::Url::parse(&self.service_url).map_err(|e| {
            PaywardenError::ConfigError(format!(
                "service_url must be an absolute URL ({}): {}",
                self.service_url, e
            ))
        })?;
        if service.cannot_be_a_base() {
            return Err(PaywardenError::ConfigError(format!(
                "service_url cannot be used as a base: {}",
                self.service_url
            )));
        }
        if let Some(product) = &self.product_id {
            if product.is_empty() {
                return Err(PaywardenError::ConfigError(
                    "product_id cannot be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}
