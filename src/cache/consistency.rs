//! Expiry-aware entitlement cache over the storage capability.
//!
//! The cache holds the raw signed bundle, never a parsed set. On every read
//! the bundle is decoded again and its `exp` claim checked, so a stale entry
//! behaves exactly like an absent one.

use crate::cache::storage::{Storage, StorageScope};
use crate::clock::Clock;
use crate::policy::entitlements::Entitlements;
use std::sync::Arc;
use tracing::{debug, warn};

/// Raw signed entitlements bundle.
pub const ENTS_STORAGE_KEY: &str = "ents";
/// Cached ready-to-pay flag, `"true"` or `"false"`.
pub const IS_READY_TO_PAY_STORAGE_KEY: &str = "isreadytopay";
/// Set to `"1"` once the access toast was shown this session.
pub const TOAST_STORAGE_KEY: &str = "toast";
/// Continuity token issued by the entitlement service.
pub const USER_TOKEN_STORAGE_KEY: &str = "USER_TOKEN";

/// Cache of the last cacheable entitlements for one page context.
pub struct ConsistencyCache {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    service_id: String,
    product_id: Option<String>,
}

impl ConsistencyCache {
    /// Create a cache bound to a service and the page's product.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
        service_id: impl Into<String>,
        product_id: Option<String>,
    ) -> Self {
        Self {
            storage,
            clock,
            service_id: service_id.into(),
            product_id,
        }
    }

    /// Read the cached set.
    ///
    /// Absent, malformed, and expired entries all yield `None`.
    pub async fn read(&self) -> Option<Entitlements> {
        let raw = self.get(ENTS_STORAGE_KEY, StorageScope::Session).await?;
        let ready_to_pay = self
            .get(IS_READY_TO_PAY_STORAGE_KEY, StorageScope::Session)
            .await
            .is_some_and(|v| v == "true");
        self.validate(&raw, ready_to_pay)
    }

    /// Decode `raw` and keep it only if it has not expired.
    pub fn validate(&self, raw: &str, ready_to_pay: bool) -> Option<Entitlements> {
        match Entitlements::from_signed(
            &self.service_id,
            raw,
            self.product_id.clone(),
            ready_to_pay,
            None,
            true,
            self.clock.as_ref(),
        ) {
            Ok(set) => set,
            Err(e) => {
                debug!(error = %e, "cached entitlements unusable");
                None
            }
        }
    }

    /// Persist `set` if it unlocks the page with a cacheable grant.
    ///
    /// Returns whether anything was written.
    pub async fn write_if_cacheable(&self, set: &Entitlements) -> bool {
        if set.raw().is_empty() || !set.enables_this_with_cacheable_entitlements() {
            return false;
        }
        self.set(ENTS_STORAGE_KEY, set.raw(), StorageScope::Session)
            .await;
        self.set(
            IS_READY_TO_PAY_STORAGE_KEY,
            if set.is_ready_to_pay() { "true" } else { "false" },
            StorageScope::Session,
        )
        .await;
        true
    }

    /// Drop the cached bundle, and optionally the ready-to-pay flag.
    pub async fn invalidate(&self, also_ready_to_pay: bool) {
        self.remove(ENTS_STORAGE_KEY, StorageScope::Session).await;
        if also_ready_to_pay {
            self.remove(IS_READY_TO_PAY_STORAGE_KEY, StorageScope::Session)
                .await;
        }
    }

    /// Store a bundle received out of band if it unlocks the page now.
    ///
    /// Returns `false`, leaving storage untouched, for malformed, expired or
    /// non-enabling bundles.
    pub async fn push(&self, raw: &str, ready_to_pay: Option<bool>) -> bool {
        let Some(set) = self.validate(raw, ready_to_pay.unwrap_or(false)) else {
            return false;
        };
        if !set.enables_this() {
            return false;
        }
        self.set(ENTS_STORAGE_KEY, raw, StorageScope::Session).await;
        if let Some(ready) = ready_to_pay {
            self.set(
                IS_READY_TO_PAY_STORAGE_KEY,
                if ready { "true" } else { "false" },
                StorageScope::Session,
            )
            .await;
        }
        true
    }

    /// Whether the access toast was already shown this session.
    pub async fn toast_shown(&self) -> bool {
        self.get(TOAST_STORAGE_KEY, StorageScope::Session)
            .await
            .is_some_and(|v| v == "1")
    }

    /// Record or clear the toast-shown flag.
    pub async fn set_toast_shown(&self, shown: bool) {
        if shown {
            self.set(TOAST_STORAGE_KEY, "1", StorageScope::Session).await;
        } else {
            self.remove(TOAST_STORAGE_KEY, StorageScope::Session).await;
        }
    }

    /// Persisted continuity token, if any.
    pub async fn user_token(&self) -> Option<String> {
        self.get(USER_TOKEN_STORAGE_KEY, StorageScope::Local).await
    }

    /// Persist a continuity token.
    pub async fn set_user_token(&self, token: &str) {
        self.set(USER_TOKEN_STORAGE_KEY, token, StorageScope::Local)
            .await;
    }

    async fn get(&self, key: &str, scope: StorageScope) -> Option<String> {
        match self.storage.get(key, scope).await {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "storage read failed; treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str, scope: StorageScope) {
        if let Err(e) = self.storage.set(key, value, scope).await {
            warn!(key, error = %e, "storage write failed");
        }
    }

    async fn remove(&self, key: &str, scope: StorageScope) {
        if let Err(e) = self.storage.remove(key, scope).await {
            warn!(key, error = %e, "storage remove failed");
        }
    }
}
