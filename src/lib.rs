//! # Paywarden
//!
//! **Entitlement resolution and consumption for paywalled pages.**
//!
//! Paywarden decides whether the current visitor may read the current page,
//! keeps that decision consistent across page loads, and reports metering
//! grants as used exactly once.
//!
//! ## Features
//!
//! - **Session cache** of signed entitlement bundles, trusted only until their `exp`
//! - **Shared resolution**: concurrent callers wait on one network round trip
//! - **Positive retries** after a purchase while the service catches up
//! - **Metering consumption** with a single-shot guard across every toast exit path
//! - **Pluggable collaborators** for network, storage, toasts and analytics
//!
//! ## Quickstart
//!
//! ```no_run
//! use paywarden::{Collaborators, EntitlementsConfig, EntitlementsManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), paywarden::PaywardenError> {
//!     let config = EntitlementsConfig::new("news.example", "https://api.example/swg/v1")
//!         .with_product("news.example:basic")
//!         .with_canonical_url("https://news.example/articles/1");
//!
//!     let manager = EntitlementsManager::new(
//!         config,
//!         Collaborators::http("news-reader", "news-reader")?,
//!     )?;
//!
//!     let entitlements = manager.get_entitlements(None).await?;
//!     if entitlements.enables_this() {
//!         manager.ack(&entitlements).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Trust model
//!
//! Signed bundles are decoded but not verified here; the entitlement service
//! verifies signatures on its side. Client-side gating can always be bypassed
//! by a visitor who controls the page.

#![deny(warnings)]
#![deny(missing_docs)]

// Core modules
pub mod clock;
pub mod config;
pub mod errors;

// Token layer
pub mod crypto;

// Protocol layer
pub mod protocol;

// Client layer
pub mod client;

// Cache layer
pub mod cache;

// Metering layer
pub mod meter;

// Policy layer
pub mod policy;

// Manager (main public API)
pub mod manager;

// UI and analytics collaborators
pub mod integrations;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-exports for public API
pub use cache::file::FileStorage;
pub use cache::storage::{MemoryStorage, Storage, StorageScope};
pub use client::fetcher::Fetcher;
pub use client::http::HttpFetcher;
pub use client::retry::{Delay, ResolutionPhase, TokioDelay};
pub use clock::{Clock, SystemClock};
pub use config::EntitlementsConfig;
pub use errors::PaywardenError;
pub use integrations::{AnalyticsEvent, EventSink, MeterToastRequest, ToastUi};
pub use manager::{Collaborators, EntitlementsManager, GetEntitlementsParams};
pub use meter::consume::{ConsumeGuard, ConsumeTrigger};
pub use policy::entitlements::{Entitlement, Entitlements};
pub use protocol::pingback::ShowcaseEvent;

#[cfg(any(test, feature = "test-seams"))]
pub use clock::MockClock;

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
