//! Storage backends and the entitlement consistency cache.

pub mod consistency;
pub mod file;
pub mod storage;
