//! Grant matching and continuity-parameter checks.

pub mod entitlements;
pub mod gaa;
