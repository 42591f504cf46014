//! Wire shapes exchanged with the entitlement service.

pub mod models;
pub mod pingback;
