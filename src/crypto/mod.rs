//! Token decoding and hashing primitives.

pub mod digest;
pub mod jwt;
