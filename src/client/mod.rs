//! Network access: the fetcher seam, its HTTP implementation, and retries.

pub mod fetcher;
pub mod http;
pub mod retry;
