//! SHA-2 digests used for resource identity and storage key hashing.

use sha2::{Digest, Sha256, Sha512};

/// Compute the lowercase hex SHA-512 digest of a canonical page URL.
///
/// The entitlement service identifies a metered resource by this hash, never
/// by the URL itself.
pub fn hash_canonical_url(canonical_url: &str) -> String {
    hex::encode(Sha512::digest(canonical_url.as_bytes()))
}

/// Compute a SHA-256 hex digest of a storage key.
///
/// File-backed storage uses this to avoid putting raw keys in filenames.
pub fn hash_storage_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
