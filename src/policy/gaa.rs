//! Continuity ("GAA") query parameters.
//!
//! A visitor redirected from a sanctioned access-granting surface arrives with
//! four signed, time-limited parameters. The signature is checked server-side;
//! here we only decide whether the parameters are present and unexpired.

use crate::clock::Clock;
use url::form_urlencoded;

/// Access type flag.
pub const ACCESS_TYPE_PARAM: &str = "gaa_at";
/// Continuity token.
pub const NONCE_PARAM: &str = "gaa_n";
/// Signature over the other parameters.
pub const SIGNATURE_PARAM: &str = "gaa_sig";
/// Hex-encoded expiry, seconds since the epoch.
pub const EXPIRY_PARAM: &str = "gaa_ts";

/// Access type meaning the redirect granted no access.
pub const NO_ACCESS: &str = "na";

/// Continuity parameters read from a page query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GaaParams {
    /// Access type flag; `"na"` means no access was granted.
    pub access_type: String,
    /// Continuity token.
    pub nonce: String,
    /// Signature, checked server-side.
    pub signature: String,
    /// Expiry as hex seconds since the epoch.
    pub expiry_hex: String,
}

impl GaaParams {
    /// Extract the parameters; `None` unless all four are present and non-empty.
    pub fn from_query(query: &str) -> Option<Self> {
        let query = query.strip_prefix('?').unwrap_or(query);

        let (mut access_type, mut nonce, mut signature, mut expiry_hex) = (None, None, None, None);
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match &*key {
                ACCESS_TYPE_PARAM => &mut access_type,
                NONCE_PARAM => &mut nonce,
                SIGNATURE_PARAM => &mut signature,
                EXPIRY_PARAM => &mut expiry_hex,
                _ => continue,
            };
            if !value.is_empty() {
                *slot = Some(value.into_owned());
            }
        }

        Some(Self {
            access_type: access_type?,
            nonce: nonce?,
            signature: signature?,
            expiry_hex: expiry_hex?,
        })
    }

    /// Embedded expiry; `None` if it is not valid hex.
    pub fn expires_at(&self) -> Option<i64> {
        i64::from_str_radix(&self.expiry_hex, 16).ok()
    }

    /// Whether these parameters still vouch for the visitor.
    ///
    /// A "no access" redirect only counts when `allow_all_access_types` is set.
    pub fn is_fresh(&self, allow_all_access_types: bool, clock: &dyn Clock) -> bool {
        if !allow_all_access_types && self.access_type == NO_ACCESS {
            return false;
        }
        self.expires_at()
            .is_some_and(|exp| exp >= clock.now_epoch_seconds())
    }

    /// The parameters as query pairs, for forwarding to the entitlement service.
    pub fn query_pairs(&self) -> [(&'static str, &str); 4] {
        [
            (ACCESS_TYPE_PARAM, self.access_type.as_str()),
            (NONCE_PARAM, self.nonce.as_str()),
            (SIGNATURE_PARAM, self.signature.as_str()),
            (EXPIRY_PARAM, self.expiry_hex.as_str()),
        ]
    }
}

/// Parse and freshness-check in one step.
pub fn fresh_params(
    query: &str,
    allow_all_access_types: bool,
    clock: &dyn Clock,
) -> Option<GaaParams> {
    GaaParams::from_query(query).filter(|p| p.is_fresh(allow_all_access_types, clock))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;

    fn query(access_type: &str, expiry: i64) -> String {
        format!(
            "?gaa_at={}&gaa_n=n0nce&gaa_sig=s1g&gaa_ts={:x}&utm=x",
            access_type, expiry
        )
    }

    #[test]
    fn test_parse_all_params() {
        let params = GaaParams::from_query(&query("g", 0x5f5e100)).unwrap();
        assert_eq!(params.access_type, "g");
        assert_eq!(params.nonce, "n0nce");
        assert_eq!(params.signature, "s1g");
        assert_eq!(params.expires_at(), Some(0x5f5e100));
    }

    #[test]
    fn test_missing_param() {
        assert!(GaaParams::from_query("gaa_at=g&gaa_n=n&gaa_sig=s").is_none());
        assert!(GaaParams::from_query("gaa_at=g&gaa_n=&gaa_sig=s&gaa_ts=ff").is_none());
        assert!(GaaParams::from_query("").is_none());
    }

    #[test]
    fn test_fresh_within_expiry() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let now = clock.now_epoch_seconds();
        assert!(fresh_params(&query("g", now + 30), false, &clock).is_some());
        assert!(fresh_params(&query("g", now), false, &clock).is_some());
        assert!(fresh_params(&query("g", now - 1), false, &clock).is_none());
    }

    #[test]
    fn test_no_access_type() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let q = query(NO_ACCESS, clock.now_epoch_seconds() + 30);
        assert!(fresh_params(&q, false, &clock).is_none());
        assert!(fresh_params(&q, true, &clock).is_some());
    }

    #[test]
    fn test_bad_hex_expiry_is_stale() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let q = "gaa_at=g&gaa_n=n&gaa_sig=s&gaa_ts=zzz";
        assert!(GaaParams::from_query(q).is_some());
        assert!(fresh_params(q, false, &clock).is_none());
    }
}
