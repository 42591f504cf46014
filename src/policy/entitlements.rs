//! Grant records, grant sets, and product matching.
//!
//! Matching is a pure function of the grants and the page's product:
//! - an exact product id matches itself
//! - `"<publication>:*"` held by a grant matches every product of that publication
//! - a wildcard request matches any grant holding a product of that publication
//!
//! When several grants match, a non-metering grant always wins over a
//! metering grant so that a standing subscription never spends a meter.

use crate::clock::Clock;
use crate::crypto::jwt;
use crate::protocol::models::{
    EntitlementsResponse, GrantJson, MeterClientType, SignedEntitlementsClaims, Timestamp,
    TokenContents,
};
use crate::PaywardenError;
use tracing::{debug, warn};

/// Source of grants issued by the service's metering.
pub const GOOGLE_METERING_SOURCE: &str = "google:metering";

/// First-party source of subscription grants.
pub const DEFAULT_SOURCE: &str = "google";

/// Source of grants issued to privileged clients such as crawlers.
pub const PRIVILEGED_SOURCE: &str = "privileged";

/// Any token containing this marker was minted in dev mode.
pub const DEV_MODE_TOKEN_MARKER: &str = "GOOGLE_DEV_MODE_TOKEN";

/// Exact token the first-party source issues for dev-mode subscriptions.
pub const DEV_MODE_SUBSCRIPTION_TOKEN: &str = "GOOGLE_DEV_MODE_SUBSCRIPTION";

/// Category of a grant, derived from its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantKind {
    /// First-party subscription.
    Subscription,
    /// Depletable single-article grant.
    Metering,
    /// Crawler or other privileged access.
    Privileged,
    /// Grant issued by the publisher itself.
    Publisher,
}

impl GrantKind {
    /// Classify a source string.
    pub fn of(source: &str) -> Self {
        match source {
            GOOGLE_METERING_SOURCE => GrantKind::Metering,
            DEFAULT_SOURCE => GrantKind::Subscription,
            PRIVILEGED_SOURCE => GrantKind::Privileged,
            _ => GrantKind::Publisher,
        }
    }
}

/// One grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entitlement {
    source: String,
    products: Vec<String>,
    subscription_token: String,
    token_contents: Option<TokenContents>,
    subscription_timestamp: Option<Timestamp>,
}

impl Entitlement {
    /// Create a grant. Metering grants have their token decoded eagerly.
    pub fn new(
        source: impl Into<String>,
        products: Vec<String>,
        subscription_token: impl Into<String>,
        subscription_timestamp: Option<Timestamp>,
    ) -> Self {
        let source = source.into();
        let subscription_token = subscription_token.into();
        let token_contents = if GrantKind::of(&source) == GrantKind::Metering {
            decode_token_contents(&subscription_token)
        } else {
            None
        };
        Self {
            source,
            products,
            subscription_token,
            token_contents,
            subscription_timestamp,
        }
    }

    /// Build from the wire shape.
    pub fn from_json(grant: GrantJson) -> Self {
        Self::new(
            grant.source,
            grant.products,
            grant.subscription_token,
            grant.subscription_timestamp,
        )
    }

    /// Issuer of the grant.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Products this grant unlocks, in wire order.
    pub fn products(&self) -> &[String] {
        &self.products
    }

    /// Opaque token identifying this grant.
    pub fn subscription_token(&self) -> &str {
        &self.subscription_token
    }

    /// Decoded token payload, present only for decodable metering grants.
    pub fn token_contents(&self) -> Option<&TokenContents> {
        self.token_contents.as_ref()
    }

    /// When the underlying subscription began. Reporting only.
    pub fn subscription_timestamp(&self) -> Option<Timestamp> {
        self.subscription_timestamp
    }

    /// Category derived from the source.
    pub fn kind(&self) -> GrantKind {
        GrantKind::of(&self.source)
    }

    /// Whether this is a depletable metering grant.
    pub fn is_metering(&self) -> bool {
        self.kind() == GrantKind::Metering
    }

    /// Dev-mode grants are test artifacts and must never be cached.
    pub fn is_dev_mode(&self) -> bool {
        self.subscription_token.contains(DEV_MODE_TOKEN_MARKER)
            || (self.source == DEFAULT_SOURCE
                && self.subscription_token == DEV_MODE_SUBSCRIPTION_TOKEN)
    }

    /// Metering client type from the decoded token.
    pub fn meter_client_type(&self) -> Option<MeterClientType> {
        self.token_contents
            .as_ref()
            .and_then(|c| c.metering.as_ref())
            .and_then(|m| m.client_type)
    }

    /// Whether the decoded token asks for a visible toast.
    pub fn wants_toast(&self) -> bool {
        self.token_contents
            .as_ref()
            .and_then(|c| c.metering.as_ref())
            .and_then(|m| m.show_toast)
            .unwrap_or(false)
    }

    /// Whether this grant unlocks `product`.
    pub fn enables(&self, product: Option<&str>) -> bool {
        let Some(product) = product.filter(|p| !p.is_empty()) else {
            return false;
        };

        if let Some(sep) = product.find(':') {
            let publication_prefix = &product[..=sep];
            let wildcard = format!("{}*", publication_prefix);

            if product == wildcard
                && self
                    .products
                    .iter()
                    .any(|p| p.starts_with(publication_prefix))
            {
                return true;
            }
            if self.products.iter().any(|p| *p == wildcard) {
                return true;
            }
        }

        self.products.iter().any(|p| p == product)
    }
}

fn decode_token_contents(token: &str) -> Option<TokenContents> {
    let payload = match jwt::decode_payload(token) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "metering token is not decodable");
            return None;
        }
    };
    serde_json::from_value(payload).ok()
}

/// The full set of grants for a service, bound to the page's product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entitlements {
    service_id: String,
    raw: String,
    entitlements: Vec<Entitlement>,
    product_id: Option<String>,
    is_ready_to_pay: bool,
    decrypted_document_key: Option<String>,
}

impl Entitlements {
    /// Create a set.
    pub fn new(
        service_id: impl Into<String>,
        raw: impl Into<String>,
        entitlements: Vec<Entitlement>,
        product_id: Option<String>,
        is_ready_to_pay: bool,
        decrypted_document_key: Option<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            raw: raw.into(),
            entitlements,
            product_id,
            is_ready_to_pay,
            decrypted_document_key,
        }
    }

    /// An empty set for `product_id`.
    pub fn empty(service_id: impl Into<String>, product_id: Option<String>) -> Self {
        Self::new(service_id, "", Vec::new(), product_id, false, None)
    }

    /// Build a set from a signed bundle.
    ///
    /// With `require_non_expired`, a bundle whose `exp` is not in the future
    /// yields `Ok(None)`, the same as a cache miss.
    ///
    /// # Errors
    /// * `MalformedToken` - the bundle is not a decodable compact token
    /// * `ProtocolError` - the payload does not carry grant claims
    pub fn from_signed(
        service_id: &str,
        raw: &str,
        product_id: Option<String>,
        is_ready_to_pay: bool,
        decrypted_document_key: Option<String>,
        require_non_expired: bool,
        clock: &dyn Clock,
    ) -> Result<Option<Self>, PaywardenError> {
        let payload = jwt::decode_payload(raw)?;
        let claims: SignedEntitlementsClaims = serde_json::from_value(payload).map_err(|e| {
            PaywardenError::ProtocolError(format!("Invalid entitlements claims: {}", e))
        })?;

        if require_non_expired {
            let now = clock.now_epoch_seconds();
            match claims.exp {
                Some(exp) if exp > now => {}
                _ => {
                    debug!(exp = ?claims.exp, now, "signed entitlements expired");
                    return Ok(None);
                }
            }
        }

        let entitlements = claims
            .entitlements
            .map(|list| list.into_vec())
            .unwrap_or_default()
            .into_iter()
            .map(Entitlement::from_json)
            .collect();

        Ok(Some(Self::new(
            service_id,
            raw,
            entitlements,
            product_id,
            is_ready_to_pay,
            decrypted_document_key,
        )))
    }

    /// Build a set from a network response.
    ///
    /// Network-sourced bundles are trusted fresh, so expiry is not checked.
    pub fn from_response(
        service_id: &str,
        response: &EntitlementsResponse,
        product_id: Option<String>,
        clock: &dyn Clock,
    ) -> Result<Self, PaywardenError> {
        for message in &response.error_messages {
            warn!(message = %message, "entitlement service reported an issue");
        }

        let is_ready_to_pay = response.is_ready_to_pay.unwrap_or(false);
        let decrypted_document_key = response.decrypted_document_key.clone();

        if let Some(raw) = response.signed_entitlements.as_deref() {
            return Self::from_signed(
                service_id,
                raw,
                product_id.clone(),
                is_ready_to_pay,
                decrypted_document_key,
                false,
                clock,
            )
            .map(|set| set.unwrap_or_else(|| Self::empty(service_id, product_id)));
        }

        let entitlements = response
            .entitlements
            .clone()
            .map(|list| list.into_vec())
            .unwrap_or_default()
            .into_iter()
            .map(Entitlement::from_json)
            .collect();

        Ok(Self::new(
            service_id,
            "",
            entitlements,
            product_id,
            is_ready_to_pay,
            decrypted_document_key,
        ))
    }

    /// Service the set was resolved for.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// The original signed bundle, empty when sourced from plain JSON.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// All grants, in wire order.
    pub fn entitlements(&self) -> &[Entitlement] {
        &self.entitlements
    }

    /// The page's product.
    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    /// Whether the visitor's payment method is known to be usable.
    pub fn is_ready_to_pay(&self) -> bool {
        self.is_ready_to_pay
    }

    /// Document key decrypted by the service, when one was requested.
    pub fn decrypted_document_key(&self) -> Option<&str> {
        self.decrypted_document_key.as_deref()
    }

    /// Whether any grant unlocks the page's product.
    pub fn enables_this(&self) -> bool {
        self.enables(self.product_id.as_deref(), None)
    }

    /// Whether any grant unlocks `product`, optionally restricted to `source`.
    pub fn enables(&self, product: Option<&str>, source: Option<&str>) -> bool {
        self.get_entitlement_for(product, source).is_some()
    }

    /// Whether any grant at all exists.
    pub fn enables_any(&self) -> bool {
        self.entitlements.iter().any(|e| !e.products.is_empty())
    }

    /// Best grant for the page's product.
    pub fn get_entitlement_for_this(&self, source: Option<&str>) -> Option<&Entitlement> {
        self.get_entitlement_for(self.product_id.as_deref(), source)
    }

    /// Best grant for `product`: non-metering first, metering as a fallback.
    pub fn get_entitlement_for(
        &self,
        product: Option<&str>,
        source: Option<&str>,
    ) -> Option<&Entitlement> {
        let mut metering_match = None;
        for entitlement in &self.entitlements {
            if !entitlement.enables(product) {
                continue;
            }
            if source.is_some_and(|s| s != entitlement.source) {
                continue;
            }
            if !entitlement.is_metering() {
                return Some(entitlement);
            }
            metering_match.get_or_insert(entitlement);
        }
        metering_match
    }

    /// First grant from `source` carrying a token, regardless of product.
    pub fn get_entitlement_for_source(&self, source: &str) -> Option<&Entitlement> {
        self.entitlements
            .iter()
            .find(|e| !e.subscription_token.is_empty() && e.source == source)
    }

    /// Whether the page is unlocked by a grant that may be persisted.
    ///
    /// Metering grants are single-use and dev-mode grants are test artifacts.
    pub fn enables_this_with_cacheable_entitlements(&self) -> bool {
        self.get_entitlement_for_this(None)
            .is_some_and(|e| !e.is_metering() && !e.is_dev_mode())
    }

    /// Whether the best match for the page is a metering grant.
    pub fn enables_this_with_metering(&self) -> bool {
        self.get_entitlement_for_this(None)
            .is_some_and(Entitlement::is_metering)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::crypto::jwt::encode_unsigned;
    use serde_json::json;

    fn grant(source: &str, products: &[&str], token: &str) -> Entitlement {
        Entitlement::new(
            source,
            products.iter().map(|p| p.to_string()).collect(),
            token,
            None,
        )
    }

    fn set(grants: Vec<Entitlement>, product: &str) -> Entitlements {
        Entitlements::new("svc", "", grants, Some(product.to_string()), false, None)
    }

    fn metering_token(client_type: u8, show_toast: bool) -> String {
        encode_unsigned(
            &json!({"alg": "none"}),
            &json!({"metering": {"clientType": client_type, "showToast": show_toast}}),
        )
    }

    #[test]
    fn test_enables_exact_product() {
        let e = grant("google", &["pub:premium"], "t");
        assert!(e.enables(Some("pub:premium")));
        assert!(!e.enables(Some("pub:basic")));
    }

    #[test]
    fn test_enables_rejects_missing_product() {
        let e = grant("google", &["pub:premium"], "t");
        assert!(!e.enables(None));
        assert!(!e.enables(Some("")));
    }

    #[test]
    fn test_wildcard_grant_enables_product() {
        let e = grant("google", &["pub:*"], "t");
        assert!(e.enables(Some("pub:premium")));
        assert!(!e.enables(Some("other:premium")));
    }

    #[test]
    fn test_wildcard_request_matches_publication() {
        let e = grant("google", &["pub:premium"], "t");
        assert!(e.enables(Some("pub:*")));
        assert!(!e.enables(Some("other:*")));
    }

    #[test]
    fn test_product_without_separator_needs_exact_match() {
        let e = grant("google", &["standalone"], "t");
        assert!(e.enables(Some("standalone")));
        assert!(!e.enables(Some("standalone:x")));
    }

    #[test]
    fn test_prefers_subscription_over_metering() {
        let entitlements = set(
            vec![
                grant(GOOGLE_METERING_SOURCE, &["pub:basic"], "meter"),
                grant("google", &["pub:basic"], "sub"),
            ],
            "pub:basic",
        );
        let best = entitlements.get_entitlement_for_this(None).unwrap();
        assert_eq!(best.source(), "google");
        assert!(!entitlements.enables_this_with_metering());
    }

    #[test]
    fn test_falls_back_to_first_metering_match() {
        let entitlements = set(
            vec![
                grant("google", &["pub:other"], "sub"),
                grant(GOOGLE_METERING_SOURCE, &["pub:basic"], "meter-1"),
                grant(GOOGLE_METERING_SOURCE, &["pub:basic"], "meter-2"),
            ],
            "pub:basic",
        );
        let best = entitlements.get_entitlement_for_this(None).unwrap();
        assert_eq!(best.subscription_token(), "meter-1");
        assert!(entitlements.enables_this_with_metering());
    }

    #[test]
    fn test_source_filter() {
        let entitlements = set(
            vec![
                grant("google", &["pub:basic"], "sub"),
                grant("publisher", &["pub:basic"], "pub"),
            ],
            "pub:basic",
        );
        let best = entitlements
            .get_entitlement_for_this(Some("publisher"))
            .unwrap();
        assert_eq!(best.subscription_token(), "pub");
        assert!(entitlements
            .get_entitlement_for_this(Some("nobody"))
            .is_none());
    }

    #[test]
    fn test_get_entitlement_for_source_ignores_product() {
        let entitlements = set(
            vec![
                grant("google", &["x:y"], ""),
                grant("google", &["x:z"], "second"),
            ],
            "pub:basic",
        );
        let found = entitlements.get_entitlement_for_source("google").unwrap();
        assert_eq!(found.subscription_token(), "second");
        assert!(!entitlements.enables_this());
    }

    #[test]
    fn test_cacheable_excludes_metering_and_dev_mode() {
        let metering = set(
            vec![grant(GOOGLE_METERING_SOURCE, &["pub:basic"], "meter")],
            "pub:basic",
        );
        assert!(metering.enables_this());
        assert!(!metering.enables_this_with_cacheable_entitlements());

        let dev_marker = set(
            vec![grant("publisher", &["pub:basic"], "xGOOGLE_DEV_MODE_TOKENx")],
            "pub:basic",
        );
        assert!(!dev_marker.enables_this_with_cacheable_entitlements());

        let dev_exact = set(
            vec![grant("google", &["pub:basic"], DEV_MODE_SUBSCRIPTION_TOKEN)],
            "pub:basic",
        );
        assert!(!dev_exact.enables_this_with_cacheable_entitlements());

        let subscriber = set(vec![grant("google", &["pub:basic"], "real")], "pub:basic");
        assert!(subscriber.enables_this_with_cacheable_entitlements());
    }

    #[test]
    fn test_metering_token_contents_decoded() {
        let e = grant(GOOGLE_METERING_SOURCE, &["pub:basic"], &metering_token(2, true));
        assert_eq!(e.meter_client_type(), Some(MeterClientType::MeteredByGoogle));
        assert!(e.wants_toast());

        let undecodable = grant(GOOGLE_METERING_SOURCE, &["pub:basic"], "opaque");
        assert!(undecodable.token_contents().is_none());
        assert!(!undecodable.wants_toast());
    }

    #[test]
    fn test_non_metering_token_not_decoded() {
        let e = grant("google", &["pub:basic"], &metering_token(2, true));
        assert!(e.token_contents().is_none());
    }

    #[test]
    fn test_clone_is_value_equal() {
        let original = set(vec![grant("google", &["pub:basic"], "t")], "pub:basic");
        let copy = original.clone();
        assert_eq!(copy, original);
    }

    #[test]
    fn test_from_signed_checks_expiry() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let now = clock.now_epoch_seconds();
        let raw = encode_unsigned(
            &json!({"alg": "none"}),
            &json!({
                "exp": now + 60,
                "entitlements": [{"source": "google", "products": ["pub:basic"], "subscriptionToken": "t"}]
            }),
        );

        let fresh = Entitlements::from_signed(
            "svc",
            &raw,
            Some("pub:basic".to_string()),
            true,
            None,
            true,
            &clock,
        )
        .unwrap()
        .unwrap();
        assert!(fresh.enables_this());
        assert!(fresh.is_ready_to_pay());
        assert_eq!(fresh.raw(), raw);

        clock.advance(chrono::Duration::seconds(61));
        let expired = Entitlements::from_signed(
            "svc",
            &raw,
            Some("pub:basic".to_string()),
            false,
            None,
            true,
            &clock,
        )
        .unwrap();
        assert!(expired.is_none());
    }

    #[test]
    fn test_from_signed_without_exp_is_expired_when_required() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let raw = encode_unsigned(&json!({}), &json!({"entitlements": []}));
        let result =
            Entitlements::from_signed("svc", &raw, None, false, None, true, &clock).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_from_response_plain_json() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let response: EntitlementsResponse = serde_json::from_value(json!({
            "entitlements": [{"source": "subscriber", "products": ["news.example:basic"]}],
            "isReadyToPay": true,
            "decryptedDocumentKey": "key",
            "errorMessages": ["warn me"]
        }))
        .unwrap();

        let set = Entitlements::from_response(
            "svc",
            &response,
            Some("news.example:basic".to_string()),
            &clock,
        )
        .unwrap();
        assert!(set.enables_this());
        assert_eq!(set.raw(), "");
        assert!(set.is_ready_to_pay());
        assert_eq!(set.decrypted_document_key(), Some("key"));
    }

    #[test]
    fn test_from_response_signed_ignores_expiry() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let raw = encode_unsigned(
            &json!({}),
            &json!({"exp": 1, "entitlements": {"source": "google", "products": ["pub:basic"]}}),
        );
        let response = EntitlementsResponse {
            signed_entitlements: Some(raw.clone()),
            ..Default::default()
        };
        let set =
            Entitlements::from_response("svc", &response, Some("pub:basic".to_string()), &clock)
                .unwrap();
        assert!(set.enables_this());
        assert_eq!(set.raw(), raw);
    }

    #[test]
    fn test_from_response_malformed_signed() {
        let clock = MockClock::from_rfc3339("2025-01-15T12:00:00Z");
        let response = EntitlementsResponse {
            signed_entitlements: Some("not-a-token".to_string()),
            ..Default::default()
        };
        let result = Entitlements::from_response("svc", &response, None, &clock);
        assert!(matches!(result, Err(PaywardenError::MalformedToken(_))));
    }

    #[test]
    fn test_grant_kind_classification() {
        assert_eq!(GrantKind::of("google:metering"), GrantKind::Metering);
        assert_eq!(GrantKind::of("google"), GrantKind::Subscription);
        assert_eq!(GrantKind::of("privileged"), GrantKind::Privileged);
        assert_eq!(GrantKind::of("news.example"), GrantKind::Publisher);
    }
}
