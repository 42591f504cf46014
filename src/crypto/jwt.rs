//! Compact signed token decoding.
//!
//! A compact token is `base64url(header) . base64url(payload) . signature`.
//! Decoding is purely structural: the entitlement service verifies
//! signatures, so nothing here checks them.

use crate::PaywardenError;
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine,
};
use serde_json::Value;

/// URL-safe base64 that emits no padding and accepts input with or without it.
pub const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// A structurally decoded compact token.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedToken {
    /// Decoded header object.
    pub header: Value,
    /// Decoded payload object.
    pub payload: Value,
    /// The still-encoded `header.payload` prefix, kept for signature checks.
    pub signed_input: String,
    /// The raw, still-encoded signature segment.
    pub signature: String,
}

/// Decode a compact token into its parts.
///
/// # Errors
/// * `MalformedToken` - the token does not split into exactly three segments,
///   or the header or payload is not base64url-encoded UTF-8 JSON.
pub fn decode(token: &str) -> Result<DecodedToken, PaywardenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(PaywardenError::MalformedToken(format!(
            "expected 3 segments, found {}",
            parts.len()
        )));
    }

    let header = decode_segment(parts[0], "header")?;
    let payload = decode_segment(parts[1], "payload")?;

    Ok(DecodedToken {
        header,
        payload,
        signed_input: format!("{}.{}", parts[0], parts[1]),
        signature: parts[2].to_string(),
    })
}

/// Decode a token and return only its payload.
pub fn decode_payload(token: &str) -> Result<Value, PaywardenError> {
    decode(token).map(|decoded| decoded.payload)
}

fn decode_segment(segment: &str, name: &str) -> Result<Value, PaywardenError> {
    let bytes = BASE64URL
        .decode(segment)
        .map_err(|e| PaywardenError::MalformedToken(format!("{} is not base64url: {}", name, e)))?;
    let text = std::str::from_utf8(&bytes)
        .map_err(|e| PaywardenError::MalformedToken(format!("{} is not UTF-8: {}", name, e)))?;
    serde_json::from_str(text)
        .map_err(|e| PaywardenError::MalformedToken(format!("{} is not JSON: {}", name, e)))
}

/// Encode an unsigned compact token. Used to build fixtures and dev tokens.
pub fn encode_unsigned(header: &Value, payload: &Value) -> String {
    format!(
        "{}.{}.",
        BASE64URL.encode(header.to_string()),
        BASE64URL.encode(payload.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_valid_token() {
        let token = format!(
            "{}.{}.c2lnbmF0dXJl",
            BASE64URL.encode(r#"{"alg":"RS256","typ":"JWT"}"#),
            BASE64URL.encode(r#"{"exp":1700000000,"iss":"service"}"#)
        );
        let decoded = decode(&token).unwrap();

        assert_eq!(decoded.header["alg"], "RS256");
        assert_eq!(decoded.payload["exp"], 1_700_000_000);
        assert_eq!(decoded.signature, "c2lnbmF0dXJl");
        assert!(token.starts_with(&decoded.signed_input));
    }

    #[test]
    fn test_decode_accepts_padding() {
        let header = base64::engine::general_purpose::URL_SAFE.encode(r#"{"a":1}"#);
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"b":22}"#);
        let decoded = decode(&format!("{}.{}.sig", header, payload)).unwrap();
        assert_eq!(decoded.payload["b"], 22);
    }

    #[test]
    fn test_decode_wrong_segment_count() {
        assert!(matches!(
            decode("only.two"),
            Err(PaywardenError::MalformedToken(_))
        ));
        assert!(matches!(
            decode("a.b.c.d"),
            Err(PaywardenError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_decode_bad_json_payload() {
        let token = format!(
            "{}.{}.sig",
            BASE64URL.encode(r#"{"alg":"none"}"#),
            BASE64URL.encode("not json")
        );
        assert!(matches!(
            decode(&token),
            Err(PaywardenError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_decode_bad_base64_header() {
        assert!(matches!(
            decode("!!!.e30.sig"),
            Err(PaywardenError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_encode_unsigned_decodes() {
        let token = encode_unsigned(&json!({"alg": "none"}), &json!({"exp": 5}));
        assert_eq!(decode_payload(&token).unwrap(), json!({"exp": 5}));
    }
}
