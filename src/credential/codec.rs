// src/credential/codec.rs
//! Compact credential token codec.
//!
//! Wire format (ASCII, no newlines):
//! ```text
//! base64url(header_json) "." base64url(payload_json) "." base64url(signature_bytes)
//! ```
//! The signing input is the first two segments joined by a single `.`, byte for byte
//! as they appear on the wire. Tokens are immutable: re-encoding a decoded token
//! must reproduce the same signing input.

use crate::error::TokenError;
use crate::models::credential::{CredentialClaims, PresentationClaims, TokenHeader};
use crate::utils::serialization::{b64url_decode, b64url_encode, serialize};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// A token split into its three parts.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedToken {
    pub header: TokenHeader,
    pub payload: Value,
    pub signature: Vec<u8>,
    /// `segment0 + "." + segment1` exactly as received
    pub signing_input: String,
}

impl DecodedToken {
    /// Deserializes the payload into a typed claim set.
    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, TokenError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| TokenError::InvalidClaims(e.to_string()))
    }
}

/// Splits and parses a compact token.
///
/// # Errors
/// `TokenError::MalformedToken` if the token does not have exactly three non-empty
/// segments, a segment is not base64url, or the header/payload is not a JSON object.
pub fn decode(token: &str) -> Result<DecodedToken, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(TokenError::MalformedToken(format!(
            "expected 3 segments, found {}",
            segments.len()
        )));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TokenError::MalformedToken("empty segment".into()));
    }

    let header_json = decode_json_segment(segments[0], "header")?;
    let header: TokenHeader = serde_json::from_value(header_json)
        .map_err(|e| TokenError::MalformedToken(format!("header: {}", e)))?;
    let payload = decode_json_segment(segments[1], "payload")?;
    let signature = b64url_decode(segments[2])
        .map_err(|e| TokenError::MalformedToken(format!("signature: {}", e)))?;

    Ok(DecodedToken {
        header,
        payload,
        signature,
        signing_input: format!("{}.{}", segments[0], segments[1]),
    })
}

/// Joins header, payload and signature into a compact token.
pub fn encode<P: Serialize>(
    header: &TokenHeader,
    payload: &P,
    signature: &[u8],
) -> Result<String, TokenError> {
    let input = signing_input(header, payload)?;
    Ok(format!("{}.{}", input, b64url_encode(signature)))
}

/// Canonical signing input for a header/payload pair.
pub fn signing_input<P: Serialize>(header: &TokenHeader, payload: &P) -> Result<String, TokenError> {
    let header_json =
        serialize(header).map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
    let payload_json =
        serialize(payload).map_err(|e| TokenError::InvalidClaims(e.to_string()))?;
    Ok(format!(
        "{}.{}",
        b64url_encode(header_json.as_bytes()),
        b64url_encode(payload_json.as_bytes())
    ))
}

/// Decodes a token and parses its payload as credential claims.
pub fn decode_credential(token: &str) -> Result<(DecodedToken, CredentialClaims), TokenError> {
    let decoded = decode(token)?;
    let claims = decoded.claims()?;
    Ok((decoded, claims))
}

/// Decodes a token and parses its payload as presentation claims.
pub fn decode_presentation(token: &str) -> Result<(DecodedToken, PresentationClaims), TokenError> {
    let decoded = decode(token)?;
    let claims = decoded.claims()?;
    Ok((decoded, claims))
}

fn decode_json_segment(segment: &str, name: &str) -> Result<Value, TokenError> {
    let bytes = b64url_decode(segment)
        .map_err(|e| TokenError::MalformedToken(format!("{}: {}", name, e)))?;
    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| TokenError::MalformedToken(format!("{}: {}", name, e)))?;
    if !value.is_object() {
        return Err(TokenError::MalformedToken(format!("{} is not a JSON object", name)));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> (TokenHeader, Value, Vec<u8>) {
        (
            TokenHeader::default(),
            json!({"iss": "did:ethr:0x00", "n": 1, "nested": {"k": [1, 2]}}),
            (0u8..65).collect(),
        )
    }

    #[test]
    fn test_encode_decode_preserves_parts() {
        let (header, payload, signature) = sample();
        let token = encode(&header, &payload, &signature).unwrap();
        let decoded = decode(&token).unwrap();

        assert_eq!(decoded.header, header);
        assert_eq!(decoded.payload, payload);
        assert_eq!(decoded.signature, signature);
        assert_eq!(decoded.signing_input, signing_input(&header, &payload).unwrap());
        assert!(token.is_ascii());
        assert!(!token.contains('\n'));
    }

    #[test]
    fn test_signing_input_is_first_two_segments() {
        let (header, payload, signature) = sample();
        let token = encode(&header, &payload, &signature).unwrap();
        let last_dot = token.rfind('.').unwrap();
        assert_eq!(decode(&token).unwrap().signing_input, &token[..last_dot]);
    }

    #[test]
    fn test_wrong_segment_count() {
        assert!(matches!(decode("a.b"), Err(TokenError::MalformedToken(_))));
        assert!(matches!(decode("a.b.c.d"), Err(TokenError::MalformedToken(_))));
        assert!(matches!(decode(""), Err(TokenError::MalformedToken(_))));
    }

    #[test]
    fn test_empty_segment() {
        let (header, payload, signature) = sample();
        let token = encode(&header, &payload, &signature).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let missing_sig = format!("{}.{}.", parts[0], parts[1]);
        assert!(matches!(decode(&missing_sig), Err(TokenError::MalformedToken(_))));
    }

    #[test]
    fn test_non_json_payload() {
        let header = b64url_encode(br#"{"alg":"ES256K-R","typ":"JWT"}"#);
        let payload = b64url_encode(b"not json");
        let token = format!("{}.{}.{}", header, payload, b64url_encode(&[1, 2, 3]));
        assert!(matches!(decode(&token), Err(TokenError::MalformedToken(_))));

        let array_payload = b64url_encode(b"[1,2]");
        let token = format!("{}.{}.{}", header, array_payload, b64url_encode(&[1]));
        assert!(matches!(decode(&token), Err(TokenError::MalformedToken(_))));
    }

    #[test]
    fn test_typed_claims_mismatch() {
        let (header, payload, signature) = sample();
        let token = encode(&header, &payload, &signature).unwrap();
        assert!(matches!(
            decode_credential(&token),
            Err(TokenError::InvalidClaims(_))
        ));
    }
}
