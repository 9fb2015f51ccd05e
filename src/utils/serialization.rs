// src/utils/serialization.rs
//! Serialization utilities for the gateway.
//!
//! Provides helpers for:
//! - JSON encoding of token segments
//! - Base64url (unpadded) segments of compact credential tokens

use serde::Serialize;

/// Serializes a value to a JSON string.
///
/// # Arguments
/// * `data` - The value to serialize (must implement `Serialize`)
///
/// # Returns
/// - `Ok(String)` with JSON representation on success
/// - `Err(serde_json::Error)` if serialization fails
pub fn serialize<T: Serialize>(data: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(data)
}

/// Encodes bytes as unpadded base64url.
pub fn b64url_encode(data: &[u8]) -> String {
    base64::encode_config(data, base64::URL_SAFE_NO_PAD)
}

/// Decodes unpadded base64url.
///
/// # Errors
/// Returns a message if the input holds characters outside the URL-safe alphabet
/// or has an impossible length.
pub fn b64url_decode(data: &str) -> Result<Vec<u8>, String> {
    base64::decode_config(data, base64::URL_SAFE_NO_PAD)
        .map_err(|e| format!("Base64 decoding failed: {}", e))
}
