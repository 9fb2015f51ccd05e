// src/error.rs
//! Error types shared across the gateway.
//!
//! Each layer raises its own narrow error enum. The Signature Verifier and the
//! Credential Codec never retry; only the job queue consults the upstream
//! classifier (see [`crate::errors::classifier`]) to decide on retries.

use thiserror::Error;

/// Failures of signature parsing, recovery, or signing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature is not a 65-byte `r || s || v` value
    #[error("invalid signature")]
    InvalidSignature,
    /// Signature parsed but no public key could be recovered from it
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Failures of the compact credential token codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    MalformedToken(String),
    #[error("invalid claims: {0}")]
    InvalidClaims(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// Recovered signer does not match the identifier declared in the payload
    #[error("signer mismatch: expected {expected}, recovered {recovered}")]
    SignerMismatch { expected: String, recovered: String },
}

/// Login rejections. Every variant maps to a stable, non-retryable code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("challenge signature does not match wallet address")]
    ChallengeSignatureInvalid,
    #[error("challenge expired or unknown")]
    ChallengeExpired,
    #[error("challenge already used")]
    ChallengeReplay,
    #[error("presentation signature required for this challenge")]
    VpSignatureMissing,
    #[error("presentation signature does not match wallet address")]
    VpSignatureInvalid,
    #[error("presentation message does not match the issued signing payload")]
    VpMessageMismatch,
    #[error("access token invalid: {0}")]
    InvalidAccessToken(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable code surfaced in error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MalformedRequest(_) => "MALFORMED_REQUEST",
            AuthError::ChallengeSignatureInvalid => "CHALLENGE_SIGNATURE_INVALID",
            AuthError::ChallengeExpired => "CHALLENGE_EXPIRED",
            AuthError::ChallengeReplay => "CHALLENGE_REPLAY",
            AuthError::VpSignatureMissing => "VP_SIGNATURE_MISSING",
            AuthError::VpSignatureInvalid => "VP_SIGNATURE_INVALID",
            AuthError::VpMessageMismatch => "VP_MESSAGE_MISMATCH",
            AuthError::InvalidAccessToken(_) => "INVALID_ACCESS_TOKEN",
            AuthError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Failures of the SQLite-backed stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("lock poisoned: {0}")]
    Poisoned(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Failures of queue operations (not job failures, which are classified).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {id} cannot be cancelled in state {state}")]
    NotCancellable { id: String, state: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Source(#[from] config::ConfigError),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}
