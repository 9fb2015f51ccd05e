// src/errors/classifier.rs
//! Upstream error classification.
//!
//! Collaborator adapters (ledger RPC, relational backend, ML server, token faucet)
//! never hand raw error strings to the rest of the gateway. They build an
//! [`UpstreamError`]: a closed set of tagged failure shapes. [`classify`] maps each
//! shape onto a closed [`ErrorCode`] taxonomy:
//!
//! ```text
//! <DOMAIN>_<NNNN>     NNNN in 4xxx -> client/state error, never retried
//!                     NNNN in 5xxx -> infrastructure error, retryable
//! ```
//!
//! The `retryable` flag on a [`ClassifiedError`] is the only thing the job queue
//! looks at when deciding whether to reschedule a failed job.
//!
//! Revert reasons are free text produced by the contracts. Matching on them
//! (`"already"`, `"guardian"`) is best-effort and can misclassify a revert whose
//! message happens to contain those words.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// External collaborator a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Upstream {
    Ledger,
    Ml,
    Backend,
    Faucet,
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Upstream::Ledger => "ledger",
            Upstream::Ml => "ml",
            Upstream::Backend => "backend",
            Upstream::Faucet => "faucet",
        };
        f.write_str(name)
    }
}

/// Contract a reverted transaction was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractTarget {
    PetRegistry,
    GuardianRegistry,
    AccessControl,
}

/// Structured failure shapes produced by collaborator adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// Transaction mined with a failed status, or a call reverted during estimation
    Reverted {
        reason: Option<String>,
        logs_emitted: usize,
        target: Option<ContractTarget>,
    },
    InsufficientFunds,
    NonceTooLow,
    /// Non-success HTTP response, with the error code from the body if one was present
    Status {
        status: u16,
        code: Option<String>,
        message: Option<String>,
    },
    /// JSON-RPC error object that matched none of the ledger-specific shapes
    Rpc { code: i64, message: String },
    ConnectionRefused,
    Dns,
    Timeout,
    Network(String),
    Unknown(String),
}

/// A failure reported by one external collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamError {
    pub upstream: Upstream,
    pub failure: UpstreamFailure,
    /// Request path, used to pick domain-specific not-found/conflict codes
    pub endpoint: Option<String>,
}

impl UpstreamError {
    pub fn new(upstream: Upstream, failure: UpstreamFailure) -> Self {
        UpstreamError {
            upstream,
            failure,
            endpoint: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn timeout(upstream: Upstream) -> Self {
        Self::new(upstream, UpstreamFailure::Timeout)
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} call failed: ", self.upstream)?;
        match &self.failure {
            UpstreamFailure::Reverted { reason, logs_emitted, .. } => write!(
                f,
                "reverted ({}; {} logs)",
                reason.as_deref().unwrap_or("no reason"),
                logs_emitted
            ),
            UpstreamFailure::InsufficientFunds => f.write_str("insufficient funds"),
            UpstreamFailure::NonceTooLow => f.write_str("nonce too low"),
            UpstreamFailure::Status { status, code, message } => write!(
                f,
                "HTTP {}{}{}",
                status,
                code.as_deref().map(|c| format!(" {}", c)).unwrap_or_default(),
                message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default()
            ),
            UpstreamFailure::Rpc { code, message } => write!(f, "rpc error {}: {}", code, message),
            UpstreamFailure::ConnectionRefused => f.write_str("connection refused"),
            UpstreamFailure::Dns => f.write_str("dns resolution failed"),
            UpstreamFailure::Timeout => f.write_str("timed out"),
            UpstreamFailure::Network(msg) => write!(f, "network error: {}", msg),
            UpstreamFailure::Unknown(msg) => write!(f, "{}", msg),
        }?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, " [{}]", endpoint)?;
        }
        Ok(())
    }
}

impl std::error::Error for UpstreamError {}

/// Code prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Ledger,
    Backend,
    Ml,
    Faucet,
    Gateway,
}

impl ErrorDomain {
    pub fn prefix(&self) -> &'static str {
        match self {
            ErrorDomain::Ledger => "LEDGER",
            ErrorDomain::Backend => "BACKEND",
            ErrorDomain::Ml => "ML",
            ErrorDomain::Faucet => "FAUCET",
            ErrorDomain::Gateway => "GATEWAY",
        }
    }
}

macro_rules! error_codes {
    ($($variant:ident => ($domain:ident, $number:literal, $text:literal)),+ $(,)?) => {
        /// Closed taxonomy of classified failures.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $($variant),+
        }

        impl ErrorCode {
            pub const ALL: &'static [ErrorCode] = &[$(ErrorCode::$variant),+];

            pub fn domain(&self) -> ErrorDomain {
                match self {
                    $(ErrorCode::$variant => ErrorDomain::$domain),+
                }
            }

            pub fn number(&self) -> u16 {
                match self {
                    $(ErrorCode::$variant => $number),+
                }
            }

            pub fn description(&self) -> &'static str {
                match self {
                    $(ErrorCode::$variant => $text),+
                }
            }
        }
    };
}

error_codes! {
    // Ledger
    PetAlreadyRegistered => (Ledger, 4001, "subject is already registered on-chain"),
    GuardianAlreadyRegistered => (Ledger, 4002, "guardian is already registered on-chain"),
    NotAuthorized => (Ledger, 4003, "caller is not authorized for this contract call"),
    InvalidTransaction => (Ledger, 4004, "transaction reverted"),
    InsufficientFunds => (Ledger, 4005, "insufficient funds for gas"),
    LedgerUnknown => (Ledger, 4999, "unrecognized ledger error"),
    LedgerRpcError => (Ledger, 5000, "ledger RPC node error"),
    NonceTooLow => (Ledger, 5001, "nonce too low; refetch nonce and resubmit"),
    LedgerNetworkError => (Ledger, 5002, "ledger network error"),
    LedgerTimeout => (Ledger, 5003, "ledger call timed out"),
    // Relational backend
    BackendBadRequest => (Backend, 4000, "backend rejected the request"),
    BackendUnauthorized => (Backend, 4010, "backend authentication failed"),
    BackendForbidden => (Backend, 4030, "backend denied access"),
    NotFound => (Backend, 4040, "resource not found"),
    PetNotFound => (Backend, 4041, "pet not found"),
    GuardianNotFound => (Backend, 4042, "guardian not found"),
    AdoptionNotFound => (Backend, 4043, "adoption not found"),
    StoryNotFound => (Backend, 4044, "story not found"),
    ChatRoomNotFound => (Backend, 4045, "chat room not found"),
    PaymentNotFound => (Backend, 4046, "payment not found"),
    Conflict => (Backend, 4090, "resource conflict"),
    AdoptionAlreadyExists => (Backend, 4091, "adoption already exists"),
    GuardianAlreadyExists => (Backend, 4092, "guardian already exists"),
    BackendUnknown => (Backend, 4999, "unrecognized backend error"),
    BackendInternalError => (Backend, 5000, "backend internal error"),
    BadGateway => (Backend, 5002, "backend bad gateway"),
    ServiceUnavailable => (Backend, 5003, "backend service unavailable"),
    GatewayTimeout => (Backend, 5004, "backend gateway timeout"),
    BackendConnectionFailed => (Backend, 5010, "backend connection failed"),
    BackendRequestTimeout => (Backend, 5011, "backend request timed out"),
    BackendRateLimited => (Backend, 5029, "backend rate limit exceeded"),
    // ML verification server
    MlBadRequest => (Ml, 4000, "ML server rejected the request"),
    InvalidImage => (Ml, 4001, "image is invalid or unsupported"),
    FeatureNotDetected => (Ml, 4002, "no biometric feature detected in image"),
    ImageTooLarge => (Ml, 4003, "image exceeds size limit"),
    MlUnknown => (Ml, 4999, "unrecognized ML server error"),
    MlInternalError => (Ml, 5000, "ML server internal error"),
    ModelUnavailable => (Ml, 5001, "similarity model unavailable"),
    StorageConnectionFailed => (Ml, 5002, "ML storage connection failed"),
    MlConnectionFailed => (Ml, 5010, "ML server connection failed"),
    MlTimeout => (Ml, 5011, "ML server request timed out"),
    // Token faucet
    FaucetBadRequest => (Faucet, 4000, "faucet rejected the request"),
    InvalidAddress => (Faucet, 4001, "invalid recipient address"),
    AmountTooHigh => (Faucet, 4002, "requested amount too high"),
    CooldownActive => (Faucet, 4003, "faucet cooldown active for this address"),
    FaucetUnknown => (Faucet, 4999, "unrecognized faucet error"),
    FaucetInternalError => (Faucet, 5000, "faucet internal error"),
    FaucetBalanceLow => (Faucet, 5001, "faucet balance too low"),
    FaucetConnectionFailed => (Faucet, 5010, "faucet connection failed"),
    FaucetTimeout => (Faucet, 5011, "faucet request timed out"),
    // Gateway-local job failures
    InvalidJobPayload => (Gateway, 4001, "job payload is invalid"),
    InvalidAttestation => (Gateway, 4002, "holder attestation does not verify"),
    IssuerMismatch => (Gateway, 4003, "requested issuer is not served by this gateway"),
    CredentialAlreadyIssued => (Gateway, 4004, "subject already has an active credential"),
    ActiveCredentialNotFound => (Gateway, 4005, "subject has no active credential"),
    HolderMismatch => (Gateway, 4006, "transfer source is not the current holder"),
    CredentialSigningFailed => (Gateway, 4007, "credential could not be signed"),
    StorageUnavailable => (Gateway, 5001, "credential storage unavailable"),
}

impl ErrorCode {
    /// 5xxx codes are transient.
    pub fn retryable(&self) -> bool {
        self.number() >= 5000
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.domain().prefix(), self.number())
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .iter()
            .copied()
            .find(|code| code.to_string() == s)
            .ok_or_else(|| format!("unknown error code {}", s))
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Result of classification: what to surface and whether to retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ClassifiedError {
    pub fn new(code: ErrorCode, detail: impl fmt::Display) -> Self {
        ClassifiedError {
            code,
            message: format!("{}: {}", code.description(), detail),
            retryable: code.retryable(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<UpstreamError> for ClassifiedError {
    fn from(error: UpstreamError) -> Self {
        classify(&error)
    }
}

/// Maps an upstream failure onto the error taxonomy. Pure and deterministic.
pub fn classify(error: &UpstreamError) -> ClassifiedError {
    let code = match error.upstream {
        Upstream::Ledger => classify_ledger(&error.failure),
        Upstream::Backend => classify_backend(&error.failure, error.endpoint.as_deref()),
        Upstream::Ml => classify_ml(&error.failure),
        Upstream::Faucet => classify_faucet(&error.failure),
    };
    ClassifiedError::new(code, error)
}

fn classify_ledger(failure: &UpstreamFailure) -> ErrorCode {
    match failure {
        UpstreamFailure::Reverted {
            reason,
            logs_emitted: 0,
            target,
        } => {
            let reason = reason.as_deref().unwrap_or("").to_lowercase();
            if reason.contains("already") {
                if *target == Some(ContractTarget::GuardianRegistry) || reason.contains("guardian")
                {
                    ErrorCode::GuardianAlreadyRegistered
                } else {
                    ErrorCode::PetAlreadyRegistered
                }
            } else if is_authorization_revert(&reason)
                || *target == Some(ContractTarget::AccessControl)
            {
                ErrorCode::NotAuthorized
            } else {
                ErrorCode::InvalidTransaction
            }
        }
        UpstreamFailure::Reverted { .. } => ErrorCode::InvalidTransaction,
        UpstreamFailure::InsufficientFunds => ErrorCode::InsufficientFunds,
        UpstreamFailure::NonceTooLow => ErrorCode::NonceTooLow,
        UpstreamFailure::Timeout => ErrorCode::LedgerTimeout,
        UpstreamFailure::ConnectionRefused
        | UpstreamFailure::Dns
        | UpstreamFailure::Network(_) => ErrorCode::LedgerNetworkError,
        UpstreamFailure::Rpc { .. } => ErrorCode::LedgerRpcError,
        UpstreamFailure::Status { status, .. } if *status == 429 || *status >= 500 => {
            ErrorCode::LedgerRpcError
        }
        UpstreamFailure::Status { .. } | UpstreamFailure::Unknown(_) => ErrorCode::LedgerUnknown,
    }
}

fn is_authorization_revert(reason: &str) -> bool {
    ["not authorized", "unauthorized", "accesscontrol", "caller is not", "not the owner", "only owner"]
        .iter()
        .any(|needle| reason.contains(needle))
}

/// Resource family named by a backend path (`/api/pets/7` -> pets).
fn endpoint_resource(endpoint: Option<&str>) -> Option<&'static str> {
    let path = endpoint?.to_lowercase();
    ["pets", "guardians", "adoptions", "stories", "chat", "payments"]
        .into_iter()
        .find(|resource| path.split('/').any(|segment| segment.starts_with(resource)))
}

fn classify_backend(failure: &UpstreamFailure, endpoint: Option<&str>) -> ErrorCode {
    match failure {
        UpstreamFailure::Status { status, .. } => match *status {
            400 | 422 => ErrorCode::BackendBadRequest,
            401 => ErrorCode::BackendUnauthorized,
            403 => ErrorCode::BackendForbidden,
            404 => match endpoint_resource(endpoint) {
                Some("pets") => ErrorCode::PetNotFound,
                Some("guardians") => ErrorCode::GuardianNotFound,
                Some("adoptions") => ErrorCode::AdoptionNotFound,
                Some("stories") => ErrorCode::StoryNotFound,
                Some("chat") => ErrorCode::ChatRoomNotFound,
                Some("payments") => ErrorCode::PaymentNotFound,
                _ => ErrorCode::NotFound,
            },
            409 => match endpoint_resource(endpoint) {
                Some("adoptions") => ErrorCode::AdoptionAlreadyExists,
                Some("guardians") => ErrorCode::GuardianAlreadyExists,
                _ => ErrorCode::Conflict,
            },
            429 => ErrorCode::BackendRateLimited,
            502 => ErrorCode::BadGateway,
            503 => ErrorCode::ServiceUnavailable,
            504 => ErrorCode::GatewayTimeout,
            s if s >= 500 => ErrorCode::BackendInternalError,
            _ => ErrorCode::BackendUnknown,
        },
        UpstreamFailure::ConnectionRefused
        | UpstreamFailure::Dns
        | UpstreamFailure::Network(_) => ErrorCode::BackendConnectionFailed,
        UpstreamFailure::Timeout => ErrorCode::BackendRequestTimeout,
        _ => ErrorCode::BackendUnknown,
    }
}

fn classify_ml(failure: &UpstreamFailure) -> ErrorCode {
    match failure {
        UpstreamFailure::Status { status, code, .. } => {
            match code.as_deref().map(str::to_uppercase).as_deref() {
                Some("INVALID_IMAGE") | Some("INVALID_IMAGE_FORMAT") => ErrorCode::InvalidImage,
                Some("NO_NOSE_DETECTED") | Some("FEATURE_NOT_DETECTED") => {
                    ErrorCode::FeatureNotDetected
                }
                Some("IMAGE_TOO_LARGE") | Some("FILE_TOO_LARGE") => ErrorCode::ImageTooLarge,
                Some("MODEL_NOT_LOADED") | Some("MODEL_UNAVAILABLE") => ErrorCode::ModelUnavailable,
                Some("STORAGE_CONNECTION_FAILED") | Some("S3_CONNECTION_FAILED") => {
                    ErrorCode::StorageConnectionFailed
                }
                _ => match *status {
                    413 => ErrorCode::ImageTooLarge,
                    415 | 422 => ErrorCode::InvalidImage,
                    503 => ErrorCode::ModelUnavailable,
                    s if s >= 500 => ErrorCode::MlInternalError,
                    s if s >= 400 => ErrorCode::MlBadRequest,
                    _ => ErrorCode::MlUnknown,
                },
            }
        }
        UpstreamFailure::ConnectionRefused
        | UpstreamFailure::Dns
        | UpstreamFailure::Network(_) => ErrorCode::MlConnectionFailed,
        UpstreamFailure::Timeout => ErrorCode::MlTimeout,
        _ => ErrorCode::MlUnknown,
    }
}

fn classify_faucet(failure: &UpstreamFailure) -> ErrorCode {
    match failure {
        UpstreamFailure::Status { status, code, .. } => {
            match code.as_deref().map(str::to_uppercase).as_deref() {
                Some("INVALID_ADDRESS") => ErrorCode::InvalidAddress,
                Some("AMOUNT_TOO_HIGH") | Some("AMOUNT_EXCEEDS_LIMIT") => ErrorCode::AmountTooHigh,
                Some("COOLDOWN_ACTIVE") | Some("RATE_LIMITED") => ErrorCode::CooldownActive,
                Some("INSUFFICIENT_FAUCET_BALANCE") => ErrorCode::FaucetBalanceLow,
                _ => match *status {
                    429 => ErrorCode::CooldownActive,
                    s if s >= 500 => ErrorCode::FaucetInternalError,
                    s if s >= 400 => ErrorCode::FaucetBadRequest,
                    _ => ErrorCode::FaucetUnknown,
                },
            }
        }
        UpstreamFailure::ConnectionRefused
        | UpstreamFailure::Dns
        | UpstreamFailure::Network(_) => ErrorCode::FaucetConnectionFailed,
        UpstreamFailure::Timeout => ErrorCode::FaucetTimeout,
        _ => ErrorCode::FaucetUnknown,
    }
}
