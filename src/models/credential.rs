// src/models/credential.rs
//! Verifiable Credential and Verifiable Presentation data models.
//!
//! Both artifacts travel as compact three-part tokens (see [`crate::credential::codec`]).
//! This module defines the JSON shapes carried in the header and payload segments,
//! loosely following the JWT encoding of the
//! [W3C Verifiable Credentials Data Model](https://www.w3.org/TR/vc-data-model/).

use crate::models::did::Did;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Signature algorithm advertised in every token header (recoverable secp256k1).
pub const TOKEN_ALGORITHM: &str = "ES256K-R";
pub const TOKEN_TYPE: &str = "JWT";

pub const VC_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";
pub const VC_TYPE: &str = "VerifiableCredential";
pub const GUARDIAN_CREDENTIAL_TYPE: &str = "GuardianCredential";
pub const VP_TYPE: &str = "VerifiablePresentation";

/// Token header segment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub alg: String,
    pub typ: String,
}

impl Default for TokenHeader {
    fn default() -> Self {
        TokenHeader {
            alg: TOKEN_ALGORITHM.to_string(),
            typ: TOKEN_TYPE.to_string(),
        }
    }
}

/// Domain claims about the subject of a credential.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialSubject {
    /// Identifier of the entity the credential is about (e.g. a pet's DID)
    pub id: String,
    /// Current guardian (holder) of the subject
    pub guardian: Did,
    /// Any additional domain claims
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialBody {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    #[serde(rename = "type")]
    pub types: Vec<String>,
    #[serde(rename = "credentialSubject")]
    pub credential_subject: CredentialSubject,
}

/// Payload of a Verifiable Credential token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialClaims {
    /// Credential id (`urn:uuid:...`)
    pub jti: String,
    /// Issuer DID; the token signature must recover to this address
    pub iss: Did,
    /// Subject identifier, mirrored from `vc.credentialSubject.id`
    pub sub: String,
    /// Issued-at, seconds since the epoch
    pub iat: i64,
    pub vc: CredentialBody,
}

impl CredentialClaims {
    pub fn guardian(&self) -> &Did {
        &self.vc.credential_subject.guardian
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresentationBody {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    #[serde(rename = "type")]
    pub types: Vec<String>,
    pub holder: Did,
    /// Ordered sequence of embedded VC tokens
    #[serde(rename = "verifiableCredential", default)]
    pub verifiable_credential: Vec<String>,
}

/// Payload of a Verifiable Presentation token.
///
/// The signature segment of a presentation is the holder's signature over
/// `keccak256(signing_data)`, obtained from the wallet during login.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresentationClaims {
    pub iss: Did,
    pub aud: String,
    /// Login challenge the presentation is bound to
    pub nonce: String,
    pub iat: i64,
    #[serde(rename = "signingData")]
    pub signing_data: String,
    pub vp: PresentationBody,
}

/// Lifecycle state of a stored credential.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Superseded,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Superseded => "superseded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(CredentialStatus::Active),
            "superseded" => Some(CredentialStatus::Superseded),
            _ => None,
        }
    }
}

/// A credential as persisted by the gateway.
///
/// Records are never deleted: a transfer marks the previous record superseded and
/// links it to its replacement.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub subject: String,
    pub holder: Address,
    pub issuer: Did,
    pub token: String,
    pub status: CredentialStatus,
    /// Id of the job that issued this record (idempotency key)
    pub request_id: String,
    pub issued_at: DateTime<Utc>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub superseded_by: Option<String>,
}
