// src/models/job.rs
//! Job model for the credential lifecycle queue.

use crate::errors::classifier::ClassifiedError;
use crate::models::did::Did;
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque job identifier assigned at enqueue time (UUID v4).
pub type JobId = String;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    CreateCredential,
    TransferCredential,
    SyncExternalProfile,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::CreateCredential => "create-credential",
            JobKind::TransferCredential => "transfer-credential",
            JobKind::SyncExternalProfile => "sync-external-profile",
        }
    }
}

/// First issuance of a guardian credential for a subject.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateCredentialJob {
    pub subject: String,
    pub guardian: Address,
    /// Issuer the caller expects; must be the gateway's own DID when present
    #[serde(default)]
    pub issuer: Option<Did>,
    /// Guardian's signature over the creation attestation message (hex)
    pub attestation: String,
    #[serde(default)]
    pub claims: Map<String, Value>,
}

/// Ownership change: supersede the active credential and issue one to the new guardian.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransferCredentialJob {
    pub subject: String,
    pub from: Address,
    pub to: Address,
    /// Current holder's signature over the transfer attestation message (hex)
    pub attestation: String,
}

/// Upsert of guardian contact and verification metadata into the relational backend.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncProfileJob {
    pub address: Address,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    pub wallet_verified: bool,
    pub credential_count: usize,
    pub verified_at: DateTime<Utc>,
}

/// Work carried by a job, tagged by kind.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    CreateCredential(CreateCredentialJob),
    TransferCredential(TransferCredentialJob),
    SyncExternalProfile(SyncProfileJob),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::CreateCredential(_) => JobKind::CreateCredential,
            JobPayload::TransferCredential(_) => JobKind::TransferCredential,
            JobPayload::SyncExternalProfile(_) => JobKind::SyncExternalProfile,
        }
    }

    /// Mutual-exclusion key: credential mutations of one subject run one at a time.
    pub fn subject_key(&self) -> Option<String> {
        match self {
            JobPayload::CreateCredential(job) => Some(format!("subject:{}", job.subject)),
            JobPayload::TransferCredential(job) => Some(format!("subject:{}", job.subject)),
            JobPayload::SyncExternalProfile(_) => None,
        }
    }
}

/// Priority tier; lower value runs first.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn value(&self) -> i64 {
        match self {
            Priority::High => 1,
            Priority::Normal => 5,
            Priority::Low => 10,
        }
    }

    pub fn from_value(value: i64) -> Self {
        match value {
            v if v <= 1 => Priority::High,
            v if v >= 10 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    None,
    Linear,
    Exponential,
}

/// Retry bound and backoff carried by every job.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 1_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    /// Waiting with a run time in the future (backoff)
    Delayed,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "waiting" => Some(JobState::Waiting),
            "delayed" => Some(JobState::Delayed),
            "active" => Some(JobState::Active),
            "completed" => Some(JobState::Completed),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub payload: JobPayload,
    pub priority: Priority,
    pub state: JobState,
    pub attempts_made: u32,
    pub retry: RetryPolicy,
    pub progress: u8,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<ClassifiedError>,
    pub subject_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id.clone(),
            kind: self.payload.kind(),
            state: self.state,
            progress: self.progress,
            attempts_made: self.attempts_made,
            max_attempts: self.retry.attempts,
            failed_reason: self.last_error.as_ref().map(|e| e.message.clone()),
            last_error: self.last_error.clone(),
        }
    }
}

/// Externally visible job status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub failed_reason: Option<String>,
    pub last_error: Option<ClassifiedError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let payload = JobPayload::TransferCredential(TransferCredentialJob {
            subject: "did:pet:1".into(),
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            attestation: "0x00".into(),
        });
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "transfer-credential");
        assert_eq!(json["data"]["subject"], "did:pet:1");
        assert_eq!(serde_json::from_value::<JobPayload>(json).unwrap(), payload);
    }

    #[test]
    fn test_subject_key_shared_by_create_and_transfer() {
        let create = JobPayload::CreateCredential(CreateCredentialJob {
            subject: "s1".into(),
            guardian: Address::zero(),
            issuer: None,
            attestation: String::new(),
            claims: Map::new(),
        });
        let transfer = JobPayload::TransferCredential(TransferCredentialJob {
            subject: "s1".into(),
            from: Address::zero(),
            to: Address::zero(),
            attestation: String::new(),
        });
        assert_eq!(create.subject_key(), transfer.subject_key());
    }

    #[test]
    fn test_priority_values_order() {
        assert!(Priority::High.value() < Priority::Normal.value());
        assert!(Priority::Normal.value() < Priority::Low.value());
        for p in [Priority::High, Priority::Normal, Priority::Low] {
            assert_eq!(Priority::from_value(p.value()), p);
        }
    }
}
