// src/queue/handlers.rs
//! Job handlers for the credential lifecycle.
//!
//! Every handler may be redelivered after a crash, so each one first checks
//! whether its effect is already in place and succeeds without repeating it.

use crate::clients::backend::Backend;
use crate::credential::attestation::{creation_message, transfer_message, verify_attestation};
use crate::error::StoreError;
use crate::errors::classifier::{ClassifiedError, ErrorCode};
use crate::models::credential::{CredentialRecord, CredentialStatus};
use crate::models::job::{CreateCredentialJob, Job, JobPayload, SyncProfileJob, TransferCredentialJob};
use crate::services::credential_issuer::CredentialIssuer;
use crate::storage::credential_store::CredentialStore;
use crate::storage::job_store::JobStore;
use crate::utils::crypto::{decode_signature_hex, format_address};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// Execution context handed to a handler for one attempt.
pub struct JobContext<'a> {
    pub job: &'a Job,
    store: &'a JobStore,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a Job, store: &'a JobStore) -> Self {
        JobContext { job, store }
    }

    /// Records progress (0-100). Failures are logged, never fatal to the job.
    pub fn progress(&self, percent: u8) {
        if let Err(e) = self.store.set_progress(&self.job.id, percent) {
            log::warn!("could not record progress for job {}: {}", self.job.id, e);
        }
    }
}

/// Runs one attempt of a job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), ClassifiedError>;
}

/// Handler for the three credential lifecycle job kinds.
pub struct CredentialJobHandler {
    issuer: Arc<CredentialIssuer>,
    credentials: Arc<CredentialStore>,
    backend: Arc<dyn Backend>,
}

impl CredentialJobHandler {
    pub fn new(
        issuer: Arc<CredentialIssuer>,
        credentials: Arc<CredentialStore>,
        backend: Arc<dyn Backend>,
    ) -> Self {
        CredentialJobHandler {
            issuer,
            credentials,
            backend,
        }
    }

    /// First issuance of a guardian credential.
    ///
    /// # Process Flow
    /// 1. Succeeds immediately if this job already stored its credential
    /// 2. Checks the subject, the requested issuer and the guardian's attestation
    /// 3. Refuses subjects that already have an active credential
    /// 4. Registers the subject on the ledger (skipped if already registered)
    /// 5. Signs and stores the credential, keyed by the job id
    async fn create_credential(
        &self,
        ctx: &JobContext<'_>,
        job: &CreateCredentialJob,
    ) -> Result<(), ClassifiedError> {
        if let Some(existing) = self.credentials.find_by_request(&ctx.job.id).map_err(storage)? {
            log::info!(
                "job {} already issued credential {}, nothing to do",
                ctx.job.id,
                existing.id
            );
            return Ok(());
        }

        if job.subject.trim().is_empty() {
            return Err(ClassifiedError::new(ErrorCode::InvalidJobPayload, "empty subject"));
        }
        if let Some(requested) = &job.issuer {
            if *requested != self.issuer.did() {
                return Err(ClassifiedError::new(ErrorCode::IssuerMismatch, requested));
            }
        }

        let signature = decode_signature_hex(&job.attestation)
            .map_err(|e| ClassifiedError::new(ErrorCode::InvalidAttestation, e))?;
        verify_attestation(&creation_message(&job.subject, job.guardian), &signature, job.guardian)
            .map_err(|e| ClassifiedError::new(ErrorCode::InvalidAttestation, e))?;

        if let Some(active) = self.credentials.active_for_subject(&job.subject).map_err(storage)? {
            return Err(ClassifiedError::new(
                ErrorCode::CredentialAlreadyIssued,
                format!("{} holds {}", job.subject, active.id),
            ));
        }
        ctx.progress(25);

        self.issuer.ensure_registered(&job.subject, job.guardian).await?;
        ctx.progress(75);

        let now = Utc::now();
        let issued = self
            .issuer
            .issue(&job.subject, job.guardian, job.claims.clone(), now)
            .map_err(|e| ClassifiedError::new(ErrorCode::CredentialSigningFailed, e))?;
        self.credentials
            .insert_active(&CredentialRecord {
                id: issued.id.clone(),
                subject: job.subject.clone(),
                holder: job.guardian,
                issuer: self.issuer.did(),
                token: issued.token,
                status: CredentialStatus::Active,
                request_id: ctx.job.id.clone(),
                issued_at: now,
                superseded_at: None,
                superseded_by: None,
            })
            .map_err(storage)?;

        log::info!(
            "issued credential {} for {} to {}",
            issued.id,
            job.subject,
            format_address(job.guardian)
        );
        Ok(())
    }

    /// Ownership change.
    ///
    /// # Process Flow
    /// 1. Rejects transfers to the current holder; succeeds immediately if the
    ///    active credential was issued by this job
    /// 2. Checks that `from` holds the active credential and signed the transfer
    /// 3. Moves custody on the ledger (skipped if already moved)
    /// 4. Supersedes the old credential and stores the new one in one transaction
    async fn transfer_credential(
        &self,
        ctx: &JobContext<'_>,
        job: &TransferCredentialJob,
    ) -> Result<(), ClassifiedError> {
        if job.from == job.to {
            return Err(ClassifiedError::new(
                ErrorCode::InvalidJobPayload,
                format!("{} is both source and destination", format_address(job.from)),
            ));
        }
        let active = self
            .credentials
            .active_for_subject(&job.subject)
            .map_err(storage)?
            .ok_or_else(|| ClassifiedError::new(ErrorCode::ActiveCredentialNotFound, &job.subject))?;

        if active.request_id == ctx.job.id {
            log::info!(
                "job {} already transferred {} to {}, nothing to do",
                ctx.job.id,
                job.subject,
                format_address(active.holder)
            );
            return Ok(());
        }
        if active.holder != job.from {
            return Err(ClassifiedError::new(
                ErrorCode::HolderMismatch,
                format!(
                    "{} is held by {}, not {}",
                    job.subject,
                    format_address(active.holder),
                    format_address(job.from)
                ),
            ));
        }

        let signature = decode_signature_hex(&job.attestation)
            .map_err(|e| ClassifiedError::new(ErrorCode::InvalidAttestation, e))?;
        let message = transfer_message(&job.subject, job.from, job.to, &active.id);
        verify_attestation(&message, &signature, job.from)
            .map_err(|e| ClassifiedError::new(ErrorCode::InvalidAttestation, e))?;
        ctx.progress(25);

        self.issuer.ensure_guardian(&job.subject, job.to).await?;
        ctx.progress(75);

        let now = Utc::now();
        let issued = self
            .issuer
            .issue(&job.subject, job.to, active_claims(&active), now)
            .map_err(|e| ClassifiedError::new(ErrorCode::CredentialSigningFailed, e))?;
        let replacement = CredentialRecord {
            id: issued.id.clone(),
            subject: job.subject.clone(),
            holder: job.to,
            issuer: self.issuer.did(),
            token: issued.token,
            status: CredentialStatus::Active,
            request_id: ctx.job.id.clone(),
            issued_at: now,
            superseded_at: None,
            superseded_by: None,
        };
        if !self
            .credentials
            .supersede_and_insert(&active.id, &replacement, now)
            .map_err(storage)?
        {
            return Err(ClassifiedError::new(
                ErrorCode::ActiveCredentialNotFound,
                format!("{} changed while transferring", active.id),
            ));
        }

        log::info!(
            "transferred {} from {} to {} (credential {} superseded by {})",
            job.subject,
            format_address(job.from),
            format_address(job.to),
            active.id,
            issued.id
        );
        Ok(())
    }

    async fn sync_profile(&self, job: &SyncProfileJob) -> Result<(), ClassifiedError> {
        self.backend.upsert_guardian_profile(job).await?;
        log::debug!("synced guardian profile {}", format_address(job.address));
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CredentialJobHandler {
    async fn handle(&self, ctx: &JobContext<'_>) -> Result<(), ClassifiedError> {
        match &ctx.job.payload {
            JobPayload::CreateCredential(job) => self.create_credential(ctx, job).await,
            JobPayload::TransferCredential(job) => self.transfer_credential(ctx, job).await,
            JobPayload::SyncExternalProfile(job) => self.sync_profile(job).await,
        }
    }
}

/// Domain claims carried over from the credential being superseded.
fn active_claims(record: &CredentialRecord) -> serde_json::Map<String, serde_json::Value> {
    match crate::credential::codec::decode_credential(&record.token) {
        Ok((_, claims)) => claims.vc.credential_subject.claims,
        Err(e) => {
            log::warn!(
                "credential {} for {} does not decode, reissuing without its claims: {}",
                record.id,
                record.subject,
                e
            );
            serde_json::Map::new()
        }
    }
}

fn storage(error: StoreError) -> ClassifiedError {
    ClassifiedError::new(ErrorCode::StorageUnavailable, error)
}
