// src/services/credential_issuer.rs
//! Credential Issuer Service
//!
//! Issues guardian credentials signed with the gateway key and keeps the
//! on-chain registry in step with them.
//!
//! Ledger mutations are written to be safe under redelivery: each one reads the
//! current registry state first and skips the transaction when the desired
//! state already holds.

use crate::blockchain::ledger::{await_receipt, Ledger, LedgerCall, StateQuery, StateValue};
use crate::error::TokenError;
use crate::errors::classifier::{Upstream, UpstreamError, UpstreamFailure};
use crate::models::credential::{
    CredentialBody, CredentialClaims, CredentialSubject, GUARDIAN_CREDENTIAL_TYPE, VC_CONTEXT,
    VC_TYPE,
};
use crate::models::did::Did;
use crate::utils::crypto::format_address;
use crate::wallet::key_management::KeyManager;
use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// A freshly signed credential, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedCredential {
    pub id: String,
    pub token: String,
}

/// Service for issuing credentials and driving registry updates.
///
/// Handles:
/// - Building and signing guardian credentials
/// - Subject registration and guardian changes on the ledger
/// - Guardian lookups for role resolution
#[derive(Clone)]
pub struct CredentialIssuer {
    /// Issuer key; its DID is the `iss` of every credential
    keys: Arc<KeyManager>,

    /// Registry access
    ledger: Arc<dyn Ledger>,

    /// Receipt polling interval
    poll_interval: Duration,

    /// Upper bound on waiting for a receipt
    receipt_timeout: Duration,
}

impl CredentialIssuer {
    /// Creates a new CredentialIssuer instance
    ///
    /// # Arguments
    /// * `keys` - Gateway issuer key
    /// * `ledger` - Registry capability
    /// * `poll_interval` - Delay between receipt lookups
    /// * `receipt_timeout` - How long to wait for a transaction to be mined
    pub fn new(
        keys: Arc<KeyManager>,
        ledger: Arc<dyn Ledger>,
        poll_interval: Duration,
        receipt_timeout: Duration,
    ) -> Self {
        CredentialIssuer {
            keys,
            ledger,
            poll_interval,
            receipt_timeout,
        }
    }

    /// DID credentials are issued under.
    pub fn did(&self) -> Did {
        self.keys.did()
    }

    /// Builds and signs a guardian credential.
    ///
    /// # Arguments
    /// * `subject` - Identifier of the entity the credential is about
    /// * `guardian` - Holder recorded in `credentialSubject.guardian`
    /// * `claims` - Extra domain claims merged into the credential subject
    ///
    /// # Returns
    /// The credential id (`urn:uuid:...`) and compact token
    pub fn issue(
        &self,
        subject: &str,
        guardian: Address,
        claims: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, TokenError> {
        let id = format!("urn:uuid:{}", Uuid::new_v4());
        let payload = CredentialClaims {
            jti: id.clone(),
            iss: self.keys.did(),
            sub: subject.to_string(),
            iat: now.timestamp(),
            vc: CredentialBody {
                context: vec![VC_CONTEXT.to_string()],
                types: vec![VC_TYPE.to_string(), GUARDIAN_CREDENTIAL_TYPE.to_string()],
                credential_subject: CredentialSubject {
                    id: subject.to_string(),
                    guardian: Did::from_address(guardian),
                    claims,
                },
            },
        };
        let token = self.keys.sign_token(&payload)?;
        Ok(IssuedCredential { id, token })
    }

    /// Registers `subject` with `guardian` unless the registry already says so.
    ///
    /// # Returns
    /// The transaction hash, or `None` when no transaction was needed
    pub async fn ensure_registered(
        &self,
        subject: &str,
        guardian: Address,
    ) -> Result<Option<H256>, UpstreamError> {
        if self.guardian_of(subject).await? == Some(guardian) {
            log::info!("subject {} already registered to {}", subject, format_address(guardian));
            return Ok(None);
        }
        self.submit(LedgerCall::RegisterSubject {
            subject: subject.to_string(),
            guardian,
        })
        .await
        .map(Some)
    }

    /// Moves custody of `subject` to `new_guardian` unless it already holds it.
    pub async fn ensure_guardian(
        &self,
        subject: &str,
        new_guardian: Address,
    ) -> Result<Option<H256>, UpstreamError> {
        if self.guardian_of(subject).await? == Some(new_guardian) {
            log::info!(
                "subject {} already held by {}",
                subject,
                format_address(new_guardian)
            );
            return Ok(None);
        }
        self.submit(LedgerCall::ChangeGuardian {
            subject: subject.to_string(),
            new_guardian,
        })
        .await
        .map(Some)
    }

    /// Current on-chain guardian of `subject`.
    pub async fn guardian_of(&self, subject: &str) -> Result<Option<Address>, UpstreamError> {
        match self
            .ledger
            .read_state(StateQuery::GuardianOf {
                subject: subject.to_string(),
            })
            .await?
        {
            StateValue::Address(address) => Ok(address),
            other => Err(unexpected_state(other)),
        }
    }

    /// Whether `address` holds a registered guardian profile.
    pub async fn is_guardian(&self, address: Address) -> Result<bool, UpstreamError> {
        match self.ledger.read_state(StateQuery::IsGuardian { address }).await? {
            StateValue::Flag(flag) => Ok(flag),
            other => Err(unexpected_state(other)),
        }
    }

    async fn submit(&self, call: LedgerCall) -> Result<H256, UpstreamError> {
        let target = call.target();
        let tx_hash = self.ledger.submit_transaction(call.clone()).await?;
        log::info!("submitted {:?} as {:?}", call, tx_hash);
        await_receipt(
            self.ledger.as_ref(),
            tx_hash,
            target,
            self.poll_interval,
            self.receipt_timeout,
        )
        .await?;
        Ok(tx_hash)
    }
}

fn unexpected_state(value: StateValue) -> UpstreamError {
    UpstreamError::new(
        Upstream::Ledger,
        UpstreamFailure::Unknown(format!("unexpected registry value {:?}", value)),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blockchain::ledger::fake::FakeLedger;
    use crate::credential::presentation::verify_credential;

    pub(crate) fn issuer_with(ledger: Arc<FakeLedger>) -> CredentialIssuer {
        CredentialIssuer::new(
            Arc::new(KeyManager::new()),
            ledger,
            Duration::from_millis(1),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_issued_credential_verifies() {
        let issuer = issuer_with(Arc::new(FakeLedger::default()));
        let mut claims = Map::new();
        claims.insert("species".into(), Value::String("dog".into()));
        let issued = issuer
            .issue("pet-1", Address::repeat_byte(1), claims, Utc::now())
            .unwrap();

        assert!(issued.id.starts_with("urn:uuid:"));
        let verified = verify_credential(&issued.token).unwrap();
        assert_eq!(verified.id, issued.id);
        assert_eq!(verified.issuer, issuer.did());
        assert_eq!(verified.guardian, Did::from_address(Address::repeat_byte(1)));
    }

    #[tokio::test]
    async fn test_register_skips_when_already_registered() {
        let ledger = Arc::new(FakeLedger::default());
        let issuer = issuer_with(ledger.clone());
        let guardian = Address::repeat_byte(1);

        assert!(issuer.ensure_registered("pet-1", guardian).await.unwrap().is_some());
        assert!(issuer.ensure_registered("pet-1", guardian).await.unwrap().is_none());
        assert_eq!(ledger.submitted_count(), 1);
        assert_eq!(issuer.guardian_of("pet-1").await.unwrap(), Some(guardian));
    }

    #[tokio::test]
    async fn test_guardian_change_round_trip() {
        let ledger = Arc::new(FakeLedger::default());
        let issuer = issuer_with(ledger.clone());
        issuer.ensure_registered("pet-1", Address::repeat_byte(1)).await.unwrap();

        let bob = Address::repeat_byte(2);
        assert!(issuer.ensure_guardian("pet-1", bob).await.unwrap().is_some());
        assert!(issuer.ensure_guardian("pet-1", bob).await.unwrap().is_none());
        assert_eq!(ledger.submitted_count(), 2);
    }

    #[tokio::test]
    async fn test_is_guardian() {
        let ledger = Arc::new(FakeLedger::default());
        ledger
            .registered_guardians
            .lock()
            .unwrap()
            .insert(Address::repeat_byte(5));
        let issuer = issuer_with(ledger);
        assert!(issuer.is_guardian(Address::repeat_byte(5)).await.unwrap());
        assert!(!issuer.is_guardian(Address::repeat_byte(6)).await.unwrap());
    }
}
