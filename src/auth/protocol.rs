// src/auth/protocol.rs
//! Challenge–presentation login.
//!
//! ```text
//! ChallengeIssued -> SignatureVerified -> [PresentationVerified] -> SessionEstablished
//!        \__________________\______________________\__________> Rejected
//! ```
//!
//! A rejection at any step returns an [`AuthError`] and never issues a token.

use crate::auth::challenge_store::{new_challenge, ChallengeStore};
use crate::auth::session::{Role, SessionClaims, SessionIssuer};
use crate::credential::presentation::{assemble, signing_data, vp_signing_message};
use crate::error::{AuthError, QueueError};
use crate::models::job::{JobId, JobPayload, Priority, SyncProfileJob};
use crate::services::credential_issuer::CredentialIssuer;
use crate::services::verifier::Verifier;
use crate::storage::credential_store::CredentialStore;
use crate::utils::crypto::{
    decode_signature_hex, format_address, hash_data, parse_address, recover_signer,
    recover_signer_from_hash,
};
use chrono::{DateTime, Utc};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Value returned as `vpJwt` when no presentation was issued.
pub const EMPTY_PRESENTATION: &str = "EMPTY";

/// Sink for follow-up work produced by a login.
pub trait JobScheduler: Send + Sync {
    fn schedule(&self, payload: JobPayload, priority: Priority) -> Result<JobId, QueueError>;
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub wallet_address: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VpSigningData {
    /// Deterministic message; its keccak256 hash is what the wallet signs
    pub message: String,
    /// `0x` hex of `keccak256(message)`
    pub signing_data: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    pub challenge: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vp_signing_data: Option<VpSigningData>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub wallet_address: String,
    /// Wallet signature over the challenge string
    pub signature: String,
    pub challenge: String,
    #[serde(default)]
    pub vp_signature: Option<String>,
    #[serde(default)]
    pub vp_message: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    /// Presentation token, or `"EMPTY"`
    pub vp_jwt: String,
}

/// Static login settings.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    /// Verifying service named in presentations
    pub audience: String,
    pub admins: HashSet<Address>,
}

struct VerifiedPresentation {
    token: String,
    holder: String,
    credential_count: usize,
}

/// Login orchestration.
pub struct AuthService {
    settings: AuthSettings,
    challenges: ChallengeStore,
    sessions: SessionIssuer,
    credentials: Arc<CredentialStore>,
    verifier: Verifier,
    issuer: Arc<CredentialIssuer>,
    scheduler: Option<Arc<dyn JobScheduler>>,
}

impl AuthService {
    pub fn new(
        settings: AuthSettings,
        challenges: ChallengeStore,
        sessions: SessionIssuer,
        credentials: Arc<CredentialStore>,
        verifier: Verifier,
        issuer: Arc<CredentialIssuer>,
    ) -> Self {
        AuthService {
            settings,
            challenges,
            sessions,
            credentials,
            verifier,
            issuer,
            scheduler: None,
        }
    }

    /// Enqueues a profile sync after every successful login.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn JobScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Drops challenges past their TTL; called periodically by the binary.
    ///
    /// A purged challenge can no longer be reported as a replay, only as expired.
    pub fn purge_expired_challenges(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let purged = self.challenges.purge_expired(now)?;
        if purged > 0 {
            log::debug!("purged {} expired challenges", purged);
        }
        Ok(purged)
    }

    /// Issues a single-use challenge for `wallet_address`.
    ///
    /// If the address holds an active credential, the response also carries the
    /// presentation signing payload.
    pub fn issue_challenge(
        &self,
        wallet_address: &str,
        now: DateTime<Utc>,
    ) -> Result<ChallengeResponse, AuthError> {
        let address = parse_wallet(wallet_address)?;
        let challenge = new_challenge();

        let holds_credentials = !self
            .credentials
            .active_for_holder(address)
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .is_empty();
        let vp_signing_data = if !holds_credentials {
            None
        } else {
            let message = vp_signing_message(&self.settings.audience, address, &challenge);
            Some(VpSigningData {
                signing_data: signing_data(&message),
                message,
            })
        };

        self.challenges.insert(
            address,
            challenge.clone(),
            vp_signing_data.as_ref().map(|data| data.message.clone()),
            now,
        )?;
        log::debug!("challenge issued to {}", format_address(address));
        Ok(ChallengeResponse {
            challenge,
            vp_signing_data,
        })
    }

    /// Verifies a signed challenge (and presentation, if one was requested) and
    /// establishes a session.
    pub async fn login(
        &self,
        request: &LoginRequest,
        now: DateTime<Utc>,
    ) -> Result<LoginResponse, AuthError> {
        let result = self.try_login(request, now).await;
        if let Err(e) = &result {
            log::warn!("login rejected for {}: {}", request.wallet_address, e);
        }
        result
    }

    /// Verifies a bearer access token.
    pub fn authenticate(&self, token: &str) -> Result<SessionClaims, AuthError> {
        self.sessions.verify(token)
    }

    async fn try_login(
        &self,
        request: &LoginRequest,
        now: DateTime<Utc>,
    ) -> Result<LoginResponse, AuthError> {
        let address = parse_wallet(&request.wallet_address)?;

        let signature = decode_signature_hex(&request.signature)
            .map_err(|_| AuthError::ChallengeSignatureInvalid)?;
        match recover_signer(request.challenge.as_bytes(), &signature) {
            Ok(signer) if signer == address => {}
            _ => return Err(AuthError::ChallengeSignatureInvalid),
        }

        let vp_message = self.challenges.consume(address, &request.challenge, now)?;

        let presentation = match vp_message {
            Some(message) => Some(self.present(address, request, &message, now)?),
            None => None,
        };

        let role = self.resolve_role(address).await;
        let claims = SessionClaims {
            sub: format_address(address),
            role,
            vp_verified: presentation.is_some(),
            vp_holder: presentation.as_ref().map(|vp| vp.holder.clone()),
            vc_count: presentation.as_ref().map_or(0, |vp| vp.credential_count),
            iat: 0,
            exp: 0,
        };
        let access_token = self.sessions.issue(claims, now)?;
        log::info!(
            "session established for {} as {:?} ({} credentials presented)",
            format_address(address),
            role,
            presentation.as_ref().map_or(0, |vp| vp.credential_count)
        );

        self.schedule_profile_sync(address, presentation.as_ref(), now);

        Ok(LoginResponse {
            access_token,
            vp_jwt: presentation
                .map(|vp| vp.token)
                .unwrap_or_else(|| EMPTY_PRESENTATION.to_string()),
        })
    }

    /// Checks the wallet's presentation signature and assembles the presentation.
    fn present(
        &self,
        address: Address,
        request: &LoginRequest,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<VerifiedPresentation, AuthError> {
        let vp_signature = request
            .vp_signature
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::VpSignatureMissing)?;
        if let Some(supplied) = &request.vp_message {
            if supplied != message {
                return Err(AuthError::VpMessageMismatch);
            }
        }
        let vp_signature =
            decode_signature_hex(vp_signature).map_err(|_| AuthError::VpSignatureInvalid)?;
        match recover_signer_from_hash(hash_data(message.as_bytes()), &vp_signature) {
            Ok(signer) if signer == address => {}
            _ => return Err(AuthError::VpSignatureInvalid),
        }

        let credentials = self.presentable_credentials(address)?;
        let token = assemble(
            address,
            &self.settings.audience,
            &request.challenge,
            message,
            credentials,
            &vp_signature,
            now,
        )
        .map_err(|e| AuthError::Internal(format!("presentation assembly failed: {}", e)))?;

        let report = self
            .verifier
            .verify_presentation(&token, message)
            .map_err(|e| AuthError::Internal(format!("presentation unreadable: {}", e)))?;
        if !report.holder_verified {
            return Err(AuthError::VpSignatureInvalid);
        }
        Ok(VerifiedPresentation {
            token,
            holder: report.holder.to_string(),
            credential_count: report.accepted.len(),
        })
    }

    /// Active credentials held by `address` that still verify.
    fn presentable_credentials(&self, address: Address) -> Result<Vec<String>, AuthError> {
        let records = self
            .credentials
            .active_for_holder(address)
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        Ok(self.verifier.presentable(
            records
                .iter()
                .map(|record| (record.id.as_str(), record.token.as_str())),
        ))
    }

    async fn resolve_role(&self, address: Address) -> Role {
        if self.settings.admins.contains(&address) {
            return Role::Admin;
        }
        match self.issuer.is_guardian(address).await {
            Ok(true) => Role::Guardian,
            Ok(false) => Role::User,
            Err(e) => {
                log::warn!(
                    "guardian lookup failed for {}, continuing as user: {}",
                    format_address(address),
                    e
                );
                Role::User
            }
        }
    }

    fn schedule_profile_sync(
        &self,
        address: Address,
        presentation: Option<&VerifiedPresentation>,
        now: DateTime<Utc>,
    ) {
        let Some(scheduler) = &self.scheduler else {
            return;
        };
        let payload = JobPayload::SyncExternalProfile(SyncProfileJob {
            address,
            name: None,
            email: None,
            phone: None,
            wallet_verified: true,
            credential_count: presentation.map_or(0, |vp| vp.credential_count),
            verified_at: now,
        });
        match scheduler.schedule(payload, Priority::Low) {
            Ok(id) => log::debug!("profile sync {} scheduled for {}", id, format_address(address)),
            Err(e) => log::error!(
                "could not schedule profile sync for {}: {}",
                format_address(address),
                e
            ),
        }
    }
}

fn parse_wallet(value: &str) -> Result<Address, AuthError> {
    parse_address(value).map_err(|e| AuthError::MalformedRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::ledger::fake::FakeLedger;
    use crate::credential::codec::decode_presentation;
    use crate::credential::presentation::tests::tamper_signature;
    use crate::errors::classifier::{Upstream, UpstreamError};
    use crate::models::credential::{CredentialRecord, CredentialStatus};
    use crate::services::credential_issuer::tests::issuer_with;
    use crate::storage::database::Database;
    use crate::utils::crypto::{encode_signature_hex, sign_hash_as_message, sign_message};
    use chrono::Duration;
    use ethers::signers::{LocalWallet, Signer};
    use serde_json::Map;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingScheduler {
        jobs: Mutex<Vec<(JobPayload, Priority)>>,
    }

    impl JobScheduler for RecordingScheduler {
        fn schedule(&self, payload: JobPayload, priority: Priority) -> Result<JobId, QueueError> {
            self.jobs.lock().unwrap().push((payload, priority));
            Ok("job-1".into())
        }
    }

    struct Harness {
        auth: Arc<AuthService>,
        ledger: Arc<FakeLedger>,
        issuer: Arc<CredentialIssuer>,
        credentials: Arc<CredentialStore>,
        scheduler: Arc<RecordingScheduler>,
    }

    fn harness(admins: &[Address]) -> Harness {
        let ledger = Arc::new(FakeLedger::default());
        let issuer = Arc::new(issuer_with(ledger.clone()));
        let credentials = Arc::new(CredentialStore::new(Arc::new(Database::in_memory().unwrap())));
        let scheduler = Arc::new(RecordingScheduler::default());
        let auth = AuthService::new(
            AuthSettings {
                audience: "did-gateway".into(),
                admins: admins.iter().copied().collect(),
            },
            ChallengeStore::new(Duration::seconds(300)),
            SessionIssuer::new("test-secret", Duration::hours(1)),
            credentials.clone(),
            Verifier::new(vec![issuer.did()]),
            issuer.clone(),
        )
        .with_scheduler(scheduler.clone());
        Harness {
            auth: Arc::new(auth),
            ledger,
            issuer,
            credentials,
            scheduler,
        }
    }

    impl Harness {
        fn give_credential(&self, subject: &str, holder: Address, tamper: bool) {
            let issued = self
                .issuer
                .issue(subject, holder, Map::new(), Utc::now())
                .unwrap();
            let token = if tamper {
                tamper_signature(&issued.token)
            } else {
                issued.token
            };
            self.credentials
                .insert_active(&CredentialRecord {
                    id: issued.id,
                    subject: subject.to_string(),
                    holder,
                    issuer: self.issuer.did(),
                    token,
                    status: CredentialStatus::Active,
                    request_id: format!("req-{}", subject),
                    issued_at: Utc::now(),
                    superseded_at: None,
                    superseded_by: None,
                })
                .unwrap();
        }
    }

    fn signed_login(wallet: &LocalWallet, challenge: &ChallengeResponse) -> LoginRequest {
        let signature = sign_message(wallet, challenge.challenge.as_bytes()).unwrap();
        let mut request = LoginRequest {
            wallet_address: format_address(wallet.address()),
            signature: encode_signature_hex(&signature),
            challenge: challenge.challenge.clone(),
            ..Default::default()
        };
        if let Some(vp) = &challenge.vp_signing_data {
            let vp_signature =
                sign_hash_as_message(wallet, hash_data(vp.message.as_bytes())).unwrap();
            request.vp_signature = Some(encode_signature_hex(&vp_signature));
            request.vp_message = Some(vp.message.clone());
        }
        request
    }

    fn wallet() -> LocalWallet {
        LocalWallet::new(&mut rand::thread_rng())
    }

    #[tokio::test]
    async fn test_login_without_credentials() {
        let h = harness(&[]);
        let wallet = wallet();
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        assert!(challenge.vp_signing_data.is_none());

        let response = h.auth.login(&signed_login(&wallet, &challenge), now).await.unwrap();
        assert_eq!(response.vp_jwt, EMPTY_PRESENTATION);

        let claims = h.auth.authenticate(&response.access_token).unwrap();
        assert_eq!(claims.role, Role::User);
        assert!(!claims.vp_verified);
        assert_eq!(claims.address().unwrap(), wallet.address());

        let jobs = h.scheduler.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].1, Priority::Low);
        assert!(matches!(&jobs[0].0, JobPayload::SyncExternalProfile(job) if job.address == wallet.address()));
    }

    #[tokio::test]
    async fn test_login_with_presentation() {
        let h = harness(&[]);
        let wallet = wallet();
        h.give_credential("pet-1", wallet.address(), false);
        h.give_credential("pet-2", wallet.address(), false);
        let now = Utc::now();

        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let vp = challenge.vp_signing_data.clone().unwrap();
        assert_eq!(vp.signing_data, signing_data(&vp.message));

        let response = h.auth.login(&signed_login(&wallet, &challenge), now).await.unwrap();
        let (_, presentation) = decode_presentation(&response.vp_jwt).unwrap();
        assert_eq!(presentation.nonce, challenge.challenge);
        assert_eq!(presentation.vp.verifiable_credential.len(), 2);

        let claims = h.auth.authenticate(&response.access_token).unwrap();
        assert!(claims.vp_verified);
        assert_eq!(claims.vc_count, 2);
        assert_eq!(
            claims.vp_holder,
            Some(crate::models::did::Did::from_address(wallet.address()).to_string())
        );
    }

    #[tokio::test]
    async fn test_tampered_credential_is_dropped_not_fatal() {
        let h = harness(&[]);
        let wallet = wallet();
        h.give_credential("pet-1", wallet.address(), false);
        h.give_credential("pet-2", wallet.address(), true);
        let now = Utc::now();

        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let response = h.auth.login(&signed_login(&wallet, &challenge), now).await.unwrap();
        let claims = h.auth.authenticate(&response.access_token).unwrap();
        assert!(claims.vp_verified);
        assert_eq!(claims.vc_count, 1);
    }

    #[tokio::test]
    async fn test_expired_challenge_issues_no_token() {
        let h = harness(&[]);
        let wallet = wallet();
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();

        let err = h
            .auth
            .login(&signed_login(&wallet, &challenge), now + Duration::seconds(301))
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::ChallengeExpired);
        assert_eq!(err.code(), "CHALLENGE_EXPIRED");
        assert!(h.scheduler.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purged_challenge_is_expired() {
        let h = harness(&[]);
        let wallet = wallet();
        let now = Utc::now();
        let stale = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let later = now + Duration::seconds(200);
        let fresh = h
            .auth
            .issue_challenge(&format_address(wallet.address()), later)
            .unwrap();

        let purge_at = now + Duration::seconds(301);
        assert_eq!(h.auth.purge_expired_challenges(purge_at).unwrap(), 1);

        let err = h
            .auth
            .login(&signed_login(&wallet, &stale), later)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::ChallengeExpired);
        h.auth
            .login(&signed_login(&wallet, &fresh), purge_at)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let h = harness(&[]);
        let wallet = wallet();
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let request = signed_login(&wallet, &challenge);

        h.auth.login(&request, now).await.unwrap();
        assert_eq!(
            h.auth.login(&request, now).await.unwrap_err(),
            AuthError::ChallengeReplay
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_logins_single_success() {
        let h = harness(&[]);
        let wallet = wallet();
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let request = signed_login(&wallet, &challenge);

        let first = {
            let auth = h.auth.clone();
            let request = request.clone();
            tokio::spawn(async move { auth.login(&request, now).await })
        };
        let second = {
            let auth = h.auth.clone();
            tokio::spawn(async move { auth.login(&request, now).await })
        };
        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| r.as_ref().err() == Some(&AuthError::ChallengeReplay)));
    }

    #[tokio::test]
    async fn test_signature_from_other_wallet_rejected() {
        let h = harness(&[]);
        let wallet = wallet();
        let intruder = self::wallet();
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let mut request = signed_login(&intruder, &challenge);
        request.wallet_address = format_address(wallet.address());

        assert_eq!(
            h.auth.login(&request, now).await.unwrap_err(),
            AuthError::ChallengeSignatureInvalid
        );
        // The challenge was not consumed by the failed attempt.
        assert!(h.auth.login(&signed_login(&wallet, &challenge), now).await.is_ok());
    }

    #[tokio::test]
    async fn test_presentation_signature_required() {
        let h = harness(&[]);
        let wallet = wallet();
        h.give_credential("pet-1", wallet.address(), false);
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();

        let mut request = signed_login(&wallet, &challenge);
        request.vp_signature = None;
        assert_eq!(
            h.auth.login(&request, now).await.unwrap_err(),
            AuthError::VpSignatureMissing
        );
    }

    #[tokio::test]
    async fn test_presentation_message_must_match() {
        let h = harness(&[]);
        let wallet = wallet();
        h.give_credential("pet-1", wallet.address(), false);
        let now = Utc::now();
        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();

        let mut request = signed_login(&wallet, &challenge);
        request.vp_message = Some("something else".into());
        assert_eq!(
            h.auth.login(&request, now).await.unwrap_err(),
            AuthError::VpMessageMismatch
        );
    }

    #[tokio::test]
    async fn test_roles() {
        let admin = wallet();
        let guardian = wallet();
        let h = harness(&[admin.address()]);
        h.ledger
            .registered_guardians
            .lock()
            .unwrap()
            .insert(guardian.address());
        let now = Utc::now();

        for (wallet, expected) in [(&admin, Role::Admin), (&guardian, Role::Guardian)] {
            let challenge = h
                .auth
                .issue_challenge(&format_address(wallet.address()), now)
                .unwrap();
            let response = h.auth.login(&signed_login(wallet, &challenge), now).await.unwrap();
            assert_eq!(h.auth.authenticate(&response.access_token).unwrap().role, expected);
        }
    }

    #[tokio::test]
    async fn test_ledger_failure_degrades_to_user() {
        let h = harness(&[]);
        let wallet = wallet();
        h.ledger.registered_guardians.lock().unwrap().insert(wallet.address());
        h.ledger.fail_next_read(UpstreamError::timeout(Upstream::Ledger));
        let now = Utc::now();

        let challenge = h
            .auth
            .issue_challenge(&format_address(wallet.address()), now)
            .unwrap();
        let response = h.auth.login(&signed_login(&wallet, &challenge), now).await.unwrap();
        assert_eq!(h.auth.authenticate(&response.access_token).unwrap().role, Role::User);
    }

    #[test]
    fn test_malformed_address() {
        let h = harness(&[]);
        assert!(matches!(
            h.auth.issue_challenge("not-an-address", Utc::now()),
            Err(AuthError::MalformedRequest(_))
        ));
    }
}
