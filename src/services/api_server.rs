// src/services/api_server.rs
//! API Server for the wallet-auth gateway
//!
//! The API is built using Axum and includes endpoints for:
//! - Challenge issuance and wallet login (with optional credential presentation)
//! - Enqueueing credential creation and transfer jobs
//! - Credential history per subject
//! - Job status and cancellation
//!
//! Every response uses the shared envelopes in [`crate::models::response`].
//! Credential jobs are only enqueued here; the HTTP request never waits for them.

use crate::auth::protocol::{
    AuthService, ChallengeRequest, ChallengeResponse, LoginRequest, LoginResponse,
};
use crate::auth::session::{bearer_token, SessionClaims};
use crate::error::{AuthError, QueueError, StoreError};
use crate::errors::classifier::{ClassifiedError, ErrorCode};
use crate::models::credential::CredentialRecord;
use crate::models::job::{
    CreateCredentialJob, JobPayload, JobStatus, Priority, TransferCredentialJob,
};
use crate::models::response::{ErrorResponse, SuccessResponse};
use crate::queue::JobQueue;
use crate::storage::credential_store::CredentialStore;
use crate::utils::crypto::format_address;
use axum::{
    extract::{rejection::JsonRejection, Json, Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Request payload for enqueueing a first credential issuance
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CreateCredentialRequest {
    subject: String,
    guardian: Address,
    #[serde(default)]
    issuer: Option<String>,
    attestation: String,
    #[serde(default)]
    claims: Map<String, Value>,
    #[serde(default)]
    priority: Option<Priority>,
}

/// Request payload for enqueueing a guardian transfer
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TransferCredentialRequest {
    subject: String,
    from: Address,
    to: Address,
    attestation: String,
    #[serde(default)]
    priority: Option<Priority>,
}

/// Response for an enqueued job
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct JobAccepted {
    job_id: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct HealthResponse {
    status: String,
    jobs: BTreeMap<String, i64>,
}

/// Error rendered as the shared failure envelope.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ErrorResponse::new(code, message, false),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "MALFORMED_REQUEST", message)
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let status = match err {
            AuthError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        };
        ApiError::new(status, err.code(), err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let classified = ClassifiedError::new(ErrorCode::StorageUnavailable, err);
        ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: ErrorResponse::from(&classified),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(_) => ApiError::new(StatusCode::NOT_FOUND, "JOB_NOT_FOUND", err.to_string()),
            QueueError::NotCancellable { .. } => {
                ApiError::new(StatusCode::CONFLICT, "JOB_NOT_CANCELLABLE", err.to_string())
            }
            QueueError::Store(inner) => inner.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

type ApiResult<T> = Result<(StatusCode, Json<SuccessResponse<T>>), ApiError>;

fn ok<T>(status: StatusCode, data: T) -> ApiResult<T> {
    Ok((status, Json(SuccessResponse::data(data))))
}

/// API server state containing all service dependencies
#[derive(Clone)]
pub struct ApiServer {
    /// Challenge issuance, login and access-token verification
    auth: Arc<AuthService>,

    /// Credential lifecycle queue
    queue: Arc<JobQueue>,

    /// Issued credentials, for history queries
    credentials: Arc<CredentialStore>,
}

impl ApiServer {
    /// Creates a new instance of the API server
    ///
    /// # Arguments
    /// * `auth` - Login protocol service
    /// * `queue` - Job queue the credential endpoints enqueue into
    /// * `credentials` - Credential store for history queries
    pub fn new(auth: Arc<AuthService>, queue: Arc<JobQueue>, credentials: Arc<CredentialStore>) -> Self {
        ApiServer {
            auth,
            queue,
            credentials,
        }
    }

    /// Builds the router with every gateway route.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(Self::health_handler))
            .route("/auth/challenge", post(Self::challenge_handler))
            .route("/auth/login", post(Self::login_handler))
            .route("/credentials", post(Self::create_credential_handler))
            .route("/credentials/transfer", post(Self::transfer_credential_handler))
            .route("/credentials/:subject", get(Self::credential_history_handler))
            .route(
                "/jobs/:id",
                get(Self::job_status_handler).delete(Self::cancel_job_handler),
            )
            .layer(CorsLayer::permissive())
            .with_state(Arc::new(self.clone()))
    }

    /// Starts the API server and serves until `shutdown` resolves
    ///
    /// # Arguments
    /// * `addr` - Socket address to bind to (e.g., "127.0.0.1:3000")
    /// * `shutdown` - Future that completes when the server should stop accepting requests
    pub async fn run<F>(&self, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        log::info!("API listening on {}", addr);
        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
    }

    fn authenticate(&self, headers: &HeaderMap) -> Result<SessionClaims, ApiError> {
        let token = bearer_token(headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()))
            .ok_or_else(|| AuthError::InvalidAccessToken("missing bearer token".into()))?;
        Ok(self.auth.authenticate(token)?)
    }

    // =====================
    // Authentication
    // =====================

    /// Issues a login challenge
    ///
    /// # Endpoint
    /// POST /auth/challenge
    ///
    /// # Responses
    /// - 200 OK: `{challenge, vpSigningData?}`
    /// - 400 Bad Request: Invalid wallet address
    async fn challenge_handler(
        State(state): State<Arc<ApiServer>>,
        payload: Result<Json<ChallengeRequest>, JsonRejection>,
    ) -> ApiResult<ChallengeResponse> {
        let Json(request) = payload?;
        let response = state.auth.issue_challenge(&request.wallet_address, Utc::now())?;
        ok(StatusCode::OK, response)
    }

    /// Verifies a signed challenge and establishes a session
    ///
    /// # Endpoint
    /// POST /auth/login
    ///
    /// # Responses
    /// - 200 OK: `{accessToken, vpJwt}`
    /// - 401 Unauthorized: Signature, challenge or presentation rejected
    async fn login_handler(
        State(state): State<Arc<ApiServer>>,
        payload: Result<Json<LoginRequest>, JsonRejection>,
    ) -> ApiResult<LoginResponse> {
        let Json(request) = payload?;
        let response = state.auth.login(&request, Utc::now()).await?;
        ok(StatusCode::OK, response)
    }

    // =====================
    // Credential lifecycle
    // =====================

    /// Enqueues the first credential for a subject
    ///
    /// # Endpoint
    /// POST /credentials
    ///
    /// # Responses
    /// - 202 Accepted: `{jobId}`
    /// - 401 Unauthorized: Missing or invalid bearer token
    /// - 403 Forbidden: Caller is not the guardian named in the request
    async fn create_credential_handler(
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
        payload: Result<Json<CreateCredentialRequest>, JsonRejection>,
    ) -> ApiResult<JobAccepted> {
        let caller = state.authenticate(&headers)?.address()?;
        let Json(request) = payload?;
        if caller != request.guardian {
            return Err(ApiError::forbidden("only the guardian may request its credential"));
        }
        let issuer = request
            .issuer
            .map(|raw| raw.parse())
            .transpose()
            .map_err(|e| ApiError::bad_request(format!("invalid issuer: {}", e)))?;

        let job_id = state.queue.enqueue(
            JobPayload::CreateCredential(CreateCredentialJob {
                subject: request.subject,
                guardian: request.guardian,
                issuer,
                attestation: request.attestation,
                claims: request.claims,
            }),
            request.priority.unwrap_or_default(),
            None,
        )?;
        ok(StatusCode::ACCEPTED, JobAccepted { job_id })
    }

    /// Enqueues a guardian transfer
    ///
    /// # Endpoint
    /// POST /credentials/transfer
    ///
    /// # Responses
    /// - 202 Accepted: `{jobId}`
    /// - 403 Forbidden: Caller is not the current holder named in `from`
    async fn transfer_credential_handler(
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
        payload: Result<Json<TransferCredentialRequest>, JsonRejection>,
    ) -> ApiResult<JobAccepted> {
        let caller = state.authenticate(&headers)?.address()?;
        let Json(request) = payload?;
        if caller != request.from {
            return Err(ApiError::forbidden(format!(
                "{} cannot transfer on behalf of {}",
                format_address(caller),
                format_address(request.from)
            )));
        }
        let job_id = state.queue.enqueue(
            JobPayload::TransferCredential(TransferCredentialJob {
                subject: request.subject,
                from: request.from,
                to: request.to,
                attestation: request.attestation,
            }),
            request.priority.unwrap_or_default(),
            None,
        )?;
        ok(StatusCode::ACCEPTED, JobAccepted { job_id })
    }

    /// Lists every credential issued for a subject, newest first
    ///
    /// # Endpoint
    /// GET /credentials/:subject
    async fn credential_history_handler(
        Path(subject): Path<String>,
        State(state): State<Arc<ApiServer>>,
    ) -> ApiResult<Vec<CredentialRecord>> {
        let history = state.credentials.history(&subject)?;
        ok(StatusCode::OK, history)
    }

    // =====================
    // Jobs
    // =====================

    /// Returns the status of a job
    ///
    /// # Endpoint
    /// GET /jobs/:id
    ///
    /// # Responses
    /// - 200 OK: Job status
    /// - 404 Not Found: Unknown job id
    async fn job_status_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
    ) -> ApiResult<JobStatus> {
        state.authenticate(&headers)?;
        let status = state.queue.status(&id)?;
        ok(StatusCode::OK, status)
    }

    /// Cancels a job that has not started
    ///
    /// # Endpoint
    /// DELETE /jobs/:id
    ///
    /// # Responses
    /// - 200 OK: Job cancelled
    /// - 404 Not Found: Unknown job id
    /// - 409 Conflict: Job already running or finished
    async fn cancel_job_handler(
        Path(id): Path<String>,
        State(state): State<Arc<ApiServer>>,
        headers: HeaderMap,
    ) -> ApiResult<JobStatus> {
        state.authenticate(&headers)?;
        state.queue.cancel(&id)?;
        let status = state.queue.status(&id)?;
        Ok((
            StatusCode::OK,
            Json(SuccessResponse::data(status).with_message("job cancelled")),
        ))
    }

    async fn health_handler(State(state): State<Arc<ApiServer>>) -> ApiResult<HealthResponse> {
        let jobs = state.queue.counts()?;
        ok(
            StatusCode::OK,
            HealthResponse {
                status: "ok".into(),
                jobs,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::challenge_store::ChallengeStore;
    use crate::auth::protocol::AuthSettings;
    use crate::auth::session::SessionIssuer;
    use crate::blockchain::ledger::fake::FakeLedger;
    use crate::models::job::RetryPolicy;
    use crate::services::credential_issuer::tests::issuer_with;
    use crate::services::verifier::Verifier;
    use crate::storage::database::Database;
    use crate::storage::job_store::JobStore;
    use crate::utils::crypto::{encode_signature_hex, sign_message};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use ethers::signers::{LocalWallet, Signer};
    use serde_json::json;
    use tower::ServiceExt;

    fn app() -> Router {
        let db = Arc::new(Database::in_memory().unwrap());
        let credentials = Arc::new(CredentialStore::new(db.clone()));
        let issuer = Arc::new(issuer_with(Arc::new(FakeLedger::default())));
        let queue = Arc::new(JobQueue::new(
            Arc::new(JobStore::new(db)),
            RetryPolicy::default(),
        ));
        let auth = AuthService::new(
            AuthSettings {
                audience: "did-gateway".into(),
                admins: Default::default(),
            },
            ChallengeStore::new(chrono::Duration::seconds(300)),
            SessionIssuer::new("test-secret", chrono::Duration::hours(1)),
            credentials.clone(),
            Verifier::new(vec![issuer.did()]),
            issuer,
        )
        .with_scheduler(queue.clone());
        ApiServer::new(Arc::new(auth), queue, credentials).router()
    }

    async fn call(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn login(app: &Router, wallet: &LocalWallet) -> String {
        let address = format_address(wallet.address());
        let (status, body) = call(
            app,
            Method::POST,
            "/auth/challenge",
            None,
            Some(json!({ "walletAddress": address })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let challenge = body["data"]["challenge"].as_str().unwrap().to_string();
        let signature = sign_message(wallet, challenge.as_bytes()).unwrap();

        let (status, body) = call(
            app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({
                "walletAddress": address,
                "signature": encode_signature_hex(&signature),
                "challenge": challenge,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["vpJwt"], "EMPTY");
        body["data"]["accessToken"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_login_rejection_uses_error_envelope() {
        let app = app();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let address = format_address(wallet.address());
        let (_, body) = call(
            &app,
            Method::POST,
            "/auth/challenge",
            None,
            Some(json!({ "walletAddress": address })),
        )
        .await;
        let challenge = body["data"]["challenge"].as_str().unwrap();
        let signature = sign_message(&wallet, b"something else").unwrap();

        let (status, body) = call(
            &app,
            Method::POST,
            "/auth/login",
            None,
            Some(json!({
                "walletAddress": address,
                "signature": encode_signature_hex(&signature),
                "challenge": challenge,
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], "CHALLENGE_SIGNATURE_INVALID");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (status, body) = call(
            &app(),
            Method::POST,
            "/auth/challenge",
            None,
            Some(json!({ "wallet": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "MALFORMED_REQUEST");
    }

    #[tokio::test]
    async fn test_enqueue_status_and_cancel() {
        let app = app();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let token = login(&app, &wallet).await;

        let (status, body) = call(
            &app,
            Method::POST,
            "/credentials",
            Some(&token),
            Some(json!({
                "subject": "pet-1",
                "guardian": format_address(wallet.address()),
                "attestation": "0x00",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job_id = body["data"]["jobId"].as_str().unwrap().to_string();

        let uri = format!("/jobs/{}", job_id);
        let (status, body) = call(&app, Method::GET, &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "waiting");
        assert_eq!(body["data"]["kind"], "create-credential");

        let (status, body) = call(&app, Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["state"], "cancelled");

        let (status, body) = call(&app, Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorCode"], "JOB_NOT_CANCELLABLE");
    }

    #[tokio::test]
    async fn test_credential_endpoints_require_matching_caller() {
        let app = app();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let body = json!({
            "subject": "pet-1",
            "guardian": "0x0101010101010101010101010101010101010101",
            "attestation": "0x00",
        });

        let (status, response) =
            call(&app, Method::POST, "/credentials", None, Some(body.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["errorCode"], "INVALID_ACCESS_TOKEN");

        let token = login(&app, &wallet).await;
        let (status, _) = call(&app, Method::POST, "/credentials", Some(&token), Some(body)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            Method::POST,
            "/credentials/transfer",
            Some(&token),
            Some(json!({
                "subject": "pet-1",
                "from": "0x0101010101010101010101010101010101010101",
                "to": format_address(wallet.address()),
                "attestation": "0x00",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_job_and_empty_history() {
        let app = app();
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        let token = login(&app, &wallet).await;

        let (status, body) = call(&app, Method::GET, "/jobs/nope", Some(&token), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errorCode"], "JOB_NOT_FOUND");

        let (status, body) = call(&app, Method::GET, "/credentials/pet-404", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }
}
