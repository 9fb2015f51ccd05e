// src/main.rs

//! # Wallet-auth gateway - Main Entry Point
//!
//! Initializes every component from layered settings (see [`did_gateway::config`])
//! and runs the API server alongside the queue workers until Ctrl-C.
//!
//! ## Initialization Sequence
//! 1. Load `.env`, config files and `GATEWAY__*` environment variables
//! 2. Load the issuer key and connect to the ledger RPC
//! 3. Open the SQLite database and requeue jobs interrupted by a previous run
//! 4. Start the worker pool and the challenge purge task
//! 5. Serve the API; on shutdown, let in-flight jobs settle

use anyhow::Context;
use did_gateway::auth::challenge_store::ChallengeStore;
use did_gateway::auth::protocol::{AuthService, AuthSettings};
use did_gateway::auth::session::SessionIssuer;
use did_gateway::blockchain::rpc_client::RpcLedger;
use did_gateway::clients::backend::BackendClient;
use did_gateway::config::Settings;
use did_gateway::queue::handlers::CredentialJobHandler;
use did_gateway::queue::worker::{WorkerConfig, WorkerPool};
use did_gateway::queue::JobQueue;
use did_gateway::services::api_server::ApiServer;
use did_gateway::services::credential_issuer::CredentialIssuer;
use did_gateway::services::verifier::Verifier;
use did_gateway::storage::credential_store::CredentialStore;
use did_gateway::storage::database::Database;
use did_gateway::storage::job_store::JobStore;
use did_gateway::utils::crypto::format_address;
use did_gateway::wallet::key_management::KeyManager;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Main application entry point
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("failed to load settings")?;
    let addr = settings.socket_addr()?;

    // Issuer key and ledger connection
    let keys = Arc::new(
        KeyManager::from_private_key(&settings.ledger.issuer_private_key)
            .context("invalid ledger.issuer_private_key")?,
    );
    log::info!("issuing credentials as {}", keys.did());
    let ledger = RpcLedger::connect(
        &settings.ledger.rpc_url,
        keys.wallet().clone(),
        settings.registry_address()?,
        settings.upstream_timeout(),
    )
    .await
    .with_context(|| format!("failed to connect to ledger at {}", settings.ledger.rpc_url))?;
    let issuer = Arc::new(CredentialIssuer::new(
        keys.clone(),
        Arc::new(ledger),
        settings.receipt_poll_interval(),
        settings.receipt_timeout(),
    ));

    // Persistence and queue
    let db = Arc::new(
        Database::open(&settings.queue.database_path)
            .with_context(|| format!("failed to open {}", settings.queue.database_path))?,
    );
    let credentials = Arc::new(CredentialStore::new(db.clone()));
    let queue = Arc::new(JobQueue::new(
        Arc::new(JobStore::new(db)),
        settings.retry_policy(),
    ));
    queue.recover().context("failed to recover interrupted jobs")?;

    let backend = Arc::new(BackendClient::new(
        &settings.backend.base_url,
        settings.upstream_timeout(),
    ));
    let handler = Arc::new(CredentialJobHandler::new(
        issuer.clone(),
        credentials.clone(),
        backend,
    ));
    let workers = WorkerPool::start(
        queue.clone(),
        handler,
        WorkerConfig {
            workers: settings.queue.workers,
            poll_interval: settings.queue_poll_interval(),
        },
    );

    // Authentication
    let admins = settings.admin_addresses()?;
    for admin in &admins {
        log::info!("admin wallet {}", format_address(*admin));
    }
    let auth = AuthService::new(
        AuthSettings {
            audience: settings.auth.audience.clone(),
            admins,
        },
        ChallengeStore::new(settings.challenge_ttl()),
        SessionIssuer::new(settings.auth.jwt_secret.clone(), settings.access_token_ttl()),
        credentials.clone(),
        Verifier::new(vec![issuer.did()]),
        issuer,
    )
    .with_scheduler(queue.clone());
    let auth = Arc::new(auth);
    let purge = spawn_challenge_purge(auth.clone(), settings.challenge_purge_interval());

    let api_server = ApiServer::new(auth, queue, credentials);
    let served = api_server
        .run(addr, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for shutdown signal: {}", e);
            }
            log::info!("shutdown requested");
        })
        .await;

    purge.abort();
    workers.shutdown().await;
    served.context("API server failed")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Periodically drops expired challenges so the store only holds live ones.
fn spawn_challenge_purge(auth: Arc<AuthService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = auth.purge_expired_challenges(Utc::now()) {
                log::warn!("challenge purge failed: {}", e);
            }
        }
    })
}
