// src/config.rs
//! Layered gateway settings.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults
//! 2. `config/default.toml` (optional)
//! 3. `config/local.toml` (optional)
//! 4. `GATEWAY__*` environment variables, `__` separating nested keys
//!    (e.g. `GATEWAY__QUEUE__WORKERS=8`, `GATEWAY__AUTH__ADMINS=0xabc,0xdef`)
//!
//! A `.env` file is loaded into the environment first.

use crate::error::ConfigError;
use crate::models::job::{BackoffKind, RetryPolicy};
use crate::utils::crypto::parse_address;
use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthConfig,
    pub ledger: LedgerSettings,
    pub backend: BackendSettings,
    pub upstream: UpstreamSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for access tokens
    pub jwt_secret: String,
    pub access_token_ttl_secs: i64,
    pub challenge_ttl_secs: i64,
    /// Name of this service as it appears in presentations
    pub audience: String,
    /// Wallet addresses granted the admin role
    #[serde(default)]
    pub admins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSettings {
    pub rpc_url: String,
    /// Hex secp256k1 key of the gateway issuer
    pub issuer_private_key: String,
    pub registry_address: String,
    pub receipt_poll_ms: u64,
    pub receipt_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSettings {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSettings {
    /// Per-call timeout applied to every ledger and backend request
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    pub database_path: String,
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
}

impl Settings {
    /// Loads settings from every source and validates them.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let builder = defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(environment());
        Self::from_builder(builder)
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(invalid("auth.jwt_secret", "must not be empty"));
        }
        if self.auth.access_token_ttl_secs <= 0 {
            return Err(invalid("auth.access_token_ttl_secs", "must be positive"));
        }
        if self.auth.challenge_ttl_secs <= 0 {
            return Err(invalid("auth.challenge_ttl_secs", "must be positive"));
        }
        if self.ledger.issuer_private_key.trim().is_empty() {
            return Err(invalid("ledger.issuer_private_key", "must not be empty"));
        }
        if self.queue.workers == 0 {
            return Err(invalid("queue.workers", "must be at least 1"));
        }
        if self.queue.attempts == 0 {
            return Err(invalid("queue.attempts", "must be at least 1"));
        }
        self.registry_address()?;
        self.admin_addresses()?;
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| invalid("server.host", e))
    }

    pub fn registry_address(&self) -> Result<Address, ConfigError> {
        parse_address(&self.ledger.registry_address).map_err(|e| invalid("ledger.registry_address", e))
    }

    pub fn admin_addresses(&self) -> Result<HashSet<Address>, ConfigError> {
        self.auth
            .admins
            .iter()
            .map(|raw| parse_address(raw.trim()).map_err(|e| invalid("auth.admins", e)))
            .collect()
    }

    pub fn access_token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.access_token_ttl_secs)
    }

    pub fn challenge_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.auth.challenge_ttl_secs)
    }

    /// How often expired challenges are dropped (one TTL).
    pub fn challenge_purge_interval(&self) -> Duration {
        Duration::from_secs(self.auth.challenge_ttl_secs.unsigned_abs())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.timeout_ms)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ledger.receipt_poll_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_secs(self.ledger.receipt_timeout_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue.poll_interval_ms)
    }

    /// Policy for jobs enqueued without one.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.queue.attempts,
            backoff: self.queue.backoff,
            base_delay_ms: self.queue.base_delay_ms,
        }
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Ok(config::Config::builder()
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 3000)?
        .set_default("auth.jwt_secret", "")?
        .set_default("auth.access_token_ttl_secs", 3600)?
        .set_default("auth.challenge_ttl_secs", 300)?
        .set_default("auth.audience", "did-gateway")?
        .set_default("auth.admins", Vec::<String>::new())?
        .set_default("ledger.rpc_url", "http://127.0.0.1:8545")?
        .set_default("ledger.issuer_private_key", "")?
        .set_default(
            "ledger.registry_address",
            "0x0000000000000000000000000000000000000000",
        )?
        .set_default("ledger.receipt_poll_ms", 1_000)?
        .set_default("ledger.receipt_timeout_secs", 60)?
        .set_default("backend.base_url", "http://127.0.0.1:8080")?
        .set_default("upstream.timeout_ms", 10_000)?
        .set_default("queue.database_path", "gateway.db")?
        .set_default("queue.workers", 4)?
        .set_default("queue.poll_interval_ms", 500)?
        .set_default("queue.attempts", 3)?
        .set_default("queue.backoff", "exponential")?
        .set_default("queue.base_delay_ms", 1_000)?)
}

fn environment() -> Environment {
    Environment::with_prefix("GATEWAY")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("auth.admins")
}

fn invalid(key: &'static str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}
