// src/clients/backend.rs
//! Relational backend capability.
//!
//! The backend owns guardian profiles (and the rest of the business data). The
//! gateway only ever upserts the wallet-verification side of a guardian profile,
//! which makes redelivered sync jobs harmless.

use crate::clients::http::HttpClient;
use crate::errors::classifier::{Upstream, UpstreamError};
use crate::models::job::SyncProfileJob;
use crate::utils::crypto::format_address;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use std::time::Duration;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Creates or replaces the guardian profile keyed by wallet address.
    async fn upsert_guardian_profile(&self, profile: &SyncProfileJob) -> Result<(), UpstreamError>;
}

/// Body of `PUT /api/guardians/{address}`.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GuardianProfileBody<'a> {
    wallet_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phone: Option<&'a str>,
    wallet_verified: bool,
    credential_count: usize,
    verified_at: DateTime<Utc>,
}

/// HTTP implementation of [`Backend`].
pub struct BackendClient {
    http: HttpClient,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        BackendClient {
            http: HttpClient::new(Upstream::Backend, base_url, timeout),
        }
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn upsert_guardian_profile(&self, profile: &SyncProfileJob) -> Result<(), UpstreamError> {
        let address = format_address(profile.address);
        let body = GuardianProfileBody {
            wallet_address: address.clone(),
            name: profile.name.as_deref(),
            email: profile.email.as_deref(),
            phone: profile.phone.as_deref(),
            wallet_verified: profile.wallet_verified,
            credential_count: profile.credential_count,
            verified_at: profile.verified_at,
        };
        self.http
            .send_json(Method::PUT, &format!("/api/guardians/{}", address), Some(&body))
            .await?;
        log::debug!("guardian profile {} synced", address);
        Ok(())
    }
}
