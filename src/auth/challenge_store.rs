// src/auth/challenge_store.rs
//! Single-use login challenges.
//!
//! Entries are keyed by `(address, challenge)` and live for a fixed TTL. A
//! consumed entry is kept until it expires so that a second presentation of the
//! same challenge is reported as a replay rather than as an unknown challenge.
//! Check-and-consume happens under one lock acquisition.

use crate::error::AuthError;
use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use ethers::utils::hex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Random bytes per challenge.
const CHALLENGE_BYTES: usize = 32;

struct ChallengeEntry {
    expires_at: DateTime<Utc>,
    consumed: bool,
    /// VP signing message handed out with the challenge, if any
    vp_message: Option<String>,
}

/// Generates a fresh `0x`-prefixed random challenge.
pub fn new_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

/// TTL store of issued challenges.
pub struct ChallengeStore {
    ttl: Duration,
    entries: Mutex<HashMap<(Address, String), ChallengeEntry>>,
}

impl ChallengeStore {
    pub fn new(ttl: Duration) -> Self {
        ChallengeStore {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records a challenge issued to `address`.
    ///
    /// # Arguments
    /// * `vp_message` - Presentation signing message issued alongside, if the
    ///   address had credentials to present
    ///
    /// # Returns
    /// The expiry time of the challenge
    pub fn insert(
        &self,
        address: Address,
        challenge: String,
        vp_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, AuthError> {
        let expires_at = now + self.ttl;
        let mut entries = self.lock()?;
        entries.retain(|_, entry| entry.expires_at > now);
        entries.insert(
            (address, challenge),
            ChallengeEntry {
                expires_at,
                consumed: false,
                vp_message,
            },
        );
        Ok(expires_at)
    }

    /// Atomically marks a challenge used.
    ///
    /// # Returns
    /// The VP signing message stored with the challenge
    ///
    /// # Errors
    /// - `ChallengeReplay` if the challenge was already consumed
    /// - `ChallengeExpired` if it is unknown for this address or past its TTL
    pub fn consume(
        &self,
        address: Address,
        challenge: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, AuthError> {
        let mut entries = self.lock()?;
        let entry = entries
            .get_mut(&(address, challenge.to_string()))
            .ok_or(AuthError::ChallengeExpired)?;
        if entry.consumed {
            return Err(AuthError::ChallengeReplay);
        }
        if entry.expires_at <= now {
            return Err(AuthError::ChallengeExpired);
        }
        entry.consumed = true;
        Ok(entry.vp_message.clone())
    }

    /// Drops every entry past its TTL.
    ///
    /// # Returns
    /// Number of entries removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(before - entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<(Address, String), ChallengeEntry>>, AuthError> {
        self.entries
            .lock()
            .map_err(|_| AuthError::Internal("challenge store lock poisoned".into()))
    }
}
