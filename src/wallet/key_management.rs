// src/wallet/key_management.rs
//! Issuer key management for the gateway.
//!
//! The gateway signs every Verifiable Credential it issues with a single secp256k1
//! key. Uses the following cryptographic primitives:
//! - secp256k1 curve (via `k256` crate)
//! - Keccak-256 hashing and EIP-191 prefixing (via `ethers` crate)
//! - Cryptographically secure random number generation

use crate::credential::codec::{self, signing_input};
use crate::error::{CryptoError, TokenError};
use crate::models::credential::TokenHeader;
use crate::models::did::Did;
use crate::utils::crypto::{hash_data, sign_hash_as_message};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::hex;
use k256::ecdsa::SigningKey;
use serde::Serialize;

/// Issuer key holder.
///
/// # Security Notes
/// - The secret key is never exposed or logged
/// - Signatures are deterministic ECDSA (RFC 6979)
#[derive(Clone)]
pub struct KeyManager {
    wallet: LocalWallet,
}

impl KeyManager {
    /// Generates a KeyManager with a fresh random key.
    pub fn new() -> Self {
        let signing_key = SigningKey::random(&mut rand::thread_rng());
        KeyManager {
            wallet: LocalWallet::from(signing_key),
        }
    }

    /// Loads the issuer key from a hex-encoded private key (with or without 0x prefix).
    ///
    /// # Errors
    /// Returns `CryptoError::SigningFailed` if the hex is invalid or not a valid scalar.
    pub fn from_private_key(private_key: &str) -> Result<Self, CryptoError> {
        let raw = private_key.trim().strip_prefix("0x").unwrap_or(private_key.trim());
        let bytes = hex::decode(raw)
            .map_err(|e| CryptoError::SigningFailed(format!("invalid private key hex: {}", e)))?;
        let signing_key = SigningKey::from_slice(&bytes)
            .map_err(|e| CryptoError::SigningFailed(format!("invalid private key: {}", e)))?;
        Ok(KeyManager {
            wallet: LocalWallet::from(signing_key),
        })
    }

    /// Address of the issuer key.
    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    /// DID the gateway issues credentials under.
    pub fn did(&self) -> Did {
        Did::from_address(self.address())
    }

    /// Underlying wallet, for the ledger adapter's transaction signer.
    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    /// Signs a payload and returns the compact token.
    ///
    /// # Process Flow
    /// 1. Builds the canonical signing input (`b64(header).b64(payload)`)
    /// 2. Hashes it with Keccak-256
    /// 3. Signs the digest as a personal message
    /// 4. Appends the base64url signature segment
    pub fn sign_token<P: Serialize>(&self, payload: &P) -> Result<String, TokenError> {
        let header = TokenHeader::default();
        let input = signing_input(&header, payload)?;
        let signature = sign_hash_as_message(&self.wallet, hash_data(input.as_bytes()))?;
        codec::encode(&header, payload, &signature)
    }
}

impl Default for KeyManager {
    fn default() -> Self {
        Self::new()
    }
}
