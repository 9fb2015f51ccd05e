// src/utils/crypto.rs
//! Signature recovery utilities optimized for wallet compatibility.
//!
//! Uses Keccak-256 (Ethereum's standard hash function) and EIP-191 personal-message
//! prefixing for every signature produced or checked by the gateway.
//!
//! ## Hashing convention
//! Two entry points exist for recovery:
//! - [`recover_signer`] takes the raw message bytes (e.g. a login challenge string).
//! - [`recover_signer_from_hash`] takes a 32-byte Keccak-256 digest that the wallet was
//!   asked to sign *as a personal message*. The digest is prefixed with
//!   `"\x19Ethereum Signed Message:\n32"` and hashed once more before recovery, which is
//!   exactly what `signMessage(bytes32)` produces in a browser wallet.
//!
//! The signing side ([`sign_message`], [`sign_hash_as_message`]) applies the same
//! convention, so a signature made by one helper always recovers through its pair.

use crate::error::CryptoError;
use ethers::signers::LocalWallet;
use ethers::types::{Address, Signature, SignatureError, H256};
use ethers::utils::{hash_message, hex, keccak256};

/// Length of a compact recoverable signature (`r || s || v`).
pub const SIGNATURE_LENGTH: usize = 65;

/// Computes a Keccak-256 hash of the input data (Ethereum-compatible).
///
/// # Arguments
/// * `data` - Binary data to hash (as bytes slice)
///
/// # Returns
/// Fixed-size 32-byte array (`[u8; 32]`) containing the hash.
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    keccak256(data)
}

/// Recovers the address that signed `message` with the personal-message scheme.
///
/// # Arguments
/// * `message` - Raw message bytes exactly as shown to the wallet
/// * `signature` - 65-byte recoverable signature
///
/// # Errors
/// - `CryptoError::InvalidSignature` if the signature is not 65 bytes or `v` is not
///   one of 0, 1, 27, 28
/// - `CryptoError::RecoveryFailed` if no public key can be recovered
pub fn recover_signer(message: &[u8], signature: &[u8]) -> Result<Address, CryptoError> {
    let signature = parse_signature(signature)?;
    signature
        .recover(hash_message(message))
        .map_err(map_signature_error)
}

/// Recovers the address that signed a 32-byte digest through the personal-message path.
///
/// The digest is never signed raw: it is prefixed as a 32-byte personal message first.
/// See the module documentation for why both sides must agree on this.
pub fn recover_signer_from_hash(hash: [u8; 32], signature: &[u8]) -> Result<Address, CryptoError> {
    recover_signer(&hash, signature)
}

/// Signs `message` with the personal-message scheme.
///
/// # Returns
/// 65-byte signature (`r || s || v`, with `v` in {27, 28})
pub fn sign_message(wallet: &LocalWallet, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let digest = hash_message(message);
    let signature = wallet
        .sign_hash(digest)
        .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
    Ok(signature.to_vec())
}

/// Signs a 32-byte digest as a personal message (pairs with [`recover_signer_from_hash`]).
pub fn sign_hash_as_message(wallet: &LocalWallet, hash: [u8; 32]) -> Result<Vec<u8>, CryptoError> {
    sign_message(wallet, &hash)
}

/// Formats an address as lowercase hex with a `0x` prefix.
pub fn format_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

/// Parses a `0x`-prefixed (or bare) hex address.
pub fn parse_address(value: &str) -> Result<Address, CryptoError> {
    let trimmed = value.trim();
    let raw = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let bytes = hex::decode(raw).map_err(|_| CryptoError::InvalidAddress(value.to_string()))?;
    if bytes.len() != 20 {
        return Err(CryptoError::InvalidAddress(value.to_string()));
    }
    Ok(Address::from_slice(&bytes))
}

/// Decodes a hex signature string, tolerating a `0x` prefix.
pub fn decode_signature_hex(value: &str) -> Result<Vec<u8>, CryptoError> {
    let raw = value.trim().strip_prefix("0x").unwrap_or(value.trim());
    let bytes = hex::decode(raw).map_err(|_| CryptoError::InvalidSignature)?;
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(CryptoError::InvalidSignature);
    }
    Ok(bytes)
}

/// Hex-encodes a signature with a `0x` prefix.
pub fn encode_signature_hex(signature: &[u8]) -> String {
    format!("0x{}", hex::encode(signature))
}

/// `0x`-prefixed hex of a 32-byte digest.
pub fn format_hash(hash: [u8; 32]) -> String {
    format!("{:?}", H256::from(hash))
}

fn parse_signature(bytes: &[u8]) -> Result<Signature, CryptoError> {
    if bytes.len() != SIGNATURE_LENGTH || !matches!(bytes[64], 0 | 1 | 27 | 28) {
        return Err(CryptoError::InvalidSignature);
    }
    Signature::try_from(bytes).map_err(map_signature_error)
}

fn map_signature_error(err: SignatureError) -> CryptoError {
    match err {
        SignatureError::InvalidLength(_) | SignatureError::DecodingError(_) => {
            CryptoError::InvalidSignature
        }
        _ => CryptoError::RecoveryFailed,
    }
}
