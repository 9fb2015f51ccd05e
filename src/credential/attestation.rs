// src/credential/attestation.rs
//! Deterministic messages a holder signs to authorize credential lifecycle jobs.
//!
//! The wallet signs these strings with the personal-message scheme and the job
//! handler rebuilds the same string from the job payload before recovering the
//! signer. A transfer attestation names the credential it supersedes, so an old
//! attestation cannot be replayed after the subject changes hands again.

use crate::error::TokenError;
use crate::utils::crypto::{format_address, recover_signer};
use ethers::types::Address;

/// Message the guardian signs to request the first credential for a subject.
pub fn creation_message(subject: &str, guardian: Address) -> String {
    format!(
        "Register guardian credential\nsubject: {}\nguardian: {}",
        subject,
        format_address(guardian)
    )
}

/// Message the current holder signs to hand a subject over to a new guardian.
pub fn transfer_message(
    subject: &str,
    from: Address,
    to: Address,
    superseded_credential: &str,
) -> String {
    format!(
        "Transfer guardian credential\nsubject: {}\nfrom: {}\nto: {}\ncredential: {}",
        subject,
        format_address(from),
        format_address(to),
        superseded_credential
    )
}

/// Checks that `signature` over `message` was produced by `expected`.
pub fn verify_attestation(
    message: &str,
    signature: &[u8],
    expected: Address,
) -> Result<(), TokenError> {
    let recovered = recover_signer(message.as_bytes(), signature)?;
    if recovered != expected {
        return Err(TokenError::SignerMismatch {
            expected: format_address(expected),
            recovered: format_address(recovered),
        });
    }
    Ok(())
}
