// src/services/verifier.rs
//! Credential verification service for the gateway.
//!
//! Wraps the per-token checks of [`crate::credential::presentation`] with the
//! gateway's issuer policy: a credential is only accepted if its signature
//! recovers to its declared issuer *and* that issuer is one the gateway trusts.

use crate::credential::presentation::{self, PresentationReport, VerifiedCredential};
use crate::error::TokenError;
use crate::models::did::Did;

/// Credential verifier bound to a set of trusted issuers.
///
/// The Verifier provides:
/// - Single credential verification
/// - Filtering of stored credential tokens before they are presented
/// - Presentation verification with per-credential results
#[derive(Clone, Debug)]
pub struct Verifier {
    /// Issuers whose credentials are accepted; the gateway's own DID in practice
    trusted_issuers: Vec<Did>,
}

impl Verifier {
    /// Constructs a new Verifier instance.
    ///
    /// # Arguments
    /// * `trusted_issuers` - DIDs whose signatures are accepted on credentials
    pub fn new(trusted_issuers: Vec<Did>) -> Self {
        Verifier { trusted_issuers }
    }

    /// Verifies one credential token.
    ///
    /// # Returns
    /// - `Ok(VerifiedCredential)` if the signature recovers to a trusted issuer
    /// - `Err(TokenError)` if decoding, recovery, or the issuer check fails
    pub fn verify_credential(&self, token: &str) -> Result<VerifiedCredential, TokenError> {
        let credential = presentation::verify_credential(token)?;
        self.check_trusted(&credential)?;
        Ok(credential)
    }

    /// Keeps the tokens that verify, logging and dropping the rest.
    ///
    /// # Arguments
    /// * `tokens` - `(credential id, token)` pairs, in presentation order
    pub fn presentable<'a, I>(&self, tokens: I) -> Vec<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        tokens
            .into_iter()
            .filter_map(|(id, token)| match self.verify_credential(token) {
                Ok(_) => Some(token.to_string()),
                Err(e) => {
                    log::warn!("dropping credential {} from presentation: {}", id, e);
                    None
                }
            })
            .collect()
    }

    /// Verifies a presentation and applies the issuer policy to each credential.
    ///
    /// # Errors
    /// Only if the presentation token itself is malformed.
    pub fn verify_presentation(
        &self,
        token: &str,
        expected_message: &str,
    ) -> Result<PresentationReport, TokenError> {
        let report = presentation::verify_presentation(token, expected_message, |vc| {
            self.verify_credential(vc)
        })?;
        for rejected in &report.rejected {
            log::warn!(
                "presentation of {} carried an invalid credential: {}",
                report.holder,
                rejected.reason
            );
        }
        Ok(report)
    }

    fn check_trusted(&self, credential: &VerifiedCredential) -> Result<(), TokenError> {
        if self.trusted_issuers.contains(&credential.issuer) {
            Ok(())
        } else {
            Err(TokenError::InvalidClaims(format!(
                "untrusted issuer {}",
                credential.issuer
            )))
        }
    }
}
