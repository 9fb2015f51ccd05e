// src/credential/presentation.rs
//! Verifiable Presentations bound to a login session.
//!
//! The gateway never signs a presentation. During the challenge step it hands the
//! wallet a deterministic message built from the audience, the address and the
//! challenge; the wallet signs `keccak256(message)`. At login the gateway embeds
//! that signature as the presentation's signature segment and the message as its
//! `signingData` claim, so the presentation is only valid for that one challenge.
//!
//! Embedded credentials are verified one by one. A credential that fails is
//! reported in [`PresentationReport::rejected`] and never affects its siblings.

use crate::credential::codec::{self, decode_credential, decode_presentation};
use crate::error::TokenError;
use crate::models::credential::{
    PresentationBody, PresentationClaims, TokenHeader, TOKEN_ALGORITHM, VC_CONTEXT, VP_TYPE,
};
use crate::models::did::Did;
use crate::utils::crypto::{format_address, format_hash, hash_data, recover_signer_from_hash};
use chrono::{DateTime, Utc};
use ethers::types::Address;

/// Message the wallet signs (as `keccak256(message)`) to authorize a presentation.
pub fn vp_signing_message(audience: &str, address: Address, challenge: &str) -> String {
    format!(
        "Present verifiable credentials\naudience: {}\nholder: {}\nchallenge: {}",
        audience,
        Did::from_address(address),
        challenge
    )
}

/// `0x` hex of `keccak256(message)`, the value the wallet is asked to sign.
pub fn signing_data(message: &str) -> String {
    format_hash(hash_data(message.as_bytes()))
}

/// A credential whose signature recovered to its declared issuer.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedCredential {
    pub id: String,
    pub issuer: Did,
    pub subject: String,
    pub guardian: Did,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCredential {
    /// Position in the presentation's credential list
    pub index: usize,
    pub reason: String,
}

/// Outcome of verifying a presentation and each embedded credential.
#[derive(Debug, Clone, PartialEq)]
pub struct PresentationReport {
    pub holder: Did,
    /// Presentation signature recovered to the holder over the expected message
    pub holder_verified: bool,
    pub accepted: Vec<VerifiedCredential>,
    pub rejected: Vec<RejectedCredential>,
}

impl PresentationReport {
    /// Holder signature and every embedded credential verified.
    pub fn is_valid(&self) -> bool {
        self.holder_verified && self.rejected.is_empty()
    }
}

/// Verifies a single credential token against its declared issuer.
///
/// # Process Flow
/// 1. Decodes the token and parses the credential claims
/// 2. Rejects headers that do not declare the recoverable algorithm
/// 3. Recovers the signer over `keccak256(signing_input)`
/// 4. Compares the signer with the issuer DID's address
pub fn verify_credential(token: &str) -> Result<VerifiedCredential, TokenError> {
    let (decoded, claims) = decode_credential(token)?;
    if decoded.header.alg != TOKEN_ALGORITHM {
        return Err(TokenError::MalformedToken(format!(
            "unsupported algorithm {}",
            decoded.header.alg
        )));
    }
    let recovered = recover_signer_from_hash(
        hash_data(decoded.signing_input.as_bytes()),
        &decoded.signature,
    )?;
    if recovered != claims.iss.address() {
        return Err(TokenError::SignerMismatch {
            expected: claims.iss.to_string(),
            recovered: format_address(recovered),
        });
    }
    Ok(VerifiedCredential {
        guardian: claims.guardian().clone(),
        id: claims.jti,
        issuer: claims.iss,
        subject: claims.sub,
        token: token.to_string(),
    })
}

/// Builds a presentation token around the holder's wallet signature.
///
/// # Arguments
/// * `message` - The signing message issued with `challenge`
/// * `credentials` - VC tokens to embed, in order
/// * `vp_signature` - Wallet signature over `keccak256(message)`
pub fn assemble(
    holder: Address,
    audience: &str,
    challenge: &str,
    message: &str,
    credentials: Vec<String>,
    vp_signature: &[u8],
    now: DateTime<Utc>,
) -> Result<String, TokenError> {
    let holder = Did::from_address(holder);
    let claims = PresentationClaims {
        iss: holder.clone(),
        aud: audience.to_string(),
        nonce: challenge.to_string(),
        iat: now.timestamp(),
        signing_data: message.to_string(),
        vp: PresentationBody {
            context: vec![VC_CONTEXT.to_string()],
            types: vec![VP_TYPE.to_string()],
            holder,
            verifiable_credential: credentials,
        },
    };
    codec::encode(&TokenHeader::default(), &claims, vp_signature)
}

/// Verifies a presentation issued for `expected_message`.
///
/// `check_credential` is applied to every embedded token independently
/// ([`verify_credential`], optionally wrapped with an issuer policy).
///
/// # Errors
/// Only when the presentation itself cannot be decoded. Signature and credential
/// failures are reported in the returned [`PresentationReport`].
pub fn verify_presentation<F>(
    token: &str,
    expected_message: &str,
    check_credential: F,
) -> Result<PresentationReport, TokenError>
where
    F: Fn(&str) -> Result<VerifiedCredential, TokenError>,
{
    let (decoded, claims) = decode_presentation(token)?;
    let holder = claims.vp.holder.clone();

    let holder_verified = claims.iss == holder
        && claims.signing_data == expected_message
        && recover_signer_from_hash(hash_data(claims.signing_data.as_bytes()), &decoded.signature)
            .map(|signer| signer == holder.address())
            .unwrap_or(false);

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for (index, vc) in claims.vp.verifiable_credential.iter().enumerate() {
        match check_credential(vc) {
            Ok(credential) => accepted.push(credential),
            Err(e) => rejected.push(RejectedCredential {
                index,
                reason: e.to_string(),
            }),
        }
    }

    Ok(PresentationReport {
        holder,
        holder_verified,
        accepted,
        rejected,
    })
}
