// src/auth/session.rs
//! Access tokens for established sessions.
//!
//! Tokens are HS256 JWTs signed with the gateway secret. They carry the wallet
//! address, the resolved role and the outcome of presentation verification.

use crate::error::AuthError;
use chrono::{DateTime, Duration, Utc};
use ethers::types::Address;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Guardian,
    User,
}

/// Claims bound into an access token.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    /// Lowercase `0x` wallet address
    pub sub: String,
    pub role: Role,
    pub vp_verified: bool,
    /// Holder DID of the verified presentation
    pub vp_holder: Option<String>,
    pub vc_count: usize,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    /// Wallet address named by `sub`.
    pub fn address(&self) -> Result<Address, AuthError> {
        crate::utils::crypto::parse_address(&self.sub)
            .map_err(|e| AuthError::InvalidAccessToken(e.to_string()))
    }
}

/// Issues and verifies access tokens.
#[derive(Clone)]
pub struct SessionIssuer {
    secret: String,
    ttl: Duration,
}

impl SessionIssuer {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        SessionIssuer {
            secret: secret.into(),
            ttl,
        }
    }

    /// Signs `claims` after stamping `iat`/`exp` from `now`.
    pub fn issue(&self, mut claims: SessionClaims, now: DateTime<Utc>) -> Result<String, AuthError> {
        claims.iat = now.timestamp();
        claims.exp = (now + self.ttl).timestamp();
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(format!("failed to sign access token: {}", e)))
    }

    /// Verifies signature and expiry.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, AuthError> {
        decode::<SessionClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|err| {
            let reason = match err.kind() {
                ErrorKind::ExpiredSignature => "token expired",
                ErrorKind::InvalidSignature => "invalid signature",
                ErrorKind::InvalidToken => "invalid token",
                _ => "token validation failed",
            };
            AuthError::InvalidAccessToken(reason.to_string())
        })
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    header?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> SessionClaims {
        SessionClaims {
            sub: "0x0101010101010101010101010101010101010101".into(),
            role: Role::Guardian,
            vp_verified: true,
            vp_holder: Some("did:ethr:0x0101010101010101010101010101010101010101".into()),
            vc_count: 2,
            iat: 0,
            exp: 0,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = SessionIssuer::new("secret", Duration::hours(1));
        let token = issuer.issue(claims(), Utc::now()).unwrap();
        let decoded = issuer.verify(&token).unwrap();
        assert_eq!(decoded.role, Role::Guardian);
        assert_eq!(decoded.vc_count, 2);
        assert_eq!(decoded.exp - decoded.iat, 3600);
        assert_eq!(decoded.address().unwrap(), Address::repeat_byte(1));
    }

    #[test]
    fn test_claims_use_camel_case() {
        let json = serde_json::to_value(claims()).unwrap();
        assert_eq!(json["vpVerified"], true);
        assert_eq!(json["vcCount"], 2);
        assert_eq!(json["role"], "guardian");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = SessionIssuer::new("secret", Duration::hours(1))
            .issue(claims(), Utc::now())
            .unwrap();
        let err = SessionIssuer::new("other", Duration::hours(1))
            .verify(&token)
            .unwrap_err();
        assert_eq!(err, AuthError::InvalidAccessToken("invalid signature".into()));
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = SessionIssuer::new("secret", Duration::hours(1));
        let token = issuer
            .issue(claims(), Utc::now() - Duration::hours(3))
            .unwrap();
        assert_eq!(
            issuer.verify(&token).unwrap_err(),
            AuthError::InvalidAccessToken("token expired".into())
        );
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(Some("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(Some("Basic abc")), None);
        assert_eq!(bearer_token(Some("Bearer ")), None);
        assert_eq!(bearer_token(None), None);
    }
}
