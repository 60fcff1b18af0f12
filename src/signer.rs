//! Signing of issued tokens.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Header};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::keys::SigningKeys;
use crate::store::TokenId;

/// Claims carried by tokens this service signs.
///
/// `jti` is always the store-side [`TokenId`], which is how a presented
/// signed token is matched back to its revocable record.
#[derive(Debug, Serialize, Deserialize)]
pub struct IssuedClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Expiration time (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// JWT ID: the store-side token identifier.
    pub jti: String,
    /// Client the token was issued to (RFC 9068).
    pub client_id: String,
    /// Scopes, space-separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Delegation chain (RFC 8693 `act` claim).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub act: Option<serde_json::Value>,
    /// Authorized actors (RFC 8693 `may_act` claim), carried as metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub may_act: Option<serde_json::Value>,
}

/// Parameters for one signing operation.
pub struct SignRequest<'a> {
    pub token_id: TokenId,
    pub subject: Option<&'a str>,
    pub client_id: &'a str,
    pub audience: Option<&'a str>,
    pub scopes: &'a BTreeSet<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub act: Option<serde_json::Value>,
    pub may_act: Option<serde_json::Value>,
}

/// Token signer for the exchange issuer.
pub struct TokenSigner {
    keys: Arc<SigningKeys>,
    issuer: String,
}

impl TokenSigner {
    pub fn new(keys: Arc<SigningKeys>, issuer: String) -> Self {
        Self { keys, issuer }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign a token with the configured key and issuer.
    pub fn sign(&self, request: SignRequest<'_>) -> Result<String> {
        let scope = if request.scopes.is_empty() {
            None
        } else {
            Some(
                request
                    .scopes
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(" "),
            )
        };

        let claims = IssuedClaims {
            iss: self.issuer.clone(),
            sub: request.subject.map(String::from),
            aud: request.audience.map(String::from),
            exp: request.expires_at.timestamp(),
            iat: request.issued_at.timestamp(),
            jti: request.token_id.to_string_key(),
            client_id: request.client_id.to_string(),
            scope,
            act: request.act,
            may_act: request.may_act,
        };

        let header = Header::new(self.keys.algorithm());
        let token = encode(&header, &claims, self.keys.encoding())
            .context("Failed to encode token")?;

        debug!(
            jti = %claims.jti,
            sub = ?claims.sub,
            aud = ?claims.aud,
            exp = %claims.exp,
            "Signed token"
        );

        Ok(token)
    }
}
