//! Subject/actor token validation.
//!
//! A presented token is either a self-contained signed JWT (verified against
//! the configured key set) or an opaque reference (a token id resolved via
//! the store). Both paths end with the same revocation and expiry checks:
//! a signed token is matched to its revocable store record by `jti`.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, Validation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::clock::Clock;
use crate::error::{ExchangeError, TokenError};
use crate::keys::SigningKeys;
use crate::store::{TokenId, TokenKind, TokenStore};

/// Canonical form of a validated token.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    /// Internal identifier (`jti` for signed tokens, the reference itself
    /// for opaque ones; freshly assigned for signed tokens without one).
    pub id: TokenId,
    /// Asserted kind.
    pub kind: TokenKind,
    /// Subject principal. None for client-only tokens.
    pub subject: Option<String>,
    /// Issuing client.
    pub client_id: String,
    /// Scope set.
    pub scopes: BTreeSet<String>,
    /// Audience, if any.
    pub audience: Option<String>,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
    /// Position in the derived-token forest (0 when no store record exists).
    pub chain_depth: u32,
    /// Delegation chain claim, if present.
    pub act: Option<serde_json::Value>,
    /// Authorized-actor claim, if present.
    pub may_act: Option<serde_json::Value>,
}

/// Claims accepted on presented JWTs.
#[derive(Debug, Serialize, Deserialize)]
struct PresentedClaims {
    sub: Option<String>,
    iss: Option<String>,
    #[serde(default)]
    aud: Option<serde_json::Value>,
    exp: Option<i64>,
    iat: Option<i64>,
    jti: Option<String>,
    client_id: Option<String>,
    scope: Option<String>,
    act: Option<serde_json::Value>,
    may_act: Option<serde_json::Value>,
    #[serde(flatten)]
    extra: HashMap<String, serde_json::Value>,
}

/// Validates and decodes presented tokens into [`ParsedToken`].
pub struct TokenParser {
    store: Arc<TokenStore>,
    keys: Arc<SigningKeys>,
    clock: Arc<dyn Clock>,
}

impl TokenParser {
    pub fn new(store: Arc<TokenStore>, keys: Arc<SigningKeys>, clock: Arc<dyn Clock>) -> Self {
        Self { store, keys, clock }
    }

    /// Parse and validate a presented token of the asserted type.
    pub fn parse(&self, token: &str, asserted_type: &str) -> Result<ParsedToken, ExchangeError> {
        let kind = TokenKind::from_urn(asserted_type)
            .ok_or_else(|| TokenError::UnknownType(asserted_type.to_string()))?;

        // A compact JWS has exactly two dots; anything else is treated as an
        // opaque store reference.
        if token.bytes().filter(|b| *b == b'.').count() == 2 {
            self.parse_signed(token, kind)
        } else {
            self.parse_opaque(token, kind)
        }
    }

    fn parse_signed(&self, token: &str, kind: TokenKind) -> Result<ParsedToken, ExchangeError> {
        let mut validation = Validation::new(self.keys.algorithm());
        // Expiry is checked against the injected clock below, not the
        // system clock inside jsonwebtoken.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let data = decode::<PresentedClaims>(token, self.keys.decoding(), &validation)
            .map_err(|e| {
                debug!(error = %e, "Signed token verification failed");
                TokenError::SignatureInvalid
            })?;
        let claims = data.claims;

        let id = claims
            .jti
            .as_deref()
            .and_then(TokenId::parse)
            .unwrap_or_default();

        // Tokens we issued (and roots from the ordinary issuance flow) have
        // a store record; it is authoritative for revocation and lineage.
        let record = self.store.get(id).map_err(ExchangeError::Storage)?;
        if let Some(ref record) = record {
            if record.revoked {
                return Err(TokenError::Revoked.into());
            }
        }

        let expires_at = record
            .as_ref()
            .map(|r| r.expires_at)
            .or_else(|| {
                claims
                    .exp
                    .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0))
            })
            .ok_or(TokenError::SignatureInvalid)?;

        if self.clock.now() >= expires_at {
            return Err(TokenError::Expired.into());
        }

        let scopes = match record {
            Some(ref r) => r.scopes.clone(),
            None => claims
                .scope
                .as_deref()
                .map(split_scope)
                .unwrap_or_default(),
        };

        let audience = match record {
            Some(ref r) => r.audience.clone(),
            None => claims.aud.as_ref().and_then(first_audience),
        };

        Ok(ParsedToken {
            id,
            kind,
            subject: record
                .as_ref()
                .map(|r| r.subject.clone())
                .unwrap_or(claims.sub),
            client_id: record
                .as_ref()
                .map(|r| r.client_id.clone())
                .or(claims.client_id)
                .unwrap_or_default(),
            scopes,
            audience,
            expires_at,
            chain_depth: record.as_ref().map(|r| r.chain_depth).unwrap_or(0),
            act: record.as_ref().map(|r| r.act.clone()).unwrap_or(claims.act),
            may_act: record
                .as_ref()
                .map(|r| r.may_act.clone())
                .unwrap_or(claims.may_act),
        })
    }

    /// Resolve a presented token to its store identifier without the
    /// revocation and expiry checks. Used by revocation, which must accept
    /// tokens `parse` would reject. Signed tokens still need a valid
    /// signature; None means the token cannot be attributed to this issuer.
    pub fn resolve_id(&self, token: &str) -> Option<TokenId> {
        if token.bytes().filter(|b| *b == b'.').count() == 2 {
            let mut validation = Validation::new(self.keys.algorithm());
            validation.validate_exp = false;
            validation.validate_aud = false;
            validation.required_spec_claims.clear();
            let data = decode::<PresentedClaims>(token, self.keys.decoding(), &validation).ok()?;
            data.claims.jti.as_deref().and_then(TokenId::parse)
        } else {
            TokenId::parse(token)
        }
    }

    fn parse_opaque(&self, token: &str, kind: TokenKind) -> Result<ParsedToken, ExchangeError> {
        // An opaque reference that does not resolve is indistinguishable
        // from a forged one.
        let id = TokenId::parse(token).ok_or(TokenError::SignatureInvalid)?;
        let record = self
            .store
            .get(id)
            .map_err(ExchangeError::Storage)?
            .ok_or(TokenError::SignatureInvalid)?;

        if record.revoked {
            return Err(TokenError::Revoked.into());
        }
        if self.clock.now() >= record.expires_at {
            return Err(TokenError::Expired.into());
        }

        Ok(ParsedToken {
            id: record.id,
            kind,
            subject: record.subject,
            client_id: record.client_id,
            scopes: record.scopes,
            audience: record.audience,
            expires_at: record.expires_at,
            chain_depth: record.chain_depth,
            act: record.act,
            may_act: record.may_act,
        })
    }
}

fn split_scope(scope: &str) -> BTreeSet<String> {
    scope.split_whitespace().map(String::from).collect()
}

/// `aud` may be a string or an array of strings; the first entry wins.
fn first_audience(aud: &serde_json::Value) -> Option<String> {
    match aud {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => items
            .first()
            .and_then(|v| v.as_str())
            .map(String::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::KeyConfig;
    use crate::signer::{SignRequest, TokenSigner};
    use crate::store::TokenRecord;
    use chrono::Duration;
    use tempfile::tempdir;

    const ACCESS_URN: &str = "urn:ietf:params:oauth:token-type:access_token";

    struct Fixture {
        parser: TokenParser,
        signer: TokenSigner,
        store: Arc<TokenStore>,
        clock: Arc<ManualClock>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path().join("tokens.redb")).unwrap());
        let keys = Arc::new(
            SigningKeys::from_config(&KeyConfig {
                algorithm: "HS256".to_string(),
                secret: Some("parser-test-secret-key-that-is-long".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let parser = TokenParser::new(
            Arc::clone(&store),
            Arc::clone(&keys),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let signer = TokenSigner::new(keys, "https://sts.example.com".to_string());
        Fixture {
            parser,
            signer,
            store,
            clock,
            _dir: dir,
        }
    }

    fn seed_root(fx: &Fixture, ttl_secs: i64) -> (TokenId, String) {
        let id = TokenId::new();
        let now = fx.clock.now();
        let scopes = BTreeSet::from(["read".to_string(), "write".to_string()]);
        let record = TokenRecord {
            id,
            kind: TokenKind::AccessToken,
            subject: Some("user@example.com".to_string()),
            client_id: "issuing-client".to_string(),
            scopes: scopes.clone(),
            audience: None,
            issued_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            source_token_id: None,
            chain_depth: 0,
            revoked: false,
            revoked_at: None,
            act: None,
            may_act: None,
        };
        fx.store.insert_token(record).unwrap();

        let jwt = fx
            .signer
            .sign(SignRequest {
                token_id: id,
                subject: Some("user@example.com"),
                client_id: "issuing-client",
                audience: None,
                scopes: &scopes,
                issued_at: now,
                expires_at: now + Duration::seconds(ttl_secs),
                act: None,
                may_act: None,
            })
            .unwrap();
        (id, jwt)
    }

    #[test]
    fn test_unknown_token_type() {
        let fx = fixture();
        let err = fx
            .parser
            .parse("anything", "urn:ietf:params:oauth:token-type:saml2")
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Token(TokenError::UnknownType(_))
        ));
    }

    #[test]
    fn test_signed_token_parses_to_store_record() {
        let fx = fixture();
        let (id, jwt) = seed_root(&fx, 3600);

        let parsed = fx.parser.parse(&jwt, ACCESS_URN).unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.client_id, "issuing-client");
        assert_eq!(parsed.chain_depth, 0);
        assert!(parsed.scopes.contains("read"));
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let fx = fixture();
        let (_, jwt) = seed_root(&fx, 3600);
        let mut tampered = jwt;
        tampered.push('x');

        let err = fx.parser.parse(&tampered, ACCESS_URN).unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Token(TokenError::SignatureInvalid)
        ));
    }

    #[test]
    fn test_expired_by_injected_clock() {
        let fx = fixture();
        let (_, jwt) = seed_root(&fx, 60);
        fx.clock.advance_secs(120);

        let err = fx.parser.parse(&jwt, ACCESS_URN).unwrap_err();
        assert!(matches!(err, ExchangeError::Token(TokenError::Expired)));
    }

    #[test]
    fn test_revoked_signed_token_rejected_via_store() {
        let fx = fixture();
        let (id, jwt) = seed_root(&fx, 3600);
        fx.store.mark_revoked(id, fx.clock.now()).unwrap();

        let err = fx.parser.parse(&jwt, ACCESS_URN).unwrap_err();
        assert!(matches!(err, ExchangeError::Token(TokenError::Revoked)));
    }

    #[test]
    fn test_opaque_reference_resolves() {
        let fx = fixture();
        let (id, _) = seed_root(&fx, 3600);

        let parsed = fx
            .parser
            .parse(&id.to_string_key(), ACCESS_URN)
            .unwrap();
        assert_eq!(parsed.id, id);
        assert_eq!(parsed.subject.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_may_act_survives_opaque_representation() {
        let fx = fixture();
        let now = fx.clock.now();
        let may_act = serde_json::json!({ "sub": "svc-admin" });
        let record = TokenRecord {
            id: TokenId::new(),
            kind: TokenKind::AccessToken,
            subject: Some("user@example.com".to_string()),
            client_id: "issuing-client".to_string(),
            scopes: BTreeSet::from(["read".to_string()]),
            audience: None,
            issued_at: now,
            expires_at: now + Duration::seconds(3600),
            source_token_id: None,
            chain_depth: 0,
            revoked: false,
            revoked_at: None,
            act: None,
            may_act: Some(may_act.clone()),
        };
        let id = record.id;
        fx.store.insert_token(record).unwrap();

        let parsed = fx.parser.parse(&id.to_string_key(), ACCESS_URN).unwrap();
        assert_eq!(parsed.may_act, Some(may_act));
    }

    #[test]
    fn test_resolve_id_accepts_revoked_and_expired() {
        let fx = fixture();
        let (id, jwt) = seed_root(&fx, 60);
        fx.store.mark_revoked(id, fx.clock.now()).unwrap();
        fx.clock.advance_secs(120);

        assert_eq!(fx.parser.resolve_id(&jwt), Some(id));
        assert_eq!(fx.parser.resolve_id(&id.to_string_key()), Some(id));
        assert_eq!(fx.parser.resolve_id("not-a-token"), None);
    }

    #[test]
    fn test_unresolvable_opaque_reference_rejected() {
        let fx = fixture();

        for garbage in ["not-a-reference", &TokenId::new().to_string_key()] {
            let err = fx.parser.parse(garbage, ACCESS_URN).unwrap_err();
            assert!(matches!(
                err,
                ExchangeError::Token(TokenError::SignatureInvalid)
            ));
        }
    }
}
