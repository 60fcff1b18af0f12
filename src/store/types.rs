//! Persisted types: token records, exchange policies, audit entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Opaque token identifier. Doubles as the `jti` claim of signed tokens and
/// as the node id of the derived-token forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generate a new random token ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn to_string_key(&self) -> String {
        self.0.to_string()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported token kinds and their RFC 8693 type URNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    AccessToken,
    RefreshToken,
    IdToken,
    Jwt,
}

impl TokenKind {
    /// Get the URN for this token kind.
    pub fn as_urn(&self) -> &'static str {
        match self {
            TokenKind::AccessToken => "urn:ietf:params:oauth:token-type:access_token",
            TokenKind::RefreshToken => "urn:ietf:params:oauth:token-type:refresh_token",
            TokenKind::IdToken => "urn:ietf:params:oauth:token-type:id_token",
            TokenKind::Jwt => "urn:ietf:params:oauth:token-type:jwt",
        }
    }

    /// Parse from URN string.
    pub fn from_urn(urn: &str) -> Option<Self> {
        match urn {
            "urn:ietf:params:oauth:token-type:access_token" => Some(TokenKind::AccessToken),
            "urn:ietf:params:oauth:token-type:refresh_token" => Some(TokenKind::RefreshToken),
            "urn:ietf:params:oauth:token-type:id_token" => Some(TokenKind::IdToken),
            "urn:ietf:params:oauth:token-type:jwt" => Some(TokenKind::Jwt),
            _ => None,
        }
    }
}

/// A stored token: either a root from the ordinary issuance flow
/// (`source_token_id = None`, `chain_depth = 0`) or a node derived by an
/// exchange. Scope, audience and chain depth are immutable after creation;
/// the only permitted mutation is flipping `revoked`, and it is monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    /// Token ID (also the `jti` of the signed form).
    pub id: TokenId,

    /// Token kind.
    pub kind: TokenKind,

    /// Subject principal. None for client-only tokens.
    pub subject: Option<String>,

    /// Client the token was issued to.
    pub client_id: String,

    /// Granted scopes.
    pub scopes: BTreeSet<String>,

    /// Audience, if any.
    pub audience: Option<String>,

    /// Issuance time.
    pub issued_at: DateTime<Utc>,

    /// Expiry time.
    pub expires_at: DateTime<Utc>,

    /// Parent in the derived-token forest. None marks a root.
    pub source_token_id: Option<TokenId>,

    /// Number of exchanges between this token and its root.
    pub chain_depth: u32,

    /// Revocation flag (monotonic, never un-revoked).
    pub revoked: bool,

    /// When the token was revoked.
    pub revoked_at: Option<DateTime<Utc>>,

    /// Delegation metadata (`act` claim value), if any.
    pub act: Option<serde_json::Value>,

    /// Authorized-actor metadata (`may_act` claim value), if any. Persisted
    /// so the claim survives re-presentation as an opaque reference.
    pub may_act: Option<serde_json::Value>,
}

impl TokenRecord {
    /// Whether the token is expired at the given instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Policy action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Deny,
}

/// An exchange policy row. Policies are matched on
/// `(requesting_client, subject_client)`, highest priority first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePolicy {
    /// Policy identifier. Breaks priority ties (lowest wins).
    pub id: String,

    /// Client allowed to request the exchange.
    pub requesting_client: String,

    /// Issuing client of the subject token this policy matches.
    pub subject_client: String,

    /// Scopes this policy can grant.
    pub allowed_scopes: BTreeSet<String>,

    /// Allowed audiences/resources; exact values or trailing-`*` patterns.
    #[serde(default)]
    pub allowed_audiences: Vec<String>,

    /// Override for the maximum chain depth.
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Override for the issued-token TTL in seconds.
    #[serde(default)]
    pub token_ttl_secs: Option<u64>,

    /// Allow or deny.
    pub action: PolicyAction,

    /// Higher priority wins.
    #[serde(default)]
    pub priority: i32,
}

impl ExchangePolicy {
    /// Whether an audience value matches this policy's allow list.
    /// A pattern ending in `*` matches any value with that prefix.
    pub fn audience_allowed(&self, audience: &str) -> bool {
        self.allowed_audiences.iter().any(|pattern| {
            if let Some(prefix) = pattern.strip_suffix('*') {
                audience.starts_with(prefix)
            } else {
                pattern == audience
            }
        })
    }
}

/// Outcome of an exchange attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Denied => write!(f, "denied"),
            AuditOutcome::Error => write!(f, "error"),
        }
    }
}

/// Append-only audit record for one exchange attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeLogEntry {
    /// When the attempt was decided.
    pub timestamp: DateTime<Utc>,

    /// Requesting client.
    pub client_id: String,

    /// Subject token, when it was resolvable.
    pub subject_token_id: Option<TokenId>,

    /// Issued token. None on denial or failure.
    pub issued_token_id: Option<TokenId>,

    /// Outcome class.
    pub outcome: AuditOutcome,

    /// Internal reason code (e.g. POLICY_DENIED). Not exposed to callers.
    pub reason: String,

    /// Scope the caller asked for, space-delimited.
    pub requested_scope: Option<String>,

    /// Scope actually granted, space-delimited.
    pub granted_scope: Option<String>,
}
