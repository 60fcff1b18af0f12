//! Error taxonomy for the exchange subsystem.
//!
//! Internal errors carry the reason recorded in the audit log; the external
//! surface only ever sees the OAuth error code from [`ExchangeError::oauth_code`].

use thiserror::Error;

/// Top-level error for an exchange attempt.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Malformed request (missing parameters, bad grant type).
    #[error("invalid request: {0}")]
    Validation(String),

    /// The presented subject or actor token failed validation.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// The exchange was denied by policy.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Delegation chain constraint violated.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Transient infrastructure failure (storage).
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Token validation failures.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is expired")]
    Expired,

    #[error("token has been revoked")]
    Revoked,

    #[error("token signature or reference could not be verified")]
    SignatureInvalid,

    #[error("unsupported token type: {0}")]
    UnknownType(String),
}

/// Policy evaluation failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("no policy permits this exchange")]
    Denied,

    #[error("requested scope exceeds what the subject token or policy allows")]
    InsufficientScope,

    #[error("requested audience is not allowed by policy")]
    AudienceNotAllowed,

    #[error("policy evaluation exceeded its deadline")]
    Timeout,
}

/// Delegation chain failures.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("delegation depth {depth} exceeds maximum {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },
}

impl ExchangeError {
    /// OAuth 2.0 error code returned to the caller (RFC 6749 / RFC 8693).
    ///
    /// Storage failures are deliberately outside the four request-level
    /// codes: they surface as HTTP 500 with `server_error`.
    pub fn oauth_code(&self) -> &'static str {
        match self {
            ExchangeError::Validation(_) => "invalid_request",
            ExchangeError::Token(_) => "invalid_grant",
            ExchangeError::Policy(PolicyError::AudienceNotAllowed) => "invalid_target",
            ExchangeError::Policy(_) => "unauthorized_client",
            ExchangeError::Chain(_) => "invalid_grant",
            ExchangeError::Storage(_) => "server_error",
        }
    }

    /// Internal reason code recorded in the audit log. Never disclosed
    /// externally.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ExchangeError::Validation(_) => "INVALID_REQUEST",
            ExchangeError::Token(TokenError::Expired) => "TOKEN_EXPIRED",
            ExchangeError::Token(TokenError::Revoked) => "TOKEN_REVOKED",
            ExchangeError::Token(TokenError::SignatureInvalid) => "SIGNATURE_INVALID",
            ExchangeError::Token(TokenError::UnknownType(_)) => "UNKNOWN_TOKEN_TYPE",
            ExchangeError::Policy(PolicyError::Denied) => "POLICY_DENIED",
            ExchangeError::Policy(PolicyError::InsufficientScope) => "INSUFFICIENT_SCOPE",
            ExchangeError::Policy(PolicyError::AudienceNotAllowed) => "AUDIENCE_NOT_ALLOWED",
            ExchangeError::Policy(PolicyError::Timeout) => "POLICY_TIMEOUT",
            ExchangeError::Chain(ChainError::DelegationDepthExceeded { .. }) => {
                "DELEGATION_DEPTH_EXCEEDED"
            }
            ExchangeError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether this outcome is a policy-level denial (as opposed to a
    /// request/infrastructure failure). Drives the audit outcome column.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            ExchangeError::Policy(_) | ExchangeError::Chain(_)
        )
    }
}
