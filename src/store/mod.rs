//! Token, policy and audit persistence.
//!
//! This module provides the redb-backed store that serializes all mutation
//! in the exchange subsystem, plus the background retention task.

pub mod retention;
pub mod tokens;
pub mod types;

pub use retention::{
    spawn_retention_task, DEFAULT_RETENTION_GRACE_SECS, DEFAULT_RETENTION_INTERVAL_SECS,
};
pub use tokens::{RevokeStatus, TokenStore};
pub use types::{
    AuditOutcome, ExchangeLogEntry, ExchangePolicy, PolicyAction, TokenId, TokenKind, TokenRecord,
};
