//! Cascading revocation over the derived-token forest.
//!
//! Revoking a token revokes every token derived from it, breadth first.
//! Each node is revoked with a compare-and-set, so propagation is
//! idempotent: re-running over an already revoked subtree is a no-op, and
//! an interrupted cascade can be resumed by revoking the same root again.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ExchangeError;
use crate::store::{RevokeStatus, TokenId, TokenStore};

/// Outcome of one revocation cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationSummary {
    /// Tokens transitioned to revoked by this cascade.
    pub revoked: u32,
    /// Tokens that were already revoked when visited.
    pub already_revoked: u32,
    /// Whether the root itself had a stored record.
    pub root_found: bool,
}

/// Propagates revocation from a root through all of its descendants.
pub struct RevocationPropagator {
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    max_depth: u32,
    retry_budget: u32,
}

impl RevocationPropagator {
    pub fn new(store: Arc<TokenStore>, clock: Arc<dyn Clock>, max_depth: u32) -> Self {
        Self {
            store,
            clock,
            max_depth,
            retry_budget: 3,
        }
    }

    /// Revoke `root` and everything derived from it. A storage failure part
    /// way through restarts the cascade from the root; already revoked nodes
    /// are skipped on the retry, so the cascade converges.
    pub fn revoke_cascade(&self, root: TokenId) -> Result<RevocationSummary, ExchangeError> {
        let mut attempt = 0;
        loop {
            match self.cascade_once(root) {
                Ok(summary) => {
                    info!(
                        root = %root,
                        revoked = summary.revoked,
                        already_revoked = summary.already_revoked,
                        "Revocation cascade complete"
                    );
                    return Ok(summary);
                }
                Err(err) if attempt < self.retry_budget => {
                    attempt += 1;
                    warn!(root = %root, attempt, error = %err, "Retrying revocation cascade");
                }
                Err(err) => return Err(ExchangeError::Storage(err)),
            }
        }
    }

    fn cascade_once(&self, root: TokenId) -> anyhow::Result<RevocationSummary> {
        let now = self.clock.now();
        let mut summary = RevocationSummary {
            revoked: 0,
            already_revoked: 0,
            root_found: false,
        };

        let mut queue = VecDeque::new();
        queue.push_back((root, 0u32));

        while let Some((id, depth)) = queue.pop_front() {
            match self.store.mark_revoked(id, now)? {
                RevokeStatus::Revoked => {
                    summary.revoked += 1;
                    if id == root {
                        summary.root_found = true;
                    }
                }
                RevokeStatus::AlreadyRevoked => {
                    summary.already_revoked += 1;
                    if id == root {
                        summary.root_found = true;
                    }
                }
                // The child index is maintained independently of the token
                // row, so descendants of an evicted root are still walked.
                RevokeStatus::NotFound => {
                    debug!(token = %id, "No stored record for revocation target");
                }
            }

            // The forest invariant bounds the walk; the depth check guards
            // against index corruption.
            if depth >= self.max_depth {
                continue;
            }
            for child in self.store.children(id)? {
                queue.push_back((child, depth + 1));
            }
        }

        Ok(summary)
    }
}
