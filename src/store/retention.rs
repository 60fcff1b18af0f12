//! Background retention task.
//!
//! Periodically deletes tokens past expiry plus the configured grace window.
//! Revocation state for live tokens is untouched; audit entries are kept.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::clock::Clock;

use super::tokens::TokenStore;

/// Default sweep interval in seconds.
pub const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Default grace window after expiry, in seconds.
pub const DEFAULT_RETENTION_GRACE_SECS: u64 = 86400; // 24 hours

/// Spawn a background task that periodically deletes expired tokens.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_retention_task(
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
    grace_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(interval_secs));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            match store.evict_expired(clock.now(), grace_secs) {
                Ok(count) => {
                    if count > 0 {
                        info!(deleted = count, "Token retention sweep completed");
                    } else {
                        debug!("Token retention sweep: nothing to delete");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Token retention sweep failed");
                }
            }

            match store.token_count() {
                Ok(count) => {
                    debug!(stored_tokens = count, "Token store status");
                }
                Err(e) => {
                    debug!(error = %e, "Failed to get token count");
                }
            }
        }
    })
}
