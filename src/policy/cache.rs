//! Short-TTL decision cache.
//!
//! Bounds repeated policy lookups for hot (client, issuer, scope) tuples.
//! An entry is valid for the configured TTL but never past the subject
//! token's expiry, so a cached allow cannot outlive its inputs.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::engine::Decision;

/// Cache key: the inputs that fully determine a decision for one subject
/// token shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecisionKey {
    pub requesting_client: String,
    pub subject_client: String,
    /// Canonical (sorted, space-joined) scope set of the subject token. Two
    /// tokens from the same issuer with different scopes must never share a
    /// cached grant.
    pub subject_scope: String,
    /// Canonical requested scope; empty when the caller did not narrow.
    pub requested_scope: String,
    pub audience: Option<String>,
}

struct CachedDecision {
    decision: Decision,
    valid_until: DateTime<Utc>,
}

/// Decision cache with TTL and size bounds.
pub struct DecisionCache {
    entries: RwLock<HashMap<DecisionKey, CachedDecision>>,
    ttl_secs: u64,
    max_entries: usize,
}

impl DecisionCache {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl_secs,
            max_entries: 4096,
        }
    }

    /// Whether caching is enabled at all.
    pub fn enabled(&self) -> bool {
        self.ttl_secs > 0
    }

    /// Look up a still-valid decision.
    pub fn get(&self, key: &DecisionKey, now: DateTime<Utc>) -> Option<Decision> {
        if !self.enabled() {
            return None;
        }
        let entries = self.entries.read().ok()?;
        entries
            .get(key)
            .filter(|cached| now < cached.valid_until)
            .map(|cached| cached.decision.clone())
    }

    /// Insert a decision, capping validity at the subject token's expiry.
    pub fn insert(
        &self,
        key: DecisionKey,
        decision: Decision,
        subject_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        if !self.enabled() {
            return;
        }
        let ttl_end = now + chrono::Duration::seconds(self.ttl_secs as i64);
        let valid_until = ttl_end.min(subject_expires_at);
        if valid_until <= now {
            return;
        }

        if let Ok(mut entries) = self.entries.write() {
            if entries.len() >= self.max_entries {
                entries.retain(|_, cached| now < cached.valid_until);
                // Still full of live entries: drop the soonest to expire.
                if entries.len() >= self.max_entries {
                    if let Some(evict) = entries
                        .iter()
                        .min_by_key(|(_, c)| c.valid_until)
                        .map(|(k, _)| k.clone())
                    {
                        entries.remove(&evict);
                    }
                }
            }
            entries.insert(
                key,
                CachedDecision {
                    decision,
                    valid_until,
                },
            );
        }
    }
}
