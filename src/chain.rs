//! Delegation chain construction and reconstruction.
//!
//! Every exchange deepens the chain by one, whether or not an actor token is
//! present: the depth bound limits transformation chains, not just
//! delegation. The `act` claim nests per RFC 8693 — original subject
//! outermost, latest actor innermost.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ChainError;
use crate::parser::ParsedToken;
use crate::store::{TokenId, TokenStore};

/// Chain metadata computed for a derived token before issuance.
#[derive(Debug, Clone)]
pub struct ChainMetadata {
    /// Nested `act` claim for the issued token, if any actor is involved.
    pub act: Option<Value>,
    /// `may_act` carried through from the subject token, metadata only.
    pub may_act: Option<Value>,
    /// Depth of the derived token: source depth + 1.
    pub depth: u32,
}

/// Computes chain metadata and enforces the depth bound.
pub struct ActorChainBuilder {
    max_depth: u32,
}

impl ActorChainBuilder {
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Build chain metadata for an exchange of `source`, optionally acting
    /// through `actor`. Fails before anything is persisted when the derived
    /// depth would exceed `max_depth` (or the per-policy override).
    pub fn build(
        &self,
        source: &ParsedToken,
        actor: Option<&ParsedToken>,
        max_depth_override: Option<u32>,
    ) -> Result<ChainMetadata, ChainError> {
        // A policy may tighten the bound but never exceed the configured
        // maximum: revocation walks are sized to the global bound, so no
        // chain may be issued past it.
        let max = max_depth_override.map_or(self.max_depth, |m| m.min(self.max_depth));
        let depth = source.chain_depth + 1;
        if depth > max {
            return Err(ChainError::DelegationDepthExceeded { depth, max });
        }

        let act = match actor {
            Some(actor) => {
                let actor_sub = actor
                    .subject
                    .clone()
                    .unwrap_or_else(|| actor.client_id.clone());
                Some(nest_actor(source.act.clone(), &actor_sub))
            }
            // No new actor: the existing chain is carried through unchanged.
            None => source.act.clone(),
        };

        Ok(ChainMetadata {
            act,
            may_act: source.may_act.clone(),
            depth,
        })
    }
}

/// Nest a new actor beneath the existing `act` claim: the chain reads from
/// the original subject (outermost) to the latest actor (innermost).
fn nest_actor(existing: Option<Value>, actor_sub: &str) -> Value {
    match existing {
        None => json!({ "sub": actor_sub }),
        Some(Value::Object(mut outer)) => {
            let inner = outer.remove("act");
            outer.insert("act".to_string(), nest_actor(inner, actor_sub));
            Value::Object(outer)
        }
        // A malformed existing claim is replaced rather than nested into.
        Some(_) => json!({ "sub": actor_sub }),
    }
}

/// One link of a reconstructed delegation chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLink {
    pub token_id: TokenId,
    pub subject: Option<String>,
    pub client_id: String,
    pub chain_depth: u32,
}

/// Ordered view of a token's ancestry, outermost (root) first. Derived from
/// the stored forest; never persisted independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationChain {
    pub links: Vec<ChainLink>,
}

impl DelegationChain {
    /// Walk `source_token_id` edges from the given token up to its root.
    /// The walk is bounded by `max_depth` steps as defense in depth; the
    /// forest invariant already guarantees termination.
    pub fn reconstruct(store: &TokenStore, id: TokenId, max_depth: u32) -> Result<Self> {
        let mut links = Vec::new();
        let mut cursor = Some(id);
        let mut steps = 0u32;

        while let Some(current) = cursor {
            if steps > max_depth {
                break;
            }
            let Some(record) = store.get(current)? else {
                break;
            };
            cursor = record.source_token_id;
            links.push(ChainLink {
                token_id: record.id,
                subject: record.subject,
                client_id: record.client_id,
                chain_depth: record.chain_depth,
            });
            steps += 1;
        }

        links.reverse();
        Ok(Self { links })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{TokenKind, TokenRecord};
    use chrono::Utc;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn parsed(depth: u32, act: Option<Value>) -> ParsedToken {
        ParsedToken {
            id: TokenId::new(),
            kind: TokenKind::AccessToken,
            subject: Some("user@example.com".to_string()),
            client_id: "issuer".to_string(),
            scopes: BTreeSet::new(),
            audience: None,
            expires_at: Utc::now() + chrono::Duration::seconds(3600),
            chain_depth: depth,
            act,
            may_act: None,
        }
    }

    fn actor(sub: &str) -> ParsedToken {
        let mut token = parsed(0, None);
        token.subject = Some(sub.to_string());
        token
    }

    #[test]
    fn test_depth_increments_without_actor() {
        let builder = ActorChainBuilder::new(5);
        let meta = builder.build(&parsed(2, None), None, None).unwrap();
        assert_eq!(meta.depth, 3);
        assert!(meta.act.is_none());
    }

    #[test]
    fn test_depth_bound_enforced() {
        let builder = ActorChainBuilder::new(5);
        let err = builder.build(&parsed(5, None), None, None).unwrap_err();
        assert!(matches!(
            err,
            ChainError::DelegationDepthExceeded { depth: 6, max: 5 }
        ));
    }

    #[test]
    fn test_policy_override_tightens_bound() {
        let builder = ActorChainBuilder::new(5);
        assert!(builder.build(&parsed(2, None), None, Some(2)).is_err());
        assert!(builder.build(&parsed(1, None), None, Some(2)).is_ok());
    }

    #[test]
    fn test_policy_override_cannot_loosen_bound() {
        let builder = ActorChainBuilder::new(5);

        let err = builder.build(&parsed(5, None), None, Some(8)).unwrap_err();
        assert!(matches!(
            err,
            ChainError::DelegationDepthExceeded { depth: 6, max: 5 }
        ));
        assert!(builder.build(&parsed(4, None), None, Some(8)).is_ok());
    }

    #[test]
    fn test_first_actor_becomes_act_claim() {
        let builder = ActorChainBuilder::new(5);
        let meta = builder
            .build(&parsed(0, None), Some(&actor("svc-b")), None)
            .unwrap();
        assert_eq!(meta.act.unwrap(), json!({ "sub": "svc-b" }));
    }

    #[test]
    fn test_new_actor_nests_innermost() {
        let builder = ActorChainBuilder::new(5);
        let existing = json!({ "sub": "svc-b" });
        let meta = builder
            .build(&parsed(1, Some(existing)), Some(&actor("svc-c")), None)
            .unwrap();

        // svc-b (earlier actor) stays outermost, svc-c nests beneath it.
        assert_eq!(
            meta.act.unwrap(),
            json!({ "sub": "svc-b", "act": { "sub": "svc-c" } })
        );
    }

    #[test]
    fn test_reconstruct_orders_root_first() {
        let dir = tempdir().unwrap();
        let store = TokenStore::open(dir.path().join("tokens.redb")).unwrap();
        let now = Utc::now();

        let mut ids = Vec::new();
        let mut parent: Option<TokenId> = None;
        for depth in 0..3u32 {
            let record = TokenRecord {
                id: TokenId::new(),
                kind: TokenKind::AccessToken,
                subject: Some(format!("principal-{}", depth)),
                client_id: "issuer".to_string(),
                scopes: BTreeSet::new(),
                audience: None,
                issued_at: now,
                expires_at: now + chrono::Duration::seconds(3600),
                source_token_id: parent,
                chain_depth: depth,
                revoked: false,
                revoked_at: None,
                act: None,
                may_act: None,
            };
            parent = Some(record.id);
            ids.push(record.id);
            store.insert_token(record).unwrap();
        }

        let chain = DelegationChain::reconstruct(&store, ids[2], 5).unwrap();
        assert_eq!(chain.links.len(), 3);
        assert_eq!(chain.links[0].token_id, ids[0]);
        assert_eq!(chain.links[0].chain_depth, 0);
        assert_eq!(chain.links[2].token_id, ids[2]);
    }
}
