//! Exchange orchestration.
//!
//! One exchange runs as a small state machine:
//! `Received → Parsing → PolicyEvaluation → ChainBuilding → Issuing →
//! Completed`, with `Denied`/`Failed` reachable from any non-terminal
//! phase. Every attempt leaves exactly one audit entry; issuance commits
//! the token row and its audit entry in one transaction.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chain::ActorChainBuilder;
use crate::clock::Clock;
use crate::error::{ExchangeError, PolicyError, TokenError};
use crate::handler::{TokenExchangeRequest, TokenExchangeResponse, GRANT_TYPE_TOKEN_EXCHANGE};
use crate::keys::SigningKeys;
use crate::parser::TokenParser;
use crate::policy::{evaluate, Decision, DecisionCache, DecisionKey, EvaluationRequest};
use crate::registry::ClientRegistry;
use crate::signer::{SignRequest, TokenSigner};
use crate::store::{
    AuditOutcome, ExchangeLogEntry, TokenId, TokenKind, TokenRecord, TokenStore,
};

/// Phases of one exchange. Used for tracing and failure attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    Received,
    Parsing,
    PolicyEvaluation,
    ChainBuilding,
    Issuing,
    Completed,
    Denied,
    Failed,
}

impl std::fmt::Display for ExchangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExchangePhase::Received => "received",
            ExchangePhase::Parsing => "parsing",
            ExchangePhase::PolicyEvaluation => "policy_evaluation",
            ExchangePhase::ChainBuilding => "chain_building",
            ExchangePhase::Issuing => "issuing",
            ExchangePhase::Completed => "completed",
            ExchangePhase::Denied => "denied",
            ExchangePhase::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Coordinator configuration. Passed explicitly at construction; nothing is
/// read from ambient state.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Issuer claim for issued tokens.
    pub issuer: String,
    /// Maximum chain depth unless a policy tightens it.
    pub max_chain_depth: u32,
    /// Issued-token TTL unless a policy overrides it.
    pub default_token_ttl_secs: u64,
    /// Policy lookup + evaluation deadline.
    pub policy_deadline_ms: u64,
    /// Decision cache TTL; 0 disables the cache.
    pub decision_cache_ttl_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            issuer: "sts-exchange".to_string(),
            max_chain_depth: 5,
            default_token_ttl_secs: 3600,
            policy_deadline_ms: 500,
            decision_cache_ttl_secs: 10,
        }
    }
}

/// Orchestrates token exchanges end to end.
pub struct ExchangeCoordinator {
    store: Arc<TokenStore>,
    registry: Arc<ClientRegistry>,
    parser: TokenParser,
    chain_builder: ActorChainBuilder,
    signer: TokenSigner,
    cache: DecisionCache,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

/// Mutable context threaded through one attempt, for audit attribution.
struct Attempt {
    subject_token_id: Option<TokenId>,
    requested_scope: Option<String>,
    phase: ExchangePhase,
}

impl ExchangeCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        registry: Arc<ClientRegistry>,
        keys: Arc<SigningKeys>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            parser: TokenParser::new(Arc::clone(&store), Arc::clone(&keys), Arc::clone(&clock)),
            chain_builder: ActorChainBuilder::new(config.max_chain_depth),
            signer: TokenSigner::new(keys, config.issuer.clone()),
            cache: DecisionCache::new(config.decision_cache_ttl_secs),
            store,
            registry,
            clock,
            config,
        }
    }

    /// Run one exchange. Every outcome, success or not, is recorded in the
    /// audit log with its internal reason code.
    pub fn exchange(
        &self,
        client_id: &str,
        client_secret: &str,
        request: &TokenExchangeRequest,
    ) -> Result<TokenExchangeResponse, ExchangeError> {
        let mut attempt = Attempt {
            subject_token_id: None,
            requested_scope: request.scope.clone(),
            phase: ExchangePhase::Received,
        };

        let result = self.run(client_id, client_secret, request, &mut attempt);

        if let Err(ref err) = result {
            attempt.phase = if err.is_denial() {
                ExchangePhase::Denied
            } else {
                ExchangePhase::Failed
            };
            info!(
                client_id = %client_id,
                phase = %attempt.phase,
                reason = %err.reason_code(),
                "Token exchange rejected"
            );
            let entry = ExchangeLogEntry {
                timestamp: self.clock.now(),
                client_id: client_id.to_string(),
                subject_token_id: attempt.subject_token_id,
                issued_token_id: None,
                outcome: if err.is_denial() {
                    AuditOutcome::Denied
                } else {
                    AuditOutcome::Error
                },
                reason: err.reason_code().to_string(),
                requested_scope: attempt.requested_scope.clone(),
                granted_scope: None,
            };
            // A failed audit append must not mask the original outcome.
            if let Err(audit_err) = self.store.append_audit(entry) {
                warn!(error = %audit_err, "Failed to record audit entry");
            }
        }

        result
    }

    fn run(
        &self,
        client_id: &str,
        client_secret: &str,
        request: &TokenExchangeRequest,
        attempt: &mut Attempt,
    ) -> Result<TokenExchangeResponse, ExchangeError> {
        // Received: parameter validation.
        self.transition(attempt, ExchangePhase::Received);
        if request.grant_type != GRANT_TYPE_TOKEN_EXCHANGE {
            return Err(ExchangeError::Validation(format!(
                "grant_type must be {}",
                GRANT_TYPE_TOKEN_EXCHANGE
            )));
        }
        if request.subject_token.is_empty() {
            return Err(ExchangeError::Validation(
                "subject_token is required".to_string(),
            ));
        }
        if request.subject_token_type.is_empty() {
            return Err(ExchangeError::Validation(
                "subject_token_type is required".to_string(),
            ));
        }
        let issued_kind = match request.requested_token_type.as_deref() {
            None => TokenKind::AccessToken,
            Some(urn) => TokenKind::from_urn(urn)
                .ok_or_else(|| TokenError::UnknownType(urn.to_string()))?,
        };

        // Unknown client and bad secret are indistinguishable externally.
        let Some(client) = self.registry.authenticate(client_id, client_secret) else {
            return Err(PolicyError::Denied.into());
        };

        // Parsing: subject token, then actor token when present.
        self.transition(attempt, ExchangePhase::Parsing);
        let subject = self
            .parser
            .parse(&request.subject_token, &request.subject_token_type)?;
        attempt.subject_token_id = Some(subject.id);

        let actor = match (&request.actor_token, &request.actor_token_type) {
            (None, _) => None,
            (Some(_), None) => {
                return Err(ExchangeError::Validation(
                    "actor_token_type is required when actor_token is present".to_string(),
                ));
            }
            (Some(token), Some(token_type)) => Some(self.parser.parse(token, token_type)?),
        };

        // PolicyEvaluation, under the configured deadline.
        self.transition(attempt, ExchangePhase::PolicyEvaluation);
        let requested_scopes: Option<BTreeSet<String>> = request
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(String::from).collect());
        let requested_audience = request.audience.as_deref().or(request.resource.as_deref());

        let decision = self.evaluate_policy(
            client,
            &subject,
            actor.as_ref(),
            requested_scopes.as_ref(),
            requested_audience,
        )?;

        let (granted_scopes, max_depth_override, ttl_override, policy_id) = match decision {
            Decision::Deny { reason } => return Err(reason.into()),
            Decision::Allow {
                granted_scopes,
                policy_id,
                max_depth,
                token_ttl_secs,
            } => (granted_scopes, max_depth, token_ttl_secs, policy_id),
        };

        // ChainBuilding: depth check before anything is persisted.
        self.transition(attempt, ExchangePhase::ChainBuilding);
        let chain = self
            .chain_builder
            .build(&subject, actor.as_ref(), max_depth_override)?;

        // Issuing: derived token never outlives its source; token row and
        // audit entry commit atomically.
        self.transition(attempt, ExchangePhase::Issuing);
        let now = self.clock.now();
        let ttl = ttl_override.unwrap_or(self.config.default_token_ttl_secs);
        let expires_at = (now + chrono::Duration::seconds(ttl as i64)).min(subject.expires_at);

        let token_id = TokenId::new();
        let access_token = self
            .signer
            .sign(SignRequest {
                token_id,
                subject: subject.subject.as_deref(),
                client_id: &client.client_id,
                audience: requested_audience,
                scopes: &granted_scopes,
                issued_at: now,
                expires_at,
                act: chain.act.clone(),
                may_act: chain.may_act.clone(),
            })
            .map_err(ExchangeError::Storage)?;

        let granted_scope_str = if granted_scopes.is_empty() {
            None
        } else {
            Some(granted_scopes.iter().cloned().collect::<Vec<_>>().join(" "))
        };

        let record = TokenRecord {
            id: token_id,
            kind: issued_kind,
            subject: subject.subject.clone(),
            client_id: client.client_id.clone(),
            scopes: granted_scopes,
            audience: requested_audience.map(String::from),
            issued_at: now,
            expires_at,
            source_token_id: Some(subject.id),
            chain_depth: chain.depth,
            revoked: false,
            revoked_at: None,
            act: chain.act,
            may_act: chain.may_act,
        };

        let entry = ExchangeLogEntry {
            timestamp: now,
            client_id: client.client_id.clone(),
            subject_token_id: Some(subject.id),
            issued_token_id: Some(token_id),
            outcome: AuditOutcome::Success,
            reason: "ISSUED".to_string(),
            requested_scope: attempt.requested_scope.clone(),
            granted_scope: granted_scope_str.clone(),
        };

        self.store
            .insert_token_with_audit(record, entry)
            .map_err(ExchangeError::Storage)?;

        self.transition(attempt, ExchangePhase::Completed);
        info!(
            client_id = %client.client_id,
            subject_token = %subject.id,
            issued_token = %token_id,
            policy = %policy_id,
            depth = chain.depth,
            "Token exchange completed"
        );

        let expires_in = (expires_at - now).num_seconds().max(0) as u64;
        Ok(TokenExchangeResponse {
            access_token,
            issued_token_type: issued_kind.as_urn().to_string(),
            token_type: "Bearer".to_string(),
            expires_in,
            scope: granted_scope_str,
        })
    }

    /// Policy lookup plus pure evaluation, cached and bounded by the
    /// configured deadline. An overrun is surfaced as a timeout, never as a
    /// silent deny.
    fn evaluate_policy(
        &self,
        client: &crate::registry::RegisteredClient,
        subject: &crate::parser::ParsedToken,
        actor: Option<&crate::parser::ParsedToken>,
        requested_scopes: Option<&BTreeSet<String>>,
        requested_audience: Option<&str>,
    ) -> Result<Decision, ExchangeError> {
        let now = self.clock.now();
        let key = DecisionKey {
            requesting_client: client.client_id.clone(),
            subject_client: subject.client_id.clone(),
            subject_scope: subject.scopes.iter().cloned().collect::<Vec<_>>().join(" "),
            requested_scope: requested_scopes
                .map(|s| s.iter().cloned().collect::<Vec<_>>().join(" "))
                .unwrap_or_default(),
            audience: requested_audience.map(String::from),
        };

        if let Some(decision) = self.cache.get(&key, now) {
            debug!(client_id = %client.client_id, "Policy decision served from cache");
            return Ok(decision);
        }

        let started = Instant::now();
        let policies = self
            .store
            .policies_for(&client.client_id, &subject.client_id)
            .map_err(ExchangeError::Storage)?;

        let evaluation = EvaluationRequest {
            client,
            subject,
            actor,
            requested_scopes,
            requested_audience,
        };
        let decision = evaluate(&evaluation, &policies);

        if started.elapsed() > Duration::from_millis(self.config.policy_deadline_ms) {
            return Err(PolicyError::Timeout.into());
        }

        self.cache
            .insert(key, decision.clone(), subject.expires_at, now);
        Ok(decision)
    }

    fn transition(&self, attempt: &mut Attempt, phase: ExchangePhase) {
        debug!(from = %attempt.phase, to = %phase, "Exchange phase transition");
        attempt.phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::keys::KeyConfig;
    use crate::registry::RegisteredClient;
    use crate::store::{ExchangePolicy, PolicyAction};
    use chrono::{DateTime, Utc};
    use tempfile::tempdir;

    const ACCESS_URN: &str = "urn:ietf:params:oauth:token-type:access_token";

    struct Fixture {
        coordinator: ExchangeCoordinator,
        store: Arc<TokenStore>,
        clock: Arc<ManualClock>,
        signer: TokenSigner,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: CoordinatorConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let store = Arc::new(TokenStore::open(dir.path().join("tokens.redb")).unwrap());
        let keys = Arc::new(
            SigningKeys::from_config(&KeyConfig {
                algorithm: "HS256".to_string(),
                secret: Some("coordinator-test-secret-long-enough".to_string()),
                ..Default::default()
            })
            .unwrap(),
        );
        let registry = Arc::new(ClientRegistry::new(vec![RegisteredClient {
            client_id: "client-x".to_string(),
            client_secret: "secret-x".to_string(),
            allowed_scopes: BTreeSet::from(["read".to_string(), "write".to_string()]),
        }]));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let signer = TokenSigner::new(Arc::clone(&keys), config.issuer.clone());
        let coordinator = ExchangeCoordinator::new(
            Arc::clone(&store),
            registry,
            keys,
            Arc::clone(&clock) as Arc<dyn Clock>,
            config,
        );
        Fixture {
            coordinator,
            store,
            clock,
            signer,
            _dir: dir,
        }
    }

    fn seed_root(
        fx: &Fixture,
        issuing_client: &str,
        scopes: &[&str],
        expires_at: DateTime<Utc>,
    ) -> TokenId {
        let id = TokenId::new();
        let record = TokenRecord {
            id,
            kind: TokenKind::AccessToken,
            subject: Some("alice@example.com".to_string()),
            client_id: issuing_client.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            audience: None,
            issued_at: fx.clock.now(),
            expires_at,
            source_token_id: None,
            chain_depth: 0,
            revoked: false,
            revoked_at: None,
            act: None,
            may_act: None,
        };
        fx.store.insert_token(record).unwrap();
        id
    }

    fn seed_policy(fx: &Fixture, requesting: &str, subject: &str, scopes: &[&str]) {
        fx.store
            .put_policy(ExchangePolicy {
                id: format!("policy-{}-{}", requesting, subject),
                requesting_client: requesting.to_string(),
                subject_client: subject.to_string(),
                allowed_scopes: scopes.iter().map(|s| s.to_string()).collect(),
                allowed_audiences: vec!["https://api.example.com/*".to_string()],
                max_depth: None,
                token_ttl_secs: None,
                action: PolicyAction::Allow,
                priority: 0,
            })
            .unwrap();
    }

    fn exchange_request(subject_token: &str, scope: Option<&str>) -> TokenExchangeRequest {
        TokenExchangeRequest {
            grant_type: GRANT_TYPE_TOKEN_EXCHANGE.to_string(),
            subject_token: subject_token.to_string(),
            subject_token_type: ACCESS_URN.to_string(),
            actor_token: None,
            actor_token_type: None,
            requested_token_type: None,
            audience: None,
            resource: None,
            scope: scope.map(String::from),
            client_id: None,
            client_secret: None,
        }
    }

    #[test]
    fn test_scenario_a_downscope_issues_requested_subset() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read", "write"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read", "write"]);

        let response = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), Some("write")),
            )
            .unwrap();

        assert_eq!(response.scope.as_deref(), Some("write"));
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.issued_token_type, ACCESS_URN);

        // The derived record is linked to its source with depth 1.
        let entries = fx.store.audit_for_client("client-x").unwrap();
        assert_eq!(entries.len(), 1);
        let issued = fx
            .store
            .get(entries[0].issued_token_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(issued.source_token_id, Some(root));
        assert_eq!(issued.chain_depth, 1);
        assert!(issued.scopes.is_subset(&BTreeSet::from([
            "read".to_string(),
            "write".to_string()
        ])));
    }

    #[test]
    fn test_scenario_b_insufficient_scope_denied_without_issuance() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read", "write"]);

        let before = fx.store.token_count().unwrap();
        let err = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), Some("write")),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            ExchangeError::Policy(PolicyError::InsufficientScope)
        ));
        assert_eq!(fx.store.token_count().unwrap(), before);

        let entries = fx.store.audit_for_client("client-x").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
        assert_eq!(entries[0].reason, "INSUFFICIENT_SCOPE");
    }

    #[test]
    fn test_scenario_c_depth_bound_stops_sixth_exchange() {
        let fx = fixture(CoordinatorConfig {
            decision_cache_ttl_secs: 0,
            ..CoordinatorConfig::default()
        });
        let expiry = fx.clock.now() + chrono::Duration::seconds(86400);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);
        // Re-exchanging its own derived tokens matches (client-x, client-x).
        seed_policy(&fx, "client-x", "client-x", &["read"]);

        let mut subject = root.to_string_key();
        for expected_depth in 1..=5u32 {
            let response = fx
                .coordinator
                .exchange("client-x", "secret-x", &exchange_request(&subject, None))
                .unwrap();

            let entries = fx.store.audit_for_client("client-x").unwrap();
            let issued_id = entries.last().unwrap().issued_token_id.unwrap();
            let issued = fx.store.get(issued_id).unwrap().unwrap();
            assert_eq!(issued.chain_depth, expected_depth);

            // Exchange the signed form next, exercising the jti lookup.
            subject = response.access_token;
        }

        let before = fx.store.token_count().unwrap();
        let err = fx
            .coordinator
            .exchange("client-x", "secret-x", &exchange_request(&subject, None))
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Chain(crate::error::ChainError::DelegationDepthExceeded {
                depth: 6,
                max: 5
            })
        ));
        assert_eq!(fx.store.token_count().unwrap(), before);
    }

    #[test]
    fn test_generous_policy_depth_still_bounded_by_global_maximum() {
        let fx = fixture(CoordinatorConfig {
            decision_cache_ttl_secs: 0,
            ..CoordinatorConfig::default()
        });
        let expiry = fx.clock.now() + chrono::Duration::seconds(86400);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);

        // Policies asking for more depth than the service allows.
        for (requesting, subject) in [("client-x", "issuer-y"), ("client-x", "client-x")] {
            fx.store
                .put_policy(ExchangePolicy {
                    id: format!("policy-{}-{}", requesting, subject),
                    requesting_client: requesting.to_string(),
                    subject_client: subject.to_string(),
                    allowed_scopes: BTreeSet::from(["read".to_string()]),
                    allowed_audiences: vec![],
                    max_depth: Some(8),
                    token_ttl_secs: None,
                    action: PolicyAction::Allow,
                    priority: 0,
                })
                .unwrap();
        }

        // The override is clamped: exchanges stop at the global depth of 5.
        let mut subject = root.to_string_key();
        let mut issued = Vec::new();
        for _ in 0..5 {
            let response = fx
                .coordinator
                .exchange("client-x", "secret-x", &exchange_request(&subject, None))
                .unwrap();
            let entries = fx.store.audit_for_client("client-x").unwrap();
            issued.push(entries.last().unwrap().issued_token_id.unwrap());
            subject = response.access_token;
        }
        let err = fx
            .coordinator
            .exchange("client-x", "secret-x", &exchange_request(&subject, None))
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Chain(crate::error::ChainError::DelegationDepthExceeded {
                depth: 6,
                max: 5
            })
        ));

        // A cascade sized to the same global bound reaches every descendant.
        let propagator = crate::revocation::RevocationPropagator::new(
            Arc::clone(&fx.store),
            Arc::clone(&fx.clock) as Arc<dyn Clock>,
            5,
        );
        propagator.revoke_cascade(root).unwrap();
        for id in issued {
            assert!(fx.store.get(id).unwrap().unwrap().revoked);
        }
    }

    #[test]
    fn test_policy_deadline_overrun_surfaces_as_timeout() {
        let fx = fixture(CoordinatorConfig {
            policy_deadline_ms: 0,
            decision_cache_ttl_secs: 0,
            ..CoordinatorConfig::default()
        });
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);

        let err = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), None),
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Policy(PolicyError::Timeout)));

        // Never a silent deny: the overrun is attributed in the audit log.
        let entries = fx.store.audit_for_client("client-x").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "POLICY_TIMEOUT");
        assert!(entries[0].issued_token_id.is_none());
    }

    #[test]
    fn test_scenario_d_default_deny_records_one_audit_entry() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        // No policy rows at all.

        let err = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), None),
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Policy(PolicyError::Denied)));

        let entries = fx.store.audit_for_client("client-x").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
        assert_eq!(entries[0].reason, "POLICY_DENIED");
        assert!(entries[0].issued_token_id.is_none());
        assert_eq!(entries[0].subject_token_id, Some(root));
    }

    #[test]
    fn test_derived_token_never_outlives_source() {
        let fx = fixture(CoordinatorConfig {
            default_token_ttl_secs: 86400,
            ..CoordinatorConfig::default()
        });
        let source_expiry = fx.clock.now() + chrono::Duration::seconds(600);
        let root = seed_root(&fx, "issuer-y", &["read"], source_expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);

        let response = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), None),
            )
            .unwrap();

        assert!(response.expires_in <= 600);
        let entries = fx.store.audit_for_client("client-x").unwrap();
        let issued = fx
            .store
            .get(entries[0].issued_token_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(issued.expires_at <= source_expiry);
    }

    #[test]
    fn test_actor_token_recorded_in_act_claim() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);

        // The actor presents its own signed token.
        let actor_id = TokenId::new();
        let actor_jwt = fx
            .signer
            .sign(SignRequest {
                token_id: actor_id,
                subject: Some("svc-b"),
                client_id: "client-x",
                audience: None,
                scopes: &BTreeSet::new(),
                issued_at: fx.clock.now(),
                expires_at: expiry,
                act: None,
                may_act: None,
            })
            .unwrap();

        let mut request = exchange_request(&root.to_string_key(), None);
        request.actor_token = Some(actor_jwt);
        request.actor_token_type = Some("urn:ietf:params:oauth:token-type:jwt".to_string());

        fx.coordinator
            .exchange("client-x", "secret-x", &request)
            .unwrap();

        let entries = fx.store.audit_for_client("client-x").unwrap();
        let issued = fx
            .store
            .get(entries[0].issued_token_id.unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(issued.act.unwrap()["sub"], "svc-b");
    }

    #[test]
    fn test_revoked_subject_fails_exchange() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);
        fx.store.mark_revoked(root, fx.clock.now()).unwrap();

        let err = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), None),
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Token(TokenError::Revoked)));

        let entries = fx.store.audit_for_client("client-x").unwrap();
        assert_eq!(entries[0].outcome, AuditOutcome::Error);
        assert_eq!(entries[0].reason, "TOKEN_REVOKED");
    }

    #[test]
    fn test_unknown_client_denied() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);

        for (id, secret) in [("client-x", "bad-secret"), ("ghost", "secret-x")] {
            let err = fx
                .coordinator
                .exchange(id, secret, &exchange_request(&root.to_string_key(), None))
                .unwrap_err();
            assert!(matches!(err, ExchangeError::Policy(PolicyError::Denied)));
        }
    }

    #[test]
    fn test_invalid_grant_type_rejected() {
        let fx = fixture(CoordinatorConfig::default());
        let mut request = exchange_request("anything", None);
        request.grant_type = "client_credentials".to_string();

        let err = fx
            .coordinator
            .exchange("client-x", "secret-x", &request)
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Validation(_)));
    }

    #[test]
    fn test_audience_checked_against_policy() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(7200);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);

        let mut allowed = exchange_request(&root.to_string_key(), None);
        allowed.audience = Some("https://api.example.com/v1".to_string());
        assert!(fx
            .coordinator
            .exchange("client-x", "secret-x", &allowed)
            .is_ok());

        let mut rejected = exchange_request(&root.to_string_key(), None);
        rejected.audience = Some("https://elsewhere.example.com".to_string());
        let err = fx
            .coordinator
            .exchange("client-x", "secret-x", &rejected)
            .unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Policy(PolicyError::AudienceNotAllowed)
        ));
    }

    #[test]
    fn test_expired_subject_rejected_by_clock() {
        let fx = fixture(CoordinatorConfig::default());
        let expiry = fx.clock.now() + chrono::Duration::seconds(60);
        let root = seed_root(&fx, "issuer-y", &["read"], expiry);
        seed_policy(&fx, "client-x", "issuer-y", &["read"]);
        fx.clock.advance_secs(120);

        let err = fx
            .coordinator
            .exchange(
                "client-x",
                "secret-x",
                &exchange_request(&root.to_string_key(), None),
            )
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Token(TokenError::Expired)));
    }
}
