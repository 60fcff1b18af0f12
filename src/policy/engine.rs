//! Scope policy evaluation.
//!
//! `evaluate` is a pure function from (request, policy rows) to a decision:
//! no I/O, no logging, no clock. Identical inputs always produce identical
//! decisions, which is what makes the decision cache and property tests
//! sound. Default-deny is unconditional: no matching policy means no
//! exchange.

use std::collections::BTreeSet;

use crate::error::PolicyError;
use crate::parser::ParsedToken;
use crate::registry::RegisteredClient;
use crate::store::{ExchangePolicy, PolicyAction};

/// Inputs to one policy evaluation.
pub struct EvaluationRequest<'a> {
    /// The authenticated requesting client.
    pub client: &'a RegisteredClient,
    /// Validated subject token.
    pub subject: &'a ParsedToken,
    /// Validated actor token, metadata only.
    pub actor: Option<&'a ParsedToken>,
    /// Requested scopes, when the caller narrowed them.
    pub requested_scopes: Option<&'a BTreeSet<String>>,
    /// Requested audience or resource.
    pub requested_audience: Option<&'a str>,
}

/// Outcome of policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow {
        /// Scopes the exchange may grant.
        granted_scopes: BTreeSet<String>,
        /// The authoritative policy.
        policy_id: String,
        /// Policy override for maximum chain depth.
        max_depth: Option<u32>,
        /// Policy override for issued-token TTL.
        token_ttl_secs: Option<u64>,
    },
    Deny {
        reason: PolicyError,
    },
}

impl Decision {
    pub fn deny(reason: PolicyError) -> Self {
        Decision::Deny { reason }
    }
}

/// Evaluate an exchange request against the supplied policy rows.
///
/// Rows are selected on `(requesting_client, subject.client_id)` — callers
/// pass pre-filtered rows, but the filter is re-applied here so the function
/// stays correct on its own. Highest priority wins; ties break to the lowest
/// policy id so the outcome never depends on storage iteration order.
pub fn evaluate(request: &EvaluationRequest<'_>, policies: &[ExchangePolicy]) -> Decision {
    let mut matching: Vec<&ExchangePolicy> = policies
        .iter()
        .filter(|p| {
            p.requesting_client == request.client.client_id
                && p.subject_client == request.subject.client_id
        })
        .collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let Some(policy) = matching.first() else {
        return Decision::deny(PolicyError::Denied);
    };

    if policy.action == PolicyAction::Deny {
        return Decision::deny(PolicyError::Denied);
    }

    // Candidate scope: the intersection of everything that constrains the
    // grant. A derived token can never carry a scope its source lacks.
    let mut candidate: BTreeSet<String> = request
        .subject
        .scopes
        .intersection(&policy.allowed_scopes)
        .filter(|s| request.client.allowed_scopes.contains(*s))
        .cloned()
        .collect();

    if let Some(requested) = request.requested_scopes {
        candidate = candidate.intersection(requested).cloned().collect();
        if !requested.is_empty() && candidate.is_empty() {
            // Distinct from Denied: an allowing policy existed, but the
            // requested scopes have no overlap with what it can grant.
            return Decision::deny(PolicyError::InsufficientScope);
        }
    }

    if let Some(audience) = request.requested_audience {
        if !policy.audience_allowed(audience) {
            return Decision::deny(PolicyError::AudienceNotAllowed);
        }
    }

    Decision::Allow {
        granted_scopes: candidate,
        policy_id: policy.id.clone(),
        max_depth: policy.max_depth,
        token_ttl_secs: policy.token_ttl_secs,
    }
}
