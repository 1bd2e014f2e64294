//! Bridges a proxy request's "ask a human" outcome into an actual decision,
//! by enqueuing it on the [`DomainQueue`] and waiting for a verdict.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::Entry;
use crate::error::ApprovalError;
use crate::policy::{PolicyEngine, RecordDecisionRequest, Scope};
use crate::queue::{spawn_deadline, DomainQueue, DomainResponse};

/// Validate a CONNECT target's hostname before it is ever shown to a human
/// or recorded as a decision. Rejects scheme prefixes, path/query
/// characters, and an empty suffix.
pub fn validate_domain_format(domain: &str) -> Result<(), ApprovalError> {
    if domain.is_empty() {
        return Err(ApprovalError::InvalidDomainFormat {
            reason: "domain is empty".to_string(),
        });
    }
    if domain.contains("://") {
        return Err(ApprovalError::InvalidDomainFormat {
            reason: "domain must not include a URL scheme".to_string(),
        });
    }
    const FORBIDDEN: &[char] = &['/', '\\', '?', '#', '@', ' ', '\t', '\n'];
    if domain.chars().any(|c| FORBIDDEN.contains(&c)) {
        return Err(ApprovalError::InvalidDomainFormat {
            reason: "domain contains characters not valid in a hostname".to_string(),
        });
    }
    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(ApprovalError::InvalidDomainFormat {
            reason: "domain must not start or end with a dot".to_string(),
        });
    }
    Ok(())
}

/// Ports that are never tunneled regardless of domain policy: internal
/// databases, remote-admin protocols, and file-sharing services an agent
/// has no business reaching directly over an HTTPS egress path.
pub const FORBIDDEN_PORTS: &[u16] = &[
    21, 22, 23, 25, 53, 110, 143, 389, 465, 587, 636, 993, 995, 3306, 5432, 6379, 27017,
];

/// Reject a CONNECT target's port before it is queued or policy-checked.
pub fn validate_port(port: u16) -> Result<(), ApprovalError> {
    if FORBIDDEN_PORTS.contains(&port) {
        return Err(ApprovalError::InvalidDomainFormat {
            reason: format!("port {port} is not permitted for proxied connections"),
        });
    }
    Ok(())
}

/// Escalates an as-yet-undecided domain to a human and returns once it is
/// allowed, denied, or the deadline elapses.
#[async_trait]
pub trait DomainApprover: Send + Sync {
    async fn request_approval(
        &self,
        token: &str,
        project: &str,
        cloister: &str,
        domain: &str,
    ) -> Result<(), ApprovalError>;
}

/// The production [`DomainApprover`]: enqueues on a [`DomainQueue`], applies
/// the configured timeout, and persists the verdict through the policy
/// engine.
pub struct QueueDomainApprover {
    queue: Arc<DomainQueue>,
    policy: Arc<PolicyEngine>,
    timeout: Duration,
}

impl QueueDomainApprover {
    pub fn new(queue: Arc<DomainQueue>, policy: Arc<PolicyEngine>, timeout: Duration) -> Self {
        Self { queue, policy, timeout }
    }
}

#[async_trait]
impl DomainApprover for QueueDomainApprover {
    async fn request_approval(
        &self,
        token: &str,
        project: &str,
        cloister: &str,
        domain: &str,
    ) -> Result<(), ApprovalError> {
        validate_domain_format(domain)?;

        let rx = self.queue.submit(token, project, cloister, domain).await;
        let pending = self
            .queue
            .pending()
            .await
            .into_iter()
            .find(|r| r.token == token && r.domain == domain);
        if let Some(request) = pending {
            spawn_deadline(self.queue.clone(), request.id, self.timeout);
        }

        let response = rx.await.unwrap_or(DomainResponse::TimedOut);

        match response {
            DomainResponse::TimedOut => Err(ApprovalError::Timeout),
            // The approval API persists the decision itself before resolving
            // the queue (so its HTTP response reflects a durable write); this
            // second call is an idempotent no-op for that path and the only
            // persistence for any other caller that resolves the queue
            // directly (e.g. a future non-HTTP approval source).
            DomainResponse::Deny(scope, pattern) => {
                persist_decision(&self.policy, token, project, domain, scope, false, pattern).await?;
                Err(ApprovalError::Denied)
            }
            DomainResponse::Allow(scope, pattern) => {
                persist_decision(&self.policy, token, project, domain, scope, true, pattern).await?;
                Ok(())
            }
        }
    }
}

/// Record a human's verdict through the policy engine: build the `Entry`
/// from an explicit wildcard pattern or the bare domain, warm the
/// project-tier cache for session-scope allows, then persist at the
/// requested scope. Shared by the blocked-CONNECT path in
/// [`QueueDomainApprover`] and the approval HTTP API, which both need to
/// turn the same verdict into policy state.
pub async fn persist_decision(
    policy: &PolicyEngine,
    token: &str,
    project: &str,
    domain: &str,
    scope: Scope,
    allowed: bool,
    pattern: Option<String>,
) -> Result<(), ApprovalError> {
    let entry = match pattern {
        Some(p) => Entry::Pattern(p),
        None => Entry::Domain(domain.to_string()),
    };

    // Session-scope approvals also warm the project-tier cache so later
    // requests from other tokens in the same project skip the human
    // loop; denials deliberately do not (see DESIGN.md).
    if matches!(scope, Scope::Session) && allowed {
        policy.warm_project_cache(project, &entry).await;
    }

    policy
        .record_decision(RecordDecisionRequest {
            token: token.to_string(),
            project: project.to_string(),
            entry,
            scope,
            allowed,
        })
        .await
        .map_err(ApprovalError::Persist)
}
