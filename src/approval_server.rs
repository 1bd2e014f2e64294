//! The loopback-only JSON API a human approval UI polls and posts to.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::approver::persist_decision;
use crate::domain::{Entry, Pattern};
use crate::policy::{PolicyEngine, Scope};
use crate::queue::{DomainQueue, DomainResponse};

#[derive(Clone)]
struct AppState {
    queue: Arc<DomainQueue>,
    policy: Arc<PolicyEngine>,
}

#[derive(Debug, Serialize)]
struct PendingDomainView {
    id: Uuid,
    domain: String,
    project: String,
    cloister: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct PendingDomainsResponse {
    requests: Vec<PendingDomainView>,
}

/// Body of `POST /approve-domain/{id}`. `pattern`, when present, must be a
/// valid `*.suffix` wildcard covering the requested domain; the decision is
/// then recorded against the pattern rather than the bare domain.
#[derive(Debug, Deserialize)]
struct ApproveBody {
    #[serde(default = "default_scope")]
    scope: Scope,
    #[serde(default)]
    pattern: Option<String>,
}

/// Body of `POST /deny-domain/{id}`. `wildcard` converts the requested
/// domain into its `*.suffix` pattern before recording the denial; the
/// domain must have at least three labels for this to be allowed.
#[derive(Debug, Deserialize)]
struct DenyBody {
    #[serde(default = "default_scope")]
    scope: Scope,
    #[serde(default)]
    wildcard: bool,
}

fn default_scope() -> Scope {
    Scope::Once
}

#[derive(Debug, Serialize)]
struct DecisionResponse {
    status: &'static str,
    id: Uuid,
    scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pattern: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    error: String,
}

enum ApiResult {
    Ok(DecisionResponse),
    BadRequest(String),
    NotFound,
    Internal(String),
}

impl IntoResponse for ApiResult {
    fn into_response(self) -> Response {
        match self {
            ApiResult::Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            ApiResult::BadRequest(reason) => (StatusCode::BAD_REQUEST, Json(ApiError { error: reason })).into_response(),
            ApiResult::NotFound => (StatusCode::NOT_FOUND, Json(ApiError { error: "no such pending request".to_string() })).into_response(),
            ApiResult::Internal(reason) => {
                (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError { error: reason })).into_response()
            }
        }
    }
}

/// Build the approval API's router over a shared [`DomainQueue`] and
/// [`PolicyEngine`].
pub fn router(queue: Arc<DomainQueue>, policy: Arc<PolicyEngine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pending-domains", get(pending_domains))
        .route("/approve-domain/{id}", post(approve_domain))
        .route("/deny-domain/{id}", post(deny_domain))
        .route("/pending-commands", get(pending_commands))
        .route("/approve-command/{id}", post(not_implemented))
        .route("/deny-command/{id}", post(not_implemented))
        .with_state(AppState { queue, policy })
}

/// Bind and serve the approval API until the process is asked to shut down.
pub async fn serve(
    listen: SocketAddr,
    queue: Arc<DomainQueue>,
    policy: Arc<PolicyEngine>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(addr = %listen, "approval API listening");
    axum::serve(listener, router(queue, policy))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn pending_domains(State(state): State<AppState>) -> Json<PendingDomainsResponse> {
    let pending = state.queue.pending().await;
    Json(PendingDomainsResponse {
        requests: pending
            .into_iter()
            .map(|r| PendingDomainView {
                id: r.id,
                domain: r.domain,
                project: r.project,
                cloister: r.cloister,
                timestamp: r.created_at,
            })
            .collect(),
    })
}

async fn approve_domain(State(state): State<AppState>, Path(id): Path<Uuid>, Json(body): Json<ApproveBody>) -> ApiResult {
    let Some(request) = state.queue.get(id).await else {
        return ApiResult::NotFound;
    };

    let pattern = match &body.pattern {
        Some(raw) => match validate_wildcard_covers(raw, &request.domain) {
            Ok(pattern) => Some(pattern.to_string()),
            Err(reason) => return ApiResult::BadRequest(reason),
        },
        None => None,
    };

    // Persist before responding, so a 200 here means the decision is
    // durably recorded, not just queued for the blocked CONNECT task to
    // write once it wakes. That task still runs `persist_decision` itself
    // when the oneshot resolves below; for the entry this call just wrote,
    // that second call is a no-op re-add.
    if let Err(err) = persist_decision(
        &state.policy,
        &request.token,
        &request.project,
        &request.domain,
        body.scope,
        true,
        pattern.clone(),
    )
    .await
    {
        return ApiResult::Internal(err.to_string());
    }

    match state
        .queue
        .resolve(id, DomainResponse::Allow(body.scope, pattern.clone()))
        .await
    {
        Some(_) => ApiResult::Ok(DecisionResponse {
            status: "approved",
            id,
            scope: body.scope,
            pattern,
        }),
        None => ApiResult::NotFound,
    }
}

async fn deny_domain(State(state): State<AppState>, Path(id): Path<Uuid>, Json(body): Json<DenyBody>) -> ApiResult {
    let Some(request) = state.queue.get(id).await else {
        return ApiResult::NotFound;
    };

    let pattern = if body.wildcard {
        match wildcard_suffix(&request.domain) {
            Some(Entry::Pattern(p)) => Some(p),
            _ => {
                return ApiResult::BadRequest(
                    "domain has too few labels to widen into a wildcard pattern".to_string(),
                )
            }
        }
    } else {
        None
    };

    if let Err(err) = persist_decision(
        &state.policy,
        &request.token,
        &request.project,
        &request.domain,
        body.scope,
        false,
        pattern.clone(),
    )
    .await
    {
        return ApiResult::Internal(err.to_string());
    }

    match state
        .queue
        .resolve(id, DomainResponse::Deny(body.scope, pattern.clone()))
        .await
    {
        Some(_) => ApiResult::Ok(DecisionResponse {
            status: "denied",
            id,
            scope: body.scope,
            pattern,
        }),
        None => ApiResult::NotFound,
    }
}

/// Parse `raw` as a wildcard pattern and confirm it actually covers
/// `domain`, so a human cannot approve `*.other.com` for a `evil.com`
/// request.
fn validate_wildcard_covers(raw: &str, domain: &str) -> Result<Pattern, String> {
    let pattern = Pattern::parse(raw).ok_or_else(|| format!("{raw:?} is not a valid *.suffix pattern"))?;
    if !pattern.matches(domain) {
        return Err(format!("pattern {pattern} does not cover requested domain {domain}"));
    }
    Ok(pattern)
}

/// A domain has at least 3 labels (e.g. `api.example.com`) before a human
/// may convert its approval into a `*.suffix` pattern; this keeps a human
/// from accidentally allowlisting an entire public suffix like `*.com`.
fn wildcard_suffix(domain: &str) -> Option<Entry> {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 3 {
        return None;
    }
    Some(Entry::Pattern(format!("*.{}", labels[1..].join("."))))
}

async fn pending_commands() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "requests": [] }))
}

async fn not_implemented() -> StatusCode {
    StatusCode::NOT_IMPLEMENTED
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A `PolicyEngine` backed by a fresh temp directory, plus the directory
    /// itself so it isn't dropped (and deleted) before the test finishes.
    fn test_state(queue: Arc<DomainQueue>) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let policy = Arc::new(PolicyEngine::new(
            dir.path().to_path_buf(),
            crate::policy::ProxyPolicy::default(),
        ));
        (dir, AppState { queue, policy })
    }

    #[test]
    fn wildcard_suffix_requires_three_labels() {
        assert!(wildcard_suffix("example.com").is_none());
        assert_eq!(
            wildcard_suffix("api.example.com"),
            Some(Entry::Pattern("*.example.com".to_string()))
        );
        assert_eq!(
            wildcard_suffix("a.b.example.com"),
            Some(Entry::Pattern("*.b.example.com".to_string()))
        );
    }

    #[test]
    fn wildcard_must_cover_requested_domain() {
        assert!(validate_wildcard_covers("*.example.com", "api.example.com").is_ok());
        assert!(validate_wildcard_covers("*.other.com", "api.example.com").is_err());
        assert!(validate_wildcard_covers("not-a-pattern", "api.example.com").is_err());
    }

    #[tokio::test]
    async fn approve_unknown_id_is_not_found() {
        let queue = Arc::new(DomainQueue::new());
        let (_dir, state) = test_state(queue);
        let result = approve_domain(
            State(state),
            Path(Uuid::new_v4()),
            Json(ApproveBody { scope: Scope::Once, pattern: None }),
        )
        .await;
        assert!(matches!(result, ApiResult::NotFound));
    }

    #[tokio::test]
    async fn approve_with_noncovering_pattern_is_bad_request() {
        let queue = Arc::new(DomainQueue::new());
        let rx = queue.submit("tok", "proj", "cloister-1", "api.example.com").await;
        let id = queue.pending().await[0].id;
        let (_dir, state) = test_state(queue.clone());

        let result = approve_domain(
            State(state),
            Path(id),
            Json(ApproveBody {
                scope: Scope::Once,
                pattern: Some("*.other.com".to_string()),
            }),
        )
        .await;
        assert!(matches!(result, ApiResult::BadRequest(_)));
        // The request is still pending; it was never resolved.
        assert_eq!(queue.pending().await.len(), 1);
        drop(rx);
    }

    #[tokio::test]
    async fn approve_persists_global_decision_before_responding() {
        let queue = Arc::new(DomainQueue::new());
        let rx = queue.submit("tok", "proj", "cloister-1", "example.com").await;
        let id = queue.pending().await[0].id;
        let (_dir, state) = test_state(queue);
        let policy = state.policy.clone();

        let result = approve_domain(
            State(state),
            Path(id),
            Json(ApproveBody { scope: Scope::Global, pattern: None }),
        )
        .await;
        assert!(matches!(result, ApiResult::Ok(_)));

        // The write is already durable by the time the handler returns, not
        // only once the blocked CONNECT task wakes from the oneshot below.
        assert_eq!(policy.check("tok", "proj", "example.com").await, crate::policy::Decision::Allow);
        drop(rx);
    }

    #[tokio::test]
    async fn approve_with_covering_pattern_resolves_as_wildcard() {
        let queue = Arc::new(DomainQueue::new());
        let rx = queue.submit("tok", "proj", "cloister-1", "api.example.com").await;
        let id = queue.pending().await[0].id;
        let (_dir, state) = test_state(queue.clone());

        let result = approve_domain(
            State(state),
            Path(id),
            Json(ApproveBody {
                scope: Scope::Global,
                pattern: Some("*.example.com".to_string()),
            }),
        )
        .await;
        assert!(matches!(result, ApiResult::Ok(_)));
        assert_eq!(
            rx.await.unwrap(),
            DomainResponse::Allow(Scope::Global, Some("*.example.com".to_string()))
        );
    }

    #[tokio::test]
    async fn deny_resolves_pending_request() {
        let queue = Arc::new(DomainQueue::new());
        let rx = queue.submit("tok", "proj", "cloister-1", "example.com").await;
        let id = queue.pending().await[0].id;
        let (_dir, state) = test_state(queue.clone());

        let result = deny_domain(
            State(state),
            Path(id),
            Json(DenyBody { scope: Scope::Session, wildcard: false }),
        )
        .await;
        assert!(matches!(result, ApiResult::Ok(_)));
        assert_eq!(rx.await.unwrap(), DomainResponse::Deny(Scope::Session, None));
    }

    #[tokio::test]
    async fn deny_wildcard_on_two_label_domain_is_bad_request() {
        let queue = Arc::new(DomainQueue::new());
        let rx = queue.submit("tok", "proj", "cloister-1", "example.com").await;
        let id = queue.pending().await[0].id;
        let (_dir, state) = test_state(queue.clone());

        let result = deny_domain(
            State(state),
            Path(id),
            Json(DenyBody { scope: Scope::Once, wildcard: true }),
        )
        .await;
        assert!(matches!(result, ApiResult::BadRequest(_)));
        drop(rx);
    }

    #[tokio::test]
    async fn pending_domains_includes_cloister_and_timestamp() {
        let queue = Arc::new(DomainQueue::new());
        queue.submit("tok", "proj", "cloister-7", "example.com").await;
        let (_dir, state) = test_state(queue);

        let Json(body) = pending_domains(State(state)).await;
        assert_eq!(body.requests.len(), 1);
        assert_eq!(body.requests[0].cloister, "cloister-7");
        assert!(body.requests[0].timestamp > 0);
    }
}
