//! The pending-approval queue: one entry per `(token, domain)` pair awaiting
//! a human decision, with fan-out so duplicate requests share one outcome.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::policy::Scope;

/// A human's verdict on a pending domain request.
///
/// The `Option<String>` carried by `Allow`/`Deny` is an explicit `*.suffix`
/// wildcard pattern to record instead of the bare requested domain; `None`
/// records the exact domain as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainResponse {
    Allow(Scope, Option<String>),
    Deny(Scope, Option<String>),
    TimedOut,
}

/// A domain awaiting approval, as surfaced to the approval API.
#[derive(Debug, Clone)]
pub struct DomainRequest {
    pub id: Uuid,
    pub token: String,
    pub project: String,
    pub cloister: String,
    pub domain: String,
    pub created_at: u64,
}

struct PendingEntry {
    request: DomainRequest,
    waiters: Vec<oneshot::Sender<DomainResponse>>,
}

/// Deduplicates concurrent requests for the same `(token, domain)` and fans
/// the eventual human decision out to every waiter.
#[derive(Default)]
pub struct DomainQueue {
    by_key: Mutex<HashMap<(String, String), Uuid>>,
    by_id: Mutex<HashMap<Uuid, PendingEntry>>,
}

impl DomainQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request (or join an existing one for the same token+domain)
    /// and return a receiver that resolves once a human decides or the
    /// caller-supplied deadline elapses.
    pub async fn submit(
        &self,
        token: &str,
        project: &str,
        cloister: &str,
        domain: &str,
    ) -> oneshot::Receiver<DomainResponse> {
        let key = (token.to_string(), domain.to_string());
        let (tx, rx) = oneshot::channel();

        let mut by_key = self.by_key.lock().await;
        let mut by_id = self.by_id.lock().await;

        if let Some(id) = by_key.get(&key)
            && let Some(entry) = by_id.get_mut(id)
        {
            entry.waiters.push(tx);
            return rx;
        }

        let id = Uuid::new_v4();
        by_key.insert(key, id);
        by_id.insert(
            id,
            PendingEntry {
                request: DomainRequest {
                    id,
                    token: token.to_string(),
                    project: project.to_string(),
                    cloister: cloister.to_string(),
                    domain: domain.to_string(),
                    created_at: unix_seconds_now(),
                },
                waiters: vec![tx],
            },
        );
        rx
    }

    /// Snapshot of requests currently awaiting a decision, oldest-insertion
    /// order is not guaranteed (backed by a map).
    pub async fn pending(&self) -> Vec<DomainRequest> {
        self.by_id
            .lock()
            .await
            .values()
            .map(|entry| entry.request.clone())
            .collect()
    }

    pub async fn get(&self, id: Uuid) -> Option<DomainRequest> {
        self.by_id.lock().await.get(&id).map(|entry| entry.request.clone())
    }

    /// Resolve a pending request, notifying every waiter and removing it
    /// from the queue. Returns `None` if `id` is not (or no longer) pending.
    pub async fn resolve(&self, id: Uuid, response: DomainResponse) -> Option<DomainRequest> {
        let mut by_id = self.by_id.lock().await;
        let entry = by_id.remove(&id)?;
        let mut by_key = self.by_key.lock().await;
        by_key.remove(&(entry.request.token.clone(), entry.request.domain.clone()));
        drop(by_key);

        for waiter in entry.waiters {
            let _ = waiter.send(response);
        }
        Some(entry.request)
    }

    /// Resolve with a timeout response if `id` is still pending; used by the
    /// per-request deadline task. A no-op if the request already resolved.
    pub async fn expire(&self, id: Uuid) {
        self.resolve(id, DomainResponse::TimedOut).await;
    }
}

/// Spawn a timer that expires `id` after `deadline` unless it has already
/// been resolved.
pub fn spawn_deadline(queue: Arc<DomainQueue>, id: Uuid, deadline: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        queue.expire(id).await;
    });
}

fn unix_seconds_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
