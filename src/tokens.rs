//! Maps opaque proxy tokens to the project/cloister they authenticate.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

/// The project and cloister (sandbox instance) a token was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub project: String,
    pub cloister: String,
}

/// Notified when a token is revoked, so token-tier policy state can be
/// garbage-collected. Implemented by `PolicyEngine`.
#[async_trait::async_trait]
pub trait RevocationSubscriber: Send + Sync {
    async fn on_revoke(&self, token: &str);
}

/// In-memory registry of live tokens. Registration is idempotent; revocation
/// notifies a subscriber so dependent caches clear their token-tier state.
#[derive(Default)]
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, TokenInfo>>,
    subscribers: RwLock<Vec<Arc<dyn RevocationSubscriber>>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber to be notified on every `revoke`.
    pub async fn subscribe(&self, subscriber: Arc<dyn RevocationSubscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Register `token -> info`. Re-registering the same token overwrites
    /// its info (idempotent by token).
    pub async fn register(&self, token: impl Into<String>, info: TokenInfo) {
        self.tokens.write().await.insert(token.into(), info);
    }

    /// Look up a token, returning its info and whether it was found.
    pub async fn lookup(&self, token: &str) -> Option<TokenInfo> {
        self.tokens.read().await.get(token).cloned()
    }

    /// Snapshot of all registered tokens.
    pub async fn list(&self) -> Vec<(String, TokenInfo)> {
        self.tokens
            .read()
            .await
            .iter()
            .map(|(t, i)| (t.clone(), i.clone()))
            .collect()
    }

    /// Remove a token and notify subscribers.
    pub async fn revoke(&self, token: &str) {
        self.tokens.write().await.remove(token);
        let subscribers = self.subscribers.read().await;
        for subscriber in subscribers.iter() {
            subscriber.on_revoke(token).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSubscriber(Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl RevocationSubscriber for CountingSubscriber {
        async fn on_revoke(&self, _token: &str) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_then_lookup_roundtrips() {
        let registry = TokenRegistry::new();
        registry
            .register(
                "tok-1",
                TokenInfo {
                    project: "p1".to_string(),
                    cloister: "c1".to_string(),
                },
            )
            .await;
        let info = registry.lookup("tok-1").await.unwrap();
        assert_eq!(info.project, "p1");
        assert_eq!(info.cloister, "c1");
        assert!(registry.lookup("missing").await.is_none());
    }

    #[tokio::test]
    async fn revoke_notifies_subscribers_and_removes_token() {
        let registry = TokenRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        registry
            .subscribe(Arc::new(CountingSubscriber(count.clone())))
            .await;
        registry
            .register(
                "tok-1",
                TokenInfo {
                    project: "p1".to_string(),
                    cloister: "c1".to_string(),
                },
            )
            .await;

        registry.revoke("tok-1").await;
        assert!(registry.lookup("tok-1").await.is_none());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_is_idempotent_by_token() {
        let registry = TokenRegistry::new();
        registry
            .register(
                "tok-1",
                TokenInfo {
                    project: "p1".to_string(),
                    cloister: "c1".to_string(),
                },
            )
            .await;
        registry
            .register(
                "tok-1",
                TokenInfo {
                    project: "p2".to_string(),
                    cloister: "c2".to_string(),
                },
            )
            .await;
        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(registry.lookup("tok-1").await.unwrap().project, "p2");
    }
}
