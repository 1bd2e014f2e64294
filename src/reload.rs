//! SIGHUP-triggered config/decision reload, run alongside the proxy and
//! approval servers without disturbing in-flight tunnels.

use std::sync::Arc;

use crate::policy::PolicyEngine;

/// Listens for SIGHUP and reloads all policy tiers from disk on each signal.
pub struct Reloader {
    policy: Arc<PolicyEngine>,
}

impl Reloader {
    pub fn new(policy: Arc<PolicyEngine>) -> Self {
        Self { policy }
    }

    /// Run until `shutdown` resolves. Each SIGHUP triggers a full reload;
    /// reload failures are logged and leave prior in-memory state in place.
    pub async fn run(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        #[cfg(unix)]
        {
            let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGHUP handler");
                    let _ = &mut shutdown.await;
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        tracing::info!("SIGHUP received, reloading policy");
                        if let Err(err) = self.policy.reload_all().await {
                            tracing::error!(error = %err, "policy reload failed");
                        }
                    }
                    _ = &mut shutdown => return,
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = shutdown.await;
        }
    }
}
