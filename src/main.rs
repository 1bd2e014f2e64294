//! guardian - Main entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use guardian::approval_server;
use guardian::config::{self, DEFAULT_APPROVAL_TIMEOUT};
use guardian::decisions::DecisionStore;
use guardian::domain::DomainSet;
use guardian::policy::{PolicyEngine, ProxyPolicy};
use guardian::proxy::{ProxyServer, TcpTunnelHandler};
use guardian::queue::DomainQueue;
use guardian::reload::Reloader;
use guardian::tokens::TokenRegistry;

#[derive(Debug, Parser)]
#[command(name = "guardian", about = "Local security gateway for sandboxed agent egress")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the proxy and approval servers.
    Serve {
        /// Override the config root (defaults to $XDG_CONFIG_HOME/guardian).
        #[arg(long, env = "GUARDIAN_CONFIG_ROOT")]
        config_root: Option<PathBuf>,

        /// Address the CONNECT proxy listens on.
        #[arg(long, env = "GUARDIAN_LISTEN", default_value = "127.0.0.1:8888")]
        listen: SocketAddr,

        /// Address the human approval API listens on.
        #[arg(long, env = "GUARDIAN_APPROVAL_LISTEN", default_value = "127.0.0.1:8889")]
        approval_listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config_root,
            listen,
            approval_listen,
        } => serve(config_root, listen, approval_listen).await,
    }
}

async fn serve(
    config_root_override: Option<PathBuf>,
    listen: SocketAddr,
    approval_listen: SocketAddr,
) -> anyhow::Result<()> {
    let config_root = config::resolve_config_root(config_root_override)?;
    tracing::info!(path = %config_root.display(), "using config root");

    let store = DecisionStore::new(&config_root);
    store.migrate_legacy_dir().await?;

    let global_static = config::load_global_config(&config_root).await?;
    let approval_timeout = global_static
        .proxy
        .approval_timeout
        .as_deref()
        .and_then(config::parse_duration)
        .unwrap_or(DEFAULT_APPROVAL_TIMEOUT);

    let seed = ProxyPolicy {
        allow: config::default_allow_set(),
        deny: DomainSet::empty(),
    };
    let policy = Arc::new(PolicyEngine::new(config_root.clone(), seed));
    policy.reload_global().await?;

    let tokens = Arc::new(TokenRegistry::new());
    tokens.subscribe(policy.clone()).await;

    let queue = Arc::new(DomainQueue::new());
    let approver = Arc::new(guardian::approver::QueueDomainApprover::new(
        queue.clone(),
        policy.clone(),
        approval_timeout,
    ));
    let tunnel = Arc::new(TcpTunnelHandler);

    let proxy = ProxyServer::new(tokens.clone(), policy.clone(), approver, tunnel);
    let reloader = Reloader::new(policy.clone());

    let (proxy_shutdown_tx, proxy_shutdown_rx) = tokio::sync::oneshot::channel();
    let (reload_shutdown_tx, reload_shutdown_rx) = tokio::sync::oneshot::channel();
    let (approval_shutdown_tx, approval_shutdown_rx) = tokio::sync::oneshot::channel();

    let proxy_task = tokio::spawn(async move { proxy.serve(listen, proxy_shutdown_rx).await });
    let reload_task = tokio::spawn(async move { reloader.run(reload_shutdown_rx).await });
    let approval_policy = policy.clone();
    let approval_task = tokio::spawn(async move {
        approval_server::serve(approval_listen, queue, approval_policy, async {
            let _ = approval_shutdown_rx.await;
        })
        .await
    });

    wait_for_shutdown_signal().await;
    tracing::info!("shutdown requested, draining connections");

    let _ = proxy_shutdown_tx.send(());
    let _ = reload_shutdown_tx.send(());
    let _ = approval_shutdown_tx.send(());

    let grace = Duration::from_secs(10);
    let _ = tokio::time::timeout(grace, async {
        let _ = proxy_task.await;
        let _ = reload_task.await;
        let _ = approval_task.await;
    })
    .await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
