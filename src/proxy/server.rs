//! The CONNECT-only forward proxy front-end: accepts connections, checks
//! `Proxy-Authorization`, consults the policy engine, escalates to a human
//! when undecided, and hands approved CONNECTs to a [`TunnelHandler`].

use std::net::SocketAddr;
use std::sync::Arc;

use base64::Engine;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;

use crate::approver::{self, DomainApprover};
use crate::domain::normalize_host;
use crate::error::ProxyError;
use crate::policy::{Decision, PolicyEngine};
use crate::proxy::tunnel::TunnelHandler;
use crate::tokens::TokenRegistry;

struct ProxyState {
    tokens: Arc<TokenRegistry>,
    policy: Arc<PolicyEngine>,
    approver: Arc<dyn DomainApprover>,
    tunnel: Arc<dyn TunnelHandler>,
}

/// The CONNECT proxy's accept loop.
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    pub fn new(
        tokens: Arc<TokenRegistry>,
        policy: Arc<PolicyEngine>,
        approver: Arc<dyn DomainApprover>,
        tunnel: Arc<dyn TunnelHandler>,
    ) -> Self {
        Self {
            state: Arc::new(ProxyState {
                tokens,
                policy,
                approver,
                tunnel,
            }),
        }
    }

    /// Bind and serve until `shutdown` resolves. Each in-flight tunnel
    /// continues independently of the accept loop stopping.
    pub async fn serve(
        &self,
        listen: SocketAddr,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(listen).await?;
        tracing::info!(addr = %listen, "proxy listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = state.clone();
                            async move { Ok::<_, std::convert::Infallible>(handle(req, state).await) }
                        });
                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            tracing::debug!(peer = %peer, error = %err, "connection closed");
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("proxy shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle(req: Request<Incoming>, state: Arc<ProxyState>) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    if req.method() != Method::CONNECT {
        return error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ProxyError::MethodNotAllowed(req.method().to_string()),
        );
    }

    let target = match req.uri().authority().map(|a| a.to_string()) {
        Some(t) => t,
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &ProxyError::MalformedTarget("missing authority".to_string()),
            )
        }
    };

    let token = match extract_token(req.headers()) {
        Ok(token) => token,
        Err(err) => return auth_challenge(&err),
    };

    let token_info = match state.tokens.lookup(&token).await {
        Some(info) => info,
        None => return auth_challenge(&ProxyError::AuthInvalid),
    };

    // First sighting of this project: load its on-disk state so
    // project-scoped entries apply without waiting for a SIGHUP.
    if let Err(err) = state.policy.ensure_project(&token_info.project).await {
        tracing::warn!(project = %token_info.project, error = %err, "failed to load project policy, falling back to ask-human");
    }

    let (host, port) = match split_target(&target) {
        Some(pair) => pair,
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &ProxyError::MalformedTarget(target.clone()),
            )
        }
    };

    if let Err(err) = approver::validate_port(port) {
        tracing::info!(token = %token, host = %host, port, "connect rejected: forbidden port");
        return error_response(StatusCode::FORBIDDEN, &ProxyError::NotApproved(err));
    }

    let decision = state.policy.check(&token, &token_info.project, host).await;

    match decision {
        Decision::Deny(reason) => {
            tracing::info!(token = %token, host = %host, reason = %reason, "connect denied by policy");
            error_response(StatusCode::FORBIDDEN, &ProxyError::PolicyDenied(reason))
        }
        Decision::Allow => tunnel(req, target, state).await,
        Decision::AskHuman => {
            let normalized = normalize_host(host);
            match state
                .approver
                .request_approval(&token, &token_info.project, &token_info.cloister, &normalized)
                .await
            {
                Ok(()) => tunnel(req, target, state).await,
                Err(err) => error_response(StatusCode::FORBIDDEN, &ProxyError::NotApproved(err)),
            }
        }
    }
}

/// Split a CONNECT authority (`host:port`) into its parts.
fn split_target(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

async fn tunnel(
    req: Request<Incoming>,
    target: String,
    state: Arc<ProxyState>,
) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    let upstream = match state.tunnel.dial(&target).await {
        Ok(stream) => stream,
        Err(err @ ProxyError::UpstreamTimeout) => {
            tracing::info!(target = %target, "upstream connect timed out");
            return error_response(StatusCode::GATEWAY_TIMEOUT, &err);
        }
        Err(err) => {
            tracing::warn!(target = %target, error = %err, "upstream connect failed");
            return error_response(StatusCode::BAD_GATEWAY, &err);
        }
    };

    let ok = make_response(StatusCode::OK);
    let tunnel = state.tunnel.clone();
    tokio::spawn(async move {
        tunnel.relay(req, upstream, target).await;
    });
    ok
}

fn extract_token(headers: &hyper::HeaderMap) -> Result<String, ProxyError> {
    let header = headers
        .get(hyper::header::PROXY_AUTHORIZATION)
        .ok_or(ProxyError::AuthMissing)?;
    let value = header.to_str().map_err(|_| ProxyError::AuthMissing)?;
    let encoded = value.strip_prefix("Basic ").ok_or(ProxyError::AuthMissing)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| ProxyError::AuthMissing)?;
    let decoded = String::from_utf8(decoded).map_err(|_| ProxyError::AuthMissing)?;
    // The token is carried as the Basic auth password; username is ignored.
    let (_, token) = decoded.split_once(':').ok_or(ProxyError::AuthMissing)?;
    if token.is_empty() {
        return Err(ProxyError::AuthMissing);
    }
    Ok(token.to_string())
}

fn error_response(status: StatusCode, err: &ProxyError) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            http_body_util::Full::new(Bytes::from(err.to_string()))
                .map_err(|_| unreachable!())
                .boxed(),
        )
        .unwrap_or_else(|_| make_response(StatusCode::INTERNAL_SERVER_ERROR))
}

/// A 407 response carries `Proxy-Authenticate` so a compliant client knows
/// to retry with credentials instead of treating this as a hard failure.
fn auth_challenge(err: &ProxyError) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .header("Content-Type", "text/plain")
        .header("Proxy-Authenticate", "Basic realm=\"guardian\"")
        .body(
            http_body_util::Full::new(Bytes::from(err.to_string()))
                .map_err(|_| unreachable!())
                .boxed(),
        )
        .unwrap_or_else(|_| make_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn make_response(status: StatusCode) -> Response<BoxBody<Bytes, std::convert::Infallible>> {
    Response::builder()
        .status(status)
        .body(Empty::new().map_err(|_| unreachable!()).boxed())
        .unwrap_or_else(|_| {
            let mut resp = Response::new(Empty::new().map_err(|_| unreachable!()).boxed());
            *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            resp
        })
}
