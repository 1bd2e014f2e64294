//! Error types for the gateway's components.

use thiserror::Error;

/// Errors raised while loading or writing on-disk configuration / decisions.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config root could not be resolved from the environment.
    #[error("could not resolve config root: {reason}")]
    RootUnresolved {
        /// Reason the root could not be determined.
        reason: String,
    },

    /// A YAML document failed to parse (malformed syntax or unknown fields).
    #[error("failed to parse '{path}': {reason}")]
    Parse {
        /// Path of the file that failed to parse.
        path: String,
        /// Underlying parser message.
        reason: String,
    },

    /// I/O error while reading or writing a config/decision file.
    #[error("I/O error on '{path}': {source}")]
    Io {
        /// Path involved in the failed operation.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the policy engine.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Reloading a tier failed; previous state is left in place.
    #[error("reload failed: {0}")]
    Reload(#[from] ConfigError),

    /// Persisting a decision to disk failed; in-memory state is unchanged.
    #[error("failed to record decision: {0}")]
    RecordDecision(#[source] ConfigError),

    /// The requested project is not known and could not be loaded.
    #[error("unknown project '{project}'")]
    UnknownProject {
        /// Project name that was requested.
        project: String,
    },
}

/// Errors raised while bridging a proxy request to a human decision.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// The requested domain does not meet the wire-format requirements.
    #[error("invalid domain format: {reason}")]
    InvalidDomainFormat {
        /// Human-readable reason the domain was rejected.
        reason: String,
    },

    /// The approval request exceeded its deadline without a human response.
    #[error("approval timed out")]
    Timeout,

    /// A human explicitly denied the request.
    #[error("approval denied")]
    Denied,

    /// Persisting the resulting decision failed.
    #[error("failed to persist approval outcome: {0}")]
    Persist(#[from] PolicyError),
}

/// Errors surfaced by the CONNECT proxy front-end.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// `Proxy-Authorization` header missing or malformed.
    #[error("missing or malformed Proxy-Authorization header")]
    AuthMissing,

    /// The decoded token is not registered.
    #[error("unknown or revoked token")]
    AuthInvalid,

    /// A method other than CONNECT was used.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// The CONNECT target could not be split into host/port.
    #[error("malformed CONNECT target: {0}")]
    MalformedTarget(String),

    /// Policy evaluation returned `Deny`.
    #[error("policy denied: {0}")]
    PolicyDenied(String),

    /// Escalation to a human resulted in denial or timeout.
    #[error("not approved: {0}")]
    NotApproved(#[from] ApprovalError),

    /// Upstream TCP dial exceeded the connect timeout.
    #[error("upstream connect timed out")]
    UpstreamTimeout,

    /// Upstream TCP dial failed for a reason other than timeout.
    #[error("upstream connect failed: {0}")]
    UpstreamFailed(#[source] std::io::Error),

    /// Taking over the client connection after the 200 response failed.
    #[error("failed to hijack client connection: {0}")]
    Hijack(#[source] std::io::Error),
}
