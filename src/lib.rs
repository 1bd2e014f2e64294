//! A local security gateway mediating outbound HTTPS traffic from sandboxed
//! AI agent containers through an HTTP CONNECT proxy, with layered
//! allow/deny policy and human-approval escalation.

pub mod approval_server;
pub mod approver;
pub mod config;
pub mod decisions;
pub mod domain;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod queue;
pub mod reload;
pub mod tokens;
