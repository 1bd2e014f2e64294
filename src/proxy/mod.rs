//! The CONNECT-only forward proxy: accept loop, auth, policy dispatch, and
//! tunneling.

pub mod server;
pub mod tunnel;

pub use server::ProxyServer;
pub use tunnel::{TcpTunnelHandler, TunnelHandler};
