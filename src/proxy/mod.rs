//! HTTP/HTTPS proxy server
//!
//! The listener accepts HTTP/1.1 connections; CONNECT requests become raw
//! byte tunnels, everything else is forwarded over per-IP pooled transports.

pub mod handler;
pub mod middleware;
pub mod request_id;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use handler::{RequestHandler, RequestHandlerConfig};
pub use server::ProxyServer;
