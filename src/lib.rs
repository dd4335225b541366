//! Egret - Outbound IP Load-Balancing Proxy
//!
//! A forward HTTP/HTTPS proxy that spreads outbound connections across a
//! fixed set of local source IPs.
//!
//! ## Features
//!
//! - Per-destination-host LRU balancing with time-windowed history
//! - Race-free per-IP and global connection limits
//! - CONNECT tunnels with idle-timeout enforcement and byte accounting
//! - Active health checking (TCP or HTTP probes) with graceful degradation
//! - Optional passive circuit breaking on upstream dial failures
//! - Prometheus metrics and a JSON stats endpoint

pub mod balancer;
pub mod config;
pub mod error;
pub mod health;
pub mod limiter;
pub mod metrics;
pub mod ops;
pub mod proxy;

pub use config::Config;
pub use error::{EgretError, Result};
