//! Outbound IP selection
//!
//! Per-destination-host least-recently-used balancing over the configured
//! source IPs, backed by a time-windowed usage history.

mod circuit_breaker;
mod history;
mod lru;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerSnapshot, CircuitState};
pub use history::{History, HostHistory, UsageEntry};
pub use lru::LruBalancer;

use std::collections::HashMap;

use serde::Serialize;

/// Balancer statistics for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct BalancerStats {
    pub total_hosts: usize,
    pub total_entries: usize,
    pub entries_per_ip: HashMap<String, usize>,
}

/// View of connection-slot availability, implemented by the limiter.
pub trait SlotAvailability: Send + Sync {
    /// Fill `out` with the subset of `ips` that have free slots.
    fn filter_available_into(&self, ips: &[String], out: &mut Vec<String>);
}

/// View of IP health, implemented by the active health checker.
pub trait HealthView: Send + Sync {
    /// Fill `out` with the subset of `ips` currently considered healthy.
    fn filter_healthy_into(&self, ips: &[String], out: &mut Vec<String>);
}

impl SlotAvailability for crate::limiter::Limiter {
    fn filter_available_into(&self, ips: &[String], out: &mut Vec<String>) {
        crate::limiter::Limiter::filter_available_into(self, ips, out);
    }
}

/// Normalize a destination host for history keys. Hostnames are
/// case-insensitive, so `Example.com` and `example.com` must share history.
pub fn normalize_host(host: &str) -> String {
    host.trim().to_ascii_lowercase()
}
