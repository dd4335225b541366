//! Passive per-IP circuit breaker.
//!
//! Complements the active health checker: upstream dial outcomes reported by
//! the proxy paths open and close circuits without any probe traffic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit state for one IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests are allowed
    Closed,
    /// Requests are rejected until the open timeout elapses
    Open,
    /// Probing: requests are allowed while recent successes accumulate
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct IpCircuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

impl IpCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
        }
    }
}

/// Serializable circuit snapshot for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub ip: String,
    pub state: &'static str,
    pub failures: u32,
}

/// Per-IP circuit breaker.
pub struct CircuitBreaker {
    circuits: RwLock<HashMap<String, Arc<Mutex<IpCircuit>>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Whether requests may currently use this IP. An open circuit whose
    /// timeout has elapsed transitions to half-open and lets one through.
    pub fn allow(&self, ip: &str) -> bool {
        let circuit = match self.circuits.read().get(ip) {
            Some(c) => c.clone(),
            // No recorded outcomes yet
            None => return true,
        };

        let mut circuit = circuit.lock();
        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure
                    .map_or(true, |t| t.elapsed() >= self.config.timeout);
                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.successes = 0;
                    debug!(ip, "circuit half-open, probing");
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful upstream connection on this IP.
    pub fn record_success(&self, ip: &str) {
        let circuit = match self.circuits.read().get(ip) {
            Some(c) => c.clone(),
            None => return,
        };

        let mut circuit = circuit.lock();
        match circuit.state {
            CircuitState::HalfOpen => {
                circuit.successes += 1;
                if circuit.successes >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.failures = 0;
                    circuit.successes = 0;
                    debug!(ip, "circuit closed");
                }
            }
            CircuitState::Closed => {
                circuit.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed upstream connection on this IP.
    pub fn record_failure(&self, ip: &str) {
        let circuit = self.get_or_create(ip);
        let mut circuit = circuit.lock();
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed => {
                circuit.failures += 1;
                if circuit.failures >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    warn!(ip, failures = circuit.failures, "circuit opened");
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                circuit.successes = 0;
                warn!(ip, "circuit re-opened during probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Current state for an IP (Closed if never seen).
    pub fn state(&self, ip: &str) -> CircuitState {
        self.circuits
            .read()
            .get(ip)
            .map(|c| c.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Fill `out` with the subset of `ips` whose circuits allow requests.
    pub fn filter_allowed_into(&self, ips: &[String], out: &mut Vec<String>) {
        out.clear();
        for ip in ips {
            if self.allow(ip) {
                out.push(ip.clone());
            }
        }
    }

    /// Snapshots for the stats endpoint.
    pub fn snapshot(&self) -> Vec<CircuitBreakerSnapshot> {
        self.circuits
            .read()
            .iter()
            .map(|(ip, circuit)| {
                let circuit = circuit.lock();
                CircuitBreakerSnapshot {
                    ip: ip.clone(),
                    state: circuit.state.as_str(),
                    failures: circuit.failures,
                }
            })
            .collect()
    }

    fn get_or_create(&self, ip: &str) -> Arc<Mutex<IpCircuit>> {
        if let Some(circuit) = self.circuits.read().get(ip) {
            return circuit.clone();
        }

        let mut circuits = self.circuits.write();
        circuits
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(IpCircuit::new())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32, timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            enabled: true,
            failure_threshold: failures,
            success_threshold: successes,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    #[test]
    fn test_unknown_ip_is_allowed() {
        let cb = breaker(3, 2, 1000);
        assert!(cb.allow("10.0.0.1"));
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_failure_threshold() {
        let cb = breaker(3, 2, 1000);
        cb.record_failure("10.0.0.1");
        cb.record_failure("10.0.0.1");
        assert!(cb.allow("10.0.0.1"));

        cb.record_failure("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Open);
        assert!(!cb.allow("10.0.0.1"));
    }

    #[test]
    fn test_success_resets_closed_failure_count() {
        let cb = breaker(3, 2, 1000);
        cb.record_failure("10.0.0.1");
        cb.record_failure("10.0.0.1");
        cb.record_success("10.0.0.1");
        cb.record_failure("10.0.0.1");
        cb.record_failure("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes() {
        let cb = breaker(1, 2, 10);
        cb.record_failure("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow("10.0.0.1"));
        assert_eq!(cb.state("10.0.0.1"), CircuitState::HalfOpen);

        cb.record_success("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::HalfOpen);
        cb.record_success("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, 2, 10);
        cb.record_failure("10.0.0.1");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.allow("10.0.0.1"));

        cb.record_failure("10.0.0.1");
        assert_eq!(cb.state("10.0.0.1"), CircuitState::Open);
        assert!(!cb.allow("10.0.0.1"));
    }

    #[test]
    fn test_filter_allowed() {
        let cb = breaker(1, 2, 1000);
        cb.record_failure("10.0.0.2");

        let ips = vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()];
        let mut out = Vec::new();
        cb.filter_allowed_into(&ips, &mut out);
        assert_eq!(out, vec!["10.0.0.1".to_string()]);
    }

    #[test]
    fn test_snapshot() {
        let cb = breaker(1, 2, 1000);
        cb.record_failure("10.0.0.1");
        let snaps = cb.snapshot();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].ip, "10.0.0.1");
        assert_eq!(snaps[0].state, "open");
    }
}
