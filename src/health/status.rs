//! Per-IP health state machine.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Health state of an outbound IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// The IP is usable
    Healthy,
    /// The IP has failed enough checks to be excluded from selection
    Unhealthy,
    /// The IP is being tested after being unhealthy; still excluded
    Recovering,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Recovering => "recovering",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
struct StatusInner {
    state: HealthState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_check: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Current health status of a single IP. Mutated only by the health checker.
pub struct IpStatus {
    ip: String,
    inner: RwLock<StatusInner>,
}

impl IpStatus {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            inner: RwLock::new(StatusInner {
                state: HealthState::Healthy,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_check: None,
                last_error: None,
            }),
        }
    }

    pub fn state(&self) -> HealthState {
        self.inner.read().state
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.read().state == HealthState::Healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.read().consecutive_failures
    }

    /// Record a successful check. Returns true if the state changed.
    pub fn record_success(&self, success_threshold: u32) -> bool {
        let mut inner = self.inner.write();

        inner.last_check = Some(Utc::now());
        inner.last_error = None;
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;

        let old_state = inner.state;

        match inner.state {
            HealthState::Unhealthy => {
                // First success after being unhealthy
                inner.state = HealthState::Recovering;
                inner.consecutive_successes = 1;
            }
            HealthState::Recovering => {
                if inner.consecutive_successes >= success_threshold {
                    inner.state = HealthState::Healthy;
                }
            }
            HealthState::Healthy => {}
        }

        old_state != inner.state
    }

    /// Record a failed check. Returns true if the state changed.
    pub fn record_failure(&self, error: &str, failure_threshold: u32) -> bool {
        let mut inner = self.inner.write();

        inner.last_check = Some(Utc::now());
        inner.last_error = Some(error.to_string());
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let old_state = inner.state;

        match inner.state {
            HealthState::Healthy => {
                if inner.consecutive_failures >= failure_threshold {
                    inner.state = HealthState::Unhealthy;
                }
            }
            HealthState::Recovering => {
                // Any failure while recovering goes back to unhealthy
                inner.state = HealthState::Unhealthy;
            }
            HealthState::Unhealthy => {}
        }

        old_state != inner.state
    }

    /// Copy of the status for external reporting.
    pub fn info(&self) -> StatusInfo {
        let inner = self.inner.read();
        StatusInfo {
            ip: self.ip.clone(),
            state: inner.state.as_str(),
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_check: inner.last_check,
            last_error: inner.last_error.clone(),
        }
    }
}

/// Serializable status report for the stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusInfo {
    pub ip: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}
