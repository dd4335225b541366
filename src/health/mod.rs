//! Active health checking for outbound IPs.
//!
//! Periodically probes each configured IP and drives a three-state machine
//! (healthy, unhealthy, recovering). The selector consults the resulting
//! healthy set.

mod probe;
mod status;

pub use probe::{HttpProbe, Probe, TcpProbe};
pub use status::{HealthState, IpStatus, StatusInfo};

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{interval, timeout};
use tracing::{debug, info, trace, warn};

use crate::balancer::HealthView;
use crate::metrics;

/// Runs periodic health checks against every configured IP.
pub struct HealthChecker {
    probe: Arc<dyn Probe>,
    interval: Duration,
    timeout: Duration,
    failure_threshold: u32,
    success_threshold: u32,
    statuses: HashMap<String, Arc<IpStatus>>,
}

impl HealthChecker {
    pub fn new(
        ips: &[String],
        probe: Arc<dyn Probe>,
        check_interval: Duration,
        check_timeout: Duration,
        failure_threshold: u32,
        success_threshold: u32,
    ) -> Self {
        let mut statuses = HashMap::with_capacity(ips.len());
        for ip in ips {
            statuses.insert(ip.clone(), Arc::new(IpStatus::new(ip)));
            metrics::IP_HEALTH_STATUS.with_label_values(&[ip]).set(1);
        }

        Self {
            probe,
            interval: check_interval,
            timeout: check_timeout,
            failure_threshold,
            success_threshold,
            statuses,
        }
    }

    /// Periodic check loop. The first round runs immediately; subsequent
    /// rounds run on a fixed ticker until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            timeout_secs = self.timeout.as_secs(),
            failure_threshold = self.failure_threshold,
            success_threshold = self.success_threshold,
            "health checker started"
        );

        let mut ticker = interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker stopped");
                        break;
                    }
                }
            }
        }
    }

    /// True if the IP is in a healthy state. Unknown IPs are healthy.
    pub fn is_healthy(&self, ip: &str) -> bool {
        self.statuses.get(ip).map_or(true, |s| s.is_healthy())
    }

    /// Fill `out` with the subset of `ips` currently healthy.
    pub fn filter_healthy_into(&self, ips: &[String], out: &mut Vec<String>) {
        out.clear();
        for ip in ips {
            if self.is_healthy(ip) {
                out.push(ip.clone());
            }
        }
    }

    /// Status reports for all IPs.
    pub fn all_status(&self) -> Vec<StatusInfo> {
        self.statuses.values().map(|s| s.info()).collect()
    }

    /// Probe every IP in parallel, then refresh the aggregate gauges.
    async fn check_all(&self) {
        let checks = self.statuses.keys().map(|ip| self.check_ip(ip));
        join_all(checks).await;
        self.update_aggregate_metrics();
    }

    async fn check_ip(&self, ip: &str) {
        let status = match self.statuses.get(ip) {
            Some(s) => s.clone(),
            None => return,
        };

        let source_ip: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(ip, error = %e, "health check skipped: unparseable IP");
                return;
            }
        };

        let start = Instant::now();
        let result = match timeout(self.timeout, self.probe.check(source_ip)).await {
            Ok(r) => r,
            Err(_) => Err(crate::error::EgretError::Timeout),
        };
        let duration = start.elapsed();

        metrics::HEALTH_CHECK_DURATION
            .with_label_values(&[ip])
            .observe(duration.as_secs_f64());

        match result {
            Ok(()) => {
                metrics::HEALTH_CHECKS_TOTAL
                    .with_label_values(&[ip, "success"])
                    .inc();
                if status.record_success(self.success_threshold) {
                    let state = status.state();
                    info!(ip, state = %state, "IP health state changed");
                    if state == HealthState::Healthy {
                        metrics::IP_HEALTH_STATUS.with_label_values(&[ip]).set(1);
                    }
                } else {
                    trace!(ip, duration_ms = duration.as_millis() as u64, "health check ok");
                }
            }
            Err(e) => {
                metrics::HEALTH_CHECKS_TOTAL
                    .with_label_values(&[ip, "failure"])
                    .inc();
                if status.record_failure(&e.to_string(), self.failure_threshold) {
                    let state = status.state();
                    warn!(ip, state = %state, error = %e, "IP health state changed");
                    if state == HealthState::Unhealthy {
                        metrics::IP_HEALTH_STATUS.with_label_values(&[ip]).set(0);
                    }
                } else {
                    debug!(
                        ip,
                        error = %e,
                        consecutive_failures = status.consecutive_failures(),
                        "health check failed"
                    );
                }
            }
        }
    }

    fn update_aggregate_metrics(&self) {
        let healthy = self.statuses.values().filter(|s| s.is_healthy()).count();
        let unhealthy = self.statuses.len() - healthy;
        metrics::HEALTHY_IPS.set(healthy as i64);
        metrics::UNHEALTHY_IPS.set(unhealthy as i64);
    }
}

impl HealthView for HealthChecker {
    fn filter_healthy_into(&self, ips: &[String], out: &mut Vec<String>) {
        HealthChecker::filter_healthy_into(self, ips, out);
    }
}
