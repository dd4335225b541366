//! Prometheus metrics and runtime statistics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use serde::Serialize;

pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "egret_requests_total",
        "Total number of proxy requests",
        &["method", "status"]
    )
    .expect("register egret_requests_total")
});

pub static REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "egret_request_duration_seconds",
        "Request duration in seconds",
        &["method"]
    )
    .expect("register egret_request_duration_seconds")
});

pub static BYTES_SENT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("egret_bytes_sent_total", "Total bytes sent to clients")
        .expect("register egret_bytes_sent_total")
});

pub static BYTES_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "egret_bytes_received_total",
        "Total bytes received from clients"
    )
    .expect("register egret_bytes_received_total")
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "egret_active_connections",
        "Current number of active connections"
    )
    .expect("register egret_active_connections")
});

pub static CONNECTIONS_PER_IP: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "egret_connections_per_ip",
        "Current connections per outbound IP",
        &["ip"]
    )
    .expect("register egret_connections_per_ip")
});

pub static BALANCER_SELECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "egret_balancer_selections_total",
        "Total IP selections by the balancer",
        &["ip", "host"]
    )
    .expect("register egret_balancer_selections_total")
});

pub static LIMIT_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "egret_limit_rejections_total",
        "Total connection rejections due to limits",
        &["type"]
    )
    .expect("register egret_limit_rejections_total")
});

pub static AUTH_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("egret_auth_failures_total", "Total authentication failures")
        .expect("register egret_auth_failures_total")
});

pub static TUNNEL_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "egret_tunnel_connections_total",
        "Total CONNECT tunnel connections"
    )
    .expect("register egret_tunnel_connections_total")
});

pub static HISTORY_ENTRIES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "egret_history_entries",
        "Current number of entries in balancer history"
    )
    .expect("register egret_history_entries")
});

pub static HISTORY_HOSTS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "egret_history_hosts",
        "Current number of unique hosts in balancer history"
    )
    .expect("register egret_history_hosts")
});

pub static HEALTH_CHECKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "egret_health_check_total",
        "Total health checks by IP and result",
        &["ip", "result"]
    )
    .expect("register egret_health_check_total")
});

pub static IP_HEALTH_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "egret_ip_health_status",
        "Health status per IP (1=healthy, 0=unhealthy)",
        &["ip"]
    )
    .expect("register egret_ip_health_status")
});

pub static HEALTH_CHECK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "egret_health_check_duration_seconds",
        "Health check duration in seconds",
        &["ip"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    )
    .expect("register egret_health_check_duration_seconds")
});

pub static HEALTHY_IPS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("egret_healthy_ips", "Number of healthy IPs")
        .expect("register egret_healthy_ips")
});

pub static UNHEALTHY_IPS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("egret_unhealthy_ips", "Number of unhealthy IPs")
        .expect("register egret_unhealthy_ips")
});

/// Runtime statistics exposed on the JSON stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: i64,
    pub total_requests: i64,
    pub bytes_sent: i64,
    pub bytes_received: i64,
    pub connections_per_ip: HashMap<String, i64>,
    pub selections_per_ip: HashMap<String, i64>,
}

/// Collects runtime statistics alongside the Prometheus series.
pub struct StatsCollector {
    active_connections: AtomicI64,
    total_requests: AtomicI64,
    bytes_sent: AtomicI64,
    bytes_received: AtomicI64,
    connections_per_ip: DashMap<String, i64>,
    selections_per_ip: DashMap<String, i64>,
}

impl StatsCollector {
    pub fn new(ips: &[String]) -> Self {
        let connections_per_ip = DashMap::new();
        let selections_per_ip = DashMap::new();
        for ip in ips {
            connections_per_ip.insert(ip.clone(), 0);
            selections_per_ip.insert(ip.clone(), 0);
        }

        Self {
            active_connections: AtomicI64::new(0),
            total_requests: AtomicI64::new(0),
            bytes_sent: AtomicI64::new(0),
            bytes_received: AtomicI64::new(0),
            connections_per_ip,
            selections_per_ip,
        }
    }

    pub fn inc_active_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ACTIVE_CONNECTIONS.inc();
    }

    pub fn dec_active_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
        ACTIVE_CONNECTIONS.dec();
    }

    pub fn inc_total_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: i64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        BYTES_SENT.inc_by(n.max(0) as u64);
    }

    pub fn add_bytes_received(&self, n: i64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
        BYTES_RECEIVED.inc_by(n.max(0) as u64);
    }

    pub fn inc_connections_for_ip(&self, ip: &str) {
        self.connections_per_ip
            .entry(ip.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        CONNECTIONS_PER_IP.with_label_values(&[ip]).inc();
    }

    pub fn dec_connections_for_ip(&self, ip: &str) {
        self.connections_per_ip.entry(ip.to_string()).and_modify(|c| {
            if *c > 0 {
                *c -= 1;
            }
        });
        CONNECTIONS_PER_IP.with_label_values(&[ip]).dec();
    }

    pub fn inc_selections_for_ip(&self, ip: &str, host: &str) {
        self.selections_per_ip
            .entry(ip.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        BALANCER_SELECTIONS.with_label_values(&[ip, host]).inc();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            connections_per_ip: self
                .connections_per_ip
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            selections_per_ip: self
                .selections_per_ip
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_active_connection_counting() {
        let stats = StatsCollector::new(&ips(&["10.0.0.1"]));
        stats.inc_active_connections();
        stats.inc_active_connections();
        stats.dec_active_connections();

        assert_eq!(stats.snapshot().active_connections, 1);
    }

    #[test]
    fn test_byte_counters() {
        let stats = StatsCollector::new(&ips(&["10.0.0.1"]));
        stats.add_bytes_sent(2_500_000);
        stats.add_bytes_received(1_000_000);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_sent, 2_500_000);
        assert_eq!(snapshot.bytes_received, 1_000_000);
    }

    #[test]
    fn test_per_ip_counters() {
        let stats = StatsCollector::new(&ips(&["10.0.0.1", "10.0.0.2"]));
        stats.inc_connections_for_ip("10.0.0.1");
        stats.inc_connections_for_ip("10.0.0.1");
        stats.dec_connections_for_ip("10.0.0.1");
        stats.inc_selections_for_ip("10.0.0.1", "example.com");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_per_ip["10.0.0.1"], 1);
        assert_eq!(snapshot.connections_per_ip["10.0.0.2"], 0);
        assert_eq!(snapshot.selections_per_ip["10.0.0.1"], 1);
    }

    #[test]
    fn test_unknown_ip_is_tracked() {
        let stats = StatsCollector::new(&ips(&["10.0.0.1"]));
        stats.inc_connections_for_ip("192.168.1.1");
        assert_eq!(stats.snapshot().connections_per_ip["192.168.1.1"], 1);
    }
}
