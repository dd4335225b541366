//! Least-recently-used per-host IP selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

use crate::error::{EgretError, Result};
use crate::metrics;

use super::history::History;
use super::{normalize_host, BalancerStats, CircuitBreaker, HealthView, SlotAvailability};

/// Interval between background history cleanup passes.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
struct HistoryLimits {
    window: Duration,
    size: usize,
}

/// Per-call scratch buffers, pooled to keep the selection hot path
/// allocation-free.
#[derive(Default)]
struct Scratch {
    usage: HashMap<String, u32>,
    last_used: HashMap<String, Instant>,
    candidates: Vec<String>,
    spare: Vec<String>,
}

struct ScratchPool {
    pool: Mutex<Vec<Scratch>>,
}

impl ScratchPool {
    fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    fn get(&self) -> Scratch {
        self.pool.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut scratch: Scratch) {
        scratch.usage.clear();
        scratch.last_used.clear();
        scratch.candidates.clear();
        scratch.spare.clear();
        self.pool.lock().push(scratch);
    }
}

/// Selects, for each destination host, the outbound IP with the lowest usage
/// count in that host's recent history; ties break toward the IP with the
/// oldest last use, with never-used IPs sorting earliest.
pub struct LruBalancer {
    ips: Vec<String>,
    limits: RwLock<HistoryLimits>,
    history: History,
    limiter: Option<Arc<dyn SlotAvailability>>,
    health: Option<Arc<dyn HealthView>>,
    breaker: Option<Arc<CircuitBreaker>>,
    scratch: ScratchPool,
}

impl LruBalancer {
    pub fn new(
        ips: Vec<String>,
        history_window: Duration,
        history_size: usize,
        history_max_total_entries: usize,
        limiter: Option<Arc<dyn SlotAvailability>>,
        health: Option<Arc<dyn HealthView>>,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        Self {
            ips,
            limits: RwLock::new(HistoryLimits {
                window: history_window,
                size: history_size,
            }),
            history: History::new(history_max_total_entries),
            limiter,
            health,
            breaker,
            scratch: ScratchPool::new(),
        }
    }

    /// The configured outbound IP set.
    pub fn ips(&self) -> &[String] {
        &self.ips
    }

    /// Update the history window and size at runtime. The next `select` call
    /// uses the new values.
    pub fn update_history_config(&self, window: Duration, size: usize) {
        let mut limits = self.limits.write();
        limits.window = window;
        limits.size = size;
        info!(window_secs = window.as_secs(), size, "history config updated");
    }

    /// Select the best outbound IP for the given host.
    pub fn select(&self, host: &str) -> Result<String> {
        let host = normalize_host(host);
        let mut scratch = self.scratch.get();
        let result = self.select_inner(&host, &mut scratch);
        self.scratch.put(scratch);
        result
    }

    fn select_inner(&self, host: &str, scratch: &mut Scratch) -> Result<String> {
        self.filter_candidates(scratch);
        if scratch.candidates.is_empty() {
            trace!(host, total_ips = self.ips.len(), "no available IPs");
            return Err(EgretError::NoAvailableIps);
        }

        let HistoryLimits { window, size } = *self.limits.read();
        let entries = self.history.get_filtered(host, window, size);
        trace!(host, entries = entries.len(), "history loaded");

        for entry in &entries {
            *scratch.usage.entry(entry.ip.clone()).or_insert(0) += 1;
            scratch
                .last_used
                .entry(entry.ip.clone())
                .and_modify(|t| {
                    if entry.timestamp > *t {
                        *t = entry.timestamp;
                    }
                })
                .or_insert(entry.timestamp);
        }

        // Lexicographic minimum over (usage, last_use); a never-used IP has
        // no last_use and sorts earliest, so cold starts pick candidates in
        // configured order.
        let mut best: Option<(u32, Option<Instant>, usize)> = None;
        for (i, ip) in scratch.candidates.iter().enumerate() {
            let usage = scratch.usage.get(ip).copied().unwrap_or(0);
            let last_use = scratch.last_used.get(ip).copied();
            if best.map_or(true, |(bu, bl, _)| (usage, last_use) < (bu, bl)) {
                best = Some((usage, last_use, i));
            }
        }

        let selected = best
            .map(|(usage, _, index)| {
                let ip = scratch.candidates[index].clone();
                trace!(host, ip = %ip, usage, "IP selected");
                ip
            })
            .ok_or(EgretError::NoAvailableIps)?;
        Ok(selected)
    }

    /// Record that an IP was used for a host.
    pub fn record(&self, host: &str, ip: &str) {
        self.history.record(&normalize_host(host), ip);
        metrics::HISTORY_ENTRIES.set(self.history.entry_count() as i64);
    }

    /// Balancer statistics for the stats endpoint.
    pub fn get_stats(&self) -> BalancerStats {
        self.history.stats()
    }

    /// Background cleanup: periodically drop expired history entries so they
    /// release memory even when no new inserts arrive.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        let mut cleanup_interval = interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await; // skip the immediate tick

        loop {
            tokio::select! {
                _ = cleanup_interval.tick() => {
                    let window = self.limits.read().window;
                    let (removed_entries, removed_hosts) = self.history.cleanup(window);
                    if removed_entries > 0 || removed_hosts > 0 {
                        debug!(removed_entries, removed_hosts, "history cleanup");
                        let stats = self.history.stats();
                        metrics::HISTORY_ENTRIES.set(stats.total_entries as i64);
                        metrics::HISTORY_HOSTS.set(stats.total_hosts as i64);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("history cleanup shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Candidate set: configured IPs filtered by health, circuit state, and
    /// connection limits. Health and circuit filters degrade gracefully: when
    /// a filter would leave nothing, the unfiltered set is kept so an outage
    /// of the probe target cannot take the proxy down.
    fn filter_candidates(&self, scratch: &mut Scratch) {
        scratch.candidates.clear();
        scratch.candidates.extend(self.ips.iter().cloned());

        if let Some(health) = &self.health {
            health.filter_healthy_into(&scratch.candidates, &mut scratch.spare);
            if scratch.spare.is_empty() {
                warn!(total_ips = self.ips.len(), "all IPs unhealthy, using all");
            } else {
                std::mem::swap(&mut scratch.candidates, &mut scratch.spare);
            }
        }

        if let Some(breaker) = &self.breaker {
            breaker.filter_allowed_into(&scratch.candidates, &mut scratch.spare);
            if scratch.spare.is_empty() {
                warn!(total_ips = self.ips.len(), "all circuits open, using all");
            } else {
                std::mem::swap(&mut scratch.candidates, &mut scratch.spare);
            }
        }

        if let Some(limiter) = &self.limiter {
            limiter.filter_available_into(&scratch.candidates, &mut scratch.spare);
            std::mem::swap(&mut scratch.candidates, &mut scratch.spare);
        }
    }
}
