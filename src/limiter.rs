//! Connection limiting with race-free accounting.
//!
//! Tracks concurrent connection slots per outbound IP and in total. Acquire
//! is a two-phase atomic reservation: the global counter is incremented
//! first, then the per-IP counter; if the per-IP cap is hit the global
//! reservation is rolled back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{EgretError, Result};

/// Tracks and limits concurrent connections per IP and globally.
///
/// Naive `if count < max { count += 1 }` has a TOCTOU window that admits
/// counts past the cap under contention; both counters use compare-exchange
/// loops so the check and the increment are a single atomic step.
pub struct Limiter {
    max_per_ip: AtomicI64,
    max_total: AtomicI64,
    total: AtomicI64,
    per_ip: RwLock<HashMap<String, Arc<AtomicI64>>>,
}

impl Limiter {
    /// Create a new limiter. Per-IP counters are created eagerly for the
    /// configured IPs so the hot path never takes the map write lock.
    pub fn new(max_per_ip: i64, max_total: i64, ips: &[String]) -> Self {
        let mut per_ip = HashMap::with_capacity(ips.len());
        for ip in ips {
            per_ip.insert(ip.clone(), Arc::new(AtomicI64::new(0)));
        }

        Self {
            max_per_ip: AtomicI64::new(max_per_ip),
            max_total: AtomicI64::new(max_total),
            total: AtomicI64::new(0),
            per_ip: RwLock::new(per_ip),
        }
    }

    /// Update the connection limits at runtime. Takes effect for subsequent
    /// acquires; in-flight holders are not revoked.
    pub fn update_limits(&self, max_per_ip: i64, max_total: i64) {
        self.max_per_ip.store(max_per_ip, Ordering::Relaxed);
        self.max_total.store(max_total, Ordering::Relaxed);
        info!(max_per_ip, max_total, "limits updated");
    }

    /// Attempt to acquire a connection slot for the given IP.
    pub fn acquire(&self, ip: &str) -> Result<()> {
        let max_total = self.max_total.load(Ordering::Relaxed);
        let max_per_ip = self.max_per_ip.load(Ordering::Relaxed);

        // Reserve a global slot
        loop {
            let current = self.total.load(Ordering::Relaxed);
            if current >= max_total {
                return Err(EgretError::TotalLimitReached);
            }
            if self
                .total
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        let counter = self.counter_for(ip);

        // Reserve the per-IP slot, rolling back the global reservation on
        // failure. A plain subtract is enough for the rollback: we hold a
        // reservation, so the counter cannot go negative.
        loop {
            let ip_count = counter.load(Ordering::Relaxed);
            if ip_count >= max_per_ip {
                self.total.fetch_sub(1, Ordering::AcqRel);
                return Err(EgretError::IpLimitReached);
            }
            if counter
                .compare_exchange(ip_count, ip_count + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }

        Ok(())
    }

    /// Release a connection slot for the given IP. Releasing an unknown IP is
    /// a no-op on the per-IP side; the global counter is always decremented.
    pub fn release(&self, ip: &str) {
        let per_ip = self.per_ip.read();
        if let Some(counter) = per_ip.get(ip) {
            counter.fetch_sub(1, Ordering::AcqRel);
        }
        drop(per_ip);
        self.total.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current connection count for an IP.
    pub fn ip_count(&self, ip: &str) -> i64 {
        self.per_ip
            .read()
            .get(ip)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Current total connection count.
    pub fn total_count(&self) -> i64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Whether an IP has available connection slots.
    pub fn is_available(&self, ip: &str) -> bool {
        self.ip_count(ip) < self.max_per_ip.load(Ordering::Relaxed)
    }

    /// Fill `out` with the subset of `ips` that have available slots.
    /// The buffer is cleared first so callers can reuse pooled buffers.
    pub fn filter_available_into(&self, ips: &[String], out: &mut Vec<String>) {
        out.clear();
        for ip in ips {
            if self.is_available(ip) {
                out.push(ip.clone());
            }
        }
    }

    /// Convenience form of [`filter_available_into`](Self::filter_available_into).
    pub fn filter_available(&self, ips: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(ips.len());
        self.filter_available_into(ips, &mut out);
        out
    }

    /// Current counts per IP plus the total, for the stats endpoint.
    pub fn stats(&self) -> HashMap<String, i64> {
        let mut stats = HashMap::new();
        stats.insert("total".to_string(), self.total_count());
        for (ip, counter) in self.per_ip.read().iter() {
            stats.insert(ip.clone(), counter.load(Ordering::Relaxed));
        }
        stats
    }

    fn counter_for(&self, ip: &str) -> Arc<AtomicI64> {
        if let Some(counter) = self.per_ip.read().get(ip) {
            return counter.clone();
        }

        // Unconfigured IP: double-checked insertion under the write lock
        let mut per_ip = self.per_ip.write();
        per_ip
            .entry(ip.to_string())
            .or_insert_with(|| Arc::new(AtomicI64::new(0)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn ips(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_acquire_release_roundtrip() {
        let limiter = Limiter::new(2, 10, &ips(&["10.0.0.1"]));

        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert_eq!(limiter.ip_count("10.0.0.1"), 1);
        assert_eq!(limiter.total_count(), 1);

        limiter.release("10.0.0.1");
        assert_eq!(limiter.ip_count("10.0.0.1"), 0);
        assert_eq!(limiter.total_count(), 0);
    }

    #[test]
    fn test_per_ip_limit() {
        let limiter = Limiter::new(2, 10, &ips(&["10.0.0.1"]));

        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(matches!(
            limiter.acquire("10.0.0.1"),
            Err(EgretError::IpLimitReached)
        ));

        // Failed acquire must not leak the global reservation
        assert_eq!(limiter.total_count(), 2);
        assert_eq!(limiter.ip_count("10.0.0.1"), 2);
    }

    #[test]
    fn test_total_limit() {
        let limiter = Limiter::new(10, 2, &ips(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]));

        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(limiter.acquire("10.0.0.2").is_ok());
        assert!(matches!(
            limiter.acquire("10.0.0.3"),
            Err(EgretError::TotalLimitReached)
        ));
        assert_eq!(limiter.total_count(), 2);
        assert_eq!(limiter.ip_count("10.0.0.3"), 0);
    }

    #[test]
    fn test_release_unknown_ip() {
        let limiter = Limiter::new(2, 10, &ips(&["10.0.0.1"]));

        assert!(limiter.acquire("10.0.0.1").is_ok());
        limiter.release("203.0.113.9");
        assert_eq!(limiter.ip_count("203.0.113.9"), 0);
        assert_eq!(limiter.total_count(), 0);
    }

    #[test]
    fn test_unconfigured_ip_gets_counter() {
        let limiter = Limiter::new(2, 10, &ips(&["10.0.0.1"]));

        assert!(limiter.acquire("192.168.1.1").is_ok());
        assert_eq!(limiter.ip_count("192.168.1.1"), 1);
        limiter.release("192.168.1.1");
        assert_eq!(limiter.ip_count("192.168.1.1"), 0);
    }

    #[test]
    fn test_update_limits_takes_effect() {
        let limiter = Limiter::new(1, 10, &ips(&["10.0.0.1"]));

        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(limiter.acquire("10.0.0.1").is_err());

        limiter.update_limits(2, 10);
        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(limiter.acquire("10.0.0.1").is_err());
    }

    #[test]
    fn test_shrinking_below_in_flight_is_allowed() {
        let limiter = Limiter::new(5, 10, &ips(&["10.0.0.1"]));

        for _ in 0..4 {
            assert!(limiter.acquire("10.0.0.1").is_ok());
        }

        // In-flight holders are not revoked; new acquires block until drain
        limiter.update_limits(2, 10);
        assert!(limiter.acquire("10.0.0.1").is_err());

        limiter.release("10.0.0.1");
        limiter.release("10.0.0.1");
        limiter.release("10.0.0.1");
        assert!(limiter.acquire("10.0.0.1").is_ok());
    }

    #[test]
    fn test_is_available_and_filter() {
        let all = ips(&["10.0.0.1", "10.0.0.2"]);
        let limiter = Limiter::new(1, 10, &all);

        assert!(limiter.acquire("10.0.0.1").is_ok());
        assert!(!limiter.is_available("10.0.0.1"));
        assert!(limiter.is_available("10.0.0.2"));
        assert_eq!(limiter.filter_available(&all), ips(&["10.0.0.2"]));

        let mut buf = vec!["stale".to_string()];
        limiter.filter_available_into(&all, &mut buf);
        assert_eq!(buf, ips(&["10.0.0.2"]));
    }

    #[test]
    fn test_stats_snapshot() {
        let limiter = Limiter::new(5, 10, &ips(&["10.0.0.1", "10.0.0.2"]));
        limiter.acquire("10.0.0.1").unwrap();
        limiter.acquire("10.0.0.1").unwrap();

        let stats = limiter.stats();
        assert_eq!(stats["total"], 2);
        assert_eq!(stats["10.0.0.1"], 2);
        assert_eq!(stats["10.0.0.2"], 0);
    }

    #[test]
    fn test_concurrent_acquire_release_never_exceeds_limits() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 10_000;
        const MAX_PER_IP: i64 = 4;
        const MAX_TOTAL: i64 = 6;

        let all = ips(&["10.0.0.1", "10.0.0.2"]);
        let limiter = Arc::new(Limiter::new(MAX_PER_IP, MAX_TOTAL, &all));
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                let ip = if i % 2 == 0 { "10.0.0.1" } else { "10.0.0.2" };
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ITERATIONS {
                        if limiter.acquire(ip).is_ok() {
                            assert!(limiter.ip_count(ip) <= MAX_PER_IP);
                            assert!(limiter.total_count() <= MAX_TOTAL);
                            limiter.release(ip);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // No leaks after every interleaving completes
        assert_eq!(limiter.total_count(), 0);
        assert_eq!(limiter.ip_count("10.0.0.1"), 0);
        assert_eq!(limiter.ip_count("10.0.0.2"), 0);
    }
}
