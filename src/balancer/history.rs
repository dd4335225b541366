//! Per-host usage history with bounded memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::BalancerStats;

/// A single usage record: which IP served a host, and when.
///
/// Timestamps are monotonic; they are never compared against wall-clock time.
#[derive(Debug, Clone)]
pub struct UsageEntry {
    pub ip: String,
    pub timestamp: Instant,
}

/// Usage history for a single destination host, oldest entry first.
pub struct HostHistory {
    entries: RwLock<Vec<UsageEntry>>,
}

impl HostHistory {
    fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::with_capacity(100)),
        }
    }

    fn add(&self, ip: &str) {
        self.entries.write().push(UsageEntry {
            ip: ip.to_string(),
            timestamp: Instant::now(),
        });
    }

    /// Entries within the time window, capped at `max_size`, most recent first.
    fn get_filtered(&self, window: Duration, max_size: usize) -> Vec<UsageEntry> {
        let entries = self.entries.read();
        let cutoff = Instant::now().checked_sub(window);
        let mut result = Vec::with_capacity(max_size.min(entries.len()));

        for entry in entries.iter().rev() {
            if result.len() >= max_size {
                break;
            }
            if cutoff.map_or(true, |c| entry.timestamp > c) {
                result.push(entry.clone());
            }
        }

        result
    }

    /// Drop expired entries; returns how many were removed.
    fn cleanup(&self, window: Duration) -> usize {
        let mut entries = self.entries.write();
        let cutoff = match Instant::now().checked_sub(window) {
            Some(c) => c,
            None => return 0,
        };

        let before = entries.len();
        entries.retain(|e| e.timestamp > cutoff);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn oldest_timestamp(&self) -> Option<Instant> {
        self.entries.read().first().map(|e| e.timestamp)
    }

    /// Remove the oldest entry. Returns false if the history was empty.
    fn pop_oldest(&self) -> bool {
        let mut entries = self.entries.write();
        if entries.is_empty() {
            return false;
        }
        entries.remove(0);
        true
    }
}

/// Usage history for all hosts.
///
/// Two-level locking: the outer map lock is taken for writing only when a
/// host is created, evicted from, or deleted; appends and reads for an
/// existing host take only that host's lock.
pub struct History {
    hosts: RwLock<HashMap<String, Arc<HostHistory>>>,
    /// Maximum total entries across all hosts (0 = unlimited)
    max_total_entries: usize,
    total_entries: AtomicUsize,
}

impl History {
    pub fn new(max_total_entries: usize) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            max_total_entries,
            total_entries: AtomicUsize::new(0),
        }
    }

    /// Record an IP usage for a host. When the global cap is reached the
    /// single oldest entry across all hosts is evicted first.
    pub fn record(&self, host: &str, ip: &str) {
        if self.max_total_entries > 0
            && self.total_entries.load(Ordering::Relaxed) >= self.max_total_entries
        {
            self.evict_oldest();
        }

        self.get_or_create(host).add(ip);
        self.total_entries.fetch_add(1, Ordering::Relaxed);
    }

    /// Filtered entries for a host, most recent first.
    pub fn get_filtered(&self, host: &str, window: Duration, max_size: usize) -> Vec<UsageEntry> {
        let hosts = self.hosts.read();
        match hosts.get(host) {
            Some(hh) => hh.get_filtered(window, max_size),
            None => Vec::new(),
        }
    }

    /// Drop expired entries from all hosts and remove emptied hosts.
    /// Returns `(removed_entries, removed_hosts)`.
    pub fn cleanup(&self, window: Duration) -> (usize, usize) {
        let mut hosts = self.hosts.write();
        let mut removed_entries = 0;
        let mut removed_hosts = 0;

        hosts.retain(|_, hh| {
            removed_entries += hh.cleanup(window);
            if hh.len() == 0 {
                removed_hosts += 1;
                false
            } else {
                true
            }
        });

        self.total_entries.fetch_sub(removed_entries, Ordering::Relaxed);
        (removed_entries, removed_hosts)
    }

    /// History statistics: host count, entry count, entries per IP.
    pub fn stats(&self) -> BalancerStats {
        let hosts = self.hosts.read();
        let mut entries_per_ip: HashMap<String, usize> = HashMap::new();
        let mut total_entries = 0;

        for hh in hosts.values() {
            for entry in hh.entries.read().iter() {
                total_entries += 1;
                *entries_per_ip.entry(entry.ip.clone()).or_insert(0) += 1;
            }
        }

        BalancerStats {
            total_hosts: hosts.len(),
            total_entries,
            entries_per_ip,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.total_entries.load(Ordering::Relaxed)
    }

    fn get_or_create(&self, host: &str) -> Arc<HostHistory> {
        if let Some(hh) = self.hosts.read().get(host) {
            return hh.clone();
        }

        let mut hosts = self.hosts.write();
        hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostHistory::new()))
            .clone()
    }

    /// Evict the globally oldest entry. Scans the first (oldest) entry of
    /// each host history, O(hosts); only reached near saturation.
    fn evict_oldest(&self) {
        let mut hosts = self.hosts.write();

        let oldest_host = hosts
            .iter()
            .filter_map(|(host, hh)| hh.oldest_timestamp().map(|ts| (host.clone(), ts)))
            .min_by_key(|(_, ts)| *ts)
            .map(|(host, _)| host);

        if let Some(host) = oldest_host {
            let emptied = {
                let hh = &hosts[&host];
                if hh.pop_oldest() {
                    self.total_entries.fetch_sub(1, Ordering::Relaxed);
                }
                hh.len() == 0
            };
            if emptied {
                hosts.remove(&host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_get_filtered() {
        let history = History::new(0);
        history.record("example.com", "10.0.0.1");
        history.record("example.com", "10.0.0.2");
        history.record("example.com", "10.0.0.1");

        let entries = history.get_filtered("example.com", Duration::from_secs(60), 100);
        assert_eq!(entries.len(), 3);
        // Most recent first
        assert_eq!(entries[0].ip, "10.0.0.1");
        assert_eq!(entries[1].ip, "10.0.0.2");
        assert_eq!(entries[2].ip, "10.0.0.1");
    }

    #[test]
    fn test_get_filtered_respects_max_size() {
        let history = History::new(0);
        for _ in 0..10 {
            history.record("example.com", "10.0.0.1");
        }

        let entries = history.get_filtered("example.com", Duration::from_secs(60), 3);
        assert_eq!(entries.len(), 3);
    }

    #[test]
    fn test_get_filtered_unknown_host() {
        let history = History::new(0);
        assert!(history
            .get_filtered("nowhere.example", Duration::from_secs(60), 100)
            .is_empty());
    }

    #[test]
    fn test_get_filtered_window_excludes_old_entries() {
        let history = History::new(0);
        history.record("example.com", "10.0.0.1");
        std::thread::sleep(Duration::from_millis(30));
        history.record("example.com", "10.0.0.2");

        let entries = history.get_filtered("example.com", Duration::from_millis(20), 100);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip, "10.0.0.2");
    }

    #[test]
    fn test_cleanup_removes_expired_and_empty_hosts() {
        let history = History::new(0);
        history.record("a.example", "10.0.0.1");
        history.record("b.example", "10.0.0.2");
        std::thread::sleep(Duration::from_millis(30));
        history.record("b.example", "10.0.0.2");

        let (removed_entries, removed_hosts) = history.cleanup(Duration::from_millis(20));
        assert_eq!(removed_entries, 2);
        assert_eq!(removed_hosts, 1);

        let stats = history.stats();
        assert_eq!(stats.total_hosts, 1);
        assert_eq!(stats.total_entries, 1);
        assert_eq!(history.entry_count(), 1);
    }

    #[test]
    fn test_global_cap_evicts_oldest_across_hosts() {
        let history = History::new(3);
        history.record("a.example", "10.0.0.1");
        history.record("b.example", "10.0.0.2");
        history.record("c.example", "10.0.0.3");

        // Cap reached: the next insert evicts the oldest entry (a.example's
        // only entry), which also removes the emptied host.
        history.record("d.example", "10.0.0.4");

        let stats = history.stats();
        assert_eq!(stats.total_entries, 3);
        assert_eq!(stats.total_hosts, 3);
        assert!(history
            .get_filtered("a.example", Duration::from_secs(60), 100)
            .is_empty());
        assert_eq!(
            history
                .get_filtered("d.example", Duration::from_secs(60), 100)
                .len(),
            1
        );
    }

    #[test]
    fn test_global_cap_bounds_many_unique_hosts() {
        let cap = 50;
        let history = History::new(cap);
        for i in 0..500 {
            history.record(&format!("host-{}.example", i), "10.0.0.1");
        }
        assert!(history.stats().total_entries <= cap);
    }

    #[test]
    fn test_stats_entries_per_ip() {
        let history = History::new(0);
        history.record("a.example", "10.0.0.1");
        history.record("a.example", "10.0.0.1");
        history.record("b.example", "10.0.0.2");

        let stats = history.stats();
        assert_eq!(stats.entries_per_ip["10.0.0.1"], 2);
        assert_eq!(stats.entries_per_ip["10.0.0.2"], 1);
    }

    #[test]
    fn test_concurrent_records_stay_bounded() {
        let cap = 100;
        let history = Arc::new(History::new(cap));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let history = history.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        history.record(&format!("host-{}-{}.example", t, i), "10.0.0.1");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Small tolerance for concurrent inserts racing the cap check
        assert!(history.stats().total_entries <= cap + 4);
    }
}
