//! Connection Tracker (spec §4.I): per-CID record of the four-tuple and its
//! migration history, TTL-evicted.
//!
//! Grounded on `forge_of_stories::network::server::session::SessionRegistry`
//! for the registry shape. The sharding itself (many small independently
//! `Mutex`-locked shards over one global lock) is taken directly from spec
//! §5's own requirement: "sharded by the low bits of the CID to reduce
//! contention; each shard uses a short-held mutex."

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

const SHARD_COUNT: usize = 64;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationClass {
    PortChange,
    NetworkTypeChange,
    WifiNetworkChange,
    CorporateNetworkChange,
    NetworkChangeDetected,
}

/// Classify a 4-tuple change by comparing IP octets, per spec §4.I.
fn classify(old: SocketAddr, new: SocketAddr) -> MigrationClass {
    if old.ip() == new.ip() {
        return MigrationClass::PortChange;
    }
    match (old.ip(), new.ip()) {
        (std::net::IpAddr::V4(o), std::net::IpAddr::V4(n)) => {
            let o_private = o.is_private();
            let n_private = n.is_private();
            if o_private && !n_private {
                MigrationClass::NetworkTypeChange
            } else if !o_private && n_private {
                MigrationClass::CorporateNetworkChange
            } else if o_private && n_private && o.octets()[0..2] != n.octets()[0..2] {
                MigrationClass::WifiNetworkChange
            } else {
                MigrationClass::NetworkChangeDetected
            }
        }
        _ => MigrationClass::NetworkChangeDetected,
    }
}

#[derive(Debug, Clone)]
pub struct MigrationEvent {
    pub at: Instant,
    pub old_addr: SocketAddr,
    pub new_addr: SocketAddr,
    pub class: MigrationClass,
    pub validated: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub key: Vec<u8>,
    pub current_remote: SocketAddr,
    pub initial_remote: SocketAddr,
    pub started_at: Instant,
    pub last_seen: Instant,
    pub request_count: u64,
    pub migration_events: Vec<MigrationEvent>,
}

impl ConnectionRecord {
    fn new(key: Vec<u8>, remote: SocketAddr, now: Instant) -> Self {
        Self {
            key,
            current_remote: remote,
            initial_remote: remote,
            started_at: now,
            last_seen: now,
            request_count: 0,
            migration_events: Vec::new(),
        }
    }
}

struct Shard {
    records: Mutex<HashMap<Vec<u8>, ConnectionRecord>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }
}

/// Keyed by *decoded* CID where available; unroutable CIDs are keyed by a
/// hash of the initial 4-tuple instead (spec §3 "Connection record"
/// invariant).
pub struct ConnectionTracker {
    shards: Vec<Shard>,
    idle_ttl: Duration,
}

fn shard_index(key: &[u8]) -> usize {
    key.last().copied().unwrap_or(0) as usize % SHARD_COUNT
}

/// Derive a tracker key for a CID known to be unroutable (or absent):
/// a hash of the initial 4-tuple, per spec §3.
pub fn fallback_key(remote: SocketAddr) -> Vec<u8> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(remote.to_string().as_bytes());
    hasher.finalize().to_be_bytes().to_vec()
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::with_idle_ttl(DEFAULT_IDLE_TTL)
    }

    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Shard::new()).collect(),
            idle_ttl,
        }
    }

    /// Record a routed request for `key` arriving from `remote`. If the
    /// record already exists with a different remote address, appends a
    /// classified migration event (spec §4.I).
    pub fn record_request(&self, key: &[u8], remote: SocketAddr, now: Instant) {
        let shard = &self.shards[shard_index(key)];
        let mut records = shard.records.lock().unwrap();
        match records.get_mut(key) {
            Some(record) => {
                record.request_count += 1;
                record.last_seen = now;
                if record.current_remote != remote {
                    let class = classify(record.current_remote, remote);
                    info!(
                        old = %record.current_remote,
                        new = %remote,
                        class = ?class,
                        "path migration detected"
                    );
                    record.migration_events.push(MigrationEvent {
                        at: now,
                        old_addr: record.current_remote,
                        new_addr: remote,
                        class,
                        validated: true,
                    });
                    record.current_remote = remote;
                }
            }
            None => {
                let mut record = ConnectionRecord::new(key.to_vec(), remote, now);
                record.request_count = 1;
                records.insert(key.to_vec(), record);
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<ConnectionRecord> {
        let shard = &self.shards[shard_index(key)];
        shard.records.lock().unwrap().get(key).cloned()
    }

    /// Snapshot of all records, for the admin tracker endpoint.
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.shards
            .iter()
            .flat_map(|s| s.records.lock().unwrap().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Drop records whose `last_seen` is older than `idle_ttl`. Spec §3:
    /// "TTL eviction scans every minute and drops records whose last-seen
    /// is older than 5 minutes."
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut records = shard.records.lock().unwrap();
            let before = records.len();
            records.retain(|_, r| now.saturating_duration_since(r.last_seen) < self.idle_ttl);
            evicted += before - records.len();
        }
        evicted
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    // Scenario 6 from spec §8: migration detection across a public IP change.
    #[test]
    fn migration_is_recorded_once() {
        let tracker = ConnectionTracker::new();
        let key = vec![1, 2, 3];
        let t0 = Instant::now();
        tracker.record_request(&key, addr("10.0.0.1:5000"), t0);
        let t1 = t0 + Duration::from_millis(10);
        tracker.record_request(&key, addr("203.0.113.7:5000"), t1);

        let record = tracker.get(&key).unwrap();
        assert_eq!(record.migration_events.len(), 1);
        let event = record.migration_events.last().unwrap();
        assert_eq!(event.old_addr, addr("10.0.0.1:5000"));
        assert_eq!(event.new_addr, addr("203.0.113.7:5000"));
    }

    #[test]
    fn same_remote_does_not_create_migration() {
        let tracker = ConnectionTracker::new();
        let key = vec![9];
        let now = Instant::now();
        tracker.record_request(&key, addr("10.0.0.1:1"), now);
        tracker.record_request(&key, addr("10.0.0.1:1"), now);
        assert!(tracker.get(&key).unwrap().migration_events.is_empty());
    }

    #[test]
    fn eviction_drops_stale_records() {
        let tracker = ConnectionTracker::with_idle_ttl(Duration::from_millis(5));
        let key = vec![7];
        let t0 = Instant::now();
        tracker.record_request(&key, addr("10.0.0.1:1"), t0);
        let evicted = tracker.evict_expired(t0 + Duration::from_millis(50));
        assert_eq!(evicted, 1);
        assert!(tracker.get(&key).is_none());
    }
}
