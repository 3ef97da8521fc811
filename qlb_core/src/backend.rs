//! Backend Registry (spec §4.C): the ordered backend pool plus a direct
//! `server_id -> Backend` map.
//!
//! Grounded on `forge_of_stories::network::server::session::SessionRegistry`:
//! the same "primary store + reverse index, monotonic id allocator" shape,
//! adapted from session ids to the 16-bit server ids spec §4.C calls for.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::info;

use crate::health::breaker::{Breaker, BreakerState};
use crate::health::score::score_of;

/// Bounded ring of recent outcome timestamps, used by the health-score
/// window (spec §4.F: "computed over the last 5 minutes using bounded
/// timestamp rings").
#[derive(Debug, Default)]
pub struct TimestampRing {
    entries: Mutex<VecDeque<Instant>>,
    capacity: usize,
}

impl TimestampRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, at: Instant) {
        let mut guard = self.entries.lock().unwrap();
        guard.push_back(at);
        while guard.len() > self.capacity {
            guard.pop_front();
        }
    }

    /// Count of entries within `window` of `now`.
    pub fn count_within(&self, now: Instant, window: Duration) -> u64 {
        let guard = self.entries.lock().unwrap();
        guard
            .iter()
            .filter(|t| now.saturating_duration_since(**t) <= window)
            .count() as u64
    }
}

/// A backend in the pool (spec §3 "Backend").
pub struct Backend {
    pub server_id: u16,
    pub upstream_url: String,
    pub weight: u32,
    pub capacity: u32,
    pub region: String,

    pub alive: std::sync::atomic::AtomicBool,
    pub consecutive_success: AtomicU32,
    pub consecutive_failure: AtomicU32,
    /// Response-time EMA in milliseconds, stored as bits of an f64 for
    /// lock-free atomic updates (spec §5: "read without locking for
    /// telemetry").
    response_time_ema_bits: AtomicU64,

    pub connections: AtomicU32,
    pub requests_total: AtomicU64,

    pub breaker: Breaker,
    pub request_events: TimestampRing,
    pub error_events: TimestampRing,

    /// Smooth weighted round-robin accumulator (spec §4.H). Only touched
    /// under the policy selector's own lock, kept here because it's
    /// per-backend state.
    pub wrr_current_weight: std::sync::atomic::AtomicI64,
}

const RING_CAPACITY: usize = 4096;

impl Backend {
    pub fn new(server_id: u16, upstream_url: String, weight: u32, capacity: u32, region: String) -> Self {
        Self::with_breaker(server_id, upstream_url, weight, capacity, region, Breaker::new())
    }

    pub fn with_breaker(
        server_id: u16,
        upstream_url: String,
        weight: u32,
        capacity: u32,
        region: String,
        breaker: Breaker,
    ) -> Self {
        Self {
            server_id,
            upstream_url,
            weight,
            capacity,
            region,
            alive: std::sync::atomic::AtomicBool::new(false),
            consecutive_success: AtomicU32::new(0),
            consecutive_failure: AtomicU32::new(0),
            response_time_ema_bits: AtomicU64::new(0f64.to_bits()),
            connections: AtomicU32::new(0),
            requests_total: AtomicU64::new(0),
            breaker,
            request_events: TimestampRing::new(RING_CAPACITY),
            error_events: TimestampRing::new(RING_CAPACITY),
            wrr_current_weight: std::sync::atomic::AtomicI64::new(0),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    pub fn response_time_ema_ms(&self) -> f64 {
        f64::from_bits(self.response_time_ema_bits.load(Ordering::Relaxed))
    }

    /// Update the response-time EMA per spec §4.D: `ema <- (ema + sample)/2`.
    pub fn record_response_time(&self, sample_ms: f64) {
        loop {
            let cur_bits = self.response_time_ema_bits.load(Ordering::Relaxed);
            let cur = f64::from_bits(cur_bits);
            let next = if cur == 0.0 { sample_ms } else { (cur + sample_ms) / 2.0 };
            if self
                .response_time_ema_bits
                .compare_exchange_weak(cur_bits, next.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    pub fn record_request(&self, now: Instant) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.request_events.push(now);
    }

    pub fn record_error(&self, now: Instant) {
        self.error_events.push(now);
    }

    /// error_rate / request_rate windows computed over the trailing 5
    /// minutes, per spec §4.F.
    pub fn error_rate(&self, now: Instant, window: Duration) -> f64 {
        let requests = self.request_events.count_within(now, window).max(1) as f64;
        let errors = self.error_events.count_within(now, window) as f64;
        (errors / requests).clamp(0.0, 1.0)
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state(Instant::now())
    }

    /// Combined health score (spec §4.F), a pure function over this
    /// backend's own counters so breaker/score/backend never need
    /// back-pointers (design note: "cyclic references ... resolved by
    /// making the breaker and score pure functions over backend counters").
    pub fn health_score(&self, now: Instant) -> f64 {
        score_of(self, now)
    }
}

/// Append-only backend pool plus `server_id -> index` map (spec §4.C).
pub struct BackendRegistry {
    backends: RwLock<Vec<std::sync::Arc<Backend>>>,
    by_server_id: RwLock<std::collections::HashMap<u16, usize>>,
    next_server_id: AtomicU32,
    /// `server_id -> removed_at`, retained until `2*idle_ttl` has elapsed so
    /// a freed id is never reused while late packets might still carry it
    /// (spec §4.C invariant).
    retired: Mutex<std::collections::HashMap<u16, Instant>>,
    idle_ttl: Duration,
    breaker_threshold: u32,
    breaker_open_timeout: Duration,
}

impl BackendRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self::with_breaker_params(idle_ttl, 5, Duration::from_secs(30))
    }

    /// Like [`new`](Self::new), but every backend registered afterwards gets
    /// a breaker built from `breaker_threshold`/`breaker_open_timeout`
    /// instead of `Breaker`'s hardcoded defaults (spec §6 `BREAKER_THRESHOLD`
    /// / `BREAKER_OPEN_MS`).
    pub fn with_breaker_params(idle_ttl: Duration, breaker_threshold: u32, breaker_open_timeout: Duration) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            by_server_id: RwLock::new(std::collections::HashMap::new()),
            next_server_id: AtomicU32::new(1),
            retired: Mutex::new(std::collections::HashMap::new()),
            idle_ttl,
            breaker_threshold,
            breaker_open_timeout,
        }
    }

    /// Register a new backend, assigning the next 16-bit server id (or the
    /// next id that hasn't been reserved by a still-cooling-down removal).
    pub fn register(&self, upstream_url: String, weight: u32, capacity: u32, region: String) -> std::sync::Arc<Backend> {
        let server_id = self.allocate_server_id();
        let breaker = Breaker::with_params(self.breaker_threshold, self.breaker_open_timeout);
        let backend = std::sync::Arc::new(Backend::with_breaker(server_id, upstream_url, weight, capacity, region, breaker));
        let mut backends = self.backends.write().unwrap();
        let idx = backends.len();
        backends.push(backend.clone());
        self.by_server_id.write().unwrap().insert(server_id, idx);
        info!(server_id, "registered backend");
        backend
    }

    fn allocate_server_id(&self) -> u16 {
        let cooldown = self.idle_ttl * 2;
        loop {
            let candidate = self.next_server_id.fetch_add(1, Ordering::Relaxed) as u16;
            let retired = self.retired.lock().unwrap();
            match retired.get(&candidate) {
                Some(removed_at) if removed_at.elapsed() < cooldown => continue,
                _ => return candidate,
            }
        }
    }

    pub fn get(&self, server_id: u16) -> Option<std::sync::Arc<Backend>> {
        let by_id = self.by_server_id.read().unwrap();
        let idx = *by_id.get(&server_id)?;
        self.backends.read().unwrap().get(idx).cloned()
    }

    pub fn all(&self) -> Vec<std::sync::Arc<Backend>> {
        self.backends.read().unwrap().clone()
    }

    /// Candidates for policy selection: healthy per the probe loop *and*
    /// not currently breaker-open (spec §4.E: "a backend whose breaker is
    /// open is treated as non-live for selection").
    pub fn alive_backends(&self) -> Vec<std::sync::Arc<Backend>> {
        self.all()
            .into_iter()
            .filter(|b| b.is_alive() && b.breaker_state() != BreakerState::Open)
            .collect()
    }

    /// Remove a backend. Its `server_id` is only handed back out by
    /// `allocate_server_id` after `2*idle_ttl`.
    pub fn remove(&self, server_id: u16) {
        let mut by_id = self.by_server_id.write().unwrap();
        if let Some(idx) = by_id.remove(&server_id) {
            let mut backends = self.backends.write().unwrap();
            if idx < backends.len() {
                backends.remove(idx);
                // Reindex everything after the removed slot.
                for i in by_id.values_mut() {
                    if *i > idx {
                        *i -= 1;
                    }
                }
            }
        }
        self.retired.lock().unwrap().insert(server_id, Instant::now());
        info!(server_id, "removed backend, server_id cooling down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alive_backends_excludes_breaker_open() {
        let registry = BackendRegistry::new(Duration::from_secs(300));
        let up = registry.register("http://up".into(), 1, 10, "us".into());
        up.alive.store(true, Ordering::Relaxed);
        let tripped = registry.register("http://tripped".into(), 1, 10, "us".into());
        tripped.alive.store(true, Ordering::Relaxed);
        let now = Instant::now();
        for _ in 0..10 {
            tripped.breaker.on_failure(now);
        }

        let candidates = registry.alive_backends();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].server_id, up.server_id);
    }
}
