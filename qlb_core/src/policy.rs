//! Policy Selector (spec §4.H): the fallback selection strategies used
//! whenever CID routing doesn't apply.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use crc32fast::Hasher;

use crate::backend::Backend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    WeightedRoundRobin,
    LeastConnections,
    IpHash,
    SessionAffinity,
}

impl std::str::FromStr for Algorithm {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weighted_round_robin" | "wrr" => Ok(Algorithm::WeightedRoundRobin),
            "least_connections" | "least_conn" => Ok(Algorithm::LeastConnections),
            "ip_hash" => Ok(Algorithm::IpHash),
            "session_affinity" => Ok(Algorithm::SessionAffinity),
            other => Err(format!("unknown load balancing algorithm: {other}")),
        }
    }
}

/// Smooth weighted round-robin: each backend accumulates `current_weight +=
/// weight`, selection picks the max, then subtracts `total_weight` from the
/// winner. Deterministic and starvation-free for constant weights.
fn weighted_round_robin(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    if backends.is_empty() {
        return None;
    }
    let total_weight: i64 = backends.iter().map(|b| b.weight as i64).sum();
    if total_weight == 0 {
        return backends.first().cloned();
    }
    let mut winner: Option<&Arc<Backend>> = None;
    let mut winner_weight = i64::MIN;
    for b in backends {
        let current = b.wrr_current_weight.fetch_add(b.weight as i64, Ordering::Relaxed) + b.weight as i64;
        if current > winner_weight {
            winner_weight = current;
            winner = Some(b);
        }
    }
    let winner = winner.unwrap();
    winner.wrr_current_weight.fetch_sub(total_weight, Ordering::Relaxed);
    Some(winner.clone())
}

/// Min over `connections` among alive backends; ties broken by lowest
/// `server_id`.
fn least_connections(backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
    backends
        .iter()
        .min_by_key(|b| (b.connections.load(Ordering::Relaxed), b.server_id))
        .cloned()
}

/// CRC32 of the client IP mod alive-count.
fn ip_hash(backends: &[Arc<Backend>], client_ip: &str) -> Option<Arc<Backend>> {
    if backends.is_empty() {
        return None;
    }
    let mut hasher = Hasher::new();
    hasher.update(client_ip.as_bytes());
    let digest = hasher.finalize();
    let idx = (digest as usize) % backends.len();
    backends.get(idx).cloned()
}

/// Opaque session-token -> backend mapping (spec §4.H "session affinity").
#[derive(Default)]
pub struct SessionAffinityTable {
    map: Mutex<HashMap<String, u16>>,
}

impl SessionAffinityTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, token: &str) -> Option<u16> {
        self.map.lock().unwrap().get(token).copied()
    }

    pub fn install(&self, token: String, server_id: u16) {
        self.map.lock().unwrap().insert(token, server_id);
    }
}

/// Selects a backend from `alive` per `algorithm`. `client_ip` is required
/// for `IpHash`; `session_token` + `affinity` for `SessionAffinity`.
pub struct PolicySelector {
    pub algorithm: std::sync::Mutex<Algorithm>,
    pub affinity: SessionAffinityTable,
}

impl PolicySelector {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm: std::sync::Mutex::new(algorithm),
            affinity: SessionAffinityTable::new(),
        }
    }

    pub fn set_algorithm(&self, algorithm: Algorithm) {
        *self.algorithm.lock().unwrap() = algorithm;
    }

    pub fn current_algorithm(&self) -> Algorithm {
        *self.algorithm.lock().unwrap()
    }

    /// `session_token` only has any effect when the configured algorithm is
    /// `SessionAffinity` (spec §4.H lists it as one of four *selectable*
    /// algorithms, not a blanket override of whichever one is configured).
    pub fn select(
        &self,
        alive: &[Arc<Backend>],
        client_ip: &str,
        session_token: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let algorithm = self.current_algorithm();
        let use_affinity = algorithm == Algorithm::SessionAffinity;

        if use_affinity {
            if let Some(token) = session_token {
                if let Some(server_id) = self.affinity.lookup(token) {
                    if let Some(backend) = alive.iter().find(|b| b.server_id == server_id) {
                        return Some(backend.clone());
                    }
                }
            }
        }

        let chosen = match algorithm {
            Algorithm::WeightedRoundRobin => weighted_round_robin(alive),
            Algorithm::LeastConnections => least_connections(alive),
            Algorithm::IpHash => ip_hash(alive, client_ip),
            Algorithm::SessionAffinity => weighted_round_robin(alive),
        };

        if use_affinity {
            if let (Some(token), Some(backend)) = (session_token, &chosen) {
                self.affinity.install(token.to_string(), backend.server_id);
            }
        }
        chosen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(id: u16, weight: u32) -> Arc<Backend> {
        Arc::new(Backend::new(id, format!("http://b{id}"), weight, 100, "us".into()))
    }

    #[test]
    fn weighted_round_robin_hits_each_backend_weight_times() {
        let backends = vec![backend(1, 5), backend(2, 1), backend(3, 1)];
        let total: u32 = backends.iter().map(|b| b.weight).sum();
        let mut counts: HashMap<u16, u32> = HashMap::new();
        for _ in 0..total {
            let picked = weighted_round_robin(&backends).unwrap();
            *counts.entry(picked.server_id).or_default() += 1;
        }
        for b in &backends {
            assert_eq!(counts.get(&b.server_id).copied().unwrap_or(0), b.weight);
        }
    }

    #[test]
    fn least_connections_picks_min_then_lowest_id() {
        let backends = vec![backend(2, 1), backend(1, 1)];
        backends[0].connections.store(3, Ordering::Relaxed);
        backends[1].connections.store(3, Ordering::Relaxed);
        let picked = least_connections(&backends).unwrap();
        assert_eq!(picked.server_id, 1);
    }

    #[test]
    fn session_affinity_sticks_to_installed_backend() {
        let backends = vec![backend(1, 1), backend(2, 1)];
        let selector = PolicySelector::new(Algorithm::SessionAffinity);
        let first = selector.select(&backends, "1.2.3.4", Some("tok")).unwrap();
        for _ in 0..10 {
            let again = selector.select(&backends, "1.2.3.4", Some("tok")).unwrap();
            assert_eq!(again.server_id, first.server_id);
        }
    }

    #[test]
    fn non_affinity_algorithm_ignores_session_token() {
        let backends = vec![backend(2, 1), backend(1, 1)];
        backends[0].connections.store(3, Ordering::Relaxed);
        backends[1].connections.store(3, Ordering::Relaxed);
        let selector = PolicySelector::new(Algorithm::LeastConnections);
        // A session token carried on a least-connections-configured request
        // must not stick it to a backend or populate the affinity table.
        let picked = selector.select(&backends, "1.2.3.4", Some("tok")).unwrap();
        assert_eq!(picked.server_id, 1);
        assert!(selector.affinity.lookup("tok").is_none());
    }

    #[test]
    fn ip_hash_is_stable_for_same_ip_and_membership() {
        let backends = vec![backend(1, 1), backend(2, 1), backend(3, 1)];
        let a = ip_hash(&backends, "203.0.113.7").unwrap();
        let b = ip_hash(&backends, "203.0.113.7").unwrap();
        assert_eq!(a.server_id, b.server_id);
    }
}
