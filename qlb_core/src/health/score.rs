//! Health Score (spec §4.F): a pure function over a backend's own counters.

use std::time::{Duration, Instant};

use crate::backend::Backend;

const WINDOW: Duration = Duration::from_secs(300);

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// `score = 0.4*(1-error_rate) + 0.3*(1-clamp(latency_ms/1000)) +
/// 0.2*(1-clamp(connections/capacity)) + 0.1*breaker_weight`.
pub fn score_of(backend: &Backend, now: Instant) -> f64 {
    let error_rate = backend.error_rate(now, WINDOW);
    let latency_term = clamp01(backend.response_time_ema_ms() / 1000.0);
    let capacity = backend.capacity.max(1) as f64;
    let connections = backend.connections.load(std::sync::atomic::Ordering::Relaxed) as f64;
    let utilization_term = clamp01(connections / capacity);
    let breaker_weight = backend.breaker.weight(now);

    0.4 * (1.0 - error_rate) + 0.3 * (1.0 - latency_term) + 0.2 * (1.0 - utilization_term) + 0.1 * breaker_weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_healthy_backend_scores_one() {
        let backend = Backend::new(1, "http://x".into(), 1, 100, "us".into());
        let now = Instant::now();
        assert!((score_of(&backend, now) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn open_breaker_reduces_score() {
        let backend = Backend::new(1, "http://x".into(), 1, 100, "us".into());
        let now = Instant::now();
        for _ in 0..10 {
            backend.breaker.on_failure(now);
        }
        let score = score_of(&backend, now);
        assert!(score < 1.0);
    }

    #[test]
    fn high_utilization_reduces_score() {
        let backend = Backend::new(1, "http://x".into(), 1, 10, "us".into());
        backend
            .connections
            .store(10, std::sync::atomic::Ordering::Relaxed);
        let now = Instant::now();
        let score = score_of(&backend, now);
        assert!(score < 1.0);
    }
}
