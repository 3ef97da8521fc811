//! Health Checker (spec §4.D): periodic TCP/HTTP probes with hysteresis.
//!
//! Grounded on the teacher's `selenia_core::os::timer` periodic-tick shape
//! and design note 9 ("background tasks are cooperative tasks with
//! explicit shutdown channels; never rely on finalizers") — the probe loop
//! here takes a `tokio::sync::watch` shutdown signal rather than relying on
//! `Drop`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendRegistry};

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub path: Option<String>,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(3),
            path: None,
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Probe a single backend once: TCP connect, optionally followed by a bare
/// HTTP/1.1 GET of `path` when one is configured. Returns the measured
/// round-trip on success.
async fn probe_once(backend: &Backend, cfg: &ProbeConfig) -> Result<Duration, ()> {
    let started = Instant::now();
    let addr = backend
        .upstream_url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .split('/')
        .next()
        .unwrap_or_default();

    let connect = timeout(cfg.timeout, TcpStream::connect(addr));
    let mut stream = match connect.await {
        Ok(Ok(s)) => s,
        _ => return Err(()),
    };

    if let Some(path) = &cfg.path {
        let request = format!("GET {path} HTTP/1.0\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
        if timeout(cfg.timeout, stream.write_all(request.as_bytes()))
            .await
            .is_err()
        {
            return Err(());
        }
    }

    Ok(started.elapsed())
}

/// Apply one probe outcome's hysteresis, per spec §4.D:
/// `healthy -> unhealthy` requires `unhealthy_threshold` consecutive
/// failures; `unhealthy -> healthy` requires `healthy_threshold` consecutive
/// successes.
fn apply_outcome(backend: &Backend, cfg: &ProbeConfig, outcome: Result<Duration, ()>) {
    match outcome {
        Ok(elapsed) => {
            backend.record_response_time(elapsed.as_secs_f64() * 1000.0);
            backend.consecutive_failure.store(0, Ordering::Relaxed);
            let successes = backend.consecutive_success.fetch_add(1, Ordering::Relaxed) + 1;
            if !backend.is_alive() && successes >= cfg.healthy_threshold {
                backend.alive.store(true, Ordering::Relaxed);
                info!(server_id = backend.server_id, "backend became healthy");
            }
        }
        Err(()) => {
            backend.consecutive_success.store(0, Ordering::Relaxed);
            let failures = backend.consecutive_failure.fetch_add(1, Ordering::Relaxed) + 1;
            if backend.is_alive() && failures >= cfg.unhealthy_threshold {
                backend.alive.store(false, Ordering::Relaxed);
                warn!(server_id = backend.server_id, "backend became unhealthy");
            }
        }
    }
}

/// Run the probe loop until `shutdown` fires. Each tick probes every
/// currently-registered backend concurrently; a backend removed from the
/// registry between ticks is simply absent from the next tick's snapshot —
/// spec §4.D: "outstanding probes are aborted on the next scheduling tick."
pub async fn run(
    registry: Arc<BackendRegistry>,
    cfg: ProbeConfig,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("health checker shutting down");
                    return;
                }
            }
        }

        let backends = registry.all();
        debug!(count = backends.len(), "probing backends");
        let mut handles = Vec::with_capacity(backends.len());
        for backend in backends {
            let cfg = cfg.clone();
            handles.push(tokio::spawn(async move {
                let outcome = probe_once(&backend, &cfg).await;
                apply_outcome(&backend, &cfg, outcome);
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hysteresis_requires_consecutive_successes() {
        let backend = Backend::new(1, "http://127.0.0.1:1".into(), 1, 10, "us".into());
        let cfg = ProbeConfig {
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            ..Default::default()
        };
        apply_outcome(&backend, &cfg, Ok(Duration::from_millis(5)));
        assert!(!backend.is_alive(), "one success must not flip to healthy");
        apply_outcome(&backend, &cfg, Ok(Duration::from_millis(5)));
        assert!(backend.is_alive());
    }

    #[test]
    fn hysteresis_requires_consecutive_failures() {
        let backend = Backend::new(1, "http://127.0.0.1:1".into(), 1, 10, "us".into());
        backend.alive.store(true, Ordering::Relaxed);
        let cfg = ProbeConfig {
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            ..Default::default()
        };
        apply_outcome(&backend, &cfg, Err(()));
        assert!(backend.is_alive(), "one failure must not flip to unhealthy");
        apply_outcome(&backend, &cfg, Err(()));
        assert!(!backend.is_alive());
    }

    #[test]
    fn ema_halves_toward_new_sample() {
        let backend = Backend::new(1, "http://127.0.0.1:1".into(), 1, 10, "us".into());
        backend.record_response_time(100.0);
        backend.record_response_time(0.0);
        assert!((backend.response_time_ema_ms() - 50.0).abs() < 1e-9);
    }
}
