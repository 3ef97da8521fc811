//! Stateless Dispatcher (spec §4.G): parse the destination CID, locate a
//! config + backend, fall back to the policy selector when CID routing
//! doesn't apply.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use qlb_core::backend::{Backend, BackendRegistry};
use qlb_core::codec::{self, UNROUTABLE_ROTATION};
use qlb_core::config_registry::ConfigRegistry;
use qlb_core::policy::PolicySelector;
use qlb_core::tracker::{fallback_key, ConnectionTracker};
use qlb_core::{QlbError, QlbResult};

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Destination CID exposed by the HTTP/3 layer; `None` for HTTP/1.1 or
    /// HTTP/2 fallback traffic (spec §4.G step 1).
    pub destination_cid: Option<Vec<u8>>,
    pub remote: SocketAddr,
    pub session_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingMethod {
    Cid,
    Fallback,
}

impl RoutingMethod {
    /// The `X-Routing-Method` header value spec §6/§7 requires.
    pub fn header_value(self) -> &'static str {
        match self {
            RoutingMethod::Cid => "cid",
            RoutingMethod::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub backend: Arc<Backend>,
    pub method: RoutingMethod,
    pub rotation_id: Option<u8>,
    /// Freshly encoded CID to advertise to the HTTP/3 layer so the client
    /// may migrate to a routable id on its next outbound packet (spec §4.G
    /// step 5). Only set on the fallback path.
    pub advertised_cid: Option<Vec<u8>>,
}

pub struct Dispatcher {
    configs: Arc<ConfigRegistry>,
    backends: Arc<BackendRegistry>,
    tracker: Arc<ConnectionTracker>,
    policy: Arc<PolicySelector>,
}

impl Dispatcher {
    pub fn new(
        configs: Arc<ConfigRegistry>,
        backends: Arc<BackendRegistry>,
        tracker: Arc<ConnectionTracker>,
        policy: Arc<PolicySelector>,
    ) -> Self {
        Self {
            configs,
            backends,
            tracker,
            policy,
        }
    }

    pub fn dispatch(&self, ctx: &RequestContext, now: Instant) -> QlbResult<DispatchResult> {
        let Some(cid) = ctx.destination_cid.as_ref() else {
            return self.fallback(ctx, now);
        };
        if cid.is_empty() {
            return Err(QlbError::Truncated);
        }

        let rotation_id = cid[0] >> 5;
        if rotation_id == UNROUTABLE_ROTATION {
            info!("unroutable cid, falling back");
            return self.fallback(ctx, now);
        }

        let Some(config) = self.configs.get(rotation_id) else {
            warn!(rotation_id, "no installed config for rotation, falling back");
            return self.fallback(ctx, now);
        };

        match codec::decode(&config, cid) {
            Ok(decoded) => {
                let server_id = decoded.server_id as u16;
                match self.backends.get(server_id) {
                    Some(backend) if backend.is_alive() && backend.breaker.admit(now) => {
                        self.tracker.record_request(cid, ctx.remote, now);
                        Ok(DispatchResult {
                            backend,
                            method: RoutingMethod::Cid,
                            rotation_id: Some(rotation_id),
                            advertised_cid: None,
                        })
                    }
                    Some(_backend) => {
                        // Decode succeeded but the backend is unavailable.
                        // Spec §4.G: never silently convert this into a
                        // fresh assignment without reporting it.
                        warn!(server_id, rotation_id, "routing miss: decoded backend is not live");
                        self.fallback(ctx, now)
                    }
                    None => {
                        warn!(server_id, rotation_id, "routing miss: unknown server id");
                        self.fallback(ctx, now)
                    }
                }
            }
            Err(e) => {
                warn!(rotation_id, error = ?e, "cid decode failed, falling back");
                self.fallback(ctx, now)
            }
        }
    }

    fn fallback(&self, ctx: &RequestContext, now: Instant) -> QlbResult<DispatchResult> {
        let alive = self.backends.alive_backends();
        let client_ip = ctx.remote.ip().to_string();
        let chosen = self
            .policy
            .select(&alive, &client_ip, ctx.session_token.as_deref())
            .ok_or(QlbError::NoHealthyBackend)?;

        let key = ctx
            .destination_cid
            .clone()
            .unwrap_or_else(|| fallback_key(ctx.remote));
        self.tracker.record_request(&key, ctx.remote, now);

        let (rotation_id, advertised_cid) = match self.configs.current_config() {
            Some(config) => {
                let cid = codec::encode(&config, chosen.server_id as u64, None)?;
                (Some(config.rotation_id), Some(cid))
            }
            None => (None, None),
        };

        Ok(DispatchResult {
            backend: chosen,
            method: RoutingMethod::Fallback,
            rotation_id,
            advertised_cid,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qlb_core::codec::{Algorithm, Config};
    use std::time::Duration;

    fn config(rotation_id: u8) -> Config {
        Config {
            rotation_id,
            algorithm: Algorithm::Plaintext,
            server_id_len: 2,
            cid_len: 8,
            nonce_len: 0,
            key: None,
            length_self_encoding: false,
        }
    }

    fn setup() -> (Dispatcher, Arc<BackendRegistry>, Arc<ConfigRegistry>) {
        let configs = Arc::new(ConfigRegistry::new());
        configs.install(config(1)).unwrap();
        configs.activate(1).unwrap();
        let backends = Arc::new(BackendRegistry::new(Duration::from_secs(300)));
        let tracker = Arc::new(ConnectionTracker::new());
        let policy = Arc::new(PolicySelector::new(qlb_core::policy::Algorithm::WeightedRoundRobin));
        let dispatcher = Dispatcher::new(configs.clone(), backends.clone(), tracker, policy);
        (dispatcher, backends, configs)
    }

    #[test]
    fn cid_routes_directly_to_live_backend() {
        let (dispatcher, backends, configs) = setup();
        let backend = backends.register("http://b1".into(), 1, 10, "us".into());
        backend.alive.store(true, std::sync::atomic::Ordering::Relaxed);
        let cfg = configs.get(1).unwrap();
        let cid = codec::encode(&cfg, backend.server_id as u64, None).unwrap();

        let ctx = RequestContext {
            destination_cid: Some(cid),
            remote: "10.0.0.1:9000".parse().unwrap(),
            session_token: None,
        };
        let result = dispatcher.dispatch(&ctx, Instant::now()).unwrap();
        assert_eq!(result.method, RoutingMethod::Cid);
        assert_eq!(result.backend.server_id, backend.server_id);
        assert!(result.advertised_cid.is_none());
    }

    #[test]
    fn unroutable_cid_falls_back_and_advertises_fresh_cid() {
        let (dispatcher, backends, _configs) = setup();
        let backend = backends.register("http://b1".into(), 1, 10, "us".into());
        backend.alive.store(true, std::sync::atomic::Ordering::Relaxed);

        let cid = vec![0xE3, 1, 2, 3, 4, 5, 6, 7];
        let ctx = RequestContext {
            destination_cid: Some(cid),
            remote: "10.0.0.1:9000".parse().unwrap(),
            session_token: None,
        };
        let result = dispatcher.dispatch(&ctx, Instant::now()).unwrap();
        assert_eq!(result.method, RoutingMethod::Fallback);
        assert!(result.advertised_cid.is_some());
    }

    #[test]
    fn no_cid_and_no_healthy_backend_errors() {
        let (dispatcher, _backends, _configs) = setup();
        let ctx = RequestContext {
            destination_cid: None,
            remote: "10.0.0.1:1".parse().unwrap(),
            session_token: None,
        };
        let err = dispatcher.dispatch(&ctx, Instant::now()).unwrap_err();
        assert!(matches!(err, QlbError::NoHealthyBackend));
    }

    #[test]
    fn fallback_skips_backend_with_open_breaker() {
        let (dispatcher, backends, _configs) = setup();
        let tripped = backends.register("http://tripped".into(), 1, 10, "us".into());
        tripped.alive.store(true, std::sync::atomic::Ordering::Relaxed);
        let now = Instant::now();
        for _ in 0..10 {
            tripped.breaker.on_failure(now);
        }
        let healthy = backends.register("http://healthy".into(), 1, 10, "us".into());
        healthy.alive.store(true, std::sync::atomic::Ordering::Relaxed);

        let ctx = RequestContext {
            destination_cid: None,
            remote: "10.0.0.1:1".parse().unwrap(),
            session_token: None,
        };
        let result = dispatcher.dispatch(&ctx, now).unwrap();
        assert_eq!(result.backend.server_id, healthy.server_id);
    }

    #[test]
    fn decoded_backend_down_is_reported_as_routing_miss_not_silent() {
        let (dispatcher, backends, configs) = setup();
        let down = backends.register("http://down".into(), 1, 10, "us".into());
        let up = backends.register("http://up".into(), 1, 10, "us".into());
        up.alive.store(true, std::sync::atomic::Ordering::Relaxed);
        let cfg = configs.get(1).unwrap();
        let cid = codec::encode(&cfg, down.server_id as u64, None).unwrap();

        let ctx = RequestContext {
            destination_cid: Some(cid),
            remote: "10.0.0.1:1".parse().unwrap(),
            session_token: None,
        };
        let result = dispatcher.dispatch(&ctx, Instant::now()).unwrap();
        assert_eq!(result.method, RoutingMethod::Fallback);
        assert_eq!(result.backend.server_id, up.server_id);
    }
}
