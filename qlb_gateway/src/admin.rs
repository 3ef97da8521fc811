//! Admin/telemetry JSON API (spec §6).
//!
//! Spec §1 places "the HTTP/3 and HTTP/2 servers that terminate TLS/QUIC"
//! out of scope as external collaborators, but §6 explicitly specifies this
//! small JSON-over-HTTP admin surface as part of the core contract. Rather
//! than reuse the teacher's from-scratch `selenia_http` parser (which
//! implements exactly the out-of-scope protocol termination), this is
//! served with a minimal `hyper` 0.14 HTTP/1.1 listener — the narrowest
//! real crate that can serve a handful of JSON routes.
//!
//! Route matching is a flat `(method, path)` match rather than the
//! teacher's radix-tree `selenia_http::router::Router`: the admin surface
//! has a fixed, small set of static routes (no path params), so the extra
//! structure wouldn't pull its weight here.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use qlb_core::backend::BackendRegistry;
use qlb_core::codec::{self, Algorithm, Config};
use qlb_core::config_registry::ConfigRegistry;
use qlb_core::policy::PolicySelector;
use qlb_core::tracker::ConnectionTracker;

pub struct AdminState {
    pub configs: Arc<ConfigRegistry>,
    pub backends: Arc<BackendRegistry>,
    pub tracker: Arc<ConnectionTracker>,
    pub policy: Arc<PolicySelector>,
}

#[derive(Deserialize)]
struct InstallConfigRequest {
    algorithm: String,
    rotation_id: u8,
    server_id_len: u8,
    cid_len: u8,
    #[serde(default)]
    nonce_len: u8,
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    length_self_encoding: bool,
}

#[derive(Deserialize)]
struct ActivateRequest {
    rotation_id: u8,
}

#[derive(Deserialize)]
struct AlgorithmRequest {
    algorithm: String,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    json_response(status, json!({ "error": message.into() }))
}

fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::Plaintext => "plaintext",
        Algorithm::StreamCipher => "stream-cipher",
        Algorithm::BlockCipher => "block-cipher",
    }
}

fn config_to_json(config: &Config) -> serde_json::Value {
    json!({
        "rotation_id": config.rotation_id,
        "algorithm": algorithm_name(config.algorithm),
        "server_id_len": config.server_id_len,
        "cid_len": config.cid_len,
        "nonce_len": config.nonce_len,
        "has_key": config.key.is_some(),
        "length_self_encoding": config.length_self_encoding,
    })
}

fn backend_to_json(backend: &qlb_core::backend::Backend, now: Instant) -> serde_json::Value {
    json!({
        "server_id": backend.server_id,
        "upstream_url": backend.upstream_url,
        "weight": backend.weight,
        "capacity": backend.capacity,
        "region": backend.region,
        "alive": backend.is_alive(),
        "connections": backend.connections.load(std::sync::atomic::Ordering::Relaxed),
        "requests_total": backend.requests_total.load(std::sync::atomic::Ordering::Relaxed),
        "response_time_ema_ms": backend.response_time_ema_ms(),
        "breaker_state": format!("{:?}", backend.breaker_state()),
        "health_score": backend.health_score(now),
    })
}

async fn handle(req: Request<Body>, state: Arc<AdminState>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let now = Instant::now();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/api/quic-lb") => {
            let backends: Vec<_> = state
                .backends
                .all()
                .iter()
                .map(|b| backend_to_json(b, now))
                .collect();
            json_response(
                StatusCode::OK,
                json!({
                    "active_rotation": state.configs.current(),
                    "backends": backends,
                }),
            )
        }

        (&Method::GET, "/api/quic-lb/config") => {
            let configs: Vec<_> = state.configs.all().iter().map(config_to_json).collect();
            json_response(
                StatusCode::OK,
                json!({
                    "active_rotation": state.configs.current(),
                    "configs": configs,
                }),
            )
        }

        (&Method::POST, "/api/quic-lb/config") => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            match serde_json::from_slice::<InstallConfigRequest>(&body) {
                Ok(parsed) => match build_config(parsed) {
                    Ok(config) => match state.configs.install(config) {
                        Ok(()) => json_response(StatusCode::OK, json!({"status": "installed"})),
                        Err(e) => error_response(StatusCode::BAD_REQUEST, e.to_string()),
                    },
                    Err(message) => error_response(StatusCode::BAD_REQUEST, message),
                },
                Err(e) => error_response(StatusCode::BAD_REQUEST, format!("malformed body: {e}")),
            }
        }

        (&Method::POST, "/api/quic-lb/activate") => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            match serde_json::from_slice::<ActivateRequest>(&body) {
                Ok(parsed) => match state.configs.activate(parsed.rotation_id) {
                    Ok(()) => json_response(StatusCode::OK, json!({"status": "activated"})),
                    Err(_) => error_response(StatusCode::NOT_FOUND, "rotation not installed"),
                },
                Err(e) => error_response(StatusCode::BAD_REQUEST, format!("malformed body: {e}")),
            }
        }

        (&Method::GET, "/api/quic-lb/test-cid") => {
            let Some(active) = state.configs.current_config() else {
                return Ok(error_response(StatusCode::NOT_FOUND, "no active config"));
            };
            let results: Vec<_> = state
                .backends
                .all()
                .iter()
                .map(|b| {
                    let encoded = codec::encode(&active, b.server_id as u64, None);
                    match encoded {
                        Ok(cid) => {
                            let decode_ok = codec::decode(&active, &cid)
                                .map(|d| d.server_id == b.server_id as u64)
                                .unwrap_or(false);
                            json!({
                                "server_id": b.server_id,
                                "encoded_hex": hex_encode(&cid),
                                "roundtrip_ok": decode_ok,
                            })
                        }
                        Err(e) => json!({ "server_id": b.server_id, "error": e.to_string() }),
                    }
                })
                .collect();
            json_response(StatusCode::OK, json!({ "results": results }))
        }

        (&Method::GET, "/api/connections") => {
            let now_wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
            let records: Vec<_> = state
                .tracker
                .snapshot()
                .iter()
                .map(|r| {
                    json!({
                        "key_hex": hex_encode(&r.key),
                        "current_remote": r.current_remote.to_string(),
                        "initial_remote": r.initial_remote.to_string(),
                        "request_count": r.request_count,
                        "migration_count": r.migration_events.len(),
                    })
                })
                .collect();
            json_response(
                StatusCode::OK,
                json!({ "as_of_unix_ms": now_wall.as_millis() as u64, "connections": records }),
            )
        }

        (&Method::GET, "/api/loadbalancer") => json_response(
            StatusCode::OK,
            json!({ "algorithm": format!("{:?}", state.policy.current_algorithm()) }),
        ),

        (&Method::POST, "/api/loadbalancer/algorithm") => {
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap_or_default();
            match serde_json::from_slice::<AlgorithmRequest>(&body) {
                Ok(parsed) => match parsed.algorithm.parse::<qlb_core::policy::Algorithm>() {
                    Ok(algorithm) => {
                        state.policy.set_algorithm(algorithm);
                        json_response(StatusCode::OK, json!({"status": "updated"}))
                    }
                    Err(message) => error_response(StatusCode::BAD_REQUEST, message),
                },
                Err(e) => error_response(StatusCode::BAD_REQUEST, format!("malformed body: {e}")),
            }
        }

        _ => error_response(StatusCode::NOT_FOUND, "no such admin route"),
    };

    Ok(response)
}

fn build_config(req: InstallConfigRequest) -> Result<Config, String> {
    let algorithm = match req.algorithm.as_str() {
        "plaintext" => Algorithm::Plaintext,
        "stream-cipher" => Algorithm::StreamCipher,
        "block-cipher" => Algorithm::BlockCipher,
        other => return Err(format!("unknown algorithm: {other}")),
    };
    let key = match req.key {
        Some(b64) => {
            let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64)
                .map_err(|e| format!("invalid base64 key: {e}"))?;
            if bytes.len() != 16 {
                return Err("key must be 16 bytes".into());
            }
            let mut arr = [0u8; 16];
            arr.copy_from_slice(&bytes);
            Some(arr)
        }
        None => None,
    };
    let config = Config {
        rotation_id: req.rotation_id,
        algorithm,
        server_id_len: req.server_id_len,
        cid_len: req.cid_len,
        nonce_len: req.nonce_len,
        key,
        length_self_encoding: req.length_self_encoding,
    };
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Run the admin HTTP/1.1 listener until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AdminState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> hyper::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone())))
        }
    });

    info!(%addr, "admin/telemetry API listening");
    Server::bind(&addr)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_config_rejects_unknown_algorithm() {
        let req = InstallConfigRequest {
            algorithm: "rot13".into(),
            rotation_id: 1,
            server_id_len: 2,
            cid_len: 8,
            nonce_len: 0,
            key: None,
            length_self_encoding: false,
        };
        assert!(build_config(req).is_err());
    }

    #[test]
    fn build_config_accepts_plaintext() {
        let req = InstallConfigRequest {
            algorithm: "plaintext".into(),
            rotation_id: 1,
            server_id_len: 2,
            cid_len: 8,
            nonce_len: 0,
            key: None,
            length_self_encoding: false,
        };
        assert!(build_config(req).is_ok());
    }

    #[test]
    fn hex_encode_roundtrips_visually() {
        assert_eq!(hex_encode(&[0x00, 0xab, 0xff]), "00abff");
    }
}
