//! Proxy Layer (spec §4.J): per-backend reverse-proxy client, header
//! rewriting, and breaker/health-score outcome recording.
//!
//! The HTTP/3 and HTTP/2 servers that terminate TLS/QUIC are out of scope
//! (spec §1); this module only owns the *upstream* leg — forwarding a
//! decoded request to the chosen backend over HTTP, using `reqwest` the way
//! `elisplash-paw` uses it for its own outbound HTTP calls.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{error, warn};

use qlb_core::backend::Backend;
use qlb_core::{QlbError, QlbResult};

use crate::dispatcher::{DispatchResult, RoutingMethod};

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    pub path_and_query: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub client_ip: String,
    pub proto: String,
    pub host: String,
}

#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

pub struct ProxyLayer {
    client: reqwest::Client,
    listening_port: u16,
    upstream_timeout: Duration,
}

impl ProxyLayer {
    pub fn new(listening_port: u16, upstream_timeout: Duration) -> QlbResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(upstream_timeout)
            .build()
            .map_err(|e| QlbError::ConfigInvalid(format!("failed to build proxy client: {e}")))?;
        Ok(Self {
            client,
            listening_port,
            upstream_timeout,
        })
    }

    /// Forward `req` to `dispatch.backend`, rewriting headers per spec
    /// §4.J, and record the outcome into the backend's breaker and
    /// health-score counters.
    pub async fn forward(
        &self,
        dispatch: &DispatchResult,
        req: ProxyRequest,
    ) -> QlbResult<ProxyResponse> {
        let backend = &dispatch.backend;
        let admit_now = Instant::now();
        if !backend.breaker.admit(admit_now) {
            warn!(server_id = backend.server_id, "breaker open, refusing to forward");
            return Err(QlbError::BackendUnavailable);
        }
        backend.breaker.on_request_start();
        backend.connections.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();

        let outcome = self.do_forward(backend, &req).await;

        backend.connections.fetch_sub(1, Ordering::Relaxed);
        let now = Instant::now();
        backend.record_request(now);

        match outcome {
            Ok(mut resp) => {
                backend.record_response_time(started.elapsed().as_secs_f64() * 1000.0);
                backend.breaker.on_success(now);
                resp.headers.retain(|(k, _)| !is_hop_by_hop(k));
                resp.headers
                    .push(("x-backend-id".into(), backend.server_id.to_string()));
                resp.headers
                    .push(("x-routing-method".into(), dispatch.method.header_value().into()));
                if let Some(rotation_id) = dispatch.rotation_id {
                    resp.headers
                        .push(("x-quic-lb-rotation".into(), rotation_id.to_string()));
                }
                resp.headers.push((
                    "alt-svc".into(),
                    format!("h3=\":{}\"; ma=86400", self.listening_port),
                ));
                Ok(resp)
            }
            Err(e) => {
                backend.record_error(now);
                backend.breaker.on_failure(now);
                if matches!(dispatch.method, RoutingMethod::Fallback) {
                    warn!(server_id = backend.server_id, "upstream failure on fallback path");
                } else {
                    error!(server_id = backend.server_id, "upstream failure on cid-routed path");
                }
                Err(e)
            }
        }
    }

    async fn do_forward(&self, backend: &Backend, req: &ProxyRequest) -> QlbResult<ProxyResponse> {
        let url = format!(
            "{}{}",
            backend.upstream_url.trim_end_matches('/'),
            req.path_and_query
        );
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| QlbError::UpstreamIo("invalid method".into()))?;

        let mut builder = self.client.request(method, &url);
        for (k, v) in &req.headers {
            if !is_hop_by_hop(k) {
                builder = builder.header(k, v);
            }
        }
        builder = builder
            .header("x-forwarded-for", &req.client_ip)
            .header("x-forwarded-proto", &req.proto)
            .header("x-forwarded-host", &req.host)
            .body(req.body.clone())
            .timeout(self.upstream_timeout);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                QlbError::Timeout
            } else {
                QlbError::UpstreamIo(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| QlbError::UpstreamIo(e.to_string()))?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}

fn is_hop_by_hop(header: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(header))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_recognized_case_insensitively() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("X-Backend-Id"));
    }

    // Scenario 5 from spec §8 only covers the CID-routed path; a backend
    // reached via the fallback/policy-selector path must be refused the
    // same way once its breaker is open.
    #[tokio::test]
    async fn forward_refuses_breaker_open_backend_on_fallback_path() {
        let backend = std::sync::Arc::new(Backend::new(1, "http://127.0.0.1:1".into(), 1, 10, "us".into()));
        let now = Instant::now();
        for _ in 0..10 {
            backend.breaker.on_failure(now);
        }
        let dispatch = DispatchResult {
            backend: backend.clone(),
            method: RoutingMethod::Fallback,
            rotation_id: None,
            advertised_cid: None,
        };
        let layer = ProxyLayer::new(443, Duration::from_secs(1)).unwrap();
        let req = ProxyRequest {
            method: "GET".into(),
            path_and_query: "/".into(),
            headers: Vec::new(),
            body: Bytes::new(),
            client_ip: "10.0.0.1".into(),
            proto: "http".into(),
            host: "example.com".into(),
        };
        let result = layer.forward(&dispatch, req).await;
        assert!(matches!(result, Err(QlbError::BackendUnavailable)));
    }
}
