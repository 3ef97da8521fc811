//! Settings loading: environment variables first (spec §6's list), with an
//! optional TOML file overlay for anything not set in the environment.
//!
//! Grounded on the teacher's `selenia_core::config::ServerConfig`
//! (env/file-driven `ServerConfig` with a `ConfigError` enum distinguishing
//! I/O from format errors) but re-expressed with `serde` + `toml` rather
//! than a hand-rolled YAML subset, per SPEC_FULL's ambient-stack section.

use std::env;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileOverlay {
    pub backends: Option<Vec<BackendSpec>>,
    pub admin_listen: Option<String>,
    pub probe_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub region: String,
}

fn default_weight() -> u32 {
    1
}
fn default_capacity() -> u32 {
    100
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub admin_listen: String,
    pub backends: Vec<BackendSpec>,
    pub tls_cert_file: Option<String>,
    pub tls_key_file: Option<String>,
    pub probe_path: Option<String>,
    pub probe_interval: Duration,
    pub breaker_threshold: u32,
    pub breaker_open_timeout: Duration,
    pub idle_ttl: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            admin_listen: "0.0.0.0:9100".into(),
            backends: Vec::new(),
            tls_cert_file: None,
            tls_key_file: None,
            probe_path: None,
            probe_interval: Duration::from_millis(15_000),
            breaker_threshold: 5,
            breaker_open_timeout: Duration::from_millis(30_000),
            idle_ttl: Duration::from_secs(300),
        }
    }
}

impl Settings {
    /// Load from environment variables, then overlay an optional TOML file
    /// (path given by `QLB_CONFIG_FILE`, defaulting to `qlb.toml` in the
    /// working directory if it exists).
    pub fn load() -> Self {
        let mut settings = Settings::default();

        if let Ok(path) = env::var("QLB_CONFIG_FILE") {
            settings.apply_file(&path);
        } else if std::path::Path::new("qlb.toml").exists() {
            settings.apply_file("qlb.toml");
        }

        settings.apply_env();
        settings
    }

    fn apply_file(&mut self, path: &str) {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<FileOverlay>(&content) {
                Ok(overlay) => {
                    if let Some(backends) = overlay.backends {
                        self.backends = backends;
                    }
                    if let Some(listen) = overlay.admin_listen {
                        self.admin_listen = listen;
                    }
                    if let Some(path) = overlay.probe_path {
                        self.probe_path = Some(path);
                    }
                }
                Err(e) => tracing::warn!(path, error = %e, "failed to parse config file, ignoring"),
            },
            Err(e) => tracing::warn!(path, error = %e, "failed to read config file, ignoring"),
        }
    }

    fn apply_env(&mut self) {
        // BACKEND_<N>_URL for N = 0, 1, 2, ... until the sequence breaks.
        let mut n = 0;
        let mut from_env = Vec::new();
        while let Ok(url) = env::var(format!("BACKEND_{n}_URL")) {
            from_env.push(BackendSpec {
                url,
                weight: default_weight(),
                capacity: default_capacity(),
                region: String::new(),
            });
            n += 1;
        }
        if !from_env.is_empty() {
            self.backends = from_env;
        }

        if let Ok(v) = env::var("TLS_CERT_FILE") {
            self.tls_cert_file = Some(v);
        }
        if let Ok(v) = env::var("TLS_KEY_FILE") {
            self.tls_key_file = Some(v);
        }
        if let Ok(v) = env::var("PROBE_PATH") {
            self.probe_path = Some(v);
        }
        if let Some(v) = parse_env_u64("PROBE_INTERVAL_MS") {
            self.probe_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_env_u64("BREAKER_THRESHOLD") {
            self.breaker_threshold = v as u32;
        }
        if let Some(v) = parse_env_u64("BREAKER_OPEN_MS") {
            self.breaker_open_timeout = Duration::from_millis(v);
        }
        if let Some(v) = parse_env_u64("IDLE_TTL_S") {
            self.idle_ttl = Duration::from_secs(v);
        }
    }
}

fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}
