//! Tracing subscriber setup.
//!
//! The teacher's `selenia_core::logger` exposes `log_info!`/`log_warn!`/
//! `log_error!` macros backed by a hand-rolled mutex-guarded stderr writer.
//! We keep the same three call sites' shape but back them with `tracing`,
//! matching every networked crate in the retrieval pack.

pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
