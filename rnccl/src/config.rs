//! Runtime-configurable behaviour for rnccl.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `RNCCL_`) or by constructing a custom `RncclConfig`.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RncclConfig {
    /// How long a rendezvous may wait for missing participants.
    ///
    /// Read when a runtime is built, not by [`CommContext`](crate::CommContext):
    /// [`LoopbackFabric::new`](crate::LoopbackFabric::new) and
    /// [`LoopbackFabric::with_config`](crate::LoopbackFabric::with_config)
    /// apply it. NCCL bounds its own bootstrap and ignores it.
    pub bootstrap_timeout: Duration,

    /// Poll the runtime's asynchronous error before every submission, so
    /// on-device faults surface at the next call on the same handle.
    pub check_async_errors: bool,

    /// Abort the native context when a communicator is dropped without an
    /// explicit release. When false the context is leaked.
    pub abort_on_drop: bool,
}

impl Default for RncclConfig {
    fn default() -> Self {
        Self {
            bootstrap_timeout: Duration::from_secs(30),
            check_async_errors: true,
            abort_on_drop: true,
        }
    }
}

impl RncclConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RNCCL_BOOTSTRAP_TIMEOUT_SECS`
    /// - `RNCCL_CHECK_ASYNC_ERRORS` (`1`/`0`, `true`/`false`)
    /// - `RNCCL_ABORT_ON_DROP` (`1`/`0`, `true`/`false`)
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("RNCCL_BOOTSTRAP_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.bootstrap_timeout = Duration::from_secs(s);
            }
        }
        if let Ok(v) = std::env::var("RNCCL_CHECK_ASYNC_ERRORS") {
            if let Some(b) = parse_flag(&v) {
                cfg.check_async_errors = b;
            }
        }
        if let Ok(v) = std::env::var("RNCCL_ABORT_ON_DROP") {
            if let Some(b) = parse_flag(&v) {
                cfg.abort_on_drop = b;
            }
        }

        cfg
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
