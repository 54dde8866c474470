//! Ambient configuration (component C8): environment-driven log verbosity.
//!
//! The crate never picks a logger implementation itself — it only decides,
//! once, whether tracing should be enabled at all, mirroring the original
//! adapter's `demi_log_init`: `DEMI_EPOLL_LOG=trace` is checked first, with
//! `RUST_LOG=trace` as the fallback. Any other value (or neither variable
//! set) leaves logging at whatever the embedding binary already configured
//! for the `log` facade.

use std::sync::Once;

static LOG_INIT: Once = Once::new();

fn env_is_trace(name: &str) -> bool {
    std::env::var(name).map(|v| v == "trace").unwrap_or(false)
}

/// Called once per process from [`crate::shim::Shim::new`]. A second call
/// (e.g. a second `Shim` constructed in the same process, as tests do) is a
/// no-op rather than a hard error — the "one explicit init" contract is a
/// usage convention this crate can't enforce across independent callers.
pub fn init_logging() {
    LOG_INIT.call_once(|| {
        if env_is_trace("DEMI_EPOLL_LOG") || env_is_trace("RUST_LOG") {
            log::trace!("tracing enabled via environment");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_is_trace_only_matches_the_literal_value() {
        std::env::set_var("EPOLL_SHIM_TEST_TRACE_PROBE", "trace");
        assert!(env_is_trace("EPOLL_SHIM_TEST_TRACE_PROBE"));
        std::env::set_var("EPOLL_SHIM_TEST_TRACE_PROBE", "debug");
        assert!(!env_is_trace("EPOLL_SHIM_TEST_TRACE_PROBE"));
        std::env::remove_var("EPOLL_SHIM_TEST_TRACE_PROBE");
        assert!(!env_is_trace("EPOLL_SHIM_TEST_TRACE_PROBE"));
    }

    #[test]
    fn init_logging_is_idempotent() {
        init_logging();
        init_logging();
    }
}
