//! Shared helpers for unit and integration tests.
use std::sync::{Mutex, MutexGuard, OnceLock};

static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

/// Serializes tests that mutate process-wide environment variables (`HOME`,
/// `PC_PORT_NUM`, ...), since Rust runs unit tests on multiple threads by
/// default and env vars are global state.
pub fn env_lock() -> MutexGuard<'static, ()> {
    ENV_MUTEX
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
