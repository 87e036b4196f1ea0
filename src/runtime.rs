//! Helpers for resolving runtime paths (state, logs, config) for the
//! orchestrator's own process, independent of any service it supervises.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

/// Runtime mode that determines where state and logs should be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home directory.
    User,
    /// System mode; state is stored in system directories.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    log_dir: PathBuf,
    config_dirs: Vec<PathBuf>,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/orchestra");
        let log_dir = state_dir.join("logs");
        let config_dir = home.join(".config/orchestra");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            log_dir,
            config_dirs: vec![config_dir],
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/orchestra"),
            log_dir: PathBuf::from("/var/log/orchestra"),
            config_dirs: vec![PathBuf::from("/etc/orchestra")],
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent
/// calls overwrite the active configuration.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock().read().expect("runtime context poisoned").mode
}

/// Returns the root directory for runtime state (PID files, the event log, ...).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Returns the directory where supervisor and service log tails should reside.
pub fn log_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .log_dir
        .clone()
}

/// Returns the list of configuration directories searched for global config files.
pub fn config_dirs() -> Vec<PathBuf> {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .config_dirs
        .clone()
}
