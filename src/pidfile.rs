//! Process-tree bookkeeping: a small JSON file recording `{name -> pid}` and
//! `{identity hash -> last known status}`, persisted under the runtime state
//! directory across restarts of the supervisor binary itself. This lets a
//! crash-recovered supervisor (or `status`-style introspection) tell a still
//! running child apart from a stale pid left behind by a previous run.
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::model::ProcessStatus;
use crate::runtime;

/// One process's on-disk bookkeeping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PidEntry {
    /// OS process id of the first replica spawned in the current start cycle.
    pub pid: u32,
    /// `ProcessSpec::content_hash()` at the time this entry was written, so
    /// a reload that changes a process's definition is not mistaken for the
    /// same running identity.
    pub identity_hash: String,
    /// Last known lifecycle status.
    pub status: ProcessStatus,
}

impl PidEntry {
    /// Best-effort liveness check for `self.pid`, independent of whether
    /// this supervisor process owns an OS handle for it.
    pub fn pid_is_alive(&self) -> bool {
        pid_is_alive(self.pid)
    }
}

/// The full on-disk table, keyed by process name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidTable {
    entries: BTreeMap<String, PidEntry>,
}

impl PidTable {
    fn path() -> PathBuf {
        runtime::state_dir().join("pids.json")
    }

    /// Loads the table from disk. A missing or unparseable file is treated
    /// as an empty table rather than failing supervisor startup.
    pub fn load() -> Self {
        let Ok(raw) = fs::read_to_string(Self::path()) else {
            return Self::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    /// Writes the table to disk, creating its parent directory if needed.
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)
    }

    /// Records (or overwrites) the entry for `name`.
    pub fn record(&mut self, name: &str, pid: u32, identity_hash: String, status: ProcessStatus) {
        self.entries.insert(
            name.to_string(),
            PidEntry {
                pid,
                identity_hash,
                status,
            },
        );
    }

    /// Removes `name`'s entry, e.g. once it has stopped deliberately.
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    /// Looks up `name`'s last recorded entry.
    pub fn get(&self, name: &str) -> Option<&PidEntry> {
        self.entries.get(name)
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    false
}
