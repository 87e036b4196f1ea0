//! Layered YAML configuration loading: locates `systemg.yaml` (or an
//! override via `--config`/`SYSG_CONFIG`), expands `${VAR}`/`$VAR`
//! references against a `.env` file and the process environment, and
//! builds a populated Child Registry.
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::constants::{CONFIG_PATH_ENV, DEFAULT_CONFIG_FILE};
use crate::error::RegistryError;
use crate::model::{
    Backoff, DependsOn, DependsOnCondition, NamedPort, Probe, ProcessSpec, RestartPolicy,
};
use crate::registry::ChildRegistry;

/// Errors raised while locating, reading, or parsing a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading the config file itself failed.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// The path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// The YAML document did not match the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    /// The resulting registry's dependency graph is invalid.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// One `depends_on` entry as written in config: a bare name (implying
/// `process_started`) or an explicit `{name, condition}` mapping.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawDependsOn {
    Name(String),
    Full {
        name: String,
        condition: DependsOnCondition,
    },
}

impl From<RawDependsOn> for DependsOn {
    fn from(raw: RawDependsOn) -> Self {
        match raw {
            RawDependsOn::Name(name) => DependsOn {
                name,
                condition: DependsOnCondition::ProcessStarted,
            },
            RawDependsOn::Full { name, condition } => DependsOn { name, condition },
        }
    }
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::OnFailure
}

/// One service entry in the config file; the map key carries its name.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawService {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default = "default_restart_policy")]
    restart_policy: RestartPolicy,
    #[serde(default)]
    backoff: Backoff,
    #[serde(default)]
    depends_on: Vec<RawDependsOn>,
    #[serde(default)]
    readiness_probe: Option<Probe>,
    #[serde(default)]
    startup_probe: Option<Probe>,
    #[serde(default)]
    shutdown_probe: Option<Probe>,
    #[serde(default)]
    ports: Vec<NamedPort>,
}

/// Root-level environment declaration: an `.env` file and/or inline vars,
/// merged beneath every service's own `env` map.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EnvConfig {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    vars: HashMap<String, String>,
}

fn default_version() -> String {
    "1".to_string()
}

/// The on-disk config document.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default = "default_version")]
    #[allow(dead_code)]
    version: String,
    services: HashMap<String, RawService>,
    #[serde(default)]
    env: Option<EnvConfig>,
}

/// Resolves the config file path: an explicit `path`, else `SYSG_CONFIG`,
/// else `systemg.yaml` in the current directory.
pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = env::var(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

/// Loads a config file from `path`, expanding `${VAR}`/`$VAR` references and
/// applying an optional `.env` file, then builds a populated
/// `ChildRegistry`. The registry's dependency graph is validated
/// (`start_order`) before returning.
pub fn load(path: &Path) -> Result<ChildRegistry, ConfigError> {
    let raw_content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    build_registry(&raw_content, Some(base_dir))
}

/// Builds a `ChildRegistry` from an already-in-memory config document (e.g.
/// a `POST /project` override body), with no `.env`-file resolution since
/// there is no base directory to resolve it against.
pub fn load_from_str(content: &str) -> Result<ChildRegistry, ConfigError> {
    build_registry(content, None)
}

fn build_registry(raw_content: &str, base_dir: Option<&Path>) -> Result<ChildRegistry, ConfigError> {
    // Parse once, unexpanded, purely to discover an `.env` file or inline
    // vars that must land in the process environment before the real
    // variable-expansion pass runs.
    let preliminary: RawConfig = serde_yaml::from_str(raw_content)?;
    if let Some(env_config) = &preliminary.env {
        if let (Some(env_path), Some(base_dir)) = (&env_config.path, base_dir) {
            load_env_file(&resolve_relative(base_dir, env_path));
        }
        for (key, value) in &env_config.vars {
            set_var(key, value);
        }
    }

    let expanded = expand_env_vars(raw_content);
    let config: RawConfig = serde_yaml::from_str(&expanded)?;

    let mut registry = ChildRegistry::new();
    for (name, raw) in config.services {
        let spec = ProcessSpec {
            name: name.clone(),
            command: raw.command,
            args: raw.args,
            env: raw.env,
            working_dir: raw.working_dir,
            restart_policy: raw.restart_policy,
            backoff: raw.backoff,
            depends_on: raw.depends_on.into_iter().map(DependsOn::from).collect(),
            readiness_probe: raw.readiness_probe,
            startup_probe: raw.startup_probe,
            shutdown_probe: raw.shutdown_probe,
            ports: raw.ports,
        };
        registry.register(spec)?;
    }
    registry.start_order()?;
    Ok(registry)
}

fn resolve_relative(base: &Path, raw: &str) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}

fn load_env_file(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let mut value = value.trim();
            let quoted = (value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\''));
            if quoted && value.len() >= 2 {
                value = &value[1..value.len() - 1];
            }
            set_var(key, value);
        }
    }
}

fn set_var(key: &str, value: &str) {
    // SAFETY: config loading runs single-threaded, before any service is
    // spawned, so no other thread can observe a torn environment.
    unsafe {
        env::set_var(key, value);
    }
}

/// Expands `${VAR}` and bare `$VAR` references against the current process
/// environment. A reference to an unset variable is left untouched rather
/// than failing the load, so a config can reference an optional override.
fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).unwrap().as_str();
        env::var(name).unwrap_or_else(|_| caps[0].to_string())
    })
    .into_owned()
}
