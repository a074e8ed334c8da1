//! Runtime configuration.
//!
//! A thin file layer (`config.toml` under the factory home) is folded
//! into the runtime [`FactoryConfig`] with defaults. The spawn depth of
//! the current process is not configuration in the file sense: it is
//! inherited through the environment so that recursively spawned
//! orchestrators carry their distance from the original run.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::FactoryError;

/// Environment variable carrying the spawn depth into child processes.
pub const DEPTH_ENV_VAR: &str = "FACTORY_DEPTH";
/// Environment variable carrying the owning run id into child processes.
pub const RUN_ID_ENV_VAR: &str = "FACTORY_RUN_ID";

const DEFAULT_MAX_DEPTH: u32 = 3;
const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
const DEFAULT_GRACE_PERIOD_MS: u64 = 3_000;

/// On-disk shape of `config.toml`. Every field is optional; missing
/// fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigToml {
    pub runs_root: Option<PathBuf>,
    pub agent_program: Option<PathBuf>,
    #[serde(default)]
    pub agent_args: Vec<String>,
    pub model: Option<String>,
    pub max_depth: Option<u32>,
    pub poll_interval_ms: Option<u64>,
    pub grace_period_ms: Option<u64>,
    pub persist_transcripts: Option<bool>,
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Root directory holding one subdirectory per run.
    pub runs_root: PathBuf,
    /// Executable launched for each child task.
    pub agent_program: PathBuf,
    /// Arguments placed before the structured per-task arguments.
    pub agent_args: Vec<String>,
    /// Default model id used when a spawn does not name one.
    pub model: String,
    /// Maximum orchestrator-spawns-orchestrator nesting.
    pub max_depth: u32,
    /// Output file poll cadence.
    pub poll_interval: Duration,
    /// Time a cancelled child gets to exit before a forceful kill.
    pub grace_period: Duration,
    /// Whether to keep a per-task transcript file.
    pub persist_transcripts: bool,
    /// Depth of this process, inherited via [`DEPTH_ENV_VAR`].
    pub depth: u32,
}

impl FactoryConfig {
    /// Loads `config.toml` from `factory_home` (if present) and resolves
    /// defaults. Depth is read from the process environment.
    pub fn load(factory_home: &Path) -> Result<Self, FactoryError> {
        let config_path = factory_home.join("config.toml");
        let file_layer = match std::fs::read_to_string(&config_path) {
            Ok(contents) => toml::from_str::<ConfigToml>(&contents)
                .map_err(|err| FactoryError::InvalidInput(format!("{}: {err}", config_path.display())))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(err) => return Err(FactoryError::io(&config_path, err)),
        };
        Ok(Self::from_toml(file_layer, factory_home))
    }

    pub fn from_toml(file_layer: ConfigToml, factory_home: &Path) -> Self {
        Self {
            runs_root: file_layer
                .runs_root
                .unwrap_or_else(|| factory_home.join("runs")),
            agent_program: file_layer
                .agent_program
                .unwrap_or_else(|| PathBuf::from("claude")),
            agent_args: file_layer.agent_args,
            model: file_layer.model.unwrap_or_default(),
            max_depth: file_layer.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
            poll_interval: Duration::from_millis(
                file_layer.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            ),
            grace_period: Duration::from_millis(
                file_layer.grace_period_ms.unwrap_or(DEFAULT_GRACE_PERIOD_MS),
            ),
            persist_transcripts: file_layer.persist_transcripts.unwrap_or(true),
            depth: depth_from_env(),
        }
    }

    /// Default factory home: `$FACTORY_HOME`, falling back to
    /// `~/.factory`.
    pub fn default_home() -> PathBuf {
        if let Some(home) = std::env::var_os("FACTORY_HOME") {
            return PathBuf::from(home);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".factory")
    }
}

fn depth_from_env() -> u32 {
    std::env::var(DEPTH_ENV_VAR)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}
