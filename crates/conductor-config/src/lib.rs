//! Configuration for conductor.
//!
//! Settings are layered, later layers winning:
//! 1. Built-in defaults
//! 2. `~/.config/conductor/config.toml`, if present
//! 3. An explicit file passed by the caller (TOML or JSON, `~` and `$VAR` expanded)
//! 4. `CONDUCTOR_*` environment variables, `__` between sections
//!    (e.g. `CONDUCTOR_BUS__MAX_IN_FLIGHT=50`)

use conductor_bus::BusConfig;
use conductor_workflow::{AgentDescriptor, EngineConfig, ANY_CAPABILITY};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CONDUCTOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Configuration I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Log filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    /// Agents of the in-process executor
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentDescriptor>,
}

fn default_agents() -> Vec<AgentDescriptor> {
    vec![AgentDescriptor::new("local", [ANY_CAPABILITY])]
}

fn default_log_level() -> String { "info".to_string() }

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            bus: BusConfig::default(),
            engine: EngineConfig::default(),
            agents: default_agents(),
        }
    }
}

impl Config {
    /// Load the layered configuration, with `path` as the explicit file.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true);
        Self::load_layers(Self::user_config_path(), path, env)
    }

    /// Location of the per-user config file.
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config").join("conductor").join("config.toml"))
    }

    fn load_layers(
        user_file: Option<PathBuf>,
        explicit: Option<&Path>,
        env: config::Environment,
    ) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(user_file) = user_file.filter(|p| p.exists()) {
            debug!("Loading user config from {}", user_file.display());
            builder = builder.add_source(config::File::from(user_file.as_path()));
        }

        if let Some(path) = explicit {
            let path = expand_path(path)?;
            if !path.exists() {
                return Err(ConfigError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {} not found", path.display()),
                )));
            }
            debug!("Loading config from {}", path.display());
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the bus or engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bus = &self.bus;
        let zero = [
            ("bus.max_dead_letters", bus.max_dead_letters as u64),
            ("bus.default_timeout_ms", bus.default_timeout_ms),
            ("bus.max_in_flight", bus.max_in_flight as u64),
            ("bus.max_history", bus.max_history as u64),
            ("bus.event_capacity", bus.event_capacity as u64),
            ("engine.event_capacity", self.engine.event_capacity as u64),
        ]
        .into_iter()
        .find(|(_, value)| *value == 0);

        if let Some((field, _)) = zero {
            return Err(ConfigError::Invalid(format!("{} must be greater than zero", field)));
        }

        if let Some(agent) = self.agents.iter().find(|a| a.id.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "agent with capabilities {:?} has an empty id",
                agent.capabilities
            )));
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .map_err(|e| ConfigError::Invalid(format!("cannot expand {}: {}", raw, e)))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(Some(source))
    }

    fn file(suffix: &str, contents: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::load_layers(None, None, env(&[])).unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.bus.max_dead_letters, 1000);
        assert_eq!(config.bus.default_ttl_ms, 30_000);
        assert_eq!(config.bus.default_timeout_ms, 10_000);
        assert_eq!(config.engine.event_capacity, 1024);
        assert_eq!(config.agents[0].id, "local");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_toml_file_overrides_defaults() {
        let toml = file(
            ".toml",
            r#"
log_level = "debug"

[bus]
max_in_flight = 50
track_history = true

[[agents]]
id = "coder"
capabilities = ["code"]
"#,
        );

        let config = Config::load_layers(None, Some(toml.path()), env(&[])).unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.bus.max_in_flight, 50);
        assert!(config.bus.track_history);
        // Untouched fields keep their defaults
        assert_eq!(config.bus.max_history, 5000);
        assert_eq!(config.agents, vec![AgentDescriptor::new("coder", ["code"])]);
    }

    #[test]
    fn test_json_file() {
        let json = file(".json", r#"{"engine": {"event_capacity": 8}}"#);
        let config = Config::load_layers(None, Some(json.path()), env(&[])).unwrap();
        assert_eq!(config.engine.event_capacity, 8);
    }

    #[test]
    fn test_user_file_then_explicit_file() {
        let user = file(".toml", "log_level = \"warn\"\n[bus]\nmax_history = 10\n");
        let explicit = file(".toml", "[bus]\nmax_history = 20\n");

        let config = Config::load_layers(
            Some(user.path().to_path_buf()),
            Some(explicit.path()),
            env(&[]),
        )
        .unwrap();

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.bus.max_history, 20);
    }

    #[test]
    fn test_env_overrides_file() {
        let toml = file(".toml", "[bus]\nmax_in_flight = 50\n");
        let vars = [
            ("CONDUCTOR_BUS__MAX_IN_FLIGHT", "75"),
            ("CONDUCTOR_LOG_LEVEL", "trace"),
        ];

        let config = Config::load_layers(None, Some(toml.path()), env(&vars)).unwrap();

        assert_eq!(config.bus.max_in_flight, 75);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = Config::load_layers(None, Some(Path::new("/no/such/conductor.toml")), env(&[]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = Config::default();
        config.bus.default_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bus.default_timeout_ms"));

        let mut config = Config::default();
        config.engine.event_capacity = 0;
        assert!(config.validate().is_err());

        // Zero TTL disables expiry and is allowed
        let mut config = Config::default();
        config.bus.default_ttl_ms = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_blank_agent() {
        let mut config = Config::default();
        config.agents.push(AgentDescriptor::new(" ", ["code"]));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_file_value() {
        let toml = file(".toml", "[bus]\nmax_in_flight = 0\n");
        let err = Config::load_layers(None, Some(toml.path()), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_output_round_trips() {
        let config = Config::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[bus]"));

        let parsed: Config = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
