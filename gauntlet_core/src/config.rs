use crate::analysis::AnalysisSettings;
use crate::coverage::{DEFAULT_REGISTER_PROBE_LIMIT, MAX_REGISTER_PROBE_LIMIT};
use crate::mutator::DEFAULT_GROUP;
use crate::scheduler::{ListenerFailurePolicy, OrderStrategy};
use crate::timeout::{DEFAULT_TIMEOUT_CONSTANT, DEFAULT_TIMEOUT_FACTOR, PercentAndConstantTimeoutStrategy};
use crate::vm::DEFAULT_MAX_STEPS;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EngineSettings {
    /// Mutator or group names, resolved through the mutator registry.
    #[serde(default = "default_mutators")]
    pub mutators: Vec<String>,
}

fn default_mutators() -> Vec<String> {
    vec![DEFAULT_GROUP.to_string()]
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            mutators: default_mutators(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CoverageSettings {
    #[serde(default = "default_register_probe_limit")]
    pub register_probe_limit: usize,
}

fn default_register_probe_limit() -> usize {
    DEFAULT_REGISTER_PROBE_LIMIT
}

impl Default for CoverageSettings {
    fn default() -> Self {
        Self {
            register_probe_limit: default_register_probe_limit(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OrderKind {
    #[default]
    Declaration,
    Random,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutionSettings {
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub order: OrderKind,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_timeout_factor")]
    pub timeout_factor: f64,
    #[serde(default = "default_timeout_constant_ms")]
    pub timeout_constant_ms: u64,
    #[serde(default)]
    pub listener_failure: ListenerFailurePolicy,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
}

pub fn default_threads() -> usize {
    2
}
fn default_timeout_factor() -> f64 {
    DEFAULT_TIMEOUT_FACTOR
}
fn default_timeout_constant_ms() -> u64 {
    DEFAULT_TIMEOUT_CONSTANT.as_millis() as u64
}
fn default_queue_capacity() -> usize {
    16
}
fn default_max_steps() -> u64 {
    DEFAULT_MAX_STEPS
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            order: OrderKind::default(),
            seed: 0,
            timeout_factor: default_timeout_factor(),
            timeout_constant_ms: default_timeout_constant_ms(),
            listener_failure: ListenerFailurePolicy::default(),
            queue_capacity: default_queue_capacity(),
            max_steps: default_max_steps(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct GauntletConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub coverage: CoverageSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
}

impl GauntletConfig {
    /// Loads and validates a configuration from a TOML file.
    ///
    /// # Arguments
    /// * `path`: The path to the TOML file. Missing sections and keys take
    ///   their defaults.
    ///
    /// # Returns
    /// The configuration, or a `ConfigError` if the file cannot be read, does
    /// not parse, or holds an out-of-range value.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: GauntletConfig = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that the TOML types alone do not enforce.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key, reason: &str| {
            Err(ConfigError::Invalid {
                key,
                reason: reason.to_string(),
            })
        };
        if self.engine.mutators.is_empty() {
            return invalid("engine.mutators", "at least one mutator or group is required");
        }
        if self.coverage.register_probe_limit > MAX_REGISTER_PROBE_LIMIT {
            return Err(ConfigError::Invalid {
                key: "coverage.register-probe-limit",
                reason: format!("must be at most {MAX_REGISTER_PROBE_LIMIT}"),
            });
        }
        if self.execution.threads == 0 {
            return invalid("execution.threads", "must be at least 1");
        }
        if self.execution.queue_capacity == 0 {
            return invalid("execution.queue-capacity", "must be at least 1");
        }
        if !self.execution.timeout_factor.is_finite() || self.execution.timeout_factor < 0.0 {
            return invalid("execution.timeout-factor", "must be a non-negative number");
        }
        if self.execution.max_steps == 0 {
            return invalid("execution.max-steps", "must be at least 1");
        }
        Ok(())
    }

    /// Test order for every mutant's run. `seed` only matters for
    /// `order = "random"`.
    pub fn order_strategy(&self) -> OrderStrategy {
        match self.execution.order {
            OrderKind::Declaration => OrderStrategy::DeclarationOrder,
            OrderKind::Random => OrderStrategy::RandomOrder {
                seed: self.execution.seed,
            },
        }
    }

    pub fn timeout_strategy(&self) -> PercentAndConstantTimeoutStrategy {
        PercentAndConstantTimeoutStrategy {
            factor: self.execution.timeout_factor,
            constant: Duration::from_millis(self.execution.timeout_constant_ms),
        }
    }

    pub fn analysis_settings(&self) -> AnalysisSettings {
        AnalysisSettings {
            threads: self.execution.threads,
            queue_capacity: self.execution.queue_capacity,
            register_probe_limit: self.coverage.register_probe_limit,
            listener_failure: self.execution.listener_failure,
            order: self.order_strategy(),
            timeout: Arc::new(self.timeout_strategy()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        file.write_all(content.as_bytes())
            .expect("Failed to write to temp file");
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let file = write_config("");
        let config = GauntletConfig::load_from_file(file.path()).expect("empty config loads");
        assert_eq!(config, GauntletConfig::default());
        assert_eq!(config.engine.mutators, vec!["DEFAULTS"]);
        assert_eq!(config.coverage.register_probe_limit, 15);
        assert_eq!(config.execution.timeout_constant_ms, 4000);
        assert_eq!(config.execution.listener_failure, ListenerFailurePolicy::Isolate);
    }

    #[test]
    fn full_file_is_read() {
        let file = write_config(
            r#"
[engine]
mutators = ["TEMPORAL_BOUNDARY", "MATH"]

[coverage]
register-probe-limit = 8

[execution]
threads = 4
order = "random"
seed = 99
timeout-factor = 2.0
timeout-constant-ms = 250
listener-failure = "propagate"
queue-capacity = 3
max-steps = 5000
"#,
        );
        let config = GauntletConfig::load_from_file(file.path()).expect("full config loads");
        assert_eq!(config.engine.mutators, vec!["TEMPORAL_BOUNDARY", "MATH"]);
        assert_eq!(config.coverage.register_probe_limit, 8);
        assert_eq!(config.execution.threads, 4);
        assert!(matches!(config.order_strategy(), OrderStrategy::RandomOrder { seed: 99 }));
        assert_eq!(config.execution.listener_failure, ListenerFailurePolicy::Propagate);
        assert_eq!(
            config.timeout_strategy(),
            PercentAndConstantTimeoutStrategy {
                factor: 2.0,
                constant: Duration::from_millis(250)
            }
        );
        let settings = config.analysis_settings();
        assert_eq!((settings.threads, settings.queue_capacity), (4, 3));
        assert!(matches!(settings.order, OrderStrategy::RandomOrder { seed: 99 }));
        assert_eq!(settings.register_probe_limit, 8);
        assert_eq!(config.execution.max_steps, 5000);
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let file = write_config("[execution]\nworkers = 3\n");
        assert!(matches!(
            GauntletConfig::load_from_file(file.path()),
            Err(ConfigError::Parse { .. })
        ));

        let file = write_config("[coverage]\nregister-probe-limit = 70000\n");
        assert!(matches!(
            GauntletConfig::load_from_file(file.path()),
            Err(ConfigError::Invalid { key: "coverage.register-probe-limit", .. })
        ));

        let file = write_config("[execution]\nthreads = 0\n");
        assert!(matches!(
            GauntletConfig::load_from_file(file.path()),
            Err(ConfigError::Invalid { key: "execution.threads", .. })
        ));

        assert!(matches!(
            GauntletConfig::load_from_file(Path::new("/definitely/not/here.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
