//! Runtime configuration.
//!
//! Everything here has a default, so an empty (or absent) config file is valid.  The file format
//! is YAML; see [`Config::default_yaml`] for a fully populated example.
use crate::duration;
use crate::tools::{DISCOVER_COMMANDS, EXECUTE_COMMAND};
use crate::transport::DEFAULT_MAX_LINE_BYTES;
use crate::Result;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The largest `max_timeout` that may be configured.
pub const TIMEOUT_CEILING: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub execution: ExecutionConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
    pub transport: TransportConfig,

    /// Fixed commands exposed as tools of their own, alongside the built-in ones
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandConfig>,
}

/// Limits applied to `execute_command`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Timeout used when a request doesn't specify one
    #[serde(with = "duration::serde_str")]
    pub default_timeout: Duration,

    /// Requested timeouts above this are clamped to it
    #[serde(with = "duration::serde_str")]
    pub max_timeout: Duration,

    /// Per-stream cap on captured output.  Anything past this is read and thrown away.
    pub max_output_bytes: usize,

    /// How long to keep collecting output after the child has exited or been killed.
    #[serde(with = "duration::serde_str")]
    pub drain_timeout: Duration,

    /// After a timeout the child is interrupted, then killed if it is still running this much
    /// later.  Zero kills it straight away.
    #[serde(with = "duration::serde_str")]
    pub kill_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(5 * 60),
            max_output_bytes: 10 * 1024 * 1024,
            drain_timeout: Duration::from_millis(500),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

/// How `pattern` in a `discover_commands` call is interpreted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Substring,
    Glob,
    Regex,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub default_max_results: usize,
    pub max_results_limit: usize,
    pub match_mode: MatchMode,
    pub case_sensitive: bool,
    pub include_hidden: bool,

    /// Searched after the directories in `PATH`
    pub additional_paths: Vec<PathBuf>,

    /// Never searched, nor is anything below them
    pub exclude_paths: Vec<PathBuf>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            default_max_results: 20,
            max_results_limit: 500,
            match_mode: MatchMode::Substring,
            case_sensitive: true,
            include_hidden: false,
            additional_paths: Vec::new(),
            exclude_paths: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Request lines longer than this are answered with a parse error and discarded
    pub max_line_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// A command that is exposed as a tool named `name`.  Clients can only choose the working
/// directory, plus extra arguments when `allow_args` is set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    pub name: String,
    pub description: String,
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Used in preference to any `workdir` the client asks for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    /// Set in the child's environment on top of what the server inherited
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Falls back to `execution.default_timeout`
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "duration::serde_opt_str"
    )]
    pub timeout: Option<Duration>,

    /// Append the client's `args` to `args`
    #[serde(default)]
    pub allow_args: bool,
}

impl CommandConfig {
    fn validate(&self, key: &str, exec: &ExecutionConfig) -> Result<()> {
        let mut chars = self.name.chars();
        let well_formed = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && self.name.len() <= 50;
        if !well_formed {
            bail!(
                "{key}.name must start with a letter and contain only letters, digits and \
                 underscores (at most 50 characters)"
            );
        }
        if self.name == DISCOVER_COMMANDS || self.name == EXECUTE_COMMAND {
            bail!("{key}.name '{}' is reserved for a built-in tool", self.name);
        }
        if self.description.trim().is_empty() {
            bail!("{key}.description must not be empty");
        }
        if self.description.len() > 500 {
            bail!("{key}.description cannot be longer than 500 bytes");
        }
        if self.command.is_empty() {
            bail!("{key}.command must not be empty");
        }
        if let Some(workdir) = &self.workdir {
            if !workdir.is_absolute() {
                bail!("{key}.workdir must be an absolute path");
            }
        }
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                bail!("{key}.timeout must be greater than zero");
            }
            if timeout > exec.max_timeout {
                bail!("{key}.timeout cannot exceed execution.max_timeout");
            }
        }
        if let Some(name) = self.env.keys().find(|k| k.is_empty() || k.contains(['=', '\0'])) {
            bail!("{key}.env has an invalid variable name {name:?}");
        }

        Ok(())
    }
}

impl Config {
    /// The configured command exposed as the tool `name`, if any
    pub fn command(&self, name: &str) -> Option<&CommandConfig> {
        self.commands.iter().find(|command| command.name == name)
    }

    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;

        Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file '{}'", path.display()))
    }

    /// Parse and validate config from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // An empty document deserializes to unit, not to an empty map, so special-case it
        let config: Config = if yaml.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(yaml).context("Failed to parse YAML")?
        };

        config.validate()?;
        Ok(config)
    }

    /// The default configuration rendered as YAML, suitable as a starting point for a config file.
    pub fn default_yaml() -> Result<String> {
        serde_yaml::to_string(&Config::default()).context("Failed to serialize default config")
    }

    /// Check cross-field constraints that serde can't express.  The error names the offending
    /// key.
    pub fn validate(&self) -> Result<()> {
        let exec = &self.execution;
        for (key, value) in [
            ("execution.default_timeout", exec.default_timeout),
            ("execution.max_timeout", exec.max_timeout),
            ("execution.drain_timeout", exec.drain_timeout),
        ] {
            if value.is_zero() {
                bail!("{key} must be greater than zero");
            }
        }
        if exec.max_timeout > TIMEOUT_CEILING {
            bail!(
                "execution.max_timeout cannot exceed {}",
                duration::format_duration(TIMEOUT_CEILING)
            );
        }
        if exec.default_timeout > exec.max_timeout {
            bail!("execution.default_timeout cannot exceed execution.max_timeout");
        }
        if exec.max_output_bytes == 0 {
            bail!("execution.max_output_bytes must be at least 1");
        }
        if exec.kill_timeout > TIMEOUT_CEILING {
            bail!(
                "execution.kill_timeout cannot exceed {}",
                duration::format_duration(TIMEOUT_CEILING)
            );
        }

        let disc = &self.discovery;
        if disc.default_max_results == 0 {
            bail!("discovery.default_max_results must be at least 1");
        }
        if disc.default_max_results > disc.max_results_limit {
            bail!("discovery.default_max_results cannot exceed discovery.max_results_limit");
        }
        for (key, paths) in [
            ("discovery.additional_paths", &disc.additional_paths),
            ("discovery.exclude_paths", &disc.exclude_paths),
        ] {
            if let Some(index) = paths.iter().position(|p| p.as_os_str().is_empty()) {
                bail!("{key}[{index}] must not be empty");
            }
        }

        if self.transport.max_line_bytes == 0 {
            bail!("transport.max_line_bytes must be at least 1");
        }

        let mut names = HashSet::new();
        for (index, command) in self.commands.iter().enumerate() {
            let key = format!("commands[{index}]");
            command.validate(&key, exec)?;
            if !names.insert(command.name.as_str()) {
                bail!("{key}.name '{}' is already used by another command", command.name);
            }
        }

        Ok(())
    }
}
