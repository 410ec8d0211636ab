//! Configuration parsing for the guided workflow daemon.
//!
//! Plain `key=value` file with `#` comments and optionally quoted values.
//! Precedence: CLI flags > `--config` file > defaults.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::policy::{CheckpointPolicy, CheckpointStyle, PolicyError};

/// Hard cap on retryable command attempts.
pub const MAX_COMMAND_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid numeric value for {key}: {value}")]
    InvalidNumber { key: String, value: String },
    #[error("invalid quality hook: {0}")]
    InvalidHook(String),
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A named command run by the `quality_checks` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityHook {
    pub name: String,
    pub command: String,
    /// A failing required hook fails the step; optional ones are skipped.
    pub required: bool,
}

impl QualityHook {
    pub fn required(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            required: true,
        }
    }

    pub fn optional(name: &str, command: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, command)
        }
    }

    /// Parse a pipe-separated hook list: `name:cmd|name?:cmd`.
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|entry| {
                let (name, command) = match entry.split_once(':') {
                    Some((name, command)) => (name.trim(), command.trim()),
                    None => (entry, entry),
                };
                if command.is_empty() {
                    return Err(ConfigError::InvalidHook(entry.to_string()));
                }
                Ok(match name.strip_suffix('?') {
                    Some(name) => Self::optional(name, command),
                    None => Self::required(name, command),
                })
            })
            .collect()
    }
}

/// Which turn-signal matcher the service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnMatcherKind {
    #[default]
    Strict,
    ContextFallback,
}

/// Daemon and service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Feature flags and limits
    pub workflows_enabled: bool,
    /// Cap on active runs; 0 disables the cap.
    pub max_active_runs: usize,

    // Built-in step execution
    pub execution_controls: bool,
    pub allow_quality_checks: bool,
    pub allow_commit: bool,
    pub quality_hooks: Vec<QualityHook>,
    pub command_max_attempts: u32,
    pub commit_message: Option<String>,
    pub workspace_root: PathBuf,

    // Telemetry
    pub telemetry_enabled: bool,

    // Dispatch retry backoff
    pub dispatch_retry_initial_ms: u64,
    pub dispatch_retry_max_ms: u64,

    // Checkpoint policy. Unset thresholds come from the style preset.
    pub policy_style: CheckpointStyle,
    pub confidence_threshold: Option<f64>,
    pub pause_threshold: Option<f64>,
    pub blast_radius_file_threshold: Option<u32>,
    pub default_confidence: f64,

    pub turn_matcher: TurnMatcherKind,
    pub templates_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workflows_enabled: true,
            max_active_runs: 16,
            execution_controls: false,
            allow_quality_checks: false,
            allow_commit: false,
            quality_hooks: vec![
                QualityHook::required("tests", "cargo test"),
                QualityHook::required("lint", "cargo clippy"),
                QualityHook::required("typecheck", "cargo check"),
            ],
            command_max_attempts: 2,
            commit_message: None,
            workspace_root: PathBuf::from("."),
            telemetry_enabled: true,
            dispatch_retry_initial_ms: 250,
            dispatch_retry_max_ms: 4000,
            policy_style: CheckpointStyle::Balanced,
            confidence_threshold: None,
            pause_threshold: None,
            blast_radius_file_threshold: None,
            default_confidence: 0.90,
            turn_matcher: TurnMatcherKind::Strict,
            templates_file: None,
        }
    }
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content, &path.display().to_string())
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str, source: &str) -> Result<()> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value, source)?;
        }
        Ok(())
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    /// Apply a single config value.
    fn apply_value(&mut self, key: &str, value: &str, source: &str) -> Result<()> {
        match key {
            "workflows_enabled" => self.workflows_enabled = Self::parse_bool(key, value)?,
            "max_active_runs" => self.max_active_runs = Self::parse_number(key, value)?,
            "execution_controls" => self.execution_controls = Self::parse_bool(key, value)?,
            "allow_quality_checks" => self.allow_quality_checks = Self::parse_bool(key, value)?,
            "allow_commit" => self.allow_commit = Self::parse_bool(key, value)?,
            "quality_hooks" => self.quality_hooks = QualityHook::parse_list(value)?,
            "command_max_attempts" => {
                self.command_max_attempts = Self::parse_number(key, value)?;
            }
            "commit_message" => {
                self.commit_message = (!value.is_empty()).then(|| value.to_string());
            }
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "telemetry_enabled" => self.telemetry_enabled = Self::parse_bool(key, value)?,
            "dispatch_retry_initial_ms" => {
                self.dispatch_retry_initial_ms = Self::parse_number(key, value)?;
            }
            "dispatch_retry_max_ms" => {
                self.dispatch_retry_max_ms = Self::parse_number(key, value)?;
            }
            "policy_style" => self.policy_style = CheckpointStyle::parse(value)?,
            "confidence_threshold" => {
                self.confidence_threshold = Some(Self::parse_number(key, value)?);
            }
            "pause_threshold" => self.pause_threshold = Some(Self::parse_number(key, value)?),
            "blast_radius_file_threshold" => {
                self.blast_radius_file_threshold = Some(Self::parse_number(key, value)?);
            }
            "default_confidence" => self.default_confidence = Self::parse_number(key, value)?,
            "turn_matcher" => {
                self.turn_matcher = match value {
                    "strict" => TurnMatcherKind::Strict,
                    "context_fallback" => TurnMatcherKind::ContextFallback,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "turn_matcher must be 'strict' or 'context_fallback', got '{value}'"
                        )))
                    }
                }
            }
            "templates_file" => {
                self.templates_file = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            _ => {
                warn!(key, source, "unknown config key");
            }
        }
        Ok(())
    }

    /// Parse a boolean value.
    fn parse_bool(key: &str, value: &str) -> Result<bool> {
        match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(true),
            "false" | "0" | "no" | "n" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidBool {
                key: key.to_string(),
                value: value.to_string(),
            }),
        }
    }

    fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T> {
        value.parse().map_err(|_| ConfigError::InvalidNumber {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Base checkpoint policy: the style preset with any explicit thresholds applied.
    pub fn policy(&self) -> Result<CheckpointPolicy> {
        let mut policy = CheckpointPolicy::for_style(self.policy_style);
        if let Some(value) = self.confidence_threshold {
            policy.confidence_threshold = value;
        }
        if let Some(value) = self.pause_threshold {
            policy.pause_threshold = value;
        }
        if let Some(value) = self.blast_radius_file_threshold {
            policy.high_blast_radius_file_count = value;
        }
        policy.validate()?;
        Ok(policy)
    }

    /// Command attempts after applying the hard cap.
    pub fn effective_command_attempts(&self) -> u32 {
        self.command_max_attempts.clamp(1, MAX_COMMAND_ATTEMPTS)
    }

    /// Resolve relative paths against a workspace root.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.workspace_root.is_relative() {
            self.workspace_root = base.join(&self.workspace_root);
        }
        if let Some(ref templates_file) = self.templates_file {
            if templates_file.is_relative() {
                self.templates_file = Some(base.join(templates_file));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        assert!(config.workflows_enabled);
        assert_eq!(config.max_active_runs, 16);
        assert!(!config.execution_controls);
        assert!(!config.allow_commit);
        assert_eq!(config.command_max_attempts, 2);
        assert_eq!(config.quality_hooks.len(), 3);
        assert!(config.quality_hooks.iter().all(|h| h.required));
        assert_eq!(config.turn_matcher, TurnMatcherKind::Strict);
        assert!((config.default_confidence - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_simple_config() {
        let mut config = Config::default();
        let content = r#"
# comment
workflows_enabled=no
max_active_runs=4
execution_controls=true
commit_message="feat(core): add guided runs"
turn_matcher=context_fallback
"#;
        config.parse_content(content, "test").unwrap();
        assert!(!config.workflows_enabled);
        assert_eq!(config.max_active_runs, 4);
        assert!(config.execution_controls);
        assert_eq!(
            config.commit_message.as_deref(),
            Some("feat(core): add guided runs")
        );
        assert_eq!(config.turn_matcher, TurnMatcherKind::ContextFallback);
    }

    #[test]
    fn parse_quality_hooks() {
        let hooks = QualityHook::parse_list("tests:cargo test | fmt?:cargo fmt --check").unwrap();
        assert_eq!(
            hooks,
            vec![
                QualityHook::required("tests", "cargo test"),
                QualityHook::optional("fmt", "cargo fmt --check"),
            ]
        );
    }

    #[test]
    fn hook_without_name_uses_command() {
        let hooks = QualityHook::parse_list("make check").unwrap();
        assert_eq!(hooks[0].name, "make check");
        assert!(QualityHook::parse_list("tests:").is_err());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let mut config = Config::default();
        config.parse_content("not_a_key=1", "test").unwrap();
        assert_eq!(config.max_active_runs, 16);
    }

    #[test]
    fn invalid_line_is_rejected() {
        let mut config = Config::default();
        assert!(matches!(
            config.parse_content("garbage", "test"),
            Err(ConfigError::InvalidLine(_))
        ));
        assert!(matches!(
            config.parse_content("max_active_runs=lots", "test"),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn unquote_removes_quotes() {
        assert_eq!(Config::unquote("\"hello\""), "hello");
        assert_eq!(Config::unquote("'world'"), "world");
        assert_eq!(Config::unquote("noquotes"), "noquotes");
    }

    #[test]
    fn parse_bool_accepts_variants() {
        assert!(Config::parse_bool("test", "true").unwrap());
        assert!(Config::parse_bool("test", "Y").unwrap());
        assert!(!Config::parse_bool("test", "off").unwrap());
        assert!(Config::parse_bool("test", "maybe").is_err());
    }

    #[test]
    fn policy_uses_style_preset_then_overrides() {
        let mut config = Config::default();
        config
            .parse_content("policy_style=strict\npause_threshold=0.6", "test")
            .unwrap();
        let policy = config.policy().unwrap();
        assert_eq!(policy.style, CheckpointStyle::Strict);
        assert!((policy.pause_threshold - 0.6).abs() < f64::EPSILON);
        assert!(policy.hard_gates.pre_commit_approval);
    }

    #[test]
    fn policy_rejects_bad_threshold() {
        let mut config = Config::default();
        config.parse_content("confidence_threshold=2", "test").unwrap();
        assert!(matches!(config.policy(), Err(ConfigError::Policy(_))));
    }

    #[test]
    fn command_attempts_are_capped() {
        let config = Config {
            command_max_attempts: 42,
            ..Default::default()
        };
        assert_eq!(config.effective_command_attempts(), MAX_COMMAND_ATTEMPTS);
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "allow_commit=true").unwrap();
        writeln!(file, "templates_file=templates.yaml").unwrap();
        let mut config = Config::from_file(file.path()).unwrap();
        assert!(config.allow_commit);

        config.resolve_paths(Path::new("/srv/repo"));
        assert_eq!(
            config.templates_file,
            Some(PathBuf::from("/srv/repo/templates.yaml"))
        );
    }
}
