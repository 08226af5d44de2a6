//! Engine configuration: defaults, config file and validation.
//!
//! The file format is a small TOML subset: `key = value` lines, `#` comments,
//! double-quoted strings, integers and booleans, plus one `[routing]` table
//! whose lines map a source key to a list of strategy names:
//!
//! ```text
//! max_workers = 8
//! stall_timeout_secs = 45
//!
//! [routing]
//! default = ["direct", "apple_podcasts", "youtube", "browser"]
//! "tim-ferriss" = ["youtube", "direct"]
//! ```

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::failure::RetryPolicy;
use crate::machine::{ArtifactValidator, WatchdogLimits};
use crate::routing::RoutingTable;
use crate::scheduler::PoolLimits;

/// Configuration errors; all are fatal before any target is admitted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config syntax on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("Unknown configuration key: '{key}' on line {line}")]
    UnknownKey { key: String, line: usize },

    #[error("Invalid config value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },

    #[error(
        "routing rule for '{source_key}' names unknown strategy '{strategy}'\n  Suggestion: Registered strategies: {registered}"
    )]
    UnknownStrategy {
        source_key: String,
        strategy: String,
        registered: String,
    },

    #[error("routing rule for '{source_key}' is invalid: {message}")]
    Routing { source_key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Everything the orchestrator needs to run a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Configured ceiling for the general pool.
    pub max_workers: usize,
    pub per_task_memory_mb: u64,
    pub long_transfer_slots: usize,
    pub interactive_slots: usize,
    pub stall_timeout: Duration,
    pub hard_timeout: Duration,
    pub batch_deadline: Option<Duration>,
    pub transient_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub min_artifact_bytes: u64,
    pub resize_interval: Option<Duration>,
    /// Run mode handed to every strategy invocation.
    pub run_profile: String,
    pub routing: RoutingTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("episodes"),
            state_dir: PathBuf::from(".acquirer"),
            max_workers: 10,
            per_task_memory_mb: 256,
            long_transfer_slots: 2,
            interactive_slots: 1,
            stall_timeout: Duration::from_secs(60),
            hard_timeout: Duration::from_secs(1800),
            batch_deadline: None,
            transient_retries: 2,
            backoff_base: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(30_000),
            min_artifact_bytes: 1024,
            resize_interval: None,
            run_profile: "full".to_string(),
            routing: RoutingTable::new(),
        }
    }
}

impl EngineConfig {
    /// Validates value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_workers) {
            return Err(ConfigError::invalid(
                "max_workers",
                format!("{}. Expected range: 1..=100", self.max_workers),
            ));
        }
        if self.per_task_memory_mb == 0 {
            return Err(ConfigError::invalid("per_task_memory_mb", "must be at least 1"));
        }
        if self.long_transfer_slots == 0 {
            return Err(ConfigError::invalid("long_transfer_slots", "must be at least 1"));
        }
        if self.interactive_slots == 0 {
            return Err(ConfigError::invalid("interactive_slots", "must be at least 1"));
        }
        if self.stall_timeout.is_zero() {
            return Err(ConfigError::invalid("stall_timeout_secs", "must be at least 1"));
        }
        if self.hard_timeout < self.stall_timeout {
            return Err(ConfigError::invalid(
                "hard_timeout_secs",
                "must not be shorter than stall_timeout_secs",
            ));
        }
        if self.batch_deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("batch_deadline_secs", "must be at least 1"));
        }
        if self.resize_interval.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::invalid("resize_interval_secs", "must be at least 1"));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::invalid(
                "backoff_max_ms",
                "must not be below backoff_base_ms",
            ));
        }
        if self.run_profile.trim().is_empty() {
            return Err(ConfigError::invalid("run_profile", "must not be empty"));
        }
        Ok(())
    }

    #[must_use]
    pub fn pool_limits(&self) -> PoolLimits {
        PoolLimits {
            max_workers: self.max_workers,
            per_task_memory: self.per_task_memory_mb.saturating_mul(1024 * 1024),
            long_transfer_slots: self.long_transfer_slots,
            interactive_slots: self.interactive_slots,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.transient_retries, self.backoff_base, self.backoff_max)
    }

    #[must_use]
    pub fn watchdog_limits(&self) -> WatchdogLimits {
        WatchdogLimits {
            stall_timeout: self.stall_timeout,
            hard_timeout: self.hard_timeout,
        }
    }

    #[must_use]
    pub fn validator(&self) -> ArtifactValidator {
        ArtifactValidator::new(self.min_artifact_bytes)
    }
}

/// Config loaded from the default location.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    pub config: EngineConfig,
    pub loaded_from_file: bool,
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/acquirer/config.toml`
/// 2. `$HOME/.config/acquirer/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("acquirer")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("acquirer")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the default config file if present, else defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file exists but cannot be read or parsed.
pub fn load_default_config() -> Result<LoadedConfig, ConfigError> {
    let path = resolve_default_config_path();
    match path.as_deref() {
        Some(path_ref) if path_ref.exists() => {
            let config = load_config(path_ref)?;
            Ok(LoadedConfig {
                path,
                config,
                loaded_from_file: true,
            })
        }
        _ => Ok(LoadedConfig {
            path,
            config: EngineConfig::default(),
            loaded_from_file: false,
        }),
    }
}

/// Loads and validates a config file.
///
/// # Errors
///
/// Returns [`ConfigError`] on read, syntax or validation failure.
pub fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config_str(&raw)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Root,
    Routing,
}

/// Parses config text over the defaults.
///
/// # Errors
///
/// Returns [`ConfigError`] on syntax errors, unknown keys, bad values or
/// malformed routing rules.
pub fn parse_config_str(raw: &str) -> Result<EngineConfig, ConfigError> {
    let mut cfg = EngineConfig::default();
    let mut section = Section::Root;

    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            section = match header.trim() {
                "routing" => Section::Routing,
                other => {
                    return Err(ConfigError::Syntax {
                        line: line_no,
                        message: format!("unknown section [{other}]"),
                    });
                }
            };
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::Syntax {
                line: line_no,
                message: "expected key = value".to_string(),
            });
        };
        let key = raw_key.trim();
        let value = raw_value.trim();

        match section {
            Section::Root => apply_root_key(&mut cfg, key, value, line_no)?,
            Section::Routing => {
                let source_key = parse_routing_key(key, line_no)?;
                let strategies = parse_string_list(value).map_err(|message| {
                    ConfigError::Routing {
                        source_key: source_key.clone(),
                        message,
                    }
                })?;
                validate_route(&source_key, &strategies)?;
                cfg.routing.insert(source_key, strategies);
            }
        }
    }

    cfg.validate()?;
    Ok(cfg)
}

fn apply_root_key(
    cfg: &mut EngineConfig,
    key: &str,
    value: &str,
    line_no: usize,
) -> Result<(), ConfigError> {
    let on_line = |message: String| ConfigError::invalid(key, format!("{message} (line {line_no})"));

    match key {
        "output_dir" => cfg.output_dir = PathBuf::from(parse_string_literal(value).map_err(on_line)?),
        "state_dir" => cfg.state_dir = PathBuf::from(parse_string_literal(value).map_err(on_line)?),
        "run_profile" => cfg.run_profile = parse_string_literal(value).map_err(on_line)?,
        "max_workers" => cfg.max_workers = parse_usize(value).map_err(on_line)?,
        "per_task_memory_mb" => cfg.per_task_memory_mb = parse_integer_u64(value).map_err(on_line)?,
        "long_transfer_slots" => cfg.long_transfer_slots = parse_usize(value).map_err(on_line)?,
        "interactive_slots" => cfg.interactive_slots = parse_usize(value).map_err(on_line)?,
        "stall_timeout_secs" => {
            cfg.stall_timeout = Duration::from_secs(parse_integer_u64(value).map_err(on_line)?);
        }
        "hard_timeout_secs" => {
            cfg.hard_timeout = Duration::from_secs(parse_integer_u64(value).map_err(on_line)?);
        }
        "batch_deadline_secs" => {
            cfg.batch_deadline =
                Some(Duration::from_secs(parse_integer_u64(value).map_err(on_line)?));
        }
        "transient_retries" => {
            let parsed = parse_integer_u64(value).map_err(on_line)?;
            cfg.transient_retries = u32::try_from(parsed)
                .map_err(|_| on_line("integer value out of range for u32".to_string()))?;
        }
        "backoff_base_ms" => {
            cfg.backoff_base = Duration::from_millis(parse_integer_u64(value).map_err(on_line)?);
        }
        "backoff_max_ms" => {
            cfg.backoff_max = Duration::from_millis(parse_integer_u64(value).map_err(on_line)?);
        }
        "min_artifact_bytes" => cfg.min_artifact_bytes = parse_integer_u64(value).map_err(on_line)?,
        "resize_interval_secs" => {
            cfg.resize_interval =
                Some(Duration::from_secs(parse_integer_u64(value).map_err(on_line)?));
        }
        unknown => {
            return Err(ConfigError::UnknownKey {
                key: unknown.to_string(),
                line: line_no,
            });
        }
    }
    Ok(())
}

fn validate_route(source_key: &str, strategies: &[String]) -> Result<(), ConfigError> {
    if strategies.is_empty() {
        return Err(ConfigError::Routing {
            source_key: source_key.to_string(),
            message: "strategy list is empty".to_string(),
        });
    }
    let mut seen = BTreeSet::new();
    for name in strategies {
        if name.trim().is_empty() {
            return Err(ConfigError::Routing {
                source_key: source_key.to_string(),
                message: "strategy name is empty".to_string(),
            });
        }
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::Routing {
                source_key: source_key.to_string(),
                message: format!("strategy '{name}' listed twice"),
            });
        }
    }
    Ok(())
}

fn parse_routing_key(raw_key: &str, line_no: usize) -> Result<String, ConfigError> {
    let key = if raw_key.starts_with('"') {
        parse_string_literal(raw_key).map_err(|message| ConfigError::Syntax {
            line: line_no,
            message,
        })?
    } else {
        raw_key.to_string()
    };
    if key.trim().is_empty() {
        return Err(ConfigError::Syntax {
            line: line_no,
            message: "routing key is empty".to_string(),
        });
    }
    Ok(key.trim().to_ascii_lowercase())
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String, String> {
    let raw_value = raw_value.trim();
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        return Err("expected double-quoted string".to_string());
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_string_list(raw_value: &str) -> Result<Vec<String>, String> {
    let inner = raw_value
        .trim()
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| "expected a list like [\"direct\", \"youtube\"]".to_string())?;

    inner
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(parse_string_literal)
        .collect()
}

fn parse_integer_u64(raw_value: &str) -> Result<u64, String> {
    let token = raw_value.trim();
    if token.is_empty() {
        return Err("expected integer value".to_string());
    }
    let value = token.parse::<i128>().map_err(|e| e.to_string())?;
    if value < 0 {
        return Err("expected non-negative integer".to_string());
    }
    u64::try_from(value).map_err(|_| "integer value out of range for u64".to_string())
}

fn parse_usize(raw_value: &str) -> Result<usize, String> {
    let value = parse_integer_u64(raw_value)?;
    usize::try_from(value).map_err(|_| "integer value out of range".to_string())
}
