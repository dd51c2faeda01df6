//! Service configuration loading and validation.
//!
//! Reads a YAML file holding the server descriptors and global tuning, after
//! resolving `${VAR}` / `${VAR:-default}` environment references. The
//! configuration is read once at startup and never mutated by the core.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Automatic restart behaviour for one server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RestartPolicy {
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    /// Overrides `ServiceSettings::max_reconnect_attempts` when set.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_attempts: None,
        }
    }
}

/// Static description of one tool server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default)]
    pub restart: RestartPolicy,
    /// Per-call timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ServerDescriptor {
    /// A descriptor with defaults for everything but id and command.
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            enabled: true,
            auto_connect: true,
            restart: RestartPolicy::default(),
            timeout_ms: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn validate(&self) -> Result<(), McpError> {
        if self.id.trim().is_empty() {
            return Err(McpError::Config {
                reason: "server id must not be empty".into(),
            });
        }
        if self.command.trim().is_empty() {
            return Err(McpError::Config {
                reason: format!("server '{}' has an empty command", self.id),
            });
        }
        if self.timeout_ms == Some(0) {
            return Err(McpError::Config {
                reason: format!("server '{}' has a zero timeout", self.id),
            });
        }
        Ok(())
    }
}

/// Global tuning shared by all servers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServiceSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_tool_call_timeout_ms")]
    pub tool_call_timeout_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Ceiling on in-flight tool calls across all servers.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Working directory for servers without their own `cwd`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Append every execution record to this JSONL file.
    #[serde(default)]
    pub history_log_path: Option<PathBuf>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            tool_call_timeout_ms: default_tool_call_timeout_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
            history_capacity: default_history_capacity(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            working_dir: None,
            history_log_path: None,
        }
    }
}

impl ServiceSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Per-call timeout for a server: its override or the global default.
    pub fn call_timeout_for(&self, descriptor: &ServerDescriptor) -> Duration {
        Duration::from_millis(descriptor.timeout_ms.unwrap_or(self.tool_call_timeout_ms))
    }

    /// Automatic reconnect budget for a server.
    pub fn max_attempts_for(&self, descriptor: &ServerDescriptor) -> u32 {
        descriptor
            .restart
            .max_attempts
            .unwrap_or(self.max_reconnect_attempts)
    }

    fn validate(&self) -> Result<(), McpError> {
        let zero = [
            ("connect_timeout_ms", self.connect_timeout_ms == 0),
            ("tool_call_timeout_ms", self.tool_call_timeout_ms == 0),
            ("max_concurrent_calls", self.max_concurrent_calls == 0),
            ("history_capacity", self.history_capacity == 0),
        ];
        if let Some((field, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(McpError::Config {
                reason: format!("settings.{field} must be greater than zero"),
            });
        }
        if self.reconnect_base_delay_ms > self.reconnect_max_delay_ms {
            return Err(McpError::Config {
                reason: "settings.reconnect_base_delay_ms exceeds reconnect_max_delay_ms".into(),
            });
        }
        Ok(())
    }
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Directory for `toolhub.log`; logs go to stderr when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
    /// Rotated log files to keep.
    #[serde(default = "default_keep_logs")]
    pub keep: u32,
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default)]
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            json: false,
            keep: default_keep_logs(),
            filter: None,
        }
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub settings: ServiceSettings,
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_tool_call_timeout_ms() -> u64 {
    30_000
}
fn default_max_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_max_concurrent_calls() -> usize {
    16
}
fn default_history_capacity() -> usize {
    500
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_keep_logs() -> u32 {
    3
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl ServiceConfig {
    /// Load, interpolate and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        let raw = std::fs::read_to_string(path).map_err(|e| McpError::Config {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse and validate configuration from YAML text.
    ///
    /// Environment references are interpolated first; path fields then get
    /// a leading `~` expanded.
    pub fn from_yaml_str(raw: &str) -> Result<Self, McpError> {
        let interpolated = interpolate_env_vars(raw);
        let mut config: Self =
            serde_yaml::from_str(&interpolated).map_err(|e| McpError::Config {
                reason: format!("failed to parse config: {e}"),
            })?;
        config.expand_home_paths();
        config.validate()?;
        Ok(config)
    }

    fn expand_home_paths(&mut self) {
        let paths = [
            &mut self.settings.working_dir,
            &mut self.settings.history_log_path,
            &mut self.logging.directory,
        ];
        for path in paths.into_iter().chain(self.servers.iter_mut().map(|s| &mut s.cwd)) {
            if let Some(p) = path.as_mut() {
                *p = expand_home(p);
            }
        }
    }

    /// Check settings and descriptors; ids must be unique.
    pub fn validate(&self) -> Result<(), McpError> {
        self.settings.validate()?;
        let mut seen = HashSet::new();
        for descriptor in &self.servers {
            descriptor.validate()?;
            if !seen.insert(descriptor.id.as_str()) {
                return Err(McpError::Config {
                    reason: format!("duplicate server id '{}'", descriptor.id),
                });
            }
        }
        Ok(())
    }
}

/// Validate a single descriptor outside of a full config load.
pub fn validate_descriptor(descriptor: &ServerDescriptor) -> Result<(), McpError> {
    descriptor.validate()
}

/// Replace `${VAR}` and `${VAR:-default}` with environment values.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&resolve_var_expr(&after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated reference: keep it literally.
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// Resolve `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => std::env::var(name).unwrap_or_else(|_| expand_tilde(default)),
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` or `~/` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{rest}", home.display()),
        None => path.to_string(),
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(text) => PathBuf::from(expand_tilde(text)),
        None => path.to_path_buf(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
