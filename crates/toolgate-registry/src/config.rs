use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Placeholder style used when a sensitive value is scrubbed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedactionStyle {
    /// Fixed `[REDACTED]` placeholder.
    #[default]
    Full,
    /// First and last three characters kept.
    Partial,
    /// Rule name and original length kept.
    Hint,
}

/// Audit destination value that routes audit records into the `audit` tracing target.
pub const AUDIT_STDOUT: &str = "stdout";

/// Process-wide settings, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,

    #[serde(default = "default_true")]
    pub resource_limits_enabled: bool,
    #[serde(default = "default_max_cpu_seconds")]
    pub max_cpu_seconds: u64,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    #[serde(default = "default_max_processes")]
    pub max_processes: u64,
    #[serde(default = "default_max_file_size_mb")]
    pub max_file_size_mb: u64,

    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,
    #[serde(default = "default_true")]
    pub rate_limiting_enabled: bool,
    #[serde(default = "default_max_executions_per_minute")]
    pub max_executions_per_minute: usize,

    #[serde(default)]
    pub redaction_style: RedactionStyle,
    #[serde(default)]
    pub sensitive_keys: Vec<String>,
    #[serde(default = "default_true")]
    pub scan_values: bool,

    #[serde(default = "default_true")]
    pub audit_logging: bool,
    #[serde(default = "default_audit_destination")]
    pub audit_destination: String,
    #[serde(default)]
    pub include_error_details: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub log_arguments: bool,
}

fn default_true() -> bool {
    true
}

fn default_server_name() -> String {
    "toolgate".into()
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_max_output_length() -> usize {
    10_000
}

fn default_max_cpu_seconds() -> u64 {
    60
}

fn default_max_memory_mb() -> u64 {
    512
}

fn default_max_processes() -> u64 {
    10
}

fn default_max_file_size_mb() -> u64 {
    100
}

fn default_max_concurrent_executions() -> usize {
    5
}

fn default_max_executions_per_minute() -> usize {
    10
}

fn default_audit_destination() -> String {
    "audit.log".into()
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            timeout_seconds: default_timeout_seconds(),
            max_output_length: default_max_output_length(),
            resource_limits_enabled: true,
            max_cpu_seconds: default_max_cpu_seconds(),
            max_memory_mb: default_max_memory_mb(),
            max_processes: default_max_processes(),
            max_file_size_mb: default_max_file_size_mb(),
            max_concurrent_executions: default_max_concurrent_executions(),
            rate_limiting_enabled: true,
            max_executions_per_minute: default_max_executions_per_minute(),
            redaction_style: RedactionStyle::default(),
            sensitive_keys: Vec::new(),
            scan_values: true,
            audit_logging: true,
            audit_destination: default_audit_destination(),
            include_error_details: false,
            log_level: default_log_level(),
            log_arguments: true,
        }
    }
}

impl GlobalConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Concurrency cap, never below one.
    #[must_use]
    pub fn concurrency_cap(&self) -> usize {
        self.max_concurrent_executions.max(1)
    }

    /// Audit file location, or `None` when audit records go to the tracing target.
    #[must_use]
    pub fn audit_path(&self, config_dir: &Path) -> Option<PathBuf> {
        if self.audit_destination == AUDIT_STDOUT {
            return None;
        }
        let path = PathBuf::from(&self.audit_destination);
        Some(if path.is_absolute() {
            path
        } else {
            config_dir.join(path)
        })
    }
}
