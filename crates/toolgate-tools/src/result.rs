use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Failure class of an execution. Callers decide on retries from this alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Unknown or disabled tool, missing script, bad argument shape.
    Validation,
    /// Resubmit with `confirm: true`.
    ConfirmationRequired,
    /// Retry after the indicated wait.
    RateLimit,
    /// Arguments rejected by the sanitizer; the script was not started.
    SecurityValidation,
    /// Missing interpreter or package.
    Dependency,
    Timeout,
    Execution,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ConfirmationRequired => "confirmation_required",
            Self::RateLimit => "rate_limit",
            Self::SecurityValidation => "security_validation",
            Self::Dependency => "dependency",
            Self::Timeout => "timeout",
            Self::Execution => "execution",
        }
    }

    /// Whether resubmitting the same call can succeed without changes on the host.
    #[must_use]
    pub fn is_recoverable(self) -> bool {
        matches!(self, Self::ConfirmationRequired | Self::RateLimit)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_seconds: f64,
    pub error_kind: Option<ErrorKind>,
    /// Caller-safe failure description.
    pub error: Option<String>,
    pub metadata: BTreeMap<String, Value>,
}

impl ExecutionResult {
    #[must_use]
    pub fn success(stdout: String, stderr: String, elapsed_seconds: f64) -> Self {
        Self {
            success: true,
            exit_code: 0,
            stdout,
            stderr,
            elapsed_seconds,
            error_kind: None,
            error: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Failure before or outside the script; exit code is `-1`.
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_seconds: 0.0,
            error_kind: Some(kind),
            error: Some(message.into()),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_elapsed(mut self, elapsed_seconds: f64) -> Self {
        self.elapsed_seconds = elapsed_seconds;
        self
    }

    /// Failure text for callers: the error message, else stderr, else a generic line.
    #[must_use]
    pub fn error_message(&self) -> String {
        if let Some(msg) = self.error.as_deref().filter(|m| !m.is_empty()) {
            return msg.to_owned();
        }
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("Script exited with code {}", self.exit_code)
        } else {
            stderr.to_owned()
        }
    }

    /// Structured stdout, when it is valid JSON.
    #[must_use]
    pub fn json_output(&self) -> Option<Value> {
        let trimmed = self.stdout.trim();
        if trimmed.is_empty() {
            return None;
        }
        serde_json::from_str(trimmed).ok()
    }

    /// Machine envelope: `{status, data|text, format, metadata}` on success and
    /// `{status, error, format, metadata}` on failure.
    #[must_use]
    pub fn to_envelope(&self) -> Value {
        let mut metadata = serde_json::Map::new();
        metadata.insert("executionTime".into(), json!(self.elapsed_seconds));
        metadata.insert("exitCode".into(), json!(self.exit_code));
        if let Some(kind) = self.error_kind {
            metadata.insert("errorKind".into(), json!(kind.as_str()));
        }
        for (key, value) in &self.metadata {
            metadata.entry(key.clone()).or_insert_with(|| value.clone());
        }

        if self.success {
            match self.json_output() {
                Some(data) => json!({
                    "status": "success",
                    "data": data,
                    "format": "json",
                    "metadata": metadata,
                }),
                None => json!({
                    "status": "success",
                    "text": self.stdout,
                    "format": "text",
                    "metadata": metadata,
                }),
            }
        } else {
            json!({
                "status": "error",
                "error": self.error_message(),
                "format": "text",
                "metadata": metadata,
            })
        }
    }
}

impl fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.success {
            return f.write_str(&self.stdout);
        }
        let kind = self.error_kind.unwrap_or(ErrorKind::Execution);
        write!(
            f,
            "Error executing tool (exit code {}) - {kind}:\n{}",
            self.exit_code,
            self.error_message()
        )
    }
}

/// Cut `text` to at most `max_chars` characters, appending a marker when cut.
///
/// `max_chars == 0` disables truncation. Returns the text and whether it was cut.
#[must_use]
pub fn truncate_output(text: &str, max_chars: usize) -> (String, bool) {
    if max_chars == 0 {
        return (text.to_owned(), false);
    }
    match text.char_indices().nth(max_chars) {
        None => (text.to_owned(), false),
        Some((byte_idx, _)) => {
            let dropped = text[byte_idx..].chars().count();
            (
                format!(
                    "{}\n... [output truncated: {dropped} more characters]",
                    &text[..byte_idx]
                ),
                true,
            )
        }
    }
}
