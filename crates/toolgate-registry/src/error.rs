use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid tool name: {0:?}")]
    InvalidName(String),

    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("script for tool {tool} does not exist")]
    ScriptMissing { tool: String, path: PathBuf },

    #[error("script for tool {tool} resolves outside the tools root")]
    ScriptOutsideRoot { tool: String, path: PathBuf },
}

impl RegistryError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_display() {
        let err = RegistryError::NotFound("deploy".into());
        assert_eq!(err.to_string(), "tool not found: deploy");
    }

    #[test]
    fn script_errors_hide_path() {
        let err = RegistryError::ScriptOutsideRoot {
            tool: "evil".into(),
            path: PathBuf::from("/etc/passwd"),
        };
        let msg = err.to_string();
        assert!(msg.contains("evil"));
        assert!(!msg.contains("/etc/passwd"));
    }

    #[test]
    fn io_error_has_source() {
        use std::error::Error as _;
        let err = RegistryError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.source().is_some());
    }
}
