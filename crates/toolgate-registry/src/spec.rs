//! Declarative description of a single tool and its sandbox boundary.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Maximum length of a tool name.
pub const MAX_TOOL_NAME_LEN: usize = 64;

/// Subdirectory of a tool's script directory used as the sole base when a policy
/// lists no allowed paths.
pub const DEFAULT_WORKSPACE_DIR: &str = "workspace";

/// Returns `true` if `name` matches `[A-Za-z0-9_-]{1,64}`.
#[must_use]
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOOL_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Python,
    Shell,
}

impl ScriptType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Shell => "shell",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-schema primitive type of a declared parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    #[default]
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub param_type: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ParameterSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: String::new(),
            required: false,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Filesystem boundary for the path-shaped arguments of one tool.
///
/// `allowed_paths` entries are templates: `{TOOL_DIR}` expands to the directory holding
/// the script, `{HOME}` to the user's home directory and `{TEMP}` to the system temp
/// directory. A leading `~/` is treated as `{HOME}/`. Relative results are anchored at
/// the script directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspacePolicy {
    #[serde(default, alias = "allowedPaths")]
    pub allowed_paths: Vec<String>,
    #[serde(default, alias = "allowAbsolutePaths")]
    pub allow_absolute_paths: bool,
    #[serde(default = "default_true", alias = "followSymlinks")]
    pub follow_symlinks: bool,
    #[serde(default, alias = "maxStringLength")]
    pub max_string_length: Option<usize>,
    #[serde(default = "default_true", alias = "checkPromptInjection")]
    pub check_prompt_injection: bool,
}

impl Default for WorkspacePolicy {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            allow_absolute_paths: false,
            follow_symlinks: true,
            max_string_length: None,
            check_prompt_injection: true,
        }
    }
}

impl WorkspacePolicy {
    /// Expand the allowed path templates into concrete base directories, in order.
    ///
    /// Templates referencing `{HOME}` are dropped with a warning when no home directory
    /// can be determined.
    #[must_use]
    pub fn resolve_bases(&self, tool_dir: &Path) -> Vec<PathBuf> {
        if self.allowed_paths.is_empty() {
            return vec![tool_dir.join(DEFAULT_WORKSPACE_DIR)];
        }
        let home = dirs::home_dir();
        let temp = std::env::temp_dir();
        self.allowed_paths
            .iter()
            .filter_map(|template| {
                let expanded = expand_template(template, tool_dir, home.as_deref(), &temp);
                if expanded.is_none() {
                    tracing::warn!(%template, "cannot expand allowed path template, skipping");
                }
                expanded
            })
            .collect()
    }
}

fn expand_template(template: &str, tool_dir: &Path, home: Option<&Path>, temp: &Path) -> Option<PathBuf> {
    let mut raw = template.to_owned();
    if let Some(rest) = raw.strip_prefix("~/") {
        raw = format!("{{HOME}}/{rest}");
    } else if raw == "~" {
        raw = "{HOME}".to_owned();
    }
    if raw.contains("{HOME}") {
        raw = raw.replace("{HOME}", &home?.to_string_lossy());
    }
    let raw = raw
        .replace("{TOOL_DIR}", &tool_dir.to_string_lossy())
        .replace("{TEMP}", &temp.to_string_lossy());
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Some(path)
    } else {
        Some(tool_dir.join(path))
    }
}

/// Identity and execution contract for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Script location relative to the tools root.
    #[serde(alias = "scriptPath")]
    pub script_path: PathBuf,
    #[serde(alias = "scriptType")]
    pub script_type: ScriptType,
    #[serde(default = "default_true", alias = "requiresConfirmation")]
    pub requires_confirmation: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(
        default,
        rename = "workspace_config",
        alias = "workspacePolicy",
        alias = "workspace"
    )]
    pub workspace: WorkspacePolicy,
    #[serde(default, alias = "readOnly")]
    pub read_only: bool,
    #[serde(default)]
    pub destructive: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub examples: Vec<String>,
}

impl ToolSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, script_path: impl Into<PathBuf>, script_type: ScriptType) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            script_path: script_path.into(),
            script_type,
            requires_confirmation: true,
            parameters: Vec::new(),
            dependencies: Vec::new(),
            tags: BTreeSet::new(),
            enabled: true,
            workspace: WorkspacePolicy::default(),
            read_only: false,
            destructive: false,
            interactive: false,
            examples: Vec::new(),
        }
    }

    /// Description shown to clients, falling back to one derived from the script.
    #[must_use]
    pub fn display_description(&self) -> String {
        if self.description.trim().is_empty() {
            format!(
                "Execute {} script: {}",
                self.script_type,
                self.script_path.display()
            )
        } else {
            self.description.clone()
        }
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Directory holding the script; used as working directory and for `{TOOL_DIR}`.
    #[must_use]
    pub fn tool_dir(&self, tools_root: &Path) -> PathBuf {
        let script = tools_root.join(&self.script_path);
        script
            .parent()
            .map_or_else(|| tools_root.to_path_buf(), Path::to_path_buf)
    }

    /// Resolve the script against the tools root.
    ///
    /// This touches the filesystem on every call; scripts can disappear or be replaced
    /// by symlinks between calls.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::ScriptMissing`] if the script is not a regular file and
    /// [`RegistryError::ScriptOutsideRoot`] if it resolves outside `tools_root`.
    pub fn resolve_script(&self, tools_root: &Path) -> Result<PathBuf, RegistryError> {
        let joined = tools_root.join(&self.script_path);
        let missing = || RegistryError::ScriptMissing {
            tool: self.name.clone(),
            path: joined.clone(),
        };
        let root = std::fs::canonicalize(tools_root).map_err(|_| missing())?;
        let resolved = std::fs::canonicalize(&joined).map_err(|_| missing())?;
        if !resolved.starts_with(&root) {
            return Err(RegistryError::ScriptOutsideRoot {
                tool: self.name.clone(),
                path: resolved,
            });
        }
        if !resolved.is_file() {
            return Err(missing());
        }
        Ok(resolved)
    }

    /// Fill empty fields of `self` from `discovered`, leaving anything already set alone.
    ///
    /// Returns `true` if any field changed.
    pub fn fill_missing_from(&mut self, discovered: &ToolSpec) -> bool {
        let mut changed = false;
        if self.description.trim().is_empty() && !discovered.description.trim().is_empty() {
            self.description.clone_from(&discovered.description);
            changed = true;
        }
        if self.parameters.is_empty() && !discovered.parameters.is_empty() {
            self.parameters.clone_from(&discovered.parameters);
            changed = true;
        }
        if self.dependencies.is_empty() && !discovered.dependencies.is_empty() {
            self.dependencies.clone_from(&discovered.dependencies);
            changed = true;
        }
        if self.examples.is_empty() && !discovered.examples.is_empty() {
            self.examples.clone_from(&discovered.examples);
            changed = true;
        }
        if !self.interactive && discovered.interactive {
            self.interactive = true;
            changed = true;
        }
        changed
    }
}
