//! On-disk configuration layout.
//!
//! ```text
//! <config_dir>/
//!   global.json            GlobalConfig
//!   overrides.json         ad-hoc key/value overrides
//!   tools/<name>.json      one ToolConfigFile per tool (source of truth)
//!   tools.json             compiled map of enabled tools (derived)
//!   .discovery_timestamp   unix seconds of the last full discovery
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::GlobalConfig;
use crate::error::RegistryError;
use crate::spec::{ToolSpec, is_valid_tool_name};

pub const TOOLS_DIR: &str = "tools";
pub const GLOBAL_FILE: &str = "global.json";
pub const OVERRIDES_FILE: &str = "overrides.json";
pub const COMPILED_FILE: &str = "tools.json";
pub const TIMESTAMP_FILE: &str = ".discovery_timestamp";

fn default_true() -> bool {
    true
}

/// Persisted wrapper around one [`ToolSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolConfigFile {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, alias = "lastModified")]
    pub last_modified: Option<String>,
    #[serde(default, alias = "autoDetected")]
    pub auto_detected: bool,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(alias = "scriptConfig")]
    pub script_config: ToolSpec,
}

impl ToolConfigFile {
    #[must_use]
    pub fn from_spec(spec: &ToolSpec, auto_detected: bool) -> Self {
        Self {
            enabled: spec.enabled,
            last_modified: Some(chrono::Utc::now().to_rfc3339()),
            auto_detected,
            tags: spec.tags.clone(),
            script_config: spec.clone(),
        }
    }

    /// Collapse the wrapper into a spec. The outer `enabled` flag wins and outer tags
    /// are merged in.
    #[must_use]
    pub fn into_spec(self) -> ToolSpec {
        let mut spec = self.script_config;
        spec.enabled = self.enabled;
        spec.tags.extend(self.tags);
        spec
    }
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    config_dir: PathBuf,
}

impl ConfigStore {
    #[must_use]
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    #[must_use]
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    #[must_use]
    pub fn tools_dir(&self) -> PathBuf {
        self.config_dir.join(TOOLS_DIR)
    }

    /// Location of a tool's config file. The name must be a valid tool name so it cannot
    /// escape the tools directory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] for names outside `[A-Za-z0-9_-]{1,64}`.
    pub fn tool_file(&self, name: &str) -> Result<PathBuf, RegistryError> {
        if !is_valid_tool_name(name) {
            return Err(RegistryError::InvalidName(name.to_owned()));
        }
        Ok(self.tools_dir().join(format!("{name}.json")))
    }

    /// Create the config and tools directories.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<(), RegistryError> {
        let tools = self.tools_dir();
        std::fs::create_dir_all(&tools).map_err(|e| RegistryError::io(&tools, e))
    }

    /// Load `global.json` with `overrides.json` applied on top.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if either file exists but cannot be read or parsed.
    pub fn load_global(&self) -> Result<GlobalConfig, RegistryError> {
        let path = self.config_dir.join(GLOBAL_FILE);
        let mut base = match read_json(&path)? {
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(RegistryError::json(
                    &path,
                    serde::de::Error::custom("expected a JSON object"),
                ));
            }
            None => Map::new(),
        };

        let overrides = self.load_overrides()?;
        if !overrides.is_empty() {
            let known = known_global_keys();
            for (key, value) in overrides {
                if known.contains(&key) {
                    tracing::debug!(%key, "applying global override");
                    base.insert(key, value);
                }
            }
        }

        serde_json::from_value(Value::Object(base)).map_err(|e| RegistryError::json(&path, e))
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_global(&self, config: &GlobalConfig) -> Result<(), RegistryError> {
        write_json(&self.config_dir.join(GLOBAL_FILE), config)
    }

    /// Raw `overrides.json` content; empty when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is not a JSON object.
    pub fn load_overrides(&self) -> Result<Map<String, Value>, RegistryError> {
        let path = self.config_dir.join(OVERRIDES_FILE);
        match read_json(&path)? {
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(RegistryError::json(
                &path,
                serde::de::Error::custom("expected a JSON object"),
            )),
            None => Ok(Map::new()),
        }
    }

    /// Look up a single override key.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::load_overrides`] failures.
    pub fn override_value(&self, key: &str) -> Result<Option<Value>, RegistryError> {
        Ok(self.load_overrides()?.remove(key))
    }

    /// Load every tool definition.
    ///
    /// Individual files under `tools/` are authoritative. When that directory does not
    /// exist, a legacy compiled `tools.json` is read instead. Unparseable tool files are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error only if the tools directory exists but cannot be listed.
    pub fn load_tools(&self) -> Result<Vec<ToolSpec>, RegistryError> {
        let dir = self.tools_dir();
        if !dir.is_dir() {
            return self.load_compiled();
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| RegistryError::io(&dir, e))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut specs = Vec::with_capacity(files.len());
        for path in files {
            match load_tool_file(&path) {
                Ok(file) => specs.push(file.into_spec()),
                Err(e) => tracing::warn!("skipping tool config {}: {e:#}", path.display()),
            }
        }
        tracing::debug!(count = specs.len(), "loaded tool configs");
        Ok(specs)
    }

    /// Persist one tool as `tools/<name>.json`, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Returns an error for invalid names or failed writes.
    pub fn save_tool(&self, spec: &ToolSpec, auto_detected: bool) -> Result<PathBuf, RegistryError> {
        let path = self.tool_file(&spec.name)?;
        self.ensure_layout()?;
        write_json(&path, &ToolConfigFile::from_spec(spec, auto_detected))?;
        Ok(path)
    }

    /// Read back a single persisted tool file.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid or the file cannot be read or parsed.
    pub fn load_tool(&self, name: &str) -> Result<Option<ToolConfigFile>, RegistryError> {
        let path = self.tool_file(name)?;
        if !path.exists() {
            return Ok(None);
        }
        load_tool_file(&path).map(Some)
    }

    /// Time of the last full discovery. `None` when the marker is absent or unreadable.
    #[must_use]
    pub fn read_discovery_timestamp(&self) -> Option<SystemTime> {
        let path = self.config_dir.join(TIMESTAMP_FILE);
        let raw = std::fs::read_to_string(&path).ok()?;
        let secs: f64 = raw.trim().parse().ok()?;
        UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(secs).ok()?)
    }

    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn write_discovery_timestamp(&self, at: SystemTime) -> Result<(), RegistryError> {
        let secs = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let path = self.config_dir.join(TIMESTAMP_FILE);
        std::fs::create_dir_all(&self.config_dir)
            .map_err(|e| RegistryError::io(&self.config_dir, e))?;
        std::fs::write(&path, format!("{secs:.6}")).map_err(|e| RegistryError::io(&path, e))
    }

    /// Write `tools.json`, a flat map of enabled tool name to spec, from the individual
    /// files. Returns the number of tools written.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool files cannot be listed or the output cannot be written.
    pub fn build_compiled(&self) -> Result<usize, RegistryError> {
        let mut compiled = Map::new();
        for spec in self.load_tools()?.into_iter().filter(|s| s.enabled) {
            let value =
                serde_json::to_value(&spec).map_err(|e| RegistryError::json(self.tools_dir(), e))?;
            compiled.insert(spec.name, value);
        }
        let count = compiled.len();
        write_json(&self.config_dir.join(COMPILED_FILE), &Value::Object(compiled))?;
        tracing::info!(count, "built compiled tool registry");
        Ok(count)
    }

    /// Split a legacy `tools.json` into individual tool files and move the original aside
    /// as `tools.json.backup.<timestamp>`. Returns the number of tools migrated.
    ///
    /// # Errors
    ///
    /// Returns an error if the legacy file is malformed or a write fails.
    pub fn migrate_legacy(&self) -> Result<usize, RegistryError> {
        let path = self.config_dir.join(COMPILED_FILE);
        if !path.exists() {
            tracing::info!("no legacy tools.json to migrate");
            return Ok(0);
        }
        let specs = self.load_compiled()?;
        for spec in &specs {
            self.save_tool(spec, false)?;
        }
        let backup = self.config_dir.join(format!(
            "{COMPILED_FILE}.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));
        std::fs::rename(&path, &backup).map_err(|e| RegistryError::io(&path, e))?;
        tracing::info!(count = specs.len(), backup = %backup.display(), "migrated legacy tools.json");
        Ok(specs.len())
    }

    fn load_compiled(&self) -> Result<Vec<ToolSpec>, RegistryError> {
        let path = self.config_dir.join(COMPILED_FILE);
        let Some(value) = read_json(&path)? else {
            return Ok(Vec::new());
        };
        let Value::Object(map) = value else {
            return Err(RegistryError::json(
                &path,
                serde::de::Error::custom("expected a JSON object"),
            ));
        };
        let mut specs = Vec::with_capacity(map.len());
        for (name, mut entry) in map {
            if let Value::Object(fields) = &mut entry {
                fields
                    .entry("name")
                    .or_insert_with(|| Value::String(name.clone()));
            }
            match serde_json::from_value::<ToolSpec>(entry) {
                Ok(spec) => specs.push(spec),
                Err(e) => tracing::warn!(%name, "skipping legacy tool entry: {e}"),
            }
        }
        Ok(specs)
    }
}

fn known_global_keys() -> BTreeSet<String> {
    match serde_json::to_value(GlobalConfig::default()) {
        Ok(Value::Object(map)) => map.into_iter().map(|(k, _)| k).collect(),
        _ => BTreeSet::new(),
    }
}

fn load_tool_file(path: &Path) -> Result<ToolConfigFile, RegistryError> {
    let raw = std::fs::read_to_string(path).map_err(|e| RegistryError::io(path, e))?;
    serde_json::from_str(&raw).map_err(|e| RegistryError::json(path, e))
}

fn read_json(path: &Path) -> Result<Option<Value>, RegistryError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| RegistryError::json(path, e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(RegistryError::io(path, e)),
    }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), RegistryError> {
    let mut body = serde_json::to_string_pretty(value).map_err(|e| RegistryError::json(path, e))?;
    body.push('\n');
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RegistryError::io(parent, e))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body).map_err(|e| RegistryError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| RegistryError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RedactionStyle;
    use crate::spec::ScriptType;

    fn store() -> (tempfile::TempDir, ConfigStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn missing_global_is_default() {
        let (_dir, store) = store();
        assert_eq!(store.load_global().unwrap(), GlobalConfig::default());
    }

    #[test]
    fn malformed_global_is_error() {
        let (dir, store) = store();
        std::fs::write(dir.path().join(GLOBAL_FILE), "{not json").unwrap();
        assert!(matches!(store.load_global(), Err(RegistryError::Json { .. })));
    }

    #[test]
    fn overrides_apply_to_known_keys_only() {
        let (dir, store) = store();
        std::fs::write(
            dir.path().join(GLOBAL_FILE),
            r#"{"timeout_seconds": 30, "redaction_style": "partial"}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join(OVERRIDES_FILE),
            r#"{"timeout_seconds": 5, "ui_theme": "dark"}"#,
        )
        .unwrap();
        let config = store.load_global().unwrap();
        assert_eq!(config.timeout_seconds, 5);
        assert_eq!(config.redaction_style, RedactionStyle::Partial);
        assert_eq!(
            store.override_value("ui_theme").unwrap(),
            Some(Value::String("dark".into()))
        );
    }

    #[test]
    fn save_and_load_tool_round_trip() {
        let (_dir, store) = store();
        let mut spec = ToolSpec::new("greet", "greet/run.sh", ScriptType::Shell);
        spec.tags.insert("demo".into());
        let path = store.save_tool(&spec, true).unwrap();
        assert!(path.ends_with("tools/greet.json"));

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["enabled"], true);
        assert_eq!(raw["auto_detected"], true);
        assert!(raw["last_modified"].is_string());
        assert_eq!(raw["script_config"]["name"], "greet");

        let loaded = store.load_tools().unwrap();
        assert_eq!(loaded, vec![spec]);
    }

    #[test]
    fn outer_enabled_flag_wins() {
        let (dir, store) = store();
        store.ensure_layout().unwrap();
        std::fs::write(
            dir.path().join("tools/x.json"),
            r#"{"enabled": false, "tags": ["outer"],
                "scriptConfig": {"name": "x", "scriptPath": "x.sh", "scriptType": "shell",
                                 "enabled": true, "tags": ["inner"]}}"#,
        )
        .unwrap();
        let specs = store.load_tools().unwrap();
        assert_eq!(specs.len(), 1);
        assert!(!specs[0].enabled);
        assert!(specs[0].tags.contains("outer"));
        assert!(specs[0].tags.contains("inner"));
    }

    #[test]
    fn malformed_tool_file_is_skipped() {
        let (dir, store) = store();
        store
            .save_tool(&ToolSpec::new("good", "good.sh", ScriptType::Shell), false)
            .unwrap();
        std::fs::write(dir.path().join("tools/bad.json"), "[]").unwrap();
        let specs = store.load_tools().unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "good");
    }

    #[test]
    fn tool_file_rejects_traversal_names() {
        let (_dir, store) = store();
        assert!(matches!(
            store.tool_file("../../etc/passwd"),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn timestamp_round_trip_and_garbage() {
        let (dir, store) = store();
        assert!(store.read_discovery_timestamp().is_none());
        let at = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        store.write_discovery_timestamp(at).unwrap();
        let read = store.read_discovery_timestamp().unwrap();
        assert_eq!(read.duration_since(UNIX_EPOCH).unwrap().as_secs(), 1_700_000_000);

        std::fs::write(dir.path().join(TIMESTAMP_FILE), "yesterday").unwrap();
        assert!(store.read_discovery_timestamp().is_none());
    }

    #[test]
    fn build_compiled_contains_enabled_only() {
        let (dir, store) = store();
        store
            .save_tool(&ToolSpec::new("on", "on.sh", ScriptType::Shell), false)
            .unwrap();
        let mut off = ToolSpec::new("off", "off.sh", ScriptType::Shell);
        off.enabled = false;
        store.save_tool(&off, false).unwrap();

        assert_eq!(store.build_compiled().unwrap(), 1);
        let compiled: Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(COMPILED_FILE)).unwrap())
                .unwrap();
        assert!(compiled.get("on").is_some());
        assert!(compiled.get("off").is_none());
    }

    #[test]
    fn legacy_file_is_read_then_migrated() {
        let (dir, store) = store();
        std::fs::write(
            dir.path().join(COMPILED_FILE),
            r#"{"legacy": {"script_path": "legacy.py", "script_type": "python",
                           "description": "old tool"}}"#,
        )
        .unwrap();
        let specs = store.load_tools().unwrap();
        assert_eq!(specs[0].name, "legacy");

        assert_eq!(store.migrate_legacy().unwrap(), 1);
        assert!(!dir.path().join(COMPILED_FILE).exists());
        let backups = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("tools.json.backup."))
            .count();
        assert_eq!(backups, 1);
        let migrated = store.load_tool("legacy").unwrap().unwrap();
        assert_eq!(migrated.script_config.description, "old tool");
    }
}
