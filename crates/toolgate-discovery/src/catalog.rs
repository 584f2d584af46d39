use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use toolgate_registry::{ConfigStore, ScriptType, ToolSpec};

use crate::classify::{classify, is_excluded_dir, refine_with_shebang};
use crate::error::{DiscoveryError, Result};
use crate::metadata::ScriptMetadata;
use crate::naming::tool_name_for;
use crate::{python, shell};

/// Outcome of one discovery run.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryReport {
    /// Every known tool after the run, including disabled ones.
    pub tools: BTreeMap<String, ToolSpec>,
    /// `false` when the persisted registry was reused without rescanning.
    pub full_scan: bool,
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub skipped_disabled: Vec<String>,
}

struct Candidate {
    absolute: PathBuf,
    relative: PathBuf,
    script_type: ScriptType,
}

/// Scans a tools root and keeps the persisted registry in step with it.
///
/// Discovery only adds tools and fills empty fields of existing ones. It never deletes
/// a tool and never touches a tool that has been disabled.
#[derive(Debug, Clone)]
pub struct ScriptCatalog {
    tools_root: PathBuf,
    store: ConfigStore,
}

impl ScriptCatalog {
    #[must_use]
    pub fn new(tools_root: impl Into<PathBuf>, store: ConfigStore) -> Self {
        Self {
            tools_root: tools_root.into(),
            store,
        }
    }

    #[must_use]
    pub fn tools_root(&self) -> &Path {
        &self.tools_root
    }

    #[must_use]
    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Discover tools. Unless `force_full` is set, a persisted registry is reused when
    /// nothing under the tools root changed since the last full scan.
    ///
    /// # Errors
    ///
    /// Returns an error if the tools root is missing or the registry cannot be written.
    pub fn discover(&self, force_full: bool) -> Result<DiscoveryReport> {
        if !self.tools_root.is_dir() {
            return Err(DiscoveryError::MissingRoot(self.tools_root.clone()));
        }
        tracing::info!(root = %self.tools_root.display(), force_full, "discovering scripts");

        if !force_full && let Some(tools) = self.try_incremental() {
            tracing::info!(count = tools.len(), "no changes since last discovery");
            return Ok(DiscoveryReport {
                tools,
                ..DiscoveryReport::default()
            });
        }
        self.full_discovery()
    }

    /// Persisted tools keyed by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the tools directory cannot be listed.
    pub fn load_existing(&self) -> Result<BTreeMap<String, ToolSpec>> {
        Ok(self
            .store
            .load_tools()?
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect())
    }

    fn try_incremental(&self) -> Option<BTreeMap<String, ToolSpec>> {
        let existing = match self.load_existing() {
            Ok(existing) if !existing.is_empty() => existing,
            Ok(_) => {
                tracing::info!("no existing tool configs, full discovery required");
                return None;
            }
            Err(e) => {
                tracing::warn!("failed to load existing tool configs: {e}");
                return None;
            }
        };
        let Some(since) = self.store.read_discovery_timestamp() else {
            tracing::info!("no discovery timestamp, full discovery required");
            return None;
        };
        if self.has_changes_since(since) {
            return None;
        }
        Some(existing)
    }

    /// Any candidate script or directory modified after `since`. Errors count as changes.
    fn has_changes_since(&self, since: SystemTime) -> bool {
        for entry in self.walker() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("walk error during change check: {e}");
                    return true;
                }
            };
            let Ok(metadata) = entry.metadata() else {
                return true;
            };
            let relevant = metadata.is_dir()
                || classify(self.relative(entry.path()), &metadata).is_some();
            if !relevant {
                continue;
            }
            match metadata.modified() {
                Ok(modified) if modified <= since => {}
                Ok(_) => {
                    tracing::info!(path = %entry.path().display(), "change detected");
                    return true;
                }
                Err(_) => return true,
            }
        }
        false
    }

    fn full_discovery(&self) -> Result<DiscoveryReport> {
        let started = SystemTime::now();
        let existing = self.load_existing()?;
        let mut report = DiscoveryReport {
            tools: existing.clone(),
            full_scan: true,
            ..DiscoveryReport::default()
        };
        let mut seen = HashSet::new();

        for candidate in self.candidates() {
            let name = tool_name_for(&candidate.relative);
            if !seen.insert(name.clone()) {
                tracing::warn!(
                    tool = %name,
                    path = %candidate.relative.display(),
                    "tool name already taken by another script, skipping"
                );
                continue;
            }
            if existing.get(&name).is_some_and(|spec| !spec.enabled) {
                report.skipped_disabled.push(name);
                continue;
            }
            let Some((script_type, metadata)) = inspect(&candidate) else {
                continue;
            };

            if let Some(current) = report.tools.get_mut(&name) {
                let discovered = metadata.into_spec(name.as_str(), &candidate.relative, script_type);
                if current.fill_missing_from(&discovered) {
                    let auto_detected = self
                        .store
                        .load_tool(&name)
                        .ok()
                        .flatten()
                        .is_none_or(|file| file.auto_detected);
                    self.store.save_tool(current, auto_detected)?;
                    report.updated.push(name);
                }
            } else {
                let spec = metadata.into_spec(name.as_str(), &candidate.relative, script_type);
                self.store.save_tool(&spec, true)?;
                tracing::debug!(tool = %name, script_type = %script_type, "new tool discovered");
                report.tools.insert(name.clone(), spec);
                report.added.push(name);
            }
        }

        self.store.write_discovery_timestamp(started)?;
        tracing::info!(
            total = report.tools.len(),
            added = report.added.len(),
            updated = report.updated.len(),
            skipped_disabled = report.skipped_disabled.len(),
            "discovery finished"
        );
        Ok(report)
    }

    fn candidates(&self) -> Vec<Candidate> {
        let mut found = Vec::new();
        for entry in self.walker() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let relative = self.relative(entry.path()).to_path_buf();
            if let Some(script_type) = classify(&relative, &metadata) {
                found.push(Candidate {
                    absolute: entry.path().to_path_buf(),
                    relative,
                    script_type,
                });
            }
        }
        found
    }

    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        path.strip_prefix(&self.tools_root).unwrap_or(path)
    }

    /// Sorted walk of the tools root that skips hidden entries, gitignored files,
    /// excluded directories and the config directory when it lives under the root.
    fn walker(&self) -> ignore::Walk {
        let root = self.tools_root.clone();
        let config_dir = self.store.config_dir().to_path_buf();
        let skip_config = config_dir != root && config_dir.starts_with(&root);

        ignore::WalkBuilder::new(&self.tools_root)
            .hidden(true)
            .git_ignore(true)
            .sort_by_file_name(|a, b| a.cmp(b))
            .filter_entry(move |entry| {
                let path = entry.path();
                if skip_config && path.starts_with(&config_dir) {
                    return false;
                }
                let is_dir = entry.file_type().is_some_and(|ft| ft.is_dir());
                !(is_dir && is_excluded_dir(path.strip_prefix(&root).unwrap_or(path)))
            })
            .build()
    }
}

/// Read a candidate and extract its metadata. Unreadable or non-UTF-8 files are skipped.
fn inspect(candidate: &Candidate) -> Option<(ScriptType, ScriptMetadata)> {
    let content = match std::fs::read_to_string(&candidate.absolute) {
        Ok(content) => content,
        Err(e) => {
            tracing::debug!(path = %candidate.relative.display(), "not a text script: {e}");
            return None;
        }
    };
    let script_type = refine_with_shebang(candidate.script_type, &content);
    let metadata = match script_type {
        ScriptType::Python => python::extract(&content),
        ScriptType::Shell => shell::extract(&content),
    };
    Some((script_type, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_root_is_an_error() {
        let config = tempfile::tempdir().unwrap();
        let catalog = ScriptCatalog::new("/definitely/not/here", ConfigStore::new(config.path()));
        assert!(matches!(
            catalog.discover(true),
            Err(DiscoveryError::MissingRoot(_))
        ));
    }

    #[test]
    fn empty_root_discovers_nothing() {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let catalog = ScriptCatalog::new(root.path(), ConfigStore::new(config.path()));
        let report = catalog.discover(false).unwrap();
        assert!(report.full_scan);
        assert!(report.tools.is_empty());
        assert!(catalog.store().read_discovery_timestamp().is_some());
    }

    #[test]
    fn config_dir_inside_root_is_not_scanned() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.py"), "\"\"\"Say hello.\"\"\"\n").unwrap();
        let config_dir = root.path().join("config");
        std::fs::create_dir_all(config_dir.join("tools")).unwrap();
        std::fs::write(config_dir.join("tools").join("stray.py"), "print(1)\n").unwrap();

        let catalog = ScriptCatalog::new(root.path(), ConfigStore::new(&config_dir));
        let report = catalog.discover(true).unwrap();
        assert_eq!(report.tools.keys().collect::<Vec<_>>(), vec!["hello"]);
    }
}
