use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RegistryError;
use crate::spec::{ToolSpec, is_valid_tool_name};

type ToolMap = HashMap<String, Arc<ToolSpec>>;

/// In-memory tool registry.
///
/// Readers take a cheap snapshot of the whole map. Writers build a new map and swap it
/// in under the write lock, so a reader never observes a half-applied update.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<Arc<ToolMap>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from specs, skipping entries with invalid names.
    #[must_use]
    pub fn from_specs(specs: impl IntoIterator<Item = ToolSpec>) -> Self {
        let registry = Self::new();
        registry.replace_all(specs);
        registry
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.snapshot().get(name).cloned()
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<ToolMap> {
        Arc::clone(&self.tools.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Enabled tools sorted by name.
    #[must_use]
    pub fn enabled(&self) -> Vec<Arc<ToolSpec>> {
        let snapshot = self.snapshot();
        let mut tools: Vec<_> = snapshot.values().filter(|t| t.enabled).cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Insert or replace one tool. Returns the previous entry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidName`] if the name is not a valid tool name.
    pub fn upsert(&self, spec: ToolSpec) -> Result<Option<Arc<ToolSpec>>, RegistryError> {
        if !is_valid_tool_name(&spec.name) {
            return Err(RegistryError::InvalidName(spec.name));
        }
        Ok(self.update(|map| map.insert(spec.name.clone(), Arc::new(spec))))
    }

    /// Insert or replace many tools in a single swap. Invalid names are skipped.
    ///
    /// Returns the number of entries written.
    pub fn upsert_many(&self, specs: impl IntoIterator<Item = ToolSpec>) -> usize {
        let specs: Vec<_> = specs.into_iter().filter(keep_valid).collect();
        let count = specs.len();
        self.update(|map| {
            for spec in specs {
                map.insert(spec.name.clone(), Arc::new(spec));
            }
        });
        count
    }

    /// Replace the whole registry content.
    pub fn replace_all(&self, specs: impl IntoIterator<Item = ToolSpec>) {
        let map: ToolMap = specs
            .into_iter()
            .filter(keep_valid)
            .map(|spec| (spec.name.clone(), Arc::new(spec)))
            .collect();
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    /// Flip the `enabled` flag of an existing tool and return the updated spec.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown tools.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<Arc<ToolSpec>, RegistryError> {
        self.update(|map| {
            let current = map
                .get(name)
                .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
            let mut spec = ToolSpec::clone(current);
            spec.enabled = enabled;
            let spec = Arc::new(spec);
            map.insert(name.to_owned(), Arc::clone(&spec));
            Ok(spec)
        })
    }

    fn update<R>(&self, f: impl FnOnce(&mut ToolMap) -> R) -> R {
        let mut guard = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = ToolMap::clone(&guard);
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }
}

fn keep_valid(spec: &ToolSpec) -> bool {
    if is_valid_tool_name(&spec.name) {
        true
    } else {
        tracing::warn!(name = %spec.name, "skipping tool with invalid name");
        false
    }
}
