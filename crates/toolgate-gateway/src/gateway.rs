use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use toolgate_discovery::{DiscoveryReport, ScriptCatalog};
use toolgate_registry::{ConfigStore, GlobalConfig, RegistryError, ToolRegistry, ToolSpec};
use toolgate_tools::{
    AuditLogger, ControllerStats, ErrorKind, ExecutionController, ExecutionResult, Redactor,
    ScriptExecutor, sanitize_for_logging,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::descriptor::ToolDescriptor;
use crate::error::GatewayError;

/// Upper bound on the rendered argument map in a debug log line.
const LOG_ARGUMENTS_CHARS: usize = 500;

/// Tool name recorded on audit events that concern the whole registry.
const ALL_TOOLS: &str = "*";

/// Composes the registry, executor, redactor and audit sink behind two entry points.
#[derive(Debug)]
pub struct Gateway {
    config: GlobalConfig,
    catalog: ScriptCatalog,
    registry: Arc<ToolRegistry>,
    executor: ScriptExecutor,
    audit: AuditLogger,
    redactor: Redactor,
}

impl Gateway {
    /// Load `global.json` and the persisted tools from `config_dir` and open the audit sink.
    ///
    /// Discovery is not run; call [`Gateway::rediscover`] for that.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is malformed or the audit file cannot be opened.
    pub async fn open(
        tools_root: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Result<Self, GatewayError> {
        let store = ConfigStore::new(config_dir);
        let config = store.load_global()?;
        let audit = AuditLogger::from_config(&config, store.config_dir())
            .await
            .map_err(GatewayError::Audit)?;
        let specs = store.load_tools()?;
        let catalog = ScriptCatalog::new(tools_root, store);
        Ok(Self::new(config, catalog, specs, audit))
    }

    #[must_use]
    pub fn new(
        config: GlobalConfig,
        catalog: ScriptCatalog,
        specs: impl IntoIterator<Item = ToolSpec>,
        audit: AuditLogger,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::from_specs(specs));
        let controller = Arc::new(ExecutionController::from_config(&config));
        let executor = ScriptExecutor::new(
            catalog.tools_root().to_path_buf(),
            Arc::clone(&registry),
            controller,
            &config,
        );
        let redactor = Redactor::from_config(&config);
        tracing::info!(
            server = %config.server_name,
            tools = registry.len(),
            root = %catalog.tools_root().display(),
            "gateway ready"
        );
        Self {
            config,
            catalog,
            registry,
            executor,
            audit,
            redactor,
        }
    }

    #[must_use]
    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn executor(&self) -> &ScriptExecutor {
        &self.executor
    }

    #[must_use]
    pub fn catalog(&self) -> &ScriptCatalog {
        &self.catalog
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        self.executor.controller().stats()
    }

    /// Descriptors of every enabled tool, sorted by name.
    #[must_use]
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry
            .enabled()
            .iter()
            .map(|spec| ToolDescriptor::from(&**spec))
            .collect()
    }

    /// Run a tool and return its result envelope.
    ///
    /// Every call gets a fresh request id. It tags the tracing span, both audit records
    /// and the envelope metadata (`requestId`). Error text in the envelope is redacted.
    pub async fn call_tool(&self, name: &str, arguments: &Map<String, Value>) -> Value {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "call_tool",
            request_id = %request_id,
            tool = %sanitize_for_logging(name, 64)
        );
        self.call_tool_inner(&request_id, name, arguments)
            .instrument(span)
            .await
    }

    async fn call_tool_inner(
        &self,
        request_id: &str,
        name: &str,
        arguments: &Map<String, Value>,
    ) -> Value {
        if self.config.log_arguments {
            let rendered = self
                .redactor
                .redact_for_logging(&Value::Object(arguments.clone()), LOG_ARGUMENTS_CHARS);
            tracing::debug!(arguments = %rendered, "tool call received");
        } else {
            tracing::debug!(arguments = arguments.len(), "tool call received");
        }

        self.audit
            .tool_execution_start(request_id, name, arguments, self.config.log_arguments)
            .await;
        let result = self
            .executor
            .execute_with_request_id(name, arguments, Some(request_id))
            .await;
        self.report_security_event(request_id, name, &result).await;
        self.audit.tool_execution_end(request_id, name, &result).await;

        match result.error_kind {
            None => tracing::info!(elapsed = result.elapsed_seconds, "tool call succeeded"),
            Some(kind) => tracing::warn!(
                kind = %kind,
                exit_code = result.exit_code,
                elapsed = result.elapsed_seconds,
                "tool call failed"
            ),
        }
        self.envelope(&result, request_id)
    }

    async fn report_security_event(&self, request_id: &str, name: &str, result: &ExecutionResult) {
        let (event_type, description) = match result.error_kind {
            Some(ErrorKind::SecurityValidation) => {
                ("security_validation", "tool call rejected by argument validation")
            }
            Some(ErrorKind::RateLimit) => ("rate_limit", "tool call rejected by the rate limiter"),
            _ => return,
        };
        let mut details = Map::new();
        details.insert("error".into(), json!(result.error_message()));
        for (key, value) in &result.metadata {
            details.insert(key.clone(), value.clone());
        }
        self.audit
            .security_event(
                request_id,
                name,
                event_type,
                description,
                Value::Object(details),
            )
            .await;
    }

    fn envelope(&self, result: &ExecutionResult, request_id: &str) -> Value {
        let mut envelope = result.to_envelope();
        if let Some(Value::String(text)) = envelope.get_mut("error") {
            let redacted = self.redactor.redact_text(text).into_owned();
            *text = redacted;
        }
        if let Some(Value::Object(metadata)) = envelope.get_mut("metadata") {
            metadata.insert("requestId".into(), json!(request_id));
        }
        envelope
    }

    /// Enable or disable a tool: persist its file, swap the registry entry, audit it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for unknown tools, or an error if the tool file
    /// cannot be written.
    pub async fn set_tool_enabled(
        &self,
        name: &str,
        enabled: bool,
    ) -> Result<Arc<ToolSpec>, GatewayError> {
        let current = self
            .registry
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;
        let store = self.catalog.store();
        let auto_detected = store
            .load_tool(name)?
            .is_none_or(|file| file.auto_detected);
        let mut spec = ToolSpec::clone(&current);
        spec.enabled = enabled;
        store.save_tool(&spec, auto_detected)?;
        let updated = self.registry.set_enabled(name, enabled)?;

        let (change_type, verb) = if enabled {
            ("tool_enabled", "enabled")
        } else {
            ("tool_disabled", "disabled")
        };
        tracing::info!(tool = name, enabled, "tool state changed");
        self.audit
            .configuration_change(
                &Uuid::new_v4().to_string(),
                name,
                change_type,
                &format!("Tool {name} {verb}"),
            )
            .await;
        Ok(updated)
    }

    /// Run discovery on a blocking thread and swap the result into the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if discovery fails; the registry is left unchanged in that case.
    pub async fn rediscover(&self, force_full: bool) -> Result<DiscoveryReport, GatewayError> {
        let catalog = self.catalog.clone();
        let report = tokio::task::spawn_blocking(move || catalog.discover(force_full)).await??;
        self.registry.replace_all(report.tools.values().cloned());

        if report.full_scan {
            self.audit
                .configuration_change(
                    &Uuid::new_v4().to_string(),
                    ALL_TOOLS,
                    "rediscovery",
                    &format!(
                        "Discovery found {} tools ({} added, {} updated)",
                        report.tools.len(),
                        report.added.len(),
                        report.updated.len()
                    ),
                )
                .await;
        }
        Ok(report)
    }

    /// Write `tools.json` from the per-tool files. Returns the number of tools written.
    ///
    /// # Errors
    ///
    /// Returns an error if the tool files cannot be read or the output cannot be written.
    pub fn build_compiled_registry(&self) -> Result<usize, GatewayError> {
        Ok(self.catalog.store().build_compiled()?)
    }

    /// Split a legacy `tools.json` into per-tool files and reload the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the legacy file is malformed or a write fails.
    pub fn migrate_legacy(&self) -> Result<usize, GatewayError> {
        let store = self.catalog.store();
        let migrated = store.migrate_legacy()?;
        if migrated > 0 {
            self.registry.replace_all(store.load_tools()?);
        }
        Ok(migrated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgate_registry::ScriptType;

    fn gateway(root: &std::path::Path, config_dir: &std::path::Path) -> Gateway {
        let mut tool = ToolSpec::new("hello", "hello.sh", ScriptType::Shell);
        tool.description = "Say hello".into();
        let mut hidden = ToolSpec::new("hidden", "hidden.sh", ScriptType::Shell);
        hidden.enabled = false;
        let catalog = ScriptCatalog::new(root, ConfigStore::new(config_dir));
        Gateway::new(
            GlobalConfig::default(),
            catalog,
            [tool, hidden],
            AuditLogger::disabled(),
        )
    }

    #[test]
    fn list_tools_skips_disabled() {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let gw = gateway(root.path(), config.path());
        let names: Vec<String> = gw.list_tools().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["hello"]);
    }

    #[test]
    fn envelope_carries_request_id_and_redacted_error() {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let gw = gateway(root.path(), config.path());
        let result = ExecutionResult::failure(
            ErrorKind::Execution,
            "request failed with api_key=sk-abcdefghijklmnopqrstuvwx",
        );
        let envelope = gw.envelope(&result, "req-1");
        assert_eq!(envelope["status"], "error");
        assert_eq!(envelope["metadata"]["requestId"], "req-1");
        let error = envelope["error"].as_str().unwrap();
        assert!(!error.contains("sk-abcdefghijklmnopqrstuvwx"), "{error}");
    }

    #[tokio::test]
    async fn unknown_tool_cannot_be_enabled() {
        let root = tempfile::tempdir().unwrap();
        let config = tempfile::tempdir().unwrap();
        let gw = gateway(root.path(), config.path());
        let err = gw.set_tool_enabled("nope", true).await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Registry(RegistryError::NotFound(_))
        ));
    }
}
