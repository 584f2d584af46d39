//! Runs registered scripts behind confirmation, admission and argument validation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use toolgate_registry::{
    GlobalConfig, ParamType, RegistryError, ScriptType, ToolRegistry, ToolSpec,
};

use crate::limits::{AdmissionError, ExecutionController};
use crate::result::{ErrorKind, ExecutionResult, truncate_output};
use crate::safe_error::SafeErrorFormatter;
use crate::sanitize::{self, RESERVED_ARGUMENTS};

/// Environment variables that let a caller-controlled environment inject code into the
/// child before the script runs.
pub const BLOCKED_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
    "BASH_ENV",
    "ENV",
    "PYTHONSTARTUP",
];

const BLOCKED_ENV_PREFIXES: &[&str] = &["BASH_FUNC_"];

/// Python tools whose directory contains this file are started through it.
pub const PYTHON_ENTRY_POINT: &str = "run.py";

/// Upper bound on bytes kept per output stream when output truncation is disabled.
const HARD_CAPTURE_LIMIT: usize = 16 * 1024 * 1024;

const DEPENDENCY_MARKERS: &[&str] = &["ModuleNotFoundError", "No module named", "ImportError"];

/// Render arguments as argv tokens.
///
/// `confirm` is dropped. `function` (or else `command`) becomes the first positional
/// token. Other keys become `--key=value`, `-k value` for single-character keys, or
/// `key=value` for keys that already start with `--`. Null values are skipped.
#[must_use]
pub fn build_argv(arguments: &Map<String, Value>) -> Vec<String> {
    let mut argv = Vec::new();
    if let Some(sub) = arguments
        .get("function")
        .or_else(|| arguments.get("command"))
        .filter(|v| !v.is_null())
    {
        argv.push(render_value(sub));
    }
    for (key, value) in arguments {
        if RESERVED_ARGUMENTS.contains(&key.as_str()) || value.is_null() {
            continue;
        }
        let rendered = render_value(value);
        if key.starts_with("--") {
            argv.push(format!("{key}={rendered}"));
        } else if key.chars().count() == 1 {
            argv.push(format!("-{key}"));
            argv.push(rendered);
        } else {
            argv.push(format!("--{key}={rendered}"));
        }
    }
    argv
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Inherited environment minus loader and shell injection variables.
#[must_use]
pub fn filtered_env() -> Vec<(OsString, OsString)> {
    std::env::vars_os()
        .filter(|(key, _)| {
            let key = key.to_string_lossy();
            !BLOCKED_ENV_VARS.contains(&&*key)
                && !BLOCKED_ENV_PREFIXES.iter().any(|p| key.starts_with(p))
        })
        .collect()
}

/// Check declared parameters: required ones present, primitive types matching.
///
/// # Errors
///
/// Returns one message per problem.
pub fn check_declared_parameters(
    spec: &ToolSpec,
    arguments: &Map<String, Value>,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    for param in spec.parameters.iter().filter(|p| p.required) {
        if arguments.get(&param.name).is_none_or(Value::is_null) {
            errors.push(format!("Missing required argument: {}", param.name));
        }
    }
    for (name, value) in arguments {
        let Some(param) = spec.parameter(name) else {
            continue;
        };
        let ok = match param.param_type {
            ParamType::Boolean => value.is_boolean(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::String | ParamType::Array | ParamType::Object => true,
        } || value.is_null();
        if !ok {
            errors.push(format!(
                "Argument {name} must be of type {}",
                param.param_type.as_str()
            ));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

/// Executes registered tools as child processes.
#[derive(Debug)]
pub struct ScriptExecutor {
    tools_root: PathBuf,
    registry: Arc<ToolRegistry>,
    controller: Arc<ExecutionController>,
    timeout: Duration,
    max_output_length: usize,
    formatter: SafeErrorFormatter,
    python: OsString,
    spawned: AtomicU64,
}

struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
    uses_interpreter: bool,
}

impl ScriptExecutor {
    #[must_use]
    pub fn new(
        tools_root: impl Into<PathBuf>,
        registry: Arc<ToolRegistry>,
        controller: Arc<ExecutionController>,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            tools_root: tools_root.into(),
            registry,
            controller,
            timeout: config.timeout(),
            max_output_length: config.max_output_length,
            formatter: SafeErrorFormatter::new(config.include_error_details),
            python: OsString::from("python3"),
            spawned: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_output_length(mut self, max: usize) -> Self {
        self.max_output_length = max;
        self
    }

    /// Interpreter used for Python tools without a local virtualenv.
    #[must_use]
    pub fn with_python(mut self, python: impl Into<OsString>) -> Self {
        self.python = python.into();
        self
    }

    #[must_use]
    pub fn tools_root(&self) -> &Path {
        &self.tools_root
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<ExecutionController> {
        &self.controller
    }

    /// Number of child processes started so far.
    #[must_use]
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    pub async fn execute(&self, name: &str, arguments: &Map<String, Value>) -> ExecutionResult {
        self.execute_with_request_id(name, arguments, None).await
    }

    /// Execute `name`, embedding `request_id` in caller-facing error messages.
    pub async fn execute_with_request_id(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        request_id: Option<&str>,
    ) -> ExecutionResult {
        let started = Instant::now();
        self.execute_inner(name, arguments, request_id)
            .await
            .with_elapsed(started.elapsed().as_secs_f64())
    }

    async fn execute_inner(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        request_id: Option<&str>,
    ) -> ExecutionResult {
        if sanitize::sanitize_identifier(name).is_err() {
            return ExecutionResult::failure(ErrorKind::Validation, "Invalid tool name");
        }
        let Some(spec) = self.registry.get(name) else {
            return ExecutionResult::failure(
                ErrorKind::Validation,
                format!("Tool '{name}' not found"),
            );
        };
        if !spec.enabled {
            return ExecutionResult::failure(
                ErrorKind::Validation,
                format!("Tool '{name}' is disabled"),
            );
        }

        if spec.requires_confirmation && arguments.get("confirm") != Some(&Value::Bool(true)) {
            tracing::info!(tool = name, "confirmation required");
            return ExecutionResult::failure(
                ErrorKind::ConfirmationRequired,
                format!(
                    "Tool '{name}' requires confirmation. Resubmit the call with \"confirm\": true to execute it."
                ),
            )
            .with_metadata("requiresConfirmation", true);
        }

        let permit = match self.controller.acquire(name).await {
            Ok(permit) => permit,
            Err(AdmissionError::RateLimited { wait, .. }) => {
                return ExecutionResult::failure(
                    ErrorKind::RateLimit,
                    format!(
                        "Rate limit exceeded for tool '{name}'. Retry in {:.1} seconds.",
                        wait.as_secs_f64()
                    ),
                )
                .with_metadata("retryAfterSeconds", wait.as_secs_f64());
            }
            Err(AdmissionError::Closed) => {
                return ExecutionResult::failure(
                    ErrorKind::Execution,
                    "Gateway is shutting down",
                );
            }
        };

        let result = self.run_admitted(&spec, arguments, request_id).await;
        permit.release();
        result
    }

    async fn run_admitted(
        &self,
        spec: &ToolSpec,
        arguments: &Map<String, Value>,
        request_id: Option<&str>,
    ) -> ExecutionResult {
        let tool_dir = spec.tool_dir(&self.tools_root);
        let bases = spec.workspace.resolve_bases(&tool_dir);
        let validated = match sanitize::validate_arguments(arguments, &spec.workspace, &bases) {
            Ok(validated) => validated,
            Err(violations) => {
                let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
                tracing::warn!(
                    tool = %spec.name,
                    violations = messages.len(),
                    "argument security validation failed"
                );
                return ExecutionResult::failure(
                    ErrorKind::SecurityValidation,
                    format!("Security validation failed: {}", messages.join("; ")),
                )
                .with_metadata("violations", messages);
            }
        };

        if let Err(errors) = check_declared_parameters(spec, &validated) {
            return ExecutionResult::failure(ErrorKind::Validation, errors.join("; "));
        }

        let script = match spec.resolve_script(&self.tools_root) {
            Ok(script) => script,
            Err(RegistryError::ScriptOutsideRoot { .. }) => {
                tracing::warn!(tool = %spec.name, "script resolves outside the tools root");
                return ExecutionResult::failure(
                    ErrorKind::SecurityValidation,
                    format!("Script for tool '{}' is outside the tools directory", spec.name),
                );
            }
            Err(_) => {
                return ExecutionResult::failure(
                    ErrorKind::Validation,
                    format!("Script for tool '{}' not found", spec.name),
                );
            }
        };

        let argv = build_argv(&validated);
        let launch = self.launch_plan(spec, &script, argv);
        self.spawn_and_wait(spec, &script, launch, request_id).await
    }

    fn launch_plan(&self, spec: &ToolSpec, script: &Path, argv: Vec<String>) -> Launch {
        let argv: Vec<OsString> = argv.into_iter().map(OsString::from).collect();
        let dir = script.parent().unwrap_or(&self.tools_root);
        match spec.script_type {
            ScriptType::Python => {
                let venv_python = dir.join(".venv").join("bin").join("python");
                let program = if venv_python.is_file() {
                    venv_python
                } else {
                    PathBuf::from(&self.python)
                };
                let entry = dir.join(PYTHON_ENTRY_POINT);
                let target = if entry.is_file() { entry } else { script.to_path_buf() };
                let mut args = vec![target.into_os_string()];
                args.extend(argv);
                Launch {
                    program,
                    args,
                    uses_interpreter: true,
                }
            }
            ScriptType::Shell if is_executable(script) => Launch {
                program: script.to_path_buf(),
                args: argv,
                uses_interpreter: false,
            },
            ScriptType::Shell => {
                let mut args = vec![script.as_os_str().to_owned()];
                args.extend(argv);
                Launch {
                    program: PathBuf::from("sh"),
                    args,
                    uses_interpreter: true,
                }
            }
        }
    }

    async fn spawn_and_wait(
        &self,
        spec: &ToolSpec,
        script: &Path,
        launch: Launch,
        request_id: Option<&str>,
    ) -> ExecutionResult {
        let cwd = script.parent().unwrap_or(&self.tools_root);
        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .current_dir(cwd)
            .env_clear()
            .envs(filtered_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process_group(&mut cmd);
        self.controller.resource_limiter().install(&mut cmd);

        let started = Instant::now();
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(
                    tool = %spec.name,
                    program = %launch.program.display(),
                    "failed to spawn script: {e}"
                );
                let kind = if launch.uses_interpreter && e.kind() == std::io::ErrorKind::NotFound {
                    ErrorKind::Dependency
                } else {
                    ErrorKind::Execution
                };
                let message = if kind == ErrorKind::Dependency {
                    self.formatter.format(
                        "the interpreter required by this tool is not installed",
                        &e.to_string(),
                        &spec.name,
                        request_id,
                    )
                } else {
                    self.formatter.format_io(&e, &spec.name, request_id)
                };
                return ExecutionResult::failure(kind, message);
            }
        };
        let pid = child.id();
        tracing::debug!(tool = %spec.name, pid, "script started");

        let limit = if self.max_output_length == 0 {
            HARD_CAPTURE_LIMIT
        } else {
            self.max_output_length
                .saturating_mul(4)
                .saturating_add(1024)
                .min(HARD_CAPTURE_LIMIT)
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let outcome = tokio::time::timeout(self.timeout, async {
            let (status, out, err) = tokio::join!(
                child.wait(),
                read_capped(stdout, limit),
                read_capped(stderr, limit)
            );
            (status, out, err)
        })
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        let Ok((status, out, err)) = outcome else {
            kill_tree(&mut child, pid).await;
            tracing::warn!(tool = %spec.name, timeout_secs = self.timeout.as_secs(), "script timed out and was killed");
            return ExecutionResult::failure(
                ErrorKind::Timeout,
                format!(
                    "Script execution timed out after {} seconds",
                    self.timeout.as_secs()
                ),
            )
            .with_elapsed(elapsed);
        };

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(tool = %spec.name, "failed to wait for script: {e}");
                return ExecutionResult::failure(
                    ErrorKind::Execution,
                    self.formatter.format_io(&e, &spec.name, request_id),
                )
                .with_elapsed(elapsed);
            }
        };

        let stdout = String::from_utf8_lossy(&out).into_owned();
        let stderr = String::from_utf8_lossy(&err).into_owned();
        let (stdout, truncated) = truncate_output(&stdout, self.max_output_length);
        let (stderr, _) = truncate_output(&stderr, self.max_output_length);
        let exit_code = exit_code(status);

        if status.success() {
            let mut result = ExecutionResult::success(stdout, stderr, elapsed);
            if truncated {
                result = result.with_metadata("truncated", true);
            }
            tracing::debug!(tool = %spec.name, elapsed, "script finished");
            return result;
        }

        let kind = if DEPENDENCY_MARKERS.iter().any(|m| stderr.contains(m)) {
            ErrorKind::Dependency
        } else {
            ErrorKind::Execution
        };
        tracing::info!(tool = %spec.name, exit_code, %kind, "script failed");
        ExecutionResult {
            success: false,
            exit_code,
            stdout,
            stderr,
            elapsed_seconds: elapsed,
            error_kind: Some(kind),
            error: None,
            metadata: std::collections::BTreeMap::new(),
        }
        .with_metadata("truncated", truncated)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> Vec<u8> {
    let Some(mut reader) = reader else {
        return Vec::new();
    };
    let mut buf = Vec::new();
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    if let Err(e) = (&mut reader).take(limit).read_to_end(&mut buf).await {
        tracing::debug!("failed to read script output: {e}");
        return buf;
    }
    // Keep the pipe flowing so the child never blocks on a full buffer.
    let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
    buf
}

/// Kill the child's process group, then the child itself, and reap it.
async fn kill_tree(child: &mut tokio::process::Child, pid: Option<u32>) {
    kill_process_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!("kill after timeout: {e}");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // A stale group id only yields ESRCH.
    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}
