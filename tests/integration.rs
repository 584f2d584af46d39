#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;
use tempfile::TempDir;

// -- Harness --

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let ws = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(ws.tools()).unwrap();
        std::fs::create_dir_all(ws.config()).unwrap();
        std::fs::write(
            ws.config().join("global.json"),
            r#"{"resource_limits_enabled": false, "max_executions_per_minute": 0}"#,
        )
        .unwrap();
        ws
    }

    fn tools(&self) -> std::path::PathBuf {
        self.dir.path().join("tools")
    }

    fn config(&self) -> std::path::PathBuf {
        self.dir.path().join("config")
    }

    fn script(&self, rel: &str, body: &str) {
        let path = self.tools().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_toolgate"))
            .arg("--tools-dir")
            .arg(self.tools())
            .arg("--config-dir")
            .arg(self.config())
            .args(args)
            .env("RUST_LOG", "warn")
            .output()
            .unwrap()
    }

    fn run_json(&self, args: &[&str]) -> (bool, Value) {
        let output = self.run(args);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let value = serde_json::from_str(&stdout)
            .unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}"));
        (output.status.success(), value)
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn tool_file(config: &Path, name: &str) -> Value {
    let raw = std::fs::read_to_string(config.join("tools").join(format!("{name}.json"))).unwrap();
    serde_json::from_str(&raw).unwrap()
}

// -- End to end --

#[test]
fn discover_list_and_call() {
    let ws = Workspace::new();
    ws.script(
        "greet/greet.sh",
        "#!/bin/sh\n# description: Greet someone\nNAME=$1\nprintf 'hello %s' \"$NAME\"\n",
    );

    let output = ws.run(&["discover"]);
    assert!(output.status.success(), "{output:?}");
    assert!(stdout(&output).contains("Discovered 1 tools"));

    let (ok, tools) = ws.run_json(&["list"]);
    assert!(ok);
    assert_eq!(tools[0]["name"], "greet_greet");
    assert_eq!(tools[0]["description"], "Greet someone");
    assert_eq!(
        tools[0]["inputSchema"]["required"],
        serde_json::json!(["confirm", "name"])
    );

    let (ok, refused) = ws.run_json(&["call", "greet_greet", "--args", r#"{"name":"ada"}"#]);
    assert!(!ok);
    assert_eq!(refused["metadata"]["errorKind"], "confirmation_required");

    let (ok, envelope) = ws.run_json(&[
        "call",
        "greet_greet",
        "--args",
        r#"{"name":"ada"}"#,
        "--confirm",
    ]);
    assert!(ok, "{envelope}");
    assert_eq!(envelope["status"], "success");
    assert_eq!(envelope["format"], "text");
    assert_eq!(envelope["text"], "hello --name=ada");
    assert!(envelope["metadata"]["requestId"].is_string());
}

#[test]
fn second_discovery_without_changes_is_incremental() {
    let ws = Workspace::new();
    ws.script("noop.sh", "#!/bin/sh\ntrue\n");
    assert!(ws.run(&["discover"]).status.success());

    let again = ws.run(&["discover"]);
    assert!(again.status.success());
    let text = stdout(&again);
    // A script written in the same second as the marker can still look changed.
    assert!(text.contains("No changes") || text.contains("Discovered 1 tools"), "{text}");

    let forced = ws.run(&["discover", "--full"]);
    assert!(stdout(&forced).contains("Discovered 1 tools"));
}

#[test]
fn disable_and_enable_round_trip_through_config() {
    let ws = Workspace::new();
    ws.script("report.sh", "#!/bin/sh\n# description: Print a report\necho ok\n");
    assert!(ws.run(&["discover"]).status.success());

    assert!(ws.run(&["disable", "report"]).status.success());
    assert_eq!(tool_file(&ws.config(), "report")["enabled"], false);
    let (_, tools) = ws.run_json(&["list"]);
    assert_eq!(tools, serde_json::json!([]));

    let (ok, refused) = ws.run_json(&["call", "report", "--confirm"]);
    assert!(!ok);
    assert_eq!(refused["metadata"]["errorKind"], "validation");

    assert!(ws.run(&["enable", "report"]).status.success());
    assert_eq!(tool_file(&ws.config(), "report")["enabled"], true);
    let (ok, envelope) = ws.run_json(&["call", "report", "--confirm"]);
    assert!(ok);
    assert_eq!(envelope["text"], "ok\n");
}

#[test]
fn unknown_tool_cannot_be_enabled() {
    let ws = Workspace::new();
    let output = ws.run(&["enable", "ghost"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("tool not found: ghost"));
}

#[test]
fn build_tools_writes_compiled_registry() {
    let ws = Workspace::new();
    ws.script("a.sh", "#!/bin/sh\necho a\n");
    ws.script("b.sh", "#!/bin/sh\necho b\n");
    assert!(ws.run(&["discover"]).status.success());
    assert!(ws.run(&["disable", "b"]).status.success());

    let output = ws.run(&["build-tools"]);
    assert!(stdout(&output).contains("Wrote 1 tools"));
    let compiled: Value =
        serde_json::from_str(&std::fs::read_to_string(ws.config().join("tools.json")).unwrap())
            .unwrap();
    assert!(compiled.get("a").is_some());
    assert!(compiled.get("b").is_none());
}

#[test]
fn path_traversal_is_rejected_and_audited() {
    let ws = Workspace::new();
    ws.script("cat_file.sh", "#!/bin/sh\ncat \"$1\"\n");
    assert!(ws.run(&["discover"]).status.success());

    let (ok, envelope) = ws.run_json(&[
        "call",
        "cat_file",
        "--args",
        r#"{"file_path":"../../../etc/passwd"}"#,
        "--confirm",
    ]);
    assert!(!ok);
    assert_eq!(envelope["metadata"]["errorKind"], "security_validation");
    assert!(!envelope.to_string().contains("root:x:0:0"));

    let audit = std::fs::read_to_string(ws.config().join("audit.log")).unwrap();
    assert!(audit.contains("\"event\":\"security_event\""));
}

#[test]
fn malformed_global_config_is_an_error() {
    let ws = Workspace::new();
    std::fs::write(ws.config().join("global.json"), "{not json").unwrap();
    let output = ws.run(&["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load config"));
}
