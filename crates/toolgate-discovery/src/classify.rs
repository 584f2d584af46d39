use std::fs::Metadata;
use std::path::{Component, Path};

use toolgate_registry::{DEFAULT_WORKSPACE_DIR, ScriptType};

/// Directory names that never contain tools.
const EXCLUDED_DIRS: &[&str] = &[
    ".build",
    ".git",
    ".venv",
    "__pycache__",
    "hooks",
    "checkouts",
    "repositories",
    "node_modules",
    "site-packages",
    "ISSUE_TEMPLATE",
    DEFAULT_WORKSPACE_DIR,
];

const EXCLUDED_FILES: &[&str] = &["gyb.py", "build-asm.py", "__init__.py"];

const EXCLUDED_SUFFIXES: &[&str] = &[".sample", ".md", ".txt", ".json", ".pyc"];

/// Whether a path relative to the tools root falls under the exclusion list.
#[must_use]
pub fn is_excluded(relative: &Path) -> bool {
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        let Component::Normal(part) = component else {
            continue;
        };
        let part = part.to_string_lossy();
        if components.peek().is_none() {
            return EXCLUDED_FILES.contains(&&*part)
                || EXCLUDED_SUFFIXES.iter().any(|s| part.ends_with(s))
                || part.contains("ISSUE_TEMPLATE");
        }
        if EXCLUDED_DIRS.contains(&&*part) {
            return true;
        }
    }
    false
}

/// Whether any directory component of `relative` is excluded. The walker prunes these.
#[must_use]
pub fn is_excluded_dir(relative: &Path) -> bool {
    relative.components().any(|component| match component {
        Component::Normal(part) => EXCLUDED_DIRS.contains(&&*part.to_string_lossy()),
        _ => false,
    })
}

/// Classify a regular file as a candidate script.
///
/// `.py` files are Python; other non-hidden files with an execute bit are shell
/// candidates (a Python shebang can still promote them, see [`refine_with_shebang`]).
#[must_use]
pub fn classify(relative: &Path, metadata: &Metadata) -> Option<ScriptType> {
    if !metadata.is_file() || is_excluded(relative) {
        return None;
    }
    let file_name = relative.file_name()?.to_string_lossy();
    if relative.extension().is_some_and(|ext| ext == "py") {
        return Some(ScriptType::Python);
    }
    if file_name.starts_with('.') || !is_executable(metadata) {
        return None;
    }
    Some(ScriptType::Shell)
}

/// Executables whose shebang names a Python interpreter are Python tools.
#[must_use]
pub fn refine_with_shebang(script_type: ScriptType, content: &str) -> ScriptType {
    let shebang = content.lines().next().filter(|l| l.starts_with("#!"));
    match shebang {
        Some(line) if line.contains("python") => ScriptType::Python,
        _ => script_type,
    }
}

#[cfg(unix)]
fn is_executable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &Metadata) -> bool {
    false
}
