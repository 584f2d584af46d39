use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use toolgate_registry::MAX_TOOL_NAME_LEN;

/// Name used when a path reduces to nothing.
pub const UNNAMED_TOOL: &str = "unnamed_tool";

const SHELL_EXTENSIONS: &[&str] = &[".sh", ".bash", ".zsh", ".fish", ".ps1"];

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_-]").expect("tool name regex is valid"));

/// Derive the tool name for a script path relative to the tools root.
///
/// Separators become `_`, one known script extension is dropped, anything outside
/// `[A-Za-z0-9_-]` becomes `_`, a `tool_` prefix is added when the result does not
/// start with a letter, and the result is cut to 64 characters. The mapping depends
/// only on the path, so the same file always gets the same name.
#[must_use]
pub fn tool_name_for(relative: &Path) -> String {
    let raw = relative.to_string_lossy().replace(['/', '\\'], "_");
    let stem = raw
        .strip_suffix(".py")
        .or_else(|| SHELL_EXTENSIONS.iter().find_map(|ext| raw.strip_suffix(ext)))
        .unwrap_or(&raw);

    let mut name = DISALLOWED.replace_all(stem, "_").into_owned();
    if name.chars().next().is_some_and(|c| !c.is_ascii_alphabetic()) {
        name.insert_str(0, "tool_");
    }
    // Only ASCII remains, so byte truncation is safe.
    name.truncate(MAX_TOOL_NAME_LEN);

    if name.is_empty() {
        UNNAMED_TOOL.to_owned()
    } else {
        name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use toolgate_registry::is_valid_tool_name;

    #[test]
    fn nested_python_script() {
        assert_eq!(tool_name_for(Path::new("git/commit_helper.py")), "git_commit_helper");
    }

    #[test]
    fn shell_extensions_stripped_once() {
        assert_eq!(tool_name_for(Path::new("backup.sh")), "backup");
        assert_eq!(tool_name_for(Path::new("deploy.bash")), "deploy");
        assert_eq!(tool_name_for(Path::new("odd.sh.sh")), "odd_sh");
        assert_eq!(tool_name_for(Path::new("notes.txt")), "notes_txt");
    }

    #[test]
    fn disallowed_characters_replaced() {
        assert_eq!(tool_name_for(Path::new("my tool/run v2.sh")), "my_tool_run_v2");
        assert_eq!(tool_name_for(Path::new("naïve.sh")), "na_ve");
    }

    #[test]
    fn non_letter_start_prefixed() {
        assert_eq!(tool_name_for(Path::new("2fa.py")), "tool_2fa");
        assert_eq!(tool_name_for(Path::new("_private.sh")), "tool__private");
    }

    #[test]
    fn long_names_truncated() {
        let long = format!("{}.py", "a".repeat(100));
        assert_eq!(tool_name_for(Path::new(&long)).len(), MAX_TOOL_NAME_LEN);
    }

    #[test]
    fn empty_becomes_unnamed() {
        assert_eq!(tool_name_for(Path::new("")), UNNAMED_TOOL);
        assert_eq!(tool_name_for(Path::new(".py")), UNNAMED_TOOL);
    }

    proptest! {
        #[test]
        fn names_are_valid_and_stable(path in "[a-zA-Z0-9 ._/-]{0,90}") {
            let name = tool_name_for(Path::new(&path));
            prop_assert!(is_valid_tool_name(&name));
            prop_assert_eq!(&name, &tool_name_for(Path::new(&path)));
            // A derived name maps to itself.
            prop_assert_eq!(tool_name_for(Path::new(&name)), name);
        }
    }
}
