//! Static metadata extraction for shell scripts.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use toolgate_registry::{ParamType, ParameterSpec};

use crate::metadata::{ScriptMetadata, describe_parameter};

const DESCRIPTION_SCAN_LINES: usize = 20;
const ASSIGNMENT_SCAN_LINES: usize = 50;

static DESCRIPTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)description\s*:?\s*(.+)").expect("description regex is valid")
});

static ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:local\s+|readonly\s+|declare\s+)?([A-Za-z_]\w*)=["']?\$\{?(\d+)(:-)?"#)
        .expect("assignment regex is valid")
});

static POSITIONAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(?:\{(\d+)|(\d))").expect("positional regex is valid"));

static READ_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s;&|(])read\s").expect("read regex is valid"));

static USAGE_FN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(?:function\s+)?usage\s*\(\)\s*\{(.+?)\n\}").expect("usage regex is valid")
});

/// Extract metadata from shell source.
#[must_use]
pub fn extract(content: &str) -> ScriptMetadata {
    let code: Vec<&str> = content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect();

    ScriptMetadata {
        description: description(content),
        parameters: parameters(content, &code),
        examples: usage_examples(content),
        dependencies: Vec::new(),
        interactive: code.iter().any(|line| READ_CALL.is_match(line)),
    }
}

/// `# description: ...` in the header comments.
fn description(content: &str) -> String {
    content
        .lines()
        .take(DESCRIPTION_SCAN_LINES)
        .map(str::trim)
        .filter(|line| line.starts_with('#') && !line.starts_with("#!"))
        .find_map(|line| DESCRIPTION.captures(line))
        .map(|caps| caps[1].trim().to_owned())
        .unwrap_or_default()
}

/// Positional parameters, named by `VAR=$N` assignments near the top or `argN` otherwise.
fn parameters(content: &str, code: &[&str]) -> Vec<ParameterSpec> {
    // position -> (name, has default)
    let mut named: BTreeMap<u32, (String, bool)> = BTreeMap::new();
    for line in content.lines().take(ASSIGNMENT_SCAN_LINES).map(str::trim) {
        let Some(caps) = ASSIGNMENT.captures(line) else {
            continue;
        };
        let Ok(position) = caps[2].parse::<u32>() else {
            continue;
        };
        if position > 0 {
            named
                .entry(position)
                .or_insert_with(|| (caps[1].to_owned(), caps.get(3).is_some()));
        }
    }

    for line in code {
        for caps in POSITIONAL.captures_iter(line) {
            let digits = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
            let Ok(position) = digits.parse::<u32>() else {
                continue;
            };
            if position > 0 {
                named
                    .entry(position)
                    .or_insert_with(|| (format!("arg{position}"), false));
            }
        }
    }

    named
        .into_values()
        .map(|(var, has_default)| {
            let name = var.to_lowercase();
            let spec = ParameterSpec::new(name, ParamType::String)
                .with_description(describe_parameter(&var));
            if has_default { spec } else { spec.required() }
        })
        .collect()
}

/// The body of a `usage()` function, when it prints a `Usage:` line.
fn usage_examples(content: &str) -> Vec<String> {
    USAGE_FN
        .captures(content)
        .map(|caps| caps[1].trim().to_owned())
        .filter(|body| body.contains("Usage:"))
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"#!/bin/bash
# description: Sync a directory to a remote host
# author: ops

usage() {
    echo "Usage: $0 <source_dir> <remote_url> [label]"
    exit 1
}

SOURCE_DIR=$1
REMOTE_URL="$2"
LABEL=${3:-nightly}

[ -z "$SOURCE_DIR" ] && usage
rsync -a "$SOURCE_DIR" "$REMOTE_URL/${LABEL}"
echo "extra: $5"
"#;

    #[test]
    fn description_from_header() {
        assert_eq!(extract(SCRIPT).description, "Sync a directory to a remote host");
        assert_eq!(extract("#!/bin/sh\necho hi\n").description, "");
    }

    #[test]
    fn positional_parameters_named_from_assignments() {
        let params = extract(SCRIPT).parameters;
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["source_dir", "remote_url", "label", "arg5"]);
        assert_eq!(params[0].description, "Directory path for source");
        assert_eq!(params[1].description, "URL for remote");
        assert!(params[0].required);
        assert!(!params[2].required);
        assert!(params[3].required);
        assert!(params.iter().all(|p| p.param_type == ParamType::String));
    }

    #[test]
    fn dollar_zero_ignored() {
        let params = extract("#!/bin/sh\necho \"running $0\"\n").parameters;
        assert!(params.is_empty());
    }

    #[test]
    fn read_marks_interactive() {
        assert!(!extract(SCRIPT).interactive);
        assert!(extract("#!/bin/sh\nread -r answer\n").interactive);
        assert!(extract("#!/bin/sh\nprintf 'ok? '; read reply\n").interactive);
        assert!(!extract("#!/bin/sh\n# read the docs\ncat thread.log\n").interactive);
    }

    #[test]
    fn usage_function_becomes_example() {
        let examples = extract(SCRIPT).examples;
        assert_eq!(examples.len(), 1);
        assert!(examples[0].contains("Usage: $0 <source_dir>"));
    }
}
