use std::path::PathBuf;

use toolgate_registry::{ParameterSpec, ScriptType, ToolSpec};

/// What static inspection learned about one script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptMetadata {
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub examples: Vec<String>,
    pub dependencies: Vec<String>,
    pub interactive: bool,
}

impl ScriptMetadata {
    /// Build a fresh spec for a newly seen script. New tools require confirmation.
    #[must_use]
    pub fn into_spec(
        self,
        name: impl Into<String>,
        script_path: impl Into<PathBuf>,
        script_type: ScriptType,
    ) -> ToolSpec {
        let mut spec = ToolSpec::new(name, script_path, script_type);
        spec.description = self.description;
        spec.parameters = self.parameters;
        spec.examples = self.examples;
        spec.dependencies = self.dependencies;
        spec.interactive = self.interactive;
        spec
    }
}

/// Best-effort description for a parameter, keyed on common name fragments.
#[must_use]
pub fn describe_parameter(name: &str) -> String {
    let lower = name.to_lowercase();
    let Some(word) = ["path", "dir", "file", "url", "name"]
        .into_iter()
        .find(|w| lower.contains(*w))
    else {
        return format!("Input parameter: {name}");
    };
    let subject = lower.replace(&format!("_{word}"), "").replace(word, "");
    let subject = subject.trim_matches('_').replace('_', " ");

    match (word, subject.is_empty()) {
        ("path", true) => "Path to a directory or file".to_owned(),
        ("path", false) => format!("Path to the {subject} directory or file"),
        ("dir", true) => "Directory path".to_owned(),
        ("dir", false) => format!("Directory path for {subject}"),
        ("file", true) => "File path".to_owned(),
        ("file", false) => format!("File path for {subject}"),
        ("url", true) => "URL".to_owned(),
        ("url", false) => format!("URL for {subject}"),
        (_, true) => "Name".to_owned(),
        (_, false) => format!("Name for {subject}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_descriptions() {
        assert_eq!(describe_parameter("input_path"), "Path to the input directory or file");
        assert_eq!(describe_parameter("PATH"), "Path to a directory or file");
        assert_eq!(describe_parameter("output_dir"), "Directory path for output");
        assert_eq!(describe_parameter("log_file"), "File path for log");
        assert_eq!(describe_parameter("repo_url"), "URL for repo");
        assert_eq!(describe_parameter("branch_name"), "Name for branch");
        assert_eq!(describe_parameter("count"), "Input parameter: count");
    }

    #[test]
    fn into_spec_requires_confirmation() {
        let meta = ScriptMetadata {
            description: "Back up a directory".into(),
            interactive: true,
            ..ScriptMetadata::default()
        };
        let spec = meta.into_spec("backup", "backup.sh", ScriptType::Shell);
        assert!(spec.requires_confirmation);
        assert!(spec.enabled);
        assert!(spec.interactive);
        assert_eq!(spec.description, "Back up a directory");
    }
}
