//! Static metadata extraction for Python scripts.
//!
//! This reads source text only: the module docstring, `input()` calls, imports and
//! `argparse` `add_argument(...)` calls. Nothing is imported or executed.

use std::sync::LazyLock;

use regex::Regex;
use toolgate_registry::{ParamType, ParameterSpec};

use crate::metadata::{ScriptMetadata, describe_parameter};

/// Top-level modules shipped with CPython; these are not reported as dependencies.
const STDLIB_MODULES: &[&str] = &[
    "__future__", "abc", "argparse", "ast", "asyncio", "base64", "bisect", "calendar",
    "collections", "concurrent", "configparser", "contextlib", "copy", "csv", "ctypes",
    "dataclasses", "datetime", "decimal", "difflib", "email", "enum", "errno", "fnmatch",
    "fractions", "functools", "getpass", "glob", "gzip", "hashlib", "heapq", "hmac", "html",
    "http", "importlib", "inspect", "io", "ipaddress", "itertools", "json", "logging",
    "math", "mimetypes", "multiprocessing", "operator", "os", "pathlib", "pickle",
    "platform", "pprint", "queue", "random", "re", "secrets", "select", "shlex", "shutil",
    "signal", "socket", "sqlite3", "ssl", "stat", "statistics", "string", "struct",
    "subprocess", "sys", "tarfile", "tempfile", "textwrap", "threading", "time", "timeit",
    "traceback", "typing", "unicodedata", "unittest", "urllib", "uuid", "warnings",
    "weakref", "xml", "zipfile", "zlib",
];

static INPUT_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[^\w.])input\s*\(").expect("input regex is valid"));

static ADD_ARGUMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.add_argument\s*\(").expect("add_argument regex is valid"));

/// Extract metadata from Python source.
#[must_use]
pub fn extract(content: &str) -> ScriptMetadata {
    let (docstring, code) = split_docstring(content);
    let mut meta = ScriptMetadata::default();
    if let Some(doc) = docstring {
        let (description, examples) = parse_docstring(&doc);
        meta.description = description;
        meta.examples = examples;
    }
    meta.interactive = code_lines(code).any(|line| INPUT_CALL.is_match(line));
    meta.dependencies = imports(code);
    meta.parameters = argparse_parameters(code);
    meta
}

/// Split off the module docstring, returning it and the code that follows.
fn split_docstring(content: &str) -> (Option<String>, &str) {
    let mut rest = content;
    loop {
        let trimmed = rest.trim_start();
        if let Some(comment) = trimmed.strip_prefix('#') {
            rest = comment.split_once('\n').map_or("", |(_, tail)| tail);
        } else {
            rest = trimmed;
            break;
        }
    }

    let body = rest.trim_start_matches(['r', 'R', 'u', 'U']);
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        let Some(after) = body.strip_prefix(quote) else {
            continue;
        };
        return match after.find(quote) {
            Some(end) => (Some(after[..end].to_owned()), &after[end + quote.len()..]),
            None => (None, content),
        };
    }
    (None, rest)
}

/// First line is the description; an `Examples:` header starts an indented block of
/// example lines that ends at the next unindented line.
fn parse_docstring(doc: &str) -> (String, Vec<String>) {
    let doc = doc.trim();
    let description = doc.lines().next().unwrap_or_default().trim().to_owned();

    let mut examples = Vec::new();
    let mut in_examples = false;
    for line in doc.lines().skip(1) {
        let trimmed = line.trim();
        if !in_examples {
            in_examples = trimmed.to_lowercase().starts_with("example");
            continue;
        }
        if trimmed.is_empty() {
            continue;
        }
        if !line.starts_with([' ', '\t']) {
            break;
        }
        examples.push(trimmed.to_owned());
    }
    (description, examples)
}

fn code_lines(code: &str) -> impl Iterator<Item = &str> {
    code.lines().filter(|line| !line.trim_start().starts_with('#'))
}

fn imports(code: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for line in code_lines(code).map(str::trim) {
        let modules: Vec<&str> = if let Some(rest) = line.strip_prefix("import ") {
            rest.split(',')
                .filter_map(|m| m.split_whitespace().next())
                .collect()
        } else if let Some(rest) = line.strip_prefix("from ") {
            rest.split_whitespace().next().into_iter().collect()
        } else {
            continue;
        };
        for module in modules {
            let top = module.split('.').next().unwrap_or_default();
            if top.is_empty() || STDLIB_MODULES.contains(&top) {
                continue;
            }
            if !deps.iter().any(|d| d == top) {
                deps.push(top.to_owned());
            }
        }
    }
    deps
}

fn argparse_parameters(code: &str) -> Vec<ParameterSpec> {
    let mut params: Vec<ParameterSpec> = Vec::new();
    for found in ADD_ARGUMENT.find_iter(code) {
        let Some(inner) = call_arguments(&code[found.end()..]) else {
            continue;
        };
        let Some(param) = parse_add_argument(inner) else {
            continue;
        };
        if params.iter().all(|p| p.name != param.name) {
            params.push(param);
        }
    }
    params
}

/// Text between the opening paren (already consumed) and its matching close.
fn call_arguments(after_paren: &str) -> Option<&str> {
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, ch) in after_paren.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&after_paren[..idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on commas that are not nested in brackets or strings.
fn split_top_level(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in args.char_indices() {
        if let Some(q) = quote {
            if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(args[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn string_literal(expr: &str) -> Option<String> {
    let expr = expr.trim().trim_start_matches(['r', 'R', 'f', 'F', 'b', 'B', 'u', 'U']);
    let quote = expr.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let inner = expr.strip_prefix(quote)?.strip_suffix(quote)?;
    Some(inner.to_owned())
}

fn parse_add_argument(args: &str) -> Option<ParameterSpec> {
    let mut flags = Vec::new();
    let mut help = None;
    let mut type_name = None;
    let mut action = None;
    let mut nargs = None;
    let mut required = None;
    let mut has_default = false;

    for part in split_top_level(args) {
        let keyword = part
            .split_once('=')
            .filter(|(key, _)| key.trim().chars().all(|c| c.is_alphanumeric() || c == '_'));
        match keyword {
            Some((key, value)) => {
                let value = value.trim();
                match key.trim() {
                    "help" => help = string_literal(value),
                    "type" => type_name = Some(value.to_owned()),
                    "action" => action = string_literal(value),
                    "nargs" => nargs = Some(string_literal(value).unwrap_or_else(|| value.to_owned())),
                    "required" => required = Some(value == "True"),
                    "default" => has_default = true,
                    _ => {}
                }
            }
            None => flags.extend(string_literal(part)),
        }
    }

    let positional = flags.iter().all(|f| !f.starts_with('-'));
    let flag = flags
        .iter()
        .max_by_key(|f| (f.starts_with("--"), f.len()))?;
    let name = flag.trim_start_matches('-').replace('-', "_");
    if name.is_empty() || name == "help" {
        return None;
    }

    let param_type = match (action.as_deref(), type_name.as_deref(), nargs.as_deref()) {
        (Some("store_true" | "store_false"), _, _) => ParamType::Boolean,
        (_, _, Some("+" | "*")) => ParamType::Array,
        (_, Some("int"), _) => ParamType::Integer,
        (_, Some("float"), _) => ParamType::Number,
        _ => ParamType::String,
    };
    let optional_nargs = matches!(nargs.as_deref(), Some("?" | "*"));
    let required = required.unwrap_or(positional && !optional_nargs && !has_default);
    let description = help.unwrap_or_else(|| describe_parameter(&name));

    let spec = ParameterSpec::new(name, param_type).with_description(description);
    Some(if required { spec.required() } else { spec })
}
