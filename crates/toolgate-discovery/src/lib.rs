//! Finds scripts under a tools root and turns them into tool specs without running them.

pub mod catalog;
pub mod classify;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod python;
pub mod shell;

pub use catalog::{DiscoveryReport, ScriptCatalog};
pub use classify::{classify, is_excluded, is_excluded_dir, refine_with_shebang};
pub use error::DiscoveryError;
pub use metadata::ScriptMetadata;
pub use naming::{UNNAMED_TOOL, tool_name_for};
