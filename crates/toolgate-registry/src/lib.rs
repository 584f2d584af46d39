//! Tool specifications, gateway configuration, and the persisted tool registry.

pub mod config;
pub mod error;
pub mod registry;
pub mod spec;
pub mod store;

pub use config::{GlobalConfig, RedactionStyle};
pub use error::RegistryError;
pub use registry::ToolRegistry;
pub use spec::{
    DEFAULT_WORKSPACE_DIR, MAX_TOOL_NAME_LEN, ParamType, ParameterSpec, ScriptType, ToolSpec,
    WorkspacePolicy, is_valid_tool_name,
};
pub use store::{ConfigStore, ToolConfigFile};
