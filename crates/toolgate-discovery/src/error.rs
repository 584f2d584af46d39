use std::path::PathBuf;

use toolgate_registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("tools root {} is not a directory", .0.display())]
    MissingRoot(PathBuf),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Result type alias using `DiscoveryError`.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
