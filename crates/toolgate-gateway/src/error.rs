use toolgate_discovery::DiscoveryError;
use toolgate_registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("failed to open audit log: {0}")]
    Audit(#[source] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
