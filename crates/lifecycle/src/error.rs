use thiserror::Error;
use updown_core::ConfigError;

use crate::gateway::GatewayError;

/// Errors returned by the [`LifecycleManager`](crate::manager::LifecycleManager) API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    /// Another close holds the exit flag.
    #[error("An exit is already in flight")]
    ExitInFlight,

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
