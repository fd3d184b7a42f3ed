use dplus_core::{BusError, ConfigError, ControlError};
use thiserror::Error;

/// Errors raised by the simulator service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("control core: {0}")]
    Control(#[from] ControlError),

    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("bus: {0}")]
    Bus(#[from] BusError),

    #[error("debug features disabled: {0}")]
    DebugDisabled(String),

    #[error("service loop is not running")]
    ChannelClosed,
}
