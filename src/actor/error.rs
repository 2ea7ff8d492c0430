use crate::broker::BrokerError;
use crate::config::ConfigError;
use thiserror::Error;

/// Errors reported back to the supervisor on the control channel
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("No configuration provided, there is nothing to do")]
    NoConfiguration,

    #[error("malamute/endpoint is missing")]
    MissingEndpoint,

    #[error("malamute/address is missing")]
    MissingAddress,

    #[error("CONFIG command without payload")]
    MissingConfigPayload,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Persistence error: {0}")]
    Persistence(color_eyre::Report),

    #[error("Empty command")]
    EmptyCommand,

    /// The supervisor sent a verb this actor does not know
    #[error("Invalid command '{0}'")]
    UnknownCommand(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}
