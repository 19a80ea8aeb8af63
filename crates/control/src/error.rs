use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The operation needs a device link, and there isn't one.
    #[error("plotter is not connected")]
    NotConnected,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("analog channel {0} is not enabled")]
    ChannelNotEnabled(u8),

    /// The device (or the link to it) rejected a call.
    #[error(transparent)]
    Driver(#[from] anyhow::Error),

    /// The operation was dropped before it finished, either because the
    /// queue was cleared by an emergency stop or because it panicked.
    #[error("operation was cancelled")]
    Cancelled,
}
