use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds reported by every public operation of this crate.
///
/// Each variant carries a diagnostic message. Backend failures are converted into the variant
/// matching the operation that observed them, so the kind always describes *what* failed, while
/// the message describes *why*.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed input, detected before any backend interaction.
    #[error("validation error: {0}")]
    Validation(String),
    /// Backend rejected the translated configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Policy name has no backend equivalent.
    #[error("unsupported policy: {0}")]
    UnsupportedPolicy(String),
    /// Offer/answer creation or session description application failed.
    #[error("negotiation error: {0}")]
    Negotiation(String),
    /// ICE candidate could not be added.
    #[error("ice error: {0}")]
    Ice(String),
    /// Data channel lifecycle failure.
    #[error("channel error: {0}")]
    Channel(String),
    /// Operation issued on a closed connection.
    #[error("connection closed: {0}")]
    Closed(String),
    /// Capture device denied or absent.
    #[error("capture error: {0}")]
    Capture(String),
    /// Capability not provided by the active backend.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

const CONNECTION_CLOSED: &str = "connection closed";
const CHANNEL_CLOSED: &str = "data channel is closed";

impl Error {
    pub(crate) fn connection_closed() -> Self {
        Error::Negotiation(CONNECTION_CLOSED.into())
    }

    /// Candidate added to a closed connection.
    pub(crate) fn ice_closed() -> Self {
        Error::Ice(CONNECTION_CLOSED.into())
    }

    /// Data channel requested from a closed connection.
    pub(crate) fn connection_channel_closed() -> Self {
        Error::Channel(CONNECTION_CLOSED.into())
    }

    pub(crate) fn channel_closed() -> Self {
        Error::Channel(CHANNEL_CLOSED.into())
    }

    /// Returns `true` when this error was produced because the connection or channel has
    /// been closed.
    ///
    /// Only errors built by this crate on closure carry these exact messages: backend failures
    /// are always reported with the failed operation as a prefix.
    pub fn is_closed(&self) -> bool {
        match self {
            Error::Closed(_) => true,
            Error::Negotiation(msg) | Error::Ice(msg) => msg == CONNECTION_CLOSED,
            Error::Channel(msg) => msg == CONNECTION_CLOSED || msg == CHANNEL_CLOSED,
            _ => false,
        }
    }
}
