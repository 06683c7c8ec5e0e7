use crate::command::CommandResult;

/// [Result] alias for return types of the crate API
pub type Result<T> = std::result::Result<T, Error>;

/// Error reported by a [Link](crate::Link) implementation
///
/// Transient errors are absorbed and retried by the setpoint streamer, fatal errors mean the link
/// cannot carry traffic anymore.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Send failed but the link may recover (congestion, dropped datagram, ...)
    #[error("transient link error: {0}")]
    Transient(String),
    /// The link is gone
    #[error("fatal link error: {0}")]
    Fatal(String),
}

impl LinkError {
    /// True if the link cannot recover from this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Fatal(_))
    }
}

/// Error enum type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport level error returned by the link.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// The offboard session was started before any setpoint was set.
    ///
    /// The vehicle refuses offboard mode entry if it has not received a setpoint first.
    #[error("no setpoint primed before starting offboard")]
    NoSetpointPrimed,
    /// The setpoint stream or the session is already running.
    #[error("setpoint stream already active")]
    AlreadyStreaming,
    /// The operation requires an engaged offboard session.
    #[error("offboard session not active")]
    NotActive,
    /// The vehicle answered a command with a negative result.
    #[error("command rejected by vehicle: {0:?}")]
    Rejected(CommandResult),
    /// No acknowledgement from the vehicle in time.
    #[error("timed out waiting for the vehicle")]
    Timeout,
    /// The session lost control authority while the operation was running.
    #[error("offboard session degraded")]
    Degraded,
    /// The operation was interrupted by a shutdown request.
    #[error("operation cancelled by shutdown")]
    Cancelled,
    /// Another offboard session already holds the transmission lease on this link.
    #[error("link already leased by another offboard session")]
    LinkBusy,
    /// The link dispatcher is gone, the vehicle is disconnected.
    #[error("disconnected")]
    Disconnected,
    /// Unexpected or malformed frame. The String contains the reason.
    #[error("protocol error: {0}")]
    ProtocolError(String),
    /// Argument out of the accepted range. The String contains the reason.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Invalid session configuration. The String contains the reason.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A scripted sequence stopped before completion.
    #[error("sequence aborted at step {step}: {source}")]
    SequenceAborted {
        /// Index of the step that failed
        step: usize,
        /// Cause of the abort
        source: Box<Error>,
    },
}

impl From<flume::RecvError> for Error {
    fn from(_: flume::RecvError) -> Self {
        Error::Disconnected
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(e: std::array::TryFromSliceError) -> Self {
        Self::ProtocolError(format!("{:?}", e))
    }
}
