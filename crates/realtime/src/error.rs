use realtyops_core::error::CoreError;

/// Errors surfaced by the realtime pool and push sources.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// Every pool slot is taken; the caller may degrade to polling.
    #[error("Connection pool exhausted ({max} connections open)")]
    PoolExhausted { max: usize },

    /// Realtime delivery is switched off.
    #[error("Realtime is disabled")]
    Disabled,

    /// The push channel reported an error or could not be opened.
    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Channel timed out: {0}")]
    TimedOut(String),

    /// An inbound payload failed validation.
    #[error("Invalid change payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid row filter '{0}'")]
    InvalidFilter(String),

    #[error("Realtime manager is shut down")]
    ShutDown,
}

impl From<RealtimeError> for CoreError {
    fn from(err: RealtimeError) -> Self {
        match err {
            RealtimeError::PoolExhausted { .. }
            | RealtimeError::Disabled
            | RealtimeError::ShutDown => CoreError::Unavailable(err.to_string()),
            RealtimeError::InvalidPayload(_) | RealtimeError::InvalidFilter(_) => {
                CoreError::Validation(err.to_string())
            }
            RealtimeError::ChannelError(_) | RealtimeError::TimedOut(_) => {
                CoreError::Internal(err.to_string())
            }
        }
    }
}
