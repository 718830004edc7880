use thiserror::Error;
use transport_session::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TetherError {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection timed out")]
    ConnectionTimedOut,
    #[error("start listening is not active")]
    StartListeningNotActive,
    #[error("illegal peer id")]
    IllegalPeerId,
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("socket bridge failed: {0}")]
    Bridge(String),
}

pub type TetherResult<T> = Result<T, TetherError>;

impl TetherError {
    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            TetherError::ConnectionFailed => "failed",
            TetherError::ConnectionTimedOut => "timed_out",
            TetherError::StartListeningNotActive => "not_listening",
            TetherError::IllegalPeerId => "illegal_peer",
            TetherError::Session(_) => "session",
            TetherError::Bridge(_) => "bridge",
        }
    }
}

impl From<std::io::Error> for TetherError {
    fn from(err: std::io::Error) -> Self {
        TetherError::Bridge(err.to_string())
    }
}
