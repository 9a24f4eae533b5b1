//! Error types for voxturn

use thiserror::Error;

/// Result type alias for voxturn operations
pub type Result<T> = std::result::Result<T, Error>;

/// What the conversation loop does after a turn fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPolicy {
    /// Abort the current turn only, keep listening
    ContinueSession,
    /// Degrade to idle; the user has to start a new session
    EndSession,
}

/// Errors that can occur in the voice pipeline
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone access was refused by the OS or the user
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Microphone capture failed for a reason other than permission
    #[error("capture error: {0}")]
    Capture(String),

    /// Socket or stream failure while sending or receiving a reply
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed control message, unexpected message type or sample-rate mismatch
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Output device error
    #[error("playback failure: {0}")]
    Playback(String),

    /// The remote agent reported an error for this turn
    #[error("remote agent error: {0}")]
    Remote(String),

    /// Stop was requested while the operation was running
    #[error("cancelled")]
    Cancelled,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(format!("websocket: {err}"))
    }
}

impl Error {
    /// Whether this error came from the wire layer and may be retried
    /// with a fallback strategy
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Http(_) | Self::Io(_))
    }

    /// How a failure of this kind affects the running session
    ///
    /// Capture, protocol and playback problems only abort the current turn.
    /// Everything else (permission denial, transport failure after the
    /// fallback budget is spent, remote agent errors) ends the session.
    #[must_use]
    pub const fn policy(&self) -> TurnPolicy {
        match self {
            Self::Capture(_) | Self::Protocol(_) | Self::Playback(_) => TurnPolicy::ContinueSession,
            _ => TurnPolicy::EndSession,
        }
    }
}
