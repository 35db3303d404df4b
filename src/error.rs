// Sidekick Error Types
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SidekickError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Lifecycle failures of the supervised server process.
    #[error("Server error: {0}")]
    Server(String),

    /// The health endpoint never returned a success status within the
    /// allotted window. Non-fatal overall; the caller may retry `start`.
    #[error("server failed to start within {}ms", .0.as_millis())]
    StartupTimeout(Duration),

    /// Caller-contract violations on a chat session (empty message, a send
    /// while a turn is still in flight). HTTP and transport failures during
    /// a turn are not errors; they are rendered into the transcript.
    #[error("Chat error: {0}")]
    Chat(String),
}

pub type Result<T> = std::result::Result<T, SidekickError>;
