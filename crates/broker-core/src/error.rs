//! Error types for the terminal broker's domain model

use thiserror::Error;

/// Result type alias for `broker-core` operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by `Session`, `Terminal`, and `Registry`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A session with this token already exists on the terminal
    #[error("a session with token {0:?} is already registered")]
    DuplicateToken(String),

    /// The terminal is shutting down and refuses new sessions
    #[error("terminal is closing, refusing new sessions")]
    Closing,

    /// A terminal with this locator already exists in the registry
    #[error("a terminal with locator {0:?} is already registered")]
    DuplicateLocator(String),
}
