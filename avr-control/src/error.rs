use std::time::Duration;

use thiserror::Error;

/// Errors surfaced to callers of a receiver session.
///
/// Transport failures never appear here directly: the session reconnects on
/// its own, and a command caught by a dead connection eventually surfaces as
/// [`AvrError::CommandTimeout`].
#[derive(Error, Debug)]
pub enum AvrError {
    /// No device address has been discovered yet
    #[error("No receiver address has been discovered yet")]
    NotReady,

    /// Property name is not registered in the command table
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// Accessor name does not derive from any registered property
    #[error("Unknown accessor: {0}")]
    UnknownAccessor(String),

    /// Setter accessor invoked without a value
    #[error("Accessor {0} requires a value")]
    MissingArgument(String),

    /// Value has no wire token in the property's value dictionary
    #[error("Invalid value {value:?} for property {property}")]
    InvalidValue { property: String, value: String },

    /// No matching response within the retry budget
    #[error("Command {command:?} timed out after {attempts} attempt(s)")]
    CommandTimeout { command: String, attempts: u32 },

    /// The connection carrying the command was closed because the device
    /// address changed
    #[error("Command {command:?} aborted: receiver address changed")]
    ConnectionReplaced { command: String },

    /// Command name registered twice
    #[error("Command {0} is already registered")]
    DuplicateCommand(String),

    /// Two commands would claim the same inbound lines
    #[error("Command {name} overlaps with registered command {existing}")]
    OverlappingCommand { name: String, existing: String },

    /// Match pattern failed to compile
    #[error("Invalid match pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// Match pattern has more than one capture group
    #[error("Match pattern for {name} has {groups} capture groups (at most 1 allowed)")]
    TooManyCaptures { name: String, groups: usize },

    /// Session configuration is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session task has stopped
    #[error("Session has shut down")]
    SessionClosed,

    /// Discovery failed to start
    #[error("Discovery error: {0}")]
    Discovery(#[from] denon_discovery::DiscoveryError),
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, AvrError>;

/// Transport failures handled inside the session by reconnecting.
#[derive(Error, Debug)]
pub(crate) enum ConnectionError {
    #[error("Connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Stream error: {0}")]
    Codec(#[from] crate::codec::CodecError),

    #[error("Connection closed by receiver")]
    Closed,
}
