/*!
 * Error types for MotorLink.
 *
 * Construction-time failures (`NoDeviceFound`, `Connection`) are returned to
 * callers. Transport failures on an established session stay inside the
 * session and only ever reach the log.
 */
use thiserror::Error;

/// Error type for MotorLink operations
#[derive(Error, Debug)]
pub enum Error {
    /// Discovery returned no candidate device and none was supplied
    #[error("No device found")]
    NoDeviceFound,

    /// The initial open of a device failed
    #[error("Could not connect to {path}: {reason}")]
    Connection {
        /// The device path that was opened
        path: String,
        /// Why the open failed
        reason: String,
    },

    /// I/O failure on an established channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// An address or argument list does not match the command schema
    #[error("Schema error: {0}")]
    Schema(String),

    /// A frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The session has been closed
    #[error("Session closed")]
    Closed,

    /// A session for this device path is already attached
    #[error("Already attached: {0}")]
    AlreadyAttached(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for MotorLink operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new connection error
    pub fn connection<P: AsRef<str>, S: AsRef<str>>(path: P, reason: S) -> Self {
        Error::Connection {
            path: path.as_ref().to_string(),
            reason: reason.as_ref().to_string(),
        }
    }

    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        Error::Transport(msg.as_ref().to_string())
    }

    /// Create a new schema error
    pub fn schema<S: AsRef<str>>(msg: S) -> Self {
        Error::Schema(msg.as_ref().to_string())
    }

    /// Create a new codec error
    pub fn codec<S: AsRef<str>>(msg: S) -> Self {
        Error::Codec(msg.as_ref().to_string())
    }

    /// Create a new configuration error
    pub fn config<S: AsRef<str>>(msg: S) -> Self {
        Error::Config(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        Error::Timeout(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
