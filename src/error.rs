/*!
 * Error types for ferry
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, FerryError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_PARSE: i32 = 3;
pub const EXIT_AUTH: i32 = 4;
pub const EXIT_INTEGRITY: i32 = 5;
pub const EXIT_CANCELLED: i32 = 6;

#[derive(Debug)]
pub enum FerryError {
    /// Malformed endpoint specification
    Parse(String),

    /// SSH handshake or authentication failed
    Auth(String),

    /// Could not reach or converse with the remote host
    Connect(String),

    /// A single chunk failed after exhausting its retry budget
    ChunkFailed {
        index: u32,
        attempts: u32,
        cause: String,
    },

    /// Whole-file or per-chunk hash mismatch
    Integrity { expected: String, actual: String },

    /// Manifest exists but no longer matches the source file
    StaleManifest(String),

    /// Another engine holds the task lock
    ConcurrentTransfer(PathBuf),

    /// Transfer was cancelled; PAUSED state persisted
    Cancelled,

    /// Manifest load/save problem
    Manifest(String),

    /// Configuration error (bad flag values, invalid combinations)
    Config(String),

    /// Source file not found
    SourceNotFound(PathBuf),

    /// I/O error
    Io(io::Error),

    /// SSH/SFTP protocol error
    Ssh(ssh2::Error),
}

impl FerryError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            FerryError::Parse(_) => EXIT_PARSE,
            FerryError::Auth(_) => EXIT_AUTH,
            FerryError::Integrity { .. } => EXIT_INTEGRITY,
            FerryError::Cancelled => EXIT_CANCELLED,
            FerryError::Config(_) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        match self {
            FerryError::Parse(_) => true,
            FerryError::Auth(_) => true,
            FerryError::Integrity { .. } => true,
            FerryError::ConcurrentTransfer(_) => true,
            FerryError::Cancelled => true,
            FerryError::Config(_) => true,
            FerryError::SourceNotFound(_) => true,
            FerryError::ChunkFailed { .. } => true,

            FerryError::Connect(_) => false,
            FerryError::StaleManifest(_) => false,
            FerryError::Manifest(_) => false,
            FerryError::Io(_) => false,
            FerryError::Ssh(_) => false,
        }
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            FerryError::Io(io_err) => Self::is_io_transient(io_err),
            FerryError::Connect(_) => true,
            FerryError::Ssh(_) => true,
            _ => false,
        }
    }

    fn is_io_transient(io_err: &io::Error) -> bool {
        use io::ErrorKind::*;
        matches!(
            io_err.kind(),
            ConnectionRefused
                | ConnectionReset
                | ConnectionAborted
                | NotConnected
                | BrokenPipe
                | TimedOut
                | Interrupted
                | WouldBlock
                | WriteZero
        )
    }
}

impl fmt::Display for FerryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FerryError::Parse(msg) => {
                write!(f, "Invalid endpoint: {}", msg)
            }
            FerryError::Auth(msg) => {
                write!(f, "Authentication failed: {}", msg)
            }
            FerryError::Connect(msg) => {
                write!(f, "Connection failed: {}", msg)
            }
            FerryError::ChunkFailed {
                index,
                attempts,
                cause,
            } => {
                write!(
                    f,
                    "Chunk {} failed after {} attempts: {}",
                    index, attempts, cause
                )
            }
            FerryError::Integrity { expected, actual } => {
                write!(
                    f,
                    "Integrity verification failed: expected {}, got {}",
                    expected, actual
                )
            }
            FerryError::StaleManifest(msg) => {
                write!(f, "Stale manifest: {}", msg)
            }
            FerryError::ConcurrentTransfer(path) => {
                write!(
                    f,
                    "Another transfer for this task is already running (lock: {})",
                    path.display()
                )
            }
            FerryError::Cancelled => {
                write!(f, "Transfer cancelled")
            }
            FerryError::Manifest(msg) => {
                write!(f, "Manifest error: {}", msg)
            }
            FerryError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            FerryError::SourceNotFound(path) => {
                write!(f, "Source not found: {}", path.display())
            }
            FerryError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            FerryError::Ssh(err) => {
                write!(f, "SSH error: {}", err)
            }
        }
    }
}

impl std::error::Error for FerryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FerryError::Io(err) => Some(err),
            FerryError::Ssh(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FerryError {
    fn from(err: io::Error) -> Self {
        FerryError::Io(err)
    }
}

impl From<ssh2::Error> for FerryError {
    fn from(err: ssh2::Error) -> Self {
        FerryError::Ssh(err)
    }
}

impl From<serde_json::Error> for FerryError {
    fn from(err: serde_json::Error) -> Self {
        FerryError::Manifest(format!("JSON error: {}", err))
    }
}
