use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::archive;
use crate::state::BaselineId;
use crate::transfer::TransferError;

#[derive(Debug)]
pub enum SyncError {
    /// The caller handed the queue an update that breaks its contract.
    InvalidUpdate(String),
    /// Downloaded or cached baseline content does not match the expected hash or length.
    BaselineCorruption { baseline: BaselineId, reason: String },
    /// No baseline file exists for an item that should have one.
    MissingBaseline(PathBuf),
    /// A transfer failed terminally (retries exhausted or a fatal cause).
    Transfer(TransferError),
    /// The server rejected a remote call.
    ServerFault(String),
    IoError(io::Error),
    /// An io error, annotated with what was being attempted.
    Described { context: String, source: io::Error },
    ArchiveReadError(archive::ReadError),
    ArchiveWriteError(archive::WriteError),
    /// Internal bookkeeping reached a state that must never happen.
    InvariantViolation(String),
    /// The requested operation was cancelled before it could be completed.
    Cancelled,
}

impl SyncError {
    pub fn server_fault<S: Into<String>>(message: S) -> Self {
        SyncError::ServerFault(message.into())
    }

    pub fn invariant<S: Into<String>>(message: S) -> Self {
        SyncError::InvariantViolation(message.into())
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::IoError(e)
    }
}

impl From<archive::ReadError> for SyncError {
    fn from(e: archive::ReadError) -> Self {
        SyncError::ArchiveReadError(e)
    }
}

impl From<archive::WriteError> for SyncError {
    fn from(e: archive::WriteError) -> Self {
        SyncError::ArchiveWriteError(e)
    }
}

impl From<TransferError> for SyncError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Cancelled => SyncError::Cancelled,
            e => SyncError::Transfer(e),
        }
    }
}

impl From<walkdir::Error> for SyncError {
    fn from(e: walkdir::Error) -> Self {
        let context = format!("walking {:?}", e.path());
        match e.into_io_error() {
            Some(source) => SyncError::Described { context, source },
            None => SyncError::InvariantViolation(format!("filesystem loop while {}", context)),
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SyncError::InvalidUpdate(ref msg) => write!(f, "invalid local version update: {}", msg),
            SyncError::BaselineCorruption { ref baseline, ref reason } => {
                write!(f, "baseline {} is corrupt: {}", baseline, reason)
            }
            SyncError::MissingBaseline(ref path) => write!(f, "no baseline is available for {:?}", path),
            SyncError::Transfer(ref e) => write!(f, "transfer failed: {}", e),
            SyncError::ServerFault(ref msg) => write!(f, "server fault: {}", msg),
            SyncError::IoError(ref io) => write!(f, "io error: {}", io),
            SyncError::Described { ref context, ref source } => write!(f, "io error {}: {}", context, source),
            SyncError::ArchiveReadError(ref e) => write!(f, "archive read error: {:?}", e),
            SyncError::ArchiveWriteError(ref e) => write!(f, "archive write error: {:?}", e),
            SyncError::InvariantViolation(ref msg) => write!(f, "invariant violated: {}", msg),
            SyncError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            SyncError::Transfer(ref e) => Some(e),
            SyncError::IoError(ref e) => Some(e),
            SyncError::Described { ref source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Attaches a description of what was being attempted to an io error.
pub trait DescribeIoError<T> {
    fn describe<F, S>(self, describe: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> DescribeIoError<T> for Result<T, io::Error> {
    fn describe<F, S>(self, describe: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| SyncError::Described {
            context: describe().into(),
            source,
        })
    }
}
