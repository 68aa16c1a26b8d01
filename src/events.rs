use crate::conflict::{ChangePendedFlags, Conflict};

/// Something went wrong that the operation recovered from or chose to skip.
#[derive(Clone, Debug, PartialEq)]
pub enum NonFatalError {
    /// A conflict could not be resolved; the rest of the batch went ahead.
    ConflictResolveFailed { conflict_id: i32, message: String },
    /// The download proxy failed.
    DownloadProxyFailed { message: String },
    /// The proxy has been turned off and the download is being retried against the server.
    DownloadProxyDisabled,
    /// The server broke its own contract for a conflict; its operations were discarded.
    UnexpectedResolveOperations { conflict_id: i32, get_ops: usize, undo_ops: usize },
}

/// Receives notifications from the queue, the transfer layer and the conflict coordinator.
pub trait EventListener: Send + Sync {
    fn conflict_resolved(&self, _conflict: &Conflict, _flags: ChangePendedFlags) {}

    fn non_fatal_error(&self, _error: &NonFatalError) {}

    /// A download attempt failed and another one will follow after `delay_ms`.
    fn download_retrying(&self, _url: &str, _attempt: u32, _delay_ms: u64) {}
}

/// A zero-sized struct with an empty implementation of EventListener
pub struct NoEvents;

impl EventListener for NoEvents {}
