//! Client-side state reconciliation for a version-controlled local workspace.
//!
//! Keeps the local cache of "which server version does each local file hold" in step with
//! the server: batched two-phase local version updates, conflict resolution, and resilient
//! baseline downloads.

#[macro_use]
extern crate log;

pub mod archive;
pub mod baseline;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod queue;
pub mod server;
pub mod state;
pub mod transfer;
pub mod util;
pub mod workspace;

pub use crate::baseline::{BaselineManager, BaselineRequest, BaselineSource};
pub use crate::config::{BaselineOptions, QueueOptions, TransferOptions, UpdateTargets, WorkspaceOptions};
pub use crate::conflict::resolve::{ConflictResolutionCoordinator, GetEngine, ResolutionPolicy, ResolveResult};
pub use crate::error::SyncError;
pub use crate::events::{EventListener, NoEvents, NonFatalError};
pub use crate::queue::LocalVersionUpdateQueue;
pub use crate::state::{LocalVersionUpdate, Population};
pub use crate::transfer::{ContentTransferClient, HttpTransferClient, TransferError, TransferRetryCoordinator};
pub use crate::workspace::{Workspace, WorkspaceLocation};
