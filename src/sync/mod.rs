//! Keeps one open conversation in step with the store.

pub mod error;
pub mod snapshot;
pub mod synchronizer;

pub use error::{SendOutcome, SyncError};
pub use snapshot::{Snapshot, SyncStatus};
pub use synchronizer::Synchronizer;
