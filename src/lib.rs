pub mod config;
pub mod models;
pub mod providers;
pub mod services;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use sync::{SendOutcome, Snapshot, SyncError, SyncStatus, Synchronizer};
