//! Infrastructure layer for the inventory pipeline
//!
//! Contains trait definitions and implementations for:
//! - Inventory storage and change log (SQLite, in-memory)
//! - Consumer cursors
//! - Failed alert store and dispatch log
//! - Alert deduplication window
//! - Retry with backoff
//! - Graceful shutdown

mod dead_letter;
mod dedup;
mod error;
mod graceful_shutdown;
pub mod memory;
mod retry;
pub mod sqlite;
mod traits;

pub use dead_letter::{FailedAlert, FailureReason, SqliteFailedAlertStore};
pub use dedup::{DedupStats, DedupWindow};
pub use error::*;
pub use graceful_shutdown::{serve_with_shutdown, shutdown_signal, ShutdownCoordinator, ShutdownSignal};
pub use memory::{
    InMemoryCursorStore, InMemoryDispatchLog, InMemoryFailedAlertStore, InMemoryInventoryStore,
};
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use sqlite::{SqliteCursorStore, SqliteDispatchLog, SqliteInventoryStore};
pub use traits::*;
