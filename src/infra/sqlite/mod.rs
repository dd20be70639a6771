//! SQLite implementations of the inventory store, consumer cursors and
//! dispatch log. The failed alert store lives in `infra::dead_letter`.
//!
//! All of them share one database file so that a restart sees records, the
//! change log and cursors from the same point in time.

mod cursor_store;
mod dispatch_log;
mod inventory_store;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};

use crate::infra::Result;

pub use cursor_store::SqliteCursorStore;
pub use dispatch_log::SqliteDispatchLog;
pub use inventory_store::SqliteInventoryStore;

/// Open (creating if missing) the database at `url` and run migrations
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    crate::migrations::run_sqlite(&pool).await?;

    tracing::info!(url = %url, max_connections, "SQLite database ready");
    Ok(pool)
}

/// Open a private in-memory database with migrations applied.
///
/// Each in-memory connection is its own database, so the pool is pinned to a
/// single connection that is never recycled.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    crate::migrations::run_sqlite(&pool).await?;
    Ok(pool)
}
