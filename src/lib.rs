//! StateSet Inventory Library
//!
//! Change-driven inventory pipeline: a keyed stock store with an append-only
//! change log, a replayable change stream, low-stock threshold detection and
//! deduplicated alert dispatch.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (records, change records, mutations, alerts)
//! - [`infra`] - Storage traits and implementations (SQLite, in-memory), retry, shutdown
//! - [`ingest`] - Mutation applier and CSV parsing front end
//! - [`stream`] - Ordered, replayable change stream
//! - [`detector`] - Threshold crossing detection over the change stream
//! - [`dispatch`] - Deduplicating, retrying alert delivery
//! - [`api`] - Query service and REST routes
//! - [`metrics`] - In-process counters, gauges and histograms
//! - [`telemetry`] - Logging setup

pub mod api;
pub mod config;
pub mod detector;
pub mod dispatch;
pub mod domain;
pub mod infra;
pub mod ingest;
pub mod metrics;
pub mod migrations;
pub mod server;
pub mod stream;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    AlertEvent, ChangeRecord, ConsumerCursor, DedupKey, InventoryKey, InventoryRecord, ItemId,
    Mutation, RawMutation, StoreId,
};

pub use infra::{CursorStore, InventoryError, InventoryStore, Result};
