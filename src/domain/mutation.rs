//! Mutation instructions and batch application reports.

use serde::{Deserialize, Serialize};

use super::{InventoryKey, ItemId, StoreId};
use crate::infra::{InventoryError, Result};

/// One unvalidated mutation row as produced by the parsing front end.
///
/// Fields are kept as raw text so that a malformed row can be reported
/// instead of failing the batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMutation {
    #[serde(rename = "Store", default)]
    pub store: String,
    #[serde(rename = "Item", default)]
    pub item: String,
    #[serde(rename = "Count", default)]
    pub quantity: String,
}

impl RawMutation {
    pub fn new(store: impl Into<String>, item: impl Into<String>, quantity: impl Into<String>) -> Self {
        Self {
            store: store.into(),
            item: item.into(),
            quantity: quantity.into(),
        }
    }

    /// Validate into an applicable mutation
    pub fn validate(&self) -> Result<Mutation> {
        let store = StoreId::parse(&self.store)?;
        let item = ItemId::parse(&self.item)?;

        let raw_quantity = self.quantity.trim();
        let quantity: i64 = raw_quantity.parse().map_err(|_| InventoryError::InvalidInput {
            field: "quantity".to_string(),
            reason: format!("{raw_quantity:?} is not an integer"),
        })?;
        if quantity < 0 {
            return Err(InventoryError::InvalidQuantity(quantity));
        }

        Ok(Mutation {
            store,
            item,
            quantity: quantity as u64,
            expected_version: None,
        })
    }
}

/// A validated upsert instruction for a single (store, item) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub store: StoreId,
    pub item: ItemId,
    pub quantity: u64,

    /// Optimistic concurrency: reject the write unless the current version matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

impl Mutation {
    pub fn new(store: impl Into<String>, item: impl Into<String>, quantity: u64) -> Self {
        Self {
            store: StoreId(store.into()),
            item: ItemId(item.into()),
            quantity,
            expected_version: None,
        }
    }

    /// Set the expected current version for optimistic concurrency
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.store.clone(), self.item.clone())
    }

    /// Reject blank store or item identifiers.
    ///
    /// `Mutation` fields are public, so stores check this before writing.
    pub fn ensure_key(&self) -> Result<()> {
        StoreId::parse(self.store.as_str())?;
        ItemId::parse(self.item.as_str())?;
        Ok(())
    }
}

/// A row dropped during validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRow {
    /// 1-based position of the row within the batch
    pub row: usize,
    pub reason: String,
}

/// A valid row that could not be written
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedRow {
    pub row: usize,
    pub store: String,
    pub item: String,
    pub error: String,
}

/// Per-batch summary of applied vs. skipped rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub applied: usize,
    pub skipped_rows: Vec<SkippedRow>,
    pub failed_rows: Vec<FailedRow>,
}

impl BatchReport {
    pub fn skipped(&self) -> usize {
        self.skipped_rows.len()
    }

    pub fn failed(&self) -> usize {
        self.failed_rows.len()
    }

    pub fn is_clean(&self) -> bool {
        self.skipped_rows.is_empty() && self.failed_rows.is_empty()
    }

    /// JSON summary returned by the ingest endpoint
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "total": self.total,
            "applied": self.applied,
            "skipped": self.skipped(),
            "failed": self.failed(),
            "skipped_rows": self.skipped_rows,
            "failed_rows": self.failed_rows,
        })
    }
}
