//! Inventory records and the change records derived from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{InventoryKey, ItemId, StoreId};

/// Current stock level of one (store, item) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub store: StoreId,
    pub item: ItemId,
    pub quantity: u64,

    /// Number of successful mutations applied to this key
    pub version: u64,

    pub updated_at: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.store.clone(), self.item.clone())
    }
}

/// Immutable record of one successful store mutation.
///
/// `sequence` is assigned at commit time and defines the total order of the
/// change stream. `previous_quantity` is `None` for the first write to a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub sequence: u64,
    pub store: StoreId,
    pub item: ItemId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_quantity: Option<u64>,
    pub new_quantity: u64,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn key(&self) -> InventoryKey {
        InventoryKey::new(self.store.clone(), self.item.clone())
    }
}

/// Durable read position of one change stream consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerCursor {
    pub consumer_id: String,
    pub last_acknowledged_sequence: u64,
    pub updated_at: DateTime<Utc>,
}
