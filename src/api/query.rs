//! Read-only query service over the inventory store

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{InventoryRecord, StoreId};
use crate::infra::{InventoryStore, Result};

/// Externally visible record shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemView {
    #[serde(rename = "Store")]
    pub store: String,
    #[serde(rename = "Item")]
    pub item: String,
    #[serde(rename = "Count")]
    pub count: u64,
}

impl From<InventoryRecord> for ItemView {
    fn from(record: InventoryRecord) -> Self {
        Self {
            store: record.store.0,
            item: record.item.0,
            count: record.quantity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemsResponse {
    pub items: Vec<ItemView>,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreItemsResponse {
    pub store: String,
    pub items: Vec<ItemView>,
    pub count: usize,
}

/// Query service
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn InventoryStore>,
}

impl QueryService {
    pub fn new(store: Arc<dyn InventoryStore>) -> Self {
        Self { store }
    }

    /// Every record, ordered by (store, item)
    pub async fn get_all_items(&self) -> Result<ItemsResponse> {
        let items: Vec<ItemView> = self
            .store
            .list(None)
            .await?
            .into_iter()
            .map(ItemView::from)
            .collect();

        Ok(ItemsResponse {
            count: items.len(),
            items,
        })
    }

    /// Records of one store; an unknown or blank store yields an empty list.
    ///
    /// The name is trimmed the same way ingest trims it.
    pub async fn get_items_by_store(&self, store: &str) -> Result<StoreItemsResponse> {
        let Ok(store_id) = StoreId::parse(store) else {
            return Ok(StoreItemsResponse {
                store: String::new(),
                items: Vec::new(),
                count: 0,
            });
        };

        let items: Vec<ItemView> = self
            .store
            .list(Some(&store_id))
            .await?
            .into_iter()
            .map(ItemView::from)
            .collect();

        Ok(StoreItemsResponse {
            store: store_id.0,
            count: items.len(),
            items,
        })
    }
}
