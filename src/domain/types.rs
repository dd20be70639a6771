//! Identifier types for the inventory domain.
//!
//! Store and item identifiers are opaque, non-empty strings. Validation
//! happens once at the boundary (`parse`) so everything downstream can
//! assume well-formed keys.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::infra::{InventoryError, Result};

/// Store identifier (e.g. "Berlin")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreId(pub String);

impl StoreId {
    /// Parse a store identifier, trimming surrounding whitespace
    pub fn parse(raw: &str) -> Result<Self> {
        non_empty("store", raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StoreId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Item identifier (e.g. "Widget-001")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Parse an item identifier, trimming surrounding whitespace
    pub fn parse(raw: &str) -> Result<Self> {
        non_empty("item", raw).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique key of an inventory record.
///
/// Ordering is (store, item), which is also the listing order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InventoryKey {
    pub store: StoreId,
    pub item: ItemId,
}

impl InventoryKey {
    pub fn new(store: StoreId, item: ItemId) -> Self {
        Self { store, item }
    }
}

impl fmt::Display for InventoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.store, self.item)
    }
}

fn non_empty(field: &str, raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(InventoryError::InvalidInput {
            field: field.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_whitespace() {
        let store = StoreId::parse("  Berlin ").unwrap();
        assert_eq!(store.as_str(), "Berlin");
    }

    #[test]
    fn test_parse_rejects_blank() {
        assert!(StoreId::parse("").is_err());
        assert!(ItemId::parse("   ").is_err());
    }

    #[test]
    fn test_key_ordering_is_store_then_item() {
        let a = InventoryKey::new("Berlin".into(), "Widget-002".into());
        let b = InventoryKey::new("Paris".into(), "Widget-001".into());
        let c = InventoryKey::new("Berlin".into(), "Widget-001".into());

        let mut keys = vec![a.clone(), b.clone(), c.clone()];
        keys.sort();
        assert_eq!(keys, vec![c, a, b]);
    }
}
