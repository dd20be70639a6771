//! Low-stock alert events and the threshold-crossing rule.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{ChangeRecord, ItemId, StoreId};

/// Default low-stock threshold in units
pub const DEFAULT_THRESHOLD: u64 = 50;

/// Domain prefix for dedup key hashing
const DOMAIN_ALERT_DEDUP: &[u8] = b"INVENTORY_ALERT_DEDUP_V1";

/// Whether a before/after pair is a downward crossing of `threshold`.
///
/// A first observation (`previous` is `None`) counts as a crossing when it is
/// already below the threshold. Staying below, staying above, and upward
/// moves never cross.
pub fn is_downward_crossing(previous: Option<u64>, new: u64, threshold: u64) -> bool {
    if new >= threshold {
        return false;
    }
    match previous {
        None => true,
        Some(prev) => prev >= threshold,
    }
}

/// Deterministic identifier used to collapse re-emitted alerts.
///
/// SHA-256 over a length-prefixed (store, item, sequence) preimage, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn compute(store: &StoreId, item: &ItemId, sequence: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_ALERT_DEDUP);
        hasher.update((store.as_str().len() as u32).to_be_bytes());
        hasher.update(store.as_str().as_bytes());
        hasher.update((item.as_str().len() as u32).to_be_bytes());
        hasher.update(item.as_str().as_bytes());
        hasher.update(sequence.to_be_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Alert raised when a change record crosses below the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub store: StoreId,
    pub item: ItemId,
    pub quantity: u64,
    pub threshold: u64,

    /// Sequence of the triggering change record
    pub sequence: u64,
    pub dedup_key: DedupKey,
}

impl AlertEvent {
    /// Evaluate a change record against the threshold.
    ///
    /// Uses only the before/after pair carried by the record, so replaying
    /// the same record always yields the same answer.
    pub fn evaluate(record: &ChangeRecord, threshold: u64) -> Option<Self> {
        if !is_downward_crossing(record.previous_quantity, record.new_quantity, threshold) {
            return None;
        }

        Some(Self {
            store: record.store.clone(),
            item: record.item.clone(),
            quantity: record.new_quantity,
            threshold,
            sequence: record.sequence,
            dedup_key: DedupKey::compute(&record.store, &record.item, record.sequence),
        })
    }

    /// Payload handed to the external fan-out channel
    pub fn payload(&self) -> AlertPayload {
        AlertPayload {
            store: self.store.to_string(),
            item: self.item.to_string(),
            quantity: self.quantity,
            threshold: self.threshold,
            dedup_key: self.dedup_key.to_string(),
        }
    }
}

/// Externally visible alert payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub store: String,
    pub item: String,
    pub quantity: u64,
    pub threshold: u64,

    /// Suppression key; channels may use it for their own idempotency
    #[serde(skip_serializing, default)]
    pub dedup_key: String,
}

impl AlertPayload {
    pub fn subject(&self) -> String {
        format!("[ALERT] Low stock: {} at {}", self.item, self.store)
    }

    pub fn message(&self) -> String {
        format!(
            "LOW STOCK ALERT\n\nStore: {}\nItem: {}\nCurrent stock: {}\nThreshold: {}\n\nPlease restock as soon as possible.\n",
            self.store, self.item, self.quantity, self.threshold
        )
    }
}
