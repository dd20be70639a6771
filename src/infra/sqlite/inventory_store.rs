//! SQLite inventory store
//!
//! Record update and change log append happen in one transaction. Writes
//! are serialized through an in-process lock so that the next sequence can
//! be taken as `MAX(sequence) + 1` without leaving holes; a failed
//! transaction rolls back both halves and consumes no sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, FromRow};
use tokio::sync::{watch, Mutex};

use crate::domain::{ChangeRecord, InventoryRecord, ItemId, Mutation, StoreId};
use crate::infra::{InventoryError, InventoryStore, Result};

/// SQLite-backed inventory store and change log
pub struct SqliteInventoryStore {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    head_tx: watch::Sender<u64>,
}

impl SqliteInventoryStore {
    /// Create a store over an already migrated pool
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let head = Self::max_sequence(&pool).await?;
        let (head_tx, _) = watch::channel(head);

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            head_tx,
        })
    }

    /// Open the database at `path`, run migrations and create the store
    pub async fn from_path(path: &str) -> Result<Self> {
        let pool = super::connect(path, 4).await?;
        Self::new(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn max_sequence(pool: &SqlitePool) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM change_log")
            .fetch_one(pool)
            .await?;
        Ok(row.0 as u64)
    }
}

#[async_trait]
impl InventoryStore for SqliteInventoryStore {
    async fn upsert(&self, mutation: &Mutation) -> Result<InventoryRecord> {
        mutation.ensure_key()?;
        let quantity = i64::try_from(mutation.quantity).map_err(|_| InventoryError::InvalidInput {
            field: "quantity".to_string(),
            reason: format!("{} exceeds the storable range", mutation.quantity),
        })?;

        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let current: Option<(i64, i64)> =
            sqlx::query_as("SELECT quantity, version FROM inventory WHERE store = ? AND item = ?")
                .bind(mutation.store.as_str())
                .bind(mutation.item.as_str())
                .fetch_optional(&mut *tx)
                .await?;

        let previous_quantity = current.map(|(q, _)| q as u64);
        let current_version = current.map(|(_, v)| v as u64).unwrap_or(0);

        if let Some(expected) = mutation.expected_version {
            if expected != current_version {
                return Err(InventoryError::VersionConflict {
                    store: mutation.store.to_string(),
                    item: mutation.item.to_string(),
                    expected,
                    actual: current_version,
                });
            }
        }

        let version = current_version + 1;
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let (sequence,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) + 1 FROM change_log")
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO inventory (store, item, quantity, version, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(store, item) DO UPDATE SET
                quantity = excluded.quantity,
                version = excluded.version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(mutation.store.as_str())
        .bind(mutation.item.as_str())
        .bind(quantity)
        .bind(version as i64)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO change_log (
                sequence, store, item, previous_quantity, new_quantity, version, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sequence)
        .bind(mutation.store.as_str())
        .bind(mutation.item.as_str())
        .bind(previous_quantity.map(|q| q as i64))
        .bind(quantity)
        .bind(version as i64)
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.head_tx.send_replace(sequence as u64);

        tracing::debug!(
            store = %mutation.store,
            item = %mutation.item,
            quantity = mutation.quantity,
            version,
            sequence,
            "Inventory record upserted"
        );

        Ok(InventoryRecord {
            store: mutation.store.clone(),
            item: mutation.item.clone(),
            quantity: mutation.quantity,
            version,
            updated_at: now,
        })
    }

    async fn get(&self, store: &StoreId, item: &ItemId) -> Result<InventoryRecord> {
        let row = sqlx::query_as::<_, InventoryRow>(
            r#"
            SELECT store, item, quantity, version, updated_at
            FROM inventory
            WHERE store = ? AND item = ?
            "#,
        )
        .bind(store.as_str())
        .bind(item.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => Err(InventoryError::NotFound {
                store: store.to_string(),
                item: item.to_string(),
            }),
        }
    }

    async fn list(&self, store: Option<&StoreId>) -> Result<Vec<InventoryRecord>> {
        let rows = match store {
            Some(store) => {
                sqlx::query_as::<_, InventoryRow>(
                    r#"
                    SELECT store, item, quantity, version, updated_at
                    FROM inventory
                    WHERE store = ?
                    ORDER BY store ASC, item ASC
                    "#,
                )
                .bind(store.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, InventoryRow>(
                    r#"
                    SELECT store, item, quantity, version, updated_at
                    FROM inventory
                    ORDER BY store ASC, item ASC
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(InventoryRecord::try_from).collect()
    }

    async fn read_changes(&self, after: u64, limit: usize) -> Result<Vec<ChangeRecord>> {
        let rows = sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT sequence, store, item, previous_quantity, new_quantity, version, recorded_at
            FROM change_log
            WHERE sequence > ?
            ORDER BY sequence ASC
            LIMIT ?
            "#,
        )
        .bind(after as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ChangeRecord::try_from).collect()
    }

    async fn head(&self) -> Result<u64> {
        Self::max_sequence(&self.pool).await
    }

    fn subscribe_head(&self) -> watch::Receiver<u64> {
        self.head_tx.subscribe()
    }
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| InventoryError::Internal(format!("Invalid {}: {}", column, e)))
}

/// Database row for inventory records
#[derive(Debug, FromRow)]
struct InventoryRow {
    store: String,
    item: String,
    quantity: i64,
    version: i64,
    updated_at: String,
}

impl TryFrom<InventoryRow> for InventoryRecord {
    type Error = InventoryError;

    fn try_from(row: InventoryRow) -> Result<Self> {
        Ok(Self {
            store: StoreId(row.store),
            item: ItemId(row.item),
            quantity: row.quantity as u64,
            version: row.version as u64,
            updated_at: parse_timestamp("updated_at", &row.updated_at)?,
        })
    }
}

/// Database row for change log entries
#[derive(Debug, FromRow)]
struct ChangeRow {
    sequence: i64,
    store: String,
    item: String,
    previous_quantity: Option<i64>,
    new_quantity: i64,
    version: i64,
    recorded_at: String,
}

impl TryFrom<ChangeRow> for ChangeRecord {
    type Error = InventoryError;

    fn try_from(row: ChangeRow) -> Result<Self> {
        Ok(Self {
            sequence: row.sequence as u64,
            store: StoreId(row.store),
            item: ItemId(row.item),
            previous_quantity: row.previous_quantity.map(|q| q as u64),
            new_quantity: row.new_quantity as u64,
            version: row.version as u64,
            timestamp: parse_timestamp("recorded_at", &row.recorded_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::sqlite::connect_memory;

    async fn store() -> SqliteInventoryStore {
        SqliteInventoryStore::new(connect_memory().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_creates_then_overwrites() {
        let store = store().await;

        let first = store.upsert(&Mutation::new("Berlin", "Widget-001", 100)).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.quantity, 100);

        let second = store.upsert(&Mutation::new("Berlin", "Widget-001", 40)).await.unwrap();
        assert_eq!(second.version, 2);

        let current = store
            .get(&StoreId::from("Berlin"), &ItemId::from("Widget-001"))
            .await
            .unwrap();
        assert_eq!(current.quantity, 40);
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_change_log_carries_before_and_after() {
        let store = store().await;
        store.upsert(&Mutation::new("Berlin", "Widget-001", 100)).await.unwrap();
        store.upsert(&Mutation::new("Berlin", "Widget-001", 40)).await.unwrap();

        let changes = store.read_changes(0, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].sequence, 1);
        assert_eq!(changes[0].previous_quantity, None);
        assert_eq!(changes[1].sequence, 2);
        assert_eq!(changes[1].previous_quantity, Some(100));
        assert_eq!(changes[1].new_quantity, 40);
        assert_eq!(store.head().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unchanged_quantity_still_appends() {
        let store = store().await;
        store.upsert(&Mutation::new("Paris", "Gadget-002", 20)).await.unwrap();
        store.upsert(&Mutation::new("Paris", "Gadget-002", 20)).await.unwrap();

        let changes = store.read_changes(0, 10).await.unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].previous_quantity, Some(20));
        assert_eq!(changes[1].new_quantity, 20);
    }

    #[tokio::test]
    async fn test_blank_identifiers_consume_no_sequence() {
        let store = store().await;

        let err = store.upsert(&Mutation::new("", "Widget-001", 5)).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidInput { ref field, .. } if field == "store"));

        let err = store.upsert(&Mutation::new("Berlin", "", 5)).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidInput { ref field, .. } if field == "item"));

        assert_eq!(store.head().await.unwrap(), 0);
        assert!(store.list(None).await.unwrap().is_empty());

        let record = store.upsert(&Mutation::new("Berlin", "Widget-001", 5)).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(store.read_changes(0, 10).await.unwrap()[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_version_conflict_consumes_no_sequence() {
        let store = store().await;
        store.upsert(&Mutation::new("Berlin", "Widget-001", 100)).await.unwrap();

        let stale = Mutation::new("Berlin", "Widget-001", 10).with_expected_version(0);
        let err = store.upsert(&stale).await.unwrap_err();
        assert!(matches!(
            err,
            InventoryError::VersionConflict { expected: 0, actual: 1, .. }
        ));

        store.upsert(&Mutation::new("Berlin", "Widget-001", 90)).await.unwrap();
        let sequences: Vec<u64> = store
            .read_changes(0, 10)
            .await
            .unwrap()
            .iter()
            .map(|c| c.sequence)
            .collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = store().await;
        let err = store
            .get(&StoreId::from("Tokyo"), &ItemId::from("Nothing"))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_is_ordered_and_filterable() {
        let store = store().await;
        store.upsert(&Mutation::new("Paris", "Widget-001", 5)).await.unwrap();
        store.upsert(&Mutation::new("Berlin", "Widget-002", 5)).await.unwrap();
        store.upsert(&Mutation::new("Berlin", "Gadget-001", 5)).await.unwrap();

        let all = store.list(None).await.unwrap();
        let keys: Vec<String> = all.iter().map(|r| r.key().to_string()).collect();
        assert_eq!(keys, vec!["Berlin/Gadget-001", "Berlin/Widget-002", "Paris/Widget-001"]);

        let berlin = store.list(Some(&StoreId::from("Berlin"))).await.unwrap();
        assert_eq!(berlin.len(), 2);

        let tokyo = store.list(Some(&StoreId::from("Tokyo"))).await.unwrap();
        assert!(tokyo.is_empty());
    }

    #[tokio::test]
    async fn test_read_changes_respects_after_and_limit() {
        let store = store().await;
        for qty in [10, 20, 30, 40, 50] {
            store.upsert(&Mutation::new("Berlin", "Widget-001", qty)).await.unwrap();
        }

        let page = store.read_changes(2, 2).await.unwrap();
        assert_eq!(page.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![3, 4]);
        assert!(store.read_changes(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_head_sees_commits() {
        let store = store().await;
        let mut head = store.subscribe_head();
        assert_eq!(*head.borrow(), 0);

        store.upsert(&Mutation::new("Berlin", "Widget-001", 10)).await.unwrap();
        head.changed().await.unwrap();
        assert_eq!(*head.borrow_and_update(), 1);
    }
}
