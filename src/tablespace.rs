//! Table-id → engine handle mapping.
//!
//! A sparse vector of handles, grown with slack (`GROWTH_SLACK`) rather
//! than exactly to `table_id + 1`, so that opening nearby table-ids in
//! sequence doesn't reallocate every time. A slot only ever moves empty →
//! present → empty, never through a partially-constructed state — callers
//! still go through `&RwLock` here because readers run on different tasks
//! than the admin task that mutates slots, but no slot is ever observed
//! half-built.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::admin::AdminHandle;
use crate::engine::KVEngine;
use crate::merge_ops::MergeOperator;
use crate::protocol::header::STATUS_DB_ERROR;

const GROWTH_SLACK: usize = 16;

#[derive(Clone)]
pub struct TableSlot {
    pub engine: Arc<dyn KVEngine>,
    pub merge_operator: MergeOperator,
}

/// Mapping from table-id to engine handle. Invariant (spec.md section 3):
/// a table-id is either open (slot is `Some`) or absent (`None`); never
/// partially constructed.
#[derive(Default)]
pub struct Tablespace {
    slots: RwLock<Vec<Option<TableSlot>>>,
}

impl Tablespace {
    pub fn new() -> Self {
        Tablespace::default()
    }

    /// Grows backing storage so `table_id` has a slot, with exponential-ish
    /// slack (grounds `Tablespace.hpp`'s `reserve(tableIndex + 16)`).
    pub async fn ensure_capacity(&self, table_id: u32) {
        let mut slots = self.slots.write().await;
        let needed = table_id as usize + 1;
        if slots.len() < needed {
            slots.reserve(needed + GROWTH_SLACK - slots.len());
            slots.resize_with(needed, || None);
        }
    }

    pub async fn is_table_open(&self, table_id: u32) -> bool {
        let slots = self.slots.read().await;
        matches!(slots.get(table_id as usize), Some(Some(_)))
    }

    pub async fn get(&self, table_id: u32) -> Option<TableSlot> {
        let slots = self.slots.read().await;
        slots.get(table_id as usize).and_then(|s| s.clone())
    }

    /// Returns the engine handle for `table_id`, requesting an on-the-fly
    /// open via the Table-Admin Server if it isn't already open (spec.md
    /// section 4.2/4.3, `FEATURE_ON_THE_FLY_TABLE_OPEN`). Opens with no
    /// request-supplied options, so the table falls through to its
    /// persisted config file or process defaults.
    pub async fn get_or_open(&self, table_id: u32, admin: &AdminHandle) -> Result<TableSlot, String> {
        if let Some(slot) = self.get(table_id).await {
            return Ok(slot);
        }
        let result = admin.open(table_id, HashMap::new()).await;
        if result.status == STATUS_DB_ERROR {
            return Err(result
                .description
                .unwrap_or_else(|| "failed to open table".to_string()));
        }
        self.get(table_id)
            .await
            .ok_or_else(|| "table open reported success but slot is still missing".to_string())
    }

    /// Installs a freshly opened handle. Idempotent: if the slot is already
    /// occupied, the existing handle is kept and `false` is returned
    /// (mirrors `tableOpenWorkerThread`'s "already open" no-op reply).
    pub async fn insert(&self, table_id: u32, slot: TableSlot) -> bool {
        self.ensure_capacity(table_id).await;
        let mut slots = self.slots.write().await;
        let entry = &mut slots[table_id as usize];
        if entry.is_some() {
            return false;
        }
        *entry = Some(slot);
        true
    }

    /// Removes a handle if present. Returns `true` if a handle was actually
    /// removed (idempotent close).
    pub async fn remove(&self, table_id: u32) -> Option<TableSlot> {
        let mut slots = self.slots.write().await;
        match slots.get_mut(table_id as usize) {
            Some(slot @ Some(_)) => slot.take(),
            _ => None,
        }
    }

    /// True unless the table's merge operator is the trivial replace
    /// operator (spec.md 4.2): update workers use this to choose Put vs
    /// Merge. Closed/non-existent tables are treated as not merge-required.
    pub async fn is_merge_required(&self, table_id: u32) -> bool {
        self.get(table_id)
            .await
            .map(|slot| !slot.merge_operator.is_replace())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineFactory, MemEngine, MemEngineFactory};

    fn test_admin(tablespace: Arc<Tablespace>) -> AdminHandle {
        let factory: Arc<dyn EngineFactory> = Arc::new(MemEngineFactory);
        crate::admin::spawn(
            tablespace,
            factory,
            std::env::temp_dir().join(format!("tablespace-test-{}", std::process::id())),
            crate::config::ServerConfig::default().default_table_options,
        )
    }

    fn slot() -> TableSlot {
        TableSlot {
            engine: Arc::new(MemEngine::new()),
            merge_operator: MergeOperator::Replace,
        }
    }

    #[tokio::test]
    async fn a_table_id_is_either_open_or_absent() {
        let ts = Tablespace::new();
        assert!(!ts.is_table_open(3).await);
        assert!(ts.insert(3, slot()).await);
        assert!(ts.is_table_open(3).await);
        ts.remove(3).await;
        assert!(!ts.is_table_open(3).await);
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let ts = Tablespace::new();
        assert!(ts.insert(1, slot()).await);
        assert!(!ts.insert(1, slot()).await);
    }

    #[tokio::test]
    async fn remove_on_absent_table_is_a_no_op() {
        let ts = Tablespace::new();
        assert!(ts.remove(42).await.is_none());
    }

    #[tokio::test]
    async fn merge_required_reflects_the_tables_operator() {
        let ts = Tablespace::new();
        ts.insert(
            1,
            TableSlot {
                engine: Arc::new(MemEngine::new()),
                merge_operator: MergeOperator::Int64Add,
            },
        )
        .await;
        assert!(ts.is_merge_required(1).await);
        ts.insert(2, slot()).await;
        assert!(!ts.is_merge_required(2).await);
        assert!(!ts.is_merge_required(99).await);
    }

    #[tokio::test]
    async fn get_or_open_opens_an_unopened_table_on_the_fly() {
        let ts = Arc::new(Tablespace::new());
        let admin = test_admin(ts.clone());

        assert!(!ts.is_table_open(5).await);
        let slot = ts.get_or_open(5, &admin).await.unwrap();
        assert!(ts.is_table_open(5).await);
        assert_eq!(slot.engine.get(b"missing").unwrap(), None);
    }

    #[tokio::test]
    async fn get_or_open_returns_the_existing_handle_without_reopening() {
        let ts = Arc::new(Tablespace::new());
        let admin = test_admin(ts.clone());
        ts.insert(7, slot()).await;

        let slot = ts.get_or_open(7, &admin).await.unwrap();
        assert_eq!(slot.merge_operator, MergeOperator::Replace);
    }
}
