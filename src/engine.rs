//! The storage engine abstraction.
//!
//! spec.md section 1 names the embedded engine an external collaborator,
//! "treated abstractly as a `KVEngine` with Put/Get/Delete/Merge/Iterator/
//! Snapshot/Compact/Destroy". Everything in this module is that boundary:
//! a trait object the rest of the crate programs against, plus an in-memory
//! implementation used by this crate's own tests (and usable as a starting
//! point for an embedder who hasn't wired in a real LSM engine yet).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::EngineError;
use crate::merge_ops::MergeOperator;

/// One operation in a write batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(Bytes, Bytes),
    Merge(Bytes, Bytes),
    Delete(Bytes),
}

/// An ordered, atomically-committed sequence of operations against one
/// table (spec.md section 3, "Write batch").
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub ops: Vec<WriteOp>,
    /// Fullsync flag: request an fsync to disk as part of this commit.
    pub fullsync: bool,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A read-only point-in-time view, owned by exactly one consumer for its
/// entire lifetime (spec.md section 3, "Snapshot").
pub trait EngineSnapshot: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Bytes>;
    fn iter(&self) -> Box<dyn EngineIterator + '_>;
}

/// A cursor over a snapshot, following the usual RocksDB-style iterator
/// contract: seek, check validity, read key/value, step.
pub trait EngineIterator {
    fn seek(&mut self, key: &[u8]);
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn valid(&self) -> bool;
    fn key(&self) -> Bytes;
    fn value(&self) -> Bytes;
    fn step_next(&mut self);
    fn step_prev(&mut self);
}

/// One open table handle.
pub trait KVEngine: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, EngineError>;

    fn write(&self, batch: WriteBatch, merge_operator: &MergeOperator) -> Result<(), EngineError>;

    fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), EngineError>;

    fn snapshot(&self) -> Result<Arc<dyn EngineSnapshot>, EngineError>;
}

/// Options used to open or reconfigure a table (spec.md section 3, "Table
/// config record"). Sentinel-free: every field has already had process
/// defaults and persisted-file values folded in by `table_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOptions {
    pub lru_cache_size: u64,
    pub table_block_size: u64,
    pub write_buffer_size: u64,
    pub bloom_filter_bits_per_key: u64,
    pub compression: Compression,
    pub merge_operator_code: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
    Zlib,
    Bzip2,
}

/// Opens/destroys engine handles for a given on-disk directory. Kept
/// separate from `KVEngine` itself because opening is an admin-server
/// concern (spec.md 4.3) while the handle is shared with workers.
pub trait EngineFactory: Send + Sync {
    fn open(&self, dir: &Path, options: &TableOptions) -> Result<Arc<dyn KVEngine>, EngineError>;

    /// Deletes all files for a table directory one level deep, then the
    /// directory itself (grounds `TableOpenHelper.cpp`'s truncate routine).
    fn destroy(&self, dir: &Path) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------
// In-memory reference implementation, used by this crate's own tests.
// ---------------------------------------------------------------------

#[derive(Default)]
struct MemTable {
    data: BTreeMap<Bytes, Bytes>,
}

/// An in-memory `KVEngine` backed by a `BTreeMap` behind a mutex.
///
/// Not a production storage engine — there is no persistence, compaction is
/// a no-op, and every snapshot is a full clone of the map. It exists so the
/// rest of this crate (tablespace, workers, jobs, router) can be exercised
/// end to end without depending on an external LSM engine crate.
pub struct MemEngine {
    table: Mutex<MemTable>,
}

impl MemEngine {
    pub fn new() -> Self {
        MemEngine {
            table: Mutex::new(MemTable::default()),
        }
    }
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl KVEngine for MemEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>, EngineError> {
        Ok(self.table.lock().unwrap().data.get(key).cloned())
    }

    fn write(&self, batch: WriteBatch, merge_operator: &MergeOperator) -> Result<(), EngineError> {
        let mut table = self.table.lock().unwrap();
        for op in batch.ops {
            match op {
                WriteOp::Put(k, v) => {
                    table.data.insert(k, v);
                }
                WriteOp::Delete(k) => {
                    table.data.remove(&k);
                }
                WriteOp::Merge(k, operand) => {
                    let existing = table.data.get(&k).cloned();
                    let merged = merge_operator.apply(existing.as_deref(), &operand);
                    table.data.insert(k, merged);
                }
            }
        }
        Ok(())
    }

    fn compact_range(&self, _start: Option<&[u8]>, _end: Option<&[u8]>) -> Result<(), EngineError> {
        Ok(())
    }

    fn snapshot(&self) -> Result<Arc<dyn EngineSnapshot>, EngineError> {
        let table = self.table.lock().unwrap();
        Ok(Arc::new(MemSnapshot {
            data: table.data.clone(),
        }))
    }
}

struct MemSnapshot {
    data: BTreeMap<Bytes, Bytes>,
}

impl EngineSnapshot for MemSnapshot {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn iter(&self) -> Box<dyn EngineIterator + '_> {
        Box::new(MemIterator {
            keys: self.data.keys().cloned().collect(),
            data: &self.data,
            pos: None,
        })
    }
}

struct MemIterator<'a> {
    keys: Vec<Bytes>,
    data: &'a BTreeMap<Bytes, Bytes>,
    /// `None` = before-the-beginning / exhausted. `Some(i)` indexes `keys`.
    pos: Option<usize>,
}

impl<'a> EngineIterator for MemIterator<'a> {
    fn seek(&mut self, key: &[u8]) {
        self.pos = self.keys.iter().position(|k| k.as_ref() >= key);
    }

    fn seek_to_first(&mut self) {
        self.pos = if self.keys.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.keys.len().checked_sub(1);
    }

    fn valid(&self) -> bool {
        matches!(self.pos, Some(i) if i < self.keys.len())
    }

    fn key(&self) -> Bytes {
        self.keys[self.pos.expect("valid() checked before key()")].clone()
    }

    fn value(&self) -> Bytes {
        let key = &self.keys[self.pos.expect("valid() checked before value()")];
        self.data.get(key).cloned().unwrap_or_default()
    }

    fn step_next(&mut self) {
        self.pos = match self.pos {
            Some(i) if i + 1 < self.keys.len() => Some(i + 1),
            _ => None,
        };
    }

    fn step_prev(&mut self) {
        self.pos = match self.pos {
            Some(i) if i > 0 => Some(i - 1),
            _ => None,
        };
    }
}

/// Opens `MemEngine` handles. `dir` is recorded but unused — there is
/// nothing on disk to destroy, `destroy` just succeeds.
pub struct MemEngineFactory;

impl EngineFactory for MemEngineFactory {
    fn open(&self, _dir: &Path, _options: &TableOptions) -> Result<Arc<dyn KVEngine>, EngineError> {
        Ok(Arc::new(MemEngine::new()))
    }

    fn destroy(&self, _dir: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Returns the per-table on-disk directory path, rooted at `data_dir`.
pub fn table_dir(data_dir: &Path, table_id: u32) -> PathBuf {
    data_dir.join(table_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge_ops::MergeOperator;

    #[test]
    fn put_then_get_round_trips() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        batch.ops.push(WriteOp::Put(Bytes::from_static(b"k1"), Bytes::from_static(b"v1")));
        engine.write(batch, &MergeOperator::Replace).unwrap();
        assert_eq!(engine.get(b"k1").unwrap(), Some(Bytes::from_static(b"v1")));
        assert_eq!(engine.get(b"missing").unwrap(), None);
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        batch.ops.push(WriteOp::Put(Bytes::from_static(b"k1"), Bytes::from_static(b"v1")));
        engine.write(batch, &MergeOperator::Replace).unwrap();

        let snapshot = engine.snapshot().unwrap();

        let mut batch2 = WriteBatch::new();
        batch2.ops.push(WriteOp::Put(Bytes::from_static(b"k2"), Bytes::from_static(b"v2")));
        engine.write(batch2, &MergeOperator::Replace).unwrap();

        assert_eq!(snapshot.get(b"k2"), None);
        assert_eq!(snapshot.get(b"k1"), Some(Bytes::from_static(b"v1")));
    }

    #[test]
    fn iterator_walks_in_ascending_key_order() {
        let engine = MemEngine::new();
        let mut batch = WriteBatch::new();
        for (k, v) in [("b", "2"), ("a", "1"), ("c", "3")] {
            batch
                .ops
                .push(WriteOp::Put(Bytes::copy_from_slice(k.as_bytes()), Bytes::copy_from_slice(v.as_bytes())));
        }
        engine.write(batch, &MergeOperator::Replace).unwrap();

        let snapshot = engine.snapshot().unwrap();
        let mut it = snapshot.iter();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((it.key(), it.value()));
            it.step_next();
        }
        assert_eq!(
            seen,
            vec![
                (Bytes::from_static(b"a"), Bytes::from_static(b"1")),
                (Bytes::from_static(b"b"), Bytes::from_static(b"2")),
                (Bytes::from_static(b"c"), Bytes::from_static(b"3")),
            ]
        );
    }
}
