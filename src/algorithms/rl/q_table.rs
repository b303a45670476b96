//! Concurrent action-value table for the tabular agent.
//!
//! Rows are spread across a fixed number of shards, each guarded by its own
//! `RwLock`, so learners working on different states rarely contend. Row
//! values are atomics: a reader never observes a half-written entry, and two
//! writers racing on the same `(state, action)` pair resolve last-write-wins
//! without touching the map structure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::error::{RLError, Result};
use super::observation::StateKey;

const SHARDS: usize = 16;

type Row = Arc<[AtomicU64]>;

fn zero_row(width: usize) -> Row {
    (0..width).map(|_| AtomicU64::new(0.0f64.to_bits())).collect()
}

fn load(cell: &AtomicU64) -> f64 {
    f64::from_bits(cell.load(Ordering::Acquire))
}

/// Sharded map from [`StateKey`] to one value per action.
///
/// Unknown states read as all-zero rows and are materialized on first write.
pub struct QTable {
    shards: Box<[RwLock<FxHashMap<StateKey, Row>>]>,
    action_count: usize,
}

impl QTable {
    pub fn new(action_count: usize) -> Self {
        let shards = (0..SHARDS)
            .map(|_| RwLock::new(FxHashMap::default()))
            .collect();
        Self {
            shards,
            action_count,
        }
    }

    pub fn action_count(&self) -> usize {
        self.action_count
    }

    fn shard(&self, key: StateKey) -> &RwLock<FxHashMap<StateKey, Row>> {
        // FxHash mixes into the high bits.
        &self.shards[(key.0 >> 58) as usize % SHARDS]
    }

    fn existing_row(&self, key: StateKey) -> Option<Row> {
        self.shard(key).read().get(&key).cloned()
    }

    fn row_or_insert(&self, key: StateKey) -> Row {
        if let Some(row) = self.existing_row(key) {
            return row;
        }
        let mut shard = self.shard(key).write();
        shard
            .entry(key)
            .or_insert_with(|| zero_row(self.action_count))
            .clone()
    }

    /// Current values for every action of `key` (zeros if never written).
    pub fn values(&self, key: StateKey) -> Vec<f64> {
        match self.existing_row(key) {
            Some(row) => row.iter().map(load).collect(),
            None => vec![0.0; self.action_count],
        }
    }

    pub fn get(&self, key: StateKey, action: usize) -> f64 {
        self.existing_row(key)
            .and_then(|row| row.get(action).map(load))
            .unwrap_or(0.0)
    }

    /// Largest action value of `key`; 0 for unknown states.
    pub fn max_value(&self, key: StateKey) -> f64 {
        if self.action_count == 0 {
            return 0.0;
        }
        self.values(key)
            .into_iter()
            .fold(f64::NEG_INFINITY, f64::max)
    }

    /// Overwrites a single entry, materializing the row if needed.
    pub fn set(&self, key: StateKey, action: usize, value: f64) -> Result<()> {
        if action >= self.action_count {
            return Err(RLError::InvalidInput(format!(
                "action ordinal {action} outside 0..{}",
                self.action_count
            )));
        }
        let row = self.row_or_insert(key);
        row[action].store(value.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Number of materialized rows.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    /// Snapshot of every row, ordered by key.
    pub fn export(&self) -> Vec<(StateKey, Vec<f64>)> {
        let mut rows: Vec<(StateKey, Vec<f64>)> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .map(|(k, row)| (*k, row.iter().map(load).collect()))
                    .collect::<Vec<_>>()
            })
            .collect();
        rows.sort_unstable_by_key(|(k, _)| *k);
        rows
    }

    /// Replaces the table contents with `rows`.
    ///
    /// Rows are checked before anything is replaced, so a rejected import
    /// leaves the table untouched.
    pub fn import(&self, rows: Vec<(StateKey, Vec<f64>)>) -> Result<()> {
        for (key, values) in &rows {
            if values.len() != self.action_count {
                return Err(RLError::InvalidInput(format!(
                    "row {:#x} has {} values, expected {}",
                    key.0,
                    values.len(),
                    self.action_count
                )));
            }
            if let Some(v) = values.iter().find(|v| !v.is_finite()) {
                return Err(RLError::InvalidInput(format!(
                    "row {:#x} holds non-finite value {v}",
                    key.0
                )));
            }
        }
        self.clear();
        for (key, values) in rows {
            let row: Row = values
                .into_iter()
                .map(|v| AtomicU64::new(v.to_bits()))
                .collect();
            self.shard(key).write().insert(key, row);
        }
        Ok(())
    }
}

impl std::fmt::Debug for QTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QTable")
            .field("rows", &self.len())
            .field("action_count", &self.action_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn unknown_state_reads_zero() {
        let table = QTable::new(3);
        assert_eq!(table.values(StateKey(7)), vec![0.0; 3]);
        assert_eq!(table.max_value(StateKey(7)), 0.0);
        assert!(table.is_empty());
    }

    #[test]
    fn set_materializes_row() {
        let table = QTable::new(2);
        table.set(StateKey(1), 1, -0.5).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.values(StateKey(1)), vec![0.0, -0.5]);
        assert_eq!(table.max_value(StateKey(1)), 0.0);
        assert!(table.set(StateKey(1), 2, 1.0).is_err());
    }

    #[test]
    fn import_replaces_contents() {
        let table = QTable::new(2);
        table.set(StateKey(9), 0, 1.0).unwrap();
        table
            .import(vec![(StateKey(1), vec![1.0, 2.0]), (StateKey(2), vec![3.0, 4.0])])
            .unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(StateKey(9), 0), 0.0);
        assert_eq!(table.export()[1], (StateKey(2), vec![3.0, 4.0]));
    }

    #[test]
    fn import_rejects_bad_rows_without_side_effects() {
        let table = QTable::new(2);
        table.set(StateKey(9), 0, 1.0).unwrap();
        assert!(table.import(vec![(StateKey(1), vec![1.0])]).is_err());
        assert!(table.import(vec![(StateKey(1), vec![1.0, f64::NAN])]).is_err());
        assert_eq!(table.get(StateKey(9), 0), 1.0);
    }

    #[test]
    fn concurrent_writers_keep_structure_intact() {
        let table = Arc::new(QTable::new(4));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = StateKey(i.wrapping_mul(0x9E37_79B9_7F4A_7C15));
                        table.set(key, (t % 4) as usize, t as f64).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(table.len(), 500);
        for (_, row) in table.export() {
            assert_eq!(row.len(), 4);
            assert!(row.iter().all(|v| v.is_finite()));
        }
    }
}
