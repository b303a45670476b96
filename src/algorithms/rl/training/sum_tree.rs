//! Fixed-capacity sum-tree over non-negative priorities.
//!
//! Layout: a complete binary tree stored in a flat array with the root at
//! index 1 and leaf `i` at `base + i`, where `base` is the capacity rounded up
//! to a power of two. Padding leaves stay at zero.
//!
//! Every node is an `AtomicU64` holding `f64` bits. Writers serialize on a
//! single mutex while they set a leaf and recompute the sums on its path to
//! the root; readers descend without locking and treat a transiently
//! inconsistent path as a miss.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::algorithms::rl::error::{RLError, Result};

/// Relative tolerance used when checking that parents equal the sum of their children.
const SUM_TOLERANCE: f64 = 1e-9;

pub struct SumTree {
    capacity: usize,
    base: usize,
    depth: u32,
    nodes: Box<[AtomicU64]>,
    write: Mutex<()>,
}

impl SumTree {
    /// Creates a tree with `capacity` leaves, all at priority zero.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(RLError::InvalidConfig(
                "sum-tree capacity must be positive".into(),
            ));
        }
        let base = capacity.next_power_of_two();
        let nodes = (0..2 * base).map(|_| AtomicU64::new(0)).collect();
        Ok(Self {
            capacity,
            base,
            depth: base.trailing_zeros(),
            nodes,
            write: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn load(&self, node: usize) -> f64 {
        f64::from_bits(self.nodes[node].load(Ordering::Acquire))
    }

    fn store(&self, node: usize, value: f64) {
        self.nodes[node].store(value.to_bits(), Ordering::Release);
    }

    /// Sum of all leaf priorities.
    pub fn total(&self) -> f64 {
        self.load(1)
    }

    /// Priority stored at `leaf` (0 when out of range).
    pub fn get(&self, leaf: usize) -> f64 {
        if leaf >= self.capacity {
            return 0.0;
        }
        self.load(self.base + leaf)
    }

    /// Sets the priority of `leaf` and refreshes every ancestor.
    ///
    /// Parents are recomputed from their children rather than adjusted by a
    /// delta, so rounding error does not accumulate across updates.
    pub fn set(&self, leaf: usize, priority: f64) -> Result<()> {
        if leaf >= self.capacity {
            return Err(RLError::InvalidInput(format!(
                "leaf {leaf} outside capacity {}",
                self.capacity
            )));
        }
        if !priority.is_finite() || priority < 0.0 {
            return Err(RLError::InvalidInput(format!(
                "priority must be finite and non-negative, got {priority}"
            )));
        }
        let _guard = self.write.lock();
        let mut node = self.base + leaf;
        self.store(node, priority);
        while node > 1 {
            node /= 2;
            let sum = self.load(2 * node) + self.load(2 * node + 1);
            self.store(node, sum);
        }
        Ok(())
    }

    /// Zeroes every node.
    pub fn clear(&self) {
        let _guard = self.write.lock();
        for node in self.nodes.iter() {
            node.store(0, Ordering::Release);
        }
    }

    /// Locates the leaf whose cumulative priority range contains `value`.
    ///
    /// `excluded` lists `(leaf, priority)` pairs that are treated as absent;
    /// their priorities are subtracted from every subtree on the way down, so
    /// `value` must be drawn from `[0, total - Σ excluded)`.
    ///
    /// Returns `None` when the descent lands on an empty, padding or excluded
    /// leaf, which can only happen through rounding at range edges or a
    /// concurrent write. Callers redraw or fall back to [`SumTree::find_linear`].
    pub fn find(&self, value: f64, excluded: &[(usize, f64)]) -> Option<usize> {
        let mut value = value;
        let mut node = 1usize;
        let mut shift = self.depth;
        while node < self.base {
            shift -= 1;
            let left = 2 * node;
            let mut left_sum = self.load(left);
            for &(leaf, p) in excluded {
                if (self.base + leaf) >> shift == left {
                    left_sum -= p;
                }
            }
            if value < left_sum {
                node = left;
            } else {
                value -= left_sum;
                node = left + 1;
            }
        }
        let leaf = node - self.base;
        let usable = leaf < self.capacity
            && self.load(node) > 0.0
            && !excluded.iter().any(|&(l, _)| l == leaf);
        usable.then_some(leaf)
    }

    /// O(capacity) scan equivalent to [`SumTree::find`]. Always returns an
    /// eligible leaf if one with positive priority exists.
    pub fn find_linear(&self, value: f64, excluded: &[(usize, f64)]) -> Option<usize> {
        let mut acc = 0.0;
        let mut last = None;
        for leaf in 0..self.capacity {
            if excluded.iter().any(|&(l, _)| l == leaf) {
                continue;
            }
            let p = self.get(leaf);
            if p <= 0.0 {
                continue;
            }
            acc += p;
            last = Some(leaf);
            if value < acc {
                return last;
            }
        }
        last
    }

    /// Sum of the leaves computed directly, bypassing the internal nodes.
    pub fn leaf_sum(&self) -> f64 {
        (0..self.capacity).map(|leaf| self.get(leaf)).sum()
    }

    /// Checks that every internal node equals the sum of its children.
    ///
    /// Takes the writer lock, so the check never observes a half-propagated
    /// update.
    ///
    /// # Errors
    ///
    /// [`RLError::ConcurrencyViolation`] naming the first inconsistent node.
    pub fn verify(&self) -> Result<()> {
        let _guard = self.write.lock();
        for node in (1..self.base).rev() {
            let stored = self.load(node);
            let expected = self.load(2 * node) + self.load(2 * node + 1);
            if (stored - expected).abs() > SUM_TOLERANCE * expected.abs().max(1.0) {
                return Err(RLError::ConcurrencyViolation(format!(
                    "sum-tree node {node} holds {stored}, children sum to {expected}"
                )));
            }
        }
        let leaves = self.leaf_sum();
        let root = self.total();
        if (root - leaves).abs() > SUM_TOLERANCE * leaves.abs().max(1.0) * self.depth.max(1) as f64 {
            return Err(RLError::ConcurrencyViolation(format!(
                "sum-tree root {root} differs from leaf sum {leaves}"
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    fn corrupt(&self, node: usize, value: f64) {
        self.store(node, value);
    }
}

impl std::fmt::Debug for SumTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SumTree")
            .field("capacity", &self.capacity)
            .field("total", &self.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(SumTree::new(0).is_err());
    }

    #[test]
    fn total_tracks_updates() {
        let tree = SumTree::new(5).unwrap();
        tree.set(0, 1.0).unwrap();
        tree.set(4, 2.5).unwrap();
        tree.set(0, 0.5).unwrap();
        assert!((tree.total() - 3.0).abs() < 1e-12);
        assert!(tree.verify().is_ok());
    }

    #[test]
    fn rejects_negative_and_nan() {
        let tree = SumTree::new(2).unwrap();
        assert!(tree.set(0, -1.0).is_err());
        assert!(tree.set(0, f64::NAN).is_err());
        assert!(tree.set(2, 1.0).is_err());
    }

    #[test]
    fn find_walks_cumulative_ranges() {
        let tree = SumTree::new(4).unwrap();
        for (i, p) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            tree.set(i, p).unwrap();
        }
        assert_eq!(tree.find(0.5, &[]), Some(0));
        assert_eq!(tree.find(1.5, &[]), Some(1));
        assert_eq!(tree.find(3.0, &[]), Some(2));
        assert_eq!(tree.find(9.99, &[]), Some(3));
    }

    #[test]
    fn find_skips_excluded_leaves() {
        let tree = SumTree::new(4).unwrap();
        for (i, p) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
            tree.set(i, p).unwrap();
        }
        // Without leaf 1 the ranges are [0,1) [1,4) [4,8).
        let excluded = [(1, 2.0)];
        assert_eq!(tree.find(0.5, &excluded), Some(0));
        assert_eq!(tree.find(1.5, &excluded), Some(2));
        assert_eq!(tree.find(5.0, &excluded), Some(3));
        assert_eq!(tree.find_linear(1.5, &excluded), Some(2));
    }

    #[test]
    fn verify_detects_corruption() {
        let tree = SumTree::new(4).unwrap();
        tree.set(2, 1.0).unwrap();
        tree.corrupt(1, 42.0);
        assert!(matches!(
            tree.verify(),
            Err(RLError::ConcurrencyViolation(_))
        ));
    }

    #[test]
    fn concurrent_writers_preserve_root() {
        let tree = Arc::new(SumTree::new(64).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let tree = Arc::clone(&tree);
                thread::spawn(move || {
                    for i in 0..1_000usize {
                        tree.set((i * 7 + t) % 64, (i % 13) as f64 + 0.5).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(tree.verify().is_ok());
        assert!((tree.total() - tree.leaf_sum()).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn root_equals_leaf_sum(
            capacity in 1usize..40,
            writes in prop::collection::vec((0usize..40, 0.0f64..100.0), 0..200),
        ) {
            let tree = SumTree::new(capacity).unwrap();
            for (leaf, p) in writes {
                tree.set(leaf % capacity, p).unwrap();
            }
            prop_assert!((tree.total() - tree.leaf_sum()).abs() <= 1e-9 * tree.leaf_sum().max(1.0));
            prop_assert!(tree.verify().is_ok());
        }

        #[test]
        fn find_returns_positive_leaf(
            priorities in prop::collection::vec(0.01f64..10.0, 1..32),
            u in 0.0f64..1.0,
        ) {
            let tree = SumTree::new(priorities.len()).unwrap();
            for (i, p) in priorities.iter().enumerate() {
                tree.set(i, *p).unwrap();
            }
            let value = u * tree.total();
            let leaf = tree.find(value, &[]).or_else(|| tree.find_linear(value, &[]));
            prop_assert!(leaf.is_some());
            prop_assert!(tree.get(leaf.unwrap()) > 0.0);
        }
    }
}
