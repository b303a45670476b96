//! Prioritized experience replay over a [`SumTree`].
//!
//! Storage is an arena of `capacity` slots overwritten in ring order. Each
//! slot carries a generation number that changes on every overwrite; a
//! [`SampleIndex`] remembers the generation it was drawn with, so priority
//! updates that arrive after the slot was recycled are dropped instead of
//! landing on an unrelated experience.
//!
//! Lock order is always slot lock, then the sum-tree writer lock. `add`
//! holds the slot's write lock while it stores the experience and its
//! priority, and `update_priorities` holds the slot's read lock while it
//! checks the generation and writes the new priority, so the two never
//! interleave on the same slot.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use super::sum_tree::SumTree;
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::types::{Action, Experience};

/// Redraws allowed before falling back to a linear scan.
const MAX_REDRAWS: usize = 8;

/// Priority-transform and annealing parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayParams {
    pub capacity: usize,
    /// Priority exponent α.
    pub alpha: f64,
    /// Priority floor ε.
    pub epsilon: f64,
    pub beta_start: f64,
    pub beta_increment: f64,
}

impl ReplayParams {
    pub fn from_config(config: &RLConfig) -> Self {
        Self {
            capacity: config.experience_buffer_size,
            alpha: config.per_alpha,
            epsilon: config.per_epsilon,
            beta_start: config.per_beta_start,
            beta_increment: config.per_beta_increment,
        }
    }
}

/// Position of a sampled entry plus the generation it was sampled at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleIndex {
    pub slot: usize,
    pub generation: u64,
}

/// A batch drawn by [`PrioritizedReplayBuffer::sample_batch`].
#[derive(Debug, Clone)]
pub struct SampledBatch<A> {
    pub experiences: Vec<Experience<A>>,
    pub indices: Vec<SampleIndex>,
    /// Importance-sampling weights, normalized so the largest is 1.
    pub weights: Vec<f64>,
    /// β used for this batch.
    pub beta: f64,
}

impl<A> SampledBatch<A> {
    pub fn len(&self) -> usize {
        self.experiences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experiences.is_empty()
    }
}

/// Read-only view of buffer occupancy for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReplayStats {
    pub len: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_priority: f64,
    pub max_priority: f64,
    pub beta: f64,
}

struct Slot<A> {
    experience: Experience<A>,
    generation: u64,
}

/// Fixed-capacity replay buffer with proportional prioritized sampling.
///
/// New experiences enter with the largest priority seen so far (1.0 while
/// nothing has been prioritized), so each is likely to be replayed at least
/// once before its TD-error is known.
pub struct PrioritizedReplayBuffer<A> {
    params: ReplayParams,
    tree: SumTree,
    slots: Box<[RwLock<Option<Slot<A>>>]>,
    /// Next slot to write; the mutex also serializes inserts against shutdown.
    cursor: Mutex<usize>,
    len: AtomicUsize,
    generation: AtomicU64,
    max_priority: AtomicU64,
    batches_sampled: AtomicU64,
    shut_down: AtomicBool,
    rng: Mutex<StdRng>,
}

impl<A: Action> PrioritizedReplayBuffer<A> {
    pub fn new(params: ReplayParams, seed: Option<u64>) -> Result<Self> {
        if !(params.epsilon > 0.0) || !params.epsilon.is_finite() {
            return Err(RLError::InvalidConfig(
                "replay priority floor must be positive".into(),
            ));
        }
        if !(params.alpha >= 0.0) {
            return Err(RLError::InvalidConfig("replay alpha must be >= 0".into()));
        }
        let tree = SumTree::new(params.capacity)?;
        let slots = (0..params.capacity).map(|_| RwLock::new(None)).collect();
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            params,
            tree,
            slots,
            cursor: Mutex::new(0),
            len: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            max_priority: AtomicU64::new(1.0f64.to_bits()),
            batches_sampled: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            rng: Mutex::new(rng),
        })
    }

    pub fn from_config(config: &RLConfig) -> Result<Self> {
        Self::new(ReplayParams::from_config(config), config.seed)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.params.capacity
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Current β: `min(1, β_start + batches_sampled · β_increment)`.
    pub fn beta(&self) -> f64 {
        let steps = self.batches_sampled.load(Ordering::Acquire) as f64;
        (self.params.beta_start + steps * self.params.beta_increment).min(1.0)
    }

    pub fn max_priority(&self) -> f64 {
        f64::from_bits(self.max_priority.load(Ordering::Acquire))
    }

    fn raise_max_priority(&self, priority: f64) {
        let _ = self
            .max_priority
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                (priority > f64::from_bits(bits)).then_some(priority.to_bits())
            });
    }

    /// Maps a TD-error to a priority: `(|td| + ε)^α`.
    pub fn priority_for(&self, td_error: f64) -> f64 {
        (td_error.abs() + self.params.epsilon).powf(self.params.alpha)
    }

    /// Inserts `experience` at the next ring slot, evicting the oldest entry
    /// once the buffer is full. Returns the slot written.
    ///
    /// `priority` is used as-is when given; otherwise the entry takes the
    /// current maximum priority.
    ///
    /// # Errors
    ///
    /// [`RLError::Shutdown`] after [`PrioritizedReplayBuffer::shutdown`];
    /// [`RLError::InvalidInput`] for a non-positive or non-finite priority.
    pub fn add(&self, experience: Experience<A>, priority: Option<f64>) -> Result<usize> {
        let priority = match priority {
            Some(p) if p.is_finite() && p > 0.0 => p,
            Some(p) => {
                return Err(RLError::InvalidInput(format!(
                    "replay priority must be positive and finite, got {p}"
                )))
            }
            None => self.max_priority(),
        };

        let mut cursor = self.cursor.lock();
        if self.is_shut_down() {
            return Err(RLError::Shutdown);
        }
        let slot = *cursor;
        *cursor = (slot + 1) % self.params.capacity;

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut guard = self.slots[slot].write();
            let was_empty = guard.is_none();
            *guard = Some(Slot {
                experience,
                generation,
            });
            self.tree.set(slot, priority)?;
            if was_empty {
                self.len.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.raise_max_priority(priority);
        Ok(slot)
    }

    /// Draws `n` distinct entries with probability proportional to priority.
    ///
    /// Each draw removes the chosen leaf's mass from the remaining descent,
    /// so a batch never repeats a slot. Every call advances β by one
    /// increment.
    ///
    /// # Errors
    ///
    /// [`RLError::InsufficientData`] when fewer than `n` entries are stored
    /// (including the empty buffer); [`RLError::Shutdown`] after shutdown.
    pub fn sample_batch(&self, n: usize) -> Result<SampledBatch<A>> {
        if self.is_shut_down() {
            return Err(RLError::Shutdown);
        }
        let available = self.len();
        if n == 0 || n > available {
            return Err(RLError::InsufficientData {
                requested: n,
                available,
            });
        }

        let beta = self.beta();
        self.batches_sampled.fetch_add(1, Ordering::AcqRel);

        let mut picked: Vec<(usize, f64)> = Vec::with_capacity(n);
        {
            let mut rng = self.rng.lock();
            for _ in 0..n {
                let excluded_mass: f64 = picked.iter().map(|&(_, p)| p).sum();
                let remaining = (self.tree.total() - excluded_mass).max(0.0);
                let mut leaf = None;
                for _ in 0..MAX_REDRAWS {
                    let u = rng.gen::<f64>() * remaining;
                    leaf = self.tree.find(u, &picked);
                    if leaf.is_some() {
                        break;
                    }
                }
                let leaf = match leaf {
                    Some(leaf) => leaf,
                    None => {
                        let u = rng.gen::<f64>() * remaining;
                        self.tree.find_linear(u, &picked).ok_or_else(|| {
                            RLError::ConcurrencyViolation(format!(
                                "no sampleable leaf among {available} stored entries"
                            ))
                        })?
                    }
                };
                picked.push((leaf, self.tree.get(leaf)));
            }
        }

        let total = self.tree.total();
        let stored = self.len() as f64;
        let mut experiences = Vec::with_capacity(n);
        let mut indices = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        for &(slot, priority) in &picked {
            let guard = self.slots[slot].read();
            let entry = guard.as_ref().ok_or_else(|| {
                RLError::ConcurrencyViolation(format!("sampled empty replay slot {slot}"))
            })?;
            experiences.push(entry.experience.clone());
            indices.push(SampleIndex {
                slot,
                generation: entry.generation,
            });
            let probability = priority / total;
            weights.push((stored * probability).powf(-beta));
        }
        let max_weight = weights.iter().copied().fold(0.0, f64::max);
        if max_weight > 0.0 && max_weight.is_finite() {
            for w in &mut weights {
                *w /= max_weight;
            }
        }

        Ok(SampledBatch {
            experiences,
            indices,
            weights,
            beta,
        })
    }

    /// Sets `priority = (|td| + ε)^α` for each sampled index.
    ///
    /// Indices whose slot has been overwritten since sampling are skipped.
    /// Returns the number of priorities applied.
    pub fn update_priorities(&self, indices: &[SampleIndex], td_errors: &[f64]) -> Result<usize> {
        if self.is_shut_down() {
            return Err(RLError::Shutdown);
        }
        if indices.len() != td_errors.len() {
            return Err(RLError::InvalidInput(format!(
                "{} indices but {} TD-errors",
                indices.len(),
                td_errors.len()
            )));
        }
        if let Some(td) = td_errors.iter().find(|td| !td.is_finite()) {
            return Err(RLError::non_finite("TD-error", *td));
        }

        let mut applied = 0;
        for (index, &td) in indices.iter().zip(td_errors) {
            let Some(lock) = self.slots.get(index.slot) else {
                return Err(RLError::InvalidInput(format!(
                    "replay slot {} outside capacity {}",
                    index.slot, self.params.capacity
                )));
            };
            let guard = lock.read();
            match guard.as_ref() {
                Some(entry) if entry.generation == index.generation => {
                    let priority = self.priority_for(td);
                    self.tree.set(index.slot, priority)?;
                    self.raise_max_priority(priority);
                    applied += 1;
                }
                _ => {}
            }
        }
        Ok(applied)
    }

    /// Returns the experience at `index` if the slot still holds the sampled generation.
    pub fn get(&self, index: SampleIndex) -> Option<Experience<A>> {
        let guard = self.slots.get(index.slot)?.read();
        guard
            .as_ref()
            .filter(|entry| entry.generation == index.generation)
            .map(|entry| entry.experience.clone())
    }

    /// Copies out every stored experience in slot order.
    pub fn snapshot(&self) -> Vec<Experience<A>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.read().as_ref().map(|e| e.experience.clone()))
            .collect()
    }

    pub fn stats(&self) -> ReplayStats {
        let len = self.len();
        ReplayStats {
            len,
            capacity: self.params.capacity,
            utilization: len as f64 / self.params.capacity as f64,
            total_priority: self.tree.total(),
            max_priority: self.max_priority(),
            beta: self.beta(),
        }
    }

    /// Checks the sum-tree sums and that exactly the occupied slots carry
    /// positive priority.
    ///
    /// # Errors
    ///
    /// [`RLError::ConcurrencyViolation`] if either check fails.
    pub fn verify(&self) -> Result<()> {
        let _cursor = self.cursor.lock();
        self.tree.verify()?;
        let mut occupied = 0;
        for (slot, lock) in self.slots.iter().enumerate() {
            let filled = lock.read().is_some();
            let positive = self.tree.get(slot) > 0.0;
            if filled != positive {
                return Err(RLError::ConcurrencyViolation(format!(
                    "replay slot {slot}: occupied={filled} but priority={}",
                    self.tree.get(slot)
                )));
            }
            occupied += filled as usize;
        }
        let len = self.len();
        if occupied != len {
            return Err(RLError::ConcurrencyViolation(format!(
                "replay length {len} but {occupied} occupied slots"
            )));
        }
        Ok(())
    }

    /// Drops every entry and resets priorities.
    pub fn clear(&self) {
        let mut cursor = self.cursor.lock();
        for slot in self.slots.iter() {
            *slot.write() = None;
        }
        self.tree.clear();
        self.len.store(0, Ordering::Release);
        self.max_priority.store(1.0f64.to_bits(), Ordering::Release);
        *cursor = 0;
    }

    /// Stops accepting operations. Idempotent.
    ///
    /// Waits for an in-flight insert to finish its sum-tree write before the
    /// flag is raised.
    pub fn shutdown(&self) {
        let _cursor = self.cursor.lock();
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(len = self.len(), "replay buffer shut down");
        }
    }
}

impl<A> std::fmt::Debug for PrioritizedReplayBuffer<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritizedReplayBuffer")
            .field("params", &self.params)
            .field("len", &self.len.load(Ordering::Relaxed))
            .field("tree", &self.tree)
            .finish()
    }
}
