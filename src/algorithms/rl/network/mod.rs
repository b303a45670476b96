//! Function approximators used by the DQN and PPO trainers.
//!
//! The trainers only talk to the [`QFunction`] and [`ActorCritic`] traits.
//! With the `rl-nn` feature the `torch` module provides the libtorch
//! implementations used for real training. [`MlpQNetwork`] and
//! [`MlpActorCritic`] are the fallback for builds without libtorch: small
//! dense MLPs on `ndarray`, kept to two hidden layers and plain Adam.

use std::collections::BTreeMap;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::error::{RLError, Result};

pub mod actor_critic;
pub mod mlp;
pub mod q_network;
#[cfg(feature = "rl-nn")]
pub mod torch;

pub use actor_critic::MlpActorCritic;
pub use mlp::{Adam, Gradients, Mlp};
pub use q_network::MlpQNetwork;

/// A named parameter tensor in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl ParamTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self { shape, data }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parameters keyed by layer name, e.g. `"l1.weight"`.
pub type NamedParams = BTreeMap<String, ParamTensor>;

/// An action-value function `Q(s, ·)`.
pub trait QFunction: Send {
    fn state_dim(&self) -> usize;

    fn action_count(&self) -> usize;

    /// Q-values for a batch of states, shape `(batch, action_count)`.
    fn q_values(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// One optimizer step on the importance-weighted squared error
    /// `mean_i w_i · (Q(s_i, a_i) − y_i)² / 2`. Returns the loss before the step.
    ///
    /// # Errors
    ///
    /// [`RLError::NumericalInstability`] if the loss or any gradient is not
    /// finite; the parameters are left unchanged in that case.
    fn fit(
        &mut self,
        states: ArrayView2<'_, f64>,
        actions: &[usize],
        targets: &[f64],
        weights: &[f64],
    ) -> Result<f64>;

    /// Overwrites this network's parameters with `source`'s.
    ///
    /// # Errors
    ///
    /// Fails when the two networks do not share a parameter layout; the
    /// target may then be partially overwritten and must be re-synced.
    fn sync_from(&mut self, source: &Self) -> Result<()>
    where
        Self: Sized;

    fn state_dict(&self) -> Result<NamedParams>;

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()>;
}

/// Inputs to one PPO actor step.
#[derive(Debug, Clone, Copy)]
pub struct PolicyBatch<'a> {
    pub states: ArrayView2<'a, f64>,
    pub actions: &'a [usize],
    pub old_log_probs: &'a [f64],
    pub advantages: &'a [f64],
    pub clip_epsilon: f64,
    pub entropy_coef: f64,
}

impl PolicyBatch<'_> {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Checks that every per-sample slice matches the number of states.
    pub fn validate(&self) -> Result<()> {
        let n = self.states.nrows();
        if self.actions.len() != n || self.old_log_probs.len() != n || self.advantages.len() != n {
            return Err(RLError::InvalidInput(format!(
                "policy batch has {n} states, {} actions, {} log-probs, {} advantages",
                self.actions.len(),
                self.old_log_probs.len(),
                self.advantages.len()
            )));
        }
        Ok(())
    }
}

/// Statistics of one actor step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PolicyStepStats {
    /// Negated mean clipped surrogate minus the entropy bonus.
    pub loss: f64,
    pub entropy: f64,
    /// Fraction of samples whose clipped branch was active.
    pub clip_fraction: f64,
}

/// Separate actor (policy) and critic (state value) networks.
pub trait ActorCritic: Send {
    fn state_dim(&self) -> usize;

    fn action_count(&self) -> usize;

    /// Action probabilities, shape `(batch, action_count)`; rows sum to 1.
    fn action_probs(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>>;

    /// Log-probability of `actions[i]` in `states[i]`.
    fn log_probs(&self, states: ArrayView2<'_, f64>, actions: &[usize]) -> Result<Vec<f64>> {
        let probs = self.action_probs(states)?;
        actions
            .iter()
            .enumerate()
            .map(|(i, &a)| {
                probs
                    .get((i, a))
                    .map(|p| p.max(f64::MIN_POSITIVE).ln())
                    .ok_or_else(|| {
                        RLError::InvalidInput(format!("action ordinal {a} out of range"))
                    })
            })
            .collect()
    }

    /// State values `V(s)`.
    fn values(&self, states: ArrayView2<'_, f64>) -> Result<Vec<f64>>;

    /// One optimizer step maximizing the clipped surrogate plus entropy bonus.
    fn actor_step(&mut self, batch: &PolicyBatch<'_>) -> Result<PolicyStepStats>;

    /// One optimizer step on `mean (V(s_i) − R_i)² / 2`. Returns the loss.
    fn critic_step(&mut self, states: ArrayView2<'_, f64>, returns: &[f64]) -> Result<f64>;

    fn state_dict(&self) -> Result<NamedParams>;

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()>;
}

/// Numerically stable row-wise softmax.
pub fn softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|z| (z - max).exp());
        let sum: f64 = row.sum();
        row.mapv_inplace(|e| e / sum);
    }
    out
}

/// Numerically stable row-wise log-softmax.
pub fn log_softmax_rows(logits: &Array2<f64>) -> Array2<f64> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let log_sum = row.iter().map(|z| (z - max).exp()).sum::<f64>().ln() + max;
        row.mapv_inplace(|z| z - log_sum);
    }
    out
}

/// Index of the largest value; ties go to the first. `None` for an empty slice.
pub fn argmax(values: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &v) in values.iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

/// Turns a single state into a `(1, dim)` matrix.
pub fn single_row(state: &[f64]) -> Result<Array2<f64>> {
    Array2::from_shape_vec((1, state.len()), state.to_vec())
        .map_err(|e| RLError::InvalidInput(e.to_string()))
}
