//! Per-episode trajectory storage for PPO.
//!
//! A [`TrajectoryBuffer`] accumulates the steps of one open episode. Closing
//! it runs GAE and yields an immutable [`Trajectory`] that the trainer keeps
//! until the next policy update.

use ndarray::Array2;

use super::gae::compute_gae;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::observation::StateVector;

/// A single step of an episode.
#[derive(Debug, Clone)]
pub struct TrajectoryStep {
    pub state: StateVector,
    /// Action ordinal.
    pub action: usize,
    pub reward: f64,
    pub next_state: StateVector,
    pub done: bool,
    /// Log-probability of `action` under the actor that chose it.
    pub log_prob: f64,
}

/// Steps of the episode currently being played by one agent.
#[derive(Debug, Default)]
pub struct TrajectoryBuffer {
    steps: Vec<TrajectoryStep>,
}

impl TrajectoryBuffer {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn push(&mut self, step: TrajectoryStep) {
        self.steps.push(step);
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn clear(&mut self) {
        self.steps.clear();
    }

    /// True once the last stored step ended the episode.
    pub fn is_terminal(&self) -> bool {
        self.steps.last().is_some_and(|s| s.done)
    }

    pub fn states(&self) -> Result<Array2<f64>> {
        stack(self.steps.iter().map(|s| &s.state))
    }

    pub fn next_states(&self) -> Result<Array2<f64>> {
        stack(self.steps.iter().map(|s| &s.next_state))
    }

    /// Closes the episode and computes advantages and returns.
    ///
    /// `values[t]` and `next_values[t]` are the critic's estimates of
    /// `state` and `next_state` at step `t`. If the last step is not terminal
    /// the episode was cut at the step cap: it is closed as if `done` were
    /// set, so the final transition does not bootstrap.
    pub fn close_episode(
        mut self,
        values: &[f64],
        next_values: &[f64],
        gamma: f64,
        gae_lambda: f64,
    ) -> Result<Trajectory> {
        if self.steps.is_empty() {
            return Err(RLError::InsufficientData {
                requested: 1,
                available: 0,
            });
        }
        let truncated = !self.is_terminal();
        if let Some(last) = self.steps.last_mut() {
            last.done = true;
        }

        let rewards: Vec<f64> = self.steps.iter().map(|s| s.reward).collect();
        let dones: Vec<bool> = self.steps.iter().map(|s| s.done).collect();
        let (advantages, returns) =
            compute_gae(&rewards, values, next_values, &dones, gamma, gae_lambda)?;

        Ok(Trajectory {
            steps: self.steps,
            values: values.to_vec(),
            advantages,
            returns,
            truncated,
        })
    }
}

/// A closed episode with advantages and returns attached.
#[derive(Debug, Clone)]
pub struct Trajectory {
    steps: Vec<TrajectoryStep>,
    values: Vec<f64>,
    advantages: Vec<f64>,
    returns: Vec<f64>,
    truncated: bool,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.steps
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn advantages(&self) -> &[f64] {
        &self.advantages
    }

    pub fn returns(&self) -> &[f64] {
        &self.returns
    }

    /// True if the episode hit the step cap instead of terminating.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn total_reward(&self) -> f64 {
        self.steps.iter().map(|s| s.reward).sum()
    }

    pub fn states(&self) -> Result<Array2<f64>> {
        stack(self.steps.iter().map(|s| &s.state))
    }

    pub fn actions(&self) -> Vec<usize> {
        self.steps.iter().map(|s| s.action).collect()
    }

    pub fn log_probs(&self) -> Vec<f64> {
        self.steps.iter().map(|s| s.log_prob).collect()
    }
}

/// Normalizes advantages to zero mean and unit variance across a whole
/// update batch. Returns one vector per trajectory; the trajectories
/// themselves are left untouched.
pub fn normalized_advantages(trajectories: &[Trajectory]) -> Vec<Vec<f64>> {
    let all: Vec<f64> = trajectories
        .iter()
        .flat_map(|t| t.advantages.iter().copied())
        .collect();
    if all.is_empty() {
        return trajectories.iter().map(|_| Vec::new()).collect();
    }
    let mean: f64 = all.iter().sum::<f64>() / all.len() as f64;
    let var: f64 = all.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / all.len() as f64;
    let std = (var + 1e-8).sqrt();
    trajectories
        .iter()
        .map(|t| t.advantages.iter().map(|a| (a - mean) / std).collect())
        .collect()
}

fn stack<'a>(rows: impl ExactSizeIterator<Item = &'a StateVector>) -> Result<Array2<f64>> {
    let n = rows.len();
    let mut dim = None;
    let mut flat = Vec::new();
    for row in rows {
        let expected = *dim.get_or_insert(row.len());
        if row.len() != expected {
            return Err(RLError::state_length(expected, row.len()));
        }
        flat.extend_from_slice(row.as_slice());
    }
    Array2::from_shape_vec((n, dim.unwrap_or(0)), flat)
        .map_err(|e| RLError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(reward: f64, done: bool) -> TrajectoryStep {
        TrajectoryStep {
            state: StateVector::new(vec![reward, 0.0]),
            action: 0,
            reward,
            next_state: StateVector::new(vec![reward + 1.0, 0.0]),
            done,
            log_prob: -0.5,
        }
    }

    #[test]
    fn buffer_push_and_clear() {
        let mut buf = TrajectoryBuffer::new();
        assert!(buf.is_empty());
        buf.push(step(1.0, false));
        assert_eq!(buf.len(), 1);
        assert!(!buf.is_terminal());
        assert_eq!(buf.states().unwrap().dim(), (1, 2));
        buf.clear();
        assert!(buf.is_empty());
    }

    #[test]
    fn ragged_states_are_rejected() {
        let mut buf = TrajectoryBuffer::new();
        buf.push(step(1.0, false));
        let mut short = step(2.0, true);
        short.state = StateVector::new(vec![2.0]);
        buf.push(short);
        assert!(matches!(buf.states(), Err(RLError::InvalidInput(_))));
        assert_eq!(buf.next_states().unwrap().dim(), (2, 2));
    }

    #[test]
    fn close_single_step_episode() {
        let mut buf = TrajectoryBuffer::new();
        buf.push(step(2.0, true));
        let traj = buf.close_episode(&[0.5], &[10.0], 0.99, 0.95).unwrap();
        assert!(!traj.truncated());
        assert!((traj.advantages()[0] - 1.5).abs() < 1e-12);
        assert!((traj.returns()[0] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn truncated_episode_is_closed_as_terminal() {
        let mut buf = TrajectoryBuffer::new();
        buf.push(step(1.0, false));
        buf.push(step(1.0, false));
        let traj = buf
            .close_episode(&[0.0, 0.0], &[5.0, 5.0], 1.0, 1.0)
            .unwrap();
        assert!(traj.truncated());
        assert!(traj.steps().last().unwrap().done);
        // Final step does not bootstrap from next value 5.0.
        assert!((traj.returns()[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn empty_episode_cannot_close() {
        let buf = TrajectoryBuffer::new();
        assert!(buf.close_episode(&[], &[], 0.99, 0.95).is_err());
    }

    #[test]
    fn normalization_spans_all_trajectories() {
        let mut a = TrajectoryBuffer::new();
        a.push(step(1.0, true));
        let mut b = TrajectoryBuffer::new();
        b.push(step(2.0, false));
        b.push(step(3.0, true));
        let trajs = vec![
            a.close_episode(&[0.0], &[0.0], 0.9, 0.9).unwrap(),
            b.close_episode(&[0.0, 0.0], &[0.0, 0.0], 0.9, 0.9).unwrap(),
        ];
        let norm = normalized_advantages(&trajs);
        let flat: Vec<f64> = norm.iter().flatten().copied().collect();
        assert_eq!(flat.len(), 3);
        let mean = flat.iter().sum::<f64>() / 3.0;
        assert!(mean.abs() < 1e-6);
        // Trajectory data is unchanged.
        assert!((trajs[0].advantages()[0] - 1.0).abs() < 1e-12);
    }
}
