//! Monitoring snapshots and policy evaluation.
//!
//! Everything here is read-only from the learners' point of view: the
//! orchestrator feeds latencies into a [`PerformanceMonitor`] and assembles
//! [`TrainingSnapshot`]s for external dashboards.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use super::environment::Environment;
use super::error::Result;
use super::policy::Policy;
use super::training::ReplayStats;
use super::types::Action;

/// Fixed-size window of recent samples with a running sum.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    sum: f64,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            sum: 0.0,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    pub fn mean(&self) -> Option<f64> {
        (!self.samples.is_empty()).then(|| self.sum / self.samples.len() as f64)
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// Step-latency tracker. Safe to share between the training thread and a
/// monitoring reader.
#[derive(Debug)]
pub struct PerformanceMonitor {
    latencies: Mutex<RollingWindow>,
    steps: Mutex<u64>,
}

impl PerformanceMonitor {
    pub const DEFAULT_WINDOW: usize = 100;

    pub fn new(window: usize) -> Self {
        Self {
            latencies: Mutex::new(RollingWindow::new(window)),
            steps: Mutex::new(0),
        }
    }

    pub fn record_step(&self, latency: Duration) {
        self.latencies.lock().push(latency.as_secs_f64());
        *self.steps.lock() += 1;
    }

    pub fn steps(&self) -> u64 {
        *self.steps.lock()
    }

    pub fn mean_latency(&self) -> Option<Duration> {
        self.latencies
            .lock()
            .mean()
            .map(Duration::from_secs_f64)
    }

    /// Throughput over the recent window.
    pub fn steps_per_sec(&self) -> f64 {
        let window = self.latencies.lock();
        if window.is_empty() || window.sum() <= 0.0 {
            return 0.0;
        }
        window.len() as f64 / window.sum()
    }

    pub fn reset(&self) {
        self.latencies.lock().clear();
        *self.steps.lock() = 0;
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// Learner-side statistics reported through the learner interface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LearnerStats {
    pub algorithm: String,
    /// Optimizer steps (DQN, PPO) or tabular updates (Q-agent).
    pub train_steps: u64,
    pub exploration_rate: f64,
    pub avg_td_error: Option<f64>,
    pub avg_loss: Option<f64>,
    pub replay: Option<ReplayStats>,
    /// Materialized Q-table rows, for the tabular agent.
    pub table_rows: Option<usize>,
    /// Closed trajectories awaiting the next PPO update.
    pub pending_trajectories: Option<usize>,
}

impl LearnerStats {
    pub fn new(algorithm: impl Into<String>, train_steps: u64, exploration_rate: f64) -> Self {
        Self {
            algorithm: algorithm.into(),
            train_steps,
            exploration_rate,
            avg_td_error: None,
            avg_loss: None,
            replay: None,
            table_rows: None,
            pending_trajectories: None,
        }
    }
}

/// Point-in-time view of a training run for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingSnapshot {
    pub step: u64,
    pub steps_per_sec: f64,
    pub mean_step_latency_ms: Option<f64>,
    pub buffer_utilization: Option<f64>,
    pub exploration_rate: f64,
    pub avg_td_error: Option<f64>,
    pub avg_loss: Option<f64>,
}

impl TrainingSnapshot {
    pub fn capture(step: u64, monitor: &PerformanceMonitor, stats: &LearnerStats) -> Self {
        Self {
            step,
            steps_per_sec: monitor.steps_per_sec(),
            mean_step_latency_ms: monitor.mean_latency().map(|d| d.as_secs_f64() * 1e3),
            buffer_utilization: stats.replay.map(|r| r.utilization),
            exploration_rate: stats.exploration_rate,
            avg_td_error: stats.avg_td_error,
            avg_loss: stats.avg_loss,
        }
    }
}

fn opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"))
}

impl fmt::Display for TrainingSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step={} steps/s={:.1} latency_ms={} buffer={} eps={:.3} td={} loss={}",
            self.step,
            self.steps_per_sec,
            opt(self.mean_step_latency_ms),
            opt(self.buffer_utilization),
            self.exploration_rate,
            opt(self.avg_td_error),
            opt(self.avg_loss)
        )
    }
}

/// Aggregated evaluation metrics over multiple episodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationMetrics {
    /// Mean cumulative reward per episode.
    pub mean_reward: f64,
    /// Fraction of episodes the environment reported as successful.
    pub success_rate: f64,
    /// Mean number of steps per episode.
    pub mean_episode_length: f64,
    /// Number of episodes evaluated.
    pub n_episodes: usize,
}

impl EvaluationMetrics {
    /// Plays `n_episodes` episodes with agent 0 of `env`, without learning.
    ///
    /// # Arguments
    ///
    /// * `env` - The environment to evaluate in
    /// * `policy` - The policy to evaluate
    /// * `n_episodes` - Number of episodes to run
    /// * `max_steps` - Per-episode step cap, on top of the environment's own
    pub fn evaluate<A: Action, P: Policy<A> + ?Sized>(
        env: &mut dyn Environment<A>,
        policy: &P,
        n_episodes: usize,
        max_steps: usize,
    ) -> Result<Self> {
        let mut total_reward = 0.0;
        let mut successes = 0usize;
        let mut total_steps = 0usize;

        for _ in 0..n_episodes {
            env.reset_agent(0)?;
            let mut steps = 0;
            while !env.episode_done(0) && steps < max_steps {
                let state = env.capture_state(0)?;
                let action = policy.select_action(&state)?;
                total_reward += env.apply_action(0, action)?;
                steps += 1;
            }
            if env.episode_succeeded(0) {
                successes += 1;
            }
            total_steps += steps;
        }

        let n = n_episodes.max(1) as f64;
        Ok(Self {
            mean_reward: total_reward / n,
            success_rate: successes as f64 / n,
            mean_episode_length: total_steps as f64 / n,
            n_episodes,
        })
    }
}

impl fmt::Display for EvaluationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "=== Evaluation Metrics ({} episodes) ===",
            self.n_episodes
        )?;
        writeln!(f, "  Mean reward:          {:.3}", self.mean_reward)?;
        writeln!(f, "  Success rate:         {:.1}%", self.success_rate * 100.0)?;
        writeln!(
            f,
            "  Mean episode length:  {:.1}",
            self.mean_episode_length
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::environment::{CorridorAction, CorridorEnvironment};
    use crate::algorithms::rl::observation::StateVector;
    use crate::algorithms::rl::RandomPolicy;

    struct AlwaysRight;

    impl Policy<CorridorAction> for AlwaysRight {
        fn select_action(&self, _state: &StateVector) -> Result<CorridorAction> {
            Ok(CorridorAction::Right)
        }

        fn name(&self) -> &str {
            "always-right"
        }
    }

    #[test]
    fn rolling_window_evicts_oldest() {
        let mut w = RollingWindow::new(3);
        assert_eq!(w.mean(), None);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        assert!((w.mean().unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn monitor_reports_throughput() {
        let m = PerformanceMonitor::new(10);
        assert_eq!(m.steps_per_sec(), 0.0);
        for _ in 0..4 {
            m.record_step(Duration::from_millis(250));
        }
        assert_eq!(m.steps(), 4);
        assert!((m.steps_per_sec() - 4.0).abs() < 1e-9);
        assert_eq!(m.mean_latency(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn optimal_policy_always_succeeds() {
        let mut env = CorridorEnvironment::new(5, 1, 50).unwrap();
        let metrics = EvaluationMetrics::evaluate(&mut env, &AlwaysRight, 3, 100).unwrap();
        assert_eq!(metrics.n_episodes, 3);
        assert_eq!(metrics.success_rate, 1.0);
        assert_eq!(metrics.mean_episode_length, 4.0);
        assert!((metrics.mean_reward - (1.0 - 0.03)).abs() < 1e-9);
    }

    #[test]
    fn evaluate_completes_with_random_policy() {
        let mut env = CorridorEnvironment::new(5, 1, 20).unwrap();
        let policy = RandomPolicy::<CorridorAction>::seeded(1);
        let metrics = EvaluationMetrics::evaluate(&mut env, &policy, 5, 100).unwrap();
        assert!(metrics.mean_episode_length <= 20.0);
        assert!(metrics.to_string().contains("5 episodes"));
    }

    #[test]
    fn snapshot_display_handles_missing_values() {
        let monitor = PerformanceMonitor::default();
        let stats = LearnerStats::new("q-learning", 0, 0.1);
        let snap = TrainingSnapshot::capture(7, &monitor, &stats);
        let text = snap.to_string();
        assert!(text.contains("step=7"));
        assert!(text.contains("td=-"));
    }
}
