pub mod rl;

use std::path::Path;

use rl::error::Result;
use rl::metrics::LearnerStats;
use rl::policy::Policy;
use rl::types::{Action, AgentId, Experience};

/// Algorithm that learns a policy from experience.
///
/// The training orchestrator drives every learner through this interface,
/// so it stays agnostic to whether a Q-table, a DQN or a PPO actor-critic
/// sits behind it. All methods take `&self`: learners are shared between
/// the environment workers and guard their own state.
///
/// # Type Parameters
///
/// * `A` - Action space the learner chooses from
pub trait Learner<A: Action>: Policy<A> {
    /// Feeds one transition produced by `agent`.
    ///
    /// Learners that work on whole episodes use `agent` to keep each
    /// agent's trajectory separate.
    ///
    /// # Errors
    ///
    /// Malformed transitions are rejected with
    /// [`RLError::InvalidInput`](rl::RLError::InvalidInput). Numerical
    /// trouble inside an update is handled by the learner (the update is
    /// discarded) and does not surface here.
    fn ingest(&self, agent: AgentId, experience: Experience<A>) -> Result<()>;

    /// Current ε for ε-greedy exploration.
    fn exploration_rate(&self) -> f64;

    /// Overrides ε. Rejects values outside `[0, 1]`.
    fn set_exploration_rate(&self, rate: f64) -> Result<()>;

    /// Writes learned parameters and hyperparameters to `path`.
    fn save_model(&self, path: &Path) -> Result<()>;

    /// Replaces learned parameters with those stored at `path`.
    fn load_model(&self, path: &Path) -> Result<()>;

    /// Read-only monitoring snapshot.
    fn stats(&self) -> LearnerStats;

    /// Checks internal structural invariants.
    ///
    /// # Errors
    ///
    /// [`RLError::ConcurrencyViolation`](rl::RLError::ConcurrencyViolation)
    /// if shared state is found corrupted.
    fn verify(&self) -> Result<()> {
        Ok(())
    }

    /// Releases shared resources at the end of training. Idempotent.
    fn shutdown(&self) {}
}
