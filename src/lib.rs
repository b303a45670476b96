//! ludorl - reinforcement-learning training core for autonomous game agents
//!
//! Decides actions for game agents and improves those decisions from
//! observed outcomes: sum-tree prioritized replay, tabular Q-learning, a
//! DQN trainer with a target network and a PPO trainer with GAE, driven by
//! a parallel training orchestrator.

use std::sync::OnceLock;

pub mod algorithms;

pub use algorithms::rl;
pub use algorithms::Learner;

/// Identifier of one training process, stamped into every model file it writes.
pub type RunId = String;

static RUN_ID: OnceLock<RunId> = OnceLock::new();

/// Returns this process's run identifier (UUID v4), generated on first use.
pub fn run_id() -> &'static str {
    RUN_ID.get_or_init(generate_run_id)
}

/// Generates a new unique run identifier (UUID v4).
pub fn generate_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_is_stable_within_a_process() {
        let first = run_id();
        assert_eq!(first, run_id());
        assert_eq!(first.len(), 36);
        assert_ne!(first, generate_run_id());
    }
}
