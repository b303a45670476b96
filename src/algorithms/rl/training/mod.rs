//! Learning machinery shared by the trainers: prioritized replay, PPO
//! trajectories and advantage estimation, plus the DQN and PPO trainers
//! themselves.

pub mod buffer;
pub mod dqn;
pub mod gae;
pub mod objective;
pub mod ppo;
pub mod replay;
pub mod sum_tree;

pub use buffer::{Trajectory, TrajectoryBuffer, TrajectoryStep};
pub use dqn::{DqnPhase, DqnTrainer, LearnOutcome};
pub use gae::compute_gae;
pub use ppo::{PpoOutcome, PpoTrainer, PpoUpdateStats};
pub use replay::{PrioritizedReplayBuffer, ReplayParams, ReplayStats, SampleIndex, SampledBatch};
pub use sum_tree::SumTree;
