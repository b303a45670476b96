//! Reinforcement-learning training core.
//!
//! Three learners share one vocabulary of [`StateVector`]s, [`Action`]s and
//! [`Experience`] tuples:
//!
//! - [`QAgent`]: tabular Q-learning over a sharded, lock-striped Q-table.
//! - [`DqnTrainer`]: a Q-network with a target copy, trained from a
//!   sum-tree [`PrioritizedReplayBuffer`] with importance-sampling weights.
//! - [`PpoTrainer`]: an actor-critic trained on whole trajectories with
//!   GAE advantages and the clipped PPO surrogate.
//!
//! All three implement [`Learner`](crate::algorithms::Learner), which is
//! what the [`TrainingOrchestrator`] drives. Training networks run on
//! libtorch through the `rl-nn` feature ([`network::torch`],
//! `TorchDqnTrainer`, `TorchPpoTrainer`). Without it the trainers fall back
//! to small `ndarray` MLPs, which suit tests and tiny state spaces.

pub mod agent;
pub mod config;
pub mod environment;
pub mod error;
pub mod metrics;
pub mod network;
pub mod observation;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod q_table;
pub mod training;
pub mod types;

pub use agent::QAgent;
pub use config::RLConfig;
pub use environment::{CorridorAction, CorridorEnvironment, Environment};
pub use error::{RLError, Result};
pub use metrics::{
    EvaluationMetrics, LearnerStats, PerformanceMonitor, RollingWindow, TrainingSnapshot,
};
pub use network::{ActorCritic, MlpActorCritic, MlpQNetwork, QFunction};
#[cfg(feature = "rl-nn")]
pub use network::torch::{TorchActorCritic, TorchDqnTrainer, TorchPpoTrainer, TorchQNetwork};
pub use observation::{
    GameObservation, GameObservationEncoder, StateEncoder, StateKey, StateVector, Weather,
};
pub use orchestrator::{
    CheckpointPolicy, ExplorationSchedule, OrchestratorConfig, OrchestratorState, StopHandle,
    StopReason, TrainingOrchestrator, TrainingReport,
};
pub use persistence::{ModelFile, ModelPayload};
pub use policy::{Policy, RandomPolicy};
pub use q_table::QTable;
pub use training::{
    DqnPhase, DqnTrainer, LearnOutcome, PpoOutcome, PpoTrainer, PrioritizedReplayBuffer,
    ReplayStats, SumTree,
};
pub use types::{Action, AgentId, Experience, GameAction};
