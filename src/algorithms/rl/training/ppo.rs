//! Proximal Policy Optimization with Generalized Advantage Estimation.
//!
//! Transitions are accumulated per agent into open [`TrajectoryBuffer`]s.
//! When an episode ends (or hits `max-trajectory-length`) it is closed with
//! the critic's value estimates and kept as a [`Trajectory`]. Once
//! `trajectories-per-update` trajectories are pending, the trainer runs
//! `ppo-epochs` passes over them: one clipped actor step and one critic
//! step per trajectory, in a freshly shuffled order each epoch. The batch
//! is then discarded.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::buffer::{normalized_advantages, Trajectory, TrajectoryBuffer, TrajectoryStep};
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::metrics::{LearnerStats, RollingWindow};
use crate::algorithms::rl::network::{single_row, ActorCritic, MlpActorCritic, PolicyBatch};
use crate::algorithms::rl::observation::StateVector;
use crate::algorithms::rl::persistence::{ModelFile, ModelPayload};
use crate::algorithms::rl::policy::Policy;
use crate::algorithms::rl::types::{Action, AgentId, Experience};
use crate::algorithms::Learner;

/// Name recorded in model files written by [`PpoTrainer`].
pub const ALGORITHM: &str = "ppo";

const NETWORK_KEY: &str = "actor_critic";

/// Aggregates of one completed policy update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PpoUpdateStats {
    pub trajectories: usize,
    pub steps: usize,
    pub actor_loss: f64,
    pub critic_loss: f64,
    pub entropy: f64,
    pub clip_fraction: f64,
}

/// Result of one [`PpoTrainer::train`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum PpoOutcome {
    /// The step was appended to the agent's open episode.
    Accumulated { pending_steps: usize },
    /// The episode was closed; not enough trajectories for an update yet.
    EpisodeClosed { completed: usize },
    /// A policy update ran over the pending trajectories.
    Updated(PpoUpdateStats),
    /// The update hit a numerical problem and its batch was dropped.
    Discarded { reason: String },
}

/// PPO trainer owning an actor-critic pair.
pub struct PpoTrainer<A, N = MlpActorCritic> {
    config: RLConfig,
    state_dim: usize,
    network: Mutex<N>,
    episodes: Mutex<FxHashMap<AgentId, TrajectoryBuffer>>,
    completed: Mutex<Vec<Trajectory>>,
    /// Optional uniform-random fallback; 0 disables it.
    exploration: AtomicU64,
    updates: AtomicU64,
    rng: Mutex<StdRng>,
    actor_losses: Mutex<RollingWindow>,
    critic_losses: Mutex<RollingWindow>,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action> PpoTrainer<A, MlpActorCritic> {
    /// Creates a trainer with freshly initialized MLP actor and critic.
    pub fn new(state_dim: usize, config: RLConfig) -> Result<Self> {
        config.validate()?;
        if state_dim == 0 {
            return Err(RLError::InvalidConfig("state dimension must be positive".into()));
        }
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let network = MlpActorCritic::new(state_dim, A::COUNT, &config, &mut rng);
        Self::assemble(network, config, rng)
    }
}

impl<A: Action, N: ActorCritic> PpoTrainer<A, N> {
    /// Creates a trainer around a caller-supplied actor-critic.
    pub fn with_network(network: N, config: RLConfig) -> Result<Self> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self::assemble(network, config, rng)
    }

    fn assemble(network: N, config: RLConfig, rng: StdRng) -> Result<Self> {
        if network.action_count() != A::COUNT {
            return Err(RLError::InvalidConfig(format!(
                "actor outputs {} probabilities but the action space has {}",
                network.action_count(),
                A::COUNT
            )));
        }
        Ok(Self {
            state_dim: network.state_dim(),
            config,
            network: Mutex::new(network),
            episodes: Mutex::new(FxHashMap::default()),
            completed: Mutex::new(Vec::new()),
            exploration: AtomicU64::new(0.0f64.to_bits()),
            updates: AtomicU64::new(0),
            rng: Mutex::new(rng),
            actor_losses: Mutex::new(RollingWindow::new(100)),
            critic_losses: Mutex::new(RollingWindow::new(100)),
            _action: PhantomData,
        })
    }

    pub fn config(&self) -> &RLConfig {
        &self.config
    }

    /// Completed policy updates.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }

    /// Closed trajectories waiting for the next update.
    pub fn trajectory_count(&self) -> usize {
        self.completed.lock().len()
    }

    /// Steps held in open (not yet closed) episodes across all agents.
    pub fn pending_steps(&self) -> usize {
        self.episodes.lock().values().map(TrajectoryBuffer::len).sum()
    }

    pub fn exploration_rate(&self) -> f64 {
        f64::from_bits(self.exploration.load(Ordering::Acquire))
    }

    pub fn set_exploration_rate(&self, rate: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(RLError::InvalidInput(format!(
                "exploration rate must lie in [0, 1], got {rate}"
            )));
        }
        self.exploration.store(rate.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Actor distribution π(·|state).
    pub fn predict_action_probabilities(&self, state: &StateVector) -> Result<Vec<f64>> {
        state.validate(self.state_dim)?;
        let probs = self
            .network
            .lock()
            .action_probs(single_row(state.as_slice())?.view())?;
        Ok(probs.row(0).to_vec())
    }

    /// Critic estimate V(state).
    pub fn predict_value(&self, state: &StateVector) -> Result<f64> {
        state.validate(self.state_dim)?;
        let values = self
            .network
            .lock()
            .values(single_row(state.as_slice())?.view())?;
        values
            .first()
            .copied()
            .ok_or_else(|| RLError::NumericalInstability("critic returned no value".into()))
    }

    /// Samples an action from the actor's categorical distribution.
    pub fn select_action(&self, state: &StateVector) -> Result<A> {
        state.validate(self.state_dim)?;
        let epsilon = self.exploration_rate();
        if epsilon > 0.0 {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < epsilon {
                return A::try_from_ordinal(rng.gen_range(0..A::COUNT));
            }
        }
        let probs = self.predict_action_probabilities(state)?;
        let dist = WeightedIndex::new(&probs).map_err(|e| {
            RLError::NumericalInstability(format!("actor distribution unusable: {e}"))
        })?;
        let ordinal = dist.sample(&mut *self.rng.lock());
        A::try_from_ordinal(ordinal)
    }

    /// Appends `experience` to `agent`'s open episode, closing it on
    /// `done` or at the step cap, and updates the policy once enough
    /// trajectories are pending.
    ///
    /// The stored log-probability is that of the current actor, evaluated
    /// when the step is ingested.
    pub fn train(&self, agent: AgentId, experience: Experience<A>) -> Result<PpoOutcome> {
        experience.validate(self.state_dim)?;
        let action = experience.action().ordinal();
        let log_prob = {
            let network = self.network.lock();
            let row = single_row(experience.state().as_slice())?;
            let lp = network.log_probs(row.view(), &[action])?;
            lp.first().copied().ok_or_else(|| {
                RLError::InvalidInput("actor returned no log-probability".into())
            })?
        };
        let done = experience.done();
        if !log_prob.is_finite() {
            // The episode ends here, so its earlier steps would otherwise
            // leak into the agent's next episode.
            if done {
                if let Some(open) = self.episodes.lock().remove(&agent) {
                    warn!(agent, dropped = open.len(), "dropping episode ended by a discarded step");
                }
            }
            return Ok(PpoOutcome::Discarded {
                reason: format!("log-probability of action {action} is {log_prob}"),
            });
        }

        let step = TrajectoryStep {
            state: experience.state().clone(),
            action,
            reward: experience.reward(),
            next_state: experience.next_state().clone(),
            done,
            log_prob,
        };

        let closed = {
            let mut episodes = self.episodes.lock();
            let buffer = episodes.entry(agent).or_default();
            buffer.push(step);
            if done || buffer.len() >= self.config.max_trajectory_length {
                episodes.remove(&agent)
            } else {
                return Ok(PpoOutcome::Accumulated {
                    pending_steps: buffer.len(),
                });
            }
        };
        let Some(buffer) = closed else {
            return Ok(PpoOutcome::Accumulated { pending_steps: 0 });
        };

        let trajectory = self.close(buffer)?;
        if trajectory.truncated() {
            debug!(agent, steps = trajectory.len(), "trajectory force-closed at step cap");
        }

        let batch = {
            let mut completed = self.completed.lock();
            completed.push(trajectory);
            if completed.len() < self.config.trajectories_per_update {
                return Ok(PpoOutcome::EpisodeClosed {
                    completed: completed.len(),
                });
            }
            std::mem::take(&mut *completed)
        };
        Ok(self.update(batch))
    }

    fn close(&self, buffer: TrajectoryBuffer) -> Result<Trajectory> {
        let (values, next_values) = {
            let network = self.network.lock();
            (
                network.values(buffer.states()?.view())?,
                network.values(buffer.next_states()?.view())?,
            )
        };
        buffer.close_episode(
            &values,
            &next_values,
            self.config.discount_factor,
            self.config.gae_lambda,
        )
    }

    /// Runs the multi-epoch clipped update over `batch`.
    fn update(&self, mut batch: Vec<Trajectory>) -> PpoOutcome {
        let advantages = normalized_advantages(&batch);
        let prepared: Result<Vec<_>> = batch
            .drain(..)
            .zip(advantages)
            .map(|(t, adv)| {
                Ok((t.states()?, t.actions(), t.log_probs(), adv, t.returns().to_vec()))
            })
            .collect();
        let mut prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(update = self.updates(), error = %e, "PPO batch could not be assembled");
                return PpoOutcome::Discarded {
                    reason: e.to_string(),
                };
            }
        };
        let trajectories = prepared.len();
        let steps: usize = prepared.iter().map(|p| p.1.len()).sum();

        let mut actor_loss = RollingWindow::new(trajectories * self.config.ppo_epochs);
        let mut critic_loss = RollingWindow::new(trajectories * self.config.ppo_epochs);
        let mut entropy = RollingWindow::new(trajectories * self.config.ppo_epochs);
        let mut clip_fraction = RollingWindow::new(trajectories * self.config.ppo_epochs);

        let mut network = self.network.lock();
        for epoch in 0..self.config.ppo_epochs {
            prepared.shuffle(&mut *self.rng.lock());
            for (states, actions, old_log_probs, adv, returns) in &prepared {
                let policy_batch = PolicyBatch {
                    states: states.view(),
                    actions: actions.as_slice(),
                    old_log_probs: old_log_probs.as_slice(),
                    advantages: adv.as_slice(),
                    clip_epsilon: self.config.clip_epsilon,
                    entropy_coef: self.config.entropy_coef,
                };
                let result = network.actor_step(&policy_batch).and_then(|stats| {
                    network
                        .critic_step(states.view(), returns)
                        .map(|value_loss| (stats, value_loss))
                });
                match result {
                    Ok((stats, value_loss)) => {
                        actor_loss.push(stats.loss);
                        entropy.push(stats.entropy);
                        clip_fraction.push(stats.clip_fraction);
                        critic_loss.push(value_loss);
                    }
                    Err(RLError::NumericalInstability(reason)) => {
                        drop(network);
                        warn!(
                            update = self.updates(),
                            epoch,
                            trajectories,
                            steps,
                            %reason,
                            "discarding unstable PPO batch"
                        );
                        return PpoOutcome::Discarded { reason };
                    }
                    Err(e) => {
                        drop(network);
                        warn!(update = self.updates(), error = %e, "PPO update failed");
                        return PpoOutcome::Discarded {
                            reason: e.to_string(),
                        };
                    }
                }
            }
        }
        drop(network);

        let stats = PpoUpdateStats {
            trajectories,
            steps,
            actor_loss: actor_loss.mean().unwrap_or(0.0),
            critic_loss: critic_loss.mean().unwrap_or(0.0),
            entropy: entropy.mean().unwrap_or(0.0),
            clip_fraction: clip_fraction.mean().unwrap_or(0.0),
        };
        self.actor_losses.lock().push(stats.actor_loss);
        self.critic_losses.lock().push(stats.critic_loss);
        let update = self.updates.fetch_add(1, Ordering::AcqRel) + 1;
        info!(
            update,
            trajectories,
            steps,
            actor_loss = stats.actor_loss,
            critic_loss = stats.critic_loss,
            entropy = stats.entropy,
            clip_fraction = stats.clip_fraction,
            "ppo update"
        );
        PpoOutcome::Updated(stats)
    }

    /// Drops open and pending trajectories without training on them.
    pub fn discard_trajectories(&self) {
        self.episodes.lock().clear();
        self.completed.lock().clear();
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        let mut networks = BTreeMap::new();
        networks.insert(NETWORK_KEY.to_string(), self.network.lock().state_dict()?);
        ModelFile::new(
            ALGORITHM,
            self.updates(),
            self.config.clone(),
            self.exploration_rate(),
            ModelPayload::Networks {
                state_dim: self.state_dim,
                action_count: A::COUNT,
                networks,
            },
        )
        .write(path)
    }

    pub fn load_model(&self, path: &Path) -> Result<()> {
        let file = ModelFile::read(path)?;
        file.expect_algorithm(ALGORITHM, path)?;
        let ModelPayload::Networks {
            state_dim,
            action_count,
            networks,
        } = file.payload
        else {
            return Err(RLError::model_io(path, "payload holds no networks"));
        };
        if state_dim != self.state_dim || action_count != A::COUNT {
            return Err(RLError::model_io(
                path,
                format!(
                    "model is {state_dim}→{action_count}, trainer is {}→{}",
                    self.state_dim,
                    A::COUNT
                ),
            ));
        }
        let params = networks
            .get(NETWORK_KEY)
            .ok_or_else(|| RLError::model_io(path, "missing actor-critic parameters"))?;
        self.network
            .lock()
            .load_state_dict(params)
            .map_err(|e| RLError::model_io(path, e))?;
        self.set_exploration_rate(file.exploration_rate.clamp(0.0, 1.0))
    }
}

impl<A: Action, N: ActorCritic> Policy<A> for PpoTrainer<A, N> {
    fn select_action(&self, state: &StateVector) -> Result<A> {
        PpoTrainer::select_action(self, state)
    }

    fn name(&self) -> &str {
        ALGORITHM
    }
}

impl<A: Action, N: ActorCritic> Learner<A> for PpoTrainer<A, N> {
    fn ingest(&self, agent: AgentId, experience: Experience<A>) -> Result<()> {
        self.train(agent, experience).map(|_| ())
    }

    fn exploration_rate(&self) -> f64 {
        PpoTrainer::exploration_rate(self)
    }

    fn set_exploration_rate(&self, rate: f64) -> Result<()> {
        PpoTrainer::set_exploration_rate(self, rate)
    }

    fn save_model(&self, path: &Path) -> Result<()> {
        PpoTrainer::save_model(self, path)
    }

    fn load_model(&self, path: &Path) -> Result<()> {
        PpoTrainer::load_model(self, path)
    }

    fn stats(&self) -> LearnerStats {
        let mut stats = LearnerStats::new(ALGORITHM, self.updates(), self.exploration_rate());
        stats.avg_loss = self.actor_losses.lock().mean();
        stats.pending_trajectories = Some(self.trajectory_count());
        stats
    }
}

impl<A, N> std::fmt::Debug for PpoTrainer<A, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PpoTrainer")
            .field("state_dim", &self.state_dim)
            .field("updates", &self.updates.load(Ordering::Relaxed))
            .field("open_episodes", &self.episodes.lock().len())
            .field("completed", &self.completed.lock().len())
            .finish()
    }
}
