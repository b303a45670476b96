//! Deep Q-Network trainer with prioritized replay and a target network.
//!
//! Each call to [`DqnTrainer::train_enhanced`] walks the phase machine
//!
//! ```text
//! Idle → Warming                         (buffer below batch size)
//! Idle → Training [→ SyncTarget] → Idle  (one optimizer step)
//! ```
//!
//! The target network is a copy of the online network refreshed every
//! `target-update-frequency` training steps; it is never trained itself.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use ndarray::Array2;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info, warn};

use super::replay::{PrioritizedReplayBuffer, ReplayStats, SampledBatch};
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::metrics::{LearnerStats, RollingWindow};
use crate::algorithms::rl::network::{argmax, single_row, MlpQNetwork, QFunction};
use crate::algorithms::rl::observation::StateVector;
use crate::algorithms::rl::persistence::{ModelFile, ModelPayload};
use crate::algorithms::rl::policy::Policy;
use crate::algorithms::rl::types::{Action, AgentId, Experience};
use crate::algorithms::Learner;

/// Name recorded in model files written by [`DqnTrainer`].
pub const ALGORITHM: &str = "dqn";

/// Where the trainer is in its per-step cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DqnPhase {
    Idle = 0,
    Warming = 1,
    Training = 2,
    SyncTarget = 3,
}

impl DqnPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DqnPhase::Warming,
            2 => DqnPhase::Training,
            3 => DqnPhase::SyncTarget,
            _ => DqnPhase::Idle,
        }
    }
}

/// Result of one [`DqnTrainer::train_enhanced`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    /// Stored; the buffer does not yet hold a full batch.
    Warming { buffered: usize },
    /// One optimizer step was applied.
    Trained {
        loss: f64,
        mean_abs_td: f64,
        target_synced: bool,
    },
    /// The sampled batch was rejected as numerically unstable and not applied.
    Discarded { reason: String },
}

struct Networks<Q> {
    online: Q,
    target: Q,
}

/// DQN trainer holding an online network, its target copy and the replay buffer.
///
/// The networks sit behind one mutex: action selection and training share
/// it, so a rollout thread always sees a consistent parameter snapshot.
pub struct DqnTrainer<A, Q = MlpQNetwork> {
    config: RLConfig,
    state_dim: usize,
    buffer: PrioritizedReplayBuffer<A>,
    networks: Mutex<Networks<Q>>,
    exploration: AtomicU64,
    train_steps: AtomicU64,
    phase: AtomicU8,
    losses: Mutex<RollingWindow>,
    td_errors: Mutex<RollingWindow>,
    rng: Mutex<StdRng>,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action> DqnTrainer<A, MlpQNetwork> {
    /// Creates a trainer with freshly initialized MLP networks.
    pub fn new(state_dim: usize, config: RLConfig) -> Result<Self> {
        config.validate()?;
        if state_dim == 0 {
            return Err(RLError::InvalidConfig("state dimension must be positive".into()));
        }
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let online = MlpQNetwork::new(state_dim, A::COUNT, &config, &mut rng);
        let target = online.clone();
        Self::assemble(online, target, config, rng)
    }
}

impl<A: Action, Q: QFunction> DqnTrainer<A, Q> {
    /// Creates a trainer around caller-supplied networks. The target is
    /// synced from the online network before use.
    pub fn with_networks(online: Q, mut target: Q, config: RLConfig) -> Result<Self> {
        config.validate()?;
        target.sync_from(&online)?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_entropy(),
        };
        Self::assemble(online, target, config, rng)
    }

    fn assemble(online: Q, target: Q, config: RLConfig, rng: StdRng) -> Result<Self> {
        let state_dim = online.state_dim();
        if state_dim == 0 {
            return Err(RLError::InvalidConfig("state dimension must be positive".into()));
        }
        if online.action_count() != A::COUNT || target.action_count() != A::COUNT {
            return Err(RLError::InvalidConfig(format!(
                "Q-network outputs {} values but the action space has {}",
                online.action_count(),
                A::COUNT
            )));
        }
        let buffer = PrioritizedReplayBuffer::from_config(&config)?;
        Ok(Self {
            exploration: AtomicU64::new(config.exploration_rate.to_bits()),
            config,
            state_dim,
            buffer,
            networks: Mutex::new(Networks { online, target }),
            train_steps: AtomicU64::new(0),
            phase: AtomicU8::new(DqnPhase::Idle as u8),
            losses: Mutex::new(RollingWindow::new(100)),
            td_errors: Mutex::new(RollingWindow::new(100)),
            rng: Mutex::new(rng),
            _action: PhantomData,
        })
    }

    pub fn config(&self) -> &RLConfig {
        &self.config
    }

    pub fn phase(&self) -> DqnPhase {
        DqnPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: DqnPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    pub fn train_steps(&self) -> u64 {
        self.train_steps.load(Ordering::Acquire)
    }

    pub fn buffer(&self) -> &PrioritizedReplayBuffer<A> {
        &self.buffer
    }

    pub fn buffer_stats(&self) -> ReplayStats {
        self.buffer.stats()
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

    /// ε ← max(ε_min, ε·decay). Never reaches zero since ε_min > 0.
    fn decay_exploration(&self) {
        let decay = self.config.exploration_decay;
        let floor = self.config.exploration_min;
        let _ = self
            .exploration
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                Some((f64::from_bits(bits) * decay).max(floor).to_bits())
            });
    }

    /// Online-network Q-values for `state`.
    pub fn predict_q_values(&self, state: &StateVector) -> Result<Vec<f64>> {
        state.validate(self.state_dim)?;
        let q = self
            .networks
            .lock()
            .online
            .q_values(single_row(state.as_slice())?.view())?;
        Ok(q.row(0).to_vec())
    }

    /// ε-greedy over the online network's outputs.
    pub fn select_action(&self, state: &StateVector) -> Result<A> {
        state.validate(self.state_dim)?;
        let explore = {
            let mut rng = self.rng.lock();
            if rng.gen::<f64>() < self.exploration_rate() {
                Some(rng.gen_range(0..A::COUNT))
            } else {
                None
            }
        };
        let ordinal = match explore {
            Some(ordinal) => ordinal,
            None => argmax(&self.predict_q_values(state)?).unwrap_or(0),
        };
        A::try_from_ordinal(ordinal)
    }

    /// Stores `experience` and, once the buffer holds a batch, runs one
    /// prioritized training step.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidInput`] for a state of the wrong length (never
    /// padded); [`RLError::Shutdown`] after the buffer was shut down. A
    /// numerically unstable batch is not an error: it is logged and
    /// reported as [`LearnOutcome::Discarded`].
    pub fn train_enhanced(&self, experience: Experience<A>) -> Result<LearnOutcome> {
        experience.validate(self.state_dim)?;
        self.buffer.add(experience, None)?;

        let buffered = self.buffer.len();
        if buffered < self.config.batch_size {
            self.set_phase(DqnPhase::Warming);
            return Ok(LearnOutcome::Warming { buffered });
        }

        self.set_phase(DqnPhase::Training);
        let batch = match self.buffer.sample_batch(self.config.batch_size) {
            Ok(batch) => batch,
            Err(RLError::InsufficientData { available, .. }) => {
                self.set_phase(DqnPhase::Warming);
                return Ok(LearnOutcome::Warming {
                    buffered: available,
                });
            }
            Err(e) => return Err(e),
        };

        let outcome = self.train_batch(&batch);
        self.set_phase(DqnPhase::Idle);
        outcome
    }

    fn train_batch(&self, batch: &SampledBatch<A>) -> Result<LearnOutcome> {
        let n = batch.len();
        let states = stack(batch.experiences.iter().map(|e| e.state()), n, self.state_dim)?;
        let next_states = stack(
            batch.experiences.iter().map(|e| e.next_state()),
            n,
            self.state_dim,
        )?;
        let actions: Vec<usize> = batch.experiences.iter().map(|e| e.action().ordinal()).collect();
        let gamma = self.config.discount_factor;

        let mut nets = self.networks.lock();
        let target_next = nets.target.q_values(next_states.view())?;
        let online_next = if self.config.double_dqn {
            Some(nets.online.q_values(next_states.view())?)
        } else {
            None
        };
        let current = nets.online.q_values(states.view())?;

        let mut targets = Vec::with_capacity(n);
        let mut td_errors = Vec::with_capacity(n);
        for (i, experience) in batch.experiences.iter().enumerate() {
            let bootstrap = if experience.done() {
                0.0
            } else {
                let row = target_next.row(i);
                match &online_next {
                    Some(online) => {
                        let online_row = online.row(i).to_vec();
                        let best = argmax(&online_row).unwrap_or(0);
                        row[best]
                    }
                    None => row.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                }
            };
            let target = experience.reward() + gamma * bootstrap;
            targets.push(target);
            td_errors.push(target - current[[i, actions[i]]]);
        }

        let step = self.train_steps();
        if let Some(reason) = self.unstable(&td_errors) {
            drop(nets);
            return Ok(self.discard(step, reason, &td_errors));
        }

        let loss = match nets
            .online
            .fit(states.view(), &actions, &targets, &batch.weights)
        {
            Ok(loss) => loss,
            Err(RLError::NumericalInstability(reason)) => {
                drop(nets);
                return Ok(self.discard(step, reason, &td_errors));
            }
            Err(e) => return Err(e),
        };

        let step = self.train_steps.fetch_add(1, Ordering::AcqRel) + 1;
        let target_synced = step % self.config.target_update_frequency == 0;
        if target_synced {
            self.set_phase(DqnPhase::SyncTarget);
            let Networks { online, target } = &mut *nets;
            if let Err(e) = target.sync_from(online) {
                error!(step, error = %e, "target network sync failed");
                return Err(e);
            }
            info!(step, "target network synced");
        }
        drop(nets);

        self.buffer.update_priorities(&batch.indices, &td_errors)?;
        self.decay_exploration();

        let mean_abs_td = td_errors.iter().map(|td| td.abs()).sum::<f64>() / n as f64;
        self.losses.lock().push(loss);
        self.td_errors.lock().push(mean_abs_td);
        debug!(step, loss, mean_abs_td, "dqn step");

        Ok(LearnOutcome::Trained {
            loss,
            mean_abs_td,
            target_synced,
        })
    }

    fn unstable(&self, td_errors: &[f64]) -> Option<String> {
        let limit = self.config.max_td_error;
        td_errors.iter().find_map(|&td| {
            if !td.is_finite() {
                Some(format!("non-finite TD-error {td}"))
            } else if td.abs() > limit {
                Some(format!("TD-error {td} exceeds bound {limit}"))
            } else {
                None
            }
        })
    }

    fn discard(&self, step: u64, reason: String, td_errors: &[f64]) -> LearnOutcome {
        let finite: Vec<f64> = td_errors.iter().copied().filter(|v| v.is_finite()).collect();
        let max_abs = finite.iter().map(|v| v.abs()).fold(0.0, f64::max);
        warn!(
            step,
            batch_size = td_errors.len(),
            finite_td = finite.len(),
            max_abs_td = max_abs,
            %reason,
            "discarding unstable DQN batch"
        );
        self.decay_exploration();
        LearnOutcome::Discarded { reason }
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        let nets = self.networks.lock();
        let mut networks = BTreeMap::new();
        networks.insert("online".to_string(), nets.online.state_dict()?);
        networks.insert("target".to_string(), nets.target.state_dict()?);
        drop(nets);
        ModelFile::new(
            ALGORITHM,
            self.train_steps(),
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

    /// Restores both networks and the exploration rate. On any error the
    /// in-memory parameters are left as they were.
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
        let online = networks
            .get("online")
            .ok_or_else(|| RLError::model_io(path, "missing online network"))?;
        let target = networks.get("target").unwrap_or(online);

        let mut nets = self.networks.lock();
        let backup = nets
            .online
            .state_dict()
            .map_err(|e| RLError::model_io(path, e))?;
        nets.online
            .load_state_dict(online)
            .map_err(|e| RLError::model_io(path, e))?;
        if let Err(e) = nets.target.load_state_dict(target) {
            // Roll the online network back so the pair stays consistent.
            let _ = nets.online.load_state_dict(&backup);
            return Err(RLError::model_io(path, e));
        }
        drop(nets);
        self.set_exploration_rate(file.exploration_rate.clamp(0.0, 1.0))
    }
}

fn stack<'a>(
    rows: impl Iterator<Item = &'a StateVector>,
    n: usize,
    dim: usize,
) -> Result<Array2<f64>> {
    let mut flat = Vec::with_capacity(n * dim);
    for row in rows {
        flat.extend_from_slice(row.as_slice());
    }
    Array2::from_shape_vec((n, dim), flat).map_err(|e| RLError::InvalidInput(e.to_string()))
}

impl<A: Action, Q: QFunction> Policy<A> for DqnTrainer<A, Q> {
    fn select_action(&self, state: &StateVector) -> Result<A> {
        DqnTrainer::select_action(self, state)
    }

    fn name(&self) -> &str {
        ALGORITHM
    }
}

impl<A: Action, Q: QFunction> Learner<A> for DqnTrainer<A, Q> {
    fn ingest(&self, _agent: AgentId, experience: Experience<A>) -> Result<()> {
        self.train_enhanced(experience).map(|_| ())
    }

    fn exploration_rate(&self) -> f64 {
        DqnTrainer::exploration_rate(self)
    }

    fn set_exploration_rate(&self, rate: f64) -> Result<()> {
        DqnTrainer::set_exploration_rate(self, rate)
    }

    fn save_model(&self, path: &Path) -> Result<()> {
        DqnTrainer::save_model(self, path)
    }

    fn load_model(&self, path: &Path) -> Result<()> {
        DqnTrainer::load_model(self, path)
    }

    fn stats(&self) -> LearnerStats {
        let mut stats = LearnerStats::new(ALGORITHM, self.train_steps(), self.exploration_rate());
        stats.avg_loss = self.losses.lock().mean();
        stats.avg_td_error = self.td_errors.lock().mean();
        stats.replay = Some(self.buffer.stats());
        stats
    }

    fn verify(&self) -> Result<()> {
        self.buffer.verify()
    }

    fn shutdown(&self) {
        self.buffer.shutdown();
    }
}

impl<A, Q> std::fmt::Debug for DqnTrainer<A, Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DqnTrainer")
            .field("state_dim", &self.state_dim)
            .field("train_steps", &self.train_steps.load(Ordering::Relaxed))
            .field("buffer", &self.buffer)
            .finish()
    }
}
