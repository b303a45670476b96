//! Tabular Q-learning agent.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::config::RLConfig;
use super::error::{RLError, Result};
use super::metrics::{LearnerStats, RollingWindow};
use super::network::argmax;
use super::observation::{StateKey, StateVector};
use super::persistence::{ModelFile, ModelPayload};
use super::policy::Policy;
use super::q_table::QTable;
use super::types::{Action, AgentId, Experience};
use crate::algorithms::Learner;

/// Name recorded in model files written by [`QAgent`].
pub const ALGORITHM: &str = "q-learning";

/// Q-learning over a discretized state space.
///
/// States are mapped to rows by [`StateKey::from_state`] with the configured
/// `state-resolution`. The agent is shareable across threads: learning on
/// different states proceeds in parallel, and concurrent updates of the
/// same `(state, action)` pair resolve last-write-wins.
///
/// Exploration has no internal schedule; callers anneal it through
/// [`QAgent::set_exploration_rate`].
pub struct QAgent<A> {
    config: RLConfig,
    state_dim: usize,
    table: QTable,
    exploration: AtomicU64,
    updates: AtomicU64,
    td_errors: Mutex<RollingWindow>,
    rng: Mutex<StdRng>,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action> QAgent<A> {
    /// Creates an agent for states of length `state_dim`.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidConfig`] if `config` fails validation or
    /// `state_dim` is zero.
    pub fn new(state_dim: usize, config: RLConfig) -> Result<Self> {
        config.validate()?;
        if state_dim == 0 {
            return Err(RLError::InvalidConfig("state dimension must be positive".into()));
        }
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            exploration: AtomicU64::new(config.exploration_rate.to_bits()),
            config,
            state_dim,
            table: QTable::new(A::COUNT),
            updates: AtomicU64::new(0),
            td_errors: Mutex::new(RollingWindow::new(100)),
            rng: Mutex::new(rng),
            _action: PhantomData,
        })
    }

    pub fn config(&self) -> &RLConfig {
        &self.config
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn key(&self, state: &StateVector) -> Result<StateKey> {
        state.validate(self.state_dim)?;
        Ok(StateKey::from_state(state, self.config.state_resolution))
    }

    /// ε-greedy action: uniform with probability ε, otherwise the greedy action.
    pub fn decide_action(&self, state: &StateVector) -> Result<A> {
        let key = self.key(state)?;
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
            None => argmax(&self.table.values(key)).unwrap_or(0),
        };
        A::try_from_ordinal(ordinal)
    }

    /// Highest-valued action, ties broken by the lowest ordinal.
    pub fn greedy_action(&self, state: &StateVector) -> Result<A> {
        let key = self.key(state)?;
        A::try_from_ordinal(argmax(&self.table.values(key)).unwrap_or(0))
    }

    pub fn q_value(&self, state: &StateVector, action: A) -> Result<f64> {
        Ok(self.table.get(self.key(state)?, action.ordinal()))
    }

    /// All action values for `state` in ordinal order.
    pub fn q_row(&self, state: &StateVector) -> Result<Vec<f64>> {
        Ok(self.table.values(self.key(state)?))
    }

    /// Overwrites one Q-value.
    pub fn set_q_value(&self, state: &StateVector, action: A, value: f64) -> Result<()> {
        if !value.is_finite() {
            return Err(RLError::non_finite("Q-value", value));
        }
        self.table.set(self.key(state)?, action.ordinal(), value)
    }

    /// One Q-learning step on a non-terminal transition:
    ///
    /// ```text
    /// td = r + γ·max_a' Q(s', a') − Q(s, a)
    /// Q(s, a) += α·td
    /// ```
    ///
    /// Returns the TD-error.
    pub fn learn(
        &self,
        state: &StateVector,
        action: A,
        reward: f64,
        next_state: &StateVector,
    ) -> Result<f64> {
        if !reward.is_finite() {
            return Err(RLError::non_finite("reward", reward));
        }
        let key = self.key(state)?;
        let next_key = self.key(next_state)?;
        self.update(key, action, reward, Some(next_key), 1.0)
    }

    /// Like [`QAgent::learn`], but a terminal transition does not bootstrap.
    pub fn learn_experience(&self, experience: &Experience<A>) -> Result<f64> {
        experience.validate(self.state_dim)?;
        let key = StateKey::from_state(experience.state(), self.config.state_resolution);
        let next = (!experience.done())
            .then(|| StateKey::from_state(experience.next_state(), self.config.state_resolution));
        self.update(key, experience.action(), experience.reward(), next, 1.0)
    }

    /// Applies the update to every transition, scaling each step by its
    /// importance-sampling weight: `ΔQ = α·td·w`.
    ///
    /// The whole batch is validated before any entry is touched. Returns the
    /// raw (unweighted) TD-errors in batch order.
    pub fn train_on_batch(&self, batch: &[Experience<A>], weights: &[f64]) -> Result<Vec<f64>> {
        if batch.len() != weights.len() {
            return Err(RLError::InvalidInput(format!(
                "{} experiences but {} weights",
                batch.len(),
                weights.len()
            )));
        }
        for (experience, &w) in batch.iter().zip(weights) {
            experience.validate(self.state_dim)?;
            if !w.is_finite() || w < 0.0 {
                return Err(RLError::InvalidInput(format!(
                    "importance weight must be finite and non-negative, got {w}"
                )));
            }
        }
        batch
            .iter()
            .zip(weights)
            .map(|(experience, &w)| {
                let key = StateKey::from_state(experience.state(), self.config.state_resolution);
                let next = (!experience.done()).then(|| {
                    StateKey::from_state(experience.next_state(), self.config.state_resolution)
                });
                self.update(key, experience.action(), experience.reward(), next, w)
            })
            .collect()
    }

    fn update(
        &self,
        key: StateKey,
        action: A,
        reward: f64,
        next: Option<StateKey>,
        weight: f64,
    ) -> Result<f64> {
        let bootstrap = next.map_or(0.0, |k| self.table.max_value(k));
        let current = self.table.get(key, action.ordinal());
        let td_error = reward + self.config.discount_factor * bootstrap - current;
        if !td_error.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "TD-error became {td_error}"
            )));
        }
        self.table.set(
            key,
            action.ordinal(),
            current + self.config.learning_rate * td_error * weight,
        )?;
        self.updates.fetch_add(1, Ordering::Relaxed);
        self.td_errors.lock().push(td_error.abs());
        Ok(td_error)
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

    /// Number of materialized states.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Forgets every learned value.
    pub fn reset(&self) {
        self.table.clear();
        self.updates.store(0, Ordering::Release);
        self.td_errors.lock().clear();
    }

    pub fn export_q_table(&self) -> Vec<(StateKey, Vec<f64>)> {
        self.table.export()
    }

    pub fn import_q_table(&self, rows: Vec<(StateKey, Vec<f64>)>) -> Result<()> {
        self.table.import(rows)
    }

    pub fn save_model(&self, path: &Path) -> Result<()> {
        let entries = self
            .export_q_table()
            .into_iter()
            .map(|(k, v)| (k.0, v))
            .collect();
        ModelFile::new(
            ALGORITHM,
            self.updates.load(Ordering::Acquire),
            self.config.clone(),
            self.exploration_rate(),
            ModelPayload::QTable {
                action_count: A::COUNT,
                entries,
            },
        )
        .write(path)
    }

    /// Loads a table written by [`QAgent::save_model`] and restores its
    /// exploration rate. The agent's own hyperparameters are kept.
    pub fn load_model(&self, path: &Path) -> Result<()> {
        let file = ModelFile::read(path)?;
        file.expect_algorithm(ALGORITHM, path)?;
        let ModelPayload::QTable {
            action_count,
            entries,
        } = file.payload
        else {
            return Err(RLError::model_io(path, "payload is not a Q-table"));
        };
        if action_count != A::COUNT {
            return Err(RLError::model_io(
                path,
                format!("table has {action_count} actions, agent has {}", A::COUNT),
            ));
        }
        let rows = entries.into_iter().map(|(k, v)| (StateKey(k), v)).collect();
        self.import_q_table(rows)
            .map_err(|e| RLError::model_io(path, e))?;
        self.set_exploration_rate(file.exploration_rate.clamp(0.0, 1.0))
    }
}

impl<A: Action> Policy<A> for QAgent<A> {
    fn select_action(&self, state: &StateVector) -> Result<A> {
        self.decide_action(state)
    }

    fn name(&self) -> &str {
        ALGORITHM
    }
}

impl<A: Action> Learner<A> for QAgent<A> {
    fn ingest(&self, _agent: AgentId, experience: Experience<A>) -> Result<()> {
        match self.learn_experience(&experience) {
            Ok(_) => Ok(()),
            Err(RLError::NumericalInstability(reason)) => {
                tracing::warn!(%reason, "discarding tabular update");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn exploration_rate(&self) -> f64 {
        QAgent::exploration_rate(self)
    }

    fn set_exploration_rate(&self, rate: f64) -> Result<()> {
        QAgent::set_exploration_rate(self, rate)
    }

    fn save_model(&self, path: &Path) -> Result<()> {
        QAgent::save_model(self, path)
    }

    fn load_model(&self, path: &Path) -> Result<()> {
        QAgent::load_model(self, path)
    }

    fn stats(&self) -> LearnerStats {
        let mut stats = LearnerStats::new(
            ALGORITHM,
            self.updates.load(Ordering::Acquire),
            self.exploration_rate(),
        );
        stats.avg_td_error = self.td_errors.lock().mean();
        stats.table_rows = Some(self.len());
        stats
    }
}

impl<A> std::fmt::Debug for QAgent<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QAgent")
            .field("state_dim", &self.state_dim)
            .field("table", &self.table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::types::GameAction;

    fn agent(lr: f64, gamma: f64) -> QAgent<GameAction> {
        let config = RLConfig {
            learning_rate: lr,
            discount_factor: gamma,
            exploration_rate: 0.0,
            exploration_min: 0.0001,
            seed: Some(5),
            ..RLConfig::default()
        };
        QAgent::new(2, config).unwrap()
    }

    fn s(x: f64) -> StateVector {
        StateVector::new(vec![x, 0.0])
    }

    #[test]
    fn unknown_state_is_zero_and_greedy_picks_first() {
        let a = agent(0.5, 0.9);
        assert_eq!(a.q_row(&s(1.0)).unwrap(), vec![0.0; GameAction::COUNT]);
        assert_eq!(a.decide_action(&s(1.0)).unwrap(), GameAction::MoveForward);
    }

    #[test]
    fn learn_applies_exact_td_update() {
        let a = agent(0.5, 0.9);
        a.set_q_value(&s(1.0), GameAction::Jump, 2.0).unwrap();
        a.set_q_value(&s(2.0), GameAction::Attack, 4.0).unwrap();
        a.set_q_value(&s(2.0), GameAction::Idle, -1.0).unwrap();
        let td = a.learn(&s(1.0), GameAction::Jump, 1.0, &s(2.0)).unwrap();
        // 1 + 0.9·4 − 2
        assert!((td - 2.6).abs() < 1e-12);
        let q = a.q_value(&s(1.0), GameAction::Jump).unwrap();
        assert!((q - (2.0 + 0.5 * 2.6)).abs() < 1e-12);
    }

    #[test]
    fn terminal_experience_does_not_bootstrap() {
        let a = agent(1.0, 0.9);
        a.set_q_value(&s(2.0), GameAction::Attack, 100.0).unwrap();
        let exp = Experience::new(s(1.0), GameAction::Idle, 3.0, s(2.0), true).unwrap();
        let td = a.learn_experience(&exp).unwrap();
        assert!((td - 3.0).abs() < 1e-12);
        assert!((a.q_value(&s(1.0), GameAction::Idle).unwrap() - 3.0).abs() < 1e-12);
    }

    #[test]
    fn batch_scales_by_weight_and_returns_raw_td() {
        let a = agent(0.5, 0.0);
        let batch = vec![
            Experience::new(s(1.0), GameAction::Jump, 2.0, s(1.0), true).unwrap(),
            Experience::new(s(3.0), GameAction::Jump, 4.0, s(3.0), true).unwrap(),
        ];
        let tds = a.train_on_batch(&batch, &[0.5, 1.0]).unwrap();
        assert_eq!(tds, vec![2.0, 4.0]);
        assert!((a.q_value(&s(1.0), GameAction::Jump).unwrap() - 0.5).abs() < 1e-12);
        assert!((a.q_value(&s(3.0), GameAction::Jump).unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn batch_is_validated_up_front() {
        let a = agent(0.5, 0.0);
        let good = Experience::new(s(1.0), GameAction::Jump, 2.0, s(1.0), true).unwrap();
        let bad_state = StateVector::new(vec![0.0; 3]);
        let bad = Experience::new(bad_state.clone(), GameAction::Jump, 2.0, bad_state, true).unwrap();
        assert!(a.train_on_batch(&[good.clone(), bad], &[1.0, 1.0]).is_err());
        assert!(a.is_empty());
        assert!(a.train_on_batch(&[good], &[1.0, 1.0]).is_err());
    }

    #[test]
    fn wrong_length_state_is_rejected() {
        let a = agent(0.5, 0.9);
        let err = a.decide_action(&StateVector::new(vec![0.0; 5])).unwrap_err();
        assert_eq!(err, RLError::state_length(2, 5));
    }

    #[test]
    fn full_exploration_visits_every_action() {
        let a = agent(0.5, 0.9);
        a.set_exploration_rate(1.0).unwrap();
        let mut seen = [false; GameAction::COUNT];
        for _ in 0..400 {
            seen[a.decide_action(&s(0.0)).unwrap().ordinal()] = true;
        }
        assert!(seen.iter().all(|&x| x));
        assert!(a.set_exploration_rate(1.5).is_err());
    }

    #[test]
    fn export_import_round_trip() {
        let a = agent(0.5, 0.9);
        a.learn(&s(1.0), GameAction::Jump, 1.0, &s(2.0)).unwrap();
        a.learn(&s(2.0), GameAction::Idle, -1.0, &s(1.0)).unwrap();
        let table = a.export_q_table();
        let b = agent(0.5, 0.9);
        b.import_q_table(table.clone()).unwrap();
        assert_eq!(b.export_q_table(), table);
        a.reset();
        assert!(a.is_empty());
    }

    #[test]
    fn stats_track_updates() {
        let a = agent(0.5, 0.9);
        a.ingest(0, Experience::new(s(1.0), GameAction::Jump, 1.0, s(2.0), false).unwrap())
            .unwrap();
        let stats = a.stats();
        assert_eq!(stats.train_steps, 1);
        assert_eq!(stats.table_rows, Some(1));
        assert!((stats.avg_td_error.unwrap() - 1.0).abs() < 1e-12);
    }
}
