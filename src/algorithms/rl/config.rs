//! Hyperparameters for the learners and the training orchestrator.
//!
//! Each trainer owns its own [`RLConfig`], so several trainers with
//! independent schedules can coexist. The configuration is also exposed as a
//! flat key-value surface (`learning-rate = 0.001`) for external config files.

use serde::{Deserialize, Serialize};

use super::error::{RLError, Result};

/// Training hyperparameters shared by the tabular agent, DQN and PPO trainers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RLConfig {
    // --- Shared ---
    /// Step size α (tabular update) or optimizer learning rate (networks).
    pub learning_rate: f64,
    /// Discount factor γ.
    pub discount_factor: f64,
    /// Initial ε for ε-greedy exploration.
    pub exploration_rate: f64,
    /// Multiplicative ε decay applied per DQN training step.
    pub exploration_decay: f64,
    /// Lower bound for ε; strictly positive.
    pub exploration_min: f64,
    /// RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,

    // --- Replay ---
    /// Capacity C of the prioritized replay buffer.
    pub experience_buffer_size: usize,
    /// Replay batch size.
    pub batch_size: usize,
    /// Priority exponent α.
    pub per_alpha: f64,
    /// Initial importance-sampling exponent β.
    pub per_beta_start: f64,
    /// β increment per sampled batch (β saturates at 1).
    pub per_beta_increment: f64,
    /// Priority floor ε added to |TD-error|.
    pub per_epsilon: f64,

    // --- DQN ---
    /// Training steps between target-network syncs.
    pub target_update_frequency: u64,
    /// Select next actions with the online network, evaluate with the target.
    pub double_dqn: bool,
    /// Batches whose |TD-error| exceeds this bound are discarded.
    pub max_td_error: f64,

    // --- Networks ---
    /// Width of each hidden layer.
    pub hidden_size: usize,
    /// Gradient L2-norm clip.
    pub max_grad_norm: f64,

    // --- PPO / GAE ---
    /// GAE λ.
    pub gae_lambda: f64,
    /// PPO clip parameter ε_clip.
    pub clip_epsilon: f64,
    /// Optimization epochs E per update.
    pub ppo_epochs: usize,
    /// Completed trajectories required before an update.
    pub trajectories_per_update: usize,
    /// Episodes longer than this are force-closed.
    pub max_trajectory_length: usize,
    /// Entropy bonus coefficient.
    pub entropy_coef: f64,

    // --- Tabular ---
    /// Grid width used to discretize states into Q-table keys.
    pub state_resolution: f64,
}

impl Default for RLConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            discount_factor: 0.99,
            exploration_rate: 0.1,
            exploration_decay: 0.995,
            exploration_min: 0.01,
            seed: None,
            experience_buffer_size: 100_000,
            batch_size: 32,
            per_alpha: 0.6,
            per_beta_start: 0.4,
            per_beta_increment: 0.001,
            per_epsilon: 0.01,
            target_update_frequency: 100,
            double_dqn: false,
            max_td_error: 1.0e6,
            hidden_size: 64,
            max_grad_norm: 0.5,
            gae_lambda: 0.95,
            clip_epsilon: 0.2,
            ppo_epochs: 4,
            trajectories_per_update: 4,
            max_trajectory_length: 1_000,
            entropy_coef: 0.01,
            state_resolution: 0.1,
        }
    }
}

/// All keys accepted by [`RLConfig::set`].
pub const CONFIG_KEYS: &[&str] = &[
    "learning-rate",
    "discount-factor",
    "exploration-rate",
    "exploration-decay",
    "exploration-min",
    "seed",
    "experience-buffer-size",
    "batch-size",
    "per-alpha",
    "per-beta-start",
    "per-beta-increment",
    "per-epsilon",
    "target-update-frequency",
    "double-dqn",
    "max-td-error",
    "hidden-size",
    "max-grad-norm",
    "gae-lambda",
    "clip-epsilon",
    "ppo-epochs",
    "trajectories-per-update",
    "max-trajectory-length",
    "entropy-coef",
    "state-resolution",
];

impl RLConfig {
    /// Builds a configuration from `(key, value)` pairs applied over the defaults.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidConfig`] on an unknown key, an unparsable value, or
    /// a combination rejected by [`RLConfig::validate`].
    pub fn from_key_values<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (key, value) in pairs {
            config.set(key.as_ref(), value.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses `key = value` lines. Blank lines and `#` comments are ignored.
    pub fn parse(text: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                RLError::InvalidConfig(format!("line {}: expected `key = value`", lineno + 1))
            })?;
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
        Self::from_key_values(pairs)
    }

    /// Sets a single key. Does not re-validate the whole configuration.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "learning-rate" => self.learning_rate = parse_value(key, value)?,
            "discount-factor" => self.discount_factor = parse_value(key, value)?,
            "exploration-rate" => self.exploration_rate = parse_value(key, value)?,
            "exploration-decay" => self.exploration_decay = parse_value(key, value)?,
            "exploration-min" => self.exploration_min = parse_value(key, value)?,
            "seed" => {
                self.seed = match value {
                    "" | "none" => None,
                    v => Some(parse_value(key, v)?),
                }
            }
            "experience-buffer-size" => self.experience_buffer_size = parse_value(key, value)?,
            "batch-size" => self.batch_size = parse_value(key, value)?,
            "per-alpha" => self.per_alpha = parse_value(key, value)?,
            "per-beta-start" => self.per_beta_start = parse_value(key, value)?,
            "per-beta-increment" => self.per_beta_increment = parse_value(key, value)?,
            "per-epsilon" => self.per_epsilon = parse_value(key, value)?,
            "target-update-frequency" => self.target_update_frequency = parse_value(key, value)?,
            "double-dqn" => self.double_dqn = parse_value(key, value)?,
            "max-td-error" => self.max_td_error = parse_value(key, value)?,
            "hidden-size" => self.hidden_size = parse_value(key, value)?,
            "max-grad-norm" => self.max_grad_norm = parse_value(key, value)?,
            "gae-lambda" => self.gae_lambda = parse_value(key, value)?,
            "clip-epsilon" => self.clip_epsilon = parse_value(key, value)?,
            "ppo-epochs" => self.ppo_epochs = parse_value(key, value)?,
            "trajectories-per-update" => self.trajectories_per_update = parse_value(key, value)?,
            "max-trajectory-length" => self.max_trajectory_length = parse_value(key, value)?,
            "entropy-coef" => self.entropy_coef = parse_value(key, value)?,
            "state-resolution" => self.state_resolution = parse_value(key, value)?,
            other => {
                return Err(RLError::InvalidConfig(format!("unknown key `{other}`")));
            }
        }
        Ok(())
    }

    /// Returns the current value of `key` rendered as a string.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "learning-rate" => self.learning_rate.to_string(),
            "discount-factor" => self.discount_factor.to_string(),
            "exploration-rate" => self.exploration_rate.to_string(),
            "exploration-decay" => self.exploration_decay.to_string(),
            "exploration-min" => self.exploration_min.to_string(),
            "seed" => self
                .seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string()),
            "experience-buffer-size" => self.experience_buffer_size.to_string(),
            "batch-size" => self.batch_size.to_string(),
            "per-alpha" => self.per_alpha.to_string(),
            "per-beta-start" => self.per_beta_start.to_string(),
            "per-beta-increment" => self.per_beta_increment.to_string(),
            "per-epsilon" => self.per_epsilon.to_string(),
            "target-update-frequency" => self.target_update_frequency.to_string(),
            "double-dqn" => self.double_dqn.to_string(),
            "max-td-error" => self.max_td_error.to_string(),
            "hidden-size" => self.hidden_size.to_string(),
            "max-grad-norm" => self.max_grad_norm.to_string(),
            "gae-lambda" => self.gae_lambda.to_string(),
            "clip-epsilon" => self.clip_epsilon.to_string(),
            "ppo-epochs" => self.ppo_epochs.to_string(),
            "trajectories-per-update" => self.trajectories_per_update.to_string(),
            "max-trajectory-length" => self.max_trajectory_length.to_string(),
            "entropy-coef" => self.entropy_coef.to_string(),
            "state-resolution" => self.state_resolution.to_string(),
            _ => return None,
        };
        Some(value)
    }

    /// Checks value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        check_unit("discount-factor", self.discount_factor)?;
        check_unit("exploration-rate", self.exploration_rate)?;
        check_unit("exploration-decay", self.exploration_decay)?;
        check_unit("gae-lambda", self.gae_lambda)?;
        check_unit("per-beta-start", self.per_beta_start)?;
        check_positive("learning-rate", self.learning_rate)?;
        check_positive("exploration-min", self.exploration_min)?;
        check_positive("per-epsilon", self.per_epsilon)?;
        check_positive("clip-epsilon", self.clip_epsilon)?;
        check_positive("max-grad-norm", self.max_grad_norm)?;
        check_positive("max-td-error", self.max_td_error)?;
        check_positive("state-resolution", self.state_resolution)?;
        if !(self.per_alpha >= 0.0) || !self.per_alpha.is_finite() {
            return Err(RLError::InvalidConfig("per-alpha must be >= 0".into()));
        }
        if !(self.per_beta_increment >= 0.0) || !(self.entropy_coef >= 0.0) {
            return Err(RLError::InvalidConfig(
                "per-beta-increment and entropy-coef must be >= 0".into(),
            ));
        }
        if self.exploration_min > self.exploration_rate && self.exploration_rate > 0.0 {
            return Err(RLError::InvalidConfig(
                "exploration-min must not exceed exploration-rate".into(),
            ));
        }
        for (key, value) in [
            ("experience-buffer-size", self.experience_buffer_size),
            ("batch-size", self.batch_size),
            ("hidden-size", self.hidden_size),
            ("ppo-epochs", self.ppo_epochs),
            ("trajectories-per-update", self.trajectories_per_update),
            ("max-trajectory-length", self.max_trajectory_length),
        ] {
            if value == 0 {
                return Err(RLError::InvalidConfig(format!("{key} must be positive")));
            }
        }
        if self.target_update_frequency == 0 {
            return Err(RLError::InvalidConfig(
                "target-update-frequency must be positive".into(),
            ));
        }
        if self.batch_size > self.experience_buffer_size {
            return Err(RLError::InvalidConfig(format!(
                "batch-size {} exceeds experience-buffer-size {}",
                self.batch_size, self.experience_buffer_size
            )));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| RLError::InvalidConfig(format!("cannot parse `{value}` for `{key}`")))
}

fn check_unit(key: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(RLError::InvalidConfig(format!("{key} must lie in [0, 1], got {value}")))
    }
}

fn check_positive(key: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(RLError::InvalidConfig(format!("{key} must be positive, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = RLConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.exploration_min > 0.0);
        assert!(cfg.batch_size <= cfg.experience_buffer_size);
    }

    #[test]
    fn parse_flat_key_values() {
        let cfg = RLConfig::parse(
            "# tuned for the arena\n\
             learning-rate = 0.01\n\
             discount-factor=0.9\n\
             batch-size = 8   # small\n\
             experience-buffer-size = 64\n\
             double-dqn = true\n\
             seed = 7\n",
        )
        .unwrap();
        assert_eq!(cfg.learning_rate, 0.01);
        assert_eq!(cfg.discount_factor, 0.9);
        assert_eq!(cfg.batch_size, 8);
        assert_eq!(cfg.experience_buffer_size, 64);
        assert!(cfg.double_dqn);
        assert_eq!(cfg.seed, Some(7));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = RLConfig::from_key_values([("learning_rate", "0.1")]).unwrap_err();
        assert!(matches!(err, RLError::InvalidConfig(_)));
    }

    #[test]
    fn malformed_value_is_rejected() {
        let err = RLConfig::from_key_values([("batch-size", "many")]).unwrap_err();
        assert!(err.to_string().contains("batch-size"));
    }

    #[test]
    fn batch_larger_than_buffer_is_rejected() {
        let err = RLConfig::from_key_values([
            ("experience-buffer-size", "16"),
            ("batch-size", "32"),
        ])
        .unwrap_err();
        assert!(matches!(err, RLError::InvalidConfig(_)));
    }

    #[test]
    fn zero_exploration_floor_is_rejected() {
        let err = RLConfig::from_key_values([("exploration-min", "0")]).unwrap_err();
        assert!(matches!(err, RLError::InvalidConfig(_)));
    }

    #[test]
    fn get_round_trips_every_key() {
        let cfg = RLConfig::default();
        let mut rebuilt = RLConfig::default();
        for key in CONFIG_KEYS {
            let value = cfg.get(key).unwrap();
            rebuilt.set(key, &value).unwrap();
        }
        assert_eq!(cfg, rebuilt);
        assert!(cfg.get("no-such-key").is_none());
    }

    #[test]
    fn serde_uses_kebab_case() {
        let json = serde_json::to_value(RLConfig::default()).unwrap();
        assert!(json.get("gae-lambda").is_some());
        assert!(json.get("target-update-frequency").is_some());
        let partial: RLConfig = serde_json::from_str(r#"{"clip-epsilon": 0.3}"#).unwrap();
        assert_eq!(partial.clip_epsilon, 0.3);
        assert_eq!(partial.batch_size, RLConfig::default().batch_size);
    }
}
