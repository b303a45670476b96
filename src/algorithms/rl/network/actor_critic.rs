//! Dense actor-critic pair for PPO.
//!
//! The actor maps a state to action logits; the critic maps it to a scalar
//! value. Each has its own Adam optimizer.

use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::mlp::{Adam, Mlp};
use super::{log_softmax_rows, softmax_rows, ActorCritic, NamedParams, PolicyBatch, PolicyStepStats};
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::training::objective::clipped_surrogate;

#[derive(Debug, Clone)]
pub struct MlpActorCritic {
    actor: Mlp,
    critic: Mlp,
    actor_opt: Adam,
    critic_opt: Adam,
    max_grad_norm: f64,
}

impl MlpActorCritic {
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_count: usize,
        config: &RLConfig,
        rng: &mut R,
    ) -> Self {
        let hidden = [config.hidden_size, config.hidden_size];
        let actor = Mlp::new(state_dim, &hidden, action_count, rng);
        let critic = Mlp::new(state_dim, &hidden, 1, rng);
        let actor_opt = Adam::new(&actor, config.learning_rate);
        let critic_opt = Adam::new(&critic, config.learning_rate);
        Self {
            actor,
            critic,
            actor_opt,
            critic_opt,
            max_grad_norm: config.max_grad_norm,
        }
    }
}

impl ActorCritic for MlpActorCritic {
    fn state_dim(&self) -> usize {
        self.actor.input_dim()
    }

    fn action_count(&self) -> usize {
        self.actor.output_dim()
    }

    fn action_probs(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        Ok(softmax_rows(&self.actor.forward(states)?))
    }

    fn log_probs(&self, states: ArrayView2<'_, f64>, actions: &[usize]) -> Result<Vec<f64>> {
        let log_p = log_softmax_rows(&self.actor.forward(states)?);
        actions
            .iter()
            .enumerate()
            .map(|(i, &a)| {
                log_p.get((i, a)).copied().ok_or_else(|| {
                    RLError::InvalidInput(format!("action ordinal {a} out of range"))
                })
            })
            .collect()
    }

    fn values(&self, states: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        Ok(self.critic.forward(states)?.column(0).to_vec())
    }

    fn actor_step(&mut self, batch: &PolicyBatch<'_>) -> Result<PolicyStepStats> {
        batch.validate()?;
        let n = batch.len();
        if n == 0 {
            return Ok(PolicyStepStats::default());
        }
        let k = self.action_count();
        if let Some(&a) = batch.actions.iter().find(|&&a| a >= k) {
            return Err(RLError::InvalidInput(format!(
                "action ordinal {a} outside 0..{k}"
            )));
        }

        let cache = self.actor.forward_cached(batch.states)?;
        let log_p = log_softmax_rows(cache.output());
        let probs = log_p.mapv(f64::exp);

        let inv_n = 1.0 / n as f64;
        let mut d_logits = Array2::zeros((n, k));
        let mut surrogate = 0.0;
        let mut entropy = 0.0;
        let mut clipped_count = 0usize;

        for i in 0..n {
            let a = batch.actions[i];
            let advantage = batch.advantages[i];
            let ratio = (log_p[[i, a]] - batch.old_log_probs[i]).exp();
            let term = clipped_surrogate(ratio, advantage, batch.clip_epsilon);
            surrogate += term.value;

            let h: f64 = -(0..k).map(|j| probs[[i, j]] * log_p[[i, j]]).sum::<f64>();
            entropy += h;

            for j in 0..k {
                let indicator = if j == a { 1.0 } else { 0.0 };
                // d(-r·A)/dz_j = -A·r·(1[j=a] − π_j); zero on the clipped branch.
                let policy_grad = if term.clipped {
                    0.0
                } else {
                    -advantage * ratio * (indicator - probs[[i, j]])
                };
                // d(-c·H)/dz_j = c·π_j·(log π_j + H)
                let entropy_grad =
                    batch.entropy_coef * probs[[i, j]] * (log_p[[i, j]] + h);
                d_logits[[i, j]] = (policy_grad + entropy_grad) * inv_n;
            }
            if term.clipped {
                clipped_count += 1;
            }
        }

        let loss = -(surrogate * inv_n) - batch.entropy_coef * entropy * inv_n;
        if !loss.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "actor loss is {loss}"
            )));
        }
        let mut grads = self.actor.backward(&cache, d_logits);
        if !grads.is_finite() {
            return Err(RLError::NumericalInstability(
                "actor gradient is not finite".into(),
            ));
        }
        grads.clip_norm(self.max_grad_norm);
        self.actor_opt.step(&mut self.actor, &grads);

        Ok(PolicyStepStats {
            loss,
            entropy: entropy * inv_n,
            clip_fraction: clipped_count as f64 * inv_n,
        })
    }

    fn critic_step(&mut self, states: ArrayView2<'_, f64>, returns: &[f64]) -> Result<f64> {
        let n = states.nrows();
        if returns.len() != n {
            return Err(RLError::InvalidInput(format!(
                "{n} states but {} returns",
                returns.len()
            )));
        }
        if n == 0 {
            return Ok(0.0);
        }
        let cache = self.critic.forward_cached(states)?;
        let values = cache.output();
        let mut d_out = Array2::zeros((n, 1));
        let mut loss = 0.0;
        for i in 0..n {
            let diff = values[[i, 0]] - returns[i];
            loss += 0.5 * diff * diff;
            d_out[[i, 0]] = diff / n as f64;
        }
        loss /= n as f64;
        if !loss.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "critic loss is {loss}"
            )));
        }
        let mut grads = self.critic.backward(&cache, d_out);
        if !grads.is_finite() {
            return Err(RLError::NumericalInstability(
                "critic gradient is not finite".into(),
            ));
        }
        grads.clip_norm(self.max_grad_norm);
        self.critic_opt.step(&mut self.critic, &grads);
        Ok(loss)
    }

    fn state_dict(&self) -> Result<NamedParams> {
        let mut params = self.actor.state_dict("actor.");
        params.extend(self.critic.state_dict("critic."));
        Ok(params)
    }

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()> {
        let mut actor = self.actor.clone();
        let mut critic = self.critic.clone();
        actor.load_state_dict(params, "actor.")?;
        critic.load_state_dict(params, "critic.")?;
        self.actor_opt = Adam::new(&actor, self.actor_opt.learning_rate());
        self.critic_opt = Adam::new(&critic, self.critic_opt.learning_rate());
        self.actor = actor;
        self.critic = critic;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn model() -> MlpActorCritic {
        let config = RLConfig {
            learning_rate: 0.01,
            hidden_size: 16,
            ..RLConfig::default()
        };
        MlpActorCritic::new(2, 3, &config, &mut StdRng::seed_from_u64(11))
    }

    #[test]
    fn probabilities_are_a_distribution() {
        let m = model();
        let p = m.action_probs(array![[0.1, 0.9], [-1.0, 2.0]].view()).unwrap();
        for row in p.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|&x| x > 0.0));
        }
        let lp = m.log_probs(array![[0.1, 0.9]].view(), &[2]).unwrap();
        assert!((lp[0].exp() - p[[0, 2]]).abs() < 1e-12);
    }

    #[test]
    fn positive_advantage_raises_action_probability() {
        let mut m = model();
        let states = array![[0.4, -0.3]];
        let before = m.action_probs(states.view()).unwrap()[[0, 1]];
        for _ in 0..20 {
            let old = m.log_probs(states.view(), &[1]).unwrap();
            m.actor_step(&PolicyBatch {
                states: states.view(),
                actions: &[1],
                old_log_probs: &old,
                advantages: &[1.0],
                clip_epsilon: 0.2,
                entropy_coef: 0.0,
            })
            .unwrap();
        }
        let after = m.action_probs(states.view()).unwrap()[[0, 1]];
        assert!(after > before);
    }

    #[test]
    fn clipped_samples_produce_no_policy_gradient() {
        let mut m = model();
        let states = array![[0.4, -0.3]];
        let before = m.action_probs(states.view()).unwrap();
        // Old log-prob far below the current one: ratio ≫ 1 + ε with A > 0.
        let stats = m
            .actor_step(&PolicyBatch {
                states: states.view(),
                actions: &[0],
                old_log_probs: &[-50.0],
                advantages: &[1.0],
                clip_epsilon: 0.2,
                entropy_coef: 0.0,
            })
            .unwrap();
        assert_eq!(stats.clip_fraction, 1.0);
        assert_eq!(before, m.action_probs(states.view()).unwrap());
    }

    #[test]
    fn critic_step_fits_returns() {
        let mut m = model();
        let states = array![[1.0, 0.0], [0.0, 1.0]];
        let returns = [1.0, -1.0];
        let first = m.critic_step(states.view(), &returns).unwrap();
        let mut last = first;
        for _ in 0..300 {
            last = m.critic_step(states.view(), &returns).unwrap();
        }
        assert!(last < first);
        assert!(last < 0.05);
    }

    #[test]
    fn state_dict_round_trip() {
        let a = model();
        let config = RLConfig {
            hidden_size: 16,
            ..RLConfig::default()
        };
        let mut b = MlpActorCritic::new(2, 3, &config, &mut StdRng::seed_from_u64(99));
        b.load_state_dict(&a.state_dict().unwrap()).unwrap();
        let s = array![[0.2, 0.3]];
        assert_eq!(a.values(s.view()).unwrap(), b.values(s.view()).unwrap());
        assert_eq!(
            a.action_probs(s.view()).unwrap(),
            b.action_probs(s.view()).unwrap()
        );
    }
}
