use ndarray::{Array2, ArrayView2};
use rand::Rng;

use super::mlp::{Adam, Mlp};
use super::{NamedParams, QFunction};
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};

/// MLP Q-network: `state_dim → hidden → hidden → action_count`.
#[derive(Debug, Clone)]
pub struct MlpQNetwork {
    net: Mlp,
    optimizer: Adam,
    max_grad_norm: f64,
}

impl MlpQNetwork {
    pub fn new<R: Rng + ?Sized>(
        state_dim: usize,
        action_count: usize,
        config: &RLConfig,
        rng: &mut R,
    ) -> Self {
        let hidden = [config.hidden_size, config.hidden_size];
        let net = Mlp::new(state_dim, &hidden, action_count, rng);
        let optimizer = Adam::new(&net, config.learning_rate);
        Self {
            net,
            optimizer,
            max_grad_norm: config.max_grad_norm,
        }
    }
}

impl QFunction for MlpQNetwork {
    fn state_dim(&self) -> usize {
        self.net.input_dim()
    }

    fn action_count(&self) -> usize {
        self.net.output_dim()
    }

    fn q_values(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.net.forward(states)
    }

    fn fit(
        &mut self,
        states: ArrayView2<'_, f64>,
        actions: &[usize],
        targets: &[f64],
        weights: &[f64],
    ) -> Result<f64> {
        let n = states.nrows();
        if actions.len() != n || targets.len() != n || weights.len() != n {
            return Err(RLError::InvalidInput(format!(
                "fit batch has {n} states, {} actions, {} targets, {} weights",
                actions.len(),
                targets.len(),
                weights.len()
            )));
        }
        if n == 0 {
            return Ok(0.0);
        }
        let action_count = self.action_count();
        if let Some(&a) = actions.iter().find(|&&a| a >= action_count) {
            return Err(RLError::InvalidInput(format!(
                "action ordinal {a} outside 0..{action_count}"
            )));
        }

        let cache = self.net.forward_cached(states)?;
        let q = cache.output();
        let mut d_output = Array2::zeros(q.dim());
        let mut loss = 0.0;
        for i in 0..n {
            let diff = q[[i, actions[i]]] - targets[i];
            loss += 0.5 * weights[i] * diff * diff;
            d_output[[i, actions[i]]] = weights[i] * diff / n as f64;
        }
        loss /= n as f64;
        if !loss.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "Q-network loss is {loss}"
            )));
        }

        let mut grads = self.net.backward(&cache, d_output);
        if !grads.is_finite() {
            return Err(RLError::NumericalInstability(
                "Q-network gradient is not finite".into(),
            ));
        }
        grads.clip_norm(self.max_grad_norm);
        self.optimizer.step(&mut self.net, &grads);
        Ok(loss)
    }

    fn sync_from(&mut self, source: &Self) -> Result<()> {
        self.net.copy_from(&source.net)
    }

    fn state_dict(&self) -> Result<NamedParams> {
        Ok(self.net.state_dict(""))
    }

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()> {
        self.net.load_state_dict(params, "")?;
        self.optimizer = Adam::new(&self.net, self.optimizer.learning_rate());
        Ok(())
    }
}
