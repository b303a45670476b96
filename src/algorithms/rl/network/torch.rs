//! libtorch-backed networks using tch-rs (PyTorch bindings).
//!
//! This is the training backend for real workloads: autograd, Adam and
//! gradient clipping come from libtorch and run on any [`Device`].
//! [`TorchDqnTrainer`] and [`TorchPpoTrainer`] wire these networks into the
//! trainers. The `ndarray` MLPs in [`super::mlp`] remain as the
//! dependency-free fallback used when the `rl-nn` feature is off.

use ndarray::{Array2, ArrayView2};
use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, Tensor};

use super::{ActorCritic, NamedParams, ParamTensor, PolicyBatch, PolicyStepStats, QFunction};
use crate::algorithms::rl::config::RLConfig;
use crate::algorithms::rl::error::{RLError, Result};
use crate::algorithms::rl::training::{DqnTrainer, PpoTrainer};
use crate::algorithms::rl::types::Action;

/// DQN trainer whose online and target networks live on libtorch.
pub type TorchDqnTrainer<A> = DqnTrainer<A, TorchQNetwork>;

/// PPO trainer whose actor and critic live on libtorch.
pub type TorchPpoTrainer<A> = PpoTrainer<A, TorchActorCritic>;

/// Validates `config` and seeds libtorch's generator from it.
fn prepare(state_dim: usize, config: &RLConfig) -> Result<()> {
    config.validate()?;
    if state_dim == 0 {
        return Err(RLError::InvalidConfig("state dimension must be positive".into()));
    }
    if let Some(seed) = config.seed {
        tch::manual_seed(seed as i64);
    }
    Ok(())
}

impl<A: Action> DqnTrainer<A, TorchQNetwork> {
    /// Creates a trainer with fresh libtorch networks on `device`.
    pub fn on_device(state_dim: usize, config: RLConfig, device: Device) -> Result<Self> {
        prepare(state_dim, &config)?;
        let online = TorchQNetwork::new(state_dim, A::COUNT, &config, device)?;
        let target = TorchQNetwork::new(state_dim, A::COUNT, &config, device)?;
        Self::with_networks(online, target, config)
    }
}

impl<A: Action> PpoTrainer<A, TorchActorCritic> {
    /// Creates a trainer with a fresh libtorch actor-critic on `device`.
    pub fn on_device(state_dim: usize, config: RLConfig, device: Device) -> Result<Self> {
        prepare(state_dim, &config)?;
        let network = TorchActorCritic::new(state_dim, A::COUNT, &config, device)?;
        Self::with_network(network, config)
    }
}

fn tch_err(e: tch::TchError) -> RLError {
    RLError::NumericalInstability(e.to_string())
}

/// Builds `input → hidden → hidden → output` under `p` with layers `l1..l3`.
fn mlp(p: nn::Path<'_>, input: usize, hidden: usize, output: usize) -> nn::Sequential {
    nn::seq()
        .add(nn::linear(&p / "l1", input as i64, hidden as i64, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(&p / "l2", hidden as i64, hidden as i64, Default::default()))
        .add_fn(|x| x.relu())
        .add(nn::linear(&p / "l3", hidden as i64, output as i64, Default::default()))
}

fn to_tensor(states: ArrayView2<'_, f64>, device: Device) -> Tensor {
    let (rows, cols) = states.dim();
    let flat: Vec<f64> = states.iter().copied().collect();
    Tensor::from_slice(&flat)
        .reshape([rows as i64, cols as i64])
        .to_kind(Kind::Float)
        .to_device(device)
}

fn to_vec(t: &Tensor) -> Result<Vec<f64>> {
    Vec::<f64>::try_from(&t.to_kind(Kind::Double).to_device(Device::Cpu).flatten(0, -1))
        .map_err(tch_err)
}

fn to_array(t: &Tensor) -> Result<Array2<f64>> {
    let size = t.size();
    let (rows, cols) = match size.as_slice() {
        [r, c] => (*r as usize, *c as usize),
        other => {
            return Err(RLError::InvalidInput(format!(
                "expected a 2-D tensor, got shape {other:?}"
            )))
        }
    };
    Array2::from_shape_vec((rows, cols), to_vec(t)?)
        .map_err(|e| RLError::InvalidInput(e.to_string()))
}

fn scalar(t: &Tensor) -> Result<f64> {
    f64::try_from(t).map_err(tch_err)
}

fn export_vars(vs: &nn::VarStore) -> Result<NamedParams> {
    let mut params = NamedParams::new();
    for (name, var) in vs.variables() {
        let shape = var.size().iter().map(|&d| d as usize).collect();
        params.insert(name, ParamTensor::new(shape, to_vec(&var)?));
    }
    Ok(params)
}

fn import_vars(vs: &mut nn::VarStore, params: &NamedParams) -> Result<()> {
    let device = vs.device();
    let mut vars = vs.variables();
    for (name, var) in vars.iter_mut() {
        let tensor = params
            .get(name)
            .ok_or_else(|| RLError::InvalidInput(format!("missing parameter `{name}`")))?;
        let expected: Vec<usize> = var.size().iter().map(|&d| d as usize).collect();
        if tensor.shape != expected || tensor.data.len() != tensor.numel() {
            return Err(RLError::InvalidInput(format!(
                "parameter `{name}` has shape {:?}, expected {expected:?}",
                tensor.shape
            )));
        }
        let shape: Vec<i64> = expected.iter().map(|&d| d as i64).collect();
        let value = Tensor::from_slice(&tensor.data)
            .reshape(shape)
            .to_kind(var.kind())
            .to_device(device);
        tch::no_grad(|| var.copy_(&value));
    }
    Ok(())
}

/// Q-network on libtorch with an Adam optimizer.
pub struct TorchQNetwork {
    vs: nn::VarStore,
    net: nn::Sequential,
    opt: nn::Optimizer,
    state_dim: usize,
    action_count: usize,
    max_grad_norm: f64,
}

impl TorchQNetwork {
    pub fn new(
        state_dim: usize,
        action_count: usize,
        config: &RLConfig,
        device: Device,
    ) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let net = mlp(vs.root(), state_dim, config.hidden_size, action_count);
        let opt = nn::Adam::default()
            .build(&vs, config.learning_rate)
            .map_err(tch_err)?;
        Ok(Self {
            vs,
            net,
            opt,
            state_dim,
            action_count,
            max_grad_norm: config.max_grad_norm,
        })
    }
}

impl QFunction for TorchQNetwork {
    fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn action_count(&self) -> usize {
        self.action_count
    }

    fn q_values(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        if states.ncols() != self.state_dim {
            return Err(RLError::state_length(self.state_dim, states.ncols()));
        }
        let out = tch::no_grad(|| self.net.forward(&to_tensor(states, self.vs.device())));
        to_array(&out)
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
            return Err(RLError::InvalidInput("fit batch lengths disagree".into()));
        }
        if states.ncols() != self.state_dim {
            return Err(RLError::state_length(self.state_dim, states.ncols()));
        }
        let device = self.vs.device();
        let x = to_tensor(states, device);
        let a = Tensor::from_slice(&actions.iter().map(|&a| a as i64).collect::<Vec<_>>())
            .to_device(device);
        let y = Tensor::from_slice(targets).to_kind(Kind::Float).to_device(device);
        let w = Tensor::from_slice(weights).to_kind(Kind::Float).to_device(device);

        let q = self
            .net
            .forward(&x)
            .gather(-1, &a.unsqueeze(-1), false)
            .squeeze_dim(-1);
        let loss = ((&q - &y).pow_tensor_scalar(2) * &w * 0.5).mean(Kind::Float);
        let value = scalar(&loss)?;
        if !value.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "Q-network loss is {value}"
            )));
        }
        self.opt.zero_grad();
        loss.backward();
        self.opt.clip_grad_norm(self.max_grad_norm);
        self.opt.step();
        Ok(value)
    }

    fn sync_from(&mut self, source: &Self) -> Result<()> {
        self.vs
            .copy(&source.vs)
            .map_err(|e| RLError::InvalidConfig(format!("target network sync failed: {e}")))
    }

    fn state_dict(&self) -> Result<NamedParams> {
        export_vars(&self.vs)
    }

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()> {
        import_vars(&mut self.vs, params)
    }
}

/// Actor and critic networks on libtorch, each with its own Adam optimizer.
pub struct TorchActorCritic {
    actor_vs: nn::VarStore,
    actor: nn::Sequential,
    critic_vs: nn::VarStore,
    critic: nn::Sequential,
    actor_opt: nn::Optimizer,
    critic_opt: nn::Optimizer,
    state_dim: usize,
    action_count: usize,
    max_grad_norm: f64,
}

impl TorchActorCritic {
    pub fn new(
        state_dim: usize,
        action_count: usize,
        config: &RLConfig,
        device: Device,
    ) -> Result<Self> {
        let actor_vs = nn::VarStore::new(device);
        let actor = mlp(actor_vs.root() / "actor", state_dim, config.hidden_size, action_count);
        let critic_vs = nn::VarStore::new(device);
        let critic = mlp(critic_vs.root() / "critic", state_dim, config.hidden_size, 1);
        let actor_opt = nn::Adam::default()
            .build(&actor_vs, config.learning_rate)
            .map_err(tch_err)?;
        let critic_opt = nn::Adam::default()
            .build(&critic_vs, config.learning_rate)
            .map_err(tch_err)?;
        Ok(Self {
            actor_vs,
            actor,
            critic_vs,
            critic,
            actor_opt,
            critic_opt,
            state_dim,
            action_count,
            max_grad_norm: config.max_grad_norm,
        })
    }

    fn check(&self, states: &ArrayView2<'_, f64>) -> Result<()> {
        if states.ncols() != self.state_dim {
            return Err(RLError::state_length(self.state_dim, states.ncols()));
        }
        Ok(())
    }
}

impl ActorCritic for TorchActorCritic {
    fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn action_count(&self) -> usize {
        self.action_count
    }

    fn action_probs(&self, states: ArrayView2<'_, f64>) -> Result<Array2<f64>> {
        self.check(&states)?;
        let x = to_tensor(states, self.actor_vs.device());
        let probs = tch::no_grad(|| self.actor.forward(&x).softmax(-1, Kind::Float));
        to_array(&probs)
    }

    fn values(&self, states: ArrayView2<'_, f64>) -> Result<Vec<f64>> {
        self.check(&states)?;
        let x = to_tensor(states, self.critic_vs.device());
        let v = tch::no_grad(|| self.critic.forward(&x).squeeze_dim(-1));
        to_vec(&v)
    }

    fn actor_step(&mut self, batch: &PolicyBatch<'_>) -> Result<PolicyStepStats> {
        batch.validate()?;
        self.check(&batch.states)?;
        if batch.is_empty() {
            return Ok(PolicyStepStats::default());
        }
        let device = self.actor_vs.device();
        let x = to_tensor(batch.states, device);
        let actions = Tensor::from_slice(&batch.actions.iter().map(|&a| a as i64).collect::<Vec<_>>())
            .to_device(device);
        let old = Tensor::from_slice(batch.old_log_probs)
            .to_kind(Kind::Float)
            .to_device(device);
        let adv = Tensor::from_slice(batch.advantages)
            .to_kind(Kind::Float)
            .to_device(device);

        let log_probs = self.actor.forward(&x).log_softmax(-1, Kind::Float);
        let new = log_probs
            .gather(-1, &actions.unsqueeze(-1), false)
            .squeeze_dim(-1);
        let ratio = (&new - &old).exp();
        let surr1 = &ratio * &adv;
        let surr2 = ratio.clamp(1.0 - batch.clip_epsilon, 1.0 + batch.clip_epsilon) * &adv;
        let clipped = surr2.lt_tensor(&surr1).to_kind(Kind::Float).mean(Kind::Float);
        let surrogate = surr1.min_other(&surr2).mean(Kind::Float);
        let entropy = -(log_probs.exp() * &log_probs)
            .sum_dim_intlist([-1].as_slice(), false, Kind::Float)
            .mean(Kind::Float);
        let loss = -&surrogate - batch.entropy_coef * &entropy;

        let loss_value = scalar(&loss)?;
        if !loss_value.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "actor loss is {loss_value}"
            )));
        }
        self.actor_opt.zero_grad();
        loss.backward();
        self.actor_opt.clip_grad_norm(self.max_grad_norm);
        self.actor_opt.step();

        Ok(PolicyStepStats {
            loss: loss_value,
            entropy: scalar(&entropy)?,
            clip_fraction: scalar(&clipped)?,
        })
    }

    fn critic_step(&mut self, states: ArrayView2<'_, f64>, returns: &[f64]) -> Result<f64> {
        self.check(&states)?;
        if returns.len() != states.nrows() {
            return Err(RLError::InvalidInput("critic batch lengths disagree".into()));
        }
        let device = self.critic_vs.device();
        let x = to_tensor(states, device);
        let r = Tensor::from_slice(returns).to_kind(Kind::Float).to_device(device);
        let v = self.critic.forward(&x).squeeze_dim(-1);
        let loss = ((&v - &r).pow_tensor_scalar(2) * 0.5).mean(Kind::Float);
        let value = scalar(&loss)?;
        if !value.is_finite() {
            return Err(RLError::NumericalInstability(format!(
                "critic loss is {value}"
            )));
        }
        self.critic_opt.zero_grad();
        loss.backward();
        self.critic_opt.clip_grad_norm(self.max_grad_norm);
        self.critic_opt.step();
        Ok(value)
    }

    fn state_dict(&self) -> Result<NamedParams> {
        let mut params = export_vars(&self.actor_vs)?;
        params.extend(export_vars(&self.critic_vs)?);
        Ok(params)
    }

    fn load_state_dict(&mut self, params: &NamedParams) -> Result<()> {
        import_vars(&mut self.actor_vs, params)?;
        import_vars(&mut self.critic_vs, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::environment::CorridorAction;
    use crate::algorithms::rl::observation::StateVector;
    use crate::algorithms::rl::training::{LearnOutcome, PpoOutcome};
    use crate::algorithms::rl::types::Experience;
    use ndarray::Array2;

    fn config() -> RLConfig {
        RLConfig {
            learning_rate: 0.01,
            batch_size: 4,
            experience_buffer_size: 64,
            target_update_frequency: 3,
            hidden_size: 8,
            trajectories_per_update: 2,
            ppo_epochs: 2,
            seed: Some(11),
            ..RLConfig::default()
        }
    }

    fn exp(x: f64, action: CorridorAction, reward: f64, done: bool) -> Experience<CorridorAction> {
        Experience::new(
            StateVector::new(vec![x, 1.0 - x]),
            action,
            reward,
            StateVector::new(vec![1.0 - x, x]),
            done,
        )
        .unwrap()
    }

    #[test]
    fn q_network_forward_shape() {
        let q = TorchQNetwork::new(5, 3, &RLConfig::default(), Device::Cpu).unwrap();
        let out = q.q_values(Array2::zeros((4, 5)).view()).unwrap();
        assert_eq!(out.dim(), (4, 3));
    }

    #[test]
    fn actor_critic_shapes() {
        let ac = TorchActorCritic::new(5, 4, &RLConfig::default(), Device::Cpu).unwrap();
        let states = Array2::zeros((2, 5));
        let p = ac.action_probs(states.view()).unwrap();
        assert_eq!(p.dim(), (2, 4));
        assert_eq!(ac.values(states.view()).unwrap().len(), 2);
    }

    #[test]
    fn state_dict_round_trip() {
        let a = TorchQNetwork::new(3, 2, &RLConfig::default(), Device::Cpu).unwrap();
        let mut b = TorchQNetwork::new(3, 2, &RLConfig::default(), Device::Cpu).unwrap();
        b.load_state_dict(&a.state_dict().unwrap()).unwrap();
        let s = Array2::from_elem((1, 3), 0.5);
        let qa = a.q_values(s.view()).unwrap();
        let qb = b.q_values(s.view()).unwrap();
        assert!((qa - qb).iter().all(|d| d.abs() < 1e-6));
    }

    #[test]
    fn sync_copies_trained_parameters() {
        let cfg = config();
        let mut online = TorchQNetwork::new(2, 2, &cfg, Device::Cpu).unwrap();
        let mut target = TorchQNetwork::new(2, 2, &cfg, Device::Cpu).unwrap();
        let states = Array2::from_shape_vec((2, 2), vec![0.0, 1.0, 1.0, 0.0]).unwrap();
        for _ in 0..5 {
            online.fit(states.view(), &[0, 1], &[1.0, -1.0], &[1.0, 1.0]).unwrap();
        }
        target.sync_from(&online).unwrap();
        let a = online.q_values(states.view()).unwrap();
        let b = target.q_values(states.view()).unwrap();
        assert!((a - b).iter().all(|d| d.abs() < 1e-6));
        assert!(!target.state_dict().unwrap().is_empty());
    }

    #[test]
    fn sync_between_different_shapes_is_an_error() {
        let small = TorchQNetwork::new(2, 2, &config(), Device::Cpu).unwrap();
        let wide = RLConfig {
            hidden_size: 16,
            ..config()
        };
        let mut target = TorchQNetwork::new(2, 2, &wide, Device::Cpu).unwrap();
        assert!(matches!(target.sync_from(&small), Err(RLError::InvalidConfig(_))));
    }

    #[test]
    fn dqn_trains_and_syncs_target_on_libtorch() {
        let dqn = TorchDqnTrainer::<CorridorAction>::on_device(2, config(), Device::Cpu).unwrap();
        let mut synced_at = Vec::new();
        for i in 0..12 {
            let out = dqn
                .train_enhanced(exp((i % 5) as f64 * 0.2, CorridorAction::Right, 0.5, i % 2 == 0))
                .unwrap();
            if let LearnOutcome::Trained { loss, target_synced, .. } = out {
                assert!(loss.is_finite());
                if target_synced {
                    synced_at.push(dqn.train_steps());
                }
            }
        }
        assert_eq!(synced_at, vec![3, 6, 9]);
        assert_eq!(dqn.predict_q_values(&StateVector::new(vec![0.5, 0.5])).unwrap().len(), 2);
    }

    #[test]
    fn ppo_runs_a_clipped_update_on_libtorch() {
        let ppo = TorchPpoTrainer::<CorridorAction>::on_device(2, config(), Device::Cpu).unwrap();
        let mut updated = None;
        for episode in 0..2 {
            ppo.train(episode, exp(0.0, CorridorAction::Right, 0.0, false)).unwrap();
            ppo.train(episode, exp(0.5, CorridorAction::Left, 0.0, false)).unwrap();
            if let PpoOutcome::Updated(stats) =
                ppo.train(episode, exp(1.0, CorridorAction::Right, 1.0, true)).unwrap()
            {
                updated = Some(stats);
            }
        }
        let stats = updated.expect("two closed trajectories trigger an update");
        assert_eq!(stats.trajectories, 2);
        assert_eq!(stats.steps, 6);
        assert!((0.0..=1.0).contains(&stats.clip_fraction));
        assert!(stats.actor_loss.is_finite() && stats.critic_loss.is_finite());
        assert_eq!(ppo.updates(), 1);
        let probs = ppo
            .predict_action_probabilities(&StateVector::new(vec![0.5, 0.5]))
            .unwrap();
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn on_device_rejects_empty_state() {
        assert!(matches!(
            TorchDqnTrainer::<CorridorAction>::on_device(0, config(), Device::Cpu),
            Err(RLError::InvalidConfig(_))
        ));
    }
}
