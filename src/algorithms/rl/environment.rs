//! Environment contract consumed by the training orchestrator.
//!
//! The game integration layer implements [`Environment`]; the learners never
//! see the world directly, only the state vectors it captures and the
//! rewards it returns. [`CorridorEnvironment`] is a small deterministic MDP
//! with a known optimal policy, used by the demos and tests.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::error::{RLError, Result};
use super::observation::StateVector;
use super::types::{Action, AgentId};

/// A world hosting one or more agents.
///
/// All calls are made from the orchestrator worker that owns the
/// environment; no threading requirement is imposed on implementations
/// beyond `Send`.
pub trait Environment<A: Action>: Send {
    fn num_agents(&self) -> usize;

    /// Length of every state vector returned by [`Environment::capture_state`].
    fn state_dim(&self) -> usize;

    fn capture_state(&self, agent: AgentId) -> Result<StateVector>;

    /// Executes `action` for `agent` and returns the reward.
    fn apply_action(&mut self, agent: AgentId, action: A) -> Result<f64>;

    /// True once `agent`'s current episode has ended.
    fn episode_done(&self, agent: AgentId) -> bool;

    /// Starts a new episode for `agent`.
    fn reset_agent(&mut self, agent: AgentId) -> Result<()>;

    /// True if `agent`'s finished episode counts as a success. Defaults to false.
    fn episode_succeeded(&self, _agent: AgentId) -> bool {
        false
    }
}

/// Moves available in the corridor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorridorAction {
    Left,
    Right,
}

impl Action for CorridorAction {
    const COUNT: usize = 2;

    fn ordinal(self) -> usize {
        match self {
            CorridorAction::Left => 0,
            CorridorAction::Right => 1,
        }
    }

    fn from_ordinal(ordinal: usize) -> Option<Self> {
        match ordinal {
            0 => Some(CorridorAction::Left),
            1 => Some(CorridorAction::Right),
            _ => None,
        }
    }
}

impl fmt::Display for CorridorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorridorAction::Left => write!(f, "left"),
            CorridorAction::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct Walker {
    position: usize,
    steps: usize,
    reached_goal: bool,
}

/// A 1-D corridor of `length` cells with the goal at the right end.
///
/// Each step costs `-0.01`; entering the goal pays `+1` and ends the
/// episode. Walking into the left wall leaves the agent in place. The state
/// is a one-hot encoding of the agent's cell, so moving right is optimal in
/// every non-goal cell.
#[derive(Debug, Clone)]
pub struct CorridorEnvironment {
    length: usize,
    max_steps: usize,
    random_starts: bool,
    walkers: Vec<Walker>,
    rng: StdRng,
}

impl CorridorEnvironment {
    pub const GOAL_REWARD: f64 = 1.0;
    pub const STEP_PENALTY: f64 = -0.01;

    /// Creates a corridor with every agent starting at cell 0.
    pub fn new(length: usize, num_agents: usize, max_steps: usize) -> Result<Self> {
        if length < 2 {
            return Err(RLError::InvalidConfig(
                "corridor needs at least two cells".into(),
            ));
        }
        if num_agents == 0 || max_steps == 0 {
            return Err(RLError::InvalidConfig(
                "corridor needs at least one agent and one step".into(),
            ));
        }
        Ok(Self {
            length,
            max_steps,
            random_starts: false,
            walkers: vec![Walker::default(); num_agents],
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// Starts each episode in a uniformly random non-goal cell.
    pub fn with_random_starts(mut self, seed: u64) -> Self {
        self.random_starts = true;
        self.rng = StdRng::seed_from_u64(seed);
        for agent in 0..self.walkers.len() {
            let start = self.rng.gen_range(0..self.length - 1);
            self.walkers[agent].position = start;
        }
        self
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn goal(&self) -> usize {
        self.length - 1
    }

    /// One-hot state of `cell`.
    pub fn state_of(&self, cell: usize) -> StateVector {
        let mut features = vec![0.0; self.length];
        if let Some(f) = features.get_mut(cell) {
            *f = 1.0;
        }
        StateVector::new(features)
    }

    /// Optimal action in every cell.
    pub fn optimal_action(&self, _cell: usize) -> CorridorAction {
        CorridorAction::Right
    }

    pub fn position(&self, agent: AgentId) -> Result<usize> {
        Ok(self.walker(agent)?.position)
    }

    fn walker(&self, agent: AgentId) -> Result<&Walker> {
        self.walkers
            .get(agent)
            .ok_or_else(|| RLError::InvalidInput(format!("unknown agent {agent}")))
    }

    fn walker_mut(&mut self, agent: AgentId) -> Result<&mut Walker> {
        self.walkers
            .get_mut(agent)
            .ok_or_else(|| RLError::InvalidInput(format!("unknown agent {agent}")))
    }
}

impl Environment<CorridorAction> for CorridorEnvironment {
    fn num_agents(&self) -> usize {
        self.walkers.len()
    }

    fn state_dim(&self) -> usize {
        self.length
    }

    fn capture_state(&self, agent: AgentId) -> Result<StateVector> {
        Ok(self.state_of(self.walker(agent)?.position))
    }

    fn apply_action(&mut self, agent: AgentId, action: CorridorAction) -> Result<f64> {
        let goal = self.goal();
        let walker = self.walker_mut(agent)?;
        if walker.reached_goal {
            return Err(RLError::InvalidInput(format!(
                "agent {agent} acted after its episode ended"
            )));
        }
        walker.position = match action {
            CorridorAction::Left => walker.position.saturating_sub(1),
            CorridorAction::Right => (walker.position + 1).min(goal),
        };
        walker.steps += 1;
        if walker.position == goal {
            walker.reached_goal = true;
            Ok(Self::GOAL_REWARD)
        } else {
            Ok(Self::STEP_PENALTY)
        }
    }

    fn episode_done(&self, agent: AgentId) -> bool {
        self.walkers
            .get(agent)
            .map_or(true, |w| w.reached_goal || w.steps >= self.max_steps)
    }

    fn reset_agent(&mut self, agent: AgentId) -> Result<()> {
        let start = if self.random_starts {
            self.rng.gen_range(0..self.length - 1)
        } else {
            0
        };
        let walker = self.walker_mut(agent)?;
        *walker = Walker {
            position: start,
            ..Walker::default()
        };
        Ok(())
    }

    fn episode_succeeded(&self, agent: AgentId) -> bool {
        self.walkers.get(agent).is_some_and(|w| w.reached_goal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walking_right_reaches_goal() {
        let mut env = CorridorEnvironment::new(4, 1, 10).unwrap();
        assert_eq!(env.apply_action(0, CorridorAction::Right).unwrap(), -0.01);
        assert_eq!(env.apply_action(0, CorridorAction::Right).unwrap(), -0.01);
        assert_eq!(env.apply_action(0, CorridorAction::Right).unwrap(), 1.0);
        assert!(env.episode_done(0));
        assert!(env.episode_succeeded(0));
        assert!(env.apply_action(0, CorridorAction::Left).is_err());
    }

    #[test]
    fn left_wall_blocks() {
        let mut env = CorridorEnvironment::new(3, 1, 10).unwrap();
        env.apply_action(0, CorridorAction::Left).unwrap();
        assert_eq!(env.position(0).unwrap(), 0);
        assert_eq!(env.capture_state(0).unwrap().as_slice(), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn step_cap_ends_episode() {
        let mut env = CorridorEnvironment::new(10, 1, 2).unwrap();
        env.apply_action(0, CorridorAction::Left).unwrap();
        env.apply_action(0, CorridorAction::Left).unwrap();
        assert!(env.episode_done(0));
        assert!(!env.episode_succeeded(0));
        env.reset_agent(0).unwrap();
        assert!(!env.episode_done(0));
    }

    #[test]
    fn random_starts_avoid_goal() {
        let mut env = CorridorEnvironment::new(5, 3, 10)
            .unwrap()
            .with_random_starts(42);
        for _ in 0..50 {
            for agent in 0..3 {
                env.reset_agent(agent).unwrap();
                assert!(env.position(agent).unwrap() < env.goal());
            }
        }
    }

    #[test]
    fn unknown_agent_is_rejected() {
        let env = CorridorEnvironment::new(3, 1, 5).unwrap();
        assert!(env.capture_state(4).is_err());
        assert!(env.episode_done(4));
    }
}
