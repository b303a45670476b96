//! Core vocabulary shared by every learner: actions, agent identifiers and
//! experience tuples.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use super::error::{RLError, Result};
use super::observation::StateVector;

/// Identifier of an agent (or environment slot) driven by the orchestrator.
pub type AgentId = usize;

/// A closed, finite action space with a stable ordinal mapping.
///
/// Ordinals index Q-table rows and network output vectors, so they must not
/// change for the lifetime of a trained model.
pub trait Action: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Number of actions in the space.
    const COUNT: usize;

    /// Stable ordinal in `0..COUNT`.
    fn ordinal(self) -> usize;

    /// Inverse of [`Action::ordinal`]; `None` when out of range.
    fn from_ordinal(ordinal: usize) -> Option<Self>;

    /// Iterates over all actions in ordinal order.
    fn all() -> ActionIter<Self> {
        ActionIter {
            next: 0,
            _marker: std::marker::PhantomData,
        }
    }

    /// Like [`Action::from_ordinal`] but reports an out-of-range ordinal as invalid input.
    fn try_from_ordinal(ordinal: usize) -> Result<Self> {
        Self::from_ordinal(ordinal).ok_or_else(|| {
            RLError::InvalidInput(format!(
                "action ordinal {ordinal} outside 0..{}",
                Self::COUNT
            ))
        })
    }
}

/// Iterator returned by [`Action::all`].
#[derive(Debug, Clone)]
pub struct ActionIter<A> {
    next: usize,
    _marker: std::marker::PhantomData<A>,
}

impl<A: Action> Iterator for ActionIter<A> {
    type Item = A;

    fn next(&mut self) -> Option<A> {
        let action = A::from_ordinal(self.next)?;
        self.next += 1;
        Some(action)
    }
}

/// Actions available to an autonomous game agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameAction {
    MoveForward,
    MoveBackward,
    StrafeLeft,
    StrafeRight,
    Jump,
    Attack,
    UseItem,
    Idle,
}

impl GameAction {
    const ALL: [GameAction; 8] = [
        GameAction::MoveForward,
        GameAction::MoveBackward,
        GameAction::StrafeLeft,
        GameAction::StrafeRight,
        GameAction::Jump,
        GameAction::Attack,
        GameAction::UseItem,
        GameAction::Idle,
    ];

    /// Returns true for actions that change the agent's position.
    pub fn is_movement(&self) -> bool {
        matches!(
            self,
            GameAction::MoveForward
                | GameAction::MoveBackward
                | GameAction::StrafeLeft
                | GameAction::StrafeRight
                | GameAction::Jump
        )
    }
}

impl Action for GameAction {
    const COUNT: usize = 8;

    fn ordinal(self) -> usize {
        match self {
            GameAction::MoveForward => 0,
            GameAction::MoveBackward => 1,
            GameAction::StrafeLeft => 2,
            GameAction::StrafeRight => 3,
            GameAction::Jump => 4,
            GameAction::Attack => 5,
            GameAction::UseItem => 6,
            GameAction::Idle => 7,
        }
    }

    fn from_ordinal(ordinal: usize) -> Option<Self> {
        Self::ALL.get(ordinal).copied()
    }
}

impl fmt::Display for GameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameAction::MoveForward => "move_forward",
            GameAction::MoveBackward => "move_backward",
            GameAction::StrafeLeft => "strafe_left",
            GameAction::StrafeRight => "strafe_right",
            GameAction::Jump => "jump",
            GameAction::Attack => "attack",
            GameAction::UseItem => "use_item",
            GameAction::Idle => "idle",
        };
        write!(f, "{name}")
    }
}

/// A single transition `(state, action, reward, next_state, done)`.
///
/// Immutable once built; learners only ever read it.
#[derive(Debug, Clone, PartialEq)]
pub struct Experience<A> {
    state: StateVector,
    action: A,
    reward: f64,
    next_state: StateVector,
    done: bool,
}

impl<A: Action> Experience<A> {
    /// Creates a new experience.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidInput`] if the reward is NaN or infinite, or if the
    /// two state vectors differ in length.
    pub fn new(
        state: StateVector,
        action: A,
        reward: f64,
        next_state: StateVector,
        done: bool,
    ) -> Result<Self> {
        if !reward.is_finite() {
            return Err(RLError::non_finite("reward", reward));
        }
        if state.len() != next_state.len() {
            return Err(RLError::InvalidInput(format!(
                "state has {} features but next state has {}",
                state.len(),
                next_state.len()
            )));
        }
        Ok(Self {
            state,
            action,
            reward,
            next_state,
            done,
        })
    }

    pub fn state(&self) -> &StateVector {
        &self.state
    }

    pub fn action(&self) -> A {
        self.action
    }

    pub fn reward(&self) -> f64 {
        self.reward
    }

    pub fn next_state(&self) -> &StateVector {
        &self.next_state
    }

    pub fn done(&self) -> bool {
        self.done
    }

    /// Checks both state vectors against the learner's expected dimension.
    pub fn validate(&self, state_dim: usize) -> Result<()> {
        self.state.validate(state_dim)?;
        self.next_state.validate(state_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn game_action_ordinals_round_trip() {
        for (i, action) in GameAction::all().enumerate() {
            assert_eq!(action.ordinal(), i);
            assert_eq!(GameAction::from_ordinal(i), Some(action));
        }
        assert_eq!(GameAction::all().count(), GameAction::COUNT);
        assert_eq!(GameAction::from_ordinal(GameAction::COUNT), None);
    }

    #[test]
    fn try_from_ordinal_rejects_out_of_range() {
        let err = GameAction::try_from_ordinal(99).unwrap_err();
        assert!(matches!(err, RLError::InvalidInput(_)));
    }

    #[test]
    fn movement_classification() {
        assert!(GameAction::Jump.is_movement());
        assert!(!GameAction::Attack.is_movement());
        assert_eq!(GameAction::UseItem.to_string(), "use_item");
    }

    #[test]
    fn experience_rejects_nan_reward() {
        let s = StateVector::new(vec![0.0; 3]);
        let err = Experience::new(s.clone(), GameAction::Idle, f64::NAN, s, false).unwrap_err();
        assert!(matches!(err, RLError::InvalidInput(_)));
    }

    #[test]
    fn experience_rejects_mismatched_states() {
        let err = Experience::new(
            StateVector::new(vec![0.0; 3]),
            GameAction::Idle,
            1.0,
            StateVector::new(vec![0.0; 4]),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, RLError::InvalidInput(_)));
    }

    #[test]
    fn experience_validate_checks_dimension() {
        let s = StateVector::new(vec![0.0; 3]);
        let exp = Experience::new(s.clone(), GameAction::Attack, 0.5, s, true).unwrap();
        assert!(exp.validate(3).is_ok());
        assert!(exp.validate(4).is_err());
        assert!(exp.done());
        assert_eq!(exp.action(), GameAction::Attack);
    }
}
