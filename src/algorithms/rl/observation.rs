//! State encoding for the learners.
//!
//! Every learner consumes a fixed-length [`StateVector`]. Richer world
//! observations are flattened by a [`StateEncoder`]; the tabular agent further
//! discretizes vectors into a [`StateKey`].

use std::hash::Hasher;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use super::error::{RLError, Result};

/// Fixed-length ordered sequence of numeric features.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVector(Vec<f64>);

impl StateVector {
    pub fn new(features: Vec<f64>) -> Self {
        Self(features)
    }

    /// Zero vector of the given length.
    pub fn zeros(len: usize) -> Self {
        Self(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }

    /// Checks length and finiteness.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidInput`] on a length mismatch or a NaN/infinite feature.
    /// Mismatched vectors are never padded or truncated.
    pub fn validate(&self, expected_len: usize) -> Result<()> {
        if self.0.len() != expected_len {
            return Err(RLError::state_length(expected_len, self.0.len()));
        }
        if let Some((i, v)) = self.0.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(RLError::InvalidInput(format!(
                "state feature {i} must be finite, got {v}"
            )));
        }
        Ok(())
    }
}

impl From<Vec<f64>> for StateVector {
    fn from(features: Vec<f64>) -> Self {
        Self(features)
    }
}

impl AsRef<[f64]> for StateVector {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

/// Discretized key identifying a Q-table row.
///
/// Built by quantizing each feature to a grid of width `resolution` and
/// hashing the resulting integers, so nearby continuous states share a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateKey(pub u64);

impl StateKey {
    pub fn from_state(state: &StateVector, resolution: f64) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write_usize(state.len());
        for &feature in state.as_slice() {
            let cell = (feature / resolution).round() as i64;
            hasher.write_i64(cell);
        }
        StateKey(hasher.finish())
    }
}

/// Converts an opaque world observation into a [`StateVector`].
pub trait StateEncoder<O>: Send + Sync {
    /// Length of every vector this encoder produces.
    fn state_dim(&self) -> usize;

    /// Flattens `observation` into a feature vector of length [`Self::state_dim`].
    fn encode(&self, observation: &O) -> Result<StateVector>;
}

/// Weather condition reported by the game world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weather {
    Sunny,
    Rain,
    Thunder,
}

/// Snapshot of the world around one agent as captured by the game integration layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameObservation {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub health: f64,
    pub hunger: u32,
    pub time_of_day: u64,
    pub light_level: u8,
    pub weather: Weather,
    pub nearby_entities: usize,
    pub inventory_size: usize,
}

impl GameObservation {
    /// An agent is terminal once its health is exhausted.
    pub fn is_terminal(&self) -> bool {
        self.health <= 0.0
    }
}

/// Encodes a [`GameObservation`] into 10 normalized features:
///
/// ```text
/// [x, y, z, health, hunger, time_of_day, light_level, sunny, entities, inventory]
/// ```
///
/// Coordinates are divided by `world_extent`; the remaining features are
/// scaled to roughly `[0, 1]` using the game's natural maxima.
#[derive(Debug, Clone)]
pub struct GameObservationEncoder {
    world_extent: f64,
}

impl GameObservationEncoder {
    pub const FEATURES: usize = 10;

    const MAX_HEALTH: f64 = 20.0;
    const MAX_HUNGER: f64 = 20.0;
    const TICKS_PER_DAY: f64 = 24_000.0;
    const MAX_LIGHT: f64 = 15.0;
    const ENTITY_SCALE: f64 = 16.0;
    const INVENTORY_SLOTS: f64 = 36.0;

    pub fn new(world_extent: f64) -> Self {
        Self { world_extent }
    }
}

impl Default for GameObservationEncoder {
    fn default() -> Self {
        Self::new(1_000.0)
    }
}

impl StateEncoder<GameObservation> for GameObservationEncoder {
    fn state_dim(&self) -> usize {
        Self::FEATURES
    }

    fn encode(&self, obs: &GameObservation) -> Result<StateVector> {
        for (name, v) in [("x", obs.x), ("y", obs.y), ("z", obs.z), ("health", obs.health)] {
            if !v.is_finite() {
                return Err(RLError::non_finite(name, v));
            }
        }
        let features = vec![
            obs.x / self.world_extent,
            obs.y / self.world_extent,
            obs.z / self.world_extent,
            (obs.health / Self::MAX_HEALTH).clamp(0.0, 1.0),
            (obs.hunger as f64 / Self::MAX_HUNGER).min(1.0),
            (obs.time_of_day as f64 % Self::TICKS_PER_DAY) / Self::TICKS_PER_DAY,
            (obs.light_level as f64 / Self::MAX_LIGHT).min(1.0),
            if obs.weather == Weather::Sunny { 1.0 } else { 0.0 },
            (obs.nearby_entities as f64 / Self::ENTITY_SCALE).min(1.0),
            (obs.inventory_size as f64 / Self::INVENTORY_SLOTS).min(1.0),
        ];
        Ok(StateVector::new(features))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation() -> GameObservation {
        GameObservation {
            x: 100.0,
            y: 64.0,
            z: -250.0,
            health: 10.0,
            hunger: 20,
            time_of_day: 30_000,
            light_level: 15,
            weather: Weather::Sunny,
            nearby_entities: 4,
            inventory_size: 9,
        }
    }

    #[test]
    fn validate_rejects_wrong_length() {
        let s = StateVector::new(vec![0.0; 3]);
        assert!(s.validate(3).is_ok());
        assert_eq!(s.validate(5), Err(RLError::state_length(5, 3)));
    }

    #[test]
    fn validate_rejects_nan_feature() {
        let s = StateVector::new(vec![0.0, f64::NAN]);
        assert!(matches!(s.validate(2), Err(RLError::InvalidInput(_))));
    }

    #[test]
    fn state_key_groups_nearby_states() {
        let a = StateVector::new(vec![1.02, 2.0]);
        let b = StateVector::new(vec![0.98, 2.01]);
        let c = StateVector::new(vec![3.0, 2.0]);
        assert_eq!(StateKey::from_state(&a, 0.1), StateKey::from_state(&b, 0.1));
        assert_ne!(StateKey::from_state(&a, 0.1), StateKey::from_state(&c, 0.1));
    }

    #[test]
    fn state_key_depends_on_length() {
        let a = StateVector::new(vec![0.0]);
        let b = StateVector::new(vec![0.0, 0.0]);
        assert_ne!(StateKey::from_state(&a, 1.0), StateKey::from_state(&b, 1.0));
    }

    #[test]
    fn encoder_produces_fixed_length() {
        let enc = GameObservationEncoder::default();
        let v = enc.encode(&observation()).unwrap();
        assert_eq!(v.len(), enc.state_dim());
        assert!(v.validate(GameObservationEncoder::FEATURES).is_ok());
        // health 10/20
        assert!((v.as_slice()[3] - 0.5).abs() < 1e-12);
        // time of day wraps: 30000 % 24000 = 6000
        assert!((v.as_slice()[5] - 0.25).abs() < 1e-12);
        assert_eq!(v.as_slice()[7], 1.0);
    }

    #[test]
    fn encoder_rejects_infinite_coordinate() {
        let enc = GameObservationEncoder::default();
        let mut obs = observation();
        obs.x = f64::INFINITY;
        assert!(matches!(enc.encode(&obs), Err(RLError::InvalidInput(_))));
    }

    #[test]
    fn terminal_when_dead() {
        let mut obs = observation();
        assert!(!obs.is_terminal());
        obs.health = 0.0;
        assert!(obs.is_terminal());
    }
}
