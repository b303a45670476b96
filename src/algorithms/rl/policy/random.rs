//! Random policy for testing and baselines.

use std::marker::PhantomData;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::trait_::Policy;
use crate::algorithms::rl::error::Result;
use crate::algorithms::rl::observation::StateVector;
use crate::algorithms::rl::types::Action;

/// Uniformly random action selection.
///
/// Used for sanity checks and as a lower-bound baseline.
pub struct RandomPolicy<A> {
    rng: Mutex<StdRng>,
    _action: PhantomData<fn() -> A>,
}

impl<A: Action> RandomPolicy<A> {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
            _action: PhantomData,
        }
    }

    /// Creates a reproducible random policy.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            _action: PhantomData,
        }
    }
}

impl<A: Action> Default for RandomPolicy<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Action> Policy<A> for RandomPolicy<A> {
    fn select_action(&self, state: &StateVector) -> Result<A> {
        state.validate(state.len())?;
        let ordinal = self.rng.lock().gen_range(0..A::COUNT);
        A::try_from_ordinal(ordinal)
    }

    fn name(&self) -> &str {
        "random"
    }
}
