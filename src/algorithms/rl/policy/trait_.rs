//! Policy trait shared by every action selector.

use crate::algorithms::rl::error::Result;
use crate::algorithms::rl::observation::StateVector;
use crate::algorithms::rl::types::Action;

/// A policy that selects an action for one agent from its state vector.
///
/// Implementations take `&self` so a single policy can serve several
/// worker threads at once; any mutable state (RNG, tables, networks) lives
/// behind interior locks.
pub trait Policy<A: Action>: Send + Sync {
    /// Selects an action for `state`.
    ///
    /// # Errors
    ///
    /// [`RLError::InvalidInput`](crate::algorithms::rl::RLError::InvalidInput)
    /// if `state` has the wrong length or a non-finite feature.
    fn select_action(&self, state: &StateVector) -> Result<A>;

    /// Returns a human-readable name for this policy.
    fn name(&self) -> &str;
}
