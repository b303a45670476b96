//! Generalized Advantage Estimation (GAE-λ).
//!
//! Computes advantages and returns for one closed episode from the
//! critic's estimates of each state and its successor.

use crate::algorithms::rl::error::{RLError, Result};

/// Computes GAE-λ advantages and returns, walking the episode backwards:
///
/// ```text
/// δ_t = r_t + γ·V(s_{t+1})·(1 − done_t) − V(s_t)
/// A_t = δ_t + γ·λ·(1 − done_t)·A_{t+1}
/// R_t = A_t + V(s_t)
/// ```
///
/// # Arguments
///
/// * `rewards` - Per-step rewards
/// * `values` - Critic estimates `V(s_t)`
/// * `next_values` - Critic estimates `V(s_{t+1})`
/// * `dones` - Per-step termination flags
/// * `gamma` - Discount factor
/// * `gae_lambda` - GAE λ parameter (0 = TD(0), 1 = Monte Carlo)
///
/// # Returns
///
/// `(advantages, returns)`.
pub fn compute_gae(
    rewards: &[f64],
    values: &[f64],
    next_values: &[f64],
    dones: &[bool],
    gamma: f64,
    gae_lambda: f64,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let n = rewards.len();
    if values.len() != n || next_values.len() != n || dones.len() != n {
        return Err(RLError::InvalidInput(format!(
            "GAE inputs disagree in length: {n} rewards, {} values, {} next values, {} flags",
            values.len(),
            next_values.len(),
            dones.len()
        )));
    }

    let mut advantages = vec![0.0; n];
    let mut gae = 0.0;

    for t in (0..n).rev() {
        let next_non_terminal = if dones[t] { 0.0 } else { 1.0 };
        let delta = rewards[t] + gamma * next_values[t] * next_non_terminal - values[t];
        gae = delta + gamma * gae_lambda * next_non_terminal * gae;
        advantages[t] = gae;
    }

    let returns: Vec<f64> = advantages
        .iter()
        .zip(values.iter())
        .map(|(a, v)| a + v)
        .collect();

    Ok((advantages, returns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gae_basic() {
        let rewards = vec![1.0, 1.0, 1.0];
        let values = vec![0.5, 0.5, 0.5];
        let next_values = vec![0.5, 0.5, 9.0];
        let dones = vec![false, false, true];
        let (advantages, returns) =
            compute_gae(&rewards, &values, &next_values, &dones, 0.99, 0.95).unwrap();

        assert_eq!(advantages.len(), 3);
        assert_eq!(returns.len(), 3);

        // Last step is terminal: the successor value is ignored.
        assert!((advantages[2] - 0.5).abs() < 1e-10);
    }

    #[test]
    fn gae_with_lambda_zero() {
        // λ=0 => TD(0): advantages are just TD errors
        let rewards = vec![1.0, 2.0];
        let values = vec![0.5, 1.0];
        let next_values = vec![1.0, 0.0];
        let dones = vec![false, true];
        let (advantages, _) =
            compute_gae(&rewards, &values, &next_values, &dones, 0.99, 0.0).unwrap();

        assert!((advantages[1] - 1.0).abs() < 1e-10);
        // 1.0 + 0.99*1.0 - 0.5
        assert!((advantages[0] - 1.49).abs() < 1e-10);
    }

    #[test]
    fn single_terminal_step() {
        let (adv, ret) = compute_gae(&[3.0], &[1.25], &[7.0], &[true], 0.99, 0.95).unwrap();
        assert!((adv[0] - (3.0 - 1.25)).abs() < 1e-12);
        assert!((ret[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn lambda_one_gives_discounted_return() {
        let rewards = [1.0, 1.0, 1.0];
        let values = [0.0; 3];
        let (_, ret) =
            compute_gae(&rewards, &values, &values, &[false, false, true], 0.5, 1.0).unwrap();
        assert!((ret[0] - 1.75).abs() < 1e-12);
        assert!((ret[1] - 1.5).abs() < 1e-12);
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        assert!(compute_gae(&[1.0], &[], &[0.0], &[true], 0.9, 0.9).is_err());
    }
}
