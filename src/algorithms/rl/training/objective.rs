//! PPO clipped surrogate objective.

/// Per-sample value of the clipped surrogate and which branch produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurrogateTerm {
    /// `min(r·A, clip(r, 1−ε, 1+ε)·A)`.
    pub value: f64,
    /// True when the clipped term is strictly smaller, i.e. the ratio has
    /// left the trust region in the direction the advantage favours. The
    /// gradient with respect to the ratio is zero in that case.
    pub clipped: bool,
}

/// Evaluates `min(ratio·advantage, clip(ratio, 1−ε, 1+ε)·advantage)`.
pub fn clipped_surrogate(ratio: f64, advantage: f64, clip_epsilon: f64) -> SurrogateTerm {
    let unclipped = ratio * advantage;
    let clipped = ratio.clamp(1.0 - clip_epsilon, 1.0 + clip_epsilon) * advantage;
    if clipped < unclipped {
        SurrogateTerm {
            value: clipped,
            clipped: true,
        }
    } else {
        SurrogateTerm {
            value: unclipped,
            clipped: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_ratio_positive_advantage_uses_clipped_term() {
        let term = clipped_surrogate(5.0, 2.0, 0.2);
        assert!(term.clipped);
        assert!((term.value - 1.2 * 2.0).abs() < 1e-12);
    }

    #[test]
    fn large_ratio_negative_advantage_keeps_unclipped_term() {
        let term = clipped_surrogate(5.0, -2.0, 0.2);
        assert!(!term.clipped);
        assert!((term.value + 10.0).abs() < 1e-12);
    }

    #[test]
    fn small_ratio_negative_advantage_uses_clipped_term() {
        let term = clipped_surrogate(0.1, -1.0, 0.2);
        assert!(term.clipped);
        assert!((term.value + 0.8).abs() < 1e-12);
    }

    #[test]
    fn inside_trust_region_is_unclipped() {
        let term = clipped_surrogate(1.1, 3.0, 0.2);
        assert!(!term.clipped);
        assert!((term.value - 3.3).abs() < 1e-12);
    }
}
