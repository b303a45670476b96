use std::path::{Path, PathBuf};

use thiserror::Error;

/// Convenience alias used throughout the RL training core.
pub type Result<T> = std::result::Result<T, RLError>;

/// Errors raised by learners, buffers and the training orchestrator.
///
/// Variants fall into two classes: recoverable ones (the caller skips the
/// current step and carries on) and fatal ones (training must halt because
/// a structural invariant no longer holds). See [`RLError::is_recoverable`]
/// and [`RLError::is_fatal`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RLError {
    /// Malformed input: wrong-length state vector, non-finite reward or
    /// feature, or an action ordinal outside the action space.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Not enough stored data to satisfy the request (e.g. sampling before warm-up).
    #[error("insufficient data: requested {requested}, only {available} available")]
    InsufficientData { requested: usize, available: usize },

    /// Saving or loading model parameters failed.
    #[error("model I/O failed for {}: {reason}", path.display())]
    ModelIo { path: PathBuf, reason: String },

    /// A structural invariant of a shared data structure was found broken.
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// A configuration key or value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A loss, gradient or TD-error became non-finite or exploded.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    /// The replay buffer no longer accepts operations.
    #[error("replay buffer has been shut down")]
    Shutdown,
}

impl RLError {
    /// Builds the error for a state vector of the wrong length.
    pub fn state_length(expected: usize, actual: usize) -> Self {
        RLError::InvalidInput(format!(
            "state vector has {actual} features, expected {expected}"
        ))
    }

    /// Builds the error for a non-finite scalar input.
    pub fn non_finite(what: &str, value: f64) -> Self {
        RLError::InvalidInput(format!("{what} must be finite, got {value}"))
    }

    /// Wraps an I/O or (de)serialization failure for `path`.
    pub fn model_io(path: &Path, reason: impl ToString) -> Self {
        RLError::ModelIo {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    /// Returns true if the caller may skip the failed operation and continue training.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RLError::InsufficientData { .. }
                | RLError::ModelIo { .. }
                | RLError::NumericalInstability(_)
                | RLError::Shutdown
        )
    }

    /// Returns true if training must halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RLError::ConcurrencyViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_length_display() {
        let e = RLError::state_length(10, 7);
        assert_eq!(
            e.to_string(),
            "invalid input: state vector has 7 features, expected 10"
        );
    }

    #[test]
    fn insufficient_data_display() {
        let e = RLError::InsufficientData {
            requested: 32,
            available: 4,
        };
        assert_eq!(
            e.to_string(),
            "insufficient data: requested 32, only 4 available"
        );
    }

    #[test]
    fn model_io_mentions_path() {
        let e = RLError::model_io(Path::new("/tmp/dqn.json"), "permission denied");
        let s = e.to_string();
        assert!(s.contains("/tmp/dqn.json"));
        assert!(s.contains("permission denied"));
    }

    #[test]
    fn classification() {
        assert!(RLError::InsufficientData {
            requested: 1,
            available: 0
        }
        .is_recoverable());
        assert!(RLError::Shutdown.is_recoverable());
        assert!(!RLError::InvalidInput("x".into()).is_recoverable());
        assert!(RLError::ConcurrencyViolation("root mismatch".into()).is_fatal());
        assert!(!RLError::ConcurrencyViolation("root mismatch".into()).is_recoverable());
    }
}
