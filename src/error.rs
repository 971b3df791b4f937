//! Error types for landmark estimation and lifecycle management.
//!
//! Numerical failures (`NotEnoughKeyframes`, `Divergence`, `Rejected`) are
//! recoverable and handled by the mapper. Lifecycle errors (`DoubleDeletion`,
//! `StaleHandle`) indicate a bug in the caller and should be surfaced.

use thiserror::Error;

use crate::atlas::map::{FrameId, LandmarkId};

/// Result type used throughout the landmark core.
pub type Result<T> = std::result::Result<T, LandmarkError>;

/// Errors raised by the landmark core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LandmarkError {
    /// A fusion update carried a non-positive or non-finite noise term.
    #[error("invalid measurement {measurement:?} with noise {sigmas:?}")]
    InvalidMeasurement {
        measurement: [f64; 3],
        sigmas: [f64; 3],
    },

    /// The refiner found too few usable keyframe observations.
    #[error("not enough keyframes for refinement: found {found}, need {required}")]
    NotEnoughKeyframes { found: usize, required: usize },

    /// Gauss-Newton failed to improve early on or produced a non-finite step.
    #[error("refinement diverged at iteration {iteration} (chi2 = {chi2})")]
    Divergence { iteration: usize, chi2: f64 },

    /// Optimization finished but the result failed the acceptance checks.
    #[error("refined point rejected: depth {depth}, variance {variance}, chi2 {chi2}")]
    Rejected { depth: f64, variance: f64, chi2: f64 },

    /// Deletion was requested for a landmark that is already gone.
    #[error("landmark {0} was already deleted")]
    DoubleDeletion(LandmarkId),

    /// A handle was dereferenced after its landmark was deleted.
    #[error("landmark handle {0} is stale")]
    StaleHandle(LandmarkId),

    /// Observations must arrive in strictly increasing frame order.
    #[error("observation from frame #{got} is not newer than frame #{newest}")]
    OutOfOrderObservation { got: u64, newest: u64 },

    /// The landmark is flagged for removal and accepts no new observations.
    #[error("landmark {0} is marked obsolete")]
    MarkedObsolete(LandmarkId),

    /// The observation's frame has left the buffer.
    #[error("observation has expired")]
    ExpiredObservation,

    /// The frame handle no longer resolves in the frame buffer.
    #[error("frame {0} is not in the frame buffer")]
    FrameNotFound(FrameId),
}

impl LandmarkError {
    /// True for errors that mean the caller violated the lifecycle contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            LandmarkError::DoubleDeletion(_) | LandmarkError::StaleHandle(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LandmarkError::NotEnoughKeyframes {
            found: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "not enough keyframes for refinement: found 1, need 2"
        );
    }

    #[test]
    fn test_contract_violation_classification() {
        let numerical = LandmarkError::Divergence {
            iteration: 0,
            chi2: 1.0,
        };
        assert!(!numerical.is_contract_violation());
        assert!(!LandmarkError::ExpiredObservation.is_contract_violation());
        assert!(!LandmarkError::MarkedObsolete(LandmarkId::default()).is_contract_violation());
    }
}
