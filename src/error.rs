use std::fmt;

use thiserror::Error;

/// The part of the inference pipeline that raised an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InitialDistribution,
    TransitionMatrix,
    LogLikelihood,
    StateSequencePrior,
    ForwardFilter,
    BackwardSampler,
    TransitionSampler,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::InitialDistribution => "initial distribution",
            Stage::TransitionMatrix => "transition matrix",
            Stage::LogLikelihood => "log-likelihood table",
            Stage::StateSequencePrior => "state sequence prior",
            Stage::ForwardFilter => "forward filter",
            Stage::BackwardSampler => "backward sampler",
            Stage::TransitionSampler => "transition sampler",
        };
        f.write_str(name)
    }
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HmmError {
    /// Sequence length, number of states or number of transition
    /// matrices disagree between inputs.
    #[error("{stage}: {what} mismatch, expected {expected} but found {found}")]
    DimensionMismatch {
        stage: Stage,
        what: &'static str,
        expected: usize,
        found: usize,
    },

    /// A probability vector or matrix row is not a categorical distribution.
    #[error("{stage}: row {index} is not a valid distribution ({reason})")]
    InvalidDistribution {
        stage: Stage,
        index: usize,
        reason: String,
    },

    /// Every state has zero probability at this time step.
    #[error("{stage}: all states have zero probability at time step {step}")]
    DegenerateDistribution { stage: Stage, step: usize },

    #[error("{stage}: invalid Dirichlet concentration in row {row} ({reason})")]
    InvalidPrior {
        stage: Stage,
        row: usize,
        reason: String,
    },

    #[error("{stage}: state {state} at time step {step} is out of range for {num_states} states")]
    InvalidState {
        stage: Stage,
        step: usize,
        state: usize,
        num_states: usize,
    },
}

impl HmmError {
    pub(crate) fn dimension(
        stage: Stage,
        what: &'static str,
        expected: usize,
        found: usize,
    ) -> Self {
        HmmError::DimensionMismatch {
            stage,
            what,
            expected,
            found,
        }
    }

    /// The time step (or row) the error refers to, if any.
    pub fn index(&self) -> Option<usize> {
        match self {
            HmmError::DimensionMismatch { .. } => None,
            HmmError::InvalidDistribution { index, .. } => Some(*index),
            HmmError::DegenerateDistribution { step, .. } => Some(*step),
            HmmError::InvalidPrior { row, .. } => Some(*row),
            HmmError::InvalidState { step, .. } => Some(*step),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            HmmError::DimensionMismatch { stage, .. }
            | HmmError::InvalidDistribution { stage, .. }
            | HmmError::DegenerateDistribution { stage, .. }
            | HmmError::InvalidPrior { stage, .. }
            | HmmError::InvalidState { stage, .. } => *stage,
        }
    }
}

pub type Result<T> = std::result::Result<T, HmmError>;
