//! Initial distributions, transition matrices and the mapping from
//! time steps to transition matrices.
//!
//! All recursions look up the matrix governing the transition
//! `s_{t-1} -> s_t` through [`TransitionMatrices::matrix_for_step`], so a
//! time-homogeneous chain is just the schedule that maps every step to the
//! same matrix.

use faer::Mat;

use crate::error::{HmmError, Result, Stage};

/// Maximum deviation of a row sum from one that we accept for
/// user supplied distributions.
pub const PROB_TOLERANCE: f64 = 1e-6;

const STEADY_STATE_TOLERANCE: f64 = 1e-12;
const STEADY_STATE_MAX_ITER: usize = 10_000;

fn check_distribution<'a>(
    values: impl IntoIterator<Item = &'a f64>,
    stage: Stage,
    index: usize,
) -> Result<()> {
    let mut sum = 0f64;
    for &value in values {
        if !value.is_finite() {
            return Err(HmmError::InvalidDistribution {
                stage,
                index,
                reason: format!("non-finite entry {}", value),
            });
        }
        if value < 0. {
            return Err(HmmError::InvalidDistribution {
                stage,
                index,
                reason: format!("negative entry {}", value),
            });
        }
        sum += value;
    }
    if (sum - 1.).abs() > PROB_TOLERANCE {
        return Err(HmmError::InvalidDistribution {
            stage,
            index,
            reason: format!("entries sum to {}", sum),
        });
    }
    Ok(())
}

/// The distribution of the first state in the sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialDistribution {
    probs: Box<[f64]>,
    log_probs: Box<[f64]>,
}

impl InitialDistribution {
    pub fn new(probs: impl Into<Box<[f64]>>) -> Result<Self> {
        let probs = probs.into();
        if probs.is_empty() {
            return Err(HmmError::dimension(
                Stage::InitialDistribution,
                "number of states",
                1,
                0,
            ));
        }
        check_distribution(probs.iter(), Stage::InitialDistribution, 0)?;
        let log_probs = probs.iter().map(|p| p.ln()).collect();
        Ok(Self { probs, log_probs })
    }

    pub fn uniform(num_states: usize) -> Result<Self> {
        if num_states == 0 {
            return Err(HmmError::dimension(
                Stage::InitialDistribution,
                "number of states",
                1,
                0,
            ));
        }
        let p = 1. / num_states as f64;
        Ok(Self {
            probs: vec![p; num_states].into(),
            log_probs: vec![p.ln(); num_states].into(),
        })
    }

    pub fn num_states(&self) -> usize {
        self.probs.len()
    }

    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn log_probs(&self) -> &[f64] {
        &self.log_probs
    }
}

/// A row-stochastic matrix, `prob(i, j) = P(s_t = j | s_{t-1} = i)`.
///
/// Values are stored column major, so the probabilities of entering a
/// state from every other state are contiguous.
#[derive(Debug, Clone)]
pub struct TransitionMatrix {
    probs: Mat<f64>,
    log_probs: Mat<f64>,
}

impl TransitionMatrix {
    /// Create a transition matrix from its rows.
    pub fn new(rows: &[Vec<f64>]) -> Result<Self> {
        let num_states = rows.len();
        if num_states == 0 {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "number of states",
                1,
                0,
            ));
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != num_states {
                return Err(HmmError::dimension(
                    Stage::TransitionMatrix,
                    "row length",
                    num_states,
                    row.len(),
                ));
            }
            check_distribution(row.iter(), Stage::TransitionMatrix, i)?;
        }
        let probs = Mat::from_fn(num_states, num_states, |i, j| rows[i][j]);
        Ok(Self::from_mat(probs))
    }

    /// Create a matrix from a function of `(from, to)`.
    pub fn from_fn(num_states: usize, f: impl FnMut(usize, usize) -> f64) -> Result<Self> {
        let probs = Mat::from_fn(num_states, num_states, f);
        let rows = (0..num_states)
            .map(|i| (0..num_states).map(|j| probs[(i, j)]).collect())
            .collect::<Vec<Vec<f64>>>();
        Self::new(&rows)
    }

    pub fn identity(num_states: usize) -> Self {
        let probs = Mat::from_fn(num_states, num_states, |i, j| if i == j { 1. } else { 0. });
        Self::from_mat(probs)
    }

    /// Build from rows that are already known to be valid distributions.
    pub(crate) fn from_mat(probs: Mat<f64>) -> Self {
        let log_probs = Mat::from_fn(probs.nrows(), probs.ncols(), |i, j| probs[(i, j)].ln());
        Self { probs, log_probs }
    }

    pub fn num_states(&self) -> usize {
        self.probs.nrows()
    }

    pub fn prob(&self, from: usize, to: usize) -> f64 {
        self.probs[(from, to)]
    }

    pub fn log_prob(&self, from: usize, to: usize) -> f64 {
        self.log_probs[(from, to)]
    }

    pub fn row(&self, from: usize) -> Vec<f64> {
        (0..self.num_states())
            .map(|to| self.probs[(from, to)])
            .collect()
    }

    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.num_states()).map(|i| self.row(i)).collect()
    }

    /// `P(s_t = to | s_{t-1} = k)` for all `k`.
    pub(crate) fn col(&self, to: usize) -> &[f64] {
        self.probs.col_as_slice(to)
    }

    /// `log P(s_t = to | s_{t-1} = k)` for all `k`.
    pub(crate) fn log_col(&self, to: usize) -> &[f64] {
        self.log_probs.col_as_slice(to)
    }

    /// Compute the stationary distribution `pi = pi P`.
    ///
    /// Iterates the lazy chain `(P + I) / 2` from the uniform distribution,
    /// which has the same stationary distribution but is aperiodic.
    pub fn steady_state(&self) -> Result<InitialDistribution> {
        let n = self.num_states();
        let mut current = vec![1. / n as f64; n];
        let mut next = vec![0f64; n];
        for _ in 0..STEADY_STATE_MAX_ITER {
            for (j, out) in next.iter_mut().enumerate() {
                let flow: f64 = current.iter().zip(self.col(j)).map(|(p, t)| p * t).sum();
                *out = 0.5 * (flow + current[j]);
            }
            let total: f64 = next.iter().sum();
            next.iter_mut().for_each(|x| *x /= total);
            let diff: f64 = current
                .iter()
                .zip(next.iter())
                .map(|(a, b)| (a - b).abs())
                .sum();
            std::mem::swap(&mut current, &mut next);
            if diff < STEADY_STATE_TOLERANCE {
                break;
            }
        }
        InitialDistribution::new(current)
    }
}

impl PartialEq for TransitionMatrix {
    fn eq(&self, other: &Self) -> bool {
        let n = self.num_states();
        n == other.num_states()
            && (0..n).all(|i| (0..n).all(|j| self.probs[(i, j)] == other.probs[(i, j)]))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StepIndex {
    Constant,
    Mapped(Box<[usize]>),
}

/// A set of transition matrices together with the time step to matrix
/// mapping.
///
/// Entry `t` of the mapping selects the matrix used for the transition
/// into step `t`. The entry for step zero is kept for shape compatibility
/// with per-step stacks of matrices but is never used.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionMatrices {
    matrices: Vec<TransitionMatrix>,
    index: StepIndex,
}

impl TransitionMatrices {
    /// The same matrix for every time step.
    pub fn constant(matrix: TransitionMatrix) -> Self {
        Self {
            matrices: vec![matrix],
            index: StepIndex::Constant,
        }
    }

    /// One matrix per time step.
    pub fn per_step(matrices: Vec<TransitionMatrix>) -> Result<Self> {
        let index = (0..matrices.len()).collect();
        Self::grouped(matrices, index)
    }

    /// Matrices shared by groups of time steps. `index[t]` is the matrix
    /// for the transition into step `t`.
    pub fn grouped(matrices: Vec<TransitionMatrix>, index: Vec<usize>) -> Result<Self> {
        let Some(first) = matrices.first() else {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "number of transition matrices",
                1,
                0,
            ));
        };
        let num_states = first.num_states();
        if let Some(other) = matrices.iter().find(|m| m.num_states() != num_states) {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "number of states",
                num_states,
                other.num_states(),
            ));
        }
        if let Some(&bad) = index.iter().find(|&&g| g >= matrices.len()) {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "transition matrix index",
                matrices.len(),
                bad + 1,
            ));
        }
        Ok(Self {
            matrices,
            index: StepIndex::Mapped(index.into()),
        })
    }

    pub fn num_states(&self) -> usize {
        self.matrices[0].num_states()
    }

    pub fn num_matrices(&self) -> usize {
        self.matrices.len()
    }

    pub fn matrices(&self) -> &[TransitionMatrix] {
        &self.matrices
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.index, StepIndex::Constant)
    }

    /// The length of the step mapping, `None` for a constant schedule.
    pub fn num_steps(&self) -> Option<usize> {
        match &self.index {
            StepIndex::Constant => None,
            StepIndex::Mapped(index) => Some(index.len()),
        }
    }

    /// Index of the matrix that governs the transition into step `t`.
    pub fn group_for_step(&self, t: usize) -> usize {
        match &self.index {
            StepIndex::Constant => 0,
            StepIndex::Mapped(index) => index[t],
        }
    }

    /// The matrix that governs the transition `s_{t-1} -> s_t`.
    pub fn matrix_for_step(&self, t: usize) -> &TransitionMatrix {
        &self.matrices[self.group_for_step(t)]
    }

    /// Check that the schedule can be used for a sequence of `num_steps`
    /// states.
    pub fn check_steps(&self, num_steps: usize, stage: Stage) -> Result<()> {
        match self.num_steps() {
            Some(len) if len != num_steps => Err(HmmError::dimension(
                stage,
                "number of time-indexed transition matrices",
                num_steps,
                len,
            )),
            _ => Ok(()),
        }
    }

    /// A schedule with the same step mapping and new matrices.
    pub fn with_matrices(&self, matrices: Vec<TransitionMatrix>) -> Result<Self> {
        if matrices.len() != self.matrices.len() {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "number of transition matrices",
                self.matrices.len(),
                matrices.len(),
            ));
        }
        Ok(Self {
            matrices,
            index: self.index.clone(),
        })
    }
}

impl From<TransitionMatrix> for TransitionMatrices {
    fn from(matrix: TransitionMatrix) -> Self {
        TransitionMatrices::constant(matrix)
    }
}
