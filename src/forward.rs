//! Scaled forward recursion in log space.
//!
//! ```text
//! a_0[k] = log pi[k] + loglik[0, k]
//! a_t[k] = logsumexp_j(alpha_{t-1}[j] + log T_t[j, k]) + loglik[t, k]
//! c_t    = logsumexp_k(a_t[k]),  alpha_t = a_t - c_t
//! ```
//!
//! The total data log-likelihood is the sum of the `c_t`.

use faer::Mat;
use log::warn;

use crate::{
    emission::LogLikelihoodTable,
    error::{HmmError, Result, Stage},
    math::{log_normalize, logsumexp_sum},
    transition::{InitialDistribution, TransitionMatrices},
};

/// Per time step distributions over the hidden states, stored as log
/// probabilities.
#[derive(Debug, Clone)]
pub struct FilteredDistribution {
    // One column per time step
    log_probs: Mat<f64>,
}

impl FilteredDistribution {
    pub fn num_steps(&self) -> usize {
        self.log_probs.ncols()
    }

    pub fn num_states(&self) -> usize {
        self.log_probs.nrows()
    }

    /// Normalized log probabilities of all states at step `t`.
    pub fn log_step(&self, t: usize) -> &[f64] {
        self.log_probs.col_as_slice(t)
    }

    /// Probabilities of all states at step `t`.
    pub fn step(&self, t: usize) -> Vec<f64> {
        self.log_step(t).iter().map(|x| x.exp()).collect()
    }

    pub fn prob(&self, t: usize, state: usize) -> f64 {
        self.log_probs[(state, t)].exp()
    }

    /// Sum of the probabilities of each time step. All entries are one up
    /// to rounding.
    pub fn row_sums(&self) -> Vec<f64> {
        (0..self.num_steps())
            .map(|t| self.log_step(t).iter().map(|x| x.exp()).sum())
            .collect()
    }

    /// The distributions as a `T x K` nested vector.
    pub fn to_rows(&self) -> Vec<Vec<f64>> {
        (0..self.num_steps()).map(|t| self.step(t)).collect()
    }
}

impl PartialEq for FilteredDistribution {
    fn eq(&self, other: &Self) -> bool {
        self.num_steps() == other.num_steps()
            && self.num_states() == other.num_states()
            && (0..self.num_steps()).all(|t| self.log_step(t) == other.log_step(t))
    }
}

/// Result of a forward pass.
#[derive(Debug, Clone)]
pub struct ForwardOutput {
    /// `P(s_t | y_0..y_t)`
    pub filtered: FilteredDistribution,
    /// `P(s_t | y_0..y_{t-1})`, the initial distribution for `t = 0`.
    pub predicted: FilteredDistribution,
    /// `log P(y_0..y_{T-1})`
    pub log_likelihood: f64,
}

fn check_inputs(
    initial: &InitialDistribution,
    transitions: &TransitionMatrices,
    log_likelihoods: &LogLikelihoodTable,
) -> Result<()> {
    let num_states = initial.num_states();
    if transitions.num_states() != num_states {
        return Err(HmmError::dimension(
            Stage::ForwardFilter,
            "number of states in transition matrices",
            num_states,
            transitions.num_states(),
        ));
    }
    if log_likelihoods.num_states() != num_states {
        return Err(HmmError::dimension(
            Stage::ForwardFilter,
            "number of states in log-likelihood table",
            num_states,
            log_likelihoods.num_states(),
        ));
    }
    if log_likelihoods.num_steps() == 0 {
        return Err(HmmError::dimension(
            Stage::ForwardFilter,
            "number of time steps",
            1,
            0,
        ));
    }
    transitions.check_steps(log_likelihoods.num_steps(), Stage::ForwardFilter)
}

/// Run the forward filter.
///
/// Fails with [`HmmError::DegenerateDistribution`] at the first time step
/// at which every state has zero probability.
pub fn forward_filter(
    initial: &InitialDistribution,
    transitions: &TransitionMatrices,
    log_likelihoods: &LogLikelihoodTable,
) -> Result<ForwardOutput> {
    check_inputs(initial, transitions, log_likelihoods)?;

    let num_states = initial.num_states();
    let num_steps = log_likelihoods.num_steps();

    let mut filtered = Mat::<f64>::zeros(num_states, num_steps);
    let mut predicted = Mat::<f64>::zeros(num_states, num_steps);
    let mut alpha = vec![0f64; num_states];
    let mut prediction = initial.log_probs().to_vec();
    let mut log_likelihood = 0f64;

    for t in 0..num_steps {
        if t > 0 {
            let matrix = transitions.matrix_for_step(t);
            for (k, pred) in prediction.iter_mut().enumerate() {
                *pred = logsumexp_sum(&alpha, matrix.log_col(k));
            }
        }

        alpha
            .iter_mut()
            .zip(prediction.iter().zip(log_likelihoods.step(t)))
            .for_each(|(a, (pred, loglik))| *a = pred + loglik);

        let log_norm = log_normalize(&mut alpha, Stage::ForwardFilter, t).inspect_err(|_| {
            warn!("Forward filter: every state has zero probability at step {}", t)
        })?;
        log_likelihood += log_norm;

        filtered.col_as_slice_mut(t).copy_from_slice(&alpha);
        predicted.col_as_slice_mut(t).copy_from_slice(&prediction);
    }

    Ok(ForwardOutput {
        filtered: FilteredDistribution {
            log_probs: filtered,
        },
        predicted: FilteredDistribution {
            log_probs: predicted,
        },
        log_likelihood,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{math::logsumexp, transition::TransitionMatrix};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn setup() -> (InitialDistribution, TransitionMatrices) {
        let matrix = TransitionMatrix::new(&[vec![0.9, 0.1], vec![0.2, 0.8]]).unwrap();
        (
            InitialDistribution::new(vec![0.5, 0.5]).unwrap(),
            matrix.into(),
        )
    }

    /// Sum over all state paths, feasible for tiny chains.
    fn brute_force_log_likelihood(
        initial: &InitialDistribution,
        transitions: &TransitionMatrices,
        table: &LogLikelihoodTable,
    ) -> f64 {
        let k = initial.num_states();
        let n = table.num_steps();
        let mut terms = vec![];
        for code in 0..k.pow(n as u32) {
            let path: Vec<usize> = (0..n).map(|t| (code / k.pow(t as u32)) % k).collect();
            let mut logp = initial.log_probs()[path[0]] + table.get(0, path[0]);
            for t in 1..n {
                logp += transitions.matrix_for_step(t).log_prob(path[t - 1], path[t]);
                logp += table.get(t, path[t]);
            }
            terms.push(logp);
        }
        logsumexp(&terms)
    }

    #[test]
    fn log_likelihood_matches_enumeration() {
        let (initial, transitions) = setup();
        let table =
            LogLikelihoodTable::from_rows(&[vec![-0.1, -2.], vec![-3., -0.5], vec![-1., -1.2]])
                .unwrap();
        let out = forward_filter(&initial, &transitions, &table).unwrap();
        let expected = brute_force_log_likelihood(&initial, &transitions, &table);
        assert_abs_diff_eq!(out.log_likelihood, expected, epsilon = 1e-10);
    }

    #[test]
    fn first_step_is_posterior_of_initial() {
        let (initial, transitions) = setup();
        let table = LogLikelihoodTable::from_rows(&[vec![0., -5.]]).unwrap();
        let out = forward_filter(&initial, &transitions, &table).unwrap();
        let expected = 1. / (1. + (-5f64).exp());
        assert_abs_diff_eq!(out.filtered.prob(0, 0), expected, epsilon = 1e-12);
        assert_eq!(out.predicted.step(0), vec![0.5, 0.5]);
    }

    #[test]
    fn long_sequences_do_not_underflow() {
        let (initial, transitions) = setup();
        let table =
            LogLikelihoodTable::from_fn(20_000, 2, |t, k| if (t / 100 + k) % 2 == 0 { -1. } else { -800. })
                .unwrap();
        let out = forward_filter(&initial, &transitions, &table).unwrap();
        assert!(out.log_likelihood.is_finite());
        for sum in out.filtered.row_sums() {
            assert_abs_diff_eq!(sum, 1., epsilon = 1e-10);
        }
    }

    #[test]
    fn degenerate_step_is_reported() {
        let (initial, transitions) = setup();
        let table = LogLikelihoodTable::from_rows(&[
            vec![0., 0.],
            vec![0., 0.],
            vec![f64::NEG_INFINITY, f64::NEG_INFINITY],
        ])
        .unwrap();
        let err = forward_filter(&initial, &transitions, &table).unwrap_err();
        assert_eq!(
            err,
            HmmError::DegenerateDistribution {
                stage: Stage::ForwardFilter,
                step: 2
            }
        );
    }

    #[test]
    fn impossible_transition_is_degenerate() {
        let matrix = TransitionMatrix::identity(2);
        let initial = InitialDistribution::new(vec![1., 0.]).unwrap();
        let table =
            LogLikelihoodTable::from_rows(&[vec![0., 0.], vec![f64::NEG_INFINITY, 0.]]).unwrap();
        let err = forward_filter(&initial, &matrix.into(), &table).unwrap_err();
        assert_eq!(err.index(), Some(1));
    }

    #[test]
    fn dimension_checks() {
        let (initial, transitions) = setup();
        let table = LogLikelihoodTable::from_rows(&[vec![0., 0., 0.]]).unwrap();
        assert!(matches!(
            forward_filter(&initial, &transitions, &table),
            Err(HmmError::DimensionMismatch { .. })
        ));

        let empty = LogLikelihoodTable::from_fn(0, 2, |_, _| 0.).unwrap();
        assert!(forward_filter(&initial, &transitions, &empty).is_err());

        let schedule = TransitionMatrices::per_step(vec![TransitionMatrix::identity(2); 3]).unwrap();
        let table = LogLikelihoodTable::from_fn(4, 2, |_, _| 0.).unwrap();
        assert!(forward_filter(&initial, &schedule, &table).is_err());
    }

    #[test]
    fn single_state_chain() {
        let initial = InitialDistribution::new(vec![1.]).unwrap();
        let transitions = TransitionMatrix::identity(1).into();
        let table = LogLikelihoodTable::from_fn(5, 1, |t, _| -(t as f64)).unwrap();
        let out = forward_filter(&initial, &transitions, &table).unwrap();
        assert_eq!(out.filtered.row_sums(), vec![1.; 5]);
        assert_abs_diff_eq!(out.log_likelihood, -10., epsilon = 1e-12);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let (initial, transitions) = setup();
        let table = LogLikelihoodTable::from_fn(50, 2, |t, k| ((t * 7 + k * 3) % 5) as f64 * -0.7)
            .unwrap();
        let a = forward_filter(&initial, &transitions, &table).unwrap();
        let b = forward_filter(&initial, &transitions, &table).unwrap();
        assert_eq!(a.filtered, b.filtered);
        assert_eq!(a.log_likelihood.to_bits(), b.log_likelihood.to_bits());
    }

    proptest! {
        #[test]
        fn filtered_rows_sum_to_one(
            loglik in prop::collection::vec(prop::collection::vec(-50f64..0f64, 3), 1..40),
            p in 0.01f64..0.99,
        ) {
            let matrix = TransitionMatrix::new(&[
                vec![p, (1. - p) / 2., (1. - p) / 2.],
                vec![(1. - p) / 2., p, (1. - p) / 2.],
                vec![0.2, 0.3, 0.5],
            ]).unwrap();
            let initial = InitialDistribution::uniform(3).unwrap();
            let table = LogLikelihoodTable::from_rows(&loglik).unwrap();
            let out = forward_filter(&initial, &matrix.into(), &table).unwrap();
            for sum in out.filtered.row_sums() {
                prop_assert!((sum - 1.).abs() < 1e-10);
            }
        }
    }
}
