//! Conjugate Dirichlet updates of transition matrix rows.
//!
//! With a `Dirichlet(alpha_i)` prior on row `i` and `n_ij` observed
//! transitions `i -> j`, the posterior of the row is `Dirichlet(alpha_i + n_i)`.

use itertools::Itertools;
use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::{
    error::{HmmError, Result, Stage},
    markov_chain::StateTrajectory,
    math::normalize_log_probs,
    transition::{TransitionMatrices, TransitionMatrix},
};

/// Number of observed `i -> j` transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCounts {
    num_states: usize,
    // Row major
    counts: Box<[u64]>,
}

impl TransitionCounts {
    pub fn zeros(num_states: usize) -> Self {
        Self {
            num_states,
            counts: vec![0; num_states * num_states].into(),
        }
    }

    /// Count all transitions in a trajectory, ignoring any grouping.
    pub fn from_trajectory(trajectory: &StateTrajectory, num_states: usize) -> Result<Self> {
        trajectory.check_states(num_states, Stage::TransitionSampler)?;
        let mut counts = Self::zeros(num_states);
        for (&from, &to) in trajectory.states().iter().tuple_windows() {
            counts.add(from, to);
        }
        Ok(counts)
    }

    fn add(&mut self, from: usize, to: usize) {
        self.counts[from * self.num_states + to] += 1;
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.counts[from * self.num_states + to]
    }

    pub fn row(&self, from: usize) -> &[u64] {
        &self.counts[from * self.num_states..(from + 1) * self.num_states]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Row-normalized empirical transition frequencies. Rows of states
    /// that were never left are all zero.
    pub fn frequencies(&self) -> Vec<Vec<f64>> {
        (0..self.num_states)
            .map(|i| {
                let row = self.row(i);
                let total: u64 = row.iter().sum();
                row.iter()
                    .map(|&n| if total == 0 { 0. } else { n as f64 / total as f64 })
                    .collect()
            })
            .collect()
    }
}

/// Count the transitions of a trajectory separately for every matrix of a
/// schedule. The transition `s_{t-1} -> s_t` belongs to the matrix that
/// governs step `t`.
pub fn count_transitions(
    trajectory: &StateTrajectory,
    transitions: &TransitionMatrices,
) -> Result<Vec<TransitionCounts>> {
    let num_states = transitions.num_states();
    trajectory.check_states(num_states, Stage::TransitionSampler)?;
    transitions.check_steps(trajectory.len(), Stage::TransitionSampler)?;

    let mut counts = vec![TransitionCounts::zeros(num_states); transitions.num_matrices()];
    for (t, (&from, &to)) in trajectory.states().iter().tuple_windows().enumerate() {
        counts[transitions.group_for_step(t + 1)].add(from, to);
    }
    Ok(counts)
}

/// Dirichlet concentration parameters, one vector per transition matrix row.
///
/// A zero entry marks a structural zero of the transition matrix: the
/// sampled probability of that transition is always zero. Concentrations
/// built from counts may contain rows without any mass (states that were
/// never left); such rows have an all-zero mean and cannot be sampled.
#[derive(Debug, Clone, PartialEq)]
pub struct DirichletConcentration {
    num_states: usize,
    // Row major
    alpha: Box<[f64]>,
}

impl DirichletConcentration {
    pub fn new(rows: &[Vec<f64>]) -> Result<Self> {
        let num_states = rows.len();
        if num_states == 0 {
            return Err(HmmError::dimension(
                Stage::TransitionSampler,
                "number of states",
                1,
                0,
            ));
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != num_states {
                return Err(HmmError::dimension(
                    Stage::TransitionSampler,
                    "concentration row length",
                    num_states,
                    row.len(),
                ));
            }
            if let Some(&bad) = row.iter().find(|a| !(a.is_finite() && **a >= 0.)) {
                return Err(HmmError::InvalidPrior {
                    stage: Stage::TransitionSampler,
                    row: i,
                    reason: format!("concentration {}", bad),
                });
            }
            if row.iter().all(|&a| a == 0.) {
                return Err(HmmError::InvalidPrior {
                    stage: Stage::TransitionSampler,
                    row: i,
                    reason: "all concentrations are zero".to_string(),
                });
            }
        }
        Ok(Self {
            num_states,
            alpha: rows.iter().flatten().copied().collect(),
        })
    }

    /// The same concentration for every entry.
    pub fn symmetric(num_states: usize, alpha: f64) -> Result<Self> {
        Self::new(&vec![vec![alpha; num_states]; num_states])
    }

    /// Use observed transition counts as concentration parameters.
    ///
    /// Rows of states that were never left stay empty.
    pub fn from_counts(counts: &TransitionCounts) -> Self {
        Self {
            num_states: counts.num_states(),
            alpha: counts.counts.iter().map(|&n| n as f64).collect(),
        }
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn row(&self, from: usize) -> &[f64] {
        &self.alpha[from * self.num_states..(from + 1) * self.num_states]
    }

    /// Mean of the Dirichlet distribution of every row, `alpha_ij / sum_j alpha_ij`.
    /// Rows without mass are all zero, like [`TransitionCounts::frequencies`].
    pub fn mean(&self) -> Vec<Vec<f64>> {
        (0..self.num_states)
            .map(|i| {
                let alpha = self.row(i);
                let total: f64 = alpha.iter().sum();
                alpha
                    .iter()
                    .map(|&a| if total > 0. { a / total } else { 0. })
                    .collect()
            })
            .collect()
    }

    /// The posterior concentration after observing `counts`.
    pub fn posterior(&self, counts: &TransitionCounts) -> Result<Self> {
        if counts.num_states() != self.num_states {
            return Err(HmmError::dimension(
                Stage::TransitionSampler,
                "number of states in transition counts",
                self.num_states,
                counts.num_states(),
            ));
        }
        for i in 0..self.num_states {
            let impossible = self
                .row(i)
                .iter()
                .zip(counts.row(i))
                .position(|(&a, &n)| a == 0. && n > 0);
            if let Some(j) = impossible {
                return Err(HmmError::InvalidDistribution {
                    stage: Stage::TransitionSampler,
                    index: i,
                    reason: format!("observed transition {} -> {} has zero prior mass", i, j),
                });
            }
        }
        let alpha = self
            .alpha
            .iter()
            .zip(counts.counts.iter())
            .map(|(&a, &n)| a + n as f64)
            .collect();
        Ok(Self {
            num_states: self.num_states,
            alpha,
        })
    }

    /// Draw a transition matrix with independent Dirichlet rows.
    ///
    /// Rows are drawn in order, so a fixed seed gives the same matrix.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<TransitionMatrix> {
        let k = self.num_states;
        let mut rows = vec![vec![0f64; k]; k];
        for (i, row) in rows.iter_mut().enumerate() {
            sample_dirichlet(self.row(i), row, i, rng)?;
        }
        Ok(TransitionMatrix::from_mat(faer::Mat::from_fn(k, k, |i, j| {
            rows[i][j]
        })))
    }
}

/// Draw from a Dirichlet distribution by normalizing Gamma variates.
///
/// The Gamma variates are generated in log space, using
/// `G(a) = G(a + 1) * U^(1/a)` for `a < 1`, so that very small
/// concentrations do not underflow to an all-zero row.
fn sample_dirichlet<R: Rng + ?Sized>(
    alpha: &[f64],
    out: &mut [f64],
    row: usize,
    rng: &mut R,
) -> Result<()> {
    if alpha.iter().all(|&a| a == 0.) {
        return Err(HmmError::InvalidPrior {
            stage: Stage::TransitionSampler,
            row,
            reason: "row has no concentration to sample from".to_string(),
        });
    }
    let mut log_gammas = vec![f64::NEG_INFINITY; alpha.len()];
    for (log_g, &a) in log_gammas.iter_mut().zip(alpha) {
        if a == 0. {
            continue;
        }
        let shape = if a < 1. { a + 1. } else { a };
        let gamma = Gamma::new(shape, 1.).map_err(|e| HmmError::InvalidPrior {
            stage: Stage::TransitionSampler,
            row,
            reason: e.to_string(),
        })?;
        let draw: f64 = gamma.sample(rng);
        *log_g = draw.ln();
        if a < 1. {
            let u: f64 = rng.random();
            *log_g += u.ln() / a;
        }
    }
    normalize_log_probs(&log_gammas, out, Stage::TransitionSampler, row)
}

/// Draw new transition matrices from their conjugate posterior given a
/// trajectory, one matrix per group of the schedule.
///
/// Groups and rows without observed transitions are drawn from the prior.
pub fn sample_transitions<R: Rng + ?Sized>(
    trajectory: &StateTrajectory,
    prior: &DirichletConcentration,
    transitions: &TransitionMatrices,
    rng: &mut R,
) -> Result<TransitionMatrices> {
    if prior.num_states() != transitions.num_states() {
        return Err(HmmError::dimension(
            Stage::TransitionSampler,
            "number of states in Dirichlet prior",
            transitions.num_states(),
            prior.num_states(),
        ));
    }
    let counts = count_transitions(trajectory, transitions)?;
    let matrices = counts
        .iter()
        .map(|counts| prior.posterior(counts)?.sample(rng))
        .collect::<Result<Vec<_>>>()?;
    transitions.with_matrices(matrices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn counts_and_frequencies() {
        let traj = StateTrajectory::from(vec![0, 0, 1, 1, 1, 0, 2]);
        let counts = TransitionCounts::from_trajectory(&traj, 3).unwrap();
        assert_eq!(counts.row(0), &[1, 1, 1]);
        assert_eq!(counts.row(1), &[1, 2, 0]);
        assert_eq!(counts.row(2), &[0, 0, 0]);
        assert_eq!(counts.total(), 6);

        let freqs = counts.frequencies();
        assert_eq!(freqs[1], vec![1. / 3., 2. / 3., 0.]);
        assert_eq!(freqs[2], vec![0., 0., 0.]);
    }

    #[test]
    fn grouped_counts() {
        let a = TransitionMatrix::identity(2);
        let schedule =
            TransitionMatrices::grouped(vec![a.clone(), a], vec![0, 0, 0, 1, 1]).unwrap();
        let traj = StateTrajectory::from(vec![0, 1, 1, 0, 0]);
        let counts = count_transitions(&traj, &schedule).unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].row(0), &[0, 1]);
        assert_eq!(counts[0].row(1), &[0, 1]);
        assert_eq!(counts[1].row(1), &[1, 0]);
        assert_eq!(counts[1].row(0), &[1, 0]);
    }

    #[test]
    fn prior_validation() {
        assert!(DirichletConcentration::new(&[vec![1., -1.], vec![1., 1.]]).is_err());
        assert!(DirichletConcentration::new(&[vec![0., 0.], vec![1., 1.]]).is_err());
        assert!(DirichletConcentration::new(&[vec![1.], vec![1., 1.]]).is_err());
        assert!(DirichletConcentration::new(&[vec![0., 1.], vec![1., 1.]]).is_ok());
    }

    #[test]
    fn structural_zeros_stay_zero() {
        let prior =
            DirichletConcentration::new(&[vec![1., 0., 1.], vec![0., 1., 1.], vec![1., 1., 1.]])
                .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let matrix = prior.sample(&mut rng).unwrap();
            assert_eq!(matrix.prob(0, 1), 0.);
            assert_eq!(matrix.prob(1, 0), 0.);
            assert_abs_diff_eq!(matrix.row(2).iter().sum::<f64>(), 1., epsilon = 1e-12);
        }

        let traj = StateTrajectory::from(vec![0, 1]);
        let counts = TransitionCounts::from_trajectory(&traj, 3).unwrap();
        assert!(matches!(
            prior.posterior(&counts),
            Err(HmmError::InvalidDistribution { index: 0, .. })
        ));
    }

    #[test]
    fn tiny_concentrations_do_not_underflow() {
        let prior = DirichletConcentration::symmetric(3, 1e-4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            let matrix = prior.sample(&mut rng).unwrap();
            for i in 0..3 {
                let sum: f64 = matrix.row(i).iter().sum();
                assert_abs_diff_eq!(sum, 1., epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn posterior_mean_of_counts_is_frequency() {
        let traj = StateTrajectory::from(vec![0, 1, 1, 0, 0, 0, 1, 1, 1, 0]);
        let counts = TransitionCounts::from_trajectory(&traj, 2).unwrap();
        let concentration = DirichletConcentration::from_counts(&counts);
        let mean = concentration.mean();
        let freqs = counts.frequencies();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(mean[i][j], freqs[i][j], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn counts_with_unvisited_state() {
        let traj = StateTrajectory::from(vec![0, 0, 0, 0]);
        let counts = TransitionCounts::from_trajectory(&traj, 2).unwrap();
        let concentration = DirichletConcentration::from_counts(&counts);
        assert_eq!(concentration.mean(), counts.frequencies());
        assert_eq!(concentration.mean(), vec![vec![1., 0.], vec![0., 0.]]);

        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            concentration.sample(&mut rng),
            Err(HmmError::InvalidPrior { row: 1, .. })
        ));

        // Adding a proper prior makes every row samplable again
        let prior = DirichletConcentration::symmetric(2, 1.).unwrap();
        let posterior = prior.posterior(&counts).unwrap();
        assert_eq!(posterior.mean(), vec![vec![4. / 5., 1. / 5.], vec![0.5, 0.5]]);
        assert!(posterior.sample(&mut rng).is_ok());
    }

    #[test]
    fn empty_counts_sample_the_prior() {
        let prior = DirichletConcentration::new(&[vec![2., 6.], vec![5., 5.]]).unwrap();
        let schedule = TransitionMatrices::constant(TransitionMatrix::identity(2));
        let traj = StateTrajectory::from(vec![1]);
        let mut rng = StdRng::seed_from_u64(11);

        let n = 20_000;
        let mut mean = [0f64; 2];
        let mut second = 0f64;
        for _ in 0..n {
            let sample = sample_transitions(&traj, &prior, &schedule, &mut rng).unwrap();
            let m = &sample.matrices()[0];
            mean[0] += m.prob(0, 0) / n as f64;
            mean[1] += m.prob(1, 0) / n as f64;
            second += m.prob(0, 0).powi(2) / n as f64;
        }
        // Beta(2, 6): mean 1/4, variance 2 * 6 / (8^2 * 9)
        assert_abs_diff_eq!(mean[0], 0.25, epsilon = 0.01);
        assert_abs_diff_eq!(mean[1], 0.5, epsilon = 0.01);
        let variance = second - mean[0] * mean[0];
        assert_abs_diff_eq!(variance, 12. / 576., epsilon = 0.003);
    }

    #[test]
    fn posterior_concentrates_on_frequencies() {
        let prior = DirichletConcentration::symmetric(2, 1.).unwrap();
        let schedule = TransitionMatrices::constant(TransitionMatrix::identity(2));
        let states = (0..5000).map(|t| if t % 10 < 7 { 0 } else { 1 }).collect_vec();
        let traj = StateTrajectory::from(states);
        let counts = TransitionCounts::from_trajectory(&traj, 2).unwrap();
        let freqs = counts.frequencies();

        let mut rng = StdRng::seed_from_u64(3);
        let sample = sample_transitions(&traj, &prior, &schedule, &mut rng).unwrap();
        let m = &sample.matrices()[0];
        assert_abs_diff_eq!(m.prob(0, 0), freqs[0][0], epsilon = 0.05);
        assert_abs_diff_eq!(m.prob(1, 1), freqs[1][1], epsilon = 0.05);
    }
}
