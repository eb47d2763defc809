//! The prior over discrete state sequences induced by an initial
//! distribution and a schedule of transition matrices.

use faer::Mat;
use rand::Rng;

use crate::{
    error::{HmmError, Result, Stage},
    math::sample_categorical,
    transition::{InitialDistribution, TransitionMatrices},
};

/// One realization of the hidden state sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateTrajectory {
    states: Box<[usize]>,
}

impl StateTrajectory {
    pub fn new(states: impl Into<Box<[usize]>>) -> Self {
        Self {
            states: states.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[usize] {
        &self.states
    }

    /// Fail if any state label is not smaller than `num_states`.
    pub fn check_states(&self, num_states: usize, stage: Stage) -> Result<()> {
        match self.states.iter().position(|&s| s >= num_states) {
            Some(step) => Err(HmmError::InvalidState {
                stage,
                step,
                state: self.states[step],
                num_states,
            }),
            None => Ok(()),
        }
    }
}

impl From<Vec<usize>> for StateTrajectory {
    fn from(states: Vec<usize>) -> Self {
        StateTrajectory::new(states)
    }
}

impl std::ops::Index<usize> for StateTrajectory {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.states[index]
    }
}

/// Common interface of distributions over state sequences.
pub trait StateSequenceDistribution {
    fn num_states(&self) -> usize;

    /// The length of the sequences, if it is fixed by the distribution.
    fn num_steps(&self) -> Option<usize>;

    fn log_probability(&self, sequence: &StateTrajectory) -> Result<f64>;

    fn sample<R: Rng + ?Sized>(&self, num_steps: usize, rng: &mut R) -> Result<StateTrajectory>;
}

/// Gradient of the sequence log probability with respect to the
/// entries of the initial distribution and of every transition matrix.
#[derive(Debug, Clone)]
pub struct SequenceLogpGrad {
    pub logp: f64,
    pub initial: Box<[f64]>,
    /// One `K x K` matrix per transition matrix in the schedule.
    pub transitions: Vec<Mat<f64>>,
}

/// A discrete Markov chain `s_0 ~ pi`, `s_t ~ T_t[s_{t-1}, .]`.
#[derive(Debug, Clone)]
pub struct DiscreteMarkovChain {
    initial: InitialDistribution,
    transitions: TransitionMatrices,
}

impl DiscreteMarkovChain {
    pub fn new(initial: InitialDistribution, transitions: TransitionMatrices) -> Result<Self> {
        if initial.num_states() != transitions.num_states() {
            return Err(HmmError::dimension(
                Stage::StateSequencePrior,
                "number of states",
                transitions.num_states(),
                initial.num_states(),
            ));
        }
        Ok(Self {
            initial,
            transitions,
        })
    }

    pub fn initial(&self) -> &InitialDistribution {
        &self.initial
    }

    pub fn transitions(&self) -> &TransitionMatrices {
        &self.transitions
    }

    fn check_sequence(&self, sequence: &StateTrajectory) -> Result<()> {
        if sequence.is_empty() {
            return Err(HmmError::dimension(
                Stage::StateSequencePrior,
                "sequence length",
                1,
                0,
            ));
        }
        self.transitions
            .check_steps(sequence.len(), Stage::StateSequencePrior)?;
        sequence.check_states(self.num_states(), Stage::StateSequencePrior)
    }

    /// The log probability and its gradient with respect to the entries of
    /// the initial distribution and the transition matrices.
    ///
    /// The state sequence is fixed; only the continuous parameters are
    /// differentiated.
    pub fn logp_and_grad(&self, sequence: &StateTrajectory) -> Result<SequenceLogpGrad> {
        self.check_sequence(sequence)?;
        let k = self.num_states();
        let mut initial = vec![0f64; k].into_boxed_slice();
        let mut transitions = vec![Mat::<f64>::zeros(k, k); self.transitions.num_matrices()];

        let s0 = sequence[0];
        let mut logp = self.initial.log_probs()[s0];
        initial[s0] = 1. / self.initial.probs()[s0];

        for (t, pair) in sequence.states().windows(2).enumerate() {
            let step = t + 1;
            let (from, to) = (pair[0], pair[1]);
            let group = self.transitions.group_for_step(step);
            let matrix = self.transitions.matrix_for_step(step);
            logp += matrix.log_prob(from, to);
            transitions[group][(from, to)] += 1. / matrix.prob(from, to);
        }

        Ok(SequenceLogpGrad {
            logp,
            initial,
            transitions,
        })
    }
}

impl StateSequenceDistribution for DiscreteMarkovChain {
    fn num_states(&self) -> usize {
        self.initial.num_states()
    }

    fn num_steps(&self) -> Option<usize> {
        self.transitions.num_steps()
    }

    fn log_probability(&self, sequence: &StateTrajectory) -> Result<f64> {
        self.check_sequence(sequence)?;
        let states = sequence.states();
        let initial = self.initial.log_probs()[states[0]];
        let transitions: f64 = states
            .windows(2)
            .enumerate()
            .map(|(t, pair)| {
                self.transitions
                    .matrix_for_step(t + 1)
                    .log_prob(pair[0], pair[1])
            })
            .sum();
        Ok(initial + transitions)
    }

    fn sample<R: Rng + ?Sized>(&self, num_steps: usize, rng: &mut R) -> Result<StateTrajectory> {
        if num_steps == 0 {
            return Err(HmmError::dimension(
                Stage::StateSequencePrior,
                "sequence length",
                1,
                0,
            ));
        }
        self.transitions
            .check_steps(num_steps, Stage::StateSequencePrior)?;

        let mut states = Vec::with_capacity(num_steps);
        states.push(sample_categorical(self.initial.probs(), rng));
        for t in 1..num_steps {
            let row = self.transitions.matrix_for_step(t).row(states[t - 1]);
            states.push(sample_categorical(&row, rng));
        }
        Ok(StateTrajectory::new(states))
    }
}

/// `log P(sequence)` under the chain defined by `initial` and `transitions`.
pub fn log_probability(
    sequence: &StateTrajectory,
    initial: &InitialDistribution,
    transitions: &TransitionMatrices,
) -> Result<f64> {
    DiscreteMarkovChain::new(initial.clone(), transitions.clone())?.log_probability(sequence)
}

/// Draw a state sequence of length `num_steps` from the prior.
pub fn sample_prior<R: Rng + ?Sized>(
    num_steps: usize,
    initial: &InitialDistribution,
    transitions: &TransitionMatrices,
    rng: &mut R,
) -> Result<StateTrajectory> {
    DiscreteMarkovChain::new(initial.clone(), transitions.clone())?.sample(num_steps, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::TransitionMatrix;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn two_state_chain() -> DiscreteMarkovChain {
        let matrix = TransitionMatrix::new(&[vec![0.9, 0.1], vec![0.2, 0.8]]).unwrap();
        DiscreteMarkovChain::new(
            InitialDistribution::new(vec![0.5, 0.5]).unwrap(),
            matrix.into(),
        )
        .unwrap()
    }

    #[test]
    fn log_probability_of_short_sequence() {
        let chain = two_state_chain();
        let seq = StateTrajectory::from(vec![0, 0, 1, 1]);
        let expected = 0.5f64.ln() + 0.9f64.ln() + 0.1f64.ln() + 0.8f64.ln();
        assert_abs_diff_eq!(chain.log_probability(&seq).unwrap(), expected, epsilon = 1e-12);
    }

    #[test]
    fn time_varying_log_probability() {
        let a = TransitionMatrix::new(&[vec![0.9, 0.1], vec![0.2, 0.8]]).unwrap();
        let b = TransitionMatrix::new(&[vec![0.3, 0.7], vec![0.6, 0.4]]).unwrap();
        let schedule = TransitionMatrices::grouped(vec![a, b], vec![0, 0, 1]).unwrap();
        let initial = InitialDistribution::new(vec![0.25, 0.75]).unwrap();
        let seq = StateTrajectory::from(vec![1, 0, 1]);
        let logp = log_probability(&seq, &initial, &schedule).unwrap();
        let expected = 0.75f64.ln() + 0.2f64.ln() + 0.7f64.ln();
        assert_abs_diff_eq!(logp, expected, epsilon = 1e-12);

        let short = StateTrajectory::from(vec![1, 0]);
        assert!(matches!(
            log_probability(&short, &initial, &schedule),
            Err(HmmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn rejects_bad_states() {
        let chain = two_state_chain();
        let err = chain
            .log_probability(&StateTrajectory::from(vec![0, 2]))
            .unwrap_err();
        assert_eq!(
            err,
            HmmError::InvalidState {
                stage: Stage::StateSequencePrior,
                step: 1,
                state: 2,
                num_states: 2
            }
        );
        assert!(chain.log_probability(&StateTrajectory::new(Vec::new())).is_err());
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let chain = two_state_chain();
        let seq = StateTrajectory::from(vec![0, 0, 1, 1, 0]);
        let grad = chain.logp_and_grad(&seq).unwrap();
        assert_abs_diff_eq!(grad.logp, chain.log_probability(&seq).unwrap());

        // d/dT[0,0] of log T[0,0] counted once
        assert_abs_diff_eq!(grad.transitions[0][(0, 0)], 1. / 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(grad.transitions[0][(1, 0)], 1. / 0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(grad.initial[0], 2., epsilon = 1e-12);
        assert_eq!(grad.initial[1], 0.);

        // The perturbed matrix is off the simplex, so difference the single term
        let eps = 1e-6;
        let numeric = ((0.8f64 + eps).ln() - 0.8f64.ln()) / eps;
        assert_abs_diff_eq!(grad.transitions[0][(1, 1)], numeric, epsilon = 1e-4);
    }

    #[test]
    fn prior_samples_follow_structural_zeros() {
        let matrix = TransitionMatrix::new(&[vec![0., 1.], vec![1., 0.]]).unwrap();
        let chain = DiscreteMarkovChain::new(
            InitialDistribution::new(vec![1., 0.]).unwrap(),
            matrix.into(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let seq = chain.sample(6, &mut rng).unwrap();
        assert_eq!(seq.states(), &[0, 1, 0, 1, 0, 1]);
        assert!(chain.log_probability(&seq).unwrap().abs() < 1e-12);
    }

    #[test]
    fn prior_sampling_is_reproducible() {
        let chain = two_state_chain();
        let a = chain.sample(50, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = chain.sample(50, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn logp_is_sum_of_terms(states in prop::collection::vec(0usize..3, 1..30)) {
            let rows = vec![
                vec![0.5, 0.25, 0.25],
                vec![0.1, 0.8, 0.1],
                vec![0.3, 0.3, 0.4],
            ];
            let initial = [0.2, 0.3, 0.5];
            let matrix = TransitionMatrix::new(&rows).unwrap();
            let chain = DiscreteMarkovChain::new(
                InitialDistribution::new(initial.to_vec()).unwrap(),
                matrix.into(),
            ).unwrap();
            let mut expected = initial[states[0]].ln();
            for pair in states.windows(2) {
                expected += rows[pair[0]][pair[1]].ln();
            }
            let seq = StateTrajectory::from(states);
            prop_assert!((chain.log_probability(&seq).unwrap() - expected).abs() < 1e-10);
        }
    }
}
