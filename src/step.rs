//! The interface to the host sampler.
//!
//! A host implements [`HmmModel`] to hand over the current initial
//! distribution and emission log-likelihoods, and receives the sampled
//! trajectory and transition matrices back through [`HmmModel::update`].
//! The two Gibbs steps can also be called directly by hosts that drive
//! their own sampling loop.

use rand::Rng;

use crate::{
    backward::ffbs,
    conjugate::{sample_transitions, DirichletConcentration},
    emission::{LogLikelihoodTable, ObservationModel, SwitchingProcess},
    error::{HmmError, Result, Stage},
    forward::FilteredDistribution,
    markov_chain::StateTrajectory,
    transition::{InitialDistribution, TransitionMatrices},
};

/// A hidden Markov model as seen from the host sampler.
///
/// The host owns the current values of all parameters. The discrete
/// states are never differentiated: the host receives the sampled
/// trajectory in [`HmmModel::update`] and can then run gradient based
/// updates of its continuous parameters with the trajectory held fixed.
pub trait HmmModel {
    type Err: std::error::Error + Send + Sync + 'static;

    fn num_states(&self) -> usize;

    fn num_steps(&self) -> usize;

    /// Transition matrices used for the first draw.
    fn init_transitions<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> std::result::Result<TransitionMatrices, Self::Err>;

    /// The distribution of the first state given the current transitions.
    fn initial_distribution(
        &self,
        transitions: &TransitionMatrices,
    ) -> std::result::Result<InitialDistribution, Self::Err>;

    /// The emission log-likelihood table for the current continuous
    /// parameters.
    fn log_likelihoods(&mut self) -> std::result::Result<LogLikelihoodTable, Self::Err>;

    /// Called after every Gibbs sweep with the new discrete state and
    /// transition matrices.
    fn update<R: Rng + ?Sized>(
        &mut self,
        _trajectory: &StateTrajectory,
        _transitions: &TransitionMatrices,
        _rng: &mut R,
    ) -> std::result::Result<(), Self::Err> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FfbsOptions {
    /// Return the filtered distributions together with the trajectory.
    pub store_filtered: bool,
}

/// Result of a single [`FfbsStep`].
#[derive(Debug, Clone)]
pub struct FfbsResult {
    pub trajectory: StateTrajectory,
    /// `log P(y)` under the parameters used for the step.
    pub log_likelihood: f64,
    pub filtered: Option<FilteredDistribution>,
}

/// Gibbs step that draws the state trajectory with
/// forward-filtering backward-sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfbsStep {
    options: FfbsOptions,
}

impl FfbsStep {
    pub fn new(options: FfbsOptions) -> Self {
        Self { options }
    }

    pub fn step<R: Rng + ?Sized>(
        &self,
        initial: &InitialDistribution,
        transitions: &TransitionMatrices,
        log_likelihoods: &LogLikelihoodTable,
        rng: &mut R,
    ) -> Result<FfbsResult> {
        let draw = ffbs(initial, transitions, log_likelihoods, rng)?;
        let filtered = if self.options.store_filtered {
            Some(draw.forward.filtered)
        } else {
            None
        };
        Ok(FfbsResult {
            trajectory: draw.trajectory,
            log_likelihood: draw.forward.log_likelihood,
            filtered,
        })
    }
}

/// Gibbs step that draws the transition matrices from their conjugate
/// Dirichlet posterior.
#[derive(Debug, Clone)]
pub struct TransMatConjugateStep {
    prior: DirichletConcentration,
}

impl TransMatConjugateStep {
    pub fn new(prior: DirichletConcentration) -> Self {
        Self { prior }
    }

    pub fn prior(&self) -> &DirichletConcentration {
        &self.prior
    }

    /// Draw new matrices for every group of `transitions`, keeping its
    /// time step mapping.
    pub fn step<R: Rng + ?Sized>(
        &self,
        trajectory: &StateTrajectory,
        transitions: &TransitionMatrices,
        rng: &mut R,
    ) -> Result<TransitionMatrices> {
        sample_transitions(trajectory, &self.prior, transitions, rng)
    }
}

/// How a [`SwitchingHmm`] chooses the distribution of the first state.
#[derive(Debug, Clone, PartialEq)]
pub enum InitialStates {
    Fixed(InitialDistribution),
    /// The stationary distribution of the first transition matrix.
    SteadyState,
}

/// A complete model: a [`SwitchingProcess`] with fixed emission
/// parameters observed at every time step.
#[derive(Debug, Clone)]
pub struct SwitchingHmm {
    observations: Vec<f64>,
    process: SwitchingProcess,
    initial: InitialStates,
    transitions: TransitionMatrices,
}

impl SwitchingHmm {
    pub fn new(
        observations: Vec<f64>,
        process: SwitchingProcess,
        initial: InitialStates,
        transitions: TransitionMatrices,
    ) -> Result<Self> {
        let num_states = process.num_states();
        if transitions.num_states() != num_states {
            return Err(HmmError::dimension(
                Stage::TransitionMatrix,
                "number of states",
                num_states,
                transitions.num_states(),
            ));
        }
        if let InitialStates::Fixed(initial) = &initial {
            if initial.num_states() != num_states {
                return Err(HmmError::dimension(
                    Stage::InitialDistribution,
                    "number of states",
                    num_states,
                    initial.num_states(),
                ));
            }
        }
        transitions.check_steps(observations.len(), Stage::TransitionMatrix)?;
        Ok(Self {
            observations,
            process,
            initial,
            transitions,
        })
    }

    pub fn observations(&self) -> &[f64] {
        &self.observations
    }

    pub fn process(&self) -> &SwitchingProcess {
        &self.process
    }
}

impl HmmModel for SwitchingHmm {
    type Err = HmmError;

    fn num_states(&self) -> usize {
        self.process.num_states()
    }

    fn num_steps(&self) -> usize {
        self.observations.len()
    }

    fn init_transitions<R: Rng + ?Sized>(&self, _rng: &mut R) -> Result<TransitionMatrices> {
        Ok(self.transitions.clone())
    }

    fn initial_distribution(&self, transitions: &TransitionMatrices) -> Result<InitialDistribution> {
        match &self.initial {
            InitialStates::Fixed(initial) => Ok(initial.clone()),
            InitialStates::SteadyState => transitions.matrices()[0].steady_state(),
        }
    }

    fn log_likelihoods(&mut self) -> Result<LogLikelihoodTable> {
        self.process.log_likelihood_table(&self.observations)
    }
}
