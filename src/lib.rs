//! Forward-filtering backward-sampling (FFBS) and conjugate transition
//! matrix updates for hidden Markov models inside a Gibbs sampler.
//!
//! One Gibbs sweep runs the forward filter over the emission
//! log-likelihoods, draws a state trajectory backward in time, and draws
//! new transition matrices from their Dirichlet posterior given that
//! trajectory. All random draws go through an explicitly passed
//! generator, so a fixed seed reproduces every result.
//!
//! ```
//! use ffbs_rs::{ffbs, InitialDistribution, LogLikelihoodTable, TransitionMatrix};
//! use rand::SeedableRng;
//!
//! let matrix = TransitionMatrix::new(&[vec![0.9, 0.1], vec![0.2, 0.8]]).unwrap();
//! let initial = InitialDistribution::new(vec![0.5, 0.5]).unwrap();
//! let table = LogLikelihoodTable::from_rows(&vec![vec![0., -5.]; 4]).unwrap();
//! let mut rng = rand::rngs::StdRng::seed_from_u64(42);
//!
//! let draw = ffbs(&initial, &matrix.into(), &table, &mut rng).unwrap();
//! assert_eq!(draw.trajectory.len(), 4);
//! ```

pub(crate) mod backward;
pub(crate) mod conjugate;
pub(crate) mod emission;
pub(crate) mod error;
pub(crate) mod forward;
pub(crate) mod markov_chain;
pub(crate) mod math;
pub(crate) mod sampler;
pub(crate) mod step;
pub(crate) mod transition;

pub use backward::{backward_sample, ffbs, FfbsDraw};
pub use conjugate::{count_transitions, sample_transitions, DirichletConcentration, TransitionCounts};
pub use emission::{Component, LogLikelihoodTable, ObservationModel, SwitchingProcess};
pub use error::{HmmError, Result, Stage};
pub use forward::{forward_filter, FilteredDistribution, ForwardOutput};
pub use markov_chain::{
    log_probability, sample_prior, DiscreteMarkovChain, SequenceLogpGrad,
    StateSequenceDistribution, StateTrajectory,
};
pub use math::{log_normalize, logaddexp, logsumexp, normalize_log_probs};
pub use sampler::{
    sample_parallel, sample_sequentially, ChainOutput, GibbsDraw, GibbsSettings, HmmChain,
    Progress, Trace,
};
pub use step::{
    FfbsOptions, FfbsResult, FfbsStep, HmmModel, InitialStates, SwitchingHmm,
    TransMatConjugateStep,
};
pub use transition::{InitialDistribution, TransitionMatrices, TransitionMatrix, PROB_TOLERANCE};
