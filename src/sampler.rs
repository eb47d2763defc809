use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, trace};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};

use crate::{
    conjugate::DirichletConcentration,
    forward::FilteredDistribution,
    markov_chain::StateTrajectory,
    step::{FfbsOptions, FfbsStep, HmmModel, TransMatConjugateStep},
    transition::TransitionMatrices,
};

/// Settings for the Gibbs sampler
#[derive(Debug, Clone, Copy)]
pub struct GibbsSettings {
    /// The number of draws that are discarded at the start of each chain.
    pub num_tune: u64,
    /// The number of draws after tuning
    pub num_draws: u64,
    pub num_chains: usize,
    pub seed: u64,
    /// Draw the transition matrices from their conjugate posterior after
    /// every FFBS step. If false they stay at their initial values.
    pub sample_transitions: bool,
    /// Store the filtered distributions of every draw.
    pub store_filtered: bool,
}

impl Default for GibbsSettings {
    fn default() -> Self {
        Self {
            num_tune: 100,
            num_draws: 1000,
            num_chains: 4,
            seed: 0,
            sample_transitions: true,
            store_filtered: false,
        }
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub draw: u64,
    pub chain: u64,
    pub tuning: bool,
    pub log_likelihood: f64,
}

/// The state of the chain after one Gibbs sweep.
#[derive(Debug, Clone)]
pub struct GibbsDraw {
    pub trajectory: StateTrajectory,
    pub transitions: TransitionMatrices,
    /// Data log-likelihood under the parameters used for the FFBS step.
    pub log_likelihood: f64,
    pub filtered: Option<FilteredDistribution>,
}

/// One chain of the Gibbs sampler.
///
/// Each call to [`HmmChain::draw`] runs the forward filter, draws a
/// trajectory backward in time, draws new transition matrices from their
/// conjugate posterior and finally hands both to the host model.
pub struct HmmChain<M: HmmModel, R: Rng> {
    model: M,
    ffbs: FfbsStep,
    transition_step: Option<TransMatConjugateStep>,
    transitions: TransitionMatrices,
    rng: R,
    chain: u64,
    draw_count: u64,
    num_tune: u64,
}

impl<M: HmmModel, R: Rng> HmmChain<M, R> {
    pub fn new(
        model: M,
        prior: DirichletConcentration,
        settings: &GibbsSettings,
        mut rng: R,
        chain: u64,
    ) -> Result<Self> {
        let transitions = model
            .init_transitions(&mut rng)
            .context("Failed to create initial transition matrices")?;
        let ffbs = FfbsStep::new(FfbsOptions {
            store_filtered: settings.store_filtered,
        });
        let transition_step = settings
            .sample_transitions
            .then(|| TransMatConjugateStep::new(prior));
        Ok(Self {
            model,
            ffbs,
            transition_step,
            transitions,
            rng,
            chain,
            draw_count: 0,
            num_tune: settings.num_tune,
        })
    }

    /// Replace the current transition matrices.
    pub fn set_transitions(&mut self, transitions: TransitionMatrices) {
        self.transitions = transitions;
    }

    pub fn transitions(&self) -> &TransitionMatrices {
        &self.transitions
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Run one Gibbs sweep.
    ///
    /// An error aborts the sweep; the chain keeps the transition matrices
    /// of the previous sweep.
    pub fn draw(&mut self) -> Result<(GibbsDraw, Progress)> {
        let initial = self
            .model
            .initial_distribution(&self.transitions)
            .context("Failed to compute the initial state distribution")?;
        let log_likelihoods = self
            .model
            .log_likelihoods()
            .context("Failed to compute emission log-likelihoods")?;

        let ffbs = self
            .ffbs
            .step(&initial, &self.transitions, &log_likelihoods, &mut self.rng)
            .with_context(|| {
                format!(
                    "FFBS step failed in chain {} at draw {}",
                    self.chain, self.draw_count
                )
            })?;

        let transitions = match &self.transition_step {
            Some(step) => step
                .step(&ffbs.trajectory, &self.transitions, &mut self.rng)
                .with_context(|| {
                    format!(
                        "Transition matrix step failed in chain {} at draw {}",
                        self.chain, self.draw_count
                    )
                })?,
            None => self.transitions.clone(),
        };

        self.model
            .update(&ffbs.trajectory, &transitions, &mut self.rng)
            .with_context(|| {
                format!(
                    "Host model update failed in chain {} at draw {}",
                    self.chain, self.draw_count
                )
            })?;
        self.transitions = transitions;

        trace!(
            "chain {} draw {}: log-likelihood {}",
            self.chain,
            self.draw_count,
            ffbs.log_likelihood
        );

        let progress = Progress {
            draw: self.draw_count,
            chain: self.chain,
            tuning: self.draw_count < self.num_tune,
            log_likelihood: ffbs.log_likelihood,
        };
        self.draw_count += 1;

        let draw = GibbsDraw {
            trajectory: ffbs.trajectory,
            transitions: self.transitions.clone(),
            log_likelihood: ffbs.log_likelihood,
            filtered: ffbs.filtered,
        };
        Ok((draw, progress))
    }
}

pub fn sample_sequentially<M: HmmModel, R: Rng + ?Sized>(
    model: M,
    prior: DirichletConcentration,
    settings: GibbsSettings,
    draws: u64,
    chain: u64,
    rng: &mut R,
) -> Result<impl Iterator<Item = Result<(GibbsDraw, Progress)>>> {
    let rng = SmallRng::seed_from_u64(rng.random());
    let mut sampler = HmmChain::new(model, prior, &settings, rng, chain)?;
    Ok((0..draws).map(move |_| sampler.draw()))
}

/// The draws of one chain after tuning.
#[derive(Debug, Clone)]
pub struct ChainOutput {
    pub chain_id: u64,
    pub trajectories: Vec<StateTrajectory>,
    pub transitions: Vec<TransitionMatrices>,
    pub log_likelihoods: Vec<f64>,
    pub filtered: Vec<FilteredDistribution>,
}

impl ChainOutput {
    fn new(chain_id: u64, capacity: usize) -> Self {
        Self {
            chain_id,
            trajectories: Vec::with_capacity(capacity),
            transitions: Vec::with_capacity(capacity),
            log_likelihoods: Vec::with_capacity(capacity),
            filtered: Vec::new(),
        }
    }

    fn append(&mut self, draw: GibbsDraw) {
        self.trajectories.push(draw.trajectory);
        self.transitions.push(draw.transitions);
        self.log_likelihoods.push(draw.log_likelihood);
        if let Some(filtered) = draw.filtered {
            self.filtered.push(filtered);
        }
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Trace {
    pub chains: Vec<ChainOutput>,
}

impl<I: Iterator<Item = ChainOutput>> From<I> for Trace {
    fn from(value: I) -> Self {
        let mut chains = value.into_iter().collect_vec();
        chains.sort_unstable_by_key(|x| x.chain_id);
        Trace { chains }
    }
}

fn run_chain<M: HmmModel>(
    model: M,
    prior: DirichletConcentration,
    settings: &GibbsSettings,
    chain_id: u64,
) -> Result<ChainOutput> {
    let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
    rng.set_stream(chain_id);

    let mut sampler = HmmChain::new(model, prior, settings, rng, chain_id)
        .with_context(|| format!("Could not start chain {}", chain_id))?;
    debug!("Starting chain {}", chain_id);

    let mut output = ChainOutput::new(chain_id, settings.num_draws as usize);
    for _ in 0..(settings.num_tune + settings.num_draws) {
        let (draw, progress) = sampler.draw()?;
        if !progress.tuning {
            output.append(draw);
        }
    }
    debug!("Finished chain {} with {} draws", chain_id, output.len());
    Ok(output)
}

/// Run `settings.num_chains` independent chains on a thread pool.
///
/// Chain `i` uses stream `i` of a ChaCha generator seeded with
/// `settings.seed`, so results do not depend on the number of threads.
pub fn sample_parallel<M: HmmModel + Clone + Send + Sync>(
    model: M,
    prior: DirichletConcentration,
    settings: GibbsSettings,
    num_cores: usize,
) -> Result<Trace> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_cores)
        .thread_name(|i| format!("ffbs-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let chains = pool.install(|| {
        (0..settings.num_chains as u64)
            .into_par_iter()
            .map(|chain_id| run_chain(model.clone(), prior.clone(), &settings, chain_id))
            .collect::<Result<Vec<_>>>()
    })?;

    Ok(chains.into_iter().into())
}
