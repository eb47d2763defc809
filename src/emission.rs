//! Emission log-likelihoods and the observation models that produce them.
//!
//! The forward filter only ever sees a [`LogLikelihoodTable`]. Hosts with
//! their own observation model fill the table directly, the models in this
//! module cover the switching (mixture) processes commonly used with HMMs.

use std::f64::consts::PI;

use faer::Mat;
use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};

use crate::{
    error::{HmmError, Result, Stage},
    markov_chain::StateTrajectory,
};

/// `log P(obs_t | s_t = k)` for every time step `t` and state `k`.
#[derive(Debug, Clone)]
pub struct LogLikelihoodTable {
    // One column per time step
    values: Mat<f64>,
}

impl LogLikelihoodTable {
    /// Build the table from one row of per-state log-likelihoods per
    /// time step.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self> {
        let num_states = rows.first().map(|row| row.len()).unwrap_or(0);
        if let Some(row) = rows.iter().find(|row| row.len() != num_states) {
            return Err(HmmError::dimension(
                Stage::LogLikelihood,
                "number of states",
                num_states,
                row.len(),
            ));
        }
        Self::from_fn(rows.len(), num_states, |t, k| rows[t][k])
    }

    /// Build the table from a function of `(step, state)`.
    pub fn from_fn(
        num_steps: usize,
        num_states: usize,
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> Result<Self> {
        let values = Mat::from_fn(num_states, num_steps, |k, t| f(t, k));
        for t in 0..num_steps {
            if let Some(&bad) = values
                .col_as_slice(t)
                .iter()
                .find(|x| x.is_nan() || **x == f64::INFINITY)
            {
                return Err(HmmError::InvalidDistribution {
                    stage: Stage::LogLikelihood,
                    index: t,
                    reason: format!("log-likelihood {}", bad),
                });
            }
        }
        Ok(Self { values })
    }

    pub fn num_steps(&self) -> usize {
        self.values.ncols()
    }

    pub fn num_states(&self) -> usize {
        self.values.nrows()
    }

    /// The log-likelihood of every state at time step `t`.
    pub fn step(&self, t: usize) -> &[f64] {
        self.values.col_as_slice(t)
    }

    pub fn get(&self, t: usize, state: usize) -> f64 {
        self.values[(state, t)]
    }
}

/// An observation model with one emission distribution per hidden state.
pub trait ObservationModel {
    fn num_states(&self) -> usize;

    fn log_likelihood(&self, state: usize, observation: f64) -> f64;

    fn sample<R: Rng + ?Sized>(&self, state: usize, rng: &mut R) -> Result<f64>;

    fn log_likelihood_table(&self, observations: &[f64]) -> Result<LogLikelihoodTable> {
        LogLikelihoodTable::from_fn(observations.len(), self.num_states(), |t, k| {
            self.log_likelihood(k, observations[t])
        })
    }

    /// Draw one observation per time step given the hidden states.
    fn simulate<R: Rng + ?Sized>(
        &self,
        trajectory: &StateTrajectory,
        rng: &mut R,
    ) -> Result<Vec<f64>> {
        trajectory.check_states(self.num_states(), Stage::LogLikelihood)?;
        trajectory
            .states()
            .iter()
            .map(|&state| self.sample(state, &mut *rng))
            .collect()
    }
}

/// The emission distribution of a single state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Component {
    Poisson { rate: f64 },
    /// A point mass at `value`.
    Constant { value: f64 },
    Normal { mu: f64, sigma: f64 },
}

impl Component {
    fn check(&self, index: usize) -> Result<()> {
        let reason = match *self {
            Component::Poisson { rate } if !(rate >= 0. && rate.is_finite()) => {
                format!("Poisson rate {}", rate)
            }
            Component::Constant { value } if !value.is_finite() => {
                format!("constant {}", value)
            }
            Component::Normal { mu, sigma } if !(sigma > 0. && sigma.is_finite() && mu.is_finite()) => {
                format!("normal with mu {} and sigma {}", mu, sigma)
            }
            _ => return Ok(()),
        };
        Err(HmmError::InvalidDistribution {
            stage: Stage::LogLikelihood,
            index,
            reason,
        })
    }

    pub fn log_likelihood(&self, x: f64) -> f64 {
        match *self {
            Component::Poisson { rate } => {
                if x < 0. || x.fract() != 0. {
                    return f64::NEG_INFINITY;
                }
                if rate == 0. {
                    return if x == 0. { 0. } else { f64::NEG_INFINITY };
                }
                x * rate.ln() - rate - libm::lgamma(x + 1.)
            }
            Component::Constant { value } => {
                if x == value {
                    0.
                } else {
                    f64::NEG_INFINITY
                }
            }
            Component::Normal { mu, sigma } => {
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - 0.5 * (2. * PI).ln()
            }
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<f64> {
        self.sample_state(0, rng)
    }

    /// Draw an observation, reporting failures for `state`.
    fn sample_state<R: Rng + ?Sized>(&self, state: usize, rng: &mut R) -> Result<f64> {
        let invalid = |reason: String| HmmError::InvalidDistribution {
            stage: Stage::LogLikelihood,
            index: state,
            reason,
        };
        match *self {
            Component::Poisson { rate } if rate == 0. => Ok(0.),
            Component::Poisson { rate } => {
                let dist = Poisson::new(rate).map_err(|e| invalid(e.to_string()))?;
                let draw: f64 = dist.sample(rng);
                Ok(draw)
            }
            Component::Constant { value } => Ok(value),
            Component::Normal { mu, sigma } => {
                let dist = Normal::new(mu, sigma).map_err(|e| invalid(e.to_string()))?;
                Ok(dist.sample(rng))
            }
        }
    }
}

/// A process whose emission distribution switches with the hidden state:
/// state `k` emits from `components[k]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchingProcess {
    components: Vec<Component>,
}

impl SwitchingProcess {
    pub fn new(components: Vec<Component>) -> Result<Self> {
        if components.is_empty() {
            return Err(HmmError::dimension(
                Stage::LogLikelihood,
                "number of states",
                1,
                0,
            ));
        }
        for (k, component) in components.iter().enumerate() {
            component.check(k)?;
        }
        Ok(Self { components })
    }

    /// Zeros in state 0, Poisson counts in state 1.
    pub fn poisson_zero(rate: f64) -> Result<Self> {
        Self::new(vec![
            Component::Constant { value: 0. },
            Component::Poisson { rate },
        ])
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    fn component(&self, state: usize) -> Result<&Component> {
        self.components.get(state).ok_or_else(|| {
            HmmError::dimension(
                Stage::LogLikelihood,
                "number of states",
                self.components.len(),
                state + 1,
            )
        })
    }
}

impl ObservationModel for SwitchingProcess {
    fn num_states(&self) -> usize {
        self.components.len()
    }

    /// States without a component cannot emit anything.
    fn log_likelihood(&self, state: usize, observation: f64) -> f64 {
        self.components
            .get(state)
            .map_or(f64::NEG_INFINITY, |c| c.log_likelihood(observation))
    }

    fn sample<R: Rng + ?Sized>(&self, state: usize, rng: &mut R) -> Result<f64> {
        self.component(state)?.sample_state(state, rng)
    }
}
