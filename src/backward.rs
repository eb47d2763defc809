//! Backward sampling of a state trajectory from the output of the forward
//! filter.
//!
//! Sampling `s_{T-1}` from the last filtered distribution and then each
//! `s_t` from `P(s_t | y_0..y_t, s_{t+1}) ∝ filtered[t] * T_{t+1}[., s_{t+1}]`
//! yields a draw from the joint posterior of the whole sequence.

use log::warn;
use rand::Rng;

use crate::{
    emission::LogLikelihoodTable,
    error::{HmmError, Result, Stage},
    forward::{forward_filter, FilteredDistribution, ForwardOutput},
    markov_chain::StateTrajectory,
    math::{normalize_log_probs, sample_categorical},
    transition::{InitialDistribution, TransitionMatrices},
};

/// Draw a state trajectory given the filtered distributions.
///
/// Consumes one uniform variate per time step, starting at the last step.
pub fn backward_sample<R: Rng + ?Sized>(
    filtered: &FilteredDistribution,
    transitions: &TransitionMatrices,
    rng: &mut R,
) -> Result<StateTrajectory> {
    let num_steps = filtered.num_steps();
    let num_states = filtered.num_states();
    if transitions.num_states() != num_states {
        return Err(HmmError::dimension(
            Stage::BackwardSampler,
            "number of states in transition matrices",
            num_states,
            transitions.num_states(),
        ));
    }
    if num_steps == 0 {
        return Err(HmmError::dimension(
            Stage::BackwardSampler,
            "number of time steps",
            1,
            0,
        ));
    }
    transitions.check_steps(num_steps, Stage::BackwardSampler)?;

    let mut states = vec![0usize; num_steps];
    let mut log_weights = vec![0f64; num_states];
    let mut probs = vec![0f64; num_states];

    let last = num_steps - 1;
    normalize_log_probs(filtered.log_step(last), &mut probs, Stage::BackwardSampler, last)?;
    states[last] = sample_categorical(&probs, rng);

    for t in (0..last).rev() {
        let next = states[t + 1];
        let log_trans = transitions.matrix_for_step(t + 1).log_col(next);
        log_weights
            .iter_mut()
            .zip(filtered.log_step(t).iter().zip(log_trans))
            .for_each(|(w, (alpha, trans))| *w = alpha + trans);
        normalize_log_probs(&log_weights, &mut probs, Stage::BackwardSampler, t).inspect_err(
            |_| warn!("Backward sampler: no state at step {} can reach state {}", t, next),
        )?;
        states[t] = sample_categorical(&probs, rng);
    }

    Ok(StateTrajectory::new(states))
}

/// Output of a full forward-filtering backward-sampling step.
#[derive(Debug, Clone)]
pub struct FfbsDraw {
    pub trajectory: StateTrajectory,
    pub forward: ForwardOutput,
}

/// Run the forward filter and draw one trajectory.
pub fn ffbs<R: Rng + ?Sized>(
    initial: &InitialDistribution,
    transitions: &TransitionMatrices,
    log_likelihoods: &LogLikelihoodTable,
    rng: &mut R,
) -> Result<FfbsDraw> {
    let forward = forward_filter(initial, transitions, log_likelihoods)?;
    let trajectory = backward_sample(&forward.filtered, transitions, rng)?;
    Ok(FfbsDraw {
        trajectory,
        forward,
    })
}
