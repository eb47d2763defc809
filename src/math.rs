use multiversion::multiversion;
use rand::Rng;

use crate::error::{HmmError, Result, Stage};

/// Compute `log(exp(a) + exp(b))`.
#[inline]
pub fn logaddexp(a: f64, b: f64) -> f64 {
    if a == b {
        return a + 2f64.ln();
    }
    let diff = a - b;
    if diff > 0. {
        a + (-diff).exp().ln_1p()
    } else if diff < 0. {
        b + diff.exp().ln_1p()
    } else {
        // diff is NAN
        diff
    }
}

/// Compute `log(sum(exp(values)))` without overflow.
///
/// Returns negative infinity for an empty slice or if all values are
/// negative infinity. NaN values propagate.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub fn logsumexp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.iter().any(|x| x.is_nan()) {
        return f64::NAN;
    }
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = values.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln()
}

/// Compute `log(sum(exp(a + b)))` for two slices of equal length.
#[multiversion(targets("x86_64+avx+avx2+fma", "arm+neon"))]
pub(crate) fn logsumexp_sum(a: &[f64], b: &[f64]) -> f64 {
    assert!(a.len() == b.len());
    let max = a
        .iter()
        .zip(b)
        .map(|(x, y)| x + y)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x + y - max).exp()).sum();
    max + sum.ln()
}

/// Normalize a vector of unnormalized log probabilities in place.
///
/// On success `log_probs` holds normalized log probabilities and the log
/// normalizing constant is returned. If all entries are negative infinity
/// (or any is NaN) the distribution is degenerate.
pub fn log_normalize(log_probs: &mut [f64], stage: Stage, step: usize) -> Result<f64> {
    let norm = logsumexp(log_probs);
    if !norm.is_finite() {
        return Err(HmmError::DegenerateDistribution { stage, step });
    }
    log_probs.iter_mut().for_each(|x| *x -= norm);
    Ok(norm)
}

/// Convert unnormalized log probabilities into a probability vector.
///
/// Subtracts the maximum before exponentiating, then divides by the sum.
pub fn normalize_log_probs(
    log_probs: &[f64],
    out: &mut [f64],
    stage: Stage,
    step: usize,
) -> Result<()> {
    if log_probs.len() != out.len() {
        return Err(HmmError::dimension(
            stage,
            "length of output buffer",
            log_probs.len(),
            out.len(),
        ));
    }
    let max = log_probs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() || log_probs.iter().any(|x| x.is_nan()) {
        return Err(HmmError::DegenerateDistribution { stage, step });
    }
    out.iter_mut()
        .zip(log_probs)
        .for_each(|(o, &x)| *o = (x - max).exp());
    let sum: f64 = out.iter().sum();
    out.iter_mut().for_each(|o| *o /= sum);
    Ok(())
}

/// Draw an index from a normalized categorical distribution.
///
/// Consumes exactly one uniform variate.
pub(crate) fn sample_categorical<R: Rng + ?Sized>(probs: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut cumulative = 0f64;
    let mut last_positive = 0;
    for (idx, &p) in probs.iter().enumerate() {
        if p <= 0. {
            continue;
        }
        cumulative += p;
        last_positive = idx;
        if u < cumulative {
            return idx;
        }
    }
    // Rounding can leave the cumulative sum slightly below one
    last_positive
}
