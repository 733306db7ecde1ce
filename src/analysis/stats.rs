//! Small numeric helpers shared by the selector and predictor.
//!
//! Percentile and smoothing semantics mirror the usual numpy conventions
//! (`percentile` with linear interpolation, `convolve(.., mode="same")`,
//! clamped `interp`) so derived features stay comparable with offline analyses.

use nalgebra::{DMatrix, DVector};

use crate::analysis::error::{Result, SignalError};

pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    data.iter().sum::<f64>() / data.len() as f64
}

/// Population variance.
pub fn variance(data: &[f64]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mean = mean(data);
    data.iter()
        .map(|v| {
            let delta = v - mean;
            delta * delta
        })
        .sum::<f64>()
        / data.len() as f64
}

/// Pearson correlation, `None` when either side has (near) zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> Option<f64> {
    if x.len() != y.len() || x.len() < 2 {
        return None;
    }
    let mx = mean(x);
    let my = mean(y);
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        let dx = a - mx;
        let dy = b - my;
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let denom = (sxx * syy).sqrt();
    if !denom.is_finite() || denom <= f64::EPSILON * (sxx + syy).max(f64::MIN_POSITIVE) {
        return None;
    }
    let r = sxy / denom;
    r.is_finite().then(|| r.clamp(-1.0, 1.0))
}

pub fn median(data: &[f64]) -> Option<f64> {
    percentile(data, 50.0)
}

/// Linear-interpolated percentile, `q` in [0, 100].
pub fn percentile(data: &[f64], q: f64) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    let pos = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Centred moving average with zero padding at the edges, same length as input.
pub fn smooth(data: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || data.is_empty() {
        return data.to_vec();
    }
    let n = data.len() as isize;
    let half = ((window - 1) / 2) as isize;
    let w = window as isize;
    (0..n)
        .map(|i| {
            // full-convolution index i + half covers x[i + half - w + 1 ..= i + half]
            let hi = (i + half).min(n - 1);
            let lo = (i + half - w + 1).max(0);
            let sum: f64 = (lo..=hi).map(|j| data[j as usize]).sum();
            sum / window as f64
        })
        .collect()
}

/// Piecewise-linear interpolation of `(xp, fp)` at `x`, clamped to the end values.
/// `xp` must be ascending.
pub fn interp(x: f64, xp: &[f64], fp: &[f64]) -> f64 {
    debug_assert_eq!(xp.len(), fp.len());
    match xp.len() {
        0 => f64::NAN,
        1 => fp[0],
        _ => {
            if x <= xp[0] {
                return fp[0];
            }
            let last = xp.len() - 1;
            if x >= xp[last] {
                return fp[last];
            }
            let idx = xp.partition_point(|&v| v <= x);
            let (x0, x1) = (xp[idx - 1], xp[idx]);
            let (y0, y1) = (fp[idx - 1], fp[idx]);
            if x1 == x0 {
                return y1;
            }
            y0 + (y1 - y0) * (x - x0) / (x1 - x0)
        }
    }
}

pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count)
                .map(|i| if i == count - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}

/// Least-squares polynomial in a centred/scaled variable to keep the
/// Vandermonde system well conditioned.
#[derive(Clone, Debug, PartialEq)]
pub struct Polynomial {
    /// Ascending powers of `(x - center) / scale`.
    pub coefficients: Vec<f64>,
    pub center: f64,
    pub scale: f64,
}

impl Polynomial {
    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    pub fn eval(&self, x: f64) -> f64 {
        let t = (x - self.center) / self.scale;
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * t + c)
    }
}

pub fn polyfit(x: &[f64], y: &[f64], degree: usize) -> Result<Polynomial> {
    if x.len() != y.len() {
        return Err(SignalError::length_mismatch("polyfit", x.len(), y.len()));
    }
    let cols = degree + 1;
    if x.len() < cols {
        return Err(SignalError::InsufficientSamples {
            context: "polynomial fit",
            required: cols,
            available: x.len(),
        });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(SignalError::NumericDegenerate {
            context: "polynomial fit",
        });
    }
    let (min, max) = x
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let center = 0.5 * (min + max);
    let half_span = 0.5 * (max - min);
    let scale = if half_span > f64::EPSILON { half_span } else { 1.0 };

    let a = DMatrix::from_fn(x.len(), cols, |i, j| ((x[i] - center) / scale).powi(j as i32));
    let b = DVector::from_column_slice(y);
    let svd = a.svd(true, true);
    let tol = f64::EPSILON * x.len() as f64 * svd.singular_values.max();
    if svd.rank(tol) < cols {
        return Err(SignalError::NumericDegenerate {
            context: "polynomial fit",
        });
    }
    let solution = svd.solve(&b, tol).map_err(|_| SignalError::NumericDegenerate {
        context: "polynomial fit",
    })?;
    let coefficients: Vec<f64> = solution.iter().copied().collect();
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(SignalError::NumericDegenerate {
            context: "polynomial fit",
        });
    }
    Ok(Polynomial {
        coefficients,
        center,
        scale,
    })
}

/// Number of distinct values, compared exactly.
pub fn distinct_count(data: &[f64]) -> usize {
    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();
    sorted.len()
}
