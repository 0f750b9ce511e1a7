//! Sampled-signal helpers for non-contact edge finding
//!
//! A capacitive probe swept across a calibration slot reads high over the deck
//! surface and low over the slot opening. The slot edges are located as the
//! strongest negative (entering the slot) and positive (leaving the slot)
//! peaks of the smoothed signal's finite difference.

use thiserror::Error;

/// Minimum derivative magnitude treated as a real edge
const EDGE_EPSILON: f64 = 1e-9;

/// Errors from sweep edge detection
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    /// Not enough samples to compute a derivative
    #[error("too few sweep samples: got {got}, need {need}")]
    TooFewSamples { got: usize, need: usize },

    /// Sample and position series have different lengths
    #[error("sample/position length mismatch: {samples} samples, {positions} positions")]
    LengthMismatch { samples: usize, positions: usize },

    /// The signal has no detectable transitions
    #[error("no edges found in sweep signal")]
    NoEdges,

    /// The falling edge does not precede the rising edge
    #[error("edges out of order: falling at {falling:.3}, rising at {rising:.3}")]
    EdgesOutOfOrder { falling: f64, rising: f64 },
}

/// Edge positions found in a sweep, in the sweep's position units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepEdges {
    /// Position where the signal drops (probe enters the slot)
    pub falling: f64,
    /// Position where the signal recovers (probe leaves the slot)
    pub rising: f64,
}

impl SweepEdges {
    /// Distance between the two edges
    pub fn width(&self) -> f64 {
        (self.rising - self.falling).abs()
    }

    /// Midpoint between the two edges
    pub fn center(&self) -> f64 {
        (self.rising + self.falling) / 2.0
    }
}

/// Smooth a series by convolving with a centered box kernel.
///
/// The output has the same length as the input; the kernel is truncated at the
/// boundaries so edge samples average over fewer neighbours.
pub fn moving_average(samples: &[f64], window: usize) -> Vec<f64> {
    if window <= 1 || samples.is_empty() {
        return samples.to_vec();
    }
    let half = window / 2;
    (0..samples.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half + 1).min(samples.len());
            let slice = &samples[lo..hi];
            slice.iter().sum::<f64>() / slice.len() as f64
        })
        .collect()
}

/// Forward finite difference: `out[i] = samples[i + 1] - samples[i]`
pub fn finite_difference(samples: &[f64]) -> Vec<f64> {
    samples.windows(2).map(|w| w[1] - w[0]).collect()
}

/// Locate the falling and rising edges of a sweep.
///
/// # Arguments
/// * `samples` - Probe readings
/// * `positions` - Axis position for each reading (monotonic)
/// * `window` - Box-filter width applied before differencing
pub fn find_sweep_edges(
    samples: &[f64],
    positions: &[f64],
    window: usize,
) -> Result<SweepEdges, SweepError> {
    if samples.len() != positions.len() {
        return Err(SweepError::LengthMismatch {
            samples: samples.len(),
            positions: positions.len(),
        });
    }
    if samples.len() < 3 {
        return Err(SweepError::TooFewSamples {
            got: samples.len(),
            need: 3,
        });
    }

    let smoothed = moving_average(samples, window);
    let diff = finite_difference(&smoothed);

    let (mut min_idx, mut max_idx) = (0, 0);
    for (i, d) in diff.iter().enumerate() {
        if *d < diff[min_idx] {
            min_idx = i;
        }
        if *d > diff[max_idx] {
            max_idx = i;
        }
    }

    if diff[min_idx] > -EDGE_EPSILON || diff[max_idx] < EDGE_EPSILON {
        return Err(SweepError::NoEdges);
    }

    let midpoint = |i: usize| (positions[i] + positions[i + 1]) / 2.0;
    let edge_at = |idx: usize| {
        let (lo, hi) = plateau(&diff, idx);
        (midpoint(lo) + midpoint(hi)) / 2.0
    };
    let edges = SweepEdges {
        falling: edge_at(min_idx),
        rising: edge_at(max_idx),
    };

    let ascending = positions[positions.len() - 1] >= positions[0];
    let ordered = if ascending {
        edges.falling < edges.rising
    } else {
        edges.falling > edges.rising
    };
    if !ordered {
        return Err(SweepError::EdgesOutOfOrder {
            falling: edges.falling,
            rising: edges.rising,
        });
    }

    Ok(edges)
}

/// Extent of the run of near-equal values around a derivative peak.
///
/// A box filter turns a step into a ramp, so the peak is a plateau as wide as
/// the kernel; the edge sits at the plateau's center.
fn plateau(diff: &[f64], idx: usize) -> (usize, usize) {
    let peak = diff[idx];
    let tol = peak.abs() * 1e-6;
    let mut lo = idx;
    while lo > 0 && (diff[lo - 1] - peak).abs() <= tol {
        lo -= 1;
    }
    let mut hi = idx;
    while hi + 1 < diff.len() && (diff[hi + 1] - peak).abs() <= tol {
        hi += 1;
    }
    (lo, hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Synthetic sweep over a slot spanning [lo, hi]
    fn slot_sweep(start: f64, end: f64, step: f64, lo: f64, hi: f64) -> (Vec<f64>, Vec<f64>) {
        let n = ((end - start) / step).round() as usize + 1;
        let positions: Vec<f64> = (0..n).map(|i| start + i as f64 * step).collect();
        let samples = positions
            .iter()
            .map(|p| if *p > lo && *p < hi { 1.0 } else { 10.0 })
            .collect();
        (samples, positions)
    }

    #[test]
    fn test_moving_average_flat() {
        let out = moving_average(&[2.0; 6], 3);
        assert_eq!(out, vec![2.0; 6]);
    }

    #[test]
    fn test_moving_average_window_one_is_identity() {
        let input = [1.0, 5.0, 2.0];
        assert_eq!(moving_average(&input, 1), input.to_vec());
    }

    #[test]
    fn test_finite_difference() {
        assert_eq!(finite_difference(&[1.0, 3.0, 2.0]), vec![2.0, -1.0]);
        assert!(finite_difference(&[1.0]).is_empty());
    }

    #[test]
    fn test_find_edges_of_slot() {
        let (samples, positions) = slot_sweep(0.0, 40.0, 0.1, 10.0, 30.0);
        let edges = find_sweep_edges(&samples, &positions, 5).unwrap();

        assert_relative_eq!(edges.falling, 10.0, epsilon = 0.2);
        assert_relative_eq!(edges.rising, 30.0, epsilon = 0.2);
        assert_relative_eq!(edges.width(), 20.0, epsilon = 0.3);
        assert_relative_eq!(edges.center(), 20.0, epsilon = 0.2);
    }

    #[test]
    fn test_flat_signal_has_no_edges() {
        let positions: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let samples = vec![4.0; 50];
        assert_eq!(
            find_sweep_edges(&samples, &positions, 3),
            Err(SweepError::NoEdges)
        );
    }

    #[test]
    fn test_length_mismatch() {
        let err = find_sweep_edges(&[1.0, 2.0, 3.0], &[0.0, 1.0], 1).unwrap_err();
        assert!(matches!(err, SweepError::LengthMismatch { .. }));
    }

    #[test]
    fn test_too_few_samples() {
        let err = find_sweep_edges(&[1.0, 2.0], &[0.0, 1.0], 1).unwrap_err();
        assert!(matches!(err, SweepError::TooFewSamples { got: 2, need: 3 }));
    }
}
