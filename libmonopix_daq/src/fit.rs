use ndarray::Array1;
use serde::Serialize;

use super::error::FitError;

const MAX_ITERATIONS: usize = 800;
const SIMPLEX_TOLERANCE: f64 = 1e-7;

/// Parameters of the box-shaped offset model: a flat top of `width` around
/// `center`, edges smoothed by a Gaussian of `sigma`, scaled to `amplitude`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BoxFit {
    pub amplitude: f64,
    pub center: f64,
    pub width: f64,
    pub sigma: f64,
    /// False when the values come from the method-of-moments fallback
    pub converged: bool,
}

/// Histogram signed timestamp differences with one bin per clock tick.
/// Values outside `[min, max)` are clipped into the edge bins so they stay
/// accounted for.
pub fn histogram_diffs(diffs: &[i64], min: i64, max: i64) -> Array1<f64> {
    let n_bins = (max - min) as usize;
    let mut hist = Array1::<f64>::zeros(n_bins);
    for &d in diffs {
        let bin = (d - min).clamp(0, n_bins as i64 - 1) as usize;
        hist[bin] += 1.0;
    }
    hist
}

/// Method-of-moments seed: amplitude from the peak bin, center from the
/// weighted mean, width from the variance of an ideal box.
pub fn moments_estimate(hist: &Array1<f64>, min: i64) -> Result<BoxFit, FitError> {
    let total: f64 = hist.sum();
    if total <= 0.0 {
        return Err(FitError::EmptyHistogram);
    }
    let mut mean = 0.0;
    for (i, &h) in hist.iter().enumerate() {
        mean += (min + i as i64) as f64 * h;
    }
    mean /= total;
    let mut var = 0.0;
    for (i, &h) in hist.iter().enumerate() {
        let x = (min + i as i64) as f64 - mean;
        var += x * x * h;
    }
    var /= total;
    // var = w^2/12 for an ideal box
    let width = (12.0 * var).sqrt().max(1.0);
    let amplitude = hist.iter().cloned().fold(0.0, f64::max);
    Ok(BoxFit {
        amplitude,
        center: mean,
        width,
        sigma: 1.5,
        converged: false,
    })
}

/// Fit the smoothed-box model to a difference histogram.
///
/// Seeded by [moments_estimate], refined with a Nelder-Mead simplex on the
/// sum of squared residuals. Returns [FitError::NoConvergence] when the
/// simplex does not collapse within the iteration budget; the caller
/// decides whether to fall back to the moments estimate or abort.
pub fn fit_box(hist: &Array1<f64>, min: i64) -> Result<BoxFit, FitError> {
    let seed = moments_estimate(hist, min)?;
    let p0 = [seed.amplitude, seed.center, seed.width, seed.sigma];

    let cost = |p: &[f64; 4]| -> f64 {
        let mut sse = 0.0;
        for (i, &h) in hist.iter().enumerate() {
            let x = (min + i as i64) as f64;
            let r = h - box_model(x, p[0], p[1], p[2], p[3]);
            sse += r * r;
        }
        sse
    };

    match nelder_mead(p0, &cost) {
        Some(p) => Ok(BoxFit {
            amplitude: p[0],
            center: p[1],
            width: p[2].abs(),
            sigma: p[3].abs().max(f64::EPSILON),
            converged: true,
        }),
        None => Err(FitError::NoConvergence(MAX_ITERATIONS)),
    }
}

/// Acceptance window `[c - w/2 - k*w - m*sigma, c - w/2 + n*w + m*sigma]`
/// for the given `(k, n, m)` multipliers.
pub fn acceptance_window(fit: &BoxFit, multipliers: (f64, f64, f64)) -> (i64, i64) {
    let (k, n, m) = multipliers;
    let edge = fit.center - fit.width / 2.0;
    let lower = edge - k * fit.width - m * fit.sigma;
    let upper = edge + n * fit.width + m * fit.sigma;
    (lower.floor() as i64, upper.ceil() as i64)
}

/// Flat top of width `w` centered on `c`, edges smoothed with sigma `s`
fn box_model(x: f64, a: f64, c: f64, w: f64, s: f64) -> f64 {
    let s = s.abs().max(1e-9);
    let norm = std::f64::consts::SQRT_2 * s;
    0.5 * a * (erf((x - c + 0.5 * w.abs()) / norm) - erf((x - c - 0.5 * w.abs()) / norm))
}

/// Abramowitz & Stegun 7.1.26, good to ~1.5e-7 absolute
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.3275911 * x);
    let poly = t
        * (0.254829592
            + t * (-0.284496736 + t * (1.421413741 + t * (-1.453152027 + t * 1.061405429))));
    sign * (1.0 - poly * (-x * x).exp())
}

/// Minimal Nelder-Mead over four parameters. Returns the best vertex once
/// the simplex spread falls below tolerance, None when the iteration
/// budget runs out first.
fn nelder_mead(p0: [f64; 4], cost: &dyn Fn(&[f64; 4]) -> f64) -> Option<[f64; 4]> {
    const ALPHA: f64 = 1.0;
    const GAMMA: f64 = 2.0;
    const RHO: f64 = 0.5;
    const SIGMA: f64 = 0.5;

    // initial simplex: the seed plus one perturbed vertex per parameter
    let mut simplex: Vec<([f64; 4], f64)> = Vec::with_capacity(5);
    simplex.push((p0, cost(&p0)));
    for dim in 0..4 {
        let mut p = p0;
        let step = if p[dim].abs() > 1e-12 {
            0.1 * p[dim]
        } else {
            0.5
        };
        p[dim] += step;
        simplex.push((p, cost(&p)));
    }

    for _ in 0..MAX_ITERATIONS {
        simplex.sort_by(|a, b| a.1.total_cmp(&b.1));
        let best = simplex[0].1;
        let worst = simplex[4].1;
        if (worst - best).abs() <= SIMPLEX_TOLERANCE * (1.0 + best.abs()) {
            return Some(simplex[0].0);
        }

        // centroid of all but the worst vertex
        let mut centroid = [0.0; 4];
        for (p, _) in simplex.iter().take(4) {
            for dim in 0..4 {
                centroid[dim] += p[dim] / 4.0;
            }
        }

        let worst_p = simplex[4].0;
        let mut reflected = [0.0; 4];
        for dim in 0..4 {
            reflected[dim] = centroid[dim] + ALPHA * (centroid[dim] - worst_p[dim]);
        }
        let reflected_cost = cost(&reflected);

        if reflected_cost < simplex[0].1 {
            // try to expand further in the same direction
            let mut expanded = [0.0; 4];
            for dim in 0..4 {
                expanded[dim] = centroid[dim] + GAMMA * (centroid[dim] - worst_p[dim]);
            }
            let expanded_cost = cost(&expanded);
            simplex[4] = if expanded_cost < reflected_cost {
                (expanded, expanded_cost)
            } else {
                (reflected, reflected_cost)
            };
            continue;
        }
        if reflected_cost < simplex[3].1 {
            simplex[4] = (reflected, reflected_cost);
            continue;
        }

        // contract toward the centroid
        let mut contracted = [0.0; 4];
        for dim in 0..4 {
            contracted[dim] = centroid[dim] + RHO * (worst_p[dim] - centroid[dim]);
        }
        let contracted_cost = cost(&contracted);
        if contracted_cost < simplex[4].1 {
            simplex[4] = (contracted, contracted_cost);
            continue;
        }

        // shrink everything toward the best vertex
        let best_p = simplex[0].0;
        for vertex in simplex.iter_mut().skip(1) {
            for dim in 0..4 {
                vertex.0[dim] = best_p[dim] + SIGMA * (vertex.0[dim] - best_p[dim]);
            }
            vertex.1 = cost(&vertex.0);
        }
    }
    None
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_histogram_clips_outliers() {
        let hist = histogram_diffs(&[-100, 0, 1, 1, 99, 1000], -8, 8);
        assert_eq!(hist.len(), 16);
        assert_eq!(hist[0], 1.0); // clipped low
        assert_eq!(hist[15], 2.0); // clipped high
        assert_eq!(hist[8], 1.0);
        assert_eq!(hist[9], 2.0);
    }

    #[test]
    fn test_moments_on_ideal_box() {
        let mut diffs = Vec::new();
        for d in 40..60 {
            for _ in 0..50 {
                diffs.push(d);
            }
        }
        let hist = histogram_diffs(&diffs, 0, 128);
        let est = moments_estimate(&hist, 0).unwrap();
        assert!((est.center - 49.5).abs() < 1.0);
        assert!((est.width - 20.0).abs() < 3.0);
        assert!(!est.converged);
    }

    #[test]
    fn test_empty_histogram_is_an_error() {
        let hist = Array1::<f64>::zeros(16);
        assert!(matches!(
            moments_estimate(&hist, 0),
            Err(FitError::EmptyHistogram)
        ));
    }

    #[test]
    fn test_box_fit_recovers_parameters() {
        // synthetic smoothed box: center 20, width 24, sigma 2, amplitude 80
        let mut hist = Array1::<f64>::zeros(128);
        for i in 0..128 {
            hist[i] = box_model(i as f64 - 32.0, 80.0, 20.0, 24.0, 2.0);
        }
        let fit = fit_box(&hist, -32).unwrap();
        assert!(fit.converged);
        assert!((fit.center - 20.0).abs() < 1.0, "center = {}", fit.center);
        assert!((fit.width - 24.0).abs() < 2.0, "width = {}", fit.width);
        assert!((fit.amplitude - 80.0).abs() < 4.0);
    }

    #[test]
    fn test_acceptance_window_multipliers() {
        let fit = BoxFit {
            amplitude: 1.0,
            center: 100.0,
            width: 20.0,
            sigma: 2.0,
            converged: true,
        };
        let (lo, hi) = acceptance_window(&fit, (1.0, 1.0, 3.0));
        // edge at 90; k*w + m*sigma = 26 either side
        assert_eq!(lo, 64);
        assert_eq!(hi, 116);
    }

    #[test]
    fn test_erf_reference_values() {
        assert!(erf(0.0).abs() < 1e-7);
        assert!((erf(1.0) - 0.8427008).abs() < 1e-5);
        assert!((erf(-1.0) + 0.8427008).abs() < 1e-5);
        assert!((erf(3.0) - 0.9999779).abs() < 1e-5);
    }
}
