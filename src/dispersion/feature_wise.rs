//! Per-feature raw dispersion: moment estimates for a start value, then the
//! Cox-Reid adjusted likelihood maximized with the fitted means held fixed.

use ndarray::{Array2, ArrayView1};

use super::cox_reid::{CoxReidProblem, LineSearchSettings};
use super::DispersionParams;
use crate::glm::{fit_single_feature, GlmFitParams, MIN_MU};
use crate::stats::solve_symmetric_system;

/// Raw estimate plus the fitted means it was computed at (reused by the MAP step)
#[derive(Debug, Clone)]
pub struct FeatureDispersion {
    pub dispersion: f64,
    pub mu: Vec<f64>,
}

/// True when every distinct design row is its own group, so group means can
/// be taken from ordinary least squares instead of an NB fit.
pub fn is_linear_mu(design: &Array2<f64>) -> bool {
    let mut unique_rows: Vec<Vec<i64>> = Vec::new();
    for row in design.rows() {
        let key: Vec<i64> = row.iter().map(|v| (v * 1000.0).round() as i64).collect();
        if !unique_rows.contains(&key) {
            unique_rows.push(key);
        }
    }
    unique_rows.len() == design.ncols()
}

/// Fitted values of an OLS regression of `y` on the design
fn least_squares_fit(y: &[f64], design: &Array2<f64>) -> Vec<f64> {
    let (n, p) = design.dim();
    let mut xtx = vec![0.0; p * p];
    let mut xty = vec![0.0; p];
    for i in 0..n {
        for j in 0..p {
            xty[j] += design[[i, j]] * y[i];
            for k in 0..p {
                xtx[j * p + k] += design[[i, j]] * design[[i, k]];
            }
        }
    }
    let beta = solve_symmetric_system(&xtx, &xty, p);
    (0..n)
        .map(|i| (0..p).map(|j| design[[i, j]] * beta[j]).sum())
        .collect()
}

/// `sum(((y - mu)^2 - mu) / mu^2) / (m - p)` on normalized counts
fn rough_disp_estimate(normalized: &[f64], design: &Array2<f64>) -> f64 {
    let (m, p) = design.dim();
    let mu = least_squares_fit(normalized, design);
    let sum: f64 = normalized
        .iter()
        .zip(&mu)
        .map(|(&y, &mu)| {
            let mu = mu.max(1.0);
            ((y - mu).powi(2) - mu) / (mu * mu)
        })
        .sum();
    (sum / (m - p) as f64).max(0.0)
}

/// `(var - xim * mean) / mean^2`, where `xim` is the mean inverse size factor
fn moments_disp_estimate(normalized: &[f64], xim: f64) -> f64 {
    let n = normalized.len() as f64;
    let mean = normalized.iter().sum::<f64>() / n;
    if mean <= 1e-10 {
        return f64::INFINITY;
    }
    let var = normalized.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (var - xim * mean) / (mean * mean)
}

/// Raw dispersion for one feature.
///
/// The start value is `min(rough, moments)` clamped to `[min_disp, max_disp]`.
/// If the line search cannot improve on it, the start value is kept; if it
/// runs out of iterations away from the lower bound, a grid search decides.
pub fn estimate_feature_dispersion(
    counts: ArrayView1<f64>,
    size_factors: ArrayView1<f64>,
    design: &Array2<f64>,
    xim: f64,
    use_linear_mu: bool,
    params: &DispersionParams,
) -> FeatureDispersion {
    let n_samples = counts.len();
    let max_disp = params.max_disp(n_samples);
    let counts_vec = counts.to_vec();

    let normalized: Vec<f64> = counts
        .iter()
        .zip(size_factors.iter())
        .map(|(&c, &s)| c / s)
        .collect();

    let alpha_init = rough_disp_estimate(&normalized, design)
        .min(moments_disp_estimate(&normalized, xim))
        .clamp(params.min_disp, max_disp);

    let mu: Vec<f64> = if use_linear_mu {
        least_squares_fit(&normalized, design)
            .iter()
            .zip(size_factors.iter())
            .map(|(m, s)| (m * s).max(MIN_MU))
            .collect()
    } else {
        let glm = GlmFitParams {
            maxit: params.maxit,
            beta_tol: params.disp_tol,
        };
        fit_single_feature(counts, design, size_factors, alpha_init, &glm).mu
    };

    let problem = CoxReidProblem {
        counts: &counts_vec,
        mu: &mu,
        design,
        prior: None,
    };
    let outcome = problem.line_search(alpha_init.ln(), &params.line_search());

    let no_increase = outcome.final_lp < outcome.initial_lp + outcome.initial_lp.abs() / 1e6;
    let mut dispersion = if no_increase {
        alpha_init
    } else {
        outcome.log_alpha.exp()
    };

    let line_search_ok = outcome.converged && outcome.iterations != 1;
    if !line_search_ok && dispersion > params.min_disp * 10.0 {
        dispersion = problem.grid_search(params.min_disp, max_disp);
    }

    FeatureDispersion {
        dispersion: dispersion.clamp(params.min_disp, max_disp),
        mu,
    }
}

impl DispersionParams {
    /// Upper bound on any dispersion: `max(10, n_samples)`
    pub fn max_disp(&self, n_samples: usize) -> f64 {
        (n_samples as f64).max(10.0)
    }

    pub(crate) fn line_search(&self) -> LineSearchSettings {
        LineSearchSettings {
            kappa_0: self.kappa_0,
            tol: self.disp_tol,
            maxit: self.maxit,
            min_log_alpha: (self.min_disp / 10.0).ln(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    fn group_design() -> Array2<f64> {
        array![
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 1.0],
            [1.0, 1.0],
            [1.0, 1.0],
            [1.0, 1.0]
        ]
    }

    #[test]
    fn test_is_linear_mu() {
        assert!(is_linear_mu(&group_design()));
        let batch_time = array![
            [1.0, 0.0, 0.0],
            [1.0, 1.0, 0.0],
            [1.0, 0.0, 1.0],
            [1.0, 1.0, 1.0]
        ];
        assert!(!is_linear_mu(&batch_time));
    }

    #[test]
    fn test_moments_estimate() {
        // mean 10, sample variance 10, xim 0.5 -> (10 - 5) / 100
        let y = [6.0, 8.0, 10.0, 12.0, 14.0];
        let est = moments_disp_estimate(&y, 0.5);
        assert!((est - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_noisier_feature_gets_larger_dispersion() {
        let sf = Array1::ones(8);
        let design = group_design();
        let params = DispersionParams::default();

        let quiet = array![100.0, 104.0, 97.0, 101.0, 200.0, 205.0, 196.0, 199.0];
        let noisy = array![40.0, 170.0, 90.0, 120.0, 90.0, 350.0, 160.0, 260.0];

        let q = estimate_feature_dispersion(quiet.view(), sf.view(), &design, 1.0, true, &params);
        let n = estimate_feature_dispersion(noisy.view(), sf.view(), &design, 1.0, true, &params);
        assert!(n.dispersion > q.dispersion);
        assert!(n.dispersion > 0.05 && n.dispersion < 1.0);
        assert!(q.dispersion >= params.min_disp);
        assert_eq!(n.mu.len(), 8);
    }

    #[test]
    fn test_nb_mu_path_matches_linear_path_for_group_design() {
        let sf = Array1::ones(8);
        let design = group_design();
        let params = DispersionParams::default();
        let y = array![40.0, 170.0, 90.0, 120.0, 90.0, 350.0, 160.0, 260.0];
        let a = estimate_feature_dispersion(y.view(), sf.view(), &design, 1.0, true, &params);
        let b = estimate_feature_dispersion(y.view(), sf.view(), &design, 1.0, false, &params);
        assert!((a.dispersion.ln() - b.dispersion.ln()).abs() < 0.05);
    }
}
