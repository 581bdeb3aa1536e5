//! Empirical-Bayes shrinkage of raw dispersions toward the trend

use ndarray::Array2;

use super::cox_reid::{CoxReidProblem, LogDispersionPrior};
use super::{DispersionFit, DispersionParams};
use crate::stats::{mad_squared, trigamma};

/// Smallest prior variance on `ln(alpha)` ever used
const MIN_PRIOR_VAR: f64 = 0.25;

/// Returns `(prior_var, var_log_disp_ests)`.
///
/// `var_log_disp_ests` is the squared MAD of `ln(raw) - ln(trend)` over
/// features away from the lower bound; the prior variance subtracts the
/// sampling variance of a log dispersion with `m - p` residual degrees of
/// freedom and is floored at 0.25.
pub fn estimate_prior_variance(
    raw: &[f64],
    trend: &[f64],
    n_samples: usize,
    n_coefs: usize,
    min_disp: f64,
) -> (f64, f64) {
    let residuals: Vec<f64> = raw
        .iter()
        .zip(trend)
        .filter(|(&r, &t)| r.is_finite() && t.is_finite() && r >= 100.0 * min_disp && t > 0.0)
        .map(|(&r, &t)| r.ln() - t.ln())
        .collect();

    if residuals.len() < 3 {
        return (MIN_PRIOR_VAR, MIN_PRIOR_VAR);
    }

    let var_log_disp_ests = mad_squared(&residuals);
    if n_samples <= n_coefs {
        return (MIN_PRIOR_VAR, var_log_disp_ests);
    }

    let df = (n_samples - n_coefs) as f64;
    let prior_var = (var_log_disp_ests - trigamma(df / 2.0)).max(MIN_PRIOR_VAR);
    log::debug!(
        "Dispersion prior: df={}, varLogDispEsts={:.4}, priorVar={:.4}",
        df,
        var_log_disp_ests,
        prior_var
    );
    (prior_var, var_log_disp_ests)
}

/// Posterior mode of the dispersion under a log-normal prior centered on `trend`
pub fn fit_map_dispersion(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    raw: f64,
    trend: f64,
    prior_var: f64,
    params: &DispersionParams,
) -> f64 {
    if !trend.is_finite() || trend <= 0.0 {
        return raw;
    }
    if !raw.is_finite() {
        return trend;
    }

    let max_disp = params.max_disp(counts.len());
    let problem = CoxReidProblem {
        counts,
        mu,
        design,
        prior: Some(LogDispersionPrior {
            mean: trend.ln(),
            variance: prior_var,
        }),
    };

    let start = if raw > 0.1 * trend { raw } else { trend };
    let outcome = problem.line_search(start.ln(), &params.line_search());
    let map = if outcome.converged {
        outcome.log_alpha.exp()
    } else {
        problem.grid_search(params.min_disp, max_disp)
    };
    map.clamp(params.min_disp, max_disp)
}

/// Combine raw, trend and MAP values into the final per-feature record.
///
/// Upper outliers (`ln raw - ln trend` above `outlier_sd` robust SDs) keep the
/// raw value. Everyone else gets the MAP value restricted to the interval
/// spanned by raw and trend.
pub fn finalize_dispersion(
    raw: f64,
    trend: f64,
    map: f64,
    var_log_disp_ests: f64,
    outlier_sd: f64,
) -> DispersionFit {
    let threshold = outlier_sd * var_log_disp_ests.sqrt();
    let outlier = raw.is_finite() && trend.is_finite() && raw > 0.0 && trend > 0.0 && raw.ln() - trend.ln() > threshold;

    let final_dispersion = if outlier {
        raw
    } else {
        map.clamp(raw.min(trend), raw.max(trend))
    };

    DispersionFit {
        raw,
        trend,
        final_dispersion,
        outlier,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_prior_variance_floor() {
        let raw = vec![0.1, 0.11, 0.09, 0.1, 0.105];
        let trend = vec![0.1; 5];
        let (prior, var) = estimate_prior_variance(&raw, &trend, 12, 6, 1e-8);
        assert_eq!(prior, 0.25);
        assert!(var < 0.01);
    }

    #[test]
    fn test_prior_variance_wide_spread() {
        let raw: Vec<f64> = (0..50).map(|i| 0.1 * (((i % 7) as f64) - 3.0).exp()).collect();
        let trend = vec![0.1; 50];
        let (prior, var) = estimate_prior_variance(&raw, &trend, 12, 6, 1e-8);
        assert!(var > 1.0);
        assert!((prior - (var - trigamma(3.0))).abs() < 1e-12);
    }

    #[test]
    fn test_finalize_outlier_keeps_raw() {
        let fit = finalize_dispersion(2.0, 0.1, 0.5, 0.25, 2.0);
        assert!(fit.outlier);
        assert_eq!(fit.final_dispersion, 2.0);
    }

    #[test]
    fn test_finalize_clamps_between_raw_and_trend() {
        let fit = finalize_dispersion(0.05, 0.1, 0.2, 1.0, 2.0);
        assert!(!fit.outlier);
        assert_eq!(fit.final_dispersion, 0.1);

        let fit = finalize_dispersion(0.05, 0.1, 0.07, 1.0, 2.0);
        assert_eq!(fit.final_dispersion, 0.07);
    }

    #[test]
    fn test_map_between_raw_and_trend() {
        let counts = vec![40.0, 95.0, 60.0, 150.0, 30.0, 80.0];
        let mean = counts.iter().sum::<f64>() / 6.0;
        let mu = vec![mean; 6];
        let design = Array2::ones((6, 1));
        let params = DispersionParams::default();

        let raw = 0.5;
        let trend = 0.05;
        let map = fit_map_dispersion(&counts, &design, &mu, raw, trend, 0.25, &params);
        assert!(map > trend && map < raw);
    }
}
