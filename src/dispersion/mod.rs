//! Dispersion estimation for negative binomial models
//!
//! Three phases with two barriers between them:
//! 1. raw per-feature estimates (parallel),
//! 2. trend fit and prior variance over all features (barrier),
//! 3. MAP shrinkage toward the trend (parallel).

mod cox_reid;
mod feature_wise;
mod map;
mod trend;

pub use feature_wise::{estimate_feature_dispersion, is_linear_mu, FeatureDispersion};
pub use map::{estimate_prior_variance, finalize_dispersion, fit_map_dispersion};
pub use trend::{fit_dispersion_trend, DispersionTrend};

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{OdidError, Result};

/// Configurable parameters for dispersion estimation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispersionParams {
    /// Lower bound on any dispersion
    pub min_disp: f64,
    /// Line-search convergence tolerance on the log posterior
    pub disp_tol: f64,
    /// Initial line-search step
    pub kappa_0: f64,
    /// Line-search iteration cap
    pub maxit: usize,
    /// Robust SDs above the trend beyond which a raw estimate is kept unshrunk
    pub outlier_sd: f64,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            disp_tol: 1e-6,
            kappa_0: 1.0,
            maxit: 100,
            outlier_sd: 2.0,
        }
    }
}

/// Dispersion record for one feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DispersionFit {
    pub raw: f64,
    pub trend: f64,
    pub final_dispersion: f64,
    /// Raw estimate far above the trend; `final_dispersion == raw`
    pub outlier: bool,
}

/// Output of [`estimate_dispersions`]: one record per feature plus the shared
/// summaries computed at the barrier
#[derive(Debug, Clone)]
pub struct DispersionEstimates {
    pub features: Vec<DispersionFit>,
    pub trend: DispersionTrend,
    pub prior_var: f64,
    pub var_log_disp_ests: f64,
}

impl DispersionEstimates {
    pub fn final_dispersions(&self) -> Vec<f64> {
        self.features.iter().map(|f| f.final_dispersion).collect()
    }

    pub fn n_outliers(&self) -> usize {
        self.features.iter().filter(|f| f.outlier).count()
    }
}

/// Raw, trend and final dispersions for every feature
pub fn estimate_dispersions(
    counts: ArrayView2<f64>,
    size_factors: &Array1<f64>,
    design: &Array2<f64>,
    base_means: &[f64],
    params: &DispersionParams,
) -> Result<DispersionEstimates> {
    let (n_features, n_samples) = counts.dim();
    let n_coefs = design.ncols();

    if n_samples <= n_coefs {
        return Err(OdidError::InvalidDesign {
            reason: format!(
                "{} samples for {} coefficients leaves no replicates for dispersion estimation",
                n_samples, n_coefs
            ),
        });
    }
    if base_means.len() != n_features {
        return Err(OdidError::DimensionMismatch {
            expected: format!("{} base means", n_features),
            got: format!("{} base means", base_means.len()),
        });
    }

    let xim = size_factors.iter().map(|s| 1.0 / s).sum::<f64>() / n_samples as f64;
    let use_linear_mu = is_linear_mu(design);

    log::info!("Estimating raw dispersions for {} features", n_features);
    let raw_fits: Vec<FeatureDispersion> = (0..n_features)
        .into_par_iter()
        .map(|i| {
            estimate_feature_dispersion(
                counts.row(i),
                size_factors.view(),
                design,
                xim,
                use_linear_mu,
                params,
            )
        })
        .collect();
    let raw: Vec<f64> = raw_fits.iter().map(|f| f.dispersion).collect();

    let trend = fit_dispersion_trend(base_means, &raw, params.min_disp)?;
    let trended: Vec<f64> = base_means.iter().map(|&m| trend.predict(m)).collect();
    let (prior_var, var_log_disp_ests) =
        estimate_prior_variance(&raw, &trended, n_samples, n_coefs, params.min_disp);

    log::info!("Shrinking dispersions toward the trend (prior variance {:.4})", prior_var);
    let features: Vec<DispersionFit> = (0..n_features)
        .into_par_iter()
        .map(|i| {
            let y = counts.row(i).to_vec();
            let map = fit_map_dispersion(
                &y,
                design,
                &raw_fits[i].mu,
                raw[i],
                trended[i],
                prior_var,
                params,
            );
            finalize_dispersion(raw[i], trended[i], map, var_log_disp_ests, params.outlier_sd)
        })
        .collect();

    let estimates = DispersionEstimates {
        features,
        trend,
        prior_var,
        var_log_disp_ests,
    };
    let n_outliers = estimates.n_outliers();
    if n_outliers > 0 {
        log::warn!(
            "{} features flagged as dispersion outliers; keeping their raw dispersion",
            n_outliers
        );
    }
    Ok(estimates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn synthetic_counts(n_features: usize, n_samples: usize) -> Array2<f64> {
        // Deterministic overdispersed counts from a small LCG
        let mut state: u64 = 12345;
        let mut next = || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f64) / (1u64 << 31) as f64
        };
        Array2::from_shape_fn((n_features, n_samples), |(i, _)| {
            let base = 5.0 + 10.0 * i as f64;
            (base * (0.5 + next())).round()
        })
    }

    fn two_group_design(n_samples: usize) -> Array2<f64> {
        Array2::from_shape_fn((n_samples, 2), |(j, c)| {
            if c == 0 || j >= n_samples / 2 {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn test_final_between_raw_and_trend_unless_outlier() {
        let counts = synthetic_counts(40, 6);
        let sf = Array1::ones(6);
        let design = two_group_design(6);
        let means = crate::normalization::base_means(counts.view(), &sf);

        let est = estimate_dispersions(counts.view(), &sf, &design, &means, &DispersionParams::default())
            .unwrap();
        assert_eq!(est.features.len(), 40);
        assert!(est.prior_var >= 0.25);

        for fit in &est.features {
            assert!(fit.final_dispersion > 0.0);
            if fit.outlier {
                assert_eq!(fit.final_dispersion, fit.raw);
            } else {
                let lo = fit.raw.min(fit.trend);
                let hi = fit.raw.max(fit.trend);
                assert!(fit.final_dispersion >= lo - 1e-12 && fit.final_dispersion <= hi + 1e-12);
            }
        }
    }

    #[test]
    fn test_no_residual_degrees_of_freedom() {
        let counts = array![[10.0, 20.0], [5.0, 6.0]];
        let sf = Array1::ones(2);
        let design = two_group_design(2);
        let means = vec![15.0, 5.5];
        let err = estimate_dispersions(counts.view(), &sf, &design, &means, &DispersionParams::default());
        assert!(matches!(err, Err(OdidError::InvalidDesign { .. })));
    }

    #[test]
    fn test_base_mean_length_checked() {
        let counts = synthetic_counts(3, 4);
        let sf = Array1::ones(4);
        let design = two_group_design(4);
        let err = estimate_dispersions(counts.view(), &sf, &design, &[1.0], &DispersionParams::default());
        assert!(matches!(err, Err(OdidError::DimensionMismatch { .. })));
    }
}
