//! Approximate posterior estimation with a heavy-tailed prior
//!
//! The contrast coefficient gets a zero-centered Cauchy prior whose scale is
//! fit across features by method of moments; all other coefficients get a
//! wide normal prior. Each feature's posterior mode is found with L-BFGS and
//! its SD comes from the inverse Hessian at the mode (Laplace approximation).

use std::f64::consts::LN_2;

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::lbfgs::{lbfgs_minimize, LbfgsSettings};
use crate::data::TimePoint;
use crate::error::{OdidError, Result};
use crate::glm::MIN_MU;
use crate::model::ModelFit;
use crate::stats::invert_positive_definite;

/// Parameters for posterior-mode shrinkage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApeglmParams {
    /// Multiplier on the fitted prior scale
    pub multiplier: f64,
    /// Upper cap on the Cauchy scale
    pub max_prior_scale: f64,
    /// SD of the normal prior on unshrunk coefficients
    pub no_shrink_scale: f64,
    pub lbfgs_max_iter: usize,
    pub lbfgs_epsilon: f64,
    pub lbfgs_memory: usize,
    /// Step for the finite-difference Hessian
    pub hessian_step: f64,
    /// Largest coefficient disagreement between the two starts still counted as converged
    pub convergence_threshold: f64,
}

impl Default for ApeglmParams {
    fn default() -> Self {
        Self {
            multiplier: 1.0,
            max_prior_scale: 1.0,
            no_shrink_scale: 15.0,
            lbfgs_max_iter: 300,
            lbfgs_epsilon: 1e-8,
            lbfgs_memory: 6,
            hessian_step: 1e-3,
            convergence_threshold: 0.01,
        }
    }
}

impl ApeglmParams {
    /// Prior scales and step sizes must be positive and finite
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("multiplier", self.multiplier),
            ("max_prior_scale", self.max_prior_scale),
            ("no_shrink_scale", self.no_shrink_scale),
            ("lbfgs_epsilon", self.lbfgs_epsilon),
            ("hessian_step", self.hessian_step),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(OdidError::InvalidInput {
                    reason: format!("shrinkage.{} must be positive, got {}", name, value),
                });
            }
        }
        if self.lbfgs_max_iter == 0 || self.lbfgs_memory == 0 {
            return Err(OdidError::InvalidInput {
                reason: "shrinkage.lbfgs_max_iter and shrinkage.lbfgs_memory must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    fn lbfgs(&self) -> LbfgsSettings {
        LbfgsSettings {
            max_iter: self.lbfgs_max_iter,
            epsilon: self.lbfgs_epsilon,
            memory: self.lbfgs_memory,
        }
    }
}

/// Fitted Cauchy prior for one contrast, shared read-only by every feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ApeglmPrior {
    /// Method-of-moments variance of true effects (natural-log scale)
    pub prior_var: f64,
    /// Cauchy scale actually used
    pub scale: f64,
}

/// Shrunken effect for one feature under one contrast, on the log2 scale
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ShrunkenEffect {
    pub shrunk_log2_fold_change: Option<f64>,
    pub posterior_sd: Option<f64>,
    pub converged: bool,
}

/// Shrinkage output for one timepoint
#[derive(Debug, Clone, Serialize)]
pub struct ShrinkageResult {
    pub timepoint: TimePoint,
    pub prior: ApeglmPrior,
    pub effects: Vec<ShrunkenEffect>,
}

impl ShrinkageResult {
    pub fn n_unconverged(&self) -> usize {
        self.effects.iter().filter(|e| !e.converged).count()
    }
}

const MIN_PRIOR_VAR: f64 = 1e-6;
const MAX_PRIOR_VAR: f64 = 400.0;

/// Solve `A = Σ w_i (β_i² - s_i²) / Σ w_i` with `w_i = 1 / (s_i² + A)` by bisection.
///
/// Non-finite pairs are ignored. Returns the lower bound when the data show no
/// excess variance.
pub fn estimate_prior_var(mle: &[f64], se: &[f64]) -> f64 {
    let valid: Vec<(f64, f64)> = mle
        .iter()
        .zip(se)
        .filter(|(b, s)| b.is_finite() && s.is_finite())
        .map(|(&b, &s)| (b * b, s * s))
        .collect();

    if valid.is_empty() {
        return MIN_PRIOR_VAR;
    }

    let objective = |a: f64| -> f64 {
        let (num, den) = valid.iter().fold((0.0, 0.0), |(num, den), &(b2, d)| {
            let w = 1.0 / (a + d);
            (num + (b2 - d) * w, den + w)
        });
        let a_hat = if den == 0.0 { 0.0 } else { num / den };
        a_hat - a
    };

    if objective(MIN_PRIOR_VAR) < 0.0 {
        return MIN_PRIOR_VAR;
    }

    let mut lo = MIN_PRIOR_VAR;
    let mut hi = MAX_PRIOR_VAR;
    let f_lo = objective(lo);
    let f_hi = objective(hi);
    if f_lo * f_hi > 0.0 {
        return if f_lo.abs() < f_hi.abs() { lo } else { hi };
    }

    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        let f_mid = objective(mid);
        if f_mid.abs() < 1e-12 || hi - lo < 1e-12 {
            return mid;
        }
        if f_mid * f_lo < 0.0 {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Data for one feature's posterior
struct FeaturePosterior<'a> {
    y: ArrayView1<'a, f64>,
    design: &'a Array2<f64>,
    log_offsets: &'a [f64],
    /// NB size, `1 / dispersion`
    size: f64,
    shrink_coef: usize,
    cauchy_scale_sq: f64,
    normal_scale_sq: f64,
}

impl FeaturePosterior<'_> {
    fn linear_predictor(&self, beta: &[f64], j: usize) -> f64 {
        let xb: f64 = beta.iter().enumerate().map(|(k, b)| self.design[[j, k]] * b).sum();
        xb + self.log_offsets[j]
    }

    /// Negative log posterior up to a constant; writes the gradient.
    ///
    /// Above the `MIN_MU` mean floor the data term is the NB likelihood. Below
    /// it the term continues quadratically with the IRLS working weight at the
    /// floor, so its stationary point is the refit's coefficient vector.
    fn value_and_grad(&self, beta: &[f64], grad: &mut [f64]) -> f64 {
        grad.iter_mut().for_each(|g| *g = 0.0);
        let mut value = 0.0;
        let floor_eta = MIN_MU.ln();

        for (j, &y) in self.y.iter().enumerate() {
            let eta = self.linear_predictor(beta, j);
            let a = y + self.size;
            let c = if eta >= floor_eta {
                let mu = eta.exp();
                let b = mu + self.size;
                value -= y * eta - a * b.ln();
                y - a * mu / b
            } else {
                let b = MIN_MU + self.size;
                let c_floor = y - a * MIN_MU / b;
                let w_floor = MIN_MU * self.size / b;
                let d = eta - floor_eta;
                value -= y * floor_eta - a * b.ln();
                value += 0.5 * w_floor * d * d - c_floor * d;
                c_floor - w_floor * d
            };
            for (k, g) in grad.iter_mut().enumerate() {
                *g -= self.design[[j, k]] * c;
            }
        }

        for (k, &b) in beta.iter().enumerate() {
            if k == self.shrink_coef {
                value += (1.0 + b * b / self.cauchy_scale_sq).ln();
                grad[k] += 2.0 * b / (self.cauchy_scale_sq + b * b);
            } else {
                value += b * b / (2.0 * self.normal_scale_sq);
                grad[k] += b / self.normal_scale_sq;
            }
        }
        value
    }

    /// Central differences of the analytic gradient
    fn hessian(&self, beta: &[f64], step: f64) -> Vec<f64> {
        let n = beta.len();
        let mut hess = vec![0.0; n * n];
        let mut x = beta.to_vec();
        let mut g_plus = vec![0.0; n];
        let mut g_minus = vec![0.0; n];

        for i in 0..n {
            let saved = x[i];
            x[i] = saved + step;
            self.value_and_grad(&x, &mut g_plus);
            x[i] = saved - step;
            self.value_and_grad(&x, &mut g_minus);
            x[i] = saved;
            for j in 0..n {
                hess[i * n + j] = (g_plus[j] - g_minus[j]) / (2.0 * step);
            }
        }

        // symmetrize
        for i in 0..n {
            for j in (i + 1)..n {
                let avg = 0.5 * (hess[i * n + j] + hess[j * n + i]);
                hess[i * n + j] = avg;
                hess[j * n + i] = avg;
            }
        }
        hess
    }
}

fn shrink_feature(posterior: &FeaturePosterior, mle: &[f64], params: &ApeglmParams) -> ShrunkenEffect {
    let n = mle.len();
    let settings = params.lbfgs();
    let f = |x: &[f64], g: &mut [f64]| posterior.value_and_grad(x, g);

    let mut from_mle: Vec<f64> = mle
        .iter()
        .map(|b| if b.is_finite() { b.clamp(-30.0, 30.0) } else { 0.0 })
        .collect();
    let run_mle = lbfgs_minimize(f, &mut from_mle, &settings);

    let mut from_alt: Vec<f64> = (0..n).map(|k| if k % 2 == 0 { 0.1 } else { -0.1 }).collect();
    let run_alt = lbfgs_minimize(f, &mut from_alt, &settings);

    let max_delta = from_mle
        .iter()
        .zip(&from_alt)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0_f64, f64::max);
    let converged = run_mle.converged && max_delta <= params.convergence_threshold;

    let mode = if run_mle.converged || run_mle.value <= run_alt.value || run_alt.value.is_nan() {
        from_mle
    } else {
        from_alt
    };
    if !converged {
        log::debug!(
            "posterior mode unstable: {} vs {} iterations, max delta {:.4}",
            run_mle.iterations,
            run_alt.iterations,
            max_delta
        );
    }

    let k = posterior.shrink_coef;
    let hess = posterior.hessian(&mode, params.hessian_step);
    let sd = invert_positive_definite(&hess, n).map(|inv| inv[k * n + k].sqrt() / LN_2);

    ShrunkenEffect {
        shrunk_log2_fold_change: mode[k].is_finite().then(|| mode[k] / LN_2),
        posterior_sd: sd,
        converged,
    }
}

/// Posterior modes and SDs of the `timepoint` contrast for every feature.
///
/// The prior fit is a barrier over all features' MLEs; the per-feature
/// optimizations then run in parallel.
pub fn shrink_timepoint(model: &ModelFit, timepoint: TimePoint, params: &ApeglmParams) -> Result<ShrinkageResult> {
    params.validate()?;
    let k = model.design_info.timepoint_coef(timepoint)?;
    let n_features = model.n_features();
    if model.counts.nrows() != n_features {
        return Err(OdidError::DimensionMismatch {
            expected: format!("{} count rows", n_features),
            got: format!("{} count rows", model.counts.nrows()),
        });
    }

    let mle: Vec<f64> = (0..n_features).map(|i| model.glm.coefficients[[i, k]]).collect();
    let se: Vec<f64> = (0..n_features)
        .map(|i| model.glm.covariances[[i, k, k]].sqrt())
        .collect();
    let prior_var = estimate_prior_var(&mle, &se);
    let prior = ApeglmPrior {
        prior_var,
        scale: (params.multiplier * prior_var.sqrt()).min(params.max_prior_scale),
    };
    log::info!(
        "Shrinking timepoint {}: prior variance {:.4}, Cauchy scale {:.4}",
        timepoint,
        prior.prior_var,
        prior.scale
    );

    let log_offsets: Vec<f64> = model.size_factors.iter().map(|s| s.ln()).collect();
    let dispersions = model.dispersions.final_dispersions();

    let effects: Vec<ShrunkenEffect> = (0..n_features)
        .into_par_iter()
        .map(|i| {
            let y = model.counts.row(i);
            if y.sum() == 0.0 {
                return ShrunkenEffect {
                    shrunk_log2_fold_change: None,
                    posterior_sd: None,
                    converged: false,
                };
            }
            let posterior = FeaturePosterior {
                y,
                design: &model.design,
                log_offsets: &log_offsets,
                size: 1.0 / dispersions[i],
                shrink_coef: k,
                cauchy_scale_sq: prior.scale * prior.scale,
                normal_scale_sq: params.no_shrink_scale * params.no_shrink_scale,
            };
            let beta: Vec<f64> = model.glm.coefficients.row(i).to_vec();
            shrink_feature(&posterior, &beta, params)
        })
        .collect();

    let result = ShrinkageResult {
        timepoint,
        prior,
        effects,
    };
    let n_bad = result.n_unconverged();
    if n_bad > 0 {
        log::warn!(
            "{} features had an unstable posterior mode at timepoint {}",
            n_bad,
            timepoint
        );
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_prior_var_basic() {
        let lfc = vec![1.0, -1.0, 0.5, -0.5, 2.0, -2.0, 0.3, -0.3, 1.5, -1.5];
        let se = vec![0.5; 10];
        let pv = estimate_prior_var(&lfc, &se);
        assert!(pv > 0.0 && pv < MAX_PRIOR_VAR);
    }

    #[test]
    fn test_prior_var_small_se() {
        let lfc = vec![3.0, -3.0, 2.0, -2.0, 4.0, -4.0, 1.0, -1.0, 5.0, -5.0];
        let se = vec![0.1; 10];
        assert!(estimate_prior_var(&lfc, &se) > 0.5);
    }

    #[test]
    fn test_prior_var_solves_weighted_fixed_point() {
        let lfc = [2.0, -1.5, 0.8, -3.0, 1.2, -0.4];
        let se = [0.3, 0.6, 0.2, 1.0, 0.4, 0.5];
        let a = estimate_prior_var(&lfc, &se);
        let (num, den) = lfc.iter().zip(&se).fold((0.0, 0.0), |(num, den), (b, s)| {
            let w = 1.0 / (s * s + a);
            (num + w * (b * b - s * s), den + w)
        });
        assert_relative_eq!(num / den, a, epsilon = 1e-8);
    }

    #[test]
    fn test_prior_var_no_excess_variance() {
        let lfc = vec![0.1, -0.1, 0.2, -0.2, 0.05, -0.05, 0.15, -0.15, 0.08, -0.08];
        let se = vec![2.0; 10];
        assert_eq!(estimate_prior_var(&lfc, &se), MIN_PRIOR_VAR);
    }

    #[test]
    fn test_prior_var_ignores_non_finite() {
        let with_nan = estimate_prior_var(&[2.0, -2.0, f64::NAN], &[0.1, 0.1, 0.1]);
        let without = estimate_prior_var(&[2.0, -2.0], &[0.1, 0.1]);
        assert_relative_eq!(with_nan, without, epsilon = 1e-12);
    }

    #[test]
    fn test_shrinkage_pulls_toward_zero() {
        let design = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let y = array![100.0, 110.0, 90.0, 25.0, 28.0, 22.0];
        let offsets = vec![0.0; 6];
        let mle = vec![100.0_f64.ln(), (25.0_f64 / 100.0).ln()];

        let posterior = |scale: f64| FeaturePosterior {
            y: y.view(),
            design: &design,
            log_offsets: &offsets,
            size: 1.0 / 0.05,
            shrink_coef: 1,
            cauchy_scale_sq: scale * scale,
            normal_scale_sq: 225.0,
        };
        let params = ApeglmParams::default();

        let wide = shrink_feature(&posterior(1.0), &mle, &params);
        let narrow = shrink_feature(&posterior(0.05), &mle, &params);

        let wide_lfc = wide.shrunk_log2_fold_change.unwrap();
        let narrow_lfc = narrow.shrunk_log2_fold_change.unwrap();
        assert!(wide_lfc < 0.0);
        assert!(wide_lfc.abs() <= 2.0 + 1e-6);
        assert!(narrow_lfc.abs() < wide_lfc.abs());
        assert!(wide.posterior_sd.unwrap() > 0.0);
    }

    #[test]
    fn test_depleted_group_stays_within_refit() {
        use crate::glm::{fit_single_feature, GlmFitParams};

        let design = array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let y = array![40.0, 35.0, 45.0, 0.0, 0.0, 0.0];
        let sf = array![1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let offsets = vec![0.0; 6];
        let dispersion = 0.05;

        let refit = fit_single_feature(y.view(), &design, sf.view(), dispersion, &GlmFitParams::default());
        let mle = refit.coefficients.clone();
        assert!(mle[1] < -4.0);

        let posterior = |scale: f64, normal: f64| FeaturePosterior {
            y: y.view(),
            design: &design,
            log_offsets: &offsets,
            size: 1.0 / dispersion,
            shrink_coef: 1,
            cauchy_scale_sq: scale * scale,
            normal_scale_sq: normal * normal,
        };
        let params = ApeglmParams::default();

        // a flat prior recovers the refit
        let flat = shrink_feature(&posterior(1e4, 1e4), &mle, &params);
        assert_relative_eq!(flat.shrunk_log2_fold_change.unwrap(), mle[1] / LN_2, epsilon = 1e-3);

        let shrunk = shrink_feature(&posterior(1.0, 15.0), &mle, &params);
        let lfc = shrunk.shrunk_log2_fold_change.unwrap();
        assert!(lfc < 0.0);
        assert!(lfc.abs() <= (mle[1] / LN_2).abs() + 1e-6);
        assert!(shrunk.posterior_sd.unwrap() > 0.0);
    }
}
