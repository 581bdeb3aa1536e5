//! Dispersion-mean trend fitting

use serde::Serialize;

use crate::error::{OdidError, Result};
use crate::stats::trimmed_mean;

/// Iterations of the residual-filtered parametric refit
const PARAMETRIC_ROUNDS: usize = 11;
const PARAMETRIC_TOL: f64 = 1e-6;
const GAMMA_IRLS_MAXIT: usize = 25;
const GAMMA_IRLS_TOL: f64 = 1e-8;

/// Fitted dispersion trend, shared read-only by every feature's MAP step
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DispersionTrend {
    /// `asympt_disp + extra_pois / mean`, both coefficients positive
    Parametric { asympt_disp: f64, extra_pois: f64 },
    /// A single dispersion for every mean
    Mean { dispersion: f64 },
}

impl DispersionTrend {
    /// Expected dispersion at a normalized mean count
    pub fn predict(&self, mean: f64) -> f64 {
        match *self {
            Self::Parametric { asympt_disp, extra_pois } => {
                if mean > 0.0 {
                    asympt_disp + extra_pois / mean
                } else {
                    asympt_disp
                }
            }
            Self::Mean { dispersion } => dispersion,
        }
    }
}

/// Fit the trend through raw dispersions.
///
/// The parametric form is tried first; if its coefficients go non-positive or
/// the refit does not settle, the trimmed mean of usable raw dispersions is
/// used instead. Having no usable raw dispersion at all is fatal.
pub fn fit_dispersion_trend(means: &[f64], raw: &[f64], min_disp: f64) -> Result<DispersionTrend> {
    let usable: Vec<(f64, f64)> = means
        .iter()
        .zip(raw)
        .filter(|(&m, &d)| m > 0.0 && d.is_finite() && d > 100.0 * min_disp)
        .map(|(&m, &d)| (m, d))
        .collect();

    if usable.is_empty() {
        return Err(OdidError::TrendFittingFailed {
            reason: format!(
                "all {} raw dispersions are at the lower bound; no trend can be fit",
                raw.len()
            ),
        });
    }

    match fit_parametric(&usable) {
        Ok((asympt_disp, extra_pois)) => {
            log::info!(
                "Dispersion trend: {:.4e} + {:.4e} / mean",
                asympt_disp,
                extra_pois
            );
            Ok(DispersionTrend::Parametric { asympt_disp, extra_pois })
        }
        Err(e) => {
            let disps: Vec<f64> = usable.iter().map(|&(_, d)| d).collect();
            let dispersion = trimmed_mean(&disps, 0.001);
            log::warn!("{}; using mean dispersion {:.4e}", e, dispersion);
            Ok(DispersionTrend::Mean { dispersion })
        }
    }
}

fn fit_parametric(data: &[(f64, f64)]) -> Result<(f64, f64)> {
    let mut coefs = (0.1_f64, 1.0_f64);

    for round in 0..PARAMETRIC_ROUNDS {
        let old = coefs;
        let kept: Vec<(f64, f64)> = data
            .iter()
            .filter(|&&(mean, disp)| {
                let fitted = coefs.0 + coefs.1 / mean;
                fitted > 0.0 && {
                    let ratio = disp / fitted;
                    ratio > 1e-4 && ratio < 15.0
                }
            })
            .copied()
            .collect();

        if kept.len() < 3 {
            return Err(OdidError::TrendFittingFailed {
                reason: format!("only {} points inside the residual window", kept.len()),
            });
        }

        let (next, glm_converged) = fit_gamma_identity(&kept, coefs);
        coefs = next;
        log::debug!(
            "Parametric round {}: {} points, a0={:.6}, a1={:.6}",
            round + 1,
            kept.len(),
            coefs.0,
            coefs.1
        );

        if coefs.0 <= 0.0 || coefs.1 <= 0.0 {
            return Err(OdidError::TrendFittingFailed {
                reason: format!(
                    "parametric coefficients not positive (a0={:.4e}, a1={:.4e})",
                    coefs.0, coefs.1
                ),
            });
        }

        let change = (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if change < PARAMETRIC_TOL && glm_converged {
            return Ok(coefs);
        }
    }

    Err(OdidError::TrendFittingFailed {
        reason: "parametric dispersion fit did not converge".to_string(),
    })
}

fn gamma_deviance(data: &[(f64, f64)], a0: f64, a1: f64) -> f64 {
    data.iter()
        .map(|&(mean, disp)| {
            let mu = (a0 + a1 / mean).max(1e-8);
            2.0 * (-(disp / mu).ln() + (disp - mu) / mu)
        })
        .sum()
}

/// Gamma GLM, identity link, `disp ~ 1 + I(1/mean)`
fn fit_gamma_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let (mut a0, mut a1) = start;
    let mut dev_old = gamma_deviance(data, a0, a1);

    for _ in 0..GAMMA_IRLS_MAXIT {
        let (mut sw, mut swx, mut swz, mut swxx, mut swxz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(mean, disp) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sw += w;
            swx += w * x;
            swz += w * disp;
            swxx += w * x * x;
            swxz += w * x * disp;
        }

        let det = sw * swxx - swx * swx;
        if det.abs() < 1e-10 {
            return ((a0, a1), false);
        }
        a0 = (swxx * swz - swx * swxz) / det;
        a1 = (sw * swxz - swx * swz) / det;

        let dev = gamma_deviance(data, a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < GAMMA_IRLS_TOL {
            return ((a0, a1), true);
        }
        dev_old = dev;
    }
    ((a0, a1), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parametric_recovers_exact_curve() {
        let means: Vec<f64> = (1..=60).map(|i| i as f64 * 7.5).collect();
        let disps: Vec<f64> = means.iter().map(|m| 0.05 + 2.0 / m).collect();
        let trend = fit_dispersion_trend(&means, &disps, 1e-8).unwrap();
        match trend {
            DispersionTrend::Parametric { asympt_disp, extra_pois } => {
                assert_relative_eq!(asympt_disp, 0.05, max_relative = 1e-4);
                assert_relative_eq!(extra_pois, 2.0, max_relative = 1e-4);
            }
            other => panic!("expected parametric trend, got {:?}", other),
        }
        assert_relative_eq!(trend.predict(100.0), 0.07, max_relative = 1e-4);
    }

    #[test]
    fn test_increasing_dispersions_fall_back_to_mean() {
        let means: Vec<f64> = (1..=40).map(|i| i as f64 * 10.0).collect();
        // dispersion grows with mean -> negative extra-Poisson term
        let disps: Vec<f64> = means.iter().map(|m| 0.001 * m).collect();
        let trend = fit_dispersion_trend(&means, &disps, 1e-8).unwrap();
        assert!(matches!(trend, DispersionTrend::Mean { .. }));
        assert_eq!(trend.predict(1.0), trend.predict(1e6));
    }

    #[test]
    fn test_all_boundary_dispersions_fatal() {
        let err = fit_dispersion_trend(&[10.0, 20.0], &[1e-8, 1e-8], 1e-8).unwrap_err();
        assert!(matches!(err, OdidError::TrendFittingFailed { .. }));
    }
}
