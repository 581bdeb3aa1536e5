//! Cox-Reid adjusted NB profile likelihood in log-dispersion, with an optional
//! normal prior, and the Armijo line search / grid search that maximize it.
//!
//! Feature-wise estimation calls these without a prior; MAP estimation passes
//! a prior centered on the trend.

use ndarray::Array2;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::stats::{invert_symmetric_matrix, log_det_symmetric};

/// Hard floor on proposed `ln(alpha)`
const MIN_LOG_ALPHA_HARD: f64 = -30.0;
/// Hard ceiling on proposed `ln(alpha)`
const MAX_LOG_ALPHA_HARD: f64 = 10.0;
/// Sufficient-increase constant of the Armijo rule
const ARMIJO_EPSILON: f64 = 1e-4;
const GRID_POINTS: usize = 20;

/// Normal prior on `ln(alpha)`
#[derive(Debug, Clone, Copy)]
pub struct LogDispersionPrior {
    pub mean: f64,
    pub variance: f64,
}

/// Data for one feature at fixed fitted means
pub struct CoxReidProblem<'a> {
    pub counts: &'a [f64],
    pub mu: &'a [f64],
    pub design: &'a Array2<f64>,
    pub prior: Option<LogDispersionPrior>,
}

/// Result of the Armijo line search
#[derive(Debug, Clone, Copy)]
pub struct LineSearchOutcome {
    pub log_alpha: f64,
    pub initial_lp: f64,
    pub final_lp: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Tuning of the line search, taken from `DispersionParams`
#[derive(Debug, Clone, Copy)]
pub struct LineSearchSettings {
    pub kappa_0: f64,
    pub tol: f64,
    pub maxit: usize,
    /// Stop once `ln(alpha)` falls below this
    pub min_log_alpha: f64,
}

fn cr_weights(mu: &[f64], alpha: f64) -> Vec<f64> {
    mu.iter().map(|&m| 1.0 / (1.0 / m.max(1e-10) + alpha)).collect()
}

fn weighted_gram(design: &Array2<f64>, w: &[f64]) -> Vec<f64> {
    let p = design.ncols();
    let mut b = vec![0.0; p * p];
    for (i, &wi) in w.iter().enumerate() {
        for j in 0..p {
            for k in 0..p {
                b[j * p + k] += wi * design[[i, j]] * design[[i, k]];
            }
        }
    }
    b
}

impl<'a> CoxReidProblem<'a> {
    /// Adjusted log likelihood (plus log prior) at `ln(alpha)`
    pub fn log_posterior(&self, log_alpha: f64) -> f64 {
        let alpha = log_alpha.exp();
        let size = 1.0 / alpha;

        let ll: f64 = self
            .counts
            .iter()
            .zip(self.mu)
            .map(|(&y, &m)| {
                let m = m.max(1e-10);
                ln_gamma(y + size) - ln_gamma(size) - y * (m + size).ln() - size * (1.0 + m * alpha).ln()
            })
            .sum();

        let p = self.design.ncols();
        let log_det = log_det_symmetric(&weighted_gram(self.design, &cr_weights(self.mu, alpha)), p);
        let cr = if log_det.is_finite() { -0.5 * log_det } else { 0.0 };

        let prior = self
            .prior
            .map_or(0.0, |pr| -0.5 * (log_alpha - pr.mean).powi(2) / pr.variance);

        ll + cr + prior
    }

    /// Derivative of `log_posterior` with respect to `ln(alpha)`
    pub fn d_log_posterior(&self, log_alpha: f64) -> f64 {
        let alpha = log_alpha.exp();
        let size = 1.0 / alpha;

        let ll_sum: f64 = self
            .counts
            .iter()
            .zip(self.mu)
            .map(|(&y, &m)| {
                let m = m.max(1e-10);
                digamma(size) + (1.0 + m * alpha).ln() - m * alpha / (1.0 + m * alpha) - digamma(y + size)
                    + y / (m + size)
            })
            .sum();
        let ll_part = ll_sum * size * size;

        // d/dalpha of -0.5 ln|X'WX| = -0.5 tr(B^-1 dB), dw/dalpha = -w^2
        let p = self.design.ncols();
        let w = cr_weights(self.mu, alpha);
        let dw: Vec<f64> = w.iter().map(|x| -x * x).collect();
        let b_inv = invert_symmetric_matrix(&weighted_gram(self.design, &w), p);
        let db = weighted_gram(self.design, &dw);
        let trace: f64 = (0..p)
            .flat_map(|i| (0..p).map(move |j| (i, j)))
            .map(|(i, j)| b_inv[i * p + j] * db[j * p + i])
            .sum();
        let cr_part = if trace.is_finite() { -0.5 * trace } else { 0.0 };

        let prior = self.prior.map_or(0.0, |pr| -(log_alpha - pr.mean) / pr.variance);

        (ll_part + cr_part) * alpha + prior
    }

    /// Armijo backtracking ascent in `ln(alpha)` starting at `start`
    pub fn line_search(&self, start: f64, settings: &LineSearchSettings) -> LineSearchOutcome {
        let mut log_alpha = start.clamp(MIN_LOG_ALPHA_HARD, MAX_LOG_ALPHA_HARD);
        let initial_lp = self.log_posterior(log_alpha);
        let mut lp = initial_lp;
        let mut dlp = self.d_log_posterior(log_alpha);
        let mut kappa = settings.kappa_0;
        let mut accepted = 0usize;

        for iter in 0..settings.maxit {
            let raw = log_alpha + kappa * dlp;
            if raw < MIN_LOG_ALPHA_HARD && dlp != 0.0 {
                kappa = (MIN_LOG_ALPHA_HARD - log_alpha) / dlp;
            }
            if raw > MAX_LOG_ALPHA_HARD && dlp != 0.0 {
                kappa = (MAX_LOG_ALPHA_HARD - log_alpha) / dlp;
            }
            let proposal = log_alpha + kappa * dlp;
            let lp_proposal = self.log_posterior(proposal);

            if -lp_proposal <= -lp - kappa * ARMIJO_EPSILON * dlp * dlp {
                accepted += 1;
                log_alpha = proposal;
                let change = lp_proposal - lp;
                lp = lp_proposal;

                if change < settings.tol || log_alpha < settings.min_log_alpha {
                    return LineSearchOutcome {
                        log_alpha,
                        initial_lp,
                        final_lp: lp,
                        iterations: iter + 1,
                        converged: true,
                    };
                }

                dlp = self.d_log_posterior(log_alpha);
                kappa = (kappa * 1.1).min(settings.kappa_0);
                if accepted % 5 == 0 {
                    kappa /= 2.0;
                }
            } else {
                kappa /= 2.0;
            }
        }

        LineSearchOutcome {
            log_alpha,
            initial_lp,
            final_lp: lp,
            iterations: settings.maxit,
            converged: false,
        }
    }

    /// Coarse-then-fine grid maximization of `log_posterior` on `[min_disp, max_disp]`
    pub fn grid_search(&self, min_disp: f64, max_disp: f64) -> f64 {
        let lo = min_disp.ln();
        let hi = max_disp.ln();
        let delta = (hi - lo) / (GRID_POINTS - 1) as f64;

        let best_on = |start: f64, step: f64| -> f64 {
            (0..GRID_POINTS)
                .map(|i| start + i as f64 * step)
                .map(|la| (la, self.log_posterior(la)))
                .filter(|(_, lp)| lp.is_finite())
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map_or(start, |(la, _)| la)
        };

        let coarse = best_on(lo, delta);
        let fine = best_on(coarse - delta, 2.0 * delta / (GRID_POINTS - 1) as f64);
        fine.exp()
    }
}
