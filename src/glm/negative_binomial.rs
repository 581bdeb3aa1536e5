//! Negative binomial mean/variance helpers shared by the IRLS fitter

use statrs::function::gamma::ln_gamma;

/// Floor applied to fitted means before weights are formed
pub const MIN_MU: f64 = 0.5;

/// A coefficient beyond this magnitude (natural log) stops IRLS and marks
/// the feature unconverged
pub const MAX_LFC_BETA: f64 = 30.0;

/// Linear predictor clamp against `exp` overflow
pub const MAX_ETA: f64 = 700.0;

/// `mu = s * exp(eta)`
pub fn nb_mean(eta: f64, size_factor: f64) -> f64 {
    size_factor * eta.clamp(-MAX_ETA, MAX_ETA).exp()
}

/// `Var(Y) = mu + alpha * mu^2`
pub fn nb_variance(mu: f64, alpha: f64) -> f64 {
    mu + alpha * mu * mu
}

/// Log probability mass of `k` under NB(mean `mu`, dispersion `alpha`)
pub fn nb_log_likelihood(k: f64, mu: f64, alpha: f64) -> f64 {
    if mu <= 0.0 || alpha <= 0.0 {
        return f64::NEG_INFINITY;
    }
    let size = 1.0 / alpha;
    let prob = size / (size + mu);
    ln_gamma(k + size) - ln_gamma(size) - ln_gamma(k + 1.0) + size * prob.ln() + k * (1.0 - prob).ln()
}

/// IRLS working weight `mu / (1 + alpha * mu)`
pub fn nb_weight(mu: f64, alpha: f64) -> f64 {
    mu / (1.0 + alpha * mu)
}
