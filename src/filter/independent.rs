//! Independent filtering on normalized base mean

use serde::Serialize;

use crate::stats::quantile_type7;
use crate::testing::adjust_optional;

/// Number of quantile levels scanned for the filter threshold
const N_THETA: usize = 50;

/// Result of scanning filter thresholds
#[derive(Debug, Clone, Serialize)]
pub struct FilterOutcome {
    /// Chosen quantile level
    pub theta: f64,
    /// Base-mean cutoff at `theta`; features below it are filtered
    pub cutoff: f64,
    /// Features with `padj < alpha` at the chosen cutoff
    pub n_rejections: usize,
    /// P-values with filtered features set to `None`
    #[serde(skip)]
    pub pvalues: Vec<Option<f64>>,
    #[serde(skip)]
    pub padj: Vec<Option<f64>>,
}

/// Pick the base-mean cutoff that maximizes BH rejections at `alpha`.
///
/// Thetas run evenly from the fraction of zero base means to 0.95 (1.0 when
/// that fraction is already past 0.95). Ties go to the smallest theta, so
/// no filtering is applied unless it strictly helps.
pub fn independent_filtering(base_means: &[f64], pvalues: &[Option<f64>], alpha: f64) -> FilterOutcome {
    let n = base_means.len();

    let mut sorted_means: Vec<f64> = base_means.iter().filter(|m| m.is_finite()).copied().collect();
    sorted_means.sort_by(|a, b| a.total_cmp(b));

    if n == 0 || sorted_means.is_empty() {
        let padj = adjust_optional(pvalues);
        return FilterOutcome {
            theta: 0.0,
            cutoff: 0.0,
            n_rejections: count_rejections(&padj, alpha),
            pvalues: pvalues.to_vec(),
            padj,
        };
    }

    let zero_count = base_means.iter().filter(|&&m| m == 0.0 || !m.is_finite()).count();
    let lower_quantile = zero_count as f64 / n as f64;
    let upper_quantile = if lower_quantile < 0.95 { 0.95 } else { 1.0 };

    let thetas: Vec<f64> = (0..N_THETA)
        .map(|i| lower_quantile + (upper_quantile - lower_quantile) * i as f64 / (N_THETA as f64 - 1.0))
        .collect();

    let mut best: Option<(usize, f64, Vec<Option<f64>>, usize)> = None;
    for (j, &theta) in thetas.iter().enumerate() {
        let cutoff = quantile_type7(&sorted_means, theta);
        let filtered = apply_cutoff(base_means, pvalues, cutoff);
        let padj = adjust_optional(&filtered);
        let rejections = count_rejections(&padj, alpha);

        if j % 10 == 0 {
            log::debug!("  theta={:.3}, cutoff={:.2}, numRej={}", theta, cutoff, rejections);
        }

        let better = match &best {
            None => true,
            Some((_, _, _, r)) => rejections > *r,
        };
        if better {
            best = Some((j, cutoff, padj, rejections));
        }
    }

    // N_THETA > 0, so the loop always sets `best`
    let (j, cutoff, padj, n_rejections) = best.unwrap_or_else(|| (0, 0.0, adjust_optional(pvalues), 0));

    log::info!(
        "Independent filtering: theta={:.3}, cutoff={:.2}, rejections={}",
        thetas[j],
        cutoff,
        n_rejections
    );

    FilterOutcome {
        theta: thetas[j],
        cutoff,
        n_rejections,
        pvalues: apply_cutoff(base_means, pvalues, cutoff),
        padj,
    }
}

fn apply_cutoff(base_means: &[f64], pvalues: &[Option<f64>], cutoff: f64) -> Vec<Option<f64>> {
    pvalues
        .iter()
        .zip(base_means)
        .map(|(&p, &m)| if m >= cutoff { p } else { None })
        .collect()
}

fn count_rejections(padj: &[Option<f64>], alpha: f64) -> usize {
    padj.iter().filter(|q| matches!(q, Some(v) if *v < alpha)).count()
}
