//! Size factor estimation using the median of ratios method

use ndarray::{Array1, ArrayView2, Axis};
use serde::Serialize;

use crate::error::{OdidError, Result};
use crate::stats::median;

/// Method for size factor estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SizeFactorMethod {
    /// Median of ratios over features with no zero counts
    Ratio,
    /// Geometric means over positive counts only; used when every feature has a zero
    PosCounts,
}

/// Estimate per-sample size factors.
///
/// Libraries screened for depletion are often sparse, so when no feature is
/// observed in every sample the ratio method is replaced by the positive-counts
/// variant. Returns the factors together with the method that produced them.
pub fn estimate_size_factors(counts: ArrayView2<f64>) -> Result<(Array1<f64>, SizeFactorMethod)> {
    match size_factors_ratio(counts) {
        Ok(sf) => Ok((sf, SizeFactorMethod::Ratio)),
        Err(OdidError::SizeFactorFailed { reason }) => {
            log::warn!("{}; falling back to positive-counts size factors", reason);
            Ok((size_factors_poscounts(counts)?, SizeFactorMethod::PosCounts))
        }
        Err(e) => Err(e),
    }
}

fn check_not_empty(counts: &ArrayView2<f64>) -> Result<()> {
    let (n_features, n_samples) = counts.dim();
    if n_features == 0 || n_samples == 0 {
        return Err(OdidError::EmptyData {
            reason: "Count matrix is empty".to_string(),
        });
    }
    Ok(())
}

fn median_ratios(counts: &ArrayView2<f64>, log_geo_means: &[(usize, f64)]) -> Vec<Option<f64>> {
    (0..counts.ncols())
        .map(|j| {
            let ratios: Vec<f64> = log_geo_means
                .iter()
                .filter(|(i, _)| counts[[*i, j]] > 0.0)
                .map(|&(i, lg)| (counts[[i, j]].ln() - lg).exp())
                .collect();
            if ratios.is_empty() {
                None
            } else {
                Some(median(&ratios))
            }
        })
        .collect()
}

pub(crate) fn size_factors_ratio(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    check_not_empty(&counts)?;
    let n_samples = counts.ncols() as f64;

    let log_geo_means: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().all(|&x| x > 0.0))
        .map(|(i, row)| (i, row.iter().map(|x| x.ln()).sum::<f64>() / n_samples))
        .collect();

    if log_geo_means.is_empty() {
        return Err(OdidError::SizeFactorFailed {
            reason: "every feature has at least one zero count".to_string(),
        });
    }

    let factors: Option<Vec<f64>> = median_ratios(&counts, &log_geo_means).into_iter().collect();
    let factors = Array1::from(factors.ok_or_else(|| OdidError::SizeFactorFailed {
        reason: "a sample has no usable ratios".to_string(),
    })?);

    if factors.iter().any(|&x| x <= 0.0 || !x.is_finite()) {
        return Err(OdidError::SizeFactorFailed {
            reason: "Invalid size factors computed".to_string(),
        });
    }
    Ok(factors)
}

pub(crate) fn size_factors_poscounts(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    check_not_empty(&counts)?;
    let n_samples = counts.ncols() as f64;

    // zeros contribute nothing to the log sum but still count in the denominator
    let log_geo_means: Vec<(usize, f64)> = counts
        .axis_iter(Axis(0))
        .enumerate()
        .filter(|(_, row)| row.iter().any(|&x| x > 0.0))
        .map(|(i, row)| {
            let s: f64 = row.iter().filter(|&&x| x > 0.0).map(|x| x.ln()).sum();
            (i, s / n_samples)
        })
        .collect();

    if log_geo_means.is_empty() {
        return Err(OdidError::SizeFactorFailed {
            reason: "No features with positive counts found".to_string(),
        });
    }

    let raw: Vec<f64> = median_ratios(&counts, &log_geo_means)
        .into_iter()
        .map(|r| r.unwrap_or(1.0))
        .collect();

    // rescale to geometric mean one
    let log_center = raw.iter().map(|x| x.ln()).sum::<f64>() / raw.len() as f64;
    Ok(raw.iter().map(|x| x / log_center.exp()).collect())
}

/// Mean of size-factor-normalized counts per feature
pub fn base_means(counts: ArrayView2<f64>, size_factors: &Array1<f64>) -> Vec<f64> {
    counts
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(size_factors.iter())
                .map(|(c, s)| c / s)
                .sum::<f64>()
                / row.len() as f64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn test_ratio_recovers_depth() {
        // sample 2 sequenced twice as deep
        let counts = array![[10.0, 20.0], [30.0, 60.0], [5.0, 10.0]];
        let (sf, method) = estimate_size_factors(counts.view()).unwrap();
        assert_eq!(method, SizeFactorMethod::Ratio);
        assert_relative_eq!(sf[1] / sf[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(sf[0] * sf[1], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_poscounts_fallback_on_sparse_matrix() {
        let counts = array![[0.0, 4.0, 8.0], [3.0, 0.0, 6.0], [2.0, 4.0, 0.0]];
        let (sf, method) = estimate_size_factors(counts.view()).unwrap();
        assert_eq!(method, SizeFactorMethod::PosCounts);
        assert!(sf.iter().all(|&s| s > 0.0 && s.is_finite()));
        let log_mean = sf.iter().map(|s| s.ln()).sum::<f64>() / 3.0;
        assert_relative_eq!(log_mean, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_base_means() {
        let counts = array![[10.0, 40.0]];
        let sf = array![1.0, 2.0];
        assert_eq!(base_means(counts.view(), &sf), vec![15.0]);
    }
}
