//! Wald test of a single timepoint-vs-baseline contrast

use std::f64::consts::LN_2;

use rayon::prelude::*;
use serde::Serialize;

use super::fdr::adjust_optional;
use super::pvalue::{calculate_pvalue, Alternative};
use crate::data::TimePoint;
use crate::error::Result;
use crate::filter::{independent_filtering, FilterOutcome};
use crate::model::ModelFit;

/// Test statistics for one feature under one contrast
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContrastRecord {
    pub base_mean: f64,
    pub log2_fold_change: f64,
    /// `None` when the coefficient variance is zero or not finite
    pub lfc_se: Option<f64>,
    pub stat: Option<f64>,
    /// `None` when the statistic is undefined or the feature was filtered
    pub pvalue: Option<f64>,
    /// Defined only where `pvalue` is
    pub padj: Option<f64>,
}

/// One contrast over every feature, in feature order
#[derive(Debug, Clone, Serialize)]
pub struct ContrastResult {
    pub timepoint: TimePoint,
    pub baseline: TimePoint,
    pub alternative: Alternative,
    pub records: Vec<ContrastRecord>,
    /// Present when independent filtering ran
    pub filter: Option<FilterOutcome>,
}

impl ContrastResult {
    pub fn name(&self) -> String {
        format!("timepoint_{}_vs_{}", self.timepoint, self.baseline)
    }

    pub fn n_significant(&self, alpha: f64) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r.padj, Some(q) if q < alpha))
            .count()
    }
}

fn feature_statistics(beta: f64, variance: f64, base_mean: f64, alternative: Alternative) -> ContrastRecord {
    let se = variance.sqrt();
    let defined = se.is_finite() && se > 0.0;
    let stat = if defined { Some(beta / se) } else { None };

    ContrastRecord {
        base_mean,
        log2_fold_change: beta / LN_2,
        lfc_se: if defined { Some(se / LN_2) } else { None },
        stat,
        pvalue: stat.map(|z| calculate_pvalue(z, alternative)).filter(|p| !p.is_nan()),
        padj: None,
    }
}

/// Wald statistics, p-values and BH-adjusted p-values for `timepoint` vs baseline.
///
/// With `use_filtering`, low base-mean features are excluded from the
/// correction and report neither a p-value nor an adjusted p-value.
pub fn wald_test(
    model: &ModelFit,
    timepoint: TimePoint,
    alternative: Alternative,
    alpha: f64,
    use_filtering: bool,
) -> Result<ContrastResult> {
    let k = model.design_info.timepoint_coef(timepoint)?;
    let n_features = model.n_features();

    let mut records: Vec<ContrastRecord> = (0..n_features)
        .into_par_iter()
        .map(|i| {
            feature_statistics(
                model.glm.coefficients[[i, k]],
                model.glm.covariances[[i, k, k]],
                model.base_means[i],
                alternative,
            )
        })
        .collect();

    let pvalues: Vec<Option<f64>> = records.iter().map(|r| r.pvalue).collect();
    let (pvalues, padj, filter) = if use_filtering {
        let outcome = independent_filtering(&model.base_means, &pvalues, alpha);
        (outcome.pvalues.clone(), outcome.padj.clone(), Some(outcome))
    } else {
        let padj = adjust_optional(&pvalues);
        (pvalues, padj, None)
    };

    for (record, (p, q)) in records.iter_mut().zip(pvalues.into_iter().zip(padj)) {
        record.pvalue = p;
        record.padj = q;
    }

    let result = ContrastResult {
        timepoint,
        baseline: model.design_info.baseline,
        alternative,
        records,
        filter,
    };
    log::info!(
        "{}: {} of {} features with padj < {}",
        result.name(),
        result.n_significant(alpha),
        n_features,
        alpha
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_log2_scaling() {
        let r = feature_statistics(-LN_2, 0.25, 100.0, Alternative::Less);
        assert_relative_eq!(r.log2_fold_change, -1.0, epsilon = 1e-12);
        assert_relative_eq!(r.lfc_se.unwrap(), 0.5 / LN_2, epsilon = 1e-12);
        // stat is scale-free
        assert_relative_eq!(r.stat.unwrap(), -LN_2 / 0.5, epsilon = 1e-12);
        assert!(r.pvalue.unwrap() < 0.1);
    }

    #[test]
    fn test_enriched_feature_not_significant_under_less() {
        let r = feature_statistics(2.0, 0.04, 100.0, Alternative::Less);
        assert!(r.pvalue.unwrap() > 0.99);
    }

    #[test]
    fn test_zero_variance_is_undefined() {
        let r = feature_statistics(1.0, 0.0, 10.0, Alternative::Less);
        assert!(r.lfc_se.is_none());
        assert!(r.stat.is_none());
        assert!(r.pvalue.is_none());

        let r = feature_statistics(1.0, f64::NAN, 10.0, Alternative::Less);
        assert!(r.pvalue.is_none());
    }
}
