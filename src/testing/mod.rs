//! Contrast testing: Wald statistics, p-values and FDR control

mod fdr;
mod pvalue;
mod wald;

pub use fdr::{adjust_optional, benjamini_hochberg};
pub use pvalue::{calculate_pvalue, Alternative};
pub use wald::{wald_test, ContrastRecord, ContrastResult};

use crate::data::TimePoint;
use crate::error::Result;
use crate::model::ModelFit;

/// Test several timepoints against the baseline, each with its own filtering
pub fn test_contrasts(
    model: &ModelFit,
    timepoints: &[TimePoint],
    alternative: Alternative,
    alpha: f64,
    independent_filtering: bool,
) -> Result<Vec<ContrastResult>> {
    timepoints
        .iter()
        .map(|&tp| wald_test(model, tp, alternative, alpha, independent_filtering))
        .collect()
}
