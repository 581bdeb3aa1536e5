//! Empirical-Bayes shrinkage of contrast effect sizes

mod apeglm;
mod lbfgs;

pub use apeglm::{estimate_prior_var, shrink_timepoint, ApeglmParams, ApeglmPrior, ShrinkageResult, ShrunkenEffect};

use rayon::prelude::*;

use crate::data::TimePoint;
use crate::error::Result;
use crate::model::ModelFit;

/// Shrink every requested timepoint independently
pub fn shrink_timepoints(
    model: &ModelFit,
    timepoints: &[TimePoint],
    params: &ApeglmParams,
) -> Result<Vec<ShrinkageResult>> {
    timepoints
        .par_iter()
        .map(|&tp| shrink_timepoint(model, tp, params))
        .collect()
}
