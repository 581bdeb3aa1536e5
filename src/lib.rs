//! peptide_odid: depletion testing and concentration estimates for pooled
//! peptide-library sequencing time courses
//!
//! Counts are modeled with a negative binomial GLM over a `batch + timepoint`
//! design. Each non-baseline timepoint is tested for depletion against the
//! baseline with a one-sided Wald test, its effect is shrunk with a Cauchy
//! prior, and the shrunken log2 fold change is converted to an OD-equivalent
//! concentration using a measured growth curve.
//!
//! # Example
//!
//! ```ignore
//! use peptide_odid::prelude::*;
//!
//! let table = read_count_table("counts.tsv")?;
//! let calibration = CalibrationTable::from_measurements(&read_calibration("od.csv")?, BASELINE_OD)?;
//! let output = run_pipeline(&table.matrix, &calibration, &table.sequences, &PipelineConfig::default())?;
//! write_results("results.tsv", &output.records, &output.columns)?;
//! ```

pub mod calibration;
pub mod cli;
pub mod config;
pub mod data;
pub mod dispersion;
pub mod error;
pub mod filter;
pub mod glm;
pub mod io;
pub mod merge;
pub mod model;
pub mod normalization;
pub mod shrinkage;
pub mod stats;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::calibration::{CalibrationTable, OdMeasurement, BASELINE_OD};
    pub use crate::config::PipelineConfig;
    pub use crate::data::{CountMatrix, SampleLabel, SampleMetadata, TimePoint};
    pub use crate::dispersion::{estimate_dispersions, DispersionParams};
    pub use crate::error::{OdidError, Result};
    pub use crate::glm::{fit_glm, DesignInfo, GlmFitParams};
    pub use crate::io::{
        read_calibration, read_count_table, read_sequences, write_results, write_summary, ResultColumns, ResultRecord,
        RunSummary,
    };
    pub use crate::merge::SequenceInfo;
    pub use crate::model::{fit_model, ModelFit};
    pub use crate::shrinkage::{shrink_timepoint, ApeglmParams};
    pub use crate::testing::{benjamini_hochberg, wald_test, Alternative};
    pub use crate::{run_pipeline, PipelineOutput};
}

use std::collections::HashMap;

use prelude::*;
use crate::io::{ContrastSummary, ShrinkageSummary};
use crate::merge::{assemble_records, merge_results};
use crate::shrinkage::{shrink_timepoints, ShrinkageResult};
use crate::testing::{test_contrasts, ContrastResult};

/// Everything a run produces
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub records: Vec<ResultRecord>,
    pub columns: ResultColumns,
    pub summary: RunSummary,
    pub model: ModelFit,
    pub contrasts: Vec<ContrastResult>,
    pub shrinkage: Vec<ShrinkageResult>,
}

fn resolve_timepoint(
    requested: Option<u32>,
    default: TimePoint,
    metadata: &SampleMetadata,
    role: &str,
) -> Result<TimePoint> {
    let tp = requested.map(TimePoint).unwrap_or(default);
    if !metadata.non_baseline_timepoints().contains(&tp) {
        return Err(OdidError::InvalidContrast {
            reason: format!(
                "{} timepoint {} is not a non-baseline timepoint (available: {:?})",
                role,
                tp,
                metadata.non_baseline_timepoints().iter().map(|t| t.value()).collect::<Vec<_>>()
            ),
        });
    }
    Ok(tp)
}

/// Run the complete depletion pipeline.
///
/// Stages: sparse-feature filter, design, model fit, then contrast testing
/// and effect shrinkage side by side, then concentrations and the merged table.
pub fn run_pipeline(
    counts: &CountMatrix,
    calibration: &CalibrationTable,
    sequences: &HashMap<String, SequenceInfo>,
    config: &PipelineConfig,
) -> Result<PipelineOutput> {
    config.validate()?;

    let n_input = counts.n_features();
    let filtered = counts.filter_min_total(config.min_total_count)?;
    let metadata = SampleMetadata::from_sample_names(filtered.sample_ids())?;

    let non_baseline = metadata.non_baseline_timepoints().to_vec();
    let (first, last) = match (non_baseline.first(), non_baseline.last()) {
        (Some(&f), Some(&l)) => (f, l),
        _ => {
            return Err(OdidError::InvalidDesign {
                reason: "No non-baseline timepoint to contrast".to_string(),
            })
        }
    };
    let primary = resolve_timepoint(config.primary_timepoint, last, &metadata, "Primary")?;
    let secondary = resolve_timepoint(config.secondary_timepoint, first, &metadata, "Secondary")?;
    calibration.require(metadata.timepoints())?;

    let model = fit_model(&filtered, &metadata, &config.dispersion, &config.glm)?;

    let contrast_timepoints: Vec<TimePoint> = if secondary == primary {
        vec![primary]
    } else {
        vec![primary, secondary]
    };
    log::info!(
        "Testing {} and shrinking {} timepoints",
        contrast_timepoints.len(),
        non_baseline.len()
    );
    let (contrasts, shrinkage) = rayon::join(
        || {
            test_contrasts(
                &model,
                &contrast_timepoints,
                Alternative::Less,
                config.alpha,
                config.independent_filtering,
            )
        },
        || shrink_timepoints(&model, &non_baseline, &config.shrinkage),
    );
    let contrasts = contrasts?;
    let shrinkage = shrinkage?;

    let records = assemble_records(
        &model,
        &contrasts[0],
        contrasts.get(1),
        &shrinkage,
        calibration,
        metadata.timepoints(),
    )?;
    let merged = merge_results(records, sequences);

    let columns = ResultColumns {
        primary,
        secondary: (secondary != primary).then_some(secondary),
        shrunken: non_baseline.clone(),
        odid: metadata.timepoints().to_vec(),
    };

    let summary = RunSummary {
        n_features_input: n_input,
        n_features_modeled: model.n_features(),
        n_features_reported: merged.records.len(),
        n_duplicates_removed: merged.n_duplicates,
        size_factor_method: model.size_factor_method,
        size_factors: model.size_factors.to_vec(),
        dispersion_trend: model.dispersions.trend,
        dispersion_prior_var: model.dispersions.prior_var,
        n_dispersion_outliers: model.dispersions.n_outliers(),
        n_unconverged: model.glm.n_unconverged(),
        contrasts: contrasts
            .iter()
            .map(|c| ContrastSummary {
                name: c.name(),
                n_tested: c.records.iter().filter(|r| r.pvalue.is_some()).count(),
                n_significant: c.n_significant(config.alpha),
                filter: c.filter.clone(),
            })
            .collect(),
        shrinkage: shrinkage
            .iter()
            .map(|s| ShrinkageSummary {
                timepoint: s.timepoint,
                prior: s.prior,
                n_unconverged: s.n_unconverged(),
            })
            .collect(),
        mean_od: metadata
            .timepoints()
            .iter()
            .map(|&tp| Ok((tp, calibration.mean_od(tp)?)))
            .collect::<Result<Vec<_>>>()?,
    };

    Ok(PipelineOutput {
        records: merged.records,
        columns,
        summary,
        model,
        contrasts,
        shrinkage,
    })
}
