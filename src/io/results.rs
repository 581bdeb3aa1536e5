//! Final result records and the run summary

use serde::Serialize;

use crate::data::TimePoint;
use crate::dispersion::DispersionTrend;
use crate::filter::FilterOutcome;
use crate::normalization::SizeFactorMethod;
use crate::shrinkage::{ApeglmPrior, ShrunkenEffect};
use crate::testing::ContrastRecord;

/// Per-feature statistics for one tested contrast
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ContrastFields {
    pub timepoint: TimePoint,
    #[serde(flatten)]
    pub record: ContrastRecord,
}

/// One row of the merged output table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRecord {
    pub feature: String,
    pub base_mean: f64,
    pub dispersion: f64,
    pub disp_outlier: bool,
    pub converged: bool,
    pub primary: ContrastFields,
    /// Absent when the secondary contrast is the primary one
    pub secondary: Option<ContrastFields>,
    /// One entry per non-baseline timepoint, ascending
    pub shrunken: Vec<(TimePoint, ShrunkenEffect)>,
    /// One entry per timepoint including the baseline, ascending
    pub odid: Vec<(TimePoint, Option<f64>)>,
    pub aa_seq: Option<String>,
    pub dna_seq: Option<String>,
}

impl ResultRecord {
    pub fn primary_padj(&self) -> Option<f64> {
        self.primary.record.padj
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContrastSummary {
    pub name: String,
    pub n_tested: usize,
    pub n_significant: usize,
    pub filter: Option<FilterOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShrinkageSummary {
    pub timepoint: TimePoint,
    pub prior: ApeglmPrior,
    pub n_unconverged: usize,
}

/// Run-level bookkeeping written with `--summary`
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub n_features_input: usize,
    pub n_features_modeled: usize,
    pub n_features_reported: usize,
    pub n_duplicates_removed: usize,
    pub size_factor_method: SizeFactorMethod,
    pub size_factors: Vec<f64>,
    pub dispersion_trend: DispersionTrend,
    pub dispersion_prior_var: f64,
    pub n_dispersion_outliers: usize,
    pub n_unconverged: usize,
    pub contrasts: Vec<ContrastSummary>,
    pub shrinkage: Vec<ShrinkageSummary>,
    pub mean_od: Vec<(TimePoint, f64)>,
}
