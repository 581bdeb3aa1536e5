//! Assembly of per-feature result records, sequence join and deduplication

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::CalibrationTable;
use crate::data::TimePoint;
use crate::error::{OdidError, Result};
use crate::io::{ContrastFields, ResultRecord};
use crate::model::ModelFit;
use crate::shrinkage::ShrinkageResult;
use crate::testing::ContrastResult;

/// Sequences attached to a feature
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceInfo {
    pub aa_seq: Option<String>,
    pub dna_seq: Option<String>,
}

/// Outcome of [`merge_results`]
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub records: Vec<ResultRecord>,
    /// Records dropped for lacking a primary adjusted p-value
    pub n_unreported: usize,
    /// Records dropped as repeats of an earlier amino-acid sequence
    pub n_duplicates: usize,
}

fn check_len(what: &str, expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(OdidError::DimensionMismatch {
            expected: format!("{} {} entries", expected, what),
            got: format!("{} {} entries", got, what),
        });
    }
    Ok(())
}

/// Join the per-stage tables into one record per modeled feature.
///
/// Every stage table is indexed by the model's feature order; sequence fields
/// are left empty here and filled by [`merge_results`].
pub fn assemble_records(
    model: &ModelFit,
    primary: &ContrastResult,
    secondary: Option<&ContrastResult>,
    shrinkage: &[ShrinkageResult],
    calibration: &CalibrationTable,
    timepoints: &[TimePoint],
) -> Result<Vec<ResultRecord>> {
    let n = model.n_features();
    check_len("primary contrast", n, primary.records.len())?;
    if let Some(sec) = secondary {
        check_len("secondary contrast", n, sec.records.len())?;
    }
    for s in shrinkage {
        check_len("shrinkage", n, s.effects.len())?;
    }
    calibration.require(timepoints)?;

    let baseline = model.design_info.baseline;
    let secondary = secondary.filter(|s| s.timepoint != primary.timepoint);

    (0..n)
        .into_par_iter()
        .map(|i| {
            let disp = &model.dispersions.features[i];
            let shrunken: Vec<_> = shrinkage.iter().map(|s| (s.timepoint, s.effects[i])).collect();

            let odid = timepoints
                .iter()
                .map(|&tp| {
                    let lfc = shrunken
                        .iter()
                        .find(|(t, _)| *t == tp)
                        .and_then(|(_, e)| e.shrunk_log2_fold_change);
                    Ok((tp, calibration.odid(tp, baseline, lfc)?))
                })
                .collect::<Result<Vec<_>>>()?;

            Ok(ResultRecord {
                feature: model.feature_ids[i].clone(),
                base_mean: model.base_means[i],
                dispersion: disp.final_dispersion,
                disp_outlier: disp.outlier,
                converged: model.glm.converged[i],
                primary: ContrastFields {
                    timepoint: primary.timepoint,
                    record: primary.records[i],
                },
                secondary: secondary.map(|s| ContrastFields {
                    timepoint: s.timepoint,
                    record: s.records[i],
                }),
                shrunken,
                odid,
                aa_seq: None,
                dna_seq: None,
            })
        })
        .collect()
}

/// Left-join sequences by feature key, keep records with a primary adjusted
/// p-value, then drop repeats of an amino-acid sequence (first one wins).
/// Records without an amino-acid sequence are never treated as repeats.
pub fn merge_results(records: Vec<ResultRecord>, sequences: &HashMap<String, SequenceInfo>) -> MergeOutcome {
    let total = records.len();
    let mut seen: HashSet<String> = HashSet::new();
    let mut n_duplicates = 0;
    let mut kept = Vec::with_capacity(total);

    for mut record in records {
        if record.primary_padj().is_none() {
            continue;
        }
        if let Some(info) = sequences.get(&record.feature) {
            record.aa_seq = info.aa_seq.clone();
            record.dna_seq = info.dna_seq.clone();
        }
        if let Some(aa) = &record.aa_seq {
            if !seen.insert(aa.clone()) {
                log::debug!("Dropping {}: duplicate amino-acid sequence", record.feature);
                n_duplicates += 1;
                continue;
            }
        }
        kept.push(record);
    }

    let n_unreported = total - kept.len() - n_duplicates;
    log::info!(
        "Merged results: {} reported, {} without primary padj, {} duplicate sequences",
        kept.len(),
        n_unreported,
        n_duplicates
    );
    MergeOutcome {
        records: kept,
        n_unreported,
        n_duplicates,
    }
}
