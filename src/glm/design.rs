//! Model matrix for the `~ batch + timepoint` design

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::data::{SampleMetadata, TimePoint};
use crate::error::{OdidError, Result};

/// Column layout of the model matrix.
///
/// Factor order is load-bearing: batch columns come first and timepoint
/// columns last, and contrasts are only ever drawn on timepoint.
#[derive(Debug, Clone)]
pub struct DesignInfo {
    /// Names of the coefficients, in column order
    pub coef_names: Vec<String>,
    /// Reference timepoint every contrast is measured against
    pub baseline: TimePoint,
    /// Non-reference timepoint -> column index
    pub timepoint_columns: BTreeMap<TimePoint, usize>,
    /// Non-reference batch tag -> column index
    pub batch_columns: BTreeMap<String, usize>,
}

impl DesignInfo {
    pub fn n_coefs(&self) -> usize {
        self.coef_names.len()
    }

    /// Column holding the `t vs baseline` log fold change
    pub fn timepoint_coef(&self, timepoint: TimePoint) -> Result<usize> {
        self.timepoint_columns
            .get(&timepoint)
            .copied()
            .ok_or_else(|| OdidError::InvalidContrast {
                reason: format!(
                    "timepoint {} is not a non-baseline level (baseline is {})",
                    timepoint, self.baseline
                ),
            })
    }

    /// Non-baseline timepoints, ascending
    pub fn contrast_timepoints(&self) -> Vec<TimePoint> {
        self.timepoint_columns.keys().copied().collect()
    }
}

/// Build the treatment-coded model matrix: intercept, batch non-reference
/// levels, timepoint non-reference levels.
pub fn create_design_matrix(metadata: &SampleMetadata) -> Result<(Array2<f64>, DesignInfo)> {
    let n_samples = metadata.n_samples();
    let batches = metadata.batches();
    let timepoints = metadata.timepoints();
    let baseline = metadata.baseline();

    let mut coef_names = vec!["Intercept".to_string()];
    let mut batch_columns = BTreeMap::new();
    let mut timepoint_columns = BTreeMap::new();

    let ref_batch = &batches[0];
    for batch in batches.iter().skip(1) {
        batch_columns.insert(batch.0.clone(), coef_names.len());
        coef_names.push(format!("batch_{}_vs_{}", batch, ref_batch));
    }
    for &tp in timepoints.iter().skip(1) {
        timepoint_columns.insert(tp, coef_names.len());
        coef_names.push(format!("timepoint_{}_vs_{}", tp, baseline));
    }

    let mut design = Array2::zeros((n_samples, coef_names.len()));
    for (i, label) in metadata.labels().iter().enumerate() {
        design[[i, 0]] = 1.0;
        if let Some(&j) = batch_columns.get(&label.batch.0) {
            design[[i, j]] = 1.0;
        }
        if let Some(&j) = timepoint_columns.get(&label.timepoint) {
            design[[i, j]] = 1.0;
        }
    }

    check_full_rank(&design)?;

    log::debug!("Design columns: {}", coef_names.join(", "));
    Ok((
        design,
        DesignInfo {
            coef_names,
            baseline,
            timepoint_columns,
            batch_columns,
        },
    ))
}

/// Reject designs whose columns are linearly dependent (e.g. a batch seen at
/// only one timepoint together with a timepoint seen in only that batch) or
/// that leave no residual degrees of freedom.
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let (nrow, ncol) = matrix.dim();
    if nrow == 0 || ncol == 0 {
        return Err(OdidError::InvalidDesign {
            reason: "Design matrix has zero rows or columns".to_string(),
        });
    }
    if nrow <= ncol {
        return Err(OdidError::InvalidDesign {
            reason: format!(
                "{} samples leave no residual degrees of freedom for {} coefficients",
                nrow, ncol
            ),
        });
    }

    let rank = gram_schmidt_rank(matrix);
    if rank < ncol {
        return Err(OdidError::InvalidDesign {
            reason: format!(
                "the model matrix is not full rank ({} of {} columns independent); \
                 every batch and timepoint level must be estimable",
                rank, ncol
            ),
        });
    }
    Ok(())
}

/// Rank by modified Gram-Schmidt with a relative tolerance
fn gram_schmidt_rank(matrix: &Array2<f64>) -> usize {
    let ncol = matrix.ncols();
    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(ncol);
    let scale = matrix.iter().fold(0.0f64, |m, &v| m.max(v.abs())).max(1.0);
    let tol = 1e-10 * scale * matrix.nrows() as f64;

    for j in 0..ncol {
        let mut v: Vec<f64> = matrix.column(j).to_vec();
        for q in &basis {
            let proj: f64 = v.iter().zip(q).map(|(a, b)| a * b).sum();
            for (vi, qi) in v.iter_mut().zip(q) {
                *vi -= proj * qi;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > tol {
            basis.push(v.into_iter().map(|x| x / norm).collect());
        }
    }
    basis.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(names: &[&str]) -> SampleMetadata {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        SampleMetadata::from_sample_names(&names).unwrap()
    }

    #[test]
    fn test_batch_then_timepoint_columns() {
        let meta = metadata(&["0A", "0B", "1A", "1B", "3A", "3B"]);
        let (x, info) = create_design_matrix(&meta).unwrap();
        assert_eq!(
            info.coef_names,
            vec!["Intercept", "batch_B_vs_A", "timepoint_1_vs_0", "timepoint_3_vs_0"]
        );
        assert_eq!(info.timepoint_coef(TimePoint(3)).unwrap(), 3);
        assert!(info.timepoint_coef(TimePoint(0)).is_err());
        // sample 3B
        assert_eq!(x.row(5).to_vec(), vec![1.0, 1.0, 0.0, 1.0]);
        // sample 0A is all reference
        assert_eq!(x.row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_confounded_design_rejected() {
        // batch B only at t1 and t1 only in batch B
        let meta = metadata(&["X0A", "Y0A", "X1B", "Y1B", "X2A", "Y2A"]);
        let err = create_design_matrix(&meta).unwrap_err();
        assert!(matches!(err, OdidError::InvalidDesign { .. }));
    }

    #[test]
    fn test_unsorted_samples_baseline_reference() {
        let meta = metadata(&["5A", "2A", "5B", "2B", "5C", "2C"]);
        let (_, info) = create_design_matrix(&meta).unwrap();
        assert_eq!(info.baseline, TimePoint(2));
        assert_eq!(info.contrast_timepoints(), vec![TimePoint(5)]);
    }
}
