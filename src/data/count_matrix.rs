//! Read-count matrix for pooled peptide libraries

use std::collections::HashMap;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};

use crate::error::{OdidError, Result};

/// Rename repeated feature ids as `id_1`, `id_2`, ... so joins stay one-to-one
fn deduplicate_ids(ids: Vec<String>) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for id in &ids {
        *counts.entry(id.as_str()).or_insert(0) += 1;
    }
    if counts.values().all(|&c| c == 1) {
        return ids;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    ids.into_iter()
        .map(|id| {
            let n = seen.entry(id.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                id
            } else {
                let renamed = format!("{}_{}", id, *n - 1);
                log::warn!("Duplicate feature id '{}' renamed to '{}'", id, renamed);
                renamed
            }
        })
        .collect()
}

/// Feature x sample count matrix
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts: Array2<f64>,
    feature_ids: Vec<String>,
    sample_ids: Vec<String>,
}

impl CountMatrix {
    pub fn new(
        counts: Array2<f64>,
        feature_ids: Vec<String>,
        sample_ids: Vec<String>,
    ) -> Result<Self> {
        let (n_features, n_samples) = counts.dim();

        if feature_ids.len() != n_features {
            return Err(OdidError::DimensionMismatch {
                expected: format!("{} feature IDs", n_features),
                got: format!("{} feature IDs", feature_ids.len()),
            });
        }

        if sample_ids.len() != n_samples {
            return Err(OdidError::DimensionMismatch {
                expected: format!("{} sample IDs", n_samples),
                got: format!("{} sample IDs", sample_ids.len()),
            });
        }

        if counts.iter().any(|&x| x < 0.0 || !x.is_finite()) {
            return Err(OdidError::InvalidCountMatrix {
                reason: "Counts must be non-negative finite values".to_string(),
            });
        }

        if counts.iter().any(|&x| x != x.round()) {
            log::warn!("Some count values are not integers; they are modeled as-is");
        }

        Ok(Self {
            counts,
            feature_ids: deduplicate_ids(feature_ids),
            sample_ids,
        })
    }

    pub fn n_features(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn feature_ids(&self) -> &[String] {
        &self.feature_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn feature_counts(&self, feature_idx: usize) -> ArrayView1<'_, f64> {
        self.counts.row(feature_idx)
    }

    /// Total reads per feature across all samples
    pub fn feature_totals(&self) -> Vec<f64> {
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.sum())
            .collect()
    }

    /// Keep features whose total count is at least `min_total`.
    ///
    /// With `min_total = 2`, a feature seen once across all samples is dropped
    /// while a feature seen twice survives.
    pub fn filter_min_total(&self, min_total: f64) -> Result<Self> {
        let keep: Vec<usize> = self
            .feature_totals()
            .iter()
            .enumerate()
            .filter(|(_, &total)| total >= min_total)
            .map(|(i, _)| i)
            .collect();

        if keep.is_empty() {
            return Err(OdidError::EmptyData {
                reason: format!("no feature has a total count of at least {}", min_total),
            });
        }

        log::info!(
            "Count filter: kept {} of {} features (total >= {})",
            keep.len(),
            self.n_features(),
            min_total
        );
        self.subset_features(&keep)
    }

    pub fn subset_features(&self, feature_indices: &[usize]) -> Result<Self> {
        let counts = self.counts.select(Axis(0), feature_indices);
        let feature_ids = feature_indices
            .iter()
            .map(|&i| self.feature_ids[i].clone())
            .collect();
        Self::new(counts, feature_ids, self.sample_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{}{}", prefix, i)).collect()
    }

    #[test]
    fn test_count_matrix_creation() {
        let m = CountMatrix::new(array![[10.0, 20.0, 30.0], [5.0, 15.0, 25.0]], ids("f", 2), ids("s", 3)).unwrap();
        assert_eq!(m.n_features(), 2);
        assert_eq!(m.n_samples(), 3);
        assert_eq!(m.feature_totals(), vec![60.0, 45.0]);
    }

    #[test]
    fn test_negative_counts_rejected() {
        let res = CountMatrix::new(array![[10.0, -5.0], [5.0, 15.0]], ids("f", 2), ids("s", 2));
        assert!(matches!(res, Err(OdidError::InvalidCountMatrix { .. })));
    }

    #[test]
    fn test_dimension_mismatch() {
        let res = CountMatrix::new(array![[1.0, 2.0]], ids("f", 2), ids("s", 2));
        assert!(matches!(res, Err(OdidError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_total_one_removed_total_two_kept() {
        let counts = array![
            [0.0, 1.0, 0.0, 0.0],
            [1.0, 0.0, 0.0, 1.0],
            [0.0, 0.0, 0.0, 0.0],
            [4.0, 7.0, 2.0, 9.0],
        ];
        let m = CountMatrix::new(counts, ids("f", 4), ids("s", 4)).unwrap();
        let filtered = m.filter_min_total(2.0).unwrap();
        assert_eq!(filtered.feature_ids(), &["f1".to_string(), "f3".to_string()]);
    }

    #[test]
    fn test_duplicate_ids_renamed() {
        let m = CountMatrix::new(
            array![[1.0], [2.0], [3.0]],
            vec!["a".into(), "a".into(), "b".into()],
            ids("s", 1),
        )
        .unwrap();
        assert_eq!(m.feature_ids(), &["a".to_string(), "a_1".to_string(), "b".to_string()]);
    }
}
