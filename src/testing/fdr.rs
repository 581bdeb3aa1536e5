//! Benjamini-Hochberg false discovery rate adjustment

/// Apply Benjamini-Hochberg FDR correction to p-values.
///
/// NaN p-values are excluded from the number of tests and stay NaN in the
/// output. Adjusted values are monotone in the raw p-values and capped at 1.
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let n = pvalues.len();
    if n == 0 {
        return vec![];
    }

    let mut indices: Vec<usize> = (0..n).collect();

    // NaN sorts last
    indices.sort_by(|&a, &b| {
        let pa = pvalues[a];
        let pb = pvalues[b];
        match (pa.is_nan(), pb.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => pa.total_cmp(&pb),
        }
    });

    let m = pvalues.iter().filter(|p| !p.is_nan()).count();
    if m == 0 {
        return vec![f64::NAN; n];
    }

    let mut padj = vec![f64::NAN; n];
    let mut cummin = f64::INFINITY;
    let mut rank = m;

    for &i in indices.iter().rev() {
        let p = pvalues[i];
        if p.is_nan() {
            continue;
        }
        let adj = (p * m as f64 / rank as f64).min(1.0);
        cummin = cummin.min(adj);
        padj[i] = cummin;
        rank -= 1;
    }

    padj
}

/// BH over optional p-values; `None` entries are not counted as tests
pub fn adjust_optional(pvalues: &[Option<f64>]) -> Vec<Option<f64>> {
    let raw: Vec<f64> = pvalues.iter().map(|p| p.unwrap_or(f64::NAN)).collect();
    benjamini_hochberg(&raw)
        .into_iter()
        .map(|q| if q.is_nan() { None } else { Some(q) })
        .collect()
}
