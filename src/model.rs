//! Fitted negative binomial model shared by testing and shrinkage

use ndarray::{Array1, Array2};

use crate::data::{CountMatrix, SampleMetadata};
use crate::dispersion::{estimate_dispersions, DispersionEstimates, DispersionParams};
use crate::error::{OdidError, Result};
use crate::glm::{create_design_matrix, fit_glm, DesignInfo, GlmFit, GlmFitParams};
use crate::normalization::{base_means, estimate_size_factors, SizeFactorMethod};

/// Everything downstream stages read from the fit. Immutable once built.
#[derive(Debug, Clone)]
pub struct ModelFit {
    pub feature_ids: Vec<String>,
    /// Raw counts, features x samples
    pub counts: Array2<f64>,
    pub design: Array2<f64>,
    pub design_info: DesignInfo,
    pub size_factors: Array1<f64>,
    pub size_factor_method: SizeFactorMethod,
    pub base_means: Vec<f64>,
    pub dispersions: DispersionEstimates,
    pub glm: GlmFit,
}

impl ModelFit {
    pub fn n_features(&self) -> usize {
        self.feature_ids.len()
    }
}

/// Size factors, dispersions and the final coefficient refit
pub fn fit_model(
    counts: &CountMatrix,
    metadata: &SampleMetadata,
    dispersion_params: &DispersionParams,
    glm_params: &GlmFitParams,
) -> Result<ModelFit> {
    if counts.sample_ids() != metadata.sample_ids() {
        return Err(OdidError::DimensionMismatch {
            expected: format!("samples {:?}", metadata.sample_ids()),
            got: format!("samples {:?}", counts.sample_ids()),
        });
    }
    if counts.n_features() == 0 {
        return Err(OdidError::EmptyData {
            reason: "No features left to model".to_string(),
        });
    }

    let (design, design_info) = create_design_matrix(metadata)?;
    log::info!("Design columns: {}", design_info.coef_names.join(", "));

    let (size_factors, size_factor_method) = estimate_size_factors(counts.counts())?;
    if size_factors.iter().any(|s| !s.is_finite() || *s <= 0.0) {
        return Err(OdidError::NumericalInstability {
            operation: "size factor estimation".to_string(),
            details: format!("non-positive or non-finite size factors {:?}", size_factors.to_vec()),
        });
    }
    log::info!("Size factors ({:?}): {:?}", size_factor_method, size_factors.to_vec());
    let means = base_means(counts.counts(), &size_factors);

    let dispersions = estimate_dispersions(
        counts.counts(),
        &size_factors,
        &design,
        &means,
        dispersion_params,
    )?;

    log::info!("Refitting coefficients at final dispersions");
    let glm = fit_glm(
        counts.counts(),
        &design,
        size_factors.view(),
        &dispersions.final_dispersions(),
        glm_params,
    )?;

    Ok(ModelFit {
        feature_ids: counts.feature_ids().to_vec(),
        counts: counts.counts().to_owned(),
        design,
        design_info,
        size_factors,
        size_factor_method,
        base_means: means,
        dispersions,
        glm,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_sample_order_must_match() {
        let counts = CountMatrix::new(
            array![[10.0, 12.0, 3.0, 4.0]],
            vec!["f1".to_string()],
            vec!["0A".to_string(), "0B".to_string(), "1A".to_string(), "1B".to_string()],
        )
        .unwrap();
        let names: Vec<String> = ["0B", "0A", "1A", "1B"].iter().map(|s| s.to_string()).collect();
        let metadata = SampleMetadata::from_sample_names(&names).unwrap();

        let err = fit_model(&counts, &metadata, &DispersionParams::default(), &GlmFitParams::default());
        assert!(matches!(err, Err(OdidError::DimensionMismatch { .. })));
    }
}
