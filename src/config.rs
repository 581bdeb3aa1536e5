//! Pipeline configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::calibration::BASELINE_OD;
use crate::dispersion::DispersionParams;
use crate::error::{OdidError, Result};
use crate::glm::GlmFitParams;
use crate::shrinkage::ApeglmParams;

/// All tunable settings of a run. Every field has a default, so a JSON file
/// only needs to name what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Features with a total count below this are dropped before fitting
    pub min_total_count: f64,
    /// FDR level for independent filtering and significance counts
    pub alpha: f64,
    pub independent_filtering: bool,
    /// Concentration assigned to the baseline timepoint
    pub baseline_od: f64,
    /// Filtering contrast; defaults to the last timepoint
    pub primary_timepoint: Option<u32>,
    /// Reported-only contrast; defaults to the first non-baseline timepoint
    pub secondary_timepoint: Option<u32>,
    pub dispersion: DispersionParams,
    pub glm: GlmFitParams,
    pub shrinkage: ApeglmParams,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_total_count: 2.0,
            alpha: 0.1,
            independent_filtering: true,
            baseline_od: BASELINE_OD,
            primary_timepoint: None,
            secondary_timepoint: None,
            dispersion: DispersionParams::default(),
            glm: GlmFitParams::default(),
            shrinkage: ApeglmParams::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(OdidError::InvalidInput {
                reason: format!("alpha must be in (0, 1), got {}", self.alpha),
            });
        }
        if !(self.baseline_od.is_finite() && self.baseline_od > 0.0) {
            return Err(OdidError::InvalidInput {
                reason: format!("baseline_od must be positive, got {}", self.baseline_od),
            });
        }
        if self.min_total_count < 0.0 {
            return Err(OdidError::InvalidInput {
                reason: format!("min_total_count must be non-negative, got {}", self.min_total_count),
            });
        }
        if self.glm.maxit == 0 || self.dispersion.maxit == 0 {
            return Err(OdidError::InvalidInput {
                reason: "iteration caps must be at least 1".to_string(),
            });
        }
        self.shrinkage.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"alpha": 0.05, "glm": {{"maxit": 20}}, "primary_timepoint": 2}}"#).unwrap();

        let config = PipelineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.alpha, 0.05);
        assert_eq!(config.glm.maxit, 20);
        assert_eq!(config.glm.beta_tol, 1e-6);
        assert_eq!(config.primary_timepoint, Some(2));
        assert_eq!(config.baseline_od, 0.2);
        assert_eq!(config.min_total_count, 2.0);
        assert!(config.independent_filtering);
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"alpha": 1.5}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(file.path()),
            Err(OdidError::InvalidInput { .. })
        ));
    }

    #[test]
    fn test_non_positive_prior_scale_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"shrinkage": {{"max_prior_scale": 0.0}}}}"#).unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(file.path()),
            Err(OdidError::InvalidInput { .. })
        ));

        let config = PipelineConfig {
            shrinkage: ApeglmParams {
                multiplier: -1.0,
                ..ApeglmParams::default()
            },
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(matches!(
            PipelineConfig::from_json_file(file.path()),
            Err(OdidError::JsonError(_))
        ));
    }
}
