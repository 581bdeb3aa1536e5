//! P-values from Wald statistics

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

/// Direction of the alternative hypothesis for a Wald test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Alternative {
    /// H1: beta < 0 (depletion)
    #[default]
    Less,
    /// H1: beta > 0
    Greater,
    /// H1: beta != 0
    TwoSided,
}

/// Standard normal CDF
fn pnorm(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// P-value of a standard normal statistic under the given alternative.
/// Non-finite statistics give NaN.
pub fn calculate_pvalue(z: f64, alternative: Alternative) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }

    match alternative {
        Alternative::Less => pnorm(z),
        Alternative::Greater => pnorm(-z),
        Alternative::TwoSided => (2.0 * pnorm(-z.abs())).min(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_two_sided_symmetric() {
        let p1 = calculate_pvalue(2.0, Alternative::TwoSided);
        let p2 = calculate_pvalue(-2.0, Alternative::TwoSided);
        assert!((p1 - p2).abs() < 1e-10);
        assert_relative_eq!(p1, 0.0455, epsilon = 1e-4);
    }

    #[test]
    fn test_less_tail() {
        // Strong depletion gives small p, enrichment gives large p
        assert_relative_eq!(calculate_pvalue(-1.6449, Alternative::Less), 0.05, epsilon = 1e-4);
        assert!(calculate_pvalue(3.0, Alternative::Less) > 0.99);
        assert_relative_eq!(calculate_pvalue(0.0, Alternative::Less), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_greater_complements_less() {
        for z in [-3.0, -1.0, 0.0, 1.0, 3.0] {
            let sum = calculate_pvalue(z, Alternative::Less) + calculate_pvalue(z, Alternative::Greater);
            assert_relative_eq!(sum, 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_non_finite_statistic() {
        assert!(calculate_pvalue(f64::NAN, Alternative::Less).is_nan());
        assert!(calculate_pvalue(f64::INFINITY, Alternative::TwoSided).is_nan());
    }
}
