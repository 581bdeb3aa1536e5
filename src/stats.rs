//! Statistical and small dense linear-algebra helpers shared across modules
//!
//! Matrices here are tiny (one row/column per design coefficient) and stored
//! flat in row-major order: element (i, j) lives at `a[i * n + j]`.

use std::cmp::Ordering;

/// Consistency constant making the MAD an estimator of the normal SD
const MAD_CONSTANT: f64 = 1.4826;

fn sort_finite(values: &[f64]) -> Vec<f64> {
    let mut v: Vec<f64> = values.iter().copied().filter(|x| x.is_finite()).collect();
    v.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    v
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Median of the finite values
pub fn median(values: &[f64]) -> f64 {
    median_sorted(&sort_finite(values))
}

/// Squared scaled median absolute deviation
pub fn mad_squared(values: &[f64]) -> f64 {
    let sorted = sort_finite(values);
    if sorted.is_empty() {
        return 0.0;
    }
    let center = median_sorted(&sorted);
    let deviations: Vec<f64> = sorted.iter().map(|x| (x - center).abs()).collect();
    let mad = median(&deviations) * MAD_CONSTANT;
    mad * mad
}

/// Derivative of the digamma function
pub fn trigamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).powi(2) - trigamma(1.0 - x);
    }
    let mut acc = 0.0;
    let mut z = x;
    while z < 8.0 {
        acc += 1.0 / (z * z);
        z += 1.0;
    }
    let z2 = z * z;
    let z3 = z2 * z;
    let z5 = z3 * z2;
    let z7 = z5 * z2;
    acc + 1.0 / z + 0.5 / z2 + 1.0 / (6.0 * z3) - 1.0 / (30.0 * z5) + 1.0 / (42.0 * z7)
        - 1.0 / (30.0 * z7 * z2)
}

/// Sample quantile with linear interpolation between order statistics
/// (Hyndman-Fan type 7). `sorted` must be ascending.
pub fn quantile_type7(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let h = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lo = (h.floor() as usize).min(n - 1);
    let hi = (h.ceil() as usize).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Mean after dropping `trim` of the observations from each tail
pub fn trimmed_mean(values: &[f64], trim: f64) -> f64 {
    let sorted = sort_finite(values);
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let cut = ((n as f64) * trim).floor() as usize;
    let kept = &sorted[cut.min(n / 2)..n - cut.min(n / 2)];
    if kept.is_empty() {
        return median_sorted(&sorted);
    }
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Lower Cholesky factor; non-positive pivots are nudged to keep the factor usable
fn cholesky(a: &[f64], n: usize) -> Vec<f64> {
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                l[i * n + j] = sum.max(1e-12).sqrt();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    l
}

/// Solve `A x = b` for symmetric positive (semi)definite `A`
pub fn solve_symmetric_system(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let l = cholesky(a, n);

    let mut y = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * n + j] * y[j];
        }
        y[i] = sum / l[i * n + i];
    }

    let mut x = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = y[i];
        for j in (i + 1)..n {
            sum -= l[j * n + i] * x[j];
        }
        x[i] = sum / l[i * n + i];
    }
    x
}

pub fn invert_symmetric_matrix(a: &[f64], n: usize) -> Vec<f64> {
    let mut inv = vec![0.0; n * n];
    for i in 0..n {
        let mut e = vec![0.0; n];
        e[i] = 1.0;
        let col = solve_symmetric_system(a, &e, n);
        for j in 0..n {
            inv[j * n + i] = col[j];
        }
    }
    inv
}

/// Inverse of a symmetric matrix that must be strictly positive definite.
///
/// `None` when the Cholesky factorization hits a non-positive pivot or the
/// inverse has a non-positive diagonal entry.
pub fn invert_positive_definite(a: &[f64], n: usize) -> Option<Vec<f64>> {
    if !log_det_symmetric(a, n).is_finite() {
        return None;
    }
    let inv = invert_symmetric_matrix(a, n);
    if (0..n).any(|i| !(inv[i * n + i] > 0.0)) {
        return None;
    }
    Some(inv)
}

/// `ln |A|` for symmetric positive definite `A`; `-inf` when `A` is singular
pub fn log_det_symmetric(a: &[f64], n: usize) -> f64 {
    let mut log_det = 0.0;
    let mut l = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[i * n + j];
            for k in 0..j {
                sum -= l[i * n + k] * l[j * n + k];
            }
            if i == j {
                if sum <= 0.0 {
                    return f64::NEG_INFINITY;
                }
                l[i * n + j] = sum.sqrt();
                log_det += sum.ln();
            } else {
                l[i * n + j] = sum / l[j * n + j];
            }
        }
    }
    log_det
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_median_and_mad() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        // deviations {1, 0, 1} -> median 1
        assert_relative_eq!(mad_squared(&[1.0, 2.0, 3.0]), 1.4826 * 1.4826, epsilon = 1e-12);
        assert_eq!(mad_squared(&[]), 0.0);
    }

    #[test]
    fn test_trigamma() {
        // trigamma(1) = pi^2 / 6
        let pi = std::f64::consts::PI;
        assert_relative_eq!(trigamma(1.0), pi * pi / 6.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(0.5), pi * pi / 2.0, epsilon = 1e-10);
        // trigamma(2) = pi^2 / 6 - 1
        assert_relative_eq!(trigamma(2.0), pi * pi / 6.0 - 1.0, epsilon = 1e-10);
        assert_relative_eq!(trigamma(20.0), 0.05127082, epsilon = 1e-7);
    }

    #[test]
    fn test_quantile_type7() {
        let x = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(quantile_type7(&x, 0.0), 1.0);
        assert_eq!(quantile_type7(&x, 1.0), 4.0);
        assert_relative_eq!(quantile_type7(&x, 0.5), 2.5);
        assert_relative_eq!(quantile_type7(&x, 0.25), 1.75);
    }

    #[test]
    fn test_trimmed_mean() {
        let x: Vec<f64> = (1..=10).map(|v| v as f64).chain([1000.0]).collect();
        // 11 values, trim 0.1 drops one from each tail
        assert_relative_eq!(trimmed_mean(&x, 0.1), 6.0, epsilon = 1e-12);
    }

    #[test]
    fn test_solve_and_invert() {
        let a = [4.0, 2.0, 2.0, 3.0];
        let x = solve_symmetric_system(&a, &[2.0, 1.0], 2);
        assert_relative_eq!(x[0], 0.5, epsilon = 1e-12);
        assert_relative_eq!(x[1], 0.0, epsilon = 1e-12);

        let inv = invert_symmetric_matrix(&a, 2);
        assert_relative_eq!(inv[0], 3.0 / 8.0, epsilon = 1e-12);
        assert_relative_eq!(inv[1], -2.0 / 8.0, epsilon = 1e-12);
        assert_relative_eq!(log_det_symmetric(&a, 2), 8.0_f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_invert_positive_definite() {
        let inv = invert_positive_definite(&[6.0, 2.0, 2.0, 10.0], 2).unwrap();
        assert_relative_eq!(inv[0], 10.0 / 56.0, epsilon = 1e-12);
        assert_relative_eq!(inv[3], 6.0 / 56.0, epsilon = 1e-12);
        assert_relative_eq!(inv[1], -2.0 / 56.0, epsilon = 1e-12);

        // indefinite
        assert!(invert_positive_definite(&[1.0, 2.0, 2.0, 1.0], 2).is_none());
        assert!(invert_positive_definite(&[0.0, 0.0, 0.0, 1.0], 2).is_none());
    }
}
