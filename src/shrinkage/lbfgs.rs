//! Limited-memory BFGS with a strong-Wolfe backtracking line search

use std::collections::VecDeque;

/// Optimizer settings
#[derive(Debug, Clone, Copy)]
pub(crate) struct LbfgsSettings {
    pub max_iter: usize,
    /// Gradient-norm and relative objective tolerance
    pub epsilon: f64,
    /// Number of correction pairs kept
    pub memory: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LbfgsResult {
    pub value: f64,
    pub iterations: usize,
    pub converged: bool,
}

const FTOL: f64 = 1e-4;
const WOLFE: f64 = 0.9;
const STEP_DEC: f64 = 0.5;
const STEP_INC: f64 = 2.1;
const MAX_LINESEARCH: usize = 100;

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Minimize `f_grad` in place starting from `x`.
///
/// `f_grad(x, grad)` returns the objective and writes the gradient. On a failed
/// line search `x` is left at the last trial point and `converged` is false.
pub(crate) fn lbfgs_minimize<F>(f_grad: F, x: &mut [f64], settings: &LbfgsSettings) -> LbfgsResult
where
    F: Fn(&[f64], &mut [f64]) -> f64,
{
    let n = x.len();
    let m = settings.memory.max(1);
    let epsilon = settings.epsilon;

    let mut s_hist: VecDeque<Vec<f64>> = VecDeque::with_capacity(m);
    let mut y_hist: VecDeque<Vec<f64>> = VecDeque::with_capacity(m);
    let mut rho_hist: VecDeque<f64> = VecDeque::with_capacity(m);

    let mut grad = vec![0.0; n];
    let mut fx = f_grad(x, &mut grad);
    let mut f_past = fx;

    if norm(&grad) <= epsilon || norm(&grad) <= epsilon * norm(x) {
        return LbfgsResult {
            value: fx,
            iterations: 0,
            converged: true,
        };
    }

    let mut drt: Vec<f64> = grad.iter().map(|g| -g).collect();
    let mut step = 1.0 / norm(&drt);

    let mut xp = vec![0.0; n];
    let mut gradp = vec![0.0; n];

    let mut k = 1;
    loop {
        xp.copy_from_slice(x);
        gradp.copy_from_slice(&grad);
        let dg_init = dot(&grad, &drt);
        let fx_init = fx;

        let mut accepted = false;
        for _ in 0..MAX_LINESEARCH {
            for i in 0..n {
                x[i] = xp[i] + step * drt[i];
            }
            fx = f_grad(x, &mut grad);

            let width = if fx.is_nan() || fx > fx_init + step * FTOL * dg_init {
                STEP_DEC
            } else {
                let dg = dot(&grad, &drt);
                if dg < WOLFE * dg_init {
                    STEP_INC
                } else if dg > -WOLFE * dg_init {
                    STEP_DEC
                } else {
                    accepted = true;
                    break;
                }
            };
            step *= width;
        }

        if !accepted {
            return LbfgsResult {
                value: fx,
                iterations: k,
                converged: false,
            };
        }

        let gnorm = norm(&grad);
        if gnorm <= epsilon || gnorm <= epsilon * norm(x) {
            return LbfgsResult {
                value: fx,
                iterations: k,
                converged: true,
            };
        }

        let scale = fx.abs().max(f_past.abs()).max(1.0);
        if (f_past - fx).abs() <= epsilon * scale {
            return LbfgsResult {
                value: fx,
                iterations: k,
                converged: true,
            };
        }
        f_past = fx;

        if k >= settings.max_iter {
            return LbfgsResult {
                value: fx,
                iterations: k,
                converged: false,
            };
        }

        let s: Vec<f64> = (0..n).map(|i| x[i] - xp[i]).collect();
        let y: Vec<f64> = (0..n).map(|i| grad[i] - gradp[i]).collect();
        let sy = dot(&s, &y);
        if sy > f64::EPSILON * dot(&y, &y) {
            if s_hist.len() >= m {
                s_hist.pop_front();
                y_hist.pop_front();
                rho_hist.pop_front();
            }
            rho_hist.push_back(1.0 / sy);
            s_hist.push_back(s);
            y_hist.push_back(y);
        }

        drt = grad.iter().map(|g| -g).collect();
        two_loop_recursion(&mut drt, &s_hist, &y_hist, &rho_hist);

        step = 1.0;
        k += 1;
    }
}

/// Turn `d = -g` into `d = -H g` using the stored correction pairs
fn two_loop_recursion(
    d: &mut [f64],
    s_hist: &VecDeque<Vec<f64>>,
    y_hist: &VecDeque<Vec<f64>>,
    rho_hist: &VecDeque<f64>,
) {
    let m = s_hist.len();
    if m == 0 {
        return;
    }

    let mut alpha = vec![0.0; m];
    for i in (0..m).rev() {
        alpha[i] = rho_hist[i] * dot(&s_hist[i], d);
        for j in 0..d.len() {
            d[j] -= alpha[i] * y_hist[i][j];
        }
    }

    let last = m - 1;
    let yy = dot(&y_hist[last], &y_hist[last]);
    let gamma = if yy > 0.0 {
        dot(&y_hist[last], &s_hist[last]) / yy
    } else {
        1.0
    };
    for dj in d.iter_mut() {
        *dj *= gamma;
    }

    for i in 0..m {
        let beta = rho_hist[i] * dot(&y_hist[i], d);
        for j in 0..d.len() {
            d[j] += s_hist[i][j] * (alpha[i] - beta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: LbfgsSettings = LbfgsSettings {
        max_iter: 1000,
        epsilon: 1e-10,
        memory: 6,
    };

    #[test]
    fn test_lbfgs_rosenbrock() {
        let mut x = vec![-1.0, -1.0];
        let result = lbfgs_minimize(
            |x, g| {
                let t1 = 1.0 - x[0];
                let t2 = x[1] - x[0] * x[0];
                g[0] = -2.0 * t1 - 400.0 * x[0] * t2;
                g[1] = 200.0 * t2;
                t1 * t1 + 100.0 * t2 * t2
            },
            &mut x,
            &SETTINGS,
        );

        assert!(result.converged);
        assert!((x[0] - 1.0).abs() < 1e-4, "x[0] = {}", x[0]);
        assert!((x[1] - 1.0).abs() < 1e-4, "x[1] = {}", x[1]);
    }

    #[test]
    fn test_lbfgs_quadratic() {
        let mut x = vec![5.0, 3.0];
        let result = lbfgs_minimize(
            |x, g| {
                g[0] = 2.0 * x[0];
                g[1] = 4.0 * x[1];
                x[0] * x[0] + 2.0 * x[1] * x[1]
            },
            &mut x,
            &SETTINGS,
        );

        assert!(result.converged);
        assert!(x[0].abs() < 1e-5);
        assert!(x[1].abs() < 1e-5);
    }

    #[test]
    fn test_already_at_minimum() {
        let mut x = vec![0.0];
        let result = lbfgs_minimize(
            |x, g| {
                g[0] = 2.0 * x[0];
                x[0] * x[0]
            },
            &mut x,
            &SETTINGS,
        );
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
    }
}
