//! Preconditioned conjugate gradient for Hermitian positive semi-definite
//! operators.

use log::{debug, warn};
use ndarray::{Array, ArrayView, Dimension, Zip};
use rustfft::num_complex::Complex;

use crate::dtype::Real;
use crate::error::NumericalWarning;
use crate::operator::{LinearOperator, Preconditioner};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    /// Target for `‖r‖ / ‖b‖`.
    pub tolerance: f64,
    pub max_iterations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub relative_residual: f64,
    pub converged: bool,
    pub warning: Option<NumericalWarning>,
}

/// Real part of `<a, b> = Σ conj(a) b`, accumulated in f64.
fn dot_re<T: Real, D: Dimension>(a: &Array<Complex<T>, D>, b: &Array<Complex<T>, D>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| x.re.as_f64() * y.re.as_f64() + x.im.as_f64() * y.im.as_f64())
        .sum()
}

fn norm<T: Real, D: Dimension>(a: &Array<Complex<T>, D>) -> f64 {
    dot_re(a, a).sqrt()
}

/// `y += alpha * x`
fn axpy<T: Real, D: Dimension>(y: &mut Array<Complex<T>, D>, alpha: f64, x: &Array<Complex<T>, D>) {
    let alpha = T::of(alpha);
    Zip::from(y).and(x).for_each(|yi, &xi| *yi = *yi + xi * alpha);
}

/// Solves `A x = b` starting from zero.
///
/// Returns the iterate with the smallest residual seen. Hitting the
/// iteration ceiling or a breakdown is reported in [`SolveReport::warning`]
/// and logged, never raised.
pub fn conjugate_gradient<T, D, A>(
    op: &A,
    b: ArrayView<Complex<T>, D>,
    preconditioner: Option<&dyn Preconditioner<T, D>>,
    config: &SolverConfig,
) -> (Array<Complex<T>, D>, SolveReport)
where
    T: Real,
    D: Dimension,
    A: LinearOperator<T, Domain = D, Range = D>,
{
    let zero = Complex::new(T::zero(), T::zero());
    let mut x = Array::from_elem(b.raw_dim(), zero);
    let b_norm = norm(&b.to_owned());

    if b_norm == 0.0 {
        return (
            x,
            SolveReport {
                iterations: 0,
                relative_residual: 0.0,
                converged: true,
                warning: None,
            },
        );
    }

    let precondition = |r: &Array<Complex<T>, D>| match preconditioner {
        Some(m) => m.apply_inverse(r.view()),
        None => r.clone(),
    };

    let mut r = b.to_owned();
    let mut z = precondition(&r);
    let mut p = z.clone();
    let mut rz = dot_re(&r, &z);

    let mut best = x.clone();
    let mut best_residual = 1.0;
    let mut iterations = 0;
    let mut warning = None;

    while iterations < config.max_iterations {
        let ap = op.apply(p.view());
        let curvature = dot_re(&p, &ap);
        if !(curvature > 0.0 && curvature.is_finite() && rz.is_finite()) {
            warning = Some(NumericalWarning::Breakdown {
                iteration: iterations + 1,
            });
            break;
        }
        iterations += 1;

        let alpha = rz / curvature;
        axpy(&mut x, alpha, &p);
        axpy(&mut r, -alpha, &ap);

        let residual = norm(&r) / b_norm;
        debug!("cg iteration {iterations}: relative residual {residual:e}");
        if !residual.is_finite() {
            warning = Some(NumericalWarning::Breakdown {
                iteration: iterations,
            });
            break;
        }
        if residual < best_residual {
            best_residual = residual;
            best.assign(&x);
        }
        if residual < config.tolerance {
            break;
        }

        z = precondition(&r);
        let rz_next = dot_re(&r, &z);
        let beta = rz_next / rz;
        rz = rz_next;
        Zip::from(&mut p)
            .and(&z)
            .for_each(|pi, &zi| *pi = zi + *pi * T::of(beta));
    }

    let converged = best_residual < config.tolerance;
    if !converged && warning.is_none() {
        warning = Some(NumericalWarning::NotConverged {
            iterations,
            relative_residual: best_residual,
            tolerance: config.tolerance,
        });
    }
    if let Some(w) = &warning {
        warn!("{w}; returning best iterate (relative residual {best_residual:e})");
    }

    (
        best,
        SolveReport {
            iterations,
            relative_residual: best_residual,
            converged,
            warning,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, ArrayView1, Ix1};

    /// Dense Hermitian matrix acting on 1D complex vectors.
    struct Dense {
        m: Vec<Vec<Complex<f64>>>,
    }

    impl LinearOperator<f64> for Dense {
        type Domain = Ix1;
        type Range = Ix1;

        fn dims(&self) -> (usize, usize) {
            (self.m.len(), self.m.len())
        }

        fn apply(&self, x: ArrayView1<Complex<f64>>) -> Array1<Complex<f64>> {
            Array1::from_iter(
                self.m
                    .iter()
                    .map(|row| row.iter().zip(x.iter()).map(|(a, b)| a * b).sum::<Complex<f64>>()),
            )
        }

        fn adjoint_apply(&self, y: ArrayView1<Complex<f64>>) -> Array1<Complex<f64>> {
            self.apply(y)
        }
    }

    struct Diagonal(Vec<f64>);

    impl Preconditioner<f64, Ix1> for Diagonal {
        fn apply_inverse(&self, r: ArrayView1<Complex<f64>>) -> Array1<Complex<f64>> {
            Array1::from_iter(r.iter().zip(self.0.iter()).map(|(v, d)| *v / *d))
        }
    }

    fn spd(n: usize) -> Dense {
        // tridiagonal, diagonally dominant, with complex off-diagonals
        let mut m = vec![vec![Complex::new(0.0, 0.0); n]; n];
        for i in 0..n {
            m[i][i] = Complex::new(4.0 + i as f64, 0.0);
            if i + 1 < n {
                m[i][i + 1] = Complex::new(1.0, 0.5);
                m[i + 1][i] = Complex::new(1.0, -0.5);
            }
        }
        Dense { m }
    }

    #[test]
    fn solves_small_hermitian_system() {
        let op = spd(12);
        let truth = Array1::from_shape_fn(12, |i| Complex::new(i as f64 - 3.0, 0.5 * i as f64));
        let b = op.apply(truth.view());
        let config = SolverConfig {
            tolerance: 1e-12,
            max_iterations: 50,
        };

        let (x, report) = conjugate_gradient(&op, b.view(), None, &config);
        assert!(report.converged, "{report:?}");
        assert!(report.warning.is_none());
        for (a, e) in x.iter().zip(truth.iter()) {
            assert!((a - e).norm() < 1e-9);
        }
    }

    #[test]
    fn preconditioner_does_not_change_the_solution() {
        let op = spd(20);
        let truth = Array1::from_shape_fn(20, |i| Complex::new((i as f64).sin(), 1.0));
        let b = op.apply(truth.view());
        let config = SolverConfig {
            tolerance: 1e-12,
            max_iterations: 60,
        };
        let jacobi = Diagonal((0..20).map(|i| 4.0 + i as f64).collect());

        let (x, report) = conjugate_gradient(&op, b.view(), Some(&jacobi), &config);
        assert!(report.converged);
        for (a, e) in x.iter().zip(truth.iter()) {
            assert!((a - e).norm() < 1e-9);
        }
    }

    #[test]
    fn iteration_ceiling_returns_finite_estimate_with_warning() {
        let op = spd(30);
        let b = Array1::from_elem(30, Complex::new(1.0, -1.0));
        let config = SolverConfig {
            tolerance: 1e-14,
            max_iterations: 1,
        };

        let (x, report) = conjugate_gradient(&op, b.view(), None, &config);
        assert!(!report.converged);
        assert_eq!(report.iterations, 1);
        assert!(matches!(report.warning, Some(NumericalWarning::NotConverged { .. })));
        assert!(x.iter().all(|v| v.re.is_finite() && v.im.is_finite()));
        assert!(report.relative_residual < 1.0);
    }

    #[test]
    fn zero_rhs_is_trivially_solved() {
        let op = spd(5);
        let b = Array1::from_elem(5, Complex::new(0.0, 0.0));
        let config = SolverConfig {
            tolerance: 1e-6,
            max_iterations: 10,
        };
        let (x, report) = conjugate_gradient(&op, b.view(), None, &config);
        assert!(report.converged);
        assert_eq!(report.iterations, 0);
        assert!(x.iter().all(|v| v.norm() == 0.0));
    }
}
