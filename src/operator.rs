//! Implicit linear operators for the Fourier-domain least-squares problem.

use ndarray::{Array, Array3, Array4, ArrayView, ArrayView2, ArrayView3, ArrayView4, Dimension, Ix3, Ix4, Zip};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dtype::Real;
use crate::projector::{Pose, Projector};

/// A linear map that is only ever applied, never stored.
pub trait LinearOperator<T: Real> {
    type Domain: Dimension;
    type Range: Dimension;

    /// `(rows, cols)` of the equivalent dense matrix.
    fn dims(&self) -> (usize, usize);

    fn apply(&self, x: ArrayView<Complex<T>, Self::Domain>) -> Array<Complex<T>, Self::Range>;

    fn adjoint_apply(&self, y: ArrayView<Complex<T>, Self::Range>) -> Array<Complex<T>, Self::Domain>;
}

/// Approximate inverse of an operator, applied to residuals.
pub trait Preconditioner<T: Real, D: Dimension> {
    fn apply_inverse(&self, r: ArrayView<Complex<T>, D>) -> Array<Complex<T>, D>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreconditionerKind {
    None,
    #[default]
    Jacobi,
}

/// `x (C, L, L, L) -> slices (N, L, L)`, slice `i` being
/// `Σ_c w[i, c] Pᵢ x_c`.
pub struct ProjectionOperator<'a, T: Real> {
    projector: &'a Projector,
    poses: &'a [Pose],
    weights: ArrayView2<'a, T>,
}

impl<'a, T: Real> ProjectionOperator<'a, T> {
    pub fn new(projector: &'a Projector, poses: &'a [Pose], weights: ArrayView2<'a, T>) -> Self {
        debug_assert_eq!(weights.shape()[0], poses.len());
        Self {
            projector,
            poses,
            weights,
        }
    }

    pub fn n_vols(&self) -> usize {
        self.weights.shape()[1]
    }

    fn backproject(&self, y: ArrayView3<Complex<T>>, compensated: bool) -> Array4<Complex<T>> {
        let volumes = self
            .projector
            .backproject_weighted(y, self.poses, self.weights, compensated);
        stack(volumes, self.projector.resolution())
    }
}

fn stack<T: Real>(volumes: Vec<Array3<Complex<T>>>, len: usize) -> Array4<Complex<T>> {
    let zero = Complex::new(T::zero(), T::zero());
    let mut out = Array4::from_elem((volumes.len(), len, len, len), zero);
    for (mut dst, src) in out.outer_iter_mut().zip(volumes.iter()) {
        dst.assign(src);
    }
    out
}

impl<T: Real> LinearOperator<T> for ProjectionOperator<'_, T> {
    type Domain = Ix4;
    type Range = Ix3;

    fn dims(&self) -> (usize, usize) {
        let len = self.projector.resolution();
        (self.poses.len() * len * len, self.n_vols() * len * len * len)
    }

    fn apply(&self, x: ArrayView4<Complex<T>>) -> Array3<Complex<T>> {
        let volumes: Vec<_> = x.outer_iter().collect();
        self.projector
            .project_weighted(&volumes, self.poses, self.weights)
    }

    fn adjoint_apply(&self, y: ArrayView3<Complex<T>>) -> Array4<Complex<T>> {
        self.backproject(y, false)
    }
}

/// `A x = Σ_i w_ic Pᵢᴴ D (Σ_c' w_ic' Pᵢ x_c') + λ x`: Hermitian positive
/// semi-definite, so `adjoint_apply` is `apply`.
pub struct NormalEquations<'a, T: Real> {
    forward: ProjectionOperator<'a, T>,
    regularization: f64,
}

impl<'a, T: Real> NormalEquations<'a, T> {
    pub fn new(forward: ProjectionOperator<'a, T>, regularization: f64) -> Self {
        Self {
            forward,
            regularization,
        }
    }

    /// Right-hand side `b_c = Σ_i w_ic Pᵢᴴ D yᵢ` for observed slices `y`.
    pub fn right_hand_side(&self, slices: ArrayView3<Complex<T>>) -> Array4<Complex<T>> {
        self.forward.backproject(slices, true)
    }

    /// Jacobi preconditioner built from the exact diagonal of this operator.
    pub fn jacobi(&self) -> JacobiPreconditioner {
        let mut diagonal = self
            .forward
            .projector
            .normal_diagonal(self.forward.poses, self.forward.weights);
        if self.regularization > 0.0 {
            diagonal.mapv_inplace(|d| d + self.regularization);
        }
        JacobiPreconditioner::from_diagonal(diagonal)
    }
}

impl<T: Real> LinearOperator<T> for NormalEquations<'_, T> {
    type Domain = Ix4;
    type Range = Ix4;

    fn dims(&self) -> (usize, usize) {
        let n = self.forward.dims().1;
        (n, n)
    }

    fn apply(&self, x: ArrayView4<Complex<T>>) -> Array4<Complex<T>> {
        let slices = self.forward.apply(x);
        let mut out = self.forward.backproject(slices.view(), true);
        if self.regularization > 0.0 {
            let lambda = T::of(self.regularization);
            Zip::from(&mut out).and(&x).for_each(|o, &v| *o = *o + v * lambda);
        }
        out
    }

    fn adjoint_apply(&self, y: ArrayView4<Complex<T>>) -> Array4<Complex<T>> {
        self.apply(y)
    }
}

/// Elementwise inverse of the operator diagonal; entries never sampled
/// stay zero.
#[derive(Debug, Clone)]
pub struct JacobiPreconditioner {
    inverse: Array4<f64>,
}

impl JacobiPreconditioner {
    pub fn from_diagonal(diagonal: Array4<f64>) -> Self {
        let peak = diagonal.iter().cloned().fold(0.0f64, f64::max);
        let floor = peak * 1e-12;
        let inverse = diagonal.mapv(|d| if d > floor { 1.0 / d } else { 0.0 });
        Self { inverse }
    }

    /// Number of voxels the preconditioner keeps pinned at zero.
    pub fn n_unsampled(&self) -> usize {
        self.inverse.iter().filter(|&&v| v == 0.0).count()
    }
}

impl<T: Real> Preconditioner<T, Ix4> for JacobiPreconditioner {
    fn apply_inverse(&self, r: ArrayView4<Complex<T>>) -> Array4<Complex<T>> {
        let mut out = r.to_owned();
        Zip::from(&mut out)
            .and(&self.inverse)
            .for_each(|o, &inv| *o = *o * T::of(inv));
        out
    }
}
