//! Centered discrete Fourier transforms.
//!
//! Sample `p` of an axis of length `L` sits at centered coordinate
//! `p - L/2`, in both the spatial and the frequency domain. The forward
//! transform is unnormalized, the inverse carries the `1/L` per axis.

use std::sync::Arc;

use ndarray::{Array, Array2, Array3, ArrayView2, ArrayView3, Axis, Dimension};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::dtype::Real;

/// Forward and inverse plans for one axis length, shared by every axis.
pub struct CenteredFft<T: Real> {
    len: usize,
    forward: Arc<dyn Fft<T>>,
    inverse: Arc<dyn Fft<T>>,
}

impl<T: Real> CenteredFft<T> {
    pub fn new(len: usize) -> Self {
        let mut planner = FftPlanner::new();
        let forward = planner.plan_fft_forward(len);
        let inverse = planner.plan_fft_inverse(len);
        Self {
            len,
            forward,
            inverse,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn fft2(&self, image: ArrayView2<T>) -> Array2<Complex<T>> {
        let mut out = image.mapv(|x| Complex::new(x, T::zero()));
        self.transform(&mut out, false);
        out
    }

    pub fn ifft2(&self, slice: ArrayView2<Complex<T>>) -> Array2<Complex<T>> {
        let mut out = slice.to_owned();
        self.transform(&mut out, true);
        out
    }

    pub fn fft3(&self, volume: ArrayView3<T>) -> Array3<Complex<T>> {
        let mut out = volume.mapv(|x| Complex::new(x, T::zero()));
        self.transform(&mut out, false);
        out
    }

    pub fn ifft3(&self, spectrum: ArrayView3<Complex<T>>) -> Array3<Complex<T>> {
        let mut out = spectrum.to_owned();
        self.transform(&mut out, true);
        out
    }

    /// In-place transform along every axis of `data`.
    pub fn transform<D: Dimension>(&self, data: &mut Array<Complex<T>, D>, inverse: bool) {
        debug_assert!(data.shape().iter().all(|&n| n == self.len));

        let len = self.len;
        let half = len / 2;
        let plan = if inverse { &self.inverse } else { &self.forward };
        let scale = T::of(1.0 / len as f64);
        let mut buf = vec![Complex::new(T::zero(), T::zero()); len];

        for axis in 0..data.ndim() {
            for mut lane in data.lanes_mut(Axis(axis)) {
                // centered position p <-> DFT index (p - L/2) mod L
                for (p, value) in lane.iter().enumerate() {
                    buf[(p + len - half) % len] = *value;
                }
                plan.process(&mut buf);
                for (p, value) in lane.iter_mut().enumerate() {
                    let v = buf[(p + len - half) % len];
                    *value = if inverse { v * scale } else { v };
                }
            }
        }
    }
}
