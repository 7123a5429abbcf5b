//! Central-slice projection and its adjoint.
//!
//! Image frequency `(ku, kv)` of pose `R` samples the centered volume
//! spectrum at `q = ku * R[:, 0] + kv * R[:, 1]` with a trilinear kernel.
//! Back-projection spreads with the very same weights, so the pair is an
//! exact adjoint up to rounding. Only frequencies inside the disk of radius
//! `(L - 1) / 2` are sampled: every trilinear neighbour then lies in the
//! symmetric index range and real volumes project to real images.

use std::f64::consts::PI;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayViewMut2, Axis};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dtype::Real;
use crate::rotation::Rotation;
use crate::utils::centered;

/// Fixed number of partial accumulators in a back-projection, so the
/// summation order does not depend on the thread count.
const REDUCTION_CHUNKS: usize = 16;

/// Weighting applied to slice samples before they are accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DensityCompensation {
    None,
    /// `max(|k|, 1/2)`: cancels the `1/|k|` density of central slices.
    #[default]
    Radial,
}

/// Geometry of one image: orientation, in-plane shift (pixels), amplitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Rotation,
    pub offset: [f64; 2],
    pub amplitude: f64,
}

impl Pose {
    pub fn from_rotation(rotation: Rotation) -> Self {
        Self {
            rotation,
            offset: [0.0, 0.0],
            amplitude: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    row: usize,
    col: usize,
    ku: f64,
    kv: f64,
    density: f64,
}

/// Eight trilinear neighbours; out-of-grid corners carry zero weight.
struct Stencil {
    index: [[usize; 3]; 8],
    weight: [f64; 8],
}

impl Stencil {
    fn at(q: [f64; 3], len: usize) -> Self {
        let half = (len / 2) as f64;
        let mut index = [[0usize; 3]; 8];
        let mut weight = [0.0; 8];

        let pos = [q[0] + half, q[1] + half, q[2] + half];
        let base = pos.map(|p| p.floor());
        let frac = [pos[0] - base[0], pos[1] - base[1], pos[2] - base[2]];

        for corner in 0..8 {
            let d = [corner >> 2 & 1, corner >> 1 & 1, corner & 1];
            let mut w = 1.0;
            let mut inside = true;
            for axis in 0..3 {
                let i = base[axis] as isize + d[axis] as isize;
                if i < 0 || i >= len as isize {
                    inside = false;
                    break;
                }
                index[corner][axis] = i as usize;
                w *= if d[axis] == 1 { frac[axis] } else { 1.0 - frac[axis] };
            }
            weight[corner] = if inside { w } else { 0.0 };
        }
        Self { index, weight }
    }

    fn iter(&self) -> impl Iterator<Item = ([usize; 3], f64)> + '_ {
        self.index
            .iter()
            .zip(self.weight.iter())
            .filter(|&(_, &w)| w != 0.0)
            .map(|(i, &w)| (*i, w))
    }
}

/// Projection / back-projection pair for one grid size.
#[derive(Debug, Clone)]
pub struct Projector {
    resolution: usize,
    samples: Vec<Sample>,
}

impl Projector {
    pub fn new(resolution: usize, density: DensityCompensation) -> Self {
        let radius = (resolution.saturating_sub(1) / 2) as f64;
        let mut samples = Vec::new();
        for row in 0..resolution {
            for col in 0..resolution {
                let (ku, kv) = (centered(row, resolution), centered(col, resolution));
                let k = (ku * ku + kv * kv).sqrt();
                if k <= radius {
                    let density = match density {
                        DensityCompensation::None => 1.0,
                        DensityCompensation::Radial => k.max(0.5),
                    };
                    samples.push(Sample {
                        row,
                        col,
                        ku,
                        kv,
                        density,
                    });
                }
            }
        }
        Self {
            resolution,
            samples,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    /// Number of sampled frequencies per slice.
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Density compensation factor on the slice grid, zero outside the
    /// sampled disk.
    pub fn density_weights(&self) -> Array2<f64> {
        let mut out = Array2::zeros((self.resolution, self.resolution));
        for s in &self.samples {
            out[[s.row, s.col]] = s.density;
        }
        out
    }

    fn modulation<T: Real>(&self, sample: &Sample, pose: &Pose) -> Complex<T> {
        let phase = -2.0 * PI * (sample.ku * pose.offset[0] + sample.kv * pose.offset[1])
            / self.resolution as f64;
        Complex::new(
            T::of(pose.amplitude * phase.cos()),
            T::of(pose.amplitude * phase.sin()),
        )
    }

    fn stencil(&self, sample: &Sample, rotation: &Rotation) -> Stencil {
        // image plane w = 0 carried into the volume frame
        let q = rotation.apply([sample.ku, sample.kv, 0.0]);
        Stencil::at(q, self.resolution)
    }

    /// Central slices of a centered spectrum, shape `(N, L, L)`.
    pub fn project<T: Real>(&self, volume: ArrayView3<Complex<T>>, poses: &[Pose]) -> Array3<Complex<T>> {
        let ones = Array2::from_elem((poses.len(), 1), T::one());
        self.project_weighted(&[volume], poses, ones.view())
    }

    /// Slices of `Σ_c w[i, c] · volumes[c]` for every pose `i`.
    pub fn project_weighted<T: Real>(
        &self,
        volumes: &[ArrayView3<Complex<T>>],
        poses: &[Pose],
        weights: ArrayView2<T>,
    ) -> Array3<Complex<T>> {
        let len = self.resolution;
        let zero = Complex::new(T::zero(), T::zero());
        let mut out = Array3::from_elem((poses.len(), len, len), zero);

        out.axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(poses.par_iter())
            .enumerate()
            .for_each(|(i, (slice, pose))| {
                self.project_one(volumes, pose, weights.row(i), slice);
            });
        out
    }

    fn project_one<T: Real>(
        &self,
        volumes: &[ArrayView3<Complex<T>>],
        pose: &Pose,
        weights: ndarray::ArrayView1<T>,
        mut slice: ArrayViewMut2<Complex<T>>,
    ) {
        let zero = Complex::new(T::zero(), T::zero());
        for sample in &self.samples {
            let stencil = self.stencil(sample, &pose.rotation);
            let mut value = zero;
            for (volume, &w_c) in volumes.iter().zip(weights.iter()) {
                if w_c == T::zero() {
                    continue;
                }
                let mut acc = zero;
                for (idx, w) in stencil.iter() {
                    acc = acc + volume[idx] * T::of(w);
                }
                value = value + acc * w_c;
            }
            slice[[sample.row, sample.col]] = value * self.modulation::<T>(sample, pose);
        }
    }

    /// Exact adjoint of [`Projector::project`], each slice scaled by its
    /// entry in `weights`.
    pub fn backproject<T: Real>(
        &self,
        slices: ArrayView3<Complex<T>>,
        poses: &[Pose],
        weights: &[T],
    ) -> Array3<Complex<T>> {
        let weights = Array2::from_shape_fn((weights.len(), 1), |(i, _)| weights[i]);
        self.accumulate(slices, poses, weights.view(), false)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.zeros())
    }

    /// Back-projection of density-compensated slices: `Pᴴ D`.
    pub fn backproject_compensated<T: Real>(
        &self,
        slices: ArrayView3<Complex<T>>,
        poses: &[Pose],
        weights: &[T],
    ) -> Array3<Complex<T>> {
        let weights = Array2::from_shape_fn((weights.len(), 1), |(i, _)| weights[i]);
        self.accumulate(slices, poses, weights.view(), true)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.zeros())
    }

    /// One back-projected volume per column of `weights` (`N × C`).
    pub fn backproject_weighted<T: Real>(
        &self,
        slices: ArrayView3<Complex<T>>,
        poses: &[Pose],
        weights: ArrayView2<T>,
        compensated: bool,
    ) -> Vec<Array3<Complex<T>>> {
        self.accumulate(slices, poses, weights, compensated)
    }

    fn zeros<T: Real>(&self) -> Array3<Complex<T>> {
        let len = self.resolution;
        Array3::from_elem((len, len, len), Complex::new(T::zero(), T::zero()))
    }

    fn accumulate<T: Real>(
        &self,
        slices: ArrayView3<Complex<T>>,
        poses: &[Pose],
        weights: ArrayView2<T>,
        compensated: bool,
    ) -> Vec<Array3<Complex<T>>> {
        let n = poses.len();
        let n_vols = weights.shape()[1];
        let chunk = n.div_ceil(REDUCTION_CHUNKS).max(1);

        let partials: Vec<Vec<Array3<Complex<T>>>> = (0..n.div_ceil(chunk))
            .into_par_iter()
            .map(|c| {
                let mut acc: Vec<_> = (0..n_vols).map(|_| self.zeros()).collect();
                for i in c * chunk..((c + 1) * chunk).min(n) {
                    self.spread_one(
                        &mut acc,
                        slices.index_axis(Axis(0), i),
                        &poses[i],
                        weights.row(i),
                        compensated,
                    );
                }
                acc
            })
            .collect();

        let mut total: Vec<_> = (0..n_vols).map(|_| self.zeros()).collect();
        for partial in partials {
            for (t, p) in total.iter_mut().zip(partial) {
                *t += &p;
            }
        }
        total
    }

    fn spread_one<T: Real>(
        &self,
        acc: &mut [Array3<Complex<T>>],
        slice: ArrayView2<Complex<T>>,
        pose: &Pose,
        weights: ndarray::ArrayView1<T>,
        compensated: bool,
    ) {
        for sample in &self.samples {
            let mut value = slice[[sample.row, sample.col]] * self.modulation::<T>(sample, pose).conj();
            if compensated {
                value = value * T::of(sample.density);
            }
            let stencil = self.stencil(sample, &pose.rotation);
            for (volume, &w_c) in acc.iter_mut().zip(weights.iter()) {
                if w_c == T::zero() {
                    continue;
                }
                let v = value * w_c;
                for (idx, w) in stencil.iter() {
                    volume[idx] = volume[idx] + v * T::of(w);
                }
            }
        }
    }

    /// Diagonal of `Σ_i w[i, c]² Pᵢᴴ D Pᵢ` for every channel, shape
    /// `(C, L, L, L)`.
    pub fn normal_diagonal<T: Real>(&self, poses: &[Pose], weights: ArrayView2<T>) -> Array4<f64> {
        let len = self.resolution;
        let n = poses.len();
        let n_vols = weights.shape()[1];
        let chunk = n.div_ceil(REDUCTION_CHUNKS).max(1);

        let partials: Vec<Array4<f64>> = (0..n.div_ceil(chunk))
            .into_par_iter()
            .map(|c| {
                let mut acc = Array4::zeros((n_vols, len, len, len));
                for i in c * chunk..((c + 1) * chunk).min(n) {
                    let pose = &poses[i];
                    let a2 = pose.amplitude * pose.amplitude;
                    for sample in &self.samples {
                        let stencil = self.stencil(sample, &pose.rotation);
                        for (ch, &w_c) in weights.row(i).iter().enumerate() {
                            let w_c = w_c.as_f64();
                            let scale = w_c * w_c * a2 * sample.density;
                            if scale == 0.0 {
                                continue;
                            }
                            for ([x, y, z], w) in stencil.iter() {
                                acc[[ch, x, y, z]] += scale * w * w;
                            }
                        }
                    }
                }
                acc
            })
            .collect();

        let mut total = Array4::zeros((n_vols, len, len, len));
        for p in partials {
            total += &p;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand_distr::StandardNormal;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_spectrum(len: usize, rng: &mut StdRng) -> Array3<Complex<f64>> {
        Array3::from_shape_fn((len, len, len), |_| {
            Complex::new(rng.sample(StandardNormal), rng.sample(StandardNormal))
        })
    }

    fn random_slices(n: usize, len: usize, rng: &mut StdRng) -> Array3<Complex<f64>> {
        Array3::from_shape_fn((n, len, len), |_| {
            Complex::new(rng.sample(StandardNormal), rng.sample(StandardNormal))
        })
    }

    fn inner<D: ndarray::Dimension>(
        a: &ndarray::Array<Complex<f64>, D>,
        b: &ndarray::Array<Complex<f64>, D>,
    ) -> Complex<f64> {
        a.iter().zip(b.iter()).map(|(x, y)| x.conj() * y).sum()
    }

    fn poses(n: usize, seed: u64) -> Vec<Pose> {
        let mut rng = StdRng::seed_from_u64(seed);
        Rotation::generate_random(n, seed)
            .into_iter()
            .map(|rotation| Pose {
                rotation,
                offset: [rng.gen_range(-2.0..2.0), rng.gen_range(-2.0..2.0)],
                amplitude: rng.gen_range(0.5..1.5),
            })
            .collect()
    }

    #[test]
    fn backprojection_is_the_adjoint() {
        for len in [8usize, 9] {
            let mut rng = StdRng::seed_from_u64(3);
            let projector = Projector::new(len, DensityCompensation::None);
            let poses = poses(7, 11);
            let volume = random_spectrum(len, &mut rng);
            let images = random_slices(poses.len(), len, &mut rng);

            let lhs = inner(&projector.project(volume.view(), &poses), &images);
            let rhs = inner(&volume, &projector.backproject(images.view(), &poses, &[1.0; 7]));
            let scale = lhs.norm().max(1.0);
            assert!((lhs - rhs).norm() / scale < 1e-10, "L={len}: {lhs} vs {rhs}");
        }
    }

    #[test]
    fn compensated_backprojection_is_adjoint_under_density_weights() {
        let len = 10;
        let mut rng = StdRng::seed_from_u64(4);
        let projector = Projector::new(len, DensityCompensation::Radial);
        let poses = poses(5, 2);
        let volume = random_spectrum(len, &mut rng);
        let mut images = random_slices(poses.len(), len, &mut rng);

        let lhs_back = projector.backproject_compensated(images.view(), &poses, &[1.0; 5]);
        let rhs = inner(&volume, &lhs_back);

        let density = projector.density_weights();
        for mut image in images.outer_iter_mut() {
            image.zip_mut_with(&density, |v, &d| *v = *v * d);
        }
        let lhs = inner(&projector.project(volume.view(), &poses), &images);
        assert!((lhs - rhs).norm() / lhs.norm().max(1.0) < 1e-10);
    }

    #[test]
    fn projection_is_linear() {
        let len = 8;
        let mut rng = StdRng::seed_from_u64(5);
        let projector = Projector::new(len, DensityCompensation::None);
        let poses = poses(4, 9);
        let v1 = random_spectrum(len, &mut rng);
        let v2 = random_spectrum(len, &mut rng);
        let (a, b) = (Complex::new(0.3, -1.2), Complex::new(-2.0, 0.5));

        let combined = v1.mapv(|x| x * a) + v2.mapv(|x| x * b);
        let lhs = projector.project(combined.view(), &poses);
        let rhs = projector.project(v1.view(), &poses).mapv(|x| x * a)
            + projector.project(v2.view(), &poses).mapv(|x| x * b);
        for (x, y) in lhs.iter().zip(rhs.iter()) {
            assert!((x - y).norm() < 1e-10);
        }

        let s1 = random_slices(4, len, &mut rng);
        let s2 = random_slices(4, len, &mut rng);
        let combined = s1.mapv(|x| x * a) + s2.mapv(|x| x * b);
        let ones = [1.0; 4];
        let lhs = projector.backproject(combined.view(), &poses, &ones);
        let rhs = projector.backproject(s1.view(), &poses, &ones).mapv(|x| x * a)
            + projector.backproject(s2.view(), &poses, &ones).mapv(|x| x * b);
        for (x, y) in lhs.iter().zip(rhs.iter()) {
            assert!((x - y).norm() < 1e-9);
        }
    }

    #[test]
    fn identity_pose_slices_the_kz_zero_plane() {
        let len = 8;
        let projector = Projector::new(len, DensityCompensation::None);
        let volume = Array3::from_shape_fn((len, len, len), |(i, j, k)| {
            Complex::new((i * 100 + j * 10 + k) as f64, 0.0)
        });
        let slices = projector.project(volume.view(), &[Pose::from_rotation(Rotation::identity())]);
        let half = len / 2;
        // inside the sampled disk the slice is the k = L/2 plane; outside it is zero
        assert_eq!(slices[[0, half, half]].re, (half * 111) as f64);
        assert_eq!(slices[[0, half + 2, half - 1]].re, volume[[half + 2, half - 1, half]].re);
        assert_eq!(slices[[0, 0, 0]], Complex::new(0.0, 0.0));
    }

    #[test]
    fn axis_aligned_slices_match_line_integrals() {
        use crate::fourier::CenteredFft;

        let len = 10;
        let mut rng = StdRng::seed_from_u64(12);
        let volume = Array3::from_shape_fn((len, len, len), |_| rng.gen::<f64>());
        let fft = CenteredFft::<f64>::new(len);
        let spectrum = fft.fft3(volume.view());
        let projector = Projector::new(len, DensityCompensation::None);
        let disk = projector.density_weights();

        // identity integrates along z; a quarter turn about x sends v to z and integrates along y
        let cases = [
            (Rotation::identity(), volume.sum_axis(Axis(2))),
            (Rotation::about_axis([1.0, 0.0, 0.0], PI / 2.0), volume.sum_axis(Axis(1))),
        ];
        for (rotation, summed) in cases {
            let expected = fft.fft2(summed.view());
            let slices = projector.project(spectrum.view(), &[Pose::from_rotation(rotation)]);
            for ((idx, &w), e) in disk.indexed_iter().zip(expected.iter()) {
                if w > 0.0 {
                    let got = slices[[0, idx.0, idx.1]];
                    assert!((got - e).norm() < 1e-9, "{idx:?}: {got} vs {e}");
                }
            }
        }
    }

    #[test]
    fn diagonal_matches_operator_on_unit_vectors() {
        let len = 6;
        let projector = Projector::new(len, DensityCompensation::Radial);
        let poses = poses(3, 1);
        let weights = Array2::from_elem((3, 1), 1.0);
        let diag = projector.normal_diagonal(&poses, weights.view());

        let half = len / 2;
        for voxel in [[half, half, half], [half + 1, half, half - 1], [half - 2, half + 1, half]] {
            let mut e = Array3::from_elem((len, len, len), Complex::new(0.0, 0.0));
            e[voxel] = Complex::new(1.0, 0.0);
            let slices = projector.project(e.view(), &poses);
            let back = projector.backproject_compensated(slices.view(), &poses, &[1.0; 3]);
            let [x, y, z] = voxel;
            assert!((back[voxel].re - diag[[0, x, y, z]]).abs() < 1e-10);
        }
    }

    #[test]
    fn radial_density_floor() {
        let projector = Projector::new(8, DensityCompensation::Radial);
        let d = projector.density_weights();
        assert_eq!(d[[4, 4]], 0.5);
        assert_eq!(d[[4, 7]], 3.0);
        assert_eq!(d[[0, 0]], 0.0);
        assert_eq!(projector.n_samples(), d.iter().filter(|&&w| w > 0.0).count());
    }
}
