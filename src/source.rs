//! Image sources: the stack of projection images an estimator consumes.

use std::sync::OnceLock;

use ndarray::{Array2, Array3, ArrayView3, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dtype::{Dtype, Real};
use crate::error::{ReconError, Result};
use crate::fourier::CenteredFft;
use crate::projector::{DensityCompensation, Pose, Projector};
use crate::rotation::Rotation;
use crate::volume::Volume;

/// Ordered, indexable stack of `n` real L×L images, one pose per image.
///
/// Implementations must return identical data for repeated reads of the
/// same indices.
pub trait ImageSource<T: Real>: Sync {
    fn n(&self) -> usize;

    fn resolution(&self) -> usize;

    fn dtype(&self) -> Dtype {
        T::DTYPE
    }

    fn poses(&self) -> &[Pose];

    fn rotations(&self) -> Vec<Rotation> {
        self.poses().iter().map(|p| p.rotation).collect()
    }

    /// Images at `indices`, shape `(indices.len(), L, L)`.
    fn images(&self, indices: &[usize]) -> Result<Array3<T>>;
}

fn check_indices(indices: &[usize], n: usize) -> Result<()> {
    match indices.iter().find(|&&i| i >= n) {
        Some(i) => Err(ReconError::InvalidInput(format!(
            "image index {i} out of range for a source of {n} images"
        ))),
        None => Ok(()),
    }
}

/// Images and poses already in memory.
#[derive(Debug, Clone)]
pub struct ArrayImageSource<T: Real> {
    images: Array3<T>,
    poses: Vec<Pose>,
}

impl<T: Real> ArrayImageSource<T> {
    pub fn new(images: Array3<T>, rotations: &[Rotation]) -> Result<Self> {
        let poses = rotations.iter().copied().map(Pose::from_rotation).collect();
        Self::with_poses(images, poses)
    }

    pub fn with_poses(images: Array3<T>, poses: Vec<Pose>) -> Result<Self> {
        let shape = images.shape();
        if shape[1] != shape[2] {
            return Err(ReconError::InvalidInput(format!(
                "images must be square (N, L, L), got shape {shape:?}"
            )));
        }
        if shape[0] != poses.len() {
            return Err(ReconError::InvalidInput(format!(
                "{} images but {} poses",
                shape[0],
                poses.len()
            )));
        }
        Ok(Self { images, poses })
    }
}

impl<T: Real> ImageSource<T> for ArrayImageSource<T> {
    fn n(&self) -> usize {
        self.poses.len()
    }

    fn resolution(&self) -> usize {
        self.images.shape()[1]
    }

    fn poses(&self) -> &[Pose] {
        &self.poses
    }

    fn images(&self, indices: &[usize]) -> Result<Array3<T>> {
        check_indices(indices, self.n())?;
        Ok(self.images.select(Axis(0), indices))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum OffsetModel {
    Zero,
    /// Each component uniform in `[-max_shift, max_shift]` pixels.
    Uniform { max_shift: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind")]
pub enum AmplitudeModel {
    Unit,
    Uniform { min: f64, max: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub n: usize,
    pub seed: u64,
    pub offsets: OffsetModel,
    pub amplitudes: AmplitudeModel,
    /// Variance of additive white Gaussian noise in real space.
    pub noise_variance: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            n: 1024,
            seed: 0,
            offsets: OffsetModel::Uniform { max_shift: 2.0 },
            amplitudes: AmplitudeModel::Uniform {
                min: 2.0 / 3.0,
                max: 1.5,
            },
            noise_variance: 0.0,
        }
    }
}

impl SimulationParams {
    /// Rejects ranges `gen_range` cannot sample from.
    pub fn validate(&self) -> Result<()> {
        if !(self.noise_variance.is_finite() && self.noise_variance >= 0.0) {
            return Err(ReconError::Configuration(format!(
                "noise variance must be finite and non-negative, got {}",
                self.noise_variance
            )));
        }
        if let OffsetModel::Uniform { max_shift } = self.offsets {
            if !(max_shift.is_finite() && max_shift >= 0.0) {
                return Err(ReconError::Configuration(format!(
                    "max_shift must be finite and non-negative, got {max_shift}"
                )));
            }
        }
        if let AmplitudeModel::Uniform { min, max } = self.amplitudes {
            if !(0.0 < min && min <= max && max.is_finite()) {
                return Err(ReconError::Configuration(format!(
                    "amplitude range must be finite with 0 < min <= max, got [{min}, {max}]"
                )));
            }
        }
        Ok(())
    }

    /// Noiseless, centered, unit-amplitude projections.
    pub fn clean(n: usize, seed: u64) -> Self {
        Self {
            n,
            seed,
            offsets: OffsetModel::Zero,
            amplitudes: AmplitudeModel::Unit,
            noise_variance: 0.0,
        }
    }
}

/// Projections of one or more ground-truth volumes under random poses.
///
/// Each image is drawn from one channel ("state") of `vols`, chosen
/// uniformly at random. Images are produced by the same central-slice
/// operator the estimators invert, then brought back to real space.
/// Reads are deterministic with or without the cache: noise is seeded per
/// image index.
pub struct Simulation<T: Real> {
    vols: Volume<T>,
    spectra: Vec<Array3<Complex<T>>>,
    params: SimulationParams,
    poses: Vec<Pose>,
    states: Vec<usize>,
    projector: Projector,
    fft: CenteredFft<T>,
    noise: Option<Normal<f64>>,
    cache: OnceLock<Array3<T>>,
}

impl<T: Real> Simulation<T> {
    pub fn new(vols: Volume<T>, params: SimulationParams) -> Result<Self> {
        params.validate()?;
        let noise = if params.noise_variance > 0.0 {
            let normal = Normal::new(0.0, params.noise_variance.sqrt()).map_err(|e| {
                ReconError::Configuration(format!(
                    "noise variance {}: {e}",
                    params.noise_variance
                ))
            })?;
            Some(normal)
        } else {
            None
        };

        let mut rng = StdRng::seed_from_u64(params.seed.wrapping_add(1));
        let poses: Vec<Pose> = Rotation::generate_random(params.n, params.seed)
            .into_iter()
            .map(|rotation| {
                let offset = match params.offsets {
                    OffsetModel::Zero => [0.0, 0.0],
                    OffsetModel::Uniform { max_shift } => [
                        rng.gen_range(-max_shift..=max_shift),
                        rng.gen_range(-max_shift..=max_shift),
                    ],
                };
                let amplitude = match params.amplitudes {
                    AmplitudeModel::Unit => 1.0,
                    AmplitudeModel::Uniform { min, max } => rng.gen_range(min..=max),
                };
                Pose {
                    rotation,
                    offset,
                    amplitude,
                }
            })
            .collect();

        let n_vols = vols.n_vols();
        let states = (0..params.n).map(|_| rng.gen_range(0..n_vols)).collect();

        let len = vols.resolution();
        Ok(Self {
            spectra: vols.to_fourier(),
            vols,
            params,
            poses,
            states,
            projector: Projector::new(len, DensityCompensation::None),
            fft: CenteredFft::new(len),
            noise,
            cache: OnceLock::new(),
        })
    }

    /// Precomputes every image. Later reads come from memory.
    pub fn cache(self) -> Self {
        self.cache.get_or_init(|| {
            let all: Vec<usize> = (0..self.params.n).collect();
            self.generate(&all)
        });
        self
    }

    pub fn is_cached(&self) -> bool {
        self.cache.get().is_some()
    }

    pub fn vols(&self) -> &Volume<T> {
        &self.vols
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    /// Channel of `vols` that produced each image.
    pub fn states(&self) -> &[usize] {
        &self.states
    }

    /// One-hot `(n, C)` weights from [`Simulation::states`].
    pub fn vol_weights(&self) -> Array2<T> {
        Array2::from_shape_fn((self.params.n, self.vols.n_vols()), |(i, c)| {
            if self.states[i] == c {
                T::one()
            } else {
                T::zero()
            }
        })
    }

    fn image_seed(&self, index: usize) -> u64 {
        // splitmix64 step so neighbouring indices get unrelated streams
        let mut z = self
            .params
            .seed
            .wrapping_add((index as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn generate(&self, indices: &[usize]) -> Array3<T> {
        let len = self.vols.resolution();
        let poses: Vec<Pose> = indices.iter().map(|&i| self.poses[i]).collect();
        let n_vols = self.vols.n_vols();
        let weights = Array2::from_shape_fn((indices.len(), n_vols), |(row, c)| {
            if self.states[indices[row]] == c {
                T::one()
            } else {
                T::zero()
            }
        });
        let volumes: Vec<ArrayView3<Complex<T>>> = self.spectra.iter().map(|s| s.view()).collect();
        let slices = self.projector.project_weighted(&volumes, &poses, weights.view());

        let mut images = Array3::zeros((indices.len(), len, len));
        images
            .axis_iter_mut(Axis(0))
            .into_par_iter()
            .zip(slices.axis_iter(Axis(0)).into_par_iter())
            .zip(indices.par_iter())
            .for_each(|((mut image, slice), &index)| {
                let real = self.fft.ifft2(slice);
                match &self.noise {
                    Some(normal) => {
                        let mut rng = StdRng::seed_from_u64(self.image_seed(index));
                        let noise = Array2::random_using((len, len), *normal, &mut rng);
                        ndarray::Zip::from(&mut image)
                            .and(&real)
                            .and(&noise)
                            .for_each(|v, c, &e| *v = c.re + T::of(e));
                    }
                    None => ndarray::Zip::from(&mut image)
                        .and(&real)
                        .for_each(|v, c| *v = c.re),
                }
            });
        images
    }
}

impl<T: Real> ImageSource<T> for Simulation<T> {
    fn n(&self) -> usize {
        self.params.n
    }

    fn resolution(&self) -> usize {
        self.vols.resolution()
    }

    fn poses(&self) -> &[Pose] {
        &self.poses
    }

    fn images(&self, indices: &[usize]) -> Result<Array3<T>> {
        check_indices(indices, self.n())?;
        Ok(match self.cache.get() {
            Some(cached) => cached.select(Axis(0), indices),
            None => self.generate(indices),
        })
    }
}
