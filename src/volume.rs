use ndarray::{Array3, Array4, ArrayView3, Axis};
use ndarray_rand::rand_distr::Uniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::dtype::{Dtype, Real};
use crate::error::{ReconError, Result};
use crate::fourier::CenteredFft;
use crate::fsc::{fourier_shell_correlation, FscResult};
use crate::rotation::{Rotation, SymmetryGroup};
use crate::utils::centered;

/// One or more real-space volumes sharing an L×L×L grid.
///
/// Stored as `(C, L, L, L)`; the voxel at index `(i, j, k)` sits at centered
/// coordinate `(i - L/2, j - L/2, k - L/2)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume<T: Real> {
    data: Array4<T>,
}

impl<T: Real> Volume<T> {
    pub fn new(data: Array4<T>) -> Result<Self> {
        let shape = data.shape();
        if shape[0] == 0 || shape[1] == 0 {
            return Err(ReconError::InvalidInput(format!(
                "volume needs at least one channel and a non-empty grid, got shape {shape:?}"
            )));
        }
        if shape[1] != shape[2] || shape[1] != shape[3] {
            return Err(ReconError::InvalidInput(format!(
                "volume grid must be cubic (C, L, L, L), got shape {shape:?}"
            )));
        }
        Ok(Self { data })
    }

    pub fn from_channels(channels: Vec<Array3<T>>) -> Result<Self> {
        let Some(first) = channels.first() else {
            return Err(ReconError::InvalidInput("no channels given".into()));
        };
        let len = first.shape()[0];
        let mut data = Array4::zeros((channels.len(), len, len, len));
        for (c, channel) in channels.iter().enumerate() {
            if channel.shape() != [len, len, len] {
                return Err(ReconError::InvalidInput(format!(
                    "channel {c} has shape {:?}, expected {:?}",
                    channel.shape(),
                    [len, len, len]
                )));
            }
            data.index_axis_mut(Axis(0), c).assign(channel);
        }
        Self::new(data)
    }

    pub fn zeros(n_vols: usize, len: usize) -> Result<Self> {
        Self::new(Array4::zeros((n_vols, len, len, len)))
    }

    pub fn data(&self) -> &Array4<T> {
        &self.data
    }

    pub fn into_data(self) -> Array4<T> {
        self.data
    }

    pub fn channel(&self, c: usize) -> ArrayView3<T> {
        self.data.index_axis(Axis(0), c)
    }

    pub fn n_vols(&self) -> usize {
        self.data.shape()[0]
    }

    pub fn resolution(&self) -> usize {
        self.data.shape()[1]
    }

    pub fn shape(&self) -> (usize, usize, usize, usize) {
        self.data.dim()
    }

    pub fn dtype(&self) -> Dtype {
        T::DTYPE
    }

    /// Centered 3D spectrum of every channel.
    pub fn to_fourier(&self) -> Vec<Array3<Complex<T>>> {
        let fft = CenteredFft::new(self.resolution());
        self.data.outer_iter().map(|v| fft.fft3(v)).collect()
    }

    /// Inverse of [`Volume::to_fourier`], keeping the real part.
    pub fn from_fourier(spectra: &[Array3<Complex<T>>]) -> Result<Self> {
        let Some(first) = spectra.first() else {
            return Err(ReconError::InvalidInput("no spectra given".into()));
        };
        let fft = CenteredFft::new(first.shape()[0]);
        let channels = spectra
            .iter()
            .map(|s| fft.ifft3(s.view()).mapv(|v| v.re))
            .collect();
        Self::from_channels(channels)
    }

    /// Fourier Shell Correlation against `other`, channel by channel.
    pub fn fsc(&self, other: &Volume<T>, pixel_size: f64, cutoff: f64) -> Result<FscResult> {
        fourier_shell_correlation(self, other, pixel_size, cutoff)
    }
}

/// Gaussian-blob phantom with an optional point-group symmetry.
///
/// Every channel draws its own blobs from the same seeded stream. For a
/// symmetric volume each drawn blob is replicated under every element of
/// the group, so the result is invariant under the group by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyntheticVolume {
    pub resolution: usize,
    pub n_vols: usize,
    pub symmetry: SymmetryGroup,
    /// Blobs per channel before symmetrization is spread over the group.
    pub n_blobs: usize,
    pub seed: u64,
}

struct Blob {
    center: [f64; 3],
    orientation: Rotation,
    sigma: [f64; 3],
}

impl SyntheticVolume {
    pub fn new(resolution: usize, n_vols: usize, symmetry: SymmetryGroup, seed: u64) -> Self {
        Self {
            resolution,
            n_vols,
            symmetry,
            n_blobs: 16,
            seed,
        }
    }

    pub fn asymmetric(resolution: usize, n_vols: usize, seed: u64) -> Self {
        Self::new(resolution, n_vols, SymmetryGroup::Identity, seed)
    }

    pub fn generate<T: Real>(&self) -> Result<Volume<T>> {
        if self.resolution == 0 || self.n_vols == 0 {
            return Err(ReconError::Configuration(format!(
                "synthetic volume needs L >= 1 and C >= 1, got L={} C={}",
                self.resolution, self.n_vols
            )));
        }
        match self.symmetry {
            SymmetryGroup::Cyclic(0) | SymmetryGroup::Dihedral(0) => {
                return Err(ReconError::Configuration(format!(
                    "symmetry order must be positive: {:?}",
                    self.symmetry
                )))
            }
            _ => {}
        }

        let len = self.resolution;
        let group = self.symmetry.rotations();
        let per_unit = (self.n_blobs / group.len()).max(1);
        let mut rng = StdRng::seed_from_u64(self.seed);

        let mut data = Array4::zeros((self.n_vols, len, len, len));
        for mut channel in data.outer_iter_mut() {
            let blobs: Vec<Blob> = (0..per_unit)
                .map(|_| self.draw_blob(&mut rng))
                .flat_map(|blob| {
                    group
                        .iter()
                        .map(|g| Blob {
                            center: g.apply(blob.center),
                            orientation: g.compose(&blob.orientation),
                            sigma: blob.sigma,
                        })
                        .collect::<Vec<_>>()
                })
                .collect();

            channel
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .enumerate()
                .for_each(|(i, mut plane)| {
                    for ((j, k), v) in plane.indexed_iter_mut() {
                        let p = [centered(i, len), centered(j, len), centered(k, len)];
                        *v = T::of(blobs.iter().map(|b| b.density(p)).sum());
                    }
                });
        }

        Volume::new(data)
    }

    fn draw_blob(&self, rng: &mut StdRng) -> Blob {
        let radius = self.resolution as f64 / 4.0;
        let unit = Uniform::new_inclusive(-1.0, 1.0);
        let center = loop {
            let c: [f64; 3] = [rng.sample(unit), rng.sample(unit), rng.sample(unit)];
            if c.iter().map(|v| v * v).sum::<f64>() <= 1.0 {
                break [c[0] * radius, c[1] * radius, c[2] * radius];
            }
        };
        let width = Uniform::new_inclusive(0.03, 0.05);
        let l = self.resolution as f64;
        let sigma = [
            rng.sample(width) * l,
            rng.sample(width) * l,
            rng.sample(width) * l,
        ];
        let orientation = Rotation::generate_random(1, rng.gen())[0];
        Blob {
            center,
            orientation,
            sigma: sigma.map(|s| s.max(0.75)),
        }
    }
}

impl Blob {
    fn density(&self, p: [f64; 3]) -> f64 {
        let d = [
            p[0] - self.center[0],
            p[1] - self.center[1],
            p[2] - self.center[2],
        ];
        let local = self.orientation.transpose().apply(d);
        let q: f64 = (0..3).map(|i| (local[i] / self.sigma[i]).powi(2)).sum();
        if q > 50.0 {
            0.0
        } else {
            (-0.5 * q).exp()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_cubic_data() {
        let err = Volume::<f32>::new(Array4::zeros((1, 4, 4, 5))).unwrap_err();
        assert!(err.to_string().contains("[1, 4, 4, 5]"), "{err}");
        assert!(Volume::<f32>::new(Array4::zeros((0, 4, 4, 4))).is_err());
    }

    #[test]
    fn generation_is_seeded() {
        let phantom = SyntheticVolume::asymmetric(12, 2, 23);
        let a: Volume<f32> = phantom.generate().unwrap();
        let b: Volume<f32> = phantom.generate().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.shape(), (2, 12, 12, 12));
        assert_eq!(a.dtype(), Dtype::F32);

        let c: Volume<f32> = SyntheticVolume::asymmetric(12, 2, 24).generate().unwrap();
        assert_ne!(a, c);
        // channels differ
        assert_ne!(a.channel(0), a.channel(1));
    }

    #[test]
    fn cyclic_volume_is_invariant_under_quarter_turn() {
        let len = 16;
        let vol: Volume<f64> = SyntheticVolume::new(len, 1, SymmetryGroup::Cyclic(4), 5)
            .generate()
            .unwrap();
        let data = vol.channel(0);
        let half = (len / 2) as isize;
        // (x, y, z) -> (-y, x, z) on the centered grid
        for i in 1..len {
            for j in 1..len {
                for k in 0..len {
                    let (x, y) = (i as isize - half, j as isize - half);
                    let (ri, rj) = ((-y + half) as usize, (x + half) as usize);
                    assert!((data[[i, j, k]] - data[[ri, rj, k]]).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn fourier_round_trip() {
        let vol: Volume<f64> = SyntheticVolume::asymmetric(9, 1, 1).generate().unwrap();
        let back = Volume::from_fourier(&vol.to_fourier()).unwrap();
        for (a, b) in vol.data().iter().zip(back.data().iter()) {
            assert!((a - b).abs() < 1e-10);
        }
    }

    #[test]
    fn zero_order_symmetry_is_a_configuration_error() {
        let phantom = SyntheticVolume::new(8, 1, SymmetryGroup::Cyclic(0), 1);
        assert!(matches!(phantom.generate::<f32>(), Err(ReconError::Configuration(_))));
    }
}
