//! Rotations in 3D and the point groups used by symmetric volumes.

use std::f64::consts::PI;

use nalgebra::{Matrix3, Quaternion, Rotation3, Unit, UnitQuaternion, Vector3};
use ndarray_rand::rand_distr::StandardNormal;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// A proper rotation of 3D space.
///
/// Maps image-frame coordinates `(u, v, w)` to volume coordinates; the
/// projection direction is the third column.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rotation(Rotation3<f64>);

impl From<Rotation3<f64>> for Rotation {
    fn from(r: Rotation3<f64>) -> Self {
        Self(r)
    }
}

impl Rotation {
    pub fn identity() -> Self {
        Self(Rotation3::identity())
    }

    /// Rotation by `angle` radians about `axis` (normalized internally).
    pub fn about_axis(axis: [f64; 3], angle: f64) -> Self {
        let axis = Unit::new_normalize(Vector3::from(axis));
        Self(Rotation3::from_axis_angle(&axis, angle))
    }

    /// Quaternion `(w, x, y, z)` to rotation. The input is normalized.
    pub fn from_quaternion(q: [f64; 4]) -> Self {
        let q = UnitQuaternion::from_quaternion(Quaternion::new(q[0], q[1], q[2], q[3]));
        Self(q.to_rotation_matrix())
    }

    /// Intrinsic ZYZ Euler angles.
    pub fn from_euler_zyz(alpha: f64, beta: f64, gamma: f64) -> Self {
        let z1 = Self::about_axis([0.0, 0.0, 1.0], alpha);
        let y = Self::about_axis([0.0, 1.0, 0.0], beta);
        let z2 = Self::about_axis([0.0, 0.0, 1.0], gamma);
        z1.compose(&y).compose(&z2)
    }

    /// Draws `n` rotations uniformly from SO(3) (normalized Gaussian quaternions).
    pub fn generate_random(n: usize, seed: u64) -> Vec<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let q: [f64; 4] = [
                    rng.sample(StandardNormal),
                    rng.sample(StandardNormal),
                    rng.sample(StandardNormal),
                    rng.sample(StandardNormal),
                ];
                Self::from_quaternion(q)
            })
            .collect()
    }

    pub fn as_rotation3(&self) -> &Rotation3<f64> {
        &self.0
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        self.0.matrix()
    }

    /// `self * other`
    pub fn compose(&self, other: &Rotation) -> Rotation {
        Self(self.0 * other.0)
    }

    pub fn transpose(&self) -> Rotation {
        Self(self.0.transpose())
    }

    pub fn apply(&self, p: [f64; 3]) -> [f64; 3] {
        (self.0 * Vector3::from(p)).into()
    }

    pub fn column(&self, j: usize) -> [f64; 3] {
        let c = self.0.matrix().column(j);
        [c[0], c[1], c[2]]
    }

    pub fn determinant(&self) -> f64 {
        self.0.matrix().determinant()
    }

    /// Angle in radians of the rotation taking `self` to `other`.
    pub fn distance(&self, other: &Rotation) -> f64 {
        self.0.angle_to(&other.0)
    }
}

/// Point groups supported by the synthetic volume generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymmetryGroup {
    /// C1, no symmetry.
    Identity,
    /// C_n about the z axis.
    Cyclic(usize),
    /// D_n: C_n about z plus n two-fold axes in the xy plane.
    Dihedral(usize),
    /// Tetrahedral, 12 elements.
    Tetrahedral,
    /// Octahedral, 24 elements.
    Octahedral,
}

impl SymmetryGroup {
    pub fn order(&self) -> usize {
        match *self {
            SymmetryGroup::Identity => 1,
            SymmetryGroup::Cyclic(n) => n,
            SymmetryGroup::Dihedral(n) => 2 * n,
            SymmetryGroup::Tetrahedral => 12,
            SymmetryGroup::Octahedral => 24,
        }
    }

    pub fn rotations(&self) -> Vec<Rotation> {
        let z = [0.0, 0.0, 1.0];
        let diagonal = [1.0, 1.0, 1.0];
        match *self {
            SymmetryGroup::Identity => vec![Rotation::identity()],
            SymmetryGroup::Cyclic(n) => cyclic(n),
            SymmetryGroup::Dihedral(n) => {
                let flip = Rotation::about_axis([1.0, 0.0, 0.0], PI);
                let cn = cyclic(n);
                let flipped: Vec<Rotation> = cn.iter().map(|r| r.compose(&flip)).collect();
                cn.into_iter().chain(flipped).collect()
            }
            SymmetryGroup::Tetrahedral => close_group(&[
                Rotation::about_axis(diagonal, 2.0 * PI / 3.0),
                Rotation::about_axis(z, PI),
            ]),
            SymmetryGroup::Octahedral => close_group(&[
                Rotation::about_axis(diagonal, 2.0 * PI / 3.0),
                Rotation::about_axis(z, PI / 2.0),
            ]),
        }
    }
}

fn cyclic(n: usize) -> Vec<Rotation> {
    let n = n.max(1);
    (0..n)
        .map(|k| Rotation::about_axis([0.0, 0.0, 1.0], 2.0 * PI * k as f64 / n as f64))
        .collect()
}

/// Smallest set containing the identity and the generators, closed under
/// composition.
fn close_group(generators: &[Rotation]) -> Vec<Rotation> {
    const SAME: f64 = 1e-6;
    let mut elements = vec![Rotation::identity()];
    let mut frontier = elements.clone();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for r in &frontier {
            for g in generators {
                let candidate = r.compose(g);
                if !elements.iter().any(|e| e.distance(&candidate) < SAME) {
                    elements.push(candidate);
                    next.push(candidate);
                }
            }
        }
        frontier = next;
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_diff(a: &Rotation, b: &Rotation) -> f64 {
        (a.matrix() - b.matrix()).amax()
    }

    fn assert_orthonormal(r: &Rotation) {
        let rt_r = r.transpose().compose(r);
        assert!(max_diff(&rt_r, &Rotation::identity()) < 1e-12);
        assert!((r.determinant() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn random_rotations_are_proper_and_reproducible() {
        let a = Rotation::generate_random(50, 23);
        let b = Rotation::generate_random(50, 23);
        assert_eq!(a, b);
        a.iter().for_each(assert_orthonormal);

        let c = Rotation::generate_random(50, 24);
        assert!(a[0].distance(&c[0]) > 1e-6);
    }

    #[test]
    fn group_orders() {
        let cases = [
            (SymmetryGroup::Identity, 1),
            (SymmetryGroup::Cyclic(4), 4),
            (SymmetryGroup::Cyclic(5), 5),
            (SymmetryGroup::Dihedral(2), 4),
            (SymmetryGroup::Dihedral(3), 6),
            (SymmetryGroup::Tetrahedral, 12),
            (SymmetryGroup::Octahedral, 24),
        ];
        for (group, order) in cases {
            let rots = group.rotations();
            assert_eq!(rots.len(), order, "{group:?}");
            assert_eq!(group.order(), order);
            rots.iter().for_each(assert_orthonormal);
        }
    }

    #[test]
    fn groups_are_closed() {
        for group in [
            SymmetryGroup::Dihedral(3),
            SymmetryGroup::Tetrahedral,
            SymmetryGroup::Octahedral,
        ] {
            let rots = group.rotations();
            for a in &rots {
                for b in &rots {
                    let ab = a.compose(b);
                    assert!(rots.iter().any(|r| max_diff(r, &ab) < 1e-9));
                }
            }
        }
    }

    #[test]
    fn quarter_turn_about_z() {
        let r = Rotation::about_axis([0.0, 0.0, 2.0], PI / 2.0);
        let p = r.apply([1.0, 0.0, 0.0]);
        assert!((p[0]).abs() < 1e-12);
        assert!((p[1] - 1.0).abs() < 1e-12);
        assert!(p[2].abs() < 1e-12);
        let axis = r.column(2);
        assert!(axis[0].abs() < 1e-12 && axis[1].abs() < 1e-12 && (axis[2] - 1.0).abs() < 1e-12);
        assert!((r.distance(&Rotation::identity()) - PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn quaternion_and_axis_angle_agree() {
        // (cos 60°, sin 60° · n) with n along (1, 1, 1)
        let s = (PI / 3.0).sin() / 3f64.sqrt();
        let from_q = Rotation::from_quaternion([(PI / 3.0).cos(), s, s, s]);
        let from_axis = Rotation::about_axis([1.0, 1.0, 1.0], 2.0 * PI / 3.0);
        assert!(max_diff(&from_q, &from_axis) < 1e-12);
        // cyclic permutation of the axes
        let p = from_axis.apply([1.0, 0.0, 0.0]);
        assert!((p[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn euler_zyz_matches_composition() {
        let r = Rotation::from_euler_zyz(0.3, 1.1, -0.7);
        assert_orthonormal(&r);
        let expected = Rotation::about_axis([0.0, 0.0, 1.0], 0.3)
            .compose(&Rotation::about_axis([0.0, 1.0, 0.0], 1.1))
            .compose(&Rotation::about_axis([0.0, 0.0, 1.0], -0.7));
        assert!(max_diff(&r, &expected) < 1e-12);
    }
}
