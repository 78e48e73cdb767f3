//! Dense 3-D `f64` buffer used for feature maps, filters and gradients.

use std::fmt;
use std::ops::{AddAssign, Index, IndexMut, MulAssign, SubAssign};

use rand::Rng;

use crate::Extent;

/// A dense, rectangular 3-D array of `f64`, stored x-fastest.
#[derive(Clone, PartialEq)]
pub struct Cube {
    extent: Extent,
    data: Vec<f64>,
}

impl Cube {
    /// All-zero cube.
    pub fn zeros(extent: impl Into<Extent>) -> Self {
        Self::filled(extent, 0.0)
    }

    /// Cube with every element set to `value`.
    pub fn filled(extent: impl Into<Extent>, value: f64) -> Self {
        let extent = extent.into();
        Self {
            extent,
            data: vec![value; extent.numel()],
        }
    }

    /// Wrap existing data. Panics if the length does not match the extent.
    pub fn from_vec(extent: impl Into<Extent>, data: Vec<f64>) -> Self {
        let extent = extent.into();
        assert_eq!(
            data.len(),
            extent.numel(),
            "Cube::from_vec: {} elements do not fill a {} cube",
            data.len(),
            extent
        );
        Self { extent, data }
    }

    /// Build a cube by evaluating `f(x, y, z)` at every position.
    pub fn from_fn(extent: impl Into<Extent>, mut f: impl FnMut(usize, usize, usize) -> f64) -> Self {
        let extent = extent.into();
        let mut data = Vec::with_capacity(extent.numel());
        for z in 0..extent.depth() {
            for y in 0..extent.height() {
                for x in 0..extent.width() {
                    data.push(f(x, y, z));
                }
            }
        }
        Self { extent, data }
    }

    /// Cube with elements drawn uniformly from `[lo, hi)`.
    pub fn random_uniform<R: Rng + ?Sized>(extent: impl Into<Extent>, rng: &mut R, lo: f64, hi: f64) -> Self {
        let extent = extent.into();
        let data = (0..extent.numel()).map(|_| rng.gen_range(lo..hi)).collect();
        Self { extent, data }
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[self.extent.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f64) {
        let idx = self.extent.index(x, y, z);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Overwrite the contents with `other`'s. Extents must match.
    pub fn copy_from(&mut self, other: &Cube) {
        self.assert_same_extent(other, "copy_from");
        self.data.copy_from_slice(&other.data);
    }

    /// Sum of all elements.
    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Largest absolute element-wise difference to `other`.
    pub fn max_abs_diff(&self, other: &Cube) -> f64 {
        self.assert_same_extent(other, "max_abs_diff");
        self.data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }

    /// `self += alpha * other`.
    pub fn add_scaled(&mut self, alpha: f64, other: &Cube) {
        self.assert_same_extent(other, "add_scaled");
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += alpha * b;
        }
    }

    fn assert_same_extent(&self, other: &Cube, op: &str) {
        assert_eq!(
            self.extent, other.extent,
            "Cube::{op}: extent mismatch ({} vs {})",
            self.extent, other.extent
        );
    }
}

impl Index<(usize, usize, usize)> for Cube {
    type Output = f64;

    #[inline]
    fn index(&self, (x, y, z): (usize, usize, usize)) -> &f64 {
        &self.data[self.extent.index(x, y, z)]
    }
}

impl IndexMut<(usize, usize, usize)> for Cube {
    #[inline]
    fn index_mut(&mut self, (x, y, z): (usize, usize, usize)) -> &mut f64 {
        let idx = self.extent.index(x, y, z);
        &mut self.data[idx]
    }
}

impl AddAssign<&Cube> for Cube {
    fn add_assign(&mut self, rhs: &Cube) {
        self.assert_same_extent(rhs, "add_assign");
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a += b;
        }
    }
}

impl SubAssign<&Cube> for Cube {
    fn sub_assign(&mut self, rhs: &Cube) {
        self.assert_same_extent(rhs, "sub_assign");
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a -= b;
        }
    }
}

impl MulAssign<f64> for Cube {
    fn mul_assign(&mut self, rhs: f64) {
        for a in self.data.iter_mut() {
            *a *= rhs;
        }
    }
}

impl fmt::Debug for Cube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 8;
        write!(f, "Cube({}, [", self.extent)?;
        for (i, v) in self.data.iter().take(PREVIEW).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.4}")?;
        }
        if self.data.len() > PREVIEW {
            write!(f, ", ...")?;
        }
        write!(f, "])")
    }
}
