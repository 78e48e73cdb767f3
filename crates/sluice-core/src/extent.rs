use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// The (width, height, depth) size of a 3-D buffer.
///
/// Every feature map, filter and gradient in the engine is a 3-D cube, so the
/// extent is a fixed three-component value rather than a general rank-N shape.
/// It doubles as the lookup key of the buffer pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[usize; 3]", into = "[usize; 3]")]
pub struct Extent {
    dims: [usize; 3],
}

impl Extent {
    /// The 1x1x1 extent.
    pub const ONE: Extent = Extent { dims: [1, 1, 1] };

    /// Create a new extent.
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            dims: [width, height, depth],
        }
    }

    /// Same size along all three axes.
    pub const fn cube(side: usize) -> Self {
        Self::new(side, side, side)
    }

    pub fn width(&self) -> usize {
        self.dims[0]
    }

    pub fn height(&self) -> usize {
        self.dims[1]
    }

    pub fn depth(&self) -> usize {
        self.dims[2]
    }

    /// Dimensions as `[width, height, depth]`.
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Total number of elements, `None` if that overflows `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.dims.iter().try_fold(1usize, |n, &d| n.checked_mul(d))
    }

    /// Whether any axis has zero length.
    pub fn is_empty(&self) -> bool {
        self.dims.contains(&0)
    }

    /// Whether `other` fits inside `self` along every axis.
    pub fn contains(&self, other: &Extent) -> bool {
        self.dims.iter().zip(other.dims.iter()).all(|(a, b)| a >= b)
    }

    /// Component-wise subtraction, `None` if any axis would underflow.
    pub fn checked_sub(&self, other: &Extent) -> Option<Extent> {
        Some(Extent::new(
            self.dims[0].checked_sub(other.dims[0])?,
            self.dims[1].checked_sub(other.dims[1])?,
            self.dims[2].checked_sub(other.dims[2])?,
        ))
    }

    /// Component-wise addition, `None` if any axis would overflow.
    pub fn checked_add(&self, other: &Extent) -> Option<Extent> {
        Some(Extent::new(
            self.dims[0].checked_add(other.dims[0])?,
            self.dims[1].checked_add(other.dims[1])?,
            self.dims[2].checked_add(other.dims[2])?,
        ))
    }

    /// Extent of a "valid" convolution of `self` by `filter`: `self - filter + 1`.
    ///
    /// Returns `None` when the filter does not fit.
    pub fn valid_convolution(&self, filter: &Extent) -> Option<Extent> {
        self.checked_sub(filter).map(|e| e + Extent::ONE)
    }

    /// Extent of a "full" convolution of `self` by `filter`: `self + filter - 1`.
    pub fn full_convolution(&self, filter: &Extent) -> Extent {
        *self + *filter - Extent::ONE
    }

    /// Linear index of `(x, y, z)` in x-fastest order.
    #[inline]
    pub fn index(&self, x: usize, y: usize, z: usize) -> usize {
        debug_assert!(x < self.dims[0] && y < self.dims[1] && z < self.dims[2]);
        x + self.dims[0] * (y + self.dims[1] * z)
    }
}

impl Add for Extent {
    type Output = Extent;

    fn add(self, rhs: Extent) -> Extent {
        Extent::new(
            self.dims[0] + rhs.dims[0],
            self.dims[1] + rhs.dims[1],
            self.dims[2] + rhs.dims[2],
        )
    }
}

impl Sub for Extent {
    type Output = Extent;

    /// Panics on underflow; use [`Extent::checked_sub`] when that is expected.
    fn sub(self, rhs: Extent) -> Extent {
        self.checked_sub(&rhs)
            .unwrap_or_else(|| panic!("extent underflow: {self} - {rhs}"))
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Extent({}, {}, {})", self.dims[0], self.dims[1], self.dims[2])
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.dims[0], self.dims[1], self.dims[2])
    }
}

impl From<[usize; 3]> for Extent {
    fn from(dims: [usize; 3]) -> Self {
        Extent { dims }
    }
}

impl From<Extent> for [usize; 3] {
    fn from(e: Extent) -> Self {
        e.dims
    }
}

impl From<(usize, usize, usize)> for Extent {
    fn from((w, h, d): (usize, usize, usize)) -> Self {
        Extent::new(w, h, d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_extent() {
        let e = Extent::new(5, 4, 2);
        assert_eq!(e.width(), 5);
        assert_eq!(e.height(), 4);
        assert_eq!(e.depth(), 2);
        assert_eq!(e.numel(), 40);
        assert!(!e.is_empty());
        assert!(Extent::new(3, 0, 1).is_empty());
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(Extent::new(5, 4, 2).checked_numel(), Some(40));
        let huge = Extent::new(usize::MAX / 2, 3, 1);
        assert_eq!(huge.checked_numel(), None);
        assert!(!huge.is_empty());
        assert_eq!(huge.checked_add(&Extent::ONE), Some(Extent::new(usize::MAX / 2 + 1, 4, 2)));
        assert_eq!(Extent::new(usize::MAX, 1, 1).checked_add(&Extent::ONE), None);
    }

    #[test]
    fn test_convolution_extents() {
        let input = Extent::new(5, 5, 1);
        let filter = Extent::new(3, 3, 1);
        assert_eq!(input.valid_convolution(&filter), Some(Extent::new(3, 3, 1)));
        assert_eq!(input.full_convolution(&filter), Extent::new(7, 7, 1));
        assert_eq!(filter.valid_convolution(&input), None);
    }

    #[test]
    fn test_index_is_x_fastest() {
        let e = Extent::new(4, 3, 2);
        assert_eq!(e.index(0, 0, 0), 0);
        assert_eq!(e.index(1, 0, 0), 1);
        assert_eq!(e.index(0, 1, 0), 4);
        assert_eq!(e.index(0, 0, 1), 12);
        assert_eq!(e.index(3, 2, 1), 23);
    }

    #[test]
    fn test_contains() {
        assert!(Extent::new(5, 5, 1).contains(&Extent::new(5, 3, 1)));
        assert!(!Extent::new(5, 5, 1).contains(&Extent::new(5, 5, 2)));
    }

    #[test]
    #[should_panic(expected = "extent underflow")]
    fn test_sub_underflow_panics() {
        let _ = Extent::new(2, 2, 1) - Extent::new(3, 1, 1);
    }

    #[test]
    fn test_serde_as_array() {
        let e = Extent::new(9, 9, 1);
        let json = serde_json::to_string(&e).unwrap();
        assert_eq!(json, "[9,9,1]");
        let back: Extent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_display() {
        assert_eq!(Extent::new(28, 28, 1).to_string(), "28x28x1");
        assert_eq!(format!("{:?}", Extent::ONE), "Extent(1, 1, 1)");
    }
}
