//! Direct (spatial-domain) convolution kernels.
//!
//! Three products are needed for training:
//!
//! | kernel             | result extent  | used for                      |
//! |--------------------|----------------|-------------------------------|
//! | `convolve`         | `a - b + 1`    | forward feature maps          |
//! | `convolve_flipped` | `a - b + 1`    | weight gradients              |
//! | `convolve_inverse` | `a + b - 1`    | back-propagated gradients     |
//!
//! `convolve` is a true convolution (the filter is flipped), `convolve_flipped`
//! correlates a flipped input with the gradient, and `convolve_inverse` is the
//! full correlation that undoes `convolve`'s shape change.

use sluice_core::{Cube, CubePool, Extent, PooledCube};

use crate::kernel::ConvolutionKernel;

fn valid_extent(a: &Cube, b: &Cube, op: &str) -> Extent {
    a.extent().valid_convolution(&b.extent()).unwrap_or_else(|| {
        panic!("{op}: filter {} does not fit input {}", b.extent(), a.extent())
    })
}

fn assert_result_extent(r: &Cube, expected: Extent, op: &str) {
    assert_eq!(
        r.extent(),
        expected,
        "{op}: result cube is {}, expected {}",
        r.extent(),
        expected
    );
}

/// Reverse a cube along all three axes.
pub fn flip(c: &Cube) -> Cube {
    let e = c.extent();
    let (w, h, d) = (e.width(), e.height(), e.depth());
    Cube::from_fn(e, |x, y, z| c.get(w - 1 - x, h - 1 - y, d - 1 - z))
}

// ============================================================================
// 1x1x1 filter fast paths
// ============================================================================

/// `r += a * b`.
pub fn constant_convolve_add(a: &Cube, b: f64, r: &mut Cube) {
    assert_result_extent(r, a.extent(), "constant_convolve_add");
    for (r, a) in r.as_mut_slice().iter_mut().zip(a.as_slice()) {
        *r += a * b;
    }
}

/// `r = a * b`.
pub fn constant_convolve_into(a: &Cube, b: f64, r: &mut Cube) {
    assert_result_extent(r, a.extent(), "constant_convolve_into");
    for (r, a) in r.as_mut_slice().iter_mut().zip(a.as_slice()) {
        *r = a * b;
    }
}

/// Dot product of two equally sized cubes.
pub fn constant_convolve_flipped(a: &Cube, b: &Cube) -> f64 {
    assert_eq!(a.extent(), b.extent(), "constant_convolve_flipped: extent mismatch");
    a.as_slice().iter().zip(b.as_slice()).map(|(a, b)| a * b).sum()
}

// ============================================================================
// convolve
// ============================================================================

/// `r += a * b` (valid convolution).
pub fn convolve_add(a: &Cube, b: &Cube, r: &mut Cube) {
    if b.extent() == Extent::ONE {
        constant_convolve_add(a, b.get(0, 0, 0), r);
        return;
    }

    let re = valid_extent(a, b, "convolve_add");
    assert_result_extent(r, re, "convolve_add");

    let [bx, by, bz] = b.extent().dims();
    for z in 0..re.depth() {
        for y in 0..re.height() {
            for x in 0..re.width() {
                let mut acc = 0.0;
                for dz in 0..bz {
                    for dy in 0..by {
                        for dx in 0..bx {
                            acc += a.get(x + dx, y + dy, z + dz)
                                * b.get(bx - 1 - dx, by - 1 - dy, bz - 1 - dz);
                        }
                    }
                }
                r[(x, y, z)] += acc;
            }
        }
    }
}

/// `r = a * b` (valid convolution).
pub fn convolve_into(a: &Cube, b: &Cube, r: &mut Cube) {
    if b.extent() == Extent::ONE {
        constant_convolve_into(a, b.get(0, 0, 0), r);
        return;
    }
    r.fill(0.0);
    convolve_add(a, b, r);
}

/// Valid convolution into a cube drawn from `pool`.
pub fn convolve(pool: &CubePool, a: &Cube, b: &Cube) -> PooledCube {
    let mut r = pool.acquire(valid_extent(a, b, "convolve"));
    convolve_into(a, b, &mut r);
    r
}

// ============================================================================
// convolve_flipped
// ============================================================================

/// `r += flip(a) * b`, the weight-gradient product.
pub fn convolve_flipped_add(a: &Cube, b: &Cube, r: &mut Cube) {
    if a.extent() == b.extent() {
        assert_result_extent(r, Extent::ONE, "convolve_flipped_add");
        r[(0, 0, 0)] += constant_convolve_flipped(a, b);
        return;
    }

    let re = valid_extent(a, b, "convolve_flipped_add");
    assert_result_extent(r, re, "convolve_flipped_add");

    let [ax, ay, az] = a.extent().dims();
    let [bx, by, bz] = b.extent().dims();
    for z in 0..re.depth() {
        for y in 0..re.height() {
            for x in 0..re.width() {
                let mut acc = 0.0;
                for dz in 0..bz {
                    for dy in 0..by {
                        for dx in 0..bx {
                            acc += a.get(ax - 1 - x - dx, ay - 1 - y - dy, az - 1 - z - dz)
                                * b.get(bx - 1 - dx, by - 1 - dy, bz - 1 - dz);
                        }
                    }
                }
                r[(x, y, z)] += acc;
            }
        }
    }
}

/// `r = flip(a) * b`.
pub fn convolve_flipped_into(a: &Cube, b: &Cube, r: &mut Cube) {
    if a.extent() == b.extent() {
        assert_result_extent(r, Extent::ONE, "convolve_flipped_into");
        r[(0, 0, 0)] = constant_convolve_flipped(a, b);
        return;
    }
    r.fill(0.0);
    convolve_flipped_add(a, b, r);
}

/// Weight-gradient product into a cube drawn from `pool`.
pub fn convolve_flipped(pool: &CubePool, a: &Cube, b: &Cube) -> PooledCube {
    let mut r = pool.acquire(valid_extent(a, b, "convolve_flipped"));
    convolve_flipped_into(a, b, &mut r);
    r
}

// ============================================================================
// convolve_inverse
// ============================================================================

/// `r += full_correlation(a, b)`, the back-propagation product.
pub fn convolve_inverse_add(a: &Cube, b: &Cube, r: &mut Cube) {
    if b.extent() == Extent::ONE {
        constant_convolve_add(a, b.get(0, 0, 0), r);
        return;
    }

    let re = a.extent().full_convolution(&b.extent());
    assert_result_extent(r, re, "convolve_inverse_add");

    let [ax, ay, az] = a.extent().dims();
    let [bx, by, bz] = b.extent().dims();
    for dz in 0..bz {
        for dy in 0..by {
            for dx in 0..bx {
                let w = b.get(dx, dy, dz);
                let (fx, fy, fz) = (bx - 1 - dx, by - 1 - dy, bz - 1 - dz);
                for z in 0..az {
                    for y in 0..ay {
                        for x in 0..ax {
                            r[(x + fx, y + fy, z + fz)] += a.get(x, y, z) * w;
                        }
                    }
                }
            }
        }
    }
}

/// `r = full_correlation(a, b)`.
pub fn convolve_inverse_into(a: &Cube, b: &Cube, r: &mut Cube) {
    if b.extent() == Extent::ONE {
        constant_convolve_into(a, b.get(0, 0, 0), r);
        return;
    }
    r.fill(0.0);
    convolve_inverse_add(a, b, r);
}

/// Back-propagation product into a cube drawn from `pool`.
pub fn convolve_inverse(pool: &CubePool, a: &Cube, b: &Cube) -> PooledCube {
    let mut r = pool.acquire(a.extent().full_convolution(&b.extent()));
    convolve_inverse_into(a, b, &mut r);
    r
}

/// Spatial-domain kernels. Cheapest for small filters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectConvolution;

impl ConvolutionKernel for DirectConvolution {
    fn convolve(&self, pool: &CubePool, input: &Cube, filter: &Cube) -> PooledCube {
        convolve(pool, input, filter)
    }

    fn convolve_flipped(&self, pool: &CubePool, input: &Cube, grad: &Cube) -> PooledCube {
        convolve_flipped(pool, input, grad)
    }

    fn convolve_inverse(&self, pool: &CubePool, grad: &Cube, filter: &Cube) -> PooledCube {
        convolve_inverse(pool, grad, filter)
    }
}
