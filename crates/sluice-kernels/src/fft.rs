//! FFT-based convolution.
//!
//! All three products reduce to one zero-padded full convolution followed by
//! a crop:
//!
//! - `convolve(a, b)`         = crop(full(a, b),        b - 1, a - b + 1)
//! - `convolve_flipped(a, b)` = crop(full(flip(a), b),  b - 1, a - b + 1)
//! - `convolve_inverse(a, b)` = full(a, flip(b))
//!
//! The 3-D transform is done as separable 1-D passes along x, y and z.
//! Plans are cached per length in [`FftPlans`]; planning takes a lock, running
//! a plan does not. Complex work buffers are recycled through a per-length
//! free-list kept next to the plans.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use sluice_core::{Cube, CubePool, Extent, PooledCube};

use crate::kernel::ConvolutionKernel;

type C64 = Complex<f64>;

struct PlanCache {
    planner: FftPlanner<f64>,
    forward: HashMap<usize, Arc<dyn Fft<f64>>>,
    inverse: HashMap<usize, Arc<dyn Fft<f64>>>,
}

/// Shared cache of 1-D FFT plans keyed by transform length.
///
/// Constructed explicitly and handed to every [`FftConvolution`] that should
/// share it. Safe to use from many threads.
pub struct FftPlans {
    cache: Mutex<PlanCache>,
    scratch: Mutex<HashMap<usize, Vec<Vec<C64>>>>,
}

/// Zeroed complex buffer borrowed from [`FftPlans`], returned on drop.
struct Scratch<'a> {
    buf: Vec<C64>,
    plans: &'a FftPlans,
}

impl Deref for Scratch<'_> {
    type Target = [C64];

    fn deref(&self) -> &[C64] {
        &self.buf
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut [C64] {
        &mut self.buf
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.plans.scratch.lock().entry(buf.len()).or_default().push(buf);
    }
}

impl Default for FftPlans {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FftPlans {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("FftPlans")
            .field("forward", &cache.forward.len())
            .field("inverse", &cache.inverse.len())
            .field("idle_scratch", &self.idle_scratch())
            .finish()
    }
}

impl FftPlans {
    pub fn new() -> Self {
        Self {
            cache: Mutex::new(PlanCache {
                planner: FftPlanner::new(),
                forward: HashMap::new(),
                inverse: HashMap::new(),
            }),
            scratch: Mutex::new(HashMap::new()),
        }
    }

    fn scratch(&self, len: usize) -> Scratch<'_> {
        let recycled = self.scratch.lock().get_mut(&len).and_then(Vec::pop);
        let buf = match recycled {
            Some(mut buf) => {
                buf.fill(C64::new(0.0, 0.0));
                buf
            }
            None => vec![C64::new(0.0, 0.0); len],
        };
        Scratch { buf, plans: self }
    }

    /// Work buffers parked for reuse, all lengths.
    pub fn idle_scratch(&self) -> usize {
        self.scratch.lock().values().map(Vec::len).sum()
    }

    fn plan(&self, len: usize, inverse: bool) -> Arc<dyn Fft<f64>> {
        let mut cache = self.cache.lock();
        let PlanCache {
            planner,
            forward,
            inverse: inv,
        } = &mut *cache;
        let table = if inverse { inv } else { forward };
        Arc::clone(table.entry(len).or_insert_with(|| {
            tracing::trace!(len, inverse, "planning fft");
            if inverse {
                planner.plan_fft_inverse(len)
            } else {
                planner.plan_fft_forward(len)
            }
        }))
    }

    /// Number of distinct lengths planned so far, both directions.
    pub fn len(&self) -> usize {
        let cache = self.cache.lock();
        cache.forward.len() + cache.inverse.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-place unnormalised 3-D transform of an x-fastest buffer.
    fn transform(&self, buf: &mut [C64], extent: Extent, inverse: bool) {
        let [nx, ny, nz] = extent.dims();
        debug_assert_eq!(buf.len(), extent.numel());

        if nx > 1 {
            // rows along x are contiguous
            self.plan(nx, inverse).process(buf);
        }

        if ny > 1 {
            let fft = self.plan(ny, inverse);
            let mut line = self.scratch(ny);
            for z in 0..nz {
                for x in 0..nx {
                    for (y, v) in line.iter_mut().enumerate() {
                        *v = buf[extent.index(x, y, z)];
                    }
                    fft.process(&mut line);
                    for (y, v) in line.iter().enumerate() {
                        buf[extent.index(x, y, z)] = *v;
                    }
                }
            }
        }

        if nz > 1 {
            let fft = self.plan(nz, inverse);
            let mut line = self.scratch(nz);
            for y in 0..ny {
                for x in 0..nx {
                    for (z, v) in line.iter_mut().enumerate() {
                        *v = buf[extent.index(x, y, z)];
                    }
                    fft.process(&mut line);
                    for (z, v) in line.iter().enumerate() {
                        buf[extent.index(x, y, z)] = *v;
                    }
                }
            }
        }
    }

    /// Full linear convolution of `a` and `b` as a complex buffer of extent
    /// `a + b - 1`. Either operand can be read reversed.
    fn full(&self, a: &Cube, flip_a: bool, b: &Cube, flip_b: bool) -> (Scratch<'_>, Extent) {
        let full = a.extent().full_convolution(&b.extent());
        let mut fa = self.load_padded(a, flip_a, full);
        let mut fb = self.load_padded(b, flip_b, full);

        self.transform(&mut fa, full, false);
        self.transform(&mut fb, full, false);
        for (x, y) in fa.iter_mut().zip(fb.iter()) {
            *x *= *y;
        }
        self.transform(&mut fa, full, true);

        let scale = 1.0 / full.numel() as f64;
        for v in fa.iter_mut() {
            *v *= scale;
        }
        drop(fb);
        (fa, full)
    }

    fn load_padded(&self, c: &Cube, flip: bool, padded: Extent) -> Scratch<'_> {
        let mut buf = self.scratch(padded.numel());
        let [w, h, d] = c.extent().dims();
        for z in 0..d {
            for y in 0..h {
                for x in 0..w {
                    let v = if flip {
                        c.get(w - 1 - x, h - 1 - y, d - 1 - z)
                    } else {
                        c.get(x, y, z)
                    };
                    buf[padded.index(x, y, z)] = C64::new(v, 0.0);
                }
            }
        }
        buf
    }
}

/// Write the real part of `src[offset..offset + r.extent()]` into `r`.
fn crop_into(src: &[C64], src_extent: Extent, offset: [usize; 3], r: &mut Cube, accumulate: bool) {
    let [w, h, d] = r.extent().dims();
    let [ox, oy, oz] = offset;
    for z in 0..d {
        for y in 0..h {
            for x in 0..w {
                let v = src[src_extent.index(x + ox, y + oy, z + oz)].re;
                if accumulate {
                    r[(x, y, z)] += v;
                } else {
                    r[(x, y, z)] = v;
                }
            }
        }
    }
}

fn valid_extent(a: &Cube, b: &Cube, op: &str) -> Extent {
    a.extent().valid_convolution(&b.extent()).unwrap_or_else(|| {
        panic!("{op}: filter {} does not fit input {}", b.extent(), a.extent())
    })
}

fn filter_offset(b: &Cube) -> [usize; 3] {
    let [bx, by, bz] = b.extent().dims();
    [bx - 1, by - 1, bz - 1]
}

/// Convolution kernels computed in the frequency domain.
///
/// Agrees with [`DirectConvolution`](crate::DirectConvolution) to floating
/// point round-off. Pays off once filters get large.
#[derive(Debug, Clone)]
pub struct FftConvolution {
    plans: Arc<FftPlans>,
}

impl FftConvolution {
    pub fn new(plans: Arc<FftPlans>) -> Self {
        Self { plans }
    }

    pub fn plans(&self) -> &Arc<FftPlans> {
        &self.plans
    }

    /// `r += a * b` (valid convolution).
    pub fn convolve_add(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.valid_product(a, false, b, r, true, "convolve_add");
    }

    /// `r = a * b` (valid convolution).
    pub fn convolve_into(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.valid_product(a, false, b, r, false, "convolve_into");
    }

    /// `r += flip(a) * b`.
    pub fn convolve_flipped_add(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.valid_product(a, true, b, r, true, "convolve_flipped_add");
    }

    /// `r = flip(a) * b`.
    pub fn convolve_flipped_into(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.valid_product(a, true, b, r, false, "convolve_flipped_into");
    }

    /// `r += full_correlation(a, b)`.
    pub fn convolve_inverse_add(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.full_product(a, b, r, true);
    }

    /// `r = full_correlation(a, b)`.
    pub fn convolve_inverse_into(&self, a: &Cube, b: &Cube, r: &mut Cube) {
        self.full_product(a, b, r, false);
    }

    fn valid_product(&self, a: &Cube, flip_a: bool, b: &Cube, r: &mut Cube, accumulate: bool, op: &str) {
        let re = valid_extent(a, b, op);
        assert_eq!(r.extent(), re, "{op}: result cube is {}, expected {re}", r.extent());
        let (full, full_extent) = self.plans.full(a, flip_a, b, false);
        crop_into(&full, full_extent, filter_offset(b), r, accumulate);
    }

    fn full_product(&self, a: &Cube, b: &Cube, r: &mut Cube, accumulate: bool) {
        let re = a.extent().full_convolution(&b.extent());
        assert_eq!(
            r.extent(),
            re,
            "convolve_inverse: result cube is {}, expected {re}",
            r.extent()
        );
        let (full, full_extent) = self.plans.full(a, false, b, true);
        crop_into(&full, full_extent, [0, 0, 0], r, accumulate);
    }
}

impl ConvolutionKernel for FftConvolution {
    fn convolve(&self, pool: &CubePool, input: &Cube, filter: &Cube) -> PooledCube {
        let mut r = pool.acquire(valid_extent(input, filter, "convolve"));
        self.convolve_into(input, filter, &mut r);
        r
    }

    fn convolve_flipped(&self, pool: &CubePool, input: &Cube, grad: &Cube) -> PooledCube {
        let mut r = pool.acquire(valid_extent(input, grad, "convolve_flipped"));
        self.convolve_flipped_into(input, grad, &mut r);
        r
    }

    fn convolve_inverse(&self, pool: &CubePool, grad: &Cube, filter: &Cube) -> PooledCube {
        let mut r = pool.acquire(grad.extent().full_convolution(&filter.extent()));
        self.convolve_inverse_into(grad, filter, &mut r);
        r
    }
}
