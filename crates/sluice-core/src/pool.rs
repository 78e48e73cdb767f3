//! Shape-keyed buffer pool.
//!
//! Every pass allocates thousands of identically-shaped feature maps and
//! gradients. Instead of going back to the allocator for each of them, cubes
//! are parked on a per-shape free-list when their owner is done with them and
//! handed out again on the next request for that shape.
//!
//! Each shape class has its own free-list and mutex, so threads working on
//! different shapes never contend. The mutex is held only for the push/pop,
//! never while allocating or copying.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{Cube, Extent};

/// Free-list and counters for one extent.
struct ShapeClass {
    extent: Extent,
    free: Mutex<Vec<Cube>>,
    /// Cubes created by the allocator for this class.
    allocated: AtomicUsize,
    /// Requests served from the free-list.
    reused: AtomicUsize,
    /// Handles currently checked out.
    outstanding: AtomicUsize,
}

impl ShapeClass {
    fn new(extent: Extent) -> Self {
        Self {
            extent,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Cube {
        let recycled = self.free.lock().pop();
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        match recycled {
            Some(cube) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                cube
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Cube::zeros(self.extent)
            }
        }
    }

    fn give_back(&self, cube: Cube) {
        debug_assert_eq!(cube.extent(), self.extent);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(cube);
    }
}

/// Pool of reusable [`Cube`]s, bucketed by [`Extent`].
///
/// Share it as `Arc<CubePool>`. Buffers leave the pool as [`PooledCube`]
/// handles and return automatically when the handle is dropped.
pub struct CubePool {
    classes: RwLock<HashMap<Extent, Arc<ShapeClass>>>,
}

impl fmt::Debug for CubePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("CubePool")
            .field("classes", &stats.classes)
            .field("allocated", &stats.allocated)
            .field("outstanding", &stats.outstanding)
            .field("idle", &stats.idle)
            .finish()
    }
}

impl Default for CubePool {
    fn default() -> Self {
        Self::new()
    }
}

impl CubePool {
    pub fn new() -> Self {
        Self {
            classes: RwLock::new(HashMap::new()),
        }
    }

    /// Look up (or lazily create) the class for `extent`.
    ///
    /// The directory write lock is only taken the first time a shape is seen.
    fn class(&self, extent: Extent) -> Arc<ShapeClass> {
        if let Some(class) = self.classes.read().get(&extent) {
            return Arc::clone(class);
        }
        let mut classes = self.classes.write();
        Arc::clone(
            classes
                .entry(extent)
                .or_insert_with(|| Arc::new(ShapeClass::new(extent))),
        )
    }

    /// Hand out a cube of exactly `extent`. Contents are unspecified.
    pub fn acquire(&self, extent: impl Into<Extent>) -> PooledCube {
        let class = self.class(extent.into());
        let cube = class.take();
        PooledCube {
            cube: Some(cube),
            class,
        }
    }

    /// Hand out a cube of `extent` with every element set to zero.
    pub fn acquire_zeroed(&self, extent: impl Into<Extent>) -> PooledCube {
        let mut c = self.acquire(extent);
        c.fill(0.0);
        c
    }

    /// Place a deep copy of an externally owned cube under pool ownership.
    pub fn copy_into_pool(&self, source: &Cube) -> PooledCube {
        let mut c = self.acquire(source.extent());
        c.copy_from(source);
        c
    }

    /// Return a cube to its free-list. Same as dropping the handle.
    pub fn release(&self, cube: PooledCube) {
        drop(cube);
    }

    /// Take a cube out of the pool for good. It will not be recycled.
    pub fn detach(&self, cube: PooledCube) -> Cube {
        cube.into_inner()
    }

    /// Drop every idle cube. Checked-out cubes are unaffected.
    pub fn clear(&self) {
        let classes = self.classes.read();
        let mut freed = 0;
        for class in classes.values() {
            let mut free = class.free.lock();
            freed += free.len();
            free.clear();
        }
        tracing::debug!(freed, classes = classes.len(), "cube pool cleared");
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let classes = self.classes.read();
        let mut stats = PoolStats {
            classes: classes.len(),
            ..PoolStats::default()
        };
        for class in classes.values() {
            let idle = class.free.lock().len();
            stats.allocated += class.allocated.load(Ordering::Relaxed);
            stats.reused += class.reused.load(Ordering::Relaxed);
            stats.outstanding += class.outstanding.load(Ordering::Relaxed);
            stats.idle += idle;
            stats.idle_bytes += idle * class.extent.numel() * std::mem::size_of::<f64>();
        }
        stats
    }
}

/// Pool counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub classes: usize,
    pub allocated: usize,
    pub reused: usize,
    pub outstanding: usize,
    pub idle: usize,
    pub idle_bytes: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let requests = self.allocated + self.reused;
        let reuse_rate = if requests > 0 {
            self.reused as f64 / requests as f64
        } else {
            0.0
        };
        write!(
            f,
            "CubePool: {} shapes, {} allocated, {} out, {} idle ({:.1} MB), reuse {:.1}%",
            self.classes,
            self.allocated,
            self.outstanding,
            self.idle,
            self.idle_bytes as f64 / (1024.0 * 1024.0),
            reuse_rate * 100.0,
        )
    }
}

/// Single-owner handle to a pooled cube.
///
/// Dereferences to [`Cube`]. Dropping the handle returns the cube to its
/// shape class; the move-only handle makes a double release impossible.
pub struct PooledCube {
    cube: Option<Cube>,
    class: Arc<ShapeClass>,
}

impl PooledCube {
    /// Detach the cube from the pool.
    pub fn into_inner(mut self) -> Cube {
        let cube = self.cube.take().expect("PooledCube already released");
        self.class.outstanding.fetch_sub(1, Ordering::Relaxed);
        cube
    }

    /// Owned copy of the contents, leaving the pooled cube in place.
    pub fn to_cube(&self) -> Cube {
        Cube::clone(self)
    }
}

impl Deref for PooledCube {
    type Target = Cube;

    fn deref(&self) -> &Cube {
        self.cube.as_ref().expect("PooledCube already released")
    }
}

impl DerefMut for PooledCube {
    fn deref_mut(&mut self) -> &mut Cube {
        self.cube.as_mut().expect("PooledCube already released")
    }
}

impl Drop for PooledCube {
    fn drop(&mut self) {
        if let Some(cube) = self.cube.take() {
            self.class.give_back(cube);
        }
    }
}

impl fmt::Debug for PooledCube {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cube {
            Some(c) => write!(f, "Pooled{c:?}"),
            None => write!(f, "PooledCube(released)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_shape() {
        let pool = CubePool::new();
        let c = pool.acquire([5, 5, 1]);
        assert_eq!(c.extent(), Extent::new(5, 5, 1));
        assert_eq!(c.len(), 25);
    }

    #[test]
    fn test_release_then_acquire_reuses() {
        let pool = CubePool::new();
        let c = pool.acquire([4, 4, 2]);
        pool.release(c);
        let c = pool.acquire([4, 4, 2]);
        assert_eq!(c.extent(), Extent::new(4, 4, 2));

        let stats = pool.stats();
        assert_eq!(stats.allocated, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.outstanding, 1);
    }

    #[test]
    fn test_held_cubes_are_distinct() {
        let pool = CubePool::new();
        let a = pool.acquire([3, 3, 3]);
        let b = pool.acquire([3, 3, 3]);
        assert_ne!(a.as_slice().as_ptr(), b.as_slice().as_ptr());
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn test_acquire_zeroed_clears_stale_data() {
        let pool = CubePool::new();
        let mut c = pool.acquire([2, 2, 1]);
        c.fill(9.0);
        drop(c);
        let c = pool.acquire_zeroed([2, 2, 1]);
        assert!(c.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_copy_into_pool() {
        let pool = CubePool::new();
        let src = Cube::from_fn([3, 2, 1], |x, y, _| (x * y) as f64);
        let c = pool.copy_into_pool(&src);
        assert_eq!(*c, src);
    }

    #[test]
    fn test_detach_leaves_pool() {
        let pool = CubePool::new();
        let c = pool.acquire([2, 2, 2]);
        let owned = pool.detach(c);
        assert_eq!(owned.len(), 8);
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.idle, 0);
    }

    #[test]
    fn test_shapes_are_independent() {
        let pool = CubePool::new();
        drop(pool.acquire([2, 2, 1]));
        let c = pool.acquire([3, 3, 1]);
        assert_eq!(c.extent(), Extent::new(3, 3, 1));
        let stats = pool.stats();
        assert_eq!(stats.classes, 2);
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.idle, 1);
    }

    #[test]
    fn test_clear_drops_idle() {
        let pool = CubePool::new();
        drop(pool.acquire([8, 8, 1]));
        assert_eq!(pool.stats().idle, 1);
        pool.clear();
        assert_eq!(pool.stats().idle, 0);
    }

    #[test]
    fn test_handle_outlives_pool() {
        let pool = CubePool::new();
        let c = pool.acquire([2, 1, 1]);
        drop(pool);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let pool = Arc::new(CubePool::new());
        std::thread::scope(|s| {
            for t in 0..8 {
                let pool = Arc::clone(&pool);
                s.spawn(move || {
                    let extent = Extent::new(4 + t % 2, 4, 1);
                    for _ in 0..200 {
                        let mut c = pool.acquire(extent);
                        c.fill(t as f64);
                        assert!(c.as_slice().iter().all(|&v| v == t as f64));
                    }
                });
            }
        });
        let stats = pool.stats();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.allocated + stats.reused, 8 * 200);
        assert_eq!(stats.idle, stats.allocated);
    }

    #[test]
    fn test_stats_display() {
        let pool = CubePool::new();
        drop(pool.acquire([2, 2, 1]));
        let text = pool.stats().to_string();
        assert!(text.starts_with("CubePool: 1 shapes"));
    }
}
