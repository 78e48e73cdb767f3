//! # sluice-core
//!
//! Core buffer types for the Sluice training engine.
//!
//! Provides:
//! - [`Extent`], the (width, height, depth) shape of every feature map and filter
//! - [`Cube`], a dense 3-D `f64` buffer
//! - [`CubePool`], a shape-keyed free-list pool handing out [`PooledCube`]s
//! - [`CountdownLatch`], a reusable "wait for N completions" primitive

pub mod cube;
pub mod error;
pub mod extent;
pub mod latch;
pub mod pool;

pub use cube::Cube;
pub use error::SluiceError;
pub use extent::Extent;
pub use latch::CountdownLatch;
pub use pool::{CubePool, PoolStats, PooledCube};

pub type Result<T> = std::result::Result<T, SluiceError>;
