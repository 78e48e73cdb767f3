//! # sluice-kernels
//!
//! Pure numeric kernels over [`Cube`](sluice_core::Cube)s used by the engine:
//!
//! - direct 3-D convolution, flipped correlation and full ("inverse")
//!   correlation, each with an accumulating `_add` form
//! - the same three products computed through zero-padded FFTs
//! - element-wise transfer (activation) functions and their gradients
//!
//! Kernels hold no hidden state. The only cache, the FFT plan table, lives in
//! an explicitly constructed [`FftPlans`] value.

pub mod convolve;
pub mod fft;
pub mod kernel;
pub mod transfer;

pub use convolve::DirectConvolution;
pub use fft::{FftConvolution, FftPlans};
pub use kernel::{ConvolutionKernel, ConvolutionKind, Convolver};
pub use transfer::TransferFn;
