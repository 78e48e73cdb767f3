//! The convolution capability seen by the engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_core::{Cube, CubePool, PooledCube};

use crate::convolve::DirectConvolution;
use crate::fft::{FftConvolution, FftPlans};

/// The three products a layer executor needs, with results drawn from a pool.
pub trait ConvolutionKernel: Send + Sync {
    /// Forward: valid convolution of an input feature map with a filter.
    fn convolve(&self, pool: &CubePool, input: &Cube, filter: &Cube) -> PooledCube;

    /// Weight gradient: flipped input correlated with an output gradient.
    fn convolve_flipped(&self, pool: &CubePool, input: &Cube, grad: &Cube) -> PooledCube;

    /// Back-propagation: full correlation of an output gradient with a filter.
    fn convolve_inverse(&self, pool: &CubePool, grad: &Cube, filter: &Cube) -> PooledCube;
}

/// Which convolution implementation a network runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvolutionKind {
    #[default]
    Direct,
    Fft,
}

impl std::str::FromStr for ConvolutionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "fft" => Ok(Self::Fft),
            other => Err(format!("unknown convolution kind '{other}' (expected direct or fft)")),
        }
    }
}

/// Closed set of convolution implementations.
#[derive(Debug, Clone)]
pub enum Convolver {
    Direct(DirectConvolution),
    Fft(FftConvolution),
}

impl Convolver {
    /// Build the implementation for `kind`. FFT variants share `plans`.
    pub fn new(kind: ConvolutionKind, plans: &Arc<FftPlans>) -> Self {
        match kind {
            ConvolutionKind::Direct => Self::Direct(DirectConvolution),
            ConvolutionKind::Fft => Self::Fft(FftConvolution::new(Arc::clone(plans))),
        }
    }

    pub fn kind(&self) -> ConvolutionKind {
        match self {
            Self::Direct(_) => ConvolutionKind::Direct,
            Self::Fft(_) => ConvolutionKind::Fft,
        }
    }
}

impl ConvolutionKernel for Convolver {
    fn convolve(&self, pool: &CubePool, input: &Cube, filter: &Cube) -> PooledCube {
        match self {
            Self::Direct(k) => k.convolve(pool, input, filter),
            Self::Fft(k) => k.convolve(pool, input, filter),
        }
    }

    fn convolve_flipped(&self, pool: &CubePool, input: &Cube, grad: &Cube) -> PooledCube {
        match self {
            Self::Direct(k) => k.convolve_flipped(pool, input, grad),
            Self::Fft(k) => k.convolve_flipped(pool, input, grad),
        }
    }

    fn convolve_inverse(&self, pool: &CubePool, grad: &Cube, filter: &Cube) -> PooledCube {
        match self {
            Self::Direct(k) => k.convolve_inverse(pool, grad, filter),
            Self::Fft(k) => k.convolve_inverse(pool, grad, filter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("FFT".parse::<ConvolutionKind>().unwrap(), ConvolutionKind::Fft);
        assert_eq!("direct".parse::<ConvolutionKind>().unwrap(), ConvolutionKind::Direct);
        assert!("winograd".parse::<ConvolutionKind>().is_err());
    }

    #[test]
    fn test_kind_serde() {
        let json = serde_json::to_string(&ConvolutionKind::Fft).unwrap();
        assert_eq!(json, "\"fft\"");
    }

    #[test]
    fn test_convolver_kind() {
        let plans = Arc::new(FftPlans::new());
        assert_eq!(Convolver::new(ConvolutionKind::Fft, &plans).kind(), ConvolutionKind::Fft);
        assert_eq!(Convolver::new(ConvolutionKind::Direct, &plans).kind(), ConvolutionKind::Direct);
    }
}
