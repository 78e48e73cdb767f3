//! Element-wise transfer (activation) functions.
//!
//! Gradients are expressed in terms of the *activated* value `f = value(x)`,
//! which is what the engine keeps around after the forward pass.

use serde::{Deserialize, Serialize};
use sluice_core::Cube;

/// Activation applied to every feature map after bias is added.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferFn {
    /// `f(x) = x`.
    Identity,
    /// `f(x) = 1 / (1 + e^-x)`.
    Sigmoid,
    /// `f(x) = a * tanh(b * x)`.
    HyperbolicTangent { a: f64, b: f64 },
    /// `f(x) = max(0, x)`.
    RectifyLinear,
    /// Sigmoid value with a unit gradient, for use under a logistic loss
    /// whose derivative already folds in the sigmoid's.
    LogisticSigmoid,
}

impl Default for TransferFn {
    fn default() -> Self {
        Self::Sigmoid
    }
}

impl TransferFn {
    /// LeCun's scaled tanh.
    pub const fn tanh() -> Self {
        Self::HyperbolicTangent { a: 1.7159, b: 0.6666 }
    }

    #[inline]
    pub fn value(&self, x: f64) -> f64 {
        match *self {
            Self::Identity => x,
            Self::Sigmoid | Self::LogisticSigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::HyperbolicTangent { a, b } => a * (b * x).tanh(),
            Self::RectifyLinear => x.max(0.0),
        }
    }

    /// `df/dx` evaluated at the activated value `f`.
    #[inline]
    pub fn grad(&self, f: f64) -> f64 {
        match *self {
            Self::Identity | Self::LogisticSigmoid => 1.0,
            Self::Sigmoid => f * (1.0 - f),
            Self::HyperbolicTangent { a, b } => (b / a) * (a - f) * (a + f),
            Self::RectifyLinear => {
                if f > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Activate `c` in place.
    pub fn apply(&self, c: &mut Cube) {
        if *self == Self::Identity {
            return;
        }
        for v in c.as_mut_slice() {
            *v = self.value(*v);
        }
    }

    /// Add `bias` to every element, then activate in place.
    pub fn add_apply(&self, bias: f64, c: &mut Cube) {
        for v in c.as_mut_slice() {
            *v = self.value(*v + bias);
        }
    }

    /// Multiply `grad` element-wise by `df/dx` at the activated values.
    pub fn apply_grad(&self, grad: &mut Cube, activated: &Cube) {
        assert_eq!(
            grad.extent(),
            activated.extent(),
            "apply_grad: gradient {} does not match feature map {}",
            grad.extent(),
            activated.extent()
        );
        if matches!(self, Self::Identity | Self::LogisticSigmoid) {
            return;
        }
        for (g, &f) in grad.as_mut_slice().iter_mut().zip(activated.as_slice()) {
            *g *= self.grad(f);
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Sigmoid => "sigmoid",
            Self::HyperbolicTangent { .. } => "tanh",
            Self::RectifyLinear => "relu",
            Self::LogisticSigmoid => "logistic_sigmoid",
        }
    }
}

impl std::str::FromStr for TransferFn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Self::Identity),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::tanh()),
            "relu" => Ok(Self::RectifyLinear),
            "logistic_sigmoid" | "logreg" => Ok(Self::LogisticSigmoid),
            other => Err(format!("unknown transfer function '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64, tol: f64) {
        assert!((a - b).abs() < tol, "{a} vs {b}");
    }

    const ALL: [TransferFn; 5] = [
        TransferFn::Identity,
        TransferFn::Sigmoid,
        TransferFn::tanh(),
        TransferFn::RectifyLinear,
        TransferFn::LogisticSigmoid,
    ];

    #[test]
    fn test_values() {
        assert_close(TransferFn::Sigmoid.value(0.0), 0.5, 1e-12);
        assert_close(TransferFn::tanh().value(0.0), 0.0, 1e-12);
        assert_close(TransferFn::tanh().value(1e6), 1.7159, 1e-9);
        assert_eq!(TransferFn::RectifyLinear.value(-3.0), 0.0);
        assert_eq!(TransferFn::Identity.value(-3.0), -3.0);
    }

    #[test]
    fn test_grad_matches_finite_difference() {
        let eps = 1e-6;
        for f in ALL {
            if f == TransferFn::LogisticSigmoid {
                continue;
            }
            for &x in &[-1.3, -0.2, 0.4, 2.1] {
                let numeric = (f.value(x + eps) - f.value(x - eps)) / (2.0 * eps);
                assert_close(f.grad(f.value(x)), numeric, 1e-6);
            }
        }
    }

    #[test]
    fn test_logistic_sigmoid_unit_grad() {
        let f = TransferFn::LogisticSigmoid;
        assert_eq!(f.grad(0.3), 1.0);
        assert_close(f.value(0.0), 0.5, 1e-12);
    }

    #[test]
    fn test_add_apply_and_apply_grad() {
        let f = TransferFn::Sigmoid;
        let mut c = Cube::filled([2, 2, 1], -1.0);
        f.add_apply(1.0, &mut c);
        assert!(c.as_slice().iter().all(|&v| (v - 0.5).abs() < 1e-12));

        let mut g = Cube::filled([2, 2, 1], 2.0);
        f.apply_grad(&mut g, &c);
        assert!(g.as_slice().iter().all(|&v| (v - 0.5).abs() < 1e-12));
    }

    #[test]
    fn test_identity_apply_is_noop() {
        let mut c = Cube::from_vec([2, 1, 1], vec![-2.0, 3.0]);
        TransferFn::Identity.apply(&mut c);
        assert_eq!(c.as_slice(), &[-2.0, 3.0]);
    }

    #[test]
    fn test_parse_and_serde() {
        for f in ALL {
            assert_eq!(f.name().parse::<TransferFn>().unwrap(), f);
            let json = serde_json::to_string(&f).unwrap();
            let back: TransferFn = serde_json::from_str(&json).unwrap();
            assert_eq!(back, f);
        }
        let t: TransferFn = serde_json::from_str(r#"{"type":"hyperbolic_tangent","a":1.0,"b":2.0}"#).unwrap();
        assert_eq!(t, TransferFn::HyperbolicTangent { a: 1.0, b: 2.0 });
    }

    #[test]
    #[should_panic(expected = "does not match")]
    fn test_apply_grad_mismatch_panics() {
        let mut g = Cube::zeros([2, 2, 1]);
        TransferFn::Sigmoid.apply_grad(&mut g, &Cube::zeros([3, 3, 1]));
    }
}
