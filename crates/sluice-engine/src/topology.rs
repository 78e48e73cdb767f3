//! Network topology and per-layer weights.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sluice_core::{Cube, Extent, Result, SluiceError};
use sluice_kernels::ConvolutionKind;

/// Initial weights are drawn from `[-INIT_RANGE, INIT_RANGE)`.
pub const INIT_RANGE: f64 = 0.05;

/// One fully connected convolutional layer.
///
/// Every input feature map is convolved with its own filter for every output
/// slot, so the layer holds `num_inputs * num_outputs` filters of `filter`
/// extent and one bias per output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub num_outputs: usize,
    pub filter: Extent,
    pub learning_rate: f64,
    #[serde(default)]
    pub kind: ConvolutionKind,
}

impl LayerSpec {
    pub fn new(num_outputs: usize, filter: impl Into<Extent>, learning_rate: f64) -> Self {
        Self {
            num_outputs,
            filter: filter.into(),
            learning_rate,
            kind: ConvolutionKind::default(),
        }
    }

    pub fn with_kind(mut self, kind: ConvolutionKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Ordered list of layers fed by `num_inputs` input feature maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub num_inputs: usize,
    pub layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    pub fn new(num_inputs: usize) -> Self {
        Self {
            num_inputs,
            layers: Vec::new(),
        }
    }

    pub fn add_layer(&mut self, layer: LayerSpec) -> &mut Self {
        self.layers.push(layer);
        self
    }

    pub fn with_layer(mut self, layer: LayerSpec) -> Self {
        self.layers.push(layer);
        self
    }

    pub fn pop_layer(&mut self) -> Option<LayerSpec> {
        self.layers.pop()
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of feature maps feeding layer `l`.
    pub fn layer_inputs(&self, l: usize) -> usize {
        if l == 0 {
            self.num_inputs
        } else {
            self.layers[l - 1].num_outputs
        }
    }

    /// Number of feature maps the network produces.
    pub fn num_outputs(&self) -> usize {
        self.layers.last().map_or(self.num_inputs, |l| l.num_outputs)
    }

    /// Smallest input extent that yields a 1x1x1 output.
    pub fn field_of_view(&self) -> Extent {
        self.layers
            .iter()
            .rev()
            .fold(Extent::ONE, |fov, layer| fov + layer.filter - Extent::ONE)
    }

    /// Output extent of every layer for inputs of `input` extent, or `None`
    /// if some filter does not fit the feature map it is applied to.
    pub fn layer_extents(&self, input: Extent) -> Option<Vec<Extent>> {
        let mut current = input;
        let mut extents = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            current = current.valid_convolution(&layer.filter)?;
            extents.push(current);
        }
        Some(extents)
    }

    /// Extent of the network's outputs for inputs of `input` extent.
    pub fn output_extent(&self, input: Extent) -> Option<Extent> {
        self.layer_extents(input)
            .map(|e| e.last().copied().unwrap_or(input))
    }

    /// Total number of trainable parameters. Panics on overflow; a validated
    /// topology never overflows.
    pub fn param_count(&self) -> usize {
        (0..self.layers.len())
            .map(|l| {
                let layer = &self.layers[l];
                self.layer_inputs(l) * layer.num_outputs * layer.filter.numel() + layer.num_outputs
            })
            .sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_inputs == 0 {
            return Err(SluiceError::InvalidTopology("network needs at least one input".into()));
        }
        if self.layers.is_empty() {
            return Err(SluiceError::InvalidTopology("network needs at least one layer".into()));
        }
        for (l, layer) in self.layers.iter().enumerate() {
            if layer.num_outputs == 0 {
                return Err(SluiceError::InvalidTopology(format!("layer {l} has no outputs")));
            }
            if layer.filter.is_empty() {
                return Err(SluiceError::InvalidTopology(format!(
                    "layer {l} has empty filter {}",
                    layer.filter
                )));
            }
            if !layer.learning_rate.is_finite() || layer.learning_rate <= 0.0 {
                return Err(SluiceError::InvalidTopology(format!(
                    "layer {l} learning rate {} must be positive and finite",
                    layer.learning_rate
                )));
            }
        }
        let fov = self.layers.iter().rev().try_fold(Extent::ONE, |fov, layer| {
            fov.checked_add(&layer.filter).map(|e| e - Extent::ONE)
        });
        if fov.and_then(|e| e.checked_numel()).is_none() {
            return Err(SluiceError::InvalidTopology("field of view overflows".into()));
        }
        if self.checked_param_count().is_none() {
            return Err(SluiceError::InvalidTopology("parameter count overflows".into()));
        }
        Ok(())
    }

    /// Parameter count, `None` if it or its size in bytes overflows `usize`.
    fn checked_param_count(&self) -> Option<usize> {
        let count = self.layers.iter().enumerate().try_fold(0usize, |total, (l, layer)| {
            let filters = self
                .layer_inputs(l)
                .checked_mul(layer.num_outputs)?
                .checked_mul(layer.filter.checked_numel()?)?;
            total.checked_add(filters)?.checked_add(layer.num_outputs)
        })?;
        count.checked_mul(std::mem::size_of::<f64>())?;
        Some(count)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let spec: Self = serde_json::from_str(&text)?;
        spec.validate()?;
        Ok(spec)
    }
}

/// Filters and biases of one layer. `filters[i][o]` connects input `i` to
/// output `o`.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerWeights {
    pub filters: Vec<Vec<Cube>>,
    pub biases: Vec<f64>,
}

impl LayerWeights {
    pub fn random<R: Rng + ?Sized>(num_inputs: usize, layer: &LayerSpec, rng: &mut R) -> Self {
        let filters = (0..num_inputs)
            .map(|_| {
                (0..layer.num_outputs)
                    .map(|_| Cube::random_uniform(layer.filter, rng, -INIT_RANGE, INIT_RANGE))
                    .collect()
            })
            .collect();
        let biases = (0..layer.num_outputs)
            .map(|_| rng.gen_range(-INIT_RANGE..INIT_RANGE))
            .collect();
        Self { filters, biases }
    }

    /// Every filter element set to `weight`, every bias to `bias`.
    pub fn constant(num_inputs: usize, layer: &LayerSpec, weight: f64, bias: f64) -> Self {
        Self {
            filters: vec![vec![Cube::filled(layer.filter, weight); layer.num_outputs]; num_inputs],
            biases: vec![bias; layer.num_outputs],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.filters.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.biases.len()
    }

    pub fn filter(&self, input: usize, output: usize) -> &Cube {
        &self.filters[input][output]
    }

    /// Check the weights fit layer `l` of `spec`.
    pub fn check(&self, spec: &NetworkSpec, l: usize) -> Result<()> {
        let layer = &spec.layers[l];
        let num_inputs = spec.layer_inputs(l);
        if self.filters.len() != num_inputs || self.biases.len() != layer.num_outputs {
            return Err(SluiceError::InvalidTopology(format!(
                "layer {l}: weights are {}x{}, topology is {}x{}",
                self.filters.len(),
                self.biases.len(),
                num_inputs,
                layer.num_outputs
            )));
        }
        for row in &self.filters {
            if row.len() != layer.num_outputs {
                return Err(SluiceError::InvalidTopology(format!(
                    "layer {l}: filter row has {} outputs, expected {}",
                    row.len(),
                    layer.num_outputs
                )));
            }
            if let Some(bad) = row.iter().find(|f| f.extent() != layer.filter) {
                return Err(SluiceError::ShapeMismatch {
                    expected: layer.filter,
                    got: bad.extent(),
                });
            }
        }
        Ok(())
    }
}

/// Seeded random weights for every layer of `spec`.
pub fn random_weights(spec: &NetworkSpec, seed: u64) -> Vec<LayerWeights> {
    let mut rng = StdRng::seed_from_u64(seed);
    spec.layers
        .iter()
        .enumerate()
        .map(|(l, layer)| LayerWeights::random(spec.layer_inputs(l), layer, &mut rng))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_layer() -> NetworkSpec {
        NetworkSpec::new(2)
            .with_layer(LayerSpec::new(4, [3, 3, 1], 0.1))
            .with_layer(LayerSpec::new(3, [2, 2, 1], 0.1))
            .with_layer(LayerSpec::new(1, [4, 4, 1], 0.05))
    }

    #[test]
    fn test_field_of_view() {
        let spec = three_layer();
        // 1 + (4-1) + (2-1) + (3-1)
        assert_eq!(spec.field_of_view(), Extent::new(7, 7, 1));
        assert_eq!(NetworkSpec::new(1).field_of_view(), Extent::ONE);
        assert_eq!(spec.output_extent(spec.field_of_view()), Some(Extent::ONE));
    }

    #[test]
    fn test_layer_extents() {
        let spec = three_layer();
        let extents = spec.layer_extents(Extent::new(10, 9, 1)).unwrap();
        assert_eq!(
            extents,
            vec![Extent::new(8, 7, 1), Extent::new(7, 6, 1), Extent::new(4, 3, 1)]
        );
        assert!(spec.layer_extents(Extent::new(5, 5, 1)).is_none());
    }

    #[test]
    fn test_add_pop_layer() {
        let mut spec = NetworkSpec::new(1);
        spec.add_layer(LayerSpec::new(2, [3, 3, 1], 0.1))
            .add_layer(LayerSpec::new(1, [1, 1, 1], 0.1));
        assert_eq!(spec.num_layers(), 2);
        assert_eq!(spec.num_outputs(), 1);
        assert_eq!(spec.layer_inputs(1), 2);
        let popped = spec.pop_layer().unwrap();
        assert_eq!(popped.num_outputs, 1);
        assert_eq!(spec.num_outputs(), 2);
    }

    #[test]
    fn test_param_count() {
        let spec = NetworkSpec::new(2).with_layer(LayerSpec::new(3, [2, 2, 1], 0.1));
        assert_eq!(spec.param_count(), 2 * 3 * 4 + 3);
    }

    #[test]
    fn test_validate_rejects_overflowing_sizes() {
        let huge = NetworkSpec::new(1).with_layer(LayerSpec::new(1, [1 << 32, 1 << 32, 16], 0.1));
        assert!(matches!(huge.validate(), Err(SluiceError::InvalidTopology(_))));

        let wide = NetworkSpec::new(usize::MAX / 2).with_layer(LayerSpec::new(4, [1, 1, 1], 0.1));
        assert!(matches!(wide.validate(), Err(SluiceError::InvalidTopology(_))));

        let tall = NetworkSpec::new(1)
            .with_layer(LayerSpec::new(1, [usize::MAX, 1, 1], 0.1))
            .with_layer(LayerSpec::new(1, [2, 1, 1], 0.1));
        assert!(matches!(tall.validate(), Err(SluiceError::InvalidTopology(_))));
    }

    #[test]
    fn test_validate() {
        assert!(three_layer().validate().is_ok());
        assert!(NetworkSpec::new(1).validate().is_err());
        assert!(NetworkSpec::new(0)
            .with_layer(LayerSpec::new(1, [1, 1, 1], 0.1))
            .validate()
            .is_err());
        assert!(NetworkSpec::new(1)
            .with_layer(LayerSpec::new(1, [1, 1, 1], -0.1))
            .validate()
            .is_err());
        assert!(NetworkSpec::new(1)
            .with_layer(LayerSpec::new(1, [0, 1, 1], 0.1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let spec = three_layer();
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"filter\":[3,3,1]"));
        let back: NetworkSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_random_weights_shapes_and_range() {
        let spec = three_layer();
        let weights = random_weights(&spec, 42);
        assert_eq!(weights.len(), 3);
        for (l, w) in weights.iter().enumerate() {
            w.check(&spec, l).unwrap();
            for row in &w.filters {
                for f in row {
                    assert!(f.as_slice().iter().all(|v| v.abs() <= INIT_RANGE));
                }
            }
        }
        assert_eq!(random_weights(&spec, 42), weights);
    }

    #[test]
    fn test_check_rejects_wrong_filter() {
        let spec = three_layer();
        let mut w = LayerWeights::constant(2, &spec.layers[0], 1.0, 0.0);
        w.filters[1][2] = Cube::zeros([2, 2, 1]);
        assert!(matches!(w.check(&spec, 0), Err(SluiceError::ShapeMismatch { .. })));
        let w = LayerWeights::constant(3, &spec.layers[0], 1.0, 0.0);
        assert!(matches!(w.check(&spec, 0), Err(SluiceError::InvalidTopology(_))));
    }
}
