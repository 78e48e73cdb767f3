//! Per-layer executor: the perceptron nodes of one layer and the work each
//! forward or backward task performs on them.
//!
//! A layer with `I` inputs and `O` outputs owns `O` output nodes, each
//! completing after `I` forward contributions, and `I` input nodes, each
//! completing after `O` backward contributions. The executor computes and
//! reports completions; scheduling the per-pair work and chaining to
//! neighbouring layers is the engine's job.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use sluice_core::{Cube, CubePool, PooledCube};
use sluice_kernels::{ConvolutionKernel, Convolver, TransferFn};

use crate::accumulator::FanIn;
use crate::topology::{LayerSpec, LayerWeights};

/// Feature map shared between the layer producing it and the one consuming it.
pub type FeatureMap = Arc<PooledCube>;

struct InputNode {
    /// Backward: one contribution per output slot.
    fan_in: FanIn<PooledCube>,
    featuremap: Mutex<Option<FeatureMap>>,
    /// `dE/dW[i][o]` for every output `o`.
    weight_grads: Vec<Mutex<Option<PooledCube>>>,
}

struct OutputNode {
    /// Forward: one contribution per input slot.
    fan_in: FanIn<PooledCube>,
    featuremap: Mutex<Option<FeatureMap>>,
    bias_grad: Mutex<f64>,
}

/// What a completed input node hands back during the backward pass.
#[derive(Debug)]
pub enum InputGradient {
    /// `dE/d(input)`, summed over every output slot.
    Propagate(PooledCube),
    /// First layer: every output slot has been accounted for, nothing to pass on.
    Counted,
}

pub struct LayerExecutor {
    index: usize,
    spec: LayerSpec,
    kernel: Convolver,
    weights: RwLock<LayerWeights>,
    inputs: Vec<InputNode>,
    outputs: Vec<OutputNode>,
}

impl std::fmt::Debug for LayerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerExecutor")
            .field("index", &self.index)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("filter", &self.spec.filter)
            .field("kernel", &self.kernel.kind())
            .finish()
    }
}

impl LayerExecutor {
    pub fn new(index: usize, spec: LayerSpec, weights: LayerWeights, kernel: Convolver) -> Self {
        let num_inputs = weights.num_inputs();
        let num_outputs = spec.num_outputs;
        let inputs = (0..num_inputs)
            .map(|_| InputNode {
                fan_in: FanIn::new(num_outputs),
                featuremap: Mutex::new(None),
                weight_grads: (0..num_outputs).map(|_| Mutex::new(None)).collect(),
            })
            .collect();
        let outputs = (0..num_outputs)
            .map(|_| OutputNode {
                fan_in: FanIn::new(num_inputs),
                featuremap: Mutex::new(None),
                bias_grad: Mutex::new(0.0),
            })
            .collect();
        Self {
            index,
            spec,
            kernel,
            weights: RwLock::new(weights),
            inputs,
            outputs,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> &LayerSpec {
        &self.spec
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    pub fn weights(&self) -> RwLockReadGuard<'_, LayerWeights> {
        self.weights.read()
    }

    /// Modify the weights between passes.
    pub(crate) fn update_weights<R>(&self, f: impl FnOnce(&mut LayerWeights) -> R) -> R {
        f(&mut self.weights.write())
    }

    /// Install the feature map read by input slot `i`.
    pub(crate) fn set_input(&self, i: usize, featuremap: FeatureMap) {
        *self.inputs[i].featuremap.lock() = Some(featuremap);
    }

    pub fn input(&self, i: usize) -> Option<FeatureMap> {
        self.inputs[i].featuremap.lock().clone()
    }

    pub fn output(&self, o: usize) -> Option<FeatureMap> {
        self.outputs[o].featuremap.lock().clone()
    }

    /// `dE/dW` for the filter connecting input `i` to output `o`, from the
    /// latest backward pass.
    pub fn weight_gradient(&self, i: usize, o: usize) -> Option<Cube> {
        self.inputs[i].weight_grads[o].lock().as_ref().map(|g| g.to_cube())
    }

    pub fn bias_gradient(&self, o: usize) -> f64 {
        *self.outputs[o].bias_grad.lock()
    }

    /// Forward entry for input slot `i`: hands its feature map to `spawn` once
    /// per output slot. Each `(i, o)` pair is then finished by
    /// [`forward_filter`](Self::forward_filter), typically as its own task.
    pub fn run_forward(&self, i: usize, mut spawn: impl FnMut(usize, FeatureMap)) {
        let Some(input) = self.input(i) else {
            panic!("layer {}: forward on input {i} before its feature map arrived", self.index);
        };
        for o in 0..self.outputs.len() {
            spawn(o, Arc::clone(&input));
        }
    }

    /// Convolve input `i` with the filter to output `o` and fold the result
    /// into that output's node.
    ///
    /// Returns the activated feature map, already published, to the one call
    /// that completes the node.
    pub fn forward_filter(
        &self,
        pool: &CubePool,
        transfer: TransferFn,
        input: &Cube,
        i: usize,
        o: usize,
    ) -> Option<FeatureMap> {
        let node = &self.outputs[o];
        let weights = self.weights.read();
        let partial = self.kernel.convolve(pool, input, weights.filter(i, o));
        let mut sum = node.fan_in.contribute(partial)?;
        transfer.add_apply(weights.biases[o], &mut sum);
        let featuremap = Arc::new(sum);
        *node.featuremap.lock() = Some(Arc::clone(&featuremap));
        tracing::trace!(layer = self.index, output = o, "forward node complete");
        Some(featuremap)
    }

    /// Backward entry for output slot `o` given `dE/d(out_o)`.
    ///
    /// Turns `grad` into the gradient at the node's pre-activation, records
    /// `dE/dB[o]` and hands the shared result to `spawn` once per input slot.
    /// Each `(i, o)` pair is then finished by
    /// [`backward_filter`](Self::backward_filter).
    pub fn run_backward(
        &self,
        transfer: TransferFn,
        o: usize,
        mut grad: PooledCube,
        mut spawn: impl FnMut(usize, Arc<PooledCube>),
    ) {
        let Some(activated) = self.output(o) else {
            panic!("layer {}: backward on output {o} without a forward pass", self.index);
        };
        transfer.apply_grad(&mut grad, &activated);
        *self.outputs[o].bias_grad.lock() = grad.sum();

        let grad = Arc::new(grad);
        for i in 0..self.inputs.len() {
            spawn(i, Arc::clone(&grad));
        }
    }

    /// Record `dE/dW[i][o]` and fold the back-propagated gradient into input
    /// node `i`, or only count the arrival when `propagate` is unset.
    ///
    /// Returns the input node's completion to the one call that completes it.
    pub fn backward_filter(
        &self,
        pool: &CubePool,
        i: usize,
        o: usize,
        grad: &Cube,
        propagate: bool,
    ) -> Option<InputGradient> {
        let node = &self.inputs[i];
        let Some(input) = self.input(i) else {
            panic!("layer {}: backward with input {i} missing", self.index);
        };
        let dw = self.kernel.convolve_flipped(pool, &input, grad);
        *node.weight_grads[o].lock() = Some(dw);

        if propagate {
            let back = self.kernel.convolve_inverse(pool, grad, self.weights.read().filter(i, o));
            let sum = node.fan_in.contribute(back)?;
            tracing::trace!(layer = self.index, input = i, "backward node complete");
            Some(InputGradient::Propagate(sum))
        } else {
            node.fan_in.tick().then_some(InputGradient::Counted)
        }
    }

    /// `bias -= lr * dE/dB`, `filter -= lr * dE/dW` using the latest gradients.
    ///
    /// Only called between passes, so the write lock is uncontended.
    pub(crate) fn apply_gradients(&self) {
        let lr = self.spec.learning_rate;
        let mut weights = self.weights.write();
        for (o, node) in self.outputs.iter().enumerate() {
            weights.biases[o] -= lr * *node.bias_grad.lock();
        }
        for (i, node) in self.inputs.iter().enumerate() {
            for (o, grad) in node.weight_grads.iter().enumerate() {
                if let Some(grad) = grad.lock().as_ref() {
                    weights.filters[i][o].add_scaled(-lr, grad);
                }
            }
        }
    }

    /// Drop every stored feature map and gradient, returning them to the pool.
    pub(crate) fn clear(&self) {
        for node in &self.inputs {
            node.fan_in.reset();
            *node.featuremap.lock() = None;
            for g in &node.weight_grads {
                *g.lock() = None;
            }
        }
        for node in &self.outputs {
            node.fan_in.reset();
            *node.featuremap.lock() = None;
            *node.bias_grad.lock() = 0.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_kernels::DirectConvolution;

    fn layer(num_inputs: usize, num_outputs: usize) -> LayerExecutor {
        let spec = LayerSpec::new(num_outputs, [2, 2, 1], 0.5);
        let weights = LayerWeights::constant(num_inputs, &spec, 1.0, 0.0);
        LayerExecutor::new(0, spec, weights, Convolver::Direct(DirectConvolution))
    }

    /// Run every forward pair of input `i` inline, collecting completions.
    fn forward_inline(layer: &LayerExecutor, pool: &CubePool, i: usize) -> Vec<(usize, FeatureMap)> {
        let mut pairs = Vec::new();
        layer.run_forward(i, |o, input| pairs.push((o, input)));
        pairs
            .into_iter()
            .filter_map(|(o, input)| {
                layer
                    .forward_filter(pool, TransferFn::Identity, &input, i, o)
                    .map(|fm| (o, fm))
            })
            .collect()
    }

    /// Run every backward pair of output `o` inline, collecting completions.
    fn backward_inline(
        layer: &LayerExecutor,
        pool: &CubePool,
        o: usize,
        grad: PooledCube,
        propagate: bool,
    ) -> Vec<(usize, InputGradient)> {
        let mut pairs = Vec::new();
        layer.run_backward(TransferFn::Identity, o, grad, |i, g| pairs.push((i, g)));
        pairs
            .into_iter()
            .filter_map(|(i, g)| layer.backward_filter(pool, i, o, &g, propagate).map(|c| (i, c)))
            .collect()
    }

    #[test]
    fn test_forward_spawns_one_pair_per_output() {
        let pool = CubePool::new();
        let layer = layer(1, 4);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 1.0))));
        let mut spawned = Vec::new();
        layer.run_forward(0, |o, _| spawned.push(o));
        assert_eq!(spawned, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_forward_completes_after_all_inputs() {
        let pool = CubePool::new();
        let layer = layer(2, 1);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 1.0))));
        layer.set_input(1, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 2.0))));

        assert!(forward_inline(&layer, &pool, 0).is_empty());
        let done = forward_inline(&layer, &pool, 1);
        assert_eq!(done.len(), 1);
        // 4 * 1 + 4 * 2
        assert!(done[0].1.as_slice().iter().all(|&v| v == 12.0));
        assert!(layer.output(0).is_some());
    }

    #[test]
    fn test_backward_spawns_one_pair_per_input_sharing_grad() {
        let pool = CubePool::new();
        let layer = layer(3, 1);
        for i in 0..3 {
            layer.set_input(i, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 1.0))));
            forward_inline(&layer, &pool, i);
        }
        let mut spawned = Vec::new();
        let grad = pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0));
        layer.run_backward(TransferFn::Identity, 0, grad, |i, g| spawned.push((i, g)));
        assert_eq!(spawned.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(Arc::ptr_eq(&spawned[0].1, &spawned[2].1));
    }

    #[test]
    fn test_backward_first_layer_counts() {
        let pool = CubePool::new();
        let layer = layer(1, 2);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 1.0))));
        forward_inline(&layer, &pool, 0);

        let mut completed = Vec::new();
        for o in 0..2 {
            let grad = pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0));
            completed.extend(backward_inline(&layer, &pool, o, grad, false));
        }
        assert_eq!(completed.len(), 1);
        assert!(matches!(completed[0], (0, InputGradient::Counted)));
        assert_eq!(layer.bias_gradient(1), 4.0);
        let dw = layer.weight_gradient(0, 1).unwrap();
        assert!(dw.as_slice().iter().all(|&v| v == 4.0));
    }

    #[test]
    fn test_backward_propagates_sum() {
        let pool = CubePool::new();
        let layer = layer(1, 2);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([3, 3, 1], 1.0))));
        forward_inline(&layer, &pool, 0);

        let grad = pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0));
        assert!(backward_inline(&layer, &pool, 0, grad, true).is_empty());
        let grad = pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0));
        let done = backward_inline(&layer, &pool, 1, grad, true);
        let [(0, InputGradient::Propagate(sum))] = &done[..] else {
            panic!("expected one propagated gradient, got {done:?}");
        };
        // all-ones 2x2 filter fully correlated with an all-ones 2x2 gradient
        assert_eq!(sum.get(1, 1, 0), 2.0 * 4.0);
        assert_eq!(sum.get(0, 0, 0), 2.0);
    }

    #[test]
    fn test_apply_gradients() {
        let pool = CubePool::new();
        let layer = layer(1, 1);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0))));
        forward_inline(&layer, &pool, 0);
        let grad = pool.copy_into_pool(&Cube::filled([1, 1, 1], 2.0));
        backward_inline(&layer, &pool, 0, grad, false);

        layer.apply_gradients();
        let w = layer.weights();
        // lr 0.5 * dB 2
        assert_eq!(w.biases[0], -1.0);
        assert!(w.filter(0, 0).as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_clear_returns_buffers() {
        let pool = CubePool::new();
        let layer = layer(1, 1);
        layer.set_input(0, Arc::new(pool.copy_into_pool(&Cube::filled([2, 2, 1], 1.0))));
        forward_inline(&layer, &pool, 0);
        assert!(pool.stats().outstanding > 0);
        layer.clear();
        assert_eq!(pool.stats().outstanding, 0);
    }
}
