//! Network coordinator: runs synchronous forward and backward passes over
//! the asynchronous layer dataflow.
//!
//! A pass arms the latch, seeds the first (or last) layer with one entry task
//! per slot and blocks. An entry task fans out one filter task per
//! (input, output) pair at its own priority. Filter tasks chain themselves:
//! a completed output node schedules the next layer's forward entry for that
//! slot, a completed input node schedules the previous layer's backward
//! entry. Completions at the far end of the network count the latch down.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use sluice_core::{CountdownLatch, Cube, CubePool, Extent, PoolStats, PooledCube, Result, SluiceError};
use sluice_kernels::{Convolver, FftPlans, TransferFn};

use crate::checkpoint::Checkpoint;
use crate::config::EngineConfig;
use crate::layer::{FeatureMap, InputGradient, LayerExecutor};
use crate::scheduler::{self, Scheduler};
use crate::topology::{random_weights, LayerWeights, NetworkSpec};

/// Forward tasks run front to back, lowest slot first.
pub fn forward_priority(layer: usize, slot: usize) -> u64 {
    (layer * 1000 + slot) as u64
}

/// Backward tasks run back to front, lowest slot first.
pub fn backward_priority(layer: usize, slot: usize) -> u64 {
    2_000_000 - (layer * 1000 + slot) as u64
}

/// State shared with every in-flight task.
struct Engine {
    layers: Vec<LayerExecutor>,
    latch: CountdownLatch,
    scheduler: Arc<dyn Scheduler>,
    pool: Arc<CubePool>,
    transfer: TransferFn,
}

impl Engine {
    fn schedule_forward(self: &Arc<Self>, layer: usize, input: usize) {
        let engine = Arc::clone(self);
        self.scheduler.schedule(
            forward_priority(layer, input),
            Box::new(move || engine.run_forward(layer, input)),
        );
    }

    /// One task per output slot, all at the entry's priority.
    fn run_forward(self: &Arc<Self>, layer: usize, input: usize) {
        self.layers[layer].run_forward(input, |output, featuremap| {
            let engine = Arc::clone(self);
            self.scheduler.schedule(
                forward_priority(layer, input),
                Box::new(move || engine.forward_filter(layer, input, output, featuremap)),
            );
        });
    }

    fn forward_filter(self: &Arc<Self>, layer: usize, input: usize, output: usize, featuremap: FeatureMap) {
        let completed = self.layers[layer].forward_filter(&self.pool, self.transfer, &featuremap, input, output);
        drop(featuremap);
        let Some(result) = completed else { return };
        match self.layers.get(layer + 1) {
            Some(next) => {
                next.set_input(output, result);
                self.schedule_forward(layer + 1, output);
            }
            None => self.latch.count_down(),
        }
    }

    fn schedule_backward(self: &Arc<Self>, layer: usize, output: usize, grad: PooledCube) {
        let engine = Arc::clone(self);
        self.scheduler.schedule(
            backward_priority(layer, output),
            Box::new(move || engine.run_backward(layer, output, grad)),
        );
    }

    /// One task per input slot, all at the entry's priority.
    fn run_backward(self: &Arc<Self>, layer: usize, output: usize, grad: PooledCube) {
        self.layers[layer].run_backward(self.transfer, output, grad, |input, grad| {
            let engine = Arc::clone(self);
            self.scheduler.schedule(
                backward_priority(layer, output),
                Box::new(move || engine.backward_filter(layer, input, output, grad)),
            );
        });
    }

    fn backward_filter(self: &Arc<Self>, layer: usize, input: usize, output: usize, grad: Arc<PooledCube>) {
        let completed = self.layers[layer].backward_filter(&self.pool, input, output, &grad, layer > 0);
        drop(grad);
        match completed {
            Some(InputGradient::Propagate(sum)) => self.schedule_backward(layer - 1, input, sum),
            Some(InputGradient::Counted) => self.latch.count_down(),
            None => {}
        }
    }

    fn last(&self) -> &LayerExecutor {
        &self.layers[self.layers.len() - 1]
    }
}

/// A trainable layered convolutional network.
///
/// `forward` and `backward` take `&mut self`, so at most one pass is ever in
/// flight.
pub struct Network {
    spec: NetworkSpec,
    config: EngineConfig,
    engine: Arc<Engine>,
    plans: Arc<FftPlans>,
    input_extent: Option<Extent>,
    output_extent: Option<Extent>,
    passes: u64,
}

impl std::fmt::Debug for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Network")
            .field("spec", &self.spec)
            .field("config", &self.config)
            .field("passes", &self.passes)
            .finish()
    }
}

impl Network {
    pub fn new(spec: NetworkSpec, weights: Vec<LayerWeights>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        spec.validate()?;
        let scheduler = scheduler::build(config.scheduler, config.workers)?;
        Self::with_scheduler(spec, weights, config, scheduler)
    }

    /// Like [`Network::new`], but runs on `scheduler` instead of building one
    /// from `config.scheduler` and `config.workers`.
    pub fn with_scheduler(
        spec: NetworkSpec,
        weights: Vec<LayerWeights>,
        config: EngineConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Self> {
        config.validate()?;
        spec.validate()?;
        if weights.len() != spec.num_layers() {
            return Err(SluiceError::InvalidTopology(format!(
                "{} weight sets for {} layers",
                weights.len(),
                spec.num_layers()
            )));
        }
        for (l, w) in weights.iter().enumerate() {
            w.check(&spec, l)?;
        }

        let plans = Arc::new(FftPlans::new());
        let layers = spec
            .layers
            .iter()
            .zip(weights)
            .enumerate()
            .map(|(l, (layer, w))| {
                LayerExecutor::new(l, layer.clone(), w, Convolver::new(layer.kind, &plans))
            })
            .collect();

        tracing::info!(
            inputs = spec.num_inputs,
            layers = spec.num_layers(),
            outputs = spec.num_outputs(),
            params = spec.param_count(),
            fov = %spec.field_of_view(),
            workers = scheduler.workers(),
            scheduler = scheduler.name(),
            transfer = config.transfer.name(),
            "network ready"
        );

        let engine = Arc::new(Engine {
            layers,
            latch: CountdownLatch::new(0),
            scheduler,
            pool: Arc::new(CubePool::new()),
            transfer: config.transfer,
        });

        Ok(Self {
            spec,
            config,
            engine,
            plans,
            input_extent: None,
            output_extent: None,
            passes: 0,
        })
    }

    /// Network with seeded random weights.
    pub fn random(spec: NetworkSpec, config: EngineConfig, seed: u64) -> Result<Self> {
        let weights = random_weights(&spec, seed);
        Self::new(spec, weights, config)
    }

    pub fn from_checkpoint(checkpoint: Checkpoint, config: EngineConfig) -> Result<Self> {
        Self::new(checkpoint.spec, checkpoint.weights, config)
    }

    pub fn load_checkpoint(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self> {
        Self::from_checkpoint(Checkpoint::load(path)?, config)
    }

    /// Snapshot of the topology and current weights.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            spec: self.spec.clone(),
            weights: self.engine.layers.iter().map(|l| l.weights().clone()).collect(),
        }
    }

    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        self.checkpoint().save(path)
    }

    pub fn spec(&self) -> &NetworkSpec {
        &self.spec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan cache shared by FFT layers.
    pub fn fft_plans(&self) -> &Arc<FftPlans> {
        &self.plans
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.engine.pool.stats()
    }

    /// Completed forward and backward passes.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Run one forward pass and return a copy of every output feature map.
    ///
    /// Panics if the number of inputs does not match the topology, the inputs
    /// differ in extent, or they are smaller than the field of view.
    pub fn forward(&mut self, inputs: &[Cube]) -> Vec<Cube> {
        assert_eq!(
            inputs.len(),
            self.spec.num_inputs,
            "forward: got {} inputs, network takes {}",
            inputs.len(),
            self.spec.num_inputs
        );
        let extent = inputs[0].extent();
        for (i, input) in inputs.iter().enumerate() {
            assert_eq!(
                input.extent(),
                extent,
                "forward: input {i} is {}, input 0 is {extent}",
                input.extent()
            );
        }
        let fov = self.spec.field_of_view();
        assert!(
            extent.contains(&fov),
            "forward: input {extent} is smaller than the field of view {fov}"
        );
        let Some(output_extent) = self.spec.output_extent(extent) else {
            panic!("forward: a filter does not fit its input for {extent} inputs");
        };

        let start = Instant::now();
        let engine = &self.engine;
        engine.latch.set(self.spec.num_outputs());
        for (i, input) in inputs.iter().enumerate() {
            engine.layers[0].set_input(i, Arc::new(engine.pool.copy_into_pool(input)));
        }
        for i in 0..inputs.len() {
            engine.schedule_forward(0, i);
        }
        engine.latch.wait();
        self.settle();

        let last = engine.last();
        let outputs: Vec<Cube> = (0..last.num_outputs())
            .map(|o| match last.output(o) {
                Some(featuremap) => featuremap.to_cube(),
                None => panic!("forward: output {o} missing after the pass completed"),
            })
            .collect();

        self.input_extent = Some(extent);
        self.output_extent = Some(output_extent);
        self.passes += 1;
        tracing::debug!(
            pass = self.passes,
            input = %extent,
            output = %output_extent,
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            pool = %engine.pool.stats(),
            "forward pass complete"
        );
        outputs
    }

    /// Back-propagate `dE/d(output)` for every output and record the weight
    /// and bias gradients of every layer.
    ///
    /// Panics if no forward pass has run, or the gradients do not match the
    /// outputs of the latest forward pass in number or extent.
    pub fn backward(&mut self, grads: &[Cube]) {
        let Some(output_extent) = self.output_extent else {
            panic!("backward: no forward pass has run");
        };
        assert_eq!(
            grads.len(),
            self.spec.num_outputs(),
            "backward: got {} gradients, network has {} outputs",
            grads.len(),
            self.spec.num_outputs()
        );
        for (o, grad) in grads.iter().enumerate() {
            assert_eq!(
                grad.extent(),
                output_extent,
                "backward: gradient {o} is {}, output is {output_extent}",
                grad.extent()
            );
        }

        let start = Instant::now();
        let engine = &self.engine;
        let last = engine.layers.len() - 1;
        engine.latch.set(self.spec.num_inputs);
        for (o, grad) in grads.iter().enumerate() {
            engine.schedule_backward(last, o, engine.pool.copy_into_pool(grad));
        }
        engine.latch.wait();
        self.settle();

        self.passes += 1;
        tracing::debug!(
            pass = self.passes,
            elapsed_ms = start.elapsed().as_secs_f64() * 1e3,
            pool = %engine.pool.stats(),
            "backward pass complete"
        );
    }

    /// Step every layer's weights against its latest gradients:
    /// `bias -= lr * dE/dB`, `filter -= lr * dE/dW`.
    pub fn apply_gradients(&mut self) {
        self.engine.layers.par_iter().for_each(|layer| layer.apply_gradients());
    }

    /// Release every feature map and gradient held from earlier passes and
    /// drop idle pool buffers.
    pub fn clear(&mut self) {
        for layer in &self.engine.layers {
            layer.clear();
        }
        self.engine.pool.clear();
        self.input_extent = None;
        self.output_extent = None;
    }

    /// Wait for the tasks of the finished pass to drop their engine handles.
    ///
    /// Once the latch is released every task of the pass has made its last
    /// fan-in contribution, and a task only schedules more work from inside a
    /// completing contribution. So no task is queued and none can be created;
    /// the stragglers are between their final contribution and returning, and
    /// the spin ends as soon as they release their handle and scratch buffers.
    fn settle(&self) {
        while Arc::strong_count(&self.engine) > 1 {
            std::thread::yield_now();
        }
    }

    /// Extent of the inputs of the latest forward pass.
    pub fn input_extent(&self) -> Option<Extent> {
        self.input_extent
    }

    pub fn weight_gradient(&self, layer: usize, input: usize, output: usize) -> Option<Cube> {
        self.engine.layers[layer].weight_gradient(input, output)
    }

    pub fn bias_gradient(&self, layer: usize, output: usize) -> f64 {
        self.engine.layers[layer].bias_gradient(output)
    }

    pub fn filter(&self, layer: usize, input: usize, output: usize) -> Cube {
        self.engine.layers[layer].weights().filter(input, output).clone()
    }

    /// Replace one filter. Panics if its extent differs from the layer's.
    pub fn set_filter(&mut self, layer: usize, input: usize, output: usize, filter: Cube) {
        let expected = self.spec.layers[layer].filter;
        assert_eq!(
            filter.extent(),
            expected,
            "set_filter: filter is {}, layer {layer} uses {expected}",
            filter.extent()
        );
        self.engine.layers[layer].update_weights(|w| w.filters[input][output] = filter);
    }

    pub fn bias(&self, layer: usize, output: usize) -> f64 {
        self.engine.layers[layer].weights().biases[output]
    }

    pub fn set_bias(&mut self, layer: usize, output: usize, bias: f64) {
        self.engine.layers[layer].update_weights(|w| w.biases[output] = bias);
    }

    /// Copy of layer `layer`'s weights.
    pub fn weights(&self, layer: usize) -> LayerWeights {
        self.engine.layers[layer].weights().clone()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        // the scheduler must never be dropped on one of its own workers
        self.settle();
    }
}
