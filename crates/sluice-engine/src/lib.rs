//! # sluice-engine
//!
//! Concurrent dataflow engine for training layered convolutional networks.
//!
//! Each layer is a grid of perceptron nodes. Forward and backward passes are
//! broken into one task per (input, output) filter of every layer. Tasks run
//! on a shared scheduler and meet at fan-in nodes, which combine partial
//! results as they arrive.
//! The caller sees ordinary blocking `forward` / `backward` calls.
//!
//! ```no_run
//! use sluice_core::Cube;
//! use sluice_engine::{EngineConfig, LayerSpec, Network, NetworkSpec};
//!
//! let spec = NetworkSpec::new(1)
//!     .with_layer(LayerSpec::new(4, [3, 3, 1], 0.01))
//!     .with_layer(LayerSpec::new(1, [3, 3, 1], 0.01));
//! let mut net = Network::random(spec, EngineConfig::default(), 42)?;
//! let out = net.forward(&[Cube::zeros([16, 16, 1])]);
//! net.backward(&out);
//! net.apply_gradients();
//! # Ok::<(), sluice_core::SluiceError>(())
//! ```

pub mod accumulator;
pub mod checkpoint;
pub mod config;
pub mod layer;
pub mod network;
pub mod scheduler;
pub mod topology;

pub use accumulator::{Accumulate, FanIn};
pub use checkpoint::Checkpoint;
pub use config::EngineConfig;
pub use layer::{FeatureMap, InputGradient, LayerExecutor};
pub use network::Network;
pub use scheduler::{PriorityPool, RayonScheduler, Scheduler, SchedulerKind, Task};
pub use topology::{random_weights, LayerSpec, LayerWeights, NetworkSpec};
