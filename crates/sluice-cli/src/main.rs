use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;

use sluice_core::{Cube, Extent, Result};
use sluice_engine::{Checkpoint, EngineConfig, LayerSpec, Network, NetworkSpec, SchedulerKind};
use sluice_kernels::{ConvolutionKind, TransferFn};

const BANNER: &str = r#"
     _       _
 ___| |_   _(_) ___ ___
/ __| | | | | |/ __/ _ \
\__ \ | |_| | | (_|  __/
|___/_|\__,_|_|\___\___|"#;

#[derive(Parser)]
#[command(
    name = "sluice",
    about = "Sluice dataflow CNN trainer",
    long_about = "Concurrent dataflow engine for training layered 3-D convolutional networks.\n\nEvery (layer, feature map) pair is a task; partial sums meet at fan-in\nnodes and buffers are recycled through a shape-keyed pool.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by commands that build a network.
#[derive(clap::Args)]
struct EngineArgs {
    /// Engine config JSON (workers, scheduler, transfer)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override worker thread count
    #[arg(long)]
    workers: Option<usize>,
    /// Override scheduler: priority, rayon
    #[arg(long)]
    scheduler: Option<SchedulerKind>,
    /// Override transfer function: identity, sigmoid, tanh, relu, logistic_sigmoid
    #[arg(long)]
    transfer: Option<TransferFn>,
}

impl EngineArgs {
    fn resolve(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_json_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(scheduler) = self.scheduler {
            config.scheduler = scheduler;
        }
        if let Some(transfer) = self.transfer {
            config.transfer = transfer;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show platform, engine defaults and an optional topology summary
    Info {
        /// Topology JSON to describe
        #[arg(long)]
        topology: Option<PathBuf>,
    },
    /// Write a checkpoint with seeded random weights
    Init {
        /// Topology JSON (defaults to the built-in demo network)
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Output checkpoint path
        #[arg(long, default_value = "network.slck")]
        output: PathBuf,
        #[arg(long, default_value = "42")]
        seed: u64,
    },
    /// Train on a synthetic regression task (demo)
    Train {
        /// Start from this checkpoint instead of random weights
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Topology JSON used when no checkpoint is given
        #[arg(long)]
        topology: Option<PathBuf>,
        /// Number of training steps
        #[arg(long, default_value = "100")]
        steps: usize,
        /// Input width and height
        #[arg(long, default_value = "16")]
        input_size: usize,
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Save the trained weights here
        #[arg(long)]
        save: Option<PathBuf>,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Time forward + backward passes
    Bench {
        /// Number of timed passes
        #[arg(long, default_value = "10")]
        passes: usize,
        /// Input width and height
        #[arg(long, default_value = "32")]
        input_size: usize,
        /// Convolution kernel: direct, fft
        #[arg(long, default_value = "direct")]
        kind: ConvolutionKind,
        #[command(flatten)]
        engine: EngineArgs,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info { topology } => cmd_info(topology.as_deref()),
        Commands::Init { topology, output, seed } => cmd_init(topology.as_deref(), &output, seed),
        Commands::Train {
            checkpoint,
            topology,
            steps,
            input_size,
            seed,
            save,
            engine,
        } => engine.resolve().and_then(|config| {
            cmd_train(
                checkpoint.as_deref(),
                topology.as_deref(),
                config,
                steps,
                input_size,
                seed,
                save.as_deref(),
            )
        }),
        Commands::Bench {
            passes,
            input_size,
            kind,
            engine,
        } => engine
            .resolve()
            .and_then(|config| cmd_bench(config, passes, input_size, kind)),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Three-layer single-channel network used when no topology is given.
fn demo_topology() -> NetworkSpec {
    NetworkSpec::new(1)
        .with_layer(LayerSpec::new(4, [5, 5, 1], 0.01))
        .with_layer(LayerSpec::new(4, [3, 3, 1], 0.01))
        .with_layer(LayerSpec::new(1, [3, 3, 1], 0.01))
}

fn load_topology(path: Option<&Path>) -> Result<NetworkSpec> {
    match path {
        Some(path) => NetworkSpec::from_json_file(path),
        None => Ok(demo_topology()),
    }
}

fn describe(spec: &NetworkSpec) {
    println!("  inputs:        {}", spec.num_inputs);
    for (l, layer) in spec.layers.iter().enumerate() {
        println!(
            "  layer {:<2}      {} -> {}  filter {}  lr {}  {:?}",
            l,
            spec.layer_inputs(l),
            layer.num_outputs,
            layer.filter,
            layer.learning_rate,
            layer.kind
        );
    }
    println!("  field of view: {}", spec.field_of_view());
    println!("  parameters:    {}", spec.param_count());
}

fn cmd_info(topology: Option<&Path>) -> Result<()> {
    println!("{BANNER}");
    println!("  v{}  -  dataflow CNN trainer\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let config = EngineConfig::default();
    println!("\nEngine defaults");
    println!("  workers:   {}", config.workers);
    println!("  scheduler: {:?}", config.scheduler);
    println!("  transfer:  {}", config.transfer.name());
    println!("  as --config JSON:");
    for line in serde_json::to_string_pretty(&config)?.lines() {
        println!("    {line}");
    }

    println!("\nCrates");
    let crates = [
        ("core", "Extent, Cube, CubePool, CountdownLatch"),
        ("kernels", "Direct + FFT convolution, transfer functions"),
        ("engine", "Fan-in nodes, schedulers, layers, network, checkpoints"),
        ("cli", "This CLI"),
    ];
    for (name, desc) in crates {
        println!("  sluice-{name:<8} {desc}");
    }

    let spec = load_topology(topology)?;
    println!(
        "\nTopology ({})",
        topology.map_or("built-in demo".to_string(), |p| p.display().to_string())
    );
    describe(&spec);
    Ok(())
}

fn cmd_init(topology: Option<&Path>, output: &Path, seed: u64) -> Result<()> {
    let spec = load_topology(topology)?;
    let weights = sluice_engine::random_weights(&spec, seed);
    let checkpoint = Checkpoint::new(spec, weights)?;
    checkpoint.save(output)?;
    println!("Wrote {} ({} parameters, seed {seed})", output.display(), checkpoint.spec.param_count());
    Ok(())
}

/// The target asks every output to reproduce a squashed copy of the input
/// pixel at the centre of its field of view.
fn synthetic_target(input: &Cube, fov: Extent, out_extent: Extent) -> Cube {
    let [ox, oy, oz] = [fov.width() / 2, fov.height() / 2, fov.depth() / 2];
    Cube::from_fn(out_extent, |x, y, z| {
        let v = input.get(x + ox, y + oy, z + oz);
        0.5 + 0.4 * v.tanh()
    })
}

fn cmd_train(
    checkpoint: Option<&Path>,
    topology: Option<&Path>,
    config: EngineConfig,
    steps: usize,
    input_size: usize,
    seed: u64,
    save: Option<&Path>,
) -> Result<()> {
    let mut net = match checkpoint {
        Some(path) => Network::load_checkpoint(path, config)?,
        None => Network::random(load_topology(topology)?, config, seed)?,
    };
    let spec = net.spec().clone();
    let fov = spec.field_of_view();
    let input_extent = Extent::new(input_size, input_size, fov.depth());
    let Some(out_extent) = spec.output_extent(input_extent) else {
        return Err(sluice_core::SluiceError::ShapeMismatch {
            expected: fov,
            got: input_extent,
        });
    };

    println!("=== Sluice Training Demo ===");
    describe(&spec);
    println!("  input:         {input_extent} x {}", spec.num_inputs);
    println!("  output:        {out_extent} x {}", spec.num_outputs());
    println!("  steps:         {steps}\n");

    let mut rng = StdRng::seed_from_u64(seed);
    let start = Instant::now();
    let report_every = (steps / 10).max(1);
    let mut running = 0.0;

    for step in 0..steps {
        let inputs: Vec<Cube> = (0..spec.num_inputs)
            .map(|_| Cube::random_uniform(input_extent, &mut rng, -1.0, 1.0))
            .collect();
        let target = synthetic_target(&inputs[0], fov, out_extent);

        let outputs = net.forward(&inputs);
        let mut error = 0.0;
        let grads: Vec<Cube> = outputs
            .into_iter()
            .map(|mut grad| {
                grad -= &target;
                error += grad.as_slice().iter().map(|d| d * d).sum::<f64>() / 2.0;
                grad
            })
            .collect();
        net.backward(&grads);
        net.apply_gradients();

        running += error;
        if (step + 1) % report_every == 0 || step + 1 == steps {
            let window = if (step + 1) % report_every == 0 {
                report_every
            } else {
                (step + 1) % report_every
            };
            let mean = running / window as f64;
            running = 0.0;
            println!("  step {:>6}  error {:.6}", step + 1, mean);
            tracing::info!(step = step + 1, error = mean, "training progress");
        }
    }

    let elapsed = start.elapsed();
    println!(
        "\nTrained {steps} steps in {:.2}s ({:.2} ms/step)",
        elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1e3 / steps.max(1) as f64
    );
    println!("{}", net.pool_stats());

    if let Some(path) = save {
        net.save_checkpoint(path)?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn cmd_bench(config: EngineConfig, passes: usize, input_size: usize, kind: ConvolutionKind) -> Result<()> {
    let mut spec = demo_topology();
    for layer in &mut spec.layers {
        layer.kind = kind;
    }
    let workers = config.workers;
    let scheduler = config.scheduler;
    let mut net = Network::random(spec.clone(), config, 7)?;

    let input_extent = Extent::new(input_size, input_size, 1);
    let Some(out_extent) = spec.output_extent(input_extent) else {
        return Err(sluice_core::SluiceError::ShapeMismatch {
            expected: spec.field_of_view(),
            got: input_extent,
        });
    };
    let mut rng = StdRng::seed_from_u64(7);
    let inputs = vec![Cube::random_uniform(input_extent, &mut rng, -1.0, 1.0)];
    let grads = vec![Cube::filled(out_extent, 1e-3)];

    println!("=== Sluice Pass Benchmark ===");
    println!("kernel: {kind:?}  scheduler: {scheduler:?}  workers: {workers}  input: {input_extent}\n");

    // warm the pool and plan caches
    net.forward(&inputs);
    net.backward(&grads);

    let mut forward_ms = 0.0;
    let mut backward_ms = 0.0;
    for _ in 0..passes {
        let t = Instant::now();
        net.forward(&inputs);
        forward_ms += t.elapsed().as_secs_f64() * 1e3;

        let t = Instant::now();
        net.backward(&grads);
        backward_ms += t.elapsed().as_secs_f64() * 1e3;
    }

    let n = passes.max(1) as f64;
    println!("{:<10} {:>12}", "Pass", "Mean (ms)");
    println!("{}", "-".repeat(23));
    println!("{:<10} {:>12.3}", "forward", forward_ms / n);
    println!("{:<10} {:>12.3}", "backward", backward_ms / n);
    println!("\n{}", net.pool_stats());
    Ok(())
}
