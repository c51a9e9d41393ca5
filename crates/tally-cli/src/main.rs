use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;
use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

use tally_core::{
    decode, DType, Element, PartitionPlan, ReduceConfig, TensorList, TensorListBuilder, TensorMiddleIndex,
};
use tally_kernels::{BoxedStrategy, ReduceEngine, ReduceOutput, StrategyKind};

const BANNER: &str = r#"
 _        _ _
| |_ __ _| | |_   _
| __/ _` | | | | | |
| || (_| | | | |_| |
 \__\__,_|_|_|\__, |
              |___/"#;

#[derive(Parser)]
#[command(
    name = "tally",
    about = "Two-phase reduction over ragged tensor lists",
    long_about = "Partitions a ragged list of tensors over a fixed group of workers,\nreduces each slice locally, then merges per-tensor partials after a\nsingle barrier.",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Host configuration flags shared by the commands that run the engine.
#[derive(clap::Args)]
struct EngineArgs {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,
    /// Worker count (overrides config and TALLY_WORKERS)
    #[arg(long)]
    workers: Option<usize>,
    /// Local buffer bytes per worker (overrides config and TALLY_BUFFER_BYTES)
    #[arg(long)]
    buffer_bytes: Option<usize>,
    /// Launch no more workers than there are blocks
    #[arg(long)]
    clamp: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show platform info and the effective configuration
    Info {
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Print the partition plan and slot layout for a list of element counts
    Plan {
        /// Element counts (comma-separated)
        #[arg(long, default_value = "5,0,100")]
        counts: String,
        #[arg(long, default_value = "4")]
        workers: usize,
        /// Alignment unit in bytes
        #[arg(long, default_value = "32")]
        alignment: usize,
        /// Element width in bytes
        #[arg(long, default_value = "4")]
        width: usize,
    },
    /// Encode shapes into a packed tensor list
    Encode {
        /// Shapes, e.g. "5;0;10x10;scalar"
        #[arg(long)]
        shapes: String,
        /// Element type: f32, f16, bf16
        #[arg(long, default_value = "f32")]
        dtype: String,
        /// Merge runs of identical shapes into one record
        #[arg(long)]
        merge: bool,
        #[arg(long, default_value = "list.tly")]
        output: PathBuf,
    },
    /// Reduce a tensor list filled with random data
    Run {
        /// Shapes, e.g. "5;0;10x10"
        #[arg(long, conflicts_with = "packed")]
        shapes: Option<String>,
        /// Packed tensor list file (tensors laid out contiguously)
        #[arg(long)]
        packed: Option<PathBuf>,
        /// Strategy: sum, max, min, l1, l2, inf
        #[arg(long, default_value = "l2")]
        strategy: String,
        /// Element type: f32, f16, bf16
        #[arg(long, default_value = "f32")]
        dtype: String,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Time the engine across worker counts
    Bench {
        /// Number of tensors in the list
        #[arg(long, default_value = "64")]
        tensors: usize,
        /// Largest tensor length
        #[arg(long, default_value = "65536")]
        max_len: u64,
        /// Worker counts to time (comma-separated)
        #[arg(long, default_value = "1,2,4,8")]
        workers: String,
        #[arg(long, default_value = "l2")]
        strategy: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Info { engine } => cmd_info(&engine),
        Commands::Plan { counts, workers, alignment, width } => cmd_plan(&counts, workers, alignment, width),
        Commands::Encode { shapes, dtype, merge, output } => cmd_encode(&shapes, &dtype, merge, &output),
        Commands::Run { shapes, packed, strategy, dtype, seed, engine } => {
            cmd_run(shapes.as_deref(), packed.as_deref(), &strategy, &dtype, seed, &engine)
        }
        Commands::Bench { tensors, max_len, workers, strategy } => {
            cmd_bench(tensors, max_len, &workers, &strategy)
        }
    }
}

fn load_config(args: &EngineArgs, dtype: DType) -> Result<ReduceConfig> {
    let config = match &args.config {
        Some(path) => ReduceConfig::from_json_file(path)?,
        None => ReduceConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(w) = args.workers {
        config.worker_count = w;
    }
    if let Some(b) = args.buffer_bytes {
        config.on_chip_buffer_bytes = b;
    }
    config.clamp_workers |= args.clamp;
    config.element_byte_width = dtype.element_size();
    tracing::debug!(?config, "configuration loaded");
    Ok(config)
}

fn parse_dtype(s: &str) -> Result<DType> {
    DType::from_str(s).with_context(|| format!("unknown dtype '{s}' (expected f32, f16 or bf16)"))
}

fn parse_strategy(s: &str) -> Result<BoxedStrategy> {
    Ok(s.parse::<StrategyKind>()?.build())
}

/// Parse `"5;0;10x10;scalar"` into per-tensor dimension lists.
fn parse_shapes(s: &str) -> Result<Vec<Vec<u64>>> {
    s.split(';')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| -> Result<Vec<u64>> {
            if t == "scalar" {
                return Ok(Vec::new());
            }
            t.split('x')
                .map(|d| d.trim().parse::<u64>().with_context(|| format!("bad dimension '{d}' in '{t}'")))
                .collect()
        })
        .collect()
}

fn parse_list(s: &str) -> Result<Vec<u64>> {
    s.split(',')
        .map(|v| v.trim().parse::<u64>().with_context(|| format!("bad number '{v}'")))
        .collect()
}

fn builder_for(shapes: &[Vec<u64>], dtype: DType, merge: bool) -> Result<TensorListBuilder> {
    let mut builder = TensorListBuilder::new(dtype.element_size()).merge_repeats(merge);
    for dims in shapes {
        builder.try_push(dims)?;
    }
    Ok(builder)
}

fn cmd_info(args: &EngineArgs) -> Result<()> {
    println!("{}", BANNER);
    println!("  v{}  -  partitioned two-phase reduction\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:      {}", std::env::consts::OS);
    println!("  Arch:    {}", std::env::consts::ARCH);
    println!(
        "  Threads: {}",
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    );

    let config = load_config(args, DType::F32)?;
    let layout = config.validate()?;
    println!("\nConfiguration");
    println!("  workers:            {}", config.worker_count);
    println!("  buffer bytes:       {}", config.on_chip_buffer_bytes);
    println!("  alignment bytes:    {}", config.alignment_bytes);
    println!("  clamp workers:      {}", if config.clamp_workers { "[x]" } else { "[ ]" });
    println!("  elements per block: {} (f32)", layout.elements_per_block);
    println!("  chunk elements:     {} (f32)", layout.chunk_elements);
    println!("  max tensors/rank:   {}/{}", config.max_tensors, config.max_rank);

    println!("\nDTypes");
    println!("  input:   f32, f16, bf16");
    println!("  compute: f32");

    println!("\nStrategies");
    for kind in StrategyKind::ALL {
        println!("  {}", kind.name());
    }
    Ok(())
}

fn cmd_plan(counts: &str, workers: usize, alignment: usize, width: usize) -> Result<()> {
    let counts = parse_list(counts)?;
    let config = ReduceConfig::with_workers(workers)
        .alignment(alignment)
        .element_width(width)
        .buffer_bytes(alignment * 2);
    let layout = config.validate()?;

    let plan = PartitionPlan::build(&counts, layout.elements_per_block as u64, workers)?;
    let index = TensorMiddleIndex::build(&plan, &counts);
    println!(
        "{} tensors, {} blocks of {} elements, {} workers ({} active)\n",
        counts.len(),
        plan.total_blocks(),
        layout.elements_per_block,
        workers,
        plan.active_workers()
    );

    println!("{:<8} {:>7} {:>14} {:>14} {:>8}  Segments", "Worker", "Blocks", "Start", "End", "Slots");
    println!("{}", "-".repeat(72));
    for w in 0..plan.worker_count() {
        let r = plan.range(w);
        let segs: Vec<String> = plan
            .segments(w, &counts)
            .iter()
            .map(|s| format!("t{}[{}..{})", s.tensor, s.offset, s.offset + s.len))
            .collect();
        let slots = index.worker_slots(w);
        println!(
            "{:<8} {:>7} {:>14} {:>14} {:>8}  {}",
            w,
            r.blocks,
            format!("({},{})", r.start.tensor, r.start.offset),
            format!("({},{})", r.end.tensor, r.end.offset),
            format!("{}..{}", slots.start, slots.end),
            segs.join(" ")
        );
    }

    println!("\n{:<8} {:>10} {:>10}", "Tensor", "Elements", "Slots");
    println!("{}", "-".repeat(30));
    for (t, count) in counts.iter().enumerate() {
        let slots = index.tensor_slots(t);
        println!("{:<8} {:>10} {:>10}", t, count, format!("{}..{}", slots.start, slots.end));
    }
    Ok(())
}

fn cmd_encode(shapes: &str, dtype: &str, merge: bool, output: &Path) -> Result<()> {
    let dtype = parse_dtype(dtype)?;
    let shapes = parse_shapes(shapes)?;
    let builder = builder_for(&shapes, dtype, merge)?;
    let bytes = builder.to_bytes();

    std::fs::write(output, &bytes).with_context(|| format!("writing {}", output.display()))?;
    println!(
        "Wrote {} tensors ({} bytes, arena of {} {} elements) to {}",
        shapes.len(),
        bytes.len(),
        builder.arena_len(),
        dtype,
        output.display()
    );
    Ok(())
}

fn random_data<T: Element>(rng: &mut StdRng, len: usize, from_f32: impl Fn(f32) -> T) -> Vec<T> {
    (0..len).map(|_| from_f32(rng.gen_range(-1.0f32..1.0))).collect()
}

/// Largest random arena `run` and `bench` will allocate, in elements.
const MAX_ARENA_ELEMENTS: u64 = 1 << 28;

/// Smallest arena covering every tensor of `list`.
fn arena_len(list: &TensorList, width: usize) -> Result<usize> {
    let mut len = 0u64;
    for (i, t) in list.iter().enumerate() {
        let end = (t.base_offset / width.max(1) as u64).checked_add(t.element_count);
        match end {
            Some(end) if end <= MAX_ARENA_ELEMENTS => len = len.max(end),
            _ => bail!(
                "tensor {i} ({} elements at byte {}) needs an arena above {MAX_ARENA_ELEMENTS} elements",
                t.element_count,
                t.base_offset
            ),
        }
    }
    Ok(len as usize)
}

fn cmd_run(
    shapes: Option<&str>,
    packed: Option<&Path>,
    strategy: &str,
    dtype: &str,
    seed: u64,
    args: &EngineArgs,
) -> Result<()> {
    let dtype = parse_dtype(dtype)?;
    let strategy = parse_strategy(strategy)?;
    let config = load_config(args, dtype)?;

    let list = match (shapes, packed) {
        (Some(s), _) => builder_for(&parse_shapes(s)?, dtype, false)?.build(),
        (None, Some(path)) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            decode(&bytes, &config.decode_limits()).with_context(|| format!("decoding {}", path.display()))?
        }
        (None, None) => bail!("either --shapes or --packed is required"),
    };

    let engine = ReduceEngine::new(config)?;
    let len = arena_len(&list, dtype.element_size())?;
    let mut rng = StdRng::seed_from_u64(seed);

    let start = Instant::now();
    let out = match dtype {
        DType::F32 => {
            let data = random_data(&mut rng, len, |x| x);
            engine.run_list(&list, &data, strategy.as_ref())?
        }
        DType::F16 => {
            let data = random_data(&mut rng, len, f16::from_f32);
            engine.run_list(&list, &data, strategy.as_ref())?
        }
        DType::BF16 => {
            let data = random_data(&mut rng, len, bf16::from_f32);
            engine.run_list(&list, &data, strategy.as_ref())?
        }
    };
    let elapsed = start.elapsed();

    print_output(&list, &out, strategy.name());
    println!("\nTime: {:.3}ms", elapsed.as_secs_f64() * 1000.0);
    Ok(())
}

fn print_output(list: &TensorList, out: &ReduceOutput<f32>, strategy: &str) {
    println!("{:<8} {:<16} {:>14}", "Tensor", "Shape", strategy);
    println!("{}", "-".repeat(40));
    for (t, (desc, value)) in list.iter().zip(&out.values).enumerate() {
        println!("{:<8} {:<16} {:>14.6}", t, desc.shape.to_string(), value);
    }

    let s = &out.stats;
    println!(
        "\nworkers={} active={} blocks={} chunk={} slots={} chunks={}",
        s.workers, s.active_workers, s.total_blocks, s.chunk_elements, s.slots_used, s.chunks_streamed
    );
}

fn time_it(iters: usize, mut f: impl FnMut() -> Result<()>) -> Result<f64> {
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() / iters as f64)
}

fn cmd_bench(tensors: usize, max_len: u64, workers: &str, strategy: &str) -> Result<()> {
    let worker_counts = parse_list(workers)?;
    let strategy = parse_strategy(strategy)?;

    // Ragged lengths with some empty tensors mixed in.
    let mut rng = StdRng::seed_from_u64(7);
    let mut builder = TensorListBuilder::new(4);
    for _ in 0..tensors {
        let len = if rng.gen_bool(0.1) { 0 } else { rng.gen_range(1..=max_len.max(1)) };
        builder.try_push(&[len])?;
    }
    let list = builder.build();
    let data = random_data(&mut rng, arena_len(&list, 4)?, |x| x);
    let total = list.total_elements();

    println!("=== tally {} benchmark ===", strategy.name());
    println!("{} tensors, {} elements\n", list.len(), total);
    println!("{:<10} {:>12} {:>12} {:>10}", "Workers", "Time (ms)", "GElem/s", "Speedup");
    println!("{}", "-".repeat(48));

    let mut baseline = None;
    for &w in &worker_counts {
        let engine = ReduceEngine::new(ReduceConfig::with_workers(w as usize))?;
        // Warmup
        engine.run_list(&list, &data, strategy.as_ref())?;

        let secs = time_it(10, || {
            engine.run_list(&list, &data, strategy.as_ref())?;
            Ok(())
        })?;
        let base = *baseline.get_or_insert(secs);
        println!(
            "{:<10} {:>10.3}ms {:>12.2} {:>9.2}x",
            w,
            secs * 1000.0,
            total as f64 / secs / 1e9,
            base / secs
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::TensorDescriptor;

    #[test]
    fn test_parse_shapes() {
        let shapes = parse_shapes("5; 0;10x10;scalar;").unwrap();
        assert_eq!(shapes, vec![vec![5], vec![0], vec![10, 10], vec![]]);
        assert!(parse_shapes("3xq").is_err());
    }

    #[test]
    fn test_arena_len_covers_scattered_tensors() {
        let mut builder = TensorListBuilder::new(4);
        builder.push_at(&[4], 40).push_at(&[6], 0);
        assert_eq!(arena_len(&builder.build(), 4).unwrap(), 14);
    }

    #[test]
    fn test_arena_len_rejects_huge_offsets() {
        let crafted = TensorList::new(vec![TensorDescriptor {
            shape: tally_core::Shape::new(&[4]),
            element_count: 4,
            base_offset: u64::MAX - 3,
        }]);
        assert!(arena_len(&crafted, 4).is_err());

        let mut builder = TensorListBuilder::new(4);
        builder.push_at(&[1], 4 * MAX_ARENA_ELEMENTS);
        assert!(arena_len(&builder.build(), 4).is_err());
    }

    #[test]
    fn test_oversized_shape_is_an_error() {
        let shapes = parse_shapes("4294967296x4294967296").unwrap();
        assert!(builder_for(&shapes, DType::F32, false).is_err());
        assert!(builder_for(&[vec![2, 3]], DType::F32, false).is_ok());
    }
}
