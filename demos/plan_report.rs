//! Example: Print the plan chosen for a transform shape.
//!
//! Run with:
//!     cargo run --example plan_report -- 1024 512 --gpu --benchmark --tune --wisdom wisdom.json
//!
//! Without `--gpu` the CPU reference backend is used.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{arg, ArgMatches, Command};
use gpufft::backend::{CpuBackend, ExecutionBackend};
use gpufft::config::PlannerConfig;
use gpufft::gpu::WgpuBackend;
use gpufft::planner::{PlanPolicy, Planner};
use gpufft::shape::TransformShape;
use gpufft::wisdom::WisdomStore;

fn cli() -> Command {
    Command::new("plan_report")
        .about("Prints the FFT plan chosen for a transform shape")
        .arg(
            arg!([WIDTH] "Transform width")
                .default_value("1024")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            arg!([HEIGHT] "Transform height, omitted for a 1D transform")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(arg!(--gpu "Plan against the wgpu backend instead of the CPU reference"))
        .arg(arg!(--benchmark "Benchmark candidates when no wisdom is recorded"))
        .arg(arg!(--tune "Also tune work-group shapes and lanes of every pass"))
        .arg(
            arg!(--wisdom <PATH> "Wisdom file to load and save")
                .required(false)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            arg!(--config <PATH> "Planner configuration json file")
                .required(false)
                .value_parser(clap::value_parser!(PathBuf)),
        )
}

struct Args {
    width: u32,
    height: Option<u32>,
    gpu: bool,
    benchmark: bool,
    tune: bool,
    wisdom: Option<PathBuf>,
    config: Option<PathBuf>,
}

impl Args {
    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            width: matches.get_one::<u32>("WIDTH").copied().unwrap_or(1024),
            height: matches.get_one::<u32>("HEIGHT").copied(),
            gpu: matches.get_flag("gpu"),
            benchmark: matches.get_flag("benchmark"),
            tune: matches.get_flag("tune"),
            wisdom: matches.get_one::<PathBuf>("wisdom").cloned(),
            config: matches.get_one::<PathBuf>("config").cloned(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::from_matches(&cli().get_matches());

    let mut config = match &args.config {
        Some(path) => PlannerConfig::from_json_file(path)?,
        None => PlannerConfig::default(),
    };
    config.benchmark.tune_performance |= args.tune;
    let backend: Arc<dyn ExecutionBackend> = if args.gpu {
        Arc::new(WgpuBackend::create()?)
    } else {
        Arc::new(CpuBackend::new())
    };
    let wisdom = match &args.wisdom {
        Some(path) if path.exists() => Arc::new(WisdomStore::open(path)?),
        _ => Arc::new(WisdomStore::new()),
    };

    let planner = Planner::new(backend, config).with_wisdom(wisdom.clone());
    let shape = match args.height {
        Some(h) => TransformShape::new_2d(args.width, h),
        None => TransformShape::new_1d(args.width),
    };
    let policy = if args.benchmark || args.tune {
        PlanPolicy::UseWisdomIfAvailable
    } else {
        PlanPolicy::EstimateOnly
    };

    let plan = planner.request_plan(&shape, &planner.constraints(), policy)?;
    println!(
        "{}x{} on {} ({:?})",
        shape.width(),
        shape.rows(),
        planner.backend().profile().name,
        plan.source()
    );
    println!("  horizontal: {:?}", plan.plan().horizontal().radices());
    println!("  vertical:   {:?}", plan.plan().vertical().radices());
    println!("  estimated cost: {:.4}", plan.plan().estimated_cost());
    if let Some(measured) = plan.measured() {
        println!("  measured: {:?}", measured);
    }
    for (i, pass) in plan.plan().passes().iter().enumerate() {
        println!(
            "  pass {}: {:?} {:?} {:?} -> {:?} wg {}x{}x{} lanes {} dispatch {:?}",
            i,
            pass.program.kernel,
            pass.axis,
            pass.input.role,
            pass.output.role,
            pass.workgroup.x,
            pass.workgroup.y,
            pass.workgroup.z,
            pass.lanes,
            pass.dispatch
        );
    }

    plan.release(planner.cache());
    planner.trim();

    if let Some(path) = &args.wisdom {
        wisdom.save(path)?;
        println!("Saved {} wisdom records to {}", wisdom.len(), path.display());
    }
    Ok(())
}
