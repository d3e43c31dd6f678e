//! cogview4-denoise: command-line front end.
//!
//! - `schedule`: print the timestep schedule for an image size
//! - `noise`: write seeded latent noise to the tensor store

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cogview4_denoise::cache::{FileTensorStore, TensorStore};
use cogview4_denoise::cli::{Cli, Command, NoiseArgs, ScheduleArgs};
use cogview4_denoise::config::{DenoiseConfig, ExecutionContext};
use cogview4_denoise::generation::get_noise;

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("cogview4_denoise={}", level).parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DenoiseConfig::from_env();
    if let Some(msg) = config.validate() {
        bail!("invalid configuration: {}", msg);
    }

    match &cli.command {
        Command::Schedule(args) => run_schedule(args),
        Command::Noise(args) => run_noise(args, &config),
    }
}

fn run_schedule(args: &ScheduleArgs) -> Result<()> {
    let report = args.report().context("failed to build schedule")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("image_seq_len: {}", report.image_seq_len);
    println!("mu: {:.6}", report.mu);
    println!("{:>5}  {:>10}  {:>10}", "step", "timestep", "sigma");
    for (i, sigma) in report.sigmas.iter().enumerate() {
        match report.timesteps.get(i) {
            Some(t) => println!("{:>5}  {:>10.3}  {:>10.6}", i, t, sigma),
            None => println!("{:>5}  {:>10}  {:>10.6}", i, "-", sigma),
        }
    }
    if report.clipped.len() != report.sigmas.len() {
        println!("clipped: {:?}", report.clipped);
    }
    Ok(())
}

fn run_noise(args: &NoiseArgs, config: &DenoiseConfig) -> Result<()> {
    let mut ctx = ExecutionContext::choose(config);
    if let Some(precision) = args.precision {
        ctx.precision = precision.into();
    }

    let noise = get_noise(1, args.channels, args.height, args.width, &ctx, args.seed)
        .context("failed to generate noise")?;

    let dir = args.output_dir(config);
    let mut store = FileTensorStore::open(&dir)?;
    let name = store.save(&noise)?;
    info!(
        tensor = %name,
        shape = ?noise.shape(),
        precision = %ctx.precision,
        dir = %dir.display(),
        "saved noise"
    );
    println!("{}", name);
    Ok(())
}
