use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tickbot_events::{EventConsumer, LoggingConsumer};
use tracing::{error, info, warn};

use tickbot_runner::sim::{self, SimWorld};
use tickbot_runner::{HostDriver, TickbotConfig, init_logging_with_level};

#[derive(Parser, Debug)]
#[command(name = "tickbot-sim")]
#[command(about = "Run the demo bot against a simulated host")]
pub struct Args {
    /// Host frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Stop after this many frames (runs until Ctrl+C if omitted)
    #[arg(long)]
    frames: Option<u64>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write logs to the data directory
    #[arg(long)]
    log_file: bool,

    /// Seed for the simulated world
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Chance per frame that the character dies, between 0 and 1
    #[arg(long, default_value = "0.002", value_parser = sim::parse_chance)]
    death_chance: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TickbotConfig::load_from(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TickbotConfig::load_or_default()?,
    };

    let _guard = init_logging_with_level(
        "sim",
        args.log_file || config.logging.file,
        &config.logging.level,
    )?;

    let world = SimWorld::new(args.seed, args.death_chance).shared();

    let mut driver = HostDriver::builder()
        .config(config)
        .namespaces(sim::namespaces(&world))
        .connect_global(true)
        .event_capacity(args.fps as usize * 16)
        .bot(sim::demo_bot("walker", &world))
        .build()?;

    let mut consumers: Vec<Box<dyn EventConsumer>> = vec![Box::new(LoggingConsumer)];

    info!(target: "runner", "Running at {} fps, press Ctrl+C to stop", args.fps);
    let summary = sim::run(&mut driver, &world, &mut consumers, args.fps, args.frames).await;

    let zombies = driver.shutdown();
    if !zombies.is_empty() {
        error!(target: "runner", "Workers left running: {}", zombies.join(", "));
    }

    let player = world
        .lock()
        .map(|world| world.player())
        .unwrap_or_else(|poisoned| poisoned.into_inner().player());
    info!(
        target: "runner",
        "{} frame(s), {} with errors, {} death(s), final position {}",
        summary.frames,
        summary.failed_frames,
        player.deaths,
        player.position
    );

    for bot in driver.bots() {
        info!(target: "runner", "{} ended in '{}'", bot.name(), bot.current_state());
        if bot.is_paused() {
            warn!(target: "runner", "{} is paused", bot.name());
        }
    }

    Ok(())
}
