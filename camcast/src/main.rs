//! Relays a RealSense color stream to a virtual camera while sampling
//! metric depth at externally-tracked joint positions.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use capture::{FrameSource, SyntheticSource};
use clap::Parser;
use joints::JointDepthSampler;
use vcam::VideoSink;

mod config;
mod logging;
mod relay;

use config::AppConfig;
use relay::Relay;

#[derive(Parser)]
#[command(
    name = "camcast",
    about = "Relay a depth camera's color stream to a virtual video device"
)]
struct Args {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "camcast.toml")]
    config: PathBuf,

    /// Override the virtual camera device path from the config.
    #[arg(long)]
    device: Option<PathBuf>,

    /// Relay this many synthetic frame sets instead of opening a camera.
    #[arg(long)]
    synthetic: Option<usize>,

    /// Save every Nth relayed color frame as a PNG in the log directory.
    #[arg(long)]
    snapshot_every: Option<u64>,
}

fn main() {
    let args = Args::parse();
    // All top-level failures end here: logged, then a graceful exit. If the
    // logger itself never initialized, the error still reaches stderr.
    if let Err(e) = try_main(args) {
        if log::log_enabled!(log::Level::Error) {
            log::error!("camcast stopped: {e:#}");
        } else {
            eprintln!("camcast stopped: {e:#}");
        }
    }
}

fn try_main(args: Args) -> anyhow::Result<()> {
    let log_dir = logging::init("camcast")?;
    let mut app_config = AppConfig::load(&args.config)?;
    if let Some(device) = args.device {
        app_config.sink.device = device;
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("Setting the Ctrl-C handler")?;

    if let Some(count) = args.synthetic {
        let source = SyntheticSource::complete(app_config.stream, 0.001, count);
        return run_relay(source, app_config, args.snapshot_every, log_dir, interrupt);
    }

    #[cfg(unix)]
    {
        let source = capture::RealSenseSource::open(&app_config.stream)?;
        run_relay(source, app_config, args.snapshot_every, log_dir, interrupt)
    }
    #[cfg(not(unix))]
    {
        let _ = (app_config, log_dir, interrupt);
        anyhow::bail!("RealSense capture requires unix; use --synthetic elsewhere")
    }
}

fn run_relay(
    source: impl FrameSource,
    app_config: AppConfig,
    snapshot_every: Option<u64>,
    log_dir: PathBuf,
    interrupt: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let stream = app_config.stream;
    log::info!(
        "Relaying {}x{} at {} fps to {}",
        stream.width,
        stream.height,
        stream.fps,
        app_config.sink.device.display()
    );

    let sampler = match &app_config.joints {
        Some(settings) => Some(
            JointDepthSampler::new(settings.input.clone(), &settings.output)
                .context("Opening the joint depth log")?,
        ),
        None => None,
    };

    // The encoder spawns after all other fallible setup; once it is running,
    // every exit path goes through `Relay::run`'s teardown.
    let sink = VideoSink::spawn(&stream, &app_config.sink.device)
        .context("Spawning the virtual camera encoder")?;

    let mut relay = Relay::new(source, sink, interrupt)
        .with_calibration(app_config.calibration)
        .with_sampler(sampler);
    if let Some(every) = snapshot_every {
        relay = relay.with_snapshots(log_dir, every);
    }
    relay.run()
}
