//! Logging initialization: a colored console at info level and a debug-level
//! file in a timestamped sub-directory of `logs/`.

use std::{
    path::{Path, PathBuf},
    sync::OnceLock,
    time::Instant,
};

use anyhow::Context;
use chrono::{Datelike, Timelike};
use fern::colors::{Color, ColoredLevelConfig};

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initializes the logger and returns the sub-logging directory for this
/// run. Must be called at most once per process.
pub fn init(runtime_name: &str) -> anyhow::Result<PathBuf> {
    const LOGS_DIR: &str = "logs";

    if !AsRef::<Path>::as_ref(LOGS_DIR)
        .try_exists()
        .context("Failed to check if logging directory exists. Do we have permissions?")?
    {
        std::fs::DirBuilder::new()
            .create(LOGS_DIR)
            .context("Failed to create logging directory. Do we have permissions?")?;
    }

    let datetime = chrono::Local::now();
    let log_folder_name = format!(
        "{}-{:0>2}-{:0>2}={:0>2}-{:0>2}-{:0>2}={}",
        datetime.year(),
        datetime.month(),
        datetime.day(),
        datetime.hour(),
        datetime.minute(),
        datetime.second(),
        runtime_name,
    );
    let log_dir = PathBuf::from(LOGS_DIR).join(log_folder_name);
    std::fs::DirBuilder::new()
        .create(&log_dir)
        .context("Failed to create sub-logging directory. Do we have permissions?")?;

    let colors = ColoredLevelConfig::new()
        .warn(Color::Yellow)
        .error(Color::Red)
        .trace(Color::BrightBlack);

    let _ = START_TIME.set(Instant::now());

    fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let secs = START_TIME.get().unwrap().elapsed().as_secs_f32();
                    out.finish(format_args!(
                        "[{:0>1}:{:.2} {} {}] {}",
                        (secs / 60.0).floor(),
                        secs % 60.0,
                        record.level(),
                        record.target(),
                        message
                    ));
                })
                .chain(
                    fern::log_file(log_dir.join(".log"))
                        .context("Failed to create log file. Do we have permissions?")?,
                ),
        )
        .chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let secs = START_TIME.get().unwrap().elapsed().as_secs_f32();
                    out.finish(format_args!(
                        "\x1B[{}m[{:0>1}:{:.2} {}] {}\x1B[0m",
                        colors.get_color(&record.level()).to_fg_str(),
                        (secs / 60.0).floor(),
                        secs % 60.0,
                        record.target(),
                        message
                    ));
                })
                .chain(std::io::stdout()),
        )
        .apply()
        .context("Logger should have initialized correctly")?;

    Ok(log_dir)
}
