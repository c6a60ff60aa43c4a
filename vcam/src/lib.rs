//! Publishing color frames to a virtual video device.
//!
//! One long-lived `ffmpeg` process is spawned per sink. It reads raw BGR24
//! frames on stdin and writes them to a v4l2 loopback device that other
//! applications open as if it were a physical camera. If `ffmpeg` is not
//! installed, it will be downloaded locally automatically.

use std::{
    error::Error,
    fmt::Display,
    io::Write,
    path::{Path, PathBuf},
    process::ChildStdin,
    thread::JoinHandle,
};

use capture::{ColorImage, StreamConfig};
use ffmpeg_sidecar::{command::FfmpegCommand, event::FfmpegEvent};
use log::{error, info, warn};

/// An error faced while writing frames to a sink.
#[derive(Debug)]
pub enum SinkError {
    /// The receiving end of the sink has closed. Terminal: the relay loop
    /// stops instead of retrying or respawning.
    Closed,
    /// The frame does not match the size the sink was opened with.
    IncorrectDimensions {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },
    /// An error spawning or supervising the encoder process.
    Encoder(String),
    IoError(std::io::Error),
}

impl Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "The sink has closed its end of the frame channel"),
            Self::IncorrectDimensions {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            } => write!(
                f,
                "Frame dimensions are wrong. Expected {expected_width}x{expected_height}, \
                 got {actual_width}x{actual_height}"
            ),
            Self::Encoder(e) => write!(f, "Faced an error supervising the encoder: {e}"),
            Self::IoError(e) => write!(f, "An IO error occurred while writing the frame: {e}"),
        }
    }
}

impl Error for SinkError {}

/// A consumer of color frames.
pub trait FrameSink {
    fn write_frame(&mut self, frame: &ColorImage) -> Result<(), SinkError>;

    /// Flushes and releases the sink, waiting on any external process it
    /// owns. Called exactly once during teardown.
    fn close(self) -> Result<(), SinkError>;
}

/// A sink that pipes raw frames into `ffmpeg` towards a virtual camera.
pub struct VideoSink {
    stdin: Option<ChildStdin>,
    child: ffmpeg_sidecar::child::FfmpegChild,
    log_pump: Option<JoinHandle<()>>,
    device: PathBuf,
    width: u32,
    height: u32,
}

impl VideoSink {
    /// Spawns the encoder process for the given stream shape and target
    /// device path (e.g. `/dev/video0` backed by v4l2loopback).
    pub fn spawn(config: &StreamConfig, device: &Path) -> Result<Self, SinkError> {
        ffmpeg_sidecar::download::auto_download()
            .map_err(|e| SinkError::Encoder(e.to_string()))?;

        let mut child = FfmpegCommand::new()
            .format("rawvideo")
            .pix_fmt("bgr24")
            .size(config.width, config.height)
            .args(["-r", &config.fps.to_string()])
            .input("-")
            .format("v4l2")
            .output(device.to_string_lossy())
            .spawn()
            .map_err(SinkError::IoError)?;

        let events = child
            .iter()
            .map_err(|e| SinkError::Encoder(e.to_string()))?;
        let device_name = device.display().to_string();
        let log_pump = std::thread::spawn(move || {
            events.for_each(|event| {
                if let FfmpegEvent::Log(level, msg) = event {
                    match level {
                        ffmpeg_sidecar::event::LogLevel::Info => info!("[{device_name}] {msg}"),
                        ffmpeg_sidecar::event::LogLevel::Warning => warn!("[{device_name}] {msg}"),
                        ffmpeg_sidecar::event::LogLevel::Unknown => {}
                        _ => error!("[{device_name}] {msg}"),
                    }
                }
            });
        });

        let stdin = child
            .take_stdin()
            .ok_or_else(|| SinkError::Encoder("Encoder stdin was not captured".into()))?;

        Ok(Self {
            stdin: Some(stdin),
            child,
            log_pump: Some(log_pump),
            device: device.to_path_buf(),
            width: config.width,
            height: config.height,
        })
    }

    /// Releases the encoder: EOF on stdin, wait on the child, join the log
    /// pump. The `log_pump` slot doubles as the guard, so calling this a
    /// second time is a no-op.
    fn shutdown(&mut self) -> Result<(), SinkError> {
        // Dropping stdin signals EOF so the encoder can exit on its own;
        // waiting afterwards avoids orphaning it.
        drop(self.stdin.take());
        let Some(pump) = self.log_pump.take() else {
            return Ok(());
        };
        let status = self.child.wait().map_err(SinkError::IoError)?;
        let _ = pump.join();
        info!("Encoder for {} exited with {status}", self.device.display());
        Ok(())
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(
                "Failed to release the encoder for {}: {e}",
                self.device.display()
            );
        }
    }
}

impl FrameSink for VideoSink {
    fn write_frame(&mut self, frame: &ColorImage) -> Result<(), SinkError> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(SinkError::IncorrectDimensions {
                expected_width: self.width,
                expected_height: self.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(SinkError::Closed);
        };
        stdin.write_all(frame.as_raw()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                SinkError::Closed
            } else {
                SinkError::IoError(e)
            }
        })
    }

    fn close(mut self) -> Result<(), SinkError> {
        self.shutdown()
    }
}
