//! Frame acquisition for the capture-and-relay loop.
//!
//! This crate models one synchronized depth+color capture as a [`FrameSet`]
//! and hides the producing device behind the [`FrameSource`] trait. The only
//! real device supported is an Intel RealSense camera through the RealSense
//! SDK; if you do not have the SDK, the [`SyntheticSource`] still lets the
//! rest of the pipeline run.

use std::{error::Error, fmt::Display};

pub mod align;
#[cfg(unix)]
mod realsense;
mod synthetic;

pub use align::{Aligner, Calibration};
#[cfg(unix)]
pub use realsense::RealSenseSource;
pub use synthetic::SyntheticSource;

use serde::Deserialize;

/// Resolution and frame rate shared by the depth and color sub-streams.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            fps: 30,
        }
    }
}

impl StreamConfig {
    /// Size in bytes of one packed BGR8 color frame.
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

/// A color frame as packed, row-major BGR8 bytes.
///
/// This is the exact byte layout the external encoder consumes, so the
/// buffer is handed to it without any per-frame conversion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColorImage {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl ColorImage {
    /// Wraps raw BGR8 bytes. Returns `None` if the buffer length does not
    /// match `width * height * 3`.
    pub fn from_raw(width: u32, height: u32, data: Vec<u8>) -> Option<Self> {
        if data.len() != width as usize * height as usize * 3 {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u8] {
        &self.data
    }

    /// Copies the frame into an RGB image, for snapshots and debugging.
    pub fn to_rgb_image(&self) -> image::RgbImage {
        let rgb = self
            .data
            .chunks_exact(3)
            .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
            .collect();
        image::RgbImage::from_raw(self.width, self.height, rgb)
            .expect("BGR and RGB buffers have the same length")
    }
}

/// A depth frame as a row-major grid of raw Z16 units.
///
/// A raw value of 0 means "no data", not zero distance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepthGrid {
    width: u32,
    height: u32,
    data: Vec<u16>,
}

impl DepthGrid {
    /// Wraps a raw Z16 buffer. Returns `None` if the buffer length does not
    /// match `width * height`.
    pub fn from_raw(width: u32, height: u32, data: Vec<u16>) -> Option<Self> {
        if data.len() != width as usize * height as usize {
            return None;
        }
        Some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_raw(&self) -> &[u16] {
        &self.data
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.data[y as usize * self.width as usize + x as usize])
    }

    /// Converts every raw unit to meters using the device scale factor.
    ///
    /// No-data cells (raw 0) become NaN so they stay distinguishable from a
    /// true zero-distance reading.
    pub fn to_metric(&self, scale: f32) -> MetricDepthMap {
        MetricDepthMap {
            width: self.width,
            height: self.height,
            data: self
                .data
                .iter()
                .map(|&raw| {
                    if raw == 0 {
                        f32::NAN
                    } else {
                        f32::from(raw) * scale
                    }
                })
                .collect(),
        }
    }
}

/// Metric depth in meters on the color pixel grid.
#[derive(Clone, Debug)]
pub struct MetricDepthMap {
    width: u32,
    height: u32,
    data: Vec<f32>,
}

impl MetricDepthMap {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Samples the depth at a pixel. Returns `None` out of bounds and on
    /// no-data cells.
    pub fn sample(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let v = self.data[y as usize * self.width as usize + x as usize];
        if v.is_nan() {
            None
        } else {
            Some(v)
        }
    }
}

/// One synchronized pair of depth and color frames.
///
/// Either half may be absent while the device streams spin up or down; the
/// loop skips such sets instead of treating them as errors.
#[derive(Clone, Debug, Default)]
pub struct FrameSet {
    pub depth: Option<DepthGrid>,
    pub color: Option<ColorImage>,
}

/// An error produced while opening or reading from a capture source.
#[derive(Debug)]
pub enum CaptureError {
    /// No compatible device is connected. Fatal at startup.
    NoDevice,
    /// The device or SDK failed in a way the loop cannot recover from.
    Backend(anyhow::Error),
    /// The device did not produce a frame set in time. Transient.
    Timeout,
    /// The source has no more frames to deliver.
    Disconnected,
}

impl Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoDevice => write!(f, "No compatible capture device is connected"),
            Self::Backend(e) => write!(f, "The capture backend failed: {e}"),
            Self::Timeout => write!(f, "Timed out waiting for the next frame set"),
            Self::Disconnected => write!(f, "The capture source has disconnected"),
        }
    }
}

impl Error for CaptureError {}

/// A blocking producer of frame sets.
///
/// `next_frames` blocks the caller until the device delivers the next
/// synchronized set, coupling the loop to the device frame rate.
pub trait FrameSource {
    fn stream_config(&self) -> StreamConfig;

    /// The device-reported multiplier from raw Z16 units to meters.
    ///
    /// Constant for the lifetime of the session; callers query it once.
    fn depth_scale(&self) -> f32;

    fn next_frames(&mut self) -> Result<FrameSet, CaptureError>;

    /// Stops frame delivery. Called once during teardown.
    fn stop(&mut self);
}
