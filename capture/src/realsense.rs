//! RealSense-backed frame source.
//!
//! Requires the RealSense SDK at build time. The session owns one device,
//! its depth and color sub-streams, and the started pipeline; dropping the
//! source or calling `stop` tears the session down.

use std::collections::HashSet;

use log::{error, info};
use realsense_rust::{
    config::Config,
    context::Context,
    frame::{ColorFrame, DepthFrame, PixelKind},
    kind::{Rs2CameraInfo, Rs2Format, Rs2StreamKind},
    pipeline::{ActivePipeline, InactivePipeline},
};

use crate::{CaptureError, ColorImage, DepthGrid, FrameSet, FrameSource, StreamConfig};

fn backend(e: impl Into<anyhow::Error>) -> CaptureError {
    CaptureError::Backend(e.into())
}

/// A started capture session on the first connected RealSense camera.
pub struct RealSenseSource {
    config: StreamConfig,
    pipeline: Option<ActivePipeline>,
    depth_scale: f32,
}

impl RealSenseSource {
    /// Opens the first connected camera and starts depth (Z16) and color
    /// (BGR8) streams at the requested resolution and rate.
    ///
    /// Fails with [`CaptureError::NoDevice`] when nothing is connected; the
    /// caller treats that as unrecoverable. The depth scale is primed from
    /// the first depth frame and cached for the session lifetime.
    pub fn open(stream: &StreamConfig) -> Result<Self, CaptureError> {
        let context = Context::new().map_err(backend)?;
        let devices = context.query_devices(HashSet::new());
        let Some(device) = devices.first() else {
            return Err(CaptureError::NoDevice);
        };

        if let Some(name) = device.info(Rs2CameraInfo::Name) {
            info!("Using {}", name.to_string_lossy());
        }
        let serial = device
            .info(Rs2CameraInfo::SerialNumber)
            .ok_or_else(|| backend(anyhow::anyhow!("Camera did not report a serial number")))?;

        let mut config = Config::new();
        config
            .enable_device_from_serial(serial)
            .map_err(backend)?
            .disable_all_streams()
            .map_err(backend)?
            .enable_stream(
                Rs2StreamKind::Depth,
                None,
                stream.width as usize,
                stream.height as usize,
                Rs2Format::Z16,
                stream.fps as usize,
            )
            .map_err(backend)?
            .enable_stream(
                Rs2StreamKind::Color,
                None,
                stream.width as usize,
                stream.height as usize,
                Rs2Format::Bgr8,
                stream.fps as usize,
            )
            .map_err(backend)?;

        let pipeline = InactivePipeline::try_from(&context).map_err(backend)?;
        let mut pipeline = pipeline.start(Some(config)).map_err(backend)?;

        // The scale is constant for the session, so it is queried once here
        // rather than per frame.
        let depth_scale = loop {
            let frames = pipeline.wait(None).map_err(backend)?;
            if let Some(frame) = frames.frames_of_type::<DepthFrame>().pop() {
                break frame
                    .depth_units()
                    .map_err(|e| backend(e.context("Device did not report depth units")))?;
            }
        };
        info!("Depth scale is {depth_scale} m per unit");

        Ok(Self {
            config: *stream,
            pipeline: Some(pipeline),
            depth_scale,
        })
    }
}

impl FrameSource for RealSenseSource {
    fn stream_config(&self) -> StreamConfig {
        self.config
    }

    fn depth_scale(&self) -> f32 {
        self.depth_scale
    }

    fn next_frames(&mut self) -> Result<FrameSet, CaptureError> {
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or(CaptureError::Disconnected)?;
        let frames = pipeline.wait(None).map_err(backend)?;
        let mut set = FrameSet::default();

        for frame in frames.frames_of_type::<DepthFrame>() {
            let data = frame
                .iter()
                .map(|px| {
                    let PixelKind::Z16 { depth } = px else {
                        unreachable!()
                    };
                    *depth
                })
                .collect();
            match DepthGrid::from_raw(frame.width() as u32, frame.height() as u32, data) {
                Some(grid) => set.depth = Some(grid),
                None => error!("Failed to copy realsense depth frame"),
            }
        }

        for frame in frames.frames_of_type::<ColorFrame>() {
            let mut data = Vec::with_capacity(frame.width() * frame.height() * 3);
            for px in frame.iter() {
                let PixelKind::Bgr8 { r, g, b } = px else {
                    unreachable!()
                };
                data.extend([*b, *g, *r]);
            }
            match ColorImage::from_raw(frame.width() as u32, frame.height() as u32, data) {
                Some(img) => set.color = Some(img),
                None => error!("Failed to copy realsense color frame"),
            }
        }

        Ok(set)
    }

    fn stop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.stop();
        }
    }
}

impl Drop for RealSenseSource {
    fn drop(&mut self) {
        self.stop();
    }
}
