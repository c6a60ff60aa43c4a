//! A scripted frame source for running the pipeline without hardware.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{CaptureError, ColorImage, DepthGrid, FrameSet, FrameSource, StreamConfig};

/// Plays back a fixed sequence of frame sets, then reports disconnection.
///
/// Frame delivery is immediate rather than paced; the source exists to
/// exercise the loop, not to emulate device timing.
pub struct SyntheticSource {
    config: StreamConfig,
    frames: VecDeque<FrameSet>,
    depth_scale: f32,
    scale_queries: Arc<AtomicUsize>,
}

impl SyntheticSource {
    pub fn new(config: StreamConfig, depth_scale: f32, frames: Vec<FrameSet>) -> Self {
        Self {
            config,
            frames: frames.into(),
            depth_scale,
            scale_queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A source delivering `count` complete frame sets with a gradient color
    /// frame and a constant depth plane.
    pub fn complete(config: StreamConfig, depth_scale: f32, count: usize) -> Self {
        let frames = (0..count)
            .map(|i| FrameSet {
                depth: Some(Self::depth_plane(&config, 1000 + i as u16)),
                color: Some(Self::gradient_color(&config, i as u8)),
            })
            .collect();
        Self::new(config, depth_scale, frames)
    }

    /// How many times `depth_scale` has been queried so far.
    pub fn scale_query_counter(&self) -> Arc<AtomicUsize> {
        self.scale_queries.clone()
    }

    pub fn depth_plane(config: &StreamConfig, raw: u16) -> DepthGrid {
        DepthGrid::from_raw(
            config.width,
            config.height,
            vec![raw; config.width as usize * config.height as usize],
        )
        .expect("plane buffer is sized to the stream")
    }

    pub fn gradient_color(config: &StreamConfig, seed: u8) -> ColorImage {
        let data = (0..config.frame_len())
            .map(|i| (i as u8).wrapping_add(seed))
            .collect();
        ColorImage::from_raw(config.width, config.height, data)
            .expect("gradient buffer is sized to the stream")
    }
}

impl FrameSource for SyntheticSource {
    fn stream_config(&self) -> StreamConfig {
        self.config
    }

    fn depth_scale(&self) -> f32 {
        self.scale_queries.fetch_add(1, Ordering::Relaxed);
        self.depth_scale
    }

    fn next_frames(&mut self) -> Result<FrameSet, CaptureError> {
        self.frames.pop_front().ok_or(CaptureError::Disconnected)
    }

    fn stop(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn plays_back_script_then_disconnects() {
        let config = StreamConfig {
            width: 4,
            height: 4,
            fps: 30,
        };
        let mut source = SyntheticSource::complete(config, 0.001, 2);
        assert!(source.next_frames().is_ok());
        assert!(source.next_frames().is_ok());
        assert!(matches!(
            source.next_frames(),
            Err(CaptureError::Disconnected)
        ));
    }

    #[test]
    fn counts_depth_scale_queries() {
        let config = StreamConfig::default();
        let source = SyntheticSource::complete(config, 0.001, 0);
        let counter = source.scale_query_counter();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert_eq!(source.depth_scale(), 0.001);
        assert_eq!(source.depth_scale(), 0.001);
        assert_eq!(counter.load(Ordering::Relaxed), 2);
    }
}
