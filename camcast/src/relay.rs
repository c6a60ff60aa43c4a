//! The capture-and-relay loop.
//!
//! One logical thread: acquire, align, convert, fan out, repeat. The only
//! concurrent entities are the encoder child process and its log pump, both
//! owned by the sink.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::Context;
use capture::{Aligner, Calibration, CaptureError, FrameSource};
use joints::JointDepthSampler;
use log::{debug, error, info, warn};
use pose::PoseEstimator;
use vcam::{FrameSink, SinkError};

/// Owns the capture session, the sink, and the optional fan-out consumers
/// for the lifetime of the loop. Every exit path stops the session and
/// closes the sink, waiting on the encoder process.
pub struct Relay<Src, Snk> {
    source: Src,
    sink: Snk,
    calibration: Option<Calibration>,
    sampler: Option<JointDepthSampler>,
    estimator: Option<Box<dyn PoseEstimator>>,
    snapshots: Option<(PathBuf, u64)>,
    interrupt: Arc<AtomicBool>,
}

impl<Src: FrameSource, Snk: FrameSink> Relay<Src, Snk> {
    pub fn new(source: Src, sink: Snk, interrupt: Arc<AtomicBool>) -> Self {
        Self {
            source,
            sink,
            calibration: None,
            sampler: None,
            estimator: None,
            snapshots: None,
            interrupt,
        }
    }

    pub fn with_calibration(mut self, calibration: Option<Calibration>) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_sampler(mut self, sampler: Option<JointDepthSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_estimator(mut self, estimator: Box<dyn PoseEstimator>) -> Self {
        self.estimator = Some(estimator);
        self
    }

    /// Saves every `every`th relayed color frame as a PNG under `dir`.
    pub fn with_snapshots(mut self, dir: PathBuf, every: u64) -> Self {
        if every > 0 {
            self.snapshots = Some((dir, every));
        }
        self
    }

    /// Runs the loop to completion, then tears down the session and sink
    /// regardless of how the loop ended.
    pub fn run(mut self) -> anyhow::Result<()> {
        let result = self.relay_loop();
        self.source.stop();
        let closed = self
            .sink
            .close()
            .context("Closing the virtual camera sink");
        result.and(closed)
    }

    fn relay_loop(&mut self) -> anyhow::Result<()> {
        let config = self.source.stream_config();
        // Queried once; constant for the session lifetime.
        let scale = self.source.depth_scale();
        let aligner = match self.calibration {
            Some(calibration) => Aligner::Calibrated {
                calibration,
                depth_scale: scale,
            },
            None => Aligner::Passthrough,
        };
        let mut relayed: u64 = 0;

        while !self.interrupt.load(Ordering::Relaxed) {
            let frames = match self.source.next_frames() {
                Ok(frames) => frames,
                Err(CaptureError::Timeout) => {
                    warn!("Timed out waiting for the next frame set");
                    continue;
                }
                Err(CaptureError::Disconnected) => {
                    info!("Capture source has disconnected");
                    break;
                }
                Err(e) => return Err(e).context("Acquiring the next frame set"),
            };

            // Missing halves are normal during stream start and stop.
            let Some(color) = frames.color else {
                debug!("Skipping frame set with no color sample");
                continue;
            };
            let Some(depth) = frames.depth else {
                debug!("Skipping frame set with no depth sample");
                continue;
            };

            let depth = aligner.align(&depth, config.width, config.height)?;

            match self.sink.write_frame(&color) {
                Ok(()) => {}
                Err(SinkError::Closed) => {
                    error!("The virtual camera closed its end of the pipe; stopping the relay");
                    break;
                }
                Err(e) => return Err(e).context("Writing a frame to the virtual camera"),
            }
            relayed += 1;

            let metric = depth.to_metric(scale);
            if let Some(sampler) = &mut self.sampler {
                if let Err(e) = sampler.process(&metric) {
                    warn!("Skipping joint sampling for this frame: {e}");
                }
            }
            if let Some(estimator) = &mut self.estimator {
                if let Err(e) = pose::nose_depth_report(estimator.as_mut(), &color, &metric) {
                    warn!("Pose estimation failed: {e}");
                }
            }
            if let Some((dir, every)) = &self.snapshots {
                if relayed % *every == 0 {
                    let path = dir.join(format!("{relayed}.png"));
                    if let Err(e) = color.to_rgb_image().save(&path) {
                        warn!("Failed to save snapshot {}: {e}", path.display());
                    }
                }
            }
        }

        info!("Relayed {relayed} frames");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::{ColorImage, FrameSet, StreamConfig, SyntheticSource};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SinkLog {
        payloads: Arc<Mutex<Vec<usize>>>,
        closed: Arc<AtomicBool>,
    }

    struct StubSink {
        log: SinkLog,
        close_after: Option<usize>,
    }

    impl FrameSink for StubSink {
        fn write_frame(&mut self, frame: &ColorImage) -> Result<(), SinkError> {
            let mut payloads = self.log.payloads.lock().unwrap();
            if let Some(limit) = self.close_after {
                if payloads.len() >= limit {
                    return Err(SinkError::Closed);
                }
            }
            payloads.push(frame.as_raw().len());
            Ok(())
        }

        fn close(self) -> Result<(), SinkError> {
            self.log.closed.store(true, Ordering::Relaxed);
            Ok(())
        }
    }

    fn small_config() -> StreamConfig {
        StreamConfig {
            width: 8,
            height: 6,
            fps: 30,
        }
    }

    fn not_interrupted() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn relays_complete_frames_and_closes_the_sink() {
        let config = small_config();
        let source = SyntheticSource::complete(config, 0.001, 4);
        let log = SinkLog::default();
        Relay::new(
            source,
            StubSink {
                log: log.clone(),
                close_after: None,
            },
            not_interrupted(),
        )
        .run()
        .unwrap();
        assert_eq!(log.payloads.lock().unwrap().len(), 4);
        assert!(log.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn incomplete_frame_sets_are_skipped() {
        let config = small_config();
        let complete = || FrameSet {
            depth: Some(SyntheticSource::depth_plane(&config, 1000)),
            color: Some(SyntheticSource::gradient_color(&config, 0)),
        };
        let frames = vec![
            complete(),
            FrameSet {
                depth: Some(SyntheticSource::depth_plane(&config, 1000)),
                color: None,
            },
            complete(),
            FrameSet {
                depth: Some(SyntheticSource::depth_plane(&config, 1000)),
                color: None,
            },
            complete(),
        ];
        let source = SyntheticSource::new(config, 0.001, frames);
        let log = SinkLog::default();
        Relay::new(
            source,
            StubSink {
                log: log.clone(),
                close_after: None,
            },
            not_interrupted(),
        )
        .run()
        .unwrap();
        assert_eq!(
            *log.payloads.lock().unwrap(),
            vec![config.frame_len(); 3]
        );
    }

    #[test]
    fn sink_closure_after_k_writes_ends_the_loop_cleanly() {
        let config = small_config();
        let source = SyntheticSource::complete(config, 0.001, 6);
        let log = SinkLog::default();
        Relay::new(
            source,
            StubSink {
                log: log.clone(),
                close_after: Some(2),
            },
            not_interrupted(),
        )
        .run()
        .unwrap();
        assert_eq!(log.payloads.lock().unwrap().len(), 2);
        assert!(log.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn fatal_capture_errors_still_close_the_sink() {
        struct FailingSource(StreamConfig);

        impl FrameSource for FailingSource {
            fn stream_config(&self) -> StreamConfig {
                self.0
            }

            fn depth_scale(&self) -> f32 {
                0.001
            }

            fn next_frames(&mut self) -> Result<FrameSet, CaptureError> {
                Err(CaptureError::Backend(anyhow::anyhow!("device fault")))
            }

            fn stop(&mut self) {}
        }

        let log = SinkLog::default();
        let result = Relay::new(
            FailingSource(small_config()),
            StubSink {
                log: log.clone(),
                close_after: None,
            },
            not_interrupted(),
        )
        .run();
        assert!(result.is_err());
        assert!(log.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn depth_scale_is_queried_exactly_once() {
        let config = small_config();
        let source = SyntheticSource::complete(config, 0.001, 3);
        let counter = source.scale_query_counter();
        Relay::new(
            source,
            StubSink {
                log: SinkLog::default(),
                close_after: None,
            },
            not_interrupted(),
        )
        .run()
        .unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn interrupt_flag_stops_the_loop_and_still_tears_down() {
        let config = small_config();
        let source = SyntheticSource::complete(config, 0.001, 10);
        let log = SinkLog::default();
        Relay::new(
            source,
            StubSink {
                log: log.clone(),
                close_after: None,
            },
            Arc::new(AtomicBool::new(true)),
        )
        .run()
        .unwrap();
        assert!(log.payloads.lock().unwrap().is_empty());
        assert!(log.closed.load(Ordering::Relaxed));
    }

    #[test]
    fn estimator_runs_once_per_relayed_frame() {
        use std::sync::atomic::AtomicUsize;

        struct CountingEstimator(Arc<AtomicUsize>);

        impl pose::PoseEstimator for CountingEstimator {
            fn estimate(
                &mut self,
                _frame: &ColorImage,
            ) -> anyhow::Result<Vec<pose::PersonPose>> {
                self.0.fetch_add(1, Ordering::Relaxed);
                Ok(Vec::new())
            }
        }

        let config = small_config();
        let source = SyntheticSource::complete(config, 0.001, 3);
        let calls = Arc::new(AtomicUsize::new(0));
        Relay::new(
            source,
            StubSink {
                log: SinkLog::default(),
                close_after: None,
            },
            not_interrupted(),
        )
        .with_estimator(Box::new(CountingEstimator(calls.clone())))
        .run()
        .unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn joint_records_are_logged_only_for_relayed_frames() {
        let mut input = std::env::temp_dir();
        input.push(format!("relay-test-in-{}", std::process::id()));
        let mut output = std::env::temp_dir();
        output.push(format!("relay-test-out-{}", std::process::id()));
        std::fs::write(&input, "0.5,0.5,0.0\n").unwrap();

        let config = small_config();
        let incomplete = FrameSet {
            depth: Some(SyntheticSource::depth_plane(&config, 1000)),
            color: None,
        };
        let complete = || FrameSet {
            depth: Some(SyntheticSource::depth_plane(&config, 1000)),
            color: Some(SyntheticSource::gradient_color(&config, 0)),
        };
        let source = SyntheticSource::new(
            config,
            0.001,
            vec![complete(), incomplete, complete()],
        );
        let sampler = JointDepthSampler::new(input.clone(), &output).unwrap();
        Relay::new(
            source,
            StubSink {
                log: SinkLog::default(),
                close_after: None,
            },
            not_interrupted(),
        )
        .with_sampler(Some(sampler))
        .run()
        .unwrap();

        let contents = std::fs::read_to_string(&output).unwrap();
        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&output).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
