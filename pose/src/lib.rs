//! Contract for an external pose-estimation engine.
//!
//! The engine itself is a native collaborator outside this workspace. The
//! call shape is synchronous: one color frame in, per-person keypoints out,
//! no queuing. Only the nose keypoint is consumed here, to report a
//! per-person depth reading for diagnostics; nothing on this path touches
//! the persisted depth log.

use anyhow::Result;
use capture::{ColorImage, MetricDepthMap};
use log::{info, warn};

/// Named body keypoints. Only `Nose` is used by this workspace, the rest
/// exist so estimators can report full skeletons through the same type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeypointKind {
    Nose,
    Neck,
    LeftShoulder,
    RightShoulder,
    LeftHip,
    RightHip,
    Other(u8),
}

/// One detected keypoint in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Keypoint {
    pub kind: KeypointKind,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// All keypoints detected for one person.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PersonPose {
    pub keypoints: Vec<Keypoint>,
}

impl PersonPose {
    pub fn keypoint(&self, kind: KeypointKind) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.kind == kind)
    }
}

/// A synchronous pose-estimation engine.
pub trait PoseEstimator {
    fn estimate(&mut self, frame: &ColorImage) -> Result<Vec<PersonPose>>;
}

/// Runs the estimator on one frame and logs the metric depth under each
/// person's nose.
pub fn nose_depth_report(
    estimator: &mut dyn PoseEstimator,
    frame: &ColorImage,
    depth: &MetricDepthMap,
) -> Result<()> {
    for (person_id, person) in estimator.estimate(frame)?.into_iter().enumerate() {
        let Some(nose) = person.keypoint(KeypointKind::Nose) else {
            continue;
        };
        let (x, y) = (nose.x.round() as i64, nose.y.round() as i64);
        if x < 0 || y < 0 || x >= i64::from(depth.width()) || y >= i64::from(depth.height()) {
            warn!("Person {person_id}: nose coordinates ({x}, {y}) out of bounds");
            continue;
        }
        match depth.sample(x as u32, y as u32) {
            Some(meters) => {
                info!("Person {person_id}: depth at nose ({x}, {y}) is {meters:.4} m")
            }
            None => info!("Person {person_id}: no depth information at nose ({x}, {y})"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::DepthGrid;

    struct FixedEstimator {
        people: Vec<PersonPose>,
        calls: usize,
    }

    impl PoseEstimator for FixedEstimator {
        fn estimate(&mut self, _frame: &ColorImage) -> Result<Vec<PersonPose>> {
            self.calls += 1;
            Ok(self.people.clone())
        }
    }

    fn nose_at(x: f32, y: f32) -> PersonPose {
        PersonPose {
            keypoints: vec![Keypoint {
                kind: KeypointKind::Nose,
                x,
                y,
                confidence: 0.9,
            }],
        }
    }

    #[test]
    fn reports_once_per_frame_without_failing() {
        let frame = ColorImage::from_raw(4, 4, vec![0; 48]).unwrap();
        let depth = DepthGrid::from_raw(4, 4, vec![1000; 16])
            .unwrap()
            .to_metric(0.001);
        let mut estimator = FixedEstimator {
            people: vec![nose_at(1.0, 1.0), nose_at(100.0, 1.0)],
            calls: 0,
        };
        nose_depth_report(&mut estimator, &frame, &depth).unwrap();
        assert_eq!(estimator.calls, 1);
    }

    #[test]
    fn keypoint_lookup_finds_the_nose() {
        let person = nose_at(3.0, 7.0);
        assert!(person.keypoint(KeypointKind::Nose).is_some());
        assert!(person.keypoint(KeypointKind::Neck).is_none());
    }
}
