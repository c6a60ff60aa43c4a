//! Reprojection of depth frames into the color pixel grid.
//!
//! The RealSense SDK performs this alignment natively, but the Rust wrapper
//! does not expose the align processing block, so the same deproject,
//! transform, project sequence is done here from calibration supplied in the
//! config file. Streams that are already registered to the same grid use the
//! passthrough variant.

use std::{error::Error, fmt::Display};

use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;

use crate::DepthGrid;

/// Pinhole intrinsics of one sub-stream.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Intrinsics {
    pub fx: f32,
    pub fy: f32,
    pub ppx: f32,
    pub ppy: f32,
}

/// Rigid transform from the depth sensor frame to the color sensor frame.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Extrinsics {
    pub rotation: [[f32; 3]; 3],
    pub translation: [f32; 3],
}

impl Extrinsics {
    fn rotation_matrix(&self) -> Matrix3<f32> {
        Matrix3::from_fn(|r, c| self.rotation[r][c])
    }
}

/// Depth-to-color calibration for the software aligner.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Calibration {
    pub depth: Intrinsics,
    pub color: Intrinsics,
    pub extrinsics: Extrinsics,
}

#[derive(Debug)]
pub enum AlignError {
    /// Passthrough alignment requires both streams on the same grid.
    GridMismatch {
        depth_width: u32,
        depth_height: u32,
        color_width: u32,
        color_height: u32,
    },
}

impl Display for AlignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GridMismatch {
                depth_width,
                depth_height,
                color_width,
                color_height,
            } => write!(
                f,
                "Cannot pass a {depth_width}x{depth_height} depth frame through to a \
                 {color_width}x{color_height} color grid without calibration"
            ),
        }
    }
}

impl Error for AlignError {}

/// Reprojects depth samples so that pixel (x, y) in the depth and color
/// frames refers to the same physical point.
pub enum Aligner {
    Passthrough,
    Calibrated {
        calibration: Calibration,
        /// Raw-to-meters scale, needed to express samples in metric space
        /// during reprojection. The output stays in raw units.
        depth_scale: f32,
    },
}

impl Aligner {
    pub fn align(
        &self,
        depth: &DepthGrid,
        color_width: u32,
        color_height: u32,
    ) -> Result<DepthGrid, AlignError> {
        match self {
            Self::Passthrough => {
                if depth.width() != color_width || depth.height() != color_height {
                    return Err(AlignError::GridMismatch {
                        depth_width: depth.width(),
                        depth_height: depth.height(),
                        color_width,
                        color_height,
                    });
                }
                Ok(depth.clone())
            }
            Self::Calibrated {
                calibration,
                depth_scale,
            } => Ok(reproject(
                depth,
                calibration,
                *depth_scale,
                color_width,
                color_height,
            )),
        }
    }
}

/// Deproject each depth pixel to a 3D point, move it into the color sensor
/// frame, and project it onto the color grid. On collisions the nearest
/// sample wins, which handles occlusion.
fn reproject(
    depth: &DepthGrid,
    calibration: &Calibration,
    depth_scale: f32,
    color_width: u32,
    color_height: u32,
) -> DepthGrid {
    let d = calibration.depth;
    let c = calibration.color;
    let rotation = calibration.extrinsics.rotation_matrix();
    let translation = Vector3::from(calibration.extrinsics.translation);

    let mut out = vec![0u16; color_width as usize * color_height as usize];
    let mut best_z = vec![f32::INFINITY; out.len()];

    for v in 0..depth.height() {
        for u in 0..depth.width() {
            let raw = depth.as_raw()[v as usize * depth.width() as usize + u as usize];
            if raw == 0 {
                continue;
            }
            let z = f32::from(raw) * depth_scale;

            let x = (u as f32 - d.ppx) * z / d.fx;
            let y = (v as f32 - d.ppy) * z / d.fy;

            let p = rotation * Vector3::new(x, y, z) + translation;
            if p.z <= 0.0 {
                continue;
            }

            let u_c = ((p.x / p.z) * c.fx + c.ppx).round() as i64;
            let v_c = ((p.y / p.z) * c.fy + c.ppy).round() as i64;
            if u_c < 0 || u_c >= i64::from(color_width) || v_c < 0 || v_c >= i64::from(color_height)
            {
                continue;
            }

            let idx = v_c as usize * color_width as usize + u_c as usize;
            if p.z < best_z[idx] {
                best_z[idx] = p.z;
                out[idx] = (p.z / depth_scale).round().min(f32::from(u16::MAX)) as u16;
            }
        }
    }

    DepthGrid::from_raw(color_width, color_height, out)
        .expect("reprojected buffer is sized to the color grid")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_calibration() -> Calibration {
        let intrinsics = Intrinsics {
            fx: 4.0,
            fy: 4.0,
            ppx: 2.0,
            ppy: 2.0,
        };
        Calibration {
            depth: intrinsics,
            color: intrinsics,
            extrinsics: Extrinsics {
                rotation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
                translation: [0.0, 0.0, 0.0],
            },
        }
    }

    #[test]
    fn passthrough_requires_matching_grids() {
        let depth = DepthGrid::from_raw(4, 4, vec![1; 16]).unwrap();
        assert!(Aligner::Passthrough.align(&depth, 4, 4).is_ok());
        assert!(Aligner::Passthrough.align(&depth, 8, 8).is_err());
    }

    #[test]
    fn identity_calibration_keeps_samples_in_place() {
        let mut raw = vec![0u16; 16];
        raw[2 * 4 + 1] = 1000;
        let depth = DepthGrid::from_raw(4, 4, raw).unwrap();

        let aligner = Aligner::Calibrated {
            calibration: identity_calibration(),
            depth_scale: 0.001,
        };
        let aligned = aligner.align(&depth, 4, 4).unwrap();
        assert_eq!(aligned.get(1, 2), Some(1000));
        assert_eq!(aligned.get(0, 0), Some(0));
    }

    #[test]
    fn aligned_output_matches_color_dimensions() {
        let depth = DepthGrid::from_raw(4, 4, vec![500; 16]).unwrap();
        let aligner = Aligner::Calibrated {
            calibration: identity_calibration(),
            depth_scale: 0.001,
        };
        let aligned = aligner.align(&depth, 8, 6).unwrap();
        assert_eq!(aligned.width(), 8);
        assert_eq!(aligned.height(), 6);
    }

    #[test]
    fn nearer_sample_wins_on_collision() {
        // A color focal length of half the depth one maps depth pixels
        // (1, 2) and (2, 2) onto the same color pixel (2, 2).
        let mut calibration = identity_calibration();
        calibration.color.fx = 2.0;
        calibration.color.fy = 2.0;
        let mut raw = vec![0u16; 16];
        raw[2 * 4 + 1] = 2000;
        raw[2 * 4 + 2] = 500;
        let depth = DepthGrid::from_raw(4, 4, raw).unwrap();

        let aligner = Aligner::Calibrated {
            calibration,
            depth_scale: 0.001,
        };
        let aligned = aligner.align(&depth, 4, 4).unwrap();
        assert_eq!(aligned.get(2, 2), Some(500));
    }
}
