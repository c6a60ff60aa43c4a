//! Joint-coordinate input, depth sampling, and the flat-text depth log.
//!
//! An external tracker appends one line of normalized joint coordinates per
//! frame to a text file. Each processed frame set reads the final line of
//! that file, maps the joints into pixel space, samples metric depth at each
//! pixel, and appends one record to an append-only output log.

use std::{
    error::Error,
    fmt::Display,
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use capture::MetricDepthMap;
use log::debug;

/// An error while reading or interpreting joint coordinates.
#[derive(Debug)]
pub enum JointError {
    IoError(std::io::Error),
    /// The input file has no non-empty lines yet.
    Empty,
    /// The value count on the line is not a multiple of 3.
    BadShape(usize),
    /// A value on the line failed to parse as a float.
    BadValue {
        index: usize,
        source: std::num::ParseFloatError,
    },
}

impl Display for JointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IoError(e) => write!(f, "An IO error occurred reading joint coordinates: {e}"),
            Self::Empty => write!(f, "The joint coordinate file has no records yet"),
            Self::BadShape(count) => write!(
                f,
                "Joint record has {count} values, which cannot be reshaped into (x, y, z) triples"
            ),
            Self::BadValue { index, source } => {
                write!(f, "Joint record value {index} is not a number: {source}")
            }
        }
    }
}

impl Error for JointError {}

impl From<std::io::Error> for JointError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e)
    }
}

/// One frame's worth of normalized joint coordinates.
///
/// Joints are `[x, y, z]` with x and y in `[0, 1]`; z is carried through
/// from the tracker but unused here.
#[derive(Clone, Debug, PartialEq)]
pub struct JointRecord {
    joints: Vec<[f32; 3]>,
}

impl JointRecord {
    /// Parses one comma-separated line into joints.
    ///
    /// Fails loudly when the value count is not a positive multiple of 3,
    /// rather than silently truncating.
    pub fn parse(line: &str) -> Result<Self, JointError> {
        let values = line
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .enumerate()
            .map(|(index, s)| {
                s.parse::<f32>()
                    .map_err(|source| JointError::BadValue { index, source })
            })
            .collect::<Result<Vec<f32>, _>>()?;
        if values.is_empty() {
            return Err(JointError::Empty);
        }
        if values.len() % 3 != 0 {
            return Err(JointError::BadShape(values.len()));
        }
        Ok(Self {
            joints: values.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect(),
        })
    }

    pub fn joints(&self) -> &[[f32; 3]] {
        &self.joints
    }

    /// Maps normalized coordinates into pixel space: x scales by the frame
    /// width and y by the height. Out-of-range results are clamped into
    /// bounds and reported rather than left to crash the depth lookup.
    pub fn to_pixels(&self, width: u32, height: u32) -> Vec<(u32, u32)> {
        self.joints
            .iter()
            .map(|&[x, y, _z]| {
                let px = (x * width as f32).round() as i64;
                let py = (y * height as f32).round() as i64;
                let cx = px.clamp(0, i64::from(width) - 1) as u32;
                let cy = py.clamp(0, i64::from(height) - 1) as u32;
                if (cx as i64, cy as i64) != (px, py) {
                    debug!("Clamped joint pixel ({px}, {py}) into {width}x{height}");
                }
                (cx, cy)
            })
            .collect()
    }
}

/// Reads the final non-empty line of the joint file.
///
/// The last line stands in for "the current frame's joints". There is no
/// timestamp join with the capture loop, so a slow tracker can produce
/// readings for a slightly older frame.
pub fn read_latest(path: &Path) -> Result<JointRecord, JointError> {
    let contents = std::fs::read_to_string(path)?;
    let line = contents
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or(JointError::Empty)?;
    JointRecord::parse(line)
}

/// The append-only output log: one line per processed frame set.
///
/// Each line is the flattened `px,py,depth` triples for all joints. Lines
/// are flushed as they are written so a crash can corrupt at most the record
/// in flight. The file grows without bound for the life of the process.
pub struct DepthLog {
    writer: BufWriter<File>,
}

impl DepthLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Appends one record. Missing depth readings are written as NaN so they
    /// stay distinguishable from a true zero-distance sample.
    pub fn append(&mut self, samples: &[(u32, u32, Option<f32>)]) -> std::io::Result<()> {
        let mut first = true;
        for &(x, y, depth) in samples {
            if !first {
                write!(self.writer, ",")?;
            }
            first = false;
            match depth {
                Some(d) => write!(self.writer, "{x},{y},{d:.4}")?,
                None => write!(self.writer, "{x},{y},NaN")?,
            }
        }
        writeln!(self.writer)?;
        self.writer.flush()
    }
}

/// Ties the joint input file, pixel mapping, and depth log together.
pub struct JointDepthSampler {
    input: PathBuf,
    log: DepthLog,
}

impl JointDepthSampler {
    pub fn new(input: PathBuf, output: &Path) -> std::io::Result<Self> {
        Ok(Self {
            input,
            log: DepthLog::open(output)?,
        })
    }

    /// Samples the latest joint record against the given depth map and
    /// appends one output record.
    pub fn process(&mut self, depth: &MetricDepthMap) -> Result<(), JointError> {
        let record = read_latest(&self.input)?;
        let samples: Vec<_> = record
            .to_pixels(depth.width(), depth.height())
            .into_iter()
            .map(|(x, y)| (x, y, depth.sample(x, y)))
            .collect();
        self.log.append(&samples)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capture::DepthGrid;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("joints-test-{}-{name}", std::process::id()));
        path
    }

    #[test]
    fn parses_triples() {
        let record = JointRecord::parse("0.5, 0.25, 0.0, 0.1, 0.9, 1.0").unwrap();
        assert_eq!(
            record.joints(),
            &[[0.5, 0.25, 0.0], [0.1, 0.9, 1.0]]
        );
    }

    #[test]
    fn rejects_counts_not_divisible_by_three() {
        assert!(matches!(
            JointRecord::parse("0.1, 0.2, 0.3, 0.4"),
            Err(JointError::BadShape(4))
        ));
    }

    #[test]
    fn rejects_empty_and_garbage_lines() {
        assert!(matches!(JointRecord::parse("  "), Err(JointError::Empty)));
        assert!(matches!(
            JointRecord::parse("0.1, hello, 0.3"),
            Err(JointError::BadValue { index: 1, .. })
        ));
    }

    #[test]
    fn x_scales_by_width_and_y_by_height() {
        let record = JointRecord::parse("0.5, 0.25, 0.0").unwrap();
        // A 640x480 frame: swapping the axes would yield (240, 160).
        assert_eq!(record.to_pixels(640, 480), vec![(320, 120)]);
    }

    #[test]
    fn out_of_range_coordinates_clamp_into_bounds() {
        let record = JointRecord::parse("1.5, -0.25, 0.0, 1.0, 1.0, 0.0").unwrap();
        assert_eq!(record.to_pixels(640, 480), vec![(639, 0), (639, 479)]);
    }

    #[test]
    fn latest_record_is_the_last_non_empty_line() {
        let path = temp_path("latest");
        std::fs::write(&path, "0.1,0.1,0.0\n0.2,0.2,0.0\n\n").unwrap();
        let record = read_latest(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(record.joints(), &[[0.2, 0.2, 0.0]]);
    }

    #[test]
    fn sampler_appends_one_record_per_frame() {
        let input = temp_path("sampler-in");
        let output = temp_path("sampler-out");
        std::fs::write(&input, "0.5,0.5,0.0,0.0,0.0,0.0\n").unwrap();

        let grid = DepthGrid::from_raw(4, 4, {
            let mut raw = vec![0u16; 16];
            raw[2 * 4 + 2] = 1500;
            raw
        })
        .unwrap();
        let depth = grid.to_metric(0.001);

        let mut sampler = JointDepthSampler::new(input.clone(), &output).unwrap();
        sampler.process(&depth).unwrap();
        sampler.process(&depth).unwrap();

        let contents = std::fs::read_to_string(&output).unwrap();
        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&output).unwrap();

        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        // Joint 1 lands on the populated cell, joint 2 on a no-data cell.
        assert_eq!(lines[0], "2,2,1.5000,0,0,NaN");
    }

    #[test]
    fn malformed_input_reports_without_logging() {
        let input = temp_path("malformed-in");
        let output = temp_path("malformed-out");
        std::fs::write(&input, "0.1,0.2\n").unwrap();

        let depth = DepthGrid::from_raw(2, 2, vec![100; 4]).unwrap().to_metric(0.001);
        let mut sampler = JointDepthSampler::new(input.clone(), &output).unwrap();
        assert!(sampler.process(&depth).is_err());

        let contents = std::fs::read_to_string(&output).unwrap();
        std::fs::remove_file(&input).unwrap();
        std::fs::remove_file(&output).unwrap();
        assert!(contents.is_empty());
    }
}
