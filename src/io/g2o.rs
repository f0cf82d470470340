//! g2o pose-graph files (3D subset).
//!
//! ```text
//! VERTEX_SE3:QUAT id x y z qx qy qz qw
//! EDGE_SE3:QUAT   a b x y z qx qy qz qw  I11 I12 … I16 I22 … I66
//! ```
//!
//! The 21 information entries are the upper triangle of a 6×6 matrix ordered
//! `[translation, rotation]`. [`PoseConstraint::information`] is ordered
//! `[rotation, translation]`, so the two 3×3 block rows/columns are swapped on read and on
//! write. Lines with any other tag are skipped with a warning; `#` starts a comment.

use crate::core::pose_graph::{PoseConstraint, PoseGraph};
use crate::io::{IoError, check_quaternion_norm, parse_field};
use crate::manifold::Pose3;
use nalgebra::{Matrix6, Vector3};
use std::collections::BTreeMap;
use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};
use tracing::{debug, warn};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

const VERTEX_TAG: &str = "VERTEX_SE3:QUAT";
const EDGE_TAG: &str = "EDGE_SE3:QUAT";
const EDGE_FIELDS: usize = 31;
#[cfg(feature = "parallel")]
const MIN_LINES_FOR_PARALLEL: usize = 1000;

/// g2o reader and writer
pub struct G2oLoader;

enum ParsedLine {
    Vertex(usize, Pose3),
    Edge(Box<PoseConstraint>),
    Unknown(String),
}

impl G2oLoader {
    /// Read a pose graph from a g2o file (memory-mapped).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<PoseGraph, IoError> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to open g2o file: {:?}", path_ref))
        })?;
        // SAFETY: the map is read-only and dropped before this function returns.
        let mmap = unsafe {
            memmap2::Mmap::map(&file).map_err(|e| {
                IoError::Io(e)
                    .log_with_source(format!("Failed to memory-map g2o file: {:?}", path_ref))
            })?
        };
        let content = std::str::from_utf8(&mmap).map_err(|e| {
            IoError::Parse {
                line: 0,
                message: format!("Invalid UTF-8: {e}"),
            }
            .log()
        })?;

        let graph = Self::parse_content(content)?;
        debug!(
            "Loaded {:?}: {} poses, {} constraints",
            path_ref,
            graph.poses.len(),
            graph.constraints.len()
        );
        Ok(graph)
    }

    /// Parse the text of a g2o file.
    pub fn parse_content(content: &str) -> Result<PoseGraph, IoError> {
        let lines: Vec<&str> = content.lines().collect();

        #[cfg(feature = "parallel")]
        let parsed: Vec<Option<ParsedLine>> = if lines.len() >= MIN_LINES_FOR_PARALLEL {
            lines
                .par_iter()
                .enumerate()
                .map(|(index, line)| Self::parse_line(line, index + 1))
                .collect::<Result<_, _>>()?
        } else {
            Self::parse_sequential(&lines)?
        };

        #[cfg(not(feature = "parallel"))]
        let parsed = Self::parse_sequential(&lines)?;

        let mut graph = PoseGraph::new();
        let mut unknown_tags: BTreeMap<String, usize> = BTreeMap::new();
        for item in parsed.into_iter().flatten() {
            match item {
                ParsedLine::Vertex(id, pose) => {
                    if graph.add_pose(id, pose).is_some() {
                        return Err(IoError::DuplicateVertex { id }.log());
                    }
                }
                ParsedLine::Edge(constraint) => graph.add_constraint(*constraint),
                ParsedLine::Unknown(tag) => *unknown_tags.entry(tag).or_default() += 1,
            }
        }
        for (tag, count) in unknown_tags {
            warn!("Skipped {} line(s) with unsupported tag {}", count, tag);
        }

        Ok(graph)
    }

    fn parse_sequential(lines: &[&str]) -> Result<Vec<Option<ParsedLine>>, IoError> {
        lines
            .iter()
            .enumerate()
            .map(|(index, line)| Self::parse_line(line, index + 1))
            .collect()
    }

    fn parse_line(line: &str, line_num: usize) -> Result<Option<ParsedLine>, IoError> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let item = match parts[0] {
            VERTEX_TAG => {
                let (id, pose) = Self::parse_vertex(&parts, line_num).map_err(IoError::log)?;
                ParsedLine::Vertex(id, pose)
            }
            EDGE_TAG => ParsedLine::Edge(Box::new(
                Self::parse_edge(&parts, line_num).map_err(IoError::log)?,
            )),
            tag => ParsedLine::Unknown(tag.to_string()),
        };
        Ok(Some(item))
    }

    /// Parse the fields of a `VERTEX_SE3:QUAT` line.
    pub fn parse_vertex(parts: &[&str], line_num: usize) -> Result<(usize, Pose3), IoError> {
        if parts.len() < 9 {
            return Err(IoError::MissingFields { line: line_num });
        }
        let id = parse_field(parts, 1, line_num)?;
        let pose = parse_pose(parts, 2, line_num)?;
        Ok((id, pose))
    }

    /// Parse the fields of an `EDGE_SE3:QUAT` line.
    pub fn parse_edge(parts: &[&str], line_num: usize) -> Result<PoseConstraint, IoError> {
        if parts.len() < EDGE_FIELDS {
            return Err(IoError::MissingFields { line: line_num });
        }
        let begin = parse_field(parts, 1, line_num)?;
        let end = parse_field(parts, 2, line_num)?;
        let measurement = parse_pose(parts, 3, line_num)?;

        let mut upper = [0.0; 21];
        for (k, value) in upper.iter_mut().enumerate() {
            *value = parse_field(parts, 10 + k, line_num)?;
        }
        let mut information = Matrix6::zeros();
        let mut k = 0;
        for i in 0..6 {
            for j in i..6 {
                information[(i, j)] = upper[k];
                information[(j, i)] = upper[k];
                k += 1;
            }
        }

        Ok(PoseConstraint {
            begin,
            end,
            measurement,
            information: swap_rotation_translation(&information),
        })
    }

    /// Write a pose graph as g2o, poses in ascending id order.
    pub fn write<P: AsRef<Path>>(graph: &PoseGraph, path: P) -> Result<(), IoError> {
        let path_ref = path.as_ref();
        let file = File::create(path_ref).map_err(|e| {
            IoError::Io(e).log_with_source(format!("Failed to create g2o file: {:?}", path_ref))
        })?;
        let mut writer = BufWriter::new(file);

        Self::write_to(graph, &mut writer)
            .and_then(|_| writer.flush())
            .map_err(|e| {
                IoError::Io(e).log_with_source(format!("Failed to write g2o file: {:?}", path_ref))
            })
    }

    fn write_to<W: Write>(graph: &PoseGraph, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "# g2o file written by lsq-graph")?;
        writeln!(
            out,
            "# Timestamp: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;
        writeln!(
            out,
            "# Poses: {}, constraints: {}",
            graph.poses.len(),
            graph.constraints.len()
        )?;

        for (id, pose) in &graph.poses {
            write!(out, "{} {}", VERTEX_TAG, id)?;
            write_pose(out, pose)?;
            writeln!(out)?;
        }

        for constraint in &graph.constraints {
            write!(out, "{} {} {}", EDGE_TAG, constraint.begin, constraint.end)?;
            write_pose(out, &constraint.measurement)?;
            let information = swap_rotation_translation(&constraint.information);
            for i in 0..6 {
                for j in i..6 {
                    write!(out, " {:.17e}", information[(i, j)])?;
                }
            }
            writeln!(out)?;
        }
        Ok(())
    }
}

/// `x y z qx qy qz qw` starting at field `first`.
fn parse_pose(parts: &[&str], first: usize, line_num: usize) -> Result<Pose3, IoError> {
    let mut values = [0.0; 7];
    for (k, value) in values.iter_mut().enumerate() {
        *value = parse_field(parts, first + k, line_num)?;
    }
    let [x, y, z, qx, qy, qz, qw] = values;
    check_quaternion_norm(qx, qy, qz, qw, line_num)?;
    Ok(Pose3::from_translation_quaternion(
        Vector3::new(x, y, z),
        qx,
        qy,
        qz,
        qw,
    ))
}

fn write_pose<W: Write>(out: &mut W, pose: &Pose3) -> std::io::Result<()> {
    let t = &pose.translation;
    let q = pose.rotation.quaternion();
    write!(
        out,
        " {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e} {:.17e}",
        t.x, t.y, t.z, q.i, q.j, q.k, q.w
    )
}

/// Exchange the first and last three rows and columns.
fn swap_rotation_translation(m: &Matrix6<f64>) -> Matrix6<f64> {
    Matrix6::from_fn(|i, j| m[((i + 3) % 6, (j + 3) % 6)])
}
