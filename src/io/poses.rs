//! Plain-text pose lists, one pose per line:
//!
//! ```text
//! id px py pz qx qy qz qw
//! ```
//!
//! Lines are written in ascending id order. This is the format of the `*_original.txt` /
//! `*_optimized.txt` files written by the `optimize_3d_graph` binary.

use crate::io::{IoError, check_quaternion_norm, parse_field};
use crate::manifold::Pose3;
use nalgebra::Vector3;
use std::collections::BTreeMap;
use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
};

/// Write `poses` to `path`, replacing any existing file.
pub fn write_poses<P: AsRef<Path>>(path: P, poses: &BTreeMap<usize, Pose3>) -> Result<(), IoError> {
    let path_ref = path.as_ref();
    let file = File::create(path_ref).map_err(|e| {
        IoError::Io(e).log_with_source(format!("Failed to create pose file: {:?}", path_ref))
    })?;
    let mut writer = BufWriter::new(file);

    let result: std::io::Result<()> = poses
        .iter()
        .try_for_each(|(id, pose)| {
            let t = &pose.translation;
            let q = pose.rotation.quaternion();
            writeln!(
                writer,
                "{} {} {} {} {} {} {} {}",
                id, t.x, t.y, t.z, q.i, q.j, q.k, q.w
            )
        })
        .and_then(|_| writer.flush());

    result.map_err(|e| {
        IoError::Io(e).log_with_source(format!("Failed to write pose file: {:?}", path_ref))
    })
}

/// Read a pose list written by [`write_poses`].
pub fn read_poses<P: AsRef<Path>>(path: P) -> Result<BTreeMap<usize, Pose3>, IoError> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).map_err(|e| {
        IoError::Io(e).log_with_source(format!("Failed to read pose file: {:?}", path_ref))
    })?;

    let mut poses = BTreeMap::new();
    for (index, line) in content.lines().enumerate() {
        let line_num = index + 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() != 8 {
            return Err(IoError::Parse {
                line: line_num,
                message: format!("expected 8 fields, found {}", parts.len()),
            }
            .log());
        }
        let id: usize = parse_field(&parts, 0, line_num).map_err(IoError::log)?;
        let mut values = [0.0; 7];
        for (k, value) in values.iter_mut().enumerate() {
            *value = parse_field(&parts, k + 1, line_num).map_err(IoError::log)?;
        }
        let [px, py, pz, qx, qy, qz, qw] = values;
        check_quaternion_norm(qx, qy, qz, qw, line_num).map_err(IoError::log)?;

        let pose = Pose3::from_translation_quaternion(Vector3::new(px, py, pz), qx, qy, qz, qw);
        if poses.insert(id, pose).is_some() {
            return Err(IoError::DuplicateVertex { id }.log());
        }
    }
    Ok(poses)
}
