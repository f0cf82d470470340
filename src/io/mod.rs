//! Reading and writing pose graphs and optimized poses.
//!
//! - [`g2o`]: `VERTEX_SE3:QUAT` / `EDGE_SE3:QUAT` files to and from a [`PoseGraph`]
//! - [`poses`]: plain `id px py pz qx qy qz qw` pose lists
//!
//! [`PoseGraph`]: crate::core::pose_graph::PoseGraph

use std::{io, str::FromStr};
use thiserror::Error;
use tracing::error;

pub mod g2o;
pub mod poses;

pub use g2o::G2oLoader;
pub use poses::{read_poses, write_poses};

/// Errors that can occur while reading or writing graph and pose files
#[derive(Error, Debug)]
pub enum IoError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number format at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    #[error("Invalid quaternion at line {line}: norm = {norm:.6}, expected ~1.0")]
    InvalidQuaternion { line: usize, norm: f64 },

    #[error("Duplicate vertex ID: {id}")]
    DuplicateVertex { id: usize },
}

impl IoError {
    /// Log the error using tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error with source error information using tracing::error and return self for chaining
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Parse whitespace-separated field `index` of line `line`.
pub(crate) fn parse_field<T: FromStr>(
    parts: &[&str],
    index: usize,
    line: usize,
) -> Result<T, IoError> {
    let value = parts
        .get(index)
        .ok_or(IoError::MissingFields { line })?;
    value.parse::<T>().map_err(|_| IoError::InvalidNumber {
        line,
        value: (*value).to_string(),
    })
}

/// Norm check shared by the readers: quaternions more than 1% off unit length are rejected.
pub(crate) fn check_quaternion_norm(
    qx: f64,
    qy: f64,
    qz: f64,
    qw: f64,
    line: usize,
) -> Result<(), IoError> {
    let norm = (qx * qx + qy * qy + qz * qz + qw * qw).sqrt();
    if norm.is_finite() && (norm - 1.0).abs() <= 0.01 {
        Ok(())
    } else {
        Err(IoError::InvalidQuaternion { line, norm })
    }
}
