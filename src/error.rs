// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;
use std::path::PathBuf;

/// Pipeline stage of a shot, used to locate failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Solver engine (re)initialization for the shot.
    Setup,
    /// Forward time loop.
    Forward,
    /// Residual resampling.
    Residual,
    /// Reverse time loop with the residual injected at the receivers.
    Backward,
    /// Imaging condition and partial gradient assembly.
    Imaging,
    /// Stacking of all partial gradients.
    Accumulation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Forward => "forward",
            Stage::Residual => "residual",
            Stage::Backward => "backward",
            Stage::Imaging => "imaging",
            Stage::Accumulation => "accumulation",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while configuring or running the gradient computation.
#[derive(Debug)]
pub enum FwiError {
    /// Run configuration is malformed or inconsistent.
    InvalidConfig(String),
    /// Acquisition geometry is unusable (no shots, empty receiver set, ...).
    InvalidAcquisition {
        /// The shot concerned, if any.
        shot_id: Option<String>,
        /// Explanation of why it's invalid.
        reason: String,
    },
    /// Time step is not positive and finite.
    InvalidTimeStep(f64),
    /// Seismogram sampling parameters are unusable.
    InvalidSampling {
        /// Maximum simulated time.
        max_time: f64,
        /// Requested number of seismogram samples.
        nb_seismo: usize,
    },
    /// Forward and backward passes executed a different number of steps.
    StepCountMismatch {
        /// Steps executed by the forward pass.
        forward: usize,
        /// Steps executed by the backward pass.
        backward: usize,
    },
    /// Forward and backward wavefield records hold a different number of snapshots.
    SampleCountMismatch {
        /// Snapshots in the forward record.
        forward: usize,
        /// Snapshots in the backward record.
        backward: usize,
    },
    /// Spatial cardinality differs between two datasets that must align.
    SpatialSizeMismatch {
        /// Expected number of spatial samples.
        expected: usize,
        /// Number of spatial samples found.
        got: usize,
    },
    /// A dataset expected in a stored record is absent.
    MissingField {
        /// The record file.
        path: PathBuf,
        /// The dataset name that was requested.
        field: String,
        /// The dataset names that are available.
        available: Vec<String>,
    },
    /// Array shape does not match expected shape.
    ShapeMismatch {
        /// The expected shape.
        expected: Vec<usize>,
        /// The actual shape encountered.
        got: Vec<usize>,
    },
    /// A non-finite value reached a numeric stage.
    NonFinite {
        /// The shot being processed.
        shot_id: String,
        /// The stage that detected it.
        stage: Stage,
        /// Flat index of the offending value.
        index: usize,
        /// The offending value.
        value: f64,
    },
    /// Velocity value is not positive and finite.
    InvalidVelocity {
        /// The flat index of the invalid value.
        index: usize,
        /// The invalid value.
        value: f64,
    },
    /// Working storage could not be created, written or removed.
    Storage {
        /// The path involved.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// A `.npy`/`.npz` dataset could not be read or written.
    Npy(String),
    /// A `.mat` file could not be parsed, or lacks the requested variable.
    Mat(String),
    /// Unsupported file format (unrecognized extension).
    UnsupportedFileFormat(String),
    /// Failure inside a shot's pipeline, tagged with where it happened.
    ShotFailed {
        /// The shot id.
        shot_id: String,
        /// The stage at which the pipeline failed.
        stage: Stage,
        /// The underlying failure.
        source: Box<FwiError>,
    },
    /// I/O error occurred.
    IoError(std::io::Error),
    /// Other error with a descriptive message.
    Other(String),
}

impl FwiError {
    /// Tag an error with the shot and stage at which it surfaced.
    ///
    /// Errors that already carry a shot tag are returned unchanged.
    pub fn in_shot(self, shot_id: &str, stage: Stage) -> Self {
        match self {
            e @ FwiError::ShotFailed { .. } => e,
            e => FwiError::ShotFailed {
                shot_id: shot_id.to_string(),
                stage,
                source: Box::new(e),
            },
        }
    }

    /// True for errors caused by forward/backward misalignment.
    pub fn is_alignment(&self) -> bool {
        match self {
            FwiError::StepCountMismatch { .. }
            | FwiError::SampleCountMismatch { .. }
            | FwiError::SpatialSizeMismatch { .. }
            | FwiError::MissingField { .. } => true,
            FwiError::ShotFailed { source, .. } => source.is_alignment(),
            _ => false,
        }
    }
}

impl fmt::Display for FwiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwiError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            FwiError::InvalidAcquisition { shot_id, reason } => match shot_id {
                Some(id) => write!(f, "invalid acquisition for shot {}: {}", id, reason),
                None => write!(f, "invalid acquisition: {}", reason),
            },
            FwiError::InvalidTimeStep(dt) => {
                write!(f, "invalid time step: {} (must be positive and finite)", dt)
            }
            FwiError::InvalidSampling {
                max_time,
                nb_seismo,
            } => {
                write!(
                    f,
                    "invalid seismogram sampling: max_time={} nb_seismo={} (need max_time > 0 and nb_seismo >= 2)",
                    max_time, nb_seismo
                )
            }
            FwiError::StepCountMismatch { forward, backward } => {
                write!(
                    f,
                    "step count mismatch: forward pass ran {} steps, backward pass ran {}",
                    forward, backward
                )
            }
            FwiError::SampleCountMismatch { forward, backward } => {
                write!(
                    f,
                    "snapshot count mismatch: forward record has {}, backward record has {}",
                    forward, backward
                )
            }
            FwiError::SpatialSizeMismatch { expected, got } => {
                write!(
                    f,
                    "spatial size mismatch: expected {} samples, got {}",
                    expected, got
                )
            }
            FwiError::MissingField {
                path,
                field,
                available,
            } => {
                write!(
                    f,
                    "dataset '{}' not found in {}; available datasets: {:?}",
                    field,
                    path.display(),
                    available
                )
            }
            FwiError::ShapeMismatch { expected, got } => {
                write!(f, "shape mismatch: expected {:?}, got {:?}", expected, got)
            }
            FwiError::NonFinite {
                shot_id,
                stage,
                index,
                value,
            } => {
                write!(
                    f,
                    "non-finite value {} at index {} in {} stage of shot {}",
                    value, index, stage, shot_id
                )
            }
            FwiError::InvalidVelocity { index, value } => {
                write!(
                    f,
                    "invalid velocity at index {}: {} (must be positive and finite)",
                    index, value
                )
            }
            FwiError::Storage { path, source } => {
                write!(f, "storage error at {}: {}", path.display(), source)
            }
            FwiError::Npy(msg) => write!(f, "npy error: {}", msg),
            FwiError::Mat(msg) => write!(f, "MAT error: {}", msg),
            FwiError::UnsupportedFileFormat(ext) => {
                write!(f, "unsupported file format: {}", ext)
            }
            FwiError::ShotFailed {
                shot_id,
                stage,
                source,
            } => {
                write!(f, "shot {} failed during {}: {}", shot_id, stage, source)
            }
            FwiError::IoError(e) => write!(f, "I/O error: {}", e),
            FwiError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FwiError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FwiError::IoError(e) => Some(e),
            FwiError::Storage { source, .. } => Some(source),
            FwiError::ShotFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FwiError {
    fn from(e: std::io::Error) -> Self {
        FwiError::IoError(e)
    }
}

/// Convenience type alias for Results with FwiError.
pub type Result<T> = std::result::Result<T, FwiError>;

/// Fail with [`FwiError::NonFinite`] on the first NaN or infinity in `values`.
pub fn ensure_finite<'a, I>(values: I, shot_id: &str, stage: Stage) -> Result<()>
where
    I: IntoIterator<Item = &'a f64>,
{
    for (index, &value) in values.into_iter().enumerate() {
        if !value.is_finite() {
            return Err(FwiError::NonFinite {
                shot_id: shot_id.to_string(),
                stage,
                index,
                value,
            });
        }
    }
    Ok(())
}
