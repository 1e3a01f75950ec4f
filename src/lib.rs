// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Acoustic full-waveform-inversion gradients by the adjoint-state method.
//!
//! For every shot of an acquisition the crate runs a forward simulation while
//! recording the wavefield and the receiver pressure, converts the receiver
//! trace into a residual, propagates the residual backward in time from the
//! receivers, and cross-correlates the two wavefield records into a partial
//! gradient. The partial gradients of all shots are then stacked into the
//! full gradient. The wave-equation solver sits behind the [`SolverEngine`]
//! trait; [`AcousticEngine`] is a finite-difference implementation of it.

#![warn(missing_docs)]

/// Shots, acquisition geometry and shot lifecycle.
pub mod acquisition;
/// Finite-difference acoustic solver engine.
pub mod acoustic;
/// TOML run configuration.
pub mod config;
/// Solver engine boundary and worker roles.
pub mod engine;
/// Error types for the library.
pub mod error;
/// Partial gradients and their parallel accumulation.
pub mod gradient;
/// Imaging condition and partial gradient assembly.
pub mod imaging;
/// File I/O for models, gradients and `.npz` records.
pub mod io;
/// The shot loop.
pub mod orchestrator;
/// Wavefield collection and records.
pub mod recorder;
/// Residual resampling.
pub mod residual;
/// Forward and backward time loops.
pub mod stepper;

pub use crate::acoustic::{AcousticConfig, AcousticEngine, VelocityModel};
pub use crate::acquisition::{Acquisition, Position, Shot, ShotFlag};
pub use crate::config::RunConfig;
pub use crate::engine::{SolverEngine, WorkerRole};
pub use crate::error::{FwiError, Result, Stage};
pub use crate::gradient::{FullGradient, GradientAccumulator, PartialGradient};
pub use crate::orchestrator::{ProgressInfo, RunParams, RunSummary, ShotLoop};
