// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use ndarray::{ArrayView1, ArrayView2};

use crate::acquisition::Position;
use crate::error::{FwiError, Result};

/// Identity of this worker among the processes cooperating on one run.
///
/// Exactly one worker is the coordinator; it alone touches the file system
/// (directory creation, record assembly, deletion) and prints progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRole {
    rank: usize,
    size: usize,
}

impl WorkerRole {
    /// A single-process run. The only worker is the coordinator.
    pub fn single() -> Self {
        WorkerRole { rank: 0, size: 1 }
    }

    /// Worker `rank` out of `size`. Rank 0 coordinates.
    pub fn new(rank: usize, size: usize) -> Result<Self> {
        if size == 0 || rank >= size {
            return Err(FwiError::InvalidConfig(format!(
                "worker rank {} is out of range for {} workers",
                rank, size
            )));
        }
        Ok(WorkerRole { rank, size })
    }

    /// This worker's rank.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of cooperating workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this worker performs file-system side effects.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }
}

impl Default for WorkerRole {
    fn default() -> Self {
        WorkerRole::single()
    }
}

/// The wave-equation solver driven by the shot loop.
///
/// A handle is created once with [`SolverEngine::initialize`] and then rebound
/// to each following shot with [`SolverEngine::reinitialize`], which consumes
/// the old session and returns the new one so the handle lifetime stays
/// explicit. The shot loop calls the methods in this order per shot:
///
/// 1. `set_time_variables`, `update_sources_and_receivers`, `apply_initial_conditions`
/// 2. `execute` for every forward step, reading `receiver_pressure` and `field`
/// 3. `reset_wavefield`, `update_sources_and_receivers` (receivers as sources),
///    `update_source_value` with the residual
/// 4. `execute` for every backward step, reading `field`
pub trait SolverEngine: Sized {
    /// Problem configuration a shot is bound to.
    type Config;

    /// Cold start of the engine for the first shot.
    fn initialize(role: WorkerRole, config: &Self::Config) -> Result<Self>;

    /// Rebind a running engine to a new configuration, reusing its resources.
    fn reinitialize(self, config: &Self::Config) -> Result<Self>;

    /// The worker identity the engine was initialized with.
    fn role(&self) -> WorkerRole;

    /// Set the simulated duration, the time step, and the seismogram sampling
    /// interval used to read source values.
    fn set_time_variables(&mut self, max_time: f64, dt: f64, dt_seismo: f64) -> Result<()>;

    /// Place sources and receivers. Source values revert to the engine's own
    /// wavelet until [`SolverEngine::update_source_value`] is called.
    fn update_sources_and_receivers(
        &mut self,
        sources: &[Position],
        receivers: &[Position],
    ) -> Result<()>;

    /// Replace the source time functions with `values` (seismogram samples ×
    /// sources), sampled every `dt_seismo`.
    fn update_source_value(&mut self, values: ArrayView2<'_, f64>) -> Result<()>;

    /// Apply initial conditions; called once per (re)initialization.
    fn apply_initial_conditions(&mut self);

    /// Advance one step of size `dt` from `time`.
    fn execute(&mut self, time: f64, dt: f64) -> Result<()>;

    /// Zero every wavefield, keeping sources, receivers and time variables.
    fn reset_wavefield(&mut self);

    /// Live pressure at the receivers after the last step.
    fn receiver_pressure(&self) -> ArrayView1<'_, f64>;

    /// Live view of a named field, flattened over the spatial support.
    fn field(&self, name: &str) -> Option<ArrayView1<'_, f64>>;

    /// Names of the fields [`SolverEngine::field`] can return.
    fn field_names(&self) -> Vec<String>;

    /// Coordinates of every spatial sample (samples × 3).
    fn reference_positions(&self) -> ArrayView2<'_, f64>;
}
