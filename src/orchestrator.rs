// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Sequential shot loop producing the full gradient.
//!
//! For every shot the loop (re)binds the solver engine, runs the forward pass
//! while recording the wavefield and the receiver trace, turns the trace into
//! a residual, runs the backward pass with the residual injected at the
//! receivers, and correlates both records into the shot's partial gradient.
//! Once every shot is done the partial gradients are stacked.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use ndarray::Array2;
use tracing::info;

use crate::acoustic::PRESSURE_NP1;
use crate::acquisition::{Acquisition, Shot, ShotFlag};
use crate::engine::{SolverEngine, WorkerRole};
use crate::error::{FwiError, Result, Stage};
use crate::gradient::{FullGradient, GradientAccumulator};
use crate::imaging::assemble_partial_gradient;
use crate::io;
use crate::recorder::{Direction, WavefieldRecorder};
use crate::residual::{build_residual, SeismoSampling};
use crate::stepper::{backward_pass, forward_pass, PassReport, TimeLoop};

/// File prefix of observed seismograms, `observed_Shot<id>.npy`.
pub const OBSERVED_PREFIX: &str = "observed_Shot";
/// File prefix of exported receiver traces, `pressure_Shot<id>.npy`.
pub const TRACE_PREFIX: &str = "pressure_Shot";

/// Parameters shared by every shot of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    /// Simulated duration of each pass.
    pub max_time: f64,
    /// Number of seismogram samples of the residual.
    pub nb_seismo: usize,
    /// A wavefield snapshot is recorded every this many steps.
    pub output_wavefield_interval: usize,
    /// Directory holding the wavefield records and partial gradients.
    pub work_dir: PathBuf,
    /// Engine field that is recorded and correlated.
    pub field: String,
    /// Directory of observed seismograms, if any.
    pub observed_dir: Option<PathBuf>,
    /// Directory receiving the receiver traces, if they are exported.
    pub trace_dir: Option<PathBuf>,
}

impl RunParams {
    /// Parameters recording `pressure_np1`, without observed data or trace export.
    pub fn new(
        max_time: f64,
        nb_seismo: usize,
        output_wavefield_interval: usize,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        RunParams {
            max_time,
            nb_seismo,
            output_wavefield_interval,
            work_dir: work_dir.into(),
            field: PRESSURE_NP1.to_string(),
            observed_dir: None,
            trace_dir: None,
        }
    }

    /// Record and correlate `field` instead of `pressure_np1` (builder method).
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    /// Subtract observed seismograms read from `dir` (builder method).
    pub fn with_observed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.observed_dir = Some(dir.into());
        self
    }

    /// Export every forward receiver trace to `dir` (builder method).
    pub fn with_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = Some(dir.into());
        self
    }

    /// Check the parameters and derive the seismogram sampling.
    pub fn validate(&self) -> Result<SeismoSampling> {
        if self.output_wavefield_interval == 0 {
            return Err(FwiError::InvalidConfig(
                "output_wavefield_interval must be at least 1".to_string(),
            ));
        }
        if self.field.is_empty() {
            return Err(FwiError::InvalidConfig(
                "recorded field name is empty".to_string(),
            ));
        }
        SeismoSampling::new(self.max_time, self.nb_seismo)
    }
}

/// Progress information passed to the optional callback, once per time step.
#[derive(Debug, Clone, Copy)]
pub struct ProgressInfo<'a> {
    /// The shot being simulated.
    pub shot_id: &'a str,
    /// Pass in progress.
    pub direction: Direction,
    /// Step index (counts down during the backward pass).
    pub step: usize,
    /// Simulation time at the start of the step.
    pub time: f64,
    /// Elapsed wall time since the run started.
    pub elapsed: Duration,
}

type ProgressCallback = Box<dyn Fn(ProgressInfo<'_>) + Send + Sync>;

/// Outcome of one shot.
#[derive(Debug, Clone, PartialEq)]
pub struct ShotReport {
    /// Shot identifier.
    pub shot_id: String,
    /// Forward pass bookkeeping.
    pub forward: PassReport,
    /// Backward pass bookkeeping.
    pub backward: PassReport,
    /// Receivers the residual was injected at.
    pub receivers: usize,
}

/// Outcome of a whole run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Per-shot bookkeeping, in processing order.
    pub shots: Vec<ShotReport>,
    /// Stacked gradient. Only the coordinator assembles it.
    pub gradient: Option<FullGradient>,
}

fn at(shot_id: &str, stage: Stage) -> impl Fn(FwiError) -> FwiError + '_ {
    move |e| e.in_shot(shot_id, stage)
}

/// Drives a [`SolverEngine`] through every shot of an acquisition.
pub struct ShotLoop<E: SolverEngine> {
    role: WorkerRole,
    params: RunParams,
    accumulator: GradientAccumulator,
    progress_callback: Option<ProgressCallback>,
    engine: Option<E>,
}

impl<E: SolverEngine> ShotLoop<E> {
    /// Shot loop for the given worker.
    ///
    /// # Errors
    /// Returns an error if `params` fail [`RunParams::validate`].
    pub fn new(role: WorkerRole, params: RunParams) -> Result<Self> {
        params.validate()?;
        Ok(ShotLoop {
            role,
            params,
            accumulator: GradientAccumulator::new(),
            progress_callback: None,
            engine: None,
        })
    }

    /// Use a configured accumulator (thread count, shot weights) for the final
    /// stack (builder method).
    pub fn with_accumulator(mut self, accumulator: GradientAccumulator) -> Self {
        self.accumulator = accumulator;
        self
    }

    /// Set a progress callback invoked before every time step (builder method).
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Run parameters.
    pub fn params(&self) -> &RunParams {
        &self.params
    }

    /// This worker's role.
    pub fn role(&self) -> WorkerRole {
        self.role
    }

    /// The engine session, once the first shot has started.
    pub fn engine(&self) -> Option<&E> {
        self.engine.as_ref()
    }

    /// Process every shot of `acquisition` in order and stack the partial
    /// gradients.
    ///
    /// Every shot must be pending. Shot flags move to `InProgress` when its
    /// forward pass starts and to `Done` once its partial gradient is written.
    /// The first failure aborts the run; the error names the shot and stage.
    pub fn run(&mut self, acquisition: &mut Acquisition<E::Config>) -> Result<RunSummary> {
        let sampling = self.params.validate()?;
        if let Some(shot) = acquisition
            .shots()
            .iter()
            .find(|s| s.flag() != ShotFlag::Pending)
        {
            return Err(FwiError::InvalidAcquisition {
                shot_id: Some(shot.id().to_string()),
                reason: format!("shot is {}, expected Pending", shot.flag()),
            });
        }

        if self.role.is_coordinator() {
            io::ensure_dir(&self.params.work_dir)?;
            if let Some(dir) = &self.params.trace_dir {
                io::ensure_dir(dir)?;
            }
            info!(
                "{} shot(s), max_time = {}s, nb_seismo = {}, work dir {}",
                acquisition.len(),
                self.params.max_time,
                self.params.nb_seismo,
                self.params.work_dir.display()
            );
        }

        let start = Instant::now();
        let mut reports = Vec::with_capacity(acquisition.len());
        for shot in acquisition.shots_mut() {
            reports.push(self.run_shot(shot, &sampling, start)?);
        }

        let gradient = if self.role.is_coordinator() {
            let ids: Vec<String> = reports.iter().map(|r| r.shot_id.clone()).collect();
            Some(
                self.accumulator
                    .compute_full_gradient(&self.params.work_dir, &ids)?,
            )
        } else {
            None
        };

        Ok(RunSummary {
            shots: reports,
            gradient,
        })
    }

    fn run_shot(
        &mut self,
        shot: &mut Shot<E::Config>,
        sampling: &SeismoSampling,
        start: Instant,
    ) -> Result<ShotReport> {
        let id = shot.id().to_string();
        let params = &self.params;
        let callback = self.progress_callback.as_deref();
        let coordinator = self.role.is_coordinator();

        let engine = match self.engine.take() {
            None => E::initialize(self.role, shot.config()),
            Some(engine) => engine.reinitialize(shot.config()),
        }
        .map_err(at(&id, Stage::Setup))?;
        let engine = self.engine.insert(engine);

        let time_loop = TimeLoop::new(params.max_time, shot.dt(), params.output_wavefield_interval)
            .map_err(at(&id, Stage::Setup))?;
        engine
            .set_time_variables(params.max_time, shot.dt(), sampling.dt_seismo())
            .map_err(at(&id, Stage::Setup))?;
        engine
            .update_sources_and_receivers(shot.sources(), shot.receivers())
            .map_err(at(&id, Stage::Setup))?;
        engine.apply_initial_conditions();
        let observed = match &params.observed_dir {
            Some(dir) => Some(
                load_observed(dir, &id, sampling.nb_seismo(), shot.receivers().len())
                    .map_err(at(&id, Stage::Setup))?,
            ),
            None => None,
        };

        shot.advance(ShotFlag::InProgress)?;
        if coordinator {
            info!("Shot {}: forward pass", id);
        }

        let mut recorder = WavefieldRecorder::new(params.field.as_str(), self.role);
        recorder.start(Direction::Forward.record_path(&params.work_dir, &id));
        let (forward, trace) = forward_pass(engine, &mut recorder, &time_loop, |step, time| {
            if let Some(cb) = callback {
                cb(ProgressInfo {
                    shot_id: &id,
                    direction: Direction::Forward,
                    step,
                    time,
                    elapsed: start.elapsed(),
                });
            }
        })
        .map_err(at(&id, Stage::Forward))?;
        if coordinator {
            info!(
                "Shot {}: forward pass done, {} steps, {} snapshots",
                id, forward.steps, forward.snapshots
            );
        }

        if let (Some(dir), true) = (&params.trace_dir, coordinator) {
            let path = io::keyed_path(dir, TRACE_PREFIX, &id, "npy");
            io::save_npy(trace.samples().view().into_dyn(), &path)
                .map_err(at(&id, Stage::Forward))?;
        }

        let residual = build_residual(&trace, observed.as_ref().map(|o| o.view()), sampling, &id)
            .map_err(at(&id, Stage::Residual))?;

        engine.reset_wavefield();
        engine
            .update_sources_and_receivers(shot.receivers(), shot.receivers())
            .map_err(at(&id, Stage::Backward))?;
        engine
            .update_source_value(residual.view())
            .map_err(at(&id, Stage::Backward))?;
        if coordinator {
            info!("Shot {}: backward pass", id);
        }

        recorder.start(Direction::Backward.record_path(&params.work_dir, &id));
        let backward = backward_pass(
            engine,
            &mut recorder,
            &time_loop,
            forward.end_time,
            forward.steps,
            |step, time| {
                if let Some(cb) = callback {
                    cb(ProgressInfo {
                        shot_id: &id,
                        direction: Direction::Backward,
                        step,
                        time,
                        elapsed: start.elapsed(),
                    });
                }
            },
        )
        .map_err(at(&id, Stage::Backward))?;

        if backward.steps != forward.steps {
            return Err(FwiError::StepCountMismatch {
                forward: forward.steps,
                backward: backward.steps,
            }
            .in_shot(&id, Stage::Backward));
        }
        if backward.snapshots != forward.snapshots {
            return Err(FwiError::SampleCountMismatch {
                forward: forward.snapshots,
                backward: backward.snapshots,
            }
            .in_shot(&id, Stage::Backward));
        }

        if coordinator {
            assemble_partial_gradient(&params.work_dir, &id, &params.field)
                .map_err(at(&id, Stage::Imaging))?;
        }
        shot.advance(ShotFlag::Done)?;
        if coordinator {
            info!("Shot {} done", id);
        }

        Ok(ShotReport {
            shot_id: id,
            forward,
            backward,
            receivers: shot.receivers().len(),
        })
    }
}

/// Observed seismograms of `shot_id`, (nb_seismo × receivers).
fn load_observed(
    dir: &Path,
    shot_id: &str,
    nb_seismo: usize,
    receivers: usize,
) -> Result<Array2<f64>> {
    let path = io::keyed_path(dir, OBSERVED_PREFIX, shot_id, "npy");
    let values = io::load_npy_field(&path, &[nb_seismo, receivers])?;
    Array2::from_shape_vec((nb_seismo, receivers), values)
        .map_err(|e| FwiError::Other(format!("observed data layout: {}", e)))
}
