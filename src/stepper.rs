// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use ndarray::Array2;
use tracing::debug;

use crate::engine::SolverEngine;
use crate::error::{FwiError, Result};
use crate::recorder::{Direction, WavefieldRecorder};

/// Time stepping parameters shared by the forward and backward passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeLoop {
    /// Simulated duration.
    pub max_time: f64,
    /// Time step.
    pub dt: f64,
    /// A snapshot is recorded every `record_interval` steps.
    pub record_interval: usize,
}

impl TimeLoop {
    /// Validated time loop.
    pub fn new(max_time: f64, dt: f64, record_interval: usize) -> Result<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FwiError::InvalidTimeStep(dt));
        }
        if !max_time.is_finite() || max_time <= 0.0 {
            return Err(FwiError::InvalidConfig(format!(
                "max_time must be positive and finite, got {}",
                max_time
            )));
        }
        if record_interval == 0 {
            return Err(FwiError::InvalidConfig(
                "output_wavefield_interval must be at least 1".to_string(),
            ));
        }
        Ok(TimeLoop {
            max_time,
            dt,
            record_interval,
        })
    }

    /// Nominal number of steps, `ceil(max_time / dt)`.
    ///
    /// The forward pass accumulates time additively, so rounding can make it
    /// execute one step more than this; [`PassReport::steps`] holds the count
    /// actually run.
    pub fn nominal_steps(&self) -> usize {
        (self.max_time / self.dt).ceil() as usize
    }
}

/// Receiver pressure of a forward pass, one row per time level.
///
/// Row 0 is the state before the first step, row `k` the state after step
/// `k`, so row `k` sits at time `k * dt`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiverTrace {
    samples: Array2<f64>,
    dt: f64,
}

impl ReceiverTrace {
    /// Wrap a (time levels × receivers) array sampled every `dt`.
    pub fn new(samples: Array2<f64>, dt: f64) -> Result<Self> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FwiError::InvalidTimeStep(dt));
        }
        if samples.nrows() == 0 {
            return Err(FwiError::InvalidConfig(
                "receiver trace has no samples".to_string(),
            ));
        }
        Ok(ReceiverTrace { samples, dt })
    }

    /// (time levels × receivers) pressure values.
    pub fn samples(&self) -> &Array2<f64> {
        &self.samples
    }

    /// Sampling interval.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Number of receivers.
    pub fn receivers(&self) -> usize {
        self.samples.ncols()
    }

    /// Consume the trace, returning its samples.
    pub fn into_samples(self) -> Array2<f64> {
        self.samples
    }
}

/// Bookkeeping of one completed pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PassReport {
    /// Which way time ran.
    pub direction: Direction,
    /// Steps executed.
    pub steps: usize,
    /// Snapshots recorded.
    pub snapshots: usize,
    /// Simulation time when the loop stopped.
    pub end_time: f64,
}

/// Run the engine from time 0 to `max_time`.
///
/// Time accumulates additively and the loop runs while `time < max_time`, so
/// the step that reaches or passes `max_time` is still executed. A snapshot is
/// recorded after every step whose count is a multiple of the record
/// interval. `on_step(step, time)` is called before each step.
pub fn forward_pass<E, F>(
    engine: &mut E,
    recorder: &mut WavefieldRecorder,
    time_loop: &TimeLoop,
    mut on_step: F,
) -> Result<(PassReport, ReceiverTrace)>
where
    E: SolverEngine,
    F: FnMut(usize, f64),
{
    let TimeLoop {
        max_time,
        dt,
        record_interval,
    } = *time_loop;
    let verbose = engine.role().is_coordinator();
    let receivers = engine.receiver_pressure().len();

    let mut trace: Vec<f64> = Vec::with_capacity((time_loop.nominal_steps() + 2) * receivers);
    trace.extend(engine.receiver_pressure().iter());

    let mut time = 0.0;
    let mut step = 0usize;
    while time < max_time {
        if verbose {
            debug!("time = {:.3}s, dt = {:.4}, iter = {}", time, dt, step + 1);
        }
        on_step(step + 1, time);

        engine.execute(time, dt)?;
        time += dt;
        step += 1;

        let pressure = engine.receiver_pressure();
        if pressure.len() != receivers {
            return Err(FwiError::SpatialSizeMismatch {
                expected: receivers,
                got: pressure.len(),
            });
        }
        trace.extend(pressure.iter());

        if step % record_interval == 0 {
            recorder.record(engine, time, dt)?;
        }
    }

    recorder.finish()?;

    let samples = Array2::from_shape_vec((step + 1, receivers), trace)
        .map_err(|e| FwiError::Other(format!("receiver trace layout: {}", e)))?;
    let report = PassReport {
        direction: Direction::Forward,
        steps: step,
        snapshots: recorder.snapshots(),
        end_time: time,
    };
    Ok((report, ReceiverTrace::new(samples, dt)?))
}

/// Run the engine from `start_time` back to 0 for exactly `steps` steps.
///
/// Time decreases additively by `dt`, and the step counter runs from `steps`
/// down to 1 so that snapshot `k` of this pass is taken at the same step index
/// as snapshot `n - 1 - k` of the forward pass. The step count is fixed up
/// front; rounding in the time variable cannot add or drop a step.
pub fn backward_pass<E, F>(
    engine: &mut E,
    recorder: &mut WavefieldRecorder,
    time_loop: &TimeLoop,
    start_time: f64,
    steps: usize,
    mut on_step: F,
) -> Result<PassReport>
where
    E: SolverEngine,
    F: FnMut(usize, f64),
{
    let TimeLoop {
        dt,
        record_interval,
        ..
    } = *time_loop;
    let verbose = engine.role().is_coordinator();

    let mut time = start_time;
    let mut step = steps;
    let mut executed = 0usize;
    while step > 0 {
        if verbose {
            debug!("time = {:.3}s, dt = {:.4}, iter = {}", time, dt, step);
        }
        on_step(step, time);

        engine.execute(time, dt)?;
        executed += 1;

        if step % record_interval == 0 {
            recorder.record(engine, time, dt)?;
        }

        time -= dt;
        step -= 1;
    }
    recorder.finish()?;

    Ok(PassReport {
        direction: Direction::Backward,
        steps: executed,
        snapshots: recorder.snapshots(),
        end_time: time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acoustic::{AcousticConfig, AcousticEngine, VelocityModel, PRESSURE_NP1};
    use crate::engine::WorkerRole;

    fn engine() -> AcousticEngine {
        engine_with(1000.0, 0.005)
    }

    fn engine_with(velocity: f64, dt: f64) -> AcousticEngine {
        let config = AcousticConfig {
            shape: [21, 1, 21],
            spacing: 10.0,
            origin: [0.0; 3],
            velocity: VelocityModel::Uniform(velocity),
            peak_frequency: 15.0,
        };
        let mut e = AcousticEngine::initialize(WorkerRole::single(), &config).unwrap();
        e.set_time_variables(1.0, dt, 1.0 / 9.0).unwrap();
        e.update_sources_and_receivers(
            &[[100.0, 0.0, 100.0]],
            &[[50.0, 0.0, 20.0], [150.0, 0.0, 20.0]],
        )
        .unwrap();
        e.apply_initial_conditions();
        e
    }

    #[test]
    fn time_loop_validation() {
        assert!(TimeLoop::new(1.0, 0.0, 30).is_err());
        assert!(TimeLoop::new(0.0, 0.005, 30).is_err());
        assert!(TimeLoop::new(1.0, 0.005, 0).is_err());
        assert_eq!(TimeLoop::new(1.0, 0.005, 30).unwrap().nominal_steps(), 200);
        assert_eq!(TimeLoop::new(1.0, 0.003, 30).unwrap().nominal_steps(), 334);
    }

    #[test]
    fn forward_runs_ceil_steps_and_records_on_cadence() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        let mut rec = WavefieldRecorder::new(PRESSURE_NP1, WorkerRole::single());
        rec.start(dir.path().join("forwardWaveField001.npz"));
        let tl = TimeLoop::new(1.0, 0.005, 30).unwrap();

        let mut visited = Vec::new();
        let (report, trace) =
            forward_pass(&mut engine, &mut rec, &tl, |step, _| visited.push(step)).unwrap();

        assert_eq!(report.steps, 200);
        assert_eq!(report.snapshots, 6);
        assert_eq!(visited.first(), Some(&1));
        assert_eq!(visited.last(), Some(&200));
        assert_eq!(trace.samples().dim(), (201, 2));
        assert!(report.end_time >= 1.0);
    }

    #[test]
    fn backward_mirrors_forward_step_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        let mut rec = WavefieldRecorder::new(PRESSURE_NP1, WorkerRole::single());
        let tl = TimeLoop::new(1.0, 0.005, 30).unwrap();

        rec.start(dir.path().join("forwardWaveField001.npz"));
        let (fwd, _) = forward_pass(&mut engine, &mut rec, &tl, |_, _| {}).unwrap();

        engine.reset_wavefield();
        rec.start(dir.path().join("backwardWaveField001.npz"));
        let mut steps = Vec::new();
        let bwd =
            backward_pass(&mut engine, &mut rec, &tl, fwd.end_time, fwd.steps, |s, _| {
                steps.push(s)
            })
            .unwrap();

        assert_eq!(bwd.steps, fwd.steps);
        assert_eq!(bwd.snapshots, fwd.snapshots);
        assert_eq!(steps.first(), Some(&200));
        assert_eq!(steps.last(), Some(&1));
        assert!(bwd.end_time.abs() < 1e-9);
    }

    #[test]
    fn inexact_ratio_still_matches() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        let mut rec = WavefieldRecorder::new(PRESSURE_NP1, WorkerRole::single());
        let tl = TimeLoop::new(0.5, 0.0035, 7).unwrap();

        rec.start(dir.path().join("f.npz"));
        let (fwd, _) = forward_pass(&mut engine, &mut rec, &tl, |_, _| {}).unwrap();
        rec.start(dir.path().join("b.npz"));
        let bwd = backward_pass(&mut engine, &mut rec, &tl, fwd.end_time, fwd.steps, |_, _| {})
            .unwrap();

        assert_eq!(fwd.steps, tl.nominal_steps());
        assert_eq!(bwd.steps, fwd.steps);
        assert_eq!(bwd.snapshots, fwd.snapshots);
    }

    #[test]
    fn backward_snapshots_mirror_forward_times() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine();
        let mut rec = WavefieldRecorder::new(PRESSURE_NP1, WorkerRole::single());
        let tl = TimeLoop::new(1.0, 0.005, 30).unwrap();

        rec.start(dir.path().join("forwardWaveField001.npz"));
        let (fwd, _) = forward_pass(&mut engine, &mut rec, &tl, |_, _| {}).unwrap();
        let forward_times = rec.times().to_vec();

        engine.reset_wavefield();
        rec.start(dir.path().join("backwardWaveField001.npz"));
        backward_pass(&mut engine, &mut rec, &tl, fwd.end_time, fwd.steps, |_, _| {}).unwrap();
        let backward_times = rec.times().to_vec();

        // steps 30, 60, ..., 180
        let expected: Vec<f64> = (1..=6).map(|k| 0.15 * k as f64).collect();
        assert_eq!(forward_times.len(), expected.len());
        for (t, e) in forward_times.iter().zip(&expected) {
            assert!((t - e).abs() < 1e-9, "forward snapshot at {}, expected {}", t, e);
        }
        let n = forward_times.len();
        assert_eq!(backward_times.len(), n);
        for k in 0..n {
            assert!(
                (backward_times[k] - forward_times[n - 1 - k]).abs() < 1e-9,
                "backward snapshot {} at {}",
                k,
                backward_times[k]
            );
        }

        let stored = crate::io::read_npz_dataset(
            &dir.path().join("backwardWaveField001.npz"),
            crate::recorder::TIME,
        )
        .unwrap();
        assert_eq!(stored.iter().cloned().collect::<Vec<_>>(), backward_times);
    }

    #[test]
    fn additive_time_can_exceed_nominal_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(10.0, 0.1);
        let mut rec = WavefieldRecorder::new(PRESSURE_NP1, WorkerRole::single());
        let tl = TimeLoop::new(1.0, 0.1, 5).unwrap();

        rec.start(dir.path().join("f.npz"));
        let (fwd, trace) = forward_pass(&mut engine, &mut rec, &tl, |_, _| {}).unwrap();

        assert_eq!(tl.nominal_steps(), 10);
        assert_eq!(fwd.steps, 11);
        assert_eq!(trace.samples().nrows(), fwd.steps + 1);
    }

    #[test]
    fn receiver_trace_rejects_empty() {
        assert!(ReceiverTrace::new(Array2::zeros((0, 3)), 0.1).is_err());
        assert!(ReceiverTrace::new(Array2::zeros((2, 3)), -0.1).is_err());
    }
}
