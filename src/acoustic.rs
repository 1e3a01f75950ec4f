// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Constant-density acoustic finite-difference engine.
//!
//! Second order in time and space on a regular grid with zero pressure on the
//! boundary. Axes of size 1 are treated as invariant, so a `[nx, 1, nz]` grid
//! gives a 2D model. This is the engine the command line tool runs; the shot
//! loop itself only depends on [`SolverEngine`].

use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::acquisition::Position;
use crate::engine::{SolverEngine, WorkerRole};
use crate::error::{FwiError, Result};

/// Name of the newest pressure field.
pub const PRESSURE_NP1: &str = "pressure_np1";
/// Name of the pressure field one step behind.
pub const PRESSURE_N: &str = "pressure_n";

/// Velocity model of the acoustic medium.
#[derive(Debug, Clone, PartialEq)]
pub enum VelocityModel {
    /// Same velocity everywhere.
    Uniform(f64),
    /// One velocity per grid node, row-major.
    Field(Vec<f64>),
}

/// Grid and medium of the acoustic engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticConfig {
    /// Nodes along x, y and z. Each axis is 1 or at least 3.
    pub shape: [usize; 3],
    /// Uniform node spacing.
    pub spacing: f64,
    /// Coordinates of node `[0, 0, 0]`.
    pub origin: [f64; 3],
    /// Wave speed.
    pub velocity: VelocityModel,
    /// Peak frequency of the built-in Ricker source.
    pub peak_frequency: f64,
}

impl AcousticConfig {
    fn validate(&self) -> Result<Vec<f64>> {
        for (axis, &n) in self.shape.iter().enumerate() {
            if n == 0 || n == 2 {
                return Err(FwiError::InvalidConfig(format!(
                    "grid axis {} has {} nodes (must be 1 or >= 3)",
                    axis, n
                )));
            }
        }
        if !self.spacing.is_finite() || self.spacing <= 0.0 {
            return Err(FwiError::InvalidConfig(format!(
                "grid spacing must be positive and finite, got {}",
                self.spacing
            )));
        }
        if !self.peak_frequency.is_finite() || self.peak_frequency <= 0.0 {
            return Err(FwiError::InvalidConfig(format!(
                "peak frequency must be positive and finite, got {}",
                self.peak_frequency
            )));
        }
        let num_nodes: usize = self.shape.iter().product();
        let velocity = match &self.velocity {
            VelocityModel::Uniform(v) => vec![*v; num_nodes],
            VelocityModel::Field(v) => {
                if v.len() != num_nodes {
                    return Err(FwiError::ShapeMismatch {
                        expected: self.shape.to_vec(),
                        got: vec![v.len()],
                    });
                }
                v.clone()
            }
        };
        for (index, &value) in velocity.iter().enumerate() {
            if !value.is_finite() || value <= 0.0 {
                return Err(FwiError::InvalidVelocity { index, value });
            }
        }
        Ok(velocity)
    }
}

/// Ricker wavelet with peak frequency `f0`, delayed by `1.2 / f0`.
pub fn ricker(t: f64, f0: f64) -> f64 {
    let tau = t - 1.2 / f0;
    let arg = (PI * f0 * tau).powi(2);
    (1.0 - 2.0 * arg) * (-arg).exp()
}

#[derive(Debug, Clone)]
enum SourceSignal {
    Ricker,
    Sampled(Array2<f64>),
}

/// Acoustic wave-equation engine on a regular grid.
pub struct AcousticEngine {
    role: WorkerRole,
    shape: [usize; 3],
    strides: [usize; 3],
    spacing: f64,
    peak_frequency: f64,
    velocity: Vec<f64>,
    positions: Array2<f64>,
    current: Array1<f64>,
    previous: Array1<f64>,
    scratch: Array1<f64>,
    source_nodes: Vec<usize>,
    receiver_nodes: Vec<usize>,
    receiver_values: Array1<f64>,
    signal: SourceSignal,
    max_time: f64,
    dt_seismo: f64,
}

fn row_major_strides(shape: [usize; 3]) -> [usize; 3] {
    [shape[1] * shape[2], shape[2], 1]
}

fn node_positions(shape: [usize; 3], spacing: f64, origin: [f64; 3]) -> Array2<f64> {
    let num_nodes: usize = shape.iter().product();
    let strides = row_major_strides(shape);
    Array2::from_shape_fn((num_nodes, 3), |(flat, axis)| {
        let idx = (flat / strides[axis]) % shape[axis];
        origin[axis] + idx as f64 * spacing
    })
}

impl AcousticEngine {
    fn build(role: WorkerRole, config: &AcousticConfig) -> Result<Self> {
        let velocity = config.validate()?;
        let num_nodes = velocity.len();
        Ok(AcousticEngine {
            role,
            shape: config.shape,
            strides: row_major_strides(config.shape),
            spacing: config.spacing,
            peak_frequency: config.peak_frequency,
            velocity,
            positions: node_positions(config.shape, config.spacing, config.origin),
            current: Array1::zeros(num_nodes),
            previous: Array1::zeros(num_nodes),
            scratch: Array1::zeros(num_nodes),
            source_nodes: Vec::new(),
            receiver_nodes: Vec::new(),
            receiver_values: Array1::zeros(0),
            signal: SourceSignal::Ricker,
            max_time: 0.0,
            dt_seismo: 0.0,
        })
    }

    /// Number of grid nodes.
    pub fn num_nodes(&self) -> usize {
        self.velocity.len()
    }

    /// Largest stable time step for the current velocity model.
    pub fn stable_dt(&self) -> f64 {
        let v_max = self.velocity.iter().cloned().fold(0.0_f64, f64::max);
        let active_axes = self.shape.iter().filter(|&&n| n > 1).count().max(1);
        self.spacing / (v_max * (active_axes as f64).sqrt())
    }

    fn nearest_node(&self, p: &Position) -> Result<usize> {
        let mut flat = 0;
        for axis in 0..3 {
            let origin = self.positions[[0, axis]];
            let x = (p[axis] - origin) / self.spacing;
            let max_idx = (self.shape[axis] - 1) as f64;
            if !x.is_finite() || x < -0.5 || x > max_idx + 0.5 {
                return Err(FwiError::InvalidAcquisition {
                    shot_id: None,
                    reason: format!("position {:?} lies outside the computational grid", p),
                });
            }
            let idx = x.round().clamp(0.0, max_idx) as usize;
            flat += idx * self.strides[axis];
        }
        Ok(flat)
    }

    fn is_boundary(&self, flat: usize) -> bool {
        (0..3).any(|axis| {
            let n = self.shape[axis];
            let idx = (flat / self.strides[axis]) % n;
            n > 1 && (idx == 0 || idx == n - 1)
        })
    }

    fn source_amplitude(&self, source: usize, time: f64) -> f64 {
        match &self.signal {
            SourceSignal::Ricker => ricker(time, self.peak_frequency),
            SourceSignal::Sampled(values) => {
                let column = values.column(source.min(values.ncols() - 1));
                sample_linear(column, time, self.dt_seismo)
            }
        }
    }
}

fn sample_linear(series: ArrayView1<'_, f64>, time: f64, step: f64) -> f64 {
    let last = series.len() - 1;
    if step <= 0.0 || last == 0 {
        return series[0];
    }
    let x = (time / step).max(0.0);
    let i0 = (x.floor() as usize).min(last);
    let i1 = (i0 + 1).min(last);
    let frac = (x - i0 as f64).clamp(0.0, 1.0);
    series[i0] * (1.0 - frac) + series[i1] * frac
}

impl SolverEngine for AcousticEngine {
    type Config = AcousticConfig;

    fn initialize(role: WorkerRole, config: &AcousticConfig) -> Result<Self> {
        AcousticEngine::build(role, config)
    }

    fn reinitialize(mut self, config: &AcousticConfig) -> Result<Self> {
        if config.shape != self.shape {
            return AcousticEngine::build(self.role, config);
        }
        self.velocity = config.validate()?;
        self.spacing = config.spacing;
        self.peak_frequency = config.peak_frequency;
        self.positions = node_positions(config.shape, config.spacing, config.origin);
        self.source_nodes.clear();
        self.receiver_nodes.clear();
        self.receiver_values = Array1::zeros(0);
        self.signal = SourceSignal::Ricker;
        self.reset_wavefield();
        Ok(self)
    }

    fn role(&self) -> WorkerRole {
        self.role
    }

    fn set_time_variables(&mut self, max_time: f64, dt: f64, dt_seismo: f64) -> Result<()> {
        if !dt.is_finite() || dt <= 0.0 {
            return Err(FwiError::InvalidTimeStep(dt));
        }
        let limit = self.stable_dt();
        if dt > limit {
            return Err(FwiError::InvalidConfig(format!(
                "time step {} violates the CFL limit {}",
                dt, limit
            )));
        }
        self.max_time = max_time;
        self.dt_seismo = dt_seismo;
        Ok(())
    }

    fn update_sources_and_receivers(
        &mut self,
        sources: &[Position],
        receivers: &[Position],
    ) -> Result<()> {
        self.source_nodes = sources
            .iter()
            .map(|p| self.nearest_node(p))
            .collect::<Result<Vec<_>>>()?;
        self.receiver_nodes = receivers
            .iter()
            .map(|p| self.nearest_node(p))
            .collect::<Result<Vec<_>>>()?;
        self.receiver_values = Array1::zeros(self.receiver_nodes.len());
        self.signal = SourceSignal::Ricker;
        Ok(())
    }

    fn update_source_value(&mut self, values: ArrayView2<'_, f64>) -> Result<()> {
        if values.nrows() == 0 || values.ncols() != self.source_nodes.len() {
            return Err(FwiError::ShapeMismatch {
                expected: vec![values.nrows().max(1), self.source_nodes.len()],
                got: values.shape().to_vec(),
            });
        }
        self.signal = SourceSignal::Sampled(values.to_owned());
        Ok(())
    }

    fn apply_initial_conditions(&mut self) {
        self.reset_wavefield();
    }

    fn execute(&mut self, time: f64, dt: f64) -> Result<()> {
        let h2 = self.spacing * self.spacing;
        let num_nodes = self.num_nodes();

        for flat in 0..num_nodes {
            if self.is_boundary(flat) {
                self.scratch[flat] = 0.0;
                continue;
            }
            let centre = self.current[flat];
            let mut lap = 0.0;
            for axis in 0..3 {
                if self.shape[axis] > 1 {
                    let s = self.strides[axis];
                    lap += self.current[flat + s] - 2.0 * centre + self.current[flat - s];
                }
            }
            let c = self.velocity[flat];
            self.scratch[flat] =
                2.0 * centre - self.previous[flat] + c * c * dt * dt * lap / h2;
        }

        for (i, &node) in self.source_nodes.iter().enumerate() {
            if !self.is_boundary(node) {
                let c = self.velocity[node];
                let amplitude = self.source_amplitude(i, time);
                self.scratch[node] += c * c * dt * dt * amplitude;
            }
        }

        // previous <- current <- scratch
        std::mem::swap(&mut self.previous, &mut self.current);
        std::mem::swap(&mut self.current, &mut self.scratch);

        for (value, &node) in self.receiver_values.iter_mut().zip(&self.receiver_nodes) {
            *value = self.current[node];
        }
        Ok(())
    }

    fn reset_wavefield(&mut self) {
        self.current.fill(0.0);
        self.previous.fill(0.0);
        self.scratch.fill(0.0);
        self.receiver_values.fill(0.0);
    }

    fn receiver_pressure(&self) -> ArrayView1<'_, f64> {
        self.receiver_values.view()
    }

    fn field(&self, name: &str) -> Option<ArrayView1<'_, f64>> {
        match name {
            PRESSURE_NP1 => Some(self.current.view()),
            PRESSURE_N => Some(self.previous.view()),
            _ => None,
        }
    }

    fn field_names(&self) -> Vec<String> {
        vec![PRESSURE_NP1.to_string(), PRESSURE_N.to_string()]
    }

    fn reference_positions(&self) -> ArrayView2<'_, f64> {
        self.positions.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_2d(n: usize) -> AcousticConfig {
        AcousticConfig {
            shape: [n, 1, n],
            spacing: 10.0,
            origin: [0.0; 3],
            velocity: VelocityModel::Uniform(1500.0),
            peak_frequency: 10.0,
        }
    }

    #[test]
    fn ricker_peaks_at_delay() {
        let f0 = 10.0;
        assert!((ricker(1.2 / f0, f0) - 1.0).abs() < 1e-12);
        assert!(ricker(0.0, f0).abs() < 1e-3);
    }

    #[test]
    fn reference_positions_cover_grid() {
        let engine = AcousticEngine::initialize(WorkerRole::single(), &config_2d(5)).unwrap();
        let pos = engine.reference_positions();
        assert_eq!(pos.dim(), (25, 3));
        assert_eq!(pos.row(0).to_vec(), vec![0.0, 0.0, 0.0]);
        assert_eq!(pos.row(1).to_vec(), vec![0.0, 0.0, 10.0]);
        assert_eq!(pos.row(24).to_vec(), vec![40.0, 0.0, 40.0]);
    }

    #[test]
    fn invalid_configs_rejected() {
        let mut cfg = config_2d(5);
        cfg.shape = [2, 1, 5];
        assert!(AcousticEngine::initialize(WorkerRole::single(), &cfg).is_err());

        let mut cfg = config_2d(5);
        cfg.velocity = VelocityModel::Field(vec![1500.0; 24]);
        assert!(matches!(
            AcousticEngine::initialize(WorkerRole::single(), &cfg),
            Err(FwiError::ShapeMismatch { .. })
        ));

        let mut cfg = config_2d(3);
        let mut v = vec![1500.0; 9];
        v[4] = -1.0;
        cfg.velocity = VelocityModel::Field(v);
        assert!(matches!(
            AcousticEngine::initialize(WorkerRole::single(), &cfg),
            Err(FwiError::InvalidVelocity { index: 4, .. })
        ));
    }

    #[test]
    fn cfl_violation_rejected() {
        let mut engine = AcousticEngine::initialize(WorkerRole::single(), &config_2d(11)).unwrap();
        // h / (v * sqrt(2)) = 10 / (1500 * 1.414) ~ 0.0047
        assert!(engine.set_time_variables(1.0, 0.001, 0.1).is_ok());
        assert!(engine.set_time_variables(1.0, 0.01, 0.1).is_err());
    }

    #[test]
    fn source_energy_reaches_receiver() {
        let mut engine = AcousticEngine::initialize(WorkerRole::single(), &config_2d(41)).unwrap();
        engine.set_time_variables(0.3, 0.002, 0.03).unwrap();
        engine
            .update_sources_and_receivers(&[[200.0, 0.0, 200.0]], &[[200.0, 0.0, 300.0]])
            .unwrap();
        engine.apply_initial_conditions();

        let mut time = 0.0;
        let mut peak = 0.0_f64;
        while time < 0.3 {
            engine.execute(time, 0.002).unwrap();
            time += 0.002;
            peak = peak.max(engine.receiver_pressure()[0].abs());
        }
        assert!(peak > 0.0);
        assert!(engine.field(PRESSURE_NP1).unwrap().iter().all(|v| v.is_finite()));

        engine.reset_wavefield();
        assert!(engine.field(PRESSURE_NP1).unwrap().iter().all(|&v| v == 0.0));
        assert!(engine.field("velocity").is_none());
    }

    #[test]
    fn reinitialize_keeps_role_and_clears_state() {
        let role = WorkerRole::new(0, 2).unwrap();
        let mut engine = AcousticEngine::initialize(role, &config_2d(9)).unwrap();
        engine.set_time_variables(0.1, 0.002, 0.01).unwrap();
        engine
            .update_sources_and_receivers(&[[40.0, 0.0, 40.0]], &[[40.0, 0.0, 60.0]])
            .unwrap();
        engine.execute(0.12, 0.002).unwrap();

        let engine = engine.reinitialize(&config_2d(9)).unwrap();
        assert_eq!(engine.role(), role);
        assert_eq!(engine.receiver_pressure().len(), 0);
        assert!(engine.field(PRESSURE_NP1).unwrap().iter().all(|&v| v == 0.0));

        let engine = engine.reinitialize(&config_2d(7)).unwrap();
        assert_eq!(engine.num_nodes(), 49);
    }

    #[test]
    fn sampled_source_requires_matching_columns() {
        let mut engine = AcousticEngine::initialize(WorkerRole::single(), &config_2d(9)).unwrap();
        engine
            .update_sources_and_receivers(
                &[[40.0, 0.0, 40.0], [40.0, 0.0, 50.0]],
                &[[40.0, 0.0, 60.0]],
            )
            .unwrap();
        assert!(engine.update_source_value(Array2::<f64>::zeros((10, 1)).view()).is_err());
        assert!(engine.update_source_value(Array2::<f64>::zeros((10, 2)).view()).is_ok());
    }

    #[test]
    fn positions_outside_grid_rejected() {
        let mut engine = AcousticEngine::initialize(WorkerRole::single(), &config_2d(5)).unwrap();
        let err = engine
            .update_sources_and_receivers(&[[100.0, 0.0, 10.0]], &[[10.0, 0.0, 10.0]])
            .unwrap_err();
        assert!(matches!(err, FwiError::InvalidAcquisition { .. }));
    }

    #[test]
    fn linear_sampling_clamps() {
        let series = Array1::from(vec![0.0, 1.0, 4.0]);
        assert_eq!(sample_linear(series.view(), 0.5, 1.0), 0.5);
        assert_eq!(sample_linear(series.view(), 1.5, 1.0), 2.5);
        assert_eq!(sample_linear(series.view(), 9.0, 1.0), 4.0);
        assert_eq!(sample_linear(series.view(), -1.0, 1.0), 0.0);
    }
}
