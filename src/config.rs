// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! TOML run configuration.
//!
//! ```toml
//! [run]
//! max_time = 1.0
//! nb_seismo = 10
//! output_wavefield_interval = 30
//!
//! [acquisition]
//! dt = 0.005
//! boundary = [[0.0, 2000.0], [0.0, 2000.0], [0.0, 2000.0]]
//! start_source_pos = [101.0, 1001.0]
//! end_source_pos = [1801.0, 1001.0]
//! start_receivers_pos = [21.0, 1001.0]
//! end_receivers_pos = [1951.0, 1001.0]
//! number_of_sources = 3
//! number_of_receivers = 10
//! source_depth = 1901.0
//! receivers_depth = 1951.0
//!
//! [model]
//! shape = [101, 101, 101]
//! spacing = 20.0
//! velocity = 1500.0          # or a path to a .npy / .mat file
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::acoustic::{AcousticConfig, VelocityModel, PRESSURE_NP1};
use crate::acquisition::{Acquisition, EquispacedLayout};
use crate::error::{FwiError, Result};
use crate::gradient::GradientAccumulator;
use crate::io;
use crate::orchestrator::RunParams;

/// `[run]`: time stepping and storage of the shot loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    /// Simulated duration of each pass.
    pub max_time: f64,
    /// Seismogram samples of the residual.
    pub nb_seismo: usize,
    /// Steps between wavefield snapshots.
    pub output_wavefield_interval: usize,
    /// Directory of wavefield records and partial gradients.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    /// Full gradient file (.npy or .mat).
    #[serde(default = "default_output")]
    pub output: PathBuf,
    /// Engine field recorded and correlated.
    #[serde(default = "default_field")]
    pub field: String,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("partialGradient")
}

fn default_output() -> PathBuf {
    PathBuf::from("gradient.npy")
}

fn default_field() -> String {
    PRESSURE_NP1.to_string()
}

/// `[acquisition]`: equispaced surface acquisition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionSection {
    /// Time step of every shot.
    pub dt: f64,
    /// Model bounding box, `[min, max]` per axis.
    pub boundary: [[f64; 2]; 3],
    /// First source, horizontal coordinates.
    pub start_source_pos: [f64; 2],
    /// Last source, horizontal coordinates.
    pub end_source_pos: [f64; 2],
    /// First receiver, horizontal coordinates.
    pub start_receivers_pos: [f64; 2],
    /// Last receiver, horizontal coordinates.
    pub end_receivers_pos: [f64; 2],
    /// Number of shots.
    pub number_of_sources: usize,
    /// Receivers per shot.
    pub number_of_receivers: usize,
    /// Depth of every source.
    pub source_depth: f64,
    /// Depth of every receiver.
    pub receivers_depth: f64,
    /// Keep only receivers within this horizontal distance of the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aperture: Option<f64>,
    /// Directory of `observed_Shot<id>.npy` seismograms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_dir: Option<PathBuf>,
    /// Directory receiving `pressure_Shot<id>.npy` receiver traces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_dir: Option<PathBuf>,
    /// Per-shot weights of the gradient stack, keyed by shot id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub weights: BTreeMap<String, f64>,
}

/// Velocity of the acoustic model: a constant or a `.npy`/`.mat` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VelocitySource {
    /// Same velocity everywhere.
    Uniform(f64),
    /// Row-major velocity array on disk.
    File(PathBuf),
}

/// `[model]`: grid of the acoustic engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSection {
    /// Nodes along x, y and z.
    pub shape: [usize; 3],
    /// Node spacing.
    pub spacing: f64,
    /// Coordinates of the first node.
    #[serde(default)]
    pub origin: [f64; 3],
    /// Wave speed.
    pub velocity: VelocitySource,
    /// Peak frequency of the Ricker source.
    #[serde(default = "default_peak_frequency")]
    pub peak_frequency: f64,
}

fn default_peak_frequency() -> f64 {
    10.0
}

/// A complete run file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// `[run]` section.
    pub run: RunSection,
    /// `[acquisition]` section.
    pub acquisition: AcquisitionSection,
    /// `[model]` section.
    pub model: ModelSection,
}

fn positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(FwiError::InvalidConfig(format!(
            "{} must be positive and finite, got {}",
            name, value
        )));
    }
    Ok(())
}

impl AcquisitionSection {
    fn validate(&self) -> Result<()> {
        positive("acquisition.dt", self.dt)?;
        if self.number_of_sources == 0 || self.number_of_receivers == 0 {
            return Err(FwiError::InvalidConfig(format!(
                "need at least one source and one receiver (number_of_sources={}, number_of_receivers={})",
                self.number_of_sources, self.number_of_receivers
            )));
        }
        for (axis, &[lo, hi]) in self.boundary.iter().enumerate() {
            if !(lo.is_finite() && hi.is_finite()) || lo > hi {
                return Err(FwiError::InvalidConfig(format!(
                    "boundary of axis {} is not an interval: [{}, {}]",
                    axis, lo, hi
                )));
            }
        }
        if let Some(aperture) = self.aperture {
            if !aperture.is_finite() || aperture < 0.0 {
                return Err(FwiError::InvalidConfig(format!(
                    "aperture must be non-negative and finite, got {}",
                    aperture
                )));
            }
        }
        if let Some((id, w)) = self.weights.iter().find(|(_, w)| !w.is_finite()) {
            return Err(FwiError::InvalidConfig(format!(
                "weight of shot {} is not finite: {}",
                id, w
            )));
        }
        Ok(())
    }
}

impl ModelSection {
    fn validate(&self) -> Result<()> {
        if let Some(axis) = self.shape.iter().position(|&n| n == 0 || n == 2) {
            return Err(FwiError::InvalidConfig(format!(
                "model.shape axis {} has {} nodes (must be 1 or >= 3)",
                axis, self.shape[axis]
            )));
        }
        positive("model.spacing", self.spacing)?;
        positive("model.peak_frequency", self.peak_frequency)?;
        if let VelocitySource::Uniform(v) = self.velocity {
            positive("model.velocity", v)?;
        }
        Ok(())
    }

    fn describe_velocity(&self) -> String {
        match &self.velocity {
            VelocitySource::Uniform(v) => format!("{}", v),
            VelocitySource::File(path) => path.display().to_string(),
        }
    }
}

impl RunConfig {
    /// Parse and validate a run file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| FwiError::Storage {
            path: path.to_path_buf(),
            source: e,
        })?;
        RunConfig::parse(&text)
    }

    /// Parse and validate TOML text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: RunConfig =
            toml::from_str(text).map_err(|e| FwiError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run, before any simulation starts.
    pub fn validate(&self) -> Result<()> {
        self.run_params().validate()?;
        self.acquisition.validate()?;
        self.model.validate()
    }

    /// Shot loop parameters.
    pub fn run_params(&self) -> RunParams {
        let mut params = RunParams::new(
            self.run.max_time,
            self.run.nb_seismo,
            self.run.output_wavefield_interval,
            self.run.work_dir.clone(),
        )
        .with_field(self.run.field.clone());
        if let Some(dir) = &self.acquisition.observed_dir {
            params = params.with_observed_dir(dir.clone());
        }
        if let Some(dir) = &self.acquisition.trace_dir {
            params = params.with_trace_dir(dir.clone());
        }
        params
    }

    /// Acoustic engine configuration; velocity files are loaded here.
    pub fn engine_config(&self) -> Result<AcousticConfig> {
        let velocity = match &self.model.velocity {
            VelocitySource::Uniform(v) => VelocityModel::Uniform(*v),
            VelocitySource::File(path) => {
                VelocityModel::Field(io::load_velocity(path, &self.model.shape)?)
            }
        };
        Ok(AcousticConfig {
            shape: self.model.shape,
            spacing: self.model.spacing,
            origin: self.model.origin,
            velocity,
            peak_frequency: self.model.peak_frequency,
        })
    }

    /// Equispaced acquisition bound to `engine`, aperture applied.
    pub fn build_acquisition<C>(&self, engine: Arc<C>) -> Result<Acquisition<C>> {
        let a = &self.acquisition;
        let layout = EquispacedLayout {
            boundary: a.boundary,
            dt: a.dt,
            start_source_pos: a.start_source_pos,
            end_source_pos: a.end_source_pos,
            start_receivers_pos: a.start_receivers_pos,
            end_receivers_pos: a.end_receivers_pos,
            number_of_sources: a.number_of_sources,
            number_of_receivers: a.number_of_receivers,
            source_depth: a.source_depth,
            receivers_depth: a.receivers_depth,
            velocity_model: self.model.describe_velocity(),
        };
        let mut acquisition = Acquisition::equispaced(&layout, engine)?;
        if let Some(aperture) = a.aperture {
            acquisition.limit_aperture(aperture)?;
        }
        Ok(acquisition)
    }

    /// Gradient accumulator carrying the configured shot weights.
    pub fn accumulator(&self, threads: Option<usize>) -> GradientAccumulator {
        let mut acc = GradientAccumulator::new();
        if let Some(n) = threads {
            acc = acc.with_threads(n);
        }
        for (id, &w) in &self.acquisition.weights {
            acc = acc.with_weight(id.clone(), w);
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    const RUN: &str = r#"
[run]
max_time = 1.0
nb_seismo = 10
output_wavefield_interval = 30

[acquisition]
dt = 0.005
boundary = [[0.0, 2000.0], [0.0, 2000.0], [0.0, 2000.0]]
start_source_pos = [101.0, 1001.0]
end_source_pos = [1801.0, 1001.0]
start_receivers_pos = [21.0, 1001.0]
end_receivers_pos = [1951.0, 1001.0]
number_of_sources = 3
number_of_receivers = 10
source_depth = 1901.0
receivers_depth = 1951.0

[model]
shape = [101, 101, 101]
spacing = 20.0
velocity = 1500.0
"#;

    #[test]
    fn parses_with_defaults() {
        let config = RunConfig::parse(RUN).unwrap();
        assert_eq!(config.run.work_dir, PathBuf::from("partialGradient"));
        assert_eq!(config.run.field, "pressure_np1");
        assert_eq!(config.model.origin, [0.0; 3]);
        assert_eq!(config.model.velocity, VelocitySource::Uniform(1500.0));
        assert!(config.acquisition.aperture.is_none());

        let params = config.run_params();
        assert_eq!(params.nb_seismo, 10);
        assert_eq!(params.output_wavefield_interval, 30);
        assert!(params.observed_dir.is_none());
    }

    #[test]
    fn builds_equispaced_acquisition() {
        let config = RunConfig::parse(RUN).unwrap();
        let acq = config.build_acquisition(Arc::new(())).unwrap();
        assert_eq!(acq.len(), 3);
        let ids: Vec<&str> = acq.shots().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["001", "002", "003"]);
        assert_eq!(acq.shots()[1].sources()[0], [951.0, 1001.0, 1901.0]);
        assert_eq!(acq.shots()[0].receivers().len(), 10);
        assert_eq!(acq.geometry().velocity_model, "1500");
    }

    #[test]
    fn aperture_is_applied() {
        let text = RUN.replace("receivers_depth = 1951.0", "receivers_depth = 1951.0\naperture = 300.0");
        let config = RunConfig::parse(&text).unwrap();
        let acq = config.build_acquisition(Arc::new(())).unwrap();
        assert_eq!(acq.shots()[0].receivers().len(), 2);
    }

    #[test]
    fn rejects_invalid_values() {
        for (from, to) in [
            ("nb_seismo = 10", "nb_seismo = 1"),
            ("output_wavefield_interval = 30", "output_wavefield_interval = 0"),
            ("dt = 0.005", "dt = -0.005"),
            ("number_of_sources = 3", "number_of_sources = 0"),
            ("shape = [101, 101, 101]", "shape = [101, 2, 101]"),
            ("velocity = 1500.0", "velocity = -1.0"),
            ("max_time = 1.0", "max_time = 0.0"),
        ] {
            let text = RUN.replace(from, to);
            assert!(
                matches!(RunConfig::parse(&text), Err(FwiError::InvalidConfig(_)) | Err(FwiError::InvalidSampling { .. })),
                "{} should be rejected",
                to
            );
        }
        assert!(RunConfig::parse("[run]\nmax_time = 1.0").is_err());
    }

    #[test]
    fn weights_reach_the_accumulator() {
        let text = RUN.replace("\n[model]", "\n[acquisition.weights]\n\"002\" = 0.5\n\n[model]");
        let config = RunConfig::parse(&text).unwrap();
        assert_eq!(config.acquisition.weights.get("002"), Some(&0.5));

        let bad = RUN.replace("\n[model]", "\n[acquisition.weights]\n\"002\" = nan\n\n[model]");
        assert!(RunConfig::parse(&bad).is_err());
    }

    #[test]
    fn velocity_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("velocity.npy");
        let v = Array3::<f64>::from_elem((3, 1, 4), 2000.0);
        io::save_npy(v.view().into_dyn(), &path).unwrap();

        let text = RUN
            .replace("shape = [101, 101, 101]", "shape = [3, 1, 4]")
            .replace("velocity = 1500.0", &format!("velocity = {:?}", path.display().to_string()));
        let config = RunConfig::parse(&text).unwrap();
        let engine = config.engine_config().unwrap();
        assert_eq!(engine.velocity, VelocityModel::Field(vec![2000.0; 12]));

        let missing = RUN.replace("velocity = 1500.0", "velocity = \"nowhere.npy\"");
        assert!(RunConfig::parse(&missing).unwrap().engine_config().is_err());
    }
}
