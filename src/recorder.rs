// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;
use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2};

use crate::engine::{SolverEngine, WorkerRole};
use crate::error::{FwiError, Result};
use crate::io::{self, NpzAppender};

/// Dataset holding the coordinates of every spatial sample (samples × 3).
pub const REFERENCE_POSITION: &str = "ReferencePosition";
/// Dataset holding the simulation time of every snapshot.
pub const TIME: &str = "Time";

/// Direction of travel of a simulation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Time runs from 0 to the maximum time.
    Forward,
    /// Time runs from the maximum time back to 0.
    Backward,
}

impl Direction {
    /// File name prefix of the wavefield record written by this pass.
    pub fn record_prefix(&self) -> &'static str {
        match self {
            Direction::Forward => "forwardWaveField",
            Direction::Backward => "backwardWaveField",
        }
    }

    /// Path of the record for `shot_id` under `dir`.
    pub fn record_path(&self, dir: &Path, shot_id: &str) -> PathBuf {
        io::keyed_path(dir, self.record_prefix(), shot_id, "npz")
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Backward => f.write_str("backward"),
        }
    }
}

/// Name of snapshot `index` of `field` inside a wavefield record.
///
/// Indices are zero-padded so that sorted names follow snapshot order.
pub fn snapshot_name(field: &str, index: usize) -> String {
    format!("{}/{:06}", field, index)
}

/// Prefix shared by every snapshot of `field`.
pub fn snapshot_prefix(field: &str) -> String {
    format!("{}/", field)
}

/// Collects snapshots of one named engine field.
///
/// Only snapshots not yet flushed are held in memory; the times of every
/// snapshot since the last [`WavefieldCollector::clear`] are kept.
#[derive(Debug, Clone)]
pub struct WavefieldCollector {
    field: String,
    times: Vec<f64>,
    pending: Vec<f64>,
    spatial_len: usize,
}

impl WavefieldCollector {
    /// Collector for the engine field called `field`.
    pub fn new(field: impl Into<String>) -> Self {
        WavefieldCollector {
            field: field.into(),
            times: Vec::new(),
            pending: Vec::new(),
            spatial_len: 0,
        }
    }

    /// The collected field's name.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Number of snapshots collected so far, flushed or not.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// True before the first snapshot.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Number of snapshots waiting for the next flush.
    pub fn pending(&self) -> usize {
        if self.spatial_len == 0 {
            0
        } else {
            self.pending.len() / self.spatial_len
        }
    }

    /// Simulation times of the collected snapshots.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Append a snapshot of the field at `time`.
    ///
    /// # Errors
    /// Returns an error if the engine has no such field, or if its size changed
    /// since the previous snapshot.
    pub fn collect<E: SolverEngine>(&mut self, engine: &E, time: f64, _dt: f64) -> Result<()> {
        let view = engine.field(&self.field).ok_or_else(|| {
            FwiError::InvalidConfig(format!(
                "engine has no field '{}'; available fields: {:?}",
                self.field,
                engine.field_names()
            ))
        })?;
        if self.is_empty() {
            self.spatial_len = view.len();
        } else if view.len() != self.spatial_len {
            return Err(FwiError::SpatialSizeMismatch {
                expected: self.spatial_len,
                got: view.len(),
            });
        }
        self.pending.extend(view.iter());
        self.times.push(time);
        Ok(())
    }

    /// Drop every collected snapshot.
    pub fn clear(&mut self) {
        self.times.clear();
        self.pending.clear();
        self.spatial_len = 0;
    }

    /// Hand over the unflushed snapshots as a (snapshots × spatial samples)
    /// array together with the index of its first row, and forget them.
    pub fn take_pending(&mut self) -> Result<(usize, Array2<f64>)> {
        let rows = self.pending();
        let first = self.len() - rows;
        let values = std::mem::take(&mut self.pending);
        let block = Array2::from_shape_vec((rows, self.spatial_len), values)
            .map_err(|e| FwiError::Other(format!("snapshot layout: {}", e)))?;
        Ok((first, block))
    }
}

/// Output sink appending collected snapshots to an `.npz` wavefield record.
///
/// The record stays open between flushes; each call to
/// [`WavefieldOutput::output`] appends only the snapshots collected since the
/// previous one. The time axes are written by [`WavefieldOutput::finish`],
/// after which the record can be read. Only the coordinator touches the file
/// system.
#[derive(Debug)]
pub struct WavefieldOutput {
    role: WorkerRole,
    path: Option<PathBuf>,
    record: Option<NpzAppender>,
    flushes: usize,
}

impl WavefieldOutput {
    /// Sink for the given worker.
    pub fn new(role: WorkerRole) -> Self {
        WavefieldOutput {
            role,
            path: None,
            record: None,
            flushes: 0,
        }
    }

    /// Point the sink at `path` for subsequent flushes.
    pub fn set_output_name(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// The current target file.
    pub fn output_name(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of flushes since the last [`WavefieldOutput::reinit`].
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    /// Start over: the next flush creates a fresh file. A record left open
    /// is abandoned.
    pub fn reinit(&mut self) {
        self.record = None;
        self.flushes = 0;
    }

    /// Append the collectors' pending snapshots to the current file.
    ///
    /// The collectors are drained on every worker, so memory stays bounded by
    /// one flush interval.
    pub fn output<E: SolverEngine>(
        &mut self,
        engine: &E,
        collectors: &mut [WavefieldCollector],
        _time: f64,
        _dt: f64,
    ) -> Result<()> {
        let path = self
            .path
            .clone()
            .ok_or_else(|| FwiError::InvalidConfig("wavefield output has no file name".into()))?;
        self.flushes += 1;

        let mut blocks = Vec::with_capacity(collectors.len());
        for c in collectors.iter_mut() {
            let (first, block) = c.take_pending()?;
            blocks.push((c.field().to_string(), first, block));
        }
        if !self.role.is_coordinator() {
            return Ok(());
        }

        let mut record = match self.record.take() {
            Some(record) => record,
            None => {
                let mut record = NpzAppender::create(&path)?;
                let positions = engine.reference_positions();
                record.add(REFERENCE_POSITION, positions)?;
                for (field, _, _) in &blocks {
                    record.add(&format!("{}{}", field, REFERENCE_POSITION), positions)?;
                }
                record
            }
        };
        for (field, first, block) in &blocks {
            for (k, snapshot) in block.outer_iter().enumerate() {
                record.add(&snapshot_name(field, first + k), snapshot)?;
            }
        }
        self.record = Some(record);
        Ok(())
    }

    /// Write the time axes and close the record. Does nothing if no snapshot
    /// was flushed since the last [`WavefieldOutput::reinit`].
    pub fn finish(&mut self, collectors: &[WavefieldCollector]) -> Result<()> {
        let mut record = match self.record.take() {
            Some(record) => record,
            None => return Ok(()),
        };
        let times = collectors
            .first()
            .map(|c| Array1::from(c.times().to_vec()))
            .unwrap_or_else(|| Array1::zeros(0));
        record.add(TIME, times.view())?;
        for c in collectors {
            let field_times = Array1::from(c.times().to_vec());
            record.add(&format!("{}{}", c.field(), TIME), field_times.view())?;
        }
        record.finish()
    }
}

/// One collector plus its output sink: snapshot, then flush.
#[derive(Debug)]
pub struct WavefieldRecorder {
    collector: WavefieldCollector,
    output: WavefieldOutput,
}

impl WavefieldRecorder {
    /// Recorder of the engine field `field`.
    pub fn new(field: impl Into<String>, role: WorkerRole) -> Self {
        WavefieldRecorder {
            collector: WavefieldCollector::new(field),
            output: WavefieldOutput::new(role),
        }
    }

    /// Begin a new record at `path`, discarding snapshots of the previous one.
    pub fn start(&mut self, path: impl Into<PathBuf>) {
        self.collector.clear();
        self.output.set_output_name(path);
        self.output.reinit();
    }

    /// Append a snapshot and flush it to the record.
    pub fn record<E: SolverEngine>(&mut self, engine: &E, time: f64, dt: f64) -> Result<()> {
        self.collector.collect(engine, time, dt)?;
        self.output
            .output(engine, std::slice::from_mut(&mut self.collector), time, dt)
    }

    /// Close the current record so it can be read back.
    pub fn finish(&mut self) -> Result<()> {
        self.output.finish(std::slice::from_ref(&self.collector))
    }

    /// Snapshots in the current record.
    pub fn snapshots(&self) -> usize {
        self.collector.len()
    }

    /// Snapshots held in memory, waiting to be flushed.
    pub fn buffered(&self) -> usize {
        self.collector.pending()
    }

    /// Simulation times of the snapshots in the current record.
    pub fn times(&self) -> &[f64] {
        self.collector.times()
    }

    /// The collected field's name.
    pub fn field(&self) -> &str {
        self.collector.field()
    }

    /// Current record file.
    pub fn path(&self) -> Option<&Path> {
        self.output.output_name()
    }
}
