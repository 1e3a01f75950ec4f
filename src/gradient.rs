// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::collections::HashMap;
use std::path::Path;

use crossbeam_queue::SegQueue;
use ndarray::{Array1, Array2, Ix1, Ix2};
use tracing::info;

use crate::error::{ensure_finite, FwiError, Result, Stage};
use crate::imaging::partial_gradient_path;
use crate::io;
use crate::recorder::REFERENCE_POSITION;

/// Dataset (and file prefix) of a shot's partial gradient.
pub const PARTIAL_GRADIENT: &str = "partialGradient";

/// One shot's contribution to the gradient, one value per spatial sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialGradient {
    shot_id: String,
    values: Array1<f64>,
}

impl PartialGradient {
    /// Wrap the stacked imaging values of `shot_id`.
    pub fn new(shot_id: impl Into<String>, values: Array1<f64>) -> Self {
        PartialGradient {
            shot_id: shot_id.into(),
            values,
        }
    }

    /// Load the partial gradient of `shot_id` written under `dir`.
    pub fn load(dir: &Path, shot_id: &str) -> Result<Self> {
        let path = partial_gradient_path(dir, shot_id);
        let arr = io::read_npz_dataset(&path, PARTIAL_GRADIENT)?;
        let shape = arr.shape().to_vec();
        let values = arr
            .into_dimensionality::<Ix1>()
            .map_err(|_| FwiError::ShapeMismatch {
                expected: vec![0],
                got: shape,
            })?;
        ensure_finite(values.iter(), shot_id, Stage::Accumulation)?;
        Ok(PartialGradient::new(shot_id, values))
    }

    /// The shot this contribution belongs to.
    pub fn shot_id(&self) -> &str {
        &self.shot_id
    }

    /// Gradient values.
    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    /// Number of spatial samples.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the gradient covers no spatial sample.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The stacked gradient over every shot.
#[derive(Debug, Clone, PartialEq)]
pub struct FullGradient {
    /// One value per spatial sample.
    pub values: Array1<f64>,
    /// Coordinates of the spatial samples, when known (samples × 3).
    pub positions: Option<Array2<f64>>,
    /// Shots that contributed, in summation order.
    pub shots: Vec<String>,
}

/// Sums partial gradients into the full gradient.
///
/// The spatial axis is split into chunks handed out to worker threads
/// through a lock-free queue. Within a chunk, shots are always added in
/// ascending shot-id order, so the result does not depend on the order the
/// partial gradients are supplied in, nor on the thread count.
pub struct GradientAccumulator {
    num_threads: Option<usize>,
    chunk_size: usize,
    weights: HashMap<String, f64>,
}

impl Default for GradientAccumulator {
    fn default() -> Self {
        GradientAccumulator::new()
    }
}

impl GradientAccumulator {
    /// Accumulator with unit weights and one thread per available core.
    pub fn new() -> Self {
        GradientAccumulator {
            num_threads: None,
            chunk_size: 4096,
            weights: HashMap::new(),
        }
    }

    /// Set the number of worker threads (builder method).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.num_threads = Some(threads.max(1));
        self
    }

    /// Set the number of spatial samples per work item (builder method).
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Weight the contribution of `shot_id` (builder method). Shots without a
    /// weight count once.
    pub fn with_weight(mut self, shot_id: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(shot_id.into(), weight);
        self
    }

    fn get_num_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    fn weight(&self, shot_id: &str) -> f64 {
        self.weights.get(shot_id).copied().unwrap_or(1.0)
    }

    /// Sum `partials`, each scaled by its shot weight.
    ///
    /// # Errors
    /// Fails if `partials` is empty, if two partials share a shot id, if their
    /// lengths differ, or if a weight is not finite.
    pub fn accumulate(&self, partials: &[PartialGradient]) -> Result<Array1<f64>> {
        let first = partials.first().ok_or_else(|| {
            FwiError::InvalidConfig("no partial gradient to accumulate".to_string())
        })?;
        let len = first.len();

        let mut order: Vec<&PartialGradient> = partials.iter().collect();
        order.sort_by(|a, b| a.shot_id.cmp(&b.shot_id));
        for pair in order.windows(2) {
            if pair[0].shot_id == pair[1].shot_id {
                return Err(FwiError::InvalidConfig(format!(
                    "partial gradient of shot {} supplied twice",
                    pair[0].shot_id
                )));
            }
        }
        for p in &order {
            if p.len() != len {
                return Err(FwiError::SpatialSizeMismatch {
                    expected: len,
                    got: p.len(),
                }
                .in_shot(&p.shot_id, Stage::Accumulation));
            }
            let w = self.weight(&p.shot_id);
            if !w.is_finite() {
                return Err(FwiError::InvalidConfig(format!(
                    "weight of shot {} is not finite: {}",
                    p.shot_id, w
                )));
            }
        }
        let weighted: Vec<(f64, &[f64])> = order
            .iter()
            .map(|p| {
                p.values
                    .as_slice()
                    .map(|values| (self.weight(&p.shot_id), values))
                    .ok_or_else(|| {
                        FwiError::Other(format!(
                            "partial gradient of shot {} is not contiguous",
                            p.shot_id
                        ))
                    })
            })
            .collect::<Result<_>>()?;

        let num_chunks = len.div_ceil(self.chunk_size);
        let work = SegQueue::new();
        for chunk in 0..num_chunks {
            work.push(chunk);
        }
        let done: SegQueue<(usize, Vec<f64>)> = SegQueue::new();

        let num_threads = self.get_num_threads().min(num_chunks.max(1));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| FwiError::Other(e.to_string()))?;

        let chunk_size = self.chunk_size;
        pool.scope(|s| {
            for _ in 0..num_threads {
                s.spawn(|_| {
                    while let Some(chunk) = work.pop() {
                        let start = chunk * chunk_size;
                        let end = (start + chunk_size).min(len);
                        let mut sum = vec![0.0; end - start];
                        for &(w, values) in &weighted {
                            for (acc, &v) in sum.iter_mut().zip(&values[start..end]) {
                                *acc += w * v;
                            }
                        }
                        done.push((chunk, sum));
                    }
                });
            }
        });

        let mut total = Array1::zeros(len);
        while let Some((chunk, sum)) = done.pop() {
            let start = chunk * chunk_size;
            for (dst, v) in total.iter_mut().skip(start).zip(sum) {
                *dst = v;
            }
        }
        Ok(total)
    }

    /// Load the partial gradients of `shot_ids` from `dir`, sum them, and
    /// delete the partial gradient files once folded in.
    pub fn compute_full_gradient(&self, dir: &Path, shot_ids: &[String]) -> Result<FullGradient> {
        let partials = shot_ids
            .iter()
            .map(|id| PartialGradient::load(dir, id).map_err(|e| e.in_shot(id, Stage::Accumulation)))
            .collect::<Result<Vec<_>>>()?;
        let values = self.accumulate(&partials)?;

        let positions = match shot_ids.first() {
            Some(id) => {
                let path = partial_gradient_path(dir, id);
                let arr = io::read_npz_dataset(&path, REFERENCE_POSITION)?;
                arr.into_dimensionality::<Ix2>().ok()
            }
            None => None,
        };

        for id in shot_ids {
            io::remove_file(&partial_gradient_path(dir, id))?;
        }

        let mut shots = shot_ids.to_vec();
        shots.sort();
        info!(
            "full gradient stacked from {} shot(s), {} samples",
            shots.len(),
            values.len()
        );
        Ok(FullGradient {
            values,
            positions,
            shots,
        })
    }
}
