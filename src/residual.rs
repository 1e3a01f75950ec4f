// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use ndarray::{Array2, ArrayView2, Zip};

use crate::error::{ensure_finite, FwiError, Result, Stage};
use crate::stepper::ReceiverTrace;

/// Seismogram sampling grid: `nb_seismo` samples spanning `[0, max_time]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeismoSampling {
    max_time: f64,
    nb_seismo: usize,
}

impl SeismoSampling {
    /// Validated sampling grid.
    ///
    /// # Errors
    /// Returns [`FwiError::InvalidSampling`] unless `max_time` is positive and
    /// finite and `nb_seismo >= 2`.
    pub fn new(max_time: f64, nb_seismo: usize) -> Result<Self> {
        if !max_time.is_finite() || max_time <= 0.0 || nb_seismo < 2 {
            return Err(FwiError::InvalidSampling {
                max_time,
                nb_seismo,
            });
        }
        Ok(SeismoSampling {
            max_time,
            nb_seismo,
        })
    }

    /// Number of seismogram samples.
    pub fn nb_seismo(&self) -> usize {
        self.nb_seismo
    }

    /// Simulated duration covered by the samples.
    pub fn max_time(&self) -> f64 {
        self.max_time
    }

    /// Interval between samples, `max_time / (nb_seismo - 1)`.
    pub fn dt_seismo(&self) -> f64 {
        self.max_time / (self.nb_seismo - 1) as f64
    }

    /// Time of sample `j`.
    pub fn time(&self, j: usize) -> f64 {
        if j + 1 == self.nb_seismo {
            self.max_time
        } else {
            j as f64 * self.dt_seismo()
        }
    }
}

/// Resample a dense (time levels × receivers) trace, row `k` at time `k * dt`,
/// onto the seismogram grid by linear interpolation.
///
/// Times past the last row take the last row's value; nothing is extrapolated.
/// The result always has exactly `nb_seismo` rows.
pub fn resample_linear(
    dense: ArrayView2<'_, f64>,
    dt: f64,
    sampling: &SeismoSampling,
) -> Result<Array2<f64>> {
    if !dt.is_finite() || dt <= 0.0 {
        return Err(FwiError::InvalidTimeStep(dt));
    }
    let rows = dense.nrows();
    if rows == 0 {
        return Err(FwiError::ShapeMismatch {
            expected: vec![1, dense.ncols()],
            got: dense.shape().to_vec(),
        });
    }
    let last = rows - 1;

    let mut out = Array2::zeros((sampling.nb_seismo(), dense.ncols()));
    for (j, mut row) in out.rows_mut().into_iter().enumerate() {
        let x = sampling.time(j) / dt;
        let i0 = (x.floor() as usize).min(last);
        let i1 = (i0 + 1).min(last);
        let frac = if i0 == last {
            0.0
        } else {
            (x - i0 as f64).clamp(0.0, 1.0)
        };
        Zip::from(&mut row)
            .and(dense.row(i0))
            .and(dense.row(i1))
            .for_each(|o, &a, &b| *o = a + frac * (b - a));
    }
    Ok(out)
}

/// Adjoint source of a shot: the resampled synthetic trace minus the observed
/// seismograms (zero when none are given).
///
/// # Errors
/// Non-finite input or output values are reported with the shot id; observed
/// data must be (nb_seismo × receivers).
pub fn build_residual(
    trace: &ReceiverTrace,
    observed: Option<ArrayView2<'_, f64>>,
    sampling: &SeismoSampling,
    shot_id: &str,
) -> Result<Array2<f64>> {
    ensure_finite(trace.samples().iter(), shot_id, Stage::Residual)?;
    let mut residual = resample_linear(trace.samples().view(), trace.dt(), sampling)?;

    if let Some(obs) = observed {
        if obs.dim() != residual.dim() {
            return Err(FwiError::ShapeMismatch {
                expected: residual.shape().to_vec(),
                got: obs.shape().to_vec(),
            });
        }
        residual -= &obs;
    }
    ensure_finite(residual.iter(), shot_id, Stage::Residual)?;
    Ok(residual)
}
