// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

//! Cross-correlation imaging condition between a forward and a backward
//! wavefield record of the same shot.

use std::path::{Path, PathBuf};

use ndarray::{Array1, Array2, ArrayView2, Axis, Ix1, Ix2, Zip};

use crate::error::{ensure_finite, FwiError, Result, Stage};
use crate::gradient::{PartialGradient, PARTIAL_GRADIENT};
use crate::io::{self, Datasets, NpzArchive};
use crate::recorder::{snapshot_name, snapshot_prefix, Direction, REFERENCE_POSITION, TIME};

/// Time-resolved imaging product of a forward and a backward series.
///
/// Both inputs are (snapshots × spatial samples). The backward series was
/// recorded in reverse time, so its snapshot `n - 1 - i` is taken at the same
/// instant as forward snapshot `i`. The result is the backward series with
/// row `n - 1 - i` scaled element-wise by `-forward[i]`.
///
/// # Errors
/// [`FwiError::SampleCountMismatch`] if the snapshot counts differ and
/// [`FwiError::SpatialSizeMismatch`] if the spatial sizes differ. Nothing is
/// truncated.
pub fn imaging_condition(
    forward: ArrayView2<'_, f64>,
    backward: ArrayView2<'_, f64>,
) -> Result<Array2<f64>> {
    let n = forward.nrows();
    if backward.nrows() != n {
        return Err(FwiError::SampleCountMismatch {
            forward: n,
            backward: backward.nrows(),
        });
    }
    if backward.ncols() != forward.ncols() {
        return Err(FwiError::SpatialSizeMismatch {
            expected: forward.ncols(),
            got: backward.ncols(),
        });
    }

    let mut gradient = backward.to_owned();
    for i in 0..n {
        let reversed = n - 1 - i;
        Zip::from(gradient.row_mut(reversed))
            .and(forward.row(i))
            .for_each(|g, &f| *g *= -f);
    }
    Ok(gradient)
}

/// Collapse a time-resolved imaging product into one value per spatial sample.
pub fn stack_over_time(series: ArrayView2<'_, f64>) -> Array1<f64> {
    series.sum_axis(Axis(0))
}

/// Path of the partial gradient of `shot_id` under `dir`.
pub fn partial_gradient_path(dir: &Path, shot_id: &str) -> PathBuf {
    io::keyed_path(dir, PARTIAL_GRADIENT, shot_id, "npz")
}

fn read_2d(record: &mut NpzArchive, name: &str) -> Result<Array2<f64>> {
    let arr = record.read(name)?;
    let shape = arr.shape().to_vec();
    arr.into_dimensionality::<Ix2>()
        .map_err(|_| FwiError::ShapeMismatch {
            expected: vec![0, 0],
            got: shape,
        })
}

fn read_1d(record: &mut NpzArchive, name: &str) -> Result<Array1<f64>> {
    let arr = record.read(name)?;
    let shape = arr.shape().to_vec();
    arr.into_dimensionality::<Ix1>()
        .map_err(|_| FwiError::ShapeMismatch {
            expected: vec![0],
            got: shape,
        })
}

/// Snapshot `index` of `field`, checked against the spatial size and for
/// non-finite values. Offending indices are reported flat over the series.
fn read_snapshot(
    record: &mut NpzArchive,
    field: &str,
    index: usize,
    spatial_len: usize,
    shot_id: &str,
) -> Result<Array1<f64>> {
    let snapshot = read_1d(record, &snapshot_name(field, index))?;
    if snapshot.len() != spatial_len {
        return Err(FwiError::SpatialSizeMismatch {
            expected: spatial_len,
            got: snapshot.len(),
        });
    }
    if let Some((i, &value)) = snapshot.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(FwiError::NonFinite {
            shot_id: shot_id.to_string(),
            stage: Stage::Imaging,
            index: index * spatial_len + i,
            value,
        });
    }
    Ok(snapshot)
}

/// Build the partial gradient of one shot from its two wavefield records.
///
/// Only `ReferencePosition` and `Time` of the forward record and the `field`
/// snapshots of both records are read; every other dataset is left behind
/// with the records. The result equals
/// `stack_over_time(imaging_condition(forward, backward))`, computed one
/// snapshot pair at a time so that neither series is held in memory.
/// `partialGradient<id>.npz` (`ReferencePosition`, `Time`, `partialGradient`)
/// is written, then both records are deleted.
///
/// Must run on the coordinator only.
pub fn assemble_partial_gradient(
    dir: &Path,
    shot_id: &str,
    field: &str,
) -> Result<PartialGradient> {
    let forward_path = Direction::Forward.record_path(dir, shot_id);
    let backward_path = Direction::Backward.record_path(dir, shot_id);

    let mut forward = NpzArchive::open(&forward_path)?;
    let mut backward = NpzArchive::open(&backward_path)?;

    let positions = read_2d(&mut forward, REFERENCE_POSITION)?;
    let times = read_1d(&mut forward, TIME)?;

    let prefix = snapshot_prefix(field);
    let n = forward.count_prefixed(&prefix);
    if n == 0 {
        return Err(forward.missing(field));
    }
    let nb = backward.count_prefixed(&prefix);
    if nb == 0 {
        return Err(backward.missing(field));
    }
    if nb != n {
        return Err(FwiError::SampleCountMismatch {
            forward: n,
            backward: nb,
        });
    }
    if times.len() != n {
        // the Time axis must have one entry per forward snapshot
        return Err(FwiError::ShapeMismatch {
            expected: vec![n],
            got: vec![times.len()],
        });
    }

    let spatial_len = positions.nrows();
    let mut values = Array1::<f64>::zeros(spatial_len);
    for k in 0..n {
        let f = read_snapshot(&mut forward, field, n - 1 - k, spatial_len, shot_id)?;
        let b = read_snapshot(&mut backward, field, k, spatial_len, shot_id)?;
        Zip::from(&mut values)
            .and(&b)
            .and(&f)
            .for_each(|g, &b, &f| *g += b * -f);
    }
    ensure_finite(values.iter(), shot_id, Stage::Imaging)?;

    let path = partial_gradient_path(dir, shot_id);
    let datasets: Datasets = vec![
        (REFERENCE_POSITION.to_string(), positions.into_dyn()),
        (TIME.to_string(), times.into_dyn()),
        (PARTIAL_GRADIENT.to_string(), values.clone().into_dyn()),
    ];
    io::write_npz(&path, &datasets)?;

    drop(forward);
    drop(backward);
    io::remove_file(&forward_path)?;
    io::remove_file(&backward_path)?;

    Ok(PartialGradient::new(shot_id, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr2, Array};

    fn write_record_with_times(path: &Path, data: Array2<f64>, times: Array1<f64>, extra: bool) {
        let ns = data.ncols();
        let positions = Array2::from_shape_fn((ns, 3), |(i, a)| (i * 3 + a) as f64);
        let mut datasets: Datasets = vec![
            (REFERENCE_POSITION.to_string(), positions.clone().into_dyn()),
            (TIME.to_string(), times.clone().into_dyn()),
        ];
        for (k, row) in data.outer_iter().enumerate() {
            datasets.push((snapshot_name("pressure_np1", k), row.to_owned().into_dyn()));
        }
        if extra {
            datasets.push((
                "pressure_np1ReferencePosition".to_string(),
                positions.into_dyn(),
            ));
            datasets.push(("pressure_np1Time".to_string(), times.into_dyn()));
        }
        io::write_npz(path, &datasets).unwrap();
    }

    fn write_record(path: &Path, data: Array2<f64>, extra: bool) {
        let n = data.nrows();
        let times = Array::linspace(0.15, 0.15 * n as f64, n);
        write_record_with_times(path, data, times, extra);
    }

    #[test]
    fn reverse_index_mapping() {
        let forward = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        let backward = arr2(&[[10.0, 20.0], [30.0, 40.0], [50.0, 60.0]]);
        let g = imaging_condition(forward.view(), backward.view()).unwrap();
        // row k pairs backward[k] with forward[n-1-k]
        assert_eq!(
            g,
            arr2(&[[-50.0, -120.0], [-90.0, -160.0], [-50.0, -120.0]])
        );
        assert_eq!(stack_over_time(g.view()).to_vec(), vec![-190.0, -400.0]);
    }

    #[test]
    fn single_snapshot() {
        let forward = arr2(&[[2.0, -1.0]]);
        let backward = arr2(&[[3.0, 3.0]]);
        let g = imaging_condition(forward.view(), backward.view()).unwrap();
        assert_eq!(g, arr2(&[[-6.0, 3.0]]));
    }

    #[test]
    fn mismatched_counts_are_alignment_errors() {
        let a = Array2::<f64>::zeros((6, 5000));
        let b = Array2::<f64>::zeros((5, 5000));
        let err = imaging_condition(a.view(), b.view()).unwrap_err();
        assert!(matches!(
            err,
            FwiError::SampleCountMismatch {
                forward: 6,
                backward: 5
            }
        ));

        let c = Array2::<f64>::zeros((6, 4998));
        let err = imaging_condition(a.view(), c.view()).unwrap_err();
        assert!(matches!(
            err,
            FwiError::SpatialSizeMismatch {
                expected: 5000,
                got: 4998
            }
        ));
        assert!(err.is_alignment());
    }

    #[test]
    fn length_independent_of_snapshot_count() {
        for n in [1, 2, 6, 17] {
            let f = Array2::<f64>::ones((n, 5000));
            let b = Array2::<f64>::ones((n, 5000));
            let g = imaging_condition(f.view(), b.view()).unwrap();
            assert_eq!(stack_over_time(g.view()).len(), 5000);
        }
    }

    #[test]
    fn assemble_writes_gradient_and_removes_records() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "001");
        let bwd = Direction::Backward.record_path(dir.path(), "001");
        write_record(&fwd, arr2(&[[1.0, 2.0, 0.5], [3.0, 4.0, 0.0]]), true);
        write_record(&bwd, arr2(&[[1.0, 1.0, 1.0], [2.0, 2.0, 2.0]]), true);

        let pg = assemble_partial_gradient(dir.path(), "001", "pressure_np1").unwrap();
        // row 0: b[0] * -f[1] = [-3, -4, 0]; row 1: b[1] * -f[0] = [-2, -4, -1]
        assert_eq!(pg.values().to_vec(), vec![-5.0, -8.0, -1.0]);
        assert_eq!(pg.shot_id(), "001");

        assert!(!fwd.exists());
        assert!(!bwd.exists());
        let path = partial_gradient_path(dir.path(), "001");
        assert_eq!(
            io::npz_names(&path).unwrap(),
            vec![REFERENCE_POSITION, TIME, PARTIAL_GRADIENT]
        );
        assert_eq!(io::read_npz_dataset(&path, TIME).unwrap().len(), 2);
    }

    #[test]
    fn assemble_matches_time_resolved_product() {
        let dir = tempfile::tempdir().unwrap();
        let forward = Array2::from_shape_fn((5, 7), |(k, i)| ((k * 7 + i) as f64 * 0.37).sin());
        let backward = Array2::from_shape_fn((5, 7), |(k, i)| ((k * 7 + i) as f64 * 0.11).cos());
        write_record(&Direction::Forward.record_path(dir.path(), "005"), forward.clone(), true);
        write_record(&Direction::Backward.record_path(dir.path(), "005"), backward.clone(), true);

        let pg = assemble_partial_gradient(dir.path(), "005", "pressure_np1").unwrap();
        let expected =
            stack_over_time(imaging_condition(forward.view(), backward.view()).unwrap().view());
        for (got, want) in pg.values().iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn assemble_rejects_snapshot_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "006");
        let bwd = Direction::Backward.record_path(dir.path(), "006");
        write_record(&fwd, Array2::ones((6, 4)), false);
        write_record(&bwd, Array2::ones((5, 4)), false);

        let err = assemble_partial_gradient(dir.path(), "006", "pressure_np1").unwrap_err();
        assert!(matches!(
            err,
            FwiError::SampleCountMismatch {
                forward: 6,
                backward: 5
            }
        ));
        assert!(fwd.exists());
    }

    #[test]
    fn assemble_rejects_time_axis_of_wrong_length() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "007");
        let bwd = Direction::Backward.record_path(dir.path(), "007");
        write_record_with_times(&fwd, Array2::ones((3, 4)), Array::linspace(0.1, 0.2, 2), false);
        write_record(&bwd, Array2::ones((3, 4)), false);

        let err = assemble_partial_gradient(dir.path(), "007", "pressure_np1").unwrap_err();
        match err {
            FwiError::ShapeMismatch { expected, got } => {
                assert_eq!(expected, vec![3]);
                assert_eq!(got, vec![2]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn assemble_rejects_spatial_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "002");
        let bwd = Direction::Backward.record_path(dir.path(), "002");
        write_record(&fwd, Array2::ones((6, 5000)), false);
        write_record(&bwd, Array2::ones((6, 4998)), false);

        let err = assemble_partial_gradient(dir.path(), "002", "pressure_np1").unwrap_err();
        assert!(err.is_alignment());
        assert!(!partial_gradient_path(dir.path(), "002").exists());
    }

    #[test]
    fn assemble_reports_missing_field() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "003");
        let bwd = Direction::Backward.record_path(dir.path(), "003");
        write_record(&fwd, Array2::ones((2, 4)), false);
        write_record(&bwd, Array2::ones((2, 4)), false);

        let err = assemble_partial_gradient(dir.path(), "003", "pressure_n").unwrap_err();
        assert!(matches!(err, FwiError::MissingField { .. }));
    }

    #[test]
    fn assemble_rejects_non_finite() {
        let dir = tempfile::tempdir().unwrap();
        let fwd = Direction::Forward.record_path(dir.path(), "004");
        let bwd = Direction::Backward.record_path(dir.path(), "004");
        write_record(&fwd, arr2(&[[1.0, f64::NAN]]), false);
        write_record(&bwd, arr2(&[[1.0, 1.0]]), false);

        let err = assemble_partial_gradient(dir.path(), "004", "pressure_np1").unwrap_err();
        assert!(matches!(
            err,
            FwiError::NonFinite { stage: Stage::Imaging, index: 1, .. }
        ));
    }
}
