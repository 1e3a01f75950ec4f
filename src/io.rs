// Copyright (c) 2026, Chad Hogan
// All rights reserved.
//
// This source code is licensed under the BSD-3-Clause license found in the
// LICENSE file in the root directory of this source tree.

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayView, ArrayViewD, Dimension, IxDyn, ShapeBuilder};
use ndarray_npy::{NpzReader, NpzWriter};

use crate::error::{FwiError, Result};

/// Supported file formats for model input and gradient output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FileFormat {
    /// NumPy .npy format.
    Npy,
    /// MATLAB .mat format (Level 5).
    Mat,
}

/// Infer file format from extension.
pub fn infer_format(path: &Path) -> Result<FileFormat> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("npy") => Ok(FileFormat::Npy),
        Some("mat") => Ok(FileFormat::Mat),
        Some(ext) => Err(FwiError::UnsupportedFileFormat(ext.to_string())),
        None => Err(FwiError::UnsupportedFileFormat(
            "(no extension)".to_string(),
        )),
    }
}

fn storage_error(path: &Path, source: std::io::Error) -> FwiError {
    FwiError::Storage {
        path: path.to_path_buf(),
        source,
    }
}

/// Create `dir` and its parents if absent. Succeeds if it already exists.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| storage_error(dir, e))
}

/// Delete a file permanently.
pub fn remove_file(path: &Path) -> Result<()> {
    std::fs::remove_file(path).map_err(|e| storage_error(path, e))
}

/// Load a row-major f64 array from a .npy file (f32 files are promoted).
pub fn load_npy_field(path: &Path, expected_shape: &[usize]) -> Result<Vec<f64>> {
    let arr: ArrayD<f64> = match ndarray_npy::read_npy(path) {
        Ok(a) => a,
        Err(_) => {
            let arr32: ArrayD<f32> = ndarray_npy::read_npy(path)
                .map_err(|e| FwiError::Npy(format!("{}: {}", path.display(), e)))?;
            arr32.mapv(|v| v as f64)
        }
    };

    let got_shape: Vec<usize> = arr.shape().to_vec();
    if got_shape != expected_shape {
        return Err(FwiError::ShapeMismatch {
            expected: expected_shape.to_vec(),
            got: got_shape,
        });
    }

    // Fortran-ordered files must be relaid before taking the raw buffer.
    Ok(arr.as_standard_layout().to_owned().into_raw_vec())
}

/// Load a numeric variable from a .mat file into row-major order.
///
/// MAT arrays are column-major; the stored shape may be either
/// `expected_shape` or its reverse.
pub fn load_mat_field(
    path: &Path,
    variable_name: &str,
    expected_shape: &[usize],
) -> Result<Vec<f64>> {
    let file = File::open(path).map_err(|e| storage_error(path, e))?;
    let mut reader = BufReader::new(file);
    let mat = matfile::MatFile::parse(&mut reader)
        .map_err(|e| FwiError::Mat(format!("{}: {}", path.display(), e)))?;

    let array = mat.find_by_name(variable_name).ok_or_else(|| {
        let available: Vec<String> = mat.arrays().iter().map(|a| a.name().to_string()).collect();
        FwiError::Mat(format!(
            "variable '{}' not found in {}; available variables: {:?}",
            variable_name,
            path.display(),
            available
        ))
    })?;

    let data: Vec<f64> = match array.data() {
        matfile::NumericData::Double { real, .. } => real.clone(),
        matfile::NumericData::Single { real, .. } => real.iter().map(|&v| v as f64).collect(),
        _ => {
            return Err(FwiError::Mat(format!(
                "variable '{}' is not f64 or f32",
                variable_name
            )))
        }
    };

    let mat_shape: Vec<usize> = array.size().to_vec();
    let reversed: Vec<usize> = expected_shape.iter().rev().cloned().collect();
    let same = mat_shape == expected_shape;
    if !same && mat_shape != reversed {
        return Err(FwiError::ShapeMismatch {
            expected: expected_shape.to_vec(),
            got: mat_shape,
        });
    }

    let arr = ArrayD::from_shape_vec(IxDyn(&mat_shape).f(), data)
        .map_err(|e| FwiError::Other(format!("shape error: {}", e)))?;
    let arr = if same {
        arr
    } else {
        let permutation: Vec<usize> = (0..expected_shape.len()).rev().collect();
        arr.permuted_axes(IxDyn(&permutation))
    };
    Ok(arr.as_standard_layout().to_owned().into_raw_vec())
}

/// Check that every velocity is positive and finite.
pub fn validate_velocity(velocity: &[f64]) -> Result<()> {
    for (index, &value) in velocity.iter().enumerate() {
        if !value.is_finite() || value <= 0.0 {
            return Err(FwiError::InvalidVelocity { index, value });
        }
    }
    Ok(())
}

/// Load a velocity model from .npy or .mat (variable `velocity`).
pub fn load_velocity(path: &Path, expected_shape: &[usize]) -> Result<Vec<f64>> {
    let velocity = match infer_format(path)? {
        FileFormat::Npy => load_npy_field(path, expected_shape)?,
        FileFormat::Mat => load_mat_field(path, "velocity", expected_shape)?,
    };
    validate_velocity(&velocity)?;
    Ok(velocity)
}

/// Save an array to .npy.
pub fn save_npy(array: ArrayViewD<'_, f64>, path: &Path) -> Result<()> {
    ndarray_npy::write_npy(path, &array)
        .map_err(|e| FwiError::Npy(format!("{}: {}", path.display(), e)))
}

/// Save an array as a single variable in a Level 5 .mat file.
pub fn save_mat(array: ArrayViewD<'_, f64>, path: &Path, var_name: &str) -> Result<()> {
    // MATLAB wants column-major data with the dimensions as given.
    let col_major: Vec<f64> = array.t().as_standard_layout().iter().cloned().collect();
    let mut dims: Vec<usize> = array.shape().to_vec();
    if dims.len() < 2 {
        dims.resize(2, 1);
    }
    let file = File::create(path).map_err(|e| storage_error(path, e))?;
    let mut w = BufWriter::new(file);
    write_mat_level5(&mut w, var_name, &dims, &col_major).map_err(|e| storage_error(path, e))
}

// Level 5 element: 8-byte tag (type, byte count) then the payload padded to 8 bytes.
fn mat_element(out: &mut Vec<u8>, data_type: u32, payload: &[u8]) {
    out.extend_from_slice(&data_type.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    let pad = payload.len().div_ceil(8) * 8 - payload.len();
    out.extend(std::iter::repeat(0u8).take(pad));
}

const MI_INT8: u32 = 1;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_DOUBLE: u32 = 9;
const MI_MATRIX: u32 = 14;
const MX_DOUBLE_CLASS: u32 = 6;

fn write_mat_level5<W: Write>(
    w: &mut W,
    var_name: &str,
    dims: &[usize],
    data: &[f64],
) -> std::io::Result<()> {
    let mut header = [b' '; 128];
    let text = b"MATLAB 5.0 MAT-file, created by fwi-gradient";
    header[..text.len()].copy_from_slice(text);
    header[116..124].fill(0);
    header[124..126].copy_from_slice(&0x0100u16.to_le_bytes());
    header[126..128].copy_from_slice(b"IM");
    w.write_all(&header)?;

    let mut body = Vec::new();
    let flags: Vec<u8> = [MX_DOUBLE_CLASS, 0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    mat_element(&mut body, MI_UINT32, &flags);
    let dim_bytes: Vec<u8> = dims.iter().flat_map(|&d| (d as i32).to_le_bytes()).collect();
    mat_element(&mut body, MI_INT32, &dim_bytes);
    mat_element(&mut body, MI_INT8, var_name.as_bytes());
    let real: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
    mat_element(&mut body, MI_DOUBLE, &real);

    w.write_all(&MI_MATRIX.to_le_bytes())?;
    w.write_all(&(body.len() as u32).to_le_bytes())?;
    w.write_all(&body)?;
    w.flush()
}

/// Save an array, inferring the format from the extension.
pub fn save_array(array: ArrayViewD<'_, f64>, path: &Path, var_name: &str) -> Result<()> {
    match infer_format(path)? {
        FileFormat::Npy => save_npy(array, path),
        FileFormat::Mat => save_mat(array, path, var_name),
    }
}

/// Named f64 datasets stored together in one .npz archive.
pub type Datasets = Vec<(String, ArrayD<f64>)>;

/// Write `datasets` to a new .npz archive at `path`, replacing any old file.
pub fn write_npz(path: &Path, datasets: &[(String, ArrayD<f64>)]) -> Result<()> {
    let mut npz = NpzAppender::create(path)?;
    for (name, array) in datasets {
        npz.add(name, array.view())?;
    }
    npz.finish()
}

/// An .npz archive kept open while datasets are appended one at a time.
///
/// The archive is only readable after [`NpzAppender::finish`].
pub struct NpzAppender {
    path: PathBuf,
    npz: NpzWriter<BufWriter<File>>,
}

impl NpzAppender {
    /// Create (or truncate) the archive at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| storage_error(path, e))?;
        Ok(NpzAppender {
            path: path.to_path_buf(),
            npz: NpzWriter::new(BufWriter::new(file)),
        })
    }

    /// Append one dataset.
    pub fn add<D: Dimension>(&mut self, name: &str, array: ArrayView<'_, f64, D>) -> Result<()> {
        self.npz
            .add_array(name, &array)
            .map_err(|e| FwiError::Npy(format!("{}/{}: {}", self.path.display(), name, e)))
    }

    /// Write the archive directory and flush the file.
    pub fn finish(self) -> Result<()> {
        let path = self.path;
        let mut inner = self
            .npz
            .finish()
            .map_err(|e| FwiError::Npy(format!("{}: {}", path.display(), e)))?;
        inner.flush().map_err(|e| storage_error(&path, e))
    }
}

impl fmt::Debug for NpzAppender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpzAppender")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// An .npz archive opened for reading, with its dataset index.
pub struct NpzArchive {
    path: PathBuf,
    npz: NpzReader<File>,
    // (dataset name, archive entry), sorted by name; entries may carry a
    // `.npy` suffix that dataset names do not.
    entries: Vec<(String, String)>,
}

impl NpzArchive {
    /// Open the archive at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| storage_error(path, e))?;
        let mut npz =
            NpzReader::new(file).map_err(|e| FwiError::Npy(format!("{}: {}", path.display(), e)))?;
        let names = npz
            .names()
            .map_err(|e| FwiError::Npy(format!("{}: {}", path.display(), e)))?;
        let mut entries: Vec<(String, String)> = names
            .into_iter()
            .map(|entry| {
                let name = entry.strip_suffix(".npy").unwrap_or(&entry).to_string();
                (name, entry)
            })
            .collect();
        entries.sort();
        Ok(NpzArchive {
            path: path.to_path_buf(),
            npz,
            entries,
        })
    }

    /// The archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dataset names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of datasets whose name starts with `prefix`.
    pub fn count_prefixed(&self, prefix: &str) -> usize {
        self.entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .count()
    }

    /// The error reported when `name` is not in the archive.
    pub fn missing(&self, name: &str) -> FwiError {
        FwiError::MissingField {
            path: self.path.clone(),
            field: name.to_string(),
            available: self.names(),
        }
    }

    /// Read one dataset; a missing name is a [`FwiError::MissingField`].
    pub fn read(&mut self, name: &str) -> Result<ArrayD<f64>> {
        let entry = match self.entries.iter().find(|(n, _)| n == name) {
            Some((_, entry)) => entry.clone(),
            None => return Err(self.missing(name)),
        };
        self.npz
            .by_name(&entry)
            .map_err(|e| FwiError::Npy(format!("{}/{}: {}", self.path.display(), entry, e)))
    }
}

impl fmt::Debug for NpzArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NpzArchive")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

/// Dataset names of an .npz archive, sorted.
pub fn npz_names(path: &Path) -> Result<Vec<String>> {
    Ok(NpzArchive::open(path)?.names())
}

/// Read one dataset; a missing name is a [`FwiError::MissingField`].
pub fn read_npz_dataset(path: &Path, name: &str) -> Result<ArrayD<f64>> {
    NpzArchive::open(path)?.read(name)
}

/// Path of `<dir>/<prefix><id>.<ext>`.
pub fn keyed_path(dir: &Path, prefix: &str, id: &str, ext: &str) -> PathBuf {
    dir.join(format!("{}{}.{}", prefix, id, ext))
}
