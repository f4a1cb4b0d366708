//! Binary array codec
//!
//! Serializes multidimensional typed arrays to sidecar files. Each
//! array cell stores a JSON descriptor (element type + byte order,
//! shape, major order, backing file name); the raw bytes live in a
//! file next to the store, written exactly once and round-tripped
//! byte-for-byte. No endianness conversion is ever performed: a
//! descriptor whose byte order differs from the host is rejected on
//! read.

use crate::types::{DataRow, DataValue};
use crate::{DatabankError, Result, DATA_FILE_SUFFIX};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Element type of an ndarray.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Uint8,
    Uint16,
    Uint32,
    Int8,
    Int16,
    Int32,
    Float32,
    Float64,
}

impl Dtype {
    /// Parse a dtype name. Unknown names resolve to `Uint8`, matching
    /// the descriptor's fallback element code.
    pub fn parse(name: &str) -> Dtype {
        match name {
            "uint8" => Dtype::Uint8,
            "uint16" => Dtype::Uint16,
            "uint32" => Dtype::Uint32,
            "int8" => Dtype::Int8,
            "int16" => Dtype::Int16,
            "int32" => Dtype::Int32,
            "float32" | "float" => Dtype::Float32,
            "float64" | "double" => Dtype::Float64,
            _ => Dtype::Uint8,
        }
    }

    /// The descriptor element code.
    pub fn code(self) -> &'static str {
        match self {
            Dtype::Uint8 => "B",
            Dtype::Uint16 => "H",
            Dtype::Uint32 => "u32",
            Dtype::Int8 => "b",
            Dtype::Int16 => "h",
            Dtype::Int32 => "i4",
            Dtype::Float32 => "f4",
            Dtype::Float64 => "f8",
        }
    }

    pub fn from_code(code: &str) -> Option<Dtype> {
        match code {
            "B" => Some(Dtype::Uint8),
            "H" => Some(Dtype::Uint16),
            "u32" => Some(Dtype::Uint32),
            "b" => Some(Dtype::Int8),
            "h" => Some(Dtype::Int16),
            "i4" => Some(Dtype::Int32),
            "f4" => Some(Dtype::Float32),
            "f8" => Some(Dtype::Float64),
            _ => None,
        }
    }

    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            Dtype::Uint8 | Dtype::Int8 => 1,
            Dtype::Uint16 | Dtype::Int16 => 2,
            Dtype::Uint32 | Dtype::Int32 | Dtype::Float32 => 4,
            Dtype::Float64 => 8,
        }
    }
}

/// Byte-order character of the host: `<` little-endian, `>` big-endian.
pub fn host_order_char() -> char {
    if cfg!(target_endian = "little") {
        '<'
    } else {
        '>'
    }
}

/// Persisted array descriptor, stored as JSON text in the owning cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdarrayMeta {
    /// Byte-order char followed by the element code, e.g. `<f8`.
    #[serde(rename = "t")]
    pub type_tag: String,
    /// Array shape.
    #[serde(rename = "s")]
    pub shape: Vec<usize>,
    /// Value kind; always `"f"` (file-backed).
    #[serde(rename = "v")]
    pub value_kind: String,
    /// True for row-major data, false for column-major.
    #[serde(rename = "c")]
    pub row_major: bool,
    /// Backing file, usually relative to the dataset's blob folder.
    #[serde(rename = "p")]
    pub file_name: String,
}

/// An in-memory typed array: raw bytes plus interpretation.
#[derive(Debug, Clone, PartialEq)]
pub struct NdarrayData {
    pub data: Vec<u8>,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub row_major: bool,
}

impl NdarrayData {
    pub fn new(data: Vec<u8>, dtype: Dtype, shape: Vec<usize>, row_major: bool) -> Self {
        Self {
            data,
            dtype,
            shape,
            row_major,
        }
    }

    /// Byte length implied by shape and element width.
    pub fn expected_len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.width()
    }

    /// Per-dimension element strides for this array's major order.
    pub fn strides(&self) -> Vec<usize> {
        strides(&self.shape, self.row_major)
    }
}

/// Element strides for a shape.
///
/// Row-major: the last dimension is contiguous. Column-major: the first
/// dimension is contiguous.
pub fn strides(shape: &[usize], row_major: bool) -> Vec<usize> {
    let n = shape.len();
    let mut out = vec![1; n];
    if row_major {
        for i in (0..n.saturating_sub(1)).rev() {
            out[i] = out[i + 1] * shape[i + 1];
        }
    } else {
        for i in 1..n {
            out[i] = out[i - 1] * shape[i - 1];
        }
    }
    out
}

/// Generate a blob file name unique within a dataset folder:
/// hex nanosecond timestamp plus a random suffix.
fn make_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let suffix: u32 = rand::thread_rng().gen();
    format!("{nanos:x}{suffix:08x}{DATA_FILE_SUFFIX}")
}

/// Build the descriptor for an array, generating a fresh file name.
pub fn ndarray_meta(array: &NdarrayData) -> NdarrayMeta {
    NdarrayMeta {
        type_tag: format!("{}{}", host_order_char(), array.dtype.code()),
        shape: array.shape.clone(),
        value_kind: "f".to_string(),
        row_major: array.row_major,
        file_name: make_file_name(),
    }
}

fn resolve_path(folder: &Path, file_name: &str) -> PathBuf {
    let path = Path::new(file_name);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        folder.join(file_name)
    }
}

fn write_array(folder: &Path, array: &NdarrayData, meta: &NdarrayMeta) -> Result<()> {
    let path = resolve_path(folder, &meta.file_name);
    // Exclusive create: a name collision must never overwrite data.
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(&array.data)?;
    file.flush()?;

    let written = file.metadata()?.len();
    if written != array.data.len() as u64 {
        return Err(DatabankError::SizeMismatch {
            file: meta.file_name.clone(),
            expected: array.data.len() as u64,
            actual: written,
        });
    }
    Ok(())
}

fn read_array(folder: &Path, meta: &NdarrayMeta) -> Result<NdarrayData> {
    let mut chars = meta.type_tag.chars();
    let order = chars.next().ok_or_else(|| {
        DatabankError::Validation(format!("empty type tag in descriptor {meta:?}"))
    })?;
    if order != host_order_char() {
        return Err(DatabankError::ByteOrderMismatch {
            stored: order,
            host: host_order_char(),
        });
    }
    let code: String = chars.collect();
    let dtype = Dtype::from_code(&code).ok_or_else(|| {
        DatabankError::Validation(format!("unknown element code '{code}' in descriptor"))
    })?;

    let path = resolve_path(folder, &meta.file_name);
    let file_len = std::fs::metadata(&path)?.len();
    let expected = (meta.shape.iter().product::<usize>() * dtype.width()) as u64;
    if file_len != expected {
        return Err(DatabankError::SizeMismatch {
            file: meta.file_name.clone(),
            expected,
            actual: file_len,
        });
    }

    let mut data = Vec::with_capacity(file_len as usize);
    let read = File::open(&path)?.read_to_end(&mut data)?;
    if read as u64 != file_len {
        return Err(DatabankError::SizeMismatch {
            file: meta.file_name.clone(),
            expected: file_len,
            actual: read as u64,
        });
    }

    Ok(NdarrayData {
        data,
        dtype,
        shape: meta.shape.clone(),
        row_major: meta.row_major,
    })
}

/// Extract array values from rows into blob files.
///
/// For each row, each array-typed column holding a raw array is written
/// to a newly created file and the cell is replaced in place by its
/// descriptor. Other cells (nulls, pre-built descriptors) pass through.
///
/// Returns the paths of the files created, so a caller whose follow-up
/// step fails can undo the extraction with [`remove_files`]. A failure
/// part-way through removes the files already written before returning.
pub fn write_many(folder: &Path, rows: &mut [DataRow], columns: &[String]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for row in rows.iter_mut() {
        for column in columns {
            let Some(cell) = row.get_mut(column) else {
                continue;
            };
            if let DataValue::Ndarray(array) = cell {
                let meta = ndarray_meta(array);
                if let Err(e) = write_array(folder, array, &meta) {
                    remove_files(&written);
                    return Err(e);
                }
                written.push(resolve_path(folder, &meta.file_name));
                match serde_json::to_value(&meta) {
                    Ok(descriptor) => *cell = DataValue::Json(descriptor),
                    Err(e) => {
                        remove_files(&written);
                        return Err(e.into());
                    }
                }
            }
        }
    }
    Ok(written)
}

/// Best-effort removal of blob files, used to undo an extraction whose
/// owning operation failed. Removal errors are logged, not propagated.
pub fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("could not remove blob file {}: {e}", path.display());
        }
    }
}

/// Resolve descriptor cells in rows back into raw arrays.
///
/// For each row, each array-typed column holding a descriptor is
/// replaced by the file contents, verified against the descriptor's
/// shape, element width and byte order.
pub fn read_many(folder: &Path, rows: &mut [DataRow], columns: &[String]) -> Result<()> {
    for row in rows.iter_mut() {
        for column in columns {
            let Some(cell) = row.get_mut(column) else {
                continue;
            };
            if let DataValue::Json(descriptor) = cell {
                let meta: NdarrayMeta = serde_json::from_value(descriptor.clone())?;
                let array = read_array(folder, &meta)?;
                *cell = DataValue::Ndarray(array);
            }
        }
    }
    Ok(())
}
