//! Chunked on-disk array store.
//!
//! A store is a directory of fixed-shape datasets. Each dataset is its own
//! subdirectory holding a `meta.json` (shape, chunking, dtype) plus raw
//! little-endian chunk files named by their index along axis 0. All datasets
//! are chunked along axis 0 only; trailing axes are stored whole per chunk.
//!
//! The exporter is the only consumer; it writes row ranges at sample
//! offsets and the training side reads the same layout back.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the store and the exporter built on it.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Element type of a dataset, named the way the training stack expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dtype {
    #[serde(rename = "int16")]
    I16,
    #[serde(rename = "int32")]
    I32,
    #[serde(rename = "float32")]
    F32,
}

/// Fixed-size little-endian element of a dataset.
pub trait Element: Copy + Default {
    const DTYPE: Dtype;
    const SIZE: usize;
    fn write_le(self, out: &mut [u8]);
    fn from_le(bytes: &[u8]) -> Self;
}

impl Element for i16 {
    const DTYPE: Dtype = Dtype::I16;
    const SIZE: usize = 2;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
    fn from_le(bytes: &[u8]) -> Self {
        i16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl Element for i32 {
    const DTYPE: Dtype = Dtype::I32;
    const SIZE: usize = 4;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
    fn from_le(bytes: &[u8]) -> Self {
        i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;
    const SIZE: usize = 4;
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }
    fn from_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetMeta {
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: Dtype,
}

/// One fixed-shape dataset inside a store.
#[derive(Debug)]
pub struct Dataset {
    dir: PathBuf,
    meta: DatasetMeta,
    /// Elements per row (product of the trailing axes).
    row_len: usize,
    /// Rows per chunk file.
    chunk_rows: usize,
}

impl Dataset {
    /// Create a dataset directory with its metadata. The shape is fixed for
    /// the dataset's lifetime; chunking covers axis 0 only.
    pub fn create(
        root: &Path,
        name: &str,
        dtype: Dtype,
        shape: Vec<usize>,
        chunk_rows: usize,
    ) -> Result<Self, ExportError> {
        if shape.is_empty() || shape[0] == 0 || chunk_rows == 0 {
            return Err(ExportError::Schema(format!(
                "dataset {name} needs rows and a nonzero chunk size"
            )));
        }
        let dir = root.join(name);
        fs::create_dir_all(&dir)?;
        let mut chunks = shape.clone();
        chunks[0] = chunk_rows;
        let meta = DatasetMeta {
            shape,
            chunks,
            dtype,
        };
        let file = File::create(dir.join("meta.json"))?;
        serde_json::to_writer_pretty(file, &meta)?;
        Ok(Self::from_meta(dir, meta))
    }

    /// Open an existing dataset and verify its element type.
    pub fn open(root: &Path, name: &str, expected: Dtype) -> Result<Self, ExportError> {
        let dir = root.join(name);
        let file = File::open(dir.join("meta.json"))?;
        let meta: DatasetMeta = serde_json::from_reader(file)?;
        if meta.dtype != expected {
            return Err(ExportError::Schema(format!(
                "dataset {name}: expected {expected:?}, found {:?}",
                meta.dtype
            )));
        }
        Ok(Self::from_meta(dir, meta))
    }

    fn from_meta(dir: PathBuf, meta: DatasetMeta) -> Self {
        let row_len = meta.shape[1..].iter().product::<usize>().max(1);
        let chunk_rows = meta.chunks[0];
        Self {
            dir,
            meta,
            row_len,
            chunk_rows,
        }
    }

    /// Total rows along axis 0.
    pub fn rows(&self) -> usize {
        self.meta.shape[0]
    }

    /// Rows per chunk.
    pub fn chunk_rows(&self) -> usize {
        self.chunk_rows
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    fn chunk_path(&self, chunk_idx: usize) -> PathBuf {
        self.dir.join(chunk_idx.to_string())
    }

    fn chunk_byte_len<T: Element>(&self) -> usize {
        self.chunk_rows * self.row_len * T::SIZE
    }

    fn load_chunk<T: Element>(&self, chunk_idx: usize) -> Result<Vec<u8>, ExportError> {
        let len = self.chunk_byte_len::<T>();
        let path = self.chunk_path(chunk_idx);
        if path.exists() {
            let mut buf = Vec::with_capacity(len);
            File::open(path)?.read_to_end(&mut buf)?;
            buf.resize(len, 0);
            Ok(buf)
        } else {
            Ok(vec![0u8; len])
        }
    }

    /// Write `data` (whole rows) starting at `start_row`, splitting the
    /// write across the affected chunk files.
    pub fn write_rows<T: Element>(&self, start_row: usize, data: &[T]) -> Result<(), ExportError> {
        if T::DTYPE != self.meta.dtype {
            return Err(ExportError::Schema(format!(
                "write of {:?} into {:?} dataset",
                T::DTYPE,
                self.meta.dtype
            )));
        }
        if data.len() % self.row_len != 0 {
            return Err(ExportError::Schema(format!(
                "write of {} elements is not a whole number of rows of {}",
                data.len(),
                self.row_len
            )));
        }
        let rows = data.len() / self.row_len;
        if rows == 0 {
            return Ok(());
        }
        if start_row + rows > self.rows() {
            return Err(ExportError::Schema(format!(
                "write of rows {start_row}..{} beyond dataset of {} rows",
                start_row + rows,
                self.rows()
            )));
        }

        let first_chunk = start_row / self.chunk_rows;
        let last_chunk = (start_row + rows - 1) / self.chunk_rows;
        for chunk_idx in first_chunk..=last_chunk {
            let chunk_start = chunk_idx * self.chunk_rows;
            let lo = start_row.max(chunk_start);
            let hi = (start_row + rows).min(chunk_start + self.chunk_rows);

            let mut buf = self.load_chunk::<T>(chunk_idx)?;
            for row in lo..hi {
                let src = (row - start_row) * self.row_len;
                let mut dst = (row - chunk_start) * self.row_len * T::SIZE;
                for &v in &data[src..src + self.row_len] {
                    v.write_le(&mut buf[dst..dst + T::SIZE]);
                    dst += T::SIZE;
                }
            }
            File::create(self.chunk_path(chunk_idx))?.write_all(&buf)?;
        }
        Ok(())
    }

    /// Read `rows` whole rows starting at `start_row`. Unwritten regions
    /// read back as zeros.
    pub fn read_rows<T: Element>(&self, start_row: usize, rows: usize) -> Result<Vec<T>, ExportError> {
        if T::DTYPE != self.meta.dtype {
            return Err(ExportError::Schema(format!(
                "read of {:?} from {:?} dataset",
                T::DTYPE,
                self.meta.dtype
            )));
        }
        if start_row + rows > self.rows() {
            return Err(ExportError::Schema(format!(
                "read of rows {start_row}..{} beyond dataset of {} rows",
                start_row + rows,
                self.rows()
            )));
        }
        let mut out = vec![T::default(); rows * self.row_len];
        if rows == 0 {
            return Ok(out);
        }

        let first_chunk = start_row / self.chunk_rows;
        let last_chunk = (start_row + rows - 1) / self.chunk_rows;
        for chunk_idx in first_chunk..=last_chunk {
            let chunk_start = chunk_idx * self.chunk_rows;
            let lo = start_row.max(chunk_start);
            let hi = (start_row + rows).min(chunk_start + self.chunk_rows);

            let buf = self.load_chunk::<T>(chunk_idx)?;
            for row in lo..hi {
                let mut src = (row - chunk_start) * self.row_len * T::SIZE;
                let dst = (row - start_row) * self.row_len;
                for slot in &mut out[dst..dst + self.row_len] {
                    *slot = T::from_le(&buf[src..src + T::SIZE]);
                    src += T::SIZE;
                }
            }
        }
        Ok(out)
    }
}

/// Shape parameters of one training store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreDims {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub policy_len: usize,
    pub number_chunks: usize,
    pub chunk_size: usize,
}

impl StoreDims {
    /// Fixed sample capacity of the store.
    pub fn number_samples(&self) -> usize {
        self.number_chunks * self.chunk_size
    }
}

/// The five datasets of one self-play training file.
#[derive(Debug)]
pub struct ChunkStore {
    dims: StoreDims,
    pub(crate) x: Dataset,
    pub(crate) y_value: Dataset,
    pub(crate) y_policy: Dataset,
    pub(crate) y_best_move_q: Dataset,
    pub(crate) start_indices: Dataset,
}

impl ChunkStore {
    /// Create a fresh store with the canonical dataset schema.
    pub fn create(root: &Path, dims: StoreDims) -> Result<Self, ExportError> {
        fs::create_dir_all(root)?;
        let n = dims.number_samples();
        let x = Dataset::create(
            root,
            "x",
            Dtype::I16,
            vec![n, dims.channels, dims.height, dims.width],
            dims.chunk_size,
        )?;
        let y_value = Dataset::create(root, "y_value", Dtype::I16, vec![n], dims.chunk_size)?;
        let y_policy = Dataset::create(
            root,
            "y_policy",
            Dtype::F32,
            vec![n, dims.policy_len],
            dims.chunk_size,
        )?;
        let y_best_move_q =
            Dataset::create(root, "y_best_move_q", Dtype::F32, vec![n], dims.chunk_size)?;
        let start_indices =
            Dataset::create(root, "start_indices", Dtype::I32, vec![n], dims.chunk_size)?;
        Ok(Self {
            dims,
            x,
            y_value,
            y_policy,
            y_best_move_q,
            start_indices,
        })
    }

    /// Open an existing store, deriving its dimensions from the metadata.
    pub fn open(root: &Path) -> Result<Self, ExportError> {
        let x = Dataset::open(root, "x", Dtype::I16)?;
        let y_value = Dataset::open(root, "y_value", Dtype::I16)?;
        let y_policy = Dataset::open(root, "y_policy", Dtype::F32)?;
        let y_best_move_q = Dataset::open(root, "y_best_move_q", Dtype::F32)?;
        let start_indices = Dataset::open(root, "start_indices", Dtype::I32)?;

        let shape = x.shape();
        if shape.len() != 4 {
            return Err(ExportError::Schema(format!(
                "x dataset must have 4 axes, found {}",
                shape.len()
            )));
        }
        let n = shape[0];
        let chunk_size = x.chunk_rows();
        if chunk_size == 0 || n % chunk_size != 0 {
            return Err(ExportError::Schema(format!(
                "sample count {n} is not a multiple of chunk size {chunk_size}"
            )));
        }
        for (name, dataset) in [
            ("y_value", &y_value),
            ("y_policy", &y_policy),
            ("y_best_move_q", &y_best_move_q),
            ("start_indices", &start_indices),
        ] {
            if dataset.rows() != n {
                return Err(ExportError::Schema(format!(
                    "dataset {name} holds {} rows, expected {n}",
                    dataset.rows()
                )));
            }
        }

        let dims = StoreDims {
            channels: shape[1],
            height: shape[2],
            width: shape[3],
            policy_len: y_policy.shape()[1],
            number_chunks: n / chunk_size,
            chunk_size,
        };
        Ok(Self {
            dims,
            x,
            y_value,
            y_policy,
            y_best_move_q,
            start_indices,
        })
    }

    /// Whether a store already exists at `root`.
    pub fn exists(root: &Path) -> bool {
        root.join("x").join("meta.json").exists()
    }

    pub fn dims(&self) -> StoreDims {
        self.dims
    }

    pub fn number_samples(&self) -> usize {
        self.dims.number_samples()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_and_reopen_dataset() {
        let dir = tempdir().unwrap();
        let created =
            Dataset::create(dir.path(), "values", Dtype::F32, vec![8, 3], 2).unwrap();
        assert_eq!(created.rows(), 8);

        let opened = Dataset::open(dir.path(), "values", Dtype::F32).unwrap();
        assert_eq!(opened.rows(), 8);
        assert_eq!(opened.chunk_rows(), 2);
        assert_eq!(opened.shape(), &[8, 3]);
    }

    #[test]
    fn open_with_wrong_dtype_fails() {
        let dir = tempdir().unwrap();
        Dataset::create(dir.path(), "values", Dtype::I16, vec![4], 2).unwrap();
        let err = Dataset::open(dir.path(), "values", Dtype::F32).unwrap_err();
        assert!(matches!(err, ExportError::Schema(_)));
    }

    #[test]
    fn writes_split_across_chunk_files() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::create(dir.path(), "v", Dtype::I16, vec![8], 2).unwrap();

        // Rows 1..5 touch chunks 0, 1 and 2.
        dataset.write_rows(1, &[10i16, 20, 30, 40]).unwrap();

        let all = dataset.read_rows::<i16>(0, 8).unwrap();
        assert_eq!(all, vec![0, 10, 20, 30, 40, 0, 0, 0]);
        assert!(dir.path().join("v").join("0").exists());
        assert!(dir.path().join("v").join("1").exists());
        assert!(dir.path().join("v").join("2").exists());
        assert!(!dir.path().join("v").join("3").exists());
    }

    #[test]
    fn rewrite_overwrites_rows_in_place() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::create(dir.path(), "v", Dtype::F32, vec![4, 2], 2).unwrap();

        dataset.write_rows(0, &[1.0f32, 2.0, 3.0, 4.0]).unwrap();
        dataset.write_rows(1, &[9.0f32, 8.0]).unwrap();

        let all = dataset.read_rows::<f32>(0, 2).unwrap();
        assert_eq!(all, vec![1.0, 2.0, 9.0, 8.0]);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::create(dir.path(), "v", Dtype::I32, vec![2], 2).unwrap();
        let err = dataset.write_rows(1, &[1i32, 2]).unwrap_err();
        assert!(matches!(err, ExportError::Schema(_)));
    }

    #[test]
    fn unwritten_rows_read_as_zeros() {
        let dir = tempdir().unwrap();
        let dataset = Dataset::create(dir.path(), "v", Dtype::I32, vec![6], 3).unwrap();
        let values = dataset.read_rows::<i32>(0, 6).unwrap();
        assert_eq!(values, vec![0; 6]);
    }

    #[test]
    fn store_schema_round_trip() {
        let dir = tempdir().unwrap();
        let dims = StoreDims {
            channels: 3,
            height: 3,
            width: 3,
            policy_len: 9,
            number_chunks: 2,
            chunk_size: 4,
        };
        ChunkStore::create(dir.path(), dims).unwrap();
        assert!(ChunkStore::exists(dir.path()));

        let opened = ChunkStore::open(dir.path()).unwrap();
        assert_eq!(opened.dims(), dims);
        assert_eq!(opened.number_samples(), 8);
    }
}
