//! Tensor store for latents and masks passed between pipeline stages.
//!
//! Two backends: an in-memory store with LRU eviction, and a directory of
//! binary files. Tensor names are derived from content so saving the same
//! tensor twice yields the same handle.
//!
//! File format (little-endian):
//! - ndims: u64
//! - dims: ndims * u64
//! - data: f32 * product(dims)

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array4, Ix4};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{DenoiseError, ErrorCode, Result};

/// Maximum number of tensors kept by [`InMemoryTensorStore::new`].
const DEFAULT_MAX_ENTRIES: usize = 64;

/// Extension of tensor files in a [`FileTensorStore`].
const TENSOR_FILE_EXTENSION: &str = "bin";

/// Length of a tensor name: 8 hash bytes in hex.
const TENSOR_NAME_LEN: usize = 16;

/// `ndims` plus four dims, all u64.
const HEADER_BYTES: u64 = 5 * 8;

const F32_BYTES: usize = 4;

/// Load-by-handle / save-by-value tensor persistence.
pub trait TensorStore {
    fn load(&mut self, name: &str) -> Result<Array4<f32>>;
    fn save(&mut self, tensor: &Array4<f32>) -> Result<String>;
}

/// Computes the content-derived name of a tensor.
///
/// First 16 hex characters of SHA-256 over the shape and the little-endian
/// f32 data in logical order.
pub fn compute_tensor_name(tensor: &Array4<f32>) -> String {
    let mut hasher = Sha256::new();
    for &d in tensor.shape() {
        hasher.update((d as u64).to_le_bytes());
    }
    for v in tensor.iter() {
        hasher.update(v.to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..TENSOR_NAME_LEN / 2])
}

/// In-memory tensor store with LRU eviction.
pub struct InMemoryTensorStore {
    tensors: HashMap<String, CacheEntry>,
    max_entries: usize,
}

struct CacheEntry {
    tensor: Array4<f32>,
    last_accessed: Instant,
}

impl InMemoryTensorStore {
    /// Creates a store with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Creates a store holding at most `max_entries` tensors.
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            tensors: HashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Returns true if a tensor is stored under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    /// Returns the number of stored tensors.
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Returns true if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Evicts the least recently used tensor, returning its name.
    pub fn evict_lru(&mut self) -> Option<String> {
        let oldest = self
            .tensors
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(k, _)| k.clone())?;
        self.tensors.remove(&oldest);
        Some(oldest)
    }
}

impl Default for InMemoryTensorStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorStore for InMemoryTensorStore {
    fn load(&mut self, name: &str) -> Result<Array4<f32>> {
        let entry = self
            .tensors
            .get_mut(name)
            .ok_or_else(|| DenoiseError::tensor_not_found(name))?;
        entry.last_accessed = Instant::now();
        Ok(entry.tensor.clone())
    }

    fn save(&mut self, tensor: &Array4<f32>) -> Result<String> {
        let name = compute_tensor_name(tensor);
        if self.tensors.len() >= self.max_entries && !self.tensors.contains_key(&name) {
            if let Some(evicted) = self.evict_lru() {
                debug!(tensor = %evicted, "evicted tensor");
            }
        }
        self.tensors.insert(
            name.clone(),
            CacheEntry {
                tensor: tensor.clone(),
                last_accessed: Instant::now(),
            },
        );
        Ok(name)
    }
}

/// Directory-backed tensor store.
#[derive(Debug, Clone)]
pub struct FileTensorStore {
    root: PathBuf,
}

impl FileTensorStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            DenoiseError::tensor_io(format!("Cannot create tensor directory {}", root.display()), e)
        })?;
        Ok(Self { root })
    }

    /// Returns the store's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file path used for `name`.
    ///
    /// Only names produced by [`compute_tensor_name`] are accepted, so a
    /// handle can never point outside the store.
    pub fn path_for(&self, name: &str) -> Result<PathBuf> {
        let well_formed =
            name.len() == TENSOR_NAME_LEN && name.bytes().all(|b| b.is_ascii_hexdigit());
        if !well_formed {
            return Err(DenoiseError::tensor_not_found(name));
        }
        Ok(self.root.join(format!("{}.{}", name, TENSOR_FILE_EXTENSION)))
    }
}

impl TensorStore for FileTensorStore {
    fn load(&mut self, name: &str) -> Result<Array4<f32>> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Err(DenoiseError::tensor_not_found(name));
        }
        read_f32_tensor(&path)
    }

    fn save(&mut self, tensor: &Array4<f32>) -> Result<String> {
        let name = compute_tensor_name(tensor);
        let path = self.path_for(&name)?;
        write_f32_tensor(&path, tensor)?;
        debug!(tensor = %name, path = %path.display(), "saved tensor");
        Ok(name)
    }
}

/// Reads a 4D f32 tensor written by [`write_f32_tensor`].
pub fn read_f32_tensor(path: &Path) -> Result<Array4<f32>> {
    let io_err = |e| DenoiseError::tensor_io(format!("Cannot read {}", path.display()), e);
    let file = File::open(path).map_err(io_err)?;
    let file_len = file.metadata().map_err(io_err)?.len();
    let mut reader = BufReader::new(file);

    let mut u64_buf = [0u8; 8];
    reader.read_exact(&mut u64_buf).map_err(io_err)?;
    let ndims = u64::from_le_bytes(u64_buf) as usize;
    if ndims != 4 {
        return Err(DenoiseError::new(
            ErrorCode::TensorIo,
            format!("{} holds a {}D tensor, expected 4D", path.display(), ndims),
        ));
    }

    let mut dims = [0usize; 4];
    for d in dims.iter_mut() {
        reader.read_exact(&mut u64_buf).map_err(io_err)?;
        *d = u64::from_le_bytes(u64_buf) as usize;
    }

    let data_len = dims
        .iter()
        .try_fold(F32_BYTES, |acc, &d| acc.checked_mul(d))
        .filter(|&len| len as u64 == file_len.saturating_sub(HEADER_BYTES))
        .ok_or_else(|| {
            DenoiseError::new(
                ErrorCode::TensorIo,
                format!(
                    "{} header {:?} does not match its {} byte size",
                    path.display(),
                    dims,
                    file_len
                ),
            )
        })?;
    let mut data_bytes = vec![0u8; data_len];
    reader.read_exact(&mut data_bytes).map_err(io_err)?;

    let data: Vec<f32> = data_bytes
        .chunks_exact(F32_BYTES)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(Array4::from_shape_vec(Ix4(dims[0], dims[1], dims[2], dims[3]), data)?)
}

/// Writes a 4D f32 tensor with a u64 dims header.
pub fn write_f32_tensor(path: &Path, tensor: &Array4<f32>) -> Result<()> {
    let io_err = |e| DenoiseError::tensor_io(format!("Cannot write {}", path.display()), e);
    let mut writer = BufWriter::new(File::create(path).map_err(io_err)?);

    writer
        .write_all(&(tensor.ndim() as u64).to_le_bytes())
        .map_err(io_err)?;
    for &d in tensor.shape() {
        writer.write_all(&(d as u64).to_le_bytes()).map_err(io_err)?;
    }
    for v in tensor.iter() {
        writer.write_all(&v.to_le_bytes()).map_err(io_err)?;
    }
    writer.flush().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn ramp(offset: f32) -> Array4<f32> {
        Array4::from_shape_fn((1, 2, 3, 4), |(_, c, h, w)| {
            offset + (c * 12 + h * 4 + w) as f32 * 0.25
        })
    }

    #[test]
    fn tensor_name_is_content_derived() {
        assert_eq!(compute_tensor_name(&ramp(0.0)), compute_tensor_name(&ramp(0.0)));
        assert_ne!(compute_tensor_name(&ramp(0.0)), compute_tensor_name(&ramp(1.0)));
        assert_eq!(compute_tensor_name(&ramp(0.0)).len(), 16);
    }

    #[test]
    fn tensor_name_depends_on_shape() {
        let a = Array4::<f32>::zeros((1, 1, 2, 4));
        let b = Array4::<f32>::zeros((1, 1, 4, 2));
        assert_ne!(compute_tensor_name(&a), compute_tensor_name(&b));
    }

    #[test]
    fn memory_store_save_and_load() {
        let mut store = InMemoryTensorStore::new();
        let name = store.save(&ramp(0.5)).unwrap();
        assert!(store.contains(&name));
        assert_eq!(store.load(&name).unwrap(), ramp(0.5));
    }

    #[test]
    fn memory_store_missing_tensor() {
        let mut store = InMemoryTensorStore::new();
        let err = store.load("missing").unwrap_err();
        assert_eq!(err.code, ErrorCode::TensorNotFound);
    }

    #[test]
    fn memory_store_evicts_lru() {
        let mut store = InMemoryTensorStore::with_capacity(2);

        let first = store.save(&ramp(1.0)).unwrap();
        thread::sleep(Duration::from_millis(10));
        let second = store.save(&ramp(2.0)).unwrap();

        store.load(&first).unwrap();
        thread::sleep(Duration::from_millis(10));

        let third = store.save(&ramp(3.0)).unwrap();

        assert!(store.contains(&first));
        assert!(!store.contains(&second));
        assert!(store.contains(&third));
    }

    #[test]
    fn file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTensorStore::open(dir.path().join("tensors")).unwrap();

        let tensor = ramp(-1.5);
        let name = store.save(&tensor).unwrap();
        let path = store.path_for(&name).unwrap();
        assert!(path.exists());
        assert!(path.starts_with(store.root()));
        assert_eq!(store.load(&name).unwrap(), tensor);
    }

    #[test]
    fn file_store_missing_tensor() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTensorStore::open(dir.path()).unwrap();
        assert_eq!(
            store.load("0123456789abcdef").unwrap_err().code,
            ErrorCode::TensorNotFound
        );
    }

    #[test]
    fn truncated_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, 4u64.to_le_bytes()).unwrap();
        assert_eq!(read_f32_tensor(&path).unwrap_err().code, ErrorCode::TensorIo);
    }

    fn write_header(path: &Path, dims: [u64; 4], data_bytes: usize) {
        let mut bytes = 4u64.to_le_bytes().to_vec();
        for d in dims {
            bytes.extend_from_slice(&d.to_le_bytes());
        }
        bytes.resize(bytes.len() + data_bytes, 0);
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn overflowing_header_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.bin");
        write_header(&path, [1 << 40, 1 << 40, 1, 1], 16);
        assert_eq!(read_f32_tensor(&path).unwrap_err().code, ErrorCode::TensorIo);
    }

    #[test]
    fn header_larger_than_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        write_header(&path, [1, 4, 1024, 1024], 64);
        assert_eq!(read_f32_tensor(&path).unwrap_err().code, ErrorCode::TensorIo);

        let exact = dir.path().join("exact.bin");
        write_header(&exact, [1, 2, 2, 4], 16 * 4);
        assert_eq!(read_f32_tensor(&exact).unwrap().shape(), &[1, 2, 2, 4]);
    }

    #[test]
    fn file_store_rejects_malformed_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileTensorStore::open(dir.path().join("tensors")).unwrap();
        fs::write(dir.path().join("x.bin"), 4u64.to_le_bytes()).unwrap();

        for name in ["../x", "0123456789abcdeg", "abc", "/etc/passwd"] {
            assert!(store.path_for(name).is_err(), "{} accepted", name);
            assert_eq!(store.load(name).unwrap_err().code, ErrorCode::TensorNotFound);
        }
    }
}
