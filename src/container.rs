//! Chunked-array container with hyperslab get/put primitives.
//!
//! Variables are n-dimensional arrays in row-major order (slowest axis
//! first). A hyperslab is a `(start, count)` pair per axis.

use crate::error::{Result, VdfError};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::trace;

/// Whether a write participates in a cross-process collective call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WriteMode {
    #[default]
    Independent,
    Collective,
}

/// Shape of a container variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarShape {
    /// Dimension lengths, slowest first
    pub dims: Vec<usize>,
    /// Bytes per element
    pub elem_size: usize,
}

impl VarShape {
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }

    /// Check that `(start, count)` lies inside the variable
    pub fn check_hyperslab(&self, start: &[usize], count: &[usize]) -> Result<()> {
        if start.len() != self.dims.len() || count.len() != self.dims.len() {
            return Err(VdfError::InvalidArgument(format!(
                "hyperslab rank {}/{} does not match variable rank {}",
                start.len(),
                count.len(),
                self.dims.len()
            )));
        }
        for i in 0..self.dims.len() {
            if start[i] + count[i] > self.dims[i] {
                return Err(VdfError::OutOfBounds(format!(
                    "hyperslab start {:?} count {:?} exceeds dims {:?}",
                    start, count, self.dims
                )));
            }
        }
        Ok(())
    }
}

/// Visit each contiguous run of a hyperslab as `(element offset, run index)`.
/// Runs span the fastest axis; `run index` counts runs in visiting order.
pub(crate) fn for_each_run<F>(dims: &[usize], start: &[usize], count: &[usize], mut f: F) -> Result<()>
where
    F: FnMut(usize, usize) -> Result<()>,
{
    let rank = dims.len();
    if rank == 0 || count.iter().any(|&c| c == 0) {
        return Ok(());
    }
    let mut strides = vec![1usize; rank];
    for i in (0..rank - 1).rev() {
        strides[i] = strides[i + 1] * dims[i + 1];
    }

    let outer = &count[..rank - 1];
    let mut idx = vec![0usize; rank - 1];
    let mut run = 0;
    loop {
        let mut offset = start[rank - 1];
        for i in 0..rank - 1 {
            offset += (start[i] + idx[i]) * strides[i];
        }
        f(offset, run)?;
        run += 1;

        // odometer over the slower axes
        let mut axis = rank - 1;
        loop {
            if axis == 0 {
                return Ok(());
            }
            axis -= 1;
            idx[axis] += 1;
            if idx[axis] < outer[axis] {
                break;
            }
            idx[axis] = 0;
        }
    }
}

/// Hyperslab storage primitives
#[async_trait]
pub trait SlabContainer: Send + Sync {
    /// Create a variable, or accept an existing one of the same shape
    async fn define_var(&self, name: &str, dims: &[usize], elem_size: usize) -> Result<()>;

    async fn var_shape(&self, name: &str) -> Result<Option<VarShape>>;

    async fn put_vara(
        &self,
        name: &str,
        start: &[usize],
        count: &[usize],
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()>;

    async fn get_vara(&self, name: &str, start: &[usize], count: &[usize]) -> Result<Vec<u8>>;
}

/// Container keeping each variable as a raw row-major file plus a JSON header
pub struct FileSlabContainer {
    root: PathBuf,
    shapes: RwLock<HashMap<String, VarShape>>,
}

impl FileSlabContainer {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            shapes: RwLock::new(HashMap::new()),
        }
    }

    fn data_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.slab", name))
    }

    fn header_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }

    async fn shape_or_err(&self, name: &str) -> Result<VarShape> {
        self.var_shape(name)
            .await?
            .ok_or_else(|| VdfError::StorageBackend(format!("container variable {} not defined", name)))
    }
}

fn backend_err(op: &str, name: &str, start: &[usize], count: &[usize], e: std::io::Error) -> VdfError {
    VdfError::StorageBackend(format!(
        "{} {} start {:?} count {:?}: {}",
        op, name, start, count, e
    ))
}

#[async_trait]
impl SlabContainer for FileSlabContainer {
    async fn define_var(&self, name: &str, dims: &[usize], elem_size: usize) -> Result<()> {
        let shape = VarShape {
            dims: dims.to_vec(),
            elem_size,
        };
        if let Some(existing) = self.var_shape(name).await? {
            if existing != shape {
                return Err(VdfError::StorageBackend(format!(
                    "container variable {} exists with shape {:?}, requested {:?}",
                    name, existing, shape
                )));
            }
            return Ok(());
        }

        fs::create_dir_all(&self.root).await?;
        fs::write(self.header_path(name), serde_json::to_vec(&shape)?).await?;
        let file = fs::File::create(self.data_path(name)).await?;
        file.set_len((shape.num_elements() * elem_size) as u64).await?;
        self.shapes.write().insert(name.to_string(), shape);
        Ok(())
    }

    async fn var_shape(&self, name: &str) -> Result<Option<VarShape>> {
        if let Some(shape) = self.shapes.read().get(name) {
            return Ok(Some(shape.clone()));
        }
        let header = self.header_path(name);
        if !fs::try_exists(&header).await? {
            return Ok(None);
        }
        let shape: VarShape = serde_json::from_slice(&fs::read(&header).await?)?;
        self.shapes.write().insert(name.to_string(), shape.clone());
        Ok(Some(shape))
    }

    async fn put_vara(
        &self,
        name: &str,
        start: &[usize],
        count: &[usize],
        data: &[u8],
        mode: WriteMode,
    ) -> Result<()> {
        let shape = self.shape_or_err(name).await?;
        shape.check_hyperslab(start, count)?;
        let es = shape.elem_size;
        let run_bytes = count.last().copied().unwrap_or(0) * es;
        let total: usize = count.iter().product::<usize>() * es;
        if data.len() != total {
            return Err(VdfError::InvalidArgument(format!(
                "put_vara {} expects {} bytes, got {}",
                name,
                total,
                data.len()
            )));
        }
        trace!(name, ?start, ?count, ?mode, "put_vara");

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.data_path(name))
            .await
            .map_err(|e| backend_err("put_vara", name, start, count, e))?;

        let mut runs = Vec::new();
        for_each_run(&shape.dims, start, count, |offset, run| {
            runs.push((offset, run));
            Ok(())
        })?;
        for (offset, run) in runs {
            file.seek(SeekFrom::Start((offset * es) as u64))
                .await
                .map_err(|e| backend_err("put_vara", name, start, count, e))?;
            file.write_all(&data[run * run_bytes..(run + 1) * run_bytes])
                .await
                .map_err(|e| backend_err("put_vara", name, start, count, e))?;
        }
        file.flush()
            .await
            .map_err(|e| backend_err("put_vara", name, start, count, e))?;
        Ok(())
    }

    async fn get_vara(&self, name: &str, start: &[usize], count: &[usize]) -> Result<Vec<u8>> {
        let shape = self.shape_or_err(name).await?;
        shape.check_hyperslab(start, count)?;
        let es = shape.elem_size;
        let run_bytes = count.last().copied().unwrap_or(0) * es;
        let mut out = vec![0u8; count.iter().product::<usize>() * es];

        let mut file = fs::File::open(self.data_path(name))
            .await
            .map_err(|e| backend_err("get_vara", name, start, count, e))?;

        let mut runs = Vec::new();
        for_each_run(&shape.dims, start, count, |offset, run| {
            runs.push((offset, run));
            Ok(())
        })?;
        for (offset, run) in runs {
            file.seek(SeekFrom::Start((offset * es) as u64))
                .await
                .map_err(|e| backend_err("get_vara", name, start, count, e))?;
            file.read_exact(&mut out[run * run_bytes..(run + 1) * run_bytes])
                .await
                .map_err(|e| backend_err("get_vara", name, start, count, e))?;
        }
        Ok(out)
    }
}
