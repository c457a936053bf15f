//! Object storage used for descriptors, bricks, masks and the availability index

use crate::error::{Result, VdfError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local memory, mostly for tests and scratch datasets
    Memory,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        match url.split_once("://") {
            Some(("file", _)) => Ok(StorageBackend::FileSystem),
            Some(("mem", _)) => Ok(StorageBackend::Memory),
            Some((scheme, _)) => Err(VdfError::Configuration(format!(
                "Unknown storage scheme: {}",
                scheme
            ))),
            None => Ok(StorageBackend::FileSystem),
        }
    }
}

/// Keyed object storage
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read the object at `path`
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Create or replace the object at `path`
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Names directly under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn size(&self, path: &str) -> Result<usize>;

    fn backend(&self) -> StorageBackend;

    /// Filesystem root, when the backend has one
    fn root(&self) -> Option<&Path> {
        None
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path)).await?;
        debug!(path, size = data.len(), "Read object");
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = fs::File::create(&full_path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        debug!(path, size = data.len(), "Wrote object");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(path)).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.full_path(path)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if fs::metadata(&full_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            let mut read_dir = fs::read_dir(&full_path).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    entries.push(name.to_string());
                }
            }
        }
        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        let metadata = fs::metadata(self.full_path(path)).await?;
        Ok(metadata.len() as usize)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.base_path)
    }
}

/// In-memory I/O manager
#[derive(Default)]
pub struct MemoryIOManager {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(path: &str) -> VdfError {
        VdfError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("No object at {}", path),
        ))
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let objects = self.objects.read();
        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|k| k.strip_prefix(&dir))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        names.dedup();
        Ok(names)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        self.objects
            .read()
            .get(path)
            .map(|b| b.len())
            .ok_or_else(|| Self::not_found(path))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create the matching I/O manager
pub fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryIOManager::new())),
    }
}
