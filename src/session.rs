//! Per-dataset mutable state shared by resolvers and variable handles: the
//! layered-grid height override, the negative cache of missing data, and
//! the region data cache.

use crate::error::{Result, VdfError};
use crate::metadata::DatasetDescriptor;
use crate::types::VoxelBox;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a cached region read
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey {
    pub variable: String,
    pub timestep: usize,
    pub level: usize,
    pub lod: usize,
    pub region: VoxelBox,
    /// Layered-grid height the region was addressed with
    pub grid_height: Option<usize>,
}

/// Statistics of the region cache
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RegionCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
}

impl RegionCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct RegionCache {
    entries: LruCache<RegionKey, Arc<Vec<f32>>>,
    budget_bytes: usize,
    stats: RegionCacheStats,
}

impl RegionCache {
    fn new(budget_bytes: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            budget_bytes,
            stats: RegionCacheStats::default(),
        }
    }

    fn insert(&mut self, key: RegionKey, data: Arc<Vec<f32>>) {
        let size = data.len() * std::mem::size_of::<f32>();
        if size > self.budget_bytes {
            return;
        }
        if let Some(old) = self.entries.put(key, data) {
            self.stats.bytes -= old.len() * std::mem::size_of::<f32>();
        }
        self.stats.bytes += size;
        while self.stats.bytes > self.budget_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => {
                    self.stats.bytes -= evicted.len() * std::mem::size_of::<f32>();
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
        self.stats.entries = self.entries.len();
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.stats.entries = 0;
        self.stats.bytes = 0;
    }
}

/// Mutable state scoped to one opened dataset
pub struct DatasetSession {
    descriptor: Arc<DatasetDescriptor>,
    full_grid_height: RwLock<Option<usize>>,
    missing: Mutex<HashSet<(String, usize, usize)>>,
    cache: Mutex<RegionCache>,
}

impl DatasetSession {
    pub fn new(descriptor: Arc<DatasetDescriptor>, cache_bytes: usize) -> Self {
        Self {
            descriptor,
            full_grid_height: RwLock::new(None),
            missing: Mutex::new(HashSet::new()),
            cache: Mutex::new(RegionCache::new(cache_bytes)),
        }
    }

    pub fn descriptor(&self) -> &Arc<DatasetDescriptor> {
        &self.descriptor
    }

    /// Finest-level vertical voxel count in effect for a layered grid
    pub fn full_grid_height(&self) -> Option<usize> {
        if self.descriptor.is_layered() {
            *self.full_grid_height.read()
        } else {
            None
        }
    }

    /// Set the vertical voxel count of a layered grid. A changed value
    /// invalidates every cached region.
    pub fn set_layered_grid_height(&self, height: usize) -> Result<()> {
        if !self.descriptor.is_layered() {
            return Err(VdfError::InvalidArgument(
                "grid height can only be set on a layered grid".into(),
            ));
        }
        if height == 0 {
            return Err(VdfError::InvalidArgument("grid height must be positive".into()));
        }
        let previous = self.full_grid_height.write().replace(height);
        if previous != Some(height) {
            info!(?previous, height, "layered grid height changed");
            self.on_layered_height_changed();
        }
        Ok(())
    }

    /// Drop region data addressed with a previous grid height
    pub fn on_layered_height_changed(&self) {
        let mut cache = self.cache.lock();
        debug!(entries = cache.entries.len(), "purging region cache");
        cache.clear();
    }

    /// Remember that (variable, level, timestep) has no data
    pub fn mark_missing(&self, variable: &str, level: usize, timestep: usize) -> bool {
        self.missing
            .lock()
            .insert((variable.to_string(), level, timestep))
    }

    pub fn is_missing(&self, variable: &str, level: usize, timestep: usize) -> bool {
        self.missing
            .lock()
            .contains(&(variable.to_string(), level, timestep))
    }

    /// Forget negative results, e.g. after new data was written
    pub fn clear_missing(&self) {
        self.missing.lock().clear();
    }

    pub fn cached_region(&self, key: &RegionKey) -> Option<Arc<Vec<f32>>> {
        let mut cache = self.cache.lock();
        match cache.entries.get(key).cloned() {
            Some(data) => {
                cache.stats.hits += 1;
                Some(data)
            }
            None => {
                cache.stats.misses += 1;
                None
            }
        }
    }

    /// Cache a region read. Entries tagged with a stale grid height are
    /// never stored.
    pub fn cache_region(&self, key: RegionKey, data: Arc<Vec<f32>>) {
        if key.grid_height != self.full_grid_height() {
            return;
        }
        self.cache.lock().insert(key, data);
    }

    /// Drop cached regions of a variable, used after it was rewritten
    pub fn invalidate_variable(&self, variable: &str, timestep: usize) {
        let mut cache = self.cache.lock();
        let stale: Vec<RegionKey> = cache
            .entries
            .iter()
            .filter(|(k, _)| k.variable == variable && k.timestep == timestep)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            if let Some(data) = cache.entries.pop(&key) {
                cache.stats.bytes -= data.len() * std::mem::size_of::<f32>();
            }
        }
        cache.stats.entries = cache.entries.len();
    }

    pub fn cache_stats(&self) -> RegionCacheStats {
        self.cache.lock().stats.clone()
    }
}
