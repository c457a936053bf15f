//! Dataset access - main API for creating, writing and querying datasets

use crate::availability::{Availability, AvailabilityIndex};
use crate::config::StoreConfig;
use crate::container::{FileSlabContainer, SlabContainer};
use crate::error::{Result, VdfError};
use crate::io::{create_io_manager, IOManager};
use crate::metadata::{DatasetDescriptor, FormatVersion};
use crate::pyramid::{build_coarser_level, LevelTransform};
use crate::resolver::{PointSample, RegionResolver, ResolveRequest, ResolvedRegion};
use crate::session::{DatasetSession, RegionCacheStats, RegionKey};
use crate::store::{open_block_store, ContainerFormat};
use crate::types::{ValueRange, VoxelBox};
use crate::utils::{format_bytes, DESCRIPTOR_PATH};
use crate::vario::VariableIo;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Custom metadata key recording the container format a dataset was created with
const FORMAT_KEY: &str = "container_format";

/// Directory under a filesystem dataset holding slab containers
const SLAB_DIR: &str = "slabs";

/// Summary of an open dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetStats {
    pub variables: usize,
    pub timesteps: usize,
    pub levels: usize,
    /// (variable, timestep) pairs with data on disk
    pub present: usize,
    pub format: ContainerFormat,
    pub cache: RegionCacheStats,
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} variables x {} timesteps, {} levels, {} present, {} format, cache {} in {} entries ({:.1}% hits)",
            self.variables,
            self.timesteps,
            self.levels,
            self.present,
            self.format,
            format_bytes(self.cache.bytes),
            self.cache.entries,
            self.cache.hit_rate()
        )
    }
}

/// Main interface to a multi-resolution dataset
pub struct Dataset {
    descriptor: Arc<DatasetDescriptor>,
    config: StoreConfig,
    io: Arc<dyn IOManager>,
    container: Option<Arc<dyn SlabContainer>>,
    session: Arc<DatasetSession>,
    availability: Arc<RwLock<AvailabilityIndex>>,
}

impl Dataset {
    fn assemble(
        descriptor: DatasetDescriptor,
        config: StoreConfig,
        io: Arc<dyn IOManager>,
        availability: AvailabilityIndex,
    ) -> Self {
        let container = io
            .root()
            .map(|root| Arc::new(FileSlabContainer::new(root.join(SLAB_DIR))) as Arc<dyn SlabContainer>);
        let descriptor = Arc::new(descriptor);
        let session = Arc::new(DatasetSession::new(descriptor.clone(), config.cache_bytes()));
        Self {
            descriptor,
            config,
            io,
            container,
            session,
            availability: Arc::new(RwLock::new(availability)),
        }
    }

    /// Create a new dataset at `url`, persisting its descriptor
    pub async fn create(
        url: impl Into<String>,
        mut descriptor: DatasetDescriptor,
        config: StoreConfig,
    ) -> Result<Self> {
        let url = url.into();
        config.validate()?;
        descriptor.validate()?;
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(&url)?);
        if config.format == ContainerFormat::Slab && io.root().is_none() {
            return Err(VdfError::Configuration(format!(
                "{} cannot hold slab containers",
                url
            )));
        }

        descriptor.add_metadata(FORMAT_KEY, config.format.to_string());
        descriptor.touch();
        let json = serde_json::to_vec_pretty(&descriptor)?;
        io.write(DESCRIPTOR_PATH, &json).await?;
        info!(url = %url, summary = %descriptor.summary(), "created dataset");

        Ok(Self::assemble(descriptor, config, io, AvailabilityIndex::new()))
    }

    /// Open an existing dataset. The container format recorded at creation
    /// wins over `config.format`.
    pub async fn open(url: impl Into<String>, mut config: StoreConfig) -> Result<Self> {
        let url = url.into();
        config.validate()?;
        let io: Arc<dyn IOManager> = Arc::from(create_io_manager(&url)?);

        let bytes = io.read(DESCRIPTOR_PATH).await?;
        let descriptor: DatasetDescriptor = serde_json::from_slice(&bytes)?;
        if !FormatVersion::CURRENT.is_compatible(&descriptor.version) {
            return Err(VdfError::Configuration(format!(
                "dataset format {}.{} is not readable by {}.{}",
                descriptor.version.major,
                descriptor.version.minor,
                FormatVersion::CURRENT.major,
                FormatVersion::CURRENT.minor
            )));
        }
        descriptor.validate()?;
        if let Some(format) = descriptor.get_metadata(FORMAT_KEY) {
            let recorded: ContainerFormat = format.parse().map_err(VdfError::Configuration)?;
            if recorded != config.format {
                debug!(configured = %config.format, %recorded, "using recorded container format");
                config.format = recorded;
            }
        }
        let availability = AvailabilityIndex::load(io.as_ref()).await?;
        info!(url = %url, entries = availability.len(), "opened dataset");

        Ok(Self::assemble(descriptor, config, io, availability))
    }

    pub fn descriptor(&self) -> &Arc<DatasetDescriptor> {
        &self.descriptor
    }

    pub fn session(&self) -> &Arc<DatasetSession> {
        &self.session
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn io(&self) -> &Arc<dyn IOManager> {
        &self.io
    }

    pub fn variable_exists(&self, timestep: usize, variable: &str, level: usize) -> bool {
        self.availability
            .read()
            .variable_exists(variable, timestep, level)
    }

    pub fn valid_region(&self, timestep: usize, variable: &str, level: usize) -> Option<VoxelBox> {
        self.availability
            .read()
            .valid_region(variable, timestep, level)
    }

    /// Range of the present values written for (variable, timestep)
    pub fn data_range(&self, variable: &str, timestep: usize) -> Option<ValueRange> {
        self.availability.read().data_range(variable, timestep)
    }

    /// A fresh variable handle over this dataset's storage
    pub fn variable_io(&self) -> Result<VariableIo> {
        let store = open_block_store(
            &self.config,
            self.io.clone(),
            self.container.clone(),
            self.descriptor.compression,
            self.descriptor.data_type,
            self.descriptor.compression_ratios.len(),
        )?;
        Ok(VariableIo::new(
            self.session.clone(),
            store,
            self.io.clone(),
            self.availability.clone(),
        ))
    }

    /// Run `f` with a resolver configured from this dataset's settings
    pub fn with_resolver<R>(&self, f: impl FnOnce(&RegionResolver<'_>) -> R) -> R {
        let index = self.availability.read();
        let resolver = RegionResolver::new(&self.session, &*index).with_config(&self.config);
        f(&resolver)
    }

    pub fn resolve(&self, req: &ResolveRequest) -> Result<ResolvedRegion> {
        self.with_resolver(|r| r.resolve(req))
    }

    pub fn resolve_each(&self, req: &ResolveRequest) -> Vec<(String, Result<ResolvedRegion>)> {
        self.with_resolver(|r| r.resolve_each(req))
    }

    /// Voxels of `variable` inside a resolved region, served from the region
    /// cache when possible
    pub async fn read_resolved(
        &self,
        resolved: &ResolvedRegion,
        variable: &str,
        lod: usize,
    ) -> Result<Arc<Vec<f32>>> {
        if !resolved.variables.iter().any(|v| v == variable) {
            return Err(VdfError::InvalidArgument(format!(
                "{} was not part of the resolved request",
                variable
            )));
        }
        if resolved.grid_height != self.session.full_grid_height() {
            return Err(VdfError::InvalidArgument(
                "region was resolved against a different grid height".into(),
            ));
        }
        let kind = self.descriptor.var_kind(variable)?;
        let key = RegionKey {
            variable: variable.to_string(),
            timestep: resolved.timestep,
            level: resolved.level_achieved,
            lod: self.descriptor.normalize_lod(lod),
            region: resolved.voxels_for(kind),
            grid_height: resolved.grid_height,
        };
        if let Some(data) = self.session.cached_region(&key) {
            return Ok(data);
        }

        let mut vio = self.variable_io()?;
        vio.open_read(key.timestep, variable, key.level, key.lod).await?;
        let data = vio.read_region(&key.region).await;
        vio.close().await?;
        let data = Arc::new(data?);
        debug!(variable, region = %key.region, level = key.level, "cached region read");
        self.session.cache_region(key, data.clone());
        Ok(data)
    }

    /// Value of `variable` nearest to a user-space point
    pub async fn sample_point(
        &self,
        variable: &str,
        point: [f64; 3],
        level: usize,
        timestep: usize,
    ) -> Result<PointSample> {
        let index = self.availability.read().subset(variable, timestep);
        let resolver = RegionResolver::new(&self.session, &index).with_config(&self.config);
        let mut vio = self.variable_io()?;
        resolver
            .sample_point(&mut vio, variable, point, level, timestep)
            .await
    }

    /// Derive `level - 1` of `variable` from `level`
    pub async fn build_coarser_level(
        &self,
        transform: &dyn LevelTransform,
        timestep: usize,
        variable: &str,
        level: usize,
        lod: usize,
    ) -> Result<usize> {
        let mut src = self.variable_io()?;
        let mut dst = self.variable_io()?;
        build_coarser_level(&mut src, &mut dst, transform, timestep, variable, level, lod).await
    }

    /// Derive every level coarser than the finest one present
    pub async fn build_pyramid(
        &self,
        transform: &dyn LevelTransform,
        timestep: usize,
        variable: &str,
        lod: usize,
    ) -> Result<()> {
        let finest = self
            .availability
            .read()
            .max_level_present(variable, timestep)
            .ok_or_else(|| VdfError::unavailable(variable, self.descriptor.num_transforms(), timestep))?;
        for level in (1..=finest).rev() {
            self.build_coarser_level(transform, timestep, variable, level, lod)
                .await?;
        }
        Ok(())
    }

    pub fn set_layered_grid_height(&self, height: usize) -> Result<()> {
        self.session.set_layered_grid_height(height)
    }

    pub fn stats(&self) -> DatasetStats {
        DatasetStats {
            variables: self.descriptor.variables.len(),
            timesteps: self.descriptor.num_timesteps,
            levels: self.descriptor.num_transforms() + 1,
            present: self.availability.read().len(),
            format: self.config.format,
            cache: self.session.cache_stats(),
        }
    }
}
