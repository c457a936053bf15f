//! Variable I/O: region and slice transfers for one open
//! (timestep, variable, level, lod) binding.
//!
//! A handle moves `Closed -> OpenForRead | OpenForWrite -> Closed`. Samples
//! are exchanged as `f32` in x-fastest order; conversion to the on-disk
//! sample type, lossy precision reduction per LOD and missing-value masking
//! happen here, below them sits a [`BlockStore`]. Blocks are stored once per
//! level, at the precision of the LOD they were written with; reads at a
//! lower LOD reduce precision further.

use crate::availability::{Availability, AvailabilityIndex};
use crate::bitmask::{is_missing, mask_block, restore_missing, MaskFile};
use crate::compression::{mantissa_bits_for_ratio, reduce_precision};
use crate::error::{Result, VdfError};
use crate::io::IOManager;
use crate::layout::LevelLayout;
use crate::metadata::DatasetDescriptor;
use crate::session::DatasetSession;
use crate::store::{BlockStore, VarBinding};
use crate::types::{ValueRange, VoxelBox};
use crate::utils::{decode_samples, encode_samples, mask_path};
use ndarray::{s, ArrayView3, ArrayViewMut3, ShapeError};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Accumulated time per I/O phase
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IoTimers {
    read: Duration,
    write: Duration,
    seek: Duration,
    xform: Duration,
}

impl IoTimers {
    /// Time spent fetching blocks from storage
    pub fn read(&self) -> Duration {
        self.read
    }

    /// Time spent handing blocks to storage
    pub fn write(&self) -> Duration {
        self.write
    }

    /// Time spent binding storage and loading or saving masks
    pub fn seek(&self) -> Duration {
        self.seek
    }

    /// Time spent converting, masking and reducing samples
    pub fn xform(&self) -> Duration {
        self.xform
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mode of the current binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Read,
    Write,
}

struct OpenVar {
    mode: IoMode,
    binding: VarBinding,
    layout: LevelLayout,
    missing: Option<f32>,
    masks: Option<MaskFile>,
    masks_dirty: bool,
    /// Next z plane for slice streaming
    next_slice: usize,
    /// Block layer holding the current slices: (first z, samples of the layer)
    layer: Option<(usize, Vec<f32>)>,
    written: Option<VoxelBox>,
    range: Option<ValueRange>,
}

impl OpenVar {
    fn plane_voxels(&self) -> usize {
        self.layout.dims[0] * self.layout.dims[1]
    }

    /// z range `[z0, z1)` of the block layer containing plane `z`
    fn layer_bounds(&self, z: usize) -> (usize, usize) {
        let bz = self.layout.block[2];
        let z0 = z / bz * bz;
        (z0, (z0 + bz).min(self.layout.dims[2]))
    }
}

fn shape_err(e: ShapeError) -> VdfError {
    VdfError::InvalidArgument(format!("buffer does not match region shape: {}", e))
}

/// Copy an `extent` box between two x-fastest buffers of `[nx, ny, nz]` dims
fn copy_box(
    src: &[f32],
    src_dims: [usize; 3],
    src_off: [usize; 3],
    dst: &mut [f32],
    dst_dims: [usize; 3],
    dst_off: [usize; 3],
    extent: [usize; 3],
) -> Result<()> {
    let src = ArrayView3::from_shape((src_dims[2], src_dims[1], src_dims[0]), src)
        .map_err(shape_err)?;
    let mut dst = ArrayViewMut3::from_shape((dst_dims[2], dst_dims[1], dst_dims[0]), dst)
        .map_err(shape_err)?;
    dst.slice_mut(s![
        dst_off[2]..dst_off[2] + extent[2],
        dst_off[1]..dst_off[1] + extent[1],
        dst_off[0]..dst_off[0] + extent[0]
    ])
    .assign(&src.slice(s![
        src_off[2]..src_off[2] + extent[2],
        src_off[1]..src_off[1] + extent[1],
        src_off[0]..src_off[0] + extent[0]
    ]));
    Ok(())
}

/// Read/write engine for one variable at a time
pub struct VariableIo {
    session: Arc<DatasetSession>,
    store: Box<dyn BlockStore>,
    io: Arc<dyn IOManager>,
    availability: Arc<RwLock<AvailabilityIndex>>,
    state: Option<OpenVar>,
    timers: IoTimers,
}

impl VariableIo {
    pub fn new(
        session: Arc<DatasetSession>,
        store: Box<dyn BlockStore>,
        io: Arc<dyn IOManager>,
        availability: Arc<RwLock<AvailabilityIndex>>,
    ) -> Self {
        Self {
            session,
            store,
            io,
            availability,
            state: None,
            timers: IoTimers::default(),
        }
    }

    pub fn descriptor(&self) -> &DatasetDescriptor {
        self.session.descriptor()
    }

    pub fn session(&self) -> &Arc<DatasetSession> {
        &self.session
    }

    pub fn timers(&self) -> IoTimers {
        self.timers
    }

    pub fn read_timer(&self) -> Duration {
        self.timers.read
    }

    pub fn write_timer(&self) -> Duration {
        self.timers.write
    }

    pub fn seek_timer(&self) -> Duration {
        self.timers.seek
    }

    pub fn xform_timer(&self) -> Duration {
        self.timers.xform
    }

    pub fn reset_timers(&mut self) {
        self.timers.reset();
    }

    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    pub fn mode(&self) -> Option<IoMode> {
        self.state.as_ref().map(|s| s.mode)
    }

    pub fn binding(&self) -> Option<&VarBinding> {
        self.state.as_ref().map(|s| &s.binding)
    }

    /// Geometry of the bound variable
    pub fn layout(&self) -> Result<LevelLayout> {
        Ok(self.bound()?.layout)
    }

    pub fn store(&self) -> &dyn BlockStore {
        self.store.as_ref()
    }

    /// Whether `variable` was written at `level` for `timestep`
    pub fn variable_exists(&self, timestep: usize, variable: &str, level: usize) -> bool {
        self.availability
            .read()
            .variable_exists(variable, timestep, level)
    }

    /// Voxel box present on disk at `level`
    pub fn valid_region(&self, timestep: usize, variable: &str, level: usize) -> Option<VoxelBox> {
        self.availability
            .read()
            .valid_region(variable, timestep, level)
    }

    fn bound(&self) -> Result<&OpenVar> {
        self.state
            .as_ref()
            .ok_or_else(|| VdfError::NotOpen("no variable is open".into()))
    }

    fn bound_for_write(&self) -> Result<&OpenVar> {
        match &self.state {
            Some(s) if s.mode == IoMode::Write => Ok(s),
            Some(s) => Err(VdfError::NotOpen(format!("{} is open for read", s.binding))),
            None => Err(VdfError::NotOpen("no variable is open for write".into())),
        }
    }

    fn make_binding(
        &self,
        timestep: usize,
        variable: &str,
        level: usize,
        lod: usize,
    ) -> Result<(VarBinding, LevelLayout)> {
        let d = self.descriptor();
        if timestep >= d.num_timesteps {
            return Err(VdfError::InvalidArgument(format!(
                "timestep {} out of range, dataset has {}",
                timestep, d.num_timesteps
            )));
        }
        let kind = d.var_kind(variable)?;
        let level = d.normalize_level(level);
        let binding = VarBinding {
            timestep,
            variable: variable.to_string(),
            kind,
            level,
            lod: d.normalize_lod(lod),
        };
        let layout = d.layout_for(kind, level, self.session.full_grid_height());
        Ok((binding, layout))
    }

    async fn load_masks(&self, binding: &VarBinding, layout: &LevelLayout) -> Result<Option<MaskFile>> {
        if self.descriptor().missing_value(&binding.variable).is_none() {
            return Ok(None);
        }
        let path = mask_path(&binding.variable, binding.timestep, binding.level);
        if !self.io.exists(&path).await? {
            return Ok(Some(MaskFile::new(layout.block_voxels())));
        }
        let bytes = self.io.read(&path).await?;
        Ok(Some(MaskFile::from_bytes(&bytes, layout.block_voxels())?))
    }

    async fn open(
        &mut self,
        mode: IoMode,
        timestep: usize,
        variable: &str,
        level: usize,
        lod: usize,
    ) -> Result<()> {
        if self.state.is_some() {
            self.close().await?;
        }
        let (binding, layout) = self.make_binding(timestep, variable, level, lod)?;

        if mode == IoMode::Read && !self.variable_exists(timestep, variable, binding.level) {
            warn!(
                variable,
                level = binding.level,
                timestep,
                "variable not present; try a lower refinement level or another timestep"
            );
            return Err(VdfError::unavailable(variable, binding.level, timestep));
        }

        let t = Instant::now();
        let masks = self.load_masks(&binding, &layout).await?;
        match mode {
            IoMode::Read => self.store.open_read(&binding, layout).await?,
            IoMode::Write => self.store.open_write(&binding, layout).await?,
        }
        self.timers.seek += t.elapsed();

        debug!(binding = %binding, ?mode, dims = ?layout.dims, "opened variable");
        self.state = Some(OpenVar {
            mode,
            missing: self.descriptor().missing_value(variable),
            binding,
            layout,
            masks,
            masks_dirty: false,
            next_slice: 0,
            layer: None,
            written: None,
            range: None,
        });
        Ok(())
    }

    pub async fn open_read(
        &mut self,
        timestep: usize,
        variable: &str,
        level: usize,
        lod: usize,
    ) -> Result<()> {
        self.open(IoMode::Read, timestep, variable, level, lod).await
    }

    pub async fn open_write(
        &mut self,
        timestep: usize,
        variable: &str,
        level: usize,
        lod: usize,
    ) -> Result<()> {
        self.open(IoMode::Write, timestep, variable, level, lod).await
    }

    /// Finish the binding. Writes flush pending slices, persist the mask
    /// file and record what was written in the availability index.
    pub async fn close(&mut self) -> Result<()> {
        if self.state.as_ref().is_some_and(|s| s.mode == IoMode::Write) {
            self.flush_slice_layer().await?;
        }
        let Some(var) = self.state.take() else {
            return Ok(());
        };
        let t = Instant::now();
        self.store.close().await?;

        if var.mode == IoMode::Write {
            if let (Some(masks), true) = (&var.masks, var.masks_dirty) {
                let path = mask_path(&var.binding.variable, var.binding.timestep, var.binding.level);
                self.io.write(&path, &masks.to_bytes()?).await?;
            }
            if let Some(region) = var.written {
                let snapshot = {
                    let mut index = self.availability.write();
                    index.record(
                        &var.binding.variable,
                        var.binding.timestep,
                        var.binding.level,
                        region,
                        var.range,
                    );
                    index.clone()
                };
                snapshot.save(self.io.as_ref()).await?;
                self.session
                    .invalidate_variable(&var.binding.variable, var.binding.timestep);
                self.session.clear_missing();
                info!(binding = %var.binding, region = %region, "wrote variable");
            }
        }
        self.timers.seek += t.elapsed();
        Ok(())
    }

    /// Decoded samples of one block with missing values restored
    async fn load_block(&mut self, block: [usize; 3]) -> Result<Option<Vec<f32>>> {
        let data_type = self.descriptor().data_type;
        let t = Instant::now();
        let raw = self.store.read_block(block).await?;
        self.timers.read += t.elapsed();
        let Some(raw) = raw else {
            return Ok(None);
        };

        let t = Instant::now();
        let var = self.bound()?;
        let mut samples = decode_samples(data_type, &raw)?;
        if samples.len() != var.layout.block_voxels() {
            return Err(VdfError::StorageBackend(format!(
                "block {:?} of {} decoded to {} samples, expected {}",
                block,
                var.binding,
                samples.len(),
                var.layout.block_voxels()
            )));
        }
        if let (Some(masks), Some(mv)) = (&var.masks, var.missing) {
            let index = var.layout.block_coords_to_index(&block);
            if let Some(mask) = masks.get(index) {
                restore_missing(&mut samples, mask, mv)?;
            }
        }
        // one stored copy serves every LOD; lower ones are derived here
        if data_type.is_float() {
            let ratio = self.descriptor().compression_ratio(var.binding.lod);
            reduce_precision(&mut samples, mantissa_bits_for_ratio(ratio), var.missing);
        }
        self.timers.xform += t.elapsed();
        Ok(Some(samples))
    }

    /// Mask, reduce and encode one full block, then hand it to the store
    async fn store_block(&mut self, block: [usize; 3], mut samples: Vec<f32>) -> Result<()> {
        let d = self.session.descriptor().clone();
        let t = Instant::now();
        let var = self.state.as_mut().ok_or_else(|| VdfError::NotOpen("no variable is open".into()))?;
        let layout = var.layout;

        if let (Some(masks), Some(mv)) = (var.masks.as_mut(), var.missing) {
            let range = layout.block_data_range(&block);
            let [bx, by, _] = layout.block;
            let in_domain = |i: usize| {
                let (x, y, z) = (i % bx, (i / bx) % by, i / (bx * by));
                range[0].0 + x < range[0].1 && range[1].0 + y < range[1].1 && range[2].0 + z < range[2].1
            };
            let mask = mask_block(&mut samples, mv, in_domain);
            if mask.as_ref().is_some_and(|m| m.all_missing) {
                debug!(binding = %var.binding, ?block, "block holds no data");
            }
            masks.set(layout.block_coords_to_index(&block), mask)?;
            var.masks_dirty = true;
        }
        if d.data_type.is_float() {
            let keep = mantissa_bits_for_ratio(d.compression_ratio(var.binding.lod));
            reduce_precision(&mut samples, keep, None);
        }
        let bytes = encode_samples(d.data_type, &samples);
        self.timers.xform += t.elapsed();

        let t = Instant::now();
        self.store.write_block(block, &bytes).await?;
        self.timers.write += t.elapsed();
        Ok(())
    }

    /// Read whole blocks. The buffer covers `blocks` times the block size on
    /// every axis, padding included.
    pub async fn read_block_region(&mut self, blocks: &VoxelBox) -> Result<Vec<f32>> {
        let var = self.bound()?;
        let layout = var.layout;
        if !layout.is_valid_region_blk(blocks) {
            return Err(VdfError::OutOfBounds(format!(
                "blocks {} outside block grid {:?} of {}",
                blocks,
                layout.block_count(),
                var.binding
            )));
        }
        let binding = var.binding.clone();
        let nb = blocks.dims();
        let out_dims = [
            nb[0] * layout.block[0],
            nb[1] * layout.block[1],
            nb[2] * layout.block[2],
        ];
        let mut out = vec![0.0f32; out_dims.iter().product()];

        for bz in blocks.min[2]..=blocks.max[2] {
            for by in blocks.min[1]..=blocks.max[1] {
                for bx in blocks.min[0]..=blocks.max[0] {
                    let samples = self.load_block([bx, by, bz]).await?.ok_or_else(|| {
                        warn!(binding = %binding, block = ?[bx, by, bz], "block not stored");
                        VdfError::unavailable(&binding.variable, binding.level, binding.timestep)
                    })?;
                    let off = [
                        (bx - blocks.min[0]) * layout.block[0],
                        (by - blocks.min[1]) * layout.block[1],
                        (bz - blocks.min[2]) * layout.block[2],
                    ];
                    copy_box(
                        &samples,
                        layout.block,
                        [0; 3],
                        &mut out,
                        out_dims,
                        off,
                        layout.block,
                    )?;
                }
            }
        }
        Ok(out)
    }

    fn check_region(&self, region: &VoxelBox) -> Result<LevelLayout> {
        let var = self.bound()?;
        if !var.layout.is_valid_region(region) {
            let hint = if var.binding.kind.is_planar() {
                format!(" ({:?} variable)", var.binding.kind)
            } else {
                String::new()
            };
            return Err(VdfError::OutOfBounds(format!(
                "region {} outside {:?} of {}{}",
                region, var.layout.dims, var.binding, hint
            )));
        }
        Ok(var.layout)
    }

    /// Read exactly the voxels of `region`
    pub async fn read_region(&mut self, region: &VoxelBox) -> Result<Vec<f32>> {
        let layout = self.check_region(region)?;
        let blocks = layout.blocks_for(region);
        let data = self.read_block_region(&blocks).await?;
        let covered = layout.block_voxel_box(&blocks);

        let t = Instant::now();
        let dims = region.dims();
        let mut out = vec![0.0f32; region.num_voxels()];
        let off = [
            region.min[0] - covered.min[0],
            region.min[1] - covered.min[1],
            region.min[2] - covered.min[2],
        ];
        copy_box(&data, covered.dims(), off, &mut out, dims, [0; 3], dims)?;
        self.timers.xform += t.elapsed();
        Ok(out)
    }

    /// Write exactly the voxels of `region`; partially covered blocks are
    /// read, patched and written back.
    pub async fn write_region(&mut self, region: &VoxelBox, data: &[f32]) -> Result<()> {
        self.bound_for_write()?;
        let layout = self.check_region(region)?;
        if data.len() != region.num_voxels() {
            return Err(VdfError::InvalidArgument(format!(
                "region {} needs {} samples, got {}",
                region,
                region.num_voxels(),
                data.len()
            )));
        }
        let missing = self.bound()?.missing;
        let fill = missing.unwrap_or(0.0);
        let blocks = layout.blocks_for(region);

        for bz in blocks.min[2]..=blocks.max[2] {
            for by in blocks.min[1]..=blocks.max[1] {
                for bx in blocks.min[0]..=blocks.max[0] {
                    let block = [bx, by, bz];
                    let range = layout.block_data_range(&block);
                    let covers = (0..3).all(|i| region.min[i] <= range[i].0 && region.max[i] + 1 >= range[i].1);
                    let mut samples = if covers {
                        vec![fill; layout.block_voxels()]
                    } else {
                        self.load_block(block)
                            .await?
                            .unwrap_or_else(|| vec![fill; layout.block_voxels()])
                    };

                    // overlap of the region with this block, in global voxels
                    let lo = [
                        region.min[0].max(range[0].0),
                        region.min[1].max(range[1].0),
                        region.min[2].max(range[2].0),
                    ];
                    let extent = [
                        region.max[0].min(range[0].1 - 1) + 1 - lo[0],
                        region.max[1].min(range[1].1 - 1) + 1 - lo[1],
                        region.max[2].min(range[2].1 - 1) + 1 - lo[2],
                    ];
                    copy_box(
                        data,
                        region.dims(),
                        [lo[0] - region.min[0], lo[1] - region.min[1], lo[2] - region.min[2]],
                        &mut samples,
                        layout.block,
                        [lo[0] - range[0].0, lo[1] - range[1].0, lo[2] - range[2].0],
                        extent,
                    )?;
                    self.store_block(block, samples).await?;
                }
            }
        }

        let mut range: Option<ValueRange> = None;
        for &v in data {
            if missing.is_some_and(|mv| is_missing(v, mv)) || !v.is_finite() {
                continue;
            }
            match range.as_mut() {
                Some(r) => r.include(v as f64),
                None => range = Some(ValueRange::new(v as f64, v as f64)),
            }
        }
        if let Some(var) = self.state.as_mut() {
            var.written = Some(match var.written {
                Some(w) => w.union(region),
                None => *region,
            });
            var.range = match (var.range, range) {
                (Some(a), Some(b)) => Some(a.merge(&b)),
                (a, b) => a.or(b),
            };
        }
        Ok(())
    }

    /// Next z plane of the bound variable, `None` once every plane was read
    pub async fn read_slice(&mut self) -> Result<Option<Vec<f32>>> {
        let var = self.bound()?;
        if var.mode != IoMode::Read {
            return Err(VdfError::NotOpen(format!("{} is open for write", var.binding)));
        }
        let z = var.next_slice;
        if z >= var.layout.dims[2] {
            return Ok(None);
        }
        let layout = var.layout;
        let (z0, z1) = var.layer_bounds(z);
        let cached = matches!(var.layer, Some((lz, _)) if lz == z0);

        if !cached {
            let region = VoxelBox::new([0, 0, z0], [layout.dims[0] - 1, layout.dims[1] - 1, z1 - 1]);
            let samples = self.read_region(&region).await?;
            if let Some(var) = self.state.as_mut() {
                var.layer = Some((z0, samples));
            }
        }

        let var = self
            .state
            .as_mut()
            .ok_or_else(|| VdfError::NotOpen("no variable is open".into()))?;
        let plane = var.plane_voxels();
        let start = (z - z0) * plane;
        let slice = match &var.layer {
            Some((_, samples)) => samples[start..start + plane].to_vec(),
            None => return Err(VdfError::NotOpen("slice layer lost".into())),
        };
        var.next_slice += 1;
        if z + 1 == z1 {
            var.layer = None;
        }
        Ok(Some(slice))
    }

    /// Append the next z plane; planes are written a block layer at a time
    pub async fn write_slice(&mut self, plane: &[f32]) -> Result<()> {
        let var = self.bound_for_write()?;
        let z = var.next_slice;
        if z >= var.layout.dims[2] {
            return Err(VdfError::OutOfBounds(format!(
                "all {} slices of {} already written",
                var.layout.dims[2], var.binding
            )));
        }
        let n = var.plane_voxels();
        if plane.len() != n {
            return Err(VdfError::InvalidArgument(format!(
                "slice needs {} samples, got {}",
                n,
                plane.len()
            )));
        }
        let (z0, z1) = var.layer_bounds(z);

        let var = self
            .state
            .as_mut()
            .ok_or_else(|| VdfError::NotOpen("no variable is open".into()))?;
        let layer = var.layer.get_or_insert_with(|| (z0, Vec::with_capacity(n * (z1 - z0))));
        layer.1.extend_from_slice(plane);
        var.next_slice += 1;

        if z + 1 == z1 {
            self.flush_slice_layer().await?;
        }
        Ok(())
    }

    async fn flush_slice_layer(&mut self) -> Result<()> {
        let Some(var) = self.state.as_mut() else {
            return Ok(());
        };
        let Some((z0, samples)) = var.layer.take() else {
            return Ok(());
        };
        let plane = var.plane_voxels();
        if samples.is_empty() || plane == 0 {
            return Ok(());
        }
        let planes = samples.len() / plane;
        let dims = var.layout.dims;
        let region = VoxelBox::new([0, 0, z0], [dims[0] - 1, dims[1] - 1, z0 + planes - 1]);
        self.write_region(&region, &samples).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionMethod;
    use crate::io::MemoryIOManager;
    use crate::layout::BlockSize;
    use crate::metadata::VariableInfo;
    use crate::store::BrickStore;
    use crate::types::{DataType, VarKind};

    const MV: f32 = -999.0;

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new([10, 9, 7], [0.0, 0.0, 0.0, 9.0, 8.0, 6.0])
            .with_num_transforms(1)
            .with_block_size(BlockSize::cube(4).unwrap())
            .with_num_timesteps(2)
            .with_compression(CompressionMethod::Deflate)
            .with_variable(VariableInfo::new("temp", VarKind::Volume3D))
            .with_variable(VariableInfo::new("salt", VarKind::Volume3D).with_missing_value(MV))
            .with_variable(VariableInfo::new("hgt", VarKind::Plane2DXY))
    }

    fn handle(d: DatasetDescriptor) -> VariableIo {
        let d = Arc::new(d);
        let session = Arc::new(DatasetSession::new(d.clone(), 1 << 20));
        let io: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        let store = BrickStore::new(io.clone(), d.compression, d.data_type, 1);
        VariableIo::new(
            session,
            Box::new(store),
            io,
            Arc::new(RwLock::new(AvailabilityIndex::new())),
        )
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32).collect()
    }

    #[tokio::test]
    async fn test_state_machine() {
        let mut vio = handle(descriptor());
        let region = VoxelBox::new([0; 3], [1; 3]);
        assert!(matches!(
            vio.read_region(&region).await,
            Err(VdfError::NotOpen(_))
        ));
        assert!(matches!(
            vio.write_region(&region, &[0.0; 8]).await,
            Err(VdfError::NotOpen(_))
        ));
        // nothing written yet
        assert!(matches!(
            vio.open_read(0, "temp", 1, 0).await,
            Err(VdfError::DataUnavailable { .. })
        ));
        assert!(matches!(
            vio.open_write(0, "nope", 1, 0).await,
            Err(VdfError::InvalidArgument(_))
        ));
        assert!(matches!(
            vio.open_write(5, "temp", 1, 0).await,
            Err(VdfError::InvalidArgument(_))
        ));

        vio.open_write(0, "temp", 1, 0).await.unwrap();
        assert_eq!(vio.mode(), Some(IoMode::Write));
        assert!(matches!(
            vio.read_slice().await,
            Err(VdfError::NotOpen(_))
        ));
        vio.close().await.unwrap();
        vio.close().await.unwrap();
        assert!(!vio.is_open());
    }

    #[tokio::test]
    async fn test_lods_share_stored_blocks() {
        let mut vio = handle(descriptor().with_compression_ratios(vec![8, 1]));
        let region = VoxelBox::new([0; 3], [3; 3]);
        // eight ulps above one survive at ratio 1 and round away at ratio 8
        let fine = 1.0 + 2f32.powi(-20);
        let mut data = vec![fine; 64];
        data[5] = MV;
        vio.open_write(0, "salt", 1, 1).await.unwrap();
        vio.write_region(&region, &data).await.unwrap();
        vio.close().await.unwrap();

        vio.open_read(0, "salt", 1, 1).await.unwrap();
        assert_eq!(vio.read_region(&region).await.unwrap(), data);
        vio.open_read(0, "salt", 1, 0).await.unwrap();
        let coarse = vio.read_region(&region).await.unwrap();
        assert_eq!(coarse[0], 1.0);
        assert_eq!(coarse[5], MV);
        vio.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_region_round_trip_with_partial_blocks() {
        let mut vio = handle(descriptor());
        vio.open_write(0, "temp", 1, 0).await.unwrap();
        let full = VoxelBox::full([10, 9, 7]);
        vio.write_region(&full, &ramp(630)).await.unwrap();

        // patch straddling block edges
        let patch = VoxelBox::new([3, 2, 1], [5, 6, 4]);
        vio.write_region(&patch, &vec![-1.0; patch.num_voxels()])
            .await
            .unwrap();
        assert!(matches!(
            vio.write_region(&VoxelBox::new([0; 3], [10, 0, 0]), &[0.0; 11]).await,
            Err(VdfError::OutOfBounds(_))
        ));
        assert!(vio.write_region(&patch, &[0.0; 3]).await.is_err());
        vio.close().await.unwrap();
        assert!(vio.write_timer() > Duration::ZERO);
        assert!(vio.seek_timer() > Duration::ZERO);
        assert!(vio.xform_timer() > Duration::ZERO);

        assert!(vio.variable_exists(0, "temp", 1));
        // level 0 is never derived implicitly
        assert!(!vio.variable_exists(0, "temp", 0));
        assert!(matches!(
            vio.open_read(0, "temp", 0, 0).await,
            Err(VdfError::DataUnavailable { level: 0, .. })
        ));
        assert_eq!(vio.valid_region(0, "temp", 1), Some(full));

        vio.open_read(0, "temp", 1, 0).await.unwrap();
        let all = vio.read_region(&full).await.unwrap();
        for z in 0..7 {
            for y in 0..9 {
                for x in 0..10 {
                    let i = x + 10 * (y + 9 * z);
                    let expect = if patch.contains(&[x, y, z]) { -1.0 } else { i as f32 };
                    assert_eq!(all[i], expect, "voxel {:?}", [x, y, z]);
                }
            }
        }
        let sub = vio
            .read_region(&VoxelBox::new([8, 8, 6], [9, 8, 6]))
            .await
            .unwrap();
        assert_eq!(sub, vec![628.0, 629.0]);

        let blocks = vio
            .read_block_region(&VoxelBox::new([0; 3], [2, 2, 1]))
            .await
            .unwrap();
        assert_eq!(blocks.len(), 12 * 12 * 8);
        assert!(vio.read_timer() > Duration::ZERO);
        vio.reset_timers();
        assert_eq!(vio.timers(), IoTimers::default());
    }

    #[tokio::test]
    async fn test_missing_values_restored() {
        let mut vio = handle(descriptor());
        let full = VoxelBox::full([10, 9, 7]);
        let mut data = ramp(630);
        let holes = [0usize, 17, 333, 629];
        for &h in &holes {
            data[h] = MV;
        }
        // one block entirely missing
        for z in 4..7 {
            for y in 4..8 {
                for x in 8..10 {
                    data[x + 10 * (y + 9 * z)] = MV;
                }
            }
        }

        vio.open_write(1, "salt", 1, 0).await.unwrap();
        vio.write_region(&full, &data).await.unwrap();
        vio.close().await.unwrap();

        vio.open_read(1, "salt", 1, 0).await.unwrap();
        let back = vio.read_region(&full).await.unwrap();
        assert_eq!(back, data);
        vio.close().await.unwrap();

        let index = vio.availability.read().clone();
        let range = index.data_range("salt", 1).unwrap();
        assert_eq!(range.min, 1.0);
        assert_eq!(range.max, 628.0);
    }

    #[tokio::test]
    async fn test_slices_stream_along_z() {
        let mut vio = handle(descriptor());
        vio.open_write(0, "salt", 1, 0).await.unwrap();
        for z in 0..7 {
            let mut plane = vec![z as f32; 90];
            plane[z] = MV;
            vio.write_slice(&plane).await.unwrap();
        }
        assert!(matches!(
            vio.write_slice(&[0.0; 90]).await,
            Err(VdfError::OutOfBounds(_))
        ));
        vio.close().await.unwrap();

        vio.open_read(0, "salt", 1, 0).await.unwrap();
        let mut n = 0;
        while let Some(plane) = vio.read_slice().await.unwrap() {
            assert_eq!(plane.len(), 90);
            assert_eq!(plane[n], MV);
            assert_eq!(plane[(n + 1) % 90], n as f32);
            n += 1;
        }
        assert_eq!(n, 7);
        assert_eq!(vio.read_slice().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_partial_slices_flush_on_close() {
        let mut vio = handle(descriptor());
        vio.open_write(0, "temp", 1, 0).await.unwrap();
        vio.write_slice(&[1.0; 90]).await.unwrap();
        vio.write_slice(&[2.0; 90]).await.unwrap();
        vio.close().await.unwrap();
        assert_eq!(
            vio.valid_region(0, "temp", 1),
            Some(VoxelBox::new([0, 0, 0], [9, 8, 1]))
        );

        vio.open_read(0, "temp", 1, 0).await.unwrap();
        let two = vio
            .read_region(&VoxelBox::new([0, 0, 0], [9, 8, 1]))
            .await
            .unwrap();
        assert_eq!(two[89], 1.0);
        assert_eq!(two[90], 2.0);
    }

    #[tokio::test]
    async fn test_planar_variable() {
        let mut vio = handle(descriptor().with_data_type(DataType::I16));
        vio.open_write(0, "hgt", 0, 0).await.unwrap();
        assert_eq!(vio.layout().unwrap().dims, [5, 5, 1]);
        // a 3D box does not fit a planar variable
        assert!(matches!(
            vio.write_region(&VoxelBox::new([0; 3], [1, 1, 1]), &[0.0; 8]).await,
            Err(VdfError::OutOfBounds(_))
        ));
        vio.write_slice(&ramp(25)).await.unwrap();
        vio.close().await.unwrap();

        vio.open_read(0, "hgt", 0, 0).await.unwrap();
        assert_eq!(vio.read_slice().await.unwrap(), Some(ramp(25)));
        assert_eq!(vio.read_slice().await.unwrap(), None);
    }
}
