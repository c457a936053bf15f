//! Dataset descriptor: resolution hierarchy, block layout, coordinate system
//! and variable catalog of one dataset.
//!
//! Refinement levels run from 0 (coarsest) to `num_transforms` (native
//! resolution). Each step down halves every axis, rounding up for odd
//! dimensions. Voxel `v` at level `L` sits at the finest-level fractional
//! index `v * 2^d + (2^d - 1) / 2` with `d = num_transforms - L`, which is
//! what both coordinate mapping directions are built on.

use crate::compression::CompressionMethod;
use crate::error::{Result, VdfError};
use crate::layout::{BlockSize, LevelLayout};
use crate::types::{DataType, UserBox, VarKind, VoxelBox};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sentinel level meaning "the finest level present"
pub const FINEST_LEVEL: usize = usize::MAX;

/// Descriptor file format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const CURRENT: Self = Self { major: 2, minor: 1 };

    pub fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self, other: &Self) -> bool {
        self.major == other.major
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

/// How user coordinates relate to voxel indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GridKind {
    /// Evenly spaced samples between the extents
    Regular,
    /// Monotonic per-axis user coordinates of every finest-level sample
    Stretched { coords: [Vec<f64>; 3] },
    /// Terrain following: the vertical voxel count is set at run time
    Layered,
}

/// Catalog entry for a variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    pub kind: VarKind,
    /// Sentinel marking voxels with no data
    pub missing_value: Option<f32>,
}

impl VariableInfo {
    pub fn new(name: impl Into<String>, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            kind,
            missing_value: None,
        }
    }

    pub fn with_missing_value(mut self, value: f32) -> Self {
        self.missing_value = Some(value);
        self
    }
}

/// Static description of a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    /// Format version
    pub version: FormatVersion,

    /// Voxel dimensions at the finest level
    pub dimension: [usize; 3],

    /// Number of coarsening transforms; levels are `0..=num_transforms`
    pub num_transforms: usize,

    /// Block size per level; levels past the end reuse the last entry
    pub block_sizes: Vec<BlockSize>,

    /// Available compression ratios, index 0 is the most compressed
    pub compression_ratios: Vec<u32>,

    /// Compression method used for stored blocks
    pub compression: CompressionMethod,

    /// Sample type on disk
    pub data_type: DataType,

    /// Variable catalog
    pub variables: Vec<VariableInfo>,

    /// Number of timesteps
    pub num_timesteps: usize,

    /// Global extents `[xmin, ymin, zmin, xmax, ymax, zmax]`
    pub extents: [f64; 6],

    /// Extents overriding `extents` for individual timesteps
    pub ts_extents: BTreeMap<usize, [f64; 6]>,

    /// Periodic boundary per axis. Descriptive only: region resolution and
    /// voxel mapping never wrap around.
    pub periodic: [bool; 3],

    /// Axis remap for non-Cartesian coordinate systems. Descriptive only:
    /// user and voxel coordinates here are always in grid axis order, the
    /// remap is left to consumers that render the grid.
    pub grid_permutation: [usize; 3],

    pub grid: GridKind,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,

    /// Custom metadata key-value pairs
    pub custom_metadata: HashMap<String, String>,
}

impl DatasetDescriptor {
    /// Create a descriptor for a regular grid with a single level
    pub fn new(dimension: [usize; 3], extents: [f64; 6]) -> Self {
        let now = Utc::now();
        Self {
            version: FormatVersion::default(),
            dimension,
            num_transforms: 0,
            block_sizes: vec![BlockSize::default()],
            compression_ratios: vec![1],
            compression: CompressionMethod::Zstd,
            data_type: DataType::F32,
            variables: Vec::new(),
            num_timesteps: 1,
            extents,
            ts_extents: BTreeMap::new(),
            periodic: [false; 3],
            grid_permutation: [0, 1, 2],
            grid: GridKind::Regular,
            created_at: now,
            modified_at: now,
            custom_metadata: HashMap::new(),
        }
    }

    pub fn with_num_transforms(mut self, num_transforms: usize) -> Self {
        self.num_transforms = num_transforms;
        self
    }

    /// Use one block size for every level
    pub fn with_block_size(mut self, block_size: BlockSize) -> Self {
        self.block_sizes = vec![block_size];
        self
    }

    /// Per-level block sizes, index = level
    pub fn with_level_block_sizes(mut self, block_sizes: Vec<BlockSize>) -> Self {
        self.block_sizes = block_sizes;
        self
    }

    pub fn with_compression_ratios(mut self, ratios: Vec<u32>) -> Self {
        self.compression_ratios = ratios;
        self
    }

    pub fn with_compression(mut self, method: CompressionMethod) -> Self {
        self.compression = method;
        self
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_variable(mut self, variable: VariableInfo) -> Self {
        self.variables.push(variable);
        self
    }

    pub fn with_num_timesteps(mut self, num_timesteps: usize) -> Self {
        self.num_timesteps = num_timesteps;
        self
    }

    pub fn with_timestep_extents(mut self, timestep: usize, extents: [f64; 6]) -> Self {
        self.ts_extents.insert(timestep, extents);
        self
    }

    pub fn with_periodic(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    pub fn with_grid_permutation(mut self, permutation: [usize; 3]) -> Self {
        self.grid_permutation = permutation;
        self
    }

    pub fn with_grid(mut self, grid: GridKind) -> Self {
        self.grid = grid;
        self
    }

    /// Add custom metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.custom_metadata.insert(key.into(), value.into());
    }

    /// Get custom metadata
    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.custom_metadata.get(key).map(|s| s.as_str())
    }

    /// Update modification timestamp
    pub fn touch(&mut self) {
        self.modified_at = Utc::now();
    }

    /// Check internal consistency before the descriptor is persisted or used
    pub fn validate(&self) -> Result<()> {
        if self.dimension.iter().any(|&d| d == 0) {
            return Err(VdfError::InvalidArgument(format!(
                "Dataset dimensions must be non-zero, got {:?}",
                self.dimension
            )));
        }
        if self.block_sizes.is_empty() {
            return Err(VdfError::InvalidArgument("No block size given".into()));
        }
        if self.compression_ratios.is_empty() {
            return Err(VdfError::InvalidArgument(
                "At least one compression ratio is required".into(),
            ));
        }
        if self.num_timesteps == 0 {
            return Err(VdfError::InvalidArgument("Dataset has no timesteps".into()));
        }
        for ext in std::iter::once(&self.extents).chain(self.ts_extents.values()) {
            if (0..3).any(|i| !(ext[i] <= ext[i + 3])) {
                return Err(VdfError::InvalidArgument(format!(
                    "Extents must satisfy min <= max, got {:?}",
                    ext
                )));
            }
        }
        let mut perm = self.grid_permutation;
        perm.sort_unstable();
        if perm != [0, 1, 2] {
            return Err(VdfError::InvalidArgument(format!(
                "Grid permutation {:?} is not a permutation of the axes",
                self.grid_permutation
            )));
        }
        let mut seen = HashSet::new();
        for var in &self.variables {
            if !seen.insert(var.name.as_str()) {
                return Err(VdfError::InvalidArgument(format!(
                    "Variable {} declared twice",
                    var.name
                )));
            }
        }
        if let GridKind::Stretched { coords } = &self.grid {
            for (axis, c) in coords.iter().enumerate() {
                if c.len() != self.dimension[axis] {
                    return Err(VdfError::InvalidArgument(format!(
                        "Stretched axis {} has {} coordinates for {} samples",
                        axis,
                        c.len(),
                        self.dimension[axis]
                    )));
                }
                if c.windows(2).any(|w| !(w[0] < w[1])) {
                    return Err(VdfError::InvalidArgument(format!(
                        "Stretched axis {} coordinates must be strictly increasing",
                        axis
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn num_transforms(&self) -> usize {
        self.num_transforms
    }

    /// Clamp a level into `0..=num_transforms`; `FINEST_LEVEL` and any
    /// other out-of-range value resolve to the finest level.
    pub fn normalize_level(&self, level: usize) -> usize {
        level.min(self.num_transforms)
    }

    /// Clamp a compression (LOD) index into the available ratios
    pub fn normalize_lod(&self, lod: usize) -> usize {
        lod.min(self.compression_ratios.len().saturating_sub(1))
    }

    pub fn compression_ratio(&self, lod: usize) -> u32 {
        self.compression_ratios
            .get(self.normalize_lod(lod))
            .copied()
            .unwrap_or(1)
    }

    pub fn is_layered(&self) -> bool {
        matches!(self.grid, GridKind::Layered)
    }

    pub fn bytes_per_voxel(&self) -> usize {
        self.data_type.size_in_bytes()
    }

    /// Voxel dimensions at `level`
    pub fn dim(&self, level: usize) -> [usize; 3] {
        self.dim_with_height(level, None)
    }

    /// Voxel dimensions at `level`, with an optional finest-level vertical
    /// voxel count replacing the nominal one (layered grids).
    pub fn dim_with_height(&self, level: usize, full_height: Option<usize>) -> [usize; 3] {
        let shift = self.num_transforms - self.normalize_level(level);
        let mut finest = self.dimension;
        if let Some(h) = full_height {
            finest[2] = h;
        }
        finest.map(|d| shift_dim(d, shift))
    }

    pub fn block_size(&self, level: usize) -> BlockSize {
        let level = self.normalize_level(level);
        self.block_sizes
            .get(level)
            .or_else(|| self.block_sizes.last())
            .copied()
            .unwrap_or_default()
    }

    /// Dimensions in blocks, `ceil(dim / block_size)`
    pub fn dim_in_blocks(&self, level: usize) -> [usize; 3] {
        self.layout(level).block_count()
    }

    pub fn layout(&self, level: usize) -> LevelLayout {
        LevelLayout::new(self.dim(level), self.block_size(level))
    }

    /// Voxel dimensions of a variable of `kind` at `level`
    pub fn dim_for(&self, kind: VarKind, level: usize) -> [usize; 3] {
        kind.collapse(self.dim(level))
    }

    /// Layout of a variable of `kind`: planar kinds have extent 1 and
    /// block size 1 along their collapsed axis.
    pub fn layout_for(
        &self,
        kind: VarKind,
        level: usize,
        full_height: Option<usize>,
    ) -> LevelLayout {
        LevelLayout {
            dims: kind.collapse(self.dim_with_height(level, full_height)),
            block: kind.collapse(self.block_size(level).dims()),
        }
    }

    pub fn extents_at(&self, timestep: usize) -> [f64; 6] {
        self.ts_extents
            .get(&timestep)
            .copied()
            .unwrap_or(self.extents)
    }

    pub fn user_bounds(&self, timestep: usize) -> UserBox {
        UserBox::from_extents(&self.extents_at(timestep))
    }

    /// Map a voxel at `level` to user coordinates
    pub fn map_vox_to_user(&self, timestep: usize, level: usize, vox: &[usize; 3]) -> [f64; 3] {
        self.map_vox_to_user_with_height(timestep, level, vox, None)
    }

    pub fn map_vox_to_user_with_height(
        &self,
        timestep: usize,
        level: usize,
        vox: &[usize; 3],
        full_height: Option<usize>,
    ) -> [f64; 3] {
        let finest = self.dim_with_height(FINEST_LEVEL, full_height);
        let stride = self.level_stride(level);
        let mut out = [0.0; 3];
        for axis in 0..3 {
            let f = vox[axis] as f64 * stride + 0.5 * (stride - 1.0);
            out[axis] = self.finest_index_to_user(timestep, axis, f, finest[axis]);
        }
        out
    }

    /// Map user coordinates to the nearest voxel at `level`, clamped to the grid
    pub fn map_user_to_vox(&self, timestep: usize, level: usize, user: &[f64; 3]) -> [usize; 3] {
        self.map_user_to_vox_with_height(timestep, level, user, None)
    }

    pub fn map_user_to_vox_with_height(
        &self,
        timestep: usize,
        level: usize,
        user: &[f64; 3],
        full_height: Option<usize>,
    ) -> [usize; 3] {
        let finest = self.dim_with_height(FINEST_LEVEL, full_height);
        let dims = self.dim_with_height(level, full_height);
        let stride = self.level_stride(level);
        let mut out = [0; 3];
        for axis in 0..3 {
            let f = self.user_to_finest_index(timestep, axis, user[axis], finest[axis]);
            let v = ((f - 0.5 * (stride - 1.0)) / stride).round().max(0.0) as usize;
            out[axis] = v.min(dims[axis] - 1);
        }
        out
    }

    pub fn map_vox_to_blk(&self, level: usize, vox: &[usize; 3]) -> [usize; 3] {
        self.layout(level).vox_to_blk(vox)
    }

    pub fn map_user_to_blk(&self, timestep: usize, level: usize, user: &[f64; 3]) -> [usize; 3] {
        let vox = self.map_user_to_vox(timestep, level, user);
        self.map_vox_to_blk(level, &vox)
    }

    /// True iff `region` is ordered and lies within `[0, dim(level))`
    pub fn is_valid_region(&self, level: usize, region: &VoxelBox) -> bool {
        self.layout(level).is_valid_region(region)
    }

    /// Block-coordinate counterpart of `is_valid_region`
    pub fn is_valid_region_blk(&self, level: usize, blocks: &VoxelBox) -> bool {
        self.layout(level).is_valid_region_blk(blocks)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableInfo> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn var_kind(&self, name: &str) -> Result<VarKind> {
        self.variable(name)
            .map(|v| v.kind)
            .ok_or_else(|| VdfError::InvalidArgument(format!("Unknown variable: {}", name)))
    }

    pub fn missing_value(&self, name: &str) -> Option<f32> {
        self.variable(name).and_then(|v| v.missing_value)
    }

    pub fn variable_names(&self) -> Vec<&str> {
        self.variables.iter().map(|v| v.name.as_str()).collect()
    }

    pub fn variables_of_kind(&self, kind: VarKind) -> Vec<&str> {
        self.variables
            .iter()
            .filter(|v| v.kind == kind)
            .map(|v| v.name.as_str())
            .collect()
    }

    /// Get a summary string of the descriptor
    pub fn summary(&self) -> String {
        let d = self.dimension;
        format!(
            "{} x {} x {} ({}), {} levels, {} variables, {} timesteps, {:.2} MB per full-resolution volume",
            d[0],
            d[1],
            d[2],
            self.data_type,
            self.num_transforms + 1,
            self.variables.len(),
            self.num_timesteps,
            (d.iter().product::<usize>() * self.bytes_per_voxel()) as f64 / (1024.0 * 1024.0)
        )
    }

    fn level_stride(&self, level: usize) -> f64 {
        let shift = self.num_transforms - self.normalize_level(level);
        (1u64 << shift.min(62)) as f64
    }

    fn stretched_axis(&self, axis: usize, finest_dim: usize) -> Option<&[f64]> {
        match &self.grid {
            GridKind::Stretched { coords } if coords[axis].len() == finest_dim && finest_dim > 1 => {
                Some(&coords[axis])
            }
            _ => None,
        }
    }

    fn finest_index_to_user(&self, timestep: usize, axis: usize, f: f64, finest_dim: usize) -> f64 {
        if let Some(c) = self.stretched_axis(axis, finest_dim) {
            let k = (f.floor().max(0.0) as usize).min(c.len() - 2);
            let t = f - k as f64;
            return c[k] + t * (c[k + 1] - c[k]);
        }
        let ext = self.extents_at(timestep);
        if finest_dim <= 1 {
            return ext[axis];
        }
        ext[axis] + f * (ext[axis + 3] - ext[axis]) / (finest_dim - 1) as f64
    }

    fn user_to_finest_index(&self, timestep: usize, axis: usize, u: f64, finest_dim: usize) -> f64 {
        if let Some(c) = self.stretched_axis(axis, finest_dim) {
            let u = u.clamp(c[0], c[c.len() - 1]);
            let k = c.partition_point(|&x| x <= u).saturating_sub(1).min(c.len() - 2);
            return k as f64 + (u - c[k]) / (c[k + 1] - c[k]);
        }
        let ext = self.extents_at(timestep);
        let span = ext[axis + 3] - ext[axis];
        if finest_dim <= 1 || span <= 0.0 {
            return 0.0;
        }
        let a = ((u - ext[axis]) / span).clamp(0.0, 1.0);
        a * (finest_dim - 1) as f64
    }
}

/// `ceil(d / 2^shift)`, never below one voxel
fn shift_dim(d: usize, shift: usize) -> usize {
    if shift >= usize::BITS as usize {
        return 1;
    }
    let mut v = d >> shift;
    if (v << shift) < d {
        v += 1;
    }
    v.max(1)
}
