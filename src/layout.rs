//! Block layout - how a volume at one refinement level is divided into blocks

use crate::error::{Result, VdfError};
use crate::types::VoxelBox;
use serde::{Deserialize, Serialize};

/// Size of a block in voxels along each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize {
    dims: [usize; 3],
}

impl BlockSize {
    /// Create a new block size
    pub fn new(dims: [usize; 3]) -> Result<Self> {
        if dims.iter().any(|&d| d == 0) {
            return Err(VdfError::InvalidArgument(format!(
                "Block size must be non-zero on every axis, got {:?}",
                dims
            )));
        }
        Ok(Self { dims })
    }

    /// Cubic block of `size` voxels per side
    pub fn cube(size: usize) -> Result<Self> {
        Self::new([size; 3])
    }

    /// Get the size along an axis
    pub fn get(&self, axis: usize) -> usize {
        if axis < 3 {
            self.dims[axis]
        } else {
            1
        }
    }

    /// Get all dimensions
    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Total number of voxels in a block
    pub fn total_voxels(&self) -> usize {
        self.dims.iter().product()
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self { dims: [32, 32, 32] }
    }
}

/// Geometry of one variable at one refinement level: voxel extent plus block tiling.
///
/// Voxel buffers use x-fastest ordering, `index = x + nx * (y + ny * z)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelLayout {
    /// Volume dimensions in voxels
    pub dims: [usize; 3],
    /// Block dimensions in voxels
    pub block: [usize; 3],
}

impl LevelLayout {
    pub fn new(dims: [usize; 3], block: BlockSize) -> Self {
        Self {
            dims,
            block: block.dims(),
        }
    }

    /// Get the number of blocks along each axis
    pub fn block_count(&self) -> [usize; 3] {
        let mut out = [0; 3];
        for i in 0..3 {
            out[i] = self.dims[i].div_ceil(self.block[i]);
        }
        out
    }

    /// Get the total number of blocks
    pub fn total_blocks(&self) -> usize {
        self.block_count().iter().product()
    }

    pub fn block_voxels(&self) -> usize {
        self.block.iter().product()
    }

    /// Convert a block index to block coordinates
    pub fn block_index_to_coords(&self, index: usize) -> [usize; 3] {
        let bc = self.block_count();
        [index % bc[0], (index / bc[0]) % bc[1], index / (bc[0] * bc[1])]
    }

    /// Convert block coordinates to a block index
    pub fn block_coords_to_index(&self, coords: &[usize; 3]) -> usize {
        let bc = self.block_count();
        coords[0] + bc[0] * (coords[1] + bc[1] * coords[2])
    }

    /// Block containing a voxel
    pub fn vox_to_blk(&self, vox: &[usize; 3]) -> [usize; 3] {
        [
            vox[0] / self.block[0],
            vox[1] / self.block[1],
            vox[2] / self.block[2],
        ]
    }

    /// Block range containing a voxel box
    pub fn blocks_for(&self, region: &VoxelBox) -> VoxelBox {
        VoxelBox::new(self.vox_to_blk(&region.min), self.vox_to_blk(&region.max))
    }

    /// Voxel range covered by a block range, including padding past the domain edge
    pub fn block_voxel_box(&self, blocks: &VoxelBox) -> VoxelBox {
        let mut out = VoxelBox::new([0; 3], [0; 3]);
        for i in 0..3 {
            out.min[i] = blocks.min[i] * self.block[i];
            out.max[i] = (blocks.max[i] + 1) * self.block[i] - 1;
        }
        out
    }

    /// In-domain voxel range of a single block as `(start, end)` pairs (end exclusive)
    pub fn block_data_range(&self, block: &[usize; 3]) -> [(usize, usize); 3] {
        let mut out = [(0, 0); 3];
        for i in 0..3 {
            let start = block[i] * self.block[i];
            let end = (start + self.block[i]).min(self.dims[i]);
            out[i] = (start, end);
        }
        out
    }

    /// Check if voxel coordinates are within bounds
    pub fn is_in_bounds(&self, vox: &[usize; 3]) -> bool {
        (0..3).all(|i| vox[i] < self.dims[i])
    }

    /// Check that a voxel box is ordered and inside `[0, dims)`
    pub fn is_valid_region(&self, region: &VoxelBox) -> bool {
        region.is_ordered() && self.is_in_bounds(&region.max)
    }

    /// Check that a block box is ordered and inside the block grid
    pub fn is_valid_region_blk(&self, blocks: &VoxelBox) -> bool {
        let bc = self.block_count();
        blocks.is_ordered() && (0..3).all(|i| blocks.max[i] < bc[i])
    }
}
