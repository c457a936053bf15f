//! Core data types for the VDF store

use serde::{Deserialize, Serialize};
use std::fmt;

/// On-disk sample types supported by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    /// Unsigned 8-bit integer
    U8 = 1,
    /// Signed 16-bit integer
    I16 = 6,
    /// 32-bit floating point
    F32 = 9,
    /// 64-bit floating point
    F64 = 10,
}

impl DataType {
    /// Size in bytes of this data type
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::I16 => 2,
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }

    /// Check if this is a floating point type
    pub fn is_float(&self) -> bool {
        matches!(self, DataType::F32 | DataType::F64)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Shape of a variable: a full volume or a plane aligned with two axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    Volume3D,
    Plane2DXY,
    Plane2DXZ,
    Plane2DYZ,
}

impl VarKind {
    pub fn is_planar(&self) -> bool {
        !matches!(self, VarKind::Volume3D)
    }

    /// The axis a planar variable has no extent along
    pub fn collapsed_axis(&self) -> Option<usize> {
        match self {
            VarKind::Volume3D => None,
            VarKind::Plane2DXY => Some(2),
            VarKind::Plane2DXZ => Some(1),
            VarKind::Plane2DYZ => Some(0),
        }
    }

    /// Collapse a 3-vector of extents to this kind's shape
    pub fn collapse(&self, mut dims: [usize; 3]) -> [usize; 3] {
        if let Some(axis) = self.collapsed_axis() {
            dims[axis] = 1;
        }
        dims
    }
}

/// Inclusive box in voxel (or block) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VoxelBox {
    pub min: [usize; 3],
    pub max: [usize; 3],
}

impl VoxelBox {
    pub fn new(min: [usize; 3], max: [usize; 3]) -> Self {
        Self { min, max }
    }

    /// Box covering `[0, dims)` on every axis
    pub fn full(dims: [usize; 3]) -> Self {
        Self {
            min: [0; 3],
            max: [
                dims[0].saturating_sub(1),
                dims[1].saturating_sub(1),
                dims[2].saturating_sub(1),
            ],
        }
    }

    pub fn is_ordered(&self) -> bool {
        (0..3).all(|i| self.min[i] <= self.max[i])
    }

    /// Extent along each axis (inclusive bounds, so a point has extent 1)
    pub fn dims(&self) -> [usize; 3] {
        [
            self.max[0] + 1 - self.min[0],
            self.max[1] + 1 - self.min[1],
            self.max[2] + 1 - self.min[2],
        ]
    }

    pub fn num_voxels(&self) -> usize {
        self.dims().iter().product()
    }

    pub fn contains(&self, p: &[usize; 3]) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }

    pub fn contains_box(&self, other: &VoxelBox) -> bool {
        self.contains(&other.min) && self.contains(&other.max)
    }

    /// Component-wise intersection; `None` when empty on any axis
    pub fn intersect(&self, other: &VoxelBox) -> Option<VoxelBox> {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = self.min[i].max(other.min[i]);
            out.max[i] = self.max[i].min(other.max[i]);
            if out.min[i] > out.max[i] {
                return None;
            }
        }
        Some(out)
    }

    /// Smallest box containing both
    pub fn union(&self, other: &VoxelBox) -> VoxelBox {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = self.min[i].min(other.min[i]);
            out.max[i] = self.max[i].max(other.max[i]);
        }
        out
    }
}

impl fmt::Display for VoxelBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}-{:?}", self.min, self.max)
    }
}

/// Box in continuous user coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl UserBox {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// Build from `[xmin, ymin, zmin, xmax, ymax, zmax]`
    pub fn from_extents(extents: &[f64; 6]) -> Self {
        Self {
            min: [extents[0], extents[1], extents[2]],
            max: [extents[3], extents[4], extents[5]],
        }
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }

    pub fn size(&self) -> [f64; 3] {
        [
            self.max[0] - self.min[0],
            self.max[1] - self.min[1],
            self.max[2] - self.min[2],
        ]
    }

    /// Clamp every bound into `bounds`, keeping min <= max
    pub fn clamp_to(&self, bounds: &UserBox) -> UserBox {
        let mut out = *self;
        for i in 0..3 {
            out.min[i] = out.min[i].clamp(bounds.min[i], bounds.max[i]);
            out.max[i] = out.max[i].clamp(bounds.min[i], bounds.max[i]);
            if out.min[i] > out.max[i] {
                out.min[i] = out.max[i];
            }
        }
        out
    }

    pub fn contains_point(&self, p: &[f64; 3]) -> bool {
        (0..3).all(|i| self.min[i] <= p[i] && p[i] <= self.max[i])
    }
}

/// Value range for a variable
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }

    /// Widen to include `value`
    pub fn include(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    pub fn merge(&self, other: &ValueRange) -> ValueRange {
        ValueRange::new(self.min.min(other.min), self.max.max(other.max))
    }
}
