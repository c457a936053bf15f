//! VDF Store - multi-resolution volumetric data storage
//!
//! A block-structured store for gridded scientific variables kept at several
//! refinement levels and lossy compression LODs.
//!
//! # Features
//!
//! - Refinement levels `0..=N` over regular, stretched and layered grids
//! - 3D and planar (XY, XZ, YZ) variables
//! - Missing-value masks stored beside the blocks
//! - Region resolution with coarser-level fallback and a cache budget
//! - Bricked (one compressed object per block) and slab containers, the
//!   latter fed by a write coalescer
//! - Async I/O throughout
//!
//! # Example
//!
//! ```rust,ignore
//! use vdfstore::{Dataset, ResolveRequest, StoreConfig, UserBox};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ds = Dataset::open("file:///data/ocean", StoreConfig::from_env()?).await?;
//! let req = ResolveRequest::new(UserBox::new([0.0; 3], [10.0; 3]), 2, 0).with_variable("temp");
//! let region = ds.resolve(&req)?;
//! let temp = ds.read_resolved(&region, "temp", 0).await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod availability;
pub mod bitmask;
pub mod coalesce;
pub mod compression;
pub mod config;
pub mod container;
pub mod error;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod pyramid;
pub mod resolver;
pub mod session;
pub mod store;
pub mod types;
pub mod utils;
pub mod vario;

// Re-exports
pub use access::{Dataset, DatasetStats};
pub use availability::{Availability, AvailabilityIndex};
pub use coalesce::{CoalesceStats, WriteCoalescer};
pub use compression::{CompressionMethod, Compressor};
pub use config::StoreConfig;
pub use container::{FileSlabContainer, SlabContainer, WriteMode};
pub use error::{Result, VdfError};
pub use io::{IOManager, StorageBackend};
pub use layout::{BlockSize, LevelLayout};
pub use metadata::{DatasetDescriptor, GridKind, VariableInfo};
pub use pyramid::{BoxFilter, LevelTransform};
pub use resolver::{
    LevelPolicy, PointSample, RegionResolver, RegionState, ResolveRequest, ResolvedRegion,
};
pub use session::DatasetSession;
pub use store::{BlockStore, ContainerFormat};
pub use types::{DataType, UserBox, ValueRange, VarKind, VoxelBox};
pub use vario::{IoMode, VariableIo};

/// Version of the VDF store implementation
pub const VDFSTORE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VDFSTORE_VERSION.is_empty());
    }
}
