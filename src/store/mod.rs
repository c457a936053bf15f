//! Block storage formats.
//!
//! A [`BlockStore`] moves whole blocks of encoded samples between a bound
//! (timestep, variable, level) and persistent storage. One copy of a block
//! serves every LOD; the binding's LOD only tunes compression effort.
//! Masking, sample conversion and region assembly live above it in `vario`,
//! so every format only has to implement this capability.

mod brick;
mod slab;

pub use brick::BrickStore;
pub use slab::SlabBlockStore;

use crate::coalesce::CoalesceStats;
use crate::compression::CompressionMethod;
use crate::config::StoreConfig;
use crate::container::SlabContainer;
use crate::error::Result;
use crate::io::IOManager;
use crate::layout::LevelLayout;
use crate::types::{DataType, VarKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// On-disk organization of block data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// One compressed object per block
    #[default]
    Bricked,
    /// Row-major arrays in a chunked-array container, written through the coalescer
    Slab,
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Bricked => write!(f, "bricked"),
            ContainerFormat::Slab => write!(f, "slab"),
        }
    }
}

impl std::str::FromStr for ContainerFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bricked" | "brick" => Ok(ContainerFormat::Bricked),
            "slab" => Ok(ContainerFormat::Slab),
            other => Err(format!("unknown container format: {}", other)),
        }
    }
}

/// What an open variable handle is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarBinding {
    pub timestep: usize,
    pub variable: String,
    pub kind: VarKind,
    pub level: usize,
    pub lod: usize,
}

impl fmt::Display for VarBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (timestep {}, level {}, lod {})",
            self.variable, self.timestep, self.level, self.lod
        )
    }
}

/// Block-granular storage capability, one implementation per format
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn open_read(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()>;

    async fn open_write(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()>;

    /// Encoded samples of one full block (padding included), `None` if the
    /// block was never stored
    async fn read_block(&mut self, block: [usize; 3]) -> Result<Option<Vec<u8>>>;

    async fn write_block(&mut self, block: [usize; 3], data: &[u8]) -> Result<()>;

    /// Finish pending writes and release the binding
    async fn close(&mut self) -> Result<()>;

    fn format(&self) -> ContainerFormat;

    /// Write coalescing counters, for formats that coalesce
    fn coalesce_stats(&self) -> Option<CoalesceStats> {
        None
    }
}

/// Build the block store selected by `config`
pub fn open_block_store(
    config: &StoreConfig,
    io: Arc<dyn IOManager>,
    container: Option<Arc<dyn SlabContainer>>,
    compression: CompressionMethod,
    data_type: DataType,
    num_lods: usize,
) -> Result<Box<dyn BlockStore>> {
    match config.format {
        ContainerFormat::Bricked => Ok(Box::new(BrickStore::new(
            io,
            compression,
            data_type,
            num_lods,
        ))),
        ContainerFormat::Slab => {
            let container = container.ok_or_else(|| {
                crate::error::VdfError::Configuration(
                    "slab format needs a filesystem-backed dataset".into(),
                )
            })?;
            Ok(Box::new(SlabBlockStore::new(
                container,
                data_type,
                config.coalesce_buffer_bytes,
                config.write_mode,
            )))
        }
    }
}
