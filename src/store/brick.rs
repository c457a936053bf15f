use super::{BlockStore, ContainerFormat, VarBinding};
use crate::compression::{get_compressor, CompressionLevel, CompressionMethod, Compressor};
use crate::error::{Result, VdfError};
use crate::io::IOManager;
use crate::layout::LevelLayout;
use crate::types::DataType;
use crate::utils::brick_path;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// One compressed object per block, addressed by `brick_path`
pub struct BrickStore {
    io: Arc<dyn IOManager>,
    compressor: Box<dyn Compressor>,
    data_type: DataType,
    num_lods: usize,
    bound: Option<(VarBinding, LevelLayout)>,
}

impl BrickStore {
    pub fn new(
        io: Arc<dyn IOManager>,
        compression: CompressionMethod,
        data_type: DataType,
        num_lods: usize,
    ) -> Self {
        Self {
            io,
            compressor: get_compressor(compression),
            data_type,
            num_lods,
            bound: None,
        }
    }

    fn bound(&self) -> Result<&(VarBinding, LevelLayout)> {
        self.bound
            .as_ref()
            .ok_or_else(|| VdfError::NotOpen("brick store has no bound variable".into()))
    }

    fn path_of(&self, block: &[usize; 3]) -> Result<(String, usize)> {
        let (b, layout) = self.bound()?;
        if !layout.is_valid_region_blk(&crate::types::VoxelBox::new(*block, *block)) {
            return Err(VdfError::OutOfBounds(format!(
                "block {:?} outside block grid {:?}",
                block,
                layout.block_count()
            )));
        }
        let index = layout.block_coords_to_index(block);
        let size = layout.block_voxels() * self.data_type.size_in_bytes();
        Ok((
            brick_path(&b.variable, b.timestep, b.level, index),
            size,
        ))
    }
}

#[async_trait]
impl BlockStore for BrickStore {
    async fn open_read(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()> {
        self.bound = Some((binding.clone(), layout));
        Ok(())
    }

    async fn open_write(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()> {
        self.bound = Some((binding.clone(), layout));
        Ok(())
    }

    async fn read_block(&mut self, block: [usize; 3]) -> Result<Option<Vec<u8>>> {
        let (path, size) = self.path_of(&block)?;
        if !self.io.exists(&path).await? {
            return Ok(None);
        }
        let compressed = self.io.read(&path).await?;
        let data = self.compressor.decompress(&compressed, Some(size))?;
        if data.len() != size {
            return Err(VdfError::StorageBackend(format!(
                "brick {} holds {} bytes, expected {}",
                path,
                data.len(),
                size
            )));
        }
        trace!(path = %path, compressed = compressed.len(), "read brick");
        Ok(Some(data))
    }

    async fn write_block(&mut self, block: [usize; 3], data: &[u8]) -> Result<()> {
        let (path, size) = self.path_of(&block)?;
        if data.len() != size {
            return Err(VdfError::InvalidArgument(format!(
                "block {:?} given {} bytes, expected {}",
                block,
                data.len(),
                size
            )));
        }
        let lod = self.bound()?.0.lod;
        let level = CompressionLevel::for_lod(lod, self.num_lods);
        let compressed = self.compressor.compress(data, level)?;
        trace!(path = %path, raw = size, compressed = compressed.len(), "write brick");
        self.io.write(&path, &compressed).await
    }

    async fn close(&mut self) -> Result<()> {
        self.bound = None;
        Ok(())
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Bricked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;
    use crate::layout::BlockSize;
    use crate::types::VarKind;

    fn binding() -> VarBinding {
        VarBinding {
            timestep: 2,
            variable: "temp".into(),
            kind: VarKind::Volume3D,
            level: 1,
            lod: 0,
        }
    }

    #[tokio::test]
    async fn test_brick_round_trip() {
        let io: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        let mut store = BrickStore::new(io.clone(), CompressionMethod::Zstd, DataType::U8, 2);
        let layout = LevelLayout::new([10, 10, 10], BlockSize::cube(4).unwrap());

        assert!(matches!(
            store.read_block([0, 0, 0]).await,
            Err(VdfError::NotOpen(_))
        ));

        store.open_write(&binding(), layout).await.unwrap();
        let data: Vec<u8> = (0..64).collect();
        store.write_block([2, 0, 1], &data).await.unwrap();
        assert!(store.write_block([0, 0, 0], &data[..10]).await.is_err());
        assert!(matches!(
            store.write_block([3, 0, 0], &data).await,
            Err(VdfError::OutOfBounds(_))
        ));
        store.close().await.unwrap();

        // block (2, 0, 1) has index 2 + 3 * 3 * 1 = 11
        assert!(io
            .exists("bricks/temp/t000002/L1/00000011.brick")
            .await
            .unwrap());

        store.open_read(&binding(), layout).await.unwrap();
        assert_eq!(store.read_block([2, 0, 1]).await.unwrap(), Some(data));
        assert_eq!(store.read_block([0, 0, 0]).await.unwrap(), None);
        assert_eq!(store.format(), ContainerFormat::Bricked);
    }
}
