use super::{BlockStore, ContainerFormat, VarBinding};
use crate::coalesce::{CoalesceStats, WriteCoalescer};
use crate::container::{SlabContainer, WriteMode};
use crate::error::{Result, VdfError};
use crate::layout::LevelLayout;
use crate::types::DataType;
use crate::utils::slab_var_name;
use async_trait::async_trait;
use bitvec::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// One block layer (the blocks sharing a z block index), kept in container
/// order until every block of it has arrived
struct StagedLayer {
    z0: usize,
    nz: usize,
    /// `[nz, ny, nx]` in-domain samples
    data: Vec<u8>,
    /// Blocks received, x fastest
    received: BitVec,
}

struct SlabBinding {
    name: String,
    layout: LevelLayout,
    coalescer: Option<WriteCoalescer>,
    staged: BTreeMap<usize, StagedLayer>,
}

/// Each (variable, timestep, level) is one `[nz, ny, nx]` container
/// variable. Written blocks are staged per block layer; a complete layer
/// goes to the [`WriteCoalescer`] as full-width rows, which merge into one
/// container write.
pub struct SlabBlockStore {
    container: Arc<dyn SlabContainer>,
    data_type: DataType,
    buffer_bytes: usize,
    mode: WriteMode,
    bound: Option<SlabBinding>,
    last_stats: Option<CoalesceStats>,
}

impl SlabBlockStore {
    pub fn new(
        container: Arc<dyn SlabContainer>,
        data_type: DataType,
        buffer_bytes: usize,
        mode: WriteMode,
    ) -> Self {
        Self {
            container,
            data_type,
            buffer_bytes,
            mode,
            bound: None,
            last_stats: None,
        }
    }

    fn bound_mut(&mut self) -> Result<&mut SlabBinding> {
        self.bound
            .as_mut()
            .ok_or_else(|| VdfError::NotOpen("slab store has no bound variable".into()))
    }

    fn block_geometry(layout: &LevelLayout, block: &[usize; 3]) -> Result<[(usize, usize); 3]> {
        let bc = layout.block_count();
        if (0..3).any(|i| block[i] >= bc[i]) {
            return Err(VdfError::OutOfBounds(format!(
                "block {:?} outside block grid {:?}",
                block, bc
            )));
        }
        Ok(layout.block_data_range(block))
    }
}

fn container_dims(layout: &LevelLayout) -> Vec<usize> {
    vec![layout.dims[2], layout.dims[1], layout.dims[0]]
}

/// Hand a staged layer to the coalescer. A complete layer goes out as
/// full-width rows; a partial one only as the rows of the blocks it holds.
async fn emit_layer(
    coalescer: &mut WriteCoalescer,
    layout: &LevelLayout,
    layer: &StagedLayer,
    es: usize,
) -> Result<()> {
    let [nx, ny, _] = layout.dims;
    if layer.received.all() {
        let row = nx * es;
        for lz in 0..layer.nz {
            for y in 0..ny {
                let off = (lz * ny + y) * row;
                coalescer
                    .put_vara(&[layer.z0 + lz, y, 0], &[1, 1, nx], &layer.data[off..off + row])
                    .await?;
            }
        }
        return Ok(());
    }

    let bcx = layout.block_count()[0];
    let [bx, by, _] = layout.block;
    trace!(z0 = layer.z0, blocks = layer.received.count_ones(), "emitting partial layer");
    for lz in 0..layer.nz {
        for y in 0..ny {
            for xb in 0..bcx {
                if !layer.received[xb + bcx * (y / by)] {
                    continue;
                }
                let x0 = xb * bx;
                let len = (x0 + bx).min(nx) - x0;
                let off = ((lz * ny + y) * nx + x0) * es;
                coalescer
                    .put_vara(
                        &[layer.z0 + lz, y, x0],
                        &[1, 1, len],
                        &layer.data[off..off + len * es],
                    )
                    .await?;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl BlockStore for SlabBlockStore {
    async fn open_read(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()> {
        self.bound = Some(SlabBinding {
            name: slab_var_name(&binding.variable, binding.timestep, binding.level),
            layout,
            coalescer: None,
            staged: BTreeMap::new(),
        });
        Ok(())
    }

    async fn open_write(&mut self, binding: &VarBinding, layout: LevelLayout) -> Result<()> {
        let name = slab_var_name(&binding.variable, binding.timestep, binding.level);
        let es = self.data_type.size_in_bytes();
        let dims = container_dims(&layout);
        self.container.define_var(&name, &dims, es).await?;
        let coalescer = WriteCoalescer::new(
            self.container.clone(),
            name.clone(),
            dims,
            es,
            self.buffer_bytes,
            self.mode,
        )?;
        self.bound = Some(SlabBinding {
            name,
            layout,
            coalescer: Some(coalescer),
            staged: BTreeMap::new(),
        });
        Ok(())
    }

    async fn read_block(&mut self, block: [usize; 3]) -> Result<Option<Vec<u8>>> {
        let es = self.data_type.size_in_bytes();
        let container = self.container.clone();
        let bound = self.bound_mut()?;
        let range = Self::block_geometry(&bound.layout, &block)?;
        let [(x0, x1), (y0, y1), (z0, z1)] = range;
        let (nx, ny, nz) = (x1 - x0, y1 - y0, z1 - z0);
        let [bx, by, _] = bound.layout.block;
        let [dx, dy, _] = bound.layout.dims;
        let bcx = bound.layout.block_count()[0];
        let mut out = vec![0u8; bound.layout.block_voxels() * es];

        if let Some(layer) = bound.staged.get(&block[2]) {
            if layer.received[block[0] + bcx * block[1]] {
                for lz in 0..nz {
                    for ly in 0..ny {
                        let src = ((lz * dy + y0 + ly) * dx + x0) * es;
                        let dst = (lz * by + ly) * bx * es;
                        out[dst..dst + nx * es].copy_from_slice(&layer.data[src..src + nx * es]);
                    }
                }
                return Ok(Some(out));
            }
        }

        // reads must see everything written so far
        if let Some(c) = bound.coalescer.as_mut() {
            c.flush().await?;
        }
        if container.var_shape(&bound.name).await?.is_none() {
            return Ok(None);
        }
        let slab = container
            .get_vara(&bound.name, &[z0, y0, x0], &[nz, ny, nx])
            .await?;
        for lz in 0..nz {
            for ly in 0..ny {
                let src = (lz * ny + ly) * nx * es;
                let dst = (lz * by + ly) * bx * es;
                out[dst..dst + nx * es].copy_from_slice(&slab[src..src + nx * es]);
            }
        }
        Ok(Some(out))
    }

    async fn write_block(&mut self, block: [usize; 3], data: &[u8]) -> Result<()> {
        let es = self.data_type.size_in_bytes();
        let bound = self.bound_mut()?;
        let range = Self::block_geometry(&bound.layout, &block)?;
        let expected = bound.layout.block_voxels() * es;
        if data.len() != expected {
            return Err(VdfError::InvalidArgument(format!(
                "block {:?} given {} bytes, expected {}",
                block,
                data.len(),
                expected
            )));
        }
        let layout = bound.layout;
        let coalescer = bound
            .coalescer
            .as_mut()
            .ok_or_else(|| VdfError::NotOpen(format!("{} is not open for write", bound.name)))?;

        let [(x0, x1), (y0, y1), (z0, z1)] = range;
        let [bx, by, _] = layout.block;
        let [dx, dy, _] = layout.dims;
        let [bcx, bcy, _] = layout.block_count();
        let layer = bound.staged.entry(block[2]).or_insert_with(|| StagedLayer {
            z0,
            nz: z1 - z0,
            data: vec![0u8; (z1 - z0) * dy * dx * es],
            received: BitVec::repeat(false, bcx * bcy),
        });
        let nx = x1 - x0;
        for lz in 0..z1 - z0 {
            for ly in 0..y1 - y0 {
                let src = (lz * by + ly) * bx * es;
                let dst = ((lz * dy + y0 + ly) * dx + x0) * es;
                layer.data[dst..dst + nx * es].copy_from_slice(&data[src..src + nx * es]);
            }
        }
        layer.received.set(block[0] + bcx * block[1], true);

        if layer.received.all() {
            if let Some(layer) = bound.staged.remove(&block[2]) {
                emit_layer(coalescer, &layout, &layer, es).await?;
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let es = self.data_type.size_in_bytes();
        let Some(mut bound) = self.bound.take() else {
            return Ok(());
        };
        if let Some(c) = bound.coalescer.as_mut() {
            let mut flushed = Ok(());
            for layer in bound.staged.values() {
                flushed = emit_layer(c, &bound.layout, layer, es).await;
                if flushed.is_err() {
                    break;
                }
            }
            if flushed.is_ok() {
                flushed = c.flush().await;
            }
            let stats = c.stats();
            debug!(
                var = %bound.name,
                puts = stats.puts,
                writes = stats.total_writes(),
                direct = stats.direct_writes,
                "closed slab variable"
            );
            self.last_stats = Some(stats);
            flushed?;
        }
        Ok(())
    }

    fn format(&self) -> ContainerFormat {
        ContainerFormat::Slab
    }

    fn coalesce_stats(&self) -> Option<CoalesceStats> {
        self.bound
            .as_ref()
            .and_then(|b| b.coalescer.as_ref())
            .map(|c| c.stats())
            .or(self.last_stats)
    }
}
