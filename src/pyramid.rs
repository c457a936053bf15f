//! Coarser level generation.
//!
//! Level `L - 1` is derived from level `L` one z plane at a time: up to two
//! fine planes are reduced into one coarse plane by a [`LevelTransform`].
//! Every non-collapsed axis halves (rounding up), so a fine plane of
//! `[nx, ny]` maps to `[ceil(nx / 2), ceil(ny / 2)]`.

use crate::bitmask::is_missing;
use crate::error::{Result, VdfError};
use crate::vario::VariableIo;
use tracing::{debug, info};

/// Reduction from one refinement level to the next coarser one
pub trait LevelTransform: Send + Sync {
    /// Reduce `planes` (one or two consecutive fine z planes, x fastest,
    /// each `fine[0] * fine[1]` samples) into one coarse plane of
    /// `coarse[0] * coarse[1]` samples.
    fn reduce(
        &self,
        planes: &[&[f32]],
        fine: [usize; 2],
        coarse: [usize; 2],
        missing: Option<f32>,
    ) -> Vec<f32>;

    fn name(&self) -> &str;
}

/// Averages each 2 x 2 (x 2) cell, ignoring missing samples. A cell with
/// no present sample takes the missing value, or 0 without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct BoxFilter;

fn factor(fine: usize, coarse: usize) -> usize {
    if coarse < fine {
        2
    } else {
        1
    }
}

impl LevelTransform for BoxFilter {
    fn reduce(
        &self,
        planes: &[&[f32]],
        fine: [usize; 2],
        coarse: [usize; 2],
        missing: Option<f32>,
    ) -> Vec<f32> {
        let (fx, fy) = (factor(fine[0], coarse[0]), factor(fine[1], coarse[1]));
        let mut out = Vec::with_capacity(coarse[0] * coarse[1]);
        for cy in 0..coarse[1] {
            for cx in 0..coarse[0] {
                let mut sum = 0.0f64;
                let mut n = 0usize;
                for plane in planes {
                    for y in cy * fy..((cy + 1) * fy).min(fine[1]) {
                        for x in cx * fx..((cx + 1) * fx).min(fine[0]) {
                            let v = plane[x + fine[0] * y];
                            if missing.is_some_and(|mv| is_missing(v, mv)) {
                                continue;
                            }
                            sum += v as f64;
                            n += 1;
                        }
                    }
                }
                out.push(if n == 0 {
                    missing.unwrap_or(0.0)
                } else {
                    (sum / n as f64) as f32
                });
            }
        }
        out
    }

    fn name(&self) -> &str {
        "box"
    }
}

/// Derive `level - 1` of `variable` from `level`. `src` and `dst` must be
/// closed; both are closed again on success. Returns the number of coarse
/// planes written.
pub async fn build_coarser_level(
    src: &mut VariableIo,
    dst: &mut VariableIo,
    transform: &dyn LevelTransform,
    timestep: usize,
    variable: &str,
    level: usize,
    lod: usize,
) -> Result<usize> {
    let level = src.descriptor().normalize_level(level);
    if level == 0 {
        return Err(VdfError::InvalidArgument(format!(
            "{} has no level coarser than 0",
            variable
        )));
    }
    let missing = src.descriptor().missing_value(variable);

    src.open_read(timestep, variable, level, lod).await?;
    dst.open_write(timestep, variable, level - 1, lod).await?;
    let fine = src.layout()?.dims;
    let coarse = dst.layout()?.dims;
    let fz = factor(fine[2], coarse[2]);
    debug!(
        variable,
        level,
        transform = transform.name(),
        ?fine,
        ?coarse,
        "building coarser level"
    );

    let mut written = 0;
    loop {
        let mut planes = Vec::with_capacity(fz);
        while planes.len() < fz {
            match src.read_slice().await? {
                Some(p) => planes.push(p),
                None => break,
            }
        }
        if planes.is_empty() {
            break;
        }
        let refs: Vec<&[f32]> = planes.iter().map(|p| p.as_slice()).collect();
        let plane = transform.reduce(&refs, [fine[0], fine[1]], [coarse[0], coarse[1]], missing);
        dst.write_slice(&plane).await?;
        written += 1;
    }

    src.close().await?;
    dst.close().await?;
    info!(variable, timestep, from = level, to = level - 1, planes = written, "built coarser level");
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityIndex;
    use crate::compression::CompressionMethod;
    use crate::io::{IOManager, MemoryIOManager};
    use crate::layout::BlockSize;
    use crate::metadata::{DatasetDescriptor, VariableInfo};
    use crate::session::DatasetSession;
    use crate::store::BrickStore;
    use crate::types::{VarKind, VoxelBox};
    use parking_lot::RwLock;
    use std::sync::Arc;

    const MV: f32 = -1.0;

    fn pair(d: DatasetDescriptor) -> (VariableIo, VariableIo) {
        let d = Arc::new(d);
        let session = Arc::new(DatasetSession::new(d.clone(), 1 << 20));
        let io: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        let availability = Arc::new(RwLock::new(AvailabilityIndex::new()));
        let make = || {
            VariableIo::new(
                session.clone(),
                Box::new(BrickStore::new(io.clone(), d.compression, d.data_type, 1)),
                io.clone(),
                availability.clone(),
            )
        };
        (make(), make())
    }

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new([5, 4, 3], [0.0, 0.0, 0.0, 4.0, 3.0, 2.0])
            .with_num_transforms(1)
            .with_block_size(BlockSize::cube(4).unwrap())
            .with_compression(CompressionMethod::Zstd)
            .with_variable(VariableInfo::new("p", VarKind::Volume3D).with_missing_value(MV))
            .with_variable(VariableInfo::new("sst", VarKind::Plane2DXY))
    }

    #[test]
    fn test_box_filter_skips_missing() {
        let a = [1.0, 3.0, 5.0, 7.0, MV, MV];
        let b = [2.0, 4.0, MV, MV, MV, MV];
        // fine 3 x 2 -> coarse 2 x 1
        let out = BoxFilter.reduce(&[&a[..], &b[..]], [3, 2], [2, 1], Some(MV));
        assert_eq!(out, vec![(1.0 + 3.0 + 7.0 + 2.0 + 4.0) / 5.0, 5.0]);

        let empty = [MV; 4];
        assert_eq!(BoxFilter.reduce(&[&empty[..]], [2, 2], [1, 1], Some(MV)), vec![MV]);
        assert_eq!(BoxFilter.reduce(&[&[2.0, 4.0][..]], [2, 1], [1, 1], None), vec![3.0]);
    }

    #[tokio::test]
    async fn test_builds_level_zero_from_one() {
        let (mut src, mut dst) = pair(descriptor());
        let full = VoxelBox::full([5, 4, 3]);
        let mut data: Vec<f32> = (0..60).map(|i| i as f32).collect();
        data[0] = MV;

        src.open_write(0, "p", 1, 0).await.unwrap();
        src.write_region(&full, &data).await.unwrap();
        src.close().await.unwrap();

        let planes = build_coarser_level(&mut src, &mut dst, &BoxFilter, 0, "p", 1, 0)
            .await
            .unwrap();
        assert_eq!(planes, 2);
        assert!(!src.is_open() && !dst.is_open());

        dst.open_read(0, "p", 0, 0).await.unwrap();
        let coarse = dst.read_region(&VoxelBox::full([3, 2, 2])).await.unwrap();
        // first cell: x 0..2, y 0..2, z 0..2 minus the missing corner
        let cell = [1, 5, 6, 20, 21, 25, 26];
        let expect = cell.iter().sum::<i32>() as f32 / cell.len() as f32;
        assert!((coarse[0] - expect).abs() < 1e-3);
        // last cell is the lone x 4, y 2..4 column of the last plane
        assert!((coarse[11] - (54.0 + 59.0) / 2.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_planar_and_level_zero() {
        let (mut src, mut dst) = pair(descriptor());
        src.open_write(0, "sst", 1, 0).await.unwrap();
        src.write_slice(&[2.0; 20]).await.unwrap();
        src.close().await.unwrap();

        let planes = build_coarser_level(&mut src, &mut dst, &BoxFilter, 0, "sst", 1, 0)
            .await
            .unwrap();
        assert_eq!(planes, 1);
        dst.open_read(0, "sst", 0, 0).await.unwrap();
        assert_eq!(dst.read_slice().await.unwrap(), Some(vec![2.0; 6]));
        dst.close().await.unwrap();

        assert!(matches!(
            build_coarser_level(&mut src, &mut dst, &BoxFilter, 0, "sst", 0, 0).await,
            Err(VdfError::InvalidArgument(_))
        ));
    }
}
