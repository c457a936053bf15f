//! Example: ingest an ocean temperature volume, derive its coarser levels,
//! then resolve and read regions back
//!
//! Run with: cargo run --example ocean_ingest

use vdfstore::{
    BlockSize, BoxFilter, CompressionMethod, Dataset, DatasetDescriptor, PointSample,
    ResolveRequest, StoreConfig, UserBox, VarKind, VariableInfo,
};

const LAND: f32 = 1.0e30;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("VDF Store Example: Ocean Ingest");
    println!("===============================\n");

    // 128 x 96 x 32 basin, 100 km across, 4 km deep, two coarser levels
    let descriptor = DatasetDescriptor::new([128, 96, 32], [0.0, 0.0, -4000.0, 100e3, 75e3, 0.0])
        .with_num_transforms(2)
        .with_block_size(BlockSize::cube(16)?)
        .with_compression(CompressionMethod::Zstd)
        .with_compression_ratios(vec![16, 1])
        .with_variable(VariableInfo::new("temp", VarKind::Volume3D).with_missing_value(LAND))
        .with_variable(VariableInfo::new("ssh", VarKind::Plane2DXY));
    println!("Dataset: {}", descriptor.summary());

    let temp_dir = tempfile::tempdir()?;
    let path = temp_dir.path().join("ocean");
    let url = path.to_str().ok_or("non UTF-8 temp path")?.to_string();
    let ds = Dataset::create(&url, descriptor, StoreConfig::default()).await?;
    println!("Created dataset at: {}\n", path.display());

    // Stream the finest level plane by plane, bottom up
    let [nx, ny, nz] = ds.descriptor().dimension;
    let finest = ds.descriptor().num_transforms();
    let mut vio = ds.variable_io()?;
    vio.open_write(0, "temp", finest, 1).await?;
    for z in 0..nz {
        let plane: Vec<f32> = (0..nx * ny)
            .map(|i| {
                let (x, y) = (i % nx, i / nx);
                // a continental shelf along the west coast
                if x < 8 + z / 2 {
                    LAND
                } else {
                    2.0 + 0.5 * z as f32 + 0.01 * y as f32
                }
            })
            .collect();
        vio.write_slice(&plane).await?;
    }
    vio.close().await?;

    vio.open_write(0, "ssh", finest, 1).await?;
    let ssh: Vec<f32> = (0..nx * ny).map(|i| 0.001 * (i % nx) as f32).collect();
    vio.write_slice(&ssh).await?;
    vio.close().await?;
    println!("Wrote level {} of temp and ssh", finest);
    println!("  write {:?}, xform {:?}", vio.write_timer(), vio.xform_timer());

    ds.build_pyramid(&BoxFilter, 0, "temp", 1).await?;
    ds.build_pyramid(&BoxFilter, 0, "ssh", 1).await?;
    if let Some(range) = ds.data_range("temp", 0) {
        println!("Built levels 0..{}; temp spans {:.2} - {:.2}\n", finest, range.min, range.max);
    }

    // Ask for the upper kilometre of the eastern half at a middle level
    let user = UserBox::new([50e3, 0.0, -1000.0], [100e3, 75e3, 0.0]);
    let req = ResolveRequest::new(user, 1, 0)
        .with_variables(["temp", "ssh"])
        .with_user_bounds();
    let region = ds.resolve(&req)?;
    println!("Resolved at level {}:", region.level_achieved);
    println!("  voxels {}", region.voxels);
    println!("  blocks {}", region.blocks);
    if let Some(achieved) = region.user_achieved {
        println!("  user   {:?} - {:?}", achieved.min, achieved.max);
    }

    for lod in [0, 1] {
        let temp = ds.read_resolved(&region, "temp", lod).await?;
        let mean = temp.iter().map(|&v| v as f64).sum::<f64>() / temp.len() as f64;
        println!("  temp at lod {}: {} samples, mean {:.4}", lod, temp.len(), mean);
    }

    for point in [[75e3, 30e3, -500.0], [1e3, 30e3, -3900.0], [200e3, 0.0, 0.0]] {
        match ds.sample_point("temp", point, finest, 0).await? {
            PointSample::Value(v) if v == LAND => println!("  {:?}: land", point),
            PointSample::Value(v) => println!("  {:?}: {:.3} degC", point, v),
            PointSample::OutOfBounds => println!("  {:?}: outside the basin", point),
        }
    }

    println!("\n{}", ds.stats());
    Ok(())
}
