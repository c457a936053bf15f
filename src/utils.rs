//! Utility functions

use crate::error::{Result, VdfError};
use crate::types::DataType;
use num_traits::{Bounded, NumCast};

/// Object holding the dataset descriptor
pub const DESCRIPTOR_PATH: &str = "metadata.json";

/// Object holding the availability index
pub const AVAILABILITY_PATH: &str = "availability.json";

/// Encode in-memory samples into the on-disk sample type (little endian).
/// Integer types round and saturate.
pub fn encode_samples(data_type: DataType, samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * data_type.size_in_bytes());
    match data_type {
        DataType::U8 => out.extend(samples.iter().map(|&v| saturate::<u8>(v))),
        DataType::I16 => {
            for &v in samples {
                out.extend_from_slice(&saturate::<i16>(v).to_le_bytes());
            }
        }
        DataType::F32 => {
            for &v in samples {
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        DataType::F64 => {
            for &v in samples {
                out.extend_from_slice(&(v as f64).to_le_bytes());
            }
        }
    }
    out
}

/// Decode on-disk samples into `f32`
pub fn decode_samples(data_type: DataType, bytes: &[u8]) -> Result<Vec<f32>> {
    let size = data_type.size_in_bytes();
    if bytes.len() % size != 0 {
        return Err(VdfError::StorageBackend(format!(
            "Byte length {} not aligned with {} samples",
            bytes.len(),
            data_type
        )));
    }
    let samples = match data_type {
        DataType::U8 => bytes.iter().map(|&b| b as f32).collect(),
        DataType::I16 => bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32)
            .collect(),
        DataType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        DataType::F64 => bytes
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                f64::from_le_bytes(w) as f32
            })
            .collect(),
    };
    Ok(samples)
}

fn saturate<T: NumCast + Bounded>(v: f32) -> T {
    T::from(v.round()).unwrap_or_else(|| {
        if v.is_sign_negative() {
            T::min_value()
        } else {
            T::max_value()
        }
    })
}

/// Object path of one stored block. Blocks are shared by every LOD.
pub fn brick_path(variable: &str, timestep: usize, level: usize, index: usize) -> String {
    format!(
        "bricks/{}/t{:06}/L{}/{:08}.brick",
        variable, timestep, level, index
    )
}

/// Object path of the missing-value mask file for (variable, timestep, level)
pub fn mask_path(variable: &str, timestep: usize, level: usize) -> String {
    format!("masks/{}/t{:06}/L{}.mask", variable, timestep, level)
}

/// Chunked-array variable name backing one (variable, timestep, level)
pub fn slab_var_name(variable: &str, timestep: usize, level: usize) -> String {
    format!("{}.t{:06}.L{}", variable, timestep, level)
}

/// Format byte size in human-readable form
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}
