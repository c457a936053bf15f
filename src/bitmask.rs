//! Missing-value bitmasks.
//!
//! A variable with a declared missing value gets one mask file per
//! (variable, timestep, level). It records, per block, which voxels held the
//! sentinel before the block was handed to storage.

use crate::error::{Result, VdfError};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Packed boolean array, `ceil(len / 8)` bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "RawMask", try_from = "RawMask")]
pub struct BitMask {
    bits: BitVec<u8, Lsb0>,
}

#[derive(Serialize, Deserialize)]
struct RawMask {
    len: usize,
    bytes: Vec<u8>,
}

impl From<BitMask> for RawMask {
    fn from(mask: BitMask) -> Self {
        RawMask {
            len: mask.len(),
            bytes: mask.bits.into_vec(),
        }
    }
}

impl TryFrom<RawMask> for BitMask {
    type Error = VdfError;

    fn try_from(raw: RawMask) -> Result<Self> {
        BitMask::from_bytes(&raw.bytes, raw.len)
    }
}

impl BitMask {
    /// All-clear mask of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::repeat(false, len),
        }
    }

    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(VdfError::MaskInconsistency(format!(
                "{} bytes cannot hold exactly {} bits",
                bytes.len(),
                len
            )));
        }
        let mut bits = BitVec::<u8, Lsb0>::from_slice(bytes);
        bits.truncate(len);
        Ok(Self { bits })
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).map(|b| *b).unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index < self.bits.len() {
            self.bits.set(index, value);
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn any(&self) -> bool {
        self.bits.any()
    }

    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter_ones()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }
}

/// Mask of one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMask {
    /// Set bits mark voxels that held the missing value
    pub missing: BitMask,
    /// No voxel of the block had data
    pub all_missing: bool,
}

/// Masks of every block of a (variable, timestep, level)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskFile {
    /// Voxels per block the masks were built for
    pub block_voxels: usize,
    pub blocks: BTreeMap<usize, BlockMask>,
}

impl MaskFile {
    pub fn new(block_voxels: usize) -> Self {
        Self {
            block_voxels,
            blocks: BTreeMap::new(),
        }
    }

    /// Decode and check against the geometry of the bound variable
    pub fn from_bytes(bytes: &[u8], block_voxels: usize) -> Result<Self> {
        let file: MaskFile = bincode::deserialize(bytes)
            .map_err(|e| VdfError::MaskInconsistency(format!("unreadable mask file: {}", e)))?;
        if file.block_voxels != block_voxels {
            return Err(VdfError::MaskInconsistency(format!(
                "mask built for {} voxels per block, variable has {}",
                file.block_voxels, block_voxels
            )));
        }
        if let Some((index, m)) = file
            .blocks
            .iter()
            .find(|(_, m)| m.missing.len() != block_voxels)
        {
            return Err(VdfError::MaskInconsistency(format!(
                "block {} mask has {} bits, expected {}",
                index,
                m.missing.len(),
                block_voxels
            )));
        }
        Ok(file)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn get(&self, block_index: usize) -> Option<&BlockMask> {
        self.blocks.get(&block_index)
    }

    /// Store (or clear, when `mask` is `None`) the mask of a block
    pub fn set(&mut self, block_index: usize, mask: Option<BlockMask>) -> Result<()> {
        match mask {
            Some(m) if m.missing.len() != self.block_voxels => Err(VdfError::MaskInconsistency(
                format!(
                    "block {} mask has {} bits, expected {}",
                    block_index,
                    m.missing.len(),
                    self.block_voxels
                ),
            )),
            Some(m) => {
                self.blocks.insert(block_index, m);
                Ok(())
            }
            None => {
                self.blocks.remove(&block_index);
                Ok(())
            }
        }
    }
}

pub fn is_missing(value: f32, missing: f32) -> bool {
    value == missing || (missing.is_nan() && value.is_nan())
}

/// Record and replace missing values of a block before it is stored.
///
/// Voxels equal to `missing` inside the domain are flagged; they and any
/// padding voxels outside the domain are replaced by the mean of the present
/// values (0 when nothing is present). Returns `None` when no voxel is missing.
pub fn mask_block<F>(samples: &mut [f32], missing: f32, in_domain: F) -> Option<BlockMask>
where
    F: Fn(usize) -> bool,
{
    let mut flags = BitMask::new(samples.len());
    let mut sum = 0.0f64;
    let mut present = 0usize;

    for (i, &v) in samples.iter().enumerate() {
        if !in_domain(i) {
            continue;
        }
        if is_missing(v, missing) {
            flags.set(i, true);
        } else {
            sum += v as f64;
            present += 1;
        }
    }

    let mean = if present > 0 {
        (sum / present as f64) as f32
    } else {
        0.0
    };
    for (i, v) in samples.iter_mut().enumerate() {
        if flags.get(i) || !in_domain(i) {
            *v = mean;
        }
    }

    if flags.any() {
        Some(BlockMask {
            all_missing: present == 0,
            missing: flags,
        })
    } else {
        None
    }
}

/// Put the missing value back wherever the mask is set
pub fn restore_missing(samples: &mut [f32], mask: &BlockMask, missing: f32) -> Result<()> {
    if mask.missing.len() != samples.len() {
        return Err(VdfError::MaskInconsistency(format!(
            "mask has {} bits for a block of {} voxels",
            mask.missing.len(),
            samples.len()
        )));
    }
    for i in mask.missing.iter_ones() {
        samples[i] = missing;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmask_packing() {
        let mut m = BitMask::new(13);
        m.set(0, true);
        m.set(12, true);
        m.set(99, true); // ignored
        assert_eq!(m.as_bytes().len(), 2);
        assert_eq!(m.count_ones(), 2);
        assert!(m.get(12) && !m.get(11));

        let restored = BitMask::from_bytes(m.as_bytes(), 13).unwrap();
        assert_eq!(restored, m);
        assert!(matches!(
            BitMask::from_bytes(m.as_bytes(), 17),
            Err(VdfError::MaskInconsistency(_))
        ));
    }

    #[test]
    fn test_mask_block_replaces_with_mean() {
        let mut block = vec![1.0, -999.0, 3.0, -999.0, 5.0, 7.0];
        // last voxel is padding outside the domain
        let mask = mask_block(&mut block, -999.0, |i| i < 5).unwrap();
        assert_eq!(block, vec![1.0, 3.0, 3.0, 3.0, 5.0, 3.0]);
        assert!(!mask.all_missing);
        assert_eq!(mask.missing.iter_ones().collect::<Vec<_>>(), vec![1, 3]);

        restore_missing(&mut block, &mask, -999.0).unwrap();
        assert_eq!(block[..5], [1.0, -999.0, 3.0, -999.0, 5.0]);
    }

    #[test]
    fn test_mask_block_all_missing() {
        let mut block = vec![f32::NAN; 4];
        let mask = mask_block(&mut block, f32::NAN, |_| true).unwrap();
        assert!(mask.all_missing);
        assert_eq!(block, vec![0.0; 4]);
    }

    #[test]
    fn test_mask_block_without_missing() {
        let mut block = vec![1.0, 2.0];
        assert!(mask_block(&mut block, -1.0, |_| true).is_none());
        assert_eq!(block, vec![1.0, 2.0]);
    }

    #[test]
    fn test_mask_file_geometry_check() {
        let mut file = MaskFile::new(8);
        let mut m = BitMask::new(8);
        m.set(3, true);
        file.set(
            2,
            Some(BlockMask {
                missing: m,
                all_missing: false,
            }),
        )
        .unwrap();
        assert!(file
            .set(
                3,
                Some(BlockMask {
                    missing: BitMask::new(4),
                    all_missing: false
                })
            )
            .is_err());

        let bytes = file.to_bytes().unwrap();
        assert_eq!(MaskFile::from_bytes(&bytes, 8).unwrap(), file);
        assert!(matches!(
            MaskFile::from_bytes(&bytes, 16),
            Err(VdfError::MaskInconsistency(_))
        ));
    }
}
