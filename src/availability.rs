//! What data is actually materialized on disk.
//!
//! Levels are independent on disk: writing level `L` says nothing about
//! `L - 1` until that level is written too (see `pyramid`). The index keeps,
//! per (variable, timestep), the voxel box written at every level present.

use crate::error::Result;
use crate::io::IOManager;
use crate::types::{ValueRange, VoxelBox};
use crate::utils::AVAILABILITY_PATH;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Availability queries the region resolver depends on
pub trait Availability: Send + Sync {
    /// Finest refinement level present for (variable, timestep)
    fn max_level_present(&self, variable: &str, timestep: usize) -> Option<usize>;

    /// Voxel box written at exactly `level`, or `None` if that level is
    /// not on disk
    fn valid_region(&self, variable: &str, timestep: usize, level: usize) -> Option<VoxelBox>;

    /// Finest level at or below `level` present for (variable, timestep)
    fn finest_level_within(&self, variable: &str, timestep: usize, level: usize) -> Option<usize> {
        (0..=level)
            .rev()
            .find(|&l| self.valid_region(variable, timestep, l).is_some())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Voxel box written, per level
    pub levels: BTreeMap<usize, VoxelBox>,
    /// Range of the present (non-missing) values
    pub data_range: Option<ValueRange>,
}

impl Presence {
    pub fn finest_level(&self) -> Option<usize> {
        self.levels.keys().next_back().copied()
    }
}

/// Persisted availability index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityIndex {
    entries: BTreeMap<String, Presence>,
}

fn key(variable: &str, timestep: usize) -> String {
    format!("{}@{}", variable, timestep)
}

impl AvailabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index, or start empty if the dataset has none yet
    pub async fn load(io: &dyn IOManager) -> Result<Self> {
        if !io.exists(AVAILABILITY_PATH).await? {
            return Ok(Self::default());
        }
        let bytes = io.read(AVAILABILITY_PATH).await?;
        let index: AvailabilityIndex = serde_json::from_slice(&bytes)?;
        debug!(entries = index.entries.len(), "Loaded availability index");
        Ok(index)
    }

    pub async fn save(&self, io: &dyn IOManager) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        io.write(AVAILABILITY_PATH, &bytes).await
    }

    /// Record a region written at `level`; repeated writes grow the box
    pub fn record(
        &mut self,
        variable: &str,
        timestep: usize,
        level: usize,
        region: VoxelBox,
        data_range: Option<ValueRange>,
    ) {
        let entry = self.entries.entry(key(variable, timestep)).or_default();
        entry
            .levels
            .entry(level)
            .and_modify(|b| *b = b.union(&region))
            .or_insert(region);
        entry.data_range = match (entry.data_range, data_range) {
            (Some(a), Some(b)) => Some(a.merge(&b)),
            (a, b) => a.or(b),
        };
    }

    pub fn presence(&self, variable: &str, timestep: usize) -> Option<&Presence> {
        self.entries.get(&key(variable, timestep))
    }

    /// Index holding only the entry of (variable, timestep)
    pub fn subset(&self, variable: &str, timestep: usize) -> Self {
        let entries = self
            .entries
            .get_key_value(&key(variable, timestep))
            .map(|(k, p)| (k.clone(), p.clone()))
            .into_iter()
            .collect();
        Self { entries }
    }

    /// Voxel box written for (variable, timestep) at one level
    pub fn level_region(&self, variable: &str, timestep: usize, level: usize) -> Option<VoxelBox> {
        self.presence(variable, timestep)?.levels.get(&level).copied()
    }

    pub fn data_range(&self, variable: &str, timestep: usize) -> Option<ValueRange> {
        self.presence(variable, timestep).and_then(|p| p.data_range)
    }

    /// Whether (variable, timestep) was written at `level`
    pub fn variable_exists(&self, variable: &str, timestep: usize, level: usize) -> bool {
        self.level_region(variable, timestep, level).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Availability for AvailabilityIndex {
    fn max_level_present(&self, variable: &str, timestep: usize) -> Option<usize> {
        self.presence(variable, timestep)?.finest_level()
    }

    fn valid_region(&self, variable: &str, timestep: usize, level: usize) -> Option<VoxelBox> {
        self.level_region(variable, timestep, level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIOManager;

    #[test]
    fn test_record_levels() {
        let mut index = AvailabilityIndex::new();
        index.record("t", 0, 1, VoxelBox::new([0, 0, 0], [31, 31, 15]), None);
        index.record("t", 0, 1, VoxelBox::new([32, 0, 0], [63, 31, 15]), None);
        assert_eq!(
            index.valid_region("t", 0, 1),
            Some(VoxelBox::new([0, 0, 0], [63, 31, 15]))
        );
        // a finer write does not materialize coarser levels
        assert_eq!(index.valid_region("t", 0, 0), None);
        assert!(!index.variable_exists("t", 0, 0));
        assert_eq!(index.valid_region("t", 0, 2), None);
        assert_eq!(index.finest_level_within("t", 0, 3), Some(1));
        assert_eq!(index.finest_level_within("t", 0, 0), None);

        // each level keeps its own box
        index.record("t", 0, 0, VoxelBox::new([0, 0, 0], [1, 1, 1]), None);
        assert_eq!(index.max_level_present("t", 0), Some(1));
        assert_eq!(index.valid_region("t", 0, 0), Some(VoxelBox::new([0; 3], [1; 3])));
        assert_eq!(index.finest_level_within("t", 0, 0), Some(0));

        index.record("t", 0, 2, VoxelBox::new([0, 0, 0], [9, 9, 9]), None);
        assert_eq!(index.max_level_present("t", 0), Some(2));
        assert_eq!(index.valid_region("t", 0, 1), Some(VoxelBox::new([0, 0, 0], [63, 31, 15])));
        assert!(index.variable_exists("t", 0, 1));
        assert!(!index.variable_exists("t", 1, 0));
    }

    #[test]
    fn test_subset_keeps_one_entry() {
        let mut index = AvailabilityIndex::new();
        let b = VoxelBox::new([0; 3], [3; 3]);
        index.record("a", 0, 1, b, None);
        index.record("a", 1, 1, b, None);
        index.record("b", 0, 0, b, None);

        let sub = index.subset("a", 0);
        assert_eq!(sub.len(), 1);
        assert_eq!(sub.valid_region("a", 0, 1), Some(b));
        assert_eq!(sub.valid_region("a", 1, 1), None);
        assert!(index.subset("c", 0).is_empty());
    }

    #[test]
    fn test_data_range_merges() {
        let mut index = AvailabilityIndex::new();
        let b = VoxelBox::new([0; 3], [1; 3]);
        index.record("t", 0, 0, b, Some(ValueRange::new(-1.0, 2.0)));
        index.record("t", 0, 0, b, None);
        index.record("t", 0, 0, b, Some(ValueRange::new(0.0, 5.0)));
        assert_eq!(index.data_range("t", 0), Some(ValueRange::new(-1.0, 5.0)));
    }

    #[tokio::test]
    async fn test_persistence() {
        let io = MemoryIOManager::new();
        assert!(AvailabilityIndex::load(&io).await.unwrap().is_empty());

        let mut index = AvailabilityIndex::new();
        index.record("p", 4, 0, VoxelBox::new([0; 3], [7, 7, 0]), None);
        index.record("p", 4, 2, VoxelBox::new([0; 3], [31, 31, 0]), None);
        index.save(&io).await.unwrap();
        assert_eq!(AvailabilityIndex::load(&io).await.unwrap(), index);
    }
}
