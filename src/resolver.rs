//! Region resolution: turn "what I want" (a user-coordinate box, a level,
//! a timestep and a set of variables) into "what I can get" (an achieved
//! level plus voxel and block bounds present on disk for every variable).

use crate::availability::Availability;
use crate::config::StoreConfig;
use crate::error::{Result, VdfError};
use crate::metadata::DatasetDescriptor;
use crate::session::DatasetSession;
use crate::types::{UserBox, VarKind, VoxelBox};
use crate::vario::VariableIo;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// What to do when the requested level is not on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelPolicy {
    /// Fail with `DataUnavailable`
    Exact,
    /// Use the finest level present for every variable
    #[default]
    AllowCoarser,
}

/// Share of the region cache one request may occupy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheBudget {
    pub cache_mb: f64,
    pub fraction: f64,
}

impl CacheBudget {
    pub fn new(cache_mb: f64, fraction: f64) -> Self {
        Self { cache_mb, fraction }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.cache_mb as f64, config.cache_fraction)
    }

    pub fn budget_mb(&self) -> f64 {
        self.cache_mb * self.fraction
    }
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub user: UserBox,
    pub level: usize,
    pub timestep: usize,
    pub variables: Vec<String>,
    /// Skip the one-voxel thickness guard
    pub planar: bool,
    /// Map the achieved voxel box back to user coordinates
    pub want_user_bounds: bool,
}

impl ResolveRequest {
    pub fn new(user: UserBox, level: usize, timestep: usize) -> Self {
        Self {
            user,
            level,
            timestep,
            variables: Vec::new(),
            planar: false,
            want_user_bounds: false,
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>) -> Self {
        self.variables.push(name.into());
        self
    }

    pub fn with_variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn planar(mut self) -> Self {
        self.planar = true;
        self
    }

    pub fn with_user_bounds(mut self) -> Self {
        self.want_user_bounds = true;
        self
    }
}

/// Outcome of a successful resolution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRegion {
    pub level_requested: usize,
    pub level_achieved: usize,
    pub timestep: usize,
    pub variables: Vec<String>,
    pub user_requested: UserBox,
    /// Voxel bounds at `level_achieved`, inclusive
    pub voxels: VoxelBox,
    /// Block bounds at `level_achieved`, inclusive
    pub blocks: VoxelBox,
    pub user_achieved: Option<UserBox>,
    /// Layered-grid height the voxels are addressed with
    pub grid_height: Option<usize>,
}

impl ResolvedRegion {
    pub fn is_coarser_than_requested(&self) -> bool {
        self.level_achieved < self.level_requested
    }

    /// Voxel bounds restricted to the shape of a variable of `kind`
    pub fn voxels_for(&self, kind: VarKind) -> VoxelBox {
        let mut b = self.voxels;
        if let Some(axis) = kind.collapsed_axis() {
            b.min[axis] = 0;
            b.max[axis] = 0;
        }
        b
    }
}

/// Result of sampling a single point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointSample {
    Value(f32),
    /// Outside the domain or outside the data present on disk
    OutOfBounds,
}

pub struct RegionResolver<'a> {
    session: &'a DatasetSession,
    availability: &'a dyn Availability,
    policy: LevelPolicy,
    budget: CacheBudget,
    warn_if_missing: bool,
}

impl<'a> RegionResolver<'a> {
    pub fn new(session: &'a DatasetSession, availability: &'a dyn Availability) -> Self {
        Self {
            session,
            availability,
            policy: LevelPolicy::default(),
            budget: CacheBudget::default(),
            warn_if_missing: true,
        }
    }

    pub fn with_policy(mut self, policy: LevelPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_budget(mut self, budget: CacheBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_config(self, config: &StoreConfig) -> Self {
        let policy = if config.allow_coarser {
            LevelPolicy::AllowCoarser
        } else {
            LevelPolicy::Exact
        };
        let mut r = self.with_policy(policy).with_budget(CacheBudget::from_config(config));
        r.warn_if_missing = config.warn_if_missing;
        r
    }

    fn descriptor(&self) -> &DatasetDescriptor {
        self.session.descriptor()
    }

    /// Build a `DataUnavailable` error. With `remember`, the requested
    /// level is recorded in the negative cache and warned about once.
    fn unavailable(
        &self,
        variable: &str,
        level: usize,
        timestep: usize,
        remember: Option<usize>,
    ) -> VdfError {
        let first = match remember {
            Some(key_level) => self.session.mark_missing(variable, key_level, timestep),
            None => true,
        };
        if first && self.warn_if_missing {
            warn!(
                variable,
                level,
                timestep,
                "data unavailable; lower the refinement level or choose another timestep"
            );
        }
        VdfError::unavailable(variable, level, timestep)
    }

    fn validate(&self, req: &ResolveRequest) -> Result<usize> {
        let d = self.descriptor();
        if req.timestep >= d.num_timesteps {
            return Err(VdfError::InvalidArgument(format!(
                "timestep {} out of range, dataset has {}",
                req.timestep, d.num_timesteps
            )));
        }
        if (0..3).any(|i| !(req.user.min[i] <= req.user.max[i])) {
            return Err(VdfError::InvalidArgument(format!(
                "user box {:?}-{:?} is not ordered",
                req.user.min, req.user.max
            )));
        }
        for var in &req.variables {
            d.var_kind(var)?;
        }
        Ok(d.normalize_level(req.level))
    }

    /// Finest level at or below `level` materialized for every variable
    fn negotiate_level(&self, variables: &[String], level: usize, timestep: usize) -> Result<usize> {
        for var in variables {
            if self
                .availability
                .finest_level_within(var, timestep, level)
                .is_none()
            {
                return Err(self.unavailable(var, level, timestep, Some(level)));
            }
        }
        let present = |l: usize| {
            variables
                .iter()
                .all(|v| self.availability.valid_region(v, timestep, l).is_some())
        };
        let limiting = variables
            .iter()
            .find(|v| self.availability.valid_region(v, timestep, level).is_none());
        let Some(achieved) = (0..=level).rev().find(|&l| present(l)) else {
            // every variable has some level, just not a shared one
            let var = limiting.map(String::as_str).unwrap_or_default();
            return Err(self.unavailable(var, level, timestep, None));
        };
        if let Some(var) = limiting {
            if self.policy == LevelPolicy::Exact {
                // depends on the policy, so not cached
                return Err(self.unavailable(var, level, timestep, None));
            }
            debug!(variable = %var, requested = level, achieved, timestep, "falling back to coarser level");
        }
        Ok(achieved)
    }

    /// Voxel box present for `variable` at `level`, with the vertical
    /// range of a layered grid taken from the current grid height
    fn available_box(&self, variable: &str, timestep: usize, level: usize) -> Option<VoxelBox> {
        let d = self.descriptor();
        let mut b = self.availability.valid_region(variable, timestep, level)?;
        if d.is_layered() && d.var_kind(variable).ok()? == VarKind::Volume3D {
            let height = self.session.full_grid_height().unwrap_or(d.dimension[2]);
            let shift = d.num_transforms - level;
            b.min[2] = 0;
            b.max[2] = (height >> shift).max(1) - 1;
        }
        Some(b)
    }

    fn map_box(&self, user: &UserBox, level: usize, timestep: usize) -> VoxelBox {
        let d = self.descriptor();
        let h = self.session.full_grid_height();
        VoxelBox::new(
            d.map_user_to_vox_with_height(timestep, level, &user.min, h),
            d.map_user_to_vox_with_height(timestep, level, &user.max, h),
        )
    }

    /// Resolve `req` at one level shared by all of its variables
    pub fn resolve(&self, req: &ResolveRequest) -> Result<ResolvedRegion> {
        let level = self.validate(req)?;
        let ts = req.timestep;
        for var in &req.variables {
            if self.session.is_missing(var, level, ts) {
                return Err(VdfError::unavailable(var.as_str(), level, ts));
            }
        }

        let achieved = self.negotiate_level(&req.variables, level, ts)?;
        let d = self.descriptor();
        let height = self.session.full_grid_height();
        let dims = d.dim_with_height(achieved, height);
        let mut voxels = self.map_box(&req.user, achieved, ts);

        if !req.planar {
            for i in 0..3 {
                if voxels.min[i] == voxels.max[i] {
                    if voxels.max[i] + 1 < dims[i] {
                        voxels.max[i] += 1;
                    } else if voxels.min[i] > 0 {
                        voxels.min[i] -= 1;
                    }
                }
            }
        }

        for var in &req.variables {
            let kind = d.var_kind(var)?;
            let available = self
                .available_box(var, ts, achieved)
                .ok_or_else(|| self.unavailable(var, achieved, ts, Some(level)))?;
            for i in 0..3 {
                if kind.collapsed_axis() == Some(i) {
                    continue;
                }
                voxels.min[i] = voxels.min[i].max(available.min[i]);
                voxels.max[i] = voxels.max[i].min(available.max[i]);
                if voxels.min[i] > voxels.max[i] {
                    // specific to this box, other boxes may still overlap
                    return Err(self.unavailable(var, achieved, ts, None));
                }
            }
        }

        let blocks = d
            .layout_for(VarKind::Volume3D, achieved, height)
            .blocks_for(&voxels);
        let user_achieved = req.want_user_bounds.then(|| {
            UserBox::new(
                d.map_vox_to_user_with_height(ts, achieved, &voxels.min, height),
                d.map_vox_to_user_with_height(ts, achieved, &voxels.max, height),
            )
        });

        let estimate = self.estimate_voxels_mb(&voxels, achieved);
        if estimate > self.budget.budget_mb() {
            let suggested = self
                .max_level_within_budget(&req.user, achieved, ts)
                .unwrap_or(0);
            return Err(VdfError::RegionTooLarge {
                estimated_mb: estimate,
                budget_mb: self.budget.budget_mb(),
                suggested_level: suggested,
            });
        }

        Ok(ResolvedRegion {
            level_requested: level,
            level_achieved: achieved,
            timestep: ts,
            variables: req.variables.clone(),
            user_requested: req.user,
            voxels,
            blocks,
            user_achieved,
            grid_height: height,
        })
    }

    /// Resolve every variable on its own, each at its own best level
    pub fn resolve_each(&self, req: &ResolveRequest) -> Vec<(String, Result<ResolvedRegion>)> {
        req.variables
            .iter()
            .map(|var| {
                let single = ResolveRequest {
                    variables: vec![var.clone()],
                    ..req.clone()
                };
                (var.clone(), self.resolve(&single))
            })
            .collect()
    }

    fn estimate_voxels_mb(&self, voxels: &VoxelBox, level: usize) -> f64 {
        let layout = self.descriptor().layout_for(
            VarKind::Volume3D,
            level,
            self.session.full_grid_height(),
        );
        let blocks = layout.blocks_for(voxels).num_voxels();
        (blocks * layout.block_voxels() * self.descriptor().bytes_per_voxel()) as f64
            / (1024.0 * 1024.0)
    }

    /// Storage a user box occupies at `level`, in MB, counted in whole blocks
    pub fn estimate_mb(&self, user: &UserBox, level: usize, timestep: usize) -> f64 {
        let level = self.descriptor().normalize_level(level);
        let voxels = self.map_box(user, level, timestep);
        self.estimate_voxels_mb(&voxels, level)
    }

    /// Finest level at or below `level` whose estimate fits the budget
    pub fn max_level_within_budget(&self, user: &UserBox, level: usize, timestep: usize) -> Option<usize> {
        let level = self.descriptor().normalize_level(level);
        (0..=level)
            .rev()
            .find(|&l| self.estimate_mb(user, l, timestep) <= self.budget.budget_mb())
    }

    /// Fail with `RegionTooLarge` when `user` at `level` exceeds the budget
    pub fn check_budget(&self, user: &UserBox, level: usize, timestep: usize) -> Result<f64> {
        let estimate = self.estimate_mb(user, level, timestep);
        if estimate > self.budget.budget_mb() {
            return Err(VdfError::RegionTooLarge {
                estimated_mb: estimate,
                budget_mb: self.budget.budget_mb(),
                suggested_level: self.max_level_within_budget(user, level, timestep).unwrap_or(0),
            });
        }
        Ok(estimate)
    }

    /// Value of `variable` at the voxel nearest `point`, reading only the
    /// block that holds it
    pub async fn sample_point(
        &self,
        vio: &mut VariableIo,
        variable: &str,
        point: [f64; 3],
        level: usize,
        timestep: usize,
    ) -> Result<PointSample> {
        let d = self.descriptor();
        if timestep >= d.num_timesteps {
            return Err(VdfError::InvalidArgument(format!(
                "timestep {} out of range",
                timestep
            )));
        }
        let kind = d.var_kind(variable)?;
        if !d.user_bounds(timestep).contains_point(&point) {
            return Ok(PointSample::OutOfBounds);
        }
        let level = d.normalize_level(level);
        let achieved = self.negotiate_level(&[variable.to_string()], level, timestep)?;
        let height = self.session.full_grid_height();
        let mut vox = d.map_user_to_vox_with_height(timestep, achieved, &point, height);
        if let Some(axis) = kind.collapsed_axis() {
            vox[axis] = 0;
        }
        match self.available_box(variable, timestep, achieved) {
            Some(b) if b.contains(&vox) => {}
            _ => return Ok(PointSample::OutOfBounds),
        }

        let lod = d.normalize_lod(usize::MAX);
        vio.open_read(timestep, variable, achieved, lod).await?;
        let layout = vio.layout()?;
        if !layout.is_in_bounds(&vox) {
            vio.close().await?;
            return Ok(PointSample::OutOfBounds);
        }
        let block = layout.vox_to_blk(&vox);
        let data = vio.read_block_region(&VoxelBox::new(block, block)).await;
        vio.close().await?;
        let data = data?;

        let local = [
            vox[0] - block[0] * layout.block[0],
            vox[1] - block[1] * layout.block[1],
            vox[2] - block[2] * layout.block[2],
        ];
        let index = local[0] + layout.block[0] * (local[1] + layout.block[1] * local[2]);
        Ok(PointSample::Value(data[index]))
    }
}

/// The currently selected box of a view, kept inside the extents of the
/// active timestep
#[derive(Debug, Clone)]
pub struct RegionState {
    descriptor: Arc<DatasetDescriptor>,
    timestep: usize,
    region: UserBox,
    local: BTreeMap<usize, UserBox>,
}

impl RegionState {
    pub fn new(descriptor: Arc<DatasetDescriptor>, timestep: usize) -> Self {
        let region = descriptor.user_bounds(timestep);
        Self {
            descriptor,
            timestep,
            region,
            local: BTreeMap::new(),
        }
    }

    /// Start over on another dataset: full extents, no local regions
    pub fn reinit(&mut self, descriptor: Arc<DatasetDescriptor>) {
        let timestep = self.timestep.min(descriptor.num_timesteps.saturating_sub(1));
        *self = Self::new(descriptor, timestep);
    }

    pub fn timestep(&self) -> usize {
        self.timestep
    }

    fn bounds(&self, timestep: usize) -> UserBox {
        self.descriptor.user_bounds(timestep)
    }

    /// Selected box at the active timestep
    pub fn region(&self) -> UserBox {
        self.local.get(&self.timestep).copied().unwrap_or(self.region)
    }

    pub fn set_timestep(&mut self, timestep: usize) {
        self.timestep = timestep;
        self.region = self.region.clamp_to(&self.bounds(timestep));
    }

    pub fn set_box(&mut self, user: UserBox) {
        self.region = user.clamp_to(&self.bounds(self.timestep));
    }

    /// Move the lower corner; the upper corner follows if needed
    pub fn set_min(&mut self, min: [f64; 3]) {
        let mut b = self.region;
        for i in 0..3 {
            b.min[i] = min[i];
            if b.max[i] < b.min[i] {
                b.max[i] = b.min[i];
            }
        }
        self.set_box(b);
    }

    /// Move the upper corner; the lower corner follows if needed
    pub fn set_max(&mut self, max: [f64; 3]) {
        let mut b = self.region;
        for i in 0..3 {
            b.max[i] = max[i];
            if b.min[i] > b.max[i] {
                b.min[i] = b.max[i];
            }
        }
        self.set_box(b);
    }

    /// Recenter keeping the size
    pub fn set_center(&mut self, center: [f64; 3]) {
        let size = self.region.size();
        self.set_box(centered(center, size));
    }

    /// Resize around the current center
    pub fn set_size(&mut self, size: [f64; 3]) {
        let center = self.region.center();
        self.set_box(centered(center, size.map(|s| s.max(0.0))));
    }

    /// Override the box for one timestep
    pub fn set_local_region(&mut self, timestep: usize, user: UserBox) {
        let clamped = user.clamp_to(&self.bounds(timestep));
        self.local.insert(timestep, clamped);
    }

    pub fn clear_local_regions(&mut self) {
        self.local.clear();
    }

    /// Request for the selected box
    pub fn to_request<I, S>(&self, level: usize, variables: I) -> ResolveRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ResolveRequest::new(self.region(), level, self.timestep).with_variables(variables)
    }
}

fn centered(center: [f64; 3], size: [f64; 3]) -> UserBox {
    UserBox::new(
        [
            center[0] - 0.5 * size[0],
            center[1] - 0.5 * size[1],
            center[2] - 0.5 * size[2],
        ],
        [
            center[0] + 0.5 * size[0],
            center[1] + 0.5 * size[1],
            center[2] + 0.5 * size[2],
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::AvailabilityIndex;
    use crate::io::{IOManager, MemoryIOManager};
    use crate::layout::BlockSize;
    use crate::metadata::{GridKind, VariableInfo};
    use crate::store::BrickStore;
    use parking_lot::RwLock;

    fn descriptor() -> DatasetDescriptor {
        DatasetDescriptor::new([101, 101, 51], [0.0, 0.0, 0.0, 100.0, 100.0, 50.0])
            .with_num_transforms(1)
            .with_block_size(BlockSize::cube(32).unwrap())
            .with_variable(VariableInfo::new("temp", VarKind::Volume3D))
            .with_variable(VariableInfo::new("wind", VarKind::Volume3D))
            .with_variable(VariableInfo::new("hgt", VarKind::Plane2DXY))
    }

    fn session(d: DatasetDescriptor) -> DatasetSession {
        DatasetSession::new(Arc::new(d), 1 << 20)
    }

    fn request() -> ResolveRequest {
        ResolveRequest::new(UserBox::new([10.0, 10.0, 10.0], [90.0, 90.0, 40.0]), 1, 0)
    }

    #[test]
    fn test_coarser_fallback() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 0, VoxelBox::full(s.descriptor().dim(0)), None);
        let r = RegionResolver::new(&s, &index);

        let req = request().with_variable("temp");
        let resolved = r.resolve(&req).unwrap();
        assert_eq!(resolved.level_requested, 1);
        assert_eq!(resolved.level_achieved, 0);
        assert!(resolved.is_coarser_than_requested());
        assert_eq!(resolved.voxels, VoxelBox::new([5, 5, 5], [45, 45, 20]));
        assert_eq!(resolved.blocks, VoxelBox::new([0, 0, 0], [1, 1, 0]));

        let strict = RegionResolver::new(&s, &index).with_policy(LevelPolicy::Exact);
        let err = strict.resolve(&req).unwrap_err();
        assert!(matches!(
            err,
            VdfError::DataUnavailable { ref variable, level: 1, timestep: 0 } if variable == "temp"
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_full_availability_matches_mapping() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        for v in ["temp", "wind"] {
            index.record(v, 0, 1, VoxelBox::full(s.descriptor().dim(1)), None);
        }
        let r = RegionResolver::new(&s, &index);
        let resolved = r
            .resolve(&request().with_variables(["temp", "wind"]).with_user_bounds())
            .unwrap();
        assert_eq!(resolved.level_achieved, 1);
        assert_eq!(resolved.voxels, VoxelBox::new([10, 10, 10], [90, 90, 40]));
        assert_eq!(resolved.blocks, VoxelBox::new([0, 0, 0], [2, 2, 1]));
        let user = resolved.user_achieved.unwrap();
        assert_eq!(user.min, [10.0, 10.0, 10.0]);
        assert_eq!(user.max, [90.0, 90.0, 40.0]);
    }

    #[test]
    fn test_resolved_within_requested_and_available() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        let available = VoxelBox::new([20, 0, 0], [60, 100, 30]);
        index.record("temp", 0, 1, available, None);
        index.record("wind", 0, 1, VoxelBox::full(s.descriptor().dim(1)), None);
        let r = RegionResolver::new(&s, &index);

        let req = request().with_variables(["temp", "wind"]);
        let resolved = r.resolve(&req).unwrap();
        let requested = VoxelBox::new([10, 10, 10], [90, 90, 40]);
        let bound = requested.intersect(&available).unwrap();
        assert!(bound.contains_box(&resolved.voxels));
        assert_eq!(resolved.voxels, VoxelBox::new([20, 10, 10], [60, 90, 30]));

        // per-variable policy keeps each variable's own bounds
        let each = r.resolve_each(&req);
        assert_eq!(each.len(), 2);
        assert_eq!(each[1].1.as_ref().unwrap().voxels, requested);
    }

    #[test]
    fn test_empty_intersection_is_not_cached() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 1, VoxelBox::new([0; 3], [10; 3]), None);
        let r = RegionResolver::new(&s, &index);

        let far = ResolveRequest::new(UserBox::new([20.0; 3], [30.0; 3]), 1, 0).with_variable("temp");
        assert!(matches!(r.resolve(&far), Err(VdfError::DataUnavailable { .. })));
        assert!(!s.is_missing("temp", 1, 0));

        // a box that overlaps the data still resolves
        let near = ResolveRequest::new(UserBox::new([0.0; 3], [5.0; 3]), 1, 0).with_variable("temp");
        assert_eq!(r.resolve(&near).unwrap().voxels, VoxelBox::new([0; 3], [5; 3]));

        // variables never written are remembered
        let other = request().with_variable("wind");
        assert!(matches!(r.resolve(&other), Err(VdfError::DataUnavailable { .. })));
        assert!(s.is_missing("wind", 1, 0));
        assert!(matches!(r.resolve(&other), Err(VdfError::DataUnavailable { .. })));
        assert!(matches!(
            r.resolve(&request().with_variable("nope")),
            Err(VdfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_only_materialized_levels_are_negotiated() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 1, VoxelBox::full(s.descriptor().dim(1)), None);
        index.record("wind", 0, 0, VoxelBox::full(s.descriptor().dim(0)), None);
        index.record("hgt", 0, 0, VoxelBox::new([0, 0, 0], [50, 50, 0]), None);
        let r = RegionResolver::new(&s, &index);
        let coarse = UserBox::new([0.0; 3], [50.0; 3]);

        // level 1 on disk does not make level 0 available
        let req = ResolveRequest::new(coarse, 0, 0).with_variable("temp");
        assert!(matches!(
            r.resolve(&req),
            Err(VdfError::DataUnavailable { level: 0, .. })
        ));
        assert!(s.is_missing("temp", 0, 0));

        let resolved = r
            .resolve(&ResolveRequest::new(coarse, 1, 0).with_variable("wind"))
            .unwrap();
        assert_eq!(resolved.level_achieved, 0);

        // each variable has a level, but not the same one
        let mixed = ResolveRequest::new(coarse, 1, 0).with_variables(["temp", "hgt"]);
        assert!(matches!(r.resolve(&mixed), Err(VdfError::DataUnavailable { .. })));
        assert!(!s.is_missing("temp", 1, 0));
        assert!(!s.is_missing("hgt", 1, 0));
    }

    fn variable_io(s: &Arc<DatasetSession>, index: &Arc<RwLock<AvailabilityIndex>>) -> VariableIo {
        let io: Arc<dyn IOManager> = Arc::new(MemoryIOManager::new());
        let d = s.descriptor();
        let store = BrickStore::new(io.clone(), d.compression, d.data_type, d.compression_ratios.len());
        VariableIo::new(s.clone(), Box::new(store), io, index.clone())
    }

    #[tokio::test]
    async fn test_sample_point_outside_written_region() {
        let d = DatasetDescriptor::new([16, 16, 8], [0.0, 0.0, 0.0, 15.0, 15.0, 7.0])
            .with_num_transforms(1)
            .with_block_size(BlockSize::cube(8).unwrap())
            .with_variable(VariableInfo::new("temp", VarKind::Volume3D))
            .with_variable(VariableInfo::new("hgt", VarKind::Plane2DXY));
        let s = Arc::new(session(d));
        let index = Arc::new(RwLock::new(AvailabilityIndex::new()));
        let mut vio = variable_io(&s, &index);

        // only the lower x half of temp is written
        let half = VoxelBox::new([0, 0, 0], [7, 15, 7]);
        let data: Vec<f32> = (0..half.num_voxels()).map(|i| i as f32).collect();
        vio.open_write(0, "temp", 1, 0).await.unwrap();
        vio.write_region(&half, &data).await.unwrap();
        vio.close().await.unwrap();

        let plane: Vec<f32> = (0..256).map(|i| (i % 16) as f32).collect();
        vio.open_write(0, "hgt", 1, 0).await.unwrap();
        vio.write_slice(&plane).await.unwrap();
        vio.close().await.unwrap();

        let snapshot = index.read().clone();
        let r = RegionResolver::new(&s, &snapshot);
        assert_eq!(
            r.sample_point(&mut vio, "temp", [3.0, 2.0, 1.0], 1, 0).await.unwrap(),
            PointSample::Value((3 + 8 * 2 + 128) as f32)
        );
        // inside the domain, outside the data on disk
        assert_eq!(
            r.sample_point(&mut vio, "temp", [12.0, 2.0, 1.0], 1, 0).await.unwrap(),
            PointSample::OutOfBounds
        );
        assert_eq!(
            r.sample_point(&mut vio, "temp", [-1.0, 2.0, 1.0], 1, 0).await.unwrap(),
            PointSample::OutOfBounds
        );

        // the collapsed axis of a planar variable is ignored
        assert_eq!(
            r.sample_point(&mut vio, "hgt", [11.0, 4.0, 6.0], 1, 0).await.unwrap(),
            PointSample::Value(11.0)
        );
        assert!(matches!(
            r.sample_point(&mut vio, "hgt", [11.0, 4.0, 6.0], 0, 0).await,
            Err(VdfError::DataUnavailable { level: 0, .. })
        ));
        assert!(!vio.is_open());
    }

    #[test]
    fn test_degenerate_axis_widened() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 1, VoxelBox::full(s.descriptor().dim(1)), None);
        let r = RegionResolver::new(&s, &index);

        let thin = ResolveRequest::new(UserBox::new([50.0, 0.0, 50.0], [50.0, 100.0, 50.0]), 1, 0)
            .with_variable("temp");
        let resolved = r.resolve(&thin).unwrap();
        assert_eq!(resolved.voxels.min[0], 50);
        assert_eq!(resolved.voxels.max[0], 51);
        // at the upper edge the box grows downward
        assert_eq!(resolved.voxels.min[2], 49);
        assert_eq!(resolved.voxels.max[2], 50);

        let flat = r.resolve(&thin.clone().planar()).unwrap();
        assert_eq!(flat.voxels.min[2], flat.voxels.max[2]);
    }

    #[test]
    fn test_planar_variable_ignores_collapsed_axis() {
        let s = session(descriptor());
        let mut index = AvailabilityIndex::new();
        index.record("hgt", 0, 1, VoxelBox::new([0, 0, 0], [100, 100, 0]), None);
        let r = RegionResolver::new(&s, &index);
        let resolved = r.resolve(&request().with_variable("hgt")).unwrap();
        assert_eq!(resolved.voxels, VoxelBox::new([10, 10, 10], [90, 90, 40]));
        assert_eq!(
            resolved.voxels_for(VarKind::Plane2DXY),
            VoxelBox::new([10, 10, 0], [90, 90, 0])
        );
    }

    #[test]
    fn test_layered_height_change() {
        let d = DatasetDescriptor::new([64, 64, 64], [0.0, 0.0, 0.0, 1.0, 1.0, 1.0])
            .with_block_size(BlockSize::cube(32).unwrap())
            .with_grid(GridKind::Layered)
            .with_variable(VariableInfo::new("temp", VarKind::Volume3D));
        let s = session(d);
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 0, VoxelBox::full([64, 64, 64]), None);
        let full = ResolveRequest::new(UserBox::new([0.0; 3], [1.0; 3]), 0, 0).with_variable("temp");

        s.set_layered_grid_height(64).unwrap();
        let before = RegionResolver::new(&s, &index).resolve(&full).unwrap();
        assert_eq!(before.voxels.max[2], 63);
        assert_eq!(before.grid_height, Some(64));

        s.set_layered_grid_height(128).unwrap();
        let after = RegionResolver::new(&s, &index).resolve(&full).unwrap();
        assert_eq!(after.voxels.max[2], 127);
        assert_eq!(after.blocks.max[2], 3);
        assert_eq!(after.grid_height, Some(128));
    }

    #[test]
    fn test_estimate_monotonic() {
        let s = session(descriptor());
        let index = AvailabilityIndex::new();
        let r = RegionResolver::new(&s, &index);
        let small = UserBox::new([40.0, 40.0, 20.0], [45.0, 45.0, 25.0]);
        let large = UserBox::new([0.0; 3], [100.0, 100.0, 50.0]);
        for level in 0..=1 {
            assert!(r.estimate_mb(&small, level, 0) <= r.estimate_mb(&large, level, 0));
        }
        for user in [small, large] {
            assert!(r.estimate_mb(&user, 0, 0) <= r.estimate_mb(&user, 1, 0));
        }
        // one 32^3 block of f32
        assert_eq!(r.estimate_mb(&small, 1, 0), 0.125);
    }

    #[test]
    fn test_region_too_large() {
        let d = DatasetDescriptor::new([512, 512, 512], [0.0, 0.0, 0.0, 1.0, 1.0, 1.0])
            .with_num_transforms(3)
            .with_block_size(BlockSize::cube(32).unwrap())
            .with_variable(VariableInfo::new("temp", VarKind::Volume3D));
        let s = session(d);
        let mut index = AvailabilityIndex::new();
        index.record("temp", 0, 3, VoxelBox::full([512, 512, 512]), None);
        let r = RegionResolver::new(&s, &index).with_budget(CacheBudget::new(2.0, 0.75));

        let all = UserBox::new([0.0; 3], [1.0; 3]);
        let req = ResolveRequest::new(all, 3, 0).with_variable("temp");
        match r.resolve(&req) {
            Err(VdfError::RegionTooLarge {
                estimated_mb,
                budget_mb,
                suggested_level,
            }) => {
                assert_eq!(estimated_mb, 512.0);
                assert_eq!(budget_mb, 1.5);
                assert_eq!(suggested_level, 0);
            }
            other => panic!("expected RegionTooLarge, got {:?}", other),
        }
        assert_eq!(r.max_level_within_budget(&all, 3, 0), Some(0));
        assert!(r.check_budget(&all, 0, 0).is_ok());
        assert!(r.check_budget(&all, 1, 0).is_err());
    }

    #[test]
    fn test_region_state_clamps() {
        let d = Arc::new(
            descriptor()
                .with_num_timesteps(3)
                .with_timestep_extents(2, [50.0, 0.0, 0.0, 150.0, 100.0, 50.0]),
        );
        let mut state = RegionState::new(d.clone(), 0);
        assert_eq!(state.region(), d.user_bounds(0));

        state.set_min([-10.0, 20.0, 60.0]);
        assert_eq!(state.region().min, [0.0, 20.0, 50.0]);
        assert_eq!(state.region().max[2], 50.0);

        state.set_box(UserBox::new([10.0, 10.0, 10.0], [30.0, 30.0, 30.0]));
        state.set_center([95.0, 50.0, 25.0]);
        assert_eq!(state.region().min[0], 85.0);
        assert_eq!(state.region().max[0], 100.0);

        state.set_size([10.0, 10.0, 10.0]);
        assert_eq!(state.region().size()[1], 10.0);

        state.set_timestep(2);
        assert_eq!(state.region().min[0], 87.5);
        state.set_max([60.0, 100.0, 50.0]);
        assert!(state.region().min[0] >= 50.0);
        assert_eq!(state.region().max[0], 60.0);

        state.set_local_region(0, UserBox::new([-5.0; 3], [5.0; 3]));
        state.set_timestep(0);
        assert_eq!(state.region().min, [0.0; 3]);
        state.clear_local_regions();

        let req = state.to_request(1, ["temp"]);
        assert_eq!(req.timestep, 0);
        assert_eq!(req.variables, vec!["temp".to_string()]);

        state.reinit(Arc::new(DatasetDescriptor::new([4, 4, 4], [0.0, 0.0, 0.0, 3.0, 3.0, 3.0])));
        assert_eq!(state.region().max, [3.0, 3.0, 3.0]);
        assert_eq!(state.timestep(), 0);
    }
}
