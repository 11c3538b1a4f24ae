//! Texture-memory manager
//!
//! Ties the per-unit free lists, the eviction policy, placement and the dirty
//! region coalescer together. One manager exists per rendering context; all
//! counters live in it and every operation takes the caller's texture store
//! and upload primitive explicitly.
//!
//! These are the lock-free entry points. Wrap the manager in a
//! [`SharedTextureMemory`](crate::SharedTextureMemory) to share it.

use log::{debug, warn};

use crate::config::TexMemConfig;
use crate::device::{DeviceCaps, UnitId};
use crate::dirty::DirtyRegion;
use crate::error::{Result, TexMemError};
use crate::eviction::{find_victim, ThrashGuard, VictimQuery, VictimSearch};
use crate::free_list::{AllocatedRange, FreeRange, MemoryUnit};
use crate::layout::{MipmapMask, TextureLayout};
use crate::node_pool::{NodePoolStats, RangeNodePool};
use crate::placement::{narrow_split, PlacementPolicy, Transition};
use crate::residency::{Residency, Target, TextureId, TextureStore, UploadTarget};
use crate::stats::{TexMemStats, UnitUsage};
use crate::upload::{LevelRange, TextureUploader};

/// Residency manager for one device's texture memory
#[derive(Debug)]
pub struct TextureMemoryManager {
    caps: DeviceCaps,
    config: TexMemConfig,
    policy: PlacementPolicy,
    pool: RangeNodePool,
    /// Indexed by unit; a unified pool keeps only unit 0.
    units: Vec<MemoryUnit>,
    bind_counter: u32,
    frame: u32,
    guard: ThrashGuard,
    stats: TexMemStats,
}

impl TextureMemoryManager {
    /// Create a manager and carve every unit's free list.
    ///
    /// # Errors
    ///
    /// [`TexMemError::InvalidDevice`] for a malformed device description and
    /// [`TexMemError::NodeAllocationFailure`] if the initial carving cannot get
    /// range nodes.
    pub fn new(caps: DeviceCaps, config: TexMemConfig) -> Result<Self> {
        caps.validate()?;

        let mut pool = match config.max_range_nodes {
            Some(max) => RangeNodePool::with_max_nodes(max),
            None => RangeNodePool::new(),
        };
        let mut units = Vec::with_capacity(caps.unit_count());
        for (id, span) in UnitId::ALL.into_iter().zip(caps.managed_units()) {
            units.push(MemoryUnit::new(id, *span, caps.generation, &mut pool)?);
        }
        debug!(
            "texture memory: {:?}, {} unit(s){}, {} bytes",
            caps.generation,
            caps.unit_count(),
            if caps.unified_pool { " sharing one pool" } else { "" },
            units.iter().map(|unit| u64::from(unit.capacity())).sum::<u64>()
        );

        let policy = PlacementPolicy::from_config(&config);
        let guard = ThrashGuard::new(
            config.max_consecutive_evictions,
            config.eviction_reset_frames,
        );
        Ok(Self {
            caps,
            config,
            policy,
            pool,
            units,
            bind_counter: 0,
            frame: 0,
            guard,
            stats: TexMemStats::default(),
        })
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn config(&self) -> &TexMemConfig {
        &self.config
    }

    pub fn stats(&self) -> &TexMemStats {
        &self.stats
    }

    pub fn node_pool_stats(&self) -> NodePoolStats {
        self.pool.stats()
    }

    /// Range nodes currently held by free lists and resident textures.
    pub fn live_nodes(&self) -> usize {
        self.pool.live()
    }

    pub fn bind_counter(&self) -> u32 {
        self.bind_counter
    }

    /// Advance the bind counter, wrapping at `u32::MAX`.
    pub fn advance_bind_counter(&mut self) -> u32 {
        self.bind_counter = self.bind_counter.wrapping_add(1);
        self.bind_counter
    }

    pub fn set_bind_counter(&mut self, value: u32) {
        self.bind_counter = value;
    }

    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Start the next frame and reset the per-frame counters.
    pub fn begin_frame(&mut self) -> u32 {
        self.frame = self.frame.wrapping_add(1);
        self.stats.reset_frame();
        self.frame
    }

    /// Jump to an externally tracked frame number.
    pub fn set_frame(&mut self, frame: u32) {
        if frame != self.frame {
            self.stats.reset_frame();
        }
        self.frame = frame;
    }

    /// Free bytes on `unit` (the shared pool on a unified device).
    pub fn free_bytes(&self, unit: UnitId) -> u32 {
        self.unit_index(unit)
            .map_or(0, |index| self.units[index].free_bytes())
    }

    /// Free list of `unit` in address order.
    pub fn free_ranges(&self, unit: UnitId) -> Vec<FreeRange> {
        self.unit_index(unit).map_or_else(
            |_| Vec::new(),
            |index| self.units[index].ranges(&self.pool),
        )
    }

    /// Occupancy of every managed unit.
    pub fn usage(&self) -> Vec<UnitUsage> {
        self.units
            .iter()
            .map(|unit| UnitUsage {
                unit: unit.id(),
                capacity: unit.capacity(),
                free_bytes: unit.free_bytes(),
                free_ranges: unit.range_count(),
                largest_free_range: unit.largest_free_range(&self.pool),
            })
            .collect()
    }

    /// Check every free list for ordering, bounds and byte accounting.
    pub fn validate(&self) -> std::result::Result<(), String> {
        self.units.iter().try_for_each(|unit| unit.validate(&self.pool))
    }

    /// Whether a full copy of `layout` fits on `unit` without evicting.
    ///
    /// Always true on a unified pool, where placement evicts as needed, and
    /// always false for a layout no unit could hold.
    pub fn fits(&self, unit: UnitId, layout: &TextureLayout) -> bool {
        let Ok(size) = layout.footprint(MipmapMask::Both) else {
            return false;
        };
        if self.caps.unified_pool {
            return true;
        }
        self.unit_index(unit)
            .is_ok_and(|index| self.units[index].fits(&self.pool, size))
    }

    /// Stamp a texture as used at the current bind counter.
    pub fn touch<S: TextureStore + ?Sized>(&self, store: &mut S, id: TextureId) -> bool {
        match store.residency_mut(id) {
            Some(record) => {
                record.stamp(self.bind_counter);
                true
            }
            None => false,
        }
    }

    /// Make a texture resident, evicting others as needed, and upload it.
    ///
    /// # Arguments
    ///
    /// * `store` - Caller's textures
    /// * `uploader` - Upload primitive for the device
    /// * `id` - Texture to place
    /// * `hint` - Requested target; the texture's previous target when `None`
    ///
    /// # Errors
    ///
    /// [`TexMemError::OutOfSpace`] or [`TexMemError::NoEligibleVictim`] when no
    /// space could be found; the texture is then left non-resident (or on its
    /// single unit when an upgrade to both units failed).
    /// [`TexMemError::InvalidLayout`] for an empty or oversized layout.
    pub fn request_residency<S, U>(
        &mut self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        hint: Option<Target>,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        self.stats.uploads_requested += 1;

        let record = store.residency(id).ok_or(TexMemError::UnknownTexture(id))?;
        let layout = *record.layout();
        layout.validate()?;
        let current = record.placement();
        let hint = hint.or_else(|| record.preferred_target());
        let size = layout.footprint(MipmapMask::Both)?;
        let chosen = self.policy.choose_placement(&self.caps, size, layout.category, hint);
        let requested = narrow_split(chosen, &layout);

        match Transition::resolve(current, requested) {
            Transition::Keep => {
                self.touch(store, id);
                Ok(())
            }
            Transition::Place(target) => self.place(store, uploader, id, target),
            Transition::EvictThenPlace(target) => {
                if self.config.strict_transitions {
                    return Err(TexMemError::InvalidPlacementTransition {
                        texture: id,
                        from: current,
                        to: target.into(),
                    });
                }
                debug!(
                    "texture {}: {:?} -> {:?} needs a full evict cycle",
                    id, current, target
                );
                self.move_out(store, id);
                self.place(store, uploader, id, target)
            }
            Transition::UpgradeToReplicate => self.upgrade(store, uploader, id),
        }
    }

    /// Evict a texture, releasing every range it owns.
    ///
    /// Non-resident textures are left alone.
    pub fn release_residency<S: TextureStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: TextureId,
    ) -> Result<()> {
        if store.residency(id).is_none() {
            return Err(TexMemError::UnknownTexture(id));
        }
        self.move_out(store, id);
        Ok(())
    }

    /// Evict a destroyed texture and remove it from the store.
    pub fn free_texture<S: TextureStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: TextureId,
    ) -> Result<()> {
        self.release_residency(store, id)?;
        store.drop_texture(id);
        debug!("texture {} freed", id);
        Ok(())
    }

    /// Record a sub-image update of `row_count` rows of `level`.
    ///
    /// A non-resident texture is placed first. The update is uploaded by the
    /// next [`flush_all`](Self::flush_all).
    pub fn mark_dirty<S, U>(
        &mut self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        level: u8,
        row_start: u32,
        row_count: u32,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let resident = store
            .residency(id)
            .ok_or(TexMemError::UnknownTexture(id))?
            .is_resident();
        let Some(region) = DirtyRegion::new(level, row_start, row_count) else {
            return Ok(());
        };
        if !resident {
            self.request_residency(store, uploader, id, None)?;
        }
        if let Some(record) = store.residency_mut(id) {
            record.merge_dirty(region);
        }
        Ok(())
    }

    /// Upload every pending dirty region and clear it.
    ///
    /// Issues one partial upload per affected level and placement target.
    /// Returns the number of partial uploads issued.
    pub fn flush_all<S, U>(&mut self, store: &mut S, uploader: &mut U) -> usize
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let mut issued = 0;

        for id in store.texture_ids() {
            let Some(record) = store.residency_mut(id) else {
                continue;
            };
            let Some(region) = record.take_dirty() else {
                continue;
            };
            let Some(targets) = record.residency().map(Residency::targets) else {
                continue;
            };
            let layout = *record.layout();

            for level in region.levels_in(&layout) {
                let (row_start, row_end) = region.rows_for_level(&layout, level);
                let data = store.level_data(id, level).unwrap_or(&[]);
                for target in &targets {
                    uploader.upload_partial(
                        target.unit,
                        target.address,
                        level,
                        target.mask,
                        data,
                        row_start,
                        row_end,
                    );
                    issued += 1;
                }
            }
        }

        if issued > 0 {
            debug!("flushed {} partial upload(s)", issued);
        }
        self.stats.partial_uploads_this_frame += issued as u32;
        issued
    }

    /// Re-upload one full mip level of a texture to every placement target.
    ///
    /// A non-resident texture is placed instead, which uploads every level.
    pub fn reload_level<S, U>(
        &mut self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        level: u8,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let record = store.residency(id).ok_or(TexMemError::UnknownTexture(id))?;
        if level > record.layout().last_level() {
            warn!("texture {}: ignoring reload of missing level {}", id, level);
            return Ok(());
        }
        let Some(targets) = record.residency().map(Residency::targets) else {
            return self.request_residency(store, uploader, id, None);
        };

        let data = store.level_data(id, level).unwrap_or(&[]);
        for target in targets {
            let levels = LevelRange::single(level);
            uploader.upload(target.unit, target.address, levels, target.mask, &[data]);
            self.stats.uploads_this_frame += 1;
        }
        Ok(())
    }

    /// Put bound textures back on the board after texture memory was lost.
    ///
    /// Every resident texture is evicted; those bound to a sampler unit are
    /// then placed again with their previous placement. Textures that no
    /// longer fit stay off the board. Returns how many were restored.
    ///
    /// # Errors
    ///
    /// Only unrecoverable errors are returned.
    pub fn restore_all_bound<S, U>(&mut self, store: &mut S, uploader: &mut U) -> Result<usize>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let mut bound = Vec::new();
        for id in store.texture_ids() {
            let Some(target) = store
                .residency(id)
                .and_then(|record| record.placement().as_target())
            else {
                continue;
            };
            if store.is_bound(id) {
                bound.push((id, target));
            }
            self.move_out(store, id);
        }

        let mut restored = 0;
        for (id, target) in bound {
            match self.place(store, uploader, id, target) {
                Ok(()) => restored += 1,
                Err(err) if err.is_recoverable() => warn!("texture {} not restored: {}", id, err),
                Err(err) => return Err(err),
            }
        }
        debug!("restored {} bound texture(s)", restored);
        Ok(restored)
    }

    /// Evict everything and hand every range node back.
    ///
    /// Ranges of textures removed from the store without being released
    /// cannot be recovered; they are reported and left out of the returned
    /// counters.
    pub fn close<S: TextureStore + ?Sized>(mut self, store: &mut S) -> NodePoolStats {
        for id in store.texture_ids() {
            self.move_out(store, id);
        }
        for unit in &mut self.units {
            unit.drain(&mut self.pool);
        }
        let leaked = self.pool.live();
        if leaked > 0 {
            warn!("{} range node(s) still held at close", leaked);
        }
        self.pool.stats()
    }

    fn place<S, U>(
        &mut self,
        store: &mut S,
        uploader: &mut U,
        id: TextureId,
        target: Target,
    ) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let layout = *store
            .residency(id)
            .ok_or(TexMemError::UnknownTexture(id))?
            .layout();
        let target = narrow_split(target, &layout);

        let residency = match target.single_unit() {
            Some(requested) => {
                let unit = self.pool_unit(store, id, requested);
                let size = layout.footprint(MipmapMask::Both)?;
                Residency::Single(self.find_space(store, unit, size, id)?)
            }
            None if target == Target::Split => {
                let sizes = [
                    layout.footprint(MipmapMask::Odd)?,
                    layout.footprint(MipmapMask::Even)?,
                ];
                let (odd, even) = self.allocate_pair(store, id, sizes)?;
                Residency::Split { odd, even }
            }
            None => {
                let size = layout.footprint(MipmapMask::Both)?;
                let (unit0, unit1) = self.allocate_pair(store, id, [size, size])?;
                Residency::Replicated { unit0, unit1 }
            }
        };

        self.upload_levels(&*store, uploader, id, &layout, &residency.targets());
        self.commit(store, id, residency, target);
        self.stats.uploads_performed += 1;
        debug!("texture {} placed as {:?}", id, target);
        Ok(())
    }

    /// Add a copy on the other unit to a texture resident on one unit.
    fn upgrade<S, U>(&mut self, store: &mut S, uploader: &mut U, id: TextureId) -> Result<()>
    where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let record = store.residency(id).ok_or(TexMemError::UnknownTexture(id))?;
        let layout = *record.layout();
        let held = match record.residency() {
            Some(Residency::Single(range)) => range.unit(),
            _ => return Ok(()),
        };

        let size = layout.footprint(MipmapMask::Both)?;
        let added = self.find_space(store, held.other(), size, id)?;
        let target = UploadTarget {
            unit: added.unit(),
            address: added.address(),
            mask: MipmapMask::Both,
        };
        self.upload_levels(&*store, uploader, id, &layout, &[target]);

        let Some(record) = store.residency_mut(id) else {
            self.release_range(added);
            return Ok(());
        };
        let existing = match record.take_residency() {
            Some(Residency::Single(range)) => range,
            other => {
                if let Some(residency) = other {
                    record.set_residency(residency);
                }
                self.release_range(added);
                return Ok(());
            }
        };
        let (unit0, unit1) = match held {
            UnitId::Unit0 => (existing, added),
            UnitId::Unit1 => (added, existing),
        };
        let residency = Residency::Replicated { unit0, unit1 };
        self.commit(store, id, residency, Target::ReplicateBoth);
        self.stats.uploads_performed += 1;
        debug!("texture {} upgraded to both units", id);
        Ok(())
    }

    fn commit<S: TextureStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: TextureId,
        residency: Residency,
        target: Target,
    ) {
        let Some(record) = store.residency_mut(id) else {
            for range in residency.into_ranges() {
                self.release_range(range);
            }
            return;
        };
        record.set_residency(residency);
        record.stamp(self.bind_counter);
        record.set_preferred(target);
        // A full upload already carries any pending sub-image updates
        record.take_dirty();
        if self.config.pin_window_frames > 0 {
            record.pin_until(self.frame.saturating_add(self.config.pin_window_frames));
        }
    }

    /// Allocate on unit 0 then unit 1, giving the first range back if the
    /// second allocation fails.
    fn allocate_pair<S: TextureStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: TextureId,
        sizes: [u32; 2],
    ) -> Result<(AllocatedRange, AllocatedRange)> {
        let first = self.find_space(store, UnitId::Unit0, sizes[0], id)?;
        match self.find_space(store, UnitId::Unit1, sizes[1], id) {
            Ok(second) => Ok((first, second)),
            Err(err) => {
                debug!("texture {}: {}; releasing its range on unit 0", id, err);
                self.release_range(first);
                Err(err)
            }
        }
    }

    /// Unit a single-unit placement allocates from.
    ///
    /// The first unit used is recorded as the texture's pool affinity; a
    /// unified pool keeps using it on every later placement.
    fn pool_unit<S: TextureStore + ?Sized>(
        &self,
        store: &mut S,
        id: TextureId,
        requested: UnitId,
    ) -> UnitId {
        match store.residency_mut(id) {
            Some(record) => {
                let affinity = record.affinity_or_insert(requested);
                if self.caps.unified_pool {
                    affinity
                } else {
                    requested
                }
            }
            None => requested,
        }
    }

    /// Find `size` bytes on `unit`, evicting other textures as needed.
    ///
    /// This is the only path that evicts, and the thrashing guard lives here.
    fn find_space<S: TextureStore + ?Sized>(
        &mut self,
        store: &mut S,
        unit: UnitId,
        size: u32,
        placing: TextureId,
    ) -> Result<AllocatedRange> {
        let index = self.unit_index(unit)?;
        let pool_unit = self.units[index].id();

        let capacity = self.units[index].capacity();
        let largest_block = self.caps.generation.carve_chunk(capacity).min(capacity);
        if size > largest_block {
            self.stats.failed_allocations += 1;
            warn!(
                "{}: {} bytes exceed the largest {}-byte block",
                pool_unit, size, largest_block
            );
            return Err(TexMemError::OutOfSpace {
                unit: pool_unit,
                size,
            });
        }

        self.guard.begin_request(self.frame);
        loop {
            match self.units[index].allocate(&mut self.pool, size) {
                Ok(range) => {
                    self.guard.record_fit();
                    return Ok(range);
                }
                Err(TexMemError::OutOfSpace { .. }) => {}
                Err(err) => return Err(err),
            }

            if !self.guard.may_evict() {
                self.stats.thrash_trips += 1;
                self.stats.failed_allocations += 1;
                warn!(
                    "{}: texture thrashing detected after {} consecutive evictions, \
                     failing {}-byte allocation",
                    pool_unit,
                    self.guard.consecutive(),
                    size
                );
                return Err(TexMemError::OutOfSpace {
                    unit: pool_unit,
                    size,
                });
            }

            let query = VictimQuery {
                unit: pool_unit,
                unified: self.caps.unified_pool,
                bind_counter: self.bind_counter,
                frame: self.frame,
                exclude: Some(placing),
            };
            match find_victim(&*store, &query) {
                VictimSearch::Victim(victim) => {
                    debug!(
                        "{}: no free space for {} bytes, evicting texture {}",
                        pool_unit, size, victim
                    );
                    self.move_out(store, victim);
                    self.guard.record_eviction(self.frame);
                    self.stats.evictions += 1;
                    self.stats.evictions_this_frame += 1;
                }
                VictimSearch::AllPinned => {
                    self.stats.failed_allocations += 1;
                    warn!(
                        "{}: no space for {} bytes and every candidate is pinned",
                        pool_unit, size
                    );
                    return Err(TexMemError::NoEligibleVictim {
                        unit: pool_unit,
                        size,
                    });
                }
                VictimSearch::NoCandidates => {
                    self.stats.failed_allocations += 1;
                    warn!("{}: no space for texture ({} bytes)", pool_unit, size);
                    return Err(TexMemError::OutOfSpace {
                        unit: pool_unit,
                        size,
                    });
                }
            }
        }
    }

    fn move_out<S: TextureStore + ?Sized>(&mut self, store: &mut S, id: TextureId) -> bool {
        let Some(record) = store.residency_mut(id) else {
            return false;
        };
        let Some(residency) = record.take_residency() else {
            return false;
        };
        record.take_dirty();
        for range in residency.into_ranges() {
            self.release_range(range);
        }
        debug!("texture {} moved out of texture memory", id);
        true
    }

    fn release_range(&mut self, range: AllocatedRange) {
        match self.units.get_mut(range.unit().index()) {
            Some(unit) => unit.release(&mut self.pool, range),
            None => warn!("dropping range on missing {}", range.unit()),
        }
    }

    fn upload_levels<S, U>(
        &mut self,
        store: &S,
        uploader: &mut U,
        id: TextureId,
        layout: &TextureLayout,
        targets: &[UploadTarget],
    ) where
        S: TextureStore + ?Sized,
        U: TextureUploader + ?Sized,
    {
        let data: Vec<&[u8]> = (0..layout.levels)
            .map(|level| store.level_data(id, level).unwrap_or(&[]))
            .collect();
        let levels = LevelRange {
            first: 0,
            last: layout.last_level(),
        };
        for target in targets {
            uploader.upload(target.unit, target.address, levels, target.mask, &data);
            self.stats.record_bytes(target.unit, layout.mem_required(target.mask));
            self.stats.uploads_this_frame += 1;
        }
    }

    fn unit_index(&self, unit: UnitId) -> Result<usize> {
        let index = if self.caps.unified_pool { 0 } else { unit.index() };
        if index < self.units.len() {
            Ok(index)
        } else {
            Err(TexMemError::InvalidDevice(format!(
                "{} is not present on this device",
                unit
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HardwareGeneration, UnitSpan};
    use crate::residency::{Placement, TextureResidency, TextureTable};
    use crate::upload::{UploadCall, UploadLog};

    const KIB: u32 = 1024;

    fn single(capacity: u32, config: TexMemConfig) -> TextureMemoryManager {
        let span = UnitSpan::with_capacity(capacity);
        let caps = DeviceCaps::single(HardwareGeneration::Gen3, span);
        TextureMemoryManager::new(caps, config).unwrap()
    }

    fn dual(capacity: u32, config: TexMemConfig) -> TextureMemoryManager {
        let span = UnitSpan::with_capacity(capacity);
        let caps = DeviceCaps::dual(HardwareGeneration::Gen3, span, span);
        TextureMemoryManager::new(caps, config).unwrap()
    }

    /// One-level texture of `bytes` bytes (`bytes` must be a multiple of 32).
    fn flat(bytes: u32) -> TextureResidency {
        TextureResidency::new(TextureLayout::new(32, bytes / 32, 1, 1))
    }

    #[test]
    fn test_rejects_bad_device() {
        let caps = DeviceCaps {
            generation: HardwareGeneration::Gen1,
            unified_pool: false,
            units: Vec::new(),
        };
        assert!(matches!(
            TextureMemoryManager::new(caps, TexMemConfig::default()),
            Err(TexMemError::InvalidDevice(_))
        ));
    }

    #[test]
    fn test_unknown_texture() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        assert_eq!(
            manager.request_residency(&mut table, &mut log, 9, None),
            Err(TexMemError::UnknownTexture(9))
        );
        assert_eq!(
            manager.release_residency(&mut table, 9),
            Err(TexMemError::UnknownTexture(9))
        );
    }

    #[test]
    fn test_invalid_layout_is_rejected() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        let huge = TextureLayout::new(65536, 65536, 1, 4);
        table.insert(1, TextureResidency::new(huge));
        table.insert(2, TextureResidency::new(TextureLayout::new(0, 16, 1, 4)));

        let err = manager
            .request_residency(&mut table, &mut log, 1, None)
            .unwrap_err();
        assert!(matches!(err, TexMemError::InvalidLayout(_)));
        assert!(err.is_recoverable());
        assert!(matches!(
            manager.mark_dirty(&mut table, &mut log, 2, 0, 0, 4),
            Err(TexMemError::InvalidLayout(_))
        ));
        assert!(!manager.fits(UnitId::Unit0, &huge));
        assert_eq!(table.resident_count(), 0);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 64 * KIB);
        assert!(log.is_empty());
    }

    #[test]
    fn test_place_stamps_and_uploads() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, TextureResidency::new(TextureLayout::new(16, 16, 5, 2)));
        manager.set_bind_counter(41);

        manager.request_residency(&mut table, &mut log, 1, None).unwrap();

        let record = table.residency(1).unwrap();
        assert_eq!(record.placement(), Placement::Unit0);
        assert_eq!(record.last_used_stamp(), 41, "placement stamps without incrementing");
        assert_eq!(manager.bind_counter(), 41);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 64 * KIB - 682);
        assert_eq!(log.len(), 1);
        assert_eq!(manager.stats().uploads_performed, 1);
        assert_eq!(manager.stats().bytes_uploaded, 682);

        // Already resident: only touched
        manager.set_bind_counter(50);
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(table.residency(1).unwrap().last_used_stamp(), 50);
        assert_eq!(manager.stats().uploads_requested, 2);
    }

    #[test]
    fn test_split_uses_parity_ranges() {
        let mut manager = dual(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        // Levels of 8192, 2048, 512, 128 bytes
        table.insert(1, TextureResidency::new(TextureLayout::new(64, 64, 4, 2)));

        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Split))
            .unwrap();

        assert_eq!(table.residency(1).unwrap().placement(), Placement::Split);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 64 * KIB - (2048 + 128));
        assert_eq!(manager.free_bytes(UnitId::Unit1), 64 * KIB - (8192 + 512));
        let masks: Vec<_> = log
            .calls()
            .iter()
            .map(|call| match call {
                UploadCall::Full { unit, mask, .. } => (*unit, *mask),
                UploadCall::Partial { .. } => panic!("unexpected partial upload"),
            })
            .collect();
        assert_eq!(
            masks,
            vec![
                (UnitId::Unit0, MipmapMask::Odd),
                (UnitId::Unit1, MipmapMask::Even)
            ]
        );
    }

    #[test]
    fn test_split_without_odd_levels_uses_unit1() {
        let mut manager = dual(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(64 * KIB));
        table.insert(2, TextureResidency::new(TextureLayout::new(1024, 1, 1, 1)));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();

        manager
            .request_residency(&mut table, &mut log, 2, Some(Target::Split))
            .unwrap();

        assert_eq!(table.residency(2).unwrap().placement(), Placement::Unit1);
        assert_eq!(table.residency(1).unwrap().placement(), Placement::Unit0);
        assert_eq!(manager.stats().evictions, 0);
        assert_eq!(manager.free_bytes(UnitId::Unit1), 63 * KIB);
        assert_eq!(log.calls()[1].unit(), UnitId::Unit1);

        // The narrowed target is kept, so asking again changes nothing
        manager
            .request_residency(&mut table, &mut log, 2, Some(Target::Split))
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_upgrade_adds_second_copy() {
        let mut manager = dual(256 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(64 * KIB));

        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit0))
            .unwrap();
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit1))
            .unwrap();

        assert_eq!(
            table.residency(1).unwrap().placement(),
            Placement::ReplicateBoth
        );
        assert_eq!(manager.free_bytes(UnitId::Unit0), 192 * KIB);
        assert_eq!(manager.free_bytes(UnitId::Unit1), 192 * KIB);
        assert_eq!(log.len(), 2);
        assert_eq!(log.calls()[1].unit(), UnitId::Unit1);

        // Replicated textures ignore single-unit requests
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit0))
            .unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_failed_upgrade_keeps_existing_copy() {
        let mut manager = dual(64 * KIB, TexMemConfig::default().with_pin_window(5));
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(32 * KIB));
        table.insert(2, flat(64 * KIB));
        manager
            .request_residency(&mut table, &mut log, 2, Some(Target::Unit1))
            .unwrap();
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit0))
            .unwrap();
        let unit0_before = manager.free_ranges(UnitId::Unit0);

        let err = manager
            .request_residency(&mut table, &mut log, 1, Some(Target::ReplicateBoth))
            .unwrap_err();

        assert_eq!(
            err,
            TexMemError::NoEligibleVictim {
                unit: UnitId::Unit1,
                size: 32 * KIB,
            }
        );
        let record = table.residency(1).unwrap();
        assert_eq!(record.placement(), Placement::Unit0);
        assert!(table.residency(2).unwrap().is_resident());
        assert_eq!(manager.free_ranges(UnitId::Unit0), unit0_before);
        assert_eq!(manager.free_bytes(UnitId::Unit1), 0);
        assert_eq!(log.len(), 2);
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_split_transition_evicts_first() {
        let mut manager = dual(256 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        // Levels of 64 KiB and 16 KiB
        table.insert(1, TextureResidency::new(TextureLayout::new(128, 128, 2, 4)));

        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit1))
            .unwrap();
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Split))
            .unwrap();

        assert_eq!(table.residency(1).unwrap().placement(), Placement::Split);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 240 * KIB);
        assert_eq!(manager.free_bytes(UnitId::Unit1), 192 * KIB);
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_strict_transitions_reject_split_changes() {
        let config = TexMemConfig::default().with_strict_transitions(true);
        let mut manager = dual(256 * KIB, config);
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, TextureResidency::new(TextureLayout::new(128, 128, 2, 4)));

        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Split))
            .unwrap();
        let err = manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit0))
            .unwrap_err();
        assert_eq!(
            err,
            TexMemError::InvalidPlacementTransition {
                texture: 1,
                from: Placement::Split,
                to: Placement::Unit0,
            }
        );
        assert_eq!(table.residency(1).unwrap().placement(), Placement::Split);
    }

    #[test]
    fn test_pair_allocation_rolls_back() {
        let span0 = UnitSpan::with_capacity(128 * KIB);
        let span1 = UnitSpan::with_capacity(32 * KIB);
        let caps = DeviceCaps::dual(HardwareGeneration::Gen3, span0, span1);
        let mut manager = TextureMemoryManager::new(caps, TexMemConfig::default()).unwrap();
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(64 * KIB));

        let err = manager
            .request_residency(&mut table, &mut log, 1, Some(Target::ReplicateBoth))
            .unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(manager.free_bytes(UnitId::Unit0), 128 * KIB);
        assert!(!table.residency(1).unwrap().is_resident());
        assert!(log.is_empty());
    }

    #[test]
    fn test_thrash_guard_bounds_evictions() {
        let mut manager = single(4 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        for id in 1..=4 {
            table.insert(id, flat(KIB));
            manager.request_residency(&mut table, &mut log, id, None).unwrap();
        }
        table.insert(10, flat(4 * KIB));

        let err = manager
            .request_residency(&mut table, &mut log, 10, None)
            .unwrap_err();
        assert_eq!(
            err,
            TexMemError::OutOfSpace {
                unit: UnitId::Unit0,
                size: 4 * KIB,
            }
        );
        assert_eq!(manager.stats().evictions, 3);
        assert_eq!(manager.stats().thrash_trips, 1);
        assert_eq!(table.resident_count(), 1);

        // Still inside the reset window: no further evictions
        manager.set_frame(10);
        assert!(manager.request_residency(&mut table, &mut log, 10, None).is_err());
        assert_eq!(manager.stats().evictions, 3);

        manager.set_frame(11);
        manager.request_residency(&mut table, &mut log, 10, None).unwrap();
        assert_eq!(manager.stats().evictions, 4);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 0);
    }

    #[test]
    fn test_pinned_textures_survive() {
        let mut manager = single(2 * KIB, TexMemConfig::default().with_pin_window(5));
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        for id in 1..=3 {
            table.insert(id, flat(KIB));
        }
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();
        manager.request_residency(&mut table, &mut log, 2, None).unwrap();

        let err = manager
            .request_residency(&mut table, &mut log, 3, None)
            .unwrap_err();
        assert_eq!(
            err,
            TexMemError::NoEligibleVictim {
                unit: UnitId::Unit0,
                size: KIB,
            }
        );
        assert_eq!(table.resident_count(), 2);

        manager.set_frame(5);
        manager.request_residency(&mut table, &mut log, 3, None).unwrap();
        assert!(!table.residency(1).unwrap().is_resident());
        assert!(table.residency(2).unwrap().is_resident());
    }

    #[test]
    fn test_oversized_request_evicts_nothing() {
        let mut manager = single(4 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));
        table.insert(2, flat(8 * KIB));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();

        assert!(manager.request_residency(&mut table, &mut log, 2, None).is_err());
        assert!(table.residency(1).unwrap().is_resident());
        assert_eq!(manager.stats().evictions, 0);
    }

    #[test]
    fn test_request_larger_than_block_evicts_nothing() {
        let span = UnitSpan::with_capacity(4096 * KIB);
        let caps = DeviceCaps::single(HardwareGeneration::Gen1, span);
        let mut manager = TextureMemoryManager::new(caps, TexMemConfig::default()).unwrap();
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        for id in 1..=4 {
            table.insert(id, flat(256 * KIB));
            manager.request_residency(&mut table, &mut log, id, None).unwrap();
        }
        table.insert(10, flat(3072 * KIB));

        let err = manager
            .request_residency(&mut table, &mut log, 10, None)
            .unwrap_err();

        assert_eq!(
            err,
            TexMemError::OutOfSpace {
                unit: UnitId::Unit0,
                size: 3072 * KIB,
            }
        );
        assert_eq!(manager.stats().evictions, 0);
        assert_eq!(table.resident_count(), 4);
        assert_eq!(manager.free_bytes(UnitId::Unit0), 3072 * KIB);
    }

    #[test]
    fn test_unified_pool_affinity() {
        let span = UnitSpan::with_capacity(64 * KIB);
        let caps = DeviceCaps::dual(HardwareGeneration::Gen3, span, span);
        let caps = caps.with_unified_pool();
        let mut manager = TextureMemoryManager::new(caps, TexMemConfig::default()).unwrap();
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));

        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit1))
            .unwrap();
        let record = table.residency(1).unwrap();
        assert_eq!(record.placement(), Placement::Unit0);
        assert_eq!(record.pool_affinity(), Some(UnitId::Unit0));

        manager.release_residency(&mut table, 1).unwrap();
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Unit1))
            .unwrap();
        assert_eq!(
            table.residency(1).unwrap().pool_affinity(),
            Some(UnitId::Unit0)
        );
        assert_eq!(manager.usage().len(), 1);
        assert!(manager.fits(UnitId::Unit1, &TextureLayout::new(1024, 1024, 1, 4)));
    }

    #[test]
    fn test_mark_dirty_places_texture() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, TextureResidency::new(TextureLayout::new(32, 32, 3, 1)));

        manager.mark_dirty(&mut table, &mut log, 1, 1, 2, 4).unwrap();
        assert!(table.residency(1).unwrap().is_resident());
        assert!(table.residency(1).unwrap().dirty().is_some());

        // Zero rows: nothing recorded, nothing placed
        table.insert(2, flat(KIB));
        manager.mark_dirty(&mut table, &mut log, 2, 0, 0, 0).unwrap();
        assert!(!table.residency(2).unwrap().is_resident());
    }

    #[test]
    fn test_eviction_discards_dirty_region() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));

        manager.mark_dirty(&mut table, &mut log, 1, 0, 0, 4).unwrap();
        manager.release_residency(&mut table, 1).unwrap();
        assert!(table.residency(1).unwrap().dirty().is_none());
        assert_eq!(manager.flush_all(&mut table, &mut log), 0);
    }

    #[test]
    fn test_flush_split_issues_both_targets() {
        let mut manager = dual(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, TextureResidency::new(TextureLayout::new(64, 64, 4, 2)));
        manager
            .request_residency(&mut table, &mut log, 1, Some(Target::Split))
            .unwrap();
        log.clear();

        manager.mark_dirty(&mut table, &mut log, 1, 1, 0, 8).unwrap();
        assert_eq!(manager.flush_all(&mut table, &mut log), 2);
        let masks: Vec<_> = log
            .partial_calls()
            .map(|call| match call {
                UploadCall::Partial {
                    mask,
                    row_start,
                    row_end,
                    ..
                } => (*mask, *row_start, *row_end),
                UploadCall::Full { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(
            masks,
            vec![(MipmapMask::Odd, 0, 7), (MipmapMask::Even, 0, 7)]
        );
        assert_eq!(manager.stats().partial_uploads_this_frame, 2);

        manager.begin_frame();
        assert_eq!(manager.stats().partial_uploads_this_frame, 0);
    }

    #[test]
    fn test_reload_level_targets_every_copy() {
        let mut manager = dual(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, TextureResidency::new(TextureLayout::new(16, 16, 3, 1)));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();
        assert_eq!(
            table.residency(1).unwrap().placement(),
            Placement::ReplicateBoth
        );
        log.clear();

        manager.reload_level(&mut table, &mut log, 1, 2).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.calls().iter().all(|call| matches!(
            call,
            UploadCall::Full {
                levels: LevelRange { first: 2, last: 2 },
                bytes: 16,
                ..
            }
        )));

        manager.reload_level(&mut table, &mut log, 1, 7).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_restore_evicts_unbound() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        for id in 1..=3 {
            table.insert(id, flat(KIB));
            manager.request_residency(&mut table, &mut log, id, None).unwrap();
        }
        table.set_bound(2, true);
        log.clear();

        let restored = manager.restore_all_bound(&mut table, &mut log).unwrap();
        assert_eq!(restored, 1);
        assert_eq!(log.len(), 1);
        assert!(table.residency(2).unwrap().is_resident());
        assert!(!table.residency(1).unwrap().is_resident());
        assert!(!table.residency(3).unwrap().is_resident());
        assert_eq!(manager.free_bytes(UnitId::Unit0), 63 * KIB);
    }

    #[test]
    fn test_restore_skips_texture_that_no_longer_fits() {
        // Blocks of 2 MiB and 1 MiB
        let span = UnitSpan::with_capacity(3072 * KIB);
        let caps = DeviceCaps::single(HardwareGeneration::Gen1, span);
        let config = TexMemConfig::default().with_pin_window(1);
        let mut manager = TextureMemoryManager::new(caps, config).unwrap();
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(1024 * KIB));
        table.insert(2, flat(512 * KIB));
        table.insert(3, flat(1536 * KIB));
        for id in [3, 1, 2] {
            manager.request_residency(&mut table, &mut log, id, None).unwrap();
            table.set_bound(id, true);
        }
        assert_eq!(manager.free_bytes(UnitId::Unit0), 0);

        // Restored in id order, 1 and 2 take the first block and 3 no longer fits
        let restored = manager.restore_all_bound(&mut table, &mut log).unwrap();

        assert_eq!(restored, 2);
        assert!(table.residency(1).unwrap().is_resident());
        assert!(table.residency(2).unwrap().is_resident());
        assert!(!table.residency(3).unwrap().is_resident());
        assert_eq!(manager.free_bytes(UnitId::Unit0), 1536 * KIB);
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_free_texture_drops_record() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();

        manager.free_texture(&mut table, 1).unwrap();
        assert!(table.get(1).is_none());
        assert_eq!(manager.free_bytes(UnitId::Unit0), 64 * KIB);
    }

    #[test]
    fn test_node_exhaustion_is_fatal() {
        let config = TexMemConfig::default().with_max_range_nodes(1);
        let mut manager = single(64 * KIB, config);
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));

        let err = manager
            .request_residency(&mut table, &mut log, 1, None)
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert_eq!(manager.free_bytes(UnitId::Unit0), 64 * KIB);
    }

    #[test]
    fn test_close_returns_every_node() {
        let mut manager = dual(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));
        table.insert(2, flat(64 * KIB));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();
        manager
            .request_residency(&mut table, &mut log, 2, Some(Target::Unit1))
            .unwrap();

        let stats = manager.close(&mut table);
        assert_eq!(stats.recycled, stats.fresh + stats.reused);
        assert_eq!(table.resident_count(), 0);
    }

    #[test]
    fn test_close_after_unreleased_removal() {
        let mut manager = single(64 * KIB, TexMemConfig::default());
        let mut table = TextureTable::new();
        let mut log = UploadLog::new();
        table.insert(1, flat(KIB));
        manager.request_residency(&mut table, &mut log, 1, None).unwrap();
        assert!(table.remove(1).is_some());

        let stats = manager.close(&mut table);
        assert!(stats.recycled < stats.fresh + stats.reused);
    }
}
