//! Per-texture residency records and the store that owns them
//!
//! The manager never owns textures. It reaches residency records through the
//! [`TextureStore`] trait, implemented by the caller's object model;
//! [`TextureTable`] is a ready-made keyed store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::UnitId;
use crate::dirty::DirtyRegion;
use crate::free_list::AllocatedRange;
use crate::layout::{MipmapMask, TextureLayout};

/// Identity of a texture object
pub type TextureId = u32;

/// Where a texture currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Unit0,
    Unit1,
    /// Odd mip levels on unit 0, even mip levels on unit 1
    Split,
    /// Complete copy on both units
    ReplicateBoth,
    None,
}

impl Placement {
    /// Whether evicting a texture with this placement frees space on `unit`.
    pub fn touches(self, unit: UnitId) -> bool {
        match self {
            Placement::Unit0 => unit == UnitId::Unit0,
            Placement::Unit1 => unit == UnitId::Unit1,
            Placement::Split | Placement::ReplicateBoth => true,
            Placement::None => false,
        }
    }

    /// The target that reproduces this placement.
    pub fn as_target(self) -> Option<Target> {
        match self {
            Placement::Unit0 => Some(Target::Unit0),
            Placement::Unit1 => Some(Target::Unit1),
            Placement::Split => Some(Target::Split),
            Placement::ReplicateBoth => Some(Target::ReplicateBoth),
            Placement::None => None,
        }
    }
}

/// A requested placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Unit0,
    Unit1,
    Split,
    ReplicateBoth,
}

impl Target {
    /// The unit of a single-unit target.
    pub fn single_unit(self) -> Option<UnitId> {
        match self {
            Target::Unit0 => Some(UnitId::Unit0),
            Target::Unit1 => Some(UnitId::Unit1),
            Target::Split | Target::ReplicateBoth => None,
        }
    }
}

impl From<Target> for Placement {
    fn from(target: Target) -> Self {
        match target {
            Target::Unit0 => Placement::Unit0,
            Target::Unit1 => Placement::Unit1,
            Target::Split => Placement::Split,
            Target::ReplicateBoth => Placement::ReplicateBoth,
        }
    }
}

/// One destination of an upload: a unit, an address and the levels it holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadTarget {
    pub unit: UnitId,
    pub address: u32,
    pub mask: MipmapMask,
}

/// Ranges owned by a resident texture.
///
/// Two-unit placements own exactly two ranges, released together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Residency {
    Single(AllocatedRange),
    Split {
        odd: AllocatedRange,
        even: AllocatedRange,
    },
    Replicated {
        unit0: AllocatedRange,
        unit1: AllocatedRange,
    },
}

impl Residency {
    pub fn placement(&self) -> Placement {
        match self {
            Residency::Single(range) => match range.unit() {
                UnitId::Unit0 => Placement::Unit0,
                UnitId::Unit1 => Placement::Unit1,
            },
            Residency::Split { .. } => Placement::Split,
            Residency::Replicated { .. } => Placement::ReplicateBoth,
        }
    }

    /// Upload destinations in unit order.
    pub fn targets(&self) -> Vec<UploadTarget> {
        let target = |range: &AllocatedRange, mask| UploadTarget {
            unit: range.unit(),
            address: range.address(),
            mask,
        };
        match self {
            Residency::Single(range) => vec![target(range, MipmapMask::Both)],
            Residency::Split { odd, even } => {
                vec![target(odd, MipmapMask::Odd), target(even, MipmapMask::Even)]
            }
            Residency::Replicated { unit0, unit1 } => {
                vec![
                    target(unit0, MipmapMask::Both),
                    target(unit1, MipmapMask::Both),
                ]
            }
        }
    }

    pub fn ranges(&self) -> Vec<&AllocatedRange> {
        match self {
            Residency::Single(range) => vec![range],
            Residency::Split { odd, even } => vec![odd, even],
            Residency::Replicated { unit0, unit1 } => vec![unit0, unit1],
        }
    }

    pub(crate) fn into_ranges(self) -> Vec<AllocatedRange> {
        match self {
            Residency::Single(range) => vec![range],
            Residency::Split { odd, even } => vec![odd, even],
            Residency::Replicated { unit0, unit1 } => vec![unit0, unit1],
        }
    }
}

/// Residency bookkeeping for one texture
#[derive(Debug, Clone)]
pub struct TextureResidency {
    layout: TextureLayout,
    residency: Option<Residency>,
    priority: f32,
    last_used_stamp: u32,
    pin_until_frame: u32,
    dirty: Option<DirtyRegion>,
    pool_affinity: Option<UnitId>,
    preferred: Option<Target>,
}

impl TextureResidency {
    pub fn new(layout: TextureLayout) -> Self {
        Self {
            layout,
            residency: None,
            priority: 0.5,
            last_used_stamp: 0,
            pin_until_frame: 0,
            dirty: None,
            pool_affinity: None,
            preferred: None,
        }
    }

    pub fn with_priority(mut self, priority: f32) -> Self {
        self.set_priority(priority);
        self
    }

    pub fn layout(&self) -> &TextureLayout {
        &self.layout
    }

    pub fn is_resident(&self) -> bool {
        self.residency.is_some()
    }

    pub fn placement(&self) -> Placement {
        self.residency
            .as_ref()
            .map_or(Placement::None, Residency::placement)
    }

    pub fn residency(&self) -> Option<&Residency> {
        self.residency.as_ref()
    }

    /// Eviction priority in `[0, 1]`; lower is evicted first.
    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = if priority.is_nan() {
            0.0
        } else {
            priority.clamp(0.0, 1.0)
        };
    }

    pub fn last_used_stamp(&self) -> u32 {
        self.last_used_stamp
    }

    pub fn pin_until_frame(&self) -> u32 {
        self.pin_until_frame
    }

    pub fn is_pinned(&self, current_frame: u32) -> bool {
        self.pin_until_frame > current_frame
    }

    /// Protect the texture from eviction until `frame` (0 unpins).
    pub fn pin_until(&mut self, frame: u32) {
        self.pin_until_frame = frame;
    }

    pub fn dirty(&self) -> Option<DirtyRegion> {
        self.dirty
    }

    pub fn pool_affinity(&self) -> Option<UnitId> {
        self.pool_affinity
    }

    /// Target of the last residency request.
    pub fn preferred_target(&self) -> Option<Target> {
        self.preferred
    }

    pub(crate) fn stamp(&mut self, bind_counter: u32) {
        self.last_used_stamp = bind_counter;
    }

    pub(crate) fn set_residency(&mut self, residency: Residency) {
        self.residency = Some(residency);
    }

    pub(crate) fn take_residency(&mut self) -> Option<Residency> {
        self.residency.take()
    }

    pub(crate) fn set_preferred(&mut self, target: Target) {
        self.preferred = Some(target);
    }

    /// Records the pool on first residency and returns the recorded one.
    pub(crate) fn affinity_or_insert(&mut self, unit: UnitId) -> UnitId {
        *self.pool_affinity.get_or_insert(unit)
    }

    pub(crate) fn merge_dirty(&mut self, region: DirtyRegion) {
        self.dirty = Some(match self.dirty {
            Some(pending) => pending.union(region),
            None => region,
        });
    }

    pub(crate) fn take_dirty(&mut self) -> Option<DirtyRegion> {
        self.dirty.take()
    }
}

/// Caller-owned keyed collection of textures.
///
/// Gives the manager keyed access to residency records, iteration over every
/// known texture, sampler binding state and pixel data for uploads.
pub trait TextureStore {
    fn residency(&self, id: TextureId) -> Option<&TextureResidency>;

    fn residency_mut(&mut self, id: TextureId) -> Option<&mut TextureResidency>;

    /// Every known texture, in a stable order.
    fn texture_ids(&self) -> Vec<TextureId>;

    /// Whether the texture is bound to an active sampler unit.
    fn is_bound(&self, id: TextureId) -> bool;

    /// Pixel data of one mip level, rows tightly packed.
    fn level_data(&self, id: TextureId, level: u8) -> Option<&[u8]>;

    /// Forget a destroyed texture. Returns false if it was unknown.
    fn drop_texture(&mut self, id: TextureId) -> bool;
}

/// A texture held by [`TextureTable`]
#[derive(Debug, Clone)]
pub struct TextureEntry {
    pub residency: TextureResidency,
    /// Pixel data per mip level
    pub levels: Vec<Vec<u8>>,
    /// Bound to an active sampler unit
    pub bound: bool,
}

/// Texture store backed by an ordered map
#[derive(Debug, Default)]
pub struct TextureTable {
    entries: BTreeMap<TextureId, TextureEntry>,
}

impl TextureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a texture with zero-filled pixel data for every level.
    ///
    /// A layout that fails [`TextureLayout::validate`] gets no pixel data;
    /// the manager rejects it on first placement.
    pub fn insert(&mut self, id: TextureId, residency: TextureResidency) {
        let layout = *residency.layout();
        let levels = match layout.validate() {
            Ok(()) => (0..layout.levels)
                .map(|level| vec![0u8; layout.level_bytes(level) as usize])
                .collect(),
            Err(_) => Vec::new(),
        };
        self.insert_with_data(id, residency, levels);
    }

    pub fn insert_with_data(
        &mut self,
        id: TextureId,
        residency: TextureResidency,
        levels: Vec<Vec<u8>>,
    ) {
        let entry = TextureEntry {
            residency,
            levels,
            bound: false,
        };
        self.entries.insert(id, entry);
    }

    /// Remove a texture record. Release its residency through the manager first.
    pub fn remove(&mut self, id: TextureId) -> Option<TextureEntry> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: TextureId) -> Option<&TextureEntry> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: TextureId) -> Option<&mut TextureEntry> {
        self.entries.get_mut(&id)
    }

    pub fn set_bound(&mut self, id: TextureId, bound: bool) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.bound = bound;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.residency.is_resident())
            .count()
    }
}

impl TextureStore for TextureTable {
    fn residency(&self, id: TextureId) -> Option<&TextureResidency> {
        self.entries.get(&id).map(|entry| &entry.residency)
    }

    fn residency_mut(&mut self, id: TextureId) -> Option<&mut TextureResidency> {
        self.entries.get_mut(&id).map(|entry| &mut entry.residency)
    }

    fn texture_ids(&self) -> Vec<TextureId> {
        self.entries.keys().copied().collect()
    }

    fn is_bound(&self, id: TextureId) -> bool {
        self.entries.get(&id).is_some_and(|entry| entry.bound)
    }

    fn level_data(&self, id: TextureId, level: u8) -> Option<&[u8]> {
        self.entries
            .get(&id)?
            .levels
            .get(level as usize)
            .map(Vec::as_slice)
    }

    fn drop_texture(&mut self, id: TextureId) -> bool {
        self.entries.remove(&id).is_some()
    }
}
