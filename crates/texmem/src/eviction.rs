//! Victim selection and the thrashing guard
//!
//! When a unit cannot hold a request, resident textures are ranked by priority
//! (lowest first) and then by age since their last use (oldest first). Pinned
//! textures are never chosen. The [`ThrashGuard`] bounds how many evictions may
//! happen back to back before a request gives up.

use log::trace;

use crate::device::UnitId;
use crate::residency::{TextureId, TextureStore};

/// Age of a texture in bind-counter ticks, safe across counter wraparound.
pub fn texture_age(bind_counter: u32, last_used_stamp: u32) -> u32 {
    bind_counter.wrapping_sub(last_used_stamp)
}

/// Outcome of a victim search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VictimSearch {
    Victim(TextureId),
    /// Candidates exist but every one is inside its pin window
    AllPinned,
    NoCandidates,
}

/// Parameters of one victim search
#[derive(Debug, Clone, Copy)]
pub struct VictimQuery {
    /// Unit that needs space
    pub unit: UnitId,
    /// Every resident texture is a candidate on a unified pool
    pub unified: bool,
    pub bind_counter: u32,
    pub frame: u32,
    /// Texture being placed, never its own victim
    pub exclude: Option<TextureId>,
}

/// Choose the resident texture to evict to free space on `query.unit`.
pub fn find_victim<S: TextureStore + ?Sized>(store: &S, query: &VictimQuery) -> VictimSearch {
    let mut best: Option<(TextureId, f32, u32)> = None;
    let mut pinned = 0usize;

    for id in store.texture_ids() {
        if Some(id) == query.exclude {
            continue;
        }
        let Some(record) = store.residency(id) else {
            continue;
        };
        if !record.is_resident() || !(query.unified || record.placement().touches(query.unit)) {
            continue;
        }
        if record.is_pinned(query.frame) {
            pinned += 1;
            continue;
        }

        let priority = record.priority();
        let age = texture_age(query.bind_counter, record.last_used_stamp());
        let better = match best {
            None => true,
            Some((_, best_priority, best_age)) => {
                priority < best_priority || (priority == best_priority && age > best_age)
            }
        };
        if better {
            best = Some((id, priority, age));
        }
    }

    match best {
        Some((id, priority, age)) => {
            trace!(
                "victim for {}: texture {} (priority {:.3}, age {})",
                query.unit,
                id,
                priority,
                age
            );
            VictimSearch::Victim(id)
        }
        None if pinned > 0 => VictimSearch::AllPinned,
        None => VictimSearch::NoCandidates,
    }
}

/// Bound on consecutive evictions while satisfying requests
#[derive(Debug, Clone)]
pub struct ThrashGuard {
    consecutive: u32,
    last_eviction_frame: u32,
    max_consecutive: u32,
    reset_frames: u32,
}

impl ThrashGuard {
    pub fn new(max_consecutive: u32, reset_frames: u32) -> Self {
        Self {
            consecutive: 0,
            last_eviction_frame: 0,
            max_consecutive,
            reset_frames,
        }
    }

    /// Forget old evictions once enough frames have passed since the last one.
    pub fn begin_request(&mut self, frame: u32) {
        if frame.wrapping_sub(self.last_eviction_frame) > self.reset_frames {
            self.consecutive = 0;
        }
    }

    pub fn may_evict(&self) -> bool {
        self.consecutive < self.max_consecutive
    }

    pub fn record_eviction(&mut self, frame: u32) {
        self.consecutive += 1;
        self.last_eviction_frame = frame;
    }

    pub fn record_fit(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn last_eviction_frame(&self) -> u32 {
        self.last_eviction_frame
    }
}
