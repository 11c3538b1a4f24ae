//! Pending sub-image update regions
//!
//! Every texture keeps at most one pending region. New requests widen it to
//! the bounding box of levels and rows, so several small updates within one
//! flush interval become a single conservative upload per level and target.

use serde::Serialize;

use crate::layout::TextureLayout;

/// Inclusive level and row bounds of pending updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DirtyRegion {
    pub level_min: u8,
    pub level_max: u8,
    pub row_min: u32,
    pub row_max: u32,
}

impl DirtyRegion {
    /// Region for `row_count` rows of `level` starting at `row_start`.
    ///
    /// Returns `None` for an empty request.
    pub fn new(level: u8, row_start: u32, row_count: u32) -> Option<Self> {
        if row_count == 0 {
            return None;
        }
        Some(Self {
            level_min: level,
            level_max: level,
            row_min: row_start,
            row_max: row_start.saturating_add(row_count - 1),
        })
    }

    pub fn union(self, other: DirtyRegion) -> DirtyRegion {
        DirtyRegion {
            level_min: self.level_min.min(other.level_min),
            level_max: self.level_max.max(other.level_max),
            row_min: self.row_min.min(other.row_min),
            row_max: self.row_max.max(other.row_max),
        }
    }

    /// Row span of this region clamped to `level`'s height.
    pub fn rows_for_level(&self, layout: &TextureLayout, level: u8) -> (u32, u32) {
        let last_row = layout.level_height(level) - 1;
        let first = self.row_min.min(last_row);
        let last = self.row_max.clamp(first, last_row);
        (first, last)
    }

    /// Levels of this region that exist in `layout`.
    pub fn levels_in(&self, layout: &TextureLayout) -> std::ops::RangeInclusive<u8> {
        self.level_min..=self.level_max.min(layout.last_level())
    }
}
