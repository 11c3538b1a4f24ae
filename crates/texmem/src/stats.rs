//! Upload, eviction and occupancy statistics

use serde::Serialize;

use crate::device::UnitId;

/// Counters kept by a texture-memory manager
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TexMemStats {
    /// Residency requests received
    pub uploads_requested: u64,
    /// Residency requests that placed texture data
    pub uploads_performed: u64,
    /// Bytes of texture memory filled by full uploads
    pub bytes_uploaded: u64,
    /// Same, per unit
    pub bytes_uploaded_per_unit: [u64; 2],
    /// Textures evicted to make room
    pub evictions: u64,
    pub evictions_this_frame: u32,
    /// Full upload calls issued this frame
    pub uploads_this_frame: u32,
    /// Partial upload calls issued this frame
    pub partial_uploads_this_frame: u32,
    /// Requests aborted by the thrashing guard
    pub thrash_trips: u64,
    /// Requests that ended without space
    pub failed_allocations: u64,
}

impl TexMemStats {
    pub(crate) fn record_bytes(&mut self, unit: UnitId, bytes: u64) {
        self.bytes_uploaded += bytes;
        self.bytes_uploaded_per_unit[unit.index()] += bytes;
    }

    pub(crate) fn reset_frame(&mut self) {
        self.evictions_this_frame = 0;
        self.uploads_this_frame = 0;
        self.partial_uploads_this_frame = 0;
    }

    /// Fraction of residency requests that required an upload.
    pub fn upload_rate(&self) -> f64 {
        if self.uploads_requested == 0 {
            0.0
        } else {
            self.uploads_performed as f64 / self.uploads_requested as f64
        }
    }
}

/// Occupancy snapshot of one unit's free list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnitUsage {
    pub unit: UnitId,
    pub capacity: u32,
    pub free_bytes: u32,
    pub free_ranges: usize,
    pub largest_free_range: u32,
}

impl UnitUsage {
    pub fn used_bytes(&self) -> u32 {
        self.capacity - self.free_bytes
    }

    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            f64::from(self.used_bytes()) / f64::from(self.capacity)
        }
    }

    /// Share of free space outside the largest free range.
    pub fn fragmentation(&self) -> f64 {
        if self.free_bytes == 0 {
            0.0
        } else {
            1.0 - f64::from(self.largest_free_range) / f64::from(self.free_bytes)
        }
    }
}
