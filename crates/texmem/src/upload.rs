//! Upload primitive seam
//!
//! The wire protocol to the graphics hardware is outside this crate. The
//! manager drives whatever implements [`TextureUploader`]; [`UploadLog`] records
//! the calls instead of sending them anywhere.

use serde::Serialize;

use crate::device::UnitId;
use crate::layout::MipmapMask;

/// Inclusive range of mip levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelRange {
    pub first: u8,
    pub last: u8,
}

impl LevelRange {
    pub fn single(level: u8) -> Self {
        Self {
            first: level,
            last: level,
        }
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u8> {
        self.first..=self.last
    }
}

/// Sends texture data into device memory.
pub trait TextureUploader {
    /// Upload whole mip levels starting at `address`.
    ///
    /// `data[i]` holds level `levels.first + i`; only levels selected by
    /// `mask` are placed in memory.
    fn upload(
        &mut self,
        unit: UnitId,
        address: u32,
        levels: LevelRange,
        mask: MipmapMask,
        data: &[&[u8]],
    );

    /// Upload rows `row_start..=row_end` of one mip level.
    ///
    /// `data` is the complete level, rows tightly packed.
    #[allow(clippy::too_many_arguments)]
    fn upload_partial(
        &mut self,
        unit: UnitId,
        address: u32,
        level: u8,
        mask: MipmapMask,
        data: &[u8],
        row_start: u32,
        row_end: u32,
    );
}

/// One recorded upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadCall {
    Full {
        unit: UnitId,
        address: u32,
        levels: LevelRange,
        mask: MipmapMask,
        bytes: usize,
    },
    Partial {
        unit: UnitId,
        address: u32,
        level: u8,
        mask: MipmapMask,
        row_start: u32,
        row_end: u32,
    },
}

impl UploadCall {
    pub fn unit(&self) -> UnitId {
        match self {
            UploadCall::Full { unit, .. } | UploadCall::Partial { unit, .. } => *unit,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, UploadCall::Partial { .. })
    }
}

/// Uploader that only records what it was asked to do
#[derive(Debug, Default)]
pub struct UploadLog {
    calls: Vec<UploadCall>,
}

impl UploadLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> &[UploadCall] {
        &self.calls
    }

    pub fn partial_calls(&self) -> impl Iterator<Item = &UploadCall> {
        self.calls.iter().filter(|call| call.is_partial())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }

    pub fn take(&mut self) -> Vec<UploadCall> {
        std::mem::take(&mut self.calls)
    }
}

impl TextureUploader for UploadLog {
    fn upload(
        &mut self,
        unit: UnitId,
        address: u32,
        levels: LevelRange,
        mask: MipmapMask,
        data: &[&[u8]],
    ) {
        let bytes = levels
            .iter()
            .zip(data)
            .filter(|(level, _)| mask.includes(*level))
            .map(|(_, level_data)| level_data.len())
            .sum();
        self.calls.push(UploadCall::Full {
            unit,
            address,
            levels,
            mask,
            bytes,
        });
    }

    fn upload_partial(
        &mut self,
        unit: UnitId,
        address: u32,
        level: u8,
        mask: MipmapMask,
        _data: &[u8],
        row_start: u32,
        row_end: u32,
    ) {
        self.calls.push(UploadCall::Partial {
            unit,
            address,
            level,
            mask,
            row_start,
            row_end,
        });
    }
}
