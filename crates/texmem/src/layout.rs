//! Texture geometry and mip-level memory requirements

use serde::{Deserialize, Serialize};

use crate::error::{Result, TexMemError};

/// Usage category of a texture, used by the placement heuristics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextureCategory {
    #[default]
    General,
    /// Single-channel luminance data such as lightmaps
    Luminance,
    /// Single-channel intensity data
    Intensity,
}

impl TextureCategory {
    pub fn is_luminance_like(self) -> bool {
        matches!(self, TextureCategory::Luminance | TextureCategory::Intensity)
    }
}

/// Which mip levels of a texture an upload or allocation covers.
///
/// Level parity is counted from the base level (level 0 is even).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MipmapMask {
    Both,
    Odd,
    Even,
}

impl MipmapMask {
    pub fn includes(self, level: u8) -> bool {
        match self {
            MipmapMask::Both => true,
            MipmapMask::Odd => level % 2 == 1,
            MipmapMask::Even => level % 2 == 0,
        }
    }
}

/// Dimensions and mip chain of a texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureLayout {
    /// Width of the base level in texels
    pub width: u32,
    /// Height of the base level in texels
    pub height: u32,
    /// Number of mip levels, base level included
    pub levels: u8,
    pub bytes_per_texel: u32,
    #[serde(default)]
    pub category: TextureCategory,
}

impl TextureLayout {
    pub fn new(width: u32, height: u32, levels: u8, bytes_per_texel: u32) -> Self {
        Self {
            width,
            height,
            levels: levels.max(1),
            bytes_per_texel,
            category: TextureCategory::General,
        }
    }

    pub fn with_category(mut self, category: TextureCategory) -> Self {
        self.category = category;
        self
    }

    /// Width of `level` in texels (never below one).
    pub fn level_width(&self, level: u8) -> u32 {
        self.width.checked_shr(u32::from(level)).unwrap_or(0).max(1)
    }

    /// Height of `level` in rows (never below one).
    pub fn level_height(&self, level: u8) -> u32 {
        self.height.checked_shr(u32::from(level)).unwrap_or(0).max(1)
    }

    pub fn row_bytes(&self, level: u8) -> u64 {
        u64::from(self.level_width(level)) * u64::from(self.bytes_per_texel)
    }

    pub fn level_bytes(&self, level: u8) -> u64 {
        self.row_bytes(level)
            .saturating_mul(u64::from(self.level_height(level)))
    }

    /// Bytes of texture memory needed to hold the levels selected by `mask`.
    ///
    /// Saturates instead of wrapping for layouts no device could hold.
    pub fn mem_required(&self, mask: MipmapMask) -> u64 {
        (0..self.levels)
            .filter(|level| mask.includes(*level))
            .fold(0u64, |total, level| {
                total.saturating_add(self.level_bytes(level))
            })
    }

    /// [`mem_required`](Self::mem_required) as a size within a unit's
    /// address space.
    ///
    /// # Errors
    ///
    /// [`TexMemError::InvalidLayout`] if the levels do not fit in 32 bits.
    pub fn footprint(&self, mask: MipmapMask) -> Result<u32> {
        let bytes = self.mem_required(mask);
        u32::try_from(bytes).map_err(|_| {
            TexMemError::InvalidLayout(format!(
                "{}x{}x{} with {} level(s) needs {} bytes",
                self.width, self.height, self.bytes_per_texel, self.levels, bytes
            ))
        })
    }

    /// Reject layouts that are empty or larger than any address space.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 || self.bytes_per_texel == 0 || self.levels == 0 {
            return Err(TexMemError::InvalidLayout(format!(
                "{}x{}x{} with {} level(s) is empty",
                self.width, self.height, self.bytes_per_texel, self.levels
            )));
        }
        self.footprint(MipmapMask::Both).map(|_| ())
    }

    pub fn last_level(&self) -> u8 {
        self.levels.saturating_sub(1)
    }
}
