//! Device capabilities: memory units, hardware generation and pool model

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TexMemError};

/// Block size older generations carve texture memory into.
///
/// Free ranges are never re-joined across these block boundaries on those
/// generations.
pub const BLOCK_SPLIT: u32 = 0x20_0000;

/// A physical texture memory unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitId {
    Unit0,
    Unit1,
}

impl UnitId {
    /// Both physical units, in index order.
    pub const ALL: [UnitId; 2] = [UnitId::Unit0, UnitId::Unit1];

    pub fn index(self) -> usize {
        match self {
            UnitId::Unit0 => 0,
            UnitId::Unit1 => 1,
        }
    }

    /// The other unit of a dual-unit device.
    pub fn other(self) -> UnitId {
        match self {
            UnitId::Unit0 => UnitId::Unit1,
            UnitId::Unit1 => UnitId::Unit0,
        }
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit {}", self.index())
    }
}

/// Hardware generation of the texture memory controller.
///
/// Generations before [`HardwareGeneration::Gen3`] carve each unit into
/// [`BLOCK_SPLIT`]-sized blocks and must not coalesce free ranges across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareGeneration {
    Gen1,
    Gen2,
    Gen3,
}

impl HardwareGeneration {
    /// Whether free ranges may be merged anywhere in the unit.
    pub fn coalesces_freely(self) -> bool {
        self >= HardwareGeneration::Gen3
    }

    /// Size of the blocks a unit of `capacity` bytes is carved into at init.
    pub fn carve_chunk(self, capacity: u32) -> u32 {
        if self.coalesces_freely() {
            capacity
        } else {
            BLOCK_SPLIT
        }
    }

    /// Mask tested against a unit-relative boundary address before merging.
    ///
    /// A merge at offset `o` is allowed when `o & mask != 0`.
    pub fn boundary_mask(self) -> u32 {
        if self.coalesces_freely() {
            u32::MAX
        } else {
            BLOCK_SPLIT - 1
        }
    }
}

/// Address span `[min_addr, max_addr)` of one memory unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpan {
    pub min_addr: u32,
    pub max_addr: u32,
}

impl UnitSpan {
    pub fn new(min_addr: u32, max_addr: u32) -> Self {
        Self { min_addr, max_addr }
    }

    /// Span starting at address zero.
    pub fn with_capacity(capacity: u32) -> Self {
        Self::new(0, capacity)
    }

    pub fn capacity(&self) -> u32 {
        self.max_addr.saturating_sub(self.min_addr)
    }
}

/// Capability flags of the device the manager runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCaps {
    pub generation: HardwareGeneration,
    /// Both units share one pool; every texture lands on unit 0.
    #[serde(default)]
    pub unified_pool: bool,
    /// Address spans of the physical units (one or two).
    pub units: Vec<UnitSpan>,
}

impl DeviceCaps {
    /// A device with a single texture unit.
    pub fn single(generation: HardwareGeneration, span: UnitSpan) -> Self {
        Self {
            generation,
            unified_pool: false,
            units: vec![span],
        }
    }

    /// A device with two independent texture units.
    pub fn dual(generation: HardwareGeneration, unit0: UnitSpan, unit1: UnitSpan) -> Self {
        Self {
            generation,
            unified_pool: false,
            units: vec![unit0, unit1],
        }
    }

    /// Marks the device as exposing one unified pool.
    pub fn with_unified_pool(mut self) -> Self {
        self.unified_pool = true;
        self
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// True when placement can only ever target unit 0.
    pub fn single_target(&self) -> bool {
        self.unified_pool || self.units.len() < 2
    }

    /// Units that own a free list. A unified pool only keeps unit 0's.
    pub fn managed_units(&self) -> &[UnitSpan] {
        if self.unified_pool {
            &self.units[..self.units.len().min(1)]
        } else {
            &self.units
        }
    }

    pub fn span(&self, unit: UnitId) -> Option<UnitSpan> {
        self.units.get(unit.index()).copied()
    }

    /// Checks unit count and span sanity.
    pub fn validate(&self) -> Result<()> {
        if self.units.is_empty() || self.units.len() > 2 {
            return Err(TexMemError::InvalidDevice(format!(
                "expected 1 or 2 memory units, got {}",
                self.units.len()
            )));
        }
        for (index, span) in self.units.iter().enumerate() {
            if span.max_addr <= span.min_addr {
                return Err(TexMemError::InvalidDevice(format!(
                    "unit {} has an empty address span [{}, {})",
                    index, span.min_addr, span.max_addr
                )));
            }
        }
        Ok(())
    }
}
