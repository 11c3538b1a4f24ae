//! Error types for the texture-memory manager

use crate::device::UnitId;
use crate::residency::{Placement, TextureId};

/// Errors raised by allocation, eviction and residency operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TexMemError {
    /// No free range fits, even after evicting every eligible texture or after
    /// the thrashing guard stopped further eviction.
    #[error("out of texture memory: {size} bytes requested on {unit}")]
    OutOfSpace { unit: UnitId, size: u32 },

    /// Space was short and every resident candidate on the unit is pinned.
    #[error("no eligible eviction victim on {unit} for {size} bytes (all candidates pinned)")]
    NoEligibleVictim { unit: UnitId, size: u32 },

    /// The range node pool is empty and fresh node storage could not be obtained.
    #[error("range node storage exhausted ({live} live nodes)")]
    NodeAllocationFailure { live: usize },

    /// A resident texture was asked to move between a split and a non-split
    /// placement while strict transitions are enabled.
    #[error("invalid placement transition for texture {texture}: {from:?} -> {to:?}")]
    InvalidPlacementTransition {
        texture: TextureId,
        from: Placement,
        to: Placement,
    },

    /// The texture store has no record for this identity.
    #[error("unknown texture {0}")]
    UnknownTexture(TextureId),

    /// Texture dimensions that are empty or larger than any address space.
    #[error("invalid texture layout: {0}")]
    InvalidLayout(String),

    /// A memory unit is missing or misconfigured for this device.
    #[error("invalid device configuration: {0}")]
    InvalidDevice(String),
}

impl TexMemError {
    /// Returns true for the space-exhaustion family of errors.
    pub fn is_out_of_space(&self) -> bool {
        matches!(
            self,
            TexMemError::OutOfSpace { .. } | TexMemError::NoEligibleVictim { .. }
        )
    }

    /// Returns false only for failures the owning context cannot survive.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TexMemError::NodeAllocationFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, TexMemError>;
