//! Texture Memory Residency Library
//!
//! Manages fixed-size on-device texture memory split across one or two memory
//! units: a first-fit free list per unit, priority/age eviction with a
//! thrashing guard, placement across units and batched sub-image uploads.

pub mod config;
pub mod device;
pub mod dirty;
pub mod error;
pub mod eviction;
pub mod free_list;
pub mod layout;
pub mod manager;
pub mod node_pool;
pub mod placement;
pub mod residency;
pub mod shared;
pub mod stats;
pub mod upload;

pub use config::{ConfigError, TexMemConfig};
pub use device::{DeviceCaps, HardwareGeneration, UnitId, UnitSpan, BLOCK_SPLIT};
pub use dirty::DirtyRegion;
pub use error::{Result, TexMemError};
pub use free_list::{AllocatedRange, FreeRange, MemoryUnit, ALIGNMENT};
pub use layout::{MipmapMask, TextureCategory, TextureLayout};
pub use manager::TextureMemoryManager;
pub use node_pool::{NodePoolStats, RangeNodePool};
pub use placement::{narrow_split, PlacementPolicy, Transition};
pub use residency::{
    Placement, Residency, Target, TextureId, TextureResidency, TextureStore, TextureTable,
};
pub use shared::SharedTextureMemory;
pub use stats::{TexMemStats, UnitUsage};
pub use upload::{LevelRange, TextureUploader, UploadCall, UploadLog};
