//! Choosing the unit(s) a texture is placed on

use crate::config::TexMemConfig;
use crate::device::DeviceCaps;
use crate::layout::{MipmapMask, TextureCategory, TextureLayout};
use crate::residency::{Placement, Target};

/// Size thresholds that steer small textures onto both units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacementPolicy {
    pub replicate_threshold: u32,
    pub replicate_threshold_luminance: u32,
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self::from_config(&TexMemConfig::default())
    }
}

impl PlacementPolicy {
    pub fn from_config(config: &TexMemConfig) -> Self {
        Self {
            replicate_threshold: config.replicate_threshold,
            replicate_threshold_luminance: config.replicate_threshold_luminance,
        }
    }

    pub fn threshold_for(&self, category: TextureCategory) -> u32 {
        if category.is_luminance_like() {
            self.replicate_threshold_luminance
        } else {
            self.replicate_threshold
        }
    }

    /// Pick a target for a texture needing `size_one_unit` bytes for a full copy.
    ///
    /// Devices with one unit or a unified pool always get `Unit0`. Explicit
    /// `Split` and `ReplicateBoth` requests are honoured; otherwise textures
    /// below the category's threshold are replicated and the rest go to the
    /// hinted unit (unit 0 without a hint).
    pub fn choose_placement(
        &self,
        caps: &DeviceCaps,
        size_one_unit: u32,
        category: TextureCategory,
        hint: Option<Target>,
    ) -> Target {
        if caps.single_target() {
            return Target::Unit0;
        }
        match hint {
            Some(target @ (Target::Split | Target::ReplicateBoth)) => target,
            _ if size_one_unit < self.threshold_for(category) => Target::ReplicateBoth,
            Some(target) => target,
            None => Target::Unit0,
        }
    }
}

/// Turn `Split` into `Unit1` for a texture without odd levels.
///
/// Even levels live on unit 1, so a one-level texture has nothing for unit 0.
pub fn narrow_split(target: Target, layout: &TextureLayout) -> Target {
    match target {
        Target::Split if layout.mem_required(MipmapMask::Odd) == 0 => Target::Unit1,
        other => other,
    }
}

/// What re-placing a texture requires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Not resident; place normally
    Place(Target),
    /// Already where it needs to be
    Keep,
    /// Leaving or entering `Split`; evict fully, then place
    EvictThenPlace(Target),
    /// Resident on one unit; add a copy on the other
    UpgradeToReplicate,
}

impl Transition {
    pub fn resolve(current: Placement, requested: Target) -> Self {
        match current {
            Placement::None => Transition::Place(requested),
            current if current == Placement::from(requested) => Transition::Keep,
            Placement::Split => Transition::EvictThenPlace(requested),
            _ if requested == Target::Split => Transition::EvictThenPlace(requested),
            Placement::ReplicateBoth => Transition::Keep,
            Placement::Unit0 | Placement::Unit1 => Transition::UpgradeToReplicate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{HardwareGeneration, UnitSpan};

    const GENERAL: TextureCategory = TextureCategory::General;

    fn dual() -> DeviceCaps {
        let span = UnitSpan::with_capacity(1 << 21);
        DeviceCaps::dual(HardwareGeneration::Gen2, span, span)
    }

    #[test]
    fn test_single_target_devices_use_unit0() {
        let policy = PlacementPolicy::default();
        let single = DeviceCaps::single(HardwareGeneration::Gen1, UnitSpan::with_capacity(1 << 21));
        assert_eq!(
            policy.choose_placement(&single, 100, GENERAL, Some(Target::Split)),
            Target::Unit0
        );

        let unified = dual().with_unified_pool();
        assert_eq!(
            policy.choose_placement(&unified, 100, GENERAL, Some(Target::ReplicateBoth)),
            Target::Unit0
        );
    }

    #[test]
    fn test_small_luminance_is_replicated() {
        let policy = PlacementPolicy::default();
        let caps = dual();
        let luminance = TextureCategory::Luminance;
        assert_eq!(
            policy.choose_placement(&caps, 4000, luminance, None),
            Target::ReplicateBoth
        );
        assert_eq!(policy.choose_placement(&caps, 9000, luminance, None), Target::Unit0);
        assert_eq!(
            policy.choose_placement(&caps, 9000, GENERAL, Some(Target::Unit1)),
            Target::ReplicateBoth
        );
    }

    #[test]
    fn test_large_textures_follow_hint() {
        let policy = PlacementPolicy::default();
        let caps = dual();
        assert_eq!(
            policy.choose_placement(&caps, 1 << 20, GENERAL, Some(Target::Unit1)),
            Target::Unit1
        );
        assert_eq!(
            policy.choose_placement(&caps, 100, GENERAL, Some(Target::Split)),
            Target::Split
        );
    }

    #[test]
    fn test_narrow_split() {
        let one_level = TextureLayout::new(64, 64, 1, 4);
        let two_levels = TextureLayout::new(64, 64, 2, 4);
        assert_eq!(narrow_split(Target::Split, &one_level), Target::Unit1);
        assert_eq!(narrow_split(Target::Split, &two_levels), Target::Split);
        assert_eq!(narrow_split(Target::Unit0, &one_level), Target::Unit0);
        assert_eq!(
            narrow_split(Target::ReplicateBoth, &one_level),
            Target::ReplicateBoth
        );
    }

    #[test]
    fn test_transitions() {
        use Transition::*;
        let resolve = Transition::resolve;
        assert_eq!(resolve(Placement::None, Target::Unit1), Place(Target::Unit1));
        assert_eq!(resolve(Placement::Unit0, Target::Unit0), Keep);
        assert_eq!(
            resolve(Placement::Split, Target::Unit0),
            EvictThenPlace(Target::Unit0)
        );
        assert_eq!(
            resolve(Placement::Unit1, Target::Split),
            EvictThenPlace(Target::Split)
        );
        assert_eq!(
            resolve(Placement::ReplicateBoth, Target::Split),
            EvictThenPlace(Target::Split)
        );
        assert_eq!(resolve(Placement::ReplicateBoth, Target::Unit1), Keep);
        assert_eq!(resolve(Placement::Unit0, Target::Unit1), UpgradeToReplicate);
        assert_eq!(
            resolve(Placement::Unit1, Target::ReplicateBoth),
            UpgradeToReplicate
        );
    }
}
