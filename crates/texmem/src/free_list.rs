//! Per-unit address-range free list
//!
//! Each memory unit keeps its free space as a list of disjoint ranges sorted by
//! start address. Allocation is first-fit with 32-byte aligned start addresses;
//! the alignment padding belongs to the allocation, so free-byte accounting is
//! exact and a release gives back everything the allocation consumed.
//!
//! Released ranges merge with their neighbours unless the shared edge lies on a
//! protected carving boundary (see [`HardwareGeneration::boundary_mask`]).

use log::{trace, warn};
use serde::Serialize;

use crate::device::{HardwareGeneration, UnitId, UnitSpan};
use crate::error::{Result, TexMemError};
use crate::node_pool::{NodeHandle, RangeNode, RangeNodePool};

/// Alignment of every allocated start address.
pub const ALIGNMENT: u32 = 32;

/// A free byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FreeRange {
    pub start: u32,
    pub end: u32,
}

impl FreeRange {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl From<RangeNode> for FreeRange {
    fn from(node: RangeNode) -> Self {
        Self {
            start: node.start,
            end: node.end,
        }
    }
}

/// A range owned by a resident texture.
///
/// `base..end` is what the allocation consumed from the free list, `start` is
/// the aligned address the texture data lives at (`base <= start`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedRange {
    unit: UnitId,
    node: NodeHandle,
    base: u32,
    start: u32,
    end: u32,
}

impl AllocatedRange {
    pub fn unit(&self) -> UnitId {
        self.unit
    }

    /// Aligned address handed to the upload primitive.
    pub fn address(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    /// Bytes consumed from the free list, alignment padding included.
    pub fn consumed(&self) -> u32 {
        self.end - self.base
    }

    /// The consumed span as a plain range.
    pub fn span(&self) -> FreeRange {
        FreeRange {
            start: self.base,
            end: self.end,
        }
    }
}

/// One physical memory unit and its free list
#[derive(Debug)]
pub struct MemoryUnit {
    id: UnitId,
    span: UnitSpan,
    boundary_mask: u32,
    free_bytes: u32,
    /// Sorted ascending by start address.
    ranges: Vec<NodeHandle>,
}

impl MemoryUnit {
    /// Create a unit and carve its span into the generation's initial blocks.
    pub fn new(
        id: UnitId,
        span: UnitSpan,
        generation: HardwareGeneration,
        pool: &mut RangeNodePool,
    ) -> Result<Self> {
        let capacity = span.capacity();
        let chunk = generation.carve_chunk(capacity).max(1);
        trace!(
            "{} configuration: [{:#010x}, {:#010x})",
            id,
            span.min_addr,
            span.max_addr
        );

        let mut ranges = Vec::new();
        let mut block_start = span.min_addr;
        while block_start < span.max_addr {
            let block_end = block_start.saturating_add(chunk).min(span.max_addr);
            trace!("{}   block {:#010x}-{:#010x}", id, block_start, block_end);
            ranges.push(pool.acquire(block_start, block_end)?);
            block_start = block_end;
        }

        Ok(Self {
            id,
            span,
            boundary_mask: generation.boundary_mask(),
            free_bytes: capacity,
            ranges,
        })
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn span(&self) -> UnitSpan {
        self.span
    }

    pub fn capacity(&self) -> u32 {
        self.span.capacity()
    }

    pub fn free_bytes(&self) -> u32 {
        self.free_bytes
    }

    /// Number of ranges in the free list.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Snapshot of the free list in address order.
    pub fn ranges(&self, pool: &RangeNodePool) -> Vec<FreeRange> {
        self.ranges
            .iter()
            .filter_map(|h| pool.get(*h).copied().map(FreeRange::from))
            .collect()
    }

    pub fn largest_free_range(&self, pool: &RangeNodePool) -> u32 {
        self.ranges(pool)
            .iter()
            .map(FreeRange::len)
            .max()
            .unwrap_or(0)
    }

    /// Whether some free range can hold `size` bytes at an aligned address.
    pub fn fits(&self, pool: &RangeNodePool, size: u32) -> bool {
        self.ranges
            .iter()
            .filter_map(|h| pool.get(*h))
            .any(|node| fit_in(node, size).is_some())
    }

    /// First-fit allocation of `size` bytes.
    ///
    /// # Errors
    ///
    /// [`TexMemError::OutOfSpace`] when no range fits, or
    /// [`TexMemError::NodeAllocationFailure`] when the range node for the
    /// allocation cannot be obtained.
    pub fn allocate(&mut self, pool: &mut RangeNodePool, size: u32) -> Result<AllocatedRange> {
        let found = self.ranges.iter().enumerate().find_map(|(index, handle)| {
            let node = pool.get(*handle)?;
            fit_in(node, size).map(|start| (index, *handle, *node, start))
        });
        let Some((index, handle, node, start)) = found else {
            return Err(TexMemError::OutOfSpace {
                unit: self.id,
                size,
            });
        };

        let end = start + size;
        let allocation_node = if end == node.end {
            // The whole residual goes to the allocation; its node moves with it.
            self.ranges.remove(index);
            handle
        } else {
            let owned = pool.acquire(node.start, end)?;
            if let Some(residual) = pool.get_mut(handle) {
                residual.start = end;
            }
            owned
        };

        self.free_bytes -= end - node.start;
        debug_assert!(self.validate(pool).is_ok());

        Ok(AllocatedRange {
            unit: self.id,
            node: allocation_node,
            base: node.start,
            start,
            end,
        })
    }

    /// Give an allocation back, merging with neighbours where allowed.
    pub fn release(&mut self, pool: &mut RangeNodePool, range: AllocatedRange) {
        let owned = RangeNode {
            start: range.base,
            end: range.end,
        };
        if range.unit != self.id || pool.get(range.node) != Some(&owned) {
            warn!(
                "{}: ignoring release of foreign or stale range {:?}",
                self.id,
                range.span()
            );
            return;
        }
        if owned.start == owned.end {
            pool.release(range.node);
            return;
        }

        self.free_bytes += owned.end - owned.start;

        let position = self
            .ranges
            .iter()
            .position(|h| pool.get(*h).is_some_and(|node| node.start > owned.start))
            .unwrap_or(self.ranges.len());

        let successor = self.ranges.get(position).copied();
        let predecessor = position.checked_sub(1).map(|i| self.ranges[i]);

        let joins_successor = successor
            .and_then(|h| pool.get(h))
            .is_some_and(|next| next.start == owned.end && self.may_merge_at(owned.end));
        let joins_predecessor = predecessor
            .and_then(|h| pool.get(h))
            .is_some_and(|prev| prev.end == owned.start && self.may_merge_at(owned.start));

        match (predecessor, successor) {
            (Some(prev), Some(next)) if joins_predecessor && joins_successor => {
                let next_end = pool.get(next).map_or(owned.end, |n| n.end);
                if let Some(node) = pool.get_mut(prev) {
                    node.end = next_end;
                }
                self.ranges.remove(position);
                pool.release(next);
                pool.release(range.node);
            }
            (Some(prev), _) if joins_predecessor => {
                if let Some(node) = pool.get_mut(prev) {
                    node.end = owned.end;
                }
                pool.release(range.node);
            }
            (_, Some(next)) if joins_successor => {
                if let Some(node) = pool.get_mut(next) {
                    node.start = owned.start;
                }
                pool.release(range.node);
            }
            _ => self.ranges.insert(position, range.node),
        }

        debug_assert!(self.validate(pool).is_ok());
    }

    /// Hand every range node back to the pool and empty the unit.
    pub(crate) fn drain(&mut self, pool: &mut RangeNodePool) {
        for handle in self.ranges.drain(..) {
            pool.release(handle);
        }
        self.free_bytes = 0;
    }

    /// Check ordering, bounds, node validity and the free-byte counter.
    pub fn validate(&self, pool: &RangeNodePool) -> std::result::Result<(), String> {
        let mut previous: Option<RangeNode> = None;
        let mut total: u64 = 0;

        for handle in &self.ranges {
            let node = *pool
                .get(*handle)
                .ok_or_else(|| format!("{}: stale node {:?}", self.id, handle))?;
            if node.start >= node.end {
                return Err(format!("{}: degenerate range {:?}", self.id, node));
            }
            if node.start < self.span.min_addr || node.end > self.span.max_addr {
                return Err(format!("{}: range {:?} outside unit span", self.id, node));
            }
            if let Some(prev) = previous {
                if prev.end > node.start {
                    return Err(format!(
                        "{}: ranges {:?} and {:?} out of order",
                        self.id, prev, node
                    ));
                }
            }
            total += u64::from(node.end - node.start);
            previous = Some(node);
        }

        if total != u64::from(self.free_bytes) {
            return Err(format!(
                "{}: free byte counter {} disagrees with list total {}",
                self.id, self.free_bytes, total
            ));
        }
        Ok(())
    }

    fn may_merge_at(&self, addr: u32) -> bool {
        (addr - self.span.min_addr) & self.boundary_mask != 0
    }
}

/// Aligned start address for `size` bytes inside `node`, if it fits.
fn fit_in(node: &RangeNode, size: u32) -> Option<u32> {
    if node.end - node.start < size {
        return None;
    }
    let start = node.start.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1);
    let end = start.checked_add(size)?;
    (end <= node.end).then_some(start)
}
