//! Recycling arena for free-list range nodes
//!
//! Released nodes go back on a recycle stack instead of being dropped, and
//! acquiring pops that stack before growing the arena. Handles carry a
//! generation so a handle to a recycled slot can never reach the new occupant.

use log::error;

use crate::error::{Result, TexMemError};

/// Generation-checked handle to a node in a [`RangeNodePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

/// Byte range stored in a pool node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNode {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug)]
struct Slot {
    node: RangeNode,
    generation: u32,
    occupied: bool,
}

/// Node recycling counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodePoolStats {
    /// Nodes obtained by growing the arena
    pub fresh: u64,
    /// Nodes obtained from the recycle stack
    pub reused: u64,
    /// Nodes handed back to the recycle stack
    pub recycled: u64,
}

/// Arena of range nodes scoped to one allocator instance
#[derive(Debug, Default)]
pub struct RangeNodePool {
    slots: Vec<Slot>,
    recycled: Vec<u32>,
    /// Upper bound on arena slots; `None` grows until storage runs out.
    max_nodes: Option<usize>,
    stats: NodePoolStats,
}

impl RangeNodePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool that refuses to grow beyond `max_nodes` slots.
    pub fn with_max_nodes(max_nodes: usize) -> Self {
        Self {
            max_nodes: Some(max_nodes),
            ..Self::default()
        }
    }

    /// Take a node for `[start, end)`, recycling a released slot when possible.
    ///
    /// # Errors
    ///
    /// [`TexMemError::NodeAllocationFailure`] when nothing is recycled and the
    /// arena cannot grow.
    pub fn acquire(&mut self, start: u32, end: u32) -> Result<NodeHandle> {
        let node = RangeNode { start, end };

        if let Some(index) = self.recycled.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = node;
            slot.occupied = true;
            self.stats.reused += 1;
            return Ok(NodeHandle {
                index,
                generation: slot.generation,
            });
        }

        let at_limit = self.max_nodes.is_some_and(|max| self.slots.len() >= max);
        if at_limit || self.slots.try_reserve(1).is_err() {
            error!("range node pool exhausted with {} live nodes", self.live());
            return Err(TexMemError::NodeAllocationFailure {
                live: self.live(),
            });
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            node,
            generation: 0,
            occupied: true,
        });
        self.stats.fresh += 1;
        Ok(NodeHandle {
            index,
            generation: 0,
        })
    }

    /// Return a node to the recycle stack.
    ///
    /// Returns false, and does nothing, for a stale handle.
    pub fn release(&mut self, handle: NodeHandle) -> bool {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => {
                slot.occupied = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.recycled.push(handle.index);
                self.stats.recycled += 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&RangeNode> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &slot.node)
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut RangeNode> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &mut slot.node)
    }

    /// Number of nodes currently handed out.
    pub fn live(&self) -> usize {
        self.slots.len() - self.recycled.len()
    }

    /// Number of nodes waiting on the recycle stack.
    pub fn recycled_len(&self) -> usize {
        self.recycled.len()
    }

    pub fn stats(&self) -> NodePoolStats {
        self.stats
    }
}
