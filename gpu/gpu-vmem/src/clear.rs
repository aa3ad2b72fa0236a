//! # Range Clear
//!
//! Resets `[start, end)` to scratch. Children whose whole span is covered
//! are unlinked together with everything below them without being visited
//! entry by entry; partially covered children are held, cleared recursively
//! and released, which unlinks them once nothing is left.
//!
//! Clearing never allocates. Huge leaves and compact rows can only be
//! removed whole; the address space checks the range boundaries before the
//! walk starts.

use crate::geometry::{Level, SlotStep};
use crate::node::{PageTableNode, SlotState};
use crate::walk::Walk;
use crossbeam_utils::Backoff;
use gpu_memory_addresses::{PageSize, Size4K, Size64K};

impl Walk<'_, '_> {
    pub(crate) fn clear_range(&mut self, node: &PageTableNode, start: u64, end: u64) {
        let level = node.level();
        debug_assert!(!level.is_leaf());

        for step in level.slots(start, end) {
            let slot = node.slot(step.index);
            let backoff = Backoff::new();
            loop {
                match slot.state(self.guard) {
                    SlotState::Empty => {
                        self.clear_huge(node, &step);
                        break;
                    }
                    SlotState::Detaching => backoff.snooze(),
                    SlotState::Populated(child) => {
                        let c = self.node(child);
                        if !c.try_adopt(1) {
                            backoff.snooze();
                            continue;
                        }
                        if step.is_full(level) {
                            self.prune(node, step.index, child);
                        } else if c.level().is_leaf() {
                            let removed = self.clear_leaves(c, &step);
                            self.release(node, step.index, child, removed + 1);
                        } else {
                            self.clear_range(c, step.start, step.end);
                            self.release(node, step.index, child, 1);
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Clears a childless directory slot, which holds scratch or a huge leaf.
    fn clear_huge(&self, node: &PageTableNode, step: &SlotStep) {
        let level = node.level();
        let scratch = self.scratch.encoding(level);
        if node.entry(step.index) == scratch {
            return;
        }
        assert!(
            step.is_full(level),
            "partial clear of the huge leaf at {:#x}",
            step.slot_base(level)
        );
        if node.swap(step.index, scratch) != scratch {
            node.release_usage(1);
            log::trace!("cleared huge leaf at {:#x}", step.start);
        }
    }

    /// Resets the leaves of `step` and returns how many held a mapping.
    ///
    /// # Panics
    /// Panics if a populated 64 KiB row is only partly covered.
    fn clear_leaves(&self, leaf: &PageTableNode, step: &SlotStep) -> u16 {
        let scratch = self.scratch.encoding(Level::LEAF);
        let compact = leaf.is_compact();
        let size = if compact { Size64K::SIZE } else { Size4K::SIZE };

        let mut removed = 0;
        let mut va = step.start & !(size - 1);
        while va < step.end {
            let index = Self::leaf_index(compact, va);
            if leaf.entry(index) != scratch {
                assert!(
                    va >= step.start && va + size <= step.end,
                    "partial clear of the 64K row at {va:#x}"
                );
                if leaf.swap(index, scratch) != scratch {
                    removed += 1;
                }
            }
            va += size;
        }
        removed
    }
}
