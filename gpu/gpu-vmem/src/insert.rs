//! # Range Insert
//!
//! Fills `[start, end)` with leaves backed by a [`BackingCursor`], creating
//! missing nodes on the way down. Per directory slot the walk either
//!
//! 1. writes a huge leaf, when the encoding supports that size at this level,
//!    the slot is empty, the range covers it and the backing run is aligned
//!    and long enough, or
//! 2. materializes the child and descends, or
//! 3. at the last directory level, writes the leaves of the child directly.
//!
//! Leaf nodes are adopted with the number of entries about to be written
//! rather than a plain hold, so a node never looks empty while it is being
//! filled.

use crate::cursor::{BackingCursor, Segment};
use crate::encoding::{EntryFlags, Granularity};
use crate::geometry::{Level, SlotStep};
use crate::node::{PageTableNode, SlotState};
use crate::provider::AllocError;
use crate::walk::Walk;
use gpu_memory_addresses::{PageSize, Size4K, Size64K};

pub(crate) struct InsertJob<I> {
    pub(crate) cursor: BackingCursor<I>,
    pub(crate) flags: EntryFlags,
    pub(crate) compact: bool,
}

impl<I> InsertJob<I> {
    const fn leaf_size(&self) -> (u64, Granularity) {
        if self.compact {
            (Size64K::SIZE, Granularity::Size64K)
        } else {
            (Size4K::SIZE, Granularity::Size4K)
        }
    }

    /// Leaf entries of one leaf node touched by `step`.
    const fn leaf_count(&self, step: &SlotStep) -> u16 {
        let (size, _) = self.leaf_size();
        ((step.end - step.start) / size) as u16
    }
}

impl Walk<'_, '_> {
    pub(crate) fn insert_range<I>(
        &mut self,
        node: &PageTableNode,
        start: u64,
        end: u64,
        job: &mut InsertJob<I>,
    ) -> Result<(), AllocError>
    where
        I: Iterator<Item = Segment>,
    {
        let level = node.level();
        debug_assert!(!level.is_leaf());

        for step in level.slots(start, end) {
            if self.try_promote(node, &step, job) {
                continue;
            }

            if level.child().is_leaf() {
                let child = self.materialize(node, &step, job.leaf_count(&step), job.compact)?;
                let overwritten = self.write_leaves(self.node(child), &step, job);
                self.release(node, step.index, child, overwritten);
            } else {
                let child = self.materialize(node, &step, 1, job.compact)?;
                let result = self.insert_range(self.node(child), step.start, step.end, job);
                self.release(node, step.index, child, 1);
                result?;
            }
        }
        Ok(())
    }

    /// Writes a huge leaf into the slot if everything lines up.
    fn try_promote<I>(&self, node: &PageTableNode, step: &SlotStep, job: &mut InsertJob<I>) -> bool
    where
        I: Iterator<Item = Segment>,
    {
        let level = node.level();
        let Some(granularity) = Granularity::huge_at(level) else {
            return false;
        };
        if !self.encoding.supports(granularity) || !step.is_full(level) {
            return false;
        }
        if !matches!(node.slot(step.index).state(self.guard), SlotState::Empty) {
            return false;
        }
        let Some(addr) = job.cursor.peek_block(granularity.bytes()) else {
            return false;
        };
        job.cursor.take(granularity.bytes());

        let word = self.encoding.encode_leaf(addr, job.flags, granularity);
        let prior = node.swap(step.index, word);
        if prior == self.scratch.encoding(level) {
            node.add_usage(1);
        }
        log::trace!("mapped {granularity} leaf {:#x} -> {addr}", step.start);
        true
    }

    /// Writes the leaves of `step` and returns how many replaced a mapping.
    ///
    /// # Panics
    /// Panics if the leaf node's density does not match the insert's. The
    /// density is fixed by whoever created the node, so a writer of the
    /// other density has no valid way forward; waiting could block forever
    /// behind mappings that are never cleared. Mixing densities in one node
    /// is treated as misuse and aborts.
    fn write_leaves<I>(&self, leaf: &PageTableNode, step: &SlotStep, job: &mut InsertJob<I>) -> u16
    where
        I: Iterator<Item = Segment>,
    {
        assert_eq!(
            leaf.is_compact(),
            job.compact,
            "leaf node for {:#x} already holds mappings of the other density",
            step.start
        );
        debug_assert_eq!(leaf.level(), Level::LEAF);

        let scratch = self.scratch.encoding(Level::LEAF);
        let (size, granularity) = job.leaf_size();
        let mut overwritten = 0;
        let mut va = step.start;
        while va < step.end {
            let addr = job.cursor.take(size);
            let word = self.encoding.encode_leaf(addr, job.flags, granularity);
            if leaf.swap(Self::leaf_index(job.compact, va), word) != scratch {
                overwritten += 1;
            }
            va += size;
        }
        overwritten
    }
}
