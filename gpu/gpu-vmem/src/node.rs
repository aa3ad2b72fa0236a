//! # Table Nodes
//!
//! A [`PageTableNode`] pairs the device-visible entry table with the software
//! state walkers coordinate on:
//!
//! - `usage`: the number of slots holding something other than the level's
//!   scratch encoding, plus transient holds taken by walkers passing
//!   through. A node whose usage reaches zero is unlinked by whoever dropped
//!   it there, and can never be adopted again.
//! - `compact`: whether a leaf node holds 64 KiB rows instead of 4 KiB
//!   entries. Fixed before the node is published.
//! - `children`: software links to child nodes (directory levels only).

use crate::freelist::MappedFrame;
use crate::geometry::{ENTRIES_PER_NODE, Level};
use gpu_memory_addresses::{DeviceAddress, PhysicalPage, Size4K};
use std::sync::atomic::{AtomicU16, Ordering};

mod slot;

pub(crate) use slot::{Slot, SlotState};

pub(crate) struct PageTableNode {
    frame: MappedFrame,
    level: Level,
    usage: AtomicU16,
    compact: bool,
    children: Box<[Slot]>,
}

impl PageTableNode {
    /// Builds an unpublished node whose entries all hold `fill`.
    pub(crate) fn new(frame: MappedFrame, level: Level, fill: u64, usage: u16, compact: bool) -> Self {
        debug_assert!(!compact || level.is_leaf(), "only leaf nodes can be compact");
        frame.table().fill(fill);
        let children = if level.is_leaf() {
            Box::default()
        } else {
            (0..ENTRIES_PER_NODE).map(|_| Slot::empty()).collect()
        };
        Self {
            frame,
            level,
            usage: AtomicU16::new(usage),
            compact,
            children,
        }
    }

    #[inline]
    pub(crate) const fn level(&self) -> Level {
        self.level
    }

    #[inline]
    pub(crate) const fn is_compact(&self) -> bool {
        self.compact
    }

    #[inline]
    pub(crate) const fn dma(&self) -> DeviceAddress {
        self.frame.dma()
    }

    #[inline]
    pub(crate) const fn page(&self) -> PhysicalPage<Size4K> {
        self.frame.page()
    }

    #[inline]
    pub(crate) fn entry(&self, index: usize) -> u64 {
        self.frame.table().load(index)
    }

    #[inline]
    pub(crate) fn store(&self, index: usize, word: u64) {
        self.frame.table().store(index, word);
    }

    #[inline]
    pub(crate) fn swap(&self, index: usize, word: u64) -> u64 {
        self.frame.table().swap(index, word)
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> &Slot {
        &self.children[index]
    }

    #[inline]
    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut Slot {
        &mut self.children[index]
    }

    #[inline]
    pub(crate) fn usage(&self) -> u16 {
        self.usage.load(Ordering::Acquire)
    }

    /// Adds `n` to the usage unless it already reached zero.
    ///
    /// Failure means the node is being unlinked and must not be touched.
    pub(crate) fn try_adopt(&self, n: u16) -> bool {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |usage| {
                (usage != 0).then(|| usage + n)
            })
            .is_ok()
    }

    /// Adds `n` to the usage of a node the caller already holds.
    pub(crate) fn add_usage(&self, n: u16) {
        self.usage.fetch_add(n, Ordering::AcqRel);
    }

    /// Drops `n` from the usage and returns what is left.
    ///
    /// # Panics
    /// Panics on underflow; the tree's accounting is corrupt at that point.
    pub(crate) fn release_usage(&self, n: u16) -> u16 {
        let prev = self.usage.fetch_sub(n, Ordering::AcqRel);
        assert!(
            prev >= n,
            "usage underflow on {} node {}: {prev} < {n}",
            self.level,
            self.page()
        );
        prev - n
    }

    pub(crate) fn into_frame(self) -> MappedFrame {
        self.frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HeapPageProvider, PageProvider};

    fn node(level: Level, usage: u16) -> (HeapPageProvider, PageTableNode) {
        let provider = HeapPageProvider::new();
        let frame = provider.alloc_node().unwrap();
        let dma = provider.map_for_device(&frame).unwrap();
        let node = PageTableNode::new(MappedFrame::new(frame, dma), level, 0x55, usage, false);
        (provider, node)
    }

    fn free(provider: &HeapPageProvider, node: PageTableNode) {
        let frame = node.into_frame();
        let (frame, dma) = frame.into_parts();
        provider.unmap_for_device(&frame, dma);
        provider.free_node(frame);
    }

    #[test]
    fn fill_and_children() {
        let (provider, leaf) = node(Level::LEAF, 0);
        assert_eq!(leaf.entry(0), 0x55);
        assert_eq!(leaf.entry(511), 0x55);
        assert!(leaf.children.is_empty());
        free(&provider, leaf);

        let (provider, dir) = node(Level::new(2), 0);
        assert_eq!(dir.children.len(), ENTRIES_PER_NODE);
        free(&provider, dir);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn adoption_fails_once_usage_hits_zero() {
        let (provider, n) = node(Level::LEAF, 2);
        assert!(n.try_adopt(3));
        assert_eq!(n.usage(), 5);
        assert_eq!(n.release_usage(5), 0);
        assert!(!n.try_adopt(1));
        assert_eq!(n.usage(), 0);
        free(&provider, n);
    }

    #[test]
    #[should_panic(expected = "usage underflow")]
    fn underflow_panics() {
        let (_provider, n) = node(Level::LEAF, 1);
        n.release_usage(2);
    }
}
