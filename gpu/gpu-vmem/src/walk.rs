//! Shared machinery of the insert and clear engines.
//!
//! ## Usage protocol
//!
//! A walker descending into a child takes a hold on it with
//! [`PageTableNode::try_adopt`] and gives it back through [`Walk::release`]
//! once it is done below. Whoever drops a child's usage to zero unlinks it:
//!
//! ```text
//!  Populated ──begin_detach──► Detaching ──parent word := scratch──► finish_detach ──► Empty
//! ```
//!
//! and retires it once the walk ends. Adoption of a child whose usage is
//! already zero fails, and the walker waits for the slot to become empty
//! before creating a replacement. That keeps a walker from ever
//! resurrecting a node another walker is unlinking.

use crate::encoding::{EncodingPolicy, Granularity};
use crate::freelist::{NodeCache, RetireBatch};
use crate::geometry::{COMPACT_ROWS_PER_NODE, ENTRIES_PER_NODE, Level, SlotStep};
use crate::node::{PageTableNode, SlotState};
use crate::provider::AllocError;
use crate::scratch::ScratchSet;
use crossbeam_epoch::{Guard, Owned, Shared};
use crossbeam_utils::Backoff;
use gpu_memory_addresses::{PageSize, Size64K, VirtualAddress};
use std::sync::atomic::{Ordering, fence};

pub(crate) struct Walk<'s, 'g> {
    pub(crate) encoding: &'s dyn EncodingPolicy,
    pub(crate) scratch: &'s ScratchSet,
    cache: &'s NodeCache,
    pub(crate) guard: &'g Guard,
    retired: RetireBatch,
}

/// A node built for a slot, remembering the parent word it was built from.
struct Spare {
    node: Owned<PageTableNode>,
    prior: u64,
}

impl<'s, 'g> Walk<'s, 'g> {
    pub(crate) fn new(
        encoding: &'s dyn EncodingPolicy,
        scratch: &'s ScratchSet,
        cache: &'s NodeCache,
        guard: &'g Guard,
    ) -> Self {
        Self {
            encoding,
            scratch,
            cache,
            guard,
            retired: RetireBatch::default(),
        }
    }

    /// Dereferences a child found in a slot.
    #[inline]
    pub(crate) fn node(&self, child: Shared<'g, PageTableNode>) -> &'g PageTableNode {
        // SAFETY: children are only reclaimed after a grace period, and this
        // walk stays pinned by `guard` until it finishes.
        unsafe { child.deref() }
    }

    /// The child in `parent`'s slot for `step`, created if missing, with
    /// `adopt` added to its usage on the caller's behalf.
    ///
    /// A missing child replaces whatever the parent slot held: a scratch
    /// word yields a node full of scratch, a huge leaf yields a node
    /// expanding that leaf one level down.
    pub(crate) fn materialize(
        &mut self,
        parent: &PageTableNode,
        step: &SlotStep,
        adopt: u16,
        compact: bool,
    ) -> Result<Shared<'g, PageTableNode>, AllocError> {
        let slot = parent.slot(step.index);
        let backoff = Backoff::new();
        let mut spare: Option<Spare> = None;
        loop {
            match slot.state(self.guard) {
                SlotState::Populated(child) => {
                    if self.node(child).try_adopt(adopt) {
                        if let Some(spare) = spare {
                            self.cache.discard(spare.node);
                        }
                        return Ok(child);
                    }
                    backoff.snooze();
                }
                SlotState::Detaching => backoff.snooze(),
                SlotState::Empty => {
                    let prior = parent.entry(step.index);
                    let node = match spare.take() {
                        Some(spare) if spare.prior == prior => spare.node,
                        stale => {
                            if let Some(stale) = stale {
                                self.cache.discard(stale.node);
                            }
                            self.build_child(parent, step, prior, adopt, compact)?
                        }
                    };
                    match slot.publish(node, self.guard) {
                        Ok(child) => {
                            let node = self.node(child);
                            let word = self
                                .encoding
                                .encode_directory(node.dma(), node.is_compact());
                            // `prior` can be stale by now: a child may have
                            // been linked and unlinked since it was read.
                            let replaced = parent.swap(step.index, word);
                            if replaced == self.scratch.encoding(parent.level()) {
                                parent.add_usage(1);
                            }
                            log::trace!(
                                "linked {} node {} under slot {} at {:#x}",
                                node.level(),
                                node.page(),
                                step.index,
                                step.slot_base(parent.level())
                            );
                            return Ok(child);
                        }
                        Err(node) => spare = Some(Spare { node, prior }),
                    }
                }
            }
        }
    }

    fn build_child(
        &self,
        parent: &PageTableNode,
        step: &SlotStep,
        prior: u64,
        adopt: u16,
        compact: bool,
    ) -> Result<Owned<PageTableNode>, AllocError> {
        let level = parent.level().child();
        let frame = self
            .cache
            .acquire()
            .map_err(|err| AllocError::new(err, level, VirtualAddress::new(step.start)))?;
        let fill = self.scratch.encoding(level);

        let huge = if self.encoding.is_huge_leaf(prior) {
            self.encoding.decode_leaf(prior)
        } else {
            None
        };
        let Some(huge) = huge else {
            let compact = compact && level.is_leaf();
            return Ok(Owned::new(PageTableNode::new(frame, level, fill, adopt, compact)));
        };

        // Split: the new node maps the huge leaf's block in smaller pieces.
        let (granularity, count) = if !level.is_leaf() {
            (Granularity::huge_at(level), ENTRIES_PER_NODE)
        } else if self.encoding.requires_compact(huge.flags) {
            (Some(Granularity::Size64K), COMPACT_ROWS_PER_NODE)
        } else {
            (Some(Granularity::Size4K), ENTRIES_PER_NODE)
        };
        let Some(granularity) = granularity else {
            unreachable!("huge leaf found above level 2");
        };
        let compact = granularity == Granularity::Size64K;
        let node = PageTableNode::new(frame, level, fill, count as u16 + adopt, compact);
        let mut addr = huge.address;
        for index in 0..count {
            node.store(
                index,
                self.encoding.encode_leaf(addr, huge.flags, granularity),
            );
            addr += granularity.bytes();
        }
        log::debug!(
            "split huge leaf at {:#x} into {count} {granularity} entries",
            step.slot_base(parent.level())
        );
        Ok(Owned::new(node))
    }

    /// Drops `n` from the usage of `child` and unlinks it from `parent`
    /// if nothing is left.
    pub(crate) fn release(
        &mut self,
        parent: &PageTableNode,
        index: usize,
        child: Shared<'g, PageTableNode>,
        n: u16,
    ) {
        if n > 0 && self.node(child).release_usage(n) == 0 {
            self.unlink(parent, index, child);
            self.retired.push(child);
        }
    }

    /// Unlinks `child` and every node below it in one step. The caller must
    /// cover the child's whole span and hold it.
    pub(crate) fn prune(
        &mut self,
        parent: &PageTableNode,
        index: usize,
        child: Shared<'g, PageTableNode>,
    ) {
        self.unlink(parent, index, child);
        self.retire_subtree(child);
    }

    fn unlink(&mut self, parent: &PageTableNode, index: usize, child: Shared<'g, PageTableNode>) {
        let slot = parent.slot(index);
        slot.begin_detach(child, self.guard);
        parent.store(index, self.scratch.encoding(parent.level()));
        slot.finish_detach();
        parent.release_usage(1);
        log::trace!(
            "unlinked {} node {} from slot {index}",
            self.node(child).level(),
            self.node(child).page()
        );
    }

    fn retire_subtree(&mut self, node: Shared<'g, PageTableNode>) {
        let n = self.node(node);
        if !n.level().is_leaf() {
            for index in 0..ENTRIES_PER_NODE {
                if let SlotState::Populated(child) = n.slot(index).state(self.guard) {
                    self.retire_subtree(child);
                }
            }
        }
        self.retired.push(node);
    }

    /// Leaf slot index of `va` in a leaf node of the given kind.
    #[inline]
    pub(crate) const fn leaf_index(compact: bool, va: u64) -> usize {
        if compact {
            ((va >> Size64K::SHIFT) as usize) % COMPACT_ROWS_PER_NODE
        } else {
            Level::LEAF.index_of(va)
        }
    }

    /// Ends the walk: publishes all entry writes and retires what was unlinked.
    pub(crate) fn finish(self) {
        fence(Ordering::Release);
        let retired = self.retired.len();
        self.cache.retire(self.retired, self.guard);
        if retired > 0 {
            log::debug!("retired {retired} nodes");
        }
    }
}
