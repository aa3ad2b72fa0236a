use super::PageTableNode;
use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use std::sync::atomic::Ordering;

/// Tag marking a child that is being unlinked.
const DETACHING: usize = 1;

/// Software link from a directory slot to its child node.
///
/// The device-visible word of the slot lives in the parent's entry table;
/// this link is what walkers use to find and adopt children.
pub(crate) struct Slot(Atomic<PageTableNode>);

/// What a walker found in a [`Slot`].
pub(crate) enum SlotState<'g> {
    /// No child. The parent's word is scratch or a huge leaf.
    Empty,
    /// A published child. It may still be on its way out if its usage
    /// already dropped to zero; adoption tells.
    Populated(Shared<'g, PageTableNode>),
    /// The child is being unlinked; the slot becomes `Empty` shortly.
    Detaching,
}

impl Slot {
    pub(crate) fn empty() -> Self {
        Self(Atomic::null())
    }

    pub(crate) fn state<'g>(&self, guard: &'g Guard) -> SlotState<'g> {
        let child = self.0.load(Ordering::Acquire, guard);
        if child.is_null() {
            SlotState::Empty
        } else if child.tag() & DETACHING != 0 {
            SlotState::Detaching
        } else {
            SlotState::Populated(child)
        }
    }

    /// Links `node` into an empty slot. Hands the node back if another
    /// walker got there first.
    pub(crate) fn publish<'g>(
        &self,
        node: Owned<PageTableNode>,
        guard: &'g Guard,
    ) -> Result<Shared<'g, PageTableNode>, Owned<PageTableNode>> {
        self.0
            .compare_exchange(
                Shared::null(),
                node,
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .map_err(|lost| lost.new)
    }

    /// First half of unlinking `child`: marks the slot so nobody adopts it.
    ///
    /// # Panics
    /// Panics if the slot no longer links `child`, which means two walkers
    /// both believed they owned the teardown.
    pub(crate) fn begin_detach(&self, child: Shared<'_, PageTableNode>, guard: &Guard) {
        let marked = self.0.compare_exchange(
            child,
            child.with_tag(DETACHING),
            Ordering::AcqRel,
            Ordering::Acquire,
            guard,
        );
        assert!(
            marked.is_ok(),
            "detaching a child its parent no longer links"
        );
    }

    /// Second half of unlinking; the parent's word must already be scratch.
    pub(crate) fn finish_detach(&self) {
        self.0.store(Shared::null(), Ordering::Release);
    }

    /// Unlinks and returns the child with exclusive access to the tree.
    pub(crate) fn take(&mut self) -> Option<Box<PageTableNode>> {
        let child = std::mem::replace(&mut self.0, Atomic::null());
        // SAFETY: `&mut self` proves no walker can observe the slot, and
        // every linked child was allocated by `Owned::new`.
        unsafe { child.try_into_owned() }.map(Owned::into_box)
    }
}
