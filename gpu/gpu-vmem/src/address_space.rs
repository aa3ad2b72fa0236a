//! # GPU Address Space
//!
//! An [`AddressSpace`] owns the root node of one translation tree and the
//! scratch chain its unmapped slots point at. All range operations take
//! `&self`: any number of threads may insert, clear, split and look up
//! concurrently as long as their ranges are disjoint. Overlapping
//! operations on the same range must be serialized by the caller.
//!
//! ## Rollback
//!
//! A failed [`insert`](AddressSpace::insert) leaves everything below
//! [`AllocError::failed_at`] mapped. The caller decides what to do with it,
//! typically:
//!
//! ```
//! # use std::sync::Arc;
//! # use gpu_vmem::*;
//! let provider = Arc::new(HeapPageProvider::new());
//! let cache = Arc::new(NodeCache::new(provider.clone(), NodeCacheConfig::new()));
//! let space = AddressSpace::create(
//!     AddressSpaceConfig::new(Geometry::new(4)),
//!     Arc::new(Gen8Encoding),
//!     cache,
//!     None,
//! )?;
//!
//! let (start, end) = (VirtualAddress::new(0x10_0000), VirtualAddress::new(0x50_0000));
//! let backing = BackingCursor::contiguous(DeviceAddress::new(0x8000_0000), end - start);
//! provider.fail_after(Some(1));
//! if let Err(err) = space.insert(start, end, backing, EntryFlags::read_write()) {
//!     space.clear(start, end, Some(err.failed_at()));
//! }
//! assert!(space.lookup(start).is_none());
//! # Ok::<(), AllocError>(())
//! ```
//!
//! ## Teardown
//!
//! Dropping an address space frees the whole tree at once. The caller must
//! make sure the device no longer uses it.

use crate::cursor::{BackingCursor, Segment};
use crate::encoding::{EncodingPolicy, EntryFlags, Granularity, LeafEntry};
use crate::freelist::NodeCache;
use crate::geometry::{ENTRIES_PER_NODE, Geometry, Level, MAX_LEVELS, SlotStep};
use crate::insert::InsertJob;
use crate::node::{PageTableNode, SlotState};
use crate::provider::AllocError;
use crate::scratch::{InvalidAccess, ScratchSet};
use crate::walk::Walk;
use crossbeam_epoch::Guard;
use gpu_memory_addresses::{DeviceAddress, PageSize, PhysicalPage, Size4K, Size64K, VirtualAddress};
use std::mem::ManuallyDrop;
use std::sync::Arc;

/// Construction parameters of an [`AddressSpace`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressSpaceConfig {
    pub geometry: Geometry,
    pub invalid_access: InvalidAccess,
}

impl AddressSpaceConfig {
    /// Faulting invalid accesses.
    #[must_use]
    pub const fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            invalid_access: InvalidAccess::Fault,
        }
    }

    #[must_use]
    pub const fn with_invalid_access(mut self, invalid_access: InvalidAccess) -> Self {
        self.invalid_access = invalid_access;
        self
    }
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        Self::new(Geometry::new(MAX_LEVELS))
    }
}

/// Result of a [`lookup`](AddressSpace::lookup).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    /// Device address the looked-up virtual address translates to.
    pub address: DeviceAddress,
    /// Base of the leaf's block.
    pub base: DeviceAddress,
    /// Size of the leaf's block.
    pub size: Granularity,
    pub flags: EntryFlags,
}

impl Translation {
    fn new(va: u64, leaf: LeafEntry, size: Granularity) -> Self {
        Self {
            address: leaf.address + (va & (size.bytes() - 1)),
            base: leaf.address,
            size,
            flags: leaf.flags,
        }
    }
}

/// Structural report produced by [`AddressSpace::audit`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TreeAudit {
    /// Linked nodes per level, root included.
    pub nodes: [usize; MAX_LEVELS as usize],
    /// Populated 4 KiB leaf entries.
    pub small_leaves: usize,
    /// Populated 64 KiB rows.
    pub compact_rows: usize,
    /// Huge leaves in directory slots.
    pub huge_leaves: usize,
    /// Every inconsistency found.
    pub problems: Vec<String>,
}

impl TreeAudit {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.problems.is_empty()
    }

    /// Linked nodes below the root.
    #[must_use]
    pub fn child_nodes(&self) -> usize {
        self.nodes.iter().sum::<usize>() - 1
    }

    /// Bytes mapped by all leaves.
    #[must_use]
    pub const fn mapped_bytes(&self) -> u64 {
        self.small_leaves as u64 * Size4K::SIZE + self.compact_rows as u64 * Size64K::SIZE
    }
}

/// One GPU translation tree.
pub struct AddressSpace {
    geometry: Geometry,
    encoding: Arc<dyn EncodingPolicy>,
    scratch: ScratchSet,
    cache: Arc<NodeCache>,
    root: ManuallyDrop<Box<PageTableNode>>,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("geometry", &self.geometry)
            .field("encoding", &self.encoding)
            .field("scratch", &self.scratch)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// Builds an empty tree: a root whose slots all hold scratch.
    ///
    /// Scratch nodes are shared with `share_scratch_from` where its encoding
    /// and invalid-access policy match; otherwise a private chain is built.
    ///
    /// # Errors
    /// Returns [`AllocError`] if a scratch node or the root cannot be
    /// allocated or mapped. Nothing allocated so far is kept.
    pub fn create(
        config: AddressSpaceConfig,
        encoding: Arc<dyn EncodingPolicy>,
        cache: Arc<NodeCache>,
        share_scratch_from: Option<&Self>,
    ) -> Result<Self, AllocError> {
        let top = config.geometry.top();
        let scratch = ScratchSet::build(
            &cache,
            encoding.as_ref(),
            config.invalid_access,
            top,
            share_scratch_from.map(|other| &other.scratch),
        )?;
        let frame = cache
            .acquire()
            .map_err(|err| AllocError::new(err, top, VirtualAddress::zero()))?;
        let root = PageTableNode::new(frame, top, scratch.encoding(top), 0, false);
        log::debug!(
            "created {}-level {} address space, root {} at {}",
            config.geometry.levels(),
            encoding.name(),
            root.page(),
            root.dma()
        );
        Ok(Self {
            geometry: config.geometry,
            encoding,
            scratch,
            cache,
            root: ManuallyDrop::new(Box::new(root)),
        })
    }

    #[must_use]
    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[must_use]
    pub fn encoding(&self) -> &dyn EncodingPolicy {
        self.encoding.as_ref()
    }

    #[must_use]
    pub const fn scratch(&self) -> &ScratchSet {
        &self.scratch
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Device address of the root node, as programmed into the GPU context.
    #[must_use]
    pub fn root_address(&self) -> DeviceAddress {
        self.root.dma()
    }

    #[must_use]
    pub fn root_page(&self) -> PhysicalPage<Size4K> {
        self.root.page()
    }

    fn root(&self) -> &PageTableNode {
        &self.root
    }

    fn walk<'g>(&self, guard: &'g Guard) -> Walk<'_, 'g> {
        Walk::new(self.encoding.as_ref(), &self.scratch, &self.cache, guard)
    }

    /// # Panics
    /// Panics on reversed, unaligned or out-of-range bounds.
    fn check_range(&self, start: VirtualAddress, end: VirtualAddress) -> (u64, u64) {
        assert!(start <= end, "range {start}..{end} is reversed");
        assert!(
            start.is_aligned::<Size4K>() && end.is_aligned::<Size4K>(),
            "range {start}..{end} is not page aligned"
        );
        assert!(
            end.as_u64() <= self.geometry.va_limit(),
            "range {start}..{end} exceeds the {}-bit address space",
            self.geometry.va_bits()
        );
        (start.as_u64(), end.as_u64())
    }

    /// Maps `[start, end)` to the memory behind `backing`.
    ///
    /// Existing mappings in the range are replaced; huge leaves in the way
    /// are split first. On error everything below
    /// [`AllocError::failed_at`] is mapped.
    ///
    /// # Errors
    /// Returns [`AllocError`] when a node on the way cannot be allocated or
    /// mapped. [`AllocError::failed_at`] is the start of the slot that node
    /// would have covered; roll back with
    /// `clear(start, end, Some(err.failed_at()))`.
    ///
    /// # Panics
    /// Panics on an invalid range, when `backing` ends early or cannot
    /// supply the blocks the range needs, when `flags` ask for memory the
    /// encoding cannot express, and when device-local memory is inserted at
    /// other than 64 KiB alignment.
    pub fn insert<I>(
        &self,
        start: VirtualAddress,
        end: VirtualAddress,
        backing: BackingCursor<I>,
        flags: EntryFlags,
    ) -> Result<(), AllocError>
    where
        I: Iterator<Item = Segment>,
    {
        let (s, e) = self.check_range(start, end);
        if s == e {
            return Ok(());
        }
        assert!(
            self.encoding.supports_locality(flags.locality()),
            "{} cannot map {:?} memory",
            self.encoding.name(),
            flags.locality()
        );
        let compact = self.encoding.requires_compact(flags);
        if compact {
            assert!(
                start.is_aligned::<Size64K>() && end.is_aligned::<Size64K>(),
                "range {start}..{end} must be 64K aligned for {:?} memory",
                flags.locality()
            );
        }

        let guard = self.cache.pin();
        let mut walk = self.walk(&guard);
        let mut job = InsertJob {
            cursor: backing,
            flags,
            compact,
        };
        let result = walk.insert_range(self.root(), s, e, &mut job);
        walk.finish();

        match &result {
            Ok(()) => log::debug!("inserted {start}..{end}"),
            Err(err) => log::warn!("insert {start}..{end} stopped: {err}"),
        }
        result
    }

    /// Resets `[start, end)` to scratch, stopping early at `fail_at` when
    /// given. Clearing an already clear range does nothing.
    ///
    /// # Panics
    /// Panics on an invalid range and when a bound falls inside a huge leaf
    /// or a 64 KiB row; split those with [`split_huge`](Self::split_huge)
    /// first.
    pub fn clear(&self, start: VirtualAddress, end: VirtualAddress, fail_at: Option<VirtualAddress>) {
        let (s, mut e) = self.check_range(start, end);
        if let Some(fail_at) = fail_at {
            e = e.min(fail_at.as_u64().max(s));
        }
        if s == e {
            return;
        }
        self.assert_entry_boundary(s);
        self.assert_entry_boundary(e);

        let guard = self.cache.pin();
        let mut walk = self.walk(&guard);
        walk.clear_range(self.root(), s, e);
        walk.finish();
        log::debug!("cleared {start}..{}", VirtualAddress::new(e));
    }

    fn assert_entry_boundary(&self, va: u64) {
        if va >= self.geometry.va_limit() {
            return;
        }
        if let Some(translation) = self.lookup(VirtualAddress::new(va)) {
            let size = translation.size;
            assert!(
                va & (size.bytes() - 1) == 0,
                "partial clear of the {size} entry at {:#x}",
                va & !(size.bytes() - 1)
            );
        }
    }

    /// Translates `va`, or `None` if it is unmapped.
    #[must_use]
    pub fn lookup(&self, va: VirtualAddress) -> Option<Translation> {
        let va = va.as_u64();
        if va >= self.geometry.va_limit() {
            return None;
        }
        let guard = self.cache.pin();
        let mut node = self.root();
        loop {
            let level = node.level();
            if level.is_leaf() {
                let size = if node.is_compact() {
                    Granularity::Size64K
                } else {
                    Granularity::Size4K
                };
                let word = node.entry(Walk::leaf_index(node.is_compact(), va));
                return Some(Translation::new(va, self.encoding.decode_leaf(word)?, size));
            }
            let index = level.index_of(va);
            match node.slot(index).state(&guard) {
                // SAFETY: the child stays allocated while `guard` is pinned.
                SlotState::Populated(child) => node = unsafe { child.deref() },
                SlotState::Empty | SlotState::Detaching => {
                    let word = node.entry(index);
                    if !self.encoding.is_huge_leaf(word) {
                        return None;
                    }
                    let size = Granularity::huge_at(level)?;
                    return Some(Translation::new(va, self.encoding.decode_leaf(word)?, size));
                }
            }
        }
    }

    /// Splits the huge leaf covering `va` into a node of next-smaller leaves
    /// mapping the same memory. Returns whether there was one to split.
    ///
    /// A 1 GiB leaf becomes 2 MiB leaves; call again to reach 4 KiB.
    ///
    /// # Errors
    /// Returns [`AllocError`] if the node replacing the huge leaf cannot be
    /// allocated or mapped. The huge leaf is left as it was.
    pub fn split_huge(&self, va: VirtualAddress) -> Result<bool, AllocError> {
        let va = va.as_u64();
        if va >= self.geometry.va_limit() {
            return Ok(false);
        }
        let guard = self.cache.pin();
        let mut walk = self.walk(&guard);
        let result = walk.split_at(self.root(), va);
        walk.finish();
        result
    }

    /// Checks the whole tree. Requires exclusive access, so no walker can
    /// be mid-update.
    pub fn audit(&mut self) -> TreeAudit {
        let guard = self.cache.pin();
        let mut audit = TreeAudit::default();
        let auditor = Auditor {
            encoding: self.encoding.as_ref(),
            scratch: &self.scratch,
            guard: &guard,
            top: self.geometry.top(),
        };
        auditor.visit(self.root(), 0, &mut audit);
        audit
    }
}

impl Walk<'_, '_> {
    fn split_at(&mut self, node: &PageTableNode, va: u64) -> Result<bool, AllocError> {
        let level = node.level();
        if level.is_leaf() {
            return Ok(false);
        }
        let index = level.index_of(va);
        let base = va & !(level.slot_span() - 1);
        let step = SlotStep {
            index,
            start: base,
            end: base + level.slot_span(),
        };
        match node.slot(index).state(self.guard) {
            SlotState::Populated(child) => {
                let c = self.node(child);
                if !c.try_adopt(1) {
                    return Ok(false);
                }
                let result = self.split_at(c, va);
                self.release(node, index, child, 1);
                result
            }
            SlotState::Empty | SlotState::Detaching => {
                if !self.encoding.is_huge_leaf(node.entry(index)) {
                    return Ok(false);
                }
                let child = self.materialize(node, &step, 1, false)?;
                self.release(node, index, child, 1);
                Ok(true)
            }
        }
    }
}

struct Auditor<'a, 'g> {
    encoding: &'a dyn EncodingPolicy,
    scratch: &'a ScratchSet,
    guard: &'g Guard,
    top: Level,
}

impl Auditor<'_, '_> {
    fn visit(&self, node: &PageTableNode, base: u64, audit: &mut TreeAudit) {
        let level = node.level();
        audit.nodes[level.as_usize()] += 1;
        let scratch = self.scratch.encoding(level);
        let mut used = 0u32;

        for index in 0..ENTRIES_PER_NODE {
            let va = base + index as u64 * level.slot_span();
            let word = node.entry(index);
            if level.is_leaf() {
                if word == scratch {
                    continue;
                }
                used += 1;
                if node.is_compact() {
                    if index >= crate::geometry::COMPACT_ROWS_PER_NODE {
                        audit
                            .problems
                            .push(format!("compact node {} uses entry {index}", node.page()));
                    }
                    audit.compact_rows += 1;
                } else {
                    audit.small_leaves += 1;
                }
                if self.encoding.decode_leaf(word).is_none() {
                    audit
                        .problems
                        .push(format!("leaf at {va:#x} holds foreign word {word:#018x}"));
                }
                continue;
            }

            match node.slot(index).state(self.guard) {
                SlotState::Populated(child) => {
                    // SAFETY: exclusive access; nothing is being reclaimed.
                    let child = unsafe { child.deref() };
                    used += 1;
                    let expected = self
                        .encoding
                        .encode_directory(child.dma(), child.is_compact());
                    if word != expected {
                        audit
                            .problems
                            .push(format!("slot at {va:#x} does not point at its child"));
                    }
                    if child.level() != level.child() {
                        audit
                            .problems
                            .push(format!("child at {va:#x} sits at {}", child.level()));
                    }
                    self.visit(child, va, audit);
                }
                SlotState::Detaching => audit
                    .problems
                    .push(format!("slot at {va:#x} is stuck detaching")),
                SlotState::Empty => {
                    if word == scratch {
                        continue;
                    }
                    used += 1;
                    if self.encoding.is_huge_leaf(word) && Granularity::huge_at(level).is_some() {
                        audit.huge_leaves += 1;
                    } else {
                        audit
                            .problems
                            .push(format!("childless slot at {va:#x} holds {word:#018x}"));
                    }
                }
            }
        }

        if u32::from(node.usage()) != used {
            audit.problems.push(format!(
                "{level} node {} at {base:#x}: usage {} but {used} slots in use",
                node.page(),
                node.usage()
            ));
        }
        if used == 0 && level != self.top {
            audit
                .problems
                .push(format!("empty {level} node {} left linked", node.page()));
        }
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // SAFETY: the root is never touched again.
        let root = unsafe { ManuallyDrop::take(&mut self.root) };
        let freed = teardown(root, &self.cache);
        log::debug!("tore down address space: {freed} nodes");
    }
}

fn teardown(mut node: Box<PageTableNode>, cache: &NodeCache) -> usize {
    let mut freed = 1;
    if !node.level().is_leaf() {
        for index in 0..ENTRIES_PER_NODE {
            if let Some(child) = node.slot_mut(index).take() {
                freed += teardown(child, cache);
            }
        }
    }
    cache.recycle(node.into_frame());
    freed
}
