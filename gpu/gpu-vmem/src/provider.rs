//! # Node Memory Provider
//!
//! Table nodes live in memory the driver allocates and maps for the device.
//! [`PageProvider`] is the seam to that allocator: it hands out 4 KiB node
//! frames, maps them for device access and takes them back.
//!
//! [`HeapPageProvider`] backs frames with host heap allocations and hands out
//! synthetic physical and device addresses. It keeps full accounting, which
//! the test-suite uses to prove that every node is returned exactly once.

use crate::geometry::{ENTRIES_PER_NODE, Level, NODE_SIZE};
use gpu_memory_addresses::{DeviceAddress, PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// CPU view of a node's 512 entry words.
///
/// Entries are atomics: leaf writers of disjoint ranges may share a node,
/// and readers may observe entries while they are rewritten.
#[repr(C, align(4096))]
pub struct EntryTable {
    words: [AtomicU64; ENTRIES_PER_NODE],
}

const _: () = assert!(size_of::<EntryTable>() as u64 == NODE_SIZE);

impl EntryTable {
    #[must_use]
    pub fn zeroed() -> Box<Self> {
        Box::new(Self {
            words: [const { AtomicU64::new(0) }; ENTRIES_PER_NODE],
        })
    }

    #[inline]
    #[must_use]
    pub fn load(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn store(&self, index: usize, word: u64) {
        self.words[index].store(word, Ordering::Release);
    }

    #[inline]
    pub(crate) fn swap(&self, index: usize, word: u64) -> u64 {
        self.words[index].swap(word, Ordering::AcqRel)
    }

    /// Fills every entry; the node must not be reachable yet.
    pub(crate) fn fill(&self, word: u64) {
        for w in &self.words {
            w.store(word, Ordering::Relaxed);
        }
    }
}

/// A 4 KiB frame holding one table node.
pub struct NodeFrame {
    page: PhysicalPage<Size4K>,
    table: Box<EntryTable>,
}

impl NodeFrame {
    #[must_use]
    pub const fn new(page: PhysicalPage<Size4K>, table: Box<EntryTable>) -> Self {
        Self { page, table }
    }

    #[inline]
    #[must_use]
    pub const fn page(&self) -> PhysicalPage<Size4K> {
        self.page
    }

    #[inline]
    #[must_use]
    pub fn table(&self) -> &EntryTable {
        &self.table
    }
}

impl core::fmt::Debug for NodeFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NodeFrame").field(&self.page).finish()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageProviderError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("device mapping failed")]
    DeviceMapFailed,
}

/// A walk could not obtain a node.
///
/// Everything below [`failed_at`](Self::failed_at) was applied; callers roll
/// back with `clear(start, end, Some(err.failed_at()))`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory allocating a {level} node for {at}")]
    OutOfMemory { level: Level, at: VirtualAddress },
    #[error("device mapping failed for a {level} node for {at}")]
    DeviceMapFailed { level: Level, at: VirtualAddress },
}

impl AllocError {
    pub(crate) const fn new(err: PageProviderError, level: Level, at: VirtualAddress) -> Self {
        match err {
            PageProviderError::OutOfMemory => Self::OutOfMemory { level, at },
            PageProviderError::DeviceMapFailed => Self::DeviceMapFailed { level, at },
        }
    }

    /// First address that was not inserted.
    #[must_use]
    pub const fn failed_at(&self) -> VirtualAddress {
        match *self {
            Self::OutOfMemory { at, .. } | Self::DeviceMapFailed { at, .. } => at,
        }
    }

    /// Level of the node that could not be obtained.
    #[must_use]
    pub const fn level(&self) -> Level {
        match *self {
            Self::OutOfMemory { level, .. } | Self::DeviceMapFailed { level, .. } => level,
        }
    }
}

/// Source of node frames and their device mappings.
///
/// Called concurrently from every thread walking an address space.
pub trait PageProvider: Send + Sync {
    /// Allocates one zeroed node frame.
    ///
    /// # Errors
    /// [`PageProviderError::OutOfMemory`] when no frame is available.
    fn alloc_node(&self) -> Result<NodeFrame, PageProviderError>;

    /// Makes `frame` reachable by the device and returns its bus address.
    ///
    /// # Errors
    /// [`PageProviderError::DeviceMapFailed`] when the mapping cannot be set up.
    fn map_for_device(&self, frame: &NodeFrame) -> Result<DeviceAddress, PageProviderError>;

    /// Reverses [`map_for_device`](Self::map_for_device).
    fn unmap_for_device(&self, frame: &NodeFrame, addr: DeviceAddress);

    /// Returns a frame. Every frame from [`alloc_node`](Self::alloc_node)
    /// comes back here exactly once.
    fn free_node(&self, frame: NodeFrame);
}

/// Default base of the synthetic physical range.
const HEAP_PHYS_BASE: u64 = 0x0000_0001_0000_0000;

/// Default distance between a frame's physical and device address.
const HEAP_DMA_OFFSET: u64 = 0x0000_0800_0000_0000;

#[derive(Default)]
struct HeapState {
    next: u64,
    recycled: Vec<PhysicalPage<Size4K>>,
    live: BTreeSet<PhysicalPage<Size4K>>,
    mapped: BTreeSet<PhysicalPage<Size4K>>,
    allocated: u64,
    freed: u64,
    budget: Option<u64>,
    fail_device_map: bool,
}

/// Heap-backed [`PageProvider`] with leak and double-free accounting.
pub struct HeapPageProvider {
    state: Mutex<HeapState>,
    dma_offset: u64,
}

impl Default for HeapPageProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapPageProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::with_layout(PhysicalAddress::new(HEAP_PHYS_BASE), HEAP_DMA_OFFSET)
    }

    /// Frames start at `base`; the device sees each frame `dma_offset` bytes higher.
    #[must_use]
    pub fn with_layout(base: PhysicalAddress, dma_offset: u64) -> Self {
        Self {
            state: Mutex::new(HeapState {
                next: base.align_down::<Size4K>().as_u64(),
                ..HeapState::default()
            }),
            dma_offset,
        }
    }

    /// Lets `n` more allocations succeed, then fails with
    /// [`PageProviderError::OutOfMemory`]. `None` removes the limit.
    pub fn fail_after(&self, n: Option<u64>) {
        self.state.lock().budget = n;
    }

    /// Makes every following [`map_for_device`](PageProvider::map_for_device) fail.
    pub fn fail_device_map(&self, fail: bool) {
        self.state.lock().fail_device_map = fail;
    }

    /// Frames currently handed out.
    #[must_use]
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Frames currently mapped for the device.
    #[must_use]
    pub fn mapped(&self) -> usize {
        self.state.lock().mapped.len()
    }

    /// Total successful allocations.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Total frees.
    #[must_use]
    pub fn freed(&self) -> u64 {
        self.state.lock().freed
    }

    #[must_use]
    pub fn is_live(&self, page: PhysicalPage<Size4K>) -> bool {
        self.state.lock().live.contains(&page)
    }
}

impl PageProvider for HeapPageProvider {
    fn alloc_node(&self) -> Result<NodeFrame, PageProviderError> {
        let page = {
            let mut state = self.state.lock();
            if let Some(budget) = state.budget.as_mut() {
                if *budget == 0 {
                    return Err(PageProviderError::OutOfMemory);
                }
                *budget -= 1;
            }
            let page = if let Some(page) = state.recycled.pop() {
                page
            } else {
                let page = PhysicalAddress::new(state.next).page::<Size4K>();
                state.next += NODE_SIZE;
                page
            };
            state.live.insert(page);
            state.allocated += 1;
            page
        };
        log::trace!("allocated node frame {page}");
        Ok(NodeFrame::new(page, EntryTable::zeroed()))
    }

    fn map_for_device(&self, frame: &NodeFrame) -> Result<DeviceAddress, PageProviderError> {
        let mut state = self.state.lock();
        if state.fail_device_map {
            return Err(PageProviderError::DeviceMapFailed);
        }
        assert!(
            state.mapped.insert(frame.page()),
            "node frame {} mapped twice",
            frame.page()
        );
        Ok(DeviceAddress::new(frame.page().base().as_u64() + self.dma_offset))
    }

    fn unmap_for_device(&self, frame: &NodeFrame, addr: DeviceAddress) {
        debug_assert_eq!(addr.as_u64(), frame.page().base().as_u64() + self.dma_offset);
        let mut state = self.state.lock();
        assert!(
            state.mapped.remove(&frame.page()),
            "node frame {} was not mapped",
            frame.page()
        );
    }

    fn free_node(&self, frame: NodeFrame) {
        let page = frame.page();
        let mut state = self.state.lock();
        assert!(state.live.remove(&page), "double free of node frame {page}");
        assert!(
            !state.mapped.contains(&page),
            "node frame {page} freed while still mapped"
        );
        state.recycled.push(page);
        state.freed += 1;
    }
}
