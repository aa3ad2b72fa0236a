//! # Tree Geometry
//!
//! Levels are numbered bottom-up: level 0 holds leaf translation entries and
//! the root sits at `levels - 1`. Every node has [`ENTRIES_PER_NODE`] slots,
//! so each level consumes 9 bits of the virtual address:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! A level-1 slot spans 2 MiB and may hold a huge leaf in place of a child,
//! a level-2 slot spans 1 GiB likewise.

use core::fmt;
use gpu_memory_addresses::{PageSize, Size64K};

/// Slots per table node.
pub const ENTRIES_PER_NODE: usize = 512;

/// Size of a table node in bytes.
pub const NODE_SIZE: u64 = 4096;

/// Number of 4 KiB entries one compact 64 KiB row stands for.
pub const COMPACT_RATIO: usize = (Size64K::SIZE / NODE_SIZE) as usize;

/// Rows used by a compact leaf node.
pub const COMPACT_ROWS_PER_NODE: usize = ENTRIES_PER_NODE / COMPACT_RATIO;

const INDEX_BITS: u32 = 9;
const INDEX_MASK: u64 = (ENTRIES_PER_NODE as u64) - 1;
const PAGE_SHIFT: u32 = 12;

/// Smallest supported tree depth.
pub const MIN_LEVELS: u8 = 2;

/// Largest supported tree depth (48-bit address spaces).
pub const MAX_LEVELS: u8 = 4;

/// A level in the table tree; `0` is the leaf level.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Level(u8);

impl Level {
    pub const LEAF: Self = Self(0);

    /// # Panics
    /// Panics if `level` is not below [`MAX_LEVELS`].
    #[inline]
    #[must_use]
    pub const fn new(level: u8) -> Self {
        assert!(level < MAX_LEVELS, "level out of range");
        Self(level)
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_leaf(self) -> bool {
        self.0 == 0
    }

    /// The level of this level's children.
    ///
    /// # Panics
    /// Panics on the leaf level.
    #[inline]
    #[must_use]
    pub const fn child(self) -> Self {
        assert!(self.0 > 0, "leaf nodes have no children");
        Self(self.0 - 1)
    }

    /// log2 of the bytes covered by one slot at this level.
    #[inline]
    #[must_use]
    pub const fn slot_shift(self) -> u32 {
        PAGE_SHIFT + INDEX_BITS * self.0 as u32
    }

    /// Bytes covered by one slot at this level.
    #[inline]
    #[must_use]
    pub const fn slot_span(self) -> u64 {
        1 << self.slot_shift()
    }

    /// Bytes covered by a whole node at this level.
    #[inline]
    #[must_use]
    pub const fn node_span(self) -> u64 {
        self.slot_span() << INDEX_BITS
    }

    /// Slot index of `va` within the node at this level that contains it.
    #[inline]
    #[must_use]
    pub const fn index_of(self, va: u64) -> usize {
        ((va >> self.slot_shift()) & INDEX_MASK) as usize
    }

    /// Walks the slots of the level node containing `start`, clipped to
    /// `[start, end)` and to that node's boundary.
    #[inline]
    #[must_use]
    pub(crate) const fn slots(self, start: u64, end: u64) -> SlotWalk {
        SlotWalk {
            level: self,
            cursor: start,
            end,
            remaining: ENTRIES_PER_NODE - self.index_of(start),
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Debug for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Shape of one address space's tree.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Geometry {
    levels: u8,
    va_bits: u32,
}

impl Geometry {
    /// A tree of `levels` levels covering the full `12 + 9 * levels` bits.
    ///
    /// # Panics
    /// Panics if `levels` is outside `MIN_LEVELS..=MAX_LEVELS`.
    #[must_use]
    pub const fn new(levels: u8) -> Self {
        assert!(
            levels >= MIN_LEVELS && levels <= MAX_LEVELS,
            "unsupported number of levels"
        );
        Self {
            levels,
            va_bits: PAGE_SHIFT + INDEX_BITS * levels as u32,
        }
    }

    /// The smallest tree able to translate `va_bits` bits of address.
    ///
    /// A 32-bit space therefore uses three levels with only the first four
    /// root slots reachable.
    ///
    /// # Panics
    /// Panics if `va_bits` exceeds 48 or is below 13.
    #[must_use]
    pub const fn for_va_bits(va_bits: u32) -> Self {
        assert!(va_bits > PAGE_SHIFT && va_bits <= 48, "unsupported address width");
        let levels = (va_bits - PAGE_SHIFT).div_ceil(INDEX_BITS);
        let levels = if levels < MIN_LEVELS as u32 {
            MIN_LEVELS
        } else {
            levels as u8
        };
        Self { levels, va_bits }
    }

    #[inline]
    #[must_use]
    pub const fn levels(self) -> u8 {
        self.levels
    }

    #[inline]
    #[must_use]
    pub const fn va_bits(self) -> u32 {
        self.va_bits
    }

    /// The root's level.
    #[inline]
    #[must_use]
    pub const fn top(self) -> Level {
        Level(self.levels - 1)
    }

    /// First address past the translatable range.
    #[inline]
    #[must_use]
    pub const fn va_limit(self) -> u64 {
        1 << self.va_bits
    }
}

/// One slot visited by a [`SlotWalk`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct SlotStep {
    pub index: usize,
    pub start: u64,
    pub end: u64,
}

impl SlotStep {
    /// Whether the step covers the slot's whole span.
    #[inline]
    pub const fn is_full(&self, level: Level) -> bool {
        let span = level.slot_span();
        self.start & (span - 1) == 0 && self.end - self.start == span
    }

    /// Base address of the slot.
    #[inline]
    pub const fn slot_base(&self, level: Level) -> u64 {
        self.start & !(level.slot_span() - 1)
    }
}

/// Iterator over the slots of a single node touched by a range.
#[derive(Clone, Debug)]
pub(crate) struct SlotWalk {
    level: Level,
    cursor: u64,
    end: u64,
    remaining: usize,
}

impl Iterator for SlotWalk {
    type Item = SlotStep;

    fn next(&mut self) -> Option<SlotStep> {
        if self.cursor >= self.end || self.remaining == 0 {
            return None;
        }
        let span = self.level.slot_span();
        let start = self.cursor;
        let end = ((start & !(span - 1)) + span).min(self.end);
        self.cursor = end;
        self.remaining -= 1;
        Some(SlotStep {
            index: self.level.index_of(start),
            start,
            end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans() {
        assert_eq!(Level::LEAF.slot_span(), 4096);
        assert_eq!(Level::new(1).slot_span(), 2 * 1024 * 1024);
        assert_eq!(Level::new(2).slot_span(), 1024 * 1024 * 1024);
        assert_eq!(Level::new(1).node_span(), 1024 * 1024 * 1024);
        assert_eq!(COMPACT_ROWS_PER_NODE, 32);
        assert_eq!(COMPACT_RATIO, 16);
    }

    #[test]
    fn levels_for_address_width() {
        assert_eq!(Geometry::for_va_bits(48).levels(), 4);
        assert_eq!(Geometry::for_va_bits(39).levels(), 3);
        assert_eq!(Geometry::for_va_bits(32).levels(), 3);
        assert_eq!(Geometry::for_va_bits(21).levels(), 2);
        assert_eq!(Geometry::for_va_bits(32).va_limit(), 1 << 32);
        assert_eq!(Geometry::new(4).top(), Level::new(3));
    }

    #[test]
    #[should_panic(expected = "unsupported number of levels")]
    fn rejects_five_levels() {
        let _ = Geometry::new(5);
    }

    #[test]
    fn walk_stops_at_node_boundary() {
        let l0 = Level::LEAF;
        // Starts two pages before the end of the first leaf node and runs past it.
        let start = 510 * 4096;
        let steps: Vec<_> = l0.slots(start, start + 5 * 4096).collect();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].index, 510);
        assert_eq!(steps[1].index, 511);
        assert_eq!(steps[1].end, 512 * 4096);
    }

    #[test]
    fn walk_clips_partial_slots() {
        let l1 = Level::new(1);
        let mib = 1024 * 1024;
        let steps: Vec<_> = l1.slots(mib, 5 * mib).collect();
        assert_eq!(
            steps,
            vec![
                SlotStep { index: 0, start: mib, end: 2 * mib },
                SlotStep { index: 1, start: 2 * mib, end: 4 * mib },
                SlotStep { index: 2, start: 4 * mib, end: 5 * mib },
            ]
        );
        assert!(!steps[0].is_full(l1));
        assert!(steps[1].is_full(l1));
        assert_eq!(steps[2].slot_base(l1), 4 * mib);
    }
}
