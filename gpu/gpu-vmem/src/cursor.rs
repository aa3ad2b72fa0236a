//! # Backing Cursor
//!
//! The memory behind an insert arrives as a sequence of device-contiguous
//! [`Segment`]s, e.g. the entries of a scatter-gather table. A
//! [`BackingCursor`] walks it lazily as the insert fills leaves: it reports
//! the run still available in the current segment, which decides whether a
//! huge leaf can be used, and hands out addresses one block at a time.

use gpu_memory_addresses::{DeviceAddress, PageSize, Size4K};
use std::iter;
use std::slice;

/// A device-contiguous piece of backing memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    pub addr: DeviceAddress,
    pub len: u64,
}

impl Segment {
    #[must_use]
    pub const fn new(addr: DeviceAddress, len: u64) -> Self {
        Self { addr, len }
    }
}

/// Lazy position inside a sequence of [`Segment`]s.
///
/// Cloning a cursor restarts the walk from the clone's position.
#[derive(Clone, Debug)]
pub struct BackingCursor<I> {
    segments: I,
    addr: DeviceAddress,
    remaining: u64,
    consumed: u64,
}

impl BackingCursor<iter::Once<Segment>> {
    /// A single contiguous block.
    #[must_use]
    pub fn contiguous(addr: DeviceAddress, len: u64) -> Self {
        Self::new(iter::once(Segment::new(addr, len)))
    }
}

impl<'a> BackingCursor<iter::Copied<slice::Iter<'a, Segment>>> {
    #[must_use]
    pub fn from_segments(segments: &'a [Segment]) -> Self {
        Self::new(segments.iter().copied())
    }
}

impl<I: Iterator<Item = Segment>> BackingCursor<I> {
    pub fn new<T>(segments: T) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            segments: segments.into_iter(),
            addr: DeviceAddress::zero(),
            remaining: 0,
            consumed: 0,
        }
    }

    /// Bytes handed out so far.
    #[must_use]
    pub const fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Moves to the next non-empty segment if the current one is used up.
    ///
    /// # Panics
    /// Panics on segments that are not 4 KiB aligned.
    fn refill(&mut self) -> bool {
        while self.remaining == 0 {
            let Some(segment) = self.segments.next() else {
                return false;
            };
            assert!(
                segment.addr.is_aligned::<Size4K>() && segment.len % Size4K::SIZE == 0,
                "backing segment {segment:?} is not page aligned"
            );
            self.addr = segment.addr;
            self.remaining = segment.len;
        }
        true
    }

    /// Address and length of the contiguous run at the cursor, if any
    /// backing is left.
    pub fn run(&mut self) -> Option<(DeviceAddress, u64)> {
        self.refill().then_some((self.addr, self.remaining))
    }

    /// Start of the next `size` bytes, provided they are contiguous and the
    /// start is aligned to `size`. Does not advance.
    pub(crate) fn peek_block(&mut self, size: u64) -> Option<DeviceAddress> {
        let (addr, len) = self.run()?;
        (len >= size && addr.as_u64() & (size - 1) == 0).then_some(addr)
    }

    /// Consumes the next `size` bytes and returns their start.
    ///
    /// # Panics
    /// Panics if the backing ends early or the current run cannot supply a
    /// `size` block.
    pub(crate) fn take(&mut self, size: u64) -> DeviceAddress {
        let Some((addr, len)) = self.run() else {
            panic!("backing exhausted after {:#x} bytes", self.consumed);
        };
        assert!(
            len >= size && addr.as_u64() & (size - 1) == 0,
            "backing run {addr} (+{len:#x}) cannot supply an aligned {size:#x} block"
        );
        self.addr += size;
        self.remaining -= size;
        self.consumed += size;
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_memory_addresses::{Size2M, Size64K};

    #[test]
    fn walks_segments_in_order() {
        let segs = [
            Segment::new(DeviceAddress::new(0x10_0000), 0x2000),
            Segment::new(DeviceAddress::new(0x50_0000), 0),
            Segment::new(DeviceAddress::new(0x80_0000), 0x1000),
        ];
        let mut cursor = BackingCursor::from_segments(&segs);
        assert_eq!(cursor.take(0x1000), DeviceAddress::new(0x10_0000));
        assert_eq!(cursor.take(0x1000), DeviceAddress::new(0x10_1000));
        assert_eq!(cursor.run(), Some((DeviceAddress::new(0x80_0000), 0x1000)));
        assert_eq!(cursor.take(0x1000), DeviceAddress::new(0x80_0000));
        assert_eq!(cursor.run(), None);
        assert_eq!(cursor.consumed(), 0x3000);
    }

    #[test]
    fn huge_blocks_need_alignment_and_length() {
        let mut cursor = BackingCursor::contiguous(DeviceAddress::new(0x20_0000), 2 * Size2M::SIZE);
        assert_eq!(cursor.peek_block(Size2M::SIZE), Some(DeviceAddress::new(0x20_0000)));
        cursor.take(Size4K::SIZE);
        assert_eq!(cursor.peek_block(Size2M::SIZE), None);
        assert_eq!(cursor.peek_block(Size4K::SIZE), Some(DeviceAddress::new(0x20_1000)));
    }

    #[test]
    fn clones_restart_independently() {
        let mut a = BackingCursor::contiguous(DeviceAddress::new(0x1_0000), Size64K::SIZE);
        let mut b = a.clone();
        a.take(Size64K::SIZE);
        assert_eq!(b.take(Size64K::SIZE), DeviceAddress::new(0x1_0000));
    }

    #[test]
    #[should_panic(expected = "backing exhausted")]
    fn running_out_panics() {
        let mut cursor = BackingCursor::contiguous(DeviceAddress::new(0x1000), 0x1000);
        cursor.take(0x1000);
        cursor.take(0x1000);
    }
}
