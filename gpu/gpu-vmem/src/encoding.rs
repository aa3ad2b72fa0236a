//! # Entry Encoding Policies
//!
//! A table walk never builds raw words itself; it asks the address space's
//! [`EncodingPolicy`] to encode leaves and directory pointers. One policy is
//! chosen per address space at construction and matches the hardware
//! generation driving it.
//!
//! - [`Gen8Encoding`]: system memory only; 4 KiB, 2 MiB and 1 GiB leaves.
//! - [`Gen12Encoding`]: adds device-local memory, which must be mapped
//!   through compact leaf nodes holding 64 KiB rows.

use core::fmt;
use gpu_memory_addresses::{DeviceAddress, PageSize, Size1G, Size2M, Size4K, Size64K};

mod entries;
mod gen12;
mod gen8;

pub use entries::{GpuPde, GpuPte, HUGE_BIT};
pub use gen8::Gen8Encoding;
pub use gen12::Gen12Encoding;

/// Cacheability of a leaf mapping.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum CacheMode {
    Uncached = 0,
    WriteCombining = 1,
    #[default]
    Cached = 2,
}

impl CacheMode {
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Uncached,
            1 => Self::WriteCombining,
            _ => Self::Cached,
        }
    }
}

/// Where the memory behind a leaf lives.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum MemoryLocality {
    /// Host memory reached over the bus.
    #[default]
    System,
    /// Memory local to the device (VRAM).
    DeviceLocal,
}

/// Attributes written into every leaf of an insert.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryFlags {
    valid: bool,
    writable: bool,
    cache: CacheMode,
    locality: MemoryLocality,
}

impl Default for EntryFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl EntryFlags {
    /// Valid, read-only, cached system memory.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            valid: true,
            writable: false,
            cache: CacheMode::Cached,
            locality: MemoryLocality::System,
        }
    }

    /// Valid, writable, cached system memory.
    #[must_use]
    pub const fn read_write() -> Self {
        Self::new().with_writable(true)
    }

    #[must_use]
    pub const fn with_valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    #[must_use]
    pub const fn with_writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    #[must_use]
    pub const fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub const fn with_locality(mut self, locality: MemoryLocality) -> Self {
        self.locality = locality;
        self
    }

    #[must_use]
    pub const fn valid(self) -> bool {
        self.valid
    }

    #[must_use]
    pub const fn writable(self) -> bool {
        self.writable
    }

    #[must_use]
    pub const fn cache(self) -> CacheMode {
        self.cache
    }

    #[must_use]
    pub const fn locality(self) -> MemoryLocality {
        self.locality
    }
}

/// Size of the memory one leaf entry translates.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Granularity {
    /// One entry of a standard leaf node.
    Size4K,
    /// One row of a compact leaf node.
    Size64K,
    /// A huge leaf in a level-1 slot.
    Size2M,
    /// A huge leaf in a level-2 slot.
    Size1G,
}

impl Granularity {
    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => Size4K::SIZE,
            Self::Size64K => Size64K::SIZE,
            Self::Size2M => Size2M::SIZE,
            Self::Size1G => Size1G::SIZE,
        }
    }

    /// The huge granularity a directory slot at `level` may hold, if any.
    #[must_use]
    pub(crate) const fn huge_at(level: crate::Level) -> Option<Self> {
        match level.as_u8() {
            1 => Some(Self::Size2M),
            2 => Some(Self::Size1G),
            _ => None,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Size4K => Size4K::as_str(),
            Self::Size64K => Size64K::as_str(),
            Self::Size2M => Size2M::as_str(),
            Self::Size1G => Size1G::as_str(),
        })
    }
}

/// A decoded leaf word.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct LeafEntry {
    /// Base of the mapped block.
    pub address: DeviceAddress,
    pub flags: EntryFlags,
}

/// Hardware-generation specific word formats.
///
/// Implementations are stateless and shared behind an `Arc` by every walker
/// of an address space.
pub trait EncodingPolicy: Send + Sync + fmt::Debug {
    /// Short name; address spaces only share scratch nodes with spaces of
    /// the same encoding name.
    fn name(&self) -> &'static str;

    /// Whether leaves of `size` can be expressed.
    fn supports(&self, size: Granularity) -> bool;

    /// Whether leaves carrying `locality` can be expressed.
    fn supports_locality(&self, locality: MemoryLocality) -> bool;

    /// Whether memory mapped with `flags` must go through compact leaf nodes.
    fn requires_compact(&self, flags: EntryFlags) -> bool;

    /// Encodes a populated leaf translating a `size` block at `addr`.
    fn encode_leaf(&self, addr: DeviceAddress, flags: EntryFlags, size: Granularity) -> u64;

    /// Encodes a directory word pointing at a child node.
    fn encode_directory(&self, child: DeviceAddress, compact: bool) -> u64;

    /// Encodes the word a leaf slot holds while nothing is mapped there.
    ///
    /// With `null_page` the access is routed to that page, otherwise it faults.
    fn encode_scratch_leaf(&self, null_page: Option<DeviceAddress>) -> u64;

    /// Decodes a populated leaf; `None` for scratch and directory words.
    fn decode_leaf(&self, word: u64) -> Option<LeafEntry>;

    /// Whether a word found in a directory slot is a huge leaf.
    fn is_huge_leaf(&self, word: u64) -> bool {
        word & HUGE_BIT != 0
    }

    /// Child address of a directory word.
    fn directory_target(&self, word: u64) -> DeviceAddress {
        GpuPde::from_bits(word).address()
    }
}

/// Leaf word layout shared by the generations implemented here.
pub(crate) const fn encode_pte(addr: DeviceAddress, flags: EntryFlags, size: Granularity) -> u64 {
    GpuPte::new()
        .with_valid(flags.valid())
        .with_writable(flags.writable())
        .with_cache(flags.cache().into_bits())
        .with_huge(matches!(size, Granularity::Size2M | Granularity::Size1G))
        .with_row_64k(matches!(size, Granularity::Size64K))
        .with_populated(true)
        .with_local_memory(matches!(flags.locality(), MemoryLocality::DeviceLocal))
        .with_address(addr)
        .into_bits()
}

pub(crate) const fn decode_pte(word: u64) -> Option<LeafEntry> {
    let pte = GpuPte::from_bits(word);
    if !pte.populated() {
        return None;
    }
    let locality = if pte.local_memory() {
        MemoryLocality::DeviceLocal
    } else {
        MemoryLocality::System
    };
    Some(LeafEntry {
        address: pte.address(),
        flags: EntryFlags::new()
            .with_valid(pte.valid())
            .with_writable(pte.writable())
            .with_cache(CacheMode::from_bits(pte.cache()))
            .with_locality(locality),
    })
}

/// Scratch leaf: read-only and never `populated`, so it cannot be mistaken
/// for a mapping.
pub(crate) const fn encode_scratch_pte(null_page: Option<DeviceAddress>) -> u64 {
    match null_page {
        Some(page) => GpuPte::new()
            .with_valid(true)
            .with_cache(CacheMode::Uncached.into_bits())
            .with_address(page)
            .into_bits(),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_round_trip_keeps_attributes() {
        let flags = EntryFlags::read_write()
            .with_cache(CacheMode::WriteCombining)
            .with_locality(MemoryLocality::DeviceLocal);
        let word = encode_pte(DeviceAddress::new(0x4_0000), flags, Granularity::Size64K);
        let decoded = decode_pte(word).unwrap();
        assert_eq!(decoded.flags, flags);
        assert_eq!(decoded.address, DeviceAddress::new(0x4_0000));
        assert!(GpuPte::from_bits(word).row_64k());
    }

    #[test]
    fn scratch_words_are_never_populated() {
        assert_eq!(decode_pte(encode_scratch_pte(None)), None);
        let null = encode_scratch_pte(Some(DeviceAddress::new(0x7000)));
        assert_eq!(decode_pte(null), None);
        assert!(GpuPte::from_bits(null).valid());
    }

    #[test]
    fn invalid_flags_still_decode() {
        let flags = EntryFlags::new().with_valid(false);
        let word = encode_pte(DeviceAddress::new(0x1000), flags, Granularity::Size4K);
        assert!(!decode_pte(word).unwrap().flags.valid());
    }
}
