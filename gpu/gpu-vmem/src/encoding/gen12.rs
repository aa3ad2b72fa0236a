use super::{
    EncodingPolicy, EntryFlags, GpuPde, Granularity, LeafEntry, MemoryLocality, decode_pte,
    encode_pte, encode_scratch_pte,
};
use gpu_memory_addresses::DeviceAddress;

/// Layout for parts with device-local memory.
///
/// Device-local memory is mapped at 64 KiB granularity: its leaf nodes are
/// compact, holding 32 rows instead of 512 entries, and the directory word
/// pointing at such a node carries the compact bit. 2 MiB and 1 GiB huge
/// leaves remain available for both localities.
#[derive(Copy, Clone, Debug, Default)]
pub struct Gen12Encoding;

impl EncodingPolicy for Gen12Encoding {
    fn name(&self) -> &'static str {
        "gen12"
    }

    fn supports(&self, _size: Granularity) -> bool {
        true
    }

    fn supports_locality(&self, _locality: MemoryLocality) -> bool {
        true
    }

    fn requires_compact(&self, flags: EntryFlags) -> bool {
        flags.locality() == MemoryLocality::DeviceLocal
    }

    fn encode_leaf(&self, addr: DeviceAddress, flags: EntryFlags, size: Granularity) -> u64 {
        debug_assert!(
            size != Granularity::Size4K || !self.requires_compact(flags),
            "device-local memory cannot be mapped at 4K"
        );
        encode_pte(addr, flags, size)
    }

    fn encode_directory(&self, child: DeviceAddress, compact: bool) -> u64 {
        GpuPde::pointing_at(child)
            .with_compact_64k(compact)
            .into_bits()
    }

    fn encode_scratch_leaf(&self, null_page: Option<DeviceAddress>) -> u64 {
        encode_scratch_pte(null_page)
    }

    fn decode_leaf(&self, word: u64) -> Option<LeafEntry> {
        decode_pte(word)
    }
}
