use super::{
    EncodingPolicy, EntryFlags, GpuPde, Granularity, LeafEntry, MemoryLocality, decode_pte,
    encode_pte, encode_scratch_pte,
};
use gpu_memory_addresses::DeviceAddress;

/// Four-level layout for parts that only map system memory.
///
/// Supports 4 KiB leaves and 2 MiB / 1 GiB huge leaves. Compact leaf nodes
/// do not exist on this generation.
#[derive(Copy, Clone, Debug, Default)]
pub struct Gen8Encoding;

impl EncodingPolicy for Gen8Encoding {
    fn name(&self) -> &'static str {
        "gen8"
    }

    fn supports(&self, size: Granularity) -> bool {
        !matches!(size, Granularity::Size64K)
    }

    fn supports_locality(&self, locality: MemoryLocality) -> bool {
        locality == MemoryLocality::System
    }

    fn requires_compact(&self, _flags: EntryFlags) -> bool {
        false
    }

    fn encode_leaf(&self, addr: DeviceAddress, flags: EntryFlags, size: Granularity) -> u64 {
        debug_assert!(self.supports(size), "{size} leaves are not supported by gen8");
        encode_pte(addr, flags, size)
    }

    fn encode_directory(&self, child: DeviceAddress, compact: bool) -> u64 {
        debug_assert!(!compact, "gen8 has no compact leaf nodes");
        GpuPde::pointing_at(child).into_bits()
    }

    fn encode_scratch_leaf(&self, null_page: Option<DeviceAddress>) -> u64 {
        encode_scratch_pte(null_page)
    }

    fn decode_leaf(&self, word: u64) -> Option<LeafEntry> {
        decode_pte(word)
    }
}
