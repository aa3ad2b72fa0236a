//! Raw 64-bit entry formats.
//!
//! ### Leaf entry ([`GpuPte`])
//!
//! | Bits   | Name            | Meaning |
//! |--------|-----------------|---------|
//! | 0      | `valid`         | Translation is valid |
//! | 1      | `writable`      | Writes allowed |
//! | 3–4    | `cache`         | [`CacheMode`](super::CacheMode) selector |
//! | 7      | `huge`          | 2 MiB / 1 GiB leaf held in a directory slot |
//! | 8      | `row_64k`       | 64 KiB row of a compact leaf node |
//! | 9      | `populated`     | Software: written by an insert (never set in scratch words) |
//! | 11     | `local_memory`  | Target is device-local memory |
//! | 12–51  | address         | Device address bits 51:12 |
//!
//! ### Directory entry ([`GpuPde`])
//!
//! | Bits   | Name          | Meaning |
//! |--------|---------------|---------|
//! | 0      | `valid`       | Points at a child node |
//! | 1      | `writable`    | Always set; leaves decide |
//! | 7      | huge          | Must be 0 |
//! | 10     | `compact_64k` | Child is a compact leaf node |
//! | 12–51  | address       | Child node device address bits 51:12 |

use bitfield_struct::bitfield;
use gpu_memory_addresses::DeviceAddress;

/// Bit 7: distinguishes a huge leaf from a directory pointer in a directory slot.
pub const HUGE_BIT: u64 = 1 << 7;

const ADDRESS_SHIFT: u32 = 12;

/// Leaf translation entry, also used for huge leaves in directory slots.
#[bitfield(u64)]
pub struct GpuPte {
    /// Valid (bit 0).
    pub valid: bool,
    /// Writable (bit 1).
    pub writable: bool,
    #[bits(1)]
    __res2: u8,
    /// Cache mode selector (bits 3..4).
    #[bits(2)]
    pub cache: u8,
    #[bits(2)]
    __res5_6: u8,
    /// Huge leaf (bit 7).
    pub huge: bool,
    /// 64 KiB row (bit 8).
    pub row_64k: bool,
    /// Populated by an insert (bit 9, ignored by hardware).
    pub populated: bool,
    #[bits(1)]
    __res10: u8,
    /// Device-local memory (bit 11).
    pub local_memory: bool,
    /// Device address bits 51:12.
    #[bits(40)]
    addr_51_12: u64,
    #[bits(12)]
    __res52_63: u16,
}

impl GpuPte {
    #[inline]
    #[must_use]
    pub const fn with_address(mut self, addr: DeviceAddress) -> Self {
        self.set_addr_51_12(addr.as_u64() >> ADDRESS_SHIFT);
        self
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> DeviceAddress {
        DeviceAddress::new(self.addr_51_12() << ADDRESS_SHIFT)
    }
}

/// Directory entry pointing at a child node.
#[bitfield(u64)]
pub struct GpuPde {
    /// Valid (bit 0).
    pub valid: bool,
    /// Writable (bit 1).
    pub writable: bool,
    #[bits(5)]
    __res2_6: u8,
    /// Huge (bit 7): **must be 0** in a directory entry.
    #[bits(1)]
    __huge_must_be_0: u8,
    #[bits(2)]
    __res8_9: u8,
    /// Child is a compact 64 KiB leaf node (bit 10).
    pub compact_64k: bool,
    #[bits(1)]
    __res11: u8,
    /// Child node device address bits 51:12.
    #[bits(40)]
    addr_51_12: u64,
    #[bits(12)]
    __res52_63: u16,
}

impl GpuPde {
    /// Directory entry for a child node at `child`.
    #[inline]
    #[must_use]
    pub const fn pointing_at(child: DeviceAddress) -> Self {
        let mut pde = Self::new().with_valid(true).with_writable(true);
        pde.set_addr_51_12(child.as_u64() >> ADDRESS_SHIFT);
        pde
    }

    #[inline]
    #[must_use]
    pub const fn address(self) -> DeviceAddress {
        DeviceAddress::new(self.addr_51_12() << ADDRESS_SHIFT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_layout() {
        let pte = GpuPte::new()
            .with_valid(true)
            .with_huge(true)
            .with_populated(true)
            .with_address(DeviceAddress::new(0x0000_0012_3460_0000));
        let raw = pte.into_bits();
        assert_eq!(raw & 1, 1);
        assert_eq!(raw & HUGE_BIT, HUGE_BIT);
        assert_eq!(raw & (1 << 9), 1 << 9);
        assert_eq!(raw & 0x000F_FFFF_FFFF_F000, 0x0000_0012_3460_0000);
        assert_eq!(GpuPte::from_bits(raw).address().as_u64(), 0x0000_0012_3460_0000);
    }

    #[test]
    fn pde_never_sets_huge() {
        let pde = GpuPde::pointing_at(DeviceAddress::new(0xABCD_E000)).with_compact_64k(true);
        let raw = pde.into_bits();
        assert_eq!(raw & HUGE_BIT, 0);
        assert_eq!(raw & (1 << 10), 1 << 10);
        assert_eq!(pde.address().as_u64(), 0xABCD_E000);
    }
}
