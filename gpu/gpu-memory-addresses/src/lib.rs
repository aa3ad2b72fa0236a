//! # GPU Memory Address Types
//!
//! Strongly typed wrappers for the three address spaces a GPU page table
//! deals with.
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] | GPU virtual address, the input of a translation. |
//! | [`DeviceAddress`] | Bus (DMA) address the GPU reaches memory at, the output of a translation. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Host physical memory backing a table node. |
//!
//! All three are built on a raw [`MemoryAddress`], with [`MemoryPage<S>`] and
//! [`MemoryAddressOffset<S>`] carrying the page size at the type level.
//!
//! ## Page Sizes
//!
//! - [`Size4K`]: base granularity
//! - [`Size64K`]: compact leaf rows for device-local memory
//! - [`Size2M`]: huge leaf in a level-1 directory slot
//! - [`Size1G`]: huge leaf in a level-2 directory slot
//!
//! ```rust
//! # use gpu_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let page = pa.page::<Size4K>();
//! assert_eq!(page.join(pa.offset::<Size4K>()), pa);
//!
//! let da = DeviceAddress::new(0x0000_0001_0000_0000);
//! assert!(da.is_aligned::<Size1G>());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod address_kind;
mod device_address;
mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;

pub use device_address::DeviceAddress;
pub use memory_address::MemoryAddress;
pub use memory_address_offset::MemoryAddressOffset;
pub use memory_page::MemoryPage;
pub use page_size::{PageSize, Size1G, Size2M, Size4K, Size64K};
pub use physical_address::PhysicalAddress;
pub use physical_page::PhysicalPage;
pub use virtual_address::VirtualAddress;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_64k() {
        let a = MemoryAddress::new(0x0000_0008_1234_5678);
        let (p, o) = a.split::<Size64K>();
        assert_eq!(p.base().as_u64(), 0x0000_0008_1234_0000);
        assert_eq!(o.as_u64(), 0x5678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_1g() {
        let a = MemoryAddress::new(0x0000_0004_1234_5678);
        let (p, o) = a.split::<Size1G>();
        assert!(p.base().is_aligned::<Size1G>());
        assert_eq!(o.as_u64(), a.as_u64() & (Size1G::SIZE - 1));
        assert_eq!(p + o, a);
    }

    #[test]
    fn wrappers_keep_intent_in_debug_output() {
        assert_eq!(
            format!("{:?}", VirtualAddress::new(0x1000)),
            "VA(0x0000000000001000)"
        );
        assert_eq!(
            format!("{:?}", DeviceAddress::new(0x2000)),
            "DA(0x0000000000002000)"
        );
        assert_eq!(
            format!("{:?}", PhysicalAddress::new(0x3000)),
            "PA(0x0000000000003000)"
        );
    }

    #[test]
    fn arithmetic() {
        let mut da = DeviceAddress::new(0x10_0000);
        da += Size2M::SIZE;
        assert_eq!(da - DeviceAddress::new(0x10_0000), Size2M::SIZE);
        assert_eq!(VirtualAddress::new(u64::MAX).checked_add(1), None);
        assert_eq!(
            VirtualAddress::new(0x1234).align_down::<Size4K>(),
            VirtualAddress::new(0x1000)
        );
    }

    #[test]
    fn page_numbers() {
        let pp = PhysicalAddress::new(0x5000).page::<Size4K>();
        assert_eq!(pp.number(), 5);
        assert_eq!(PhysicalAddress::from(pp), PhysicalAddress::new(0x5000));
    }
}
