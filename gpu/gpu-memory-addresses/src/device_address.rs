use crate::address_kind::address_kind;

address_kind!(
    /// Bus address of memory as the GPU reaches it (DMA / IOVA).
    ///
    /// Leaf entries translate GPU virtual addresses to device addresses, and
    /// directory entries point at child tables by their device address.
    ///
    /// ### Examples
    /// ```rust
    /// # use gpu_memory_addresses::*;
    /// let base = DeviceAddress::new(0x8000_0000);
    /// let next = base + Size64K::SIZE;
    /// assert!(next.is_aligned::<Size64K>());
    /// assert_eq!(next - base, 0x1_0000);
    /// ```
    DeviceAddress,
    "DA"
);
