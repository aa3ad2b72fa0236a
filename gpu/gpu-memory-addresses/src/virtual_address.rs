use crate::address_kind::address_kind;

address_kind!(
    /// GPU virtual address, as seen by shaders and copy engines.
    ///
    /// Carries intent only; it is not range-checked against any particular
    /// address space. Use the owning address space's geometry for that.
    ///
    /// ### Examples
    /// ```rust
    /// # use gpu_memory_addresses::*;
    /// let va = VirtualAddress::new(0x0000_0001_0020_1234);
    /// assert!(!va.is_aligned::<Size4K>());
    /// assert_eq!(va.align_down::<Size2M>().as_u64(), 0x0000_0001_0020_0000);
    /// assert_eq!(va.offset::<Size4K>().as_u64(), 0x234);
    /// ```
    VirtualAddress,
    "VA"
);
