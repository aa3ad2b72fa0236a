use crate::address_kind::address_kind;
use crate::{PageSize, PhysicalPage};

address_kind!(
    /// Host physical memory address.
    ///
    /// Physical addresses identify the backing of a table node on the host
    /// side. The device never dereferences them directly; it sees the
    /// [`DeviceAddress`](super::DeviceAddress) the node was mapped at.
    PhysicalAddress,
    "PA"
);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> PhysicalPage<S> {
        PhysicalPage::<S>(self.0.page::<S>())
    }
}

impl<S: PageSize> From<PhysicalPage<S>> for PhysicalAddress {
    fn from(value: PhysicalPage<S>) -> Self {
        value.base()
    }
}
