use core::fmt;
use core::hash::Hash;

mod sealed {
    pub trait Sealed {}
}

/// Marker trait for the translation granularities a GPU page table can express.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + PartialEq + Ord + PartialOrd + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:expr, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                fmt::Display::fmt(&self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page, the base granularity of every table.
    Size4K, 12, "4K"
);
page_size!(
    /// 64 KiB page, used by compact leaf tables for device-local memory.
    Size64K, 16, "64K"
);
page_size!(
    /// 2 MiB huge page (`2_097_152` bytes).
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB huge page (`1_073_741_824` bytes).
    Size1G, 30, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_shifts() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size64K::SIZE, 16 * Size4K::SIZE);
        assert_eq!(Size2M::SIZE, 512 * Size4K::SIZE);
        assert_eq!(Size1G::SIZE, 512 * Size2M::SIZE);
    }

    #[test]
    fn labels() {
        assert_eq!(format!("{Size64K}"), "64K");
        assert_eq!(format!("{Size1G:?}"), "1G");
    }
}
