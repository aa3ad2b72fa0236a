//! # GPU Virtual Memory
//!
//! Concurrent management of the multi-level translation trees a GPU walks
//! to turn device virtual addresses into memory addresses.
//!
//! ## What you get
//! - [`AddressSpace`]: one translation tree with range [`insert`](AddressSpace::insert),
//!   [`clear`](AddressSpace::clear), [`lookup`](AddressSpace::lookup) and
//!   [`split_huge`](AddressSpace::split_huge), all callable from many threads at once
//!   on disjoint ranges.
//! - [`EncodingPolicy`]: how a hardware generation lays out its entry words,
//!   with [`Gen8Encoding`] and [`Gen12Encoding`] provided.
//! - [`NodeCache`]: table nodes shared by any number of address spaces, with
//!   deferred reclamation and per-worker frame reuse.
//! - [`PageProvider`]: where node frames come from and how the device sees them.
//! - [`BackingCursor`]: the memory behind an insert, as a lazy list of
//!   [`Segment`]s.
//!
//! ## Tree Layout
//!
//! Each node is a 4 KiB table of 512 64-bit entries. With four levels a
//! 48-bit virtual address splits into:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  L3   |  L2   |  L1   |  L0   | Offset |
//! ```
//!
//! Level 0 holds the leaves. A level 1 slot can hold a 2 MiB leaf and a
//! level 2 slot a 1 GiB leaf instead of pointing at a child, if the
//! encoding supports those sizes. Trees with two or three levels drop the
//! upper fields.
//!
//! ```text
//!  root (L3) ──► L2 ──► L1 ──► L0 ──► 4 KiB page
//!                 │      └───────────► 2 MiB leaf
//!                 └──────────────────► 1 GiB leaf
//! ```
//!
//! Device-local memory on [`Gen12Encoding`] is mapped through *compact* leaf
//! nodes: only the first 32 entries are used, each mapping a 64 KiB row.
//!
//! ## Unmapped Slots
//!
//! No slot is ever zero from the device's point of view. Unmapped slots
//! hold the scratch encoding of their level, which routes to a chain of
//! shared [`ScratchNode`](scratch::ScratchNode)s ending in a leaf word that
//! either faults or hits a null page. See [`scratch`].
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use gpu_vmem::*;
//!
//! let provider = Arc::new(HeapPageProvider::new());
//! let cache = Arc::new(NodeCache::new(provider, NodeCacheConfig::new()));
//! let space = AddressSpace::create(
//!     AddressSpaceConfig::new(Geometry::new(4)),
//!     Arc::new(Gen8Encoding),
//!     cache,
//!     None,
//! )?;
//!
//! let va = VirtualAddress::new(0x4000_0000);
//! space.insert(
//!     va,
//!     va + 0x20_0000,
//!     BackingCursor::contiguous(DeviceAddress::new(0x1_0000_0000), 0x20_0000),
//!     EntryFlags::read_write(),
//! )?;
//!
//! let translation = space.lookup(va + 0x1234).unwrap();
//! assert_eq!(translation.size, Granularity::Size2M);
//! assert_eq!(translation.address, DeviceAddress::new(0x1_0000_1234));
//!
//! space.clear(va, va + 0x20_0000, None);
//! assert!(space.lookup(va).is_none());
//! # Ok::<(), AllocError>(())
//! ```

#![allow(unsafe_code, clippy::cast_possible_truncation)]

pub mod address_space;
mod clear;
pub mod cursor;
pub mod encoding;
pub mod freelist;
pub mod geometry;
mod insert;
mod node;
pub mod provider;
pub mod scratch;
mod walk;

pub use crate::address_space::{AddressSpace, AddressSpaceConfig, Translation, TreeAudit};
pub use crate::cursor::{BackingCursor, Segment};
pub use crate::encoding::{
    CacheMode, EncodingPolicy, EntryFlags, Gen8Encoding, Gen12Encoding, Granularity, LeafEntry,
    MemoryLocality,
};
pub use crate::freelist::{CacheStats, NodeCache, NodeCacheConfig};
pub use crate::geometry::{Geometry, Level};
pub use crate::provider::{
    AllocError, EntryTable, HeapPageProvider, NodeFrame, PageProvider, PageProviderError,
};
pub use crate::scratch::{InvalidAccess, ScratchSet};
pub use gpu_memory_addresses::{DeviceAddress, PhysicalAddress, PhysicalPage, VirtualAddress};
