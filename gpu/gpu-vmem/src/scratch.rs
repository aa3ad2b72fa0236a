//! # Scratch Nodes
//!
//! Every unmapped slot must still hold a word the device can follow without
//! faulting fatally. At the leaf level that word is the scratch leaf: a
//! non-populated entry that either faults or points at a null page. One
//! level up, unmapped slots point at a *scratch node* whose 512 entries all
//! hold the scratch leaf, and so on up to the root's children:
//!
//! ```text
//!  root (Ln) ──► scratch[n-1] ──► ... ──► scratch[0] ──► scratch leaf
//!     │ every unmapped slot           every entry          (fault / null page)
//! ```
//!
//! Scratch nodes are never written after construction, so address spaces with
//! the same encoding and invalid-access policy can share them. Sharing is per
//! level: a deeper space reuses a shallower space's nodes and builds the
//! missing upper ones itself.

use crate::encoding::EncodingPolicy;
use crate::freelist::{FramePool, MappedFrame, NodeCache};
use crate::geometry::Level;
use crate::provider::AllocError;
use gpu_memory_addresses::{DeviceAddress, VirtualAddress};
use std::sync::Arc;

/// What a device access to an unmapped address does.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum InvalidAccess {
    /// The access faults.
    #[default]
    Fault,
    /// The access hits the given page; reads return its contents.
    NullPage(DeviceAddress),
}

impl InvalidAccess {
    const fn null_page(self) -> Option<DeviceAddress> {
        match self {
            Self::Fault => None,
            Self::NullPage(page) => Some(page),
        }
    }
}

/// An immutable node whose entries all hold the scratch encoding of the
/// level below.
pub struct ScratchNode {
    frame: Option<MappedFrame>,
    level: Level,
    fill: u64,
    encoding: u64,
    pool: Arc<FramePool>,
}

impl ScratchNode {
    #[must_use]
    pub const fn level(&self) -> Level {
        self.level
    }

    /// Device address of the node.
    #[must_use]
    pub fn address(&self) -> DeviceAddress {
        self.frame.as_ref().map_or(DeviceAddress::zero(), MappedFrame::dma)
    }

    /// The word every entry of this node holds.
    #[must_use]
    pub const fn fill(&self) -> u64 {
        self.fill
    }

    /// The word a parent slot holds to route to this node.
    #[must_use]
    pub const fn encoding(&self) -> u64 {
        self.encoding
    }
}

impl Drop for ScratchNode {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            log::trace!("releasing {} scratch node {}", self.level, frame.page());
            self.pool.put(frame);
        }
    }
}

impl core::fmt::Debug for ScratchNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ScratchNode")
            .field("level", &self.level)
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// The scratch chain of one address space.
#[derive(Clone, Debug)]
pub struct ScratchSet {
    invalid_access: InvalidAccess,
    encoding_name: &'static str,
    leaf: u64,
    /// Scratch node per level, `nodes[l]` sits at level `l`.
    nodes: Vec<Arc<ScratchNode>>,
}

impl ScratchSet {
    /// Builds the chain for a tree whose root is at `top`, reusing the
    /// levels of `share_from` that are compatible.
    pub(crate) fn build(
        cache: &NodeCache,
        encoding: &dyn EncodingPolicy,
        invalid_access: InvalidAccess,
        top: Level,
        share_from: Option<&Self>,
    ) -> Result<Self, AllocError> {
        let leaf = encoding.encode_scratch_leaf(invalid_access.null_page());
        let mut nodes = match share_from {
            Some(other) if other.compatible(encoding, invalid_access) => {
                let shared = other.nodes.len().min(top.as_usize());
                log::debug!("sharing {shared} scratch levels");
                other.nodes[..shared].to_vec()
            }
            Some(other) => {
                log::warn!(
                    "not sharing scratch nodes: {}/{:?} differs from {}/{:?}",
                    encoding.name(),
                    invalid_access,
                    other.encoding_name,
                    other.invalid_access
                );
                Vec::new()
            }
            None => Vec::new(),
        };

        while nodes.len() < top.as_usize() {
            let level = Level::new(u8::try_from(nodes.len()).unwrap_or(u8::MAX));
            let fill = nodes.last().map_or(leaf, |below| below.encoding);
            let frame = cache
                .acquire()
                .map_err(|err| AllocError::new(err, level, VirtualAddress::zero()))?;
            frame.table().fill(fill);
            let node = ScratchNode {
                encoding: encoding.encode_directory(frame.dma(), false),
                frame: Some(frame),
                level,
                fill,
                pool: Arc::clone(cache.pool()),
            };
            log::trace!("built {level} scratch node at {}", node.address());
            nodes.push(Arc::new(node));
        }

        Ok(Self {
            invalid_access,
            encoding_name: encoding.name(),
            leaf,
            nodes,
        })
    }

    fn compatible(&self, encoding: &dyn EncodingPolicy, invalid_access: InvalidAccess) -> bool {
        self.invalid_access == invalid_access && self.encoding_name == encoding.name()
    }

    #[must_use]
    pub const fn invalid_access(&self) -> InvalidAccess {
        self.invalid_access
    }

    /// The word an unmapped slot of a `level` node holds.
    #[must_use]
    pub fn encoding(&self, level: Level) -> u64 {
        if level.is_leaf() {
            self.leaf
        } else {
            self.nodes[level.as_usize() - 1].encoding
        }
    }

    /// The scratch node at `level`, if the chain reaches that high.
    #[must_use]
    pub fn node(&self, level: Level) -> Option<&Arc<ScratchNode>> {
        self.nodes.get(level.as_usize())
    }

    /// Whether both sets use the very same scratch node at `level`.
    #[must_use]
    pub fn shares_level_with(&self, other: &Self, level: Level) -> bool {
        match (self.node(level), other.node(level)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{Gen8Encoding, Gen12Encoding};
    use crate::freelist::NodeCacheConfig;
    use crate::provider::HeapPageProvider;

    fn cache() -> (Arc<HeapPageProvider>, NodeCache) {
        let provider = Arc::new(HeapPageProvider::new());
        let cache = NodeCache::new(provider.clone(), NodeCacheConfig::disabled());
        (provider, cache)
    }

    #[test]
    fn chain_links_each_level_to_the_one_below() {
        let (provider, cache) = cache();
        let set = ScratchSet::build(&cache, &Gen8Encoding, InvalidAccess::Fault, Level::new(3), None)
            .unwrap();
        assert_eq!(provider.live(), 3);
        assert_eq!(set.encoding(Level::LEAF), 0);
        for l in 1..3u8 {
            let below = set.node(Level::new(l - 1)).unwrap();
            let node = set.node(Level::new(l)).unwrap();
            assert_eq!(node.fill(), below.encoding());
            assert_eq!(set.encoding(Level::new(l)), below.encoding());
        }
        assert!(set.node(Level::new(3)).is_none());
        drop(set);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn null_page_leaf() {
        let (_provider, cache) = cache();
        let null = DeviceAddress::new(0xDEAD_0000);
        let set = ScratchSet::build(
            &cache,
            &Gen8Encoding,
            InvalidAccess::NullPage(null),
            Level::new(1),
            None,
        )
        .unwrap();
        let leaf = crate::encoding::GpuPte::from_bits(set.encoding(Level::LEAF));
        assert!(leaf.valid());
        assert!(!leaf.populated());
        assert_eq!(leaf.address(), null);
    }

    #[test]
    fn deeper_space_extends_a_shallower_chain() {
        let (provider, cache) = cache();
        let small = ScratchSet::build(&cache, &Gen8Encoding, InvalidAccess::Fault, Level::new(1), None)
            .unwrap();
        let big = ScratchSet::build(
            &cache,
            &Gen8Encoding,
            InvalidAccess::Fault,
            Level::new(3),
            Some(&small),
        )
        .unwrap();
        assert!(big.shares_level_with(&small, Level::LEAF));
        assert!(!big.shares_level_with(&small, Level::new(1)));
        assert_eq!(provider.live(), 3);
        drop(small);
        assert_eq!(provider.live(), 3);
        drop(big);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn incompatible_policies_get_private_chains() {
        let (_provider, cache) = cache();
        let a = ScratchSet::build(&cache, &Gen8Encoding, InvalidAccess::Fault, Level::new(2), None)
            .unwrap();
        let b = ScratchSet::build(&cache, &Gen12Encoding, InvalidAccess::Fault, Level::new(2), Some(&a))
            .unwrap();
        let c = ScratchSet::build(
            &cache,
            &Gen8Encoding,
            InvalidAccess::NullPage(DeviceAddress::new(0x1000)),
            Level::new(2),
            Some(&a),
        )
        .unwrap();
        assert!(!b.shares_level_with(&a, Level::LEAF));
        assert!(!c.shares_level_with(&a, Level::LEAF));
    }
}
