//! Random insert/clear sequences checked against a flat page map.

use gpu_vmem::{
    AddressSpace, AddressSpaceConfig, BackingCursor, DeviceAddress, EntryFlags, Gen8Encoding,
    Geometry, HeapPageProvider, NodeCache, NodeCacheConfig, VirtualAddress,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

const PAGE: u64 = 0x1000;
const TWO_MIB: u64 = 0x20_0000;
/// Pages covered by the test window: two leaf nodes' worth plus change.
const WINDOW: u64 = 1280;

#[derive(Debug, Clone)]
enum Op {
    /// Maps pages `[first, first + count)`. `huge` picks backing congruent
    /// to the virtual address modulo 2 MiB, so aligned slots get huge leaves.
    Insert { first: u64, count: u64, huge: bool, tag: u64 },
    Clear { first: u64, count: u64 },
}

fn range() -> impl Strategy<Value = (u64, u64)> {
    (0..WINDOW).prop_flat_map(|first| (Just(first), 1..=(WINDOW - first).min(700)))
}

fn ops_strategy() -> impl Strategy<Value = Vec<Op>> {
    let op = prop_oneof![
        3 => (range(), any::<bool>(), 0..64u64)
            .prop_map(|((first, count), huge, tag)| Op::Insert { first, count, huge, tag }),
        2 => range().prop_map(|(first, count)| Op::Clear { first, count }),
    ];
    prop::collection::vec(op, 1..24)
}

fn backing_base(first: u64, huge: bool, tag: u64) -> u64 {
    if huge {
        0x10_0000_0000 + first * PAGE
    } else {
        0x20_0000_0000 + tag * 0x100_0000 + PAGE
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn tree_matches_flat_model(ops in ops_strategy()) {
        let provider = Arc::new(HeapPageProvider::new());
        let cache = Arc::new(NodeCache::new(provider.clone(), NodeCacheConfig::new()));
        let mut space = AddressSpace::create(
            AddressSpaceConfig::new(Geometry::new(3)),
            Arc::new(Gen8Encoding),
            cache.clone(),
            None,
        )
        .unwrap();
        let mut model: BTreeMap<u64, u64> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Insert { first, count, huge, tag } => {
                    let base = backing_base(first, huge, tag);
                    let backing = BackingCursor::contiguous(DeviceAddress::new(base), count * PAGE);
                    space
                        .insert(
                            VirtualAddress::new(first * PAGE),
                            VirtualAddress::new((first + count) * PAGE),
                            backing,
                            EntryFlags::new(),
                        )
                        .unwrap();
                    for i in 0..count {
                        model.insert(first + i, base + i * PAGE);
                    }
                }
                Op::Clear { first, count } => {
                    let start = VirtualAddress::new(first * PAGE);
                    let end = VirtualAddress::new((first + count) * PAGE);
                    space.split_huge(start).unwrap();
                    space.split_huge(end).unwrap();
                    space.clear(start, end, None);
                    for page in first..first + count {
                        model.remove(&page);
                    }
                }
            }

            let audit = space.audit();
            prop_assert!(audit.is_consistent(), "{:?}", audit.problems);
            let mapped = audit.mapped_bytes() + audit.huge_leaves as u64 * TWO_MIB;
            prop_assert_eq!(mapped, model.len() as u64 * PAGE);
        }

        for page in 0..WINDOW {
            let got = space
                .lookup(VirtualAddress::new(page * PAGE + 0x10))
                .map(|t| t.address.as_u64());
            let expected = model.get(&page).map(|base| base + 0x10);
            prop_assert_eq!(got, expected, "page {}", page);
        }

        drop(space);
        drop(cache);
        prop_assert_eq!(provider.live(), 0);
    }
}
