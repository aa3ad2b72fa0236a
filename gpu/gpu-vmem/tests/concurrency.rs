use gpu_vmem::{
    AddressSpace, AddressSpaceConfig, BackingCursor, DeviceAddress, EntryFlags, Gen8Encoding,
    Geometry, HeapPageProvider, NodeCache, NodeCacheConfig, VirtualAddress,
};
use std::sync::{Arc, Barrier};
use std::thread;

const PAGE: u64 = 0x1000;
const TWO_MIB: u64 = 0x20_0000;

fn setup() -> (Arc<HeapPageProvider>, Arc<NodeCache>, AddressSpace) {
    let provider = Arc::new(HeapPageProvider::new());
    let cache = Arc::new(NodeCache::new(provider.clone(), NodeCacheConfig::new()));
    let space = AddressSpace::create(
        AddressSpaceConfig::new(Geometry::new(4)),
        Arc::new(Gen8Encoding),
        cache.clone(),
        None,
    )
    .unwrap();
    (provider, cache, space)
}

fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

/// Backing that is 4 KiB aligned but never 2 MiB aligned, so no huge leaves.
fn backing(tag: u64, len: u64) -> BackingCursor<std::iter::Once<gpu_vmem::Segment>> {
    BackingCursor::contiguous(DeviceAddress::new(0x1_0000_0000 * (tag + 1) + PAGE), len)
}

#[test]
fn disjoint_inserts_share_their_ancestors() {
    let threads = 8;
    let (provider, cache, mut space) = setup();
    let start = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let space = &space;
            let start = &start;
            s.spawn(move || {
                start.wait();
                let base = t * TWO_MIB;
                space
                    .insert(va(base), va(base + TWO_MIB), backing(t, TWO_MIB), EntryFlags::read_write())
                    .unwrap();
            });
        }
    });

    let audit = space.audit();
    assert!(audit.is_consistent(), "{:?}", audit.problems);
    // One L2 and one L1 node were created, no matter who won the races.
    assert_eq!(audit.nodes, [threads, 1, 1, 1]);
    assert_eq!(audit.small_leaves, threads * 512);

    for t in 0..threads as u64 {
        let got = space.lookup(va(t * TWO_MIB + 0x5678)).unwrap();
        assert_eq!(got.address, DeviceAddress::new(0x1_0000_0000 * (t + 1) + PAGE + 0x5678));
    }

    drop(space);
    drop(cache);
    assert_eq!(provider.live(), 0);
    assert_eq!(provider.allocated(), provider.freed());
}

#[test]
fn insert_and_clear_churn_in_one_leaf_node() {
    let threads = 8;
    let iters = 200;
    let pages = 4;
    let (provider, cache, mut space) = setup();
    let start = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let space = &space;
            let start = &start;
            s.spawn(move || {
                let lo = va(t * pages * PAGE);
                let hi = va((t + 1) * pages * PAGE);
                start.wait();
                for i in 0..iters {
                    space
                        .insert(lo, hi, backing(t, pages * PAGE), EntryFlags::new())
                        .unwrap();
                    assert!(space.lookup(lo).is_some(), "thread {t} lost its mapping in round {i}");
                    space.clear(lo, hi, None);
                    assert!(space.lookup(lo).is_none());
                    thread::yield_now();
                }
            });
        }
    });

    let audit = space.audit();
    assert!(audit.is_consistent(), "{:?}", audit.problems);
    assert_eq!(audit.nodes, [0, 0, 0, 1]);
    // Every node handed out beyond the root and the scratch chain was either
    // lost in a publication race or unlinked again.
    let stats = cache.stats();
    assert_eq!(stats.discarded + stats.retired, stats.allocated + stats.reused - 4);

    drop(space);
    drop(cache);
    assert_eq!(provider.live(), 0);
}

#[test]
fn two_writers_churn_neighbouring_pages() {
    let rounds = 200;
    let iters = 300;
    let (provider, cache, mut space) = setup();

    for round in 0..rounds {
        let start = Barrier::new(2);
        thread::scope(|s| {
            for t in 0..2u64 {
                let space = &space;
                let start = &start;
                s.spawn(move || {
                    // One page each, both in the first leaf node, so the
                    // leaf and its ancestors are linked and unlinked in turn.
                    let lo = va(t * PAGE);
                    let hi = va((t + 1) * PAGE);
                    start.wait();
                    for _ in 0..iters {
                        space.insert(lo, hi, backing(t, PAGE), EntryFlags::new()).unwrap();
                        space.clear(lo, hi, None);
                    }
                });
            }
        });

        let audit = space.audit();
        assert!(audit.is_consistent(), "round {round}: {:?}", audit.problems);
        assert_eq!(audit.nodes, [0, 0, 0, 1], "round {round}");
    }

    drop(space);
    drop(cache);
    assert_eq!(provider.live(), 0);
    assert_eq!(provider.allocated(), provider.freed());
}

#[test]
fn a_resident_mapping_survives_neighbour_churn() {
    let threads = 4;
    let iters = 200;
    let (_provider, _cache, mut space) = setup();
    let resident = va(TWO_MIB - PAGE);
    space
        .insert(resident, va(TWO_MIB), backing(99, PAGE), EntryFlags::new())
        .unwrap();
    let start = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let space = &space;
            let start = &start;
            s.spawn(move || {
                let lo = va(t * 16 * PAGE);
                let hi = va((t + 1) * 16 * PAGE);
                start.wait();
                for _ in 0..iters {
                    space
                        .insert(lo, hi, backing(t, 16 * PAGE), EntryFlags::new())
                        .unwrap();
                    space.clear(lo, hi, None);
                    assert!(space.lookup(resident).is_some());
                }
            });
        }
    });

    let audit = space.audit();
    assert!(audit.is_consistent(), "{:?}", audit.problems);
    assert_eq!(audit.nodes, [1, 1, 1, 1]);
    assert_eq!(audit.small_leaves, 1);
}

#[test]
fn whole_subtrees_churn_next_to_each_other() {
    let threads = 4;
    let iters = 50;
    let (provider, cache, mut space) = setup();
    let start = Barrier::new(threads);

    thread::scope(|s| {
        for t in 0..threads as u64 {
            let space = &space;
            let start = &start;
            s.spawn(move || {
                // Each thread owns a whole leaf node, so clears unlink it in one go.
                let lo = va(t * TWO_MIB);
                let hi = va((t + 1) * TWO_MIB);
                start.wait();
                for _ in 0..iters {
                    space.insert(lo, hi, backing(t, TWO_MIB), EntryFlags::new()).unwrap();
                    space.clear(lo, hi, None);
                }
            });
        }
    });

    let audit = space.audit();
    assert!(audit.is_consistent(), "{:?}", audit.problems);
    assert_eq!(audit.nodes, [0, 0, 0, 1]);

    drop(space);
    drop(cache);
    assert_eq!(provider.live(), 0);
    assert_eq!(provider.mapped(), 0);
}

#[test]
fn lookups_run_alongside_writers() {
    let (_provider, _cache, space) = setup();
    let stable = va(0x4000_0000);
    space
        .insert(stable, stable + TWO_MIB, backing(7, TWO_MIB), EntryFlags::new())
        .unwrap();

    thread::scope(|s| {
        s.spawn(|| {
            for _ in 0..100 {
                space.insert(va(0), va(TWO_MIB), backing(1, TWO_MIB), EntryFlags::new()).unwrap();
                space.clear(va(0), va(TWO_MIB), None);
            }
        });
        s.spawn(|| {
            for i in 0..10_000u64 {
                let got = space.lookup(stable + (i % 512) * PAGE).unwrap();
                assert_eq!(got.base, DeviceAddress::new(0x1_0000_0000 * 8 + PAGE + (i % 512) * PAGE));
            }
        });
    });
}
