// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use super::*;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const KB: usize = 1024;
const MB: usize = 1024 * KB;

fn key(i: usize) -> Vec<u8> {
    format!("key-{:04}", i).into_bytes()
}

fn manual_cache(heap_size: usize, segment_size: i32, policy: Policy) -> (Seg, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(0));
    let cache = Seg::builder()
        .heap_size(heap_size)
        .segment_size(segment_size)
        .hash_power(16)
        .eviction(policy)
        .clock(clock.clone())
        .build()
        .expect("failed to create cache");
    (cache, clock)
}

#[test]
fn sizing() {
    let cache = Seg::builder()
        .segment_size(4096)
        .heap_size(4096 * 64)
        .build()
        .expect("failed to create cache");
    assert_eq!(cache.segment_count(), 64);
    assert_eq!(cache.free_segments(), 64);
    assert_eq!(cache.items(), 0);
    assert!(cache.check_integrity());

    // only whole segments are used
    let cache = Seg::builder()
        .segment_size(4096)
        .heap_size(4096 * 2 + 100)
        .build()
        .expect("failed to create cache");
    assert_eq!(cache.segment_count(), 2);
}

#[test]
fn bad_configuration() {
    assert!(Seg::builder().segment_size(0).build().is_err());
    assert!(Seg::builder().segment_size(1001).build().is_err());
    assert!(Seg::builder()
        .segment_size(4096)
        .heap_size(1024)
        .build()
        .is_err());
    assert!(Seg::builder().hash_power(2).build().is_err());
    assert!(Seg::builder()
        .eviction(Policy::Merge { max: 2, merge: 4 })
        .build()
        .is_err());
}

#[test]
fn get_set_overwrite() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    assert!(cache.get(b"coffee").is_none());
    assert!(cache.set(b"coffee", b"strong", None, 0).is_ok());
    assert_eq!(cache.items(), 1);

    let item = cache.get(b"coffee").expect("didn't get item back");
    assert_eq!(item.key(), b"coffee");
    assert_eq!(item.value(), b"strong");
    assert_eq!(item.optional(), None);
    drop(item);

    assert!(cache.set(b"coffee", b"hot", Some(b"flags"), 0).is_ok());
    assert_eq!(cache.items(), 1);

    let item = cache.get(b"coffee").expect("didn't get item back");
    assert_eq!(item.value(), b"hot");
    assert_eq!(item.optional(), Some(&b"flags"[..]));
    drop(item);

    assert_eq!(cache.hash_stats().0, 1);
    assert!(cache.check_integrity());
}

#[test]
fn reserve_and_fill() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    let mut reserved = cache.reserve(b"tea", 5, 2, 60).expect("reserve failed");
    assert_eq!(reserved.key(), b"tea");
    assert_eq!(reserved.value(), &[0; 5]);
    reserved.value_mut().copy_from_slice(b"green");
    reserved.optional_mut().copy_from_slice(&[1, 2]);
    let cas = reserved.cas();
    cache.insert(reserved).expect("insert failed");

    let item = cache.get(b"tea").expect("didn't get item back");
    assert_eq!(item.value(), b"green");
    assert_eq!(item.optional(), Some(&[1u8, 2][..]));
    assert_eq!(item.cas(), cas);
}

#[test]
fn dropped_reservation() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    {
        let _reserved = cache.reserve(b"abandoned", 10, 0, 60).expect("reserve failed");
    }

    assert!(cache.get(b"abandoned").is_none());
    assert_eq!(cache.items(), 0);
    assert_eq!(cache.hash_stats().0, 0);
}

#[test]
fn delete() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    assert!(!cache.delete(b"coffee"));
    assert!(cache.set(b"coffee", b"strong", None, 0).is_ok());
    assert!(cache.get(b"coffee").is_some());

    assert!(cache.delete(b"coffee"));
    assert!(cache.get(b"coffee").is_none());
    assert!(!cache.delete(b"coffee"));
    assert_eq!(cache.items(), 0);
}

#[test]
fn key_and_item_size_limits() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    assert!(matches!(
        cache.set(b"", b"value", None, 0),
        Err(SegError::KeyLength)
    ));
    assert!(matches!(
        cache.set(&[b'k'; 256], b"value", None, 0),
        Err(SegError::KeyLength)
    ));
    assert!(cache.set(&[b'k'; 255], b"value", None, 0).is_ok());

    let value = vec![0; 64 * KB];
    assert!(matches!(
        cache.set(b"large", &value, None, 0),
        Err(SegError::ItemOversized { .. })
    ));

    // the largest item fills a whole segment
    let value = vec![1; 64 * KB - ITEM_HDR_SIZE - 5];
    assert!(cache.set(b"large", &value, None, 0).is_ok());
    assert_eq!(cache.get(b"large").expect("missing").value().len(), value.len());
}

#[test]
fn huge_value_length() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);
    let free = cache.free_segments();

    // lengths whose item size would overflow are refused, not wrapped
    for value_len in [usize::MAX - 8, usize::MAX, u32::MAX as usize + 1] {
        assert!(matches!(
            cache.reserve(b"k", value_len, 0, 0),
            Err(SegError::ItemOversized { .. })
        ));
    }
    assert!(matches!(
        cache.reserve(b"k", 1, 256, 0),
        Err(SegError::ItemOversized { .. })
    ));

    // nothing was allocated
    assert_eq!(cache.free_segments(), free);
    assert_eq!(cache.items(), 0);
    assert!(cache.check_integrity());
}

#[test]
fn bucket_cas_changes() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    let before = cache.bucket_cas(b"coffee");
    assert!(cache.set(b"coffee", b"strong", None, 0).is_ok());
    let after_set = cache.bucket_cas(b"coffee");
    assert_ne!(before, after_set);

    assert!(cache.delete(b"coffee"));
    assert_ne!(after_set, cache.bucket_cas(b"coffee"));
}

#[test]
fn compare_and_swap() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    // no current item
    let reserved = cache.reserve(b"counter", 1, 0, 0).expect("reserve failed");
    assert!(matches!(cache.cas(reserved, 1), Err(SegError::NotFound)));

    assert!(cache.set(b"counter", b"1", None, 0).is_ok());
    let cas = cache.get(b"counter").expect("missing").cas();

    // stale version
    let mut reserved = cache.reserve(b"counter", 1, 0, 0).expect("reserve failed");
    reserved.value_mut().copy_from_slice(b"x");
    assert!(matches!(
        cache.cas(reserved, cas.wrapping_add(100)),
        Err(SegError::Exists)
    ));
    assert_eq!(cache.get(b"counter").expect("missing").value(), b"1");

    // matching version
    let mut reserved = cache.reserve(b"counter", 1, 0, 0).expect("reserve failed");
    reserved.value_mut().copy_from_slice(b"2");
    let next = reserved.cas();
    assert!(cache.cas(reserved, cas).is_ok());

    let item = cache.get(b"counter").expect("missing");
    assert_eq!(item.value(), b"2");
    assert_eq!(item.cas(), next);
    assert!(next > cas);
    drop(item);

    // failed attempts left nothing behind
    assert_eq!(cache.items(), 1);
}

#[test]
fn flush_all() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    assert!(cache.set(b"before", b"1", None, 0).is_ok());
    let cas = cache.get(b"before").expect("missing").cas();

    cache.flush_all();
    assert!(cache.get(b"before").is_none());

    // a flushed item cannot be swapped
    let reserved = cache.reserve(b"before", 1, 0, 0).expect("reserve failed");
    assert!(matches!(cache.cas(reserved, cas), Err(SegError::NotFound)));

    assert!(cache.set(b"after", b"2", None, 0).is_ok());
    assert_eq!(cache.get(b"after").expect("missing").value(), b"2");

    // overwriting a flushed key makes it visible again
    assert!(cache.set(b"before", b"3", None, 0).is_ok());
    assert_eq!(cache.get(b"before").expect("missing").value(), b"3");
}

#[test]
fn flush_across_version_wraparound() {
    let (cache, clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);
    clock.set(100);
    cache.version.store(u32::MAX - 5, Ordering::Release);

    assert!(cache.set(b"old", b"1", None, 0).is_ok());
    cache.flush_all();
    assert!(cache.get(b"old").is_none());

    // versions wrap past zero within the second of the flush
    for i in 0..12 {
        assert!(cache.set(&key(i), b"new", None, 0).is_ok());
    }
    for i in 0..12 {
        assert_eq!(cache.get(&key(i)).expect("missing").value(), b"new");
    }
    assert_eq!(cache.get(&key(4)).expect("missing").cas(), 0);

    // items from an earlier second are flushed whatever their version
    clock.advance(1);
    assert!(cache.set(b"later", b"2", None, 0).is_ok());
    cache.flush_all();
    for i in 0..12 {
        assert!(cache.get(&key(i)).is_none());
    }
    assert!(cache.get(b"later").is_none());

    assert!(cache.set(b"later", b"3", None, 0).is_ok());
    assert_eq!(cache.get(b"later").expect("missing").value(), b"3");

    // an earlier flush does not move the watermark back
    clock.set(50);
    cache.flush_all();
    assert_eq!(cache.get(b"later").expect("missing").value(), b"3");
}

#[test]
fn ttl_routing() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    let ttls = [10, 2000, 40000, 800000];
    let buckets: HashSet<usize> = ttls.iter().map(|t| TtlBuckets::index(*t)).collect();
    assert_eq!(buckets.len(), 4);
    for ttl in ttls {
        assert_eq!(TtlBuckets::index(ttl), TtlBuckets::index(ttl));
    }

    // each ttl class gets its own segment
    for (i, ttl) in ttls.iter().enumerate() {
        assert!(cache.set(&key(i), b"value", None, *ttl).is_ok());
    }
    let segment_ttls: HashSet<u32> = (0..4)
        .map(|id| cache.segment_info(id).expect("no such segment").ttl)
        .collect();
    assert_eq!(segment_ttls.len(), 4);
    assert_eq!(cache.free_segments(), cache.segment_count() - 4);
    assert!(cache.check_integrity());
}

#[test]
fn expiration() {
    let (cache, clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    assert!(cache.set(b"short", b"1", None, 10).is_ok());
    assert!(cache.set(b"long", b"2", None, 3600).is_ok());
    assert_eq!(cache.free_segments(), cache.segment_count() - 2);

    clock.advance(5);
    assert!(cache.get(b"short").is_some());
    assert_eq!(cache.expire(), 0);

    // expired items are hidden before the segment is reclaimed
    clock.advance(25);
    assert!(cache.get(b"short").is_none());
    assert!(cache.get(b"long").is_some());

    assert_eq!(cache.expire(), 1);
    assert_eq!(cache.free_segments(), cache.segment_count() - 1);
    assert_eq!(cache.items(), 1);
    assert!(cache.check_integrity());

    // the bucket starts a fresh segment
    assert!(cache.set(b"short", b"3", None, 10).is_ok());
    assert_eq!(cache.get(b"short").expect("missing").value(), b"3");
}

#[test]
fn evict_generations() {
    let (cache, _clock) = manual_cache(MB, 64 * KB as i32, Policy::Random);

    let mut old = cache.reserve(b"k", 2, 0, 0).expect("reserve failed");
    old.value_mut().copy_from_slice(b"v1");
    let old_loc = (old.seg_id(), old.offset());
    cache.insert(old).expect("insert failed");

    let mut new = cache.reserve(b"k", 2, 0, 0).expect("reserve failed");
    new.value_mut().copy_from_slice(b"v2");
    let new_loc = (new.seg_id(), new.offset());
    cache.insert(new).expect("insert failed");

    // the replaced generation is already gone
    assert!(!cache
        .hashtable
        .evict(b"k", old_loc.0, old_loc.1, &cache.segments));
    assert_eq!(cache.get(b"k").expect("missing").value(), b"v2");

    assert!(cache
        .hashtable
        .evict(b"k", new_loc.0, new_loc.1, &cache.segments));
    assert!(cache.get(b"k").is_none());
    assert_eq!(cache.items(), 0);
}

#[test]
fn eviction_scenario() {
    // four 1KB segments, one item each
    let (cache, _clock) = manual_cache(4 * KB, KB as i32, Policy::Random);
    let value = vec![0xA5; KB - ITEM_HDR_SIZE - 8];

    for i in 0..4 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
    }
    assert_eq!(cache.free_segments(), 0);
    assert_eq!(cache.items(), 4);

    for id in 0..4 {
        cache.segments.header(id).set_evictable(false);
    }
    assert!(matches!(
        cache.set(&key(4), &value, None, 3600),
        Err(SegError::NoFreeSegments)
    ));
    for i in 0..4 {
        assert!(cache.get(&key(i)).is_some());
    }

    // every segment but the tail may now be evicted
    for id in 0..4 {
        if cache.segment_info(id).expect("no such segment").next.is_some() {
            cache.segments.header(id).set_evictable(true);
        }
    }
    assert!(cache.set(&key(4), &value, None, 3600).is_ok());

    let missing = (0..4).filter(|i| cache.get(&key(*i)).is_none()).count();
    assert_eq!(missing, 1);
    assert!(cache.get(&key(3)).is_some());
    assert!(cache.get(&key(4)).is_some());
    assert_eq!(cache.items(), 4);
    assert!(cache.check_integrity());
}

#[test]
fn no_eviction() {
    let (cache, _clock) = manual_cache(4 * KB, KB as i32, Policy::None);
    let value = vec![0; KB - ITEM_HDR_SIZE - 8];

    for i in 0..4 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
    }
    assert!(matches!(
        cache.set(&key(4), &value, None, 3600),
        Err(SegError::NoFreeSegments)
    ));
    assert_eq!(cache.items(), 4);
}

#[test]
fn fifo_eviction() {
    let (cache, clock) = manual_cache(4 * KB, KB as i32, Policy::Fifo);
    let value = vec![0; KB - ITEM_HDR_SIZE - 8];

    for i in 0..8 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
        clock.advance(1);
    }

    // the oldest non-tail segments went first
    for i in 0..4 {
        assert!(cache.get(&key(i)).is_none());
    }
    for i in 4..8 {
        assert!(cache.get(&key(i)).is_some());
    }
    assert!(cache.check_integrity());
}

#[test]
fn merge_conservation() {
    let (cache, clock) = manual_cache(
        16 * 4 * KB,
        4 * KB as i32,
        Policy::Merge { max: 8, merge: 4 },
    );
    let value = [0x5A; 100];

    // 30 items per segment, seven segments in one ttl bucket
    for i in 0..200 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
    }
    assert_eq!(cache.free_segments(), 9);

    // every tenth key is read once a second for five seconds
    clock.advance(100);
    for _ in 0..5 {
        clock.advance(1);
        for i in (0..200).step_by(10) {
            assert!(cache.get(&key(i)).is_some());
        }
    }

    let occupied = |cache: &Seg| -> usize {
        (0..cache.segment_count() as u32)
            .map(|id| cache.segment_info(id).expect("no such segment").occupied as usize)
            .sum()
    };
    let before = occupied(&cache);

    let report = cache.merge_once().expect("nothing merged");
    assert_eq!(report.segments, vec![0, 1, 2, 3, 4, 5]);
    let dest = report.destination.expect("no destination");
    assert_eq!(report.scanned, report.copied + report.discarded);

    let after = occupied(&cache);
    assert_eq!(before, after + report.discarded);
    assert_eq!(
        cache.segment_info(dest).expect("no such segment").occupied as usize,
        report.copied
    );

    // hot items survive, cold items from the merged segments do not
    for i in 0..200 {
        let found = cache.get(&key(i)).is_some();
        if i % 10 == 0 || i >= 180 {
            assert!(found, "key {} should be present", i);
        } else {
            assert!(!found, "key {} should be gone", i);
        }
    }

    assert_eq!(cache.free_segments(), 14);
    assert!(cache.check_integrity());

    // the destination took the place of the first merged segment
    let info = cache.segment_info(dest).expect("no such segment");
    assert_eq!(info.prev, None);
    assert_eq!(info.next, Some(6));
    assert!(info.evictable);
    assert!(info.merge_at > 0);
}

#[test]
fn merge_on_demand() {
    let (cache, clock) = manual_cache(8 * 4 * KB, 4 * KB as i32, Policy::Merge { max: 8, merge: 4 });
    let value = [0; 100];

    // seven segments are usable, one is held back for merging
    let capacity = 7 * 30;
    let mut stored = 0;
    for i in 0..(3 * capacity) {
        if cache.set(&key(i), &value, None, 3600).is_ok() {
            stored += 1;
        }
        if i % 30 == 0 {
            clock.advance(30);
        }
    }

    assert!(stored > capacity);
    assert!(cache.items() <= capacity);
    assert!(cache.free_segments() >= 1);
    assert!(cache.check_integrity());
}

#[test]
fn custom_policy() {
    struct Newest;

    impl VictimSelector for Newest {
        fn select(&self, candidates: &[SegmentInfo]) -> Option<u32> {
            candidates
                .iter()
                .filter(|s| s.evictable && s.accessible && s.next.is_some())
                .max_by_key(|s| s.create_at)
                .map(|s| s.id)
        }
    }

    let (cache, clock) = manual_cache(4 * KB, KB as i32, Policy::Custom(Arc::new(Newest)));
    let value = vec![0; KB - ITEM_HDR_SIZE - 8];

    for i in 0..4 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
        clock.advance(1);
    }
    assert!(cache.set(&key(4), &value, None, 3600).is_ok());

    // the newest segment which is not a tail held key 2
    assert!(cache.get(&key(2)).is_none());
    for i in [0, 1, 3, 4] {
        assert!(cache.get(&key(i)).is_some());
    }
}

#[test]
fn reclaim_waits_for_readers() {
    struct Oldest;

    impl VictimSelector for Oldest {
        fn select(&self, candidates: &[SegmentInfo]) -> Option<u32> {
            candidates
                .iter()
                .filter(|s| s.next.is_some())
                .min_by_key(|s| s.create_at)
                .map(|s| s.id)
        }
    }

    let (cache, clock) = manual_cache(4 * KB, KB as i32, Policy::Custom(Arc::new(Oldest)));
    let value = vec![0x5A; KB - ITEM_HDR_SIZE - 8];
    let replacement = vec![0xC3; KB - ITEM_HDR_SIZE - 8];

    for i in 0..4 {
        assert!(cache.set(&key(i), &value, None, 3600).is_ok());
        clock.advance(1);
    }
    assert_eq!(cache.free_segments(), 0);

    // pins the oldest segment, which is the next victim
    let item = cache.get(&key(0)).expect("missing");

    std::thread::scope(|s| {
        let writer = s.spawn(|| cache.set(&key(4), &replacement, None, 3600));

        std::thread::sleep(Duration::from_millis(200));
        assert!(!writer.is_finished());
        assert_eq!(item.key(), &key(0)[..]);
        assert_eq!(item.value(), &value[..]);

        drop(item);
        assert!(writer.join().expect("writer panicked").is_ok());
    });

    assert!(cache.get(&key(0)).is_none());
    assert_eq!(cache.get(&key(4)).expect("missing").value(), &replacement[..]);
    assert!(cache.check_integrity());
}

#[test]
fn chained_hash_buckets() {
    let cache = Seg::builder()
        .heap_size(MB)
        .segment_size(64 * KB as i32)
        .hash_power(4)
        .overflow_factor(8.0)
        .build()
        .expect("failed to create cache");

    for i in 0..60 {
        assert!(cache.set(&key(i), b"first", None, 0).is_ok());
    }
    let (entries, buckets) = cache.hash_stats();
    assert_eq!(entries, 60);
    // two head buckets hold 14 entries, each extension adds 7 more
    assert!(buckets >= 9);

    for i in 0..60 {
        assert!(cache.set(&key(i), b"second", None, 0).is_ok());
    }
    assert_eq!(cache.hash_stats(), (60, buckets));
    assert_eq!(cache.items(), 60);

    for i in (0..60).step_by(2) {
        assert!(cache.delete(&key(i)));
    }
    for i in 0..60 {
        match cache.get(&key(i)) {
            Some(item) => {
                assert_eq!(i % 2, 1);
                assert_eq!(item.value(), b"second");
            }
            None => assert_eq!(i % 2, 0),
        }
    }

    // chains are not shortened by deletes
    assert_eq!(cache.hash_stats(), (30, buckets));
    assert_eq!(cache.items(), 30);
    assert!(cache.check_integrity());
}

#[test]
fn hash_overflow_exhausted() {
    let cache = Seg::builder()
        .heap_size(MB)
        .segment_size(64 * KB as i32)
        .hash_power(4)
        .overflow_factor(0.0)
        .build()
        .expect("failed to create cache");

    let mut stored = Vec::new();
    let mut refused = 0;
    for i in 0..32 {
        match cache.set(&key(i), b"value", None, 0) {
            Ok(()) => stored.push(i),
            Err(SegError::HashTableInsertEx) => refused += 1,
            Err(e) => panic!("unexpected error: {:?}", e),
        }
    }
    assert!(refused > 0);
    assert!(stored.len() <= 14);

    // refused items are not left behind
    assert_eq!(cache.hash_stats(), (stored.len(), 2));
    assert_eq!(cache.items(), stored.len());
    for i in &stored {
        assert_eq!(cache.get(&key(*i)).expect("missing").value(), b"value");
    }

    // a full bucket still takes overwrites
    assert!(cache.set(&key(stored[0]), b"again", None, 0).is_ok());
    assert_eq!(cache.get(&key(stored[0])).expect("missing").value(), b"again");
    assert_eq!(cache.hash_stats(), (stored.len(), 2));
    assert!(cache.check_integrity());
}

#[test]
fn from_config() {
    let config = config::Seg::parse(
        r#"
        [seg]
        heap_size = 262144
        segment_size = 4096
        hash_power = 12
        eviction = "merge"
        "#,
    )
    .expect("failed to parse");

    let cache = Builder::from_config(&config)
        .build()
        .expect("failed to create cache");
    assert_eq!(cache.segment_count(), 64);
    assert!(cache.set(b"coffee", b"strong", None, 0).is_ok());
}

#[test]
fn file_backed() {
    let tempdir = tempfile::TempDir::new().expect("failed to generate tempdir");
    let path = tempdir.path().join("seg.data");

    let cache = Seg::builder()
        .heap_size(MB)
        .segment_size(64 * KB as i32)
        .datapool_path(Some(&path))
        .build()
        .expect("failed to create cache");

    assert!(cache.set(b"coffee", b"strong", None, 0).is_ok());
    assert!(cache.flush_datapool().is_ok());
    assert_eq!(cache.get(b"coffee").expect("missing").value(), b"strong");

    // the file already exists
    assert!(Seg::builder()
        .heap_size(MB)
        .segment_size(64 * KB as i32)
        .datapool_path(Some(&path))
        .build()
        .is_err());
}

#[test]
fn concurrent_writers() {
    let cache = Arc::new(
        Seg::builder()
            .heap_size(MB)
            .segment_size(16 * KB as i32)
            .hash_power(14)
            .eviction(Policy::Random)
            .build()
            .expect("failed to create cache"),
    );

    let threads: Vec<_> = (0..4)
        .map(|t| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for i in 0..20_000 {
                    let key = format!("{}-{}", t, i % 2000);
                    let value = format!("value-{}", key);
                    let _ = cache.set(key.as_bytes(), value.as_bytes(), None, 0);

                    let key = format!("{}-{}", t, (i * 7) % 2000);
                    if let Some(item) = cache.get(key.as_bytes()) {
                        assert_eq!(item.value(), format!("value-{}", key).as_bytes());
                    }

                    if i % 100 == 0 {
                        cache.delete(key.as_bytes());
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().expect("thread panicked");
    }

    assert!(cache.check_integrity());
    assert!(cache.items() <= 8000);
}

#[test]
fn no_torn_reads() {
    let cache = Arc::new(
        Seg::builder()
            .heap_size(MB)
            .segment_size(64 * KB as i32)
            .build()
            .expect("failed to create cache"),
    );
    assert!(cache.set(b"shared", &[0; 256], None, 0).is_ok());

    let writers: Vec<_> = (1..=2u8)
        .map(|t| {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for _ in 0..5_000 {
                    let _ = cache.set(b"shared", &[t; 256], None, 0);
                }
            })
        })
        .collect();

    let reader = {
        let cache = cache.clone();
        std::thread::spawn(move || {
            for _ in 0..20_000 {
                if let Some(item) = cache.get(b"shared") {
                    let value = item.value();
                    assert_eq!(value.len(), 256);
                    assert!(value.iter().all(|b| *b == value[0]));
                }
            }
        })
    };

    for thread in writers {
        thread.join().expect("writer panicked");
    }
    reader.join().expect("reader panicked");
    assert!(cache.check_integrity());
}
