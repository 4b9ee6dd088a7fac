// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

// All metrics for the Seg crate

use metriken::*;

// segment related
#[metric(name = "segment_request", description = "number of segment allocation attempts")]
pub static SEGMENT_REQUEST: Counter = Counter::new();

#[metric(name = "segment_request_failure", description = "number of segment allocation attempts which failed")]
pub static SEGMENT_REQUEST_FAILURE: Counter = Counter::new();

#[metric(name = "segment_request_success", description = "number of segment allocation attempts which were successful")]
pub static SEGMENT_REQUEST_SUCCESS: Counter = Counter::new();

#[metric(name = "segment_evict", description = "number of segments evicted")]
pub static SEGMENT_EVICT: Counter = Counter::new();

#[metric(name = "segment_evict_ex", description = "number of segments which could not be claimed for reclamation")]
pub static SEGMENT_EVICT_EX: Counter = Counter::new();

#[metric(name = "segment_evict_retry", description = "number of reclamations which needed a second scrub pass")]
pub static SEGMENT_EVICT_RETRY: Counter = Counter::new();

#[metric(name = "segment_return", description = "total number of segments returned to the free pool")]
pub static SEGMENT_RETURN: Counter = Counter::new();

#[metric(name = "segment_merge", description = "total number of segments merged")]
pub static SEGMENT_MERGE: Counter = Counter::new();

#[metric(name = "segment_merge_empty", description = "number of merges which found no live items")]
pub static SEGMENT_MERGE_EMPTY: Counter = Counter::new();

#[metric(name = "segment_expire", description = "total number of segments expired")]
pub static SEGMENT_EXPIRE: Counter = Counter::new();

#[metric(name = "segment_free", description = "current number of free segments")]
pub static SEGMENT_FREE: Gauge = Gauge::new();

#[metric(name = "segment_current", description = "current total number of segments")]
pub static SEGMENT_CURRENT: Gauge = Gauge::new();

// hash table related
#[metric(name = "hash_tag_collision", description = "number of partial hash collisions")]
pub static HASH_TAG_COLLISION: Counter = Counter::new();

#[metric(name = "hash_insert", description = "number of inserts into the hash table")]
pub static HASH_INSERT: Counter = Counter::new();

#[metric(name = "hash_insert_ex", description = "number of hash table inserts which failed, likely due to capacity")]
pub static HASH_INSERT_EX: Counter = Counter::new();

#[metric(name = "hash_remove", description = "number of hash table entries which have been removed")]
pub static HASH_REMOVE: Counter = Counter::new();

#[metric(name = "hash_relink", description = "number of attempts to repoint a hash table entry")]
pub static HASH_RELINK: Counter = Counter::new();

#[metric(name = "hash_lookup", description = "total number of lookups against the hash table")]
pub static HASH_LOOKUP: Counter = Counter::new();

#[metric(name = "hash_bucket_alloc", description = "number of overflow buckets chained onto the hash table")]
pub static HASH_BUCKET_ALLOC: Counter = Counter::new();

// item related
#[metric(name = "item_allocate", description = "number of times items have been allocated")]
pub static ITEM_ALLOCATE: Counter = Counter::new();

#[metric(name = "item_allocate_ex", description = "number of item allocations which failed")]
pub static ITEM_ALLOCATE_EX: Counter = Counter::new();

#[metric(name = "item_replace", description = "number of times items have been replaced")]
pub static ITEM_REPLACE: Counter = Counter::new();

#[metric(name = "item_delete", description = "number of items removed from the hash table")]
pub static ITEM_DELETE: Counter = Counter::new();

#[metric(name = "item_evict", description = "number of items removed due to eviction or expiration")]
pub static ITEM_EVICT: Counter = Counter::new();

#[metric(name = "item_compacted", description = "number of items copied forward by merging")]
pub static ITEM_COMPACTED: Counter = Counter::new();

#[metric(name = "item_discarded", description = "number of items dropped by merging")]
pub static ITEM_DISCARDED: Counter = Counter::new();

#[metric(name = "item_relink_stale", description = "number of copied items which were superseded before relinking")]
pub static ITEM_RELINK_STALE: Counter = Counter::new();
