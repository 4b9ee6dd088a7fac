// Copyright 2021 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Victim selection for segment eviction.
//!
//! Selection is optimistic: it reads segment headers without locks and the
//! chosen segment may be claimed by another thread before it can be
//! reclaimed. The caller handles that by retrying with a fresh selection.

use crate::*;

use std::sync::Arc;

/// Upper bound on the number of segments claimed for a single merge.
pub(crate) const N_MAX_SEG_MERGE: usize = 8;

/// Chooses a segment to evict from the segments which are currently eligible.
pub trait VictimSelector: Send + Sync {
    /// `candidates` holds a snapshot of every segment which is sealed,
    /// accessible, and not currently claimed. Return the id of the segment to
    /// evict, or `None` to refuse eviction.
    fn select(&self, candidates: &[SegmentInfo]) -> Option<u32>;
}

/// Policies define the eviction strategy to be used when no free segments
/// are available.
#[derive(Clone, Default)]
pub enum Policy {
    /// No eviction. When all the segments are full, inserts will fail until
    /// segments are freed by TTL expiration.
    None,
    /// Segment random eviction. Selects a random segment and evicts it.
    #[default]
    Random,
    /// FIFO segment eviction. Selects the oldest segment and evicts it.
    Fifo,
    /// Closest to expiration. Selects the segment that would expire first and
    /// evicts it.
    Cte,
    /// Least utilized segment. Selects the segment with the fewest live bytes
    /// and evicts it.
    Util,
    /// Merge-based eviction. Combines consecutive mature segments within a TTL
    /// bucket into one, keeping only the most frequently accessed items.
    ///
    /// `max` is the most segments claimed for a single merge, and `merge` is
    /// the target number of segments combined into one, which sets the share
    /// of bytes kept from each source to roughly `1 / merge`.
    Merge { max: usize, merge: usize },
    /// Delegates selection to an external policy.
    Custom(Arc<dyn VictimSelector>),
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Random => write!(f, "Random"),
            Self::Fifo => write!(f, "Fifo"),
            Self::Cte => write!(f, "Cte"),
            Self::Util => write!(f, "Util"),
            Self::Merge { max, merge } => f
                .debug_struct("Merge")
                .field("max", max)
                .field("merge", merge)
                .finish(),
            Self::Custom(_) => write!(f, "Custom"),
        }
    }
}

pub(crate) struct Eviction {
    policy: Policy,
}

impl Eviction {
    pub(crate) fn new(policy: Policy) -> Result<Self, SegError> {
        if let Policy::Merge { max, merge } = policy {
            if merge < 2 || max < merge || max > N_MAX_SEG_MERGE {
                return Err(SegError::Config(
                    "merge eviction needs 2 <= merge <= max <= 8",
                ));
            }
        }
        Ok(Self { policy })
    }

    pub(crate) fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Returns the `(max, merge)` parameters if merge eviction is in use.
    pub(crate) fn merge(&self) -> Option<(usize, usize)> {
        match self.policy {
            Policy::Merge { max, merge } => Some((max, merge)),
            _ => None,
        }
    }

    /// A segment can be picked for eviction if it is sealed (not the tail of
    /// its chain), readable, and not claimed by another thread.
    fn is_candidate(header: &SegmentHeader) -> bool {
        header.is_evictable() && header.is_accessible() && header.next().is_some()
    }

    /// Pick a victim. Returns `None` if the policy refuses to evict or no
    /// segment is eligible.
    pub(crate) fn select(&self, segments: &Segments) -> Option<u32> {
        let headers = segments.headers();
        let candidates = headers.iter().filter(|h| Self::is_candidate(h));

        match &self.policy {
            Policy::None | Policy::Merge { .. } => None,
            Policy::Random => {
                let start = (random_u64() % headers.len() as u64) as usize;
                headers[start..]
                    .iter()
                    .chain(headers[..start].iter())
                    .find(|h| Self::is_candidate(h))
                    .map(|h| h.id())
            }
            Policy::Fifo => candidates.min_by_key(|h| h.create_at()).map(|h| h.id()),
            Policy::Cte => candidates
                .min_by_key(|h| h.create_at().saturating_add(h.ttl()))
                .map(|h| h.id()),
            Policy::Util => candidates.min_by_key(|h| h.occupied()).map(|h| h.id()),
            Policy::Custom(selector) => {
                let snapshot: Vec<SegmentInfo> = candidates.map(|h| h.info()).collect();
                let id = selector.select(&snapshot)?;
                if (id as usize) < headers.len() {
                    Some(id)
                } else {
                    warn!("victim selector returned invalid segment {}", id);
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // two chains of two segments each: 0 -> 1 with a short ttl and 2 -> 3
    // with a long ttl, created at 10, 9, 8, 7. segments 1 and 3 are tails.
    fn chained() -> (Segments, TtlBuckets) {
        let pool = datatier::Memory::create(4 * 1024, false).expect("failed to create pool");
        let segments = Segments::new(Box::new(pool), 1024, 0).expect("failed to create arena");
        let buckets = TtlBuckets::new();
        {
            let mut arena = segments.lock();
            for i in 0..4 {
                let id = segments
                    .take_free(&mut arena, true)
                    .expect("no free segment");
                let bucket = buckets.for_ttl(if i < 2 { 100 } else { 1000 });
                segments.init(id, bucket.ttl(), 10 - i);
                buckets.link_tail(&segments, bucket, id, &arena);
                segments.header(id).set_evictable(true);
            }
        }
        (segments, buckets)
    }

    #[test]
    fn merge_parameters() {
        assert!(Eviction::new(Policy::Merge { max: 8, merge: 4 }).is_ok());
        assert!(Eviction::new(Policy::Merge { max: 3, merge: 4 }).is_err());
        assert!(Eviction::new(Policy::Merge { max: 9, merge: 4 }).is_err());
        assert!(Eviction::new(Policy::Merge { max: 8, merge: 1 }).is_err());
    }

    #[test]
    fn none_refuses() {
        let (segments, _buckets) = chained();
        let eviction = Eviction::new(Policy::None).expect("bad policy");
        assert_eq!(eviction.select(&segments), None);
    }

    #[test]
    fn fifo_and_cte() {
        let (segments, _buckets) = chained();

        // tails are never picked, so the oldest candidate is segment 2
        let eviction = Eviction::new(Policy::Fifo).expect("bad policy");
        assert_eq!(eviction.select(&segments), Some(2));

        // segment 0 expires at 10 + 97, segment 2 at 8 + 1001
        let eviction = Eviction::new(Policy::Cte).expect("bad policy");
        assert_eq!(eviction.select(&segments), Some(0));
    }

    #[test]
    fn skips_claimed_segments() {
        let (segments, _buckets) = chained();
        let eviction = Eviction::new(Policy::Random).expect("bad policy");
        segments.header(0).set_evictable(false);
        for _ in 0..16 {
            assert_eq!(eviction.select(&segments), Some(2));
        }
        segments.header(2).set_evictable(false);
        assert_eq!(eviction.select(&segments), None);
    }

    struct Highest;

    impl VictimSelector for Highest {
        fn select(&self, candidates: &[SegmentInfo]) -> Option<u32> {
            candidates.iter().map(|c| c.id).max()
        }
    }

    #[test]
    fn custom_selector() {
        let (segments, _buckets) = chained();
        let eviction = Eviction::new(Policy::Custom(Arc::new(Highest))).expect("bad policy");
        assert_eq!(eviction.select(&segments), Some(2));
    }
}
