//! Per-bucket chained hash index over the build side.
//!
//! For each global bucket the relation with the smallest nonzero tuple count
//! becomes the build side. Its bucket region gets a separate-chaining hash
//! table keyed by `key mod table_size`, where `table_size` is the smallest
//! prime >= the region's tuple count (a prime table clusters less than a
//! power of two here, since bucket ids already fixed the low key bits).
//!
//! Positions inside a table are bucket-relative and 1-based: local position
//! `p` is global index `psum[build][bucket] + p - 1`. `slot_heads[s]` holds
//! `-1` (empty) or the first local position of slot `s`'s chain;
//! `chain_links[p] == 0` terminates a chain, `chain_links[0]` is reserved.

use crate::{Error, Relation, alloc_filled};

/// Index entry for one global bucket id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BucketEntry {
    /// Participant position of the build relation; `None` iff no relation
    /// has tuples in this bucket.
    pub build_rel: Option<usize>,
    /// Tuple count of the build relation inside this bucket.
    pub tuple_count: usize,
    /// Smallest prime >= `tuple_count`; length of `slot_heads`.
    pub table_size: usize,
    /// Per-slot chain head: `-1` or a 1-based local position.
    pub slot_heads: Vec<i64>,
    /// Overflow chain, `tuple_count + 1` entries; index 0 unused.
    pub chain_links: Vec<i64>,
}

impl BucketEntry {
    /// Entry for a bucket no relation has tuples in.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.build_rel.is_none()
    }
}

/// Trial-division primality, odd divisors up to `n / 2`. Treats 2 as prime
/// and every other even number as composite.
pub fn is_prime(n: usize) -> bool {
    if n <= 1 {
        return false;
    }
    if n % 2 == 0 && n > 2 {
        return false;
    }
    let mut i = 3;
    while i < n / 2 {
        if n % i == 0 {
            return false;
        }
        i += 2;
    }
    true
}

/// Smallest prime greater than or equal to `n`.
pub fn next_prime(n: usize) -> usize {
    let mut p = n;
    while !is_prime(p) {
        p += 1;
    }
    p
}

/// Pick the build side for `bucket`: the relation with the smallest nonzero
/// count, ties to the lowest participant position. `None` if every relation
/// is empty there.
pub fn select_build_side(hists: &[Vec<usize>], bucket: usize) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for (rel, hist) in hists.iter().enumerate() {
        let count = hist[bucket];
        if count == 0 {
            continue;
        }
        match best {
            Some((_, min)) if count >= min => {}
            _ => best = Some((rel, count)),
        }
    }
    best
}

/// Build the chained index for one bucket over the partitioned relations.
///
/// Insertion scans the build region from its last local position down to the
/// first, appending each position to the tail of its slot's chain.
pub fn build_entry(
    bucket: usize,
    hists: &[Vec<usize>],
    psums: &[Vec<i64>],
    parts: &[Relation],
) -> Result<BucketEntry, Error> {
    let Some((build_rel, tuple_count)) = select_build_side(hists, bucket) else {
        return Ok(BucketEntry::empty());
    };

    let start = psums[build_rel][bucket];
    if start < 0 {
        return Err(Error::InvariantViolation(
            "build side has tuples but no psum offset",
        ));
    }
    let start = start as usize;

    let table_size = next_prime(tuple_count);
    let mut slot_heads = alloc_filled(table_size, -1i64)?;
    let mut chain_links = alloc_filled(tuple_count + 1, -1i64)?;

    let tuples = &parts[build_rel].tuples;
    for pos in (1..=tuple_count).rev() {
        let key = tuples[start + pos - 1].key;
        let slot = (key % table_size as i64) as usize;

        if slot_heads[slot] == -1 {
            slot_heads[slot] = pos as i64;
        } else {
            let mut tail = slot_heads[slot] as usize;
            while chain_links[tail] != 0 {
                tail = chain_links[tail] as usize;
            }
            chain_links[tail] = pos as i64;
        }
        chain_links[pos] = 0;
    }

    Ok(BucketEntry {
        build_rel: Some(build_rel),
        tuple_count,
        table_size,
        slot_heads,
        chain_links,
    })
}
