//! Physical partitioning (rearrangement) of a relation.
//!
//! Each tuple is scattered into the bucket region reserved for it by the
//! prefix sum, claiming the first slot that still holds the sentinel. The
//! psum reserves exactly `hist[b]` contiguous slots per bucket and exactly
//! that many tuples hash to `b`, so every tuple finds a free slot inside its
//! own region.
//!
//! The safe parallel decomposition unit is one whole relation per job:
//! splitting a single relation by source row range would race two jobs onto
//! the same destination slots.

use crate::{Error, Relation};

/// Scatter `src` into the sentinel-filled `dst` according to `hist`/`psum`.
///
/// The first-fit scan is bounded by the bucket's reserved region; running
/// off its end means the histogram and psum disagree with the data and is
/// reported as an invariant violation.
pub fn scatter(
    src: &Relation,
    hist: &[usize],
    psum: &[i64],
    bucket_count: usize,
    dst: &mut Relation,
) -> Result<(), Error> {
    if dst.len() != src.len() {
        return Err(Error::InvariantViolation(
            "partition destination size differs from source",
        ));
    }

    for tuple in &src.tuples {
        let bucket = tuple.bucket(bucket_count);
        let start = psum[bucket];
        if start < 0 {
            return Err(Error::InvariantViolation(
                "tuple hashed to a bucket the psum marks empty",
            ));
        }
        let limit = start as usize + hist[bucket];

        let mut at = start as usize;
        while at < limit && !dst.tuples[at].is_sentinel() {
            at += 1;
        }
        if at == limit {
            return Err(Error::InvariantViolation(
                "no free slot left in the bucket's reserved region",
            ));
        }
        dst.tuples[at] = *tuple;
    }
    Ok(())
}

/// Allocate a sentinel-filled buffer of `src`'s size and scatter into it.
pub fn partition_relation(
    src: &Relation,
    hist: &[usize],
    psum: &[i64],
    bucket_count: usize,
) -> Result<Relation, Error> {
    let mut dst = Relation::sentinel_filled(src.len())?;
    scatter(src, hist, psum, bucket_count, &mut dst)?;
    Ok(dst)
}
