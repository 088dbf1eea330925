//! Histogram and prefix-sum construction.
//!
//! One histogram/psum pair exists per participating relation. Each pair is
//! written by exactly one Histogram job and is read-only afterwards, so
//! instances for different relations run fully in parallel.

use crate::{Error, Relation, alloc_filled};

/// Count the tuples of `rel` falling into each of `bucket_count` buckets
/// (`key mod bucket_count`).
pub fn build_histogram(rel: &Relation, bucket_count: usize) -> Result<Vec<usize>, Error> {
    let mut hist = alloc_filled(bucket_count, 0usize)?;
    for tuple in &rel.tuples {
        hist[tuple.bucket(bucket_count)] += 1;
    }
    Ok(hist)
}

/// Starting offset of each bucket's reserved region in the partitioned
/// buffer. Empty buckets keep `-1` and do not advance the running total, so
/// occupied regions are contiguous in ascending bucket order.
pub fn build_psum(hist: &[usize]) -> Result<Vec<i64>, Error> {
    let mut psum = alloc_filled(hist.len(), -1i64)?;
    let mut running = 0i64;
    for (bucket, &count) in hist.iter().enumerate() {
        if count != 0 {
            psum[bucket] = running;
            running += count as i64;
        }
    }
    Ok(psum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Tuple;
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    fn random_relation(len: usize, key_space: i64, seed: u64) -> Relation {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Relation::new(
            (0..len)
                .map(|i| Tuple::new(rng.random_range(0..key_space), i as i64))
                .collect(),
        )
    }

    #[test]
    fn histogram_counts_every_tuple() {
        let rel = random_relation(1000, 5000, 1);
        for bits in [0u32, 1, 4, 8] {
            let buckets = 1usize << bits;
            let hist = build_histogram(&rel, buckets).unwrap();
            assert_eq!(hist.len(), buckets);
            assert_eq!(hist.iter().sum::<usize>(), rel.len());
        }
    }

    #[test]
    fn histogram_matches_bucket_mapping() {
        let rel = Relation::from_pairs(&[(5, 0), (9, 0), (13, 0), (8, 0), (2, 0)]);
        let hist = build_histogram(&rel, 4).unwrap();
        // 5, 9, 13 -> bucket 1; 8 -> bucket 0; 2 -> bucket 2
        assert_eq!(hist, vec![1, 3, 1, 0]);
    }

    #[test]
    fn empty_relation_yields_all_zero() {
        let hist = build_histogram(&Relation::default(), 8).unwrap();
        assert!(hist.iter().all(|&c| c == 0));
        let psum = build_psum(&hist).unwrap();
        assert!(psum.iter().all(|&p| p == -1));
    }

    #[test]
    fn psum_sentinel_iff_bucket_empty() {
        let rel = random_relation(500, 300, 2);
        let hist = build_histogram(&rel, 16).unwrap();
        let psum = build_psum(&hist).unwrap();
        for b in 0..16 {
            assert_eq!(psum[b] == -1, hist[b] == 0, "bucket {b}");
        }
    }

    #[test]
    fn psum_regions_disjoint_and_contiguous() {
        let rel = random_relation(2000, 97, 3);
        let hist = build_histogram(&rel, 32).unwrap();
        let psum = build_psum(&hist).unwrap();

        let mut expected_start = 0i64;
        for b in 0..32 {
            if hist[b] == 0 {
                continue;
            }
            assert_eq!(psum[b], expected_start, "bucket {b}");
            expected_start += hist[b] as i64;
        }
        assert_eq!(expected_start as usize, rel.len());
    }

    #[test]
    fn psum_skips_empty_buckets_without_gaps() {
        // Buckets 0 and 2 empty: 1 and 3 must pack tightly from offset 0.
        let rel = Relation::from_pairs(&[(1, 0), (5, 0), (3, 0)]);
        let hist = build_histogram(&rel, 4).unwrap();
        assert_eq!(hist, vec![0, 2, 0, 1]);
        let psum = build_psum(&hist).unwrap();
        assert_eq!(psum, vec![-1, 0, -1, 2]);
    }

    #[test]
    fn rebuild_is_byte_identical() {
        let rel = random_relation(1500, 64, 4);
        let a = build_histogram(&rel, 64).unwrap();
        let b = build_histogram(&rel, 64).unwrap();
        assert_eq!(a, b);
        assert_eq!(build_psum(&a).unwrap(), build_psum(&b).unwrap());
    }
}
