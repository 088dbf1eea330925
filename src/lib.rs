//! In-memory radix-partitioned hash-join engine.
//!
//! Relations of `(key, payload)` tuples are partitioned into `2^N` key-range
//! buckets via a shared histogram/prefix-sum scheme, a prime-sized chained
//! hash index is built over the smallest side of each bucket, and the
//! remaining sides are probed against it. A fixed pool of worker threads
//! drives the pipeline as Histogram, Partition, and Join jobs with a barrier
//! between stages.
//!
//! ```
//! use rhj::{execute, JoinConfig, JoinRequest, Relation, Tuple};
//!
//! let left = Relation::from_pairs(&[(5, 50), (9, 90)]);
//! let right = Relation::from_pairs(&[(5, 55), (13, 130)]);
//!
//! let request = JoinRequest::over(vec![0, 1]);
//! let output = execute(&[left, right], &request, &JoinConfig::new(2)).unwrap();
//! assert_eq!(output.result.len(), 1);
//! assert_eq!(output.result.matches[0].build, Tuple::new(5, 50));
//! ```

use std::collections::TryReserveError;
use std::thread;

pub mod hist;
pub mod idx;
pub mod jobq;
pub mod join;
pub mod part;
pub mod sched;

pub use idx::BucketEntry;
pub use join::{JoinMatch, JoinResult};
pub use sched::{execute, Job, QueryOutput, QueryStats, Scheduler};

/// Key value marking an unwritten slot in a partitioned buffer. Input keys
/// must be non-negative so they can never collide with it.
pub const SENTINEL_KEY: i64 = -1;

/// Upper bound on the configurable radix bit-width N (`bucket_count = 2^N`).
pub const MAX_RADIX_BITS: u32 = 24;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tuple {
    pub key: i64,
    pub payload: i64,
}

impl Tuple {
    /// The fill value for freshly allocated partition buffers.
    pub const SENTINEL: Self = Self {
        key: SENTINEL_KEY,
        payload: SENTINEL_KEY,
    };

    pub fn new(key: i64, payload: i64) -> Self {
        Self { key, payload }
    }

    #[inline(always)]
    pub fn is_sentinel(&self) -> bool {
        self.key == SENTINEL_KEY
    }

    /// Bucket this tuple belongs to for a given bucket count.
    #[inline(always)]
    pub fn bucket(&self, bucket_count: usize) -> usize {
        (self.key % bucket_count as i64) as usize
    }
}

/// An ordered sequence of tuples. Source relations are immutable once
/// handed to [`execute`]; partitioned relations are scratch buffers of the
/// same length, pre-filled with [`Tuple::SENTINEL`] and written exactly once
/// per slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Relation {
    pub tuples: Vec<Tuple>,
}

impl Relation {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self { tuples }
    }

    pub fn from_pairs(pairs: &[(i64, i64)]) -> Self {
        Self {
            tuples: pairs.iter().map(|&(k, p)| Tuple::new(k, p)).collect(),
        }
    }

    /// A sentinel-filled scratch relation of the given length.
    pub fn sentinel_filled(len: usize) -> Result<Self, Error> {
        Ok(Self {
            tuples: alloc_filled(len, Tuple::SENTINEL)?,
        })
    }

    pub fn len(&self) -> usize {
        self.tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tuples.is_empty()
    }
}

/// A `relation.column` reference as produced by the query parser. The
/// relation index points into [`JoinRequest::relations`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub relation: usize,
    pub column: usize,
}

/// A parsed join request. Only `relations` drives the join machinery;
/// `filters` and `projection` are carried for the caller, which applies them
/// to the matched rows itself.
#[derive(Clone, Debug, Default)]
pub struct JoinRequest {
    /// Ids of the participating relations, in request order. The same id may
    /// appear more than once (self-join).
    pub relations: Vec<usize>,
    /// Filter predicate strings (`rel.col <op> literal-or-column`), opaque
    /// to the core.
    pub filters: Vec<String>,
    /// Projection column list, opaque to the core.
    pub projection: Vec<ColumnRef>,
}

impl JoinRequest {
    pub fn over(relations: Vec<usize>) -> Self {
        Self {
            relations,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug)]
pub struct JoinConfig {
    /// Radix bit-width N; tuples are bucketed by `key mod 2^N`.
    pub radix_bits: u32,
    /// Worker thread count for the job scheduler.
    pub workers: usize,
}

impl JoinConfig {
    pub fn new(radix_bits: u32) -> Self {
        let workers = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            radix_bits,
            workers,
        }
    }

    pub fn with_workers(radix_bits: u32, workers: usize) -> Self {
        Self {
            radix_bits,
            workers,
        }
    }

    pub fn bucket_count(&self) -> usize {
        1 << self.radix_bits
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A query-scoped buffer could not be obtained. Aborts the query; the
    /// process stays usable.
    #[error("allocation failed: {0}")]
    Allocation(#[from] TryReserveError),

    /// Inconsistent request/relation/config arguments, rejected before any
    /// job is scheduled.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A pipeline invariant did not hold (e.g. a histogram/psum mismatch).
    /// Treated as a bug, never retried.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(&'static str),
}

/// Allocate a `len`-element vector filled with `value`, surfacing allocation
/// failure instead of aborting.
pub(crate) fn alloc_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, Error> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)?;
    v.resize(len, value);
    Ok(v)
}

/// Reject inconsistent arguments before any job is scheduled.
pub(crate) fn validate(
    relations: &[Relation],
    request: &JoinRequest,
    config: &JoinConfig,
) -> Result<(), Error> {
    if request.relations.len() < 2 {
        return Err(Error::Malformed(format!(
            "a join needs at least two relations, got {}",
            request.relations.len()
        )));
    }
    for &id in &request.relations {
        if id >= relations.len() {
            return Err(Error::Malformed(format!(
                "relation id {id} out of range (have {})",
                relations.len()
            )));
        }
    }
    for col in &request.projection {
        if col.relation >= request.relations.len() {
            return Err(Error::Malformed(format!(
                "projection references relation index {} of {}",
                col.relation,
                request.relations.len()
            )));
        }
    }
    if config.radix_bits > MAX_RADIX_BITS {
        return Err(Error::Malformed(format!(
            "radix bit-width {} exceeds the maximum of {MAX_RADIX_BITS}",
            config.radix_bits
        )));
    }
    if config.workers == 0 {
        return Err(Error::Malformed("worker count must be at least 1".into()));
    }
    for &id in &request.relations {
        if let Some(t) = relations[id].tuples.iter().find(|t| t.key < 0) {
            return Err(Error::Malformed(format!(
                "relation {id} has negative key {} (reserved for the empty-slot sentinel)",
                t.key
            )));
        }
    }
    Ok(())
}
