//! Job scheduling: a fixed worker pool drives the pipeline stage by stage.
//!
//! Each stage's jobs go into a fresh [`JobQueue`]; `workers` scoped threads
//! drain it and the scope join is the stage barrier, so every side effect of
//! stage N happens-before any stage N+1 job. Within a stage, jobs touch
//! disjoint slots of the per-query state (one relation for Histogram and
//! Partition, one bucket for Join), written through [`SendPtr`] under a
//! single-writer-then-read-only discipline.
//!
//! A Join job first builds its bucket's index entry and then probes it, so
//! index construction for a bucket always precedes probing that bucket while
//! distinct buckets stay fully parallel.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::idx::{self, BucketEntry};
use crate::jobq::JobQueue;
use crate::join::{self, JoinMatch, JoinResult};
use crate::{Error, JoinConfig, JoinRequest, Relation, alloc_filled, hist, part};

/// One schedulable unit of work. Histogram and Partition jobs name a
/// participant position; Join jobs name a global bucket id.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Job {
    Histogram { rel: usize },
    Partition { rel: usize },
    Join { bucket: usize },
}

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads write to disjoint memory regions.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

// Derived Copy/Clone would bound on `T: Copy`, but the pointer itself is
// always copyable regardless of the pointee.
impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline(always)]
    fn get(self) -> *mut T {
        self.0
    }
}

/// Per-query execution statistics.
#[derive(Clone, Debug, Default)]
pub struct QueryStats {
    pub participants: usize,
    pub bucket_count: usize,
    /// Total tuples across all participants (= tuples partitioned).
    pub tuples: usize,
    /// Buckets that received an index (at least one relation non-empty).
    pub indexed_buckets: usize,
    pub matches: usize,
    pub histogram_time: Duration,
    pub partition_time: Duration,
    pub join_time: Duration,
}

#[derive(Clone, Debug)]
pub struct QueryOutput {
    pub result: JoinResult,
    pub stats: QueryStats,
}

/// Validate the request and run the full pipeline on a fresh scheduler.
pub fn execute(
    relations: &[Relation],
    request: &JoinRequest,
    config: &JoinConfig,
) -> Result<QueryOutput, Error> {
    crate::validate(relations, request, config)?;
    Scheduler::new(config.workers).run_query(relations, request, config)
}

pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Drain one stage's jobs across the worker pool. Returns the stage's
    /// wall time; the first job failure aborts the rest of the stage.
    fn run_stage<F>(&self, label: &str, jobs: Vec<Job>, exec: F) -> Result<Duration, Error>
    where
        F: Fn(Job) -> Result<(), Error> + Sync,
    {
        let total = jobs.len();
        if total == 0 {
            return Ok(Duration::ZERO);
        }

        let queue = JobQueue::with_capacity(total);
        for job in jobs {
            queue
                .push(job)
                .map_err(|_| Error::InvariantViolation("stage queue rejected a job"))?;
        }

        let aborted = AtomicBool::new(false);
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        let started = Instant::now();

        thread::scope(|s| {
            for _ in 0..self.workers.min(total) {
                s.spawn(|| {
                    while !aborted.load(Ordering::Acquire) {
                        let Some(job) = queue.pop() else { break };
                        trace!("{label}: running {job:?}");
                        if let Err(err) = exec(job) {
                            let mut slot = failure.lock().unwrap();
                            if slot.is_none() {
                                *slot = Some(err);
                            }
                            aborted.store(true, Ordering::Release);
                            break;
                        }
                    }
                });
            }
        });
        // The scope join above is the stage barrier: all stage side effects
        // are visible from here on.

        if let Some(err) = failure.lock().unwrap().take() {
            return Err(err);
        }
        let elapsed = started.elapsed();
        debug!("{label}: {total} jobs on {} workers in {elapsed:?}", self.workers);
        Ok(elapsed)
    }

    /// Run histogram, partition, and join stages for a validated request.
    pub fn run_query(
        &self,
        relations: &[Relation],
        request: &JoinRequest,
        config: &JoinConfig,
    ) -> Result<QueryOutput, Error> {
        let rels: Vec<&Relation> = request.relations.iter().map(|&id| &relations[id]).collect();
        let participants = rels.len();
        let bucket_count = config.bucket_count();

        // Stage 1: one Histogram job per participant; job `rel` is the only
        // writer of slots `rel`.
        let mut hists: Vec<Vec<usize>> = alloc_filled(participants, Vec::new())?;
        let mut psums: Vec<Vec<i64>> = alloc_filled(participants, Vec::new())?;
        let hist_ptr = SendPtr(hists.as_mut_ptr());
        let psum_ptr = SendPtr(psums.as_mut_ptr());

        let jobs = (0..participants).map(|rel| Job::Histogram { rel }).collect();
        let histogram_time = self.run_stage("histogram", jobs, |job| {
            let Job::Histogram { rel } = job else {
                return Err(Error::InvariantViolation("non-histogram job in histogram stage"));
            };
            let h = hist::build_histogram(rels[rel], bucket_count)?;
            let p = hist::build_psum(&h)?;
            unsafe {
                *hist_ptr.get().add(rel) = h;
                *psum_ptr.get().add(rel) = p;
            }
            Ok(())
        })?;

        // Stage 2: one Partition job per participant — the safe
        // decomposition unit; row-range splits would race on destination
        // slots. Histograms are frozen read-only by the stage barrier.
        let mut parts: Vec<Relation> = alloc_filled(participants, Relation::default())?;
        let part_ptr = SendPtr(parts.as_mut_ptr());
        let hists_ref = &hists;
        let psums_ref = &psums;

        let jobs = (0..participants).map(|rel| Job::Partition { rel }).collect();
        let partition_time = self.run_stage("partition", jobs, |job| {
            let Job::Partition { rel } = job else {
                return Err(Error::InvariantViolation("non-partition job in partition stage"));
            };
            let reordered =
                part::partition_relation(rels[rel], &hists_ref[rel], &psums_ref[rel], bucket_count)?;
            unsafe {
                *part_ptr.get().add(rel) = reordered;
            }
            Ok(())
        })?;

        // Stage 3: one Join job per non-empty bucket. The job builds the
        // bucket's index entry, probes it, and parks its matches in the
        // bucket's slot; lists are merged after the barrier so no
        // cross-thread append is needed.
        let mut index: Vec<BucketEntry> = alloc_filled(bucket_count, BucketEntry::empty())?;
        let mut bucket_matches: Vec<Vec<JoinMatch>> = alloc_filled(bucket_count, Vec::new())?;
        let index_ptr = SendPtr(index.as_mut_ptr());
        let match_ptr = SendPtr(bucket_matches.as_mut_ptr());
        let parts_ref = &parts;

        let jobs = (0..bucket_count)
            .filter(|&b| hists_ref.iter().any(|h| h[b] != 0))
            .map(|bucket| Job::Join { bucket })
            .collect();
        let join_time = self.run_stage("join", jobs, |job| {
            let Job::Join { bucket } = job else {
                return Err(Error::InvariantViolation("non-join job in join stage"));
            };
            let entry = idx::build_entry(bucket, hists_ref, psums_ref, parts_ref)?;
            let mut found = Vec::new();
            join::probe_bucket(bucket, &entry, hists_ref, psums_ref, parts_ref, &mut found);
            unsafe {
                *index_ptr.get().add(bucket) = entry;
                *match_ptr.get().add(bucket) = found;
            }
            Ok(())
        })?;

        let matches: Vec<JoinMatch> = bucket_matches.into_iter().flatten().collect();
        let stats = QueryStats {
            participants,
            bucket_count,
            tuples: rels.iter().map(|r| r.len()).sum(),
            indexed_buckets: index.iter().filter(|e| !e.is_empty()).count(),
            matches: matches.len(),
            histogram_time,
            partition_time,
            join_time,
        };
        debug!(
            "query done: {} matches over {} buckets ({} indexed)",
            stats.matches, stats.bucket_count, stats.indexed_buckets
        );

        Ok(QueryOutput {
            result: JoinResult { matches },
            stats,
        })
    }
}
