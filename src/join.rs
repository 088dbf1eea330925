//! Probe/join execution over the per-bucket chained indexes.
//!
//! For every bucket with a build side, each other participant's bucket
//! region is probed tuple by tuple: hash into the build table, walk the
//! slot's chain to its 0 terminator, and emit a match for every visited
//! build tuple with an equal key. Duplicate keys on the build side all get
//! visited; the walk never stops at the first hit.
//!
//! With more than two participants the executor emits pairwise
//! (build, probe) matches per bucket; composing those into multi-way rows is
//! left to the caller, like filters and projections.

use crate::idx::BucketEntry;
use crate::{Relation, Tuple};

/// One matched (build, probe) tuple pair. Relation fields are participant
/// positions in the request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct JoinMatch {
    pub build_rel: usize,
    pub probe_rel: usize,
    pub build: Tuple,
    pub probe: Tuple,
}

/// All matches of one query, in ascending bucket order (probe order within a
/// bucket is fixed by the partitioned layout).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JoinResult {
    pub matches: Vec<JoinMatch>,
}

impl JoinResult {
    pub fn len(&self) -> usize {
        self.matches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matches.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JoinMatch> {
        self.matches.iter()
    }
}

/// Probe every non-build participant's region of `bucket` against `entry`,
/// appending matches to `out`.
pub fn probe_bucket(
    bucket: usize,
    entry: &BucketEntry,
    hists: &[Vec<usize>],
    psums: &[Vec<i64>],
    parts: &[Relation],
    out: &mut Vec<JoinMatch>,
) {
    let Some(build_rel) = entry.build_rel else {
        return;
    };
    let build_start = psums[build_rel][bucket] as usize;
    let build_tuples = &parts[build_rel].tuples;

    for probe_rel in 0..parts.len() {
        if probe_rel == build_rel || hists[probe_rel][bucket] == 0 {
            continue;
        }
        let start = psums[probe_rel][bucket] as usize;
        let end = start + hists[probe_rel][bucket];

        for probe in &parts[probe_rel].tuples[start..end] {
            let slot = (probe.key % entry.table_size as i64) as usize;
            let mut cur = entry.slot_heads[slot];
            while cur != -1 {
                let build = build_tuples[build_start + cur as usize - 1];
                if build.key == probe.key {
                    out.push(JoinMatch {
                        build_rel,
                        probe_rel,
                        build,
                        probe: *probe,
                    });
                }
                let next = entry.chain_links[cur as usize];
                if next == 0 {
                    break;
                }
                cur = next;
            }
        }
    }
}
