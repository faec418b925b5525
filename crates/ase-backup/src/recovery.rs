//! Point-in-time restore chain selection.

use std::collections::BTreeMap;

use crate::naming::{Artifact, Kind};
use crate::timing::Timestamp;

/// All stripes of one logical artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSet {
    pub database: String,
    pub kind: Kind,
    pub start: Timestamp,
    pub end: Option<Timestamp>,
    pub stripe_count: u32,
    pub members: Vec<Artifact>,
}

impl StripeSet {
    /// Every index in `1..=stripe_count` present exactly once.
    pub fn is_complete(&self) -> bool {
        if self.members.len() != self.stripe_count as usize {
            return false;
        }
        self.members
            .iter()
            .enumerate()
            .all(|(i, a)| a.stripe_index as usize == i + 1)
    }

    pub fn stripe_indices(&self) -> Vec<u32> {
        self.members.iter().map(|a| a.stripe_index).collect()
    }
}

type SetKey = (Option<Timestamp>, Kind, Timestamp, String, u32);

/// Groups artifacts into stripe sets, ordered chronologically by end time.
/// Members are sorted by stripe index; duplicates are dropped.
pub fn group_stripe_sets(artifacts: &[Artifact]) -> Vec<StripeSet> {
    let mut groups: BTreeMap<SetKey, Vec<Artifact>> = BTreeMap::new();
    for a in artifacts {
        groups
            .entry((a.end, a.kind, a.start, a.database.clone(), a.stripe_count))
            .or_default()
            .push(a.clone());
    }
    groups
        .into_iter()
        .map(|((end, kind, start, database, stripe_count), mut members)| {
            members.sort();
            members.dedup();
            StripeSet {
                database,
                kind,
                start,
                end,
                stripe_count,
                members,
            }
        })
        .collect()
}

/// Picks the artifacts to replay to reach `target`.
///
/// The chain starts at the latest full set ending at or before `target` and
/// continues through every incremental set up to and including the first set
/// ending after `target`. Sets without an end time are ignored. An empty result
/// means no full backup qualifies.
pub fn select_chain(artifacts: &[Artifact], target: Timestamp) -> Vec<Artifact> {
    let finished: Vec<Artifact> = artifacts
        .iter()
        .filter(|a| a.end.is_some())
        .cloned()
        .collect();

    let mut chain: Vec<StripeSet> = Vec::new();
    let mut have_full = false;
    for set in group_stripe_sets(&finished) {
        let Some(end) = set.end else {
            continue;
        };
        match set.kind {
            Kind::Full if end <= target => {
                chain.clear();
                chain.push(set);
                have_full = true;
            }
            Kind::Full => break,
            Kind::Incremental => {
                chain.push(set);
                if end > target {
                    break;
                }
            }
        }
    }

    if !have_full {
        return Vec::new();
    }
    let mut out: Vec<Artifact> = chain.into_iter().flat_map(|s| s.members).collect();
    out.sort();
    out
}
