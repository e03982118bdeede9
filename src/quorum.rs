//! Grid quorum construction.
//!
//! Arranges the ids `0..n` in a conceptual grid of row width
//! `K = ceil(sqrt(n))`. A process's voting group is its whole row plus its
//! column. Two processes either share a row, or one's row crosses the
//! other's column at a grid cell — so any two groups intersect, which is
//! the property mutual exclusion rests on. Groups are ~2√N in size.

use core::fmt;
use std::collections::BTreeSet;

use crate::messages::ProcessId;

/// A process's voting group, self included.
pub type VotingGroup = BTreeSet<ProcessId>;

/// Voting groups cannot be built for an empty cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidProcessCount;

impl fmt::Display for InvalidProcessCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cluster must contain at least one process")
    }
}

impl core::error::Error for InvalidProcessCount {}

/// Build the voting group of every process in a cluster of `n`.
///
/// Deterministic: the same `n` always yields the same groups. The returned
/// vector is indexed by [`ProcessId`].
///
/// # Errors
///
/// [`InvalidProcessCount`] if `n == 0`.
#[expect(clippy::missing_panics_doc, reason = "sqrt of usize fits in usize")]
pub fn voting_groups(n: usize) -> Result<Vec<VotingGroup>, InvalidProcessCount> {
    if n == 0 {
        return Err(InvalidProcessCount);
    }

    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let k = (n as f64).sqrt().ceil() as usize;

    let mut groups = Vec::with_capacity(n);
    for i in 0..n {
        let mut group = VotingGroup::new();
        let row_start = (i / k) * k;
        // whole row, clipped to the cluster
        for j in row_start..(row_start + k).min(n) {
            group.insert(ProcessId::try_from(j).expect("id fits in u32"));
        }
        // whole column, clipped to the cluster
        for r in 0.. {
            let member = i % k + r * k;
            if member >= n {
                break;
            }
            group.insert(ProcessId::try_from(member).expect("id fits in u32"));
        }
        groups.push(group);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cluster_is_rejected() {
        assert_eq!(voting_groups(0), Err(InvalidProcessCount));
    }

    #[test]
    fn singleton_cluster() {
        let groups = voting_groups(1).unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0], VotingGroup::from([0]));
    }

    #[test]
    fn n4_grid() {
        // K = 2; rows are {0,1} and {2,3}, columns {0,2} and {1,3}.
        let groups = voting_groups(4).unwrap();
        assert_eq!(groups[0], VotingGroup::from([0, 1, 2]));
        assert_eq!(groups[3], VotingGroup::from([1, 2, 3]));
        // group(0) and group(3) meet at processes 1 and 2
        let both: Vec<_> = groups[0].intersection(&groups[3]).copied().collect();
        assert_eq!(both, vec![1, 2]);
    }

    #[test]
    fn self_membership_holds_for_all_n() {
        for n in 1..=100 {
            let groups = voting_groups(n).unwrap();
            for (i, group) in groups.iter().enumerate() {
                assert!(
                    group.contains(&(i as ProcessId)),
                    "n={n}: process {i} missing from its own group"
                );
            }
        }
    }

    #[test]
    fn any_two_groups_intersect() {
        // The grid argument must survive clipping on non-square n, so check
        // every pair for a range of cluster sizes rather than trusting the
        // formula.
        for n in 1..=100 {
            let groups = voting_groups(n).unwrap();
            for i in 0..n {
                for j in (i + 1)..n {
                    assert!(
                        groups[i].intersection(&groups[j]).next().is_some(),
                        "n={n}: groups of {i} and {j} are disjoint"
                    );
                }
            }
        }
    }

    #[test]
    fn deterministic() {
        assert_eq!(voting_groups(17).unwrap(), voting_groups(17).unwrap());
    }
}
