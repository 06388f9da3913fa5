//! Placement Policy
//!
//! `satisfy_replica_placement` decides whether adding `candidate` to
//! `existing` respects a `ReplicaPlacement` policy. The decision is a
//! deterministic 8-step cascade; tie-breaks matter and are reproduced
//! exactly from the design.

use std::collections::HashMap;

use crate::topology::{Location, ReplicaPlacement};

/// Step 1: never duplicate a replica on the same data node.
/// Steps 2-8: DC-then-rack-then-same-rack cascade, preferring to fill a
/// "primary" (highest-count) DC/rack before spreading to a secondary one.
pub fn satisfy_replica_placement(
    policy: &ReplicaPlacement,
    existing: &[Location],
    candidate: &Location,
) -> bool {
    // 1. No duplicate node.
    if existing.iter().any(|loc| loc.data_node == candidate.data_node) {
        return false;
    }

    // 2. Count DCs present in existing; primaryDCs = DCs with maximal count.
    let mut dc_counts: HashMap<&str, usize> = HashMap::new();
    for loc in existing {
        *dc_counts.entry(loc.dc.as_str()).or_insert(0) += 1;
    }
    let max_dc_count = dc_counts.values().copied().max().unwrap_or(0);
    let primary_dcs: Vec<&str> = dc_counts
        .iter()
        .filter(|(_, &c)| c == max_dc_count)
        .map(|(&dc, _)| dc)
        .collect();

    // 3. Candidate's DC not among existing DCs at all.
    if !dc_counts.contains_key(candidate.dc.as_str()) {
        return dc_counts.len() < policy.diff_data_center as usize + 1;
    }

    // 4. Candidate's DC must be a primary DC to accept more replicas there.
    if !primary_dcs.contains(&candidate.dc.as_str()) {
        return false;
    }

    // 5. Restrict to candidate's DC; count racks; primaryRacks = max count.
    let mut rack_counts: HashMap<&str, usize> = HashMap::new();
    for loc in existing.iter().filter(|l| l.dc == candidate.dc) {
        *rack_counts.entry(loc.rack.as_str()).or_insert(0) += 1;
    }
    let max_rack_count = rack_counts.values().copied().max().unwrap_or(0);
    let primary_racks: Vec<&str> = rack_counts
        .iter()
        .filter(|(_, &c)| c == max_rack_count)
        .map(|(&rack, _)| rack)
        .collect();

    // 6. Candidate's rack not present in this DC at all.
    if !rack_counts.contains_key(candidate.rack.as_str()) {
        return rack_counts.len() < policy.diff_rack as usize + 1;
    }

    // 7. Candidate's rack must be a primary rack.
    if !primary_racks.contains(&candidate.rack.as_str()) {
        return false;
    }

    // 8. Same (dc, rack): cap at sameRack + 1 replicas.
    let same_rack_count = existing
        .iter()
        .filter(|l| l.dc == candidate.dc && l.rack == candidate.rack)
        .count();
    same_rack_count < policy.same_rack as usize + 1
}

/// A volume is misplaced iff, for every replica i, dropping replica i and
/// re-evaluating `satisfy_replica_placement` for replica i's own location
/// against the rest returns false — i.e. no replica's current location is
/// something the policy would have chosen to add.
pub fn is_misplaced(replicas: &[Location], policy: &ReplicaPlacement) -> bool {
    if replicas.is_empty() {
        return false;
    }
    replicas.iter().enumerate().all(|(i, loc)| {
        let rest: Vec<Location> = replicas
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, l)| l.clone())
            .collect();
        !satisfy_replica_placement(policy, &rest, loc)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(dc: &str, rack: &str, node: &str) -> Location {
        Location {
            dc: dc.to_string(),
            rack: rack.to_string(),
            data_node: node.to_string(),
        }
    }

    #[test]
    fn never_duplicates_a_node() {
        let policy = ReplicaPlacement::new(1, 1, 1);
        let existing = vec![loc("dc1", "r1", "n1")];
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc1", "r1", "n1")));
    }

    #[test]
    fn expands_to_new_dc_when_under_diff_dc_budget() {
        let policy = ReplicaPlacement::new(1, 0, 0); // copyCount = 2
        let existing = vec![loc("dc1", "r1", "n1")];
        assert!(satisfy_replica_placement(&policy, &existing, &loc("dc2", "r1", "n2")));
    }

    #[test]
    fn refuses_new_dc_once_diff_dc_budget_exhausted() {
        let policy = ReplicaPlacement::new(1, 0, 0);
        let existing = vec![loc("dc1", "r1", "n1"), loc("dc2", "r1", "n2")];
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc3", "r1", "n3")));
    }

    #[test]
    fn must_fill_primary_dc_before_secondary() {
        // policy allows 2 DCs; existing already has 2 replicas in dc1 (primary)
        // and 1 in dc2 (secondary). Candidate targeting dc2 should be refused
        // because dc1 is still the (sole) primary by count... actually with
        // counts {dc1:2, dc2:1}, primary = dc1. A new node in dc2 (already
        // present) hits the "already in existing DCs" branch, not the "new DC"
        // branch, so step 4 applies: dc2 is not primary -> false.
        let policy = ReplicaPlacement::new(1, 0, 2);
        let existing = vec![
            loc("dc1", "r1", "n1"),
            loc("dc1", "r1", "n2"),
            loc("dc2", "r1", "n3"),
        ];
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc2", "r1", "n4")));
    }

    #[test]
    fn same_rack_cap() {
        let policy = ReplicaPlacement::new(0, 0, 1); // copyCount = 2, allow 1 extra same-rack
        let existing = vec![loc("dc1", "r1", "n1")];
        assert!(satisfy_replica_placement(&policy, &existing, &loc("dc1", "r1", "n2")));

        let existing2 = vec![loc("dc1", "r1", "n1"), loc("dc1", "r1", "n2")];
        assert!(!satisfy_replica_placement(&policy, &existing2, &loc("dc1", "r1", "n3")));
    }

    #[test]
    fn copy_count_one_never_admits_a_second_replica() {
        let policy = ReplicaPlacement::new(0, 0, 0);
        let existing = vec![loc("dc1", "r1", "n1")];
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc1", "r1", "n2")));
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc1", "r2", "n2")));
        assert!(!satisfy_replica_placement(&policy, &existing, &loc("dc2", "r1", "n2")));
    }

    #[test]
    fn two_replicas_same_rack_under_zero_policy_is_misplaced() {
        let policy = ReplicaPlacement::new(0, 0, 0);
        let replicas = vec![loc("dc1", "r1", "n1"), loc("dc1", "r1", "n2")];
        assert!(is_misplaced(&replicas, &policy));
    }

    #[test]
    fn well_placed_single_replica_is_not_misplaced() {
        let policy = ReplicaPlacement::new(0, 0, 0);
        let replicas = vec![loc("dc1", "r1", "n1")];
        assert!(!is_misplaced(&replicas, &policy));
    }

    #[test]
    fn empty_replica_set_is_not_misplaced() {
        let policy = ReplicaPlacement::new(1, 1, 1);
        assert!(!is_misplaced(&[], &policy));
    }

    proptest::proptest! {
        #[test]
        fn admitting_candidate_never_exceeds_copy_count(
            diff_dc in 0u8..3, diff_rack in 0u8..3, same_rack in 0u8..3,
        ) {
            let policy = ReplicaPlacement::new(diff_dc, diff_rack, same_rack);
            // A single-node existing set: admitting a same-rack candidate must
            // never be allowed beyond same_rack+1 total same-(dc,rack) replicas.
            let mut existing = vec![loc("dc1", "r1", "n0")];
            let mut admitted_same_rack = 1;
            for i in 1..6 {
                let cand = loc("dc1", "r1", &format!("n{i}"));
                let ok = satisfy_replica_placement(&policy, &existing, &cand);
                if ok {
                    admitted_same_rack += 1;
                    existing.push(cand);
                }
            }
            prop_assert!(admitted_same_rack <= same_rack as usize + 1);
        }
    }
}
