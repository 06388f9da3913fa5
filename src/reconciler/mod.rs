//! Replication Reconciler
//!
//! One pass over every volume id in a topology snapshot: classify as
//! over-replicated, misplaced, or under-replicated, then repair in that
//! order. Deletions and copies are gated by `dry_run`; a
//! `collection_pattern` glob restricts which volumes are touched. After
//! mutating, the pass re-queries the master and waits with a `7*(i+1)s`
//! backoff for the new replica count to show up.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use globset::{Glob, GlobMatcher};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::ports::{MasterClient, VolumeServerClient};
use crate::error::{Error, Result};
use crate::metrics::RECONCILER_VOLUMES_COPIED;
use crate::placement::{is_misplaced, satisfy_replica_placement};
use crate::topology::{self, DiskType, Location, Topology, VolumeReplica};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub dry_run: bool,
    pub collection_pattern: Option<String>,
    pub retry: usize,
    pub volumes_per_step: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            collection_pattern: None,
            retry: 0,
            volumes_per_step: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReconcilerReport {
    pub copied: Vec<u32>,
    pub deleted: Vec<u32>,
    pub skipped: Vec<(u32, String)>,
}

/// Runs one reconciliation pass. `lock_token` must be a token returned by
/// `master.acquire_lock`; it is re-checked before each volume is touched so
/// a preempted lock aborts the pass with `Error::LockLost` instead of
/// racing another mutating command.
#[instrument(skip(master, volume_server, config, cancel, lock_token))]
pub async fn run(
    master: &dyn MasterClient,
    volume_server: &dyn VolumeServerClient,
    config: &ReconcilerConfig,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<ReconcilerReport> {
    let pattern = config
        .collection_pattern
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
        .transpose()
        .map_err(|e| Error::Config(format!("invalid collection pattern: {e}")))?;

    master.check_lock(lock_token).await?;
    let (topology, _limit_mb) = topology::collect(master, Duration::ZERO).await?;
    let mut free_volume_count = FreeVolumeTracker::new(&topology);

    let mut report = ReconcilerReport::default();
    let replicas_by_volume = topology.replicas_by_volume();
    let mut fixed_volume_ids = Vec::new();

    for (vid, replicas) in replicas_by_volume {
        if cancel.is_cancelled() {
            break;
        }
        if config.volumes_per_step > 0 && fixed_volume_ids.len() >= config.volumes_per_step {
            break;
        }
        if replicas.is_empty() {
            continue;
        }
        if !collection_allowed(&pattern, &replicas[0].volume.collection) {
            continue;
        }
        if !config.dry_run {
            master.check_lock(lock_token).await?;
        }

        let policy = replicas[0].volume.replica_placement;
        let copy_count = policy.copy_count();

        match classify(&replicas, copy_count, &policy) {
            Classification::OverReplicated => {
                if let Some(victim) = pick_deletion_candidate(&replicas) {
                    if replicas.iter().any(|r| r.volume.collection != victim.volume.collection) {
                        report.skipped.push((vid, "collection mismatch across replicas".into()));
                        continue;
                    }
                    if !config.dry_run {
                        volume_server.volume_delete(&victim.location.data_node, vid).await?;
                    }
                    RECONCILER_VOLUMES_COPIED.with_label_values(&["delete_over_replicated"]).inc();
                    report.deleted.push(vid);
                    fixed_volume_ids.push(vid);
                    info!(volume_id = vid, node = %victim.location.data_node, "deleted over-replicated copy");
                }
            }
            Classification::Misplaced => {
                let victim = pick_misplacement_candidate(&replicas, &policy)
                    .unwrap_or_else(|| pick_deletion_candidate(&replicas).unwrap());
                if !config.dry_run {
                    volume_server.volume_delete(&victim.location.data_node, vid).await?;
                }
                RECONCILER_VOLUMES_COPIED.with_label_values(&["delete_misplaced"]).inc();
                report.deleted.push(vid);
                fixed_volume_ids.push(vid);
                info!(volume_id = vid, node = %victim.location.data_node, "deleted misplaced copy");
            }
            Classification::UnderReplicated => {
                match pick_copy_target(&topology, &replicas, &policy, &free_volume_count) {
                    Some((source, target_node, disk_type)) => {
                        if !config.dry_run {
                            let mut stream = volume_server
                                .volume_copy(&target_node, vid, &source.location.data_node, cancel.clone())
                                .await?;
                            use futures::StreamExt;
                            while let Some(progress) = stream.next().await {
                                progress?;
                            }
                        }
                        free_volume_count.decrement(&target_node, &disk_type);
                        RECONCILER_VOLUMES_COPIED.with_label_values(&["copy_under_replicated"]).inc();
                        report.copied.push(vid);
                        fixed_volume_ids.push(vid);
                        info!(volume_id = vid, target = %target_node, source = %source.location.data_node, "copied under-replicated volume");
                    }
                    None => {
                        report.skipped.push((vid, "no placement-eligible target found".into()));
                    }
                }
            }
            Classification::Satisfied => {}
        }
    }

    if !config.dry_run && !fixed_volume_ids.is_empty() {
        reverify(master, &fixed_volume_ids, config.retry, cancel).await?;
    }

    Ok(report)
}

fn collection_allowed(pattern: &Option<GlobMatcher>, collection: &str) -> bool {
    match pattern {
        Some(m) => m.is_match(collection),
        None => true,
    }
}

enum Classification {
    OverReplicated,
    Misplaced,
    UnderReplicated,
    Satisfied,
}

fn classify(
    replicas: &[VolumeReplica],
    copy_count: usize,
    policy: &crate::topology::ReplicaPlacement,
) -> Classification {
    let locations: Vec<Location> = replicas.iter().map(|r| r.location.clone()).collect();
    if replicas.len() > copy_count {
        Classification::OverReplicated
    } else if is_misplaced(&locations, policy) {
        Classification::Misplaced
    } else if replicas.len() < copy_count {
        Classification::UnderReplicated
    } else {
        Classification::Satisfied
    }
}

/// `(size asc, modifiedAtSecond asc, compactRevision asc)` tie-break.
fn pick_deletion_candidate(replicas: &[VolumeReplica]) -> Option<&VolumeReplica> {
    replicas.iter().min_by(|a, b| {
        a.volume
            .size
            .cmp(&b.volume.size)
            .then(a.volume.modified_at_second.cmp(&b.volume.modified_at_second))
            .then(a.volume.compact_revision.cmp(&b.volume.compact_revision))
    })
}

/// A replica whose removal leaves the remaining set well-placed, if any.
fn pick_misplacement_candidate<'a>(
    replicas: &'a [VolumeReplica],
    policy: &crate::topology::ReplicaPlacement,
) -> Option<&'a VolumeReplica> {
    replicas.iter().find(|candidate| {
        let rest: Vec<Location> = replicas
            .iter()
            .filter(|r| r.location != candidate.location)
            .map(|r| r.location.clone())
            .collect();
        !is_misplaced(&rest, policy)
    })
}

struct FreeVolumeTracker {
    adjustments: HashMap<(String, DiskType), i64>,
    base: HashMap<(String, DiskType), i64>,
}

impl FreeVolumeTracker {
    fn new(topology: &Topology) -> Self {
        let mut base = HashMap::new();
        for (_dc, _rack, node) in topology.visit_data_nodes() {
            for (disk_type, disk) in &node.disks {
                base.insert((node.id.clone(), disk_type.clone()), disk.free_volume_count);
            }
        }
        Self {
            adjustments: HashMap::new(),
            base,
        }
    }

    fn free_volume_count(&self, node: &str, disk_type: &DiskType) -> i64 {
        let key = (node.to_string(), disk_type.clone());
        self.base.get(&key).copied().unwrap_or(0) + self.adjustments.get(&key).copied().unwrap_or(0)
    }

    fn decrement(&mut self, node: &str, disk_type: &DiskType) {
        *self.adjustments.entry((node.to_string(), disk_type.clone())).or_insert(0) -= 1;
    }
}

/// Picks the copy source (highest `modifiedAtSecond`) and the first
/// placement-eligible target node, sorted by `free_volume_count` descending.
fn pick_copy_target<'a>(
    topology: &Topology,
    replicas: &'a [VolumeReplica],
    policy: &crate::topology::ReplicaPlacement,
    free_volume_count: &FreeVolumeTracker,
) -> Option<(&'a VolumeReplica, String, DiskType)> {
    let source = replicas.iter().max_by_key(|r| r.volume.modified_at_second)?;
    let disk_type = source.volume.disk_type.clone();
    let existing: Vec<Location> = replicas.iter().map(|r| r.location.clone()).collect();
    let existing_nodes: HashSet<&str> = existing.iter().map(|l| l.data_node.as_str()).collect();

    let mut candidates: Vec<(String, String, String, i64)> = Vec::new();
    for (dc, rack, node) in topology.visit_data_nodes() {
        if existing_nodes.contains(node.id.as_str()) {
            continue;
        }
        if !node.disks.contains_key(&disk_type) {
            continue;
        }
        let free = free_volume_count.free_volume_count(&node.id, &disk_type);
        if free <= 0 {
            continue;
        }
        candidates.push((dc.to_string(), rack.to_string(), node.id.clone(), free));
    }
    candidates.sort_by(|a, b| b.3.cmp(&a.3));

    for (dc, rack, node_id, _free) in candidates {
        let candidate_loc = Location {
            dc,
            rack,
            data_node: node_id.clone(),
        };
        if satisfy_replica_placement(policy, &existing, &candidate_loc) {
            return Some((source, node_id, disk_type));
        }
    }
    None
}

/// Re-queries the master for each fixed volume id, backing off
/// `7*(i+1)` seconds between attempts, up to `retry` attempts, until the
/// reported replica count matches what this pass expects.
async fn reverify(
    master: &dyn MasterClient,
    fixed_volume_ids: &[u32],
    retry: usize,
    cancel: CancellationToken,
) -> Result<()> {
    for attempt in 0..=retry {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let locations = master.lookup_volume(fixed_volume_ids).await?;
        let all_present = fixed_volume_ids.iter().all(|vid| locations.contains_key(vid));
        if all_present {
            return Ok(());
        }
        if attempt == retry {
            warn!(?fixed_volume_ids, "topology drift persisted after retries");
            return Err(Error::TopologyDrift {
                volume_id: fixed_volume_ids[0],
                expected: fixed_volume_ids.len(),
                actual: locations.len(),
            });
        }
        tokio::time::sleep(Duration::from_secs(7 * (attempt as u64 + 1))).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DiskType, ReplicaPlacement, VolumeInfo};

    fn volume(id: u32, size: u64, modified: i64, compact_revision: u32) -> VolumeInfo {
        VolumeInfo {
            id,
            collection: "c".into(),
            size,
            file_count: 0,
            delete_count: 0,
            deleted_byte_count: 0,
            modified_at_second: modified,
            compact_revision,
            replica_placement: ReplicaPlacement::new(0, 0, 0),
            ttl: "".into(),
            disk_type: DiskType::hdd(),
            read_only: false,
            remote_storage_name: None,
            remote_storage_key: None,
        }
    }

    fn loc(dc: &str, rack: &str, node: &str) -> Location {
        Location {
            dc: dc.into(),
            rack: rack.into(),
            data_node: node.into(),
        }
    }

    #[test]
    fn deletion_candidate_picks_smallest_then_oldest_then_lowest_revision() {
        let replicas = vec![
            VolumeReplica {
                location: loc("dc1", "r1", "n1"),
                volume: volume(9, 100, 10, 1),
            },
            VolumeReplica {
                location: loc("dc1", "r1", "n2"),
                volume: volume(9, 100, 10, 2),
            },
            VolumeReplica {
                location: loc("dc1", "r1", "n3"),
                volume: volume(9, 100, 11, 1),
            },
        ];
        let victim = pick_deletion_candidate(&replicas).unwrap();
        assert_eq!(victim.location.data_node, "n1");
    }

    #[test]
    fn classify_over_replicated() {
        let policy = ReplicaPlacement::new(0, 0, 0); // copyCount = 1
        let replicas = vec![
            VolumeReplica { location: loc("dc1", "r1", "n1"), volume: volume(1, 1, 1, 1) },
            VolumeReplica { location: loc("dc1", "r1", "n2"), volume: volume(1, 1, 1, 1) },
        ];
        assert!(matches!(
            classify(&replicas, policy.copy_count(), &policy),
            Classification::OverReplicated
        ));
    }

    #[test]
    fn classify_under_replicated() {
        let policy = ReplicaPlacement::new(0, 0, 1); // copyCount = 2
        let replicas = vec![VolumeReplica {
            location: loc("dc1", "r1", "n1"),
            volume: volume(1, 1, 1, 1),
        }];
        assert!(matches!(
            classify(&replicas, policy.copy_count(), &policy),
            Classification::UnderReplicated
        ));
    }

    #[test]
    fn collection_pattern_filters_by_glob() {
        let m = Glob::new("prod-*").unwrap().compile_matcher();
        assert!(collection_allowed(&Some(m.clone()), "prod-images"));
        assert!(!collection_allowed(&Some(m), "staging-images"));
        assert!(collection_allowed(&None, "anything"));
    }
}
