//! Replica Disk-Check (anti-entropy)
//!
//! For each volume with at least two replicas, sorts by
//! `file_count - delete_count` descending and repeatedly pairs off the top
//! two of what remains, shuttling missing needle blobs between each pair in
//! both directions until a round makes no change. A direction whose missing
//! fraction exceeds `non_repair_threshold` fails fast instead of silently
//! rebuilding a replica that has diverged too far to trust.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::domain::ports::{IndexExt, MasterClient, VolumeServerClient};
use crate::error::{Error, Result};
use crate::metrics::DISKCHECK_NEEDLES_REPAIRED;
use crate::needle_index::NeedleIndexDb;
use crate::topology::{self, VolumeReplica};

#[derive(Debug, Clone)]
pub struct DiskCheckConfig {
    pub slow: bool,
    pub verbose: bool,
    pub volume_id: u32,
    pub force: bool,
    pub non_repair_threshold: f64,
}

impl Default for DiskCheckConfig {
    fn default() -> Self {
        Self {
            slow: false,
            verbose: false,
            volume_id: 0,
            force: false,
            non_repair_threshold: 0.3,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct DiskCheckReport {
    pub volumes_checked: usize,
    pub needles_repaired: usize,
    pub pairs_skipped: usize,
}

/// `lock_token` (from `master.acquire_lock`) is re-checked before each
/// volume's replicas are paired off.
#[instrument(skip(master, volume_server, config, cancel, lock_token))]
pub async fn run(
    master: &dyn MasterClient,
    volume_server: &dyn VolumeServerClient,
    config: &DiskCheckConfig,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<DiskCheckReport> {
    master.check_lock(lock_token).await?;
    let (topology, _limit_mb) = topology::collect(master, std::time::Duration::ZERO).await?;
    let mut report = DiskCheckReport::default();

    for (vid, mut replicas) in topology.replicas_by_volume() {
        if config.volume_id != 0 && vid != config.volume_id {
            continue;
        }
        if replicas.len() < 2 {
            continue;
        }
        if cancel.is_cancelled() {
            break;
        }
        master.check_lock(lock_token).await?;

        replicas.sort_by_key(|r| std::cmp::Reverse(fill_count(r)));

        // Repeatedly take the top two of what remains: (0,1), (2,3), ...
        // An odd replica left over at the end has nothing left to pair with.
        for pair in replicas.chunks(2) {
            let (a, b) = match pair {
                [a, b] => (a, b),
                _ => continue,
            };

            if !config.slow && fill_count(a) == fill_count(b) {
                report.pairs_skipped += 1;
                continue;
            }
            if a.volume.read_only || b.volume.read_only {
                report.pairs_skipped += 1;
                continue;
            }

            report.volumes_checked += 1;
            converge_pair(volume_server, vid, a, b, config, &mut report, cancel.clone()).await?;
        }
    }

    Ok(report)
}

fn fill_count(replica: &VolumeReplica) -> i64 {
    replica.volume.file_count as i64 - replica.volume.delete_count as i64
}

/// Runs both directions repeatedly until a round makes no change.
async fn converge_pair(
    volume_server: &dyn VolumeServerClient,
    vid: u32,
    a: &VolumeReplica,
    b: &VolumeReplica,
    config: &DiskCheckConfig,
    report: &mut DiskCheckReport,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let forward = sync_direction(volume_server, vid, a, b, config, cancel.clone()).await?;
        let backward = sync_direction(volume_server, vid, b, a, config, cancel.clone()).await?;
        report.needles_repaired += forward + backward;
        DISKCHECK_NEEDLES_REPAIRED.inc_by((forward + backward) as f64);
        if forward == 0 && backward == 0 {
            return Ok(());
        }
    }
}

/// Copies every needle present in `src`'s index but absent from `dst`'s,
/// from `src` to `dst`. Returns the number of needles copied.
async fn sync_direction(
    volume_server: &dyn VolumeServerClient,
    vid: u32,
    src: &VolumeReplica,
    dst: &VolumeReplica,
    config: &DiskCheckConfig,
    cancel: CancellationToken,
) -> Result<usize> {
    let src_db = load_index(volume_server, &src.location.data_node, vid, &src.volume.collection, cancel.clone()).await?;
    let dst_db = load_index(volume_server, &dst.location.data_node, vid, &dst.volume.collection, cancel.clone()).await?;

    let missing = src_db.missing_from(&dst_db);
    let counter = src_db.len().max(1);
    let fraction = missing.len() as f64 / counter as f64;

    if fraction > config.non_repair_threshold {
        return Err(Error::PolicyViolation {
            volume_id: vid,
            reason: format!(
                "missing fraction {fraction:.3} exceeds non-repair threshold {:.3} ({} -> {})",
                config.non_repair_threshold, src.location.data_node, dst.location.data_node
            ),
        });
    }

    for key in &missing {
        if cancel.is_cancelled() {
            return Err(Error::Transient("disk-check cancelled".to_string()));
        }
        let value = src_db.get(*key).expect("key came from src_db.missing_from");
        let blob = volume_server
            .read_needle_blob(&src.location.data_node, vid, *key, value.offset, value.size)
            .await?;
        volume_server
            .write_needle_blob(&dst.location.data_node, vid, *key, value.size, blob)
            .await?;
    }

    if !missing.is_empty() {
        info!(
            volume_id = vid,
            from = %src.location.data_node,
            to = %dst.location.data_node,
            count = missing.len(),
            "repaired missing needles"
        );
    }

    Ok(missing.len())
}

async fn load_index(
    volume_server: &dyn VolumeServerClient,
    node: &str,
    vid: u32,
    collection: &str,
    cancel: CancellationToken,
) -> Result<NeedleIndexDb> {
    let mut stream = volume_server
        .copy_file(node, vid, IndexExt::Idx, collection, false, 0, 0, cancel)
        .await?;
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?);
    }
    let mut db = NeedleIndexDb::new();
    db.load(&bytes)?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{DiskType, Location, ReplicaPlacement, VolumeInfo};

    fn replica(file_count: u64, delete_count: u64) -> VolumeReplica {
        VolumeReplica {
            location: Location {
                dc: "dc1".into(),
                rack: "r1".into(),
                data_node: "n1".into(),
            },
            volume: VolumeInfo {
                id: 1,
                collection: "c".into(),
                size: 100,
                file_count,
                delete_count,
                deleted_byte_count: 0,
                modified_at_second: 0,
                compact_revision: 0,
                replica_placement: ReplicaPlacement::new(0, 0, 1),
                ttl: "".into(),
                disk_type: DiskType::hdd(),
                read_only: false,
                remote_storage_name: None,
                remote_storage_key: None,
            },
        }
    }

    #[test]
    fn fill_count_subtracts_deletes() {
        assert_eq!(fill_count(&replica(10, 3)), 7);
    }

    #[test]
    fn default_non_repair_threshold_is_point_three() {
        assert_eq!(DiskCheckConfig::default().non_repair_threshold, 0.3);
    }
}
