//! FSCK Engine
//!
//! Cross-indexes a filer's chunk references against every volume's on-disk
//! needle index, two ways:
//!
//! - **Mode A** (volume − filer): needles present in a volume's index but
//!   never referenced by the filer are orphans, reported and optionally
//!   purged via `DeleteFiles`.
//! - **Mode B** (filer − volume): filer entries whose chunk key is absent
//!   from the owning volume's index are unbacked, reported and optionally
//!   purged via an HTTP DELETE on the filer.
//!
//! Both modes snapshot volume indexes into a scoped temp folder (removed on
//! drop, matching the "scoped acquisition" design note) before the filer
//! traversal begins, so the filer's chunk set is guaranteed to be a superset
//! of on-disk state at snapshot time for any chunk older than the cutoff.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::ports::{FilerChunkRef, FilerClient, IndexExt, MasterClient, VolumeServerClient};
use crate::error::{Error, Result};
use crate::metrics::{FSCK_ORPHANS_FOUND, FSCK_ORPHANS_PURGED};
use crate::needle_index::NeedleIndexDb;
use crate::topology::{self, VolumeReplica};

#[derive(Debug, Clone)]
pub struct FsckConfig {
    pub verbose: bool,
    pub find_missing_chunks_in_filer: bool,
    pub find_missing_chunks_in_filer_path: String,
    pub find_missing_chunks_in_volume_id: u32,
    pub really_delete_from_volume: bool,
    pub force_purging: bool,
    pub really_delete_filer_entries: bool,
    pub temp_path: std::path::PathBuf,
    pub cutoff_time_ago: Duration,
}

impl Default for FsckConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            find_missing_chunks_in_filer: false,
            find_missing_chunks_in_filer_path: "/".to_string(),
            find_missing_chunks_in_volume_id: 0,
            really_delete_from_volume: false,
            force_purging: false,
            really_delete_filer_entries: false,
            temp_path: std::env::temp_dir(),
            cutoff_time_ago: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct FsckReport {
    pub volume_orphans_found: usize,
    pub volume_orphans_purged: usize,
    pub filer_entries_missing: usize,
    pub filer_entries_purged: usize,
}

/// Mode A: orphan needles present in volumes but unreferenced by the filer.
/// `lock_token` (from `master.acquire_lock`) is re-checked before the
/// snapshot phase and again before the purge phase.
#[instrument(skip(master, volume_server, filer, config, cancel, lock_token))]
pub async fn run_mode_a(
    master: &dyn MasterClient,
    volume_server: &dyn VolumeServerClient,
    filer: &dyn FilerClient,
    config: &FsckConfig,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<FsckReport> {
    let temp_dir = TempDir::new_in(&config.temp_path)
        .map_err(|e| Error::Fatal(format!("failed to create fsck temp folder: {e}")))?;
    info!(temp_dir = %temp_dir.path().display(), "fsck mode A starting");

    master.check_lock(lock_token).await?;
    let (topology, _limit_mb) = topology::collect(master, Duration::ZERO).await?;
    let collect_mtime_secs = cutoff_now_secs();
    let cutoff_ns = collect_mtime_secs as i64 * 1_000_000_000 - config.cutoff_time_ago.as_nanos() as i64;

    let replicas_by_volume = topology.replicas_by_volume();
    let ec_volume_ids: HashSet<u32> = topology.ec_shards_by_volume().keys().copied().collect();

    // Per-(node, volume) needle index snapshots, truncated to the cutoff.
    let mut indexes: HashMap<(String, u32), NeedleIndexDb> = HashMap::new();
    for (vid, replicas) in &replicas_by_volume {
        if ec_volume_ids.contains(vid) {
            continue;
        }
        if config.find_missing_chunks_in_volume_id != 0 && *vid != config.find_missing_chunks_in_volume_id {
            continue;
        }
        for replica in replicas {
            if cancel.is_cancelled() {
                return Err(Error::Transient("fsck cancelled".to_string()));
            }
            let db = snapshot_volume_index(
                volume_server,
                &replica.location.data_node,
                *vid,
                &replica.volume.collection,
                replica.volume.read_only,
                cutoff_ns,
                cancel.clone(),
            )
            .await?;
            indexes.insert((replica.location.data_node.clone(), *vid), db);
        }
    }

    // BFS the filer namespace, resolving chunk manifests, bucketing
    // referenced file keys per volume id.
    let mut referenced: HashMap<u32, HashSet<u64>> = HashMap::new();
    let mut entries = filer.read_dir_all_entries("/").await?;
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        for chunk in entry.chunks {
            collect_referenced_keys(filer, chunk, &mut referenced).await?;
        }
    }

    // Per-replica orphan sets, grouped by volume id.
    let mut orphans_by_volume: HashMap<u32, Vec<HashSet<u64>>> = HashMap::new();
    for ((_node, vid), db) in &indexes {
        let empty = HashSet::new();
        let refs = referenced.get(vid).unwrap_or(&empty);
        let orphan_here: HashSet<u64> = db.keys().filter(|k| !refs.contains(k)).collect();
        orphans_by_volume.entry(*vid).or_default().push(orphan_here);
    }

    // A key is "provable orphan" iff present in every replica's orphan set
    // (or, under -forcePurging, in any replica's orphan set).
    let mut per_volume_orphans: HashMap<u32, HashSet<u64>> = HashMap::new();
    for (vid, sets) in &orphans_by_volume {
        let merged = if config.force_purging {
            sets.iter().flatten().copied().collect()
        } else {
            let mut iter = sets.iter();
            let first = iter.next().cloned().unwrap_or_default();
            iter.fold(first, |acc, s| acc.intersection(s).copied().collect())
        };
        per_volume_orphans.insert(*vid, merged);
    }

    let mut report = FsckReport::default();
    for orphans in per_volume_orphans.values() {
        report.volume_orphans_found += orphans.len();
    }
    FSCK_ORPHANS_FOUND.inc_by(report.volume_orphans_found as f64);

    if config.really_delete_from_volume {
        master.check_lock(lock_token).await?;
        for (vid, orphans) in &per_volume_orphans {
            if orphans.is_empty() {
                continue;
            }
            let replicas = &replicas_by_volume[vid];
            let fids: Vec<String> = orphans.iter().map(|key| format!("{vid},{key:x}00000000")).collect();
            purge_orphans_from_replicas(volume_server, replicas, &fids).await?;
            report.volume_orphans_purged += orphans.len();
        }
        FSCK_ORPHANS_PURGED.inc_by(report.volume_orphans_purged as f64);
    }

    Ok(report)
}

/// Mode B: filer entries whose referenced chunk key is absent from the
/// owning volume's index. `lock_token` is re-checked before the snapshot
/// phase and periodically during the purge-capable filer walk.
#[instrument(skip(master, volume_server, filer, config, cancel, lock_token))]
pub async fn run_mode_b(
    master: &dyn MasterClient,
    volume_server: &dyn VolumeServerClient,
    filer: &dyn FilerClient,
    config: &FsckConfig,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<FsckReport> {
    master.check_lock(lock_token).await?;
    let (topology, _limit_mb) = topology::collect(master, Duration::ZERO).await?;
    let cutoff_ns = 0; // Mode B purges based on filer-side presence, not a cutoff.
    let replicas_by_volume = topology.replicas_by_volume();

    let mut indexes: HashMap<u32, NeedleIndexDb> = HashMap::new();
    for (vid, replicas) in &replicas_by_volume {
        let replica = match replicas.first() {
            Some(r) => r,
            None => continue,
        };
        let db = snapshot_volume_index(
            volume_server,
            &replica.location.data_node,
            *vid,
            &replica.volume.collection,
            replica.volume.read_only,
            cutoff_ns,
            cancel.clone(),
        )
        .await?;
        indexes.insert(*vid, db);
    }

    if config.really_delete_filer_entries {
        master.check_lock(lock_token).await?;
    }

    let mut report = FsckReport::default();
    let mut entries = filer
        .read_dir_all_entries(&config.find_missing_chunks_in_filer_path)
        .await?;

    while let Some(entry) = entries.next().await {
        let entry = entry?;
        for chunk in entry.chunks {
            if cancel.is_cancelled() {
                return Err(Error::Transient("fsck cancelled".to_string()));
            }
            match indexes.get(&chunk.volume_id) {
                None => {
                    warn!(volume_id = chunk.volume_id, path = %chunk.full_path, "volume not found");
                    report.filer_entries_missing += 1;
                    if config.really_delete_filer_entries {
                        purge_filer_entry(filer, &chunk.full_path).await;
                        report.filer_entries_purged += 1;
                    }
                }
                Some(db) => {
                    if !db.contains(chunk.file_key) {
                        report.filer_entries_missing += 1;
                        if config.really_delete_filer_entries {
                            purge_filer_entry(filer, &chunk.full_path).await;
                            report.filer_entries_purged += 1;
                        }
                    }
                }
            }
        }
    }

    Ok(report)
}

async fn purge_filer_entry(filer: &dyn FilerClient, full_path: &str) {
    match filer.delete_entry(full_path).await {
        Ok(status) if (200..300).contains(&status) => {}
        Ok(status) => warn!(full_path, status, "filer delete_entry returned non-2xx"),
        Err(e) => warn!(full_path, error = %e, "filer delete_entry failed"),
    }
}

async fn snapshot_volume_index(
    volume_server: &dyn VolumeServerClient,
    node: &str,
    vid: u32,
    collection: &str,
    read_only: bool,
    cutoff_ns: i64,
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

    if !read_only && cutoff_ns > 0 {
        truncate_to_cutoff(volume_server, node, vid, &mut db, cutoff_ns).await?;
    }

    Ok(db)
}

/// Binary-searches the ascending key order for the first entry whose
/// `lastModifiedNs > cutoff_ns`, and drops it and everything after.
async fn truncate_to_cutoff(
    volume_server: &dyn VolumeServerClient,
    node: &str,
    vid: u32,
    db: &mut NeedleIndexDb,
    cutoff_ns: i64,
) -> Result<()> {
    let keys: Vec<u64> = db.keys().collect();
    if keys.is_empty() {
        return Ok(());
    }

    let mut lo = 0usize;
    let mut hi = keys.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let key = keys[mid];
        let value = db.get(key).expect("key came from db.keys()");
        let meta = volume_server
            .read_needle_meta(node, vid, key, value.offset, value.size)
            .await?;
        if meta.last_modified_ns <= cutoff_ns {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }

    for key in &keys[lo..] {
        db.delete(*key);
    }
    Ok(())
}

fn collect_referenced_keys<'a>(
    filer: &'a dyn FilerClient,
    chunk: FilerChunkRef,
    referenced: &'a mut HashMap<u32, HashSet<u64>>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if chunk.is_chunk_manifest {
            let resolved = filer.resolve_chunk_manifest(&chunk).await?;
            for sub in resolved {
                collect_referenced_keys(filer, sub, referenced).await?;
            }
        } else {
            referenced.entry(chunk.volume_id).or_default().insert(chunk.file_key);
        }
        Ok(())
    })
}

async fn purge_orphans_from_replicas(
    volume_server: &dyn VolumeServerClient,
    replicas: &[VolumeReplica],
    fids: &[String],
) -> Result<()> {
    for replica in replicas {
        let node = &replica.location.data_node;
        let was_read_only = replica.volume.read_only;
        if was_read_only {
            volume_server.volume_mark_writable(node, replica.volume.id, true).await?;
        }
        let result = volume_server.delete_files(node, fids).await;
        if was_read_only {
            volume_server.volume_mark_writable(node, replica.volume.id, false).await?;
        }
        result?;
    }
    Ok(())
}

fn cutoff_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fid_formatting_matches_volume_comma_hex_key() {
        let fid = format!("{},{:x}00000000", 3u32, 42u64);
        assert_eq!(fid, "3,2a00000000");
    }

    #[test]
    fn default_config_has_five_minute_cutoff() {
        let config = FsckConfig::default();
        assert_eq!(config.cutoff_time_ago, Duration::from_secs(300));
        assert!(!config.really_delete_from_volume);
    }
}
