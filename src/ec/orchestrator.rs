//! EC Decode Orchestrator
//!
//! Converts an erasure-coded volume back into a plain replicated volume:
//! pick the node already holding the most shards as the reconstruction
//! target, copy every other surviving shard onto it, ask it to rebuild and
//! mount the volume, then unmount and delete the shard copies left behind
//! on every node that held a bit of the original shard set.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::ports::{MasterClient, VolumeServerClient};
use crate::error::{Error, Result};
use crate::metrics::EC_DECODES;
use crate::topology::{EcShardInfo, Topology};

/// Outcome of one EC-decode attempt.
#[derive(Debug, Clone)]
pub struct EcDecodeReport {
    pub volume_id: u32,
    pub target_node: String,
    pub shards_copied_from: Vec<String>,
}

/// `TotalShardCount` for the data+parity split this crate supports
/// (SeaweedFS's default 10 data + 4 parity EC layout).
pub const DATA_SHARDS: u32 = 10;
pub const PARITY_SHARDS: u32 = 4;
pub const TOTAL_SHARDS: u32 = DATA_SHARDS + PARITY_SHARDS;

/// Picks the node holding the largest number of non-parity shards as the
/// reconstruction target. Ties broken by node id for determinism.
fn pick_target<'a>(shards_by_node: &'a [(String, EcShardInfo)]) -> Option<&'a str> {
    shards_by_node
        .iter()
        .max_by_key(|(node, shard)| {
            let data_shard_count = (0..DATA_SHARDS).filter(|&i| shard.has_shard(i)).count();
            (data_shard_count, std::cmp::Reverse(node.clone()))
        })
        .map(|(node, _)| node.as_str())
}

/// Decodes volume `vid` back into a regular volume. `force` bypasses the
/// fleet precheck that otherwise skips volumes whose surviving node count
/// is below `PARITY_SHARDS` (too few distinct nodes to safely shuffle
/// shards around even though enough shards exist). `lock_token` (from
/// `master.acquire_lock`) is re-checked before the shard-copy phase and
/// again before the cleanup phase.
#[instrument(skip(master, topology, volume_server, cancel, lock_token))]
pub async fn decode_volume(
    master: &dyn MasterClient,
    topology: &Topology,
    volume_server: &dyn VolumeServerClient,
    vid: u32,
    collection: &str,
    force: bool,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<EcDecodeReport> {
    let result = decode_volume_inner(master, topology, volume_server, vid, collection, force, lock_token, cancel).await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    EC_DECODES.with_label_values(&[outcome]).inc();
    result
}

async fn decode_volume_inner(
    master: &dyn MasterClient,
    topology: &Topology,
    volume_server: &dyn VolumeServerClient,
    vid: u32,
    collection: &str,
    force: bool,
    lock_token: &str,
    cancel: CancellationToken,
) -> Result<EcDecodeReport> {
    master.check_lock(lock_token).await?;

    let shards_by_volume = topology.ec_shards_by_volume();
    let shards_by_node = shards_by_volume
        .get(&vid)
        .ok_or_else(|| Error::PolicyViolation {
            volume_id: vid,
            reason: "no EC shards found for volume".to_string(),
        })?;

    let available_shard_ids: BTreeSet<u32> = shards_by_node
        .iter()
        .flat_map(|(_, shard)| shard.shard_ids())
        .collect();

    if available_shard_ids.len() < DATA_SHARDS as usize {
        return Err(Error::InsufficientShards {
            available: available_shard_ids.len(),
            required: DATA_SHARDS as usize,
        });
    }

    if shards_by_node.len() < PARITY_SHARDS as usize && !force {
        return Err(Error::PolicyViolation {
            volume_id: vid,
            reason: format!(
                "only {} nodes hold shards, fewer than {PARITY_SHARDS} parity shards; use force to proceed",
                shards_by_node.len()
            ),
        });
    }

    let target = pick_target(shards_by_node)
        .ok_or_else(|| Error::Internal("pick_target returned None for non-empty shard set".into()))?
        .to_string();

    // Shards the target already holds, restricted to non-parity ids: the
    // copy loop below only ever needs to fill in what's missing from this
    // set, and grows it as each source node's copy completes.
    let mut target_shard_ids: BTreeSet<u32> = shards_by_node
        .iter()
        .find(|(node, _)| node == &target)
        .map(|(_, shard)| shard.shard_ids().into_iter().filter(|id| *id < DATA_SHARDS).collect())
        .unwrap_or_default();

    master.check_lock(lock_token).await?;

    let mut shards_copied_from = Vec::new();
    for (node, shard) in shards_by_node {
        if node == &target {
            continue;
        }
        if cancel.is_cancelled() {
            return Err(Error::Transient("EC decode cancelled".to_string()));
        }
        let shard_ids: Vec<u32> = shard
            .shard_ids()
            .into_iter()
            .filter(|id| *id < DATA_SHARDS && !target_shard_ids.contains(id))
            .collect();
        if shard_ids.is_empty() {
            continue;
        }
        volume_server
            .volume_ec_shards_copy(&target, vid, collection, &shard_ids, true, true, true, node)
            .await?;
        target_shard_ids.extend(shard_ids.iter().copied());
        shards_copied_from.push(node.clone());
    }

    volume_server
        .volume_ec_shards_to_volume(&target, vid, collection)
        .await?;
    volume_server.volume_mount(&target, vid).await?;

    info!(volume_id = vid, target = %target, "EC volume reconstructed");

    master.check_lock(lock_token).await?;

    for (node, shard) in shards_by_node {
        let shard_ids = shard.shard_ids();
        if let Err(e) = volume_server.volume_ec_shards_unmount(node, vid, &shard_ids).await {
            warn!(volume_id = vid, %node, error = %e, "failed to unmount residual EC shards");
            continue;
        }
        if let Err(e) = volume_server
            .volume_ec_shards_delete(node, vid, collection, &shard_ids)
            .await
        {
            warn!(volume_id = vid, %node, error = %e, "failed to delete residual EC shards");
        }
    }

    Ok(EcDecodeReport {
        volume_id: vid,
        target_node: target,
        shards_copied_from,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(ec_index_bits: u32) -> EcShardInfo {
        EcShardInfo {
            id: 1,
            collection: "c".into(),
            ec_index_bits,
        }
    }

    #[test]
    fn pick_target_prefers_most_data_shards() {
        let nodes = vec![
            ("n1".to_string(), shard(0b0000_0000_0000_0000_0000_0000_0000_0111)), // 3 data shards
            ("n2".to_string(), shard(0b0000_0000_0000_0000_0000_0011_1111_1111)), // 10 data shards
        ];
        assert_eq!(pick_target(&nodes), Some("n2"));
    }

    #[test]
    fn pick_target_empty_returns_none() {
        let nodes: Vec<(String, EcShardInfo)> = Vec::new();
        assert_eq!(pick_target(&nodes), None);
    }
}
