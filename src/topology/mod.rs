//! Topology Snapshot
//!
//! A topology snapshot is the tree of cluster state fetched from the master
//! at the start of every mutating command: data centers, racks, data nodes,
//! and the disks/volumes/EC shards each node carries. The snapshot is
//! immutable for the duration of one command invocation; the reconciler
//! mutates its *local copy* of `free_volume_count` as it plans copies
//! (§5), but never writes back into the snapshot fetched from the master.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::ports::MasterClient;
use crate::error::Result;

// =============================================================================
// Disk type
// =============================================================================

/// Disk type key for a data node's `diskInfos` map. Defaults to `"hdd"`
/// when a data node reports no explicit type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiskType(pub String);

impl DiskType {
    pub fn hdd() -> Self {
        DiskType("hdd".to_string())
    }
}

impl Default for DiskType {
    fn default() -> Self {
        Self::hdd()
    }
}

impl std::fmt::Display for DiskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Replica placement
// =============================================================================

/// Replica placement policy: three small non-negative counts packed into
/// one byte in the wire format, modeled here as plain fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPlacement {
    pub diff_data_center: u8,
    pub diff_rack: u8,
    pub same_rack: u8,
}

impl ReplicaPlacement {
    pub fn new(diff_data_center: u8, diff_rack: u8, same_rack: u8) -> Self {
        Self {
            diff_data_center,
            diff_rack,
            same_rack,
        }
    }

    /// `copyCount = diffDC + diffRack + sameRack + 1`.
    pub fn copy_count(&self) -> usize {
        self.diff_data_center as usize + self.diff_rack as usize + self.same_rack as usize + 1
    }

    /// Pack into the one-byte wire representation.
    pub fn to_byte(self) -> u8 {
        (self.diff_data_center << 4 & 0xF0) | (self.diff_rack << 2 & 0x0C) | (self.same_rack & 0x03)
    }

    /// Unpack from the one-byte wire representation.
    pub fn from_byte(b: u8) -> Self {
        Self {
            diff_data_center: (b >> 4) & 0x0F,
            diff_rack: (b >> 2) & 0x03,
            same_rack: b & 0x03,
        }
    }
}

// =============================================================================
// Volume / EC shard info
// =============================================================================

/// A single volume as reported by a data node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: u32,
    pub collection: String,
    pub size: u64,
    pub file_count: u64,
    pub delete_count: u64,
    pub deleted_byte_count: u64,
    pub modified_at_second: i64,
    pub compact_revision: u32,
    pub replica_placement: ReplicaPlacement,
    pub ttl: String,
    pub disk_type: DiskType,
    pub read_only: bool,
    pub remote_storage_name: Option<String>,
    pub remote_storage_key: Option<String>,
}

impl VolumeInfo {
    /// `volume.deleteEmpty` eligibility: size at most 8 bytes (an empty
    /// volume's superblock-only footprint).
    pub fn is_empty(&self) -> bool {
        self.size <= 8
    }
}

/// A single EC shard set as reported by a data node: which of the volume's
/// `TotalShardCount` shards live here, as a bitmask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EcShardInfo {
    pub id: u32,
    pub collection: String,
    pub ec_index_bits: u32,
}

impl EcShardInfo {
    pub fn has_shard(&self, shard_id: u32) -> bool {
        self.ec_index_bits & (1 << shard_id) != 0
    }

    pub fn shard_ids(&self) -> Vec<u32> {
        (0..32).filter(|i| self.has_shard(*i)).collect()
    }

    pub fn shard_count(&self) -> u32 {
        self.ec_index_bits.count_ones()
    }
}

// =============================================================================
// Disk / data node / rack / data center
// =============================================================================

/// Per-disk-type counters and the volumes/shards living on that disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskInfo {
    pub max_volume_count: i64,
    pub volume_count: i64,
    pub active_volume_count: i64,
    pub free_volume_count: i64,
    pub remote_volume_count: i64,
    pub volumes: Vec<VolumeInfo>,
    pub ec_shards: Vec<EcShardInfo>,
}

/// A data node: identity plus its disks, keyed by disk type (default
/// `"hdd"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataNode {
    /// `host:port` identity.
    pub id: String,
    pub disks: BTreeMap<DiskType, DiskInfo>,
}

impl DataNode {
    pub fn disk(&self, disk_type: &DiskType) -> Option<&DiskInfo> {
        self.disks.get(disk_type)
    }

    pub fn free_volume_count(&self, disk_type: &DiskType) -> i64 {
        self.disks.get(disk_type).map(|d| d.free_volume_count).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rack {
    pub id: String,
    pub data_nodes: Vec<DataNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: String,
    pub racks: Vec<Rack>,
}

/// Identifies a replica's physical location within the topology tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub dc: String,
    pub rack: String,
    pub data_node: String,
}

/// One physical copy of a volume, paired with its location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeReplica {
    pub location: Location,
    pub volume: VolumeInfo,
}

// =============================================================================
// Topology
// =============================================================================

/// The full cluster topology as returned by `MasterClient::volume_list`,
/// plus the global volume size limit. Immutable for the lifetime of one
/// command invocation (callers that need to simulate capacity changes
/// across a pass, e.g. the reconciler, track those changes out-of-band
/// rather than mutating this tree).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub data_centers: Vec<DataCenter>,
}

impl Topology {
    pub fn empty() -> Self {
        Self {
            data_centers: Vec::new(),
        }
    }

    /// Visit every data node in deterministic order: data centers sorted by
    /// id, then racks sorted by id, then data nodes sorted by id.
    pub fn visit_data_nodes(&self) -> Vec<(&str, &str, &DataNode)> {
        let mut dcs: Vec<&DataCenter> = self.data_centers.iter().collect();
        dcs.sort_by(|a, b| a.id.cmp(&b.id));

        let mut out = Vec::new();
        for dc in dcs {
            let mut racks: Vec<&Rack> = dc.racks.iter().collect();
            racks.sort_by(|a, b| a.id.cmp(&b.id));
            for rack in racks {
                let mut nodes: Vec<&DataNode> = rack.data_nodes.iter().collect();
                nodes.sort_by(|a, b| a.id.cmp(&b.id));
                for node in nodes {
                    out.push((dc.id.as_str(), rack.id.as_str(), node));
                }
            }
        }
        out
    }

    /// Group every replica of every volume by volume id, in deterministic
    /// node-visitation order.
    pub fn replicas_by_volume(&self) -> BTreeMap<u32, Vec<VolumeReplica>> {
        let mut out: BTreeMap<u32, Vec<VolumeReplica>> = BTreeMap::new();
        for (dc, rack, node) in self.visit_data_nodes() {
            for disk in node.disks.values() {
                for vol in &disk.volumes {
                    out.entry(vol.id).or_default().push(VolumeReplica {
                        location: Location {
                            dc: dc.to_string(),
                            rack: rack.to_string(),
                            data_node: node.id.clone(),
                        },
                        volume: vol.clone(),
                    });
                }
            }
        }
        out
    }

    /// Group every EC shard set of every volume by volume id: node id ->
    /// shard bitmask.
    pub fn ec_shards_by_volume(&self) -> BTreeMap<u32, Vec<(String, EcShardInfo)>> {
        let mut out: BTreeMap<u32, Vec<(String, EcShardInfo)>> = BTreeMap::new();
        for (_dc, _rack, node) in self.visit_data_nodes() {
            for disk in node.disks.values() {
                for shard in &disk.ec_shards {
                    out.entry(shard.id)
                        .or_default()
                        .push((node.id.clone(), shard.clone()));
                }
            }
        }
        out
    }
}

/// `Collect(delay) -> (Topology, volumeSizeLimitMB)`: sleeps `delay` (to
/// let a previous mutation settle), then issues `VolumeList` against the
/// master.
#[instrument(skip(master))]
pub async fn collect(
    master: &dyn MasterClient,
    settle_delay: Duration,
) -> Result<(Topology, u64)> {
    if !settle_delay.is_zero() {
        debug!(?settle_delay, "settling before topology snapshot");
        tokio::time::sleep(settle_delay).await;
    }
    master.volume_list().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, free: i64) -> DataNode {
        let mut disks = BTreeMap::new();
        disks.insert(
            DiskType::hdd(),
            DiskInfo {
                max_volume_count: 100,
                volume_count: 100 - free,
                active_volume_count: 100 - free,
                free_volume_count: free,
                remote_volume_count: 0,
                volumes: Vec::new(),
                ec_shards: Vec::new(),
            },
        );
        DataNode {
            id: id.to_string(),
            disks,
        }
    }

    #[test]
    fn replica_placement_copy_count() {
        assert_eq!(ReplicaPlacement::new(0, 0, 0).copy_count(), 1);
        assert_eq!(ReplicaPlacement::new(0, 0, 1).copy_count(), 2);
        assert_eq!(ReplicaPlacement::new(1, 1, 1).copy_count(), 4);
    }

    #[test]
    fn replica_placement_byte_roundtrip() {
        let rp = ReplicaPlacement::new(1, 2, 3);
        let b = rp.to_byte();
        let rp2 = ReplicaPlacement::from_byte(b);
        assert_eq!(rp2.same_rack, 3);
    }

    #[test]
    fn visit_data_nodes_deterministic_order() {
        let topo = Topology {
            data_centers: vec![
                DataCenter {
                    id: "dc2".into(),
                    racks: vec![Rack {
                        id: "r1".into(),
                        data_nodes: vec![node("n1", 5)],
                    }],
                },
                DataCenter {
                    id: "dc1".into(),
                    racks: vec![Rack {
                        id: "r2".into(),
                        data_nodes: vec![node("n2", 5), node("n1b", 3)],
                    }],
                },
            ],
        };

        let visited = topo.visit_data_nodes();
        let ids: Vec<&str> = visited.iter().map(|(dc, _, n)| {
            let _ = n;
            *dc
        }).collect();
        assert_eq!(ids, vec!["dc1", "dc1", "dc2"]);

        let node_ids: Vec<&str> = visited.iter().map(|(_, _, n)| n.id.as_str()).collect();
        assert_eq!(node_ids, vec!["n1b", "n2", "n1"]);
    }

    #[test]
    fn ec_shard_bits() {
        let shard = EcShardInfo {
            id: 1,
            collection: "c".into(),
            ec_index_bits: 0b0000_0000_0000_0000_0010_0000_0000_0111,
        };
        assert!(shard.has_shard(0));
        assert!(shard.has_shard(1));
        assert!(shard.has_shard(2));
        assert!(!shard.has_shard(3));
        assert!(shard.has_shard(13));
        assert_eq!(shard.shard_count(), 4);
    }

    #[test]
    fn volume_is_empty() {
        let rp = ReplicaPlacement::new(0, 0, 0);
        let mk = |size| VolumeInfo {
            id: 1,
            collection: "".into(),
            size,
            file_count: 0,
            delete_count: 0,
            deleted_byte_count: 0,
            modified_at_second: 0,
            compact_revision: 0,
            replica_placement: rp,
            ttl: "".into(),
            disk_type: DiskType::hdd(),
            read_only: false,
            remote_storage_name: None,
            remote_storage_key: None,
        };
        assert!(mk(0).is_empty());
        assert!(mk(8).is_empty());
        assert!(!mk(9).is_empty());
    }
}
