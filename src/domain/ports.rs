//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the three RPC surfaces the cluster-maintenance
//! engine depends on — master, volume server, filer — plus the streaming
//! and cancellation value types they share. Infrastructure adapters
//! (`crate::adapters`) implement these traits over HTTP; engines (the
//! reconciler, FSCK, disk-check, EC orchestrator) depend only on the
//! traits, never the concrete transport.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::topology::{Location, Topology};

// =============================================================================
// Shared value objects
// =============================================================================

/// A filer directory entry, as returned by `ReadDirAllEntries`.
#[derive(Debug, Clone)]
pub struct FilerEntry {
    pub full_path: String,
    pub is_directory: bool,
    pub chunks: Vec<FilerChunkRef>,
}

/// A chunk reference as stored by the filer against a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilerChunkRef {
    pub volume_id: u32,
    pub file_key: u64,
    pub cookie: u32,
    pub mtime_ns: i64,
    pub full_path: String,
    /// Set when this chunk reference is itself a manifest that expands into
    /// further chunk references.
    pub is_chunk_manifest: bool,
}

/// Metadata returned by `ReadNeedleMeta`, used by FSCK's binary search for
/// the cutoff point in a volume's index.
#[derive(Debug, Clone, Copy)]
pub struct NeedleMeta {
    /// Nanoseconds since Unix epoch.
    pub last_modified_ns: i64,
}

/// A progress event from a streaming `VolumeCopy` RPC.
#[derive(Debug, Clone, Copy)]
pub struct CopyProgress {
    pub processed_bytes: u64,
}

// =============================================================================
// Master RPC port
// =============================================================================

/// The master's RPC surface: topology snapshot, volume lookup, collection
/// management, cluster node listing, and the cluster-wide advisory lock
/// that every mutating command checks at entry and between long phases.
#[async_trait]
pub trait MasterClient: Send + Sync {
    /// Returns the full topology and the global volume size limit in MB.
    async fn volume_list(&self) -> Result<(Topology, u64)>;

    /// Returns the current replica locations for each requested volume id.
    async fn lookup_volume(&self, ids: &[u32]) -> Result<HashMap<u32, Vec<Location>>>;

    /// Deletes a collection by name.
    async fn collection_delete(&self, name: &str) -> Result<()>;

    /// Lists cluster nodes of a given client type, optionally scoped to a
    /// filer group.
    async fn list_cluster_nodes(
        &self,
        client_type: &str,
        filer_group: Option<&str>,
    ) -> Result<Vec<String>>;

    /// Acquires the cluster-wide advisory lock for this command. Returns a
    /// lock token that must be passed to `check_lock`/`release_lock`.
    async fn acquire_lock(&self, owner: &str) -> Result<String>;

    /// Verifies the advisory lock is still held; returns `Error::LockLost`
    /// if it has been preempted.
    async fn check_lock(&self, token: &str) -> Result<()>;

    /// Releases the advisory lock. Best-effort: callers should not treat
    /// failure here as fatal, since the lock expires on its own lease.
    async fn release_lock(&self, token: &str) -> Result<()>;
}

// =============================================================================
// Volume-server RPC port
// =============================================================================

/// File extension for an index snapshot requested via `CopyFile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexExt {
    Idx,
    Ecx,
}

impl IndexExt {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexExt::Idx => ".idx",
            IndexExt::Ecx => ".ecx",
        }
    }
}

/// Uniform RPC surface exposed by every volume server. All operations take
/// `(server, volumeId)` plus operation-specific arguments; streaming
/// operations return a lazy byte/event stream that completes on
/// end-of-stream or propagates the first transport error.
#[async_trait]
pub trait VolumeServerClient: Send + Sync {
    async fn volume_mount(&self, server: &str, vid: u32) -> Result<()>;
    async fn volume_unmount(&self, server: &str, vid: u32) -> Result<()>;
    async fn volume_delete(&self, server: &str, vid: u32) -> Result<()>;
    async fn volume_mark_writable(&self, server: &str, vid: u32, writable: bool) -> Result<()>;

    /// Streams the requested index file (`.idx` or `.ecx`) for a volume.
    async fn copy_file(
        &self,
        server: &str,
        vid: u32,
        ext: IndexExt,
        collection: &str,
        is_ec: bool,
        compaction_revision: u32,
        stop_offset: u64,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;

    async fn read_needle_meta(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        offset: u32,
        size: u32,
    ) -> Result<NeedleMeta>;

    async fn read_needle_blob(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        offset: u32,
        size: u32,
    ) -> Result<Bytes>;

    async fn write_needle_blob(
        &self,
        server: &str,
        vid: u32,
        needle_id: u64,
        size: u32,
        blob: Bytes,
    ) -> Result<()>;

    /// Streams progress events while copying a full volume from
    /// `source_data_node` onto `server`; completes with overall success.
    async fn volume_copy(
        &self,
        server: &str,
        vid: u32,
        source_data_node: &str,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, Result<CopyProgress>>>;

    async fn volume_ec_shards_copy(
        &self,
        server: &str,
        vid: u32,
        collection: &str,
        shard_ids: &[u32],
        copy_ecx_file: bool,
        copy_ecj_file: bool,
        copy_vif_file: bool,
        source_data_node: &str,
    ) -> Result<()>;

    async fn volume_ec_shards_to_volume(&self, server: &str, vid: u32, collection: &str) -> Result<()>;

    async fn volume_ec_shards_delete(&self, server: &str, vid: u32, collection: &str, shard_ids: &[u32]) -> Result<()>;

    async fn volume_ec_shards_unmount(&self, server: &str, vid: u32, shard_ids: &[u32]) -> Result<()>;

    /// Batch-deletes needles, given `fid` strings of the form
    /// `"<volumeId>,<fileKeyHex><cookieHex>"`.
    async fn delete_files(&self, server: &str, fids: &[String]) -> Result<()>;
}

// =============================================================================
// Filer RPC port
// =============================================================================

/// The filer's RPC surface used by FSCK: namespace traversal, chunk
/// manifest resolution, and entry deletion (the latter exposed by the real
/// filer as an HTTP DELETE, per §6).
#[async_trait]
pub trait FilerClient: Send + Sync {
    /// Streams every entry under `path`, recursively.
    async fn read_dir_all_entries(&self, path: &str) -> Result<BoxStream<'static, Result<FilerEntry>>>;

    /// Resolves a chunk that is itself a manifest into the data chunks it
    /// lists.
    async fn resolve_chunk_manifest(&self, chunk: &FilerChunkRef) -> Result<Vec<FilerChunkRef>>;

    /// Issues `DELETE http://<filer>/<fullPath>`. Returns the HTTP status
    /// code; callers treat non-2xx as a per-entry error and continue.
    async fn delete_entry(&self, full_path: &str) -> Result<u16>;

    async fn get_filer_configuration(&self) -> Result<FilerConfiguration>;
}

/// A subset of the filer's configuration relevant to FSCK traversal.
#[derive(Debug, Clone)]
pub struct FilerConfiguration {
    pub collection: Option<String>,
    pub max_mb: u32,
}
