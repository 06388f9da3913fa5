//! Error types for the cluster maintenance engine.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reconciling replication, running FSCK,
/// running anti-entropy, or decoding erasure-coded volumes across the
/// fleet.
///
/// Variants are grouped by the error kinds from the error-handling design:
/// transient RPC errors the caller may retry, policy violations that skip a
/// volume, lock loss that aborts immediately, topology drift that is
/// retried then made fatal for a volume, data corruption reported per
/// entry, and fatal errors that abort the whole command.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
#[allow(dead_code)]
pub enum Error {
    /// I/O error (temp folder, local file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Transient (caller-policy retry)
    // =========================================================================
    /// Transport-level RPC failure against master, volume server, or filer.
    #[error("RPC error: {0}")]
    Rpc(#[source] reqwest::Error),

    /// Transient error with a free-form description (e.g. non-2xx response
    /// with no underlying `reqwest::Error` to wrap).
    #[error("transient error: {0}")]
    Transient(String),

    // =========================================================================
    // Policy violation (report, skip the volume, continue)
    // =========================================================================
    /// A policy constraint was violated for a specific volume: missing
    /// fraction over threshold, collection mismatch across replicas, or a
    /// misplaced volume with no safe removal candidate.
    #[error("policy violation for volume {volume_id}: {reason}")]
    PolicyViolation { volume_id: u32, reason: String },

    // =========================================================================
    // Lock lost (immediate abort)
    // =========================================================================
    /// The cluster-wide advisory lock was lost mid-command.
    #[error("cluster advisory lock lost")]
    LockLost,

    // =========================================================================
    // Topology drift (retry up to retryCount, then fatal for that volume)
    // =========================================================================
    /// After a mutation, the master's topology does not yet (or still does
    /// not) reflect the expected replica count for a volume.
    #[error(
        "topology drift for volume {volume_id}: expected {expected} replicas, master reports {actual}"
    )]
    TopologyDrift {
        volume_id: u32,
        expected: usize,
        actual: usize,
    },

    // =========================================================================
    // Data corruption (report per entry, continue where safe)
    // =========================================================================
    /// Malformed on-disk artifact: `.idx`/`.ecx` stream length not a
    /// multiple of 16 bytes, or a filer chunk manifest that failed to
    /// resolve.
    #[error("data corruption in {context}: {reason}")]
    DataCorruption { context: String, reason: String },

    // =========================================================================
    // Fatal (abort the whole command)
    // =========================================================================
    /// Unrecoverable error: temp folder could not be created, or the master
    /// was unreachable for the initial topology snapshot.
    #[error("fatal error: {0}")]
    Fatal(String),

    // =========================================================================
    // Erasure coding
    // =========================================================================
    /// EC encoding failed.
    #[error("EC encoding failed: {0}")]
    EcEncodingFailed(String),

    /// EC reconstruction failed.
    #[error("EC reconstruction failed: {reason}")]
    EcReconstructionFailed { reason: String },

    /// Not enough shards survive to reconstruct the volume.
    #[error("insufficient shards: have {available}, need {required}")]
    InsufficientShards { available: usize, required: usize },

    /// Invalid Reed-Solomon configuration (zero shard counts, etc).
    #[error("invalid EC configuration: {0}")]
    InvalidEcConfig(String),

    // =========================================================================
    // Needle index
    // =========================================================================
    /// `.idx`/`.ecx` stream length is not a multiple of the 16-byte record
    /// size.
    #[error("malformed needle index stream: length {len} is not a multiple of 16")]
    MalformedNeedleIndex { len: usize },

    // =========================================================================
    // Configuration / CLI
    // =========================================================================
    /// Invalid CLI argument or configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal invariant violation; should not occur in practice.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Rpc(e)
    }
}
