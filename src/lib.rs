//! swfsck — Cluster Maintenance Engine
//!
//! Four cluster-maintenance engines for a master/volume-server/filer blob
//! store, sharing a topology snapshot model and a uniform volume-server RPC
//! vocabulary:
//!
//! - [`reconciler`] — replication reconciler: detects under/over/misplaced
//!   replicas and repairs them subject to a placement policy.
//! - [`fsck`] — cross-indexes the filer's chunk references against every
//!   volume's on-disk needle index to find and optionally purge orphans.
//! - [`diskcheck`] — pairwise anti-entropy sync of needle indexes across
//!   replicas of the same volume.
//! - [`ec`] — erasure-coding decode orchestrator: gathers scattered shards
//!   onto one server, reconstitutes a normal volume, mounts it.
//!
//! # Modules
//!
//! - [`adapters`] — HTTP adapters implementing the domain ports
//! - [`domain`] — port traits for master/volume-server/filer RPC surfaces
//! - [`topology`] — topology snapshot data model and traversal
//! - [`placement`] — replica placement policy evaluation
//! - [`needle_index`] — in-memory `.idx`/`.ecx` needle index
//! - [`error`] — error types
//! - [`metrics`] — Prometheus metrics exposition

pub mod adapters;
pub mod diskcheck;
pub mod domain;
pub mod ec;
pub mod error;
pub mod fsck;
pub mod metrics;
pub mod needle_index;
pub mod placement;
pub mod reconciler;
pub mod topology;

pub use error::{Error, Result};
