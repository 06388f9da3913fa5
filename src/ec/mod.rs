//! Erasure Coding
//!
//! Reed-Solomon encode/decode primitives (`encoder.rs`) plus the EC Decode
//! Orchestrator (`orchestrator.rs`), which is RPC choreography across volume
//! servers rather than a local codec call: copy surviving shards onto a
//! target node, ask that node to reconstruct the full volume from them,
//! mount it, then clean up the shard copies left behind on every node that
//! held a bit of the original shard set.

pub mod encoder;
pub mod orchestrator;

pub use encoder::{EcDecoder, EcEncoder};
pub use orchestrator::{decode_volume, EcDecodeReport};
