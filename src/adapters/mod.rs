//! Infrastructure Adapters
//!
//! Adapters implement the domain ports (`crate::domain::ports`) over HTTP,
//! following the same Port/Adapter (Hexagonal) split used throughout this
//! codebase: engines depend on `MasterClient`/`VolumeServerClient`/
//! `FilerClient` trait objects, never on `reqwest` directly.
//!
//! # Wire transport
//!
//! The distilled design leaves the volume-server RPC wire format abstract
//! ("length-prefixed request/response messages"). These adapters speak
//! HTTP with JSON bodies, the only concrete RPC convention already present
//! in this codebase (see DESIGN.md for the rationale). Streaming RPCs
//! (`CopyFile`, `VolumeCopy`) are modeled as chunked HTTP response bodies.

mod filer;
mod master;
mod volume_server;

pub use filer::HttpFilerClient;
pub use master::HttpMasterClient;
pub use volume_server::HttpVolumeServerClient;
