//! Domain Layer
//!
//! Port traits for the three RPC surfaces (master, volume server, filer)
//! that the cluster-maintenance engines depend on. Infrastructure adapters
//! in `crate::adapters` implement these traits over HTTP.

pub mod ports;

pub use ports::{FilerClient, MasterClient, VolumeServerClient};
