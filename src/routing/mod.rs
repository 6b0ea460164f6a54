//! Routing module: from resolved replicas to an attempt order.
//!
//! The partition and its replica set come from one
//! [`MetadataSnapshot`](crate::metadata::MetadataSnapshot); this module only
//! decides the order in which those replicas are tried.

pub mod selector;

pub use selector::{InFlightGuard, ReplicaSelector};
