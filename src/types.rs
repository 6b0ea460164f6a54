//! Core types used throughout the store client.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store version number.
pub type VersionNumber = u32;

/// Partition index within a store version.
pub type PartitionId = u32;

/// Value schema identifier.
pub type SchemaId = i32;

const VERSION_SEPARATOR: &str = "_v";

/// Compose the resource name of a store version, e.g. `users_v3`.
pub fn compose_resource_name(store: &str, version: VersionNumber) -> String {
    format!("{}{}{}", store, VERSION_SEPARATOR, version)
}

/// Split a resource name back into store name and version.
pub fn parse_resource_name(resource: &str) -> Option<(&str, VersionNumber)> {
    let idx = resource.rfind(VERSION_SEPARATOR)?;
    let (store, rest) = resource.split_at(idx);
    if store.is_empty() {
        return None;
    }
    let version = rest[VERSION_SEPARATOR.len()..].parse().ok()?;
    Some((store, version))
}

/// One immutable version of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreVersion {
    /// Logical store name.
    pub store_name: String,
    /// Version number; a higher number is newer.
    pub number: VersionNumber,
    /// Number of partitions in this version.
    pub partition_count: u32,
    /// Version of the schema set observed when this version was loaded.
    pub schema_set_version: u64,
}

impl StoreVersion {
    /// Create a new store version.
    pub fn new(store_name: impl Into<String>, number: VersionNumber, partition_count: u32) -> Self {
        Self {
            store_name: store_name.into(),
            number,
            partition_count,
            schema_set_version: 0,
        }
    }

    /// Resource name for this version.
    pub fn resource_name(&self) -> String {
        compose_resource_name(&self.store_name, self.number)
    }
}

/// A serving instance that hosts replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceEndpoint {
    /// Host name or IP address.
    pub host: String,
    /// Plain-text port.
    pub port: u16,
    /// TLS port, if the instance serves TLS.
    pub tls_port: Option<u16>,
}

impl InstanceEndpoint {
    /// Create an endpoint without a TLS port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_port: None,
        }
    }

    /// Set the TLS port.
    pub fn with_tls_port(mut self, tls_port: u16) -> Self {
        self.tls_port = Some(tls_port);
        self
    }

    /// Port to dial, falling back to the plain port when no TLS port is known.
    pub fn port_for(&self, secure: bool) -> u16 {
        if secure {
            self.tls_port.unwrap_or(self.port)
        } else {
            self.port
        }
    }

    /// `host:port` string to dial.
    pub fn address(&self, secure: bool) -> String {
        format!("{}:{}", self.host, self.port_for(secure))
    }

    /// URL form of the endpoint.
    pub fn url(&self, secure: bool) -> String {
        let scheme = if secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.address(secure))
    }
}

impl fmt::Display for InstanceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A schema with its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub id: SchemaId,
    pub raw_schema: String,
}

impl SchemaEntry {
    pub fn new(id: SchemaId, raw_schema: impl Into<String>) -> Self {
        Self {
            id,
            raw_schema: raw_schema.into(),
        }
    }
}

/// A value together with the id of the schema it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    pub schema_id: SchemaId,
    pub value: Bytes,
}
