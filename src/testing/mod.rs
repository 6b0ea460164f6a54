//! Testing utilities for the store client.
//!
//! Doubles for every external collaborator, so that the client can be
//! exercised without a cluster:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       Testing Framework                          │
//! │                                                                  │
//! │  MockCluster ─────► ClusterMetadataSource + SchemaSource         │
//! │  MockTransport ───► Transport (scripted per-endpoint behaviour,  │
//! │                     call / concurrency / cancellation counts)    │
//! │  MockSecondary ───► SecondaryClient                              │
//! │  ReplicaNode ─────► ReplicaServer over an InMemoryReplica,       │
//! │                     killable, for tests over real sockets        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust
//! use kvrouter::testing::{MockCluster, MockTransport, ReplicaBehavior};
//! use kvrouter::types::InstanceEndpoint;
//!
//! let cluster = MockCluster::new();
//! cluster.create_store("users", "\"string\"");
//! cluster.add_value_schema("users", 1, "\"string\"");
//! cluster.add_version("users", 1, 4);
//! cluster.set_all_replicas("users", 1, vec![InstanceEndpoint::new("127.0.0.1", 7000)]);
//! cluster.set_current_version("users", 1);
//!
//! let transport = MockTransport::new();
//! transport.put("users_v1", "user:1", 1, "alice");
//! transport.set_behavior(&InstanceEndpoint::new("127.0.0.1", 7001), ReplicaBehavior::Hang);
//! ```

mod mock_cluster;
mod mock_secondary;
mod mock_transport;
mod replica;
mod utils;

mod client_scenario_tests;

pub use mock_cluster::MockCluster;
pub use mock_secondary::MockSecondary;
pub use mock_transport::{MockTransport, RecordedCall, ReplicaBehavior};
pub use replica::{InMemoryReplica, ReplicaNode};
pub use utils::wait_for_result;
