//! Basic example of reading through the store client.
//!
//! Two in-memory replicas serve version 1 of a `users` store on loopback
//! ports. A second client over the same replicas acts as the dual-read
//! secondary.
//!
//!   RUST_LOG=kvrouter=debug cargo run --example basic

use kvrouter::testing::{InMemoryReplica, MockCluster, ReplicaNode};
use kvrouter::{ClientConfig, HedgingPolicy, StoreClient};
use std::sync::Arc;
use std::time::Duration;

const STORE: &str = "users";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvrouter=info".into()),
        )
        .init();

    let replica = Arc::new(InMemoryReplica::new().with_latency(Duration::from_millis(2)));
    for i in 0..10 {
        replica.put("users_v1", format!("user:{}", i), 1, format!("name-{}", i));
    }
    let first = ReplicaNode::spawn(replica.clone()).await?;
    let second = ReplicaNode::spawn(replica).await?;
    println!("Replicas listening on {} and {}", first.endpoint(), second.endpoint());

    let cluster = Arc::new(MockCluster::new());
    cluster.create_store(STORE, "\"string\"");
    cluster.add_value_schema(STORE, 1, "\"string\"");
    cluster.add_version(STORE, 1, 4);
    cluster.set_all_replicas(
        STORE,
        1,
        vec![first.endpoint().clone(), second.endpoint().clone()],
    );
    cluster.set_current_version(STORE, 1);

    let secondary = StoreClient::builder(ClientConfig::new(STORE))
        .with_sources(cluster.clone(), cluster.clone())
        .build()?;
    secondary.start().await?;

    let config = ClientConfig::new(STORE)
        .with_request_timeout(Duration::from_millis(500))
        .with_hedging(HedgingPolicy::SequentialWithFallback {
            hedge_delay: Duration::from_millis(5),
            max_in_flight: 2,
        })
        .with_dual_read_enabled(true);
    let client = StoreClient::builder(config)
        .with_sources(cluster.clone(), cluster)
        .with_secondary(Arc::new(secondary.clone()))
        .build()?;
    client.start().await?;

    match client.get("user:3").await? {
        Some(value) => println!("user:3 = {}", String::from_utf8_lossy(&value)),
        None => println!("user:3 not found"),
    }
    println!("user:42 present: {}", client.get("user:42").await?.is_some());

    let batch = client
        .batch_get(["user:1", "user:2", "user:5", "user:99"])
        .await?;
    println!(
        "Batch: {} keys, {} found, {} absent, {} failed",
        batch.len(),
        batch.found(),
        batch.absent(),
        batch.failed().count()
    );

    // Let the mirrored reads finish before printing metrics.
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("\n{}", client.metrics().to_prometheus());

    client.close().await;
    secondary.close().await;
    Ok(())
}
