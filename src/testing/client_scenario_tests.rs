//! Scenario tests for the client against mocked replicas and metadata.
//!
//! These cover the behaviour a caller relies on across modules: reads stay
//! consistent with one metadata snapshot, version swaps do not disturb
//! in-flight reads, hedged attempts are cancelled, and the secondary read
//! path never changes or delays results.

#[cfg(test)]
mod tests {
    use crate::client::StoreClient;
    use crate::config::{ClientConfig, HedgingPolicy, RetryPolicy};
    use crate::dual_read::DualReadOutcome;
    use crate::error::Error;
    use crate::partitioning::Partitioner;
    use crate::testing::{MockCluster, MockSecondary, MockTransport, ReplicaBehavior};
    use crate::types::{compose_resource_name, InstanceEndpoint};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const STORE: &str = "users";

    fn endpoint(port: u16) -> InstanceEndpoint {
        InstanceEndpoint::new("127.0.0.1", port)
    }

    fn base_cluster() -> Arc<MockCluster> {
        let cluster = Arc::new(MockCluster::new());
        cluster.create_store(STORE, "\"string\"");
        cluster.add_value_schema(STORE, 1, "\"string\"");
        cluster
    }

    fn build(config: ClientConfig, cluster: &Arc<MockCluster>, transport: &Arc<MockTransport>) -> StoreClient {
        StoreClient::builder(config)
            .with_sources(cluster.clone(), cluster.clone())
            .with_transport(transport.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_reads_use_one_snapshot_while_versions_flip() {
        let cluster = base_cluster();
        // Version 1: one partition on port 8001. Version 2: four partitions,
        // partition p served by port 8100 + p.
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, vec![endpoint(8001)]);
        cluster.add_version(STORE, 2, 4);
        for p in 0..4 {
            cluster.set_replicas(STORE, 2, p, vec![endpoint(8100 + p as u16)]);
        }
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        for i in 0..50 {
            let key = format!("key_{}", i);
            transport.put("users_v1", key.clone(), 1, "v1");
            transport.put("users_v2", key, 1, "v2");
        }

        let config = ClientConfig::new(STORE).with_refresh_interval(Duration::from_millis(1));
        let client = build(config, &cluster, &transport);
        client.start().await.unwrap();

        let flipper = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                for round in 0..40 {
                    cluster.set_current_version(STORE, if round % 2 == 0 { 2 } else { 1 });
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        let mut handles = Vec::new();
        for round in 0..4 {
            for i in 0..50 {
                let client = client.clone();
                handles.push(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(round * 10)).await;
                    client.get(format!("key_{}", i)).await
                }));
            }
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert!(value == Some(Bytes::from_static(b"v1")) || value == Some(Bytes::from_static(b"v2")));
        }
        flipper.await.unwrap();

        // Every call went to a replica of the partition it was routed to,
        // computed with the partition count of the same version.
        let partitioner = Partitioner::default();
        for call in transport.recorded_calls() {
            match call.resource.as_str() {
                "users_v1" => {
                    assert_eq!(call.partition, 0);
                    assert_eq!(call.endpoint, endpoint(8001));
                }
                "users_v2" => {
                    assert_eq!(call.partition, partitioner.partition(&call.key, 4));
                    assert_eq!(call.endpoint, endpoint(8100 + call.partition as u16));
                }
                other => panic!("unexpected resource {}", other),
            }
        }
        client.close().await;
    }

    #[tokio::test]
    async fn test_version_swap_keeps_in_flight_reads_on_old_version() {
        let cluster = base_cluster();
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, vec![endpoint(8001)]);
        cluster.add_version(STORE, 2, 1);
        cluster.set_replicas(STORE, 2, 0, vec![endpoint(8002)]);
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        transport.put("users_v1", "key_1", 1, "from_v1");
        transport.put("users_v2", "key_1", 1, "from_v2");
        transport.set_behavior(&endpoint(8001), ReplicaBehavior::Delay(Duration::from_millis(100)));

        let client = build(ClientConfig::new(STORE), &cluster, &transport);
        client.start().await.unwrap();

        let in_flight = client.spawn_get("key_1");
        tokio::time::sleep(Duration::from_millis(20)).await;

        cluster.set_current_version(STORE, 2);
        client.metadata().refresh().await.unwrap();
        assert_eq!(client.metadata().current_version().unwrap().number, 2);

        // Started after the swap: served by version 2.
        assert_eq!(
            client.get("key_1").await.unwrap(),
            Some(Bytes::from_static(b"from_v2"))
        );
        // Started before the swap: finishes on version 1 without error.
        assert_eq!(in_flight.await.unwrap(), Some(Bytes::from_static(b"from_v1")));

        // The old version stays resolvable for the grace period.
        assert_eq!(client.metadata().partition_count(1).unwrap(), 1);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_hedged_attempt_wins_and_slow_attempt_is_cancelled() {
        let cluster = base_cluster();
        let slow = endpoint(8001);
        let fast = endpoint(8002);
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, vec![slow.clone(), fast.clone()]);
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        transport.put("users_v1", "key_1", 1, "value_1");
        transport.set_behavior(&slow, ReplicaBehavior::Hang);

        let config = ClientConfig::new(STORE).with_hedging(HedgingPolicy::SequentialWithFallback {
            hedge_delay: Duration::from_millis(10),
            max_in_flight: 2,
        });
        let client = build(config, &cluster, &transport);
        client.start().await.unwrap();
        // Put the hanging replica first in line.
        client.coordinator().selector().mark_unhealthy(&fast);

        let started = Instant::now();
        let value = client.get("key_1").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"value_1")));
        assert!(started.elapsed() < client.config().request_timeout);
        assert_eq!(transport.calls(&slow), 1);
        assert_eq!(transport.calls(&fast), 1);

        for _ in 0..100 {
            if transport.cancelled() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(transport.cancelled(), 1);
        assert_eq!(transport.in_flight(), 0);

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.hedged_attempts, 1);
        assert_eq!(snapshot.cancelled_attempts, 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_absence_is_distinct_from_failure() {
        let cluster = base_cluster();
        let replicas = vec![endpoint(8001), endpoint(8002)];
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, replicas.clone());
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        transport.put("users_v1", "key_1", 1, "value_1");
        let config = ClientConfig::new(STORE)
            .with_hedging(HedgingPolicy::None)
            .with_retry(RetryPolicy::new(2).with_backoff(Duration::from_millis(1)));
        let client = build(config, &cluster, &transport);
        client.start().await.unwrap();

        // Absent on every replica: one call, a clean None.
        assert_eq!(client.get("missing").await.unwrap(), None);
        assert_eq!(transport.total_calls(), 1);

        // Unreachable: an error, never None.
        for ep in &replicas {
            transport.set_behavior(ep, ReplicaBehavior::Refuse);
        }
        let result = client.get("missing").await;
        assert!(matches!(result, Err(Error::RetryableTransport(_))));

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.errors, 1);
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_secondary_timeouts_never_affect_results() {
        let cluster = base_cluster();
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, vec![endpoint(8001), endpoint(8002)]);
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        for i in 0..20 {
            transport.put("users_v1", format!("key_{}", i), 1, format!("value_{}", i));
        }
        let secondary = Arc::new(MockSecondary::new());
        secondary.set_hang(true);

        let secondary_timeout = Duration::from_millis(200);
        let (events_tx, mut events) = mpsc::channel(64);
        let client = StoreClient::builder(
            ClientConfig::new(STORE)
                .with_dual_read_enabled(true)
                .with_secondary_timeout(secondary_timeout),
        )
        .with_sources(cluster.clone(), cluster.clone())
        .with_transport(transport.clone())
        .with_secondary(secondary.clone())
        .with_dual_read_events(events_tx)
        .build()
        .unwrap();
        client.start().await.unwrap();

        for i in 0..20 {
            let started = Instant::now();
            let value = client.get(format!("key_{}", i)).await.unwrap();
            assert_eq!(value, Some(Bytes::from(format!("value_{}", i))));
            assert!(started.elapsed() < secondary_timeout);
        }
        assert_eq!(secondary.calls(), 20);

        for _ in 0..20 {
            let event = events.recv().await.unwrap();
            assert_eq!(event.outcome, DualReadOutcome::SecondaryTimedOut);
        }
        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.found, 20);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(
            client.metrics().dual_read_outcomes.get(["secondary_timed_out"]),
            20
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_secondary_mismatch_is_only_observed() {
        let cluster = base_cluster();
        cluster.add_version(STORE, 1, 1);
        cluster.set_replicas(STORE, 1, 0, vec![endpoint(8001)]);
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        transport.put("users_v1", "key_1", 1, "primary");
        let secondary = Arc::new(MockSecondary::new());
        secondary.put("key_1", "secondary");

        let (events_tx, mut events) = mpsc::channel(8);
        let client = StoreClient::builder(ClientConfig::new(STORE).with_dual_read_enabled(true))
            .with_sources(cluster.clone(), cluster.clone())
            .with_transport(transport.clone())
            .with_secondary(secondary)
            .with_dual_read_events(events_tx)
            .build()
            .unwrap();
        client.start().await.unwrap();

        assert_eq!(
            client.get("key_1").await.unwrap(),
            Some(Bytes::from_static(b"primary"))
        );
        assert_eq!(events.recv().await.unwrap().outcome, DualReadOutcome::Mismatch);
        assert_eq!(client.metrics().snapshot().dual_read_mismatches, 1);
        client.close().await;
    }

    #[tokio::test]
    async fn test_batch_get_reports_per_key_outcomes() {
        let cluster = base_cluster();
        cluster.add_version(STORE, 1, 4);
        for p in 0..3 {
            cluster.set_replicas(STORE, 1, p, vec![endpoint(8001), endpoint(8002)]);
        }
        // Partition 3 has no ready replica.
        cluster.set_current_version(STORE, 1);

        let transport = Arc::new(MockTransport::new());
        let resource = compose_resource_name(STORE, 1);
        let keys: Vec<String> = (0..40).map(|i| format!("key_{}", i)).collect();
        for key in keys.iter().take(30) {
            transport.put(&resource, key.clone(), 1, format!("value_of_{}", key));
        }

        let client = build(ClientConfig::new(STORE), &cluster, &transport);
        client.start().await.unwrap();

        let mut request: Vec<String> = keys.clone();
        request.push("key_0".to_string());
        let response = client.batch_get(request).await.unwrap();
        assert_eq!(response.len(), 40);

        let partitioner = Partitioner::default();
        for (i, key) in keys.iter().enumerate() {
            let outcome = response.get(key.as_bytes()).unwrap();
            if partitioner.partition(key.as_bytes(), 4) == 3 {
                assert!(matches!(outcome, Err(Error::NoAvailableReplica { partition: 3, .. })));
            } else if i < 30 {
                assert_eq!(
                    response.value(key.as_bytes()),
                    Some(&Bytes::from(format!("value_of_{}", key)))
                );
            } else {
                assert!(matches!(outcome, Ok(None)));
            }
        }
        assert_eq!(
            response.found() + response.absent() + response.failed().count(),
            40
        );

        let snapshot = client.metrics().snapshot();
        assert_eq!(snapshot.gets, 40);
        assert_eq!(client.metrics().batch_keys.get(), 40);
        client.close().await;
    }

    #[tokio::test]
    async fn test_batch_get_empty_and_unstarted() {
        let cluster = base_cluster();
        cluster.add_version(STORE, 1, 1);
        cluster.set_current_version(STORE, 1);
        let transport = Arc::new(MockTransport::new());
        let client = build(ClientConfig::new(STORE), &cluster, &transport);

        assert!(matches!(
            client.batch_get(vec!["key_1"]).await,
            Err(Error::NotStarted)
        ));

        client.start().await.unwrap();
        let response = client.batch_get(Vec::<Bytes>::new()).await.unwrap();
        assert!(response.is_empty());
        assert_eq!(transport.total_calls(), 0);
        client.close().await;
    }
}
