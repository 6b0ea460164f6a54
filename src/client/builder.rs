//! Assembles a [`StoreClient`] from its parts.

use super::StoreClient;
use crate::config::ClientConfig;
use crate::dual_read::{DualReadEvent, DualReadValidator, SecondaryClient};
use crate::error::{Error, Result};
use crate::execution::ExecutionCoordinator;
use crate::metadata::{ClusterMetadataSource, MetadataRepository, SchemaSource, StoreMetadata};
use crate::metrics::ClientMetrics;
use crate::network::{PlainTcpConnector, StreamConnector, TcpTransport, Transport, TransportConfig};
use crate::routing::ReplicaSelector;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

enum MetadataSetup {
    Missing,
    Sources(Arc<dyn ClusterMetadataSource>, Arc<dyn SchemaSource>),
    Provided(Arc<dyn StoreMetadata>),
}

/// Builder for [`StoreClient`].
///
/// Metadata comes either from external sources, polled by a
/// [`MetadataRepository`], or from a ready [`StoreMetadata`]; the later call
/// wins. Without an explicit transport the client dials replicas with a
/// [`TcpTransport`].
pub struct StoreClientBuilder {
    config: ClientConfig,
    metadata: MetadataSetup,
    transport: Option<Arc<dyn Transport>>,
    transport_config: TransportConfig,
    connector: Option<Arc<dyn StreamConnector>>,
    secondary: Option<Arc<dyn SecondaryClient>>,
    dual_read_events: Option<mpsc::Sender<DualReadEvent>>,
}

impl StoreClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            metadata: MetadataSetup::Missing,
            transport: None,
            transport_config: TransportConfig::default(),
            connector: None,
            secondary: None,
            dual_read_events: None,
        }
    }

    /// Poll metadata and schemas from these sources.
    pub fn with_sources(
        mut self,
        cluster: Arc<dyn ClusterMetadataSource>,
        schemas: Arc<dyn SchemaSource>,
    ) -> Self {
        self.metadata = MetadataSetup::Sources(cluster, schemas);
        self
    }

    /// Use metadata maintained elsewhere, e.g. a [`StaticStoreMetadata`](crate::metadata::StaticStoreMetadata).
    pub fn with_metadata(mut self, metadata: Arc<dyn StoreMetadata>) -> Self {
        self.metadata = MetadataSetup::Provided(metadata);
        self
    }

    /// Replace the TCP transport altogether.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_transport_config(mut self, config: TransportConfig) -> Self {
        self.transport_config = config;
        self
    }

    /// Open replica connections through `connector`. Required for TLS.
    pub fn with_connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Client used for dual-path reads when they are enabled.
    pub fn with_secondary(mut self, secondary: Arc<dyn SecondaryClient>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    /// Publish dual-path comparisons on `events`.
    pub fn with_dual_read_events(mut self, events: mpsc::Sender<DualReadEvent>) -> Self {
        self.dual_read_events = Some(events);
        self
    }

    pub fn build(self) -> Result<StoreClient> {
        let config = self.config;
        config.validate()?;

        let metadata: Arc<dyn StoreMetadata> = match self.metadata {
            MetadataSetup::Provided(metadata) => metadata,
            MetadataSetup::Sources(cluster, schemas) => Arc::new(MetadataRepository::new(
                config.store_name.clone(),
                cluster,
                schemas,
                config.metadata.clone(),
            )),
            MetadataSetup::Missing => {
                return Err(Error::Config("no metadata source configured".into()));
            }
        };
        if metadata.store_name() != config.store_name {
            return Err(Error::Config(format!(
                "metadata is for store {}, client is for store {}",
                metadata.store_name(),
                config.store_name
            )));
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let connector: Arc<dyn StreamConnector> = match self.connector {
                    Some(connector) => connector,
                    None => Arc::new(PlainTcpConnector),
                };
                if config.tls.enabled && !connector.supports_tls() {
                    return Err(Error::Config(
                        "TLS is enabled but the stream connector does not provide it".into(),
                    ));
                }
                let transport_config = self.transport_config.with_secure(config.tls.enabled);
                Arc::new(TcpTransport::with_connector(transport_config, connector))
            }
        };

        let metrics = Arc::new(ClientMetrics::new());
        let selector = Arc::new(ReplicaSelector::new(config.selector.clone()));
        let coordinator = ExecutionCoordinator::new(transport, selector, metrics.clone(), &config);
        let shutdown = CancellationToken::new();

        let dual_read = if config.dual_read.enabled {
            let secondary = self.secondary.ok_or_else(|| {
                Error::Config("dual read is enabled but no secondary client is set".into())
            })?;
            let mut validator = DualReadValidator::new(
                secondary,
                &config.dual_read,
                metrics.clone(),
                shutdown.child_token(),
            );
            if let Some(events) = self.dual_read_events {
                validator = validator.with_events(events);
            }
            Some(validator)
        } else {
            if self.secondary.is_some() {
                debug!(store = %config.store_name, "Secondary client set but dual read is disabled");
            }
            None
        };

        Ok(StoreClient::from_parts(
            config,
            metadata,
            coordinator,
            dual_read,
            metrics,
            shutdown,
        ))
    }
}
