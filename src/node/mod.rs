//! Compute node: the daemon side of the cluster.
//!
//! Wires the registry, fabric, driver and transport together and serves
//! requests from clients.

mod backing;

use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

pub use backing::BackingService;

use crate::driver::{ComputeDriver, DeviceInfo, ReferenceDriver};
use crate::fabric::Fabric;
use crate::observability::{node_span, NodeRole};
use crate::protocol::MessageKind;
use crate::registry::{ObjectState, Registry, RemoteObject};
use crate::transport::{ConnectionTable, Router, Server};
use crate::types::{Config, Error, IdMinter, NodePrefix, ObjectId, Result};

pub struct ComputeNode {
    prefix: NodePrefix,
    registry: Arc<Registry>,
    fabric: Arc<Fabric>,
    driver: Arc<dyn ComputeDriver>,
    table: Arc<ConnectionTable>,
    server: Server,
}

impl std::fmt::Debug for ComputeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeNode")
            .field("prefix", &self.prefix)
            .field("server", &self.server)
            .field("registry", &self.registry)
            .finish()
    }
}

impl ComputeNode {
    /// Bind a node backed by the reference driver, one device per name in
    /// `config.node.devices`.
    pub async fn bind(config: &Config) -> Result<Self> {
        let prefix = NodePrefix(config.node.node_id);
        let minter = IdMinter::new(prefix);
        let devices = config
            .node
            .devices
            .iter()
            .map(|name| {
                Ok(DeviceInfo {
                    id: minter.mint()?,
                    name: name.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Self::with_driver(config, Arc::new(ReferenceDriver::new(devices))).await
    }

    /// Bind a node serving `driver`'s devices.
    pub async fn with_driver(config: &Config, driver: Arc<dyn ComputeDriver>) -> Result<Self> {
        let prefix = NodePrefix(config.node.node_id);
        let table = Arc::new(ConnectionTable::new());
        let fabric = Arc::new(Fabric::new(table.clone(), &config.fabric));
        let registry = Arc::new(Registry::with_teardown(fabric.clone()));

        for device in driver.devices() {
            registry.register(RemoteObject::backing(
                device.id,
                ObjectState::Device {
                    node: ObjectId::NULL,
                    name: device.name.clone(),
                },
                None,
            ))?;
            tracing::info!(device = %device.id, name = %device.name, "device available");
        }

        let service = Arc::new(BackingService::new(
            prefix,
            registry.clone(),
            fabric.clone(),
            driver.clone(),
            table.clone(),
        ));
        let router = Router::new()
            .on_all(MessageKind::requests(), service.clone())
            .on(MessageKind::EventStatusChanged, service.clone())
            .on(MessageKind::ContextError, service.clone())
            .on(MessageKind::ProgramBuildComplete, service.clone())
            .observe_disconnect(service);

        let server = Server::bind(
            &config.node.listen_addr,
            Arc::new(router),
            table.clone(),
            config.transport.clone(),
        )
        .await
        .map_err(|e| Error::config(format!("cannot bind {}: {}", config.node.listen_addr, e)))?;

        Ok(Self {
            prefix,
            registry,
            fabric,
            driver,
            table,
            server,
        })
    }

    pub fn prefix(&self) -> NodePrefix {
        self.prefix
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.server.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn driver(&self) -> &Arc<dyn ComputeDriver> {
        &self.driver
    }

    /// Connected peers.
    pub fn connections(&self) -> usize {
        self.table.len()
    }

    /// Serve until [`ComputeNode::shutdown`].
    pub async fn serve(&self) -> Result<()> {
        self.server
            .serve()
            .instrument(node_span(NodeRole::Compute, self.prefix))
            .await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}
