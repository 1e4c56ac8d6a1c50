//! Client runtime.
//!
//! [`ClusterClient`] presents every device of every compute node in the node
//! list as one platform. Objects are created as proxies: the client mints the
//! identifier, forwards the create to the node(s) hosting the devices involved
//! and keeps a local record naming those hosts. Later calls are routed by the
//! record.
//!
//! Events created by a marker live on the queue's node; the client tracks them
//! through `EventStatusChanged` notifications. When a wait list names an event
//! hosted elsewhere (or a user event owned by the client), the event is first
//! mirrored onto the waiting node with `CreateEvent` and the client relays its
//! updates there.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::Instrument;

use crate::fabric::{
    BuildListener, BuildReport, ContextErrorListener, EventState, EventStatus, Fabric,
};
use crate::observability::{node_span, NodeRole};
use crate::protocol::{MessageKind, Notification, ProgramSource, Request, Response};
use crate::registry::{ObjectState, Registry, RemoteObject};
use crate::transport::{Connection, ConnectionTable, HandlerPool, MessageHandler, Peer, Router};
use crate::types::status::{self, info};
use crate::types::{
    load_node_list, Config, Error, IdMinter, NodeAddress, NodePrefix, ObjectId, ObjectKind,
    Result,
};

/// Applies notifications from compute nodes to the client's fabric.
#[derive(Debug)]
struct ClientService {
    fabric: Arc<Fabric>,
}

#[async_trait]
impl MessageHandler for ClientService {
    async fn handle_notification(&self, _conn: &Connection, notification: Notification) {
        self.fabric.apply(notification).await;
    }

    async fn on_disconnect(&self, conn: &Connection) {
        self.fabric.drop_peer(conn.peer());
    }
}

pub struct ClusterClient {
    minter: IdMinter,
    registry: Arc<Registry>,
    fabric: Arc<Fabric>,
    table: Arc<ConnectionTable>,
    /// Compute node id → endpoint, in node-list order.
    peers: Vec<(ObjectId, Arc<Peer>)>,
    devices: Vec<ObjectId>,
    /// Nodes an event has been mirrored onto with `CreateEvent`.
    mirrors: Mutex<HashMap<ObjectId, HashSet<ObjectId>>>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("prefix", &self.minter.prefix())
            .field("nodes", &self.peers.len())
            .field("devices", &self.devices)
            .finish()
    }
}

impl ClusterClient {
    /// Connect to every node in `config.node.node_list`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let path = config
            .node
            .node_list
            .as_deref()
            .ok_or_else(|| Error::config("node.node_list is not set"))?;
        let addresses = load_node_list(path)?;
        Self::connect_to(&addresses, config).await
    }

    /// Connect to `addresses` and discover their devices.
    ///
    /// The client mints identifiers under `config.node.node_id`, which must
    /// differ from every compute node's.
    pub async fn connect_to(addresses: &[NodeAddress], config: &Config) -> Result<Self> {
        if addresses.is_empty() {
            return Err(Error::config("node list is empty"));
        }
        let prefix = NodePrefix(config.node.node_id);
        let table = Arc::new(ConnectionTable::new());
        let fabric = Arc::new(Fabric::new(table.clone(), &config.fabric));
        let registry = Arc::new(Registry::with_teardown(fabric.clone()));

        let service = Arc::new(ClientService {
            fabric: fabric.clone(),
        });
        let router: Arc<dyn MessageHandler> = Arc::new(
            Router::new()
                .on(MessageKind::EventStatusChanged, service.clone())
                .on(MessageKind::ContextError, service.clone())
                .on(MessageKind::ProgramBuildComplete, service.clone())
                .observe_disconnect(service),
        );
        let pool = HandlerPool::new(config.transport.handler_workers);
        let span = node_span(NodeRole::Client, prefix);

        let mut client = Self {
            minter: IdMinter::new(prefix),
            registry,
            fabric,
            table,
            peers: Vec::with_capacity(addresses.len()),
            devices: Vec::new(),
            mirrors: Mutex::new(HashMap::new()),
        };

        for address in addresses {
            let peer = Peer::connect(
                address.clone(),
                prefix,
                router.clone(),
                pool.clone(),
                client.table.clone(),
                config.transport.clone(),
            )
            .instrument(span.clone())
            .await?;
            let node = client.minter.mint()?;
            client.registry.register(RemoteObject::proxy(
                node,
                ObjectState::ComputeNode {
                    address: address.to_string(),
                },
                vec![],
            ))?;
            client.peers.push((node, peer.clone()));

            let ids = match peer.request(Request::GetDeviceIds).await? {
                Response::DeviceIds(ids) => ids,
                other => return Err(unexpected(MessageKind::GetDeviceIds, &other)),
            };
            for device in ids {
                let name = match peer
                    .request(Request::GetInfo {
                        target_kind: ObjectKind::Device,
                        target: device,
                        param: info::DEVICE_NAME,
                    })
                    .await?
                {
                    Response::Info(raw) => String::from_utf8_lossy(&raw).into_owned(),
                    _ => String::new(),
                };
                client
                    .registry
                    .register(RemoteObject::proxy(
                        device,
                        ObjectState::Device { node, name },
                        vec![node],
                    ))
                    .map_err(|e| match e {
                        Error::Duplicate(id) => Error::config(format!(
                            "device {} reported twice; node ids must be unique",
                            id
                        )),
                        other => other,
                    })?;
                client.devices.push(device);
            }
            tracing::info!(%node, %address, "compute node attached");
        }
        Ok(client)
    }

    /// Every device across the cluster, in node-list order.
    pub fn devices(&self) -> &[ObjectId] {
        &self.devices
    }

    pub fn device_name(&self, device: ObjectId) -> Option<String> {
        match self.registry.lookup(device)?.state.clone() {
            ObjectState::Device { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Compute node hosting `device`.
    pub fn node_of(&self, device: ObjectId) -> Result<ObjectId> {
        match &self.registry.lookup_kind(device, ObjectKind::Device)?.state {
            ObjectState::Device { node, .. } => Ok(*node),
            _ => Err(Error::invalid_object(device, ObjectKind::Device)),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    fn peer(&self, node: ObjectId) -> Result<&Arc<Peer>> {
        self.peers
            .iter()
            .find(|(id, _)| *id == node)
            .map(|(_, peer)| peer)
            .ok_or_else(|| Error::invalid_object(node, ObjectKind::ComputeNode))
    }

    async fn request(&self, node: ObjectId, request: Request) -> Result<Response> {
        self.peer(node)?.request(request).await
    }

    async fn exchange(&self, node: ObjectId, request: Request) -> Result<(Connection, Response)> {
        self.peer(node)?.exchange(request).await
    }

    /// Send one request per host concurrently; the first failure wins.
    async fn fan_out(
        &self,
        hosts: &[ObjectId],
        make: impl Fn(ObjectId) -> Request,
    ) -> (Vec<ObjectId>, Option<Error>) {
        let calls = hosts.iter().map(|node| {
            let request = make(*node);
            async move { (*node, self.request(*node, request).await) }
        });
        let mut succeeded = Vec::new();
        let mut failure = None;
        for (node, result) in join_all(calls).await {
            match result {
                Ok(_) => succeeded.push(node),
                Err(e) => {
                    tracing::debug!(%node, "request failed: {}", e);
                    failure.get_or_insert(e);
                }
            }
        }
        (succeeded, failure)
    }

    /// Create an object on every host; on partial failure the hosts that
    /// succeeded are told to delete it again.
    async fn create_on(
        &self,
        hosts: Vec<ObjectId>,
        state: ObjectState,
        make: impl Fn(ObjectId, ObjectId) -> Request,
        delete: impl Fn(ObjectId) -> Request,
    ) -> Result<ObjectId> {
        let id = self.minter.mint()?;
        let (succeeded, failure) = self.fan_out(&hosts, |node| make(node, id)).await;
        if let Some(e) = failure {
            self.fan_out(&succeeded, |_| delete(id)).await;
            return Err(e);
        }
        self.registry.register(RemoteObject::proxy(id, state, hosts))?;
        Ok(id)
    }

    fn hosts_of(&self, id: ObjectId, kind: ObjectKind) -> Result<(Arc<RemoteObject>, Vec<ObjectId>)> {
        let record = self.registry.lookup_kind(id, kind)?;
        let hosts = record.hosts.clone();
        Ok((record, hosts))
    }

    // ---- contexts ----------------------------------------------------------

    /// Create a context over `devices`, possibly spanning several nodes.
    pub async fn create_context(
        &self,
        devices: &[ObjectId],
        listener: Option<Arc<dyn ContextErrorListener>>,
    ) -> Result<ObjectId> {
        if devices.is_empty() {
            return Err(Error::validation("a context needs at least one device"));
        }
        let mut by_node: Vec<(ObjectId, Vec<ObjectId>)> = Vec::new();
        for device in devices {
            let node = self.node_of(*device)?;
            match by_node.iter_mut().find(|(n, _)| *n == node) {
                Some((_, list)) => list.push(*device),
                None => by_node.push((node, vec![*device])),
            }
        }
        let hosts: Vec<ObjectId> = by_node.iter().map(|(node, _)| *node).collect();

        let context = self
            .create_on(
                hosts,
                ObjectState::Context {
                    devices: devices.to_vec(),
                },
                |node, context| Request::CreateContext {
                    context,
                    devices: by_node
                        .iter()
                        .find(|(n, _)| *n == node)
                        .map(|(_, list)| list.clone())
                        .unwrap_or_default(),
                },
                |context| Request::DeleteContext { context },
            )
            .await?;
        if let Some(listener) = listener {
            self.fabric.context_errors.register(context, listener);
        }
        Ok(context)
    }

    fn context_devices(&self, context: ObjectId) -> Result<Vec<ObjectId>> {
        match &self.registry.lookup_kind(context, ObjectKind::Context)?.state {
            ObjectState::Context { devices } => Ok(devices.clone()),
            _ => Err(Error::invalid_object(context, ObjectKind::Context)),
        }
    }

    pub async fn release_context(&self, context: ObjectId) -> Result<()> {
        self.release(context, ObjectKind::Context, |context| Request::DeleteContext { context })
            .await
    }

    // ---- command queues ----------------------------------------------------

    pub async fn create_command_queue(
        &self,
        context: ObjectId,
        device: ObjectId,
        properties: u64,
    ) -> Result<ObjectId> {
        if !self.context_devices(context)?.contains(&device) {
            return Err(Error::invalid_object(device, ObjectKind::Device));
        }
        let node = self.node_of(device)?;
        self.create_on(
            vec![node],
            ObjectState::CommandQueue { context, device },
            |_, queue| Request::CreateCommandQueue {
                queue,
                context,
                device,
                properties,
            },
            |queue| Request::DeleteCommandQueue { queue },
        )
        .await
    }

    fn queue_home(&self, queue: ObjectId) -> Result<(ObjectId, ObjectId)> {
        let (record, hosts) = self.hosts_of(queue, ObjectKind::CommandQueue)?;
        let context = record
            .state
            .context()
            .ok_or_else(|| Error::invalid_object(queue, ObjectKind::CommandQueue))?;
        let node = hosts
            .first()
            .copied()
            .ok_or_else(|| Error::invalid_object(queue, ObjectKind::CommandQueue))?;
        Ok((node, context))
    }

    pub async fn flush(&self, queue: ObjectId) -> Result<()> {
        let (node, _) = self.queue_home(queue)?;
        self.request(node, Request::Flush { queue }).await?;
        Ok(())
    }

    pub async fn release_command_queue(&self, queue: ObjectId) -> Result<()> {
        self.release(queue, ObjectKind::CommandQueue, |queue| Request::DeleteCommandQueue { queue })
            .await
    }

    // ---- buffers -----------------------------------------------------------

    pub async fn create_buffer(&self, context: ObjectId, flags: u64, size: u64) -> Result<ObjectId> {
        let (_, hosts) = self.hosts_of(context, ObjectKind::Context)?;
        self.create_on(
            hosts,
            ObjectState::Buffer {
                context,
                flags,
                size,
            },
            |_, buffer| Request::CreateBuffer {
                buffer,
                context,
                flags,
                size,
            },
            |buffer| Request::DeleteBuffer { buffer },
        )
        .await
    }

    pub async fn release_buffer(&self, buffer: ObjectId) -> Result<()> {
        self.release(buffer, ObjectKind::Buffer, |buffer| Request::DeleteBuffer { buffer })
            .await
    }

    // ---- programs ----------------------------------------------------------

    pub async fn create_program_with_source(&self, context: ObjectId, source: &str) -> Result<ObjectId> {
        self.create_program(context, ProgramSource::Source(source.to_string()))
            .await
    }

    pub async fn create_program_with_binary(&self, context: ObjectId, binary: Bytes) -> Result<ObjectId> {
        self.create_program(context, ProgramSource::Binary(binary))
            .await
    }

    async fn create_program(&self, context: ObjectId, source: ProgramSource) -> Result<ObjectId> {
        let (_, hosts) = self.hosts_of(context, ObjectKind::Context)?;
        self.create_on(
            hosts,
            ObjectState::Program { context },
            |_, program| Request::CreateProgram {
                program,
                context,
                source: source.clone(),
            },
            |program| Request::DeleteProgram { program },
        )
        .await
    }

    /// Build `program` for `devices` (every device of its context when
    /// `None`). Returns once every node accepted the build; `listener` fires
    /// exactly once when all devices have reported.
    pub async fn build_program(
        &self,
        program: ObjectId,
        devices: Option<&[ObjectId]>,
        options: &str,
        listener: Arc<dyn BuildListener>,
    ) -> Result<()> {
        let record = self.registry.lookup_kind(program, ObjectKind::Program)?;
        let context = record
            .state
            .context()
            .ok_or_else(|| Error::invalid_object(program, ObjectKind::Program))?;
        let context_devices = self.context_devices(context)?;
        let devices = match devices {
            Some(devices) => devices.to_vec(),
            None => context_devices.clone(),
        };
        if devices.is_empty() {
            return Err(Error::validation("no devices to build for"));
        }

        let mut by_node: Vec<(ObjectId, Vec<ObjectId>)> = Vec::new();
        let mut expected = Vec::with_capacity(devices.len());
        for device in &devices {
            if !context_devices.contains(device) {
                return Err(Error::invalid_object(*device, ObjectKind::Device));
            }
            let node = self.node_of(*device)?;
            let peer = self.peer(node)?.connection().await?.peer();
            expected.push((*device, peer));
            match by_node.iter_mut().find(|(n, _)| *n == node) {
                Some((_, list)) => list.push(*device),
                None => by_node.push((node, vec![*device])),
            }
        }

        // Registered before any request goes out so no report can be missed.
        self.fabric.builds.begin(program, expected, listener)?;
        for (node, node_devices) in by_node {
            let request = Request::BuildProgram {
                program,
                devices: node_devices.clone(),
                options: options.to_string(),
            };
            match self.exchange(node, request).await {
                Ok((carrier, _)) => {
                    // A reconnect may have carried the request; reports and
                    // connection loss are then seen on the new connection.
                    let builds = &self.fabric.builds;
                    if builds.rebind(program, &node_devices, carrier.peer()) > 0 && carrier.is_closed() {
                        builds.fail_devices(program, &node_devices, status::CONNECTION_LOST);
                    }
                }
                Err(e) => {
                    tracing::warn!(%program, %node, "build request rejected: {}", e);
                    self.fabric
                        .builds
                        .fail_devices(program, &node_devices, e.to_status_code());
                }
            }
        }
        Ok(())
    }

    /// Build and wait for the aggregated report.
    pub async fn build_program_blocking(
        &self,
        program: ObjectId,
        devices: Option<&[ObjectId]>,
        options: &str,
    ) -> Result<BuildReport> {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let listener = move |report: &BuildReport| {
            if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                let _ = tx.send(report.clone());
            }
        };
        self.build_program(program, devices, options, Arc::new(listener))
            .await?;
        rx.await
            .map_err(|_| Error::internal(format!("build of {} was cancelled", program)))
    }

    pub async fn release_program(&self, program: ObjectId) -> Result<()> {
        self.release(program, ObjectKind::Program, |program| Request::DeleteProgram { program })
            .await
    }

    // ---- kernels -----------------------------------------------------------

    pub async fn create_kernel(&self, program: ObjectId, name: &str) -> Result<ObjectId> {
        let (_, hosts) = self.hosts_of(program, ObjectKind::Program)?;
        self.create_on(
            hosts,
            ObjectState::Kernel {
                program,
                name: name.to_string(),
            },
            |_, kernel| Request::CreateKernel {
                kernel,
                program,
                name: name.to_string(),
            },
            |kernel| Request::DeleteKernel { kernel },
        )
        .await
    }

    pub async fn set_kernel_arg_memory(&self, kernel: ObjectId, index: u32, memory: ObjectId) -> Result<()> {
        self.registry.lookup_kind(memory, ObjectKind::Buffer)?;
        let (_, hosts) = self.hosts_of(kernel, ObjectKind::Kernel)?;
        let (_, failure) = self
            .fan_out(&hosts, |_| Request::SetKernelArgMemory {
                kernel,
                index,
                memory,
            })
            .await;
        failure.map_or(Ok(()), Err)
    }

    pub async fn set_kernel_arg_value(&self, kernel: ObjectId, index: u32, value: Bytes) -> Result<()> {
        let (_, hosts) = self.hosts_of(kernel, ObjectKind::Kernel)?;
        let (_, failure) = self
            .fan_out(&hosts, |_| Request::SetKernelArgValue {
                kernel,
                index,
                value: value.clone(),
            })
            .await;
        failure.map_or(Ok(()), Err)
    }

    pub async fn release_kernel(&self, kernel: ObjectId) -> Result<()> {
        self.release(kernel, ObjectKind::Kernel, |kernel| Request::DeleteKernel { kernel })
            .await
    }

    // ---- events ------------------------------------------------------------

    /// Create a user event owned by this client, in QUEUED.
    pub fn create_user_event(&self, context: ObjectId) -> Result<ObjectId> {
        self.registry.lookup_kind(context, ObjectKind::Context)?;
        let event = self.minter.mint()?;
        self.fabric.events.create_local(event, context)?;
        self.registry.register(RemoteObject::proxy(
            event,
            ObjectState::Event {
                context,
                user: true,
            },
            vec![],
        ))?;
        Ok(event)
    }

    /// Complete (`0`) or fail (negative `status`) a user event. Every node the
    /// event was mirrored onto is notified.
    pub async fn set_user_event_status(&self, event: ObjectId, status: i32) -> Result<()> {
        match &self.registry.lookup_kind(event, ObjectKind::Event)?.state {
            ObjectState::Event { user: true, .. } => {}
            _ => return Err(Error::invalid_object(event, ObjectKind::Event)),
        }
        let (state, exit_code) = match status {
            0 => (EventState::Complete, 0),
            code if code < 0 => (EventState::Error, code),
            code => {
                return Err(Error::validation(format!(
                    "user event status must be 0 or negative, got {}",
                    code
                )))
            }
        };
        self.fabric.events.advance(event, state, exit_code).await?;
        Ok(())
    }

    /// Enqueue a marker on `queue` and return its event.
    pub async fn enqueue_marker(&self, queue: ObjectId) -> Result<ObjectId> {
        let (node, context) = self.queue_home(queue)?;
        let event = self.minter.mint()?;
        let conn = self.peer(node)?.connection().await?;

        // Tracked before the request so the first status change is not lost.
        self.fabric.events.track_remote(event, context, conn.peer())?;
        self.registry.register(RemoteObject::proxy(
            event,
            ObjectState::Event {
                context,
                user: false,
            },
            vec![node],
        ))?;
        let sent = conn
            .send_request(Request::EnqueueMarker { queue, event })
            .await
            .and_then(Response::into_result);
        if let Err(e) = sent {
            self.registry.release(event);
            return Err(e);
        }
        Ok(event)
    }

    /// Make later commands on `queue` wait for `events`, which may live on
    /// other nodes or be user events.
    pub async fn enqueue_wait_for_events(&self, queue: ObjectId, events: &[ObjectId]) -> Result<()> {
        if events.is_empty() {
            return Err(Error::validation("empty wait list"));
        }
        let (node, context) = self.queue_home(queue)?;
        for event in events {
            let record = self.registry.lookup_kind(*event, ObjectKind::Event)?;
            if record.state.context() != Some(context) {
                return Err(Error::invalid_object(context, ObjectKind::Context));
            }
            if !record.hosts.contains(&node) {
                self.mirror(*event, context, node).await?;
            }
        }
        self.request(
            node,
            Request::EnqueueWaitForEvents {
                queue,
                events: events.to_vec(),
            },
        )
        .await?;
        Ok(())
    }

    /// Make `event` known on `node` and relay its updates there.
    async fn mirror(&self, event: ObjectId, context: ObjectId, node: ObjectId) -> Result<()> {
        let already = self
            .mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&event)
            .is_some_and(|nodes| nodes.contains(&node));
        if already {
            return Ok(());
        }
        let conn = self.peer(node)?.connection().await?;
        conn.send_request(Request::CreateEvent {
            context,
            event,
            mem_objects: vec![],
        })
        .await?
        .into_result()?;
        self.fabric.events.attach_subscriber(event, conn.peer()).await?;
        self.mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event)
            .or_default()
            .insert(node);
        tracing::debug!(%event, %node, "event mirrored");
        Ok(())
    }

    /// Block until every event is terminal.
    ///
    /// Fails with `EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST` when any of
    /// them ended in ERROR.
    pub async fn wait_for_events(&self, events: &[ObjectId]) -> Result<()> {
        for event in events {
            self.registry.lookup_kind(*event, ObjectKind::Event)?;
        }
        let statuses = self.fabric.events.wait_all(events).await?;
        if statuses.iter().any(|s| s.state == EventState::Error) {
            return Err(Error::Remote(status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST));
        }
        Ok(())
    }

    pub fn event_status(&self, event: ObjectId) -> Result<EventStatus> {
        self.registry.lookup_kind(event, ObjectKind::Event)?;
        self.fabric
            .events
            .status(event)
            .ok_or_else(|| Error::invalid_object(event, ObjectKind::Event))
    }

    pub async fn release_event(&self, event: ObjectId) -> Result<()> {
        self.release(event, ObjectKind::Event, |event| Request::DeleteEvent { event })
            .await
    }

    // ---- info --------------------------------------------------------------

    /// Query an object attribute. Event status is answered locally.
    pub async fn get_info(&self, kind: ObjectKind, target: ObjectId, param: u32) -> Result<Bytes> {
        let record = self.registry.lookup_kind(target, kind)?;
        if kind == ObjectKind::Event && param == info::EVENT_COMMAND_EXECUTION_STATUS {
            let status = self.event_status(target)?;
            return Ok(Bytes::copy_from_slice(&status.to_cl_status().to_be_bytes()));
        }
        let node = match &record.state {
            ObjectState::Device { node, .. } => *node,
            _ => record
                .hosts
                .first()
                .copied()
                .ok_or_else(|| Error::invalid_object(target, kind))?,
        };
        match self
            .request(
                node,
                Request::GetInfo {
                    target_kind: kind,
                    target,
                    param,
                },
            )
            .await?
        {
            Response::Info(raw) => Ok(raw),
            other => Err(unexpected(MessageKind::GetInfo, &other)),
        }
    }

    // ---- release -----------------------------------------------------------

    async fn release(
        &self,
        id: ObjectId,
        kind: ObjectKind,
        delete: impl Fn(ObjectId) -> Request,
    ) -> Result<()> {
        let (_, mut hosts) = self.hosts_of(id, kind)?;
        if let Some(mirrored) = self
            .mirrors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
        {
            let extra: Vec<ObjectId> = mirrored
                .into_iter()
                .filter(|node| !hosts.contains(node))
                .collect();
            hosts.extend(extra);
        }
        let (_, failure) = self.fan_out(&hosts, |_| delete(id)).await;
        // The proxy goes away even if a node already lost the object.
        self.registry.release(id);
        failure.map_or(Ok(()), Err)
    }

    /// Close every node connection.
    pub async fn shutdown(&self) {
        for (_, peer) in &self.peers {
            peer.close().await;
        }
        self.table.close_all();
    }
}

fn unexpected(kind: MessageKind, response: &Response) -> Error {
    Error::protocol(format!("unexpected {:?} response to {:?}", response.kind(), kind))
}
