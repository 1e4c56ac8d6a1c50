//! Server-side handler: hosts backing objects on the local driver.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;

use crate::driver::{Barrier, ComputeDriver, ContextErrorReporter, EventReporter, KernelArg};
use crate::fabric::{EventState, Fabric};
use crate::protocol::{Notification, Request, Response, PROTOCOL_VERSION};
use crate::registry::{ObjectState, Registry, RemoteObject};
use crate::transport::{Connection, ConnectionTable, MessageHandler};
use crate::types::status::{self, info};
use crate::types::{Error, NodePrefix, ObjectId, ObjectKind, PeerId, Result};

/// Answers every request kind for the objects this node hosts.
pub struct BackingService {
    prefix: NodePrefix,
    registry: Arc<Registry>,
    fabric: Arc<Fabric>,
    driver: Arc<dyn ComputeDriver>,
    table: Arc<ConnectionTable>,
}

impl std::fmt::Debug for BackingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingService")
            .field("prefix", &self.prefix)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Forwards driver context errors to the client that created the context.
struct ContextErrorForwarder {
    table: Arc<ConnectionTable>,
    origin: PeerId,
    origin_node: Option<NodePrefix>,
}

impl ContextErrorForwarder {
    fn route(&self) -> Option<Connection> {
        if let Some(conn) = self.table.get(self.origin) {
            return Some(conn);
        }
        // The client may have reconnected under a new connection.
        let node = self.origin_node?;
        self.table
            .connections()
            .into_iter()
            .find(|conn| conn.remote_node() == Some(node))
    }
}

impl ContextErrorReporter for ContextErrorForwarder {
    fn report(&self, context: ObjectId, info: &str, private_info: &[u8]) {
        let Some(conn) = self.route() else {
            tracing::warn!(%context, "context error for disconnected client dropped: {}", info);
            return;
        };
        let notification = Notification::ContextError {
            context,
            info: info.to_string(),
            private_info: Bytes::copy_from_slice(private_info),
        };
        tokio::spawn(async move {
            if let Err(e) = conn.send_notification(notification).await {
                tracing::debug!(%context, "context error not delivered: {}", e);
            }
        });
    }
}

/// Feeds a marker's driver transitions into the event table.
struct MarkerReporter {
    fabric: Arc<Fabric>,
    event: ObjectId,
}

#[async_trait]
impl EventReporter for MarkerReporter {
    async fn transition(&self, state: EventState, exit_code: i32) {
        if let Err(e) = self.fabric.events.advance(self.event, state, exit_code).await {
            tracing::debug!(event = %self.event, "marker transition ignored: {}", e);
        }
    }
}

impl BackingService {
    pub fn new(
        prefix: NodePrefix,
        registry: Arc<Registry>,
        fabric: Arc<Fabric>,
        driver: Arc<dyn ComputeDriver>,
        table: Arc<ConnectionTable>,
    ) -> Self {
        Self {
            prefix,
            registry,
            fabric,
            driver,
            table,
        }
    }

    /// Register `record`, then run `create`; the record is removed again if
    /// the driver refuses.
    async fn create<F>(&self, record: RemoteObject, create: F) -> Result<Response>
    where
        F: Future<Output = crate::driver::DriverResult<()>>,
    {
        let id = record.id;
        let kind = record.kind();
        self.registry.register(record)?;
        if let Err(e) = create.await {
            self.registry.release(id);
            tracing::debug!(%id, %kind, code = e.0, "driver rejected create");
            return Err(e.into());
        }
        Ok(Response::Ok)
    }

    fn context_of(&self, object: ObjectId, kind: ObjectKind) -> Result<ObjectId> {
        self.registry
            .lookup_kind(object, kind)?
            .state
            .context()
            .ok_or_else(|| Error::internal(format!("{} has no context", object)))
    }

    async fn handle(&self, conn: &Connection, request: Request) -> Result<Response> {
        let origin = Some(conn.peer());
        match request {
            Request::Hello {
                node_id,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    tracing::warn!(
                        peer = %conn.peer(),
                        "protocol version {} rejected (expected {})",
                        protocol_version,
                        PROTOCOL_VERSION
                    );
                    return Err(Error::protocol(format!(
                        "unsupported protocol version {}",
                        protocol_version
                    )));
                }
                if node_id == self.prefix.0 {
                    return Err(Error::invalid_object(
                        ObjectId::compose(NodePrefix(node_id), 0),
                        ObjectKind::ComputeNode,
                    ));
                }
                conn.set_remote_node(NodePrefix(node_id));
                Ok(Response::Info(Bytes::copy_from_slice(&self.prefix.0.to_be_bytes())))
            }

            Request::GetDeviceIds => Ok(Response::DeviceIds(
                self.driver.devices().into_iter().map(|d| d.id).collect(),
            )),

            Request::CreateContext { context, devices } => {
                for device in &devices {
                    self.registry.lookup_kind(*device, ObjectKind::Device)?;
                }
                let reporter = Arc::new(ContextErrorForwarder {
                    table: self.table.clone(),
                    origin: conn.peer(),
                    origin_node: conn.remote_node(),
                });
                let record = RemoteObject::backing(
                    context,
                    ObjectState::Context {
                        devices: devices.clone(),
                    },
                    origin,
                );
                self.create(record, self.driver.create_context(context, &devices, reporter))
                    .await
            }

            Request::CreateCommandQueue {
                queue,
                context,
                device,
                properties,
            } => {
                self.registry.lookup_kind(context, ObjectKind::Context)?;
                self.registry.lookup_kind(device, ObjectKind::Device)?;
                let record = RemoteObject::backing(
                    queue,
                    ObjectState::CommandQueue { context, device },
                    origin,
                );
                self.create(
                    record,
                    self.driver.create_queue(queue, context, device, properties),
                )
                .await
            }

            Request::CreateBuffer {
                buffer,
                context,
                flags,
                size,
            } => {
                self.registry.lookup_kind(context, ObjectKind::Context)?;
                let record = RemoteObject::backing(
                    buffer,
                    ObjectState::Buffer {
                        context,
                        flags,
                        size,
                    },
                    origin,
                );
                self.create(record, self.driver.create_buffer(buffer, context, flags, size))
                    .await
            }

            Request::CreateProgram {
                program,
                context,
                source,
            } => {
                self.registry.lookup_kind(context, ObjectKind::Context)?;
                let record = RemoteObject::backing(program, ObjectState::Program { context }, origin);
                self.create(record, self.driver.create_program(program, context, &source))
                    .await
            }

            Request::BuildProgram {
                program,
                devices,
                options,
            } => {
                self.registry.lookup_kind(program, ObjectKind::Program)?;
                for device in &devices {
                    self.registry.lookup_kind(*device, ObjectKind::Device)?;
                }
                // Accepted; each device reports on its own when done.
                for device in devices {
                    let driver = self.driver.clone();
                    let conn = conn.clone();
                    let options = options.clone();
                    tokio::spawn(async move {
                        let status = driver.build_program(program, device, &options).await;
                        let notification = Notification::ProgramBuildComplete {
                            program,
                            device,
                            status,
                        };
                        if let Err(e) = conn.send_notification(notification).await {
                            tracing::debug!(%program, %device, "build result not delivered: {}", e);
                        }
                    });
                }
                Ok(Response::Ok)
            }

            Request::CreateKernel {
                kernel,
                program,
                name,
            } => {
                self.registry.lookup_kind(program, ObjectKind::Program)?;
                let record = RemoteObject::backing(
                    kernel,
                    ObjectState::Kernel {
                        program,
                        name: name.clone(),
                    },
                    origin,
                );
                self.create(record, self.driver.create_kernel(kernel, program, &name))
                    .await
            }

            Request::SetKernelArgMemory {
                kernel,
                index,
                memory,
            } => {
                self.registry.lookup_kind(kernel, ObjectKind::Kernel)?;
                self.registry.lookup_kind(memory, ObjectKind::Buffer)?;
                self.driver
                    .set_kernel_arg(kernel, index, KernelArg::Memory(memory))
                    .await?;
                Ok(Response::Ok)
            }

            Request::SetKernelArgValue {
                kernel,
                index,
                value,
            } => {
                self.registry.lookup_kind(kernel, ObjectKind::Kernel)?;
                self.driver
                    .set_kernel_arg(kernel, index, KernelArg::Value(value))
                    .await?;
                Ok(Response::Ok)
            }

            Request::CreateEvent {
                context,
                event,
                mem_objects,
            } => {
                self.registry.lookup_kind(context, ObjectKind::Context)?;
                for memory in &mem_objects {
                    self.registry.lookup_kind(*memory, ObjectKind::Buffer)?;
                }
                // The requester owns this event and drives it with
                // EventStatusChanged notifications.
                let record = RemoteObject::backing(
                    event,
                    ObjectState::Event {
                        context,
                        user: true,
                    },
                    origin,
                );
                self.registry.register(record)?;
                if let Err(e) = self.fabric.events.track_remote(event, context, conn.peer()) {
                    self.registry.release(event);
                    return Err(e);
                }
                if let Err(e) = self.driver.create_user_event(event, context).await {
                    self.registry.release(event);
                    return Err(e.into());
                }
                Ok(Response::Ok)
            }

            Request::SubscribeEvent { event } => {
                self.registry.lookup_kind(event, ObjectKind::Event)?;
                let status = self.fabric.events.subscribe(event, conn.peer())?;
                Ok(Response::EventStatus {
                    state: status.state,
                    exit_code: status.exit_code,
                })
            }

            Request::EnqueueMarker { queue, event } => {
                let context = self.context_of(queue, ObjectKind::CommandQueue)?;
                let record = RemoteObject::backing(
                    event,
                    ObjectState::Event {
                        context,
                        user: false,
                    },
                    origin,
                );
                self.registry.register(record)?;
                if let Err(e) = self.fabric.events.create_local(event, context) {
                    self.registry.release(event);
                    return Err(e);
                }
                // The requester hears about every transition.
                self.fabric.events.subscribe(event, conn.peer())?;

                let reporter = Arc::new(MarkerReporter {
                    fabric: self.fabric.clone(),
                    event,
                });
                if let Err(e) = self.driver.enqueue_marker(queue, event, reporter).await {
                    self.registry.release(event);
                    return Err(e.into());
                }
                Ok(Response::Ok)
            }

            Request::EnqueueWaitForEvents { queue, events } => {
                self.registry.lookup_kind(queue, ObjectKind::CommandQueue)?;
                for event in &events {
                    self.registry.lookup_kind(*event, ObjectKind::Event)?;
                }
                let fabric = self.fabric.clone();
                let barrier: Barrier = Box::pin(async move {
                    match fabric.events.wait_all(&events).await {
                        Ok(statuses) => match statuses.iter().find(|s| s.state == EventState::Error) {
                            Some(failed) => Err(failed.exit_code),
                            None => Ok(()),
                        },
                        Err(e) => Err(e.to_status_code()),
                    }
                });
                self.driver.enqueue_barrier(queue, barrier).await?;
                Ok(Response::Ok)
            }

            Request::Flush { queue } => {
                self.registry.lookup_kind(queue, ObjectKind::CommandQueue)?;
                self.driver.flush(queue).await?;
                Ok(Response::Ok)
            }

            Request::DeleteKernel { kernel } => {
                self.registry.lookup_kind(kernel, ObjectKind::Kernel)?;
                self.driver.release_kernel(kernel).await?;
                self.registry.release(kernel);
                Ok(Response::Ok)
            }

            Request::DeleteProgram { program } => {
                self.registry.lookup_kind(program, ObjectKind::Program)?;
                self.driver.release_program(program).await?;
                self.registry.release(program);
                Ok(Response::Ok)
            }

            Request::DeleteBuffer { buffer } => {
                self.registry.lookup_kind(buffer, ObjectKind::Buffer)?;
                self.driver.release_buffer(buffer).await?;
                self.registry.release(buffer);
                Ok(Response::Ok)
            }

            Request::DeleteCommandQueue { queue } => {
                self.registry.lookup_kind(queue, ObjectKind::CommandQueue)?;
                self.driver.release_queue(queue).await?;
                self.registry.release(queue);
                Ok(Response::Ok)
            }

            Request::DeleteContext { context } => {
                self.registry.lookup_kind(context, ObjectKind::Context)?;
                self.driver.release_context(context).await?;
                self.registry.release(context);
                Ok(Response::Ok)
            }

            Request::DeleteEvent { event } => {
                self.registry.lookup_kind(event, ObjectKind::Event)?;
                self.driver.release_event(event).await?;
                self.registry.release(event);
                Ok(Response::Ok)
            }

            Request::GetInfo {
                target_kind,
                target,
                param,
            } => {
                let record = self.registry.lookup_kind(target, target_kind)?;
                match record.state {
                    ObjectState::Event { context, .. } => {
                        let status = self
                            .fabric
                            .events
                            .status(target)
                            .ok_or_else(|| Error::invalid_object(target, ObjectKind::Event))?;
                        match param {
                            info::EVENT_COMMAND_EXECUTION_STATUS => Ok(Response::Info(
                                Bytes::copy_from_slice(&status.to_cl_status().to_be_bytes()),
                            )),
                            info::EVENT_CONTEXT => Ok(Response::Info(Bytes::copy_from_slice(
                                &context.as_u64().to_be_bytes(),
                            ))),
                            _ => Ok(Response::Error(status::INVALID_VALUE)),
                        }
                    }
                    _ => Ok(Response::Info(
                        self.driver.get_info(target_kind, target, param).await?,
                    )),
                }
            }
        }
    }

    /// Mirror a terminal user-event status into the driver.
    async fn sync_user_event(&self, event: ObjectId) {
        let is_user = matches!(
            self.registry.lookup(event).map(|r| r.state.clone()),
            Some(ObjectState::Event { user: true, .. })
        );
        let Some(status) = self.fabric.events.status(event) else {
            return;
        };
        if !is_user || !status.state.is_terminal() {
            return;
        }
        let code = match status.state {
            EventState::Complete => status::SUCCESS,
            _ => status.exit_code,
        };
        if let Err(e) = self.driver.set_user_event_status(event, code).await {
            tracing::debug!(%event, "driver user event not updated: {}", e);
        }
    }
}

#[async_trait]
impl MessageHandler for BackingService {
    async fn handle_request(&self, conn: &Connection, request: Request) -> Response {
        let kind = request.kind();
        match self.handle(conn, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(peer = %conn.peer(), ?kind, "request failed: {}", e);
                Response::Error(e.to_status_code())
            }
        }
    }

    async fn handle_notification(&self, conn: &Connection, notification: Notification) {
        match notification {
            Notification::EventStatusChanged { event, status } => {
                if self.fabric.events.apply_remote(event, status).await {
                    self.sync_user_event(event).await;
                }
            }
            other => {
                tracing::debug!(peer = %conn.peer(), kind = ?other.kind(), "unexpected notification on server dropped");
            }
        }
    }

    async fn on_disconnect(&self, conn: &Connection) {
        // Objects the client created stay; it may reconnect and keep using them.
        self.fabric.drop_peer(conn.peer());
    }
}
