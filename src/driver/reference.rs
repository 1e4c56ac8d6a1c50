//! In-memory reference driver.
//!
//! Keeps every object in plain maps and runs one worker task per command
//! queue. Enqueued commands wait until the queue is flushed, then execute in
//! FIFO order. "Building" a program validates its options and discovers the
//! `__kernel` functions it declares.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use super::{
    Barrier, ClError, ComputeDriver, ContextErrorReporter, DeviceInfo, DriverResult,
    EventReporter, KernelArg,
};
use crate::fabric::EventState;
use crate::protocol::ProgramSource;
use crate::types::status::{self, info};
use crate::types::{ObjectId, ObjectKind};

/// `CL_SUBMITTED`: initial execution status of a user event.
const USER_EVENT_PENDING: i32 = 2;

enum QueueOp {
    Marker {
        event: ObjectId,
        reporter: Arc<dyn EventReporter>,
    },
    Barrier(Barrier),
    Flush,
}

struct ContextRec {
    devices: Vec<ObjectId>,
    errors: Arc<dyn ContextErrorReporter>,
}

struct QueueRec {
    context: ObjectId,
    device: ObjectId,
    ops: mpsc::UnboundedSender<QueueOp>,
}

struct BufferRec {
    flags: u64,
    size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct KernelSignature {
    name: String,
    params: usize,
}

struct ProgramRec {
    context: ObjectId,
    source: ProgramSource,
    builds: HashMap<ObjectId, i32>,
    kernels: Vec<KernelSignature>,
}

struct KernelRec {
    name: String,
    params: usize,
    args: HashMap<u32, KernelArg>,
}

struct UserEventRec {
    context: ObjectId,
    status: i32,
}

#[derive(Default)]
struct State {
    contexts: HashMap<ObjectId, ContextRec>,
    queues: HashMap<ObjectId, QueueRec>,
    buffers: HashMap<ObjectId, BufferRec>,
    programs: HashMap<ObjectId, ProgramRec>,
    kernels: HashMap<ObjectId, KernelRec>,
    user_events: HashMap<ObjectId, UserEventRec>,
}

pub struct ReferenceDriver {
    devices: Vec<DeviceInfo>,
    state: Mutex<State>,
    /// Devices whose builds fail with a fixed status.
    broken_builds: Mutex<HashMap<ObjectId, i32>>,
}

impl std::fmt::Debug for ReferenceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceDriver")
            .field("devices", &self.devices)
            .finish_non_exhaustive()
    }
}

impl ReferenceDriver {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            state: Mutex::new(State::default()),
            broken_builds: Mutex::new(HashMap::new()),
        }
    }

    /// Make every later build on `device` fail with `status`.
    pub fn fail_builds_on(&self, device: ObjectId, status: i32) {
        self.broken_builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device, status);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn has_device(&self, device: ObjectId) -> bool {
        self.devices.iter().any(|d| d.id == device)
    }

    /// Raise an asynchronous error on `context`, as a device fault would.
    pub fn inject_context_error(&self, context: ObjectId, info: &str, private_info: &[u8]) -> bool {
        let errors = match self.state().contexts.get(&context) {
            Some(rec) => rec.errors.clone(),
            None => return false,
        };
        errors.report(context, info, private_info);
        true
    }
}

fn not_found(kind: ObjectKind) -> ClError {
    ClError(kind.invalid_code())
}

/// Accepts `-D name[=value]`, `-I dir`, `-w`, `-Werror` and `-cl-*`.
fn validate_options(options: &str) -> std::result::Result<(), i32> {
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "-D" | "-I" => {
                if tokens.next().is_none() {
                    return Err(status::INVALID_BUILD_OPTIONS);
                }
            }
            "-w" | "-Werror" => {}
            t if (t.starts_with("-D") || t.starts_with("-I")) && t.len() > 2 => {}
            t if t.starts_with("-cl-") => {}
            _ => return Err(status::INVALID_BUILD_OPTIONS),
        }
    }
    Ok(())
}

fn scan_kernels(source: &str) -> Vec<KernelSignature> {
    let mut kernels = Vec::new();
    for (pos, qualifier) in source.match_indices("__kernel") {
        let rest = source[pos + qualifier.len()..].trim_start();
        let Some(rest) = rest.strip_prefix("void") else {
            continue;
        };
        let rest = rest.trim_start();
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        if name.is_empty() {
            continue;
        }
        let Some(params) = rest[name.len()..].trim_start().strip_prefix('(') else {
            continue;
        };
        let Some(end) = params.find(')') else {
            continue;
        };
        let list = params[..end].trim();
        let params = if list.is_empty() || list == "void" {
            0
        } else {
            list.split(',').count()
        };
        kernels.push(KernelSignature { name, params });
    }
    kernels
}

fn source_text(source: &ProgramSource) -> Option<&str> {
    match source {
        ProgramSource::Source(text) => Some(text),
        // Reference "binaries" are UTF-8 source.
        ProgramSource::Binary(bytes) => std::str::from_utf8(bytes).ok(),
    }
}

fn u32_info(value: u32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn u64_info(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

fn i32_info(value: i32) -> Bytes {
    Bytes::copy_from_slice(&value.to_be_bytes())
}

async fn run_queue(queue: ObjectId, mut ops: mpsc::UnboundedReceiver<QueueOp>) {
    let mut pending: VecDeque<QueueOp> = VecDeque::new();
    // Set once a barrier fails; every later marker fails with it.
    let mut failed: Option<i32> = None;

    while let Some(op) = ops.recv().await {
        if !matches!(op, QueueOp::Flush) {
            pending.push_back(op);
            continue;
        }
        while let Some(op) = pending.pop_front() {
            match op {
                QueueOp::Marker { event, reporter } => match failed {
                    Some(code) => reporter.transition(EventState::Error, code).await,
                    None => {
                        reporter.transition(EventState::Submitted, 0).await;
                        reporter.transition(EventState::Running, 0).await;
                        reporter.transition(EventState::Complete, 0).await;
                        tracing::trace!(%queue, %event, "marker complete");
                    }
                },
                QueueOp::Barrier(barrier) => {
                    if let Err(code) = barrier.await {
                        tracing::debug!(%queue, code, "barrier failed, later commands will fail");
                        failed = Some(status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST);
                    }
                }
                QueueOp::Flush => {}
            }
        }
    }

    // Queue released with commands still waiting for a flush.
    for op in pending {
        if let QueueOp::Marker { reporter, .. } = op {
            reporter
                .transition(EventState::Error, status::INVALID_COMMAND_QUEUE)
                .await;
        }
    }
    tracing::debug!(%queue, "queue worker stopped");
}

#[async_trait]
impl ComputeDriver for ReferenceDriver {
    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    async fn create_context(
        &self,
        context: ObjectId,
        devices: &[ObjectId],
        errors: Arc<dyn ContextErrorReporter>,
    ) -> DriverResult<()> {
        if devices.is_empty() {
            return Err(ClError(status::INVALID_VALUE));
        }
        if let Some(device) = devices.iter().find(|d| !self.has_device(**d)) {
            tracing::debug!(%context, %device, "context names an unknown device");
            return Err(not_found(ObjectKind::Device));
        }
        self.state().contexts.insert(
            context,
            ContextRec {
                devices: devices.to_vec(),
                errors,
            },
        );
        Ok(())
    }

    async fn release_context(&self, context: ObjectId) -> DriverResult<()> {
        self.state()
            .contexts
            .remove(&context)
            .map(|_| ())
            .ok_or(not_found(ObjectKind::Context))
    }

    async fn create_queue(
        &self,
        queue: ObjectId,
        context: ObjectId,
        device: ObjectId,
        _properties: u64,
    ) -> DriverResult<()> {
        let mut state = self.state();
        let rec = state
            .contexts
            .get(&context)
            .ok_or(not_found(ObjectKind::Context))?;
        if !rec.devices.contains(&device) {
            return Err(not_found(ObjectKind::Device));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(queue, rx));
        state.queues.insert(
            queue,
            QueueRec {
                context,
                device,
                ops: tx,
            },
        );
        Ok(())
    }

    async fn release_queue(&self, queue: ObjectId) -> DriverResult<()> {
        // Dropping the sender stops the worker.
        self.state()
            .queues
            .remove(&queue)
            .map(|_| ())
            .ok_or(not_found(ObjectKind::CommandQueue))
    }

    async fn create_buffer(
        &self,
        buffer: ObjectId,
        context: ObjectId,
        flags: u64,
        size: u64,
    ) -> DriverResult<()> {
        if size == 0 {
            return Err(ClError(status::INVALID_BUFFER_SIZE));
        }
        let mut state = self.state();
        if !state.contexts.contains_key(&context) {
            return Err(not_found(ObjectKind::Context));
        }
        state.buffers.insert(buffer, BufferRec { flags, size });
        Ok(())
    }

    async fn release_buffer(&self, buffer: ObjectId) -> DriverResult<()> {
        self.state()
            .buffers
            .remove(&buffer)
            .map(|_| ())
            .ok_or(not_found(ObjectKind::Buffer))
    }

    async fn create_program(
        &self,
        program: ObjectId,
        context: ObjectId,
        source: &ProgramSource,
    ) -> DriverResult<()> {
        let empty = match source {
            ProgramSource::Source(text) => text.trim().is_empty(),
            ProgramSource::Binary(bytes) => bytes.is_empty(),
        };
        if empty {
            return Err(ClError(status::INVALID_VALUE));
        }
        let mut state = self.state();
        if !state.contexts.contains_key(&context) {
            return Err(not_found(ObjectKind::Context));
        }
        state.programs.insert(
            program,
            ProgramRec {
                context,
                source: source.clone(),
                builds: HashMap::new(),
                kernels: Vec::new(),
            },
        );
        Ok(())
    }

    async fn release_program(&self, program: ObjectId) -> DriverResult<()> {
        self.state()
            .programs
            .remove(&program)
            .map(|_| ())
            .ok_or(not_found(ObjectKind::Program))
    }

    async fn build_program(&self, program: ObjectId, device: ObjectId, options: &str) -> i32 {
        // Let other requests interleave with builds.
        tokio::task::yield_now().await;

        let mut guard = self.state();
        let state = &mut *guard;
        let Some(rec) = state.programs.get_mut(&program) else {
            return status::INVALID_PROGRAM;
        };
        let in_context = state
            .contexts
            .get(&rec.context)
            .is_some_and(|ctx| ctx.devices.contains(&device));
        if !in_context {
            return status::INVALID_DEVICE;
        }

        let broken = self
            .broken_builds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device)
            .copied();
        let result = match broken.map_or_else(|| validate_options(options), Err) {
            Err(code) => code,
            Ok(()) => match source_text(&rec.source) {
                Some(text) if !text.contains("#error") => {
                    rec.kernels = scan_kernels(text);
                    status::SUCCESS
                }
                _ => status::BUILD_PROGRAM_FAILURE,
            },
        };
        rec.builds.insert(device, result);
        tracing::debug!(%program, %device, result, "program built");
        result
    }

    async fn create_kernel(&self, kernel: ObjectId, program: ObjectId, name: &str) -> DriverResult<()> {
        let mut state = self.state();
        let rec = state
            .programs
            .get(&program)
            .ok_or(not_found(ObjectKind::Program))?;
        if !rec.builds.values().any(|status| *status == status::SUCCESS) {
            return Err(ClError(status::INVALID_PROGRAM_EXECUTABLE));
        }
        let signature = rec
            .kernels
            .iter()
            .find(|k| k.name == name)
            .cloned()
            .ok_or(ClError(status::INVALID_KERNEL_NAME))?;
        state.kernels.insert(
            kernel,
            KernelRec {
                name: signature.name,
                params: signature.params,
                args: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn release_kernel(&self, kernel: ObjectId) -> DriverResult<()> {
        self.state()
            .kernels
            .remove(&kernel)
            .map(|_| ())
            .ok_or(not_found(ObjectKind::Kernel))
    }

    async fn set_kernel_arg(&self, kernel: ObjectId, index: u32, arg: KernelArg) -> DriverResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        let rec = state
            .kernels
            .get_mut(&kernel)
            .ok_or(not_found(ObjectKind::Kernel))?;
        if index as usize >= rec.params {
            return Err(ClError(status::INVALID_ARG_INDEX));
        }
        if let KernelArg::Memory(buffer) = &arg {
            if !state.buffers.contains_key(buffer) {
                return Err(not_found(ObjectKind::Buffer));
            }
        }
        rec.args.insert(index, arg);
        Ok(())
    }

    async fn create_user_event(&self, event: ObjectId, context: ObjectId) -> DriverResult<()> {
        let mut state = self.state();
        if !state.contexts.contains_key(&context) {
            return Err(not_found(ObjectKind::Context));
        }
        state.user_events.insert(
            event,
            UserEventRec {
                context,
                status: USER_EVENT_PENDING,
            },
        );
        Ok(())
    }

    async fn set_user_event_status(&self, event: ObjectId, status: i32) -> DriverResult<()> {
        if status > 0 {
            return Err(ClError(status::INVALID_VALUE));
        }
        let mut state = self.state();
        let rec = state
            .user_events
            .get_mut(&event)
            .ok_or(not_found(ObjectKind::Event))?;
        if rec.status != USER_EVENT_PENDING {
            return Err(ClError(status::INVALID_OPERATION));
        }
        rec.status = status;
        Ok(())
    }

    async fn release_event(&self, event: ObjectId) -> DriverResult<()> {
        // Marker events have no driver-side record.
        self.state().user_events.remove(&event);
        Ok(())
    }

    async fn enqueue_marker(
        &self,
        queue: ObjectId,
        event: ObjectId,
        reporter: Arc<dyn EventReporter>,
    ) -> DriverResult<()> {
        let state = self.state();
        let rec = state
            .queues
            .get(&queue)
            .ok_or(not_found(ObjectKind::CommandQueue))?;
        rec.ops
            .send(QueueOp::Marker { event, reporter })
            .map_err(|_| not_found(ObjectKind::CommandQueue))
    }

    async fn enqueue_barrier(&self, queue: ObjectId, barrier: Barrier) -> DriverResult<()> {
        let state = self.state();
        let rec = state
            .queues
            .get(&queue)
            .ok_or(not_found(ObjectKind::CommandQueue))?;
        rec.ops
            .send(QueueOp::Barrier(barrier))
            .map_err(|_| not_found(ObjectKind::CommandQueue))
    }

    async fn flush(&self, queue: ObjectId) -> DriverResult<()> {
        let state = self.state();
        let rec = state
            .queues
            .get(&queue)
            .ok_or(not_found(ObjectKind::CommandQueue))?;
        rec.ops
            .send(QueueOp::Flush)
            .map_err(|_| not_found(ObjectKind::CommandQueue))
    }

    async fn get_info(&self, kind: ObjectKind, target: ObjectId, param: u32) -> DriverResult<Bytes> {
        let invalid = || ClError(status::INVALID_VALUE);
        if kind == ObjectKind::Device {
            let device = self
                .devices
                .iter()
                .find(|d| d.id == target)
                .ok_or(not_found(kind))?;
            return match param {
                info::DEVICE_NAME => Ok(Bytes::copy_from_slice(device.name.as_bytes())),
                _ => Err(invalid()),
            };
        }

        let state = self.state();
        match kind {
            ObjectKind::Context => {
                let rec = state.contexts.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::CONTEXT_NUM_DEVICES => Ok(u32_info(rec.devices.len() as u32)),
                    info::CONTEXT_DEVICES => {
                        let mut out = BytesMut::with_capacity(rec.devices.len() * 8);
                        for device in &rec.devices {
                            out.put_u64(device.as_u64());
                        }
                        Ok(out.freeze())
                    }
                    _ => Err(invalid()),
                }
            }
            ObjectKind::CommandQueue => {
                let rec = state.queues.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::QUEUE_CONTEXT => Ok(u64_info(rec.context.as_u64())),
                    info::QUEUE_DEVICE => Ok(u64_info(rec.device.as_u64())),
                    _ => Err(invalid()),
                }
            }
            ObjectKind::Buffer => {
                let rec = state.buffers.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::MEM_FLAGS => Ok(u64_info(rec.flags)),
                    info::MEM_SIZE => Ok(u64_info(rec.size)),
                    _ => Err(invalid()),
                }
            }
            ObjectKind::Program => {
                let rec = state.programs.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::PROGRAM_SOURCE => match &rec.source {
                        ProgramSource::Source(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
                        ProgramSource::Binary(_) => Ok(Bytes::new()),
                    },
                    info::PROGRAM_BUILD_STATUS => {
                        // CL_BUILD_SUCCESS 0, CL_BUILD_NONE -1, CL_BUILD_ERROR -2
                        let build_status = if rec.builds.is_empty() {
                            -1
                        } else if rec.builds.values().all(|s| *s == status::SUCCESS) {
                            0
                        } else {
                            -2
                        };
                        Ok(i32_info(build_status))
                    }
                    _ => Err(invalid()),
                }
            }
            ObjectKind::Kernel => {
                let rec = state.kernels.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::KERNEL_FUNCTION_NAME => Ok(Bytes::copy_from_slice(rec.name.as_bytes())),
                    _ => Err(invalid()),
                }
            }
            ObjectKind::Event => {
                let rec = state.user_events.get(&target).ok_or(not_found(kind))?;
                match param {
                    info::EVENT_CONTEXT => Ok(u64_info(rec.context.as_u64())),
                    info::EVENT_COMMAND_EXECUTION_STATUS => Ok(i32_info(rec.status)),
                    _ => Err(invalid()),
                }
            }
            ObjectKind::ComputeNode | ObjectKind::Device => Err(not_found(kind)),
        }
    }
}
