//! Compute driver interface.
//!
//! A server node hosts backing objects on a [`ComputeDriver`]. The node takes
//! care of identifiers, validation against its registry, events and
//! notifications; the driver only does the device work.

mod reference;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::sync::Arc;

pub use reference::ReferenceDriver;

use crate::fabric::EventState;
use crate::protocol::ProgramSource;
use crate::types::{ObjectId, ObjectKind};

/// Status code returned by a driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("driver status {0}")]
pub struct ClError(pub i32);

pub type DriverResult<T> = std::result::Result<T, ClError>;

/// One device exposed by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: ObjectId,
    pub name: String,
}

/// A kernel argument binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelArg {
    Memory(ObjectId),
    Value(Bytes),
}

/// Receives the execution transitions of one enqueued command.
#[async_trait]
pub trait EventReporter: Send + Sync {
    async fn transition(&self, state: EventState, exit_code: i32);
}

/// Receives asynchronous errors raised against a context.
pub trait ContextErrorReporter: Send + Sync {
    fn report(&self, context: ObjectId, info: &str, private_info: &[u8]);
}

/// Resolves once every event a barrier waits on is terminal; `Err` carries the
/// status to fail dependent commands with.
pub type Barrier = BoxFuture<'static, std::result::Result<(), i32>>;

#[async_trait]
pub trait ComputeDriver: Send + Sync + 'static {
    fn devices(&self) -> Vec<DeviceInfo>;

    async fn create_context(
        &self,
        context: ObjectId,
        devices: &[ObjectId],
        errors: Arc<dyn ContextErrorReporter>,
    ) -> DriverResult<()>;
    async fn release_context(&self, context: ObjectId) -> DriverResult<()>;

    async fn create_queue(
        &self,
        queue: ObjectId,
        context: ObjectId,
        device: ObjectId,
        properties: u64,
    ) -> DriverResult<()>;
    async fn release_queue(&self, queue: ObjectId) -> DriverResult<()>;

    async fn create_buffer(
        &self,
        buffer: ObjectId,
        context: ObjectId,
        flags: u64,
        size: u64,
    ) -> DriverResult<()>;
    async fn release_buffer(&self, buffer: ObjectId) -> DriverResult<()>;

    async fn create_program(
        &self,
        program: ObjectId,
        context: ObjectId,
        source: &ProgramSource,
    ) -> DriverResult<()>;
    async fn release_program(&self, program: ObjectId) -> DriverResult<()>;

    /// Build `program` for one device. Returns the build status
    /// (`0` on success).
    async fn build_program(&self, program: ObjectId, device: ObjectId, options: &str) -> i32;

    async fn create_kernel(&self, kernel: ObjectId, program: ObjectId, name: &str)
        -> DriverResult<()>;
    async fn release_kernel(&self, kernel: ObjectId) -> DriverResult<()>;
    async fn set_kernel_arg(&self, kernel: ObjectId, index: u32, arg: KernelArg)
        -> DriverResult<()>;

    async fn create_user_event(&self, event: ObjectId, context: ObjectId) -> DriverResult<()>;
    async fn set_user_event_status(&self, event: ObjectId, status: i32) -> DriverResult<()>;
    async fn release_event(&self, event: ObjectId) -> DriverResult<()>;

    /// Enqueue a marker whose transitions go to `reporter`.
    async fn enqueue_marker(
        &self,
        queue: ObjectId,
        event: ObjectId,
        reporter: Arc<dyn EventReporter>,
    ) -> DriverResult<()>;

    /// Enqueue a barrier: later commands on `queue` run after `barrier`
    /// resolves.
    async fn enqueue_barrier(&self, queue: ObjectId, barrier: Barrier) -> DriverResult<()>;

    /// Submit everything enqueued so far.
    async fn flush(&self, queue: ObjectId) -> DriverResult<()>;

    async fn get_info(&self, kind: ObjectKind, target: ObjectId, param: u32) -> DriverResult<Bytes>;
}

impl From<ClError> for crate::types::Error {
    fn from(err: ClError) -> Self {
        crate::types::Error::Remote(err.0)
    }
}
