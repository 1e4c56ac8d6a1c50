//! Message catalog.
//!
//! Every frame kind has a fixed discriminator. Requests and Responses carry the
//! correlation id as their first payload field; Notifications carry none.

use bytes::Bytes;

use super::wire::{WireReader, WireWriter};
use crate::fabric::{EventState, EventStatus};
use crate::types::{CorrelationId, Error, ObjectId, ObjectKind, Result};

/// Version exchanged in `Hello`. Bumped on any incompatible catalog change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Frame kind discriminator. Values are contiguous and never reassigned.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello = 1,
    CreateContext = 2,
    CreateCommandQueue = 3,
    CreateBuffer = 4,
    CreateProgram = 5,
    BuildProgram = 6,
    CreateKernel = 7,
    SetKernelArgMemory = 8,
    SetKernelArgValue = 9,
    CreateEvent = 10,
    SubscribeEvent = 11,
    EnqueueMarker = 12,
    EnqueueWaitForEvents = 13,
    Flush = 14,
    DeleteKernel = 15,
    DeleteProgram = 16,
    DeleteBuffer = 17,
    DeleteCommandQueue = 18,
    DeleteContext = 19,
    DeleteEvent = 20,
    GetInfo = 21,
    GetDeviceIds = 22,

    Ok = 23,
    Info = 24,
    Error = 25,
    EventStatus = 26,
    DeviceIds = 27,

    EventStatusChanged = 28,
    ContextError = 29,
    ProgramBuildComplete = 30,
}

/// Frame category, derived from the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Request,
    Response,
    Notification,
}

impl MessageKind {
    pub const ALL: [MessageKind; 30] = [
        MessageKind::Hello,
        MessageKind::CreateContext,
        MessageKind::CreateCommandQueue,
        MessageKind::CreateBuffer,
        MessageKind::CreateProgram,
        MessageKind::BuildProgram,
        MessageKind::CreateKernel,
        MessageKind::SetKernelArgMemory,
        MessageKind::SetKernelArgValue,
        MessageKind::CreateEvent,
        MessageKind::SubscribeEvent,
        MessageKind::EnqueueMarker,
        MessageKind::EnqueueWaitForEvents,
        MessageKind::Flush,
        MessageKind::DeleteKernel,
        MessageKind::DeleteProgram,
        MessageKind::DeleteBuffer,
        MessageKind::DeleteCommandQueue,
        MessageKind::DeleteContext,
        MessageKind::DeleteEvent,
        MessageKind::GetInfo,
        MessageKind::GetDeviceIds,
        MessageKind::Ok,
        MessageKind::Info,
        MessageKind::Error,
        MessageKind::EventStatus,
        MessageKind::DeviceIds,
        MessageKind::EventStatusChanged,
        MessageKind::ContextError,
        MessageKind::ProgramBuildComplete,
    ];

    pub fn category(self) -> Category {
        match self as u8 {
            1..=22 => Category::Request,
            23..=27 => Category::Response,
            _ => Category::Notification,
        }
    }

    /// All request kinds, for routing tables.
    pub fn requests() -> impl Iterator<Item = MessageKind> {
        Self::ALL
            .into_iter()
            .filter(|k| k.category() == Category::Request)
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1..=30 => Ok(Self::ALL[usize::from(value) - 1]),
            other => Err(Error::protocol(format!("unknown message kind 0x{:02X}", other))),
        }
    }
}

/// Program contents handed to `CreateProgram`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramSource {
    Source(String),
    Binary(Bytes),
}

/// Client → server requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Hello { node_id: u16, protocol_version: u32 },
    CreateContext { context: ObjectId, devices: Vec<ObjectId> },
    CreateCommandQueue { queue: ObjectId, context: ObjectId, device: ObjectId, properties: u64 },
    CreateBuffer { buffer: ObjectId, context: ObjectId, flags: u64, size: u64 },
    CreateProgram { program: ObjectId, context: ObjectId, source: ProgramSource },
    BuildProgram { program: ObjectId, devices: Vec<ObjectId>, options: String },
    CreateKernel { kernel: ObjectId, program: ObjectId, name: String },
    SetKernelArgMemory { kernel: ObjectId, index: u32, memory: ObjectId },
    SetKernelArgValue { kernel: ObjectId, index: u32, value: Bytes },
    CreateEvent { context: ObjectId, event: ObjectId, mem_objects: Vec<ObjectId> },
    SubscribeEvent { event: ObjectId },
    EnqueueMarker { queue: ObjectId, event: ObjectId },
    EnqueueWaitForEvents { queue: ObjectId, events: Vec<ObjectId> },
    Flush { queue: ObjectId },
    DeleteKernel { kernel: ObjectId },
    DeleteProgram { program: ObjectId },
    DeleteBuffer { buffer: ObjectId },
    DeleteCommandQueue { queue: ObjectId },
    DeleteContext { context: ObjectId },
    DeleteEvent { event: ObjectId },
    GetInfo { target_kind: ObjectKind, target: ObjectId, param: u32 },
    GetDeviceIds,
}

/// Server → client responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Info(Bytes),
    Error(i32),
    EventStatus { state: EventState, exit_code: i32 },
    DeviceIds(Vec<ObjectId>),
}

/// Unsolicited one-way messages, either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    EventStatusChanged { event: ObjectId, status: EventStatus },
    ContextError { context: ObjectId, info: String, private_info: Bytes },
    ProgramBuildComplete { program: ObjectId, device: ObjectId, status: i32 },
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request { correlation: CorrelationId, body: Request },
    Response { correlation: CorrelationId, body: Response },
    Notification(Notification),
}

impl Request {
    pub fn kind(&self) -> MessageKind {
        match self {
            Request::Hello { .. } => MessageKind::Hello,
            Request::CreateContext { .. } => MessageKind::CreateContext,
            Request::CreateCommandQueue { .. } => MessageKind::CreateCommandQueue,
            Request::CreateBuffer { .. } => MessageKind::CreateBuffer,
            Request::CreateProgram { .. } => MessageKind::CreateProgram,
            Request::BuildProgram { .. } => MessageKind::BuildProgram,
            Request::CreateKernel { .. } => MessageKind::CreateKernel,
            Request::SetKernelArgMemory { .. } => MessageKind::SetKernelArgMemory,
            Request::SetKernelArgValue { .. } => MessageKind::SetKernelArgValue,
            Request::CreateEvent { .. } => MessageKind::CreateEvent,
            Request::SubscribeEvent { .. } => MessageKind::SubscribeEvent,
            Request::EnqueueMarker { .. } => MessageKind::EnqueueMarker,
            Request::EnqueueWaitForEvents { .. } => MessageKind::EnqueueWaitForEvents,
            Request::Flush { .. } => MessageKind::Flush,
            Request::DeleteKernel { .. } => MessageKind::DeleteKernel,
            Request::DeleteProgram { .. } => MessageKind::DeleteProgram,
            Request::DeleteBuffer { .. } => MessageKind::DeleteBuffer,
            Request::DeleteCommandQueue { .. } => MessageKind::DeleteCommandQueue,
            Request::DeleteContext { .. } => MessageKind::DeleteContext,
            Request::DeleteEvent { .. } => MessageKind::DeleteEvent,
            Request::GetInfo { .. } => MessageKind::GetInfo,
            Request::GetDeviceIds => MessageKind::GetDeviceIds,
        }
    }

    fn encode_body(&self, w: &mut WireWriter) {
        match self {
            Request::Hello { node_id, protocol_version } => {
                w.put_u16(*node_id);
                w.put_u32(*protocol_version);
            }
            Request::CreateContext { context, devices } => {
                w.put_id(*context);
                w.put_ids(devices);
            }
            Request::CreateCommandQueue { queue, context, device, properties } => {
                w.put_id(*queue);
                w.put_id(*context);
                w.put_id(*device);
                w.put_u64(*properties);
            }
            Request::CreateBuffer { buffer, context, flags, size } => {
                w.put_id(*buffer);
                w.put_id(*context);
                w.put_u64(*flags);
                w.put_u64(*size);
            }
            Request::CreateProgram { program, context, source } => {
                w.put_id(*program);
                w.put_id(*context);
                match source {
                    ProgramSource::Source(text) => {
                        w.put_u8(0);
                        w.put_str(text);
                    }
                    ProgramSource::Binary(binary) => {
                        w.put_u8(1);
                        w.put_bytes(binary);
                    }
                }
            }
            Request::BuildProgram { program, devices, options } => {
                w.put_id(*program);
                w.put_ids(devices);
                w.put_str(options);
            }
            Request::CreateKernel { kernel, program, name } => {
                w.put_id(*kernel);
                w.put_id(*program);
                w.put_str(name);
            }
            Request::SetKernelArgMemory { kernel, index, memory } => {
                w.put_id(*kernel);
                w.put_u32(*index);
                w.put_id(*memory);
            }
            Request::SetKernelArgValue { kernel, index, value } => {
                w.put_id(*kernel);
                w.put_u32(*index);
                w.put_bytes(value);
            }
            Request::CreateEvent { context, event, mem_objects } => {
                w.put_id(*context);
                w.put_id(*event);
                w.put_ids(mem_objects);
            }
            Request::EnqueueMarker { queue, event } => {
                w.put_id(*queue);
                w.put_id(*event);
            }
            Request::EnqueueWaitForEvents { queue, events } => {
                w.put_id(*queue);
                w.put_ids(events);
            }
            Request::SubscribeEvent { event: id }
            | Request::Flush { queue: id }
            | Request::DeleteKernel { kernel: id }
            | Request::DeleteProgram { program: id }
            | Request::DeleteBuffer { buffer: id }
            | Request::DeleteCommandQueue { queue: id }
            | Request::DeleteContext { context: id }
            | Request::DeleteEvent { event: id } => w.put_id(*id),
            Request::GetInfo { target_kind, target, param } => {
                w.put_u8(*target_kind as u8);
                w.put_id(*target);
                w.put_u32(*param);
            }
            Request::GetDeviceIds => {}
        }
    }

    fn decode_body(kind: MessageKind, r: &mut WireReader) -> Result<Self> {
        Ok(match kind {
            MessageKind::Hello => Request::Hello {
                node_id: r.get_u16()?,
                protocol_version: r.get_u32()?,
            },
            MessageKind::CreateContext => Request::CreateContext {
                context: r.get_id()?,
                devices: r.get_ids()?,
            },
            MessageKind::CreateCommandQueue => Request::CreateCommandQueue {
                queue: r.get_id()?,
                context: r.get_id()?,
                device: r.get_id()?,
                properties: r.get_u64()?,
            },
            MessageKind::CreateBuffer => Request::CreateBuffer {
                buffer: r.get_id()?,
                context: r.get_id()?,
                flags: r.get_u64()?,
                size: r.get_u64()?,
            },
            MessageKind::CreateProgram => {
                let program = r.get_id()?;
                let context = r.get_id()?;
                let source = match r.get_u8()? {
                    0 => ProgramSource::Source(r.get_string()?),
                    1 => ProgramSource::Binary(r.get_bytes()?),
                    tag => {
                        return Err(Error::protocol(format!("unknown program source tag {}", tag)))
                    }
                };
                Request::CreateProgram { program, context, source }
            }
            MessageKind::BuildProgram => Request::BuildProgram {
                program: r.get_id()?,
                devices: r.get_ids()?,
                options: r.get_string()?,
            },
            MessageKind::CreateKernel => Request::CreateKernel {
                kernel: r.get_id()?,
                program: r.get_id()?,
                name: r.get_string()?,
            },
            MessageKind::SetKernelArgMemory => Request::SetKernelArgMemory {
                kernel: r.get_id()?,
                index: r.get_u32()?,
                memory: r.get_id()?,
            },
            MessageKind::SetKernelArgValue => Request::SetKernelArgValue {
                kernel: r.get_id()?,
                index: r.get_u32()?,
                value: r.get_bytes()?,
            },
            MessageKind::CreateEvent => Request::CreateEvent {
                context: r.get_id()?,
                event: r.get_id()?,
                mem_objects: r.get_ids()?,
            },
            MessageKind::SubscribeEvent => Request::SubscribeEvent { event: r.get_id()? },
            MessageKind::EnqueueMarker => Request::EnqueueMarker {
                queue: r.get_id()?,
                event: r.get_id()?,
            },
            MessageKind::EnqueueWaitForEvents => Request::EnqueueWaitForEvents {
                queue: r.get_id()?,
                events: r.get_ids()?,
            },
            MessageKind::Flush => Request::Flush { queue: r.get_id()? },
            MessageKind::DeleteKernel => Request::DeleteKernel { kernel: r.get_id()? },
            MessageKind::DeleteProgram => Request::DeleteProgram { program: r.get_id()? },
            MessageKind::DeleteBuffer => Request::DeleteBuffer { buffer: r.get_id()? },
            MessageKind::DeleteCommandQueue => Request::DeleteCommandQueue { queue: r.get_id()? },
            MessageKind::DeleteContext => Request::DeleteContext { context: r.get_id()? },
            MessageKind::DeleteEvent => Request::DeleteEvent { event: r.get_id()? },
            MessageKind::GetInfo => {
                let raw_kind = r.get_u8()?;
                let target_kind = ObjectKind::try_from(raw_kind)
                    .map_err(|k| Error::protocol(format!("unknown object kind {}", k)))?;
                Request::GetInfo {
                    target_kind,
                    target: r.get_id()?,
                    param: r.get_u32()?,
                }
            }
            MessageKind::GetDeviceIds => Request::GetDeviceIds,
            other => return Err(Error::protocol(format!("{:?} is not a request", other))),
        })
    }
}

impl Response {
    pub fn kind(&self) -> MessageKind {
        match self {
            Response::Ok => MessageKind::Ok,
            Response::Info(_) => MessageKind::Info,
            Response::Error(_) => MessageKind::Error,
            Response::EventStatus { .. } => MessageKind::EventStatus,
            Response::DeviceIds(_) => MessageKind::DeviceIds,
        }
    }

    /// Turn an `Error(code)` response into `Error::Remote(code)`.
    pub fn into_result(self) -> Result<Response> {
        match self {
            Response::Error(code) => Err(Error::Remote(code)),
            other => Ok(other),
        }
    }

    fn encode_body(&self, w: &mut WireWriter) {
        match self {
            Response::Ok => {}
            Response::Info(bytes) => w.put_bytes(bytes),
            Response::Error(code) => w.put_i32(*code),
            Response::EventStatus { state, exit_code } => {
                w.put_u8(*state as u8);
                w.put_i32(*exit_code);
            }
            Response::DeviceIds(ids) => w.put_ids(ids),
        }
    }

    fn decode_body(kind: MessageKind, r: &mut WireReader) -> Result<Self> {
        Ok(match kind {
            MessageKind::Ok => Response::Ok,
            MessageKind::Info => Response::Info(r.get_bytes()?),
            MessageKind::Error => Response::Error(r.get_i32()?),
            MessageKind::EventStatus => Response::EventStatus {
                state: get_state(r)?,
                exit_code: r.get_i32()?,
            },
            MessageKind::DeviceIds => Response::DeviceIds(r.get_ids()?),
            other => return Err(Error::protocol(format!("{:?} is not a response", other))),
        })
    }
}

impl Notification {
    pub fn kind(&self) -> MessageKind {
        match self {
            Notification::EventStatusChanged { .. } => MessageKind::EventStatusChanged,
            Notification::ContextError { .. } => MessageKind::ContextError,
            Notification::ProgramBuildComplete { .. } => MessageKind::ProgramBuildComplete,
        }
    }

    fn encode_body(&self, w: &mut WireWriter) {
        match self {
            Notification::EventStatusChanged { event, status } => {
                w.put_id(*event);
                w.put_u8(status.state as u8);
                w.put_i32(status.exit_code);
                w.put_u64(status.timestamp_ns);
            }
            Notification::ContextError { context, info, private_info } => {
                w.put_id(*context);
                w.put_str(info);
                w.put_bytes(private_info);
            }
            Notification::ProgramBuildComplete { program, device, status } => {
                w.put_id(*program);
                w.put_id(*device);
                w.put_i32(*status);
            }
        }
    }

    fn decode_body(kind: MessageKind, r: &mut WireReader) -> Result<Self> {
        Ok(match kind {
            MessageKind::EventStatusChanged => Notification::EventStatusChanged {
                event: r.get_id()?,
                status: EventStatus {
                    state: get_state(r)?,
                    exit_code: r.get_i32()?,
                    timestamp_ns: r.get_u64()?,
                },
            },
            MessageKind::ContextError => Notification::ContextError {
                context: r.get_id()?,
                info: r.get_string()?,
                private_info: r.get_bytes()?,
            },
            MessageKind::ProgramBuildComplete => Notification::ProgramBuildComplete {
                program: r.get_id()?,
                device: r.get_id()?,
                status: r.get_i32()?,
            },
            other => return Err(Error::protocol(format!("{:?} is not a notification", other))),
        })
    }
}

fn get_state(r: &mut WireReader) -> Result<EventState> {
    let raw = r.get_u8()?;
    EventState::try_from(raw).map_err(|s| Error::protocol(format!("unknown event state {}", s)))
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request { body, .. } => body.kind(),
            Message::Response { body, .. } => body.kind(),
            Message::Notification(n) => n.kind(),
        }
    }

    /// Encode into `(kind byte, payload)`.
    pub fn encode(&self) -> (u8, Bytes) {
        let mut w = WireWriter::new();
        match self {
            Message::Request { correlation, body } => {
                w.put_u64(correlation.0);
                body.encode_body(&mut w);
            }
            Message::Response { correlation, body } => {
                w.put_u64(correlation.0);
                body.encode_body(&mut w);
            }
            Message::Notification(n) => n.encode_body(&mut w),
        }
        (self.kind() as u8, w.finish())
    }

    /// Decode a frame. Unknown kinds, truncated fields and trailing bytes are
    /// protocol errors.
    pub fn decode(kind: u8, payload: Bytes) -> Result<Self> {
        let kind = MessageKind::try_from(kind)?;
        let mut r = WireReader::new(payload);
        let message = match kind.category() {
            Category::Request => Message::Request {
                correlation: CorrelationId(r.get_u64()?),
                body: Request::decode_body(kind, &mut r)?,
            },
            Category::Response => Message::Response {
                correlation: CorrelationId(r.get_u64()?),
                body: Response::decode_body(kind, &mut r)?,
            },
            Category::Notification => Message::Notification(Notification::decode_body(kind, &mut r)?),
        };
        r.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn id(raw: u64) -> ObjectId {
        ObjectId::from_raw(raw)
    }

    /// One representative message per kind.
    fn catalog() -> Vec<Message> {
        let corr = CorrelationId(77);
        let requests = vec![
            Request::Hello { node_id: 4, protocol_version: PROTOCOL_VERSION },
            Request::CreateContext { context: id(100), devices: vec![id(7), id(8)] },
            Request::CreateCommandQueue { queue: id(101), context: id(100), device: id(7), properties: 2 },
            Request::CreateBuffer { buffer: id(102), context: id(100), flags: 1, size: 4096 },
            Request::CreateProgram {
                program: id(200),
                context: id(100),
                source: ProgramSource::Source("__kernel void k() {}".into()),
            },
            Request::BuildProgram { program: id(200), devices: vec![id(3), id(4)], options: "-w".into() },
            Request::CreateKernel { kernel: id(300), program: id(200), name: "k".into() },
            Request::SetKernelArgMemory { kernel: id(300), index: 0, memory: id(102) },
            Request::SetKernelArgValue { kernel: id(300), index: 1, value: Bytes::from_static(&[1, 2, 3, 4]) },
            Request::CreateEvent { context: id(100), event: id(500), mem_objects: vec![id(102)] },
            Request::SubscribeEvent { event: id(500) },
            Request::EnqueueMarker { queue: id(101), event: id(501) },
            Request::EnqueueWaitForEvents { queue: id(101), events: vec![id(500), id(501)] },
            Request::Flush { queue: id(101) },
            Request::DeleteKernel { kernel: id(300) },
            Request::DeleteProgram { program: id(200) },
            Request::DeleteBuffer { buffer: id(102) },
            Request::DeleteCommandQueue { queue: id(101) },
            Request::DeleteContext { context: id(100) },
            Request::DeleteEvent { event: id(500) },
            Request::GetInfo { target_kind: ObjectKind::Buffer, target: id(102), param: 0x1102 },
            Request::GetDeviceIds,
        ];
        let responses = vec![
            Response::Ok,
            Response::Info(Bytes::from_static(b"GPU")),
            Response::Error(-48),
            Response::EventStatus { state: EventState::Running, exit_code: 0 },
            Response::DeviceIds(vec![id(3), id(4), id(5)]),
        ];
        let notifications = vec![
            Notification::EventStatusChanged {
                event: id(500),
                status: EventStatus { state: EventState::Error, exit_code: -14, timestamp_ns: 123 },
            },
            Notification::ContextError {
                context: id(100),
                info: "out of memory".into(),
                private_info: Bytes::from_static(&[9, 9]),
            },
            Notification::ProgramBuildComplete { program: id(200), device: id(5), status: -43 },
        ];

        requests
            .into_iter()
            .map(|body| Message::Request { correlation: corr, body })
            .chain(responses.into_iter().map(|body| Message::Response { correlation: corr, body }))
            .chain(notifications.into_iter().map(Message::Notification))
            .collect()
    }

    #[test]
    fn test_every_kind_round_trips() {
        let messages = catalog();
        let kinds: Vec<_> = messages.iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, MessageKind::ALL.to_vec());

        for message in messages {
            let (kind, payload) = message.encode();
            let decoded = Message::decode(kind, payload).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn test_discriminators_are_contiguous() {
        for (i, kind) in MessageKind::ALL.iter().enumerate() {
            assert_eq!(*kind as u8 as usize, i + 1);
            assert_eq!(MessageKind::try_from(*kind as u8).unwrap(), *kind);
        }
        assert!(MessageKind::try_from(0).is_err());
        assert!(MessageKind::try_from(31).is_err());
    }

    #[test]
    fn test_create_context_wire_layout() {
        let message = Message::Request {
            correlation: CorrelationId(1),
            body: Request::CreateContext { context: id(100), devices: vec![id(7)] },
        };
        let (kind, payload) = message.encode();
        assert_eq!(kind, 2);
        let mut expected = Vec::new();
        expected.extend_from_slice(&1u64.to_be_bytes());
        expected.extend_from_slice(&100u64.to_be_bytes());
        expected.extend_from_slice(&1u32.to_be_bytes());
        expected.extend_from_slice(&7u64.to_be_bytes());
        assert_eq!(payload.to_vec(), expected);
    }

    #[test]
    fn test_unknown_event_state_is_protocol_error() {
        let mut w = WireWriter::new();
        w.put_id(id(1));
        w.put_u8(9);
        w.put_i32(0);
        w.put_u64(0);
        let err = Message::decode(MessageKind::EventStatusChanged as u8, w.finish()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_error_response_into_result() {
        assert!(matches!(Response::Error(-34).into_result(), Err(Error::Remote(-34))));
        assert_eq!(Response::Ok.into_result().unwrap(), Response::Ok);
    }
}
