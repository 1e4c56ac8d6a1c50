//! Object kind tags.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::status;

/// Kind of a remote object. Encoded as one byte on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    ComputeNode = 0,
    Device = 1,
    Context = 2,
    CommandQueue = 3,
    Buffer = 4,
    Program = 5,
    Kernel = 6,
    Event = 7,
}

impl ObjectKind {
    /// Status code returned when an object of this kind cannot be resolved.
    pub fn invalid_code(self) -> i32 {
        match self {
            ObjectKind::ComputeNode => status::INVALID_NODE,
            ObjectKind::Device => status::INVALID_DEVICE,
            ObjectKind::Context => status::INVALID_CONTEXT,
            ObjectKind::CommandQueue => status::INVALID_COMMAND_QUEUE,
            ObjectKind::Buffer => status::INVALID_MEM_OBJECT,
            ObjectKind::Program => status::INVALID_PROGRAM,
            ObjectKind::Kernel => status::INVALID_KERNEL,
            ObjectKind::Event => status::INVALID_EVENT,
        }
    }
}

impl TryFrom<u8> for ObjectKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        Ok(match value {
            0 => ObjectKind::ComputeNode,
            1 => ObjectKind::Device,
            2 => ObjectKind::Context,
            3 => ObjectKind::CommandQueue,
            4 => ObjectKind::Buffer,
            5 => ObjectKind::Program,
            6 => ObjectKind::Kernel,
            7 => ObjectKind::Event,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectKind::ComputeNode => "compute node",
            ObjectKind::Device => "device",
            ObjectKind::Context => "context",
            ObjectKind::CommandQueue => "command queue",
            ObjectKind::Buffer => "buffer",
            ObjectKind::Program => "program",
            ObjectKind::Kernel => "kernel",
            ObjectKind::Event => "event",
        };
        f.write_str(name)
    }
}
