//! Wire protocol: frame codec, field encoding, and the message catalog.

pub mod codec;
pub mod message;
pub mod wire;

pub use message::{
    Category, Message, MessageKind, Notification, ProgramSource, Request, Response,
    PROTOCOL_VERSION,
};
