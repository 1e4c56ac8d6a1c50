//! Status codes surfaced to host-API callers.
//!
//! Values below `-1000` are runtime-specific; everything else matches the
//! OpenCL host API.

pub const SUCCESS: i32 = 0;
pub const DEVICE_NOT_FOUND: i32 = -1;
pub const OUT_OF_RESOURCES: i32 = -5;
pub const OUT_OF_HOST_MEMORY: i32 = -6;
pub const BUILD_PROGRAM_FAILURE: i32 = -11;
pub const EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
pub const INVALID_VALUE: i32 = -30;
pub const INVALID_DEVICE: i32 = -33;
pub const INVALID_CONTEXT: i32 = -34;
pub const INVALID_COMMAND_QUEUE: i32 = -36;
pub const INVALID_MEM_OBJECT: i32 = -38;
pub const INVALID_BUILD_OPTIONS: i32 = -43;
pub const INVALID_PROGRAM: i32 = -44;
pub const INVALID_PROGRAM_EXECUTABLE: i32 = -45;
pub const INVALID_KERNEL_NAME: i32 = -46;
pub const INVALID_KERNEL: i32 = -48;
pub const INVALID_ARG_INDEX: i32 = -49;
pub const INVALID_EVENT: i32 = -58;
pub const INVALID_OPERATION: i32 = -59;
pub const INVALID_BUFFER_SIZE: i32 = -61;

pub const CONNECTION_LOST: i32 = -1001;
pub const TIMEOUT: i32 = -1002;
pub const PROTOCOL_ERROR: i32 = -1003;
pub const INVALID_NODE: i32 = -1004;

/// Parameter names understood by `GetInfo`.
pub mod info {
    pub const CONTEXT_NUM_DEVICES: u32 = 0x1083;
    pub const CONTEXT_DEVICES: u32 = 0x1081;
    pub const DEVICE_NAME: u32 = 0x102B;
    pub const QUEUE_CONTEXT: u32 = 0x1090;
    pub const QUEUE_DEVICE: u32 = 0x1091;
    pub const MEM_FLAGS: u32 = 0x1101;
    pub const MEM_SIZE: u32 = 0x1102;
    pub const PROGRAM_SOURCE: u32 = 0x1165;
    pub const PROGRAM_BUILD_STATUS: u32 = 0x1181;
    pub const KERNEL_FUNCTION_NAME: u32 = 0x1190;
    pub const EVENT_CONTEXT: u32 = 0x11D4;
    pub const EVENT_COMMAND_EXECUTION_STATUS: u32 = 0x11D3;
}
