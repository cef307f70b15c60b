//! Wire constants for the binary key-value protocol subset.

/// Size of both request and response headers.
pub const HEADER_LEN: usize = 24;

pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

pub const OPCODE_GET: u8 = 0x00;
pub const OPCODE_SET: u8 = 0x01;

pub const STATUS_NO_ERROR: u16 = 0x0000;
pub const STATUS_KEY_NOT_FOUND: u16 = 0x0001;
pub const STATUS_VALUE_TOO_LARGE: u16 = 0x0003;
pub const STATUS_INVALID_ARGUMENTS: u16 = 0x0004;
pub const STATUS_UNKNOWN_COMMAND: u16 = 0x0081;

const _: () = assert!(REQUEST_MAGIC != RESPONSE_MAGIC, "magics must differ");
