//! Framed wire messages exchanged between clients and daemons.
//!
//! A message is a fixed header followed by a sequence of length-prefixed
//! operation records, followed by any side payloads (bulk data that rides
//! behind the frame so large writes avoid an extra copy). Builders are
//! append-only and freeze into a read-only [`Message`] on send; readers walk
//! records forward-only and never over-read a record.

mod opcode;
mod wire;

pub use opcode::{Family, Opcode};
pub use wire::{read_side_payload, write_side_payload, Flags, Message, MessageBuilder, HEADER_LEN};

/// Wire-level failures. All of them are fatal for the connection they
/// occurred on; the peer drops it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("short read while receiving a message")]
    ShortRead(#[source] std::io::Error),
    #[error("connection lost")]
    ConnectionLost(#[source] std::io::Error),
    #[error("bad magic 0x{found:08x}")]
    BadMagic { found: u32 },
    #[error("unsupported protocol version {found}")]
    BadVersion { found: u8 },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("operation records do not tile the declared payload length")]
    LengthMismatch,
    #[error("declared payload of {declared} bytes exceeds the cap of {cap}")]
    Oversize { declared: u64, cap: u64 },
    #[error("read past the current operation record boundary")]
    MalformedMessage,
    #[error("operation field is not the expected primitive")]
    TypeMismatch,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status codes carried in object/kv per-operation reply records. Zero is
/// success; low codes mirror the backend error taxonomy, high codes report
/// protocol-level rejections that leave the connection up.
pub mod status {
    pub const OK: u32 = 0;
    pub const NOT_FOUND: u32 = 1;
    pub const ALREADY_EXISTS: u32 = 2;
    pub const IO: u32 = 3;
    pub const OUT_OF_SPACE: u32 = 4;
    pub const UNKNOWN_OPCODE: u32 = 100;
    pub const WRONG_BACKEND: u32 = 101;
    pub const INTERNAL: u32 = 102;
}
