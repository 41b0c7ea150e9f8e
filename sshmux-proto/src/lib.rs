//! Typed reading and writing of SSH connection-layer packets.
//!
//! This crate covers exactly the messages a channel multiplexer exchanges
//! once the transport has decrypted and deframed them: channel opens and
//! their confirmations, data and extended data, window adjustments, EOF and
//! close, channel requests and their status replies, and the two TCP/IP
//! forwarding global requests. Key exchange, authentication and transport
//! messages are out of scope.
//!
//! A packet is one [`Message`]. [`Message::from_bytes`] consumes an entire
//! payload and treats trailing bytes as an error, mirroring the strictness
//! the connection layer needs: a partially understood packet means the
//! stream is out of sync and the connection must die.

mod codec;
mod error;
mod message;
pub mod msg;

pub use codec::{Decode, Encode, SshBufExt, SshBufMutExt, SshBytesExt, MAX_STRING_LEN};
pub use error::DecodeError;
pub use message::{GlobalRequestKind, Message, OpenPayload};

/// Reason codes for `SSH_MSG_CHANNEL_OPEN_FAILURE`.
/// https://tools.ietf.org/html/rfc4254#section-5.1
pub const OPEN_ADMINISTRATIVELY_PROHIBITED: u32 = 1;
pub const OPEN_CONNECT_FAILED: u32 = 2;
pub const OPEN_UNKNOWN_CHANNEL_TYPE: u32 = 3;
pub const OPEN_RESOURCE_SHORTAGE: u32 = 4;

/// Data type code for `SSH_MSG_CHANNEL_EXTENDED_DATA`.
/// https://tools.ietf.org/html/rfc4254#section-5.2
pub const EXTENDED_DATA_STDERR: u32 = 1;

pub fn open_failure_reason(reason: u32) -> &'static str {
    match reason {
        OPEN_ADMINISTRATIVELY_PROHIBITED => "administratively prohibited",
        OPEN_CONNECT_FAILED => "connect failed",
        OPEN_UNKNOWN_CHANNEL_TYPE => "unknown channel type",
        OPEN_RESOURCE_SHORTAGE => "resource shortage",
        _ => "unknown reason",
    }
}
