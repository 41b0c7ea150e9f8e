//! Channel multiplexing core for an SSH endpoint.
//!
//! An SSH connection carries many logical byte streams ("channels") over
//! one encrypted transport. This crate is the subsystem that makes that
//! work: the channel table, the per-channel state machines with their
//! asymmetric half-close rules, sliding-window flow control, a
//! single-threaded readiness loop bridging descriptors to protocol
//! messages, TCP/X11/agent forwarding with an admission policy, SOCKS
//! dynamic proxying, and X11 cookie spoofing.
//!
//! What it is *not*: a transport. Key exchange, encryption, packet framing
//! and authentication live behind the [`Transport`] trait; decrypted
//! connection-layer packets come in through [`Muxer::dispatch`], encoded
//! ones go out through `Transport::send`. All state belongs to the
//! [`Muxer`], one per connection, driven from a single thread:
//!
//! ```no_run
//! # use sshmux_core::{Muxer, MuxConfig, Transport};
//! # use std::time::Duration;
//! # struct T;
//! # impl Transport for T {
//! #     fn send(&mut self, _: bytes::Bytes) -> std::io::Result<()> { Ok(()) }
//! # }
//! # fn packets_from_transport() -> Vec<bytes::Bytes> { Vec::new() }
//! # fn main() -> Result<(), sshmux_core::Error> {
//! let mut mux = Muxer::new(Box::new(T), MuxConfig::default())?;
//! loop {
//!     for packet in packets_from_transport() {
//!         mux.dispatch(packet)?;
//!     }
//!     mux.tick(Some(Duration::from_millis(100)))?;
//! }
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod connect;
pub mod error;
pub mod forward;
mod handlers;
pub mod mux;
mod poll;
mod socks;
mod state;
pub mod stream;
pub mod table;
pub mod x11;

pub use sshmux_proto as proto;

// Endpoints handed to the muxer are mio types (or wrap them); callers need
// the same version of the crate to construct them.
pub use mio;

pub use buffer::{BufferFull, ByteBuffer, BUFFER_MAX};
pub use channel::{
    Channel, ChannelFlags, ChannelId, ChannelType, ConfirmStatus, DetachCallback, Endpoints,
    ExtendedUsage, FilterCleanup, FilterVerdict, InputFilter, InputState, MuxCallback,
    OpenConfirmCallback, OpenFailed, OutputFilter, OutputState, StatusConfirm, MUX_PACKET_MAX,
    SESSION_PACKET_DEFAULT, SESSION_WINDOW_DEFAULT, TCP_PACKET_DEFAULT, TCP_WINDOW_DEFAULT,
    X11_PACKET_DEFAULT, X11_WINDOW_DEFAULT,
};
pub use connect::AfPreference;
pub use error::Error;
pub use forward::{permitopen_port, ForwardPolicy, GatewayPorts, ANY_PORT};
pub use mux::{Dispatched, MuxConfig, Muxer, OpenDecision, OpenHook, OpenRequest, Transport};
pub use stream::{ChannelStream, Listener, PipeReader, PipeWriter};
pub use table::ChannelTable;
pub use x11::{connect_display, X11Display, X11SpoofState};
