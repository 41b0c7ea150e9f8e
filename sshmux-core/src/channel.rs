use std::collections::VecDeque;
use std::fmt;
use std::net::Shutdown;
use std::os::fd::RawFd;
use std::time::Instant;

use crate::buffer::ByteBuffer;
use crate::mux::Muxer;
use crate::stream::{ChannelStream, IoSlot, ListenSlot, Listener};

/// Default window/packet sizes, per channel kind.
pub const SESSION_PACKET_DEFAULT: u32 = 32 * 1024;
pub const SESSION_WINDOW_DEFAULT: u32 = 64 * SESSION_PACKET_DEFAULT;
pub const TCP_PACKET_DEFAULT: u32 = 32 * 1024;
pub const TCP_WINDOW_DEFAULT: u32 = 64 * TCP_PACKET_DEFAULT;
pub const X11_PACKET_DEFAULT: u32 = 16 * 1024;
pub const X11_WINDOW_DEFAULT: u32 = 4 * X11_PACKET_DEFAULT;

/// How much a post-handler reads from a local descriptor per tick.
pub const READ_CHUNK: usize = 16 * 1024;

/// Ceiling on a single control-multiplexer packet.
pub const MUX_PACKET_MAX: usize = 256 * 1024;

/// Local channel id; doubles as the slot index in the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) u32);

impl ChannelId {
    pub fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<ChannelId> for u32 {
    fn from(id: ChannelId) -> u32 {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    /// Locally created, endpoints not yet bound.
    Larval,
    /// OPEN sent (or received), waiting for the handshake to finish.
    Opening,
    Open,
    /// Non-blocking connect in flight; OPEN_CONFIRMATION deferred.
    Connecting,
    /// Accepted SOCKS connection, target not yet known.
    Dynamic,
    /// Forwarded X11 connection awaiting cookie verification.
    X11Open,
    PortListener,
    RportListener,
    X11Listener,
    AgentListener,
    MuxListener,
    MuxClient,
    /// Both halves closed, CLOSE sent, waiting for the peer's CLOSE.
    Closed,
    /// Given up on; reaped without waiting for the close handshake.
    Abandoned,
    /// Dead; reaped by the next garbage-collection pass.
    Zombie,
}

impl ChannelType {
    /// Listener kinds never carry user data and never receive protocol
    /// messages addressed to them.
    pub fn is_listener(self) -> bool {
        matches!(
            self,
            ChannelType::PortListener
                | ChannelType::RportListener
                | ChannelType::X11Listener
                | ChannelType::AgentListener
                | ChannelType::MuxListener
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Open,
    /// Local read side failed; flushing buffered input to the peer before
    /// sending EOF.
    WaitDrain,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Open,
    /// Peer sent EOF; flushing buffered output to the local sink before
    /// closing the write side.
    WaitDrain,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedUsage {
    /// Extended descriptor exists but its data is discarded.
    Ignore,
    /// Read stderr-style data from the descriptor and forward it.
    Read,
    /// Write peer extended data to the descriptor.
    Write,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelFlags: u32 {
        const EOF_SENT = 0x01;
        const EOF_RCVD = 0x02;
        const CLOSE_SENT = 0x04;
        const CLOSE_RCVD = 0x08;
        /// State transitions must not emit protocol messages (control
        /// multiplexer channels).
        const LOCAL_ONLY = 0x10;
        /// SOCKS5 method negotiation finished; next bytes are the request.
        const SOCKS5_AUTH_DONE = 0x20;
    }
}

/// Endpoints handed to `new_channel`.
pub enum Endpoints {
    /// No local I/O yet (larval session channels, pure protocol tests).
    None,
    /// One socket carrying both directions.
    Socket(Box<dyn ChannelStream>),
    /// Separate read/write/extended descriptors (sessions over pipes).
    Split {
        rfd: Option<Box<dyn ChannelStream>>,
        wfd: Option<Box<dyn ChannelStream>>,
        efd: Option<Box<dyn ChannelStream>>,
    },
    /// A listening socket; the channel only spawns children.
    Listener(Listener),
}

pub struct OpenFailed {
    pub reason: u32,
    pub description: String,
}

pub type OpenConfirmCallback = Box<dyn FnOnce(&mut Muxer, ChannelId, Result<(), OpenFailed>)>;
pub type DetachCallback = Box<dyn FnOnce(&mut Muxer, ChannelId)>;
pub type FilterCleanup = Box<dyn FnOnce(ChannelId)>;
/// Sees every chunk read from the local descriptor; buffers it (possibly
/// transformed) into `channel.input` and returns whether to keep reading.
pub type InputFilter = Box<dyn FnMut(&mut Channel, &[u8]) -> FilterVerdict>;
/// Produces the bytes to write in place of the output-buffer head. Must be
/// length-preserving; `None` stops the channel.
pub type OutputFilter = Box<dyn FnMut(&mut Channel) -> Option<Vec<u8>>>;
/// Invoked when a complete control-multiplexer packet is buffered. Returning
/// `false` kills the channel. Shared between a mux listener and the client
/// channels it accepts.
pub type MuxCallback = std::rc::Rc<std::cell::RefCell<dyn FnMut(&mut Muxer, ChannelId) -> bool>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Pass,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmStatus {
    Success,
    Failure,
}

pub struct StatusConfirm {
    pub cb: Box<dyn FnOnce(&mut Muxer, ChannelId, ConfirmStatus)>,
    pub abandon: Option<Box<dyn FnOnce(&mut Muxer, ChannelId)>>,
}

pub(crate) struct Detach {
    pub cb: DetachCallback,
    /// Reap without waiting for the full close handshake.
    pub close: bool,
}

/// The caller-registered capability set of a channel. Cleanup order on free
/// is explicit: status-confirm abandon callbacks first, then the filter
/// cleanup, with the detach callback guaranteed to have run exactly once.
#[derive(Default)]
pub(crate) struct ChannelCallbacks {
    pub open_confirm: Option<OpenConfirmCallback>,
    pub detach: Option<Detach>,
    pub input_filter: Option<InputFilter>,
    pub output_filter: Option<OutputFilter>,
    pub filter_cleanup: Option<FilterCleanup>,
    pub mux_read: Option<MuxCallback>,
}

pub struct Channel {
    pub id: ChannelId,
    pub remote_id: Option<u32>,
    pub ty: ChannelType,
    /// Channel type string sent on open ("session", "direct-tcpip", ...).
    pub ctype: &'static str,
    pub istate: InputState,
    pub ostate: OutputState,
    pub flags: ChannelFlags,
    pub extended_usage: ExtendedUsage,

    pub(crate) sock: Option<IoSlot>,
    pub(crate) rfd: Option<IoSlot>,
    pub(crate) wfd: Option<IoSlot>,
    pub(crate) efd: Option<IoSlot>,
    pub(crate) listen: Option<ListenSlot>,

    /// Bytes read locally, pending transmission to the peer.
    pub input: ByteBuffer,
    /// Bytes received from the peer, pending local delivery.
    pub output: ByteBuffer,
    /// Stderr-side data, direction per `extended_usage`.
    pub extended: ByteBuffer,

    pub local_window: u32,
    pub local_window_max: u32,
    pub local_consumed: u32,
    pub local_maxpacket: u32,
    pub remote_window: u32,
    pub remote_maxpacket: u32,

    /// Forwarding target host.
    pub path: Option<String>,
    pub host_port: u16,
    pub listening_addr: Option<String>,
    pub listening_port: u16,

    /// Treat the peer's EOF as permission to drain and close our input too.
    pub force_drain: bool,
    pub single_connection: bool,
    /// Created mid-tick; skip post-handlers until the next prepare pass.
    pub(crate) delayed: bool,
    /// Listener backoff after EMFILE-class accept failures.
    pub notbefore: Option<Instant>,
    /// Preserve message boundaries through the buffers.
    pub datagram: bool,
    pub is_tty: bool,
    /// Emit ignore-message cover traffic after local writes (tty channels
    /// whose owner knows echo is off).
    pub simulate_echo: bool,
    /// Suspend reading on a control-multiplexer channel while its request
    /// is in flight.
    pub mux_pause: bool,

    /// Human description for logs and the open-channel listing.
    pub remote_name: String,

    pub(crate) callbacks: ChannelCallbacks,
    pub(crate) status_confirms: VecDeque<StatusConfirm>,
    pub(crate) connect_ctx: Option<crate::connect::ConnectCtx>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        ty: ChannelType,
        ctype: &'static str,
        endpoints: Endpoints,
        window: u32,
        maxpacket: u32,
        extended_usage: ExtendedUsage,
        remote_name: String,
    ) -> Self {
        let (sock, rfd, wfd, efd, listen) = match endpoints {
            Endpoints::None => (None, None, None, None, None),
            Endpoints::Socket(stream) => (Some(IoSlot::new(stream)), None, None, None, None),
            Endpoints::Split { rfd, wfd, efd } => (
                None,
                rfd.map(IoSlot::new),
                wfd.map(IoSlot::new),
                efd.map(IoSlot::new),
                None,
            ),
            Endpoints::Listener(listener) => (None, None, None, None, Some(ListenSlot::new(listener))),
        };
        Channel {
            id,
            remote_id: None,
            ty,
            ctype,
            istate: InputState::Open,
            ostate: OutputState::Open,
            flags: ChannelFlags::empty(),
            extended_usage,
            sock,
            rfd,
            wfd,
            efd,
            listen,
            input: ByteBuffer::new(),
            output: ByteBuffer::new(),
            extended: ByteBuffer::new(),
            local_window: window,
            local_window_max: window,
            local_consumed: 0,
            local_maxpacket: maxpacket,
            remote_window: 0,
            remote_maxpacket: 0,
            path: None,
            host_port: 0,
            listening_addr: None,
            listening_port: 0,
            force_drain: false,
            single_connection: false,
            delayed: true,
            notbefore: None,
            datagram: false,
            is_tty: false,
            simulate_echo: false,
            mux_pause: false,
            remote_name,
            callbacks: ChannelCallbacks::default(),
            status_confirms: VecDeque::new(),
            connect_ctx: None,
        }
    }

    pub(crate) fn read_slot(&mut self) -> Option<&mut IoSlot> {
        self.sock.as_mut().or(self.rfd.as_mut())
    }

    pub(crate) fn write_slot(&mut self) -> Option<&mut IoSlot> {
        self.sock.as_mut().or(self.wfd.as_mut())
    }

    pub(crate) fn ext_slot(&mut self) -> Option<&mut IoSlot> {
        self.efd.as_mut()
    }

    pub(crate) fn want_read(&mut self) {
        if let Some(slot) = self.read_slot() {
            slot.want_read();
        }
    }

    pub(crate) fn want_write(&mut self) {
        if let Some(slot) = self.write_slot() {
            slot.want_write();
        }
    }

    pub(crate) fn clear_wants(&mut self) {
        for slot in [&mut self.sock, &mut self.rfd, &mut self.wfd, &mut self.efd]
            .into_iter()
            .flatten()
        {
            slot.want = None;
        }
        if let Some(listen) = &mut self.listen {
            listen.want = false;
        }
    }

    /// Readiness the pre-handlers asked for and the poller has delivered.
    pub(crate) fn has_actionable_readiness(&self) -> bool {
        let slots = [&self.sock, &self.rfd, &self.wfd, &self.efd];
        if slots.into_iter().flatten().any(|slot| slot.actionable()) {
            return true;
        }
        matches!(&self.listen, Some(listen) if listen.want && listen.readable)
    }

    pub(crate) fn readable(&self) -> bool {
        match (&self.sock, &self.rfd) {
            (Some(slot), _) | (None, Some(slot)) => slot.readable,
            _ => false,
        }
    }

    pub(crate) fn writable(&self) -> bool {
        match (&self.sock, &self.wfd) {
            (Some(slot), _) | (None, Some(slot)) => slot.writable,
            _ => false,
        }
    }

    pub(crate) fn has_read_endpoint(&self) -> bool {
        self.sock.is_some() || self.rfd.is_some()
    }

    pub(crate) fn has_write_endpoint(&self) -> bool {
        self.sock.is_some() || self.wfd.is_some()
    }

    /// Close the local read side: half-shutdown for sockets, drop for
    /// split descriptors.
    pub(crate) fn shutdown_read(&mut self) {
        if let Some(slot) = &mut self.sock {
            if let Err(err) = slot.stream.shutdown(Shutdown::Read) {
                tracing::debug!(channel=%self.id, %err, "shutdown read failed");
            }
            slot.readable = false;
        } else if self.rfd.take().is_some() {
            tracing::debug!(channel=%self.id, "closing read fd");
        }
    }

    /// Close the local write side.
    pub(crate) fn shutdown_write(&mut self) {
        if let Some(slot) = &mut self.sock {
            if let Err(err) = slot.stream.shutdown(Shutdown::Write) {
                tracing::debug!(channel=%self.id, %err, "shutdown write failed");
            }
            slot.writable = false;
        } else if self.wfd.take().is_some() {
            tracing::debug!(channel=%self.id, "closing write fd");
        }
    }

    /// Largest raw descriptor this channel holds, for the table's max-fd
    /// cache.
    pub(crate) fn max_fd(&self) -> RawFd {
        let mut max = -1;
        for slot in [&self.sock, &self.rfd, &self.wfd, &self.efd]
            .into_iter()
            .flatten()
        {
            max = max.max(slot.stream.raw_fd());
        }
        if let Some(listen) = &self.listen {
            max = max.max(listen.listener.raw_fd());
        }
        max
    }

    /// Originator address of the underlying socket, for forwarding opens.
    /// Endpoints without one get a placeholder some peers insist on
    /// validating.
    pub(crate) fn peer_or_placeholder(&mut self) -> (String, u32) {
        match self.sock.as_mut().and_then(|slot| slot.stream.peer()) {
            Some(addr) => (addr.ip().to_string(), addr.port() as u32),
            None => ("127.0.0.1".to_owned(), 65535),
        }
    }

    /// The stderr-capture stream still has (or may produce) data the peer
    /// has not seen; EOF must wait for it.
    pub(crate) fn efd_input_active(&self) -> bool {
        self.extended_usage == ExtendedUsage::Read
            && (self.efd.is_some() || !self.extended.is_empty())
    }

    /// The stderr-delivery stream still has (or may receive) data the local
    /// descriptor has not seen; output close must wait for it.
    pub(crate) fn efd_output_active(&self) -> bool {
        self.extended_usage == ExtendedUsage::Write
            && (self.efd.is_some() || !self.extended.is_empty())
    }

    /// Install endpoints after creation (larval activation).
    pub(crate) fn set_endpoints(&mut self, endpoints: Endpoints) {
        match endpoints {
            Endpoints::None => {}
            Endpoints::Socket(stream) => self.sock = Some(IoSlot::new(stream)),
            Endpoints::Split { rfd, wfd, efd } => {
                self.rfd = rfd.map(IoSlot::new);
                self.wfd = wfd.map(IoSlot::new);
                self.efd = efd.map(IoSlot::new);
            }
            Endpoints::Listener(listener) => self.listen = Some(ListenSlot::new(listener)),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("remote_id", &self.remote_id)
            .field("istate", &self.istate)
            .field("ostate", &self.ostate)
            .field("flags", &self.flags)
            .field("input", &self.input.len())
            .field("output", &self.output.len())
            .field("extended", &self.extended.len())
            .field("local_window", &self.local_window)
            .field("remote_window", &self.remote_window)
            .finish_non_exhaustive()
    }
}
