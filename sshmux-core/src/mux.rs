//! The multiplexer: one instance per SSH connection.
//!
//! Owns the channel table, the forwarding policy, the X11 spoof state and
//! the poller, and sits between two producers of work: inbound packets
//! handed to [`Muxer::dispatch`], and descriptor readiness handled by the
//! per-tick loop (`prepare` / `wait` / `post` / `output_poll`).
//!
//! The transport is a trait object that accepts already-encoded packets;
//! everything the transport owns (framing, crypto, key exchange) stays on
//! the other side of that boundary. Callers hold channels by id and
//! re-look-up per operation, which is what keeps the ownership graph a tree.

use std::io;
use std::net::Shutdown;
use std::path::PathBuf;

use bytes::Bytes;
use rand::RngCore;
use tracing::{debug, info, warn};

use sshmux_proto::{
    GlobalRequestKind, Message, OpenPayload, OPEN_ADMINISTRATIVELY_PROHIBITED, OPEN_CONNECT_FAILED,
    OPEN_UNKNOWN_CHANNEL_TYPE,
};

use crate::channel::{
    Channel, ChannelFlags, ChannelId, ChannelType, ConfirmStatus, Detach, DetachCallback,
    Endpoints, ExtendedUsage, FilterCleanup, InputFilter, OpenConfirmCallback, OpenFailed,
    OutputFilter, StatusConfirm, TCP_PACKET_DEFAULT, TCP_WINDOW_DEFAULT, X11_PACKET_DEFAULT,
    X11_WINDOW_DEFAULT,
};
use crate::connect::{AfPreference, ConnectCtx};
use crate::error::Error;
use crate::forward::ForwardPolicy;
use crate::poll::Poller;
use crate::state;
use crate::stream::ChannelStream;
use crate::table::ChannelTable;
use crate::x11::X11SpoofState;

/// Where outbound packets go. The implementation frames, encrypts and
/// writes; the multiplexer only guarantees the payload is one complete
/// connection-layer message.
pub trait Transport {
    fn send(&mut self, packet: Bytes) -> io::Result<()>;
}

pub(crate) fn send_message(t: &mut dyn Transport, message: &Message) -> Result<(), Error> {
    t.send(message.to_bytes()).map_err(Error::Transport)
}

/// Knobs that are connection-wide rather than per-channel.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// The transport's largest comfortable payload; used to judge output
    /// congestion, not to fragment.
    pub transport_packet_ceiling: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            transport_packet_ceiling: 32 * 1024,
        }
    }
}

/// What became of an inbound packet.
#[derive(Debug)]
pub enum Dispatched {
    Handled,
    /// Not a channel-layer concern (global requests and their replies);
    /// the caller owns these.
    Unhandled(Message),
}

/// Caller decision for channel types the core does not open by itself
/// ("session" and unknown types).
pub enum OpenDecision {
    /// The hook created this channel and wants the open confirmed.
    Accept(ChannelId),
    Reject {
        reason: u32,
        description: String,
    },
}

pub struct OpenRequest {
    pub sender_channel: u32,
    pub initial_window: u32,
    pub max_packet: u32,
    pub payload: OpenPayload,
}

pub type OpenHook = Box<dyn FnMut(&mut Muxer, &OpenRequest) -> OpenDecision>;

pub struct Muxer {
    pub(crate) table: ChannelTable,
    pub(crate) transport: Box<dyn Transport>,
    pub(crate) policy: ForwardPolicy,
    pub(crate) x11_spoof: Option<X11SpoofState>,
    pub(crate) poller: Poller,
    pub(crate) config: MuxConfig,
    pub(crate) af: AfPreference,
    pub(crate) agent_path: Option<PathBuf>,
    pub(crate) open_hook: Option<OpenHook>,
}

impl Muxer {
    pub fn new(transport: Box<dyn Transport>, config: MuxConfig) -> Result<Self, Error> {
        Ok(Muxer {
            table: ChannelTable::new(),
            transport,
            policy: ForwardPolicy::new(),
            x11_spoof: None,
            poller: Poller::new()?,
            config,
            af: AfPreference::Any,
            agent_path: None,
            open_hook: None,
        })
    }

    pub fn table(&self) -> &ChannelTable {
        &self.table
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.table.get(id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.table.get_mut(id)
    }

    pub fn policy(&self) -> &ForwardPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut ForwardPolicy {
        &mut self.policy
    }

    pub fn af_preference(&self) -> AfPreference {
        self.af
    }

    /// Restrict resolution and binds to one address family, for the whole
    /// session.
    pub fn set_af_preference(&mut self, af: AfPreference) {
        self.af = af;
    }

    /// Path of the local authentication-agent socket, enabling
    /// `auth-agent@openssh.com` opens from the peer.
    pub fn set_agent_path(&mut self, path: Option<PathBuf>) {
        self.agent_path = path;
    }

    /// Handler for "session" and other opens the core does not place.
    pub fn set_open_hook(&mut self, hook: OpenHook) {
        self.open_hook = Some(hook);
    }

    pub fn x11_spoof(&self) -> Option<&X11SpoofState> {
        self.x11_spoof.as_ref()
    }

    /// Bound address of a listener channel, e.g. to report an ephemeral
    /// port back to the user.
    pub fn listener_addr(&self, id: ChannelId) -> Option<std::net::SocketAddr> {
        self.table.get(id)?.listen.as_ref()?.listener.local_addr()
    }

    // -- channel lifecycle ------------------------------------------------

    /// Allocate a channel. Endpoints must already be non-blocking; the
    /// channel skips its first post pass so a creation mid-tick cannot see
    /// stale readiness.
    #[allow(clippy::too_many_arguments)]
    pub fn new_channel(
        &mut self,
        ty: ChannelType,
        ctype: &'static str,
        endpoints: Endpoints,
        window: u32,
        maxpacket: u32,
        extended_usage: ExtendedUsage,
        remote_name: &str,
    ) -> Result<ChannelId, Error> {
        let id = self.table.alloc_id()?;
        let channel = Channel::new(
            id,
            ty,
            ctype,
            endpoints,
            window,
            maxpacket,
            extended_usage,
            remote_name.to_owned(),
        );
        debug!(channel = %id, name = remote_name, "new channel");
        self.table.insert(channel);
        Ok(id)
    }

    /// Release a channel slot: shut the socket down, run the registered
    /// cleanup callbacks, and leave the slot free for reuse.
    pub fn free(&mut self, id: ChannelId) {
        let Some(mut channel) = self.table.take(id) else {
            return;
        };
        debug!(
            channel = %id,
            name = %channel.remote_name,
            remaining = self.table.len(),
            "free channel"
        );
        if let Some(slot) = &mut channel.sock {
            let _ = slot.stream.shutdown(Shutdown::Both);
        }
        // The detach callback must have run exactly once by the time the
        // slot is reusable; garbage collection is the normal path, this is
        // the forced one.
        if let Some(detach) = channel.callbacks.detach.take() {
            (detach.cb)(self, id);
        }
        for confirm in channel.status_confirms.drain(..) {
            if let Some(abandon) = confirm.abandon {
                abandon(self, id);
            }
        }
        if let Some(cleanup) = channel.callbacks.filter_cleanup.take() {
            cleanup(id);
        }
    }

    pub fn free_all(&mut self) {
        for id in self.table.ids() {
            self.free(id);
        }
    }

    /// Close every descriptor without freeing the channels; used to drop
    /// inherited descriptors after a fork.
    pub fn close_all_fds(&mut self) {
        for channel in self.table.iter_mut() {
            channel.sock = None;
            channel.rfd = None;
            channel.wfd = None;
            channel.efd = None;
            channel.listen = None;
        }
        self.table.recompute_max_fd();
    }

    /// Tear down forwarding listeners; existing forwarded connections
    /// continue.
    pub fn stop_listeners(&mut self) {
        for id in self.table.ids() {
            let is_listener = matches!(
                self.table.get(id).map(|c| c.ty),
                Some(
                    ChannelType::AgentListener
                        | ChannelType::PortListener
                        | ChannelType::RportListener
                        | ChannelType::X11Listener
                )
            );
            if is_listener {
                self.free(id);
            }
        }
    }

    /// Give up on a channel without waiting for its close handshake.
    pub fn abandon(&mut self, id: ChannelId) {
        if let Some(channel) = self.table.get_mut(id) {
            channel.ty = ChannelType::Abandoned;
        }
    }

    pub(crate) fn garbage_collect(&mut self, id: ChannelId) -> Result<(), Error> {
        let detach = {
            let Self {
                table, transport, ..
            } = self;
            let Some(channel) = table.get_mut(id) else {
                return Ok(());
            };
            let close = channel.callbacks.detach.as_ref().map(|detach| detach.close);
            match close {
                Some(close) => {
                    if !state::is_dead(channel, transport.as_mut(), close)? {
                        return Ok(());
                    }
                    debug!(channel = %id, "gc: notify user");
                    channel.callbacks.detach.take()
                }
                None => None,
            }
        };
        if let Some(detach) = detach {
            (detach.cb)(self, id);
            debug!(channel = %id, "gc: user detached");
        }
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.get_mut(id) else {
            return Ok(());
        };
        if !state::is_dead(channel, transport.as_mut(), true)? {
            return Ok(());
        }
        debug!(channel = %id, "garbage collecting");
        self.free(id);
        Ok(())
    }

    // -- registration hooks ----------------------------------------------

    pub fn register_open_confirm(&mut self, id: ChannelId, cb: OpenConfirmCallback) {
        match self.table.lookup(id.0) {
            Some(channel) => channel.callbacks.open_confirm = Some(cb),
            None => warn!(channel = %id, "register_open_confirm: bad id"),
        }
    }

    /// Register a callback invoked exactly once before the slot is freed.
    /// With `close`, the liveness check during collection may itself emit
    /// our CLOSE once both halves are down; without it, the callback waits
    /// for a close sent by other means.
    pub fn register_cleanup(&mut self, id: ChannelId, cb: DetachCallback, close: bool) {
        match self.table.by_id(id.0) {
            Some(channel) => channel.callbacks.detach = Some(Detach { cb, close }),
            None => warn!(channel = %id, "register_cleanup: bad id"),
        }
    }

    pub fn cancel_cleanup(&mut self, id: ChannelId) {
        match self.table.by_id(id.0) {
            Some(channel) => channel.callbacks.detach = None,
            None => warn!(channel = %id, "cancel_cleanup: bad id"),
        }
    }

    pub fn register_filter(
        &mut self,
        id: ChannelId,
        input: Option<InputFilter>,
        output: Option<OutputFilter>,
        cleanup: Option<FilterCleanup>,
    ) {
        match self.table.lookup(id.0) {
            Some(channel) => {
                channel.callbacks.input_filter = input;
                channel.callbacks.output_filter = output;
                channel.callbacks.filter_cleanup = cleanup;
            }
            None => warn!(channel = %id, "register_filter: bad id"),
        }
    }

    /// Queue a callback for the next CHANNEL_SUCCESS/FAILURE on this
    /// channel. Callbacks fire strictly in registration order; the abandon
    /// callback runs instead if the channel dies first.
    pub fn register_status_confirm(&mut self, id: ChannelId, confirm: StatusConfirm) {
        match self.table.lookup(id.0) {
            Some(channel) => channel.status_confirms.push_back(confirm),
            None => warn!(channel = %id, "register_status_confirm: bad id"),
        }
    }

    /// Bind endpoints to a larval channel and advertise its window,
    /// promoting it to OPEN.
    pub fn bind_endpoints(
        &mut self,
        id: ChannelId,
        endpoints: Endpoints,
        extended_usage: ExtendedUsage,
        is_tty: bool,
        window_max: u32,
    ) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.get_mut(id) else {
            return Err(Error::UnknownChannel(id.0));
        };
        if channel.ty != ChannelType::Larval {
            return Err(Error::UnexpectedState {
                id: id.0,
                message: "endpoint binding",
            });
        }
        channel.set_endpoints(endpoints);
        channel.extended_usage = extended_usage;
        channel.is_tty = is_tty;
        channel.ty = ChannelType::Open;
        channel.local_window = window_max;
        channel.local_window_max = window_max;
        let Some(remote_id) = channel.remote_id else {
            return Err(Error::UnexpectedState {
                id: id.0,
                message: "endpoint binding without remote id",
            });
        };
        send_message(
            transport.as_mut(),
            &Message::ChannelWindowAdjust {
                recipient_channel: remote_id,
                bytes_to_add: window_max,
            },
        )?;
        let fd = channel.max_fd();
        self.table.note_fd(fd);
        Ok(())
    }

    // -- outbound senders -------------------------------------------------

    /// Announce a locally created OPENING channel to the peer.
    pub fn send_open(&mut self, id: ChannelId) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.lookup(id.0) else {
            warn!(channel = %id, "send_open: bad id");
            return Ok(());
        };
        debug!(channel = %id, ctype = channel.ctype, "send open");
        let payload = match channel.ctype {
            "session" => OpenPayload::Session,
            "auth-agent@openssh.com" => OpenPayload::AuthAgent,
            other => OpenPayload::Other {
                ctype: other.to_owned(),
                data: Bytes::new(),
            },
        };
        send_message(
            transport.as_mut(),
            &Message::ChannelOpen {
                sender_channel: channel.id.0,
                initial_window: channel.local_window,
                max_packet: channel.local_maxpacket,
                payload,
            },
        )
    }

    /// Send a CHANNEL_REQUEST on an open channel.
    pub fn send_channel_request(
        &mut self,
        id: ChannelId,
        request: &str,
        payload: Bytes,
        want_reply: bool,
    ) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.lookup(id.0) else {
            warn!(channel = %id, "send_channel_request: bad id");
            return Ok(());
        };
        let Some(remote_id) = channel.remote_id else {
            warn!(channel = %id, request, "channel request before open confirmation");
            return Ok(());
        };
        debug!(channel = %id, request, want_reply, "channel request");
        send_message(
            transport.as_mut(),
            &Message::ChannelRequest {
                recipient_channel: remote_id,
                request: request.to_owned(),
                want_reply,
                payload,
            },
        )
    }

    pub fn send_global_request(
        &mut self,
        want_reply: bool,
        kind: GlobalRequestKind,
    ) -> Result<(), Error> {
        send_message(
            self.transport.as_mut(),
            &Message::GlobalRequest { want_reply, kind },
        )
    }

    /// Cover traffic: an IGNORE message with `len` random bytes.
    pub(crate) fn send_ignore(
        transport: &mut dyn Transport,
        len: usize,
    ) -> Result<(), Error> {
        let mut data = vec![0u8; len];
        rand::rng().fill_bytes(&mut data);
        send_message(
            transport,
            &Message::Ignore {
                data: Bytes::from(data),
            },
        )
    }

    // -- outbound connects ------------------------------------------------

    /// Check admission policy and open a CONNECTING channel to the target.
    /// `None` means the request was denied or no address was reachable;
    /// the caller answers the peer accordingly.
    pub fn connect_to(
        &mut self,
        host: &str,
        port: u16,
        ctype: &'static str,
        remote_name: &str,
    ) -> Result<Option<ChannelId>, Error> {
        if !self.policy.connect_allowed(host, port) {
            info!(
                host,
                port, "received request to connect, but the request was denied"
            );
            return Ok(None);
        }
        match self.start_connect(host, port, ctype, remote_name)? {
            Ok(id) => Ok(Some(id)),
            Err(err) => {
                info!(host, port, %err, "connect failed");
                Ok(None)
            }
        }
    }

    /// Open a CONNECTING channel to the target recorded for a remote
    /// forward with this listen port.
    pub fn connect_by_listen_port(
        &mut self,
        listen_port: u16,
        ctype: &'static str,
        remote_name: &str,
    ) -> Result<Option<ChannelId>, Error> {
        match self.policy.connect_target_for_listen_port(listen_port) {
            Some((host, port)) => match self.start_connect(&host, port, ctype, remote_name)? {
                Ok(id) => Ok(Some(id)),
                Err(err) => {
                    info!(host = %host, port, %err, "connect failed");
                    Ok(None)
                }
            },
            None => {
                warn!(
                    listen_port,
                    "server requested forwarding for unknown listen port"
                );
                Ok(None)
            }
        }
    }

    /// Resolve and begin a non-blocking connect, yielding a CONNECTING
    /// channel. The inner error covers resolution/connect trouble, which is
    /// a per-channel failure rather than a connection-fatal one.
    pub(crate) fn start_connect(
        &mut self,
        host: &str,
        port: u16,
        ctype: &'static str,
        remote_name: &str,
    ) -> Result<Result<ChannelId, io::Error>, Error> {
        let mut ctx = match ConnectCtx::resolve(host, port, self.af) {
            Ok(ctx) => ctx,
            Err(err) => return Ok(Err(err)),
        };
        let stream = match ctx.connect_next() {
            Ok(stream) => stream,
            Err(err) => return Ok(Err(err)),
        };
        let id = self.new_channel(
            ChannelType::Connecting,
            ctype,
            Endpoints::Socket(Box::new(stream)),
            TCP_WINDOW_DEFAULT,
            TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            remote_name,
        )?;
        if let Some(channel) = self.table.get_mut(id) {
            channel.path = Some(host.to_owned());
            channel.host_port = port;
            channel.connect_ctx = Some(ctx);
        }
        Ok(Ok(id))
    }

    /// Tunnel a pair of arbitrary descriptors to `host:port` as a
    /// "direct-tcpip" channel (ssh -W).
    pub fn connect_stdio_fwd(
        &mut self,
        host: &str,
        port: u16,
        rfd: Box<dyn ChannelStream>,
        wfd: Box<dyn ChannelStream>,
    ) -> Result<ChannelId, Error> {
        debug!(host, port, "stdio forward");
        let id = self.new_channel(
            ChannelType::Opening,
            "stdio-forward",
            Endpoints::Split {
                rfd: Some(rfd),
                wfd: Some(wfd),
                efd: None,
            },
            TCP_WINDOW_DEFAULT,
            TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "stdio-forward",
        )?;
        let Self {
            table, transport, ..
        } = self;
        if let Some(channel) = table.get_mut(id) {
            channel.path = Some(host.to_owned());
            channel.host_port = port;
            channel.listening_port = 0;
            channel.force_drain = true;
            port_open_helper(channel, transport.as_mut(), "direct-tcpip")?;
        }
        Ok(id)
    }

    /// Advertise X11 forwarding on a session channel, generating a fake
    /// cookie the remote applications will present.
    pub fn x11_request_forwarding_with_spoofing(
        &mut self,
        session: ChannelId,
        display: &str,
        proto: &str,
        hex_data: &str,
        want_reply: bool,
    ) -> Result<(), Error> {
        match &self.x11_spoof {
            Some(state) if state.display != display => {
                let requested_display = display;
                warn!(requested_display, "a different $DISPLAY is already forwarded");
                return Ok(());
            }
            Some(_) => {}
            None => {
                let state = X11SpoofState::generate(display, proto, hex_data).map_err(|_| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "bad X11 authentication data",
                    ))
                })?;
                self.x11_spoof = Some(state);
            }
        }
        let payload = {
            use bytes::BufMut;
            use sshmux_proto::SshBufMutExt;

            let state = self.x11_spoof.as_ref().ok_or(Error::UnexpectedState {
                id: session.0,
                message: "x11 forwarding request",
            })?;
            let mut buf = bytes::BytesMut::new();
            buf.put_ssh_bool(false); // single connection
            buf.put_ssh_string(state.proto.as_bytes());
            buf.put_ssh_string(state.fake_data_hex().as_bytes());
            buf.put_u32(state.screen);
            buf.freeze()
        };
        self.send_channel_request(session, "x11-req", payload, want_reply)
    }

    // -- inbound dispatch -------------------------------------------------

    /// Route one decrypted packet. Framing trouble is fatal to the
    /// connection; logical violations are logged and the packet dropped.
    pub fn dispatch(&mut self, packet: Bytes) -> Result<Dispatched, Error> {
        let message = Message::from_bytes(packet)?;
        self.dispatch_message(message)
    }

    pub fn dispatch_message(&mut self, message: Message) -> Result<Dispatched, Error> {
        match message {
            Message::ChannelData {
                recipient_channel,
                data,
            } => self.input_data(recipient_channel, data)?,
            Message::ChannelExtendedData {
                recipient_channel,
                data_type,
                data,
            } => self.input_extended_data(recipient_channel, data_type, data)?,
            Message::ChannelEof { recipient_channel } => self.input_eof(recipient_channel)?,
            Message::ChannelClose { recipient_channel } => self.input_close(recipient_channel)?,
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window,
                max_packet,
            } => self.input_open_confirmation(
                recipient_channel,
                sender_channel,
                initial_window,
                max_packet,
            )?,
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
                description,
                ..
            } => self.input_open_failure(recipient_channel, reason, description)?,
            Message::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => self.input_window_adjust(recipient_channel, bytes_to_add)?,
            Message::ChannelSuccess { recipient_channel } => {
                self.input_status_confirm(recipient_channel, ConfirmStatus::Success)?
            }
            Message::ChannelFailure { recipient_channel } => {
                self.input_status_confirm(recipient_channel, ConfirmStatus::Failure)?
            }
            Message::ChannelOpen {
                sender_channel,
                initial_window,
                max_packet,
                payload,
            } => self.input_open(sender_channel, initial_window, max_packet, payload)?,
            Message::Ignore { .. } => {}
            other => return Ok(Dispatched::Unhandled(other)),
        }
        Ok(Dispatched::Handled)
    }

    fn input_data(&mut self, recipient: u32, data: Bytes) -> Result<(), Error> {
        let Some(channel) = self.table.lookup(recipient) else {
            return Err(Error::UnknownChannel(recipient));
        };
        // Data for a channel past its open phase can legitimately cross a
        // close on the wire; drop it.
        if channel.ty != ChannelType::Open && channel.ty != ChannelType::X11Open {
            return Ok(());
        }
        let win_len = data.len() as u64 + if channel.datagram { 4 } else { 0 };

        if channel.ostate != crate::channel::OutputState::Open {
            // The sender debits its window as it sends; consumption must be
            // faked even for data we discard or the window deadlocks.
            if win_len > channel.local_window as u64 {
                warn!(channel = %channel.id, len = win_len, window = channel.local_window,
                    "discarded data exceeds window");
                return Ok(());
            }
            channel.local_window -= win_len as u32;
            channel.local_consumed += win_len as u32;
            return Ok(());
        }
        if win_len > channel.local_window as u64 {
            warn!(channel = %channel.id, len = win_len, window = channel.local_window,
                "rcvd too much data");
            return Ok(());
        }
        if win_len > channel.local_maxpacket as u64 {
            // Oversized packets are discarded, but the bytes still count
            // against the window the sender already debited.
            warn!(channel = %channel.id, len = win_len, maxpacket = channel.local_maxpacket,
                "rcvd big packet, discarding");
            channel.local_window -= win_len as u32;
            channel.local_consumed += win_len as u32;
            return Ok(());
        }
        channel.local_window -= win_len as u32;
        let appended = if channel.datagram {
            channel.output.put_string(&data)
        } else {
            channel.output.put(&data)
        };
        if let Err(err) = appended {
            warn!(channel = %channel.id, %err, "output buffer overflow");
            state::mark_dead(channel);
        }
        Ok(())
    }

    fn input_extended_data(&mut self, recipient: u32, tcode: u32, data: Bytes) -> Result<(), Error> {
        let Some(channel) = self.table.lookup(recipient) else {
            return Err(Error::UnknownChannel(recipient));
        };
        if channel.ty != ChannelType::Open {
            warn!(channel = %channel.id, "extended data for non-open channel");
            return Ok(());
        }
        if channel.flags.contains(ChannelFlags::EOF_RCVD) {
            return Err(Error::DataAfterEof(recipient));
        }
        if channel.efd.is_none()
            || channel.extended_usage != ExtendedUsage::Write
            || tcode != sshmux_proto::EXTENDED_DATA_STDERR
        {
            warn!(channel = %channel.id, tcode, "bad extended data");
            return Ok(());
        }
        if data.len() as u64 > channel.local_window as u64 {
            warn!(channel = %channel.id, len = data.len(), window = channel.local_window,
                "rcvd too much extended data");
            return Ok(());
        }
        if data.len() as u64 > channel.local_maxpacket as u64 {
            warn!(channel = %channel.id, len = data.len(), maxpacket = channel.local_maxpacket,
                "rcvd big extended packet, discarding");
            channel.local_window -= data.len() as u32;
            channel.local_consumed += data.len() as u32;
            return Ok(());
        }
        debug!(channel = %channel.id, len = data.len(), "rcvd extended data");
        channel.local_window -= data.len() as u32;
        if let Err(err) = channel.extended.put(&data) {
            warn!(channel = %channel.id, %err, "extended buffer overflow");
            state::mark_dead(channel);
        }
        Ok(())
    }

    fn input_eof(&mut self, recipient: u32) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.lookup(recipient) else {
            return Err(Error::UnknownChannel(recipient));
        };
        state::rcvd_eof(channel);
        // Channels that will never read more locally treat the peer's EOF
        // as permission to wind down the input half too.
        if channel.force_drain && channel.istate == crate::channel::InputState::Open {
            debug!(channel = %channel.id, "forcing input drain");
            channel.istate = crate::channel::InputState::WaitDrain;
            if channel.input.is_empty() {
                state::ibuf_empty(channel, transport.as_mut())?;
            }
        }
        Ok(())
    }

    fn input_close(&mut self, recipient: u32) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.lookup(recipient) else {
            return Err(Error::UnknownChannel(recipient));
        };
        state::rcvd_close(channel, transport.as_mut())
    }

    fn input_open_confirmation(
        &mut self,
        recipient: u32,
        sender: u32,
        window: u32,
        maxpacket: u32,
    ) -> Result<(), Error> {
        let id = {
            let Some(channel) = self.table.lookup(recipient) else {
                return Err(Error::UnknownChannel(recipient));
            };
            if channel.ty != ChannelType::Opening {
                return Err(Error::UnexpectedState {
                    id: recipient,
                    message: "open confirmation",
                });
            }
            channel.remote_id = Some(sender);
            channel.ty = ChannelType::Open;
            channel.remote_window = window;
            channel.remote_maxpacket = maxpacket;
            debug!(channel = %channel.id, rwindow = window, rmax = maxpacket, "open confirmed");
            channel.id
        };
        let cb = self
            .table
            .get_mut(id)
            .and_then(|c| c.callbacks.open_confirm.take());
        if let Some(cb) = cb {
            cb(self, id, Ok(()));
        }
        Ok(())
    }

    fn input_open_failure(
        &mut self,
        recipient: u32,
        reason: u32,
        description: String,
    ) -> Result<(), Error> {
        let id = {
            let Some(channel) = self.table.lookup(recipient) else {
                return Err(Error::UnknownChannel(recipient));
            };
            if channel.ty != ChannelType::Opening {
                return Err(Error::UnexpectedState {
                    id: recipient,
                    message: "open failure",
                });
            }
            info!(
                channel = %channel.id,
                reason = sshmux_proto::open_failure_reason(reason),
                description = %description,
                "open failed"
            );
            channel.id
        };
        let cb = self
            .table
            .get_mut(id)
            .and_then(|c| c.callbacks.open_confirm.take());
        if let Some(cb) = cb {
            cb(
                self,
                id,
                Err(OpenFailed {
                    reason,
                    description,
                }),
            );
        }
        if let Some(channel) = self.table.get_mut(id) {
            state::mark_dead(channel);
        }
        Ok(())
    }

    fn input_window_adjust(&mut self, recipient: u32, adjust: u32) -> Result<(), Error> {
        let Some(channel) = self.table.lookup(recipient) else {
            warn!(channel = recipient, "window adjust for non-open channel");
            return Ok(());
        };
        debug!(channel = %channel.id, adjust, "rcvd window adjust");
        match channel.remote_window.checked_add(adjust) {
            Some(window) => channel.remote_window = window,
            None => {
                warn!(channel = %channel.id, adjust, "window adjust overflows, clamping");
                channel.remote_window = u32::MAX;
            }
        }
        Ok(())
    }

    fn input_status_confirm(&mut self, recipient: u32, status: ConfirmStatus) -> Result<(), Error> {
        let (id, confirm) = {
            let Some(channel) = self.table.lookup(recipient) else {
                warn!(channel = recipient, "status confirm for unknown channel");
                return Ok(());
            };
            (channel.id, channel.status_confirms.pop_front())
        };
        if let Some(confirm) = confirm {
            (confirm.cb)(self, id, status);
        }
        Ok(())
    }

    /// Peer-initiated channel open.
    fn input_open(
        &mut self,
        sender: u32,
        window: u32,
        maxpacket: u32,
        payload: OpenPayload,
    ) -> Result<(), Error> {
        debug!(ctype = payload.channel_type(), sender, "rcvd channel open");
        let result: Result<ChannelId, (u32, String)> = match &payload {
            OpenPayload::DirectTcpip {
                host,
                port,
                originator,
                originator_port,
            } => {
                debug!(host = %host, port, originator = %originator, originator_port,
                    "direct-tcpip request");
                match u16::try_from(*port) {
                    Err(_) => Err((
                        OPEN_ADMINISTRATIVELY_PROHIBITED,
                        "invalid port".to_owned(),
                    )),
                    Ok(port) => match self.connect_to(host.as_str(), port, "direct-tcpip", "connected socket")? {
                        Some(id) => Ok(id),
                        None => Err((OPEN_ADMINISTRATIVELY_PROHIBITED, "open failed".to_owned())),
                    },
                }
            }
            OpenPayload::ForwardedTcpip { port, .. } => match u16::try_from(*port) {
                Err(_) => Err((
                    OPEN_ADMINISTRATIVELY_PROHIBITED,
                    "invalid port".to_owned(),
                )),
                Ok(port) => {
                    match self.connect_by_listen_port(port, "forwarded-tcpip", "forwarded socket")? {
                        Some(id) => Ok(id),
                        None => Err((OPEN_ADMINISTRATIVELY_PROHIBITED, "open failed".to_owned())),
                    }
                }
            },
            OpenPayload::X11 {
                originator,
                originator_port,
            } => {
                debug!(originator = %originator, originator_port, "x11 open request");
                let display = self.x11_spoof.as_ref().map(|state| state.display.clone());
                match display {
                    None => Err((
                        OPEN_ADMINISTRATIVELY_PROHIBITED,
                        "X11 forwarding not requested".to_owned(),
                    )),
                    Some(display) => {
                        match crate::x11::connect_display(&display, self.af) {
                            Err(err) => Err((OPEN_CONNECT_FAILED, err.to_string())),
                            Ok(stream) => {
                                let id = self.new_channel(
                                    ChannelType::X11Open,
                                    "x11",
                                    Endpoints::Socket(stream),
                                    X11_WINDOW_DEFAULT,
                                    X11_PACKET_DEFAULT,
                                    ExtendedUsage::Ignore,
                                    "connected x11 socket",
                                )?;
                                if let Some(channel) = self.table.get_mut(id) {
                                    channel.force_drain = true;
                                }
                                Ok(id)
                            }
                        }
                    }
                }
            }
            OpenPayload::AuthAgent => match self.agent_path.clone() {
                None => Err((
                    OPEN_ADMINISTRATIVELY_PROHIBITED,
                    "agent forwarding disabled".to_owned(),
                )),
                Some(path) => match std::os::unix::net::UnixStream::connect(&path) {
                    Err(err) => Err((OPEN_CONNECT_FAILED, err.to_string())),
                    Ok(stream) => {
                        stream.set_nonblocking(true)?;
                        let stream = mio::net::UnixStream::from_std(stream);
                        Ok(self.new_channel(
                            ChannelType::Open,
                            "auth-agent@openssh.com",
                            Endpoints::Socket(Box::new(stream)),
                            TCP_WINDOW_DEFAULT,
                            TCP_PACKET_DEFAULT,
                            ExtendedUsage::Ignore,
                            "agent connection",
                        )?)
                    }
                },
            },
            OpenPayload::Session | OpenPayload::Other { .. } => {
                let request = OpenRequest {
                    sender_channel: sender,
                    initial_window: window,
                    max_packet: maxpacket,
                    payload: payload.clone(),
                };
                match self.open_hook.take() {
                    Some(mut hook) => {
                        let decision = hook(self, &request);
                        self.open_hook = Some(hook);
                        match decision {
                            OpenDecision::Accept(id) => Ok(id),
                            OpenDecision::Reject {
                                reason,
                                description,
                            } => Err((reason, description)),
                        }
                    }
                    None => Err((
                        OPEN_UNKNOWN_CHANNEL_TYPE,
                        format!("unknown channel type {}", payload.channel_type()),
                    )),
                }
            }
        };

        match result {
            Ok(id) => {
                let Self {
                    table, transport, ..
                } = self;
                let Some(channel) = table.get_mut(id) else {
                    return Ok(());
                };
                channel.remote_id = Some(sender);
                channel.remote_window = window;
                channel.remote_maxpacket = maxpacket;
                if channel.ty != ChannelType::Connecting {
                    send_message(
                        transport.as_mut(),
                        &Message::ChannelOpenConfirmation {
                            recipient_channel: sender,
                            sender_channel: channel.id.0,
                            initial_window: channel.local_window,
                            max_packet: channel.local_maxpacket,
                        },
                    )?;
                }
            }
            Err((reason, description)) => {
                send_message(
                    self.transport.as_mut(),
                    &Message::ChannelOpenFailure {
                        recipient_channel: sender,
                        reason,
                        description,
                        language: String::new(),
                    },
                )?;
            }
        }
        Ok(())
    }

    // -- flow control ------------------------------------------------------

    /// Move buffered local input onto the wire, bounded by the peer's
    /// window and packet ceiling. Runs once per tick.
    pub fn output_poll(&mut self) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        for channel in table.iter_mut() {
            if channel.ty != ChannelType::Open {
                continue;
            }
            if channel
                .flags
                .intersects(ChannelFlags::CLOSE_SENT | ChannelFlags::CLOSE_RCVD)
            {
                continue;
            }
            let Some(remote_id) = channel.remote_id else {
                continue;
            };

            use crate::channel::InputState;
            if matches!(channel.istate, InputState::Open | InputState::WaitDrain)
                && !channel.input.is_empty()
            {
                if channel.datagram {
                    if let Some(data) = channel.input.get_string() {
                        let len = data.len() as u64;
                        if len > channel.remote_window as u64
                            || len > channel.remote_maxpacket as u64
                        {
                            debug!(channel = %channel.id, len, "datagram too big for channel");
                        } else {
                            send_message(
                                transport.as_mut(),
                                &Message::ChannelData {
                                    recipient_channel: remote_id,
                                    data,
                                },
                            )?;
                            channel.remote_window -= len as u32 + 4;
                        }
                    }
                    continue;
                }
                let len = (channel.input.len() as u64)
                    .min(channel.remote_window as u64)
                    .min(channel.remote_maxpacket as u64) as usize;
                if len > 0 {
                    let data = Bytes::copy_from_slice(&channel.input.bytes()[..len]);
                    send_message(
                        transport.as_mut(),
                        &Message::ChannelData {
                            recipient_channel: remote_id,
                            data,
                        },
                    )?;
                    channel.input.consume(len);
                    channel.remote_window -= len as u32;
                }
            } else if channel.istate == InputState::WaitDrain {
                // Input drained and the read side is gone; EOF unless the
                // extended stream still has something to say.
                if channel.efd_input_active() {
                    debug!(channel = %channel.id, pending = channel.extended.len(),
                        "ibuf_empty delayed by extended data");
                } else {
                    state::ibuf_empty(channel, transport.as_mut())?;
                }
            }

            // Stderr-side data shares the same window.
            if !channel.flags.contains(ChannelFlags::EOF_SENT)
                && channel.remote_window > 0
                && !channel.extended.is_empty()
                && channel.extended_usage == ExtendedUsage::Read
            {
                let len = (channel.extended.len() as u64)
                    .min(channel.remote_window as u64)
                    .min(channel.remote_maxpacket as u64) as usize;
                if len > 0 {
                    let data = Bytes::copy_from_slice(&channel.extended.bytes()[..len]);
                    send_message(
                        transport.as_mut(),
                        &Message::ChannelExtendedData {
                            recipient_channel: remote_id,
                            data_type: sshmux_proto::EXTENDED_DATA_STDERR,
                            data,
                        },
                    )?;
                    channel.extended.consume(len);
                    channel.remote_window -= len as u32;
                    debug!(channel = %channel.id, len, "sent extended data");
                }
            }
        }
        Ok(())
    }

    // -- liveness and listing ---------------------------------------------

    /// A report of the open connections, suitable for an escape-sequence
    /// status menu.
    pub fn open_channel_listing(&self) -> String {
        let mut out = String::from("The following connections are open:\r\n");
        for channel in self.table.iter() {
            match channel.ty {
                ChannelType::Larval
                | ChannelType::Opening
                | ChannelType::Connecting
                | ChannelType::Dynamic
                | ChannelType::Open
                | ChannelType::X11Open => {
                    out.push_str(&format!(
                        "  #{} {} (t:{:?} r:{} i:{:?}/{} o:{:?}/{})\r\n",
                        channel.id,
                        channel.remote_name,
                        channel.ty,
                        channel
                            .remote_id
                            .map(|id| id.to_string())
                            .unwrap_or_else(|| "-".to_owned()),
                        channel.istate,
                        channel.input.len(),
                        channel.ostate,
                        channel.output.len(),
                    ));
                }
                _ => {}
            }
        }
        out
    }

    /// True while any channel that counts as user traffic remains open.
    pub fn any_channel_still_open(&self) -> bool {
        self.table.iter().any(|channel| {
            matches!(
                channel.ty,
                ChannelType::Opening
                    | ChannelType::Open
                    | ChannelType::X11Open
                    | ChannelType::MuxClient
            )
        })
    }

    /// An open channel suitable as a keepalive target.
    pub fn find_open_channel(&self) -> Option<ChannelId> {
        self.table
            .iter()
            .find(|channel| {
                matches!(
                    channel.ty,
                    ChannelType::Larval
                        | ChannelType::AgentListener
                        | ChannelType::Open
                        | ChannelType::X11Open
                )
            })
            .map(|channel| channel.id)
    }

    /// False when some open channel has more buffered output than the
    /// transport wants to swallow; callers use it to pace reads from the
    /// network.
    pub fn output_not_congested(&self) -> bool {
        !self.table.iter().any(|channel| {
            channel.ty == ChannelType::Open
                && channel.output.len() > self.config.transport_packet_ceiling
        })
    }
}

/// Emit the WINDOW_ADJUST when enough has been locally consumed, per the
/// classic predicate: the channel is open, no close is in flight, and the
/// deficit is either past three packets or past half the window.
pub(crate) fn check_window(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    if c.ty == ChannelType::Open
        && !c
            .flags
            .intersects(ChannelFlags::CLOSE_SENT | ChannelFlags::CLOSE_RCVD)
        && ((c.local_window_max.saturating_sub(c.local_window) > 3 * c.local_maxpacket)
            || c.local_window < c.local_window_max / 2)
        && c.local_consumed > 0
    {
        let Some(remote_id) = c.remote_id else {
            return Ok(());
        };
        send_message(
            t,
            &Message::ChannelWindowAdjust {
                recipient_channel: remote_id,
                bytes_to_add: c.local_consumed,
            },
        )?;
        debug!(channel = %c.id, window = c.local_window, adjust = c.local_consumed,
            "sent window adjust");
        c.local_window += c.local_consumed;
        c.local_consumed = 0;
    }
    Ok(())
}

/// Announce a forwarded connection to the peer, with the originator
/// recorded in the channel description.
pub(crate) fn port_open_helper(
    c: &mut Channel,
    t: &mut dyn Transport,
    rtype: &'static str,
) -> Result<(), Error> {
    let (originator, originator_port) = c.peer_or_placeholder();
    let direct = rtype == "direct-tcpip";
    let path = c.path.clone().unwrap_or_default();
    c.remote_name = format!(
        "{}: listening port {} for {} port {}, connect from {} port {}",
        rtype, c.listening_port, path, c.host_port, originator, originator_port,
    );
    let payload = if direct {
        OpenPayload::DirectTcpip {
            host: path,
            port: c.host_port as u32,
            originator,
            originator_port,
        }
    } else {
        OpenPayload::ForwardedTcpip {
            address: path,
            port: c.listening_port as u32,
            originator,
            originator_port,
        }
    };
    send_message(
        t,
        &Message::ChannelOpen {
            sender_channel: c.id.0,
            initial_window: c.local_window_max,
            max_packet: c.local_maxpacket,
            payload,
        },
    )
}
