//! The readiness loop: per-tick pre-handlers (declare interest), the wait,
//! per-tick post-handlers (perform I/O), and garbage collection.
//!
//! Handlers are selected by channel type with exhaustive matches; a type
//! with no business in a phase simply has no arm. Channels created during a
//! tick are `delayed`: they skip post-handlers until the next prepare pass
//! so they never act on another channel's stale readiness.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use sshmux_proto::{Message, OpenPayload, OPEN_CONNECT_FAILED};

use crate::channel::{
    Channel, ChannelId, ChannelType, Endpoints, ExtendedUsage, FilterVerdict, InputState,
    OutputState, MUX_PACKET_MAX, READ_CHUNK,
};
use crate::error::Error;
use crate::mux::{check_window, port_open_helper, send_message, Muxer, Transport};
use crate::socks::{self, SocksProgress};
use crate::state;
use crate::stream::{ChannelStream, IoSlot};
use crate::x11::{self, SpoofResult, X11SpoofState};

/// Listener pause after running out of descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

impl Muxer {
    /// Phase one of a tick: run pre-handlers, sync poll registrations, and
    /// return a bound for the caller's wait (earliest listener unpause, or
    /// zero when latched readiness is already actionable).
    pub fn prepare(&mut self, now: Instant) -> Result<Option<Duration>, Error> {
        let mut unpause: Option<Duration> = None;
        for id in self.table.ids() {
            let run = {
                let Some(channel) = self.table.get_mut(id) else {
                    continue;
                };
                channel.clear_wants();
                if channel.delayed {
                    channel.delayed = false;
                }
                match channel.notbefore {
                    Some(notbefore) if notbefore > now => {
                        let wait = notbefore - now;
                        debug!(channel = %id, ?wait, "paused");
                        unpause = Some(unpause.map_or(wait, |u| u.min(wait)));
                        false
                    }
                    _ => true,
                }
            };
            if run {
                self.pre_channel(id)?;
            }
            self.garbage_collect(id)?;
        }
        self.poller.sync(&mut self.table)?;

        let mut timeout = unpause;
        if self.table.iter().any(Channel::has_actionable_readiness) {
            timeout = Some(Duration::ZERO);
        }
        Ok(timeout)
    }

    /// Phase two: the single blocking point of the loop.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.poller.wait(timeout, &mut self.table)?;
        Ok(())
    }

    /// Phase three: act on readiness, then reap the dead.
    pub fn post(&mut self, now: Instant) -> Result<(), Error> {
        for id in self.table.ids() {
            let run = {
                let Some(channel) = self.table.get(id) else {
                    continue;
                };
                !channel.delayed && channel.notbefore.map_or(true, |nb| nb <= now)
            };
            if run {
                self.post_channel(id, now)?;
            }
            self.garbage_collect(id)?;
        }
        Ok(())
    }

    /// One full turn of the loop: prepare, wait (bounded by `timeout`),
    /// post, then enqueue outbound data under flow control.
    pub fn tick(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let hint = self.prepare(Instant::now())?;
        let effective = match (timeout, hint) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, hint) => hint,
        };
        self.wait(effective)?;
        self.post(Instant::now())?;
        self.output_poll()
    }

    fn pre_channel(&mut self, id: ChannelId) -> Result<(), Error> {
        let Self {
            table,
            transport,
            x11_spoof,
            ..
        } = self;
        let Some(channel) = table.get_mut(id) else {
            return Ok(());
        };
        match channel.ty {
            ChannelType::Open => pre_open(channel),
            ChannelType::X11Open => {
                pre_x11_open(channel, x11_spoof.as_ref(), transport.as_mut())?
            }
            ChannelType::Dynamic => pre_dynamic(channel, transport.as_mut())?,
            ChannelType::Connecting => {
                debug!(channel = %id, "waiting for connection");
                if let Some(slot) = &mut channel.sock {
                    slot.want_write();
                }
            }
            ChannelType::MuxClient => pre_mux_client(channel, transport.as_mut())?,
            ty if ty.is_listener() => {
                if let Some(listen) = &mut channel.listen {
                    listen.want = true;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn post_channel(&mut self, id: ChannelId, now: Instant) -> Result<(), Error> {
        let ty = match self.table.get(id) {
            Some(channel) => channel.ty,
            None => return Ok(()),
        };
        match ty {
            // Dynamic channels share the open post-handler: it moves the
            // SOCKS bytes in and the replies out.
            ChannelType::Open | ChannelType::Dynamic => self.post_open(id),
            ChannelType::Connecting => self.post_connecting(id),
            ChannelType::PortListener | ChannelType::RportListener => {
                self.post_port_listener(id, now)
            }
            ChannelType::X11Listener => self.post_x11_listener(id, now),
            ChannelType::AgentListener => self.post_agent_listener(id, now),
            ChannelType::MuxListener => self.post_mux_listener(id, now),
            ChannelType::MuxClient => self.post_mux_client(id),
            _ => Ok(()),
        }
    }

    fn post_open(&mut self, id: ChannelId) -> Result<(), Error> {
        let Self {
            table, transport, ..
        } = self;
        let Some(channel) = table.get_mut(id) else {
            return Ok(());
        };
        handle_rfd(channel)?;
        handle_wfd(channel, transport.as_mut())?;
        handle_efd(channel);
        check_window(channel, transport.as_mut())
    }

    fn post_connecting(&mut self, id: ChannelId) -> Result<(), Error> {
        let retried = {
            let Self {
                table, transport, ..
            } = self;
            let Some(channel) = table.get_mut(id) else {
                return Ok(());
            };
            let ready = match &channel.sock {
                Some(slot) => slot.want.map_or(false, |i| i.is_writable()) && slot.writable,
                None => false,
            };
            if !ready {
                return Ok(());
            }
            let pending = match channel.sock.as_mut() {
                Some(slot) => match slot.stream.take_error() {
                    Ok(err) => err,
                    Err(err) => Some(err),
                },
                None => return Ok(()),
            };
            match pending {
                None => {
                    if let Some(ctx) = &channel.connect_ctx {
                        debug!(channel = %id, host = %ctx.host, port = ctx.port, "connected");
                    }
                    channel.connect_ctx = None;
                    channel.ty = ChannelType::Open;
                    let Some(remote_id) = channel.remote_id else {
                        error!(channel = %id, "connecting channel has no remote id");
                        state::mark_dead(channel);
                        return Ok(());
                    };
                    send_message(
                        transport.as_mut(),
                        &Message::ChannelOpenConfirmation {
                            recipient_channel: remote_id,
                            sender_channel: channel.id.value(),
                            initial_window: channel.local_window,
                            max_packet: channel.local_maxpacket,
                        },
                    )?;
                    false
                }
                Some(err) => {
                    debug!(channel = %id, %err, "connection failed");
                    // Try the next resolved address, reusing the slot.
                    let next = channel
                        .connect_ctx
                        .as_mut()
                        .map(|ctx| ctx.connect_next())
                        .transpose()
                        .ok()
                        .flatten();
                    match next {
                        Some(stream) => {
                            channel.sock = Some(IoSlot::new(Box::new(stream)));
                            true
                        }
                        None => {
                            if let Some(ctx) = &channel.connect_ctx {
                                error!(host = %ctx.host, port = ctx.port, "connect failed on all addresses");
                            }
                            channel.connect_ctx = None;
                            if let Some(remote_id) = channel.remote_id {
                                send_message(
                                    transport.as_mut(),
                                    &Message::ChannelOpenFailure {
                                        recipient_channel: remote_id,
                                        reason: OPEN_CONNECT_FAILED,
                                        description: err.to_string(),
                                        language: String::new(),
                                    },
                                )?;
                            }
                            state::mark_dead(channel);
                            false
                        }
                    }
                }
            }
        };
        if retried {
            self.table.recompute_max_fd();
        }
        Ok(())
    }

    fn post_port_listener(&mut self, id: ChannelId, now: Instant) -> Result<(), Error> {
        struct Accepted {
            stream: Box<dyn ChannelStream>,
            next_state: ChannelType,
            rtype: &'static str,
            window: u32,
            maxpacket: u32,
            listening_port: u16,
            host_port: u16,
            path: Option<String>,
        }
        let accepted = {
            let Some(channel) = self.table.get_mut(id) else {
                return Ok(());
            };
            if !listener_ready(channel) {
                return Ok(());
            }
            debug!(
                port = channel.listening_port,
                target = channel.path.as_deref().unwrap_or(""),
                target_port = channel.host_port,
                "connection to forwarded port requested"
            );
            let (next_state, rtype): (ChannelType, &'static str) =
                if channel.ty == ChannelType::RportListener {
                    (ChannelType::Opening, "forwarded-tcpip")
                } else if channel.host_port == 0 {
                    (ChannelType::Dynamic, "dynamic-tcpip")
                } else {
                    (ChannelType::Opening, "direct-tcpip")
                };
            match accept_on(channel, now) {
                None => return Ok(()),
                Some((stream, _)) => Accepted {
                    stream,
                    next_state,
                    rtype,
                    window: channel.local_window_max,
                    maxpacket: channel.local_maxpacket,
                    listening_port: channel.listening_port,
                    host_port: channel.host_port,
                    path: channel.path.clone(),
                },
            }
        };

        let child = self.new_channel(
            accepted.next_state,
            accepted.rtype,
            Endpoints::Socket(accepted.stream),
            accepted.window,
            accepted.maxpacket,
            ExtendedUsage::Ignore,
            accepted.rtype,
        )?;
        let Self {
            table, transport, ..
        } = self;
        if let Some(channel) = table.get_mut(child) {
            channel.listening_port = accepted.listening_port;
            channel.host_port = accepted.host_port;
            channel.path = accepted.path;
            if accepted.next_state != ChannelType::Dynamic {
                port_open_helper(channel, transport.as_mut(), accepted.rtype)?;
            }
        }
        Ok(())
    }

    fn post_x11_listener(&mut self, id: ChannelId, now: Instant) -> Result<(), Error> {
        let accepted = {
            let Some(channel) = self.table.get_mut(id) else {
                return Ok(());
            };
            if !listener_ready(channel) {
                return Ok(());
            }
            debug!("X11 connection requested");
            let result = accept_on(channel, now);
            if channel.single_connection {
                debug!("single_connection: closing X11 listener");
                channel.listen = None;
                state::mark_dead(channel);
            }
            match result {
                None => return Ok(()),
                Some((stream, peer)) => (
                    stream,
                    peer,
                    channel.local_window_max,
                    channel.local_maxpacket,
                ),
            }
        };
        let (stream, peer, window, maxpacket) = accepted;
        let (originator, originator_port) = match peer {
            Some(addr) => (addr.ip().to_string(), addr.port() as u32),
            None => ("127.0.0.1".to_owned(), 65535),
        };
        let name = format!("X11 connection from {originator} port {originator_port}");
        let child = self.new_channel(
            ChannelType::Opening,
            "x11",
            Endpoints::Socket(stream),
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            &name,
        )?;
        send_message(
            self.transport.as_mut(),
            &Message::ChannelOpen {
                sender_channel: child.value(),
                initial_window: window,
                max_packet: maxpacket,
                payload: OpenPayload::X11 {
                    originator,
                    originator_port,
                },
            },
        )
    }

    fn post_agent_listener(&mut self, id: ChannelId, now: Instant) -> Result<(), Error> {
        let accepted = {
            let Some(channel) = self.table.get_mut(id) else {
                return Ok(());
            };
            if !listener_ready(channel) {
                return Ok(());
            }
            match accept_on(channel, now) {
                None => return Ok(()),
                Some((stream, _)) => (stream, channel.local_window_max, channel.local_maxpacket),
            }
        };
        let (stream, window, maxpacket) = accepted;
        let child = self.new_channel(
            ChannelType::Opening,
            "auth-agent@openssh.com",
            Endpoints::Socket(stream),
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            "accepted auth socket",
        )?;
        send_message(
            self.transport.as_mut(),
            &Message::ChannelOpen {
                sender_channel: child.value(),
                initial_window: window,
                max_packet: maxpacket,
                payload: OpenPayload::AuthAgent,
            },
        )
    }

    fn post_mux_listener(&mut self, id: ChannelId, now: Instant) -> Result<(), Error> {
        let accepted = {
            let Some(channel) = self.table.get_mut(id) else {
                return Ok(());
            };
            if !listener_ready(channel) {
                return Ok(());
            }
            debug!("multiplexing control connection");
            match accept_on(channel, now) {
                None => return Ok(()),
                Some((stream, _)) => (
                    stream,
                    channel.local_window_max,
                    channel.local_maxpacket,
                    channel.callbacks.mux_read.clone(),
                ),
            }
        };
        let (stream, window, maxpacket, callback) = accepted;
        let child = self.new_channel(
            ChannelType::MuxClient,
            "mux-control",
            Endpoints::Socket(stream),
            window,
            maxpacket,
            ExtendedUsage::Ignore,
            "multiplex client",
        )?;
        if let Some(channel) = self.table.get_mut(child) {
            channel.callbacks.mux_read = callback.clone();
            // Mux state transitions must not elicit protocol messages.
            channel.flags |= crate::channel::ChannelFlags::LOCAL_ONLY;
        }
        debug!(channel = %child, "new mux channel");
        // Let the callback establish its state.
        if let Some(callback) = callback {
            (callback.borrow_mut())(self, child);
        }
        Ok(())
    }

    fn post_mux_client(&mut self, id: ChannelId) -> Result<(), Error> {
        let complete = {
            let Self {
                table, transport, ..
            } = self;
            let Some(channel) = table.get_mut(id) else {
                return Ok(());
            };
            let readable = channel.readable()
                && channel
                    .read_slot()
                    .and_then(|slot| slot.want)
                    .map_or(false, |i| i.is_readable());
            let mut complete = false;
            if readable
                && !channel.mux_pause
                && matches!(channel.istate, InputState::Open | InputState::WaitDrain)
            {
                // Never read past the precise end of a packet, to avoid
                // disrupting descriptor passing.
                if read_mux(channel, 4) >= 4 {
                    let need = channel.input.peek_u32().unwrap_or(0) as usize;
                    if need > MUX_PACKET_MAX {
                        debug!(channel = %id, need, "mux packet too big");
                        state::rcvd_close(channel, transport.as_mut())?;
                        return Ok(());
                    }
                    if read_mux(channel, need + 4) >= need + 4 {
                        complete = true;
                    }
                }
            }
            complete
        };

        if complete {
            let callback = self
                .table
                .get(id)
                .and_then(|channel| channel.callbacks.mux_read.clone());
            if let Some(callback) = callback {
                if !(callback.borrow_mut())(self, id) {
                    debug!(channel = %id, "mux callback failed");
                    if let Some(channel) = self.table.get_mut(id) {
                        state::mark_dead(channel);
                    }
                    return Ok(());
                }
            }
        }

        // Flush replies back to the client.
        let Some(channel) = self.table.get_mut(id) else {
            return Ok(());
        };
        if channel.writable() && !channel.output.is_empty() {
            let outcome = {
                let Some(slot) = channel.sock.as_mut().or(channel.wfd.as_mut()) else {
                    return Ok(());
                };
                match slot.stream.write(channel.output.bytes()) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        slot.writable = false;
                        None
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => None,
                    Ok(0) | Err(_) => Some(Err(())),
                    Ok(n) => Some(Ok(n)),
                }
            };
            match outcome {
                None => {}
                Some(Err(())) => state::mark_dead(channel),
                Some(Ok(n)) => channel.output.consume(n),
            }
        }
        Ok(())
    }
}

/// Declare interest for a plain open channel: readable while the peer's
/// window has room and the input buffer is not at its reserve, writable
/// while delivery is pending, extended per its usage.
fn pre_open(c: &mut Channel) {
    if c.istate == InputState::Open
        && c.remote_window > 0
        && (c.input.len() as u64) < c.remote_window as u64
        && c.input.check_reserve(READ_CHUNK)
    {
        c.want_read();
    }
    if matches!(c.ostate, OutputState::Open | OutputState::WaitDrain) {
        if !c.output.is_empty() {
            c.want_write();
        } else if c.ostate == OutputState::WaitDrain {
            if c.efd_output_active() {
                debug!(channel = %c.id, pending = c.extended.len(),
                    "obuf_empty delayed by extended data");
            } else {
                state::obuf_empty(c);
            }
        }
    }
    if c.efd.is_some() && !(c.istate == InputState::Closed && c.ostate == OutputState::Closed) {
        if c.extended_usage == ExtendedUsage::Write && !c.extended.is_empty() {
            if let Some(slot) = c.efd.as_mut() {
                slot.want_write();
            }
        } else if !c.flags.contains(crate::channel::ChannelFlags::EOF_SENT)
            && matches!(
                c.extended_usage,
                ExtendedUsage::Read | ExtendedUsage::Ignore
            )
            && (c.extended.len() as u64) < c.remote_window as u64
        {
            if let Some(slot) = c.efd.as_mut() {
                slot.want_read();
            }
        }
    }
}

/// An X11 channel stays in cookie-verification state until the complete
/// first packet has arrived from the peer; then it either becomes a normal
/// open channel or is torn down.
fn pre_x11_open(
    c: &mut Channel,
    spoof: Option<&X11SpoofState>,
    t: &mut dyn Transport,
) -> Result<(), Error> {
    let verdict = match spoof {
        Some(state) => x11::open_helper(&mut c.output, state),
        None => SpoofResult::Mismatch,
    };
    match verdict {
        SpoofResult::Ok => {
            c.ty = ChannelType::Open;
            pre_open(c);
        }
        SpoofResult::Mismatch => {
            info!("X11 connection rejected because of wrong authentication");
            debug!(channel = %c.id, istate = ?c.istate, ostate = ?c.ostate, "X11 rejected");
            state::read_failed(c);
            c.input.reset();
            state::ibuf_empty(c, t)?;
            c.output.reset();
            state::write_failed(c);
            debug!(channel = %c.id, istate = ?c.istate, ostate = ?c.ostate, "X11 closed");
        }
        SpoofResult::NeedMore => {}
    }
    Ok(())
}

/// Accumulate the SOCKS request; once decoded, promote to OPENING and
/// announce the open.
fn pre_dynamic(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    let have = c.input.len();
    debug!(channel = %c.id, have, "pre dynamic");
    if have < 3 {
        c.want_read();
        return Ok(());
    }
    match socks::decode(c) {
        SocksProgress::Fail => state::mark_dead(c),
        SocksProgress::NeedMore => {
            debug!(channel = %c.id, "pre dynamic: need more");
            c.want_read();
            if !c.output.is_empty() {
                c.want_write();
            }
        }
        SocksProgress::Done => {
            c.ty = ChannelType::Opening;
            port_open_helper(c, t, "direct-tcpip")?;
        }
    }
    Ok(())
}

fn pre_mux_client(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    if c.istate == InputState::Open && !c.mux_pause && c.input.check_reserve(READ_CHUNK) {
        c.want_read();
    }
    if c.istate == InputState::WaitDrain {
        // Discard any partial packet and start the output drain.
        c.input.reset();
        state::ibuf_empty(c, t)?;
        state::rcvd_close(c, t)?;
    }
    if matches!(c.ostate, OutputState::Open | OutputState::WaitDrain) {
        if !c.output.is_empty() {
            c.want_write();
        } else if c.ostate == OutputState::WaitDrain {
            state::obuf_empty(c);
        }
    }
    Ok(())
}

fn listener_ready(c: &mut Channel) -> bool {
    matches!(&c.listen, Some(listen) if listen.want && listen.readable)
}

/// Accept one connection, translating the usual failure modes: transient
/// errors are ignored, descriptor exhaustion pauses the listener for a
/// second.
fn accept_on(
    c: &mut Channel,
    now: Instant,
) -> Option<(Box<dyn ChannelStream>, Option<std::net::SocketAddr>)> {
    let listen = c.listen.as_mut()?;
    match listen.listener.accept() {
        Ok((stream, peer)) => Some((stream, peer)),
        Err(err) => {
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    listen.readable = false;
                }
                io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted => {}
                _ => {
                    error!(channel = %c.id, %err, "accept failed");
                }
            }
            if matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                c.notbefore = Some(now + ACCEPT_BACKOFF);
            }
            None
        }
    }
}

/// Read from the local descriptor into the input buffer.
fn handle_rfd(c: &mut Channel) -> Result<(), Error> {
    let id = c.id;
    let ty = c.ty;
    enum Outcome {
        Read(usize),
        Nothing,
        Failed,
    }
    let mut buf = [0u8; READ_CHUNK];
    let outcome = {
        let Some(slot) = c.sock.as_mut().or(c.rfd.as_mut()) else {
            return Ok(());
        };
        if !slot.want.map_or(false, |i| i.is_readable()) || !slot.readable {
            return Ok(());
        }
        match slot.stream.read(&mut buf) {
            Ok(0) => Outcome::Failed,
            Ok(n) => Outcome::Read(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                slot.readable = false;
                Outcome::Nothing
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Outcome::Nothing,
            Err(err) => {
                debug!(channel = %id, %err, "read error");
                Outcome::Failed
            }
        }
    };
    match outcome {
        Outcome::Nothing => {}
        Outcome::Failed => {
            debug!(channel = %id, "read failed");
            if ty != ChannelType::Open {
                state::mark_dead(c);
            } else {
                state::read_failed(c);
            }
        }
        Outcome::Read(n) => {
            if let Some(mut filter) = c.callbacks.input_filter.take() {
                let verdict = filter(c, &buf[..n]);
                c.callbacks.input_filter = Some(filter);
                if verdict == FilterVerdict::Stop {
                    debug!(channel = %id, "input filter stops");
                    state::read_failed(c);
                }
            } else {
                let appended = if c.datagram {
                    c.input.put_string(&buf[..n])
                } else {
                    c.input.put(&buf[..n])
                };
                if let Err(err) = appended {
                    warn!(channel = %id, %err, "input buffer overflow");
                    state::mark_dead(c);
                }
            }
        }
    }
    Ok(())
}

/// Deliver buffered output to the local descriptor, tracking consumption
/// for the window-adjust accounting and simulating echo on quiet ttys.
fn handle_wfd(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    let id = c.id;
    let ty = c.ty;
    let ready = match c.sock.as_ref().or(c.wfd.as_ref()) {
        Some(slot) => slot.want.map_or(false, |i| i.is_writable()) && slot.writable,
        None => false,
    };
    if !ready || c.output.is_empty() {
        return Ok(());
    }
    let olen = c.output.len();

    if c.callbacks.output_filter.is_some() {
        let mut filter = match c.callbacks.output_filter.take() {
            Some(filter) => filter,
            None => return Ok(()),
        };
        let data = filter(c);
        c.callbacks.output_filter = Some(filter);
        let Some(data) = data else {
            debug!(channel = %id, "output filter stops");
            if ty != ChannelType::Open {
                state::mark_dead(c);
            } else {
                state::write_failed(c);
            }
            return Ok(());
        };
        let result = {
            let Some(slot) = c.sock.as_mut().or(c.wfd.as_mut()) else {
                return Ok(());
            };
            match slot.stream.write(&data) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    slot.writable = false;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                other => other,
            }
        };
        match result {
            Ok(0) | Err(_) => {
                if ty != ChannelType::Open {
                    state::mark_dead(c);
                } else {
                    state::write_failed(c);
                }
                return Ok(());
            }
            Ok(n) => c.output.consume(n.min(c.output.len())),
        }
    } else if c.datagram {
        // Truncated or failed writes lose the datagram; that is the
        // contract of the framing.
        if let Some(data) = c.output.get_string() {
            let result = {
                let Some(slot) = c.sock.as_mut().or(c.wfd.as_mut()) else {
                    return Ok(());
                };
                match slot.stream.write(&data) {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        slot.writable = false;
                        debug!(channel = %id, "datagram dropped on blocked writer");
                        return Ok(());
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                    other => other,
                }
            };
            if matches!(result, Ok(0) | Err(_)) {
                if ty != ChannelType::Open {
                    state::mark_dead(c);
                } else {
                    state::write_failed(c);
                }
                return Ok(());
            }
        }
    } else {
        let result = {
            let Some(slot) = c.sock.as_mut().or(c.wfd.as_mut()) else {
                return Ok(());
            };
            match slot.stream.write(c.output.bytes()) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    slot.writable = false;
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                other => other,
            }
        };
        match result {
            Ok(0) | Err(_) => {
                debug!(channel = %id, "write failed");
                if ty != ChannelType::Open {
                    state::mark_dead(c);
                } else {
                    state::write_failed(c);
                }
                return Ok(());
            }
            Ok(n) => {
                if c.is_tty && c.simulate_echo && n >= 1 && c.output.bytes()[0] != b'\r' {
                    // Match the size of a DATA message so traffic analysis
                    // sees the echo it expects.
                    Muxer::send_ignore(t, 4 + n)?;
                }
                c.output.consume(n);
            }
        }
    }
    c.local_consumed += (olen - c.output.len()) as u32;
    Ok(())
}

/// Extended-descriptor I/O per usage; errors close only the descriptor.
fn handle_efd(c: &mut Channel) {
    let id = c.id;
    if c.efd.is_none() {
        return;
    }
    if c.extended_usage == ExtendedUsage::Write {
        let result = {
            let Some(slot) = c.efd.as_mut() else {
                return;
            };
            if !slot.want.map_or(false, |i| i.is_writable())
                || !slot.writable
                || c.extended.is_empty()
            {
                return;
            }
            match slot.stream.write(c.extended.bytes()) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    slot.writable = false;
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
                other => other,
            }
        };
        match result {
            Ok(0) | Err(_) => {
                debug!(channel = %id, "closing write-efd");
                c.efd = None;
            }
            Ok(n) => {
                debug!(channel = %id, n, "written to efd");
                c.extended.consume(n);
                c.local_consumed += n as u32;
            }
        }
    } else {
        let mut buf = [0u8; READ_CHUNK];
        let result = {
            let Some(slot) = c.efd.as_mut() else {
                return;
            };
            if !slot.want.map_or(false, |i| i.is_readable()) || !slot.readable {
                return;
            }
            match slot.stream.read(&mut buf) {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    slot.readable = false;
                    return;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
                other => other,
            }
        };
        match result {
            Ok(0) | Err(_) => {
                debug!(channel = %id, "closing read-efd");
                c.efd = None;
            }
            Ok(n) => {
                debug!(channel = %id, n, "read from efd");
                if c.extended_usage == ExtendedUsage::Ignore {
                    debug!(channel = %id, "discard efd data");
                } else if let Err(err) = c.extended.put(&buf[..n]) {
                    warn!(channel = %id, %err, "extended buffer overflow");
                    state::mark_dead(c);
                }
            }
        }
    }
}

/// Top up the mux input buffer to `need` bytes without reading past a
/// packet boundary. Returns how much is buffered.
fn read_mux(c: &mut Channel, need: usize) -> usize {
    let id = c.id;
    if c.input.len() < need {
        let rlen = (need - c.input.len()).min(READ_CHUNK);
        let mut buf = [0u8; READ_CHUNK];
        let outcome = {
            let Some(slot) = c.sock.as_mut().or(c.rfd.as_mut()) else {
                return c.input.len();
            };
            match slot.stream.read(&mut buf[..rlen]) {
                Ok(0) => Err(()),
                Ok(n) => Ok(Some(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    slot.readable = false;
                    Ok(None)
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(None),
                Err(err) => {
                    debug!(channel = %id, %err, "mux read error");
                    Err(())
                }
            }
        };
        match outcome {
            Ok(Some(n)) => {
                if c.input.put(&buf[..n]).is_err() {
                    state::mark_dead(c);
                }
            }
            Ok(None) => {}
            Err(()) => {
                debug!(channel = %id, "mux control read failed");
                state::read_failed(c);
            }
        }
    }
    c.input.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{TCP_PACKET_DEFAULT, TCP_WINDOW_DEFAULT};
    use crate::connect::ConnectCtx;
    use crate::forward::GatewayPorts;
    use crate::mux::{MuxConfig, Muxer};
    use bytes::Bytes;
    use sshmux_proto::Message;
    use std::cell::RefCell;
    use std::net::{SocketAddr, TcpListener as StdTcpListener};
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct Recorder(Rc<RefCell<Vec<Message>>>);

    impl Recorder {
        fn contains(&self, pred: impl Fn(&Message) -> bool) -> bool {
            self.0.borrow().iter().any(|m| pred(m))
        }
    }

    struct RecordingTransport(Recorder);

    impl Transport for RecordingTransport {
        fn send(&mut self, packet: Bytes) -> std::io::Result<()> {
            let message = Message::from_bytes(packet).expect("well-formed outbound packet");
            self.0 .0.borrow_mut().push(message);
            Ok(())
        }
    }

    fn muxer() -> (Muxer, Recorder) {
        let recorder = Recorder::default();
        let mux = Muxer::new(
            Box::new(RecordingTransport(recorder.clone())),
            MuxConfig::default(),
        )
        .unwrap();
        (mux, recorder)
    }

    fn released_port() -> SocketAddr {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn connecting_channel(mux: &mut Muxer, addrs: Vec<SocketAddr>) -> ChannelId {
        let port = addrs.last().unwrap().port();
        let mut ctx = ConnectCtx::from_addrs("localhost", port, addrs);
        let stream = ctx.connect_next().unwrap();
        let id = mux
            .new_channel(
                ChannelType::Connecting,
                "direct-tcpip",
                Endpoints::Socket(Box::new(stream)),
                TCP_WINDOW_DEFAULT,
                TCP_PACKET_DEFAULT,
                ExtendedUsage::Ignore,
                "connected socket",
            )
            .unwrap();
        let channel = mux.channel_mut(id).unwrap();
        channel.remote_id = Some(9);
        channel.connect_ctx = Some(ctx);
        id
    }

    fn run_until(mux: &mut Muxer, mut done: impl FnMut(&mut Muxer) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(mux) {
            assert!(Instant::now() < deadline, "condition not reached in time");
            mux.tick(Some(Duration::from_millis(20))).unwrap();
        }
    }

    #[test]
    fn connecting_channel_fails_over_to_next_address() {
        let (mut mux, sent) = muxer();
        // A freshly released port refuses connections; the live listener
        // accepts them.
        let dead = released_port();
        let live_listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let live = live_listener.local_addr().unwrap();

        let id = connecting_channel(&mut mux, vec![dead, live]);
        run_until(&mut mux, |_| {
            sent.contains(|m| matches!(m, Message::ChannelOpenConfirmation { .. }))
        });

        let channel = mux.channel(id).unwrap();
        assert_eq!(channel.ty, ChannelType::Open);
        assert!(channel.connect_ctx.is_none());
        assert!(!sent.contains(|m| matches!(m, Message::ChannelOpenFailure { .. })));
        assert!(sent.contains(|m| matches!(
            m,
            Message::ChannelOpenConfirmation {
                recipient_channel: 9,
                ..
            }
        )));
    }

    #[test]
    fn connecting_channel_fails_when_addresses_run_out() {
        let (mut mux, sent) = muxer();
        let dead_a = released_port();
        let dead_b = released_port();

        let id = connecting_channel(&mut mux, vec![dead_a, dead_b]);
        run_until(&mut mux, |_| {
            sent.contains(|m| matches!(
                m,
                Message::ChannelOpenFailure {
                    reason: sshmux_proto::OPEN_CONNECT_FAILED,
                    ..
                }
            ))
        });
        // The zombie is reaped by the next collection pass.
        run_until(&mut mux, |mux| mux.channel(id).is_none());
    }

    #[test]
    fn paused_listener_does_not_accept() {
        let (mut mux, sent) = muxer();
        let ids = mux
            .setup_local_fwd_listener(Some("127.0.0.1"), 0, "target.example", 80, GatewayPorts::No)
            .unwrap();
        let listener_id = ids[0];
        let port = {
            let channel = mux.channel(listener_id).unwrap();
            channel.listen.as_ref().unwrap().listener.local_addr().unwrap().port()
        };

        mux.channel_mut(listener_id).unwrap().notbefore =
            Some(Instant::now() + Duration::from_secs(60));
        let _client = std::net::TcpStream::connect(("127.0.0.1", port)).unwrap();
        for _ in 0..5 {
            mux.tick(Some(Duration::from_millis(10))).unwrap();
        }
        assert_eq!(mux.table().len(), ids.len(), "accepted while paused");

        mux.channel_mut(listener_id).unwrap().notbefore = None;
        run_until(&mut mux, |mux| mux.table().len() > ids.len());
        assert!(sent.contains(|m| matches!(
            m,
            Message::ChannelOpen {
                payload: sshmux_proto::OpenPayload::DirectTcpip { .. },
                ..
            }
        )));
    }
}
