//! Per-channel state transitions, named by the event that triggers them.
//!
//! The input half walks OPEN → WAIT_DRAIN → CLOSED as the local read side
//! fails and the buffered bytes drain to the peer; the output half walks the
//! mirror image as the peer sends EOF and buffered bytes drain to the local
//! sink. EOF and CLOSE are each sent at most once, enforced by flags here
//! rather than by every caller.

use tracing::{debug, error};

use crate::channel::{Channel, ChannelFlags, ChannelType, InputState, OutputState};
use crate::error::Error;
use crate::mux::{send_message, Transport};
use sshmux_proto::Message;

/// The local read side failed or hit EOF: flush what is buffered, then EOF
/// the peer.
pub(crate) fn read_failed(c: &mut Channel) {
    match c.istate {
        InputState::Open => {
            debug!(channel = %c.id, "input open -> drain");
            c.shutdown_read();
            c.istate = InputState::WaitDrain;
        }
        state => {
            error!(channel = %c.id, ?state, "read failed in unexpected input state");
        }
    }
}

/// The input buffer drained while the read side was already down.
pub(crate) fn ibuf_empty(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    if c.istate != InputState::WaitDrain || !c.input.is_empty() {
        error!(channel = %c.id, state = ?c.istate, "ibuf_empty in unexpected input state");
        return Ok(());
    }
    if !c.flags.contains(ChannelFlags::EOF_SENT) {
        send_eof(c, t)?;
    }
    debug!(channel = %c.id, "input drain -> closed");
    c.istate = InputState::Closed;
    Ok(())
}

/// The local write side failed: no more data can be delivered.
pub(crate) fn write_failed(c: &mut Channel) {
    match c.ostate {
        OutputState::Open | OutputState::WaitDrain => {
            debug!(channel = %c.id, state = ?c.ostate, "output -> closed (write failed)");
            c.shutdown_write();
            c.ostate = OutputState::Closed;
        }
        state => {
            error!(channel = %c.id, ?state, "write failed in unexpected output state");
        }
    }
}

/// The output buffer drained after the peer's EOF: close the write side.
pub(crate) fn obuf_empty(c: &mut Channel) {
    if c.ostate != OutputState::WaitDrain || !c.output.is_empty() {
        error!(channel = %c.id, state = ?c.ostate, "obuf_empty in unexpected output state");
        return;
    }
    debug!(channel = %c.id, "output drain -> closed");
    c.shutdown_write();
    c.ostate = OutputState::Closed;
}

/// Peer sent EOF: deliver what is buffered, then close the local write side.
pub(crate) fn rcvd_eof(c: &mut Channel) {
    debug!(channel = %c.id, "rcvd eof");
    c.flags |= ChannelFlags::EOF_RCVD;
    if c.ostate == OutputState::Open {
        debug!(channel = %c.id, "output open -> drain");
        c.ostate = OutputState::WaitDrain;
    }
}

/// Peer sent CLOSE: tear down both halves, draining output first.
pub(crate) fn rcvd_close(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    debug!(channel = %c.id, "rcvd close");
    if !c.flags.contains(ChannelFlags::LOCAL_ONLY) {
        if c.flags.contains(ChannelFlags::CLOSE_RCVD) {
            error!(channel = %c.id, "protocol error: close received twice");
        }
        c.flags |= ChannelFlags::CLOSE_RCVD;
    }
    if c.ty == ChannelType::Larval {
        // Tear down larval channels immediately.
        c.istate = InputState::Closed;
        c.ostate = OutputState::Closed;
        return Ok(());
    }
    if c.ostate == OutputState::Open {
        // Deliver buffered output before closing the write side.
        debug!(channel = %c.id, "output open -> drain");
        c.ostate = OutputState::WaitDrain;
    }
    match c.istate {
        InputState::Open => {
            debug!(channel = %c.id, "input open -> closed");
            c.shutdown_read();
            c.istate = InputState::Closed;
        }
        InputState::WaitDrain => {
            debug!(channel = %c.id, "input drain -> closed");
            send_eof(c, t)?;
            c.istate = InputState::Closed;
        }
        InputState::Closed => {}
    }
    Ok(())
}

/// Tell the peer no more data is coming. Fires at most once.
pub(crate) fn send_eof(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    match c.istate {
        InputState::WaitDrain => {
            if !c.flags.contains(ChannelFlags::LOCAL_ONLY) {
                let Some(remote_id) = c.remote_id else {
                    error!(channel = %c.id, "cannot send eof: no remote id");
                    return Ok(());
                };
                debug!(channel = %c.id, "send eof");
                send_message(
                    t,
                    &Message::ChannelEof {
                        recipient_channel: remote_id,
                    },
                )?;
            }
            c.flags |= ChannelFlags::EOF_SENT;
        }
        state => {
            error!(channel = %c.id, ?state, "cannot send eof in this input state");
        }
    }
    Ok(())
}

/// Tell the peer the channel is finished. Fires at most once, and only once
/// both halves are closed.
pub(crate) fn send_close(c: &mut Channel, t: &mut dyn Transport) -> Result<(), Error> {
    if c.istate != InputState::Closed || c.ostate != OutputState::Closed {
        error!(channel = %c.id, istate = ?c.istate, ostate = ?c.ostate,
            "cannot send close with a half still open");
    } else if c.flags.contains(ChannelFlags::CLOSE_SENT) {
        error!(channel = %c.id, "close already sent");
    } else {
        if !c.flags.contains(ChannelFlags::LOCAL_ONLY) {
            let Some(remote_id) = c.remote_id else {
                error!(channel = %c.id, "cannot send close: no remote id");
                return Ok(());
            };
            debug!(channel = %c.id, "send close");
            send_message(
                t,
                &Message::ChannelClose {
                    recipient_channel: remote_id,
                },
            )?;
        }
        c.flags |= ChannelFlags::CLOSE_SENT;
    }
    Ok(())
}

/// Condemn the channel; the next garbage-collection pass reaps it.
pub(crate) fn mark_dead(c: &mut Channel) {
    debug!(channel = %c.id, "marked dead");
    c.ty = ChannelType::Zombie;
}

/// Whether the channel is finished with its close handshake and can be
/// freed. With `do_send`, emits our CLOSE as soon as both halves are down;
/// the slot is still retained until the peer's CLOSE arrives.
pub(crate) fn is_dead(c: &mut Channel, t: &mut dyn Transport, do_send: bool) -> Result<bool, Error> {
    if matches!(c.ty, ChannelType::Zombie | ChannelType::Abandoned) {
        return Ok(true);
    }
    if c.istate != InputState::Closed || c.ostate != OutputState::Closed {
        return Ok(false);
    }
    if !c.flags.contains(ChannelFlags::CLOSE_SENT) {
        if do_send {
            send_close(c, t)?;
        } else {
            // A close we are not allowed to send yet does not count.
            return Ok(false);
        }
    }
    if c.flags.contains(ChannelFlags::CLOSE_RCVD) || c.flags.contains(ChannelFlags::LOCAL_ONLY) {
        return Ok(true);
    }
    // Close sent, confirmation outstanding: the slot must survive until the
    // peer answers, or its id could be reused mid-handshake.
    if c.ty == ChannelType::Open || c.ty == ChannelType::X11Open {
        c.ty = ChannelType::Closed;
    }
    Ok(false)
}
