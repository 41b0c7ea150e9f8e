//! Readiness plumbing between the channel table and `mio`.
//!
//! Each endpoint slot of each channel maps to a token; the pre-handlers
//! declare interest per tick, `sync` reconciles declarations with the
//! registry, and `wait` latches delivered events into the slots. Latched
//! readiness is only cleared by an I/O call hitting `WouldBlock`, so the
//! edge-triggered poller behaves level-triggered from the handlers' point
//! of view.

use std::io;
use std::time::Duration;

use mio::event::Event;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::channel::ChannelId;
use crate::stream::IoSlot;
use crate::table::ChannelTable;

/// Tokens are `channel_id * STRIDE + role`.
const STRIDE: usize = 8;

const ROLE_SOCK: usize = 0;
const ROLE_RFD: usize = 1;
const ROLE_WFD: usize = 2;
const ROLE_EFD: usize = 3;
const ROLE_LISTENER: usize = 4;

pub(crate) struct Poller {
    poll: Poll,
    events: Events,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
        })
    }

    /// Bring registry registrations in line with what the pre-handlers
    /// declared.
    pub fn sync(&mut self, table: &mut ChannelTable) -> io::Result<()> {
        let registry = self.poll.registry();
        for channel in table.iter_mut() {
            let base = channel.id.value() as usize * STRIDE;
            sync_slot(registry, Token(base + ROLE_SOCK), &mut channel.sock)?;
            sync_slot(registry, Token(base + ROLE_RFD), &mut channel.rfd)?;
            sync_slot(registry, Token(base + ROLE_WFD), &mut channel.wfd)?;
            sync_slot(registry, Token(base + ROLE_EFD), &mut channel.efd)?;
            if let Some(listen) = &mut channel.listen {
                match (listen.want, listen.registered) {
                    (true, false) => {
                        registry.register(
                            &mut listen.listener,
                            Token(base + ROLE_LISTENER),
                            Interest::READABLE,
                        )?;
                        listen.registered = true;
                    }
                    (false, true) => {
                        registry.deregister(&mut listen.listener)?;
                        listen.registered = false;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// One bounded wait, latching readiness into the slots.
    pub fn wait(&mut self, timeout: Option<Duration>, table: &mut ChannelTable) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        for event in self.events.iter() {
            let token = event.token().0;
            let id = ChannelId((token / STRIDE) as u32);
            let Some(channel) = table.get_mut(id) else {
                continue;
            };
            match token % STRIDE {
                ROLE_SOCK => latch(&mut channel.sock, event),
                ROLE_RFD => latch(&mut channel.rfd, event),
                ROLE_WFD => latch(&mut channel.wfd, event),
                ROLE_EFD => latch(&mut channel.efd, event),
                ROLE_LISTENER => {
                    if let Some(listen) = &mut channel.listen {
                        listen.readable = true;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn sync_slot(registry: &Registry, token: Token, slot: &mut Option<IoSlot>) -> io::Result<()> {
    let Some(slot) = slot else {
        return Ok(());
    };
    match (slot.want, slot.registered) {
        (Some(want), Some(registered)) if want == registered => {}
        (Some(want), Some(_)) => {
            registry.reregister(&mut *slot.stream, token, want)?;
            slot.registered = Some(want);
        }
        (Some(want), None) => {
            registry.register(&mut *slot.stream, token, want)?;
            slot.registered = Some(want);
        }
        (None, Some(_)) => {
            registry.deregister(&mut *slot.stream)?;
            slot.registered = None;
        }
        (None, None) => {}
    }
    Ok(())
}

fn latch(slot: &mut Option<IoSlot>, event: &Event) {
    let Some(slot) = slot else {
        return;
    };
    if event.is_readable() || event.is_read_closed() {
        slot.readable = true;
    }
    if event.is_writable() || event.is_write_closed() {
        slot.writable = true;
    }
}
