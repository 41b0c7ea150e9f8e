use std::os::fd::RawFd;

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelId, ChannelType};
use crate::error::Error;

/// How many slots are added when the table is out of room.
const GROW_INCREMENT: usize = 10;

/// Hard cap on the table. A peer opening channels as fast as we confirm them
/// stops here instead of exhausting memory.
const MAX_CHANNELS: usize = 10_000;

/// Sparse registry of live channels. The index of a slot is the channel id;
/// a freed slot stays `None` until reallocated, so ids are stable for the
/// whole life of a channel.
#[derive(Default)]
pub struct ChannelTable {
    slots: Vec<Option<Channel>>,
    max_fd: RawFd,
}

impl ChannelTable {
    pub fn new() -> Self {
        ChannelTable {
            slots: Vec::new(),
            max_fd: -1,
        }
    }

    /// Find a free slot, growing the table if necessary.
    pub(crate) fn alloc_id(&mut self) -> Result<ChannelId, Error> {
        if let Some(index) = self.slots.iter().position(Option::is_none) {
            return Ok(ChannelId(index as u32));
        }
        if self.slots.len() >= MAX_CHANNELS {
            return Err(Error::TableFull(self.slots.len()));
        }
        let index = self.slots.len();
        self.slots.resize_with(index + GROW_INCREMENT, || None);
        debug!(slots = self.slots.len(), "channel table expanded");
        Ok(ChannelId(index as u32))
    }

    pub(crate) fn insert(&mut self, channel: Channel) {
        let index = channel.id.0 as usize;
        self.max_fd = self.max_fd.max(channel.max_fd());
        debug_assert!(self.slots[index].is_none(), "slot already occupied");
        self.slots[index] = Some(channel);
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    /// Like `get_mut`, logging when the id is stale or out of range.
    pub(crate) fn by_id(&mut self, id: u32) -> Option<&mut Channel> {
        match self.slots.get_mut(id as usize) {
            Some(Some(channel)) => Some(channel),
            Some(None) => {
                warn!(channel = id, "bad channel id: slot is free");
                None
            }
            None => {
                warn!(channel = id, "bad channel id: out of range");
                None
            }
        }
    }

    /// Resolve a channel id from the wire. Private channels, like listening
    /// sockets, may not receive protocol messages.
    pub(crate) fn lookup(&mut self, id: u32) -> Option<&mut Channel> {
        let channel = self.by_id(id)?;
        match channel.ty {
            ChannelType::X11Open
            | ChannelType::Larval
            | ChannelType::Connecting
            | ChannelType::Dynamic
            | ChannelType::Opening
            | ChannelType::Open
            | ChannelType::Closed
            | ChannelType::Abandoned => Some(channel),
            ty => {
                warn!(channel = id, ?ty, "non-public channel addressed by peer");
                None
            }
        }
    }

    pub(crate) fn take(&mut self, id: ChannelId) -> Option<Channel> {
        let channel = self.slots.get_mut(id.0 as usize)?.take();
        if channel.is_some() {
            self.recompute_max_fd();
        }
        channel
    }

    /// Ids of every live channel. Snapshots, so callers may create or free
    /// channels while iterating.
    pub(crate) fn ids(&self) -> Vec<ChannelId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| ChannelId(index as u32)))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.slots.iter().flatten()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Channel> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Highest descriptor any channel holds; keeps the readiness set
    /// minimally sized and bounds close-after-fork sweeps.
    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    pub(crate) fn note_fd(&mut self, fd: RawFd) {
        self.max_fd = self.max_fd.max(fd);
    }

    pub(crate) fn recompute_max_fd(&mut self) {
        self.max_fd = self
            .slots
            .iter()
            .flatten()
            .map(Channel::max_fd)
            .max()
            .unwrap_or(-1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Endpoints, ExtendedUsage};

    fn push_channel(table: &mut ChannelTable) -> ChannelId {
        let id = table.alloc_id().unwrap();
        let channel = Channel::new(
            id,
            ChannelType::Open,
            "session",
            Endpoints::None,
            1024,
            256,
            ExtendedUsage::Ignore,
            "test".into(),
        );
        table.insert(channel);
        id
    }

    #[test]
    fn ids_are_stable_and_slots_reused() {
        let mut table = ChannelTable::new();
        let a = push_channel(&mut table);
        let b = push_channel(&mut table);
        let c = push_channel(&mut table);
        assert_eq!((a.0, b.0, c.0), (0, 1, 2));

        table.take(b).unwrap();
        assert!(table.get(b).is_none());
        assert!(table.get(a).is_some());
        assert!(table.get(c).is_some());

        // Freed slot is the first candidate for reuse.
        let d = push_channel(&mut table);
        assert_eq!(d.0, 1);
    }

    #[test]
    fn grows_by_fixed_increment() {
        let mut table = ChannelTable::new();
        for _ in 0..11 {
            push_channel(&mut table);
        }
        assert_eq!(table.slots.len(), 20);
        assert_eq!(table.len(), 11);
    }

    #[test]
    fn lookup_refuses_private_channels() {
        let mut table = ChannelTable::new();
        let id = push_channel(&mut table);
        table.get_mut(id).unwrap().ty = ChannelType::PortListener;
        assert!(table.lookup(id.0).is_none());
        table.get_mut(id).unwrap().ty = ChannelType::Open;
        assert!(table.lookup(id.0).is_some());
    }

    #[test]
    fn lookup_of_unknown_id_is_none() {
        let mut table = ChannelTable::new();
        assert!(table.lookup(7).is_none());
    }
}
