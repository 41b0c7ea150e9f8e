use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use sshmux_core::proto::Message;
use sshmux_core::{
    ChannelId, ChannelType, Endpoints, ExtendedUsage, MuxConfig, Muxer, Transport,
};

/// Transport double that decodes everything the muxer emits, so tests
/// assert on typed messages instead of byte soup.
#[derive(Clone, Default)]
pub struct Recorder(pub Rc<RefCell<Vec<Message>>>);

impl Recorder {
    pub fn contains(&self, pred: impl Fn(&Message) -> bool) -> bool {
        self.0.borrow().iter().any(|m| pred(m))
    }

    pub fn count(&self, pred: impl Fn(&Message) -> bool) -> usize {
        self.0.borrow().iter().filter(|m| pred(m)).count()
    }

    pub fn take(&self) -> Vec<Message> {
        self.0.borrow_mut().drain(..).collect()
    }
}

pub struct RecordingTransport(pub Recorder);

impl Transport for RecordingTransport {
    fn send(&mut self, packet: Bytes) -> std::io::Result<()> {
        let message = Message::from_bytes(packet).expect("well-formed outbound packet");
        self.0 .0.borrow_mut().push(message);
        Ok(())
    }
}

pub fn muxer() -> (Muxer, Recorder) {
    let recorder = Recorder::default();
    let mux = Muxer::new(
        Box::new(RecordingTransport(recorder.clone())),
        MuxConfig::default(),
    )
    .expect("muxer");
    (mux, recorder)
}

/// Peer-side channel id used by the helpers below.
pub const PEER_ID: u32 = 7;

/// Create a locally initiated session channel and walk it to OPEN with the
/// given peer window and packet limits.
pub fn open_channel(mux: &mut Muxer, remote_window: u32, remote_maxpacket: u32) -> ChannelId {
    open_channel_with_limits(mux, remote_window, remote_maxpacket, 2 * 1024 * 1024, 32 * 1024)
}

pub fn open_channel_with_limits(
    mux: &mut Muxer,
    remote_window: u32,
    remote_maxpacket: u32,
    local_window: u32,
    local_maxpacket: u32,
) -> ChannelId {
    let id = mux
        .new_channel(
            ChannelType::Opening,
            "session",
            Endpoints::None,
            local_window,
            local_maxpacket,
            ExtendedUsage::Ignore,
            "client session",
        )
        .expect("channel");
    mux.send_open(id).expect("send open");
    mux.dispatch_message(Message::ChannelOpenConfirmation {
        recipient_channel: id.value(),
        sender_channel: PEER_ID,
        initial_window: remote_window,
        max_packet: remote_maxpacket,
    })
    .expect("confirmation");
    assert_eq!(mux.channel(id).unwrap().ty, ChannelType::Open);
    id
}

/// Drive the loop until `done` holds, panicking on a stuck test instead of
/// hanging it.
pub fn run_until(mux: &mut Muxer, mut done: impl FnMut(&mut Muxer) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(mux) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        mux.tick(Some(Duration::from_millis(20))).expect("tick");
    }
}
