use crate::buffer::BufferFull;

/// Errors that terminate the whole connection.
///
/// Per-channel trouble (refused opens, overfull windows, dead sockets) is
/// handled by closing the affected channel; only conditions that leave the
/// packet stream itself untrustworthy surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Inbound packet framing did not parse. The stream is out of sync.
    #[error(transparent)]
    Decode(#[from] sshmux_proto::DecodeError),

    /// The peer addressed a channel id that does not exist.
    #[error("message for nonexistent channel {0}")]
    UnknownChannel(u32),

    /// The peer sent a lifecycle message a channel in this state cannot
    /// receive (e.g. OPEN_CONFIRMATION for a channel that is not opening).
    #[error("{message} for channel {id} in unexpected state")]
    UnexpectedState { id: u32, message: &'static str },

    /// Extended data arrived after the peer already sent EOF.
    #[error("extended data after EOF on channel {0}")]
    DataAfterEof(u32),

    /// The channel table reached its hard cap.
    #[error("channel table full ({0} slots)")]
    TableFull(usize),

    /// A channel buffer would exceed its hard maximum.
    #[error(transparent)]
    Buffer(#[from] BufferFull),

    /// The transport refused an outbound packet.
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
