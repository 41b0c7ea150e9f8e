use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{Decode, Encode, SshBufExt, SshBufMutExt, SshBytesExt};
use crate::error::DecodeError;
use crate::msg;

/// One connection-layer packet, decrypted and deframed by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Cover traffic; the payload is discarded by the peer.
    Ignore {
        data: Bytes,
    },
    GlobalRequest {
        want_reply: bool,
        kind: GlobalRequestKind,
    },
    RequestSuccess {
        data: Bytes,
    },
    RequestFailure,
    ChannelOpen {
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
        payload: OpenPayload,
    },
    ChannelOpenConfirmation {
        recipient_channel: u32,
        sender_channel: u32,
        initial_window: u32,
        max_packet: u32,
    },
    ChannelOpenFailure {
        recipient_channel: u32,
        reason: u32,
        description: String,
        language: String,
    },
    ChannelWindowAdjust {
        recipient_channel: u32,
        bytes_to_add: u32,
    },
    ChannelData {
        recipient_channel: u32,
        data: Bytes,
    },
    ChannelExtendedData {
        recipient_channel: u32,
        data_type: u32,
        data: Bytes,
    },
    ChannelEof {
        recipient_channel: u32,
    },
    ChannelClose {
        recipient_channel: u32,
    },
    ChannelRequest {
        recipient_channel: u32,
        request: String,
        want_reply: bool,
        payload: Bytes,
    },
    ChannelSuccess {
        recipient_channel: u32,
    },
    ChannelFailure {
        recipient_channel: u32,
    },
}

/// The two global requests the forwarding layer emits, plus a passthrough
/// for request names this crate does not interpret.
/// https://tools.ietf.org/html/rfc4254#section-7.1
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalRequestKind {
    TcpipForward { address: String, port: u32 },
    CancelTcpipForward { address: String, port: u32 },
    Other { name: String, payload: Bytes },
}

/// Type-specific fields of `SSH_MSG_CHANNEL_OPEN`, selected by channel type.
/// https://tools.ietf.org/html/rfc4254#section-6.1, #section-7.2
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenPayload {
    Session,
    DirectTcpip {
        host: String,
        port: u32,
        originator: String,
        originator_port: u32,
    },
    ForwardedTcpip {
        address: String,
        port: u32,
        originator: String,
        originator_port: u32,
    },
    X11 {
        originator: String,
        originator_port: u32,
    },
    AuthAgent,
    Other {
        ctype: String,
        data: Bytes,
    },
}

impl OpenPayload {
    pub fn channel_type(&self) -> &str {
        match self {
            OpenPayload::Session => "session",
            OpenPayload::DirectTcpip { .. } => "direct-tcpip",
            OpenPayload::ForwardedTcpip { .. } => "forwarded-tcpip",
            OpenPayload::X11 { .. } => "x11",
            OpenPayload::AuthAgent => "auth-agent@openssh.com",
            OpenPayload::Other { ctype, .. } => ctype,
        }
    }

    fn decode(ctype: String, buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(match ctype.as_str() {
            "session" => OpenPayload::Session,
            "direct-tcpip" => OpenPayload::DirectTcpip {
                host: buf.try_get_utf8()?,
                port: SshBufExt::try_get_u32(buf)?,
                originator: buf.try_get_utf8()?,
                originator_port: SshBufExt::try_get_u32(buf)?,
            },
            "forwarded-tcpip" => OpenPayload::ForwardedTcpip {
                address: buf.try_get_utf8()?,
                port: SshBufExt::try_get_u32(buf)?,
                originator: buf.try_get_utf8()?,
                originator_port: SshBufExt::try_get_u32(buf)?,
            },
            "x11" => OpenPayload::X11 {
                originator: buf.try_get_utf8()?,
                originator_port: SshBufExt::try_get_u32(buf)?,
            },
            "auth-agent@openssh.com" => OpenPayload::AuthAgent,
            _ => OpenPayload::Other {
                ctype,
                data: buf.split_to(buf.len()),
            },
        })
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            OpenPayload::Session | OpenPayload::AuthAgent => {}
            OpenPayload::DirectTcpip {
                host,
                port,
                originator,
                originator_port,
            }
            | OpenPayload::ForwardedTcpip {
                address: host,
                port,
                originator,
                originator_port,
            } => {
                buf.put_ssh_string(host.as_bytes());
                buf.put_u32(*port);
                buf.put_ssh_string(originator.as_bytes());
                buf.put_u32(*originator_port);
            }
            OpenPayload::X11 {
                originator,
                originator_port,
            } => {
                buf.put_ssh_string(originator.as_bytes());
                buf.put_u32(*originator_port);
            }
            OpenPayload::Other { data, .. } => buf.put_slice(data),
        }
    }
}

impl Message {
    pub fn number(&self) -> u8 {
        match self {
            Message::Ignore { .. } => msg::IGNORE,
            Message::GlobalRequest { .. } => msg::GLOBAL_REQUEST,
            Message::RequestSuccess { .. } => msg::REQUEST_SUCCESS,
            Message::RequestFailure => msg::REQUEST_FAILURE,
            Message::ChannelOpen { .. } => msg::CHANNEL_OPEN,
            Message::ChannelOpenConfirmation { .. } => msg::CHANNEL_OPEN_CONFIRMATION,
            Message::ChannelOpenFailure { .. } => msg::CHANNEL_OPEN_FAILURE,
            Message::ChannelWindowAdjust { .. } => msg::CHANNEL_WINDOW_ADJUST,
            Message::ChannelData { .. } => msg::CHANNEL_DATA,
            Message::ChannelExtendedData { .. } => msg::CHANNEL_EXTENDED_DATA,
            Message::ChannelEof { .. } => msg::CHANNEL_EOF,
            Message::ChannelClose { .. } => msg::CHANNEL_CLOSE,
            Message::ChannelRequest { .. } => msg::CHANNEL_REQUEST,
            Message::ChannelSuccess { .. } => msg::CHANNEL_SUCCESS,
            Message::ChannelFailure { .. } => msg::CHANNEL_FAILURE,
        }
    }

    /// Encode into a fresh payload buffer, message number first.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

impl Encode for Message {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.number());
        match self {
            Message::Ignore { data } => buf.put_ssh_string(data),
            Message::GlobalRequest { want_reply, kind } => match kind {
                GlobalRequestKind::TcpipForward { address, port } => {
                    buf.put_ssh_string(b"tcpip-forward");
                    buf.put_ssh_bool(*want_reply);
                    buf.put_ssh_string(address.as_bytes());
                    buf.put_u32(*port);
                }
                GlobalRequestKind::CancelTcpipForward { address, port } => {
                    buf.put_ssh_string(b"cancel-tcpip-forward");
                    buf.put_ssh_bool(*want_reply);
                    buf.put_ssh_string(address.as_bytes());
                    buf.put_u32(*port);
                }
                GlobalRequestKind::Other { name, payload } => {
                    buf.put_ssh_string(name.as_bytes());
                    buf.put_ssh_bool(*want_reply);
                    buf.put_slice(payload);
                }
            },
            Message::RequestSuccess { data } => buf.put_slice(data),
            Message::RequestFailure => {}
            Message::ChannelOpen {
                sender_channel,
                initial_window,
                max_packet,
                payload,
            } => {
                buf.put_ssh_string(payload.channel_type().as_bytes());
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window);
                buf.put_u32(*max_packet);
                payload.encode_fields(buf);
            }
            Message::ChannelOpenConfirmation {
                recipient_channel,
                sender_channel,
                initial_window,
                max_packet,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*sender_channel);
                buf.put_u32(*initial_window);
                buf.put_u32(*max_packet);
            }
            Message::ChannelOpenFailure {
                recipient_channel,
                reason,
                description,
                language,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*reason);
                buf.put_ssh_string(description.as_bytes());
                buf.put_ssh_string(language.as_bytes());
            }
            Message::ChannelWindowAdjust {
                recipient_channel,
                bytes_to_add,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*bytes_to_add);
            }
            Message::ChannelData {
                recipient_channel,
                data,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_ssh_string(data);
            }
            Message::ChannelExtendedData {
                recipient_channel,
                data_type,
                data,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_u32(*data_type);
                buf.put_ssh_string(data);
            }
            Message::ChannelEof { recipient_channel }
            | Message::ChannelClose { recipient_channel }
            | Message::ChannelSuccess { recipient_channel }
            | Message::ChannelFailure { recipient_channel } => {
                buf.put_u32(*recipient_channel);
            }
            Message::ChannelRequest {
                recipient_channel,
                request,
                want_reply,
                payload,
            } => {
                buf.put_u32(*recipient_channel);
                buf.put_ssh_string(request.as_bytes());
                buf.put_ssh_bool(*want_reply);
                buf.put_slice(payload);
            }
        }
    }
}

impl Decode for Message {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let number = SshBufExt::try_get_u8(buf)?;
        let message = match number {
            msg::IGNORE => Message::Ignore {
                data: buf.try_get_string()?,
            },
            msg::GLOBAL_REQUEST => {
                let name = buf.try_get_utf8()?;
                let want_reply = buf.try_get_bool()?;
                let kind = match name.as_str() {
                    "tcpip-forward" => GlobalRequestKind::TcpipForward {
                        address: buf.try_get_utf8()?,
                        port: SshBufExt::try_get_u32(buf)?,
                    },
                    "cancel-tcpip-forward" => GlobalRequestKind::CancelTcpipForward {
                        address: buf.try_get_utf8()?,
                        port: SshBufExt::try_get_u32(buf)?,
                    },
                    _ => GlobalRequestKind::Other {
                        name,
                        payload: buf.split_to(buf.len()),
                    },
                };
                Message::GlobalRequest { want_reply, kind }
            }
            msg::REQUEST_SUCCESS => Message::RequestSuccess {
                data: buf.split_to(buf.len()),
            },
            msg::REQUEST_FAILURE => Message::RequestFailure,
            msg::CHANNEL_OPEN => {
                let ctype = buf.try_get_utf8()?;
                let sender_channel = SshBufExt::try_get_u32(buf)?;
                let initial_window = SshBufExt::try_get_u32(buf)?;
                let max_packet = SshBufExt::try_get_u32(buf)?;
                Message::ChannelOpen {
                    sender_channel,
                    initial_window,
                    max_packet,
                    payload: OpenPayload::decode(ctype, buf)?,
                }
            }
            msg::CHANNEL_OPEN_CONFIRMATION => Message::ChannelOpenConfirmation {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                sender_channel: SshBufExt::try_get_u32(buf)?,
                initial_window: SshBufExt::try_get_u32(buf)?,
                max_packet: SshBufExt::try_get_u32(buf)?,
            },
            msg::CHANNEL_OPEN_FAILURE => Message::ChannelOpenFailure {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                reason: SshBufExt::try_get_u32(buf)?,
                description: buf.try_get_utf8()?,
                language: buf.try_get_utf8()?,
            },
            msg::CHANNEL_WINDOW_ADJUST => Message::ChannelWindowAdjust {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                bytes_to_add: SshBufExt::try_get_u32(buf)?,
            },
            msg::CHANNEL_DATA => Message::ChannelData {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                data: buf.try_get_string()?,
            },
            msg::CHANNEL_EXTENDED_DATA => Message::ChannelExtendedData {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                data_type: SshBufExt::try_get_u32(buf)?,
                data: buf.try_get_string()?,
            },
            msg::CHANNEL_EOF => Message::ChannelEof {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
            },
            msg::CHANNEL_CLOSE => Message::ChannelClose {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
            },
            msg::CHANNEL_REQUEST => Message::ChannelRequest {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
                request: buf.try_get_utf8()?,
                want_reply: buf.try_get_bool()?,
                payload: buf.split_to(buf.len()),
            },
            msg::CHANNEL_SUCCESS => Message::ChannelSuccess {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
            },
            msg::CHANNEL_FAILURE => Message::ChannelFailure {
                recipient_channel: SshBufExt::try_get_u32(buf)?,
            },
            other => return Err(DecodeError::UnknownMessage(other)),
        };
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes(buf.len()));
        }
        Ok(message)
    }
}

impl Message {
    /// Decode a complete packet payload.
    pub fn from_bytes(bytes: Bytes) -> Result<Self, DecodeError> {
        let mut buf = bytes;
        Self::decode(&mut buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes();
        let decoded = Message::from_bytes(bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn roundtrip_channel_open_session() {
        roundtrip(Message::ChannelOpen {
            sender_channel: 3,
            initial_window: 0x100000,
            max_packet: 0x8000,
            payload: OpenPayload::Session,
        });
    }

    #[test]
    fn roundtrip_channel_open_direct_tcpip() {
        roundtrip(Message::ChannelOpen {
            sender_channel: 1,
            initial_window: 2097152,
            max_packet: 32768,
            payload: OpenPayload::DirectTcpip {
                host: "host.example".into(),
                port: 443,
                originator: "127.0.0.1".into(),
                originator_port: 51234,
            },
        });
    }

    #[test]
    fn roundtrip_open_unknown_type() {
        roundtrip(Message::ChannelOpen {
            sender_channel: 9,
            initial_window: 65536,
            max_packet: 16384,
            payload: OpenPayload::Other {
                ctype: "tun@openssh.com".into(),
                data: Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 0]),
            },
        });
    }

    #[test]
    fn roundtrip_data_and_window() {
        roundtrip(Message::ChannelData {
            recipient_channel: 7,
            data: Bytes::from_static(b"hello over the wire"),
        });
        roundtrip(Message::ChannelExtendedData {
            recipient_channel: 7,
            data_type: crate::EXTENDED_DATA_STDERR,
            data: Bytes::from_static(b"oops"),
        });
        roundtrip(Message::ChannelWindowAdjust {
            recipient_channel: 7,
            bytes_to_add: 123456,
        });
    }

    #[test]
    fn roundtrip_lifecycle_messages() {
        roundtrip(Message::ChannelOpenConfirmation {
            recipient_channel: 3,
            sender_channel: 7,
            initial_window: 2 * 1024 * 1024,
            max_packet: 32 * 1024,
        });
        roundtrip(Message::ChannelOpenFailure {
            recipient_channel: 3,
            reason: crate::OPEN_ADMINISTRATIVELY_PROHIBITED,
            description: "open failed".into(),
            language: String::new(),
        });
        roundtrip(Message::ChannelEof {
            recipient_channel: 4,
        });
        roundtrip(Message::ChannelClose {
            recipient_channel: 4,
        });
        roundtrip(Message::ChannelSuccess {
            recipient_channel: 2,
        });
        roundtrip(Message::ChannelFailure {
            recipient_channel: 2,
        });
    }

    #[test]
    fn roundtrip_global_requests() {
        roundtrip(Message::GlobalRequest {
            want_reply: true,
            kind: GlobalRequestKind::TcpipForward {
                address: "localhost".into(),
                port: 8080,
            },
        });
        roundtrip(Message::GlobalRequest {
            want_reply: false,
            kind: GlobalRequestKind::CancelTcpipForward {
                address: String::new(),
                port: 8080,
            },
        });
    }

    #[test]
    fn roundtrip_channel_request() {
        roundtrip(Message::ChannelRequest {
            recipient_channel: 5,
            request: "exec".into(),
            want_reply: true,
            payload: {
                let mut buf = BytesMut::new();
                buf.put_ssh_string(b"ls -l");
                buf.freeze()
            },
        });
    }

    #[test]
    fn truncated_open_is_an_error() {
        let full = Message::ChannelOpen {
            sender_channel: 1,
            initial_window: 1024,
            max_packet: 512,
            payload: OpenPayload::DirectTcpip {
                host: "example.com".into(),
                port: 22,
                originator: "10.0.0.1".into(),
                originator_port: 1024,
            },
        }
        .to_bytes();
        let cut = full.slice(..full.len() - 3);
        assert!(matches!(
            Message::from_bytes(cut),
            Err(DecodeError::Truncated)
        ));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let mut buf = BytesMut::new();
        Message::ChannelEof {
            recipient_channel: 1,
        }
        .encode(&mut buf);
        buf.put_u8(0xff);
        assert!(matches!(
            Message::from_bytes(buf.freeze()),
            Err(DecodeError::TrailingBytes(1))
        ));
    }

    #[test]
    fn unknown_message_number_is_an_error() {
        let bytes = Bytes::from_static(&[42, 0, 0, 0, 0]);
        assert!(matches!(
            Message::from_bytes(bytes),
            Err(DecodeError::UnknownMessage(42))
        ));
    }
}
