//! X11 forwarding support: DISPLAY parsing, display-socket connection, and
//! authentication-cookie spoofing.
//!
//! The remote X application is handed a fake cookie; the first packet of
//! every forwarded connection is buffered whole, its cookie verified against
//! the fake one in constant time, and rewritten in place to the real cookie
//! the local X server expects. A mismatch closes the connection.

use std::io;
use std::net::TcpStream as StdTcpStream;
use std::os::unix::net::UnixStream as StdUnixStream;

use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, error};

use crate::buffer::ByteBuffer;
use crate::connect::AfPreference;
use crate::stream::ChannelStream;

/// TCP displays live at 6000 + display number.
pub const X11_BASE_PORT: u16 = 6000;

/// Where unix-domain display sockets live.
const X11_UNIX_PATH: &str = "/tmp/.X11-unix/X";

/// Highest display number probed when creating a proxy listener.
pub(crate) const MAX_DISPLAYS: u32 = 1000;

/// At most this many sockets per proxy display (one per address family in
/// practice).
pub(crate) const MAX_DISPLAY_SOCKS: usize = 10;

/// Saved authentication state for one forwarded DISPLAY, alive for the
/// whole session.
pub struct X11SpoofState {
    pub display: String,
    pub proto: String,
    pub screen: u32,
    real_data: Vec<u8>,
    fake_data: Vec<u8>,
}

impl X11SpoofState {
    /// Parse the real auth cookie from its hex form and generate a fake one
    /// of identical length.
    pub fn generate(display: &str, proto: &str, hex_data: &str) -> Result<Self, hex::FromHexError> {
        let real_data = hex::decode(hex_data)?;
        let mut fake_data = vec![0u8; real_data.len()];
        rand::rng().fill_bytes(&mut fake_data);
        Ok(X11SpoofState {
            display: display.to_owned(),
            proto: proto.to_owned(),
            screen: screen_number(display),
            real_data,
            fake_data,
        })
    }

    /// The cookie advertised to the remote side, in hex.
    pub fn fake_data_hex(&self) -> String {
        hex::encode(&self.fake_data)
    }

    #[cfg(test)]
    pub(crate) fn with_cookies(proto: &str, real: Vec<u8>, fake: Vec<u8>) -> Self {
        X11SpoofState {
            display: ":0".into(),
            proto: proto.to_owned(),
            screen: 0,
            real_data: real,
            fake_data: fake,
        }
    }
}

/// Screen number from `host:display.screen`, defaulting to zero.
fn screen_number(display: &str) -> u32 {
    display
        .split_once(':')
        .and_then(|(_, rest)| rest.split_once('.'))
        .and_then(|(_, screen)| screen.parse().ok())
        .filter(|&screen| screen <= 400)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpoofResult {
    NeedMore,
    Mismatch,
    Ok,
}

fn pad4(n: usize) -> usize {
    (n + 3) & !3
}

/// Inspect the first X11 protocol packet buffered in `output`. If its auth
/// protocol and cookie match the advertised fake data, the cookie bytes are
/// replaced in place with the real ones.
pub(crate) fn open_helper(output: &mut ByteBuffer, state: &X11SpoofState) -> SpoofResult {
    // Fixed-size part of the setup packet.
    if output.len() < 12 {
        return SpoofResult::NeedMore;
    }
    let p = output.bytes();
    let (proto_len, data_len) = match p[0] {
        // 'B': most significant byte first.
        0x42 => (
            256 * p[6] as usize + p[7] as usize,
            256 * p[8] as usize + p[9] as usize,
        ),
        // 'l': least significant byte first.
        0x6c => (
            p[6] as usize + 256 * p[7] as usize,
            p[8] as usize + 256 * p[9] as usize,
        ),
        order => {
            debug!(order, "initial X11 packet has a bad byte-order byte");
            return SpoofResult::Mismatch;
        }
    };
    if output.len() < 12 + pad4(proto_len) + pad4(data_len) {
        return SpoofResult::NeedMore;
    }
    if proto_len != state.proto.len() || &p[12..12 + proto_len] != state.proto.as_bytes() {
        debug!("X11 connection uses a different authentication protocol");
        return SpoofResult::Mismatch;
    }
    let data_off = 12 + pad4(proto_len);
    let data = &p[data_off..data_off + data_len];
    if data_len != state.fake_data.len() || data.ct_eq(&state.fake_data).unwrap_u8() != 1 {
        debug!("X11 auth data does not match fake data");
        return SpoofResult::Mismatch;
    }
    if state.fake_data.len() != state.real_data.len() {
        error!(
            fake = state.fake_data.len(),
            real = state.real_data.len(),
            "X11 cookie length mismatch"
        );
        return SpoofResult::Mismatch;
    }
    // The connection authenticated against the fake cookie; substitute the
    // real one before the packet reaches the X server.
    output.bytes_mut()[data_off..data_off + data_len].copy_from_slice(&state.real_data);
    SpoofResult::Ok
}

/// A parsed DISPLAY value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X11Display {
    /// `unix:N[.S]`, `:N[.S]`: a unix-domain display socket.
    Unix { number: u32 },
    /// `host:N[.S]`: a TCP display at port 6000 + N.
    Tcp { host: String, number: u32 },
}

impl X11Display {
    pub fn parse(display: &str) -> io::Result<Self> {
        let bad = |msg: &str| io::Error::new(io::ErrorKind::InvalidInput, msg.to_owned());
        if display.is_empty() {
            return Err(bad("DISPLAY is empty"));
        }
        if display.starts_with("unix:") || display.starts_with(':') {
            let after = match display.rsplit_once(':') {
                Some((_, after)) => after,
                None => return Err(bad("no display number in DISPLAY")),
            };
            let number = after
                .split('.')
                .next()
                .unwrap_or("")
                .parse()
                .map_err(|_| bad("could not parse display number from DISPLAY"))?;
            return Ok(X11Display::Unix { number });
        }
        let (host, after) = display
            .split_once(':')
            .ok_or_else(|| bad("could not find ':' in DISPLAY"))?;
        let number = after
            .split('.')
            .next()
            .unwrap_or("")
            .parse()
            .map_err(|_| bad("could not parse display number from DISPLAY"))?;
        Ok(X11Display::Tcp {
            host: host.to_owned(),
            number,
        })
    }
}

/// Open a connection to the real local X server named by `display`.
///
/// The connect itself is done in blocking mode, like the original; the
/// returned endpoint is switched to non-blocking before it joins the
/// readiness loop.
pub fn connect_display(display: &str, af: AfPreference) -> io::Result<Box<dyn ChannelStream>> {
    match X11Display::parse(display)? {
        X11Display::Unix { number } => {
            let path = format!("{X11_UNIX_PATH}{number}");
            let stream = StdUnixStream::connect(&path)?;
            stream.set_nonblocking(true)?;
            Ok(Box::new(mio::net::UnixStream::from_std(stream)))
        }
        X11Display::Tcp { host, number } => {
            let port = X11_BASE_PORT + number as u16;
            let mut last_err = None;
            for addr in std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), port))? {
                if !af.admits(&addr) {
                    continue;
                }
                match StdTcpStream::connect(addr) {
                    Ok(stream) => {
                        let _ = stream.set_nodelay(true);
                        stream.set_nonblocking(true)?;
                        return Ok(Box::new(mio::net::TcpStream::from_std(stream)));
                    }
                    Err(err) => {
                        debug!(%addr, %err, "connect to X display failed");
                        last_err = Some(err);
                    }
                }
            }
            Err(last_err.unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{host}: no usable addresses"))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_packet(order: u8, proto: &[u8], data: &[u8]) -> Vec<u8> {
        let mut packet = vec![order, 0, 11, 0, 0, 0];
        match order {
            0x42 => {
                packet[2..4].copy_from_slice(&(11u16).to_be_bytes());
                packet.extend_from_slice(&(proto.len() as u16).to_be_bytes());
                packet.extend_from_slice(&(data.len() as u16).to_be_bytes());
            }
            _ => {
                packet.extend_from_slice(&(proto.len() as u16).to_le_bytes());
                packet.extend_from_slice(&(data.len() as u16).to_le_bytes());
            }
        }
        packet.extend_from_slice(&[0, 0]);
        assert_eq!(packet.len(), 12);
        packet.extend_from_slice(proto);
        packet.resize(12 + pad4(proto.len()), 0);
        packet.extend_from_slice(data);
        packet.resize(12 + pad4(proto.len()) + pad4(data.len()), 0);
        packet
    }

    #[test]
    fn matching_fake_cookie_is_replaced_by_real() {
        let real: Vec<u8> = (0..16).collect();
        let fake: Vec<u8> = (16..32).collect();
        let state = X11SpoofState::with_cookies("MIT-MAGIC-COOKIE-1", real.clone(), fake.clone());

        let mut output = ByteBuffer::new();
        output
            .put(&setup_packet(0x6c, b"MIT-MAGIC-COOKIE-1", &fake))
            .unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::Ok);

        let data_off = 12 + pad4(18);
        assert_eq!(&output.bytes()[data_off..data_off + 16], &real[..]);
    }

    #[test]
    fn single_bit_flip_is_rejected() {
        let real: Vec<u8> = (0..16).collect();
        let mut fake: Vec<u8> = (16..32).collect();
        let state = X11SpoofState::with_cookies("MIT-MAGIC-COOKIE-1", real, fake.clone());

        fake[7] ^= 0x01;
        let mut output = ByteBuffer::new();
        output
            .put(&setup_packet(0x42, b"MIT-MAGIC-COOKIE-1", &fake))
            .unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::Mismatch);
    }

    #[test]
    fn wrong_protocol_name_is_rejected() {
        let state = X11SpoofState::with_cookies("MIT-MAGIC-COOKIE-1", vec![1; 16], vec![2; 16]);
        let mut output = ByteBuffer::new();
        output
            .put(&setup_packet(0x6c, b"XDM-AUTHORIZATION-1", &[2; 16]))
            .unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::Mismatch);
    }

    #[test]
    fn partial_packet_waits_for_more() {
        let state = X11SpoofState::with_cookies("MIT-MAGIC-COOKIE-1", vec![1; 16], vec![2; 16]);
        let packet = setup_packet(0x6c, b"MIT-MAGIC-COOKIE-1", &[2; 16]);
        let mut output = ByteBuffer::new();
        output.put(&packet[..20]).unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::NeedMore);
        output.put(&packet[20..]).unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::Ok);
    }

    #[test]
    fn bad_byte_order_is_rejected() {
        let state = X11SpoofState::with_cookies("MIT-MAGIC-COOKIE-1", vec![1; 16], vec![2; 16]);
        let mut output = ByteBuffer::new();
        output.put(&[0x00; 16]).unwrap();
        assert_eq!(open_helper(&mut output, &state), SpoofResult::Mismatch);
    }

    #[test]
    fn fake_cookie_has_real_length_and_differs() {
        let state =
            X11SpoofState::generate(":0", "MIT-MAGIC-COOKIE-1", "000102030405060708090a0b0c0d0e0f")
                .unwrap();
        assert_eq!(state.real_data.len(), 16);
        assert_eq!(state.fake_data.len(), 16);
        assert_eq!(state.fake_data_hex().len(), 32);
    }

    #[test]
    fn display_forms_parse() {
        assert_eq!(
            X11Display::parse("unix:10.2").unwrap(),
            X11Display::Unix { number: 10 }
        );
        assert_eq!(
            X11Display::parse(":0").unwrap(),
            X11Display::Unix { number: 0 }
        );
        assert_eq!(
            X11Display::parse("remote.example:3.1").unwrap(),
            X11Display::Tcp {
                host: "remote.example".into(),
                number: 3,
            }
        );
        assert!(X11Display::parse("nonsense").is_err());
    }

    #[test]
    fn screen_numbers() {
        assert_eq!(screen_number("localhost:10.3"), 3);
        assert_eq!(screen_number(":0"), 0);
        assert_eq!(screen_number(":0.401"), 0);
    }
}
