//! SOCKS4/4a/5 decoding for dynamically forwarded channels.
//!
//! A dynamic channel sits between accept and open: bytes accumulate in its
//! input buffer until a complete SOCKS request is visible, the reply is
//! queued straight into its output buffer, and the resolved target is left
//! in `path`/`host_port` for the open that follows. No error reply is ever
//! sent; a client that talks garbage just sees its socket close.

use std::net::{Ipv4Addr, Ipv6Addr};

use tracing::{debug, error};

use crate::channel::{Channel, ChannelFlags};

/// Longest hostname accepted from a SOCKS request, NUL included.
const MAX_HOSTNAME: usize = 1025;

/// How far into the buffer the SOCKS4 string scan is willing to look before
/// concluding the peer is sending garbage.
const SOCKS4_SCAN_LIMIT: usize = 1024;

const SOCKS_V4: u8 = 0x04;
const SOCKS_V5: u8 = 0x05;
const SOCKS_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 90;
const SOCKS5_NOAUTH: u8 = 0x00;
const SOCKS5_IPV4: u8 = 0x01;
const SOCKS5_DOMAIN: u8 = 0x03;
const SOCKS5_IPV6: u8 = 0x04;
const SOCKS5_SUCCESS: u8 = 0x00;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocksProgress {
    /// Keep reading; the request is not complete yet.
    NeedMore,
    /// Target resolved and reply queued; promote the channel.
    Done,
    /// Malformed or unsupported; kill the channel.
    Fail,
}

/// Dispatch on the version byte. The caller guarantees at least three bytes
/// are buffered.
pub(crate) fn decode(c: &mut Channel) -> SocksProgress {
    match c.input.bytes().first() {
        Some(&SOCKS_V4) => decode_socks4(c),
        Some(&SOCKS_V5) => decode_socks5(c),
        _ => SocksProgress::Fail,
    }
}

/// SOCKS4 and 4a. The fixed eight-byte header is followed by a
/// NUL-terminated user string, and for 4a (destination `0.0.0.x`, x != 0)
/// by a NUL-terminated hostname.
fn decode_socks4(c: &mut Channel) -> SocksProgress {
    debug!(channel = %c.id, "decode socks4");
    let have = c.input.len();
    if have < 8 {
        return SocksProgress::NeedMore;
    }
    let p = c.input.bytes();

    let is_4a = p[4] == 0 && p[5] == 0 && p[6] == 0 && p[7] != 0;
    let strings_needed = if is_4a { 2 } else { 1 };

    let mut found = 0;
    let mut last_nul = 0;
    for (i, &byte) in p.iter().enumerate().skip(8) {
        if byte == 0 {
            found += 1;
            last_nul = i;
            if found == strings_needed {
                break;
            }
        }
        if i > SOCKS4_SCAN_LIMIT {
            debug!(channel = %c.id, "decode socks4: request too long");
            return SocksProgress::Fail;
        }
    }
    if found < strings_needed {
        return SocksProgress::NeedMore;
    }

    let command = p[1];
    let dest_port = u16::from_be_bytes([p[2], p[3]]);
    let dest_addr = Ipv4Addr::new(p[4], p[5], p[6], p[7]);

    let first_nul = match p.iter().skip(8).position(|&b| b == 0) {
        Some(offset) => 8 + offset,
        None => return SocksProgress::NeedMore,
    };
    debug!(channel = %c.id, user_len = first_nul - 8, "decode socks4: user string");

    let path = if is_4a {
        let host = &p[first_nul + 1..last_nul];
        if host.len() + 1 > MAX_HOSTNAME {
            error!(channel = %c.id, len = host.len(), "socks4a hostname too long");
            return SocksProgress::Fail;
        }
        match std::str::from_utf8(host) {
            Ok(host) => host.to_owned(),
            Err(_) => {
                debug!(channel = %c.id, "socks4a hostname is not valid text");
                return SocksProgress::Fail;
            }
        }
    } else {
        dest_addr.to_string()
    };

    c.input.consume(last_nul + 1);
    c.path = Some(path);
    c.host_port = dest_port;

    debug!(
        channel = %c.id,
        host = c.path.as_deref().unwrap_or(""),
        port = c.host_port,
        command,
        "dynamic request: socks4"
    );

    if command != SOCKS_CONNECT {
        debug!(channel = %c.id, command, "socks4: only connect is supported");
        return SocksProgress::Fail;
    }
    // vn=0, cd=granted, then ignored port and address fields.
    if c.output
        .put(&[0, SOCKS4_GRANTED, 0, 0, 0, 0, 0, 0])
        .is_err()
    {
        return SocksProgress::Fail;
    }
    SocksProgress::Done
}

/// SOCKS5: method negotiation (which must offer "no authentication"),
/// then a connect request with an IPv4, IPv6 or domain target.
fn decode_socks5(c: &mut Channel) -> SocksProgress {
    debug!(channel = %c.id, "decode socks5");
    let p = c.input.bytes();
    let have = p.len();

    if !c.flags.contains(ChannelFlags::SOCKS5_AUTH_DONE) {
        // ver | nmethods | methods
        if have < 2 {
            return SocksProgress::NeedMore;
        }
        let nmethods = p[1] as usize;
        if have < nmethods + 2 {
            return SocksProgress::NeedMore;
        }
        if !p[2..2 + nmethods].contains(&SOCKS5_NOAUTH) {
            debug!(channel = %c.id, "socks5: no-authentication method not offered");
            return SocksProgress::Fail;
        }
        c.input.consume(nmethods + 2);
        if c.output.put(&[SOCKS_V5, SOCKS5_NOAUTH]).is_err() {
            return SocksProgress::Fail;
        }
        c.flags |= ChannelFlags::SOCKS5_AUTH_DONE;
        debug!(channel = %c.id, "socks5 auth done");
        return SocksProgress::NeedMore;
    }

    debug!(channel = %c.id, "socks5 post auth");
    if have < 5 {
        return SocksProgress::NeedMore;
    }
    let (version, command, reserved, atyp) = (p[0], p[1], p[2], p[3]);
    if version != SOCKS_V5 || command != SOCKS_CONNECT || reserved != 0 {
        debug!(channel = %c.id, "socks5: only connect is supported");
        return SocksProgress::Fail;
    }
    let (addr_len, is_domain) = match atyp {
        SOCKS5_IPV4 => (4, false),
        SOCKS5_DOMAIN => (p[4] as usize, true),
        SOCKS5_IPV6 => (16, false),
        _ => {
            debug!(channel = %c.id, atyp, "socks5: bad address type");
            return SocksProgress::Fail;
        }
    };
    let addr_off = 4 + usize::from(is_domain);
    let need = addr_off + addr_len + 2;
    if have < need {
        return SocksProgress::NeedMore;
    }

    let addr = &p[addr_off..addr_off + addr_len];
    let path = match atyp {
        SOCKS5_IPV4 => Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(),
        SOCKS5_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(addr);
            Ipv6Addr::from(octets).to_string()
        }
        _ => {
            if addr_len >= MAX_HOSTNAME {
                error!(channel = %c.id, len = addr_len, "socks5 hostname too long");
                return SocksProgress::Fail;
            }
            match std::str::from_utf8(addr) {
                Ok(host) => host.to_owned(),
                Err(_) => {
                    debug!(channel = %c.id, "socks5 hostname is not valid text");
                    return SocksProgress::Fail;
                }
            }
        }
    };
    let port = u16::from_be_bytes([p[addr_off + addr_len], p[addr_off + addr_len + 1]]);

    c.input.consume(need);
    c.path = Some(path);
    c.host_port = port;

    debug!(
        channel = %c.id,
        host = c.path.as_deref().unwrap_or(""),
        port = c.host_port,
        "dynamic request: socks5"
    );

    // Success, with a zeroed IPv4 bound address the client ignores.
    if c.output
        .put(&[SOCKS_V5, SOCKS5_SUCCESS, 0, SOCKS5_IPV4, 0, 0, 0, 0, 0, 0])
        .is_err()
    {
        return SocksProgress::Fail;
    }
    SocksProgress::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelId, ChannelType, Endpoints, ExtendedUsage};

    fn dynamic_channel() -> Channel {
        Channel::new(
            ChannelId(0),
            ChannelType::Dynamic,
            "dynamic-tcpip",
            Endpoints::None,
            crate::channel::TCP_WINDOW_DEFAULT,
            crate::channel::TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "dynamic".into(),
        )
    }

    #[test]
    fn socks4_plain_request() {
        let mut c = dynamic_channel();
        c.input
            .put(b"\x04\x01\x00\x50\xc0\x00\x02\x01user\x00")
            .unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Done);
        assert_eq!(c.path.as_deref(), Some("192.0.2.1"));
        assert_eq!(c.host_port, 80);
        assert_eq!(c.output.bytes(), b"\x00\x5a\x00\x00\x00\x00\x00\x00");
        assert!(c.input.is_empty());
    }

    #[test]
    fn socks4a_hostname_request() {
        let mut c = dynamic_channel();
        c.input
            .put(b"\x04\x01\x01\xbb\x00\x00\x00\x01user\x00host.example\x00")
            .unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Done);
        assert_eq!(c.path.as_deref(), Some("host.example"));
        assert_eq!(c.host_port, 443);
        assert_eq!(c.output.bytes(), b"\x00\x5a\x00\x00\x00\x00\x00\x00");
    }

    #[test]
    fn socks4_incomplete_needs_more() {
        let mut c = dynamic_channel();
        c.input.put(b"\x04\x01\x01\xbb\x00\x00\x00\x01us").unwrap();
        assert_eq!(decode(&mut c), SocksProgress::NeedMore);
        assert_eq!(c.input.len(), 10);
    }

    #[test]
    fn socks4_bind_command_rejected() {
        let mut c = dynamic_channel();
        c.input
            .put(b"\x04\x02\x00\x50\xc0\x00\x02\x01\x00")
            .unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Fail);
    }

    #[test]
    fn socks5_connect_to_domain() {
        let mut c = dynamic_channel();
        // Method negotiation offering no-auth.
        c.input.put(b"\x05\x01\x00").unwrap();
        assert_eq!(decode(&mut c), SocksProgress::NeedMore);
        assert_eq!(c.output.bytes(), b"\x05\x00");
        assert!(c.flags.contains(ChannelFlags::SOCKS5_AUTH_DONE));
        c.output.consume(2);

        // CONNECT example.com:443.
        c.input.put(b"\x05\x01\x00\x03\x0bexample.com\x01\xbb").unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Done);
        assert_eq!(c.path.as_deref(), Some("example.com"));
        assert_eq!(c.host_port, 443);
        assert_eq!(
            c.output.bytes(),
            b"\x05\x00\x00\x01\x00\x00\x00\x00\x00\x00"
        );
    }

    #[test]
    fn socks5_ipv6_target() {
        let mut c = dynamic_channel();
        c.flags |= ChannelFlags::SOCKS5_AUTH_DONE;
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&[0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
        req.extend_from_slice(&[0x00, 0x16]);
        c.input.put(&req).unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Done);
        assert_eq!(c.path.as_deref(), Some("2001:db8::1"));
        assert_eq!(c.host_port, 22);
    }

    #[test]
    fn socks5_without_noauth_method_rejected() {
        let mut c = dynamic_channel();
        c.input.put(b"\x05\x02\x01\x02").unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Fail);
    }

    #[test]
    fn pipelined_bytes_stay_buffered() {
        let mut c = dynamic_channel();
        c.flags |= ChannelFlags::SOCKS5_AUTH_DONE;
        let mut req = b"\x05\x01\x00\x01\x7f\x00\x00\x01\x00\x50".to_vec();
        req.extend_from_slice(b"GET / HTTP/1.0\r\n");
        c.input.put(&req).unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Done);
        assert_eq!(c.input.bytes(), b"GET / HTTP/1.0\r\n");
    }

    #[test]
    fn unknown_version_rejected() {
        let mut c = dynamic_channel();
        c.input.put(b"\x06\x01\x00").unwrap();
        assert_eq!(decode(&mut c), SocksProgress::Fail);
    }
}
