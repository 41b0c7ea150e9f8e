//! End-to-end behavior over real sockets and pipes: forwarding listeners,
//! SOCKS dynamic channels, session data, and the control multiplexer.

mod common;

use std::cell::RefCell;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{muxer, run_until, PEER_ID};
use sshmux_core::mio::unix::pipe;
use sshmux_core::proto::{Message, OpenPayload, OPEN_ADMINISTRATIVELY_PROHIBITED};
use sshmux_core::{
    ChannelId, ChannelType, Endpoints, ExtendedUsage, GatewayPorts, MuxCallback, Muxer,
    PipeReader, PipeWriter, TCP_PACKET_DEFAULT, TCP_WINDOW_DEFAULT,
};

/// Read `buf.len()` bytes from a non-blocking endpoint, ticking the loop
/// while the data trickles through.
fn read_exact_with_ticks(mux: &mut Muxer, reader: &mut impl Read, buf: &mut [u8]) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut filled = 0;
    while filled < buf.len() {
        assert!(Instant::now() < deadline, "read did not complete in time");
        mux.tick(Some(Duration::from_millis(10))).expect("tick");
        match reader.read(&mut buf[filled..]) {
            Ok(0) => panic!("peer closed before the read completed"),
            Ok(n) => filled += n,
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(err) => panic!("read failed: {err}"),
        }
    }
}

fn dynamic_channel(mux: &mut Muxer) -> (std::os::unix::net::UnixStream, ChannelId) {
    let (client, server) = std::os::unix::net::UnixStream::pair().expect("socketpair");
    client
        .set_read_timeout(Some(Duration::from_millis(10)))
        .expect("timeout");
    server.set_nonblocking(true).expect("nonblocking");
    let server = sshmux_core::mio::net::UnixStream::from_std(server);
    let id = mux
        .new_channel(
            ChannelType::Dynamic,
            "dynamic-tcpip",
            Endpoints::Socket(Box::new(server)),
            TCP_WINDOW_DEFAULT,
            TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "dynamic-tcpip",
        )
        .expect("dynamic channel");
    (client, id)
}

fn temp_socket_path(tag: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("sshmux-test-{tag}-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&path);
    path
}

#[test]
fn socks4a_request_resolves_the_target_and_grants() {
    let (mut mux, sent) = muxer();
    let (mut client, id) = dynamic_channel(&mut mux);

    client
        .write_all(b"\x04\x01\x01\xbb\x00\x00\x00\x01user\x00host.example\x00")
        .unwrap();
    run_until(&mut mux, |mux| {
        mux.channel(id).unwrap().ty == ChannelType::Opening
    });
    {
        let channel = mux.channel(id).unwrap();
        assert_eq!(channel.path.as_deref(), Some("host.example"));
        assert_eq!(channel.host_port, 443);
    }
    assert!(sent.contains(|m| matches!(
        m,
        Message::ChannelOpen {
            payload: OpenPayload::DirectTcpip { host, port, .. },
            ..
        } if host == "host.example" && *port == 443
    )));

    // The granted reply is flushed once the peer confirms the open.
    mux.dispatch_message(Message::ChannelOpenConfirmation {
        recipient_channel: id.value(),
        sender_channel: PEER_ID,
        initial_window: 1024 * 1024,
        max_packet: 32 * 1024,
    })
    .unwrap();
    let mut reply = [0u8; 8];
    read_exact_with_ticks(&mut mux, &mut client, &mut reply);
    assert_eq!(&reply, b"\x00\x5a\x00\x00\x00\x00\x00\x00");
}

#[test]
fn socks5_negotiates_then_connects() {
    let (mut mux, sent) = muxer();
    let (mut client, id) = dynamic_channel(&mut mux);

    client.write_all(b"\x05\x01\x00").unwrap();
    let mut method = [0u8; 2];
    read_exact_with_ticks(&mut mux, &mut client, &mut method);
    assert_eq!(&method, b"\x05\x00");

    client
        .write_all(b"\x05\x01\x00\x03\x0bexample.com\x01\xbb")
        .unwrap();
    run_until(&mut mux, |mux| {
        mux.channel(id).unwrap().ty == ChannelType::Opening
    });
    {
        let channel = mux.channel(id).unwrap();
        assert_eq!(channel.path.as_deref(), Some("example.com"));
        assert_eq!(channel.host_port, 443);
    }
    assert!(sent.contains(|m| matches!(
        m,
        Message::ChannelOpen {
            payload: OpenPayload::DirectTcpip { host, port, .. },
            ..
        } if host == "example.com" && *port == 443
    )));
}

#[test]
fn garbage_on_a_dynamic_channel_kills_it() {
    let (mut mux, _sent) = muxer();
    let (mut client, id) = dynamic_channel(&mut mux);
    client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
    run_until(&mut mux, |mux| mux.channel(id).is_none());
}

#[test]
fn local_forward_listener_spawns_direct_tcpip_children() {
    let (mut mux, sent) = muxer();
    let ids = mux
        .setup_local_fwd_listener(Some("127.0.0.1"), 0, "target.example", 80, GatewayPorts::No)
        .unwrap();
    let addr = mux.listener_addr(ids[0]).expect("bound address");

    let _client = std::net::TcpStream::connect(addr).unwrap();
    run_until(&mut mux, |mux| mux.table().len() > ids.len());

    let child = mux
        .table()
        .iter()
        .find(|c| c.ty == ChannelType::Opening)
        .expect("child channel");
    assert_eq!(child.path.as_deref(), Some("target.example"));
    assert_eq!(child.host_port, 80);
    assert!(sent.contains(|m| matches!(
        m,
        Message::ChannelOpen {
            payload: OpenPayload::DirectTcpip { host, port, .. },
            ..
        } if host == "target.example" && *port == 80
    )));
}

#[test]
fn dynamic_forward_children_start_with_a_socks_handshake() {
    let (mut mux, sent) = muxer();
    let ids = mux
        .setup_local_fwd_listener(Some("127.0.0.1"), 0, "", 0, GatewayPorts::No)
        .unwrap();
    let addr = mux.listener_addr(ids[0]).expect("bound address");

    let _client = std::net::TcpStream::connect(addr).unwrap();
    run_until(&mut mux, |mux| mux.table().len() > ids.len());
    assert!(mux
        .table()
        .iter()
        .any(|c| c.ty == ChannelType::Dynamic));
    // No open goes out until the SOCKS target is known.
    assert!(!sent.contains(|m| matches!(m, Message::ChannelOpen { .. })));
}

#[test]
fn remote_forward_listener_shares_one_allocated_port() {
    let (mut mux, _sent) = muxer();
    let (port, ids) = mux
        .setup_remote_fwd_listener(None, 0, GatewayPorts::No)
        .unwrap();
    assert_ne!(port, 0);
    for id in &ids {
        let channel = mux.channel(*id).unwrap();
        assert_eq!(channel.ty, ChannelType::RportListener);
        assert_eq!(channel.listening_port, port);
    }

    assert!(mux.cancel_rport_listener("", port));
    assert!(mux.table().is_empty());
}

#[test]
fn remote_forward_flow_connects_to_the_recorded_target() {
    let (mut mux, sent) = muxer();
    let target = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let target_port = target.local_addr().unwrap().port();

    mux.request_remote_forward(None, 8080, "127.0.0.1", target_port)
        .unwrap();
    assert!(sent.contains(|m| matches!(
        m,
        Message::GlobalRequest {
            want_reply: true,
            kind: sshmux_core::proto::GlobalRequestKind::TcpipForward { address, port },
        } if address == "localhost" && *port == 8080
    )));

    mux.dispatch_message(Message::ChannelOpen {
        sender_channel: 21,
        initial_window: 1024 * 1024,
        max_packet: 32 * 1024,
        payload: OpenPayload::ForwardedTcpip {
            address: "localhost".into(),
            port: 8080,
            originator: "192.0.2.10".into(),
            originator_port: 50000,
        },
    })
    .unwrap();
    run_until(&mut mux, |_| {
        sent.contains(|m| matches!(
            m,
            Message::ChannelOpenConfirmation {
                recipient_channel: 21,
                ..
            }
        ))
    });

    // Cancelling blanks the permission; the next open is refused.
    assert!(mux.request_rforward_cancel(None, 8080).unwrap());
    assert!(sent.contains(|m| matches!(
        m,
        Message::GlobalRequest {
            kind: sshmux_core::proto::GlobalRequestKind::CancelTcpipForward { .. },
            ..
        }
    )));
    mux.dispatch_message(Message::ChannelOpen {
        sender_channel: 22,
        initial_window: 1024 * 1024,
        max_packet: 32 * 1024,
        payload: OpenPayload::ForwardedTcpip {
            address: "localhost".into(),
            port: 8080,
            originator: "192.0.2.10".into(),
            originator_port: 50001,
        },
    })
    .unwrap();
    assert!(sent.contains(|m| matches!(
        m,
        Message::ChannelOpenFailure {
            recipient_channel: 22,
            reason: OPEN_ADMINISTRATIVELY_PROHIBITED,
            ..
        }
    )));
}

#[test]
fn session_data_flows_both_ways_through_pipes() {
    let (mut mux, sent) = muxer();
    let session_id = Rc::new(RefCell::new(None));
    {
        let session_id = session_id.clone();
        mux.set_open_hook(Box::new(move |mux, _request| {
            let id = mux
                .new_channel(
                    ChannelType::Larval,
                    "session",
                    Endpoints::None,
                    0,
                    32 * 1024,
                    ExtendedUsage::Ignore,
                    "server session",
                )
                .expect("session channel");
            *session_id.borrow_mut() = Some(id);
            sshmux_core::OpenDecision::Accept(id)
        }));
    }
    mux.dispatch_message(Message::ChannelOpen {
        sender_channel: 11,
        initial_window: 1024 * 1024,
        max_packet: 32 * 1024,
        payload: OpenPayload::Session,
    })
    .unwrap();
    let id = (*session_id.borrow()).expect("hook ran");

    let (mut app_stdin, session_rfd) = pipe::new().expect("pipe");
    let (session_wfd, mut app_stdout) = pipe::new().expect("pipe");
    mux.bind_endpoints(
        id,
        Endpoints::Split {
            rfd: Some(Box::new(PipeReader(session_rfd))),
            wfd: Some(Box::new(PipeWriter(session_wfd))),
            efd: None,
        },
        ExtendedUsage::Ignore,
        false,
        128 * 1024,
    )
    .unwrap();

    // Peer to local sink.
    mux.dispatch_message(Message::ChannelData {
        recipient_channel: id.value(),
        data: bytes::Bytes::from_static(b"hello, channel"),
    })
    .unwrap();
    let mut delivered = [0u8; 14];
    read_exact_with_ticks(&mut mux, &mut app_stdout, &mut delivered);
    assert_eq!(&delivered, b"hello, channel");
    assert_eq!(mux.channel(id).unwrap().local_consumed, 14);

    // Local source to peer, in order.
    app_stdin.write_all(b"response bytes").unwrap();
    run_until(&mut mux, |_| {
        sent.contains(|m| matches!(
            m,
            Message::ChannelData {
                recipient_channel: 11,
                data,
            } if data.as_ref() == b"response bytes"
        ))
    });

    // Closing the local source drains into an EOF for the peer.
    drop(app_stdin);
    run_until(&mut mux, |_| {
        sent.contains(|m| matches!(
            m,
            Message::ChannelEof {
                recipient_channel: 11,
            }
        ))
    });
}

#[test]
fn agent_listener_accepts_and_opens_agent_channels() {
    let (mut mux, sent) = muxer();
    let path = temp_socket_path("agent");
    let id = mux.setup_agent_listener(&path).unwrap();
    assert_eq!(mux.channel(id).unwrap().ty, ChannelType::AgentListener);

    let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
    run_until(&mut mux, |_| {
        sent.contains(|m| matches!(
            m,
            Message::ChannelOpen {
                payload: OpenPayload::AuthAgent,
                ..
            }
        ))
    });
    assert!(mux
        .table()
        .iter()
        .any(|c| c.ty == ChannelType::Opening && c.ctype == "auth-agent@openssh.com"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn mux_clients_speak_framed_packets_locally() {
    let (mut mux, sent) = muxer();
    let path = temp_socket_path("mux");

    let callback: MuxCallback = Rc::new(RefCell::new(
        move |mux: &mut Muxer, id: ChannelId| -> bool {
            let Some(channel) = mux.channel_mut(id) else {
                return false;
            };
            let Some(len) = channel.input.peek_u32() else {
                // Establishment call, before any packet arrived.
                return true;
            };
            let len = len as usize;
            if channel.input.len() < len + 4 {
                return true;
            }
            channel.input.consume(4);
            let body = channel.input.bytes()[..len].to_vec();
            channel.input.consume(len);
            // Echo the packet back, framed the same way.
            let mut reply = (body.len() as u32).to_be_bytes().to_vec();
            reply.extend_from_slice(&body);
            channel.output.put(&reply).is_ok()
        },
    ));
    mux.setup_mux_listener(&path, callback).unwrap();

    let mut client = std::os::unix::net::UnixStream::connect(&path).unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(10)))
        .unwrap();
    client.write_all(b"\x00\x00\x00\x05hello").unwrap();

    let mut reply = [0u8; 9];
    read_exact_with_ticks(&mut mux, &mut client, &mut reply);
    assert_eq!(&reply, b"\x00\x00\x00\x05hello");

    // Control channels are local: nothing goes to the peer.
    assert_eq!(sent.take().len(), 0);
    let _ = std::fs::remove_file(&path);
}
