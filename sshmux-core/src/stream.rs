use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use mio::{Interest, Registry, Token};

/// A non-blocking channel endpoint: something the readiness loop can poll
/// and the post-handlers can read or write.
///
/// Registering an endpoint on a channel hands it to the loop; the
/// registration contract is that it is already in non-blocking mode (every
/// `mio` type is by construction).
pub trait ChannelStream: Read + Write + Source {
    fn raw_fd(&self) -> RawFd;

    /// Peer address, when the endpoint is a network socket. Used to fill the
    /// originator fields of forwarding opens.
    fn peer(&self) -> Option<SocketAddr> {
        None
    }

    /// Half-close. Endpoints that cannot shut down one direction (pipes)
    /// are simply dropped by the caller instead.
    fn shutdown(&mut self, _how: Shutdown) -> io::Result<()> {
        Ok(())
    }

    /// Pending asynchronous error, i.e. `SO_ERROR`. Non-sockets never have
    /// one.
    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        Ok(None)
    }
}

impl ChannelStream for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn peer(&self) -> Option<SocketAddr> {
        self.peer_addr().ok()
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        TcpStream::shutdown(self, how)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        TcpStream::take_error(self)
    }
}

impl ChannelStream for UnixStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        UnixStream::shutdown(self, how)
    }

    fn take_error(&mut self) -> io::Result<Option<io::Error>> {
        UnixStream::take_error(self)
    }
}

/// Read half of a pipe (or any pipe-like fd) as a channel endpoint.
pub struct PipeReader(pub mio::unix::pipe::Receiver);

/// Write half of a pipe as a channel endpoint.
pub struct PipeWriter(pub mio::unix::pipe::Sender);

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for PipeReader {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Source for PipeReader {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.0.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.0.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.deregister(registry)
    }
}

impl ChannelStream for PipeReader {
    fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Read for PipeWriter {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Unsupported.into())
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Source for PipeWriter {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.0.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.0.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.0.deregister(registry)
    }
}

impl ChannelStream for PipeWriter {
    fn raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// A listening socket owned by a listener channel.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Accept one connection, returning it as a boxed endpoint plus the
    /// peer address when the socket family has one.
    pub fn accept(&self) -> io::Result<(Box<dyn ChannelStream>, Option<SocketAddr>)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), Some(peer)))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                Ok((Box::new(stream), None))
            }
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Listener::Tcp(listener) => listener.as_raw_fd(),
            Listener::Unix(listener) => listener.as_raw_fd(),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }
}

impl Source for Listener {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.register(registry, token, interests),
            Listener::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.reregister(registry, token, interests),
            Listener::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Listener::Tcp(listener) => listener.deregister(registry),
            Listener::Unix(listener) => listener.deregister(registry),
        }
    }
}

/// One pollable endpoint of a channel, with the interest the pre-handlers
/// declared for the coming tick, the interest currently registered with the
/// poller, and the readiness latched from past events.
///
/// The poller is edge-triggered; `readable`/`writable` stay latched until an
/// I/O call reports `WouldBlock`, which is what makes the per-tick
/// declare-wait-act structure sound.
pub(crate) struct IoSlot {
    pub stream: Box<dyn ChannelStream>,
    pub want: Option<Interest>,
    pub registered: Option<Interest>,
    pub readable: bool,
    pub writable: bool,
}

impl IoSlot {
    pub fn new(stream: Box<dyn ChannelStream>) -> Self {
        IoSlot {
            stream,
            want: None,
            registered: None,
            readable: false,
            writable: false,
        }
    }

    pub fn want_read(&mut self) {
        self.want = Some(match self.want {
            Some(interest) => interest | Interest::READABLE,
            None => Interest::READABLE,
        });
    }

    pub fn want_write(&mut self) {
        self.want = Some(match self.want {
            Some(interest) => interest | Interest::WRITABLE,
            None => Interest::WRITABLE,
        });
    }

    /// Readiness that the current tick both wants and has.
    pub fn actionable(&self) -> bool {
        match self.want {
            Some(interest) => {
                (interest.is_readable() && self.readable)
                    || (interest.is_writable() && self.writable)
            }
            None => false,
        }
    }
}

/// Registration state for a listener channel's socket.
pub(crate) struct ListenSlot {
    pub listener: Listener,
    pub want: bool,
    pub registered: bool,
    pub readable: bool,
}

impl ListenSlot {
    pub fn new(listener: Listener) -> Self {
        ListenSlot {
            listener,
            want: false,
            registered: false,
            readable: false,
        }
    }
}
