use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::vec;

use mio::net::TcpStream;
use tracing::debug;

/// Restrict connects and listeners to one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfPreference {
    #[default]
    Any,
    V4Only,
    V6Only,
}

impl AfPreference {
    pub(crate) fn admits(self, addr: &SocketAddr) -> bool {
        match self {
            AfPreference::Any => true,
            AfPreference::V4Only => addr.is_ipv4(),
            AfPreference::V6Only => addr.is_ipv6(),
        }
    }
}

/// Iterator over the resolved addresses of a connect target, alive only
/// while its channel is CONNECTING.
pub struct ConnectCtx {
    pub host: String,
    pub port: u16,
    addrs: vec::IntoIter<SocketAddr>,
}

impl ConnectCtx {
    /// Resolve `host:port`, keeping only addresses the family preference
    /// admits.
    pub(crate) fn resolve(host: &str, port: u16, af: AfPreference) -> io::Result<ConnectCtx> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()?
            .filter(|addr| af.admits(addr))
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{host}: no usable addresses"),
            ));
        }
        Ok(ConnectCtx {
            host: host.to_owned(),
            port,
            addrs: addrs.into_iter(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_addrs(host: &str, port: u16, addrs: Vec<SocketAddr>) -> ConnectCtx {
        ConnectCtx {
            host: host.to_owned(),
            port,
            addrs: addrs.into_iter(),
        }
    }

    /// Start a non-blocking connect to the next address. Addresses whose
    /// connect fails outright are skipped; completion (or the asynchronous
    /// failure) of a returned stream is observed by the readiness loop.
    pub(crate) fn connect_next(&mut self) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.addrs.by_ref() {
            match TcpStream::connect(addr) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(host = %self.host, %addr, "connect in progress");
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(host = %self.host, %addr, %err, "connect failed, trying next");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no more addresses to try")
        }))
    }
}

impl std::fmt::Debug for ConnectCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectCtx")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_numeric_addresses() {
        let ctx = ConnectCtx::resolve("127.0.0.1", 4242, AfPreference::Any).unwrap();
        assert_eq!(ctx.host, "127.0.0.1");
        assert_eq!(ctx.port, 4242);
    }

    #[test]
    fn family_preference_filters() {
        let err = ConnectCtx::resolve("127.0.0.1", 4242, AfPreference::V6Only).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
