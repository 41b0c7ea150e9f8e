//! TCP/IP forwarding: the admission policy for connect targets, and the
//! listening sockets that feed new channels into the table.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::Path;

use mio::net::{TcpListener, UnixListener};
use tracing::{debug, info, warn};

use crate::channel::{
    ChannelId, ChannelType, Endpoints, ExtendedUsage, MuxCallback, TCP_PACKET_DEFAULT,
    TCP_WINDOW_DEFAULT, X11_PACKET_DEFAULT, X11_WINDOW_DEFAULT,
};
use crate::error::Error;
use crate::mux::Muxer;
use crate::stream::Listener;
use crate::x11::{MAX_DISPLAYS, MAX_DISPLAY_SOCKS, X11_BASE_PORT};

/// Port pattern matching any requested port.
pub const ANY_PORT: u16 = 0;

/// One permitted (host, port) connect target. A blanked entry (host `None`)
/// keeps its index so previously returned handles stay valid.
#[derive(Debug, Clone)]
struct Permission {
    host: Option<String>,
    port: u16,
    listen_port: u16,
}

fn port_match(allowed: u16, requested: u16) -> bool {
    allowed == ANY_PORT || allowed == requested
}

/// Admission lists for forwarded connections: one declared by the user, one
/// imposed by the administrator. A target passes only if both agree.
#[derive(Debug, Default)]
pub struct ForwardPolicy {
    permitted: Vec<Permission>,
    adm_permitted: Vec<Permission>,
    all_permitted: bool,
}

impl ForwardPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permit any target. Used by servers, which have to trust the peer's
    /// choice of target anyway.
    pub fn permit_all(&mut self) {
        if self.permitted.is_empty() {
            self.all_permitted = true;
        }
    }

    pub fn all_permitted(&self) -> bool {
        self.all_permitted
    }

    pub fn add_permitted(&mut self, host: &str, port: u16) {
        debug!(host, port, "allow port forwarding");
        self.permitted.push(Permission {
            host: Some(host.to_owned()),
            port,
            listen_port: 0,
        });
        self.all_permitted = false;
    }

    pub fn add_adm_permitted(&mut self, host: &str, port: u16) -> usize {
        debug!(host, port, "config allows port forwarding");
        self.adm_permitted.push(Permission {
            host: Some(host.to_owned()),
            port,
            listen_port: 0,
        });
        self.adm_permitted.len()
    }

    /// Deny every local open: a single blanked entry makes the admin list
    /// non-empty while matching nothing.
    pub fn disable_adm_local_opens(&mut self) {
        self.clear_adm_permitted();
        self.adm_permitted.push(Permission {
            host: None,
            port: 0,
            listen_port: 0,
        });
    }

    pub fn clear_permitted(&mut self) {
        self.permitted.clear();
    }

    pub fn clear_adm_permitted(&mut self) {
        self.adm_permitted.clear();
    }

    /// Record the target backing a remote forward we requested, returning a
    /// handle for later port updates.
    pub(crate) fn record_remote_forward(
        &mut self,
        host_to_connect: &str,
        port_to_connect: u16,
        listen_port: u16,
    ) -> usize {
        self.permitted.push(Permission {
            host: Some(host_to_connect.to_owned()),
            port: port_to_connect,
            listen_port,
        });
        self.permitted.len() - 1
    }

    /// Patch the listen port of a recorded remote forward once the server
    /// reports the port it actually allocated. `None` invalidates the entry.
    pub fn update_permitted(&mut self, handle: usize, new_port: Option<u16>) {
        let Some(entry) = self.permitted.get_mut(handle) else {
            debug!(handle, "permitted-open handle out of range");
            return;
        };
        match new_port {
            Some(port) => {
                debug!(port, host = ?entry.host, "updating allowed listen port");
                entry.listen_port = port;
            }
            None => {
                debug!(host = ?entry.host, "removing allowed listen port");
                entry.host = None;
                entry.port = 0;
                entry.listen_port = 0;
            }
        }
    }

    pub(crate) fn find_by_listen_port(&self, listen_port: u16) -> Option<usize> {
        self.permitted
            .iter()
            .position(|p| p.host.is_some() && p.listen_port == listen_port)
    }

    pub(crate) fn blank(&mut self, handle: usize) {
        self.update_permitted(handle, None);
    }

    /// Target of the user forward whose listen port matches, for
    /// `forwarded-tcpip` opens arriving at a client.
    pub(crate) fn connect_target_for_listen_port(&self, listen_port: u16) -> Option<(String, u16)> {
        self.permitted.iter().find_map(|p| match &p.host {
            Some(host) if port_match(p.listen_port, listen_port) => {
                Some((host.clone(), p.port))
            }
            _ => None,
        })
    }

    /// Whether a connection to (host, port) is allowed.
    pub fn connect_allowed(&self, host: &str, port: u16) -> bool {
        let mut permit = self.all_permitted;
        if !permit {
            permit = self.permitted.iter().any(|p| {
                matches!(&p.host, Some(h) if h == host) && port_match(p.port, port)
            });
        }
        let mut permit_adm = true;
        if !self.adm_permitted.is_empty() {
            permit_adm = self.adm_permitted.iter().any(|p| {
                matches!(&p.host, Some(h) if h == host) && port_match(p.port, port)
            });
        }
        permit && permit_adm
    }

    /// The admin list in `permitopen` config syntax.
    pub fn adm_listing(&self) -> String {
        let mut out = String::from("permitopen");
        if self.adm_permitted.is_empty() {
            out.push_str(" any");
            return out;
        }
        for p in &self.adm_permitted {
            match &p.host {
                None => out.push_str(" none"),
                Some(host) => out.push_str(&format!(" {}:{}", host, p.port)),
            }
        }
        out
    }
}

/// Parse a `permitopen`-style port: `"*"` means any port.
pub fn permitopen_port(s: &str) -> Option<u16> {
    if s == "*" {
        return Some(ANY_PORT);
    }
    match s.parse::<u16>() {
        Ok(port) if port > 0 => Some(port),
        _ => None,
    }
}

/// Server policy for which addresses forwarded ports bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GatewayPorts {
    /// Loopback only.
    #[default]
    No,
    /// Force a wildcard bind.
    Yes,
    /// Bind whatever address the client asked for.
    ClientSpecified,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BindAddr {
    Wildcard,
    Loopback,
    Addr(String),
}

/// Pick the bind address for a forward listener. On the client a specified
/// address always wins; on the server `GatewayPorts::Yes` forces a wildcard
/// and `ClientSpecified` honors the request.
pub(crate) fn fwd_bind_addr(
    listen_addr: Option<&str>,
    is_client: bool,
    gateway_ports: GatewayPorts,
) -> BindAddr {
    match listen_addr {
        None => {
            if gateway_ports != GatewayPorts::No {
                BindAddr::Wildcard
            } else {
                BindAddr::Loopback
            }
        }
        Some(addr) if gateway_ports != GatewayPorts::No || is_client => {
            if addr.is_empty()
                || addr == "*"
                || (!is_client && gateway_ports == GatewayPorts::Yes)
            {
                BindAddr::Wildcard
            } else if addr == "localhost" {
                BindAddr::Loopback
            } else {
                BindAddr::Addr(addr.to_owned())
            }
        }
        Some(_) => BindAddr::Loopback,
    }
}

/// The bind host sent in `tcpip-forward` requests for a given -R listen
/// host.
pub(crate) fn rfwd_bind_host(listen_host: Option<&str>) -> String {
    match listen_host {
        None => "localhost".to_owned(),
        Some("") | Some("*") => String::new(),
        Some(host) => host.to_owned(),
    }
}

fn resolve_bind(
    addr: &BindAddr,
    port: u16,
    af: crate::connect::AfPreference,
) -> std::io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = match addr {
        BindAddr::Wildcard => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ],
        BindAddr::Loopback => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        ],
        BindAddr::Addr(host) => (host.as_str(), port).to_socket_addrs()?.collect(),
    };
    Ok(addrs.into_iter().filter(|a| af.admits(a)).collect())
}

impl Muxer {
    /// Listen locally and tunnel every accepted connection to
    /// `host_to_connect:port_to_connect` (or into a SOCKS handshake when the
    /// target port is zero).
    pub fn setup_local_fwd_listener(
        &mut self,
        listen_host: Option<&str>,
        listen_port: u16,
        host_to_connect: &str,
        port_to_connect: u16,
        gateway_ports: GatewayPorts,
    ) -> Result<Vec<ChannelId>, Error> {
        self.setup_fwd_listener(
            ChannelType::PortListener,
            listen_host,
            listen_port,
            host_to_connect,
            port_to_connect,
            gateway_ports,
        )
        .map(|(_, ids)| ids)
    }

    /// Listen for connections the peer asked us to forward
    /// (`tcpip-forward`). Returns the effective listen port, which differs
    /// from the request when port zero asked for an ephemeral one.
    pub fn setup_remote_fwd_listener(
        &mut self,
        listen_addr: Option<&str>,
        listen_port: u16,
        gateway_ports: GatewayPorts,
    ) -> Result<(u16, Vec<ChannelId>), Error> {
        self.setup_fwd_listener(
            ChannelType::RportListener,
            listen_addr,
            listen_port,
            "",
            0,
            gateway_ports,
        )
    }

    fn setup_fwd_listener(
        &mut self,
        ty: ChannelType,
        listen_addr: Option<&str>,
        listen_port: u16,
        host_to_connect: &str,
        port_to_connect: u16,
        gateway_ports: GatewayPorts,
    ) -> Result<(u16, Vec<ChannelId>), Error> {
        let is_client = ty == ChannelType::PortListener;
        let path_host = if ty == ChannelType::RportListener {
            listen_addr.unwrap_or("")
        } else {
            host_to_connect
        };
        if path_host.len() >= 1025 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "forward host name too long",
            )
            .into());
        }

        let bind = fwd_bind_addr(listen_addr, is_client, gateway_ports);
        debug!(?ty, ?bind, listen_port, "setting up forward listener");

        let mut allocated_port: Option<u16> = None;
        let mut ids = Vec::new();
        let mut last_err: Option<std::io::Error> = None;

        for mut addr in resolve_bind(&bind, listen_port, self.af_preference())? {
            // An ephemeral -R port is allocated once and shared across
            // address families so IPv4 and IPv6 agree on the number.
            if ty == ChannelType::RportListener && listen_port == 0 {
                if let Some(port) = allocated_port {
                    addr.set_port(port);
                }
            }
            let listener = match TcpListener::bind(addr) {
                Ok(listener) => listener,
                Err(err) => {
                    // Not fatal: one family's address may already be taken
                    // by the other family's wildcard bind.
                    debug!(%addr, %err, "bind failed");
                    last_err = Some(err);
                    continue;
                }
            };
            info!(%addr, "local forwarding listening");
            if ty == ChannelType::RportListener && listen_port == 0 && allocated_port.is_none() {
                allocated_port = listener.local_addr().ok().map(|a| a.port());
                debug!(port = ?allocated_port, "allocated listen port");
            }

            let id = self.new_channel(
                ty,
                "port listener",
                Endpoints::Listener(Listener::Tcp(listener)),
                TCP_WINDOW_DEFAULT,
                TCP_PACKET_DEFAULT,
                ExtendedUsage::Ignore,
                "port listener",
            )?;
            if let Some(c) = self.channel_mut(id) {
                c.path = Some(path_host.to_owned());
                c.host_port = port_to_connect;
                c.listening_addr = match &bind {
                    BindAddr::Addr(host) => Some(host.clone()),
                    _ => None,
                };
                c.listening_port = allocated_port.unwrap_or(listen_port);
            }
            ids.push(id);
        }

        if ids.is_empty() {
            warn!(listen_port, "cannot listen to port");
            return Err(last_err
                .unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no bindable address")
                })
                .into());
        }
        Ok((allocated_port.unwrap_or(listen_port), ids))
    }

    /// Drop remote-forward listeners matching (host, port). Returns whether
    /// anything matched.
    pub fn cancel_rport_listener(&mut self, host: &str, port: u16) -> bool {
        let matching: Vec<ChannelId> = self
            .table()
            .iter()
            .filter(|c| {
                c.ty == ChannelType::RportListener
                    && c.path.as_deref() == Some(host)
                    && c.listening_port == port
            })
            .map(|c| c.id)
            .collect();
        let found = !matching.is_empty();
        for id in matching {
            debug!(channel = %id, "closing cancelled rport listener");
            self.free(id);
        }
        found
    }

    /// Drop local-forward listeners bound to (addr, port). `connect_port`
    /// `None` matches only static forwards, skipping SOCKS listeners.
    pub fn cancel_lport_listener(
        &mut self,
        listen_addr: Option<&str>,
        listen_port: u16,
        connect_port: Option<u16>,
        gateway_ports: GatewayPorts,
    ) -> bool {
        let bind = fwd_bind_addr(listen_addr, true, gateway_ports);
        let want_addr = match &bind {
            BindAddr::Addr(host) => Some(host.as_str()),
            _ => None,
        };
        let matching: Vec<ChannelId> = self
            .table()
            .iter()
            .filter(|c| {
                if c.ty != ChannelType::PortListener || c.listening_port != listen_port {
                    return false;
                }
                match connect_port {
                    // Skip dynamic forwardings.
                    None => {
                        if c.host_port == 0 {
                            return false;
                        }
                    }
                    Some(port) => {
                        if c.host_port != port {
                            return false;
                        }
                    }
                }
                c.listening_addr.as_deref() == want_addr
            })
            .map(|c| c.id)
            .collect();
        let found = !matching.is_empty();
        for id in matching {
            debug!(channel = %id, "closing cancelled lport listener");
            self.free(id);
        }
        found
    }

    /// Ask the peer to listen on `listen_host:listen_port` and record that
    /// connections arriving there may be forwarded to
    /// `host_to_connect:port_to_connect`. Returns a handle usable with
    /// [`ForwardPolicy::update_permitted`] once the real port is known.
    pub fn request_remote_forward(
        &mut self,
        listen_host: Option<&str>,
        listen_port: u16,
        host_to_connect: &str,
        port_to_connect: u16,
    ) -> Result<usize, Error> {
        self.send_global_request(
            true,
            sshmux_proto::GlobalRequestKind::TcpipForward {
                address: rfwd_bind_host(listen_host),
                port: listen_port as u32,
            },
        )?;
        Ok(self
            .policy_mut()
            .record_remote_forward(host_to_connect, port_to_connect, listen_port))
    }

    /// Ask the peer to stop a remote forward and blank its permission
    /// entry. Returns whether a matching forward was known.
    pub fn request_rforward_cancel(
        &mut self,
        listen_host: Option<&str>,
        listen_port: u16,
    ) -> Result<bool, Error> {
        let Some(handle) = self.policy().find_by_listen_port(listen_port) else {
            debug!(listen_port, "requested forward not found");
            return Ok(false);
        };
        self.send_global_request(
            false,
            sshmux_proto::GlobalRequestKind::CancelTcpipForward {
                address: rfwd_bind_host(listen_host),
                port: listen_port as u32,
            },
        )?;
        self.policy_mut().blank(handle);
        Ok(true)
    }

    /// Listen on a unix socket for authentication-agent clients.
    pub fn setup_agent_listener(&mut self, path: &Path) -> Result<ChannelId, Error> {
        let listener = UnixListener::bind(path)?;
        self.new_channel(
            ChannelType::AgentListener,
            "auth socket",
            Endpoints::Listener(Listener::Unix(listener)),
            TCP_WINDOW_DEFAULT,
            TCP_PACKET_DEFAULT,
            ExtendedUsage::Ignore,
            "auth socket",
        )
    }

    /// Listen on a unix socket for control-multiplexer clients. The read
    /// callback is shared with every accepted client channel.
    pub fn setup_mux_listener(&mut self, path: &Path, callback: MuxCallback) -> Result<ChannelId, Error> {
        let listener = UnixListener::bind(path)?;
        let id = self.new_channel(
            ChannelType::MuxListener,
            "mux listener",
            Endpoints::Listener(Listener::Unix(listener)),
            TCP_WINDOW_DEFAULT,
            crate::channel::MUX_PACKET_MAX as u32,
            ExtendedUsage::Ignore,
            "mux listener",
        )?;
        if let Some(c) = self.channel_mut(id) {
            c.callbacks.mux_read = Some(callback);
        }
        Ok(id)
    }

    /// Create the fake X11 display listener, scanning display numbers from
    /// `display_offset` for a free set of ports. Returns the display number
    /// and the listener channels (one per bound address family).
    pub fn setup_x11_listener(
        &mut self,
        display_offset: u32,
        localhost_only: bool,
        single_connection: bool,
    ) -> Result<(u32, Vec<ChannelId>), Error> {
        let bind = if localhost_only {
            BindAddr::Loopback
        } else {
            BindAddr::Wildcard
        };
        for display in display_offset..MAX_DISPLAYS {
            let port = X11_BASE_PORT + display as u16;
            let mut listeners = Vec::new();
            let mut failed = false;
            for addr in resolve_bind(&bind, port, self.af_preference())? {
                match TcpListener::bind(addr) {
                    Ok(listener) => listeners.push(listener),
                    Err(err) => {
                        debug!(%addr, %err, "x11 display port busy");
                        failed = true;
                        break;
                    }
                }
                if listeners.len() == MAX_DISPLAY_SOCKS {
                    break;
                }
            }
            if failed || listeners.is_empty() {
                continue;
            }
            let mut ids = Vec::new();
            for listener in listeners {
                let id = self.new_channel(
                    ChannelType::X11Listener,
                    "x11 listener",
                    Endpoints::Listener(Listener::Tcp(listener)),
                    X11_WINDOW_DEFAULT,
                    X11_PACKET_DEFAULT,
                    ExtendedUsage::Ignore,
                    "X11 inet listener",
                )?;
                if let Some(c) = self.channel_mut(id) {
                    c.single_connection = single_connection;
                }
                ids.push(id);
            }
            return Ok((display, ids));
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "failed to allocate an X11 display socket",
        )
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_deny_until_permitted() {
        let policy = ForwardPolicy::new();
        assert!(!policy.connect_allowed("example.com", 80));
    }

    #[test]
    fn user_list_matches_host_and_port() {
        let mut policy = ForwardPolicy::new();
        policy.add_permitted("example.com", 80);
        assert!(policy.connect_allowed("example.com", 80));
        assert!(!policy.connect_allowed("example.com", 81));
        assert!(!policy.connect_allowed("other.example", 80));
    }

    #[test]
    fn wildcard_port_matches_any_port() {
        let mut policy = ForwardPolicy::new();
        policy.add_permitted("example.com", ANY_PORT);
        assert!(policy.connect_allowed("example.com", 1));
        assert!(policy.connect_allowed("example.com", 65535));
    }

    #[test]
    fn admin_list_is_a_second_gate() {
        let mut policy = ForwardPolicy::new();
        policy.permit_all();
        assert!(policy.connect_allowed("example.com", 80));
        policy.add_adm_permitted("example.com", 80);
        assert!(policy.connect_allowed("example.com", 80));
        assert!(!policy.connect_allowed("example.com", 81));
    }

    #[test]
    fn adm_deny_all_blocks_everything() {
        let mut policy = ForwardPolicy::new();
        policy.permit_all();
        policy.disable_adm_local_opens();
        assert!(!policy.connect_allowed("example.com", 80));
        assert_eq!(policy.adm_listing(), "permitopen none");
    }

    #[test]
    fn blanked_entries_keep_indices() {
        let mut policy = ForwardPolicy::new();
        let a = policy.record_remote_forward("a.example", 1000, 8080);
        let b = policy.record_remote_forward("b.example", 2000, 9090);
        policy.blank(a);
        assert!(policy.find_by_listen_port(8080).is_none());
        assert_eq!(policy.find_by_listen_port(9090), Some(b));
        assert_eq!(
            policy.connect_target_for_listen_port(9090),
            Some(("b.example".to_owned(), 2000))
        );
    }

    #[test]
    fn permitopen_port_parsing() {
        assert_eq!(permitopen_port("*"), Some(ANY_PORT));
        assert_eq!(permitopen_port("443"), Some(443));
        assert_eq!(permitopen_port("0"), None);
        assert_eq!(permitopen_port("notaport"), None);
    }

    #[test]
    fn bind_addr_policy() {
        assert_eq!(fwd_bind_addr(None, true, GatewayPorts::No), BindAddr::Loopback);
        assert_eq!(
            fwd_bind_addr(None, true, GatewayPorts::Yes),
            BindAddr::Wildcard
        );
        assert_eq!(
            fwd_bind_addr(Some(""), true, GatewayPorts::No),
            BindAddr::Wildcard
        );
        assert_eq!(
            fwd_bind_addr(Some("10.0.0.1"), true, GatewayPorts::No),
            BindAddr::Addr("10.0.0.1".into())
        );
        // A server without gateway-ports ignores the requested address.
        assert_eq!(
            fwd_bind_addr(Some("10.0.0.1"), false, GatewayPorts::No),
            BindAddr::Loopback
        );
        // gateway-ports "yes" on the server forces a wildcard.
        assert_eq!(
            fwd_bind_addr(Some("10.0.0.1"), false, GatewayPorts::Yes),
            BindAddr::Wildcard
        );
        // "clientspecified" honors the request.
        assert_eq!(
            fwd_bind_addr(Some("10.0.0.1"), false, GatewayPorts::ClientSpecified),
            BindAddr::Addr("10.0.0.1".into())
        );
    }

    #[test]
    fn rfwd_bind_host_defaults() {
        assert_eq!(rfwd_bind_host(None), "localhost");
        assert_eq!(rfwd_bind_host(Some("*")), "");
        assert_eq!(rfwd_bind_host(Some("10.1.1.1")), "10.1.1.1");
    }
}
