//! Port liveness probing.
//!
//! [`PortProber`] answers "is host_ip:port accepting TCP connections?". The
//! collision detector only talks to this trait, so tests substitute
//! [`StaticProber`] for [`SystemProber`].

use super::conflict::{find_processes_on_port, ProcessInfo};
use super::rule::HostIp;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream};
#[cfg(not(unix))]
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

/// Connect timeout for a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

pub trait PortProber: Send + Sync {
    /// Whether `host_ip:port` is already accepting connections.
    fn is_open(&self, host_ip: HostIp, port: u16) -> Result<bool>;

    /// Processes known to hold `port`, for diagnostics. Defaults to none.
    fn holders(&self, _port: u16) -> Vec<ProcessInfo> {
        Vec::new()
    }
}

/// How the wildcard address is probed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStrategy {
    /// Connect to the address directly (`0.0.0.0` for the wildcard).
    Direct,
    /// Probe every local IPv4 interface for the wildcard; the port is in use
    /// only if it is open on all of them.
    PerInterface,
}

impl Default for ProbeStrategy {
    fn default() -> Self {
        if cfg!(windows) {
            ProbeStrategy::PerInterface
        } else {
            ProbeStrategy::Direct
        }
    }
}

/// Source of local interface addresses (IPv4 and IPv6).
pub type InterfaceLister = Box<dyn Fn() -> Result<Vec<IpAddr>> + Send + Sync>;

/// Probes the real host network stack.
pub struct SystemProber {
    strategy: ProbeStrategy,
    timeout: Duration,
    interfaces: InterfaceLister,
}

impl SystemProber {
    pub fn new() -> Self {
        Self {
            strategy: ProbeStrategy::default(),
            timeout: PROBE_TIMEOUT,
            interfaces: Box::new(local_addrs),
        }
    }

    pub fn with_strategy(mut self, strategy: ProbeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace interface enumeration (tests, restricted environments).
    pub fn with_interfaces(mut self, lister: InterfaceLister) -> Self {
        self.interfaces = lister;
        self
    }

    fn connect_open(&self, ip: IpAddr, port: u16) -> Result<bool> {
        let addr = SocketAddr::new(ip, port);
        match TcpStream::connect_timeout(&addr, self.timeout) {
            Ok(_) => Ok(true),
            Err(e) if is_closed_error(&e) => Ok(false),
            Err(e) => Err(Error::Probe(format!("{}: {}", addr, e))),
        }
    }

    fn probe_all_interfaces(&self, port: u16) -> Result<bool> {
        tracing::debug!("Testing port {} on all IPv4 interfaces...", port);
        let interfaces = (self.interfaces)()?;

        let mut available = Vec::new();
        for addr in interfaces.into_iter().filter(IpAddr::is_ipv4) {
            if !self.connect_open(addr, port)? {
                available.push(addr);
            }
        }

        if available.is_empty() {
            tracing::debug!("Cannot forward port {} on any interface", port);
            Ok(true)
        } else {
            tracing::debug!(
                "Port {} will forward to the guest on interfaces: {:?}",
                port,
                available
            );
            Ok(false)
        }
    }

    /// Whether `ip` is unspecified, loopback or assigned to a local interface.
    fn is_local(&self, ip: IpAddr) -> Result<bool> {
        if ip.is_unspecified() || ip.is_loopback() {
            return Ok(true);
        }
        Ok((self.interfaces)()?.contains(&ip))
    }
}

impl Default for SystemProber {
    fn default() -> Self {
        Self::new()
    }
}

impl PortProber for SystemProber {
    fn is_open(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        if host_ip.is_wildcard() && self.strategy == ProbeStrategy::PerInterface {
            return self.probe_all_interfaces(port);
        }

        let ip = host_ip.probe_addr();
        if !self.is_local(ip)? {
            tracing::warn!(
                "Forwarded port host_ip {} is not assigned to any local interface (port {})",
                ip,
                port
            );
        }

        self.connect_open(ip, port)
    }

    fn holders(&self, port: u16) -> Vec<ProcessInfo> {
        find_processes_on_port(port)
    }
}

/// Errors meaning "nothing is listening there".
fn is_closed_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::PermissionDenied
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::ConnectionReset
    ) {
        return true;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        if let Some(code) = e.raw_os_error() {
            return matches!(
                Errno::from_raw(code),
                Errno::EHOSTUNREACH | Errno::ENETUNREACH | Errno::EADDRNOTAVAIL | Errno::EACCES
            );
        }
    }

    false
}

/// Enumerate IPv4 and IPv6 addresses of local interfaces.
#[cfg(unix)]
pub fn local_addrs() -> Result<Vec<IpAddr>> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| Error::Probe(format!("Failed to enumerate interfaces: {}", e)))?;

    let mut out = Vec::new();
    for ifaddr in addrs {
        let Some(addr) = ifaddr.address.as_ref() else {
            continue;
        };
        let ip = if let Some(sin) = addr.as_sockaddr_in() {
            IpAddr::V4(sin.ip())
        } else if let Some(sin6) = addr.as_sockaddr_in6() {
            IpAddr::V6(sin6.ip())
        } else {
            continue;
        };
        if !out.contains(&ip) {
            out.push(ip);
        }
    }
    Ok(out)
}

/// Enumerate IPv4 and IPv6 addresses of local interfaces.
#[cfg(not(unix))]
pub fn local_addrs() -> Result<Vec<IpAddr>> {
    tracing::debug!("Interface enumeration unavailable on this platform, using loopback only");
    Ok(vec![
        IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(Ipv6Addr::LOCALHOST),
    ])
}

/// Deterministic prober: a fixed set of open (host_ip, port) pairs.
///
/// A wildcard entry marks the port open for every address. Every probe is
/// recorded so tests can assert which ports were (or were not) touched.
#[derive(Default)]
pub struct StaticProber {
    open: HashSet<(HostIp, u16)>,
    failing: HashSet<u16>,
    probes: Mutex<Vec<(HostIp, u16)>>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `port` open on every address.
    pub fn open(mut self, port: u16) -> Self {
        self.open.insert((HostIp::Wildcard, port));
        self
    }

    /// Mark `port` open on one address only.
    pub fn open_on(mut self, host_ip: HostIp, port: u16) -> Self {
        self.open.insert((host_ip, port));
        self
    }

    /// Make probes of `port` fail with an error.
    pub fn failing(mut self, port: u16) -> Self {
        self.failing.insert(port);
        self
    }

    /// Every probe seen so far, in order.
    pub fn probes(&self) -> Vec<(HostIp, u16)> {
        self.probes.lock().clone()
    }

    pub fn probed_port(&self, port: u16) -> bool {
        self.probes.lock().iter().any(|(_, p)| *p == port)
    }
}

impl PortProber for StaticProber {
    fn is_open(&self, host_ip: HostIp, port: u16) -> Result<bool> {
        self.probes.lock().push((host_ip, port));
        if self.failing.contains(&port) {
            return Err(Error::Probe(format!("probe of port {} failed", port)));
        }
        Ok(self.open.contains(&(HostIp::Wildcard, port)) || self.open.contains(&(host_ip, port)))
    }
}
