//! Backend selection and dialing.
//!
//! One dialer is built from configuration at startup and shared read-only
//! across every connection. All three strategies share the same contract:
//! a hostname that is an IP-address literal is rejected before any socket
//! is opened, and a returned stream is live and ready for relaying.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::IpNet;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpStream, UnixStream};
use tracing::debug;

use super::stream::BackendStream;
use crate::error::ProxyError;

/// Turns a validated hostname into a live backend connection.
///
/// `client_remote` and `client_local` are the addresses of the accepted
/// connection; they supply the default backend port and, for NAT46, the
/// client address to embed in the outbound source address.
#[async_trait]
pub trait BackendDialer: Send + Sync {
    async fn dial(
        &self,
        hostname: &str,
        alpn: &[String],
        client_remote: SocketAddr,
        client_local: SocketAddr,
    ) -> Result<BackendStream, ProxyError>;
}

/// Reject hostnames that are IP-address literals. Backends are selected by
/// name only; a literal means the client is trying to pick addresses
/// directly.
fn ensure_not_ip_literal(hostname: &str) -> Result<(), ProxyError> {
    if hostname.parse::<IpAddr>().is_ok() {
        return Err(ProxyError::DisallowedBackend(hostname.to_string()));
    }
    Ok(())
}

/// Pick the first resolved address that the allow-list permits.
fn select_allowed(
    mut candidates: impl Iterator<Item = SocketAddr>,
    allowed: &[IpNet],
) -> Option<SocketAddr> {
    candidates.find(|addr| allowed.iter().any(|net| net.contains(&addr.ip())))
}

/// Connects to UNIX sockets named after the hostname in one directory.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    pub directory: PathBuf,
}

impl UnixDialer {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl BackendDialer for UnixDialer {
    async fn dial(
        &self,
        hostname: &str,
        _alpn: &[String],
        _client_remote: SocketAddr,
        _client_local: SocketAddr,
    ) -> Result<BackendStream, ProxyError> {
        ensure_not_ip_literal(hostname)?;
        // The hostname becomes a single path component; anything that
        // could traverse out of the socket directory is rejected.
        if hostname.is_empty()
            || hostname == "."
            || hostname == ".."
            || hostname.contains(['/', '\\', '\0'])
        {
            return Err(ProxyError::DisallowedBackend(hostname.to_string()));
        }

        let path = self.directory.join(hostname);
        debug!(path = %path.display(), "connecting to backend socket");
        let stream = UnixStream::connect(&path).await?;
        Ok(BackendStream::Unix(stream))
    }
}

/// Resolves the hostname and connects over TCP, restricted to an
/// allow-list of address ranges.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    /// Fixed backend port; when unset the backend is dialed on the same
    /// port the client connected to.
    pub port: Option<u16>,
    /// Address ranges a resolved backend address must fall within.
    pub allowed: Vec<IpNet>,
}

impl TcpDialer {
    pub fn new(port: Option<u16>, allowed: Vec<IpNet>) -> Self {
        Self { port, allowed }
    }
}

#[async_trait]
impl BackendDialer for TcpDialer {
    async fn dial(
        &self,
        hostname: &str,
        _alpn: &[String],
        _client_remote: SocketAddr,
        client_local: SocketAddr,
    ) -> Result<BackendStream, ProxyError> {
        ensure_not_ip_literal(hostname)?;

        let port = self.port.unwrap_or_else(|| client_local.port());
        let candidates = lookup_host((hostname, port)).await?;
        let addr = select_allowed(candidates, &self.allowed)
            .ok_or_else(|| ProxyError::DisallowedBackend(hostname.to_string()))?;

        debug!(backend = %addr, "connecting to backend");
        let stream = TcpStream::connect(addr).await?;
        Ok(BackendStream::Tcp(stream))
    }
}

/// TCP dialer that presents a synthesized, per-client IPv6 source address.
///
/// The outbound socket is bound to `source_prefix` with the client's IPv4
/// address in the low 32 bits, so an IPv6 backend can recover the real
/// client address without a proxy header. A local route for the prefix
/// must exist for the bind to be accepted; installing it is the caller's
/// concern.
#[derive(Debug, Clone)]
pub struct Nat46Dialer {
    pub allowed: Vec<IpNet>,
    pub source_prefix: Ipv6Addr,
}

impl Nat46Dialer {
    pub fn new(allowed: Vec<IpNet>, source_prefix: Ipv6Addr) -> Self {
        Self {
            allowed,
            source_prefix,
        }
    }

    /// The source address used for a client at `client`: the high 96 bits
    /// of the prefix with the client address embedded below.
    pub fn source_address(&self, client: Ipv4Addr) -> Ipv6Addr {
        let mut octets = self.source_prefix.octets();
        octets[12..].copy_from_slice(&client.octets());
        Ipv6Addr::from(octets)
    }

    fn client_ipv4(remote: SocketAddr) -> Result<Ipv4Addr, ProxyError> {
        match remote.ip() {
            IpAddr::V4(v4) => Ok(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().ok_or_else(|| {
                ProxyError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "client address is not IPv4 and cannot be embedded",
                ))
            }),
        }
    }
}

#[async_trait]
impl BackendDialer for Nat46Dialer {
    async fn dial(
        &self,
        hostname: &str,
        _alpn: &[String],
        client_remote: SocketAddr,
        client_local: SocketAddr,
    ) -> Result<BackendStream, ProxyError> {
        ensure_not_ip_literal(hostname)?;

        let client = Self::client_ipv4(client_remote)?;
        let candidates = lookup_host((hostname, client_local.port())).await?;
        let addr = select_allowed(
            candidates.filter(|addr| addr.is_ipv6()),
            &self.allowed,
        )
        .ok_or_else(|| ProxyError::DisallowedBackend(hostname.to_string()))?;

        let source = SocketAddr::from((self.source_address(client), 0));
        debug!(backend = %addr, source = %source, "connecting to backend");
        let stream = connect_from(source, addr).await?;
        Ok(BackendStream::Tcp(stream))
    }
}

/// Connect to `dest` from a specific local address.
///
/// The socket is put into non-blocking mode before the connect so the
/// in-progress handshake can be awaited through tokio; the connect result
/// is read back with `SO_ERROR` once the socket signals writability.
async fn connect_from(source: SocketAddr, dest: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    // Allow binding the synthesized address even when it is not assigned
    // to an interface.
    #[cfg(target_os = "linux")]
    socket.set_freebind(true)?;
    socket.bind(&source.into())?;
    socket.set_nonblocking(true)?;

    match socket.connect(&dest.into()) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(e),
    }

    let stream = TcpStream::from_std(socket.into())?;
    stream.writable().await?;
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    Ok(stream)
}
