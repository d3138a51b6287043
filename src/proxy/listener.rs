//! Accept loop, per-connection dispatch, and the connection handler.
//!
//! Each listener runs one accept loop; every accepted connection is
//! handled in its own task. The handler walks a connection through
//! sniff -> validate -> dial -> relay and converts any failure into a
//! classified, backend-attributed error. The accept loop is the single
//! place errors are logged to metrics.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{info, info_span, warn, Instrument};

use super::dialer::BackendDialer;
use super::proxy_protocol::ProxyHeader;
use super::relay::relay;
use super::sni::sniff_client_hello;
use super::stream::{CountingStream, PeekedStream};
use crate::error::{is_benign_disconnect, Cause, ConnectionError, ProxyError};
use crate::metrics;

/// The SNI router: accepts connections and relays them to backends picked
/// by the configured dialer. Shared read-only across all listeners.
pub struct Server {
    dialer: Arc<dyn BackendDialer>,
    proxy_protocol: bool,
    default_hostname: Option<String>,
}

impl Server {
    pub fn new(
        dialer: Arc<dyn BackendDialer>,
        proxy_protocol: bool,
        default_hostname: Option<String>,
    ) -> Self {
        Self {
            dialer,
            proxy_protocol,
            default_hostname,
        }
    }

    /// Accept connections until `shutdown` fires or a non-transient accept
    /// error occurs.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> io::Result<()> {
        let listen_label = listener.local_addr()?.to_string();
        info!(listener = %listen_label, "listener started");

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.recv() => {
                    info!(listener = %listen_label, "listener stopping");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!(listener = %listen_label, error = %e, "transient error accepting connection");
                        metrics::CONNECTION_ERRORS
                            .with_label_values(&[&listen_label, "", "", "transient"])
                            .inc();
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            let server = Arc::clone(&self);
            let listen_label = listen_label.clone();
            tokio::spawn(
                async move {
                    metrics::CONNECTIONS_TOTAL
                        .with_label_values(&[&listen_label])
                        .inc();
                    let inflight = metrics::CONNECTIONS_INFLIGHT.with_label_values(&[&listen_label]);
                    inflight.inc();

                    if let Err(err) = server
                        .handle_connection(stream, peer_addr, &listen_label)
                        .await
                    {
                        metrics::CONNECTION_ERRORS
                            .with_label_values(&[
                                &listen_label,
                                err.backend.as_deref().unwrap_or(""),
                                err.cause.as_label(),
                                err.kind().as_label(),
                            ])
                            .inc();
                    }

                    inflight.dec();
                }
                .instrument(info_span!("connection", peer = %peer_addr)),
            );
        }
    }

    /// Drive one connection from accept to close.
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        listen_label: &str,
    ) -> Result<(), ConnectionError> {
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                abort_reset(&stream);
                return Err(ConnectionError::new(e.into(), Cause::Unknown));
            }
        };

        let hello = match sniff_client_hello(&mut stream).await {
            Ok(hello) => hello,
            Err(e) => {
                // EOF/timeout here is almost always a scanner that opened
                // and immediately closed; don't warn about those.
                if !is_benign_disconnect(&e) {
                    warn!(peer = %peer_addr, error = %e, "reading ClientHello failed");
                }
                abort_reset(&stream);
                return Err(ConnectionError::new(e, Cause::Client));
            }
        };

        let backend_name = if hello.server_name.is_empty() {
            match &self.default_hostname {
                Some(name) => name.clone(),
                None => {
                    abort_reset(&stream);
                    return Err(ConnectionError::new(ProxyError::NoSni, Cause::Client));
                }
            }
        } else {
            hello.server_name.clone()
        };

        if backend_name.parse::<IpAddr>().is_ok() {
            warn!(peer = %peer_addr, backend = %backend_name, "rejecting connection: SNI is an IP address");
            abort_reset(&stream);
            return Err(
                ConnectionError::new(ProxyError::DisallowedBackend(backend_name.clone()), Cause::Client)
                    .with_backend(backend_name),
            );
        }

        // Count the attempt now so failed dials still show up per backend.
        metrics::BACKEND_CONNECTIONS
            .with_label_values(&[listen_label, &backend_name])
            .inc();

        let dial_start = Instant::now();
        let mut backend = match self
            .dialer
            .dial(&backend_name, &hello.alpn, peer_addr, local_addr)
            .await
        {
            Ok(backend) => backend,
            Err(e) => {
                warn!(peer = %peer_addr, backend = %backend_name, error = %e, "dialing backend failed");
                // A disallowed target is the client's doing; the backend
                // infrastructure never ran.
                let cause = if matches!(e, ProxyError::DisallowedBackend(_)) {
                    Cause::Client
                } else {
                    Cause::Backend
                };
                abort_reset(&stream);
                return Err(ConnectionError::new(e, cause).with_backend(backend_name));
            }
        };
        metrics::BACKEND_DIAL_TIME
            .with_label_values(&[listen_label, &backend_name])
            .observe(dial_start.elapsed().as_secs_f64());

        if self.proxy_protocol {
            let header = ProxyHeader::new(peer_addr, local_addr).encode();
            if let Err(e) = backend.write_all(&header).await {
                warn!(peer = %peer_addr, backend = %backend_name, error = %e, "writing PROXY header to backend failed");
                abort_reset(&stream);
                return Err(
                    ConnectionError::new(e.into(), Cause::Unknown).with_backend(backend_name),
                );
            }
        }

        let client = CountingStream::new(
            PeekedStream::new(stream, hello.buffered),
            metrics::BACKEND_READ_BYTES.with_label_values(&[listen_label, &backend_name]),
            metrics::BACKEND_WRITE_BYTES.with_label_values(&[listen_label, &backend_name]),
        );

        let (client, result) = relay(client, backend).await;
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                abort_reset(client.get_ref().get_ref());
                Err(ConnectionError::new(e.into(), Cause::Unknown).with_backend(backend_name))
            }
        }
    }
}

/// Arrange for the close that follows to send a RST instead of a FIN, so
/// failed connections are distinguishable from clean ones at the client.
fn abort_reset(stream: &TcpStream) {
    let _ = stream.set_linger(Some(Duration::ZERO));
}

/// Accept errors worth retrying; anything else ends the accept loop.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
