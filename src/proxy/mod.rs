//! SNI-routed TLS passthrough proxying.
//!
//! This module provides:
//! - ClientHello sniffing without consuming the handshake
//! - Backend selection (unix socket, TCP with allow-list, NAT46)
//! - PROXY protocol v2 header injection
//! - Bidirectional relaying with byte accounting
//! - The accept/dispatch loop
//!
//! ```text
//! Client -> Server -> ClientHello sniff -> Dialer -> Relay -> Backend
//!                                             |
//!                                 PROXY v2 header (if enabled)
//! ```

mod dialer;
mod listener;
mod proxy_protocol;
mod relay;
mod sni;
mod stream;

pub use dialer::{BackendDialer, Nat46Dialer, TcpDialer, UnixDialer};
pub use listener::Server;
pub use proxy_protocol::{parse_proxy_header, ProxyHeader};
pub use relay::relay;
pub use sni::{sniff_client_hello, SniffedHello, SNIFF_TIMEOUT};
pub use stream::{BackendStream, CountingStream, PeekedStream};
