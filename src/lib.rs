//! sniroute: an SNI-routing TLS passthrough proxy.
//!
//! Accepts raw TCP connections, peeks at the TLS ClientHello to learn the
//! requested hostname, dials a backend selected by the configured mode,
//! and relays bytes in both directions without terminating TLS.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy;

pub use config::{Config, Mode};
pub use error::{Cause, ConnectionError, ErrorKind, ProxyError};
pub use proxy::{
    BackendDialer, BackendStream, Nat46Dialer, ProxyHeader, Server, TcpDialer, UnixDialer,
};
