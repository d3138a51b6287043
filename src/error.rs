//! Error types and the fixed classification vocabulary used for metrics.
//!
//! Every terminal connection failure carries two attributions: a [`Cause`]
//! (who is responsible: the client, the backend, or unknown) and an
//! [`ErrorKind`] (a closed label set, so metric cardinality stays bounded
//! no matter how varied the underlying system errors are).

use std::fmt;
use std::io;

use thiserror::Error;

/// Failures produced while proxying a single connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The client sent no SNI and no default hostname is configured.
    #[error("no SNI provided and no default hostname configured")]
    NoSni,

    /// The initial bytes were not a parseable TLS ClientHello.
    #[error("invalid TLS ClientHello: {0}")]
    TlsInvalid(String),

    /// The requested backend is not permitted by policy.
    #[error("disallowed backend: {0}")]
    DisallowedBackend(String),

    /// An underlying I/O failure (sniffing, dialing, or relaying).
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Attribution of a connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    /// The problem originates in what the client sent or did.
    Client,
    /// The problem originates in reaching or using the backend.
    Backend,
    /// The cause could not be determined.
    Unknown,
}

impl Cause {
    pub fn as_label(self) -> &'static str {
        match self {
            Cause::Client => "client",
            Cause::Backend => "backend",
            Cause::Unknown => "unknown",
        }
    }
}

/// The closed set of error labels recorded in metrics.
///
/// Classification is attempted in declaration order; anything that does
/// not match a known condition is `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NoSni,
    Eof,
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    NetworkUnreachable,
    NoRouteToHost,
    DisallowedBackend,
    TlsInvalid,
    Unknown,
}

impl ErrorKind {
    /// Map an arbitrary proxy error onto the fixed label set.
    pub fn classify(err: &ProxyError) -> Self {
        match err {
            ProxyError::NoSni => ErrorKind::NoSni,
            ProxyError::Io(e) => match e.kind() {
                io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorKind::Timeout,
                io::ErrorKind::ConnectionReset => ErrorKind::ConnectionReset,
                io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
                io::ErrorKind::NetworkUnreachable => ErrorKind::NetworkUnreachable,
                io::ErrorKind::HostUnreachable => ErrorKind::NoRouteToHost,
                _ => ErrorKind::Unknown,
            },
            ProxyError::DisallowedBackend(_) => ErrorKind::DisallowedBackend,
            ProxyError::TlsInvalid(_) => ErrorKind::TlsInvalid,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            ErrorKind::NoSni => "no-sni",
            ErrorKind::Eof => "eof",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionReset => "connection-reset",
            ErrorKind::ConnectionRefused => "connection-refused",
            ErrorKind::NetworkUnreachable => "network-unreachable",
            ErrorKind::NoRouteToHost => "no-route-to-host",
            ErrorKind::DisallowedBackend => "disallowed-backend",
            ErrorKind::TlsInvalid => "tls-invalid",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A terminal failure for one proxied connection.
///
/// Built once at the point of failure and enriched (never re-wrapped) with
/// the backend hostname as it propagates back to the accept loop, which is
/// the single place that logs and records it.
#[derive(Debug)]
pub struct ConnectionError {
    pub source: ProxyError,
    pub cause: Cause,
    /// Backend hostname, if the failure happened after it was known.
    pub backend: Option<String>,
}

impl ConnectionError {
    pub fn new(source: ProxyError, cause: Cause) -> Self {
        Self {
            source,
            cause,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        ErrorKind::classify(&self.source)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cause {}: ", self.cause.as_label())?;
        if let Some(backend) = &self.backend {
            write!(f, "backend {backend}: ")?;
        }
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Client disappearance during the handshake peek (EOF or deadline) is
/// overwhelmingly caused by scanners; it is counted but not worth a warning.
pub fn is_benign_disconnect(err: &ProxyError) -> bool {
    matches!(
        ErrorKind::classify(err),
        ErrorKind::Eof | ErrorKind::Timeout
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn io_err(kind: io::ErrorKind) -> ProxyError {
        ProxyError::Io(io::Error::new(kind, "test"))
    }

    #[test]
    fn test_classify_sentinels() {
        assert_eq!(ErrorKind::classify(&ProxyError::NoSni), ErrorKind::NoSni);
        assert_eq!(
            ErrorKind::classify(&ProxyError::TlsInvalid("bad record".into())),
            ErrorKind::TlsInvalid
        );
        assert_eq!(
            ErrorKind::classify(&ProxyError::DisallowedBackend("203.0.113.7".into())),
            ErrorKind::DisallowedBackend
        );
    }

    #[test]
    fn test_classify_io_kinds() {
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::UnexpectedEof)),
            ErrorKind::Eof
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::TimedOut)),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::ConnectionReset)),
            ErrorKind::ConnectionReset
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::ConnectionRefused)),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::NetworkUnreachable)),
            ErrorKind::NetworkUnreachable
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::HostUnreachable)),
            ErrorKind::NoRouteToHost
        );
        assert_eq!(
            ErrorKind::classify(&io_err(io::ErrorKind::PermissionDenied)),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_benign_disconnects() {
        assert!(is_benign_disconnect(&io_err(io::ErrorKind::UnexpectedEof)));
        assert!(is_benign_disconnect(&io_err(io::ErrorKind::TimedOut)));
        assert!(!is_benign_disconnect(&ProxyError::NoSni));
        assert!(!is_benign_disconnect(&io_err(
            io::ErrorKind::ConnectionRefused
        )));
    }

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::new(ProxyError::NoSni, Cause::Client);
        assert_eq!(
            err.to_string(),
            "cause client: no SNI provided and no default hostname configured"
        );

        let err = ConnectionError::new(io_err(io::ErrorKind::ConnectionRefused), Cause::Backend)
            .with_backend("app.internal");
        assert!(err.to_string().starts_with("cause backend: backend app.internal:"));
        assert_eq!(err.kind(), ErrorKind::ConnectionRefused);
    }
}
