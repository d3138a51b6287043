//! Prometheus collectors for the proxy.
//!
//! All collectors live in a crate-owned [`Registry`] so an embedding
//! process can gather and expose them however it likes; nothing in this
//! crate serves a scrape endpoint.
//!
//! Label conventions:
//! - `listener`: the local address of the accepting socket
//! - `backend`: the hostname selected from SNI (empty if never learned)
//! - `cause`, `error`: the fixed vocabularies from [`crate::error`]

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Registry holding every collector below.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Total connections accepted, per listener.
    pub static ref CONNECTIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("sniroute_connections_total", "Total number of connections"),
        &["listener"]
    )
    .unwrap();

    /// Connections currently being handled, per listener.
    pub static ref CONNECTIONS_INFLIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new(
            "sniroute_connections_inflight",
            "Number of connections inflight now"
        ),
        &["listener"]
    )
    .unwrap();

    /// Terminal connection failures, labelled by classification.
    pub static ref CONNECTION_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "sniroute_connection_errors_total",
            "Total number of connection errors"
        ),
        &["listener", "backend", "cause", "error"]
    )
    .unwrap();

    /// Backend connect attempts (counted before dialing, after the
    /// hostname has been validated).
    pub static ref BACKEND_CONNECTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "sniroute_backend_connections_total",
            "Total number of backend connections"
        ),
        &["listener", "backend"]
    )
    .unwrap();

    /// Time taken to resolve and dial the backend (successful dials only).
    pub static ref BACKEND_DIAL_TIME: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "sniroute_backend_dial_time_seconds",
            "Time taken to resolve and dial the connection to the backend"
        ),
        &["listener", "backend"]
    )
    .unwrap();

    /// Bytes read from clients and written to the backend.
    pub static ref BACKEND_READ_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "sniroute_backend_read_bytes_total",
            "Total number of bytes read from clients and written to the backend"
        ),
        &["listener", "backend"]
    )
    .unwrap();

    /// Bytes read from the backend and written to clients.
    pub static ref BACKEND_WRITE_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "sniroute_backend_write_bytes_total",
            "Total number of bytes read from the backend and written to clients"
        ),
        &["listener", "backend"]
    )
    .unwrap();
}

/// Register every collector with [`struct@REGISTRY`]. Call once at startup.
pub fn register() {
    REGISTRY
        .register(Box::new(CONNECTIONS_TOTAL.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(CONNECTIONS_INFLIGHT.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(CONNECTION_ERRORS.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(BACKEND_CONNECTIONS.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(BACKEND_DIAL_TIME.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(BACKEND_READ_BYTES.clone()))
        .expect("collector can be registered");
    REGISTRY
        .register(Box::new(BACKEND_WRITE_BYTES.clone()))
        .expect("collector can be registered");
}
