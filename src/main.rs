//! sniroute
//!
//! Routes TLS connections to backends based on the SNI hostname in the
//! ClientHello, without terminating TLS.
//!
//! This binary:
//! - Parses and validates flags into a [`Config`]
//! - Builds the backend dialer for the selected mode
//! - Optionally installs a local route for the NAT46 prefix
//! - Binds the listeners and runs one accept loop per listener
//! - Exits cleanly on SIGINT/SIGTERM without cancelling in-flight relays

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use ipnet::IpNet;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sniroute::config::{Config, Mode};
use sniroute::metrics;
use sniroute::proxy::Server;

#[derive(Debug, Parser)]
#[command(name = "sniroute", version, about = "SNI-routing TLS passthrough proxy")]
struct Cli {
    /// Address to listen on (repeatable)
    #[arg(long = "listen", value_name = "ADDR")]
    listen: Vec<String>,

    /// Backend selection mode
    #[arg(long, value_enum)]
    mode: Mode,

    /// Default hostname if the client does not provide SNI
    #[arg(long)]
    default_hostname: Option<String>,

    /// Use the PROXY protocol when talking to the backend (unix, tcp modes)
    #[arg(long = "proxy-proto")]
    proxy_proto: bool,

    /// Path to the directory containing backend UNIX sockets (unix mode)
    #[arg(long, value_name = "DIR")]
    unix_directory: Option<PathBuf>,

    /// CIDR of allowed backends (repeatable) (tcp, nat46 modes)
    #[arg(long = "backend-cidr", value_name = "CIDR")]
    backend_cidr: Vec<IpNet>,

    /// Port number of the backend (defaults to the listener port) (tcp mode)
    #[arg(long)]
    backend_port: Option<u16>,

    /// IPv6 prefix for the NAT46 source address (nat46 mode)
    #[arg(long)]
    nat46_prefix: Option<Ipv6Addr>,

    /// Insert a route for the NAT46 prefix into the local routing table
    #[arg(long)]
    add_local_route: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config {
        listen: cli.listen,
        mode: cli.mode,
        default_hostname: cli.default_hostname,
        proxy_protocol: cli.proxy_proto,
        unix_directory: cli.unix_directory,
        backend_cidrs: cli.backend_cidr,
        backend_port: cli.backend_port,
        nat46_prefix: cli.nat46_prefix,
        add_local_route: cli.add_local_route,
    };
    config.validate()?;

    metrics::register();

    let dialer = config.build_dialer()?;

    let local_route = if config.mode == Mode::Nat46 && config.add_local_route {
        let prefix = config
            .nat46_prefix
            .context("--nat46-prefix must be specified in nat46 mode")?;
        Some(LocalRoute::install(prefix)?)
    } else {
        None
    };

    let mut listeners = Vec::new();
    for addr in &config.listen {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
        listeners.push(listener);
    }

    let server = Arc::new(Server::new(
        dialer,
        config.proxy_protocol,
        config.default_hostname.clone(),
    ));

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut accept_loops = Vec::new();
    for listener in listeners {
        let server = Arc::clone(&server);
        let shutdown = shutdown_tx.subscribe();
        accept_loops.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, shutdown).await {
                error!(error = %e, "listener failed");
            }
        }));
    }

    wait_for_signal().await?;
    info!("termination signal received, shutting down");
    let _ = shutdown_tx.send(());
    for accept_loop in accept_loops {
        let _ = accept_loop.await;
    }

    drop(local_route);
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for SIGINT")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

/// A local-table route for the NAT46 prefix, held for the process
/// lifetime and removed on drop.
struct LocalRoute {
    destination: String,
}

impl LocalRoute {
    fn install(prefix: Ipv6Addr) -> Result<Self> {
        let destination = format!("{prefix}/96");
        match run_ip(&["-6", "route", "add", "local", &destination, "dev", "lo"]) {
            Ok(()) => {}
            // A leftover route from a previous run is fine.
            Err(e) if e.to_string().contains("File exists") => {
                warn!(route = %destination, "local route already present");
            }
            Err(e) => return Err(e.context("failed to add local route for NAT46 prefix")),
        }
        info!(route = %destination, "installed local route for NAT46 prefix");
        Ok(Self { destination })
    }
}

impl Drop for LocalRoute {
    fn drop(&mut self) {
        if let Err(e) = run_ip(&["-6", "route", "del", "local", &self.destination, "dev", "lo"]) {
            warn!(route = %self.destination, error = %e, "failed to remove local route");
        }
    }
}

/// Run an `ip` command and surface stderr on failure.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}
