//! Runtime configuration and startup validation.
//!
//! The CLI layer fills in a [`Config`]; [`Config::validate`] enforces the
//! per-mode requirements before any listener is opened.

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::ValueEnum;
use ipnet::IpNet;

use crate::proxy::{BackendDialer, Nat46Dialer, TcpDialer, UnixDialer};

/// Backend selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Connect to UNIX sockets named after the hostname.
    Unix,
    /// Resolve the hostname and connect over TCP.
    Tcp,
    /// TCP with a synthesized per-client IPv6 source address.
    Nat46,
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Addresses to listen on.
    pub listen: Vec<String>,
    pub mode: Mode,
    /// Hostname to assume when the client sends no SNI.
    pub default_hostname: Option<String>,
    /// Send a PROXY protocol header to the backend.
    pub proxy_protocol: bool,
    /// Directory containing backend UNIX sockets (unix mode).
    pub unix_directory: Option<PathBuf>,
    /// Allowed backend address ranges (tcp, nat46 modes).
    pub backend_cidrs: Vec<IpNet>,
    /// Fixed backend port (tcp mode).
    pub backend_port: Option<u16>,
    /// IPv6 prefix for the NAT46 source address (nat46 mode).
    pub nat46_prefix: Option<Ipv6Addr>,
    /// Install a local route for the NAT46 prefix at startup.
    pub add_local_route: bool,
}

impl Config {
    /// Check the per-mode flag requirements.
    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            bail!("at least one --listen address must be specified");
        }
        match self.mode {
            Mode::Unix => {
                if self.unix_directory.is_none() {
                    bail!("--unix-directory must be specified in unix mode");
                }
            }
            Mode::Tcp => {
                if self.backend_cidrs.is_empty() {
                    bail!("at least one --backend-cidr must be specified in tcp mode");
                }
            }
            Mode::Nat46 => {
                if self.proxy_protocol {
                    bail!("--proxy-proto must not be specified in nat46 mode");
                }
                if self.backend_port.is_some() {
                    bail!("--backend-port must not be specified in nat46 mode");
                }
                if self.backend_cidrs.is_empty() {
                    bail!("at least one --backend-cidr must be specified in nat46 mode");
                }
                if self.nat46_prefix.is_none() {
                    bail!("--nat46-prefix must be specified in nat46 mode");
                }
            }
        }
        Ok(())
    }

    /// Build the dialer selected by `mode`. Assumes [`Config::validate`]
    /// passed.
    pub fn build_dialer(&self) -> Result<Arc<dyn BackendDialer>> {
        Ok(match self.mode {
            Mode::Unix => {
                let Some(directory) = &self.unix_directory else {
                    bail!("--unix-directory must be specified in unix mode");
                };
                Arc::new(UnixDialer::new(directory.clone()))
            }
            Mode::Tcp => Arc::new(TcpDialer::new(
                self.backend_port,
                self.backend_cidrs.clone(),
            )),
            Mode::Nat46 => {
                let Some(prefix) = self.nat46_prefix else {
                    bail!("--nat46-prefix must be specified in nat46 mode");
                };
                Arc::new(Nat46Dialer::new(self.backend_cidrs.clone(), prefix))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(mode: Mode) -> Config {
        Config {
            listen: vec!["[::]:443".to_string()],
            mode,
            default_hostname: None,
            proxy_protocol: false,
            unix_directory: None,
            backend_cidrs: Vec::new(),
            backend_port: None,
            nat46_prefix: None,
            add_local_route: false,
        }
    }

    #[test]
    fn test_listen_required() {
        let mut config = base_config(Mode::Tcp);
        config.backend_cidrs = vec!["10.0.0.0/8".parse().unwrap()];
        config.listen.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unix_mode_requires_directory() {
        let mut config = base_config(Mode::Unix);
        assert!(config.validate().is_err());
        config.unix_directory = Some("/run/backends".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tcp_mode_requires_cidr() {
        let mut config = base_config(Mode::Tcp);
        assert!(config.validate().is_err());
        config.backend_cidrs = vec!["10.0.0.0/8".parse().unwrap()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nat46_mode_requirements() {
        let mut config = base_config(Mode::Nat46);
        config.backend_cidrs = vec!["fd00::/64".parse().unwrap()];
        assert!(config.validate().is_err());

        config.nat46_prefix = Some("64:ff9b:1::".parse().unwrap());
        assert!(config.validate().is_ok());

        config.proxy_protocol = true;
        assert!(config.validate().is_err());
        config.proxy_protocol = false;

        config.backend_port = Some(443);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_dialer_matches_mode() {
        let mut config = base_config(Mode::Unix);
        config.unix_directory = Some("/run/backends".into());
        assert!(config.build_dialer().is_ok());

        let mut config = base_config(Mode::Nat46);
        config.backend_cidrs = vec!["fd00::/64".parse().unwrap()];
        config.nat46_prefix = Some("64:ff9b:1::".parse().unwrap());
        assert!(config.build_dialer().is_ok());
    }
}
