//! PROXY protocol v2 header encoding.
//!
//! When enabled, one header is written to the backend before any relayed
//! payload so the backend learns the original client addresses.
//!
//! Wire format (HAProxy PROXY protocol, version 2):
//! - 12-byte signature
//! - 1 byte version/command
//! - 1 byte address family and transport
//! - 2-byte address block length
//! - source + destination addresses and ports

use std::net::{IpAddr, SocketAddr};

/// PROXY protocol v2 signature.
const SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2, PROXY command.
const VERSION_PROXY: u8 = 0x21;

/// AF_INET + STREAM.
const FAMILY_TCP4: u8 = 0x11;

/// AF_INET6 + STREAM.
const FAMILY_TCP6: u8 = 0x21;

/// The original client addresses, as observed by the accepting listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    /// Client remote address.
    pub src: SocketAddr,
    /// Address the client connected to.
    pub dst: SocketAddr,
}

impl ProxyHeader {
    pub fn new(src: SocketAddr, dst: SocketAddr) -> Self {
        Self { src, dst }
    }

    /// Encode the header for writing ahead of the payload.
    pub fn encode(&self) -> Vec<u8> {
        // v4-mapped addresses collapse to IPv4; a genuinely mixed pair is
        // promoted to IPv6 so no address information is lost.
        let src_ip = self.src.ip().to_canonical();
        let dst_ip = self.dst.ip().to_canonical();

        let mut buf = Vec::with_capacity(52);
        buf.extend_from_slice(&SIGNATURE);
        buf.push(VERSION_PROXY);

        match (src_ip, dst_ip) {
            (IpAddr::V4(src), IpAddr::V4(dst)) => {
                buf.push(FAMILY_TCP4);
                buf.extend_from_slice(&12u16.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
            (src, dst) => {
                let src = match src {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                let dst = match dst {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                buf.push(FAMILY_TCP6);
                buf.extend_from_slice(&36u16.to_be_bytes());
                buf.extend_from_slice(&src.octets());
                buf.extend_from_slice(&dst.octets());
            }
        }

        buf.extend_from_slice(&self.src.port().to_be_bytes());
        buf.extend_from_slice(&self.dst.port().to_be_bytes());
        buf
    }
}

/// Decode a PROXY v2 header from the front of `data`.
///
/// Returns the header and the number of bytes it occupies, or `None` if
/// `data` does not begin with a valid PROXY v2 header.
pub fn parse_proxy_header(data: &[u8]) -> Option<(ProxyHeader, usize)> {
    if data.len() < 16 || data[..12] != SIGNATURE || data[12] != VERSION_PROXY {
        return None;
    }

    let addr_len = u16::from_be_bytes([data[14], data[15]]) as usize;
    if data.len() < 16 + addr_len {
        return None;
    }
    let addrs = &data[16..16 + addr_len];

    let (src, dst) = match data[13] {
        FAMILY_TCP4 if addr_len >= 12 => {
            let src_ip: [u8; 4] = addrs[..4].try_into().ok()?;
            let dst_ip: [u8; 4] = addrs[4..8].try_into().ok()?;
            let src_port = u16::from_be_bytes([addrs[8], addrs[9]]);
            let dst_port = u16::from_be_bytes([addrs[10], addrs[11]]);
            (
                SocketAddr::from((src_ip, src_port)),
                SocketAddr::from((dst_ip, dst_port)),
            )
        }
        FAMILY_TCP6 if addr_len >= 36 => {
            let src_ip: [u8; 16] = addrs[..16].try_into().ok()?;
            let dst_ip: [u8; 16] = addrs[16..32].try_into().ok()?;
            let src_port = u16::from_be_bytes([addrs[32], addrs[33]]);
            let dst_port = u16::from_be_bytes([addrs[34], addrs[35]]);
            (
                SocketAddr::from((src_ip, src_port)),
                SocketAddr::from((dst_ip, dst_port)),
            )
        }
        _ => return None,
    };

    Some((ProxyHeader::new(src, dst), 16 + addr_len))
}
