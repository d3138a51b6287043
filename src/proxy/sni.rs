//! SNI (Server Name Indication) extraction from a TLS ClientHello.
//!
//! The sniffer reads just enough TLS records off the wire to decode the
//! ClientHello extension block, then hands every consumed byte back to the
//! caller so the stream can be replayed to the backend unmodified. TLS is
//! never terminated here.
//!
//! TLS record layout:
//! - byte 0: record type (0x16 = Handshake)
//! - bytes 1-2: protocol version
//! - bytes 3-4: record length
//! - bytes 5+: fragment
//!
//! ClientHello handshake message:
//! - byte 0: handshake type (0x01 = ClientHello)
//! - bytes 1-3: length
//! - bytes 4-5: client version
//! - bytes 6-37: random
//! - session ID (1-byte length + data)
//! - cipher suites (2-byte length + data)
//! - compression methods (1-byte length + data)
//! - extensions (2-byte length + data)

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Deadline for reading the full ClientHello. Applies to the sniff only;
/// the relay that follows is unbounded.
pub const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);

/// TLS record type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Handshake message type for ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;

/// Maximum payload of a single plaintext TLS record.
const MAX_RECORD_LEN: usize = 16384;

/// Upper bound on the reassembled ClientHello, across records.
const MAX_HANDSHAKE_LEN: usize = 65536;

const EXTENSION_SERVER_NAME: u16 = 0x0000;
const EXTENSION_ALPN: u16 = 0x0010;

/// The parsed handshake preamble plus every byte consumed producing it.
#[derive(Debug, Clone)]
pub struct SniffedHello {
    /// Hostname from the SNI extension, exactly as sent (empty if absent).
    pub server_name: String,
    /// ALPN protocol names in wire order.
    pub alpn: Vec<String>,
    /// All bytes read from the connection, in wire order. These must reach
    /// whatever reads the connection next, before any fresh bytes.
    pub buffered: Vec<u8>,
}

/// Read and parse the ClientHello from `stream` under [`SNIFF_TIMEOUT`].
///
/// On success every consumed byte is in `SniffedHello::buffered`; nothing
/// is written to the stream and no deadline outlives the call.
pub async fn sniff_client_hello<S>(stream: &mut S) -> Result<SniffedHello, ProxyError>
where
    S: AsyncRead + Unpin,
{
    match timeout(SNIFF_TIMEOUT, read_client_hello(stream)).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out reading ClientHello",
        ))),
    }
}

/// Read handshake records until the ClientHello message is complete.
async fn read_client_hello<S>(stream: &mut S) -> Result<SniffedHello, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffered = Vec::new();
    let mut handshake = Vec::new();

    loop {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        buffered.extend_from_slice(&header);

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(ProxyError::TlsInvalid(format!(
                "unexpected record type {:#04x}",
                header[0]
            )));
        }

        let record_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if record_len == 0 || record_len > MAX_RECORD_LEN {
            return Err(ProxyError::TlsInvalid(format!(
                "record length {record_len} out of range"
            )));
        }

        let start = buffered.len();
        buffered.resize(start + record_len, 0);
        stream.read_exact(&mut buffered[start..]).await?;
        handshake.extend_from_slice(&buffered[start..]);

        if handshake.len() > MAX_HANDSHAKE_LEN {
            return Err(ProxyError::TlsInvalid(
                "ClientHello exceeds maximum handshake size".into(),
            ));
        }

        // A ClientHello may be fragmented across records; keep reading
        // until the handshake message is complete.
        if let Some((server_name, alpn)) = parse_client_hello(&handshake)? {
            return Ok(SniffedHello {
                server_name,
                alpn,
                buffered,
            });
        }
    }
}

/// Parse a (possibly still incomplete) ClientHello handshake message.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some(..))` once the
/// message is complete, and an error for anything structurally invalid.
fn parse_client_hello(handshake: &[u8]) -> Result<Option<(String, Vec<String>)>, ProxyError> {
    if handshake.len() < 4 {
        return Ok(None);
    }
    if handshake[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(ProxyError::TlsInvalid(format!(
            "unexpected handshake type {:#04x}",
            handshake[0]
        )));
    }

    let message_len = ((handshake[1] as usize) << 16)
        | ((handshake[2] as usize) << 8)
        | (handshake[3] as usize);
    if message_len > MAX_HANDSHAKE_LEN {
        return Err(ProxyError::TlsInvalid(
            "ClientHello exceeds maximum handshake size".into(),
        ));
    }
    if handshake.len() < 4 + message_len {
        return Ok(None);
    }

    let body = &handshake[4..4 + message_len];
    parse_hello_body(body).map(Some)
}

fn parse_hello_body(body: &[u8]) -> Result<(String, Vec<String>), ProxyError> {
    // Client version (2) + random (32).
    let mut pos = 34;
    if body.len() < pos + 1 {
        return Err(truncated("legacy version and random"));
    }

    let session_id_len = body[pos] as usize;
    pos += 1 + session_id_len;
    if body.len() < pos + 2 {
        return Err(truncated("session ID"));
    }

    let cipher_suites_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2 + cipher_suites_len;
    if body.len() < pos + 1 {
        return Err(truncated("cipher suites"));
    }

    let compression_len = body[pos] as usize;
    pos += 1 + compression_len;
    if body.len() < pos {
        return Err(truncated("compression methods"));
    }

    // Extensions are optional; their absence just means no SNI.
    if pos == body.len() {
        return Ok((String::new(), Vec::new()));
    }
    if body.len() < pos + 2 {
        return Err(truncated("extensions length"));
    }
    let extensions_len = u16::from_be_bytes([body[pos], body[pos + 1]]) as usize;
    pos += 2;
    let extensions_end = pos + extensions_len;
    if extensions_end != body.len() {
        return Err(ProxyError::TlsInvalid(
            "extensions length disagrees with message length".into(),
        ));
    }

    let mut server_name = String::new();
    let mut alpn = Vec::new();

    while pos + 4 <= extensions_end {
        let ext_type = u16::from_be_bytes([body[pos], body[pos + 1]]);
        let ext_len = u16::from_be_bytes([body[pos + 2], body[pos + 3]]) as usize;
        pos += 4;
        if pos + ext_len > extensions_end {
            return Err(truncated("extension data"));
        }
        let data = &body[pos..pos + ext_len];
        match ext_type {
            EXTENSION_SERVER_NAME => server_name = parse_server_name(data)?,
            EXTENSION_ALPN => alpn = parse_alpn(data)?,
            _ => {}
        }
        pos += ext_len;
    }
    if pos != extensions_end {
        return Err(truncated("extension header"));
    }

    Ok((server_name, alpn))
}

/// Extract the host_name entry from an SNI extension payload.
fn parse_server_name(data: &[u8]) -> Result<String, ProxyError> {
    if data.len() < 2 {
        return Err(truncated("server name list"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + list_len > data.len() {
        return Err(truncated("server name list"));
    }

    let mut pos = 2;
    while pos + 3 <= 2 + list_len {
        let name_type = data[pos];
        let name_len = u16::from_be_bytes([data[pos + 1], data[pos + 2]]) as usize;
        pos += 3;
        if pos + name_len > 2 + list_len {
            return Err(truncated("server name entry"));
        }
        // name type 0 = host_name
        if name_type == 0 {
            return std::str::from_utf8(&data[pos..pos + name_len])
                .map(str::to_owned)
                .map_err(|_| ProxyError::TlsInvalid("server name is not valid UTF-8".into()));
        }
        pos += name_len;
    }

    Ok(String::new())
}

/// Extract the protocol name list from an ALPN extension payload.
fn parse_alpn(data: &[u8]) -> Result<Vec<String>, ProxyError> {
    if data.len() < 2 {
        return Err(truncated("ALPN protocol list"));
    }
    let list_len = u16::from_be_bytes([data[0], data[1]]) as usize;
    if 2 + list_len != data.len() {
        return Err(truncated("ALPN protocol list"));
    }

    let mut protocols = Vec::new();
    let mut pos = 2;
    while pos < data.len() {
        let proto_len = data[pos] as usize;
        pos += 1;
        if proto_len == 0 || pos + proto_len > data.len() {
            return Err(truncated("ALPN protocol entry"));
        }
        let proto = std::str::from_utf8(&data[pos..pos + proto_len])
            .map_err(|_| ProxyError::TlsInvalid("ALPN protocol is not valid UTF-8".into()))?;
        protocols.push(proto.to_owned());
        pos += proto_len;
    }

    Ok(protocols)
}

fn truncated(what: &str) -> ProxyError {
    ProxyError::TlsInvalid(format!("truncated {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    /// Build a syntactically valid ClientHello record.
    fn client_hello(server_name: Option<&str>, alpn: &[&str]) -> Vec<u8> {
        let mut extensions = Vec::new();
        if let Some(name) = server_name {
            let host = name.as_bytes();
            let mut ext = Vec::new();
            ext.extend_from_slice(&((3 + host.len()) as u16).to_be_bytes());
            ext.push(0); // host_name
            ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
            ext.extend_from_slice(host);
            push_extension(&mut extensions, EXTENSION_SERVER_NAME, &ext);
        }
        if !alpn.is_empty() {
            let mut protos = Vec::new();
            for p in alpn {
                protos.push(p.len() as u8);
                protos.extend_from_slice(p.as_bytes());
            }
            let mut ext = Vec::new();
            ext.extend_from_slice(&(protos.len() as u16).to_be_bytes());
            ext.extend_from_slice(&protos);
            push_extension(&mut extensions, EXTENSION_ALPN, &ext);
        }

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session ID length
        body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![HANDSHAKE_TYPE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        into_records(&handshake, handshake.len())
    }

    fn push_extension(out: &mut Vec<u8>, ext_type: u16, data: &[u8]) {
        out.extend_from_slice(&ext_type.to_be_bytes());
        out.extend_from_slice(&(data.len() as u16).to_be_bytes());
        out.extend_from_slice(data);
    }

    /// Wrap handshake bytes into records of at most `chunk` payload bytes.
    fn into_records(handshake: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for part in handshake.chunks(chunk) {
            out.extend_from_slice(&[CONTENT_TYPE_HANDSHAKE, 0x03, 0x01]);
            out.extend_from_slice(&(part.len() as u16).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    #[tokio::test]
    async fn test_sniff_hostname_and_alpn() {
        let wire = client_hello(Some("example.com"), &["h2", "http/1.1"]);
        let mut stream = wire.as_slice();

        let hello = sniff_client_hello(&mut stream).await.unwrap();
        assert_eq!(hello.server_name, "example.com");
        assert_eq!(hello.alpn, vec!["h2", "http/1.1"]);
        assert_eq!(hello.buffered, wire);
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn test_sniff_preserves_case() {
        let wire = client_hello(Some("Example.COM"), &[]);
        let mut stream = wire.as_slice();

        let hello = sniff_client_hello(&mut stream).await.unwrap();
        assert_eq!(hello.server_name, "Example.COM");
    }

    #[tokio::test]
    async fn test_sniff_without_sni() {
        let wire = client_hello(None, &["h2"]);
        let mut stream = wire.as_slice();

        let hello = sniff_client_hello(&mut stream).await.unwrap();
        assert_eq!(hello.server_name, "");
        assert_eq!(hello.alpn, vec!["h2"]);
    }

    #[tokio::test]
    async fn test_sniff_leaves_trailing_bytes_unread() {
        let mut wire = client_hello(Some("example.com"), &[]);
        let hello_len = wire.len();
        wire.extend_from_slice(b"application data");
        let mut stream = wire.as_slice();

        let hello = sniff_client_hello(&mut stream).await.unwrap();
        assert_eq!(hello.buffered, &wire[..hello_len]);
        assert_eq!(stream, b"application data");
    }

    #[tokio::test]
    async fn test_sniff_fragmented_across_records() {
        let wire = client_hello(Some("fragmented.example"), &["h2"]);
        // The builder emits one record; re-frame its payload into 10-byte records.
        let refragmented = into_records(&wire[5..], 10);
        let mut stream = refragmented.as_slice();

        let hello = sniff_client_hello(&mut stream).await.unwrap();
        assert_eq!(hello.server_name, "fragmented.example");
        assert_eq!(hello.alpn, vec!["h2"]);
        assert_eq!(hello.buffered, refragmented);
    }

    #[tokio::test]
    async fn test_sniff_rejects_non_tls() {
        let wire = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut stream = wire.as_slice();

        let err = sniff_client_hello(&mut stream).await.unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::TlsInvalid);
    }

    #[tokio::test]
    async fn test_sniff_rejects_non_client_hello_handshake() {
        // ServerHello (type 0x02) inside a handshake record.
        let wire = into_records(&[0x02, 0x00, 0x00, 0x00], 4);
        let mut stream = wire.as_slice();

        let err = sniff_client_hello(&mut stream).await.unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::TlsInvalid);
    }

    #[tokio::test]
    async fn test_sniff_truncated_stream_is_eof() {
        let wire = client_hello(Some("example.com"), &[]);
        let mut stream = &wire[..wire.len() / 2];

        let err = sniff_client_hello(&mut stream).await.unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Eof);
    }

    #[tokio::test]
    async fn test_sniff_immediate_eof() {
        let mut stream: &[u8] = &[];
        let err = sniff_client_hello(&mut stream).await.unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Eof);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sniff_deadline() {
        let (_writer, mut reader) = tokio::io::duplex(64);
        let err = sniff_client_hello(&mut reader).await.unwrap_err();
        assert_eq!(ErrorKind::classify(&err), ErrorKind::Timeout);
    }

    #[test]
    fn test_parse_truncated_body_is_invalid() {
        // Complete record framing around a body that is too short.
        let handshake = [HANDSHAKE_TYPE_CLIENT_HELLO, 0x00, 0x00, 0x02, 0x03, 0x03];
        let err = parse_client_hello(&handshake).unwrap_err();
        assert!(matches!(err, ProxyError::TlsInvalid(_)));
    }
}
