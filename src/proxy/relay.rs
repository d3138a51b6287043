//! Bidirectional byte relay between a client and a backend.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Copy buffer size per direction.
const COPY_BUF_SIZE: usize = 8192;

/// Relay bytes between `client` and `backend` until the backend-to-client
/// direction finishes.
///
/// Both directions run concurrently. When the client reaches end-of-stream
/// the backend's write side is shut down (half-close) so the backend can
/// finish sending; the call returns once the backend-to-client direction
/// hits end-of-stream or either direction errors. The client stream is
/// handed back so the caller can decide between a graceful close and an
/// abort.
///
/// Byte accounting is the caller's concern: wrap `client` in a counting
/// decorator before relaying.
pub async fn relay<C, B>(client: C, backend: B) -> (C, io::Result<()>)
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut backend_rd, mut backend_wr) = tokio::io::split(backend);

    let result = {
        let client_to_backend = async {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                let n = client_rd.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                backend_wr.write_all(&buf[..n]).await?;
            }
            // Client is done sending; half-close so the backend still can.
            backend_wr.shutdown().await?;
            Ok::<(), io::Error>(())
        };

        let backend_to_client = async {
            let mut buf = vec![0u8; COPY_BUF_SIZE];
            loop {
                let n = backend_rd.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                client_wr.write_all(&buf[..n]).await?;
            }
            Ok::<(), io::Error>(())
        };

        tokio::pin!(client_to_backend, backend_to_client);
        tokio::select! {
            result = &mut backend_to_client => result,
            result = &mut client_to_backend => match result {
                Ok(()) => (&mut backend_to_client).await,
                Err(e) => Err(e),
            },
        }
    };

    let client = client_rd.unsplit(client_wr);
    (client, result)
}
