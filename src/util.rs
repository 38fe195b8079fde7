//! One-shot request/reply exchange over a short-lived TCP connection.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Send one framed command to `addr` and read the reply to EOF.
///
/// The write half is shut down after the payload so the peer sees
/// end-of-request; the reply comes back on the same connection before it
/// closes. The whole exchange is bounded by `limit`.
pub async fn exchange(addr: &str, payload: &[u8], limit: Duration) -> io::Result<Vec<u8>> {
    timeout(limit, async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(reply)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("request to {addr} timed out")))?
}
