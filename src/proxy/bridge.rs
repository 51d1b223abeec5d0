//! Byte splice between an accepted SOCKS client and a forwarded channel.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy in both directions until each side has shut down.
///
/// Returns `(client_to_remote, remote_to_client)` byte counts. Copy errors
/// end the affected direction and are counted as zero.
pub async fn splice<C, R>(client: C, remote: R) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    let upstream = async {
        let result = tokio::io::copy(&mut client_read, &mut remote_write).await;
        let _ = remote_write.shutdown().await;
        result
    };

    let downstream = async {
        let result = tokio::io::copy(&mut remote_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        result
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);

    let sent = upstream.unwrap_or_else(|e| {
        debug!("Client to remote copy ended: {}", e);
        0
    });
    let received = downstream.unwrap_or_else(|e| {
        debug!("Remote to client copy ended: {}", e);
        0
    });

    (sent, received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::Duration;

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (mut remote_peer, remote) = tokio::io::duplex(1024);

        let handle = tokio::spawn(async move { splice(client, remote).await });

        client_peer.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        client_peer.shutdown().await.unwrap();

        remote_peer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        remote_peer.shutdown().await.unwrap();

        let mut buf = Vec::new();
        remote_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"GET / HTTP/1.1\r\n\r\n");

        let mut buf = Vec::new();
        client_peer.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"HTTP/1.1 200 OK\r\n\r\n");

        let (sent, received) = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("splice timed out")
            .unwrap();
        assert_eq!(sent, 18);
        assert_eq!(received, 19);
    }
}
