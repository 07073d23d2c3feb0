use tokio::net::UdpSocket;

use crate::backhaul::tunnel::udp::MAX_DATAGRAM;

pub const DEFAULT_PORT: u16 = 3000;

const PREFIX: &[u8] = b"Echo: ";

/// Answer every datagram with `"Echo: "` followed by its payload.
///
/// Returns only when the socket fails to receive.
pub async fn serve(sock: UdpSocket) -> std::io::Result<()> {
    if let Ok(addr) = sock.local_addr() {
        tracing::info!(addr = %addr, "echo: listening");
    }

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut reply = Vec::with_capacity(MAX_DATAGRAM + PREFIX.len());
    loop {
        let (n, peer) = sock.recv_from(&mut buf).await?;
        tracing::debug!(from = %peer, bytes = n, "echo: datagram");

        reply.clear();
        reply.extend_from_slice(PREFIX);
        reply.extend_from_slice(&buf[..n]);
        if let Err(err) = sock.send_to(&reply, peer).await {
            tracing::debug!(to = %peer, err = %err, "echo: reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn replies_with_prefix_to_each_sender() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(serve(sock));

        for msg in [&b"hi"[..], b"", b"second"] {
            let c = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            c.send_to(msg, addr).await.unwrap();
            let mut buf = [0u8; 64];
            let (n, from) = tokio::time::timeout(Duration::from_secs(2), c.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(from, addr);
            let mut want = b"Echo: ".to_vec();
            want.extend_from_slice(msg);
            assert_eq!(&buf[..n], &want[..]);
        }
    }
}
