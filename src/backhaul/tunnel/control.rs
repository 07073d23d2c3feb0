use futures_util::SinkExt;
use tokio::{io::AsyncWrite, sync::mpsc, task::JoinHandle};
use tokio_util::codec::FramedWrite;

use crate::backhaul::tunnel::frame::{Frame, FrameCodec};

/// Outbound half of a control connection.
///
/// Every producer (stream relays, UDP sessions, the connection actor itself)
/// pushes frames here; a single writer task serializes them onto the socket so
/// frames for one stream id keep their order.
///
/// The queue is unbounded: nothing waits for the peer to drain, and a slow peer
/// is only throttled by TCP flow control on the control socket. This is the one
/// place a backpressure policy would go.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

impl FrameSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame. Returns `false` once the writer is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}

/// Spawn the writer task for `wr`.
///
/// The task ends when every `FrameSink` clone is dropped (after flushing what
/// was queued) or when a write fails.
pub fn spawn_writer<W>(wr: W) -> (FrameSink, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sink, rx) = FrameSink::channel();
    let task = tokio::spawn(write_loop(wr, rx));
    (sink, task)
}

async fn write_loop<W>(wr: W, mut rx: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let mut framed = FramedWrite::new(wr, FrameCodec);

    while let Some(frame) = rx.recv().await {
        if let Err(err) = framed.feed(frame).await {
            tracing::debug!(err=%err, "tunnel: control write failed");
            return;
        }
        // Batch whatever is already queued into one flush.
        while let Ok(frame) = rx.try_recv() {
            if let Err(err) = framed.feed(frame).await {
                tracing::debug!(err=%err, "tunnel: control write failed");
                return;
            }
        }
        if let Err(err) = framed.flush().await {
            tracing::debug!(err=%err, "tunnel: control flush failed");
            return;
        }
    }

    let _ = framed.close().await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::*;

    #[tokio::test]
    async fn writer_preserves_order_and_closes_when_sinks_drop() {
        let (a, b) = tokio::io::duplex(1 << 16);
        let (sink, task) = spawn_writer(a);

        let second = sink.clone();
        for i in 0..50u32 {
            assert!(sink.send(Frame::tcp_data(1, Bytes::from(i.to_be_bytes().to_vec()))));
        }
        assert!(second.send(Frame::tcp_close(1)));
        drop(sink);
        drop(second);

        let mut rd = FramedRead::new(b, FrameCodec);
        for i in 0..50u32 {
            let f = rd.next().await.unwrap().unwrap();
            assert_eq!(f, Frame::tcp_data(1, Bytes::from(i.to_be_bytes().to_vec())));
        }
        assert_eq!(rd.next().await.unwrap().unwrap(), Frame::tcp_close(1));
        task.await.unwrap();
        assert!(rd.next().await.is_none());
    }
}
