use std::{collections::HashMap, future::Future, io};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    task::JoinHandle,
};

use crate::backhaul::tunnel::{control::FrameSink, frame::Frame};

pub const READ_BUF: usize = 64 * 1024;

struct StreamHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// Live TCP streams of one control connection, keyed by stream id.
///
/// Only the owning connection actor touches the table. Each stream runs in its
/// own task which forwards socket reads as TCP_DATA and reports back on the
/// `closed` channel when the socket ends; the actor then calls
/// [`StreamTable::closed`], which decides whether a TCP_CLOSE is due.
#[derive(Default)]
pub struct StreamTable {
    streams: HashMap<u32, StreamHandle>,
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Register stream `id` and start relaying once `connect` yields a socket.
    ///
    /// Data written before the socket is up is queued. A failed `connect` is
    /// reported on `closed` like any other socket end.
    pub fn open<F>(&mut self, id: u32, connect: F, sink: FrameSink, closed: mpsc::UnboundedSender<u32>)
    where
        F: Future<Output = io::Result<TcpStream>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if let Err(err) = relay(id, connect, rx, &sink).await {
                tracing::debug!(sid = id, err = %err, "tunnel: stream ended with error");
            }
            let _ = closed.send(id);
        });

        if let Some(old) = self.streams.insert(id, StreamHandle { tx, task }) {
            old.task.abort();
        }
    }

    /// Queue `payload` for the socket of stream `id`. Unknown ids are dropped:
    /// the peer's data raced with our close.
    pub fn write(&self, id: u32, payload: Bytes) -> bool {
        match self.streams.get(&id) {
            Some(h) => h.tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Peer closed stream `id`: flush queued data, half-close, then release
    /// the socket. No TCP_CLOSE is sent back.
    pub fn end(&mut self, id: u32) -> bool {
        // Dropping the sender lets the relay drain and shut down.
        self.streams.remove(&id).is_some()
    }

    /// The relay task for `id` finished. Returns `true` exactly once per id,
    /// and only if the stream was still registered, i.e. a TCP_CLOSE must be
    /// emitted.
    pub fn closed(&mut self, id: u32) -> bool {
        self.streams.remove(&id).is_some()
    }

    /// Destroy every stream without notifying the peer.
    pub fn destroy_all(&mut self) -> usize {
        let n = self.streams.len();
        for (_, h) in self.streams.drain() {
            h.task.abort();
        }
        n
    }
}

async fn relay<F>(
    id: u32,
    connect: F,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    sink: &FrameSink,
) -> io::Result<()>
where
    F: Future<Output = io::Result<TcpStream>>,
{
    let mut sock = connect.await?;
    let _ = sock.set_nodelay(true);
    let mut buf = vec![0u8; READ_BUF];

    loop {
        tokio::select! {
            res = sock.read(&mut buf) => {
                let n = res?;
                if n == 0 {
                    return Ok(());
                }
                sink.send(Frame::tcp_data(id, Bytes::copy_from_slice(&buf[..n])));
            }
            cmd = rx.recv() => {
                match cmd {
                    Some(payload) => sock.write_all(&payload).await?,
                    None => {
                        let _ = sock.shutdown().await;
                        return Ok(());
                    }
                }
            }
        }
    }
}
