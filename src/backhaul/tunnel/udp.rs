use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use bytes::Bytes;
use tokio::{net::UdpSocket, sync::mpsc, task::JoinHandle};

use crate::backhaul::tunnel::{control::FrameSink, frame::Frame};

pub const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Debug)]
struct ServerSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

/// Server-side UDP sessions of one control connection.
///
/// A session is created by the first datagram from an external endpoint on a
/// given tunnel and lives until the control connection goes away. There is no
/// idle expiry.
#[derive(Debug, Default)]
pub struct ServerSessions {
    by_peer: HashMap<(u32, SocketAddr), u32>,
    by_id: HashMap<u32, ServerSession>,
}

impl ServerSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Resolve the session for `peer` on `tunnel_id`, creating it with an id
    /// from `next_id` if needed. The flag is `true` when the session is new
    /// and a UDP_OPEN must precede the data.
    pub fn lookup_or_insert(
        &mut self,
        tunnel_id: u32,
        peer: SocketAddr,
        socket: &Arc<UdpSocket>,
        next_id: impl FnOnce() -> u32,
    ) -> (u32, bool) {
        if let Some(id) = self.by_peer.get(&(tunnel_id, peer)) {
            return (*id, false);
        }
        let id = next_id();
        self.by_peer.insert((tunnel_id, peer), id);
        self.by_id.insert(
            id,
            ServerSession {
                socket: socket.clone(),
                peer,
            },
        );
        (id, true)
    }

    /// Send a datagram from the client back out of the tunnel's bound socket.
    pub async fn send(&self, id: u32, payload: &[u8]) -> io::Result<bool> {
        let Some(s) = self.by_id.get(&id) else {
            return Ok(false);
        };
        s.socket.send_to(payload, s.peer).await?;
        Ok(true)
    }

    pub fn clear(&mut self) {
        self.by_peer.clear();
        self.by_id.clear();
    }
}

struct ClientSession {
    tx: mpsc::UnboundedSender<Bytes>,
    task: JoinHandle<()>,
}

/// Client-side UDP sessions, one ephemeral socket per stream id.
#[derive(Default)]
pub struct ClientSessions {
    sessions: HashMap<u32, ClientSession>,
}

impl std::fmt::Debug for ClientSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSessions")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

impl ClientSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Start a session relaying between stream `id` and `target`. Replies
    /// from the target are forwarded as UDP_DATA. If the socket dies the id is
    /// reported on `closed`.
    pub fn open(&mut self, id: u32, target: SocketAddr, sink: FrameSink, closed: mpsc::UnboundedSender<u32>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            if let Err(err) = session_loop(id, target, rx, &sink).await {
                tracing::warn!(sid = id, target = %target, err = %err, "tunnel: udp session ended");
            }
            let _ = closed.send(id);
        });

        if let Some(old) = self.sessions.insert(id, ClientSession { tx, task }) {
            old.task.abort();
        }
    }

    pub fn send(&self, id: u32, payload: Bytes) -> bool {
        match self.sessions.get(&id) {
            Some(s) => s.tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn remove(&mut self, id: u32) -> bool {
        match self.sessions.remove(&id) {
            Some(s) => {
                s.task.abort();
                true
            }
            None => false,
        }
    }

    /// Close every session socket.
    pub fn close_all(&mut self) -> usize {
        let n = self.sessions.len();
        for (_, s) in self.sessions.drain() {
            s.task.abort();
        }
        n
    }
}

async fn session_loop(
    id: u32,
    target: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    sink: &FrameSink,
) -> io::Result<()> {
    let bind: SocketAddr = if target.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let sock = UdpSocket::bind(bind).await?;
    sock.connect(target).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            res = sock.recv(&mut buf) => {
                match res {
                    Ok(n) => {
                        sink.send(Frame::udp_data(id, Bytes::copy_from_slice(&buf[..n])));
                    }
                    // ICMP unreachable from a local service that is not up yet.
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                        tracing::debug!(sid = id, target = %target, "tunnel: udp target refused");
                    }
                    Err(err) => return Err(err),
                }
            }
            payload = rx.recv() => {
                let Some(payload) = payload else {
                    return Ok(());
                };
                match sock.send(&payload).await {
                    Ok(_) => {}
                    Err(err) if err.kind() == io::ErrorKind::ConnectionRefused => {
                        tracing::debug!(sid = id, target = %target, "tunnel: udp target refused");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}
