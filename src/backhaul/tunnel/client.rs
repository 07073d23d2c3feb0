use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use futures_util::StreamExt;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_util::codec::FramedRead;

use crate::backhaul::tunnel::{
    auth::auth_frame,
    control::{self, FrameSink},
    frame::{Frame, FrameCodec, FrameType},
    protocol::{OpenPayload, Protocol, ProtocolError, TunnelDefinition},
    stream::StreamTable,
    udp::ClientSessions,
};

/// Fixed pause between a disconnect and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// A local service exposed through the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTunnel {
    pub protocol: Protocol,
    pub target: SocketAddr,
    /// Requested public port, 0 for any.
    pub remote: u16,
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub secret: String,
    pub tunnels: Vec<LocalTunnel>,
    pub reconnect_delay: Duration,
}

pub struct Client {
    opts: ClientOptions,
    defs: Vec<TunnelDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ended {
    Shutdown,
    Disconnected,
}

impl Client {
    pub fn new(opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }

        // Tunnel ids are positions in the configured list.
        let defs = opts
            .tunnels
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let id = u32::try_from(i).context("tunnel: too many tunnels")?;
                Ok(TunnelDefinition {
                    id,
                    protocol: t.protocol,
                    local: t.target.port(),
                    remote: t.remote,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { opts, defs })
    }

    pub fn definitions(&self) -> &[TunnelDefinition] {
        &self.defs
    }

    /// Keep a control connection up until `shutdown` fires.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let delay = self.opts.reconnect_delay;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(Ended::Shutdown) => return Ok(()),
                Ok(Ended::Disconnected) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        retry_in = %humantime::format_duration(delay),
                        "tunnel: disconnected; retrying"
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %format!("{err:#}"),
                        retry_in = %humantime::format_duration(delay),
                        "tunnel: connection failed; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<Ended> {
        let conn = TcpStream::connect(self.opts.server_addr.as_str())
            .await
            .with_context(|| format!("tunnel: dial {}", self.opts.server_addr))?;
        let _ = conn.set_nodelay(true);
        let (rd, wr) = conn.into_split();

        let (sink, _writer) = control::spawn_writer(wr);
        sink.send(auth_frame(&self.opts.secret, &self.defs)?);

        tracing::info!(
            server = %self.opts.server_addr,
            tunnels = self.defs.len(),
            "tunnel: connected"
        );

        let mut frames = FramedRead::new(rd, FrameCodec);
        let (stream_closed_tx, mut stream_closed) = mpsc::unbounded_channel();
        let (session_closed_tx, mut session_closed) = mpsc::unbounded_channel();
        let mut conn = ServerConn {
            tunnels: &self.opts.tunnels,
            sink,
            streams: StreamTable::new(),
            sessions: ClientSessions::new(),
            stream_closed: stream_closed_tx,
            session_closed: session_closed_tx,
        };

        let res = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(Ended::Shutdown);
                    }
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(f)) => {
                            if let Err(err) = conn.on_frame(f) {
                                break Err(err.into());
                            }
                        }
                        Some(Err(err)) => break Err(err.into()),
                        None => break Ok(Ended::Disconnected),
                    }
                }
                Some(id) = stream_closed.recv() => conn.on_stream_closed(id),
                Some(id) = session_closed.recv() => conn.on_session_closed(id),
            }
        };

        conn.teardown();
        res
    }
}

/// State of one live control connection on the client side.
struct ServerConn<'a> {
    tunnels: &'a [LocalTunnel],
    sink: FrameSink,
    streams: StreamTable,
    sessions: ClientSessions,
    stream_closed: mpsc::UnboundedSender<u32>,
    session_closed: mpsc::UnboundedSender<u32>,
}

impl ServerConn<'_> {
    fn tunnel(&self, meta: &OpenPayload, protocol: Protocol) -> Option<&LocalTunnel> {
        let t = self.tunnels.get(usize::try_from(meta.tunnel_id).ok()?)?;
        (t.protocol == protocol).then_some(t)
    }

    fn on_frame(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        let id = frame.stream_id;
        match frame.kind {
            FrameType::TcpOpen => {
                let meta = OpenPayload::decode(&frame.payload)?;
                let Some(target) = self.tunnel(&meta, Protocol::Tcp).map(|t| t.target) else {
                    tracing::warn!(sid = id, tunnel_id = meta.tunnel_id, "tunnel: open for unknown tunnel");
                    self.sink.send(Frame::tcp_close(id));
                    return Ok(());
                };
                self.streams.open(
                    id,
                    TcpStream::connect(target),
                    self.sink.clone(),
                    self.stream_closed.clone(),
                );
                tracing::debug!(sid = id, target = %target, remote_port = meta.remote_port, streams = self.streams.len(), "tunnel: tcp stream opened");
            }
            FrameType::TcpData => {
                self.streams.write(id, frame.payload);
            }
            FrameType::TcpClose => {
                self.streams.end(id);
            }
            FrameType::UdpOpen => {
                let meta = OpenPayload::decode(&frame.payload)?;
                let Some(target) = self.tunnel(&meta, Protocol::Udp).map(|t| t.target) else {
                    tracing::warn!(sid = id, tunnel_id = meta.tunnel_id, "tunnel: open for unknown tunnel");
                    return Ok(());
                };
                self.sessions
                    .open(id, target, self.sink.clone(), self.session_closed.clone());
                tracing::debug!(sid = id, target = %target, remote_port = meta.remote_port, sessions = self.sessions.len(), "tunnel: udp session opened");
            }
            FrameType::UdpData => {
                self.sessions.send(id, frame.payload);
            }
            FrameType::Auth => {
                tracing::debug!("tunnel: ignoring auth frame from server");
            }
        }
        Ok(())
    }

    fn on_stream_closed(&mut self, id: u32) {
        if self.streams.closed(id) {
            self.sink.send(Frame::tcp_close(id));
        }
    }

    fn on_session_closed(&mut self, id: u32) {
        self.sessions.remove(id);
    }

    fn teardown(&mut self) {
        let streams = self.streams.destroy_all();
        let sessions = self.sessions.close_all();
        tracing::info!(streams, sessions, "tunnel: connection state cleared");
    }
}
