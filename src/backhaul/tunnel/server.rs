use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use bytes::Bytes;
use futures_util::{StreamExt, future};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::codec::FramedRead;

use crate::backhaul::net;
use crate::backhaul::tunnel::{
    auth::{AuthError, Handshake},
    control::{self, FrameSink},
    frame::{Frame, FrameCodec, FrameType},
    ports::PortAllocator,
    protocol::{OpenPayload, Protocol, TunnelDefinition},
    stream::StreamTable,
    udp::{MAX_DATAGRAM, ServerSessions},
};

/// Pause after a failed `accept` so a persistent error (EMFILE) does not spin.
pub const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Control listener address (`":5000"` binds all IPv4 interfaces).
    pub control_addr: String,
    pub secret: String,
    /// Interface the per-tunnel listeners bind to.
    pub bind_host: IpAddr,
}

pub struct Server {
    opts: ServerOptions,
    ln: TcpListener,
    ports: Arc<PortAllocator>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("control_addr", &self.opts.control_addr)
            .field("bind_host", &self.opts.bind_host)
            .finish_non_exhaustive()
    }
}

impl Server {
    pub async fn bind(opts: ServerOptions, ports: Arc<PortAllocator>) -> anyhow::Result<Self> {
        let addr = net::normalize_bind_addr(&opts.control_addr);
        let ln = TcpListener::bind(&*addr)
            .await
            .with_context(|| format!("tunnel: bind control {}", opts.control_addr))?;
        Ok(Self { opts, ln, ports })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.opts.control_addr,
            local = ?self.local_addr(),
            bind_host = %self.opts.bind_host,
            "tunnel: control listening"
        );

        let ctx = Arc::new(ClientContext {
            secret: self.opts.secret.clone(),
            bind_host: self.opts.bind_host,
            ports: self.ports.clone(),
        });

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            accept_failed("control", &err).await;
                            continue;
                        }
                    };
                    let ctx = ctx.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(conn, peer, ctx, shutdown).await {
                            tracing::warn!(client = %peer, err = %err, "tunnel: client ended with error");
                        }
                    });
                }
            }
        }

        Ok(())
    }
}

struct ClientContext {
    secret: String,
    bind_host: IpAddr,
    ports: Arc<PortAllocator>,
}

#[derive(Debug, Clone, Copy)]
struct Route {
    tunnel_id: u32,
    remote_port: u16,
}

enum Event {
    Accepted {
        route: Route,
        conn: TcpStream,
        peer: SocketAddr,
    },
    Datagram {
        route: Route,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        payload: Bytes,
    },
}

/// A public port held on behalf of one client. Dropping it stops the listener
/// and returns the port to the allocator.
struct AllocatedListener {
    port: u16,
    protocol: Protocol,
    task: JoinHandle<()>,
    ports: Arc<PortAllocator>,
}

impl Drop for AllocatedListener {
    fn drop(&mut self) {
        self.task.abort();
        self.ports.release(self.port);
        tracing::info!(port = self.port, proto = %self.protocol, "tunnel: released port");
    }
}

async fn handle_client(
    conn: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ClientContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(client = %peer, "tunnel: client connected");
    let _ = conn.set_nodelay(true);
    let (rd, wr) = conn.into_split();
    let mut frames = FramedRead::new(rd, FrameCodec);

    let mut hs = Handshake::new(&ctx.secret);
    let tunnels = loop {
        let frame = match frames.next().await {
            Some(Ok(f)) => f,
            Some(Err(err)) => {
                tracing::warn!(client = %peer, err = %err, "tunnel: protocol error before auth");
                return Ok(());
            }
            None => {
                tracing::info!(client = %peer, "tunnel: client left before auth");
                return Ok(());
            }
        };
        match hs.on_frame(&frame) {
            Ok(Some(tunnels)) => break tunnels,
            Ok(None) => {
                tracing::debug!(client = %peer, kind = ?frame.kind, state = ?hs.state(), "tunnel: ignoring frame before auth");
            }
            Err(AuthError::BadSecret) => {
                tracing::warn!(client = %peer, "tunnel: auth failed");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(client = %peer, err = %err, "tunnel: bad auth frame");
                return Ok(());
            }
        }
    };

    tracing::info!(client = %peer, tunnels = tunnels.len(), "tunnel: client authenticated");

    let (sink, _writer) = control::spawn_writer(wr);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();

    let mut conn = ClientConn {
        peer,
        sink,
        streams: StreamTable::new(),
        sessions: ServerSessions::new(),
        listeners: Vec::new(),
        next_id: 1,
        closed_tx,
        ports: ctx.ports.clone(),
    };

    for def in &tunnels {
        match open_listener(def, &ctx, events_tx.clone()).await {
            Ok(l) => {
                tracing::info!(client = %peer, tunnel_id = def.id, proto = %def.protocol, port = l.port, "tunnel: allocated");
                conn.listeners.push(l);
            }
            Err(err) => {
                tracing::warn!(client = %peer, tunnel_id = def.id, proto = %def.protocol, remote = def.remote, err = %format!("{err:#}"), "tunnel: skipped");
            }
        }
    }
    drop(events_tx);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            frame = frames.next() => {
                match frame {
                    Some(Ok(f)) => conn.on_frame(f).await,
                    Some(Err(err)) => {
                        tracing::warn!(client = %peer, err = %err, "tunnel: control read failed");
                        break;
                    }
                    None => break,
                }
            }
            Some(ev) = events_rx.recv() => conn.on_event(ev),
            Some(id) = closed_rx.recv() => conn.on_stream_closed(id),
        }
    }

    conn.teardown();
    Ok(())
}

async fn open_listener(
    def: &TunnelDefinition,
    ctx: &ClientContext,
    events: mpsc::UnboundedSender<Event>,
) -> anyhow::Result<AllocatedListener> {
    let port = ctx.ports.allocate(def.remote)?;
    let route = Route {
        tunnel_id: def.id,
        remote_port: port,
    };
    let addr = SocketAddr::new(ctx.bind_host, port);

    let task = match def.protocol {
        Protocol::Tcp => match TcpListener::bind(addr).await {
            Ok(ln) => tokio::spawn(accept_loop(ln, route, events)),
            Err(err) => {
                ctx.ports.release(port);
                return Err(err).with_context(|| format!("bind tcp {addr}"));
            }
        },
        Protocol::Udp => match UdpSocket::bind(addr).await {
            Ok(sock) => tokio::spawn(recv_loop(Arc::new(sock), route, events)),
            Err(err) => {
                ctx.ports.release(port);
                return Err(err).with_context(|| format!("bind udp {addr}"));
            }
        },
    };

    Ok(AllocatedListener {
        port,
        protocol: def.protocol,
        task,
        ports: ctx.ports.clone(),
    })
}

async fn accept_loop(ln: TcpListener, route: Route, events: mpsc::UnboundedSender<Event>) {
    loop {
        match ln.accept().await {
            Ok((conn, peer)) => {
                if events.send(Event::Accepted { route, conn, peer }).is_err() {
                    return;
                }
            }
            Err(err) => {
                accept_failed(&format!("tcp port {}", route.remote_port), &err).await;
            }
        }
    }
}

async fn accept_failed(what: &str, err: &io::Error) {
    tracing::warn!(listener = %what, err = %err, "tunnel: accept failed");
    tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
}

async fn recv_loop(sock: Arc<UdpSocket>, route: Route, events: mpsc::UnboundedSender<Event>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match sock.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                let ev = Event::Datagram {
                    route,
                    socket: sock.clone(),
                    peer,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if events.send(ev).is_err() {
                    return;
                }
            }
            Err(err) => {
                tracing::debug!(port = route.remote_port, err = %err, "tunnel: udp recv failed");
            }
        }
    }
}

/// Per-client state. Owned by the client's task; nothing else touches it.
struct ClientConn {
    peer: SocketAddr,
    sink: FrameSink,
    streams: StreamTable,
    sessions: ServerSessions,
    listeners: Vec<AllocatedListener>,
    next_id: u32,
    closed_tx: mpsc::UnboundedSender<u32>,
    ports: Arc<PortAllocator>,
}

fn bump(next_id: &mut u32) -> u32 {
    let id = *next_id;
    // 0 is reserved for connection-level frames.
    *next_id = next_id.checked_add(1).unwrap_or(1);
    id
}

impl ClientConn {
    async fn on_frame(&mut self, frame: Frame) {
        let id = frame.stream_id;
        match frame.kind {
            FrameType::TcpData => {
                self.streams.write(id, frame.payload);
            }
            FrameType::TcpClose => {
                if self.streams.end(id) {
                    tracing::debug!(client = %self.peer, sid = id, "tunnel: stream closed by client");
                }
            }
            FrameType::UdpData => {
                if let Err(err) = self.sessions.send(id, &frame.payload).await {
                    tracing::warn!(client = %self.peer, sid = id, err = %err, "tunnel: udp send failed");
                }
            }
            other => {
                tracing::debug!(client = %self.peer, kind = ?other, sid = id, "tunnel: ignoring frame");
            }
        }
    }

    fn on_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted { route, conn, peer } => {
                let id = bump(&mut self.next_id);
                let Some(meta) = open_payload(route, Protocol::Tcp) else {
                    return;
                };
                // TCP_OPEN must hit the wire before the relay emits any data.
                self.sink.send(Frame::tcp_open(id, meta));
                self.streams.open(id, future::ready(Ok(conn)), self.sink.clone(), self.closed_tx.clone());
                tracing::debug!(client = %self.peer, sid = id, port = route.remote_port, from = %peer, streams = self.streams.len(), "tunnel: tcp stream opened");
            }
            Event::Datagram {
                route,
                socket,
                peer,
                payload,
            } => {
                let counter = &mut self.next_id;
                let (id, fresh) = self
                    .sessions
                    .lookup_or_insert(route.tunnel_id, peer, &socket, || bump(counter));
                if fresh {
                    let Some(meta) = open_payload(route, Protocol::Udp) else {
                        return;
                    };
                    tracing::debug!(client = %self.peer, sid = id, port = route.remote_port, from = %peer, "tunnel: udp session opened");
                    self.sink.send(Frame::udp_open(id, meta));
                }
                self.sink.send(Frame::udp_data(id, payload));
            }
        }
    }

    fn on_stream_closed(&mut self, id: u32) {
        if self.streams.closed(id) {
            self.sink.send(Frame::tcp_close(id));
        }
    }

    fn teardown(&mut self) {
        let listeners = self.listeners.len();
        self.listeners.clear();
        let streams = self.streams.destroy_all();
        let sessions = self.sessions.len();
        self.sessions.clear();
        tracing::info!(
            client = %self.peer,
            listeners,
            streams,
            sessions,
            ports_in_use = self.ports.in_use(),
            "tunnel: client disconnected"
        );
    }
}

fn open_payload(route: Route, protocol: Protocol) -> Option<Bytes> {
    let meta = OpenPayload {
        tunnel_id: route.tunnel_id,
        remote_port: route.remote_port,
        protocol,
    };
    match meta.encode() {
        Ok(b) => Some(b),
        Err(err) => {
            tracing::warn!(err = %err, "tunnel: encode open payload");
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{net::Ipv4Addr, time::Duration};

    use futures_util::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::backhaul::tunnel::auth::auth_frame;

    pub(crate) const SECRET: &str = "s3cret";

    pub(crate) struct TestServer {
        pub addr: SocketAddr,
        pub ports: Arc<PortAllocator>,
        _stop: watch::Sender<bool>,
    }

    pub(crate) async fn start_server() -> TestServer {
        let ports = Arc::new(PortAllocator::new());
        let server = Server::bind(
            ServerOptions {
                control_addr: "127.0.0.1:0".into(),
                secret: SECRET.into(),
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
            ports.clone(),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(async move { server.serve(rx).await });
        TestServer {
            addr,
            ports,
            _stop: stop,
        }
    }

    pub(crate) fn free_tcp_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    pub(crate) fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    pub(crate) async fn connect_retry(port: u16) -> TcpStream {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(c) => return c,
                Err(err) if tokio::time::Instant::now() > deadline => panic!("connect {port}: {err}"),
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    }

    async fn next_frame(ctl: &mut Framed<TcpStream, FrameCodec>) -> Frame {
        tokio::time::timeout(Duration::from_secs(3), ctl.next())
            .await
            .expect("frame timeout")
            .expect("control closed")
            .expect("decode")
    }

    async fn authed(server: &TestServer, tunnels: &[TunnelDefinition]) -> Framed<TcpStream, FrameCodec> {
        let c = TcpStream::connect(server.addr).await.unwrap();
        let mut ctl = Framed::new(c, FrameCodec);
        ctl.send(auth_frame(SECRET, tunnels).unwrap()).await.unwrap();
        ctl
    }

    fn def(id: u32, protocol: Protocol, remote: u16) -> TunnelDefinition {
        TunnelDefinition {
            id,
            protocol,
            local: 1,
            remote,
        }
    }

    async fn wait_until(mut f: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while !f() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn port_shorthand_binds_ipv4_unspecified() {
        let server = Server::bind(
            ServerOptions {
                control_addr: ":0".into(),
                secret: SECRET.into(),
                bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            },
            Arc::new(PortAllocator::new()),
        )
        .await
        .unwrap();
        let local = server.local_addr().unwrap();
        assert_eq!(local.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_ne!(local.port(), 0);
    }

    #[tokio::test]
    async fn accept_errors_back_off_before_retrying() {
        let start = tokio::time::Instant::now();
        accept_failed("control", &io::Error::from_raw_os_error(24)).await;
        assert!(start.elapsed() >= ACCEPT_ERROR_DELAY);
    }

    #[tokio::test]
    async fn wrong_secret_closes_without_a_single_frame() {
        let server = start_server().await;
        let p = free_tcp_port();

        let mut c = TcpStream::connect(server.addr).await.unwrap();
        let f = auth_frame("wrong", &[def(0, Protocol::Tcp, p)]).unwrap();
        let mut buf = bytes::BytesMut::new();
        crate::backhaul::tunnel::frame::encode_frame(&f, &mut buf).unwrap();
        c.write_all(&buf).await.unwrap();

        let mut got = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(3), c.read_to_end(&mut got))
            .await
            .unwrap();
        assert!(got.is_empty());
        assert!(!server.ports.is_reserved(p));
    }

    #[tokio::test]
    async fn malformed_auth_closes_connection() {
        let server = start_server().await;
        let c = TcpStream::connect(server.addr).await.unwrap();
        let mut ctl = Framed::new(c, FrameCodec);
        ctl.send(Frame::auth(Bytes::from_static(b"{\"secret\":1}"))).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(3), ctl.next()).await.unwrap();
        assert!(next.is_none() || next.is_some_and(|r| r.is_err()));
    }

    #[tokio::test]
    async fn tcp_stream_relays_both_ways() {
        let server = start_server().await;
        let p = free_tcp_port();

        let c = TcpStream::connect(server.addr).await.unwrap();
        let mut ctl = Framed::new(c, FrameCodec);
        // Ignored while unauthenticated.
        ctl.send(Frame::tcp_data(1, Bytes::from_static(b"early"))).await.unwrap();
        ctl.send(auth_frame(SECRET, &[def(0, Protocol::Tcp, p)]).unwrap())
            .await
            .unwrap();

        let mut ext = connect_retry(p).await;
        let open = next_frame(&mut ctl).await;
        assert_eq!(open.kind, FrameType::TcpOpen);
        assert_eq!(open.stream_id, 1);
        let meta = OpenPayload::decode(&open.payload).unwrap();
        assert_eq!(
            meta,
            OpenPayload {
                tunnel_id: 0,
                remote_port: p,
                protocol: Protocol::Tcp
            }
        );

        ext.write_all(b"ping").await.unwrap();
        assert_eq!(next_frame(&mut ctl).await, Frame::tcp_data(1, Bytes::from_static(b"ping")));

        ctl.send(Frame::tcp_data(1, Bytes::from_static(b"pong"))).await.unwrap();
        let mut buf = [0u8; 4];
        ext.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(ext);
        assert_eq!(next_frame(&mut ctl).await, Frame::tcp_close(1));

        // A second connection gets a fresh id.
        let _ext2 = connect_retry(p).await;
        let open = next_frame(&mut ctl).await;
        assert_eq!((open.kind, open.stream_id), (FrameType::TcpOpen, 2));
    }

    #[tokio::test]
    async fn client_close_ends_external_connection() {
        let server = start_server().await;
        let p = free_tcp_port();
        let mut ctl = authed(&server, &[def(0, Protocol::Tcp, p)]).await;

        let mut ext = connect_retry(p).await;
        let open = next_frame(&mut ctl).await;
        ctl.send(Frame::tcp_data(open.stream_id, Bytes::from_static(b"bye")))
            .await
            .unwrap();
        ctl.send(Frame::tcp_close(open.stream_id)).await.unwrap();

        let mut got = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), ext.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, b"bye");

        // No TCP_CLOSE echoes back for a close the client initiated.
        let _probe = connect_retry(p).await;
        let f = next_frame(&mut ctl).await;
        assert_eq!(f.kind, FrameType::TcpOpen);
    }

    #[tokio::test]
    async fn udp_sessions_are_keyed_by_source_endpoint() {
        let server = start_server().await;
        let udp_port = free_udp_port();
        let probe_port = free_tcp_port();
        // Tunnels are set up in order, so once the TCP probe accepts, the UDP socket is bound.
        let mut ctl = authed(
            &server,
            &[def(0, Protocol::Udp, udp_port), def(1, Protocol::Tcp, probe_port)],
        )
        .await;
        let _probe = connect_retry(probe_port).await;
        assert_eq!(next_frame(&mut ctl).await.stream_id, 1);

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = ("127.0.0.1", udp_port);

        a.send_to(b"a1", target).await.unwrap();
        let open = next_frame(&mut ctl).await;
        assert_eq!(open.kind, FrameType::UdpOpen);
        let sid_a = open.stream_id;
        assert_eq!(
            OpenPayload::decode(&open.payload).unwrap(),
            OpenPayload {
                tunnel_id: 0,
                remote_port: udp_port,
                protocol: Protocol::Udp
            }
        );
        assert_eq!(next_frame(&mut ctl).await, Frame::udp_data(sid_a, Bytes::from_static(b"a1")));

        a.send_to(b"a2", target).await.unwrap();
        assert_eq!(next_frame(&mut ctl).await, Frame::udp_data(sid_a, Bytes::from_static(b"a2")));

        b.send_to(b"b1", target).await.unwrap();
        let open_b = next_frame(&mut ctl).await;
        assert_eq!(open_b.kind, FrameType::UdpOpen);
        assert_ne!(open_b.stream_id, sid_a);
        assert_eq!(
            next_frame(&mut ctl).await,
            Frame::udp_data(open_b.stream_id, Bytes::from_static(b"b1"))
        );

        ctl.send(Frame::udp_data(sid_a, Bytes::from_static(b"to-a"))).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = tokio::time::timeout(Duration::from_secs(3), a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"to-a");
        assert_eq!(from.port(), udp_port);
    }

    #[tokio::test]
    async fn disconnect_releases_ports_and_destroys_streams() {
        let server = start_server().await;
        let tcp_port = free_tcp_port();
        let udp_port = free_udp_port();
        let mut ctl = authed(
            &server,
            &[
                def(0, Protocol::Udp, udp_port),
                def(1, Protocol::Tcp, 80),
                def(2, Protocol::Tcp, tcp_port),
            ],
        )
        .await;

        let mut ext = connect_retry(tcp_port).await;
        next_frame(&mut ctl).await;
        assert!(server.ports.is_reserved(tcp_port));
        assert!(server.ports.is_reserved(udp_port));
        assert_eq!(server.ports.in_use(), 2);

        drop(ctl);
        let ports = server.ports.clone();
        wait_until(|| ports.in_use() == 0).await;
        assert_eq!(ports.allocate(tcp_port), Ok(tcp_port));
        assert_eq!(ports.allocate(udp_port), Ok(udp_port));

        let mut buf = Vec::new();
        let res = tokio::time::timeout(Duration::from_secs(3), ext.read_to_end(&mut buf))
            .await
            .unwrap();
        assert!(res.is_err() || buf.is_empty());
    }

    #[tokio::test]
    async fn second_client_cannot_take_a_held_port() {
        let server = start_server().await;
        let shared = free_tcp_port();
        let other = free_tcp_port();

        let _first = authed(&server, &[def(0, Protocol::Tcp, shared)]).await;
        let _ext = connect_retry(shared).await;

        let mut second = authed(
            &server,
            &[def(0, Protocol::Tcp, shared), def(1, Protocol::Tcp, other)],
        )
        .await;
        let _ext2 = connect_retry(other).await;
        let open = next_frame(&mut second).await;
        assert_eq!(OpenPayload::decode(&open.payload).unwrap().tunnel_id, 1);
        assert_eq!(server.ports.in_use(), 2);
    }
}
