//! The tunnel engine: a bidirectional relay between a reliable stream and a
//! UDP endpoint.
//!
//! A tunnel is created from a [`TunnelConfig`] naming one of four types and
//! two addresses, then driven by [`Tunnel::serve`]. The stream side carries
//! framed `DATA` and `PING` records; `DATA` payloads are prefixed with a
//! one-byte peer id so that many UDP remotes share the single stream. On the
//! listening side the peer id indexes an arrival-ordered address table; on the
//! dialing side every peer id gets its own short-lived connected UDP socket so
//! the local service can tell the remotes apart by source port.

pub mod peers;
pub mod plugin;
pub mod stream;

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    rc::Rc,
    sync::atomic::{AtomicU64, AtomicU8, Ordering},
    time::Duration,
};

use quinn::VarInt;
use thlink_proto::{encode_frame, FrameParser, FrameType, MAX_PAYLOAD, TRANS_BUF_SIZE};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, watch, Mutex},
    task::spawn_local,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, warn};

use crate::endpoint::{make_client_endpoint, make_server_endpoint};

use self::{
    peers::PeerTable,
    plugin::{HookAction, PluginIo, SharedHook, TunnelHooks},
    stream::{split_quic, split_tcp, StreamReader, StreamWriter},
};

/// How long a listener-side tunnel waits for its first stream connection.
const FIRST_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval of the dialer-side liveness probe.
const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Pause before retrying a failed virtual UDP client read.
const UDP_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// The four endpoint pairings a tunnel can be built with. Address 0 is the
/// stream side, address 1 the UDP side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelType {
    ListenQuicListenUdp,
    ListenTcpListenUdp,
    DialQuicDialUdp,
    DialTcpDialUdp,
}

impl TunnelType {
    pub fn is_listener(self) -> bool {
        matches!(self, Self::ListenQuicListenUdp | Self::ListenTcpListenUdp)
    }
}

/// Addresses and pairing of a new tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelConfig {
    pub tunnel_type: TunnelType,
    /// Bound (listener) or dialed (dialer) by the stream side.
    pub stream_addr: SocketAddr,
    /// Bound (listener) or dialed (dialer) by the UDP side.
    pub udp_addr: SocketAddr,
}

/// Lifecycle state of a tunnel, readable while it serves.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Init = 0,
    Connected = 1,
    Closed = 2,
    Failed = 3,
}

impl TunnelStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connected,
            2 => Self::Closed,
            3 => Self::Failed,
            _ => Self::Init,
        }
    }
}

/// Errors of tunnel construction and serving.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("QUIC connect error: {0}")]
    Connect(#[from] quinn::ConnectError),
    #[error("QUIC connection error: {0}")]
    Connection(#[from] quinn::ConnectionError),
    #[error("timed out waiting for the first stream connection")]
    AcceptTimeout,
    #[error("the stream endpoint closed before a connection arrived")]
    EndpointClosed,
    #[error("the tunnel is not in a serveable state")]
    NotServeable,
}

struct TunnelShared {
    status: AtomicU8,
    ping_nanos: AtomicU64,
}

impl TunnelShared {
    fn new() -> Self {
        Self {
            status: AtomicU8::new(TunnelStatus::Init as u8),
            ping_nanos: AtomicU64::new(0),
        }
    }

    fn status(&self) -> TunnelStatus {
        TunnelStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    fn store_status(&self, status: TunnelStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    /// Moves `from` to `to`, leaving any other state (notably `Closed`) alone.
    fn transition(&self, from: TunnelStatus, to: TunnelStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

enum Endpoints {
    QuicListener {
        endpoint: quinn::Endpoint,
        udp: UdpSocket,
    },
    TcpListener {
        listener: TcpListener,
        udp: UdpSocket,
    },
    Dialer {
        reader: StreamReader,
        writer: StreamWriter,
        udp: UdpSocket,
        udp_target: SocketAddr,
        quic: Option<(quinn::Endpoint, quinn::Connection)>,
    },
}

/// A bidirectional pipe between a stream endpoint and a UDP endpoint.
pub struct Tunnel {
    tunnel_type: TunnelType,
    stream_port: u16,
    udp_port: u16,
    endpoints: Option<Endpoints>,
    shared: Rc<TunnelShared>,
    quit_tx: watch::Sender<bool>,
    quit_rx: watch::Receiver<bool>,
}

impl Tunnel {
    /// Sets up both endpoints of a new tunnel. If any step fails, everything
    /// opened so far is released and no tunnel is returned.
    pub async fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        let (endpoints, stream_port, udp_port) = match config.tunnel_type {
            TunnelType::ListenQuicListenUdp => {
                let endpoint = make_server_endpoint(config.stream_addr)?;
                let stream_port = endpoint.local_addr()?.port();
                debug!("QUIC listen at {}", endpoint.local_addr()?);

                let udp = match UdpSocket::bind(config.udp_addr).await {
                    Ok(udp) => udp,
                    Err(error) => {
                        endpoint.close(VarInt::from_u32(0), b"");
                        return Err(error.into());
                    }
                };
                let udp_port = udp.local_addr()?.port();
                debug!("UDP listen at {}", udp.local_addr()?);

                (Endpoints::QuicListener { endpoint, udp }, stream_port, udp_port)
            }
            TunnelType::ListenTcpListenUdp => {
                let listener = TcpListener::bind(config.stream_addr).await?;
                let stream_port = listener.local_addr()?.port();
                debug!("TCP listen at {}", listener.local_addr()?);

                let udp = UdpSocket::bind(config.udp_addr).await?;
                let udp_port = udp.local_addr()?.port();
                debug!("UDP listen at {}", udp.local_addr()?);

                (Endpoints::TcpListener { listener, udp }, stream_port, udp_port)
            }
            TunnelType::DialQuicDialUdp => {
                let endpoint = make_client_endpoint(unspecified_addr(config.stream_addr))?;
                let connection = endpoint.connect(config.stream_addr, "localhost")?.await?;
                let (send, recv) = connection.open_bi().await?;
                debug!("QUIC dial {}", connection.remote_address());

                let udp = dial_udp(config.udp_addr).await?;
                debug!("UDP dial {}", config.udp_addr);

                let (reader, writer) = split_quic(send, recv);
                let endpoints = Endpoints::Dialer {
                    reader,
                    writer,
                    udp,
                    udp_target: config.udp_addr,
                    quic: Some((endpoint, connection)),
                };
                (endpoints, config.stream_addr.port(), config.udp_addr.port())
            }
            TunnelType::DialTcpDialUdp => {
                let tcp = TcpStream::connect(config.stream_addr).await?;
                tcp.set_nodelay(true)?;
                debug!("TCP dial {}", config.stream_addr);

                let udp = dial_udp(config.udp_addr).await?;
                debug!("UDP dial {}", config.udp_addr);

                let (reader, writer) = split_tcp(tcp);
                let endpoints = Endpoints::Dialer {
                    reader,
                    writer,
                    udp,
                    udp_target: config.udp_addr,
                    quic: None,
                };
                (endpoints, config.stream_addr.port(), config.udp_addr.port())
            }
        };

        let (quit_tx, quit_rx) = watch::channel(false);
        Ok(Self {
            tunnel_type: config.tunnel_type,
            stream_port,
            udp_port,
            endpoints: Some(endpoints),
            shared: Rc::new(TunnelShared::new()),
            quit_tx,
            quit_rx,
        })
    }

    /// The chosen ports of the stream side and the UDP side.
    pub fn ports(&self) -> (u16, u16) {
        (self.stream_port, self.udp_port)
    }

    pub fn tunnel_type(&self) -> TunnelType {
        self.tunnel_type
    }

    pub fn status(&self) -> TunnelStatus {
        self.shared.status()
    }

    /// Last measured stream round-trip, zero until the first probe returns.
    pub fn ping_delay(&self) -> Duration {
        Duration::from_nanos(self.shared.ping_nanos.load(Ordering::Relaxed))
    }

    /// Tears the tunnel down. Safe to call any number of times.
    pub fn close(&mut self) {
        self.shared.store_status(TunnelStatus::Closed);
        self.quit_tx.send_replace(true);
        if let Some(endpoints) = self.endpoints.take() {
            if let Endpoints::QuicListener { endpoint, .. } = &endpoints {
                endpoint.close(VarInt::from_u32(0), b"tunnel closed");
            }
            drop(endpoints);
        }
    }

    /// Runs the relay until either direction terminates.
    ///
    /// Listener-side tunnels first await exactly one stream connection, with a
    /// 10 second deadline. Dialer-side tunnels additionally probe the stream
    /// with a `PING` every second and track the round-trip in
    /// [`ping_delay`](Self::ping_delay).
    pub async fn serve(&mut self, hooks: TunnelHooks) -> Result<(), TunnelError> {
        let endpoints = self.endpoints.take().ok_or(TunnelError::NotServeable)?;
        match endpoints {
            Endpoints::QuicListener { endpoint, udp } => {
                let accepted = timeout(FIRST_ACCEPT_TIMEOUT, async {
                    let connecting = endpoint.accept().await.ok_or(TunnelError::EndpointClosed)?;
                    let connection = connecting.await?;
                    let (send, recv) = connection.accept_bi().await?;
                    Ok::<_, TunnelError>((connection, send, recv))
                })
                .await;

                let (connection, send, recv) = match accepted {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(error)) => {
                        self.shared.store_status(TunnelStatus::Failed);
                        return Err(error);
                    }
                    Err(_) => {
                        self.shared.store_status(TunnelStatus::Failed);
                        return Err(TunnelError::AcceptTimeout);
                    }
                };
                debug!("accepted QUIC stream from {}", connection.remote_address());

                let (reader, writer) = split_quic(send, recv);
                self.run_relay(reader, writer, udp, None, hooks).await;
                endpoint.close(VarInt::from_u32(0), b"tunnel finished");
            }
            Endpoints::TcpListener { listener, udp } => {
                let accepted = match timeout(FIRST_ACCEPT_TIMEOUT, listener.accept()).await {
                    Ok(Ok(accepted)) => accepted,
                    Ok(Err(error)) => {
                        self.shared.store_status(TunnelStatus::Failed);
                        return Err(error.into());
                    }
                    Err(_) => {
                        self.shared.store_status(TunnelStatus::Failed);
                        return Err(TunnelError::AcceptTimeout);
                    }
                };
                let (tcp, from) = accepted;
                debug!("accepted TCP connection from {from}");

                let (reader, writer) = split_tcp(tcp);
                self.run_relay(reader, writer, udp, None, hooks).await;
            }
            Endpoints::Dialer {
                reader,
                writer,
                udp,
                udp_target,
                quic,
            } => {
                self.run_relay(reader, writer, udp, Some(udp_target), hooks).await;
                if let Some((endpoint, connection)) = quic {
                    connection.close(VarInt::from_u32(0), b"tunnel finished");
                    endpoint.close(VarInt::from_u32(0), b"");
                }
            }
        }

        Ok(())
    }

    async fn run_relay(
        &self,
        reader: StreamReader,
        writer: StreamWriter,
        udp: UdpSocket,
        dial_target: Option<SocketAddr>,
        hooks: TunnelHooks,
    ) {
        let TunnelHooks {
            read_hook,
            write_hook,
            plugin_loop,
            on_quit,
        } = hooks;

        self.shared.transition(TunnelStatus::Init, TunnelStatus::Connected);

        let writer = Rc::new(Mutex::new(writer));
        let udp = Rc::new(udp);
        let read_hook = SharedHook::new(read_hook);
        let write_hook = SharedHook::new(write_hook);
        let (done_tx, mut done_rx) = mpsc::channel::<&'static str>(4);

        match dial_target {
            None => {
                let peer_table = Rc::new(RefCell::new(PeerTable::new()));
                spawn_local(stream_to_udp_listener(
                    reader,
                    Rc::clone(&writer),
                    Rc::clone(&udp),
                    Rc::clone(&peer_table),
                    read_hook,
                    self.quit_rx.clone(),
                    done_tx.clone(),
                ));
                spawn_local(udp_to_stream_listener(
                    Rc::clone(&udp),
                    Rc::clone(&writer),
                    peer_table,
                    write_hook,
                    self.quit_rx.clone(),
                    done_tx.clone(),
                ));
            }
            Some(target) => {
                let last_ping = Rc::new(Cell::new(Instant::now()));
                spawn_local(ping_sender(
                    Rc::clone(&writer),
                    Rc::clone(&last_ping),
                    self.quit_rx.clone(),
                    done_tx.clone(),
                ));
                spawn_local(stream_to_udp_dialer(
                    reader,
                    Rc::clone(&writer),
                    target,
                    read_hook,
                    write_hook,
                    last_ping,
                    Rc::clone(&self.shared),
                    self.quit_rx.clone(),
                    done_tx.clone(),
                ));
            }
        }

        if let Some(plugin_loop) = plugin_loop {
            let io = PluginIo::new(Rc::clone(&writer), Rc::clone(&udp), self.quit_rx.clone());
            spawn_local(plugin_loop(io));
        }
        drop(done_tx);

        if let Some(reason) = done_rx.recv().await {
            debug!("tunnel task finished first: {reason}");
        }

        self.shared.transition(TunnelStatus::Connected, TunnelStatus::Failed);
        self.quit_tx.send_replace(true);
        if let Some(on_quit) = on_quit {
            on_quit();
        }

        let _ = writer.lock().await.shutdown().await;
    }
}

fn unspecified_addr(peer: SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    }
}

async fn dial_udp(target: SocketAddr) -> io::Result<UdpSocket> {
    let udp = UdpSocket::bind(unspecified_addr(target)).await?;
    udp.connect(target).await?;
    Ok(udp)
}

/// `peer_id || body` split; an empty record has no destination and is dropped.
fn split_record(record: &[u8]) -> Option<(u8, &[u8])> {
    record.split_first().map(|(&id, body)| (id, body))
}

/// Frames a record and writes it to the stream. An oversized record is logged
/// and dropped without failing the direction.
async fn write_frame(writer: &Rc<Mutex<StreamWriter>>, frame_type: FrameType, payload: &[u8]) -> io::Result<()> {
    let frame = match encode_frame(frame_type, payload) {
        Ok(frame) => frame,
        Err(error) => {
            warn!("cannot frame record: {error}");
            return Ok(());
        }
    };

    let result = writer.lock().await.write_all(&frame).await;
    if let Err(error) = &result {
        warn!("write to tunnel stream error: {error}");
    }
    result
}

async fn stream_to_udp_listener(
    mut reader: StreamReader,
    writer: Rc<Mutex<StreamWriter>>,
    udp: Rc<UdpSocket>,
    peer_table: Rc<RefCell<PeerTable>>,
    read_hook: SharedHook,
    mut quit: watch::Receiver<bool>,
    done: mpsc::Sender<&'static str>,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; TRANS_BUF_SIZE];

    'relay: loop {
        let count = tokio::select! {
            _ = quit.changed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("tunnel stream finished");
                    break;
                }
                Ok(count) => count,
                Err(error) => {
                    warn!("read from tunnel stream error: {error}");
                    break;
                }
            },
        };

        parser.append(&buf[..count]);
        while parser.parse() {
            match parser.frame_type() {
                Some(FrameType::Data) => match read_hook.apply(parser.data()) {
                    HookAction::Forward(record) => {
                        let Some((id, body)) = split_record(&record) else { continue };
                        let addr = peer_table.borrow().addr_of(id);
                        match addr {
                            Some(addr) => {
                                if let Err(error) = udp.send_to(body, addr).await {
                                    warn!("send data to UDP peer {addr} error: {error}");
                                }
                            }
                            None => debug!("record for unassigned peer id {id} dropped"),
                        }
                    }
                    HookAction::Reply(record) => {
                        if write_frame(&writer, FrameType::Data, &record).await.is_err() {
                            break 'relay;
                        }
                    }
                    HookAction::Drop => {}
                },
                Some(FrameType::Ping) => {
                    if write_frame(&writer, FrameType::Ping, &[]).await.is_err() {
                        break 'relay;
                    }
                }
                other => debug!("unexpected frame on tunnel stream: {other:?}"),
            }
        }
    }

    debug!("average compression ratio {:.3}", parser.compression_ratio());
    let _ = done.try_send("stream to UDP");
}

async fn udp_to_stream_listener(
    udp: Rc<UdpSocket>,
    writer: Rc<Mutex<StreamWriter>>,
    peer_table: Rc<RefCell<PeerTable>>,
    write_hook: SharedHook,
    mut quit: watch::Receiver<bool>,
    done: mpsc::Sender<&'static str>,
) {
    // buf[0] is reserved for the peer id so the record is framed in place.
    let mut buf = [0u8; MAX_PAYLOAD];

    'relay: loop {
        let (count, from) = tokio::select! {
            _ = quit.changed() => break,
            result = udp.recv_from(&mut buf[1..]) => match result {
                Ok(received) => received,
                Err(error) => {
                    warn!("read from UDP endpoint error: {error}");
                    break;
                }
            },
        };

        let (id, is_new) = {
            let mut table = peer_table.borrow_mut();
            let known = table.len();
            match table.id_for(from) {
                Some(id) => (id, id as usize == known),
                None => continue,
            }
        };
        if is_new {
            debug!("new UDP peer {from} assigned id {id}");
        }

        buf[0] = id;
        match write_hook.apply(&buf[..count + 1]) {
            HookAction::Forward(record) => {
                if write_frame(&writer, FrameType::Data, &record).await.is_err() {
                    break 'relay;
                }
            }
            HookAction::Reply(record) => {
                let Some((id, body)) = split_record(&record) else { continue };
                let addr = peer_table.borrow().addr_of(id);
                if let Some(addr) = addr {
                    if let Err(error) = udp.send_to(body, addr).await {
                        warn!("send reply to UDP peer {addr} error: {error}");
                    }
                }
            }
            HookAction::Drop => {}
        }
    }

    let _ = done.try_send("UDP to stream");
}

#[allow(clippy::too_many_arguments)]
async fn stream_to_udp_dialer(
    mut reader: StreamReader,
    writer: Rc<Mutex<StreamWriter>>,
    target: SocketAddr,
    read_hook: SharedHook,
    write_hook: SharedHook,
    last_ping: Rc<Cell<Instant>>,
    shared: Rc<TunnelShared>,
    mut quit: watch::Receiver<bool>,
    done: mpsc::Sender<&'static str>,
) {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; TRANS_BUF_SIZE];
    let mut clients: HashMap<u8, mpsc::Sender<Vec<u8>>> = HashMap::new();

    'relay: loop {
        let count = tokio::select! {
            _ = quit.changed() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!("tunnel stream finished");
                    break;
                }
                Ok(count) => count,
                Err(error) => {
                    warn!("read from tunnel stream error: {error}");
                    break;
                }
            },
        };

        parser.append(&buf[..count]);
        while parser.parse() {
            match parser.frame_type() {
                Some(FrameType::Data) => match read_hook.apply(parser.data()) {
                    HookAction::Forward(record) => {
                        let Some((id, body)) = split_record(&record) else { continue };
                        let sender = match clients.get(&id) {
                            Some(sender) => sender.clone(),
                            None => {
                                let spawned = spawn_virtual_client(
                                    id,
                                    target,
                                    Rc::clone(&writer),
                                    write_hook.clone(),
                                    quit.clone(),
                                )
                                .await;
                                match spawned {
                                    Ok(sender) => {
                                        clients.insert(id, sender.clone());
                                        sender
                                    }
                                    Err(error) => {
                                        warn!("virtual UDP client for peer {id} failed: {error}");
                                        continue;
                                    }
                                }
                            }
                        };

                        if sender.send(body.to_vec()).await.is_err() {
                            debug!("virtual UDP client for peer {id} is gone, record dropped");
                            clients.remove(&id);
                        }
                    }
                    HookAction::Reply(record) => {
                        if write_frame(&writer, FrameType::Data, &record).await.is_err() {
                            break 'relay;
                        }
                    }
                    HookAction::Drop => {}
                },
                Some(FrameType::Ping) => {
                    let delay = last_ping.get().elapsed();
                    shared.ping_nanos.store(delay.as_nanos() as u64, Ordering::Relaxed);
                    debug!("tunnel delay {:.2} ms", delay.as_secs_f64() * 1000.0);
                }
                other => debug!("unexpected frame on tunnel stream: {other:?}"),
            }
        }
    }

    let _ = done.try_send("stream to UDP");
}

/// Opens the private connected socket of one dialer-side peer id and spawns
/// its task pair: one draining records from the stream, one carrying the local
/// service's replies back.
async fn spawn_virtual_client(
    id: u8,
    target: SocketAddr,
    writer: Rc<Mutex<StreamWriter>>,
    write_hook: SharedHook,
    quit: watch::Receiver<bool>,
) -> io::Result<mpsc::Sender<Vec<u8>>> {
    let socket = Rc::new(dial_udp(target).await?);
    debug!("virtual UDP client for peer {id} bound at {}", socket.local_addr()?);

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    {
        let socket = Rc::clone(&socket);
        let mut quit = quit.clone();
        spawn_local(async move {
            loop {
                let body = tokio::select! {
                    _ = quit.changed() => break,
                    body = rx.recv() => match body {
                        Some(body) => body,
                        None => break,
                    },
                };

                if let Err(error) = socket.send(&body).await {
                    warn!("send to virtual UDP client {id} error: {error}");
                }
            }
        });
    }

    {
        let socket = Rc::clone(&socket);
        let mut quit = quit.clone();
        spawn_local(async move {
            let mut buf = [0u8; MAX_PAYLOAD];
            buf[0] = id;

            loop {
                let count = tokio::select! {
                    _ = quit.changed() => break,
                    result = socket.recv(&mut buf[1..]) => match result {
                        Ok(count) => count,
                        Err(error) => {
                            debug!("read from virtual UDP client {id} error: {error}");
                            sleep(UDP_RETRY_PAUSE).await;
                            continue;
                        }
                    },
                };

                match write_hook.apply(&buf[..count + 1]) {
                    HookAction::Forward(record) => {
                        if write_frame(&writer, FrameType::Data, &record).await.is_err() {
                            break;
                        }
                    }
                    HookAction::Reply(record) => {
                        let Some((_, body)) = split_record(&record) else { continue };
                        if let Err(error) = socket.send(body).await {
                            warn!("send reply to virtual UDP client {id} error: {error}");
                        }
                    }
                    HookAction::Drop => {}
                }
            }
        });
    }

    Ok(tx)
}

async fn ping_sender(
    writer: Rc<Mutex<StreamWriter>>,
    last_ping: Rc<Cell<Instant>>,
    mut quit: watch::Receiver<bool>,
    done: mpsc::Sender<&'static str>,
) {
    loop {
        last_ping.set(Instant::now());
        if write_frame(&writer, FrameType::Ping, &[]).await.is_err() {
            warn!("send PING probe failed");
            break;
        }

        tokio::select! {
            _ = quit.changed() => break,
            _ = sleep(PING_INTERVAL) => {}
        }
    }

    let _ = done.try_send("ping sender");
}
