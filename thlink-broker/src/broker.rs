//! The broker control plane: a TCP command interface that provisions tunnels
//! and keeps the peer accounting.
//!
//! Every command connection carries exactly one frame: the broker reads once,
//! dispatches, replies at most once and closes. Tunnel provisioning binds the
//! stream-side listener to the requesting client's IP, which keeps other hosts
//! from claiming a freshly opened tunnel.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    rc::Rc,
};

use thlink_core::endpoint::make_server_endpoint;
use thlink_core::{Tunnel, TunnelConfig, TunnelHooks, TunnelType};
use thlink_proto::{
    command::{encode_peer_count, encode_version, StreamProtocol, TunnelRequest, TunnelResponse, TunnelScope},
    encode_frame, FrameParser, FrameType, CMD_BUF_SIZE, TUNNEL_VERSION,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::spawn_local,
    time::{timeout, Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::mesh;

/// How long a freshly provisioned tunnel waits for its owner to connect.
const TUNNEL_CLAIM_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state of one broker instance.
pub struct BrokerState {
    /// Port of the command interface, announced through the mesh.
    pub(crate) self_port: u16,
    /// Statically configured upstream broker, if any.
    pub(crate) upper_addr: Option<String>,
    /// Sensed remote address of the upstream link, set on first contact.
    pub(crate) upper_observed: RefCell<Option<String>>,
    /// Consecutive failed announcements to the upstream broker.
    pub(crate) upper_retry: Cell<u32>,
    /// Active tunnels, stream-side port to UDP-side port.
    pub(crate) peers: RefCell<HashMap<u16, u16>>,
    /// Brokers that announced themselves directly, with their last-seen time.
    pub(crate) new_brokers: RefCell<HashMap<String, Instant>>,
    /// Brokers learned through gossip.
    pub(crate) net_brokers: RefCell<HashMap<String, Instant>>,
}

impl BrokerState {
    pub(crate) fn new(self_port: u16, upper_addr: Option<String>) -> Self {
        Self {
            self_port,
            upper_addr,
            upper_observed: RefCell::new(None),
            upper_retry: Cell::new(0),
            peers: RefCell::new(HashMap::new()),
            new_brokers: RefCell::new(HashMap::new()),
            net_brokers: RefCell::new(HashMap::new()),
        }
    }
}

/// A bound broker, ready to serve its command interface.
pub struct Broker {
    listener: TcpListener,
    state: Rc<BrokerState>,
}

impl Broker {
    /// Binds the command interface. The port actually bound (not the one
    /// requested) is what gets announced to the federation.
    pub async fn bind(listen_addr: SocketAddr, upper_addr: Option<String>) -> io::Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        let self_port = listener.local_addr()?.port();
        info!("start TCP command interface at {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: Rc::new(BrokerState::new(self_port, upper_addr)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves commands forever. Also drives the mesh gossip task.
    pub async fn run(self) -> io::Result<()> {
        spawn_local(mesh::gossip_loop(Rc::clone(&self.state)));

        loop {
            let (mut conn, from) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!("TCP listen error: {error}");
                    continue;
                }
            };

            let mut buf = [0u8; CMD_BUF_SIZE];
            let count = match conn.read(&mut buf).await {
                Ok(count) => count,
                Err(error) => {
                    error!("TCP read failed: {error}");
                    continue;
                }
            };

            if count >= CMD_BUF_SIZE {
                warn!("command data too long");
                continue;
            }

            let mut parser = FrameParser::new();
            parser.append(&buf[..count]);
            if !parser.parse() {
                warn!("invalid command");
                continue;
            }

            let state = Rc::clone(&self.state);
            spawn_local(async move {
                dispatch(state, &mut conn, from, parser).await;
            });
        }
    }
}

async fn dispatch(state: Rc<BrokerState>, conn: &mut TcpStream, from: SocketAddr, parser: FrameParser) {
    match parser.frame_type() {
        Some(FrameType::Ping) => {
            reply(conn, FrameType::Ping, &[]).await;
        }
        Some(FrameType::Version) => {
            reply(conn, FrameType::Version, &encode_version(TUNNEL_VERSION, env!("CARGO_PKG_VERSION"))).await;
        }
        Some(FrameType::BrokerInfo) => {
            let count = state.peers.borrow().len() as u64;
            reply(conn, FrameType::BrokerInfo, &encode_peer_count(count)).await;
        }
        Some(FrameType::Tunnel) => {
            let response = match TunnelRequest::parse(parser.data()) {
                Ok(request) => {
                    info!("new {:?} tunnel for {from}", request.scope);
                    match new_tunnel(&state, from.ip(), request).await {
                        Ok(response) => response,
                        Err(error) => {
                            error!("failed to build new tunnel: {error}");
                            TunnelResponse::FAILED
                        }
                    }
                }
                Err(error) => {
                    warn!("invalid tunnel request: {error}");
                    TunnelResponse::FAILED
                }
            };

            reply(conn, FrameType::Tunnel, &response.encode()).await;
        }
        Some(FrameType::NetInfo) => {
            let payload = parser.data();
            if payload.len() == 2 {
                let requester_port = u16::from_be_bytes([payload[0], payload[1]]);
                let requester = mesh::join_host_port(from.ip(), requester_port);
                debug!("net info command from {requester}");
                let data = mesh::build_net_info(&state, &requester);
                reply(conn, FrameType::NetInfo, &data).await;
            }
        }
        Some(FrameType::NetInfoUpdate) => {
            mesh::handle_update(&state, from.ip(), parser.data()).await;
        }
        other => warn!("invalid command type {other:?}"),
    }
}

async fn reply(conn: &mut TcpStream, frame_type: FrameType, payload: &[u8]) {
    let frame = match encode_frame(frame_type, payload) {
        Ok(frame) => frame,
        Err(error) => {
            error!("cannot frame response: {error}");
            return;
        }
    };

    if let Err(error) = conn.write_all(&frame).await {
        error!("send response failed: {error}");
    }
}

async fn new_tunnel(state: &Rc<BrokerState>, client_ip: IpAddr, request: TunnelRequest) -> io::Result<TunnelResponse> {
    match request.scope {
        TunnelScope::Udp => new_udp_tunnel(state, client_ip, request.stream_protocol).await,
        TunnelScope::Tcp => new_tcp_tunnel(state, client_ip).await,
    }
}

/// Provisions a paired stream/UDP tunnel and serves it in the background.
async fn new_udp_tunnel(
    state: &Rc<BrokerState>,
    client_ip: IpAddr,
    stream_protocol: StreamProtocol,
) -> io::Result<TunnelResponse> {
    let tunnel_type = match stream_protocol {
        StreamProtocol::Quic => TunnelType::ListenQuicListenUdp,
        StreamProtocol::Tcp => TunnelType::ListenTcpListenUdp,
    };

    let mut tunnel = Tunnel::new(TunnelConfig {
        tunnel_type,
        stream_addr: SocketAddr::new(client_ip, 0),
        udp_addr: "0.0.0.0:0".parse().unwrap(),
    })
    .await
    .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;

    let (stream_port, udp_port) = tunnel.ports();
    state.peers.borrow_mut().insert(stream_port, udp_port);
    info!("new udp peer {stream_port}-{udp_port}");

    let state = Rc::clone(state);
    spawn_local(async move {
        if let Err(error) = tunnel.serve(TunnelHooks::new()).await {
            error!("tunnel serve error: {error}");
        }
        state.peers.borrow_mut().remove(&stream_port);
        info!("end udp peer {stream_port}-{udp_port}");
    });

    Ok(TunnelResponse { stream_port, udp_port })
}

/// Provisions a TCP tunnel: a QUIC stream leg for the client paired with a
/// public TCP listener, relayed as a raw byte pipe.
async fn new_tcp_tunnel(state: &Rc<BrokerState>, client_ip: IpAddr) -> io::Result<TunnelResponse> {
    let endpoint = make_server_endpoint(SocketAddr::new(client_ip, 0))?;
    let stream_port = endpoint.local_addr()?.port();

    let serve_listener = match TcpListener::bind("0.0.0.0:0").await {
        Ok(listener) => listener,
        Err(error) => {
            endpoint.close(0u32.into(), b"");
            return Err(error);
        }
    };
    let serve_port = serve_listener.local_addr()?.port();

    state.peers.borrow_mut().insert(stream_port, serve_port);
    info!("new tcp peer {stream_port}-{serve_port}");

    let state = Rc::clone(state);
    spawn_local(async move {
        if let Err(error) = serve_tcp_tunnel(endpoint, serve_listener).await {
            error!("tcp tunnel error: {error}");
        }
        state.peers.borrow_mut().remove(&stream_port);
        info!("end tcp peer {stream_port}-{serve_port}");
    });

    Ok(TunnelResponse {
        stream_port,
        udp_port: serve_port,
    })
}

async fn serve_tcp_tunnel(endpoint: quinn::Endpoint, serve_listener: TcpListener) -> io::Result<()> {
    let accepted = timeout(TUNNEL_CLAIM_TIMEOUT, async {
        let connecting = endpoint
            .accept()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "stream endpoint closed"))?;
        let connection = connecting.await?;
        let stream = connection.accept_bi().await?;
        Ok::<_, io::Error>((connection, stream))
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "client did not claim the tunnel"))??;
    let (_connection, (mut q_send, mut q_recv)) = accepted;

    let (mut tcp, from) = serve_listener.accept().await?;
    info!("remote connected from {from}");
    tcp.set_nodelay(true)?;
    let (mut tcp_read, mut tcp_write) = tcp.split();

    // either direction ending ends the tunnel
    let result = tokio::select! {
        result = tokio::io::copy(&mut q_recv, &mut tcp_write) => result,
        result = tokio::io::copy(&mut tcp_read, &mut q_send) => result,
    };
    endpoint.close(0u32.into(), b"tunnel finished");

    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use thlink_proto::command::{parse_address_list, parse_peer_count, parse_version};
    use thlink_proto::TRANS_BUF_SIZE;
    use tokio::task::LocalSet;

    use super::*;

    async fn spawn_broker(upper: Option<String>) -> SocketAddr {
        let broker = Broker::bind("127.0.0.1:0".parse().unwrap(), upper).await.unwrap();
        let addr = broker.local_addr().unwrap();
        spawn_local(async move {
            let _ = broker.run().await;
        });
        addr
    }

    async fn send_command(addr: SocketAddr, frame: &[u8]) -> Option<(Option<FrameType>, Vec<u8>)> {
        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(frame).await.unwrap();

        let mut parser = FrameParser::new();
        let mut buf = [0u8; TRANS_BUF_SIZE];
        loop {
            let count = match timeout(Duration::from_secs(1), conn.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => return None,
                Ok(Ok(count)) => count,
                Ok(Err(_)) => return None,
            };
            parser.append(&buf[..count]);
            if parser.parse() {
                return Some((parser.frame_type(), parser.data().to_vec()));
            }
        }
    }

    #[tokio::test]
    async fn ping_is_echoed() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_broker(None).await;
                let reply = send_command(addr, &[0x01, 0x00, 0x00]).await.unwrap();
                assert_eq!(reply, (Some(FrameType::Ping), Vec::new()));
            })
            .await;
    }

    #[tokio::test]
    async fn long_command_is_dropped_without_reply() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_broker(None).await;
                let long: Vec<u8> = (0..=CMD_BUF_SIZE as u8).collect();
                assert_eq!(send_command(addr, &long).await, None);

                // the command interface keeps serving afterwards
                let reply = send_command(addr, &encode_frame(FrameType::Ping, &[]).unwrap()).await.unwrap();
                assert_eq!(reply.0, Some(FrameType::Ping));
            })
            .await;
    }

    #[tokio::test]
    async fn version_reports_tunnel_compatibility_code() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_broker(None).await;
                let reply = send_command(addr, &encode_frame(FrameType::Version, &[]).unwrap()).await.unwrap();
                assert_eq!(reply.0, Some(FrameType::Version));

                let (code, version) = parse_version(&reply.1).unwrap();
                assert_eq!(code, TUNNEL_VERSION);
                assert_eq!(version, env!("CARGO_PKG_VERSION"));
            })
            .await;
    }

    #[tokio::test]
    async fn tunnel_request_allocates_ports_and_counts_peers() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_broker(None).await;

                let reply = send_command(addr, &encode_frame(FrameType::BrokerInfo, &[]).unwrap()).await.unwrap();
                assert_eq!(reply, (Some(FrameType::BrokerInfo), encode_peer_count(0).to_vec()));

                let reply = send_command(addr, &encode_frame(FrameType::Tunnel, &[b'u', b't']).unwrap()).await.unwrap();
                assert_eq!(reply.0, Some(FrameType::Tunnel));
                let response = TunnelResponse::parse(&reply.1).unwrap();
                assert!(!response.is_failure());

                let reply = send_command(addr, &encode_frame(FrameType::BrokerInfo, &[]).unwrap()).await.unwrap();
                assert_eq!(parse_peer_count(&reply.1).unwrap(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn malformed_tunnel_request_reports_failure() {
        LocalSet::new()
            .run_until(async {
                let addr = spawn_broker(None).await;
                let reply = send_command(addr, &encode_frame(FrameType::Tunnel, &[b'x']).unwrap()).await.unwrap();
                let response = TunnelResponse::parse(&reply.1).unwrap();
                assert!(response.is_failure());
            })
            .await;
    }

    #[tokio::test]
    async fn federated_brokers_learn_each_other() {
        LocalSet::new()
            .run_until(async {
                let upper = spawn_broker(None).await;
                let lower = spawn_broker(Some(upper.to_string())).await;

                // one gossip round is enough for the handshake
                tokio::time::sleep(Duration::from_millis(500)).await;

                let reply = send_command(upper, &encode_frame(FrameType::NetInfo, &[0, 0]).unwrap()).await.unwrap();
                assert_eq!(reply.0, Some(FrameType::NetInfo));
                let known = parse_address_list(&reply.1);
                assert!(known.contains(&lower.to_string()), "{known:?} should contain {lower}");

                let reply = send_command(lower, &encode_frame(FrameType::NetInfo, &[0, 0]).unwrap()).await.unwrap();
                let known = parse_address_list(&reply.1);
                assert!(known.contains(&upper.to_string()), "{known:?} should contain {upper}");
            })
            .await;
    }
}
