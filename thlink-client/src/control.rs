//! Broker dialog and tunnel bring-up.
//!
//! Every broker command is one short-lived TCP connection: dial, write one
//! frame, read at most one frame back. All three steps run under a 500 ms
//! deadline; latency probes that miss it report a one second sentinel.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use thlink_core::{Tunnel, TunnelConfig, TunnelError, TunnelHooks, TunnelStatus, TunnelType};
use thlink_proto::{
    command::{
        parse_address_list, parse_version, StreamProtocol, TunnelRequest, TunnelResponse, TunnelScope,
    },
    encode_frame, FrameParser, FrameType, TRANS_BUF_SIZE,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{lookup_host, TcpStream},
    time::{timeout, Instant},
};
use tracing::debug;

/// Deadline of each step of a broker command.
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Reported by latency probes that failed or timed out.
pub const PING_FAILED_SENTINEL: Duration = Duration::from_secs(1);

/// Probes sent per broker when measuring delay.
const PING_PROBES: u32 = 5;

/// Client-side control plane errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid {0} response from broker")]
    InvalidResponse(&'static str),
    #[error("broker replied with an invalid port pair")]
    TunnelRefused,
    #[error("cannot resolve broker host {0}")]
    UnresolvedHost(String),
    #[error("no such plugin: {0}")]
    NoSuchPlugin(u32),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Dials the broker, sends one frame, reads one frame back.
async fn command(server: &str, frame_type: FrameType, payload: &[u8]) -> io::Result<(Option<FrameType>, Vec<u8>)> {
    let timed_out = || io::Error::new(io::ErrorKind::TimedOut, "broker command timed out");

    let mut conn = timeout(COMMAND_TIMEOUT, TcpStream::connect(server)).await.map_err(|_| timed_out())??;
    let frame =
        encode_frame(frame_type, payload).map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    timeout(COMMAND_TIMEOUT, conn.write_all(&frame)).await.map_err(|_| timed_out())??;

    let mut parser = FrameParser::new();
    let mut buf = [0u8; TRANS_BUF_SIZE];
    loop {
        let count = timeout(COMMAND_TIMEOUT, conn.read(&mut buf)).await.map_err(|_| timed_out())??;
        if count == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "broker closed without a reply"));
        }

        parser.append(&buf[..count]);
        if parser.parse() {
            return Ok((parser.frame_type(), parser.data().to_vec()));
        }
    }
}

/// Measures the round-trip of one `PING` command.
pub async fn ping(server: &str) -> Duration {
    let start = Instant::now();
    match command(server, FrameType::Ping, &[]).await {
        Ok((Some(FrameType::Ping), _)) => start.elapsed(),
        _ => PING_FAILED_SENTINEL,
    }
}

/// Mean of five probes.
pub async fn average_ping(server: &str) -> Duration {
    let mut total = Duration::ZERO;
    for _ in 0..PING_PROBES {
        total += ping(server).await;
    }
    total / PING_PROBES
}

/// Asks a broker for its tunnel compatibility code and version string.
pub async fn broker_version(server: &str) -> Result<(u8, String), ClientError> {
    match command(server, FrameType::Version, &[]).await? {
        (Some(FrameType::Version), data) => {
            parse_version(&data).map_err(|_| ClientError::InvalidResponse("VERSION"))
        }
        _ => Err(ClientError::InvalidResponse("VERSION")),
    }
}

/// Surveys every broker the given one knows about, probing each five times.
pub async fn net_broker_delay(server: &str) -> Result<HashMap<String, Duration>, ClientError> {
    let (frame_type, data) = command(server, FrameType::NetInfo, &[0, 0]).await?;
    if frame_type != Some(FrameType::NetInfo) {
        return Err(ClientError::InvalidResponse("NET_INFO"));
    }

    let mut delays = HashMap::new();
    for address in parse_address_list(&data) {
        debug!("probing broker {address}");
        let delay = average_ping(&address).await;
        delays.insert(address, delay);
    }

    Ok(delays)
}

/// A connected tunnel client.
pub struct Client {
    server_ip: IpAddr,
    udp_port: u16,
    tunnel: Tunnel,
}

/// Requests a UDP tunnel from the broker and dials its stream side.
pub async fn connect(local_port: u16, server: &str, stream_protocol: StreamProtocol) -> Result<Client, ClientError> {
    let request = TunnelRequest {
        scope: TunnelScope::Udp,
        stream_protocol,
    };
    let (frame_type, data) = command(server, FrameType::Tunnel, &request.encode()).await?;
    if frame_type != Some(FrameType::Tunnel) {
        return Err(ClientError::InvalidResponse("TUNNEL"));
    }

    let response = TunnelResponse::parse(&data).map_err(|_| ClientError::InvalidResponse("TUNNEL"))?;
    if response.is_failure() {
        return Err(ClientError::TunnelRefused);
    }

    let server_ip = resolve_ip(server).await?;
    let tunnel_type = match stream_protocol {
        StreamProtocol::Quic => TunnelType::DialQuicDialUdp,
        StreamProtocol::Tcp => TunnelType::DialTcpDialUdp,
    };

    let tunnel = Tunnel::new(TunnelConfig {
        tunnel_type,
        stream_addr: SocketAddr::new(server_ip, response.stream_port),
        udp_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_port),
    })
    .await?;

    Ok(Client {
        server_ip,
        udp_port: response.udp_port,
        tunnel,
    })
}

async fn resolve_ip(server: &str) -> Result<IpAddr, ClientError> {
    let mut addresses = lookup_host(server).await?;
    addresses
        .next()
        .map(|address| address.ip())
        .ok_or_else(|| ClientError::UnresolvedHost(server.to_string()))
}

impl Client {
    /// Resolved IP of the broker, for display.
    pub fn server_ip(&self) -> IpAddr {
        self.server_ip
    }

    /// Public UDP port remote peers should dial.
    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn status(&self) -> TunnelStatus {
        self.tunnel.status()
    }

    pub fn ping_delay(&self) -> Duration {
        self.tunnel.ping_delay()
    }

    /// Drives the tunnel until it terminates.
    pub async fn serve(&mut self, hooks: TunnelHooks) -> Result<(), TunnelError> {
        self.tunnel.serve(hooks).await
    }

    /// Tears the tunnel down. Safe to call any number of times.
    pub fn close(&mut self) {
        self.tunnel.close();
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        net::{TcpListener, UdpSocket},
        task::{spawn_local, LocalSet},
    };

    use super::*;

    #[tokio::test]
    async fn ping_measures_a_responding_broker() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                spawn_local(async move {
                    let (mut conn, _) = listener.accept().await.unwrap();
                    let mut buf = [0u8; 64];
                    let _ = conn.read(&mut buf).await.unwrap();
                    conn.write_all(&encode_frame(FrameType::Ping, &[]).unwrap()).await.unwrap();
                });

                let delay = ping(&addr.to_string()).await;
                assert!(delay < PING_FAILED_SENTINEL);
            })
            .await;
    }

    #[tokio::test]
    async fn ping_failure_reports_the_sentinel() {
        // a port nothing listens on refuses immediately
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert_eq!(ping(&addr.to_string()).await, PING_FAILED_SENTINEL);
    }

    #[tokio::test]
    async fn wrong_reply_type_reports_the_sentinel() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                spawn_local(async move {
                    let (mut conn, _) = listener.accept().await.unwrap();
                    let mut buf = [0u8; 64];
                    let _ = conn.read(&mut buf).await.unwrap();
                    conn.write_all(&encode_frame(FrameType::Version, &[2]).unwrap()).await.unwrap();
                });

                assert_eq!(ping(&addr.to_string()).await, PING_FAILED_SENTINEL);
            })
            .await;
    }

    /// A fake broker that hands out the ports of a real listener-side tunnel.
    async fn spawn_tunnel_broker() -> (SocketAddr, u16) {
        let mut tunnel = Tunnel::new(TunnelConfig {
            tunnel_type: TunnelType::ListenTcpListenUdp,
            stream_addr: "127.0.0.1:0".parse().unwrap(),
            udp_addr: "127.0.0.1:0".parse().unwrap(),
        })
        .await
        .unwrap();
        let (stream_port, udp_port) = tunnel.ports();
        spawn_local(async move {
            let _ = tunnel.serve(TunnelHooks::new()).await;
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        spawn_local(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf).await.unwrap();
            let response = TunnelResponse { stream_port, udp_port };
            conn.write_all(&encode_frame(FrameType::Tunnel, &response.encode()).unwrap())
                .await
                .unwrap();
        });

        (addr, udp_port)
    }

    #[tokio::test]
    async fn connect_brings_up_a_working_tunnel() {
        LocalSet::new()
            .run_until(async {
                // stand-in for the local service the client exposes
                let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                let service_port = service.local_addr().unwrap().port();

                let (broker_addr, udp_port) = spawn_tunnel_broker().await;
                let mut client = connect(service_port, &broker_addr.to_string(), StreamProtocol::Tcp)
                    .await
                    .unwrap();
                assert_eq!(client.udp_port(), udp_port);

                spawn_local(async move {
                    let _ = client.serve(TunnelHooks::new()).await;
                });

                let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
                peer.connect(format!("127.0.0.1:{udp_port}")).await.unwrap();

                let mut buf = [0u8; 16];
                let count = timeout(Duration::from_secs(5), async {
                    loop {
                        peer.send(b"hello").await.unwrap();
                        match timeout(Duration::from_millis(200), service.recv_from(&mut buf)).await {
                            Ok(result) => break result.unwrap().0,
                            Err(_) => continue,
                        }
                    }
                })
                .await
                .unwrap();
                assert_eq!(&buf[..count], b"hello");
            })
            .await;
    }

    #[tokio::test]
    async fn connect_rejects_a_zero_port_pair() {
        LocalSet::new()
            .run_until(async {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = listener.local_addr().unwrap();
                spawn_local(async move {
                    let (mut conn, _) = listener.accept().await.unwrap();
                    let mut buf = [0u8; 64];
                    let _ = conn.read(&mut buf).await.unwrap();
                    conn.write_all(&encode_frame(FrameType::Tunnel, &TunnelResponse::FAILED.encode()).unwrap())
                        .await
                        .unwrap();
                });

                let result = connect(10080, &addr.to_string(), StreamProtocol::Tcp).await;
                assert!(matches!(result, Err(ClientError::TunnelRefused)));
            })
            .await;
    }
}
