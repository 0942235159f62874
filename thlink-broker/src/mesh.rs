//! Broker federation membership.
//!
//! Each broker knows its 1-hop neighbours (brokers that announced themselves
//! directly) and N-hop brokers (learned through gossip). A broker with a
//! configured upstream announces itself there every second; entries that go
//! unrefreshed for ten seconds are evicted and their removal gossiped so the
//! whole connected component converges.

use std::{io, net::IpAddr, process::exit, rc::Rc};

use thlink_proto::{
    command::{encode_address_list, encode_route, parse_address_list, NetInfoUpdate, RouteRecord},
    encode_frame, FrameParser, FrameType, TRANS_BUF_SIZE,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout, Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerState;

/// Gossip wake-up interval.
const GOSSIP_INTERVAL: Duration = Duration::from_secs(1);

/// Dial deadline for any mesh connection.
const MESH_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// A 1-hop broker unrefreshed this long is stale.
const BROKER_STALE_AFTER: Duration = Duration::from_secs(10);

/// Formats an address the way it travels in gossip payloads.
pub fn join_host_port(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{ip}:{port}"),
        IpAddr::V6(ip) => format!("[{ip}]:{port}"),
    }
}

/// The periodic mesh task: announce upstream, then evict and gossip stale
/// neighbours.
pub async fn gossip_loop(state: Rc<BrokerState>) {
    loop {
        if let Some(upper_addr) = state.upper_addr.clone() {
            announce_upper(&state, &upper_addr).await;
        }

        evict_stale(&state).await;

        sleep(GOSSIP_INTERVAL).await;
    }
}

/// Builds a `NET_INFO` reply: 1-hop brokers except the requester, then N-hop
/// brokers, then the upstream address.
pub fn build_net_info(state: &BrokerState, requester: &str) -> Vec<u8> {
    let mut addresses: Vec<String> = state
        .new_brokers
        .borrow()
        .keys()
        .filter(|address| address.as_str() != requester)
        .cloned()
        .collect();
    addresses.extend(state.net_brokers.borrow().keys().cloned());
    if let Some(upper) = state.upper_observed.borrow().as_ref() {
        addresses.push(upper.clone());
    }

    encode_address_list(addresses.iter().map(String::as_str))
}

async fn announce_upper(state: &Rc<BrokerState>, upper_addr: &str) {
    let payload = state.self_port.to_be_bytes();

    match send_frame(upper_addr, FrameType::NetInfoUpdate, &payload).await {
        Ok(observed) => {
            let first_contact = state.upper_observed.borrow().is_none();
            if first_contact {
                let observed = observed.to_string();
                info!("upper broker connected {observed}");
                *state.upper_observed.borrow_mut() = Some(observed);
                state.upper_retry.set(0);

                sync_upper(state, upper_addr).await;
            }
        }
        Err(error) => {
            // an upstream that was never reachable is a configuration error
            if state.upper_observed.borrow().is_none() {
                error!("upper broker connect error: {error}");
                exit(1);
            }

            state.upper_retry.set(state.upper_retry.get() + 1);
            error!(retry = state.upper_retry.get(), "upper broker connect error: {error}");
        }
    }
}

/// First-contact sync: asks the upstream for its full broker list and seeds
/// the N-hop map from it.
async fn sync_upper(state: &Rc<BrokerState>, upper_addr: &str) {
    info!("sync brokers in thlink network");

    let result = async {
        let mut conn = dial(upper_addr).await?;
        let frame = encode_frame(FrameType::NetInfo, &state.self_port.to_be_bytes())
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
        conn.write_all(&frame).await?;

        let mut parser = FrameParser::new();
        let mut buf = [0u8; TRANS_BUF_SIZE];
        loop {
            let count = conn.read(&mut buf).await?;
            if count == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-reply"));
            }
            parser.append(&buf[..count]);
            if parser.parse() {
                break;
            }
        }
        if parser.frame_type() != Some(FrameType::NetInfo) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "unexpected reply type"));
        }

        Ok::<_, io::Error>(parse_address_list(parser.data()))
    }
    .await;

    match result {
        Ok(addresses) => {
            let now = Instant::now();
            let mut net_brokers = state.net_brokers.borrow_mut();
            for address in addresses {
                info!("sync broker: {address}");
                net_brokers.insert(address, now);
            }
        }
        Err(error) => {
            error!("broker list sync with upper broker failed: {error}");
            exit(1);
        }
    }
}

/// Drops 1-hop brokers that stopped announcing and gossips their removal.
async fn evict_stale(state: &Rc<BrokerState>) {
    let now = Instant::now();
    let stale: Vec<String> = state
        .new_brokers
        .borrow()
        .iter()
        .filter(|(_, last_seen)| now.duration_since(**last_seen) > BROKER_STALE_AFTER)
        .map(|(address, _)| address.clone())
        .collect();
    if stale.is_empty() {
        return;
    }

    let mut routes = Vec::with_capacity(stale.len());
    {
        let mut new_brokers = state.new_brokers.borrow_mut();
        for address in stale {
            info!("timeout broker: {address}");
            new_brokers.remove(&address);
            routes.push(RouteRecord::remove(address));
        }
    }

    let update = NetInfoUpdate {
        sender_port: state.self_port,
        routes,
    };
    match update.encode() {
        Ok(payload) => broadcast(state, None, true, &payload).await,
        Err(error) => warn!("cannot encode removal gossip: {error}"),
    }
}

/// Handles an incoming `NET_INFO_UPDATE`: refresh or learn the announcing
/// broker, apply its route records, and pass both on.
pub async fn handle_update(state: &Rc<BrokerState>, from_ip: IpAddr, payload: &[u8]) {
    let update = match NetInfoUpdate::parse(payload) {
        Ok(update) => update,
        Err(error) => {
            warn!("invalid NET_INFO_UPDATE: {error}");
            return;
        }
    };

    let peer_address = join_host_port(from_ip, update.sender_port);
    let from_upper = state.upper_observed.borrow().as_deref() == Some(peer_address.as_str());

    if !from_upper {
        let known = state
            .new_brokers
            .borrow_mut()
            .insert(peer_address.clone(), Instant::now())
            .is_some();

        if !known {
            info!("new broker connected: {peer_address}");

            match encode_route(&RouteRecord::insert(peer_address.clone())) {
                Ok(route) => {
                    let mut data = state.self_port.to_be_bytes().to_vec();
                    data.extend_from_slice(&route);
                    broadcast(state, Some(&peer_address), true, &data).await;
                }
                Err(error) => warn!("cannot gossip new broker: {error}"),
            }
        }
    }

    if update.routes.is_empty() {
        return;
    }

    {
        let mut net_brokers = state.net_brokers.borrow_mut();
        for route in &update.routes {
            if route.remove {
                info!(from = %peer_address, "remove broker: {}", route.address);
                net_brokers.remove(&route.address);
            } else {
                info!(from = %peer_address, "new broker: {}", route.address);
                net_brokers.insert(route.address.clone(), Instant::now());
            }
        }
    }

    // pass the records on unchanged, under our own announcement
    let mut data = state.self_port.to_be_bytes().to_vec();
    for route in &update.routes {
        match encode_route(route) {
            Ok(encoded) => data.extend_from_slice(&encoded),
            Err(error) => warn!("cannot re-encode gossip route: {error}"),
        }
    }
    broadcast(state, Some(&peer_address), !from_upper, &data).await;
}

/// Sends a `NET_INFO_UPDATE` payload to every 1-hop broker except `exclude`,
/// and optionally to the observed upstream.
async fn broadcast(state: &Rc<BrokerState>, exclude: Option<&str>, to_upper: bool, payload: &[u8]) {
    let targets: Vec<String> = state
        .new_brokers
        .borrow()
        .keys()
        .filter(|address| Some(address.as_str()) != exclude)
        .cloned()
        .collect();

    for target in targets {
        debug!("send broker update to {target}");
        if let Err(error) = send_frame(&target, FrameType::NetInfoUpdate, payload).await {
            warn!("send broker update to 1 jump broker error: {error}");
        }
    }

    if to_upper {
        let upper = state.upper_observed.borrow().clone();
        if let Some(upper) = upper {
            debug!("send broker update to upper broker {upper}");
            if let Err(error) = send_frame(&upper, FrameType::NetInfoUpdate, payload).await {
                warn!("send broker update to upper broker error: {error}");
            }
        }
    }
}

async fn dial(address: &str) -> io::Result<TcpStream> {
    match timeout(MESH_DIAL_TIMEOUT, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "mesh dial timed out")),
    }
}

/// Dials a broker, writes one frame and reports the resolved remote address.
async fn send_frame(address: &str, frame_type: FrameType, payload: &[u8]) -> io::Result<std::net::SocketAddr> {
    let mut conn = dial(address).await?;
    let frame =
        encode_frame(frame_type, payload).map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    conn.write_all(&frame).await?;
    conn.peer_addr()
}
