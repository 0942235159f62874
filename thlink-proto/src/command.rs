//! Payload layouts of the broker command channel.
//!
//! Each command travels as one frame (see [`crate::frame`]); this module only
//! deals with the payload bytes inside those frames.

use std::fmt;

use crate::BROKERS_CNT_MAX;

/// Errors raised while parsing or building command payloads.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("payload is truncated")]
    Truncated,
    #[error("invalid tunnel scope byte {0:#04x}")]
    InvalidScope(u8),
    #[error("invalid stream protocol byte {0:#04x}")]
    InvalidStreamProtocol(u8),
    #[error("broker address is {0} bytes, the route format carries at most 127")]
    AddressTooLong(usize),
    #[error("broker address is not ASCII")]
    AddressNotAscii,
}

/// Whether a tunnel exposes a TCP or a UDP service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelScope {
    Tcp,
    Udp,
}

impl TunnelScope {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b't' => Some(Self::Tcp),
            b'u' => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        match self {
            Self::Tcp => b't',
            Self::Udp => b'u',
        }
    }
}

/// Protocol of the stream side of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Tcp,
    Quic,
}

impl StreamProtocol {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            b't' => Some(Self::Tcp),
            b'q' => Some(Self::Quic),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        match self {
            Self::Tcp => b't',
            Self::Quic => b'q',
        }
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => f.write_str("tcp"),
            Self::Quic => f.write_str("quic"),
        }
    }
}

/// `TUNNEL` request payload: scope char followed by stream protocol char.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRequest {
    pub scope: TunnelScope,
    pub stream_protocol: StreamProtocol,
}

impl TunnelRequest {
    pub fn encode(&self) -> [u8; 2] {
        [self.scope.into_u8(), self.stream_protocol.into_u8()]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 2 {
            return Err(PayloadError::Truncated);
        }
        let scope = TunnelScope::from_u8(payload[0]).ok_or(PayloadError::InvalidScope(payload[0]))?;
        let stream_protocol =
            StreamProtocol::from_u8(payload[1]).ok_or(PayloadError::InvalidStreamProtocol(payload[1]))?;

        Ok(Self { scope, stream_protocol })
    }
}

/// `TUNNEL` response payload: stream port and UDP port, `0,0` on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelResponse {
    pub stream_port: u16,
    pub udp_port: u16,
}

impl TunnelResponse {
    pub const FAILED: Self = Self { stream_port: 0, udp_port: 0 };

    pub fn encode(&self) -> [u8; 4] {
        let s = self.stream_port.to_be_bytes();
        let u = self.udp_port.to_be_bytes();
        [s[0], s[1], u[0], u[1]]
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 4 {
            return Err(PayloadError::Truncated);
        }

        Ok(Self {
            stream_port: u16::from_be_bytes([payload[0], payload[1]]),
            udp_port: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn is_failure(&self) -> bool {
        self.stream_port == 0 || self.udp_port == 0
    }
}

/// Builds a `NET_INFO` reply: a sequence of `<len:1><address>` tuples, capped
/// at [`BROKERS_CNT_MAX`] entries. Addresses that do not fit the format are
/// skipped.
pub fn encode_address_list<'a, I>(addresses: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut data = Vec::new();
    let mut count = 0;
    for address in addresses {
        if count >= BROKERS_CNT_MAX {
            break;
        }
        if address.len() > u8::MAX as usize || !address.is_ascii() {
            continue;
        }

        data.push(address.len() as u8);
        data.extend_from_slice(address.as_bytes());
        count += 1;
    }

    data
}

/// Parses a `NET_INFO` reply. A truncated trailing tuple ends the parse.
pub fn parse_address_list(payload: &[u8]) -> Vec<String> {
    let mut addresses = Vec::new();
    let mut i = 0;
    while i < payload.len() {
        let len = payload[i] as usize;
        i += 1;
        if i + len > payload.len() {
            break;
        }

        if let Ok(address) = std::str::from_utf8(&payload[i..i + len]) {
            addresses.push(address.to_owned());
        }
        i += len;
    }

    addresses
}

/// One gossip record inside a `NET_INFO_UPDATE` payload. The high bit of the
/// length byte distinguishes removal from insertion/refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub remove: bool,
    pub address: String,
}

impl RouteRecord {
    pub fn insert(address: impl Into<String>) -> Self {
        Self { remove: false, address: address.into() }
    }

    pub fn remove(address: impl Into<String>) -> Self {
        Self { remove: true, address: address.into() }
    }
}

/// `NET_INFO_UPDATE` payload: the announcing broker's listen port followed by
/// zero or more route records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetInfoUpdate {
    pub sender_port: u16,
    pub routes: Vec<RouteRecord>,
}

impl NetInfoUpdate {
    /// A bare self-announcement without route records.
    pub fn announce(sender_port: u16) -> Self {
        Self { sender_port, routes: Vec::new() }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PayloadError> {
        let mut data = Vec::with_capacity(2);
        data.extend_from_slice(&self.sender_port.to_be_bytes());
        for route in &self.routes {
            data.extend_from_slice(&encode_route(route)?);
        }

        Ok(data)
    }

    pub fn parse(payload: &[u8]) -> Result<Self, PayloadError> {
        if payload.len() < 2 {
            return Err(PayloadError::Truncated);
        }
        let sender_port = u16::from_be_bytes([payload[0], payload[1]]);

        Ok(Self {
            sender_port,
            routes: parse_routes(&payload[2..])?,
        })
    }
}

/// Encodes a single `<flag_len:1><address>` route record.
pub fn encode_route(route: &RouteRecord) -> Result<Vec<u8>, PayloadError> {
    if route.address.len() > 0x7f {
        return Err(PayloadError::AddressTooLong(route.address.len()));
    }
    if !route.address.is_ascii() {
        return Err(PayloadError::AddressNotAscii);
    }

    let flag = if route.remove { 0x80 } else { 0x00 };
    let mut data = Vec::with_capacity(1 + route.address.len());
    data.push(flag | route.address.len() as u8);
    data.extend_from_slice(route.address.as_bytes());
    Ok(data)
}

/// Parses a sequence of route records (a `NET_INFO_UPDATE` payload without its
/// leading port).
pub fn parse_routes(payload: &[u8]) -> Result<Vec<RouteRecord>, PayloadError> {
    let mut routes = Vec::new();
    let mut i = 0;
    while i < payload.len() {
        let remove = payload[i] & 0x80 != 0;
        let len = (payload[i] & 0x7f) as usize;
        i += 1;
        if i + len > payload.len() {
            return Err(PayloadError::Truncated);
        }

        let address = std::str::from_utf8(&payload[i..i + len])
            .map_err(|_| PayloadError::AddressNotAscii)?
            .to_owned();
        routes.push(RouteRecord { remove, address });
        i += len;
    }

    Ok(routes)
}

/// Builds a `BROKER_INFO` reply: the active peer count as a big-endian `u64`.
pub fn encode_peer_count(count: u64) -> [u8; 8] {
    count.to_be_bytes()
}

pub fn parse_peer_count(payload: &[u8]) -> Result<u64, PayloadError> {
    let bytes: [u8; 8] = payload.get(..8).and_then(|b| b.try_into().ok()).ok_or(PayloadError::Truncated)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Builds a `VERSION` reply: tunnel version code followed by the UTF-8 human
/// version string.
pub fn encode_version(tunnel_version: u8, version: &str) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + version.len());
    data.push(tunnel_version);
    data.extend_from_slice(version.as_bytes());
    data
}

/// Parses a `VERSION` reply into the tunnel version code and version string.
pub fn parse_version(payload: &[u8]) -> Result<(u8, String), PayloadError> {
    let (&tunnel_version, rest) = payload.split_first().ok_or(PayloadError::Truncated)?;
    Ok((tunnel_version, String::from_utf8_lossy(rest).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tunnel_request_round_trip() {
        let request = TunnelRequest {
            scope: TunnelScope::Udp,
            stream_protocol: StreamProtocol::Quic,
        };
        assert_eq!(request.encode(), [b'u', b'q']);
        assert_eq!(TunnelRequest::parse(&[b'u', b'q']).unwrap(), request);

        assert!(matches!(TunnelRequest::parse(&[b'u']), Err(PayloadError::Truncated)));
        assert!(matches!(TunnelRequest::parse(&[b'x', b'q']), Err(PayloadError::InvalidScope(b'x'))));
        assert!(matches!(
            TunnelRequest::parse(&[b't', b'z']),
            Err(PayloadError::InvalidStreamProtocol(b'z'))
        ));
    }

    #[test]
    fn tunnel_response_ports() {
        let response = TunnelResponse { stream_port: 0x1234, udp_port: 0xfffe };
        assert_eq!(response.encode(), [0x12, 0x34, 0xff, 0xfe]);
        assert_eq!(TunnelResponse::parse(&response.encode()).unwrap(), response);

        assert!(!response.is_failure());
        assert!(TunnelResponse::FAILED.is_failure());
        assert_eq!(TunnelResponse::FAILED.encode(), [0, 0, 0, 0]);
    }

    #[test]
    fn address_list_round_trip() {
        let addresses = ["192.0.2.1:4646", "broker.example.net:4646"];
        let data = encode_address_list(addresses.iter().copied());
        assert_eq!(parse_address_list(&data), addresses);
    }

    #[test]
    fn address_list_is_capped() {
        let addresses: Vec<String> = (0..50).map(|i| format!("10.0.0.{i}:4646")).collect();
        let data = encode_address_list(addresses.iter().map(String::as_str));
        assert_eq!(parse_address_list(&data).len(), BROKERS_CNT_MAX);
    }

    #[test]
    fn truncated_address_tuple_ends_parse() {
        let mut data = encode_address_list(["192.0.2.1:4646"]);
        data.push(12);
        data.extend_from_slice(b"10.0");
        assert_eq!(parse_address_list(&data), ["192.0.2.1:4646"]);
    }

    #[test]
    fn net_info_update_round_trip() {
        let update = NetInfoUpdate {
            sender_port: 4646,
            routes: vec![
                RouteRecord::insert("192.0.2.7:4646"),
                RouteRecord::remove("192.0.2.8:4646"),
            ],
        };

        let data = update.encode().unwrap();
        assert_eq!(&data[..2], &4646u16.to_be_bytes());
        assert_eq!(data[2] as usize, "192.0.2.7:4646".len());
        assert_eq!(data[17], 0x80 | "192.0.2.8:4646".len() as u8);
        assert_eq!(NetInfoUpdate::parse(&data).unwrap(), update);
    }

    #[test]
    fn bare_announcement_has_no_routes() {
        let data = NetInfoUpdate::announce(4646).encode().unwrap();
        assert_eq!(data.len(), 2);

        let update = NetInfoUpdate::parse(&data).unwrap();
        assert_eq!(update.sender_port, 4646);
        assert!(update.routes.is_empty());
    }

    #[test]
    fn peer_count_and_version_payloads() {
        assert_eq!(encode_peer_count(1), [0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(parse_peer_count(&encode_peer_count(u64::MAX)).unwrap(), u64::MAX);

        let payload = encode_version(2, "0.4.0");
        let (code, version) = parse_version(&payload).unwrap();
        assert_eq!(code, 2);
        assert_eq!(version, "0.4.0");
    }
}
