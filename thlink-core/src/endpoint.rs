//! QUIC endpoint configuration for the stream side of a tunnel.
//!
//! The listening side presents a throwaway self-signed certificate generated
//! at startup; the dialing side skips certificate verification entirely. Both
//! negotiate the `myonTHlink` ALPN token and a single bidirectional stream.

use std::{
    io::{self, Error, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use quinn::{ClientConfig, Endpoint, IdleTimeout, ServerConfig, TransportConfig, VarInt};
use thlink_proto::ALPN;

const KEEPALIVE_INTERVAL_MILLIS: u64 = 1000;
const MAX_IDLE_TIMEOUT_MILLIS: u32 = 4000;

/// Binds a client-side QUIC endpoint with verification disabled.
pub fn make_client_endpoint(bind_addr: SocketAddr) -> io::Result<Endpoint> {
    let mut endpoint = Endpoint::client(bind_addr)?;
    endpoint.set_default_client_config(configure_client());
    Ok(endpoint)
}

/// Binds a server-side QUIC endpoint with a fresh self-signed certificate.
pub fn make_server_endpoint(listen_addr: SocketAddr) -> io::Result<Endpoint> {
    Endpoint::server(configure_server()?, listen_addr)
}

pub fn configure_client() -> ClientConfig {
    let mut crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut client_config = ClientConfig::new(Arc::new(crypto));

    let mut transport_config = TransportConfig::default();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    client_config.transport_config(Arc::new(transport_config));

    client_config
}

pub fn configure_server() -> io::Result<ServerConfig> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|error| Error::new(ErrorKind::Other, error))?;
    let cert_der = cert.serialize_der().map_err(|error| Error::new(ErrorKind::Other, error))?;
    let priv_key = rustls::PrivateKey(cert.serialize_private_key_der());
    let cert_chain = vec![rustls::Certificate(cert_der)];

    let mut crypto = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(cert_chain, priv_key)
        .map_err(|error| Error::new(ErrorKind::InvalidInput, error))?;
    crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
    let transport_config = Arc::get_mut(&mut server_config.transport).unwrap();
    transport_config.max_concurrent_uni_streams(0_u8.into());
    transport_config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_MILLIS)));
    transport_config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));

    Ok(server_config)
}

/// Accepts whatever certificate the broker presents. The listener side mints
/// a throwaway certificate per process, so there is nothing to pin against;
/// tunnel claiming is gated by the client-IP bind instead.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _cert: &rustls::Certificate,
        _chain: &[rustls::Certificate],
        _host: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp: &[u8],
        _at: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
