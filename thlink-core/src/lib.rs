//! Tunnel engine of the thlink relay service.
//!
//! A [`Tunnel`] pairs a reliable stream endpoint (QUIC or TCP) with a UDP
//! endpoint and relays framed records between them, multiplexing up to 256
//! UDP peers over the single stream. Packet interception is pluggable through
//! [`TunnelHooks`].

pub mod endpoint;
mod tunnel;

pub use tunnel::peers::PeerTable;
pub use tunnel::plugin::{Hook, HookAction, PluginIo, PluginLoop, TunnelHooks};
pub use tunnel::stream::{StreamReader, StreamWriter};
pub use tunnel::{Tunnel, TunnelConfig, TunnelError, TunnelStatus, TunnelType};
