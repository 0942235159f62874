//! Wire protocol for the thlink relay service.
//!
//! Everything on the wire is a framed record: `type:u8 | length:u16be | payload`.
//! The [`frame`] module provides the encoder and the incremental stream parser,
//! the [`command`] module the payload layouts of the broker command channel.

pub mod command;
pub mod frame;

pub use frame::{encode_frame, FrameError, FrameParser, FrameType};

/// Read buffer size of the broker command channel. A command connection that
/// fills this buffer in a single read is dropped without a reply.
pub const CMD_BUF_SIZE: usize = 64;

/// Transfer buffer size of a tunnel stream.
pub const TRANS_BUF_SIZE: usize = 2048;

/// Largest frame payload that still fits in the transfer buffer together with
/// its 3-byte header.
pub const MAX_PAYLOAD: usize = TRANS_BUF_SIZE - 3;

/// Upper bound of addresses in a `NET_INFO` reply.
pub const BROKERS_CNT_MAX: usize = 40;

/// Compatibility code of the tunnel protocol, exchanged through `VERSION`.
pub const TUNNEL_VERSION: u8 = 2;

/// ALPN token of the QUIC leg between client and broker.
pub const ALPN: &[u8] = b"myonTHlink";
