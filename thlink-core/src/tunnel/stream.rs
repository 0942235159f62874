//! The polymorphic stream side of a tunnel.
//!
//! A tunnel stream is either a QUIC bidirectional stream or a TCP connection.
//! Both are split into a read half and a write half so that the two relay
//! directions (and the ping sender) can run as independent tasks.

use std::io::{self, Error, ErrorKind};

use quinn::{RecvStream, SendStream};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

/// Read half of a tunnel stream.
pub enum StreamReader {
    Quic(RecvStream),
    Tcp(OwnedReadHalf),
}

/// Write half of a tunnel stream.
pub enum StreamWriter {
    Quic(SendStream),
    Tcp(OwnedWriteHalf),
}

/// Splits a TCP connection into tunnel stream halves.
pub fn split_tcp(stream: TcpStream) -> (StreamReader, StreamWriter) {
    let (read_half, write_half) = stream.into_split();
    (StreamReader::Tcp(read_half), StreamWriter::Tcp(write_half))
}

/// Wraps a QUIC bidirectional stream into tunnel stream halves.
pub fn split_quic(send: SendStream, recv: RecvStream) -> (StreamReader, StreamWriter) {
    (StreamReader::Quic(recv), StreamWriter::Quic(send))
}

impl StreamReader {
    /// Reads some bytes from the stream. Returns `Ok(0)` when the peer has
    /// finished its half of the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Quic(recv) => match recv.read(buf).await {
                Ok(Some(count)) => Ok(count),
                Ok(None) => Ok(0),
                Err(error) => Err(Error::new(ErrorKind::Other, error)),
            },
            Self::Tcp(read_half) => read_half.read(buf).await,
        }
    }
}

impl StreamWriter {
    /// Writes an entire buffer to the stream.
    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Self::Quic(send) => send.write_all(buf).await.map_err(|error| Error::new(ErrorKind::Other, error)),
            Self::Tcp(write_half) => write_half.write_all(buf).await,
        }
    }

    /// Signals the end of the stream to the peer.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            Self::Quic(send) => send.finish().await.map_err(|error| Error::new(ErrorKind::Other, error)),
            Self::Tcp(write_half) => write_half.shutdown().await,
        }
    }
}
