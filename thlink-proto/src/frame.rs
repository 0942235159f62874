//! Data frame encoding and the incremental stream parser.
//!
//! A frame is `type:u8 | length:u16be | payload`:
//!
//! ```text
//! +------+--------+--------------+
//! | type | length |   raw data   |
//! | 0  7 | 8   23 | 24    < 2047 |
//! +------+--------+--------------+
//! ```
//!
//! The parser is fed arbitrary chunks of a byte stream with [`FrameParser::append`]
//! and emits one complete record per successful [`FrameParser::parse`] call.
//! `LZW_DATA` records are decompressed on the way out and surfaced as `DATA`.

use tracing::warn;
use weezl::{decode::Decoder as LzwDecoder, BitOrder};

use crate::{MAX_PAYLOAD, TRANS_BUF_SIZE};

/// Frame type codes. The numeric values are wire-stable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Relayed payload. On a tunnel stream the first payload byte is a peer id.
    Data = 0,
    /// Liveness and latency probe, empty payload.
    Ping = 1,
    /// Tunnel creation request/response.
    Tunnel = 2,
    /// LZW-compressed `Data`. Accepted inbound, never emitted.
    LzwData = 3,
    /// Query the known broker list.
    NetInfo = 4,
    /// Gossip insertion/removal of broker addresses.
    NetInfoUpdate = 5,
    /// Active peer counter query.
    BrokerInfo = 6,
    /// Tunnel and human version query.
    Version = 7,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Ping),
            2 => Some(Self::Tunnel),
            3 => Some(Self::LzwData),
            4 => Some(Self::NetInfo),
            5 => Some(Self::NetInfoUpdate),
            6 => Some(Self::BrokerInfo),
            7 => Some(Self::Version),
            _ => None,
        }
    }

    pub fn into_u8(self) -> u8 {
        self as u8
    }
}

/// Errors of the frame encoder.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload is {0} bytes, larger than the {MAX_PAYLOAD} byte maximum")]
    FrameTooLarge(usize),
}

/// Builds a frame from a type and payload. The payload may be empty.
pub fn encode_frame(frame_type: FrameType, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::FrameTooLarge(payload.len()));
    }

    let len = payload.len() as u16;
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.push(frame_type.into_u8());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Incremental parser for a stream of frames.
///
/// Feed bytes with [`append`](Self::append), then call [`parse`](Self::parse)
/// in a loop until it returns `false`; partial headers and payloads are kept
/// across calls. After a `true` return the record is available through
/// [`frame_type`](Self::frame_type), [`len`](Self::len) and [`data`](Self::data)
/// until the next `parse` call.
pub struct FrameParser {
    cache: Vec<u8>,
    pending: Option<(u8, usize)>,

    frame_type: Option<FrameType>,
    data: Vec<u8>,

    total_in: f64,
    total_out: f64,
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            cache: Vec::new(),
            pending: None,
            frame_type: None,
            data: Vec::new(),
            total_in: 0.0,
            total_out: 0.0,
        }
    }

    /// Absorbs a chunk of stream bytes.
    pub fn append(&mut self, bytes: &[u8]) {
        if !bytes.is_empty() {
            self.cache.extend_from_slice(bytes);
        }
    }

    /// Attempts to extract the next complete record. Returns `true` exactly
    /// when a record was extracted.
    ///
    /// An `LZW_DATA` record that fails to decompress is logged and discarded;
    /// the length prefix has already been consumed, so the stream stays in
    /// sync and parsing continues with the next record.
    pub fn parse(&mut self) -> bool {
        loop {
            if self.pending.is_none() && self.cache.len() >= 3 {
                let raw_type = self.cache[0];
                let length = u16::from_be_bytes([self.cache[1], self.cache[2]]) as usize;
                self.cache.drain(..3);
                self.pending = Some((raw_type, length));
            }

            let (raw_type, length) = match self.pending {
                Some(header) => header,
                None => return false,
            };
            if self.cache.len() < length {
                return false;
            }

            self.pending = None;
            let payload: Vec<u8> = self.cache.drain(..length).collect();
            self.total_in += length as f64;

            match FrameType::from_u8(raw_type) {
                Some(FrameType::LzwData) => match decompress(&payload) {
                    Ok(decoded) => {
                        self.total_out += decoded.len() as f64;
                        self.frame_type = Some(FrameType::Data);
                        self.data = decoded;
                        return true;
                    }
                    Err(error) => {
                        warn!("LZW decompression error: {error}");
                        continue;
                    }
                },
                frame_type => {
                    self.total_out += length as f64;
                    self.frame_type = frame_type;
                    self.data = payload;
                    return true;
                }
            }
        }
    }

    /// Type of the last parsed record, `None` if the type byte was unknown.
    pub fn frame_type(&self) -> Option<FrameType> {
        self.frame_type
    }

    /// Payload length of the last parsed record.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Payload of the last parsed record, decompressed if it arrived as `LZW_DATA`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Average input/decoded-output ratio across all parsed records, `1.0`
    /// before any record was parsed.
    pub fn compression_ratio(&self) -> f64 {
        if self.total_out == 0.0 {
            1.0
        } else {
            self.total_in / self.total_out
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

fn decompress(payload: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut decoded = Vec::with_capacity(TRANS_BUF_SIZE);
    let mut decoder = LzwDecoder::new(BitOrder::Lsb, 8);
    decoder.into_stream(&mut decoded).decode_all(payload).status?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use weezl::encode::Encoder as LzwEncoder;

    use super::*;

    fn sample_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn round_trip() {
        for len in [0usize, 1, 2, 255, 256, 1024, MAX_PAYLOAD] {
            let payload = sample_payload(len);
            let frame = encode_frame(FrameType::Data, &payload).unwrap();
            assert_eq!(frame.len(), len + 3);

            let mut parser = FrameParser::new();
            parser.append(&frame);
            assert!(parser.parse());
            assert_eq!(parser.frame_type(), Some(FrameType::Data));
            assert_eq!(parser.len(), len);
            assert_eq!(parser.data(), &payload[..]);
            assert!(!parser.parse());
        }
    }

    #[test]
    fn empty_payload_has_zero_length_header() {
        let frame = encode_frame(FrameType::Ping, &[]).unwrap();
        assert_eq!(frame, vec![1, 0, 0]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = sample_payload(MAX_PAYLOAD + 1);
        assert!(matches!(
            encode_frame(FrameType::Data, &payload),
            Err(FrameError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn parses_frames_split_at_every_boundary() {
        let frames = [
            encode_frame(FrameType::Data, &sample_payload(100)).unwrap(),
            encode_frame(FrameType::Ping, &[]).unwrap(),
            encode_frame(FrameType::Tunnel, &[b'u', b'q']).unwrap(),
        ];
        let stream: Vec<u8> = frames.iter().flatten().copied().collect();

        for chunk_size in 1..=stream.len() {
            let mut parser = FrameParser::new();
            let mut parsed = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                parser.append(chunk);
                while parser.parse() {
                    parsed.push((parser.frame_type(), parser.data().to_vec()));
                }
            }

            assert_eq!(parsed.len(), 3, "chunk size {chunk_size}");
            assert_eq!(parsed[0], (Some(FrameType::Data), sample_payload(100)));
            assert_eq!(parsed[1], (Some(FrameType::Ping), Vec::new()));
            assert_eq!(parsed[2], (Some(FrameType::Tunnel), vec![b'u', b'q']));
        }
    }

    #[test]
    fn unknown_type_is_consumed_and_surfaced_as_none() {
        let mut frame = encode_frame(FrameType::Data, &[1, 2, 3]).unwrap();
        frame[0] = 0x2a;

        let mut parser = FrameParser::new();
        parser.append(&frame);
        parser.append(&encode_frame(FrameType::Ping, &[]).unwrap());

        assert!(parser.parse());
        assert_eq!(parser.frame_type(), None);
        assert_eq!(parser.data(), &[1, 2, 3]);

        // The stream is not desynchronized by the unknown record.
        assert!(parser.parse());
        assert_eq!(parser.frame_type(), Some(FrameType::Ping));
    }

    #[test]
    fn lzw_data_surfaces_as_data() {
        let payload = b"ababababab_ababababab_ababababab".repeat(8);
        let compressed = LzwEncoder::new(BitOrder::Lsb, 8).encode(&payload).unwrap();
        assert!(compressed.len() < payload.len());

        let mut frame = vec![FrameType::LzwData.into_u8()];
        frame.extend_from_slice(&(compressed.len() as u16).to_be_bytes());
        frame.extend_from_slice(&compressed);

        let mut parser = FrameParser::new();
        parser.append(&frame);
        assert!(parser.parse());
        assert_eq!(parser.frame_type(), Some(FrameType::Data));
        assert_eq!(parser.data(), &payload[..]);
        assert!(parser.compression_ratio() < 1.0);
    }

    #[test]
    fn corrupt_lzw_record_is_discarded_without_desync() {
        let mut frame = vec![FrameType::LzwData.into_u8()];
        frame.extend_from_slice(&4u16.to_be_bytes());
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        frame.extend_from_slice(&encode_frame(FrameType::Data, b"ok").unwrap());

        let mut parser = FrameParser::new();
        parser.append(&frame);
        assert!(parser.parse());
        assert_eq!(parser.frame_type(), Some(FrameType::Data));
        assert_eq!(parser.data(), b"ok");
        assert!(!parser.parse());
    }

    #[test]
    fn compression_ratio_defaults_to_one() {
        let parser = FrameParser::new();
        assert_eq!(parser.compression_ratio(), 1.0);
    }
}
