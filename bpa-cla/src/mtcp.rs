//! Minimal-TCP style framing: each bundle travels as a CBOR byte
//! string, i.e. a byte-string head followed by the serialized bundle.

use crate::{FramingParser, FramingStatus, LinkTx, TransportError};
use std::io::Write;

const MAJOR_BYTES: u8 = 2;

/// Encodes the framing header for a bundle of `length` bytes.
pub fn encode_header(length: usize) -> Vec<u8> {
    let m = MAJOR_BYTES << 5;
    let length = length as u64;
    match length {
        0..=23 => vec![m | length as u8],
        24..=0xff => vec![m | 24, length as u8],
        0x100..=0xffff => {
            let mut v = vec![m | 25];
            v.extend_from_slice(&(length as u16).to_be_bytes());
            v
        }
        0x1_0000..=0xffff_ffff => {
            let mut v = vec![m | 26];
            v.extend_from_slice(&(length as u32).to_be_bytes());
            v
        }
        _ => {
            let mut v = vec![m | 27];
            v.extend_from_slice(&length.to_be_bytes());
            v
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for (more of) a byte-string head.
    Header,
    /// `remaining` body bytes are still owed to the bundle parser.
    Body { remaining: usize },
    Broken,
}

/// Framing parser for the mtcp byte stream.
#[derive(Debug)]
pub struct MtcpFramingParser {
    state: State,
    header: Vec<u8>,
}

impl Default for MtcpFramingParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MtcpFramingParser {
    pub fn new() -> Self {
        Self {
            state: State::Header,
            header: Vec::with_capacity(9),
        }
    }

    /// Tries to finish the buffered head. `None` means more bytes are
    /// needed; `Some(Err)` marks a corrupt stream.
    fn try_finish_header(&mut self) -> Option<Result<usize, ()>> {
        let first = *self.header.first()?;
        if first >> 5 != MAJOR_BYTES {
            return Some(Err(()));
        }
        let info = first & 0x1f;
        let extra = match info {
            0..=23 => 0,
            24 => 1,
            25 => 2,
            26 => 4,
            27 => 8,
            _ => return Some(Err(())),
        };
        if self.header.len() < 1 + extra {
            return None;
        }
        let length = if extra == 0 {
            info as u64
        } else {
            self.header[1..1 + extra]
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | *b as u64)
        };
        Some(Ok(length as usize))
    }
}

impl FramingParser for MtcpFramingParser {
    fn reset(&mut self) {
        self.state = State::Header;
        self.header.clear();
    }

    fn parse(&mut self, input: &[u8]) -> (usize, FramingStatus) {
        match self.state {
            State::Broken => (input.len(), FramingStatus::Error),
            State::Body { remaining } => (0, FramingStatus::Forward { remaining }),
            State::Header => {
                let mut consumed = 0;
                for byte in input {
                    self.header.push(*byte);
                    consumed += 1;
                    match self.try_finish_header() {
                        None => {}
                        Some(Ok(length)) => {
                            self.header.clear();
                            self.state = State::Body { remaining: length };
                            return (consumed, FramingStatus::Header);
                        }
                        Some(Err(())) => {
                            self.header.clear();
                            self.state = State::Broken;
                            return (consumed, FramingStatus::Error);
                        }
                    }
                }
                (consumed, FramingStatus::Header)
            }
        }
    }

    fn body_consumed(&mut self, n: usize) {
        if let State::Body { remaining } = self.state {
            let remaining = remaining.saturating_sub(n);
            self.state = if remaining == 0 {
                State::Header
            } else {
                State::Body { remaining }
            };
        }
    }
}

/// Write half speaking the mtcp framing over any byte sink.
pub struct MtcpTx<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> MtcpTx<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl<W: Write + Send> LinkTx for MtcpTx<W> {
    fn begin_packet(&mut self, length: usize) -> Result<(), TransportError> {
        self.writer.write_all(&encode_header(length))?;
        Ok(())
    }

    fn send_packet_data(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(data)?;
        Ok(())
    }

    fn end_packet(&mut self) -> Result<(), TransportError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for len in [0usize, 1, 23, 24, 255, 256, 65535, 65536, 1 << 20] {
            let header = encode_header(len);
            let mut parser = MtcpFramingParser::new();
            let (consumed, status) = parser.parse(&header);
            assert_eq!(consumed, header.len());
            assert_eq!(status, FramingStatus::Header);
            if len > 0 {
                let (c, status) = parser.parse(&[0u8]);
                assert_eq!(c, 0);
                assert_eq!(status, FramingStatus::Forward { remaining: len });
            }
        }
    }

    #[test]
    fn split_header_across_reads() {
        let header = encode_header(300);
        let mut parser = MtcpFramingParser::new();
        let (c1, s1) = parser.parse(&header[..1]);
        assert_eq!((c1, s1), (1, FramingStatus::Header));
        let (c2, s2) = parser.parse(&header[1..]);
        assert_eq!((c2, s2), (header.len() - 1, FramingStatus::Header));
        let (_, s3) = parser.parse(&[0u8; 4]);
        assert_eq!(s3, FramingStatus::Forward { remaining: 300 });
    }

    #[test]
    fn non_byte_string_is_an_error() {
        let mut parser = MtcpFramingParser::new();
        let (_, status) = parser.parse(&[0x83]);
        assert_eq!(status, FramingStatus::Error);
    }
}
