//! # Codec
//!
//! The translation layer between envelopes and msgpack bytes.
//!
//! msgpack-rpc has no outer framing: messages are concatenated msgpack values
//! on a byte stream. `StreamDecoder` therefore buffers whatever the socket
//! delivered and yields envelopes as soon as each one is complete.
//!
//! ## Invariants
//! - **Chunk Agnostic**: The sequence of decoded envelopes does not depend on
//!   how the stream was split into reads.
//! - **Bounded Buffering**: An incomplete message may not grow past `limit` bytes.

use std::io;

use rmpv::Value;

use crate::error::Error;
use crate::error::Result;
use crate::frame::Envelope;

/// Default upper bound for a single buffered message.
pub const DEFAULT_MESSAGE_LIMIT: usize = 16 * 1024 * 1024;

/// Encodes one envelope into its msgpack bytes.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    encode_value(&envelope.to_value())
}

/// Encodes a bare msgpack value.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decodes exactly one envelope from a complete buffer.
///
/// Trailing bytes after the envelope are a protocol violation.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let mut reader = TrackingReader::new(bytes);
    let value = match rmpv::decode::read_value(&mut reader) {
        Ok(value) => value,
        Err(_) if reader.exhausted => {
            return Err(Error::Decode("Unexpected end of message".into()));
        }
        Err(e) => return Err(Error::Decode(e.to_string())),
    };

    if reader.consumed != bytes.len() {
        return Err(Error::ProtocolViolation(format!(
            "{} trailing bytes after envelope",
            bytes.len() - reader.consumed
        )));
    }

    Envelope::from_value(value)
}

/// Incremental decoder for a msgpack-rpc byte stream.
///
/// Only the headers of the pending message are examined until its last byte
/// has arrived, so a message split over many reads is still decoded in time
/// linear in its size.
pub struct StreamDecoder {
    buf: Vec<u8>,
    pos: usize,
    limit: usize,
    scan: Scan,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MESSAGE_LIMIT)
    }

    /// Creates a decoder that rejects incomplete messages larger than `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            limit,
            scan: Scan::new(),
        }
    }

    /// Appends freshly read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Yields the next complete envelope, or `None` if more bytes are needed.
    ///
    /// After an error the stream can no longer be trusted; the decoder should
    /// be discarded along with its connection.
    pub fn try_next(&mut self) -> Result<Option<Envelope>> {
        let pending = &self.buf[self.pos..];
        if pending.is_empty() {
            return Ok(None);
        }

        let Some(len) = self.scan.advance(pending)? else {
            if pending.len() > self.limit {
                return Err(Error::MessageTooLarge { buffered: pending.len(), limit: self.limit });
            }
            return Ok(None);
        };

        let value = rmpv::decode::read_value(&mut &pending[..len])
            .map_err(|e| Error::Decode(e.to_string()))?;
        self.pos += len;
        self.scan = Scan::new();
        Envelope::from_value(value).map(Some)
    }
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resumable walk over the headers of one msgpack value.
///
/// `offset` is where the next unexamined item starts; `open` holds, per
/// nesting level, how many items are still expected.
struct Scan {
    offset: usize,
    open: Vec<u64>,
}

impl Scan {
    fn new() -> Self {
        Self { offset: 0, open: vec![1] }
    }

    /// Returns the full length of the value once every byte of it is present.
    fn advance(&mut self, data: &[u8]) -> Result<Option<usize>> {
        while let Some(remaining) = self.open.last_mut() {
            if *remaining == 0 {
                self.open.pop();
                continue;
            }
            let Some(item) = Item::parse(&data[self.offset..])? else {
                return Ok(None);
            };
            *remaining -= 1;
            self.offset += item.len;
            if item.children > 0 {
                self.open.push(item.children);
            }
        }
        Ok(Some(self.offset))
    }
}

/// One msgpack item: its header plus any inline payload, without children.
struct Item {
    len: usize,
    children: u64,
}

impl Item {
    /// `None` until the item's header and payload are both buffered.
    fn parse(data: &[u8]) -> Result<Option<Self>> {
        let Some(&marker) = data.first() else {
            return Ok(None);
        };

        // (header bytes, payload bytes, child items)
        let shape = match marker {
            0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Some((1, 0, 0)),
            0x80..=0x8f => Some((1, 0, 2 * u64::from(marker & 0x0f))),
            0x90..=0x9f => Some((1, 0, u64::from(marker & 0x0f))),
            0xa0..=0xbf => Some((1, u64::from(marker & 0x1f), 0)),
            0xc1 => return Err(Error::Decode("Reserved marker 0xc1".into())),
            0xc4 | 0xd9 => length(data, 1).map(|n| (2, n, 0)),
            0xc5 | 0xda => length(data, 2).map(|n| (3, n, 0)),
            0xc6 | 0xdb => length(data, 4).map(|n| (5, n, 0)),
            0xc7 => length(data, 1).map(|n| (3, n, 0)),
            0xc8 => length(data, 2).map(|n| (4, n, 0)),
            0xc9 => length(data, 4).map(|n| (6, n, 0)),
            0xca => Some((5, 0, 0)),
            0xcb => Some((9, 0, 0)),
            0xcc | 0xd0 => Some((2, 0, 0)),
            0xcd | 0xd1 => Some((3, 0, 0)),
            0xce | 0xd2 => Some((5, 0, 0)),
            0xcf | 0xd3 => Some((9, 0, 0)),
            0xd4 => Some((3, 0, 0)),
            0xd5 => Some((4, 0, 0)),
            0xd6 => Some((6, 0, 0)),
            0xd7 => Some((10, 0, 0)),
            0xd8 => Some((18, 0, 0)),
            0xdc => length(data, 2).map(|n| (3, 0, n)),
            0xdd => length(data, 4).map(|n| (5, 0, n)),
            0xde => length(data, 2).map(|n| (3, 0, 2 * n)),
            0xdf => length(data, 4).map(|n| (5, 0, 2 * n)),
        };

        let Some((header, payload, children)) = shape else {
            return Ok(None);
        };
        let len = header + payload;
        if (data.len() as u64) < len {
            return Ok(None);
        }
        Ok(Some(Self { len: len as usize, children }))
    }
}

/// Big-endian length field of `width` bytes following the marker.
fn length(data: &[u8], width: usize) -> Option<u64> {
    let bytes = data.get(1..1 + width)?;
    Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// A slice reader that remembers whether the decoder ever wanted more bytes
/// than were available. That distinguishes "incomplete" from "invalid"
/// without depending on the decoder's error variants.
struct TrackingReader<'a> {
    data: &'a [u8],
    consumed: usize,
    exhausted: bool,
}

impl<'a> TrackingReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            consumed: 0,
            exhausted: false,
        }
    }
}

impl io::Read for TrackingReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.consumed..];
        let n = out.len().min(remaining.len());
        if n < out.len() {
            self.exhausted = true;
        }
        out[..n].copy_from_slice(&remaining[..n]);
        self.consumed += n;
        Ok(n)
    }
}
