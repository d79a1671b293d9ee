//! Git pkt-line framing.
//!
//! Every message on the smart HTTP wire is a pkt-line: a 4-character
//! lowercase hex length (counting the 4 header bytes) followed by the
//! payload, or the reserved `0000` flush packet.

use crate::{GitError, Result};
use std::io::{Read, Write};

/// The flush packet literal.
pub const FLUSH_PKT: &[u8; 4] = b"0000";

/// Largest payload a single pkt-line may carry (65520 bytes on the wire).
pub const MAX_DATA_LEN: usize = 65516;

/// Encodes `payload` as a data pkt-line.
///
/// Payloads longer than [`MAX_DATA_LEN`] are a caller error.
pub fn pkt_line(payload: impl AsRef<[u8]>) -> Vec<u8> {
    let payload = payload.as_ref();
    debug_assert!(payload.len() <= MAX_DATA_LEN, "pkt-line payload too long");

    let mut line = format!("{:04x}", payload.len() + 4).into_bytes();
    line.extend_from_slice(payload);
    line
}

/// Returns true if `chunk` is exactly the flush packet and nothing else.
pub fn is_flush_chunk(chunk: &[u8]) -> bool {
    chunk == FLUSH_PKT
}

/// Sideband channels of the `side-band`/`side-band-64k` capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Band {
    /// Primary data, also used for report-status on rejection.
    Data = 1,
    /// Human-readable progress text.
    Progress = 2,
    /// Fatal error text.
    Error = 3,
}

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet carried on a sideband channel.
    pub fn sideband(band: Band, payload: &[u8]) -> Self {
        let mut data = Vec::with_capacity(payload.len() + 1);
        data.push(band as u8);
        data.extend_from_slice(payload);
        Self::Data(data)
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => pkt_line(data),
            Self::Flush => FLUSH_PKT.to_vec(),
        }
    }

    /// Returns true if this is a flush packet.
    pub fn is_flush(&self) -> bool {
        matches!(self, Self::Flush)
    }

    /// Returns the data content, or None for a flush.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Data(data) => Some(data),
            Self::Flush => None,
        }
    }

    /// Splits a sideband packet into its channel byte and payload.
    pub fn band(&self) -> Option<(u8, &[u8])> {
        self.data()
            .and_then(|d| d.split_first())
            .map(|(band, rest)| (*band, rest))
    }
}

/// Reader for pkt-line format.
pub struct PktLineReader<R> {
    reader: R,
}

impl<R: Read> PktLineReader<R> {
    /// Creates a new pkt-line reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads the next packet, or `None` at end of input.
    pub fn read(&mut self) -> Result<Option<PktLine>> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if &len_buf == FLUSH_PKT {
            return Ok(Some(PktLine::Flush));
        }

        let len_str = std::str::from_utf8(&len_buf)
            .map_err(|_| GitError::InvalidPktLine("invalid length prefix".to_string()))?;
        let len = u16::from_str_radix(len_str, 16)
            .map_err(|_| GitError::InvalidPktLine(format!("invalid length {:?}", len_str)))?
            as usize;

        if len < 4 {
            return Err(GitError::InvalidPktLine(format!(
                "length {} is reserved",
                len
            )));
        }

        let mut data = vec![0u8; len - 4];
        self.reader.read_exact(&mut data)?;

        Ok(Some(PktLine::Data(data)))
    }

    /// Reads every remaining packet.
    pub fn read_all(&mut self) -> Result<Vec<PktLine>> {
        let mut packets = Vec::new();
        while let Some(pkt) = self.read()? {
            packets.push(pkt);
        }
        Ok(packets)
    }
}

/// Writer for pkt-line format.
pub struct PktLineWriter<W> {
    writer: W,
}

impl<W: Write> PktLineWriter<W> {
    /// Creates a new pkt-line writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a packet.
    pub fn write(&mut self, pkt: &PktLine) -> Result<()> {
        self.writer.write_all(&pkt.encode())?;
        Ok(())
    }

    /// Writes a string line, appending a newline if it has none.
    pub fn write_line(&mut self, s: &str) -> Result<()> {
        let mut data = s.as_bytes().to_vec();
        if !s.ends_with('\n') {
            data.push(b'\n');
        }
        self.write(&PktLine::Data(data))
    }

    /// Writes a flush packet.
    pub fn flush_pkt(&mut self) -> Result<()> {
        self.write(&PktLine::Flush)
    }

    /// Returns the inner writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}
