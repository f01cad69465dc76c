//! Request/response framing of the detector's command channel.
//!
//! Requests are written to the write characteristic as
//! `len:u32 LE | cmd:u16 LE | 0x00 | 0x80 + seq | args`, split into
//! [`WRITE_CHUNK_LEN`]-byte chunks. Responses arrive as notifications; the
//! first notification starts with `len:u32 LE` and the body is reassembled
//! from as many notifications as needed. The first four body bytes echo the
//! request header.

use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::frame::{FrameError, FrameReader};
use crate::transport::TransportError;

/// Maximum bytes per GATT write.
pub const WRITE_CHUNK_LEN: usize = 18;

/// Sequence numbers wrap at this value.
const SEQ_MODULUS: u8 = 32;

/// Command opcodes used by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    /// Negotiates the exchange parameters; first command of a session.
    SetExchange = 0x0007,
    /// Sets the device wall clock.
    SetTime = 0x0A04,
    /// Writes a virtual special function register.
    WriteVirtualSfr = 0x0825,
    /// Reads a virtual string (buffer) by id.
    ReadVirtualString = 0x0826,
}

/// Virtual string id of the telemetry buffer.
pub const VS_DATA_BUF: u32 = 0x0100;

/// Virtual SFR id of the device-relative clock.
pub const VSFR_DEVICE_TIME: u32 = 0x0504;

/// Arguments of [`Command::SetExchange`].
pub const EXCHANGE_ARGS: [u8; 4] = [0x01, 0xFF, 0x12, 0xFF];

/// Builds request frames with a rolling sequence number.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    seq: u8,
}

/// An encoded request and the header its response must echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Full frame including the length prefix.
    pub frame: Vec<u8>,
    /// Header the response body starts with.
    pub header: [u8; 4],
}

impl Request {
    /// Splits the frame into write-sized chunks.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.frame.chunks(WRITE_CHUNK_LEN)
    }
}

impl RequestEncoder {
    /// Creates an encoder starting at sequence zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { seq: 0 }
    }

    /// Encodes `command` with `args` and advances the sequence number.
    pub fn encode(&mut self, command: Command, args: &[u8]) -> Request {
        let [lo, hi] = (command as u16).to_le_bytes();
        let header = [lo, hi, 0x00, 0x80 + self.seq];
        self.seq = (self.seq + 1) % SEQ_MODULUS;

        let body_len = u32::try_from(header.len() + args.len()).unwrap_or(u32::MAX);
        let mut frame = Vec::with_capacity(4 + header.len() + args.len());
        frame.extend_from_slice(&body_len.to_le_bytes());
        frame.extend_from_slice(&header);
        frame.extend_from_slice(args);
        Request { frame, header }
    }
}

/// Arguments of [`Command::SetTime`] for the given instant.
#[must_use]
pub fn set_time_args(now: DateTime<Utc>) -> [u8; 8] {
    let year = u8::try_from(now.year() - 2000).unwrap_or(0);
    [
        u8::try_from(now.day()).unwrap_or(1),
        u8::try_from(now.month()).unwrap_or(1),
        year,
        0,
        u8::try_from(now.second()).unwrap_or(0),
        u8::try_from(now.minute()).unwrap_or(0),
        u8::try_from(now.hour()).unwrap_or(0),
        0,
    ]
}

/// Arguments of [`Command::WriteVirtualSfr`].
#[must_use]
pub fn write_sfr_args(sfr: u32, value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&sfr.to_le_bytes());
    out[4..].copy_from_slice(&value.to_le_bytes());
    out
}

/// Reassembles a response body from notification chunks.
#[derive(Debug, Default)]
pub struct ResponseAssembler {
    expected: Option<usize>,
    body: Vec<u8>,
}

impl ResponseAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one notification. Returns the complete body once all bytes
    /// announced by the length prefix have arrived.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] if the first chunk is too short to carry
    /// the length prefix or more bytes arrive than were announced.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let payload = match self.expected {
            Some(_) => chunk,
            None => {
                let mut reader = FrameReader::new(chunk);
                let len = reader
                    .read_u32_le()
                    .map_err(|e| TransportError::Protocol(format!("response prefix: {e}")))?;
                self.expected = Some(len as usize);
                &chunk[4..]
            }
        };
        self.body.extend_from_slice(payload);

        let expected = self.expected.unwrap_or(0);
        match self.body.len().cmp(&expected) {
            std::cmp::Ordering::Less => Ok(None),
            std::cmp::Ordering::Equal => {
                self.expected = None;
                Ok(Some(std::mem::take(&mut self.body)))
            }
            std::cmp::Ordering::Greater => Err(TransportError::Protocol(format!(
                "response overran announced length {expected} (got {})",
                self.body.len()
            ))),
        }
    }
}

/// Reassembles the response to one request, skipping notifications left over
/// from an earlier request that was abandoned mid-response.
///
/// A response's first notification carries the length prefix followed by the
/// echoed header, so a chunk seen while idle that does not show our header is
/// stale and dropped.
#[derive(Debug)]
pub struct ResponseMatcher {
    header: [u8; 4],
    assembler: ResponseAssembler,
    started: bool,
}

impl ResponseMatcher {
    /// Creates a matcher for the response to a request with `header`.
    #[must_use]
    pub fn new(header: [u8; 4]) -> Self {
        Self {
            header,
            assembler: ResponseAssembler::new(),
            started: false,
        }
    }

    /// Feeds one notification. Returns the payload after the echoed header
    /// once the matching response is complete.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] if the matching response overruns its
    /// announced length.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.started {
            if chunk.get(4..8) != Some(&self.header[..]) {
                tracing::debug!(len = chunk.len(), "skipping stale notification");
                return Ok(None);
            }
            self.started = true;
        }
        let Some(body) = self.assembler.push(chunk)? else {
            return Ok(None);
        };
        self.started = false;
        match strip_header(&body, &self.header) {
            Ok(payload) => Ok(Some(payload.to_vec())),
            Err(err) => {
                tracing::debug!(error = %err, "skipping unmatched response");
                Ok(None)
            }
        }
    }
}

/// Checks the echoed header and returns the bytes after it.
///
/// # Errors
///
/// [`TransportError::Protocol`] when the echo does not match.
pub fn strip_header<'a>(body: &'a [u8], header: &[u8; 4]) -> Result<&'a [u8], TransportError> {
    match body.get(..4) {
        Some(echo) if echo == header => Ok(&body[4..]),
        Some(echo) => Err(TransportError::Protocol(format!(
            "header mismatch: sent {header:02x?}, got {echo:02x?}"
        ))),
        None => Err(TransportError::Protocol("response shorter than header".into())),
    }
}

/// Checks the return code of a [`Command::WriteVirtualSfr`] response.
///
/// # Errors
///
/// [`TransportError::Protocol`] on a short body or a non-success code.
pub fn check_write_sfr(payload: &[u8]) -> Result<(), TransportError> {
    let retcode = FrameReader::new(payload)
        .read_u32_le()
        .map_err(|e| TransportError::Protocol(format!("write sfr response: {e}")))?;
    if retcode == 1 {
        Ok(())
    } else {
        Err(TransportError::Protocol(format!("write sfr returned {retcode}")))
    }
}

/// Extracts the string contents from a [`Command::ReadVirtualString`] response.
///
/// # Errors
///
/// [`TransportError::Protocol`] on a non-success return code or a length that
/// does not match the payload.
pub fn parse_virtual_string(payload: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut reader = FrameReader::new(payload);
    let protocol_err = |e: FrameError| TransportError::Protocol(format!("virtual string response: {e}"));
    let retcode = reader.read_u32_le().map_err(protocol_err)?;
    if retcode != 1 {
        return Err(TransportError::Protocol(format!(
            "virtual string read returned {retcode}"
        )));
    }
    let len = reader.read_u32_le().map_err(protocol_err)? as usize;
    let data = reader.read_bytes(len).map_err(protocol_err)?;
    // Some firmware appends a single NUL after the announced length.
    match reader.remaining() {
        0 => Ok(data.to_vec()),
        1 if reader.read_u8() == Ok(0) => Ok(data.to_vec()),
        extra => Err(TransportError::Protocol(format!(
            "virtual string has {extra} trailing bytes"
        ))),
    }
}
