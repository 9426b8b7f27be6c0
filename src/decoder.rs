//! Streaming HTTP response decoder.
//!
//! Frames exactly one response off a byte stream under one of three
//! mutually exclusive delimiting strategies (fixed length, chunked,
//! close-delimited) and leaves the stream positioned at the first byte of
//! the next response. The decoder never reads past the frame boundary, so
//! a persistent connection stays usable for the next exchange.

use bytes::{Bytes, BytesMut};
use std::io::{self, Read};
use thiserror::Error;

/// Cap on accumulated header bytes before giving up (16 KiB).
pub const DEFAULT_MAX_HEADER_SIZE: usize = 16 * 1024;

#[derive(Error, Debug)]
pub enum FramingError {
    #[error("header block exceeded {0} bytes without CRLF CRLF terminator")]
    HeaderTooLarge(usize),

    #[error("invalid chunk size line: {0:?}")]
    InvalidChunkSize(String),

    #[error("chunk payload not followed by CRLF")]
    InvalidChunkTerminator,

    #[error("io error while decoding: {0}")]
    Io(#[from] io::Error),
}

/// How a response body's boundaries are determined.
///
/// Derived from the header block: `Transfer-Encoding: chunked` wins over a
/// conflicting `Content-Length`; neither present means the body runs until
/// the server closes the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    FixedLength(usize),
    Chunked,
    CloseDelimited,
}

impl ResponseFraming {
    /// Derive the framing strategy from a raw header block.
    pub fn from_header_block(header: &[u8]) -> Self {
        let text = String::from_utf8_lossy(header);
        let mut content_length: Option<usize> = None;
        let mut chunked = false;
        for line in text.split("\r\n") {
            let lower = line.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix("content-length:") {
                content_length = value.trim().parse().ok();
            }
            if let Some(value) = lower.strip_prefix("transfer-encoding:") {
                if value.contains("chunked") {
                    chunked = true;
                }
            }
        }
        if chunked {
            Self::Chunked
        } else if let Some(n) = content_length {
            Self::FixedLength(n)
        } else {
            Self::CloseDelimited
        }
    }
}

/// One parsed chunk from a chunked-encoded body.
///
/// A size of zero is the terminal chunk: it carries no payload and is
/// followed by zero or more trailer lines then an empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub size_hex: String,
    pub size: usize,
    pub payload: Bytes,
}

impl ChunkRecord {
    pub fn is_terminal(&self) -> bool {
        self.size == 0
    }
}

/// A single decoded HTTP response.
#[derive(Debug, Clone)]
pub struct DecodedResponse {
    /// Raw header block including the trailing CRLF CRLF.
    pub header: Bytes,
    /// Body bytes after de-framing (chunk payloads concatenated).
    pub body: Bytes,
    pub framing: ResponseFraming,
}

impl DecodedResponse {
    /// Numeric status code from the status line, if parseable.
    pub fn status_code(&self) -> Option<u16> {
        let text = String::from_utf8_lossy(&self.header);
        let status_line = text.split("\r\n").next()?;
        status_line.split_whitespace().nth(1)?.parse().ok()
    }

    /// Value of the first header with the given name (case-insensitive),
    /// with surrounding whitespace trimmed.
    pub fn header_value(&self, name: &str) -> Option<String> {
        let text = String::from_utf8_lossy(&self.header);
        for line in text.split("\r\n").skip(1) {
            if let Some((field, value)) = line.split_once(':') {
                if field.eq_ignore_ascii_case(name) {
                    return Some(value.trim().to_string());
                }
            }
        }
        None
    }

    /// All header values with the given name, in order of appearance.
    /// `Set-Cookie` legitimately repeats, so a single-value lookup is not
    /// enough for cookie scenarios.
    pub fn header_values(&self, name: &str) -> Vec<String> {
        let text = String::from_utf8_lossy(&self.header);
        text.split("\r\n")
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .filter(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.trim().to_string())
            .collect()
    }
}

/// Stream-consuming response decoder.
#[derive(Debug, Clone, Copy)]
pub struct ResponseDecoder {
    max_header_size: usize,
}

impl Default for ResponseDecoder {
    fn default() -> Self {
        Self {
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
        }
    }
}

impl ResponseDecoder {
    pub fn new(max_header_size: usize) -> Self {
        Self { max_header_size }
    }

    /// Decode exactly one response from `stream`.
    ///
    /// Returns `Ok(None)` when the stream ends before a complete header
    /// block arrives (no response available). For fixed-length bodies an
    /// early close yields a body shorter than the declared length, so
    /// truncation is observable to the caller, never hidden.
    ///
    /// For close-delimited bodies the read is bounded by whatever timeout
    /// the caller has armed on the underlying stream: a `WouldBlock` or
    /// `TimedOut` read is treated as end-of-stream.
    pub fn decode<R: Read>(
        &self,
        stream: &mut R,
    ) -> Result<Option<DecodedResponse>, FramingError> {
        let header = match self.read_header_block(stream)? {
            Some(header) => header,
            None => return Ok(None),
        };
        let framing = ResponseFraming::from_header_block(&header);
        let body = match framing {
            ResponseFraming::FixedLength(n) => read_up_to(stream, n)?,
            ResponseFraming::Chunked => self.read_chunked_body(stream)?,
            ResponseFraming::CloseDelimited => read_until_close(stream)?,
        };
        Ok(Some(DecodedResponse {
            header,
            body,
            framing,
        }))
    }

    /// Accumulate single bytes until CRLF CRLF.
    ///
    /// One byte at a time is deliberate: reading in blocks could pull body
    /// bytes (or the next response) out of the kernel buffer and
    /// desynchronize the connection.
    fn read_header_block<R: Read>(&self, stream: &mut R) -> Result<Option<Bytes>, FramingError> {
        let mut buf = BytesMut::new();
        loop {
            if buf.len() > self.max_header_size {
                return Err(FramingError::HeaderTooLarge(self.max_header_size));
            }
            match read_byte(stream)? {
                Some(b) => buf.extend_from_slice(&[b]),
                None => return Ok(None),
            }
            if buf.ends_with(b"\r\n\r\n") {
                return Ok(Some(buf.freeze()));
            }
        }
    }

    /// Read one chunk (size line, payload, terminator). Returns `None` if
    /// the stream ends where a chunk size line was expected.
    pub fn read_chunk<R: Read>(
        &self,
        stream: &mut R,
    ) -> Result<Option<ChunkRecord>, FramingError> {
        let line = self.read_crlf_line(stream)?;
        if line.is_empty() {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&line);
        let size_hex = text
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        let size = usize::from_str_radix(&size_hex, 16)
            .map_err(|_| FramingError::InvalidChunkSize(text.trim().to_string()))?;

        if size == 0 {
            // Terminal chunk: consume trailer lines until an empty line.
            // No payload, no trailing CRLF check.
            loop {
                let trailer = self.read_crlf_line(stream)?;
                if trailer == b"\r\n" || trailer.is_empty() {
                    break;
                }
            }
            return Ok(Some(ChunkRecord {
                size_hex,
                size: 0,
                payload: Bytes::new(),
            }));
        }

        let payload = read_up_to(stream, size)?;
        let mut crlf = [0u8; 2];
        stream
            .read_exact(&mut crlf)
            .map_err(|_| FramingError::InvalidChunkTerminator)?;
        if &crlf != b"\r\n" {
            return Err(FramingError::InvalidChunkTerminator);
        }
        Ok(Some(ChunkRecord {
            size_hex,
            size,
            payload,
        }))
    }

    fn read_chunked_body<R: Read>(&self, stream: &mut R) -> Result<Bytes, FramingError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read_chunk(stream)? {
            if chunk.is_terminal() {
                break;
            }
            body.extend_from_slice(&chunk.payload);
        }
        Ok(body.freeze())
    }

    /// Read a single CRLF-terminated line, byte by byte. Returns whatever
    /// accumulated (possibly without the CRLF) if the stream ends first.
    fn read_crlf_line<R: Read>(&self, stream: &mut R) -> Result<Vec<u8>, FramingError> {
        let mut line = Vec::new();
        loop {
            match read_byte(stream)? {
                Some(b) => line.push(b),
                None => return Ok(line),
            }
            if line.ends_with(b"\r\n") {
                return Ok(line);
            }
            if line.len() > self.max_header_size {
                return Err(FramingError::HeaderTooLarge(self.max_header_size));
            }
        }
    }
}

fn read_byte<R: Read>(stream: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read up to `n` bytes; stops early at end-of-stream so a truncated body
/// surfaces as a short result rather than an error.
fn read_up_to<R: Read>(stream: &mut R, n: usize) -> io::Result<Bytes> {
    let mut data = BytesMut::with_capacity(n.min(64 * 1024));
    let mut scratch = [0u8; 4096];
    while data.len() < n {
        let want = (n - data.len()).min(scratch.len());
        match stream.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(got) => data.extend_from_slice(&scratch[..got]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(data.freeze())
}

/// Read everything until end-of-stream. A timed-out read counts as the end:
/// close-delimited framing is bounded by the caller's socket read timeout.
fn read_until_close<R: Read>(stream: &mut R) -> io::Result<Bytes> {
    let mut data = BytesMut::new();
    let mut scratch = [0u8; 4096];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => break,
            Ok(got) => data.extend_from_slice(&scratch[..got]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(data.freeze())
}
