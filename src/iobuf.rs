//! Buffered-FD primitives (spec §4.2): a capped inbound byte buffer with
//! header/chunk extraction, and an outbound `BodyWriter` that remembers a
//! partial write across ticks instead of blocking for it to drain.

use std::io::{self, ErrorKind, Read, Write};

/// Hard cap on how much unconsumed inbound data a single descriptor may hold.
pub const MAX_READ_BUFFER: usize = 256 * 1024;
/// Largest slice of fresh body a `BodyWriter` emits in one `tick`.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;
const READ_CHUNK: usize = 16 * 1024;

/// Tri-state result of scanning a chunked body without consuming it — lets the
/// client classify a partially-received chunked request without disturbing
/// the scanner the response variant will later drive for real.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Ongoing,
    Complete,
    TooLarge,
    Error,
}

/// One parsed chunk, or the sentinel meaning "not enough bytes yet".
pub enum ChunkExtract {
    Chunk { data: Vec<u8>, size: usize },
    Final,
    NoChunk,
}

/// Capped inbound buffer shared by sockets, CGI read pipes, and (trivially,
/// since local file reads never block) files.
#[derive(Debug, Default)]
pub struct InBuffer {
    buf: Vec<u8>,
    pub total_body_bytes: usize,
}

impl InBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// True when the buffer is within one read-chunk of the cap — the engine's
    /// backpressure signal: callers should skip further socket reads until
    /// this buffer is drained.
    pub fn is_backpressured(&self) -> bool {
        self.buf.len() + READ_CHUNK > MAX_READ_BUFFER
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Reads from `src` until EAGAIN/EOF/cap, filling this buffer. Returns
    /// `Ok(true)` on EOF, `Ok(false)` otherwise (including would-block).
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<bool> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if self.is_backpressured() {
                return Ok(false);
            }
            match src.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the header block up to and including `\r\n\r\n`, with that
    /// delimiter consumed but not included in the returned bytes. Empty
    /// (`None`) if the terminator hasn't arrived yet.
    pub fn extract_headers(&mut self) -> Option<Vec<u8>> {
        let pos = find_subsequence(&self.buf, b"\r\n\r\n", 0)?;
        let head = self.buf[..pos].to_vec();
        self.buf.drain(..pos + 4);
        Some(head)
    }

    pub fn extract_n(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.buf.len());
        self.buf.drain(..n).collect()
    }

    pub fn extract_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn peek(&self) -> &[u8] {
        &self.buf
    }

    /// Parses one `hex-size CRLF payload CRLF` unit without requiring the
    /// caller to have already validated completeness.
    pub fn extract_http_chunk(&mut self, max_chunk: usize) -> ChunkExtract {
        let Some(line_end) = find_subsequence(&self.buf, b"\r\n", 0) else {
            if self.buf.len() > 18 {
                return ChunkExtract::NoChunk;
            }
            return ChunkExtract::NoChunk;
        };
        let hex = String::from_utf8_lossy(&self.buf[..line_end]);
        let hex = hex.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(hex, 16) else {
            return ChunkExtract::NoChunk;
        };
        if size > max_chunk {
            return ChunkExtract::NoChunk;
        }
        if size == 0 {
            if self.buf.len() < line_end + 4 {
                return ChunkExtract::NoChunk;
            }
            self.buf.drain(..line_end + 4);
            return ChunkExtract::Final;
        }
        let needed = line_end + 2 + size + 2;
        if self.buf.len() < needed {
            return ChunkExtract::NoChunk;
        }
        let data = self.buf[line_end + 2..line_end + 2 + size].to_vec();
        self.buf.drain(..needed);
        ChunkExtract::Chunk { data, size }
    }

    /// Classifies the buffer's chunked-body framing without consuming it.
    pub fn chunk_status(&self, max_chunk: usize) -> ChunkStatus {
        let mut pos = 0usize;
        loop {
            let Some(rel) = find_subsequence(&self.buf, b"\r\n", pos) else {
                return ChunkStatus::Ongoing;
            };
            let hex = String::from_utf8_lossy(&self.buf[pos..rel]);
            let hex = hex.split(';').next().unwrap_or("").trim();
            let Ok(size) = usize::from_str_radix(hex, 16) else {
                return ChunkStatus::Error;
            };
            if size > max_chunk {
                return ChunkStatus::TooLarge;
            }
            if size == 0 {
                return if self.buf.len() >= rel + 4 {
                    ChunkStatus::Complete
                } else {
                    ChunkStatus::Ongoing
                };
            }
            let next = rel + 2 + size + 2;
            if self.buf.len() < next {
                return ChunkStatus::Ongoing;
            }
            if self.buf[rel + 2 + size..next] != *b"\r\n" {
                return ChunkStatus::Error;
            }
            pos = next;
        }
    }
}

pub fn find_subsequence(hay: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() || start >= hay.len() {
        return None;
    }
    hay[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}

/// Any source a `BodyWriter` can drain from: a plain in-memory slice, or
/// another readable descriptor (file, CGI stdout pipe).
pub enum BodySource<'a> {
    Bytes(&'a [u8]),
    Reader(&'a mut dyn Read),
}

/// Remembers a write that didn't fully drain and retries it before emitting
/// any new bytes — the mechanism that keeps partial writes invisible to
/// response variants. At most `DEFAULT_CHUNK_SIZE` of *new* body is read out
/// of a source per tick; a non-empty carry-over is retried in full first.
#[derive(Debug, Default)]
pub struct BodyWriter {
    pending: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Everything queued (old + any new) was written.
    Drained,
    /// Some bytes remain queued for the next tick.
    Partial,
    /// The destination reported would-block before any progress on `pending`.
    WouldBlock,
}

impl BodyWriter {
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn flush_pending<W: Write>(&mut self, to: &mut W) -> io::Result<WriteOutcome> {
        if self.pending.is_empty() {
            return Ok(WriteOutcome::Drained);
        }
        match to.write(&self.pending) {
            Ok(0) => Ok(WriteOutcome::WouldBlock),
            Ok(n) => {
                self.pending.drain(..n);
                if self.pending.is_empty() {
                    Ok(WriteOutcome::Drained)
                } else {
                    Ok(WriteOutcome::Partial)
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(WriteOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Sends plain bytes from `source`, chunk-framed as raw bytes (Static/
    /// FullBuffer-CGI style): no hex-size prefix, just the payload.
    pub fn send_body_as_string<W: Write>(
        &mut self,
        source: &mut BodySource<'_>,
        to: &mut W,
    ) -> io::Result<WriteOutcome> {
        if !self.pending.is_empty() {
            return self.flush_pending(to);
        }
        self.pull(source, DEFAULT_CHUNK_SIZE)?;
        self.flush_pending(to)
    }

    /// Sends bytes from `source` with `hex-size CRLF ... CRLF` framing
    /// (File/Chunked-CGI style). The framing for one emitted chunk is always
    /// written as a single unit once queued.
    pub fn send_body_as_http_chunk<W: Write>(
        &mut self,
        source: &mut BodySource<'_>,
        to: &mut W,
    ) -> io::Result<WriteOutcome> {
        if !self.pending.is_empty() {
            return self.flush_pending(to);
        }
        let mut raw = Vec::new();
        self.pull_into(source, DEFAULT_CHUNK_SIZE, &mut raw)?;
        if raw.is_empty() {
            return Ok(WriteOutcome::Drained);
        }
        self.pending = format!("{:x}\r\n", raw.len()).into_bytes();
        self.pending.extend_from_slice(&raw);
        self.pending.extend_from_slice(b"\r\n");
        self.flush_pending(to)
    }

    fn pull(&mut self, source: &mut BodySource<'_>, max: usize) -> io::Result<()> {
        let mut raw = Vec::new();
        self.pull_into(source, max, &mut raw)?;
        self.pending = raw;
        Ok(())
    }

    fn pull_into(&mut self, source: &mut BodySource<'_>, max: usize, out: &mut Vec<u8>) -> io::Result<()> {
        match source {
            BodySource::Bytes(b) => {
                let n = b.len().min(max);
                out.extend_from_slice(&b[..n]);
                *b = &b[n..];
            }
            BodySource::Reader(r) => {
                let mut chunk = vec![0u8; max];
                match r.read(&mut chunk) {
                    Ok(n) => out.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_headers_consumes_exactly_up_to_terminator() {
        let mut buf = InBuffer::new();
        buf.extend(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODY");
        let head = buf.extract_headers().unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x");
        assert_eq!(buf.peek(), b"BODY");
    }

    #[test]
    fn extract_headers_none_when_incomplete() {
        let mut buf = InBuffer::new();
        buf.extend(b"GET / HTTP/1.1\r\nHost: x\r\n");
        assert!(buf.extract_headers().is_none());
    }

    #[test]
    fn chunk_status_ongoing_then_complete() {
        let mut buf = InBuffer::new();
        buf.extend(b"5\r\nhello\r\n");
        assert_eq!(buf.chunk_status(1024), ChunkStatus::Ongoing);
        buf.extend(b"0\r\n\r\n");
        assert_eq!(buf.chunk_status(1024), ChunkStatus::Complete);
    }

    #[test]
    fn chunk_status_too_large() {
        let mut buf = InBuffer::new();
        buf.extend(b"400\r\n");
        assert_eq!(buf.chunk_status(16), ChunkStatus::TooLarge);
    }

    #[test]
    fn chunk_status_bad_hex_is_error() {
        let mut buf = InBuffer::new();
        buf.extend(b"zz\r\nhello\r\n");
        assert_eq!(buf.chunk_status(1024), ChunkStatus::Error);
    }

    #[test]
    fn extract_http_chunk_round_trips_payload() {
        let mut buf = InBuffer::new();
        buf.extend(b"5\r\nhello\r\n0\r\n\r\n");
        match buf.extract_http_chunk(1024) {
            ChunkExtract::Chunk { data, size } => {
                assert_eq!(size, 5);
                assert_eq!(data, b"hello");
            }
            _ => panic!("expected a chunk"),
        }
        match buf.extract_http_chunk(1024) {
            ChunkExtract::Final => {}
            _ => panic!("expected final chunk"),
        }
    }

    #[test]
    fn body_writer_retries_partial_before_new_bytes() {
        struct Jammed(Vec<u8>, usize);
        impl Write for Jammed {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                let n = buf.len().min(self.1);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut dest = Jammed(Vec::new(), 3);
        let mut writer = BodyWriter::default();
        let mut data: &[u8] = b"hello world";
        let mut src = BodySource::Bytes(&mut data);
        let outcome = writer.send_body_as_string(&mut src, &mut dest).unwrap();
        assert_eq!(outcome, WriteOutcome::Partial);
        assert!(!writer.is_empty());
        // a second tick must retry the same leftover bytes, not pull new ones
        let mut more: &[u8] = b"";
        let mut src2 = BodySource::Bytes(&mut more);
        writer.send_body_as_string(&mut src2, &mut dest).unwrap();
        assert_eq!(&dest.0[..], b"hel");
    }
}
