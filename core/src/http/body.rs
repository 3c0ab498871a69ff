//! Response body framing: fixed length, chunked, or read until close.
//!
//! # Design
//! `Body` is a small state machine over any `BufRead`. It can be consumed
//! through `std::io::Read` (for decoders layered on top, such as JSON lines)
//! or one chunk at a time through `next_chunk` (for live endpoints). Both
//! paths share the same state, so the framing mode picked from the headers
//! never changes halfway through a read.

use std::io::{self, BufRead, Read};

use tracing::trace;

use super::headers::Headers;
use crate::error::{Error, IoError, ProtocolError, Result};

/// Upper bound on a chunk-size or trailer line.
const MAX_LINE: usize = 4096;

/// Size of the pieces handed out for length-framed and read-until-close bodies.
const READ_PIECE: usize = 8 * 1024;

/// How the end of a response body is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No length given: the body ends when the peer closes.
    UntilClose,
}

impl Framing {
    /// Pick the framing for a response. Chunked wins over `Content-Length`;
    /// with neither, the body runs until the peer closes. Statuses that never
    /// carry a body (1xx, 204, 304) are zero length whatever the headers say.
    pub fn for_response(status: u16, headers: &Headers) -> Result<Self> {
        if (100..200).contains(&status) || status == 204 || status == 304 {
            return Ok(Framing::Length(0));
        }
        let codings: Vec<&str> = headers
            .get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .collect();
        if let Some(last) = codings.last() {
            if last.eq_ignore_ascii_case("chunked") {
                return Ok(Framing::Chunked);
            }
            return Ok(Framing::UntilClose);
        }

        let mut length = None;
        for value in headers.get_all("Content-Length") {
            let parsed = value.trim().parse::<u64>().map_err(|_| {
                ProtocolError::MalformedHeader(format!("invalid Content-Length {value:?}"))
            })?;
            match length {
                Some(prev) if prev != parsed => {
                    return Err(ProtocolError::MalformedHeader(format!(
                        "conflicting Content-Length values {prev} and {parsed}"
                    ))
                    .into())
                }
                _ => length = Some(parsed),
            }
        }
        Ok(length.map_or(Framing::UntilClose, Framing::Length))
    }
}

/// One decoded unit of a chunked body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChunkFrame {
    Data(Vec<u8>),
    /// The zero-length terminator. Trailers have already been discarded.
    Last,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Length { declared: u64, remaining: u64 },
    /// Between chunks: the next thing on the wire is a chunk-size line.
    ChunkSize,
    ChunkData { declared: u64, remaining: u64 },
    UntilClose,
    Done,
}

/// A response body being read off `R`.
#[derive(Debug)]
pub struct Body<R> {
    inner: R,
    state: State,
}

impl<R: BufRead> Body<R> {
    pub fn new(inner: R, framing: Framing) -> Self {
        let state = match framing {
            Framing::Length(0) => State::Done,
            Framing::Length(n) => State::Length {
                declared: n,
                remaining: n,
            },
            Framing::Chunked => State::ChunkSize,
            Framing::UntilClose => State::UntilClose,
        };
        Self { inner, state }
    }

    /// True once the body has been read to its end.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// The next piece of the body, or `None` at its end. For chunked bodies a
    /// piece is one chunk as the peer sent it.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        match self.state {
            State::Done => Ok(None),
            State::ChunkSize => match self.read_chunk_frame()? {
                Some(ChunkFrame::Data(data)) => Ok(Some(data)),
                Some(ChunkFrame::Last) | None => Ok(None),
            },
            State::ChunkData { remaining, .. } => {
                // Resume a chunk that a caller of `read` left half-consumed.
                let mut data = Vec::new();
                self.read_limited(&mut data, remaining)?;
                Ok(Some(data))
            }
            State::Length { remaining, .. } => {
                let mut data = Vec::new();
                self.read_limited(&mut data, remaining.min(READ_PIECE as u64))?;
                Ok(Some(data))
            }
            State::UntilClose => {
                let mut data = vec![0u8; READ_PIECE];
                let n = read_retrying(&mut self.inner, &mut data)?;
                if n == 0 {
                    self.state = State::Done;
                    return Ok(None);
                }
                data.truncate(n);
                Ok(Some(data))
            }
        }
    }

    /// Read the whole remaining body into memory.
    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(piece) = self.next_chunk()? {
            out.extend_from_slice(&piece);
        }
        Ok(out)
    }

    /// Decode one chunk frame. `None` means the peer closed cleanly between
    /// chunks without sending the terminator.
    fn read_chunk_frame(&mut self) -> Result<Option<ChunkFrame>> {
        let Some(line) = read_chunk_line(&mut self.inner)? else {
            trace!("peer closed between chunks");
            self.state = State::Done;
            return Ok(None);
        };
        let size = parse_chunk_size(&line)?;
        trace!(size, "chunk");
        if size == 0 {
            self.discard_trailers()?;
            self.state = State::Done;
            return Ok(Some(ChunkFrame::Last));
        }
        self.state = State::ChunkData {
            declared: size,
            remaining: size,
        };
        let mut data = Vec::new();
        self.read_limited(&mut data, size)?;
        Ok(Some(ChunkFrame::Data(data)))
    }

    fn discard_trailers(&mut self) -> Result<()> {
        while let Some(line) = read_chunk_line(&mut self.inner)? {
            if line.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Append up to `limit` bytes of the current length-framed or chunk
    /// payload to `out`, advancing the state.
    fn read_limited(&mut self, out: &mut Vec<u8>, limit: u64) -> Result<()> {
        let mut left = limit;
        while left > 0 {
            let buf = self.inner.fill_buf()?;
            if buf.is_empty() {
                return Err(self.truncated());
            }
            let n = buf.len().min(left as usize);
            out.extend_from_slice(&buf[..n]);
            self.inner.consume(n);
            self.advance(n as u64)?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Record `n` payload bytes as consumed.
    fn advance(&mut self, n: u64) -> Result<()> {
        match &mut self.state {
            State::Length { remaining, .. } => {
                *remaining -= n;
                if *remaining == 0 {
                    self.state = State::Done;
                }
            }
            State::ChunkData { remaining, .. } => {
                *remaining -= n;
                if *remaining == 0 {
                    expect_crlf(&mut self.inner)?;
                    self.state = State::ChunkSize;
                }
            }
            State::UntilClose | State::ChunkSize | State::Done => {}
        }
        Ok(())
    }

    fn truncated(&self) -> Error {
        let (expected, remaining) = match self.state {
            State::Length {
                declared,
                remaining,
            }
            | State::ChunkData {
                declared,
                remaining,
            } => (declared, remaining),
            _ => (0, 0),
        };
        IoError::TruncatedBody {
            expected,
            received: expected - remaining,
        }
        .into()
    }
}

impl<R: BufRead> Read for Body<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let limit = match self.state {
                State::Done => return Ok(0),
                State::ChunkSize => {
                    match self.read_chunk_size_only().map_err(Error::into_io)? {
                        true => continue,
                        false => return Ok(0),
                    }
                }
                State::Length { remaining, .. } | State::ChunkData { remaining, .. } => {
                    remaining.min(buf.len() as u64) as usize
                }
                State::UntilClose => buf.len(),
            };
            let n = self.inner.read(&mut buf[..limit])?;
            if n == 0 {
                if let State::UntilClose = self.state {
                    self.state = State::Done;
                    return Ok(0);
                }
                return Err(self.truncated().into_io());
            }
            self.advance(n as u64).map_err(Error::into_io)?;
            return Ok(n);
        }
    }
}

impl<R: BufRead> Body<R> {
    /// Read a chunk-size line and move into the data state. Returns false at
    /// the end of the body.
    fn read_chunk_size_only(&mut self) -> Result<bool> {
        let Some(line) = read_chunk_line(&mut self.inner)? else {
            self.state = State::Done;
            return Ok(false);
        };
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            self.discard_trailers()?;
            self.state = State::Done;
            return Ok(false);
        }
        self.state = State::ChunkData {
            declared: size,
            remaining: size,
        };
        Ok(true)
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::MalformedChunk("chunk size is not ASCII".into()))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    if digits.is_empty() || digits.len() > 16 {
        return Err(ProtocolError::MalformedChunk(format!("bad chunk size line {text:?}")).into());
    }
    u64::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::MalformedChunk(format!("bad chunk size line {text:?}")).into())
}

fn expect_crlf<R: BufRead>(r: &mut R) -> Result<()> {
    let mut crlf = [0u8; 2];
    let mut got = 0;
    while got < 2 {
        let n = read_retrying(r, &mut crlf[got..])?;
        if n == 0 {
            return Err(ProtocolError::MalformedChunk("missing CRLF after chunk data".into()).into());
        }
        got += n;
    }
    if &crlf != b"\r\n" {
        return Err(ProtocolError::MalformedChunk("missing CRLF after chunk data".into()).into());
    }
    Ok(())
}

fn read_retrying<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match r.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// `read_line` for chunk-size and trailer lines, where a line cut off or
/// over the limit is a malformed chunk.
fn read_chunk_line<R: BufRead>(r: &mut R) -> Result<Option<Vec<u8>>> {
    read_line(r, MAX_LINE).map_err(|err| match err {
        Error::Protocol(ProtocolError::MalformedHeader(reason)) => {
            ProtocolError::MalformedChunk(reason).into()
        }
        other => other,
    })
}

/// Read one line, stripping the trailing CRLF (or bare LF). `None` means EOF
/// before any byte of the line. A line longer than `limit` is a protocol
/// error, as is EOF in the middle of a line.
pub(crate) fn read_line<R: BufRead>(r: &mut R, limit: usize) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    loop {
        let buf = match r.fill_buf() {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if buf.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(ProtocolError::MalformedHeader("connection closed mid-line".into()).into());
        }
        let (take, found) = match buf.iter().position(|&b| b == b'\n') {
            Some(i) => (i + 1, true),
            None => (buf.len(), false),
        };
        line.extend_from_slice(&buf[..take]);
        r.consume(take);
        if line.len() > limit + 2 {
            return Err(ProtocolError::MalformedHeader(format!("line exceeds {limit} bytes")).into());
        }
        if found {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Ok(Some(line));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(wire: &[u8], framing: Framing) -> Body<&[u8]> {
        Body::new(wire, framing)
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let headers: Headers = [("Content-Length", "5"), ("Transfer-Encoding", "chunked")]
            .into_iter()
            .collect();
        assert_eq!(Framing::for_response(200, &headers).unwrap(), Framing::Chunked);
    }

    #[test]
    fn framing_from_length_or_close() {
        let with_len: Headers = [("content-length", " 42 ")].into_iter().collect();
        assert_eq!(
            Framing::for_response(200, &with_len).unwrap(),
            Framing::Length(42)
        );
        assert_eq!(
            Framing::for_response(200, &Headers::new()).unwrap(),
            Framing::UntilClose
        );
        let gzip_only: Headers = [("Transfer-Encoding", "gzip")].into_iter().collect();
        assert_eq!(
            Framing::for_response(200, &gzip_only).unwrap(),
            Framing::UntilClose
        );
    }

    #[test]
    fn bodiless_statuses_ignore_headers() {
        let headers: Headers = [("Content-Length", "10")].into_iter().collect();
        assert_eq!(Framing::for_response(204, &headers).unwrap(), Framing::Length(0));
        assert_eq!(Framing::for_response(304, &Headers::new()).unwrap(), Framing::Length(0));
    }

    #[test]
    fn bad_content_length_is_malformed_header() {
        for value in ["-1", "abc", ""] {
            let headers: Headers = [("Content-Length", value)].into_iter().collect();
            assert!(matches!(
                Framing::for_response(200, &headers),
                Err(Error::Protocol(ProtocolError::MalformedHeader(_)))
            ));
        }
        let conflicting: Headers = [("Content-Length", "1"), ("Content-Length", "2")]
            .into_iter()
            .collect();
        assert!(Framing::for_response(200, &conflicting).is_err());
    }

    #[test]
    fn decodes_chunks_one_by_one() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\nX-Trailer: y\r\n\r\nleftover";
        let mut b = body(wire, Framing::Chunked);
        assert_eq!(b.next_chunk().unwrap().unwrap(), b"Wiki");
        assert_eq!(b.next_chunk().unwrap().unwrap(), b"pedia");
        assert_eq!(b.next_chunk().unwrap().unwrap(), b" in\r\n\r\nchunks.");
        assert_eq!(b.next_chunk().unwrap(), None);
        assert!(b.is_done());
        assert_eq!(b.into_inner(), b"leftover");
    }

    #[test]
    fn chunked_and_length_framing_agree() {
        let payload = b"{\"read\":\"2024-01-01\"}\n{\"read\":\"2024-01-02\"}\n";
        let mut chunked = Vec::new();
        for piece in payload.chunks(7) {
            chunked.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
            chunked.extend_from_slice(piece);
            chunked.extend_from_slice(b"\r\n");
        }
        chunked.extend_from_slice(b"0\r\n\r\n");

        let from_chunks = body(&chunked, Framing::Chunked).read_all().unwrap();
        let from_length = body(payload, Framing::Length(payload.len() as u64))
            .read_all()
            .unwrap();
        assert_eq!(from_chunks, from_length);
        assert_eq!(from_chunks, payload);
    }

    #[test]
    fn read_trait_matches_next_chunk() {
        let wire = b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n";
        let mut via_read = Vec::new();
        body(wire, Framing::Chunked)
            .read_to_end(&mut via_read)
            .unwrap();
        assert_eq!(via_read, b"abcde");

        // Mixing: a partial read, then chunk iteration picks up the rest.
        let mut b = body(wire, Framing::Chunked);
        let mut first = [0u8; 2];
        b.read_exact(&mut first).unwrap();
        assert_eq!(&first, b"ab");
        assert_eq!(b.next_chunk().unwrap().unwrap(), b"c");
        assert_eq!(b.next_chunk().unwrap().unwrap(), b"de");
        assert_eq!(b.next_chunk().unwrap(), None);
    }

    #[test]
    fn malformed_chunk_size() {
        let mut b = body(b"zz\r\nabc\r\n", Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Protocol(ProtocolError::MalformedChunk(_)))
        ));
        let mut b = body(b"\r\n", Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Protocol(ProtocolError::MalformedChunk(_)))
        ));
        // Size line cut off by EOF.
        let mut b = body(b"a", Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Protocol(ProtocolError::MalformedChunk(_)))
        ));
        let long = format!("{}\r\nabc\r\n", "0".repeat(5000));
        let mut b = body(long.as_bytes(), Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Protocol(ProtocolError::MalformedChunk(_)))
        ));
        // Same through `Read`.
        let mut out = Vec::new();
        let err = body(b"a", Framing::Chunked).read_to_end(&mut out).unwrap_err();
        assert!(matches!(
            Error::from(err),
            Error::Protocol(ProtocolError::MalformedChunk(_))
        ));
    }

    #[test]
    fn missing_crlf_after_chunk_is_malformed() {
        let mut b = body(b"3\r\nabcXY0\r\n\r\n", Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Protocol(ProtocolError::MalformedChunk(_)))
        ));
    }

    #[test]
    fn eof_inside_chunk_is_truncation() {
        let mut b = body(b"a\r\n12345", Framing::Chunked);
        assert!(matches!(
            b.next_chunk(),
            Err(Error::Io(IoError::TruncatedBody {
                expected: 10,
                received: 5
            }))
        ));
    }

    #[test]
    fn eof_between_chunks_ends_the_stream() {
        let mut b = body(b"2\r\nok\r\n", Framing::Chunked);
        assert_eq!(b.next_chunk().unwrap().unwrap(), b"ok");
        assert_eq!(b.next_chunk().unwrap(), None);
    }

    #[test]
    fn content_length_short_by_one_byte() {
        let payload = b"{\"Id\":\"abc\"}";
        let mut b = body(payload, Framing::Length(13));
        let err = b.read_all().unwrap_err();
        assert!(matches!(
            err,
            Error::Io(IoError::TruncatedBody {
                expected: 13,
                received: 12
            })
        ));

        let mut buf = Vec::new();
        let io_err = body(payload, Framing::Length(13))
            .read_to_end(&mut buf)
            .unwrap_err();
        assert!(matches!(
            Error::from(io_err),
            Error::Io(IoError::TruncatedBody { .. })
        ));
    }

    #[test]
    fn content_length_stops_at_declared_size() {
        let mut b = body(b"hello world", Framing::Length(5));
        assert_eq!(b.read_all().unwrap(), b"hello");
        assert_eq!(b.into_inner(), b" world");
    }

    #[test]
    fn until_close_reads_everything() {
        let big = vec![7u8; READ_PIECE * 2 + 3];
        let mut b = body(&big, Framing::UntilClose);
        let mut pieces = 0;
        let mut total = 0;
        while let Some(piece) = b.next_chunk().unwrap() {
            pieces += 1;
            total += piece.len();
        }
        assert_eq!(total, big.len());
        assert!(pieces >= 3);
    }

    #[test]
    fn read_line_handles_crlf_lf_and_limits() {
        let mut r: &[u8] = b"one\r\ntwo\nthree";
        assert_eq!(read_line(&mut r, 16).unwrap().unwrap(), b"one");
        assert_eq!(read_line(&mut r, 16).unwrap().unwrap(), b"two");
        assert!(read_line(&mut r, 16).is_err());

        let mut r: &[u8] = b"";
        assert_eq!(read_line(&mut r, 16).unwrap(), None);

        let long = vec![b'a'; 64];
        let mut r: &[u8] = &long;
        assert!(read_line(&mut r, 8).is_err());
    }
}
