//! Decoders for the two body formats of the daemon's long-running endpoints.
//!
//! # Design
//! Both wrap any `Read`, typically a `StreamingResponse`, and decode lazily:
//! nothing is read until the next item is asked for, so an endless stats or
//! log stream can be consumed item by item and dropped at any point.
//!
//! - `JsonLines`: a sequence of JSON values separated by newlines, as sent
//!   by image pulls and by stats with `stream=1`.
//! - `Demux`: the 8-byte-header framing that interleaves stdout and stderr
//!   on one body when no TTY is attached (logs, attach, exec).

use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde_json::de::IoRead;
use serde_json::StreamDeserializer;

use crate::error::{Error, IoError, ProtocolError, Result};

/// Iterator over newline-delimited JSON values read from `R`.
///
/// Stops after the first error. Errors raised by the underlying reader
/// (for example a truncated chunked body) come back as the original
/// variant rather than as a JSON error.
pub struct JsonLines<R: Read, T> {
    inner: StreamDeserializer<'static, IoRead<R>, T>,
}

impl<R: Read, T: DeserializeOwned> JsonLines<R, T> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: serde_json::Deserializer::from_reader(reader).into_iter(),
        }
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for JsonLines<R, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map_err(|err| {
            if err.is_io() {
                Error::from(io::Error::from(err))
            } else {
                Error::Json(err)
            }
        }))
    }
}

/// Which output a multiplexed frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

/// One multiplexed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub data: Vec<u8>,
}

/// Stdout and stderr collected from a multiplexed body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

const FRAME_HEADER: usize = 8;

/// Iterator over multiplexed frames: `[stream, 0, 0, 0, size as u32 BE]`
/// followed by `size` bytes.
#[derive(Debug)]
pub struct Demux<R> {
    inner: R,
    done: bool,
}

impl<R: Read> Demux<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, done: false }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Drain the stream, appending each frame to the output it belongs to.
    /// Frames on stdin are dropped.
    pub fn collect_output(self) -> Result<Output> {
        let mut out = Output::default();
        for frame in self {
            let frame = frame?;
            match frame.stream {
                StreamKind::Stdout => out.stdout.extend_from_slice(&frame.data),
                StreamKind::Stderr => out.stderr.extend_from_slice(&frame.data),
                StreamKind::Stdin => {}
            }
        }
        Ok(out)
    }

    fn read_frame(&mut self) -> Result<Option<Frame>> {
        let mut header = [0u8; FRAME_HEADER];
        let n = read_full(&mut self.inner, &mut header)?;
        if n == 0 {
            return Ok(None);
        }
        if n < FRAME_HEADER {
            return Err(IoError::TruncatedBody {
                expected: FRAME_HEADER as u64,
                received: n as u64,
            }
            .into());
        }
        let stream = StreamKind::from_byte(header[0])
            .filter(|_| header[1..4] == [0u8; 3])
            .ok_or_else(|| {
                ProtocolError::MalformedFrame(format!("unexpected frame header {header:02x?}"))
            })?;
        let size = u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));
        // Grows with what arrives, not with what the header claims.
        let mut data = Vec::new();
        let got = (&mut self.inner).take(size).read_to_end(&mut data)? as u64;
        if got < size {
            return Err(IoError::TruncatedBody {
                expected: size,
                received: got,
            }
            .into());
        }
        Ok(Some(Frame { stream, data }))
    }
}

impl<R: Read> Iterator for Demux<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.read_frame().transpose();
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
