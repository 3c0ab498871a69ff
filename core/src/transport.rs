//! Blocking byte transport to the daemon.
//!
//! # Design
//! A `Connection` owns exactly one socket for exactly one request/response
//! exchange. Reads go through a `BufReader` so the response decoder can scan
//! for line endings without issuing one syscall per byte; writes bypass the
//! buffer. `close` is idempotent and also runs on drop, so a connection never
//! outlives the call that opened it, whichever way that call exits.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

use tracing::{debug, trace};

use crate::endpoint::Endpoint;
use crate::error::{ConnectionError, Result};

enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixStream::connect(path).map(Stream::Unix),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix domain sockets are not available on this platform",
            )),
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.shutdown(Shutdown::Both),
            Stream::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

/// One open socket to the daemon.
pub struct Connection {
    endpoint: Endpoint,
    inner: Option<BufReader<Stream>>,
}

impl Connection {
    /// Connect to `endpoint`. No retries: the first failure is returned.
    pub fn open(endpoint: &Endpoint) -> std::result::Result<Self, ConnectionError> {
        let stream =
            Stream::connect(endpoint).map_err(|e| ConnectionError::from_io(endpoint, e))?;
        debug!(%endpoint, "connection opened");
        Ok(Self {
            endpoint: endpoint.clone(),
            inner: Some(BufReader::new(stream)),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Write all of `bytes`. The connection is closed if the write fails.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.inner.as_mut().ok_or_else(not_connected)?.get_mut();
        let written = stream.write_all(bytes).and_then(|()| stream.flush());
        if let Err(err) = written {
            self.close();
            return Err(err.into());
        }
        trace!(len = bytes.len(), "sent");
        Ok(())
    }

    /// Tear the socket down. Safe to call any number of times; unread
    /// response data is discarded.
    pub fn close(&mut self) {
        if let Some(reader) = self.inner.take() {
            // The peer may already be gone; there is nothing useful to do with
            // a failed shutdown.
            let _ = reader.get_ref().shutdown();
            debug!(endpoint = %self.endpoint, "connection closed");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.as_mut().ok_or_else(not_connected)?.read(buf)
    }
}

impl BufRead for Connection {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self.inner.as_mut() {
            Some(reader) => reader.fill_buf(),
            None => Err(not_connected()),
        }
    }

    fn consume(&mut self, amt: usize) {
        if let Some(reader) = self.inner.as_mut() {
            reader.consume(amt);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("open", &self.is_open())
            .finish()
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}
