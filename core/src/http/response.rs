//! Response head parsing and the two ways of holding a body.

use std::io::{self, BufRead, Read};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::body::{read_line, Body, Framing};
use super::headers::Headers;
use crate::error::{ProtocolError, Result};
use crate::transport::Connection;

/// Upper bound on the status line plus headers.
const MAX_HEAD: usize = 64 * 1024;

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Read up to and including the blank line that ends the head.
    pub fn read_from<R: BufRead>(r: &mut R) -> Result<Self> {
        let mut budget = MAX_HEAD;
        let status_line = next_head_line(r, &mut budget)?
            .ok_or_else(|| ProtocolError::MalformedHeader("empty response".into()))?;
        let (status, reason) = parse_status_line(&status_line)?;

        let mut headers = Headers::new();
        loop {
            let line = next_head_line(r, &mut budget)?.ok_or_else(|| {
                ProtocolError::MalformedHeader("connection closed inside headers".into())
            })?;
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(&line)?;
            headers.append(name, value);
        }
        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    pub fn framing(&self) -> Result<Framing> {
        Framing::for_response(self.status, &self.headers)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

fn next_head_line<R: BufRead>(r: &mut R, budget: &mut usize) -> Result<Option<String>> {
    let Some(line) = read_line(r, *budget)? else {
        return Ok(None);
    };
    *budget = budget.saturating_sub(line.len() + 2);
    if *budget == 0 {
        return Err(ProtocolError::MalformedHeader(format!(
            "response head exceeds {MAX_HEAD} bytes"
        ))
        .into());
    }
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| ProtocolError::MalformedHeader("response head is not UTF-8".into()).into())
}

fn parse_status_line(line: &str) -> Result<(u16, String)> {
    let malformed = || ProtocolError::MalformedHeader(format!("bad status line {line:?}"));
    let mut parts = line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(malformed().into());
    }
    let code = parts.next().ok_or_else(malformed)?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed().into());
    }
    let status = code.parse::<u16>().map_err(|_| malformed())?;
    if status < 100 {
        return Err(malformed().into());
    }
    let reason = parts.next().unwrap_or_default().trim().to_string();
    Ok((status, reason))
}

fn parse_header_line(line: &str) -> Result<(&str, &str)> {
    let malformed = || ProtocolError::MalformedHeader(format!("bad header line {line:?}"));
    // Obsolete line folding is not supported.
    if line.starts_with(|c: char| c == ' ' || c == '\t') {
        return Err(malformed().into());
    }
    let (name, value) = line.split_once(':').ok_or_else(malformed)?;
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
        return Err(malformed().into());
    }
    Ok((name, value.trim()))
}

/// A response with its body read into memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Read a complete response: head, then the body framed as the headers say.
    pub fn read_from<R: BufRead>(r: &mut R) -> Result<Self> {
        let head = ResponseHead::read_from(r)?;
        let framing = head.framing()?;
        debug!(status = head.status, ?framing, "response head");
        let body = Body::new(&mut *r, framing).read_all()?;
        Ok(Self {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Deserialize the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The `message` field of a JSON error body, as the daemon sends with
    /// 4xx and 5xx statuses.
    pub fn error_message(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct ErrorBody {
            message: String,
        }
        if self.is_success() {
            return None;
        }
        serde_json::from_slice::<ErrorBody>(&self.body)
            .ok()
            .map(|b| b.message)
    }
}

/// A response whose body is still on the wire.
///
/// Iterating yields the body one piece at a time, as it arrives. The
/// connection is closed when the body ends, when a read fails, when
/// `close` is called, or when the value is dropped, so an endless stream
/// (live stats, followed logs) is cancelled by simply not pulling any more.
#[derive(Debug)]
pub struct StreamingResponse {
    head: ResponseHead,
    body: Body<Connection>,
}

impl StreamingResponse {
    /// Read the head off `conn` and take ownership of it for the body.
    pub fn start(mut conn: Connection) -> Result<Self> {
        let head = ResponseHead::read_from(&mut conn)?;
        let framing = head.framing()?;
        debug!(status = head.status, ?framing, "streaming response head");
        let mut body = Body::new(conn, framing);
        if body.is_done() {
            body.get_mut().close();
        }
        Ok(Self { head, body })
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    pub fn status(&self) -> u16 {
        self.head.status
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn is_success(&self) -> bool {
        self.head.is_success()
    }

    pub fn is_closed(&self) -> bool {
        !self.body.get_ref().is_open()
    }

    /// The next piece of the body; `None` once the body has ended or the
    /// response was closed. Never reads past a close.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Ok(None);
        }
        match self.body.next_chunk() {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.close();
                Ok(None)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Read whatever is left of the body into memory and close.
    pub fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk()? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Stop reading and release the connection. Idempotent.
    pub fn close(&mut self) {
        self.body.get_mut().close();
    }
}

impl Iterator for StreamingResponse {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}

impl Read for StreamingResponse {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Ok(0);
        }
        match self.body.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.close();
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, IoError};

    #[test]
    fn reads_length_framed_response() {
        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"Id\":\"abc\"}\n";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.reason, "OK");
        assert_eq!(resp.body, b"{\"Id\":\"abc\"}\n");
        assert_eq!(resp.body.len(), 13);
        assert!(resp.is_success());
    }

    #[test]
    fn reason_phrase_may_contain_spaces_or_be_missing() {
        let mut wire: &[u8] = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let head = ResponseHead::read_from(&mut wire).unwrap();
        assert_eq!(head.reason, "Not Found");

        let mut wire: &[u8] = b"HTTP/1.0 204\r\n\r\n";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.status, 204);
        assert_eq!(resp.reason, "");
        assert!(resp.body.is_empty());
    }

    #[test]
    fn headers_are_trimmed_and_case_insensitive() {
        let mut wire: &[u8] =
            b"HTTP/1.1 200 OK\r\nContent-Type:application/json \r\nApi-Version:  1.41\r\nContent-Length: 2\r\n\r\n{}";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
        assert_eq!(resp.headers.get("API-VERSION"), Some("1.41"));
        assert_eq!(resp.text(), "{}");
    }

    #[test]
    fn malformed_heads_are_rejected() {
        let cases: &[&[u8]] = &[
            b"",
            b"garbage\r\n\r\n",
            b"HTTP/1.1 2000 OK\r\n\r\n",
            b"HTTP/1.1 abc OK\r\n\r\n",
            b"HTTP/2 200 OK\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nNoColonHere\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nBad Name: x\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nA: b\r\n folded\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n",
        ];
        for wire in cases {
            let mut r = *wire;
            let err = ResponseHead::read_from(&mut r).unwrap_err();
            assert!(
                matches!(err, Error::Protocol(ProtocolError::MalformedHeader(_))),
                "{:?} gave {err:?}",
                String::from_utf8_lossy(wire)
            );
        }
    }

    #[test]
    fn oversized_head_is_rejected() {
        let mut wire = b"HTTP/1.1 200 OK\r\n".to_vec();
        for i in 0..4000 {
            wire.extend_from_slice(format!("X-Filler-{i}: 0123456789\r\n").as_bytes());
        }
        wire.extend_from_slice(b"\r\n");
        let mut r: &[u8] = &wire;
        assert!(ResponseHead::read_from(&mut r).is_err());
    }

    #[test]
    fn chunked_response_is_buffered_whole() {
        let mut wire: &[u8] =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.body, b"hello world");
    }

    #[test]
    fn read_until_close_response() {
        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/x-tar\r\n\r\nrawbytes";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.body, b"rawbytes");
    }

    #[test]
    fn json_body_and_error_message() {
        let mut wire: &[u8] =
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 39\r\n\r\n{\"message\":\"No such container: abc123\"}";
        let resp = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(resp.error_message().as_deref(), Some("No such container: abc123"));
        let value: serde_json::Value = resp.json().unwrap();
        assert_eq!(value["message"], "No such container: abc123");

        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n[]";
        let ok = HttpResponse::read_from(&mut wire).unwrap();
        assert_eq!(ok.error_message(), None);
        assert!(ok.json::<Vec<u32>>().unwrap().is_empty());
    }

    #[test]
    fn truncated_length_body() {
        let mut wire: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"Id\":\"abc\"}";
        let err = HttpResponse::read_from(&mut wire).unwrap_err();
        assert!(matches!(err, Error::Io(IoError::TruncatedBody { .. })));
    }
}
