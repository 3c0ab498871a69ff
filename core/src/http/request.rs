//! Request values and their HTTP/1.1 wire encoding.

use std::fmt;
use std::io::{self, Write};

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;

use super::headers::Headers;
use crate::error::{Error, ProtocolError, Result};

/// Everything outside the RFC 3986 unreserved set.
const QUERY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP request, immutable once built.
///
/// Query parameters keep the order they were added in and may repeat
/// (`tag=a&tag=b`). When a body is present the `Content-Length` header
/// matches it; `RequestBuilder::build` enforces that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    method: HttpMethod,
    path: String,
    query: Vec<(String, String)>,
    headers: Headers,
    body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn builder(method: HttpMethod, path: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, path)
    }

    pub fn method(&self) -> HttpMethod {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    /// The request target: path plus the percent-encoded query string.
    pub fn target(&self) -> String {
        if self.query.is_empty() {
            return self.path.clone();
        }
        let query = self
            .query
            .iter()
            .map(|(k, v)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(k, QUERY_COMPONENT),
                    utf8_percent_encode(v, QUERY_COMPONENT)
                )
            })
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.path, query)
    }

    /// The exact bytes of this request.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.as_ref().map_or(0, Vec::len));
        // Writing into a Vec cannot fail.
        let _ = self.write_to(&mut out);
        out
    }

    /// Serialize onto `w`. Headers are written as given; `Content-Length` is
    /// never recomputed here.
    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        write!(w, "{} {} HTTP/1.1\r\n", self.method, self.target())?;
        for (name, value) in self.headers.iter() {
            write!(w, "{name}: {value}\r\n")?;
        }
        w.write_all(b"\r\n")?;
        if let Some(body) = &self.body {
            w.write_all(body)?;
        }
        Ok(())
    }
}

/// Builds an `HttpRequest`.
#[derive(Debug)]
pub struct RequestBuilder {
    request: HttpRequest,
    error: Option<Error>,
}

impl RequestBuilder {
    fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            request: HttpRequest {
                method,
                path: path.into(),
                query: Vec::new(),
                headers: Headers::new(),
                body: None,
            },
            error: None,
        }
    }

    /// Append a query parameter. Repeated keys are kept.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.request.query.push((key.into(), value.into()));
        self
    }

    /// Set a header, replacing any previous value under the same name. A
    /// name that is not a token, or a value with CR, LF or NUL in it, makes
    /// `build` fail.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        if let Err(err) = check_header(&name, &value) {
            self.error.get_or_insert(err.into());
            return self;
        }
        self.request.headers.set(name, value);
        self
    }

    /// Attach a body and set `Content-Length` to its length.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        self.request
            .headers
            .set("Content-Length", body.len().to_string());
        self.request.body = Some(body);
        self
    }

    /// Serialize `value` as the JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => self
                .header("Content-Type", "application/json")
                .body(body),
            Err(err) => {
                self.error.get_or_insert(err.into());
                self
            }
        }
    }

    pub fn build(self) -> Result<HttpRequest> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let path = &self.request.path;
        if path.is_empty() || path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(ProtocolError::InvalidRequest(format!("bad request path {path:?}")).into());
        }
        let actual = self.request.body.as_ref().map_or(0, Vec::len);
        if let Some(declared) = self.request.headers.get("Content-Length") {
            if declared.trim().parse::<usize>().ok() != Some(actual) {
                return Err(ProtocolError::ContentLengthMismatch {
                    declared: declared.to_string(),
                    actual,
                }
                .into());
            }
        }
        Ok(self.request)
    }
}

fn check_header(name: &str, value: &str) -> std::result::Result<(), ProtocolError> {
    if name.is_empty()
        || name
            .bytes()
            .any(|b| b == b':' || b.is_ascii_whitespace() || b.is_ascii_control())
    {
        return Err(ProtocolError::InvalidRequest(format!("bad header name {name:?}")));
    }
    if value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0)) {
        return Err(ProtocolError::InvalidRequest(format!(
            "line break in the value of header {name}"
        )));
    }
    Ok(())
}
