//! The interface the higher-level daemon API is written against.
//!
//! # Design
//! `Client` holds only configuration, so it is cheap to clone and safe to
//! share between threads. Every call opens its own connection, writes one
//! request and reads one response; nothing is pooled or kept alive. The
//! `Dispatch` trait is the seam for the layer above: container, image and
//! exec verbs take `&impl Dispatch`, and tests can hand them a fake.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::archive::{self, ArchiveBuilder};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::http::{HttpMethod, HttpRequest, HttpResponse, RequestBuilder, StreamingResponse};
use crate::transport::Connection;

/// API version sent when none is configured.
pub const DEFAULT_API_VERSION: &str = "v1.24";

/// Where the daemon lives and which API version to tag requests with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Sent as the `Host` header, for example `v1.24`.
    pub api_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }
}

impl ClientConfig {
    /// Read `DOCKER_HOST` and `DOCKER_API_VERSION`, falling back to the
    /// defaults for whichever is unset or empty.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("DOCKER_HOST").filter(|v| !v.trim().is_empty()) {
            config.endpoint = host.parse()?;
        }
        if let Some(version) = lookup("DOCKER_API_VERSION").filter(|v| !v.trim().is_empty()) {
            let version = version.trim();
            config.api_version = if version.starts_with('v') {
                version.to_string()
            } else {
                format!("v{version}")
            };
        }
        Ok(config)
    }
}

/// Sends requests to the daemon. Implemented by `Client`; the layer above
/// depends on this rather than on a concrete client.
pub trait Dispatch {
    /// One complete exchange with the body buffered. The connection is
    /// closed before this returns, whatever the outcome.
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;

    /// Send the request and return as soon as the response head has been
    /// read. The returned response owns the connection.
    fn open_stream(&self, request: &HttpRequest) -> Result<StreamingResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// A client configured from the environment, see `ClientConfig::from_env`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ClientConfig::from_env()?))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.config.endpoint
    }

    /// A request builder carrying the headers every daemon call sends:
    /// `Content-Type: application/json`, `Content-Length: 0`, the API
    /// version as `Host`, and `Accept: */*`. Attaching a body or setting a
    /// header later replaces the defaults.
    pub fn request(&self, method: HttpMethod, path: impl Into<String>) -> RequestBuilder {
        HttpRequest::builder(method, path)
            .header("Content-Type", "application/json")
            .header("Content-Length", "0")
            .header("Host", self.config.api_version.as_str())
            .header("Accept", "*/*")
    }

    /// Pack files into an in-memory archive, each under its file name.
    pub fn build_archive<I, P>(&self, paths: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        ArchiveBuilder::new().add_files(paths).serialize()
    }

    /// Unpack an archive under `dest`, returning the files written.
    pub fn extract_archive(&self, archive: &[u8], dest: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        archive::extract_bytes(archive, dest)
    }

    fn connect(&self, request: &HttpRequest) -> Result<Connection> {
        debug!(method = %request.method(), target = %request.target(), "sending request");
        let mut conn = Connection::open(&self.config.endpoint)?;
        conn.send(&request.encode())?;
        Ok(conn)
    }
}

impl Dispatch for Client {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut conn = self.connect(request)?;
        let response = HttpResponse::read_from(&mut conn);
        conn.close();
        response
    }

    fn open_stream(&self, request: &HttpRequest) -> Result<StreamingResponse> {
        StreamingResponse::start(self.connect(request)?)
    }
}
