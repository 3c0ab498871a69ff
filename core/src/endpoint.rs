//! Where the daemon listens.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

/// Socket path the daemon listens on when nothing else is configured.
pub const DEFAULT_SOCKET: &str = "/var/run/docker.sock";

/// Port assumed for `tcp://host` without an explicit port.
pub const DEFAULT_TCP_PORT: u16 = 2375;

/// A daemon endpoint: a Unix domain socket path or a TCP host and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Unix(PathBuf::from(DEFAULT_SOCKET))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{host}]:{port}")
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// The endpoint string could not be understood.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseEndpointError {
    #[error("empty endpoint")]
    Empty,

    #[error("unsupported endpoint scheme {0:?}; expected unix:// or tcp://")]
    UnsupportedScheme(String),

    #[error("invalid port in endpoint {0:?}")]
    InvalidPort(String),

    #[error("missing host in endpoint {0:?}")]
    MissingHost(String),
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    /// Accepts `unix:///path`, `tcp://host[:port]`, a bare absolute path, or
    /// a bare `host:port`, which covers the forms `DOCKER_HOST` takes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseEndpointError::Empty);
        }
        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(ParseEndpointError::Empty);
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp://").or_else(|| s.strip_prefix("http://")) {
            return parse_host_port(s, addr.trim_end_matches('/'), Some(DEFAULT_TCP_PORT));
        }
        if let Some((scheme, _)) = s.split_once("://") {
            return Err(ParseEndpointError::UnsupportedScheme(scheme.to_string()));
        }
        if s.starts_with('/') {
            return Ok(Endpoint::Unix(PathBuf::from(s)));
        }
        parse_host_port(s, s, None)
    }
}

fn parse_host_port(
    original: &str,
    addr: &str,
    default_port: Option<u16>,
) -> Result<Endpoint, ParseEndpointError> {
    // [v6]:port or [v6]
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ParseEndpointError::MissingHost(original.to_string()))?;
        (host, tail.strip_prefix(':'))
    } else {
        match addr.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (addr, None),
        }
    };
    if host.is_empty() {
        return Err(ParseEndpointError::MissingHost(original.to_string()));
    }
    let port = match port {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| ParseEndpointError::InvalidPort(original.to_string()))?,
        None => default_port.ok_or_else(|| ParseEndpointError::InvalidPort(original.to_string()))?,
    };
    Ok(Endpoint::Tcp {
        host: host.to_string(),
        port,
    })
}
