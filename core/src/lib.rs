//! Transport and codec layer for talking to a container daemon.
//!
//! # Overview
//! Frames HTTP/1.1 requests and responses over a Unix domain socket or TCP,
//! decodes the streaming bodies of log and stats endpoints, and reads and
//! writes the tar archives used to copy files into and out of containers.
//! Container, image and exec verbs are not defined here; they are built on
//! the `Dispatch` trait.
//!
//! # Design
//! - Blocking I/O, one connection per call, no pooling and no retries.
//! - Requests and responses are plain data; every codec works on
//!   `Read`/`BufRead`/`Write`, so the whole stack is testable on byte slices.
//! - Streaming bodies are iterators that own their connection. Dropping or
//!   closing one is how a live stream is cancelled.
//! - Errors are grouped by layer, see [`error`].

pub mod archive;
pub mod client;
pub mod endpoint;
pub mod error;
pub mod http;
pub mod stream;
pub mod transport;

pub use archive::ArchiveBuilder;
pub use client::{Client, ClientConfig, Dispatch};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse, StreamingResponse};
pub use stream::{Demux, JsonLines};
pub use transport::Connection;
