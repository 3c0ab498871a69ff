//! HTTP/1.1 framing for talking to the daemon.
//!
//! # Design
//! Only the subset the daemon API needs: one request per connection, bodies
//! fully materialized on the way out, and three framings on the way in
//! (`Content-Length`, chunked, read until close). Requests are plain
//! immutable data and encode to exact bytes, so they can be checked against
//! test vectors without a socket. Responses are decoded from any `BufRead`,
//! which keeps the decoder testable against byte slices.

pub mod body;
pub mod headers;
pub mod request;
pub mod response;

pub use body::{Body, Framing};
pub use headers::Headers;
pub use request::{HttpMethod, HttpRequest, RequestBuilder};
pub use response::{HttpResponse, ResponseHead, StreamingResponse};
