//! # appgate-core
//!
//! Shared wire-level building blocks for the appgate request-acceptance core:
//! the framed scalar protocol spoken on the native and console sockets, the
//! incremental HTTP/1.1 header parser, and the ordered [`HeaderMap`] that both
//! protocols parse into.
//!
//! This crate carries no policy: it never binds sockets, never authenticates,
//! and never dispatches. The server crate layers those concerns on top.

pub mod headers;
pub mod http;
pub mod protocol;

pub use headers::HeaderMap;
pub use http::{HttpHeaderParser, HttpParseError, ParseStatus};
pub use protocol::{ProtocolError, DEFAULT_MAX_SCALAR_SIZE};
