//! Client side of the cproto RPC protocol.
//!
//! This module defines how requests and responses travel between the client
//! and a cproto server: frame layout, argument encoding, and the connection
//! that multiplexes concurrent calls over one socket.
//!
//! # Overview
//!
//! Every call is a [`Request`] (a [`Command`] plus an ordered list of typed
//! [`Arg`]s) wrapped in a [`Frame`]. The server answers with a frame carrying
//! the same sequence number whose body decodes into a [`Response`]: an
//! [`ErrorCode`], a message, and a result argument list.
//!
//! # Binary Format
//!
//! - Each frame begins with a fixed 16-byte little-endian header:
//!   `magic:u32, version:u16, command:u16, body_size:u32, seq:u32`.
//! - The low 10 bits of `version` carry the protocol version; bit 10 flags a
//!   compressed body, which this client neither sends nor accepts.
//! - The body is a varint argument count followed by tagged arguments.
//!   Responses prefix the argument list with the error code and message.
//!
//! A frame with the wrong magic or an older version is fatal for the
//! connection that read it.
//!
//! # Key Components
//!
//! - [`ProtocolTransport`]: reads and writes whole frames over any byte stream.
//! - [`Connection`]: one socket with a writer thread, a reader thread, and a
//!   sequence-number keyed map of waiting callers.
//! - [`RpcCall`]: the seam every higher layer talks to, implemented by
//!   connections and pooled connection guards.
//!
//! # See Also
//!
//! - [`pool`](crate::pool): bounded checkout of logged-in connections.
mod connection;
mod frame;
mod request;
mod response;
mod thread;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub(crate) use thread::lock;

pub use connection::{
    CAPABILITY_COMPLEX_RANK, CAPABILITY_RESULTS_WITH_SHARD_IDS, Connection, LOGIN_VERSION, RpcCall,
};
pub use frame::{
    CPROTO_COMPRESSION_FLAG, CPROTO_MAGIC, CPROTO_MIN_VERSION, CPROTO_VERSION, CPROTO_VERSION_MASK,
    Frame, FrameHeader, HEADER_SIZE,
};
pub use request::{Arg, Command, Request};
pub use response::{ErrorCode, Response};
pub use transport::{ProtocolTransport, TransportError};
