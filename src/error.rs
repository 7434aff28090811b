use std::{io, time::Duration};

use thiserror::Error;

use crate::{buffer::BufferError, protocol::ErrorCode, protocol::TransportError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad frame magic {found:#010x}")]
    BadMagic { found: u32 },
    #[error("unsupported protocol version {found:#x}, minimum is {min:#x}")]
    UnsupportedVersion { found: u16, min: u16 },
    #[error("compressed frames are not supported")]
    Compressed,
    #[error("frame body of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("unknown command code {0}")]
    UnknownCommand(u16),
    #[error("unknown argument tag {0}")]
    UnknownArgTag(u64),
    #[error("value {0} does not fit a 32-bit integer argument")]
    IntOutOfRange(i64),
    #[error("response argument {index} is missing or is not {expected}")]
    MissingArgument { index: usize, expected: &'static str },
    #[error("malformed body: {0}")]
    Malformed(#[from] BufferError),
    #[error("failed to encode frame header: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("failed to decode frame header: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected cjson tag type {found} while reading {context}")]
    UnexpectedType { found: u8, context: &'static str },
    #[error("unknown tag name index {0}")]
    UnknownName(u32),
    #[error("tag dictionary is full at {0} names")]
    DictionaryFull(usize),
    #[error("array mixes {first} and {other} elements")]
    HeterogeneousArray {
        first: &'static str,
        other: &'static str,
    },
    #[error("array of {0} elements exceeds the 24-bit count")]
    ArrayTooLong(usize),
    #[error("root value must be an object, got {0}")]
    NotAnObject(&'static str),
    #[error("cannot convert {from} to {to}")]
    Conversion {
        from: &'static str,
        to: &'static str,
    },
    #[error("field `{field}`: {source}")]
    Field {
        field: String,
        #[source]
        source: Box<CodecError>,
    },
    #[error("unsupported result format {0:#x}")]
    UnsupportedFormat(u64),
    #[error("no payload type for namespace {0}")]
    UnknownNamespace(u64),
    #[error("unknown extra result tag {0}")]
    UnknownExtra(u64),
    #[error("unsupported rank format {0}")]
    RankFormat(u64),
    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
    #[error("value {value} out of range for {target}")]
    OutOfRange { value: u64, target: &'static str },
    #[error("invalid json item: {0}")]
    JsonItem(serde_json::Error),
    #[error("invalid aggregation result: {0}")]
    Aggregation(#[from] serde_json::Error),
    #[error("malformed cjson: {0}")]
    Buffer(#[from] BufferError),
}

impl CodecError {
    pub fn in_field(self, field: impl Into<String>) -> Self {
        CodecError::Field {
            field: field.into(),
            source: Box::new(self),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("`on` called before any join was added")]
    OnWithoutJoin,
    #[error("close_bracket without a matching open_bracket")]
    UnbalancedBracket,
    #[error("close_bracket after a pending OR/NOT operation")]
    OperationBeforeClose,
    #[error("{0} bracket(s) left open")]
    UnclosedBracket(usize),
    #[error("joined and merged queries cannot carry their own joins or merges")]
    NestedSubquery,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server error [{code}]: {message}")]
    Server { code: ErrorCode, message: String },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("no available connection after {0:?}")]
    PoolExhausted(Duration),
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("connection is broken: {0}")]
    ConnectionBroken(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transaction is already finalized")]
    TransactionFinalized,
    #[error("result stream is closed")]
    StreamClosed,
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Io(err) => Error::Network(err),
            TransportError::Protocol(err) => Error::Protocol(err),
        }
    }
}

impl Error {
    pub fn server(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Error::Server {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the connection that produced this error must be discarded
    /// rather than returned to its pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::Protocol(_)
                | Error::Timeout(_)
                | Error::ConnectionClosed
                | Error::ConnectionBroken(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(Error::Network(io::Error::other("reset")).is_connection_fatal());
        assert!(Error::Protocol(ProtocolError::BadMagic { found: 1 }).is_connection_fatal());
        assert!(Error::Timeout(Duration::from_secs(1)).is_connection_fatal());
        assert!(!Error::server(ErrorCode::Params, "bad").is_connection_fatal());
        assert!(!Error::Codec(CodecError::UnknownName(3)).is_connection_fatal());
        assert!(!Error::PoolExhausted(Duration::from_secs(1)).is_connection_fatal());
    }

    #[test]
    fn server_error_display() {
        let err = Error::server(ErrorCode::NotFound, "no such namespace");
        assert_eq!(err.server_code(), Some(ErrorCode::NotFound));
        assert_eq!(err.to_string(), "server error [not found]: no such namespace");
    }

    #[test]
    fn field_context() {
        let err = CodecError::Conversion {
            from: "string",
            to: "i64",
        }
        .in_field("age");
        assert_eq!(err.to_string(), "field `age`: cannot convert string to i64");
    }
}
