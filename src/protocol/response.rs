use std::fmt;

use crate::{
    buffer::VarBuffer,
    error::{Error, ProtocolError},
};

use super::request::{Arg, decode_args, encode_args};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    ParseSql,
    QueryExec,
    Params,
    Logic,
    ParseJson,
    ParseDsl,
    Conflict,
    ParseBin,
    Forbidden,
    WasRelock,
    NotValid,
    Network,
    NotFound,
    StateInvalidated,
    Other(u64),
}

impl From<u64> for ErrorCode {
    fn from(value: u64) -> Self {
        match value {
            0 => ErrorCode::Ok,
            1 => ErrorCode::ParseSql,
            2 => ErrorCode::QueryExec,
            3 => ErrorCode::Params,
            4 => ErrorCode::Logic,
            5 => ErrorCode::ParseJson,
            6 => ErrorCode::ParseDsl,
            7 => ErrorCode::Conflict,
            8 => ErrorCode::ParseBin,
            9 => ErrorCode::Forbidden,
            10 => ErrorCode::WasRelock,
            11 => ErrorCode::NotValid,
            12 => ErrorCode::Network,
            13 => ErrorCode::NotFound,
            14 => ErrorCode::StateInvalidated,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::Ok => 0,
            ErrorCode::ParseSql => 1,
            ErrorCode::QueryExec => 2,
            ErrorCode::Params => 3,
            ErrorCode::Logic => 4,
            ErrorCode::ParseJson => 5,
            ErrorCode::ParseDsl => 6,
            ErrorCode::Conflict => 7,
            ErrorCode::ParseBin => 8,
            ErrorCode::Forbidden => 9,
            ErrorCode::WasRelock => 10,
            ErrorCode::NotValid => 11,
            ErrorCode::Network => 12,
            ErrorCode::NotFound => 13,
            ErrorCode::StateInvalidated => 14,
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Ok => "ok",
            ErrorCode::ParseSql => "parse sql",
            ErrorCode::QueryExec => "query exec",
            ErrorCode::Params => "params",
            ErrorCode::Logic => "logic",
            ErrorCode::ParseJson => "parse json",
            ErrorCode::ParseDsl => "parse dsl",
            ErrorCode::Conflict => "conflict",
            ErrorCode::ParseBin => "parse bin",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::WasRelock => "was relock",
            ErrorCode::NotValid => "not valid",
            ErrorCode::Network => "network",
            ErrorCode::NotFound => "not found",
            ErrorCode::StateInvalidated => "state invalidated",
            ErrorCode::Other(code) => return write!(f, "code {code}"),
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: ErrorCode,
    pub message: String,
    pub args: Vec<Arg>,
}

impl Response {
    pub fn ok(args: Vec<Arg>) -> Self {
        Self {
            code: ErrorCode::Ok,
            message: String::new(),
            args,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            args: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = VarBuffer::new();
        buf.put_varuint(self.code.into()).put_vstring(&self.message);
        encode_args(&mut buf, &self.args);
        buf.into_bytes()
    }

    pub fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = VarBuffer::from(body);
        let code = ErrorCode::from(buf.get_varuint()?);
        let message = buf.get_vstring()?;
        let args = decode_args(&mut buf)?;
        Ok(Self {
            code,
            message,
            args,
        })
    }

    /// Turns a nonzero server code into [`Error::Server`].
    pub fn into_result(self) -> Result<Self, Error> {
        if self.is_ok() {
            Ok(self)
        } else {
            Err(Error::Server {
                code: self.code,
                message: self.message,
            })
        }
    }

    pub fn bytes_arg(&self, index: usize) -> Result<&[u8], ProtocolError> {
        self.args
            .get(index)
            .and_then(Arg::as_bytes)
            .ok_or(ProtocolError::MissingArgument {
                index,
                expected: "bytes",
            })
    }

    pub fn int_arg(&self, index: usize) -> Result<i64, ProtocolError> {
        self.args
            .get(index)
            .and_then(Arg::as_i64)
            .ok_or(ProtocolError::MissingArgument {
                index,
                expected: "an integer",
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        for code in 0..=15u64 {
            assert_eq!(u64::from(ErrorCode::from(code)), code);
        }
        assert_eq!(ErrorCode::from(14), ErrorCode::StateInvalidated);
        assert_eq!(ErrorCode::from(99).to_string(), "code 99");
    }

    #[test]
    fn decode_server_error() {
        let body = Response::error(ErrorCode::Params, "bad index").encode_body();
        let resp = Response::decode_body(&body).unwrap();
        assert!(!resp.is_ok());

        let err = resp.into_result().unwrap_err();
        assert!(matches!(
            err,
            Error::Server { code: ErrorCode::Params, ref message } if message == "bad index"
        ));
    }

    #[test]
    fn typed_args() {
        let resp = Response::ok(vec![Arg::Bytes(vec![1]), Arg::Int(7)]);
        let resp = Response::decode_body(&resp.encode_body()).unwrap();
        assert_eq!(resp.bytes_arg(0).unwrap(), &[1]);
        assert_eq!(resp.int_arg(1).unwrap(), 7);
        assert!(matches!(
            resp.int_arg(0),
            Err(ProtocolError::MissingArgument { index: 0, .. })
        ));
        assert!(resp.bytes_arg(5).is_err());
    }
}
