use crate::{
    buffer::{VarBuffer, zigzag_encode},
    error::ProtocolError,
};

pub(crate) const ARG_INT64: u64 = 0;
pub(crate) const ARG_DOUBLE: u64 = 1;
pub(crate) const ARG_STRING: u64 = 2;
pub(crate) const ARG_BOOL: u64 = 3;
pub(crate) const ARG_NULL: u64 = 4;
pub(crate) const ARG_INT: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    Ping = 0,
    Login = 1,
    OpenNamespace = 16,
    CloseNamespace = 17,
    DropNamespace = 18,
    AddIndex = 21,
    EnumNamespaces = 22,
    DropIndex = 24,
    UpdateIndex = 25,
    AddTxItem = 26,
    CommitTx = 27,
    RollbackTx = 28,
    StartTransaction = 29,
    DeleteQueryTx = 30,
    UpdateQueryTx = 31,
    ModifyItem = 33,
    DeleteQuery = 34,
    UpdateQuery = 35,
    Select = 48,
    SelectSql = 49,
    FetchResults = 50,
    CloseResults = 51,
    GetMeta = 64,
    PutMeta = 65,
}

impl From<Command> for u16 {
    fn from(value: Command) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = ProtocolError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let command = match value {
            0 => Command::Ping,
            1 => Command::Login,
            16 => Command::OpenNamespace,
            17 => Command::CloseNamespace,
            18 => Command::DropNamespace,
            21 => Command::AddIndex,
            22 => Command::EnumNamespaces,
            24 => Command::DropIndex,
            25 => Command::UpdateIndex,
            26 => Command::AddTxItem,
            27 => Command::CommitTx,
            28 => Command::RollbackTx,
            29 => Command::StartTransaction,
            30 => Command::DeleteQueryTx,
            31 => Command::UpdateQueryTx,
            33 => Command::ModifyItem,
            34 => Command::DeleteQuery,
            35 => Command::UpdateQuery,
            48 => Command::Select,
            49 => Command::SelectSql,
            50 => Command::FetchResults,
            51 => Command::CloseResults,
            64 => Command::GetMeta,
            65 => Command::PutMeta,
            other => return Err(ProtocolError::UnknownCommand(other)),
        };
        Ok(command)
    }
}

/// A single RPC argument. The wire carries exactly these variants.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    Bytes(Vec<u8>),
}

impl From<bool> for Arg {
    fn from(value: bool) -> Self {
        Arg::Bool(value)
    }
}

impl From<i32> for Arg {
    fn from(value: i32) -> Self {
        Arg::Int(value)
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int64(value)
    }
}

impl From<f64> for Arg {
    fn from(value: f64) -> Self {
        Arg::Double(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Bytes(value.into_bytes())
    }
}

impl From<Vec<u8>> for Arg {
    fn from(value: Vec<u8>) -> Self {
        Arg::Bytes(value)
    }
}

impl From<&[u8]> for Arg {
    fn from(value: &[u8]) -> Self {
        Arg::Bytes(value.to_vec())
    }
}

impl Arg {
    /// Packs a list of 64-bit integers into a single bytes argument
    /// (count followed by zigzag varints).
    pub fn int64_array(values: &[i64]) -> Self {
        let mut buf = VarBuffer::new();
        buf.put_varuint(values.len() as u64);
        for value in values {
            buf.put_varuint(zigzag_encode(*value));
        }
        Arg::Bytes(buf.into_bytes())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Arg::Null => "null",
            Arg::Bool(_) => "bool",
            Arg::Int(_) => "int",
            Arg::Int64(_) => "int64",
            Arg::Double(_) => "double",
            Arg::Bytes(_) => "bytes",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Arg::Int(v) => Some(i64::from(*v)),
            Arg::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Arg::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn encode(&self, buf: &mut VarBuffer) {
        match self {
            Arg::Null => {
                buf.put_varuint(ARG_NULL);
            }
            Arg::Bool(v) => {
                buf.put_varuint(ARG_BOOL).put_varuint(u64::from(*v));
            }
            Arg::Int(v) => {
                buf.put_varuint(ARG_INT).put_varint(i64::from(*v));
            }
            Arg::Int64(v) => {
                buf.put_varuint(ARG_INT64).put_varint(*v);
            }
            Arg::Double(v) => {
                buf.put_varuint(ARG_DOUBLE).put_f64(*v);
            }
            Arg::Bytes(v) => {
                buf.put_varuint(ARG_STRING).put_vbytes(v);
            }
        }
    }

    pub(crate) fn decode(buf: &mut VarBuffer) -> Result<Self, ProtocolError> {
        let arg = match buf.get_varuint()? {
            ARG_NULL => Arg::Null,
            ARG_BOOL => Arg::Bool(buf.get_varuint()? != 0),
            ARG_INT => {
                let value = buf.get_varint()?;
                Arg::Int(i32::try_from(value).map_err(|_| ProtocolError::IntOutOfRange(value))?)
            }
            ARG_INT64 => Arg::Int64(buf.get_varint()?),
            ARG_DOUBLE => Arg::Double(buf.get_f64()?),
            ARG_STRING => Arg::Bytes(buf.get_vbytes()?),
            other => return Err(ProtocolError::UnknownArgTag(other)),
        };
        Ok(arg)
    }
}

pub(crate) fn encode_args(buf: &mut VarBuffer, args: &[Arg]) {
    buf.put_varuint(args.len() as u64);
    for arg in args {
        arg.encode(buf);
    }
}

pub(crate) fn decode_args(buf: &mut VarBuffer) -> Result<Vec<Arg>, ProtocolError> {
    let count = buf.get_varuint()?;
    // every argument takes at least one byte
    let mut args = Vec::with_capacity((count as usize).min(buf.remaining()));
    for _ in 0..count {
        args.push(Arg::decode(buf)?);
    }
    Ok(args)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub command: Command,
    pub args: Vec<Arg>,
}

impl Request {
    pub fn new(command: Command, args: Vec<Arg>) -> Self {
        Self { command, args }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = VarBuffer::new();
        encode_args(&mut buf, &self.args);
        buf.into_bytes()
    }

    pub fn decode_body(command: Command, body: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = VarBuffer::from(body);
        let args = decode_args(&mut buf)?;
        Ok(Self { command, args })
    }

    pub fn arg(&self, index: usize) -> Option<&Arg> {
        self.args.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes() {
        assert_eq!(u16::from(Command::Login), 1);
        assert_eq!(u16::from(Command::FetchResults), 50);
        assert_eq!(Command::try_from(51).unwrap(), Command::CloseResults);
        assert!(matches!(
            Command::try_from(99),
            Err(ProtocolError::UnknownCommand(99))
        ));
    }

    #[test]
    fn body_encoding() {
        let request = Request::new(
            Command::OpenNamespace,
            vec![Arg::from("ns"), Arg::Bool(true), Arg::Int(-3), Arg::Null],
        );
        assert_eq!(
            request.encode_body(),
            vec![4, ARG_STRING as u8, 2, b'n', b's', ARG_BOOL as u8, 1, ARG_INT as u8, 5, ARG_NULL as u8]
        );
    }

    #[test]
    fn body_round_trip() {
        let request = Request::new(
            Command::Select,
            vec![
                Arg::Bytes(vec![0, 1, 2]),
                Arg::Int64(i64::MIN),
                Arg::Double(2.5),
                Arg::int64_array(&[0, -1]),
            ],
        );
        let decoded = Request::decode_body(Command::Select, &request.encode_body()).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.arg(3).unwrap().as_bytes().unwrap(), &[2, 0, 1]);
    }

    #[test]
    fn unknown_tag() {
        let body = vec![1, 9];
        assert!(matches!(
            Request::decode_body(Command::Ping, &body),
            Err(ProtocolError::UnknownArgTag(9))
        ));
    }

    #[test]
    fn int_argument_out_of_range() {
        let mut buf = VarBuffer::new();
        buf.put_varuint(1).put_varuint(ARG_INT).put_varint(i64::from(i32::MAX) + 1);
        assert!(matches!(
            Request::decode_body(Command::Ping, buf.as_bytes()),
            Err(ProtocolError::IntOutOfRange(v)) if v == i64::from(i32::MAX) + 1
        ));
    }
}
