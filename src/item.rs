//! Item mutations shared by namespace sessions and transactions.
use log::debug;

use crate::{
    buffer::VarBuffer,
    cjson::{self, CjsonValue, ObjectDescriptor},
    error::{CodecError, Error, ProtocolError},
    protocol::{ErrorCode, Response, RpcCall},
    schema::PayloadType,
};

/// Payload format code for cjson items.
pub const FORMAT_CJSON: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyMode {
    Update,
    Insert,
    Upsert,
    Delete,
}

impl ModifyMode {
    pub fn code(self) -> i32 {
        match self {
            ModifyMode::Update => 0,
            ModifyMode::Insert => 1,
            ModifyMode::Upsert => 2,
            ModifyMode::Delete => 3,
        }
    }
}

/// Anything that can be written as an item.
pub trait ToItem {
    fn to_item(&self) -> CjsonValue;
}

impl ToItem for CjsonValue {
    fn to_item(&self) -> CjsonValue {
        self.clone()
    }
}

impl<T: ObjectDescriptor> ToItem for T {
    fn to_item(&self) -> CjsonValue {
        cjson::to_cjson(self)
    }
}

/// Count-prefixed precept strings, or nothing when there are none.
pub fn pack_precepts(precepts: &[String]) -> Vec<u8> {
    if precepts.is_empty() {
        return Vec::new();
    }
    let mut buf = VarBuffer::new();
    buf.put_varuint(precepts.len() as u64);
    for precept in precepts {
        buf.put_vstring(precept);
    }
    buf.into_bytes()
}

/// The schema one session writes items against.
#[derive(Debug, Clone)]
pub(crate) struct SchemaState {
    namespace: String,
    payload_type: Option<PayloadType>,
}

impl SchemaState {
    pub fn new(namespace: impl Into<String>, payload_type: Option<PayloadType>) -> Self {
        Self {
            namespace: namespace.into(),
            payload_type,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn payload_type(&self) -> Option<&PayloadType> {
        self.payload_type.as_ref()
    }

    pub fn state_token(&self) -> i64 {
        self.payload_type.as_ref().map_or(0, |pt| pt.state_token)
    }

    /// Encodes with a dictionary fresh from the schema, so names learned for
    /// one item travel with that item.
    pub fn encode(&self, item: &CjsonValue) -> Result<Vec<u8>, CodecError> {
        let mut matcher = self
            .payload_type
            .as_ref()
            .map(PayloadType::matcher)
            .unwrap_or_default();
        cjson::encode(item, &mut matcher)
    }

    pub fn refresh<C: RpcCall>(&mut self, conn: &C) -> Result<(), Error> {
        self.payload_type = PayloadType::fetch(conn, &self.namespace)?;
        debug!(
            "refreshed schema of {}: state {}",
            self.namespace,
            self.state_token()
        );
        Ok(())
    }

    /// Encodes `item` and hands it to `send` with the current state token as
    /// the 32-bit value the wire carries.
    /// When the server reports a stale token the schema is reloaded over
    /// `conn` and the call is made once more.
    pub fn write<C, F>(&mut self, conn: &C, item: &CjsonValue, mut send: F) -> Result<Response, Error>
    where
        C: RpcCall,
        F: FnMut(Vec<u8>, i32) -> Result<Response, Error>,
    {
        let mut retried = false;
        loop {
            let data = self.encode(item)?;
            let token = self.state_token();
            let token = i32::try_from(token).map_err(|_| ProtocolError::IntOutOfRange(token))?;
            match send(data, token) {
                Err(err) if !retried && err.server_code() == Some(ErrorCode::StateInvalidated) => {
                    debug!("state of {} invalidated, reloading schema", self.namespace);
                    self.refresh(conn)?;
                    retried = true;
                }
                result => return result,
            }
        }
    }
}
