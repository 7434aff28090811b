//! Compact binary JSON ("cjson") used for item payloads.
//!
//! Field names never travel inline. Each value is preceded by a varint
//! [`Ctag`] holding its type and the 1-based index of its name in a
//! [`TagMatcher`] shared with the server through the namespace's payload type.
//! Names the server does not know yet are appended after the encoded object,
//! with the offset of that list stored in a 4-byte slot right after a leading
//! `end` tag:
//!
//! ```text
//! [END tag][u32 offset][object ...][varuint n][vstring name] * n
//! ```
//!
//! When nothing new was learned the first five bytes are cut and the payload
//! is the bare object.
mod codec;
mod mapping;
mod tag;

pub use codec::{decode, encode};
pub use mapping::{FieldDescriptor, FieldKind, FromCjson, IntoCjson, ObjectDescriptor, from_cjson, to_cjson};
pub use tag::{CarrayTag, Ctag, MAX_TAG_NAMES, TagMatcher, TagType};

/// A decoded cjson document. Objects keep their field order.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CjsonValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    Array(Vec<CjsonValue>),
    Object(Vec<(String, CjsonValue)>),
}

impl CjsonValue {
    pub fn kind(&self) -> &'static str {
        match self {
            CjsonValue::Null => "null",
            CjsonValue::Bool(_) => "bool",
            CjsonValue::Int(_) => "int",
            CjsonValue::Double(_) => "double",
            CjsonValue::String(_) => "string",
            CjsonValue::Array(_) => "array",
            CjsonValue::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CjsonValue::Null)
    }

    /// Looks up a field of an object; `None` for other kinds.
    pub fn get(&self, field: &str) -> Option<&CjsonValue> {
        match self {
            CjsonValue::Object(fields) => fields.iter().find(|(k, _)| k == field).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CjsonValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CjsonValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[CjsonValue]> {
        match self {
            CjsonValue::Array(v) => Some(v),
            _ => None,
        }
    }

    /// Builds an object from `(name, value)` pairs.
    pub fn object<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, CjsonValue)>,
        K: Into<String>,
    {
        CjsonValue::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

impl From<serde_json::Value> for CjsonValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match value {
            Json::Null => CjsonValue::Null,
            Json::Bool(v) => CjsonValue::Bool(v),
            Json::Number(n) => match n.as_i64() {
                Some(v) => CjsonValue::Int(v),
                None => CjsonValue::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(v) => CjsonValue::String(v),
            Json::Array(items) => CjsonValue::Array(items.into_iter().map(Into::into).collect()),
            Json::Object(map) => {
                CjsonValue::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<CjsonValue> for serde_json::Value {
    fn from(value: CjsonValue) -> Self {
        use serde_json::Value as Json;
        match value {
            CjsonValue::Null => Json::Null,
            CjsonValue::Bool(v) => Json::Bool(v),
            CjsonValue::Int(v) => Json::from(v),
            CjsonValue::Double(v) => serde_json::Number::from_f64(v).map_or(Json::Null, Json::Number),
            CjsonValue::String(v) => Json::String(v),
            CjsonValue::Array(items) => Json::Array(items.into_iter().map(Into::into).collect()),
            CjsonValue::Object(fields) => {
                Json::Object(fields.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}
