//! Typed access to cjson values.
//!
//! Business types describe themselves through [`ObjectDescriptor`]; scalar
//! conversions follow the loose rules the server applies to index values:
//! numbers truncate, and booleans read as `0`/`1` or `"true"`/`"false"`.
use crate::error::CodecError;

use super::CjsonValue;

pub trait IntoCjson {
    fn into_cjson(self) -> CjsonValue;
}

pub trait FromCjson: Sized {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError>;
}

fn mismatch(value: &CjsonValue, to: &'static str) -> CodecError {
    CodecError::Conversion {
        from: value.kind(),
        to,
    }
}

macro_rules! integer_conversions {
    ($($ty:ty),*) => {$(
        impl IntoCjson for $ty {
            fn into_cjson(self) -> CjsonValue {
                CjsonValue::Int(self as i64)
            }
        }

        impl FromCjson for $ty {
            fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
                match value {
                    CjsonValue::Int(v) => Ok(*v as $ty),
                    CjsonValue::Double(v) => Ok(*v as $ty),
                    CjsonValue::Bool(v) => Ok(<$ty>::from(*v)),
                    other => Err(mismatch(other, stringify!($ty))),
                }
            }
        }
    )*};
}

integer_conversions!(i64, i32, i16, i8, u32, u64);

macro_rules! float_conversions {
    ($($ty:ty),*) => {$(
        impl IntoCjson for $ty {
            fn into_cjson(self) -> CjsonValue {
                CjsonValue::Double(f64::from(self))
            }
        }

        impl FromCjson for $ty {
            fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
                match value {
                    CjsonValue::Double(v) => Ok(*v as $ty),
                    CjsonValue::Int(v) => Ok(*v as $ty),
                    other => Err(mismatch(other, stringify!($ty))),
                }
            }
        }
    )*};
}

float_conversions!(f64, f32);

impl IntoCjson for bool {
    fn into_cjson(self) -> CjsonValue {
        CjsonValue::Bool(self)
    }
}

impl FromCjson for bool {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
        match value {
            CjsonValue::Bool(v) => Ok(*v),
            CjsonValue::Int(v) => Ok(*v != 0),
            CjsonValue::String(s) if s == "true" => Ok(true),
            CjsonValue::String(s) if s == "false" => Ok(false),
            other => Err(mismatch(other, "bool")),
        }
    }
}

impl IntoCjson for String {
    fn into_cjson(self) -> CjsonValue {
        CjsonValue::String(self)
    }
}

impl IntoCjson for &str {
    fn into_cjson(self) -> CjsonValue {
        CjsonValue::String(self.to_string())
    }
}

impl FromCjson for String {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
        match value {
            CjsonValue::String(v) => Ok(v.clone()),
            other => Err(mismatch(other, "string")),
        }
    }
}

impl<T: IntoCjson> IntoCjson for Option<T> {
    fn into_cjson(self) -> CjsonValue {
        self.map_or(CjsonValue::Null, IntoCjson::into_cjson)
    }
}

impl<T: FromCjson> FromCjson for Option<T> {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
        match value {
            CjsonValue::Null => Ok(None),
            other => T::from_cjson(other).map(Some),
        }
    }
}

impl<T: IntoCjson> IntoCjson for Vec<T> {
    fn into_cjson(self) -> CjsonValue {
        CjsonValue::Array(self.into_iter().map(IntoCjson::into_cjson).collect())
    }
}

impl<T: FromCjson> FromCjson for Vec<T> {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
        match value {
            CjsonValue::Array(items) => items.iter().map(T::from_cjson).collect(),
            CjsonValue::Null => Ok(Vec::new()),
            // a one-element array may come back as a scalar
            other => Ok(vec![T::from_cjson(other)?]),
        }
    }
}

impl IntoCjson for CjsonValue {
    fn into_cjson(self) -> CjsonValue {
        self
    }
}

impl FromCjson for CjsonValue {
    fn from_cjson(value: &CjsonValue) -> Result<Self, CodecError> {
        Ok(value.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Int,
    Double,
    String,
    Bool,
    Object,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub kind: FieldKind,
    pub is_array: bool,
}

impl FieldDescriptor {
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            is_array: false,
        }
    }

    pub const fn array(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            is_array: true,
        }
    }
}

/// Field-level access to a business type, in place of reflection.
pub trait ObjectDescriptor: Sized {
    fn list_fields() -> &'static [FieldDescriptor];

    /// Current value of `field`, or `None` to leave it out of the payload.
    fn get(&self, field: &str) -> Option<CjsonValue>;

    fn set(&mut self, field: &str, value: &CjsonValue) -> Result<(), CodecError>;

    /// An empty instance for [`from_cjson`] to fill in.
    fn construct() -> Self;
}

pub fn to_cjson<T: ObjectDescriptor>(item: &T) -> CjsonValue {
    CjsonValue::Object(
        T::list_fields()
            .iter()
            .filter_map(|f| item.get(f.name).map(|v| (f.name.to_string(), v)))
            .collect(),
    )
}

/// Fills a new `T` from a decoded object. Unknown fields are skipped.
pub fn from_cjson<T: ObjectDescriptor>(value: &CjsonValue) -> Result<T, CodecError> {
    let CjsonValue::Object(fields) = value else {
        return Err(CodecError::NotAnObject(value.kind()));
    };

    let known = T::list_fields();
    let mut item = T::construct();
    for (name, field_value) in fields {
        let Some(descriptor) = known.iter().find(|f| f.name == name.as_str()) else {
            continue;
        };
        let result = match field_value {
            CjsonValue::Array(_) | CjsonValue::Null => item.set(name, field_value),
            scalar if descriptor.is_array => {
                item.set(name, &CjsonValue::Array(vec![scalar.clone()]))
            }
            scalar => item.set(name, scalar),
        };
        result.map_err(|e| e.in_field(name.as_str()))?;
    }
    Ok(item)
}
