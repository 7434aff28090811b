//! Query builder and its opcode compiler.
//!
//! A [`Query`] records one opcode per builder call into its own buffer; the
//! final program is assembled by [`Query::into_program`], which appends the
//! joined and merged sub-programs in the order the server expects.
mod builder;

pub use builder::{CompiledQuery, Facet, JoinLayout, Query};

use crate::buffer::VarBuffer;

pub(crate) mod opcode {
    pub const CONDITION: u64 = 0;
    pub const SORT_INDEX: u64 = 2;
    pub const JOIN_ON: u64 = 3;
    pub const LIMIT: u64 = 4;
    pub const OFFSET: u64 = 5;
    pub const REQ_TOTAL: u64 = 6;
    pub const AGGREGATION: u64 = 8;
    pub const SELECT_FILTER: u64 = 9;
    pub const END: u64 = 11;
    pub const UPDATE_FIELD: u64 = 14;
    pub const AGGREGATION_LIMIT: u64 = 15;
    pub const AGGREGATION_OFFSET: u64 = 16;
    pub const AGGREGATION_SORT: u64 = 17;
    pub const OPEN_BRACKET: u64 = 18;
    pub const CLOSE_BRACKET: u64 = 19;
    pub const JOIN_CONDITION: u64 = 20;
    pub const DROP_FIELD: u64 = 21;
    pub const UPDATE_OBJECT: u64 = 22;
    pub const UPDATE_FIELD_V2: u64 = 25;
    pub const BETWEEN_FIELDS_CONDITION: u64 = 26;

    pub const MODE_ACCURATE_TOTAL: u64 = 2;
}

pub(crate) const VALUE_INT64: u64 = 0;
pub(crate) const VALUE_DOUBLE: u64 = 1;
pub(crate) const VALUE_STRING: u64 = 2;
pub(crate) const VALUE_BOOL: u64 = 3;
pub(crate) const VALUE_NULL: u64 = 4;
pub(crate) const VALUE_INT: u64 = 8;
pub(crate) const VALUE_TUPLE: u64 = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Any,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Range,
    Set,
    AllSet,
    Empty,
    Like,
}

impl Condition {
    pub fn code(self) -> u64 {
        match self {
            Condition::Any => 0,
            Condition::Eq => 1,
            Condition::Lt => 2,
            Condition::Le => 3,
            Condition::Gt => 4,
            Condition::Ge => 5,
            Condition::Range => 6,
            Condition::Set => 7,
            Condition::AllSet => 8,
            Condition::Empty => 9,
            Condition::Like => 10,
        }
    }
}

/// Boolean operator joining a condition to the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Op {
    Or,
    #[default]
    And,
    Not,
}

impl Op {
    pub fn code(self) -> u64 {
        match self {
            Op::Or => 1,
            Op::And => 2,
            Op::Not => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Left,
    Inner,
    OrInner,
    Merge,
}

impl JoinType {
    pub fn code(self) -> u64 {
        match self {
            JoinType::Left => 0,
            JoinType::Inner => 1,
            JoinType::OrInner => 2,
            JoinType::Merge => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationType {
    Sum,
    Avg,
    Facet,
    Min,
    Max,
    Distinct,
}

impl AggregationType {
    pub fn code(self) -> u64 {
        match self {
            AggregationType::Sum => 0,
            AggregationType::Avg => 1,
            AggregationType::Facet => 2,
            AggregationType::Min => 3,
            AggregationType::Max => 4,
            AggregationType::Distinct => 5,
        }
    }
}

/// A condition or sort value. Composite indexes take a [`Value::Tuple`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Tuple(Vec<Value>),
}

impl Value {
    pub fn tuple<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Value::Tuple(values.into_iter().map(Into::into).collect())
    }

    pub(crate) fn encode(&self, buf: &mut VarBuffer) {
        match self {
            Value::Null => {
                buf.put_varuint(VALUE_NULL);
            }
            Value::Bool(v) => {
                buf.put_varuint(VALUE_BOOL).put_varuint(u64::from(*v));
            }
            Value::Int(v) => {
                buf.put_varuint(VALUE_INT).put_varint(i64::from(*v));
            }
            Value::Int64(v) => {
                buf.put_varuint(VALUE_INT64).put_varint(*v);
            }
            Value::Double(v) => {
                buf.put_varuint(VALUE_DOUBLE).put_f64(*v);
            }
            Value::String(v) => {
                buf.put_varuint(VALUE_STRING).put_vstring(v);
            }
            Value::Tuple(values) => {
                buf.put_varuint(VALUE_TUPLE).put_varuint(values.len() as u64);
                for value in values {
                    value.encode(buf);
                }
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i8> for Value {
    fn from(value: i8) -> Self {
        Value::Int(i32::from(value))
    }
}

impl From<i16> for Value {
    fn from(value: i16) -> Self {
        Value::Int(i32::from(value))
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int64(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Double(f64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: Value) -> Vec<u8> {
        let mut buf = VarBuffer::new();
        value.encode(&mut buf);
        buf.into_bytes()
    }

    #[test]
    fn value_tags() {
        assert_eq!(encoded(Value::Null), vec![4]);
        assert_eq!(encoded(true.into()), vec![3, 1]);
        assert_eq!(encoded(5.into()), vec![8, 10]);
        assert_eq!(encoded((-1i64).into()), vec![0, 1]);
        assert_eq!(encoded("ab".into()), vec![2, 2, b'a', b'b']);
        assert_eq!(encoded(None::<i32>.into()), vec![4]);

        let mut double = vec![1];
        double.extend_from_slice(&1.5f64.to_le_bytes());
        assert_eq!(encoded(1.5.into()), double);
    }

    #[test]
    fn composite_tuple() {
        assert_eq!(
            encoded(Value::tuple([Value::from(1), Value::from("x")])),
            vec![11, 2, 8, 2, 2, 1, b'x']
        );
    }

    #[test]
    fn codes() {
        assert_eq!(Condition::Like.code(), 10);
        assert_eq!(Op::default(), Op::And);
        assert_eq!(Op::Not.code(), 3);
        assert_eq!(JoinType::OrInner.code(), 2);
        assert_eq!(AggregationType::Distinct.code(), 5);
    }
}
