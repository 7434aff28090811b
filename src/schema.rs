//! Namespace schema snapshots delivered with query results.
use std::collections::HashMap;

use crate::{
    buffer::VarBuffer,
    cjson::TagMatcher,
    error::{CodecError, Error},
    protocol::RpcCall,
    query::Query,
    results::ResultStream,
};

/// Field type code the server uses for float vectors; it carries an extra
/// dimension before the name.
pub const FIELD_TYPE_FLOAT_VECTOR: u64 = 13;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadField {
    pub field_type: u64,
    pub float_vector_dimension: u64,
    pub name: String,
    pub offset: u64,
    pub size: u64,
    pub is_array: bool,
    pub json_paths: Vec<String>,
}

impl PayloadField {
    pub fn read(buf: &mut VarBuffer) -> Result<Self, CodecError> {
        let field_type = buf.get_varuint()?;
        let float_vector_dimension = if field_type == FIELD_TYPE_FLOAT_VECTOR {
            buf.get_varuint()?
        } else {
            0
        };
        let name = buf.get_vstring()?;
        let offset = buf.get_varuint()?;
        let size = buf.get_varuint()?;
        let is_array = buf.get_varuint()? != 0;
        let json_paths = read_strings(buf)?;

        Ok(Self {
            field_type,
            float_vector_dimension,
            name,
            offset,
            size,
            is_array,
            json_paths,
        })
    }

    pub fn write(&self, buf: &mut VarBuffer) {
        buf.put_varuint(self.field_type);
        if self.field_type == FIELD_TYPE_FLOAT_VECTOR {
            buf.put_varuint(self.float_vector_dimension);
        }
        buf.put_vstring(&self.name)
            .put_varuint(self.offset)
            .put_varuint(self.size)
            .put_varuint(u64::from(self.is_array));
        write_strings(buf, &self.json_paths);
    }
}

/// A namespace's schema as of `state_token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    pub ns_id: u64,
    pub ns_name: String,
    pub state_token: i64,
    pub version: u64,
    pub tags: Vec<String>,
    pub string_header_offset: u64,
    pub fields: Vec<PayloadField>,
}

impl PayloadType {
    pub fn read(buf: &mut VarBuffer) -> Result<Self, CodecError> {
        let ns_id = buf.get_varuint()?;
        let ns_name = buf.get_vstring()?;
        // sent unsigned, used as a signed 32-bit token
        let raw = buf.get_varuint()?;
        let token = u32::try_from(raw).map_err(|_| CodecError::OutOfRange {
            value: raw,
            target: "state token",
        })?;
        let state_token = i64::from(token as i32);
        let version = buf.get_varuint()?;
        let tags = read_strings(buf)?;
        let string_header_offset = buf.get_varuint()?;

        let count = buf.get_varuint()?;
        let mut fields = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            fields.push(PayloadField::read(buf)?);
        }

        Ok(Self {
            ns_id,
            ns_name,
            state_token,
            version,
            tags,
            string_header_offset,
            fields,
        })
    }

    pub fn write(&self, buf: &mut VarBuffer) {
        buf.put_varuint(self.ns_id)
            .put_vstring(&self.ns_name)
            .put_varuint(u64::from(self.state_token as i32 as u32))
            .put_varuint(self.version);
        write_strings(buf, &self.tags);
        buf.put_varuint(self.string_header_offset)
            .put_varuint(self.fields.len() as u64);
        for field in &self.fields {
            field.write(buf);
        }
    }

    /// A tag dictionary seeded with this schema's names.
    pub fn matcher(&self) -> TagMatcher {
        TagMatcher::from_tags(self.tags.iter().cloned())
    }

    /// Loads the current schema of `namespace` with an empty select.
    pub fn fetch<C: RpcCall>(conn: &C, namespace: &str) -> Result<Option<PayloadType>, Error> {
        let query = Query::new(namespace).limit(0).into_program()?;
        let mut stream = ResultStream::select(conn, query, 0, &HashMap::new())?;
        let pt = stream.payload_type(0).cloned();
        stream.close();
        Ok(pt)
    }

    /// Whether `other` describes a newer schema than this one.
    pub fn is_superseded_by(&self, other: &PayloadType) -> bool {
        self.version != other.version || self.state_token != other.state_token
    }
}

fn read_strings(buf: &mut VarBuffer) -> Result<Vec<String>, CodecError> {
    let count = buf.get_varuint()?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(buf.get_vstring()?);
    }
    Ok(out)
}

fn write_strings(buf: &mut VarBuffer, values: &[String]) {
    buf.put_varuint(values.len() as u64);
    for value in values {
        buf.put_vstring(value);
    }
}
