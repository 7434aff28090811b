use log::trace;

use crate::{buffer::VarBuffer, error::CodecError};

use super::{
    CjsonValue,
    tag::{CarrayTag, Ctag, TagMatcher, TagType},
};

/// Size of the leading `end` tag plus the offset slot.
const HEADER_LEN: usize = 5;

/// Deepest object/array nesting accepted when decoding.
pub const MAX_DEPTH: usize = 1024;

/// Encodes an object, appending any names `matcher` learned along the way.
pub fn encode(value: &CjsonValue, matcher: &mut TagMatcher) -> Result<Vec<u8>, CodecError> {
    if !matches!(value, CjsonValue::Object(_)) {
        return Err(CodecError::NotAnObject(value.kind()));
    }

    let mut buf = VarBuffer::new();
    buf.put_varuint(Ctag::END.raw());
    let slot = buf.len();
    buf.put_u32(0);

    encode_value(&mut buf, value, 0, matcher)?;

    if matcher.is_updated() {
        let offset = buf.len() as u32;
        buf.put_u32_at(slot, offset)?;
        buf.put_varuint(matcher.len() as u64);
        for name in matcher.tags() {
            buf.put_vstring(name);
        }
        trace!("appended {} tag names at offset {offset}", matcher.len());
    } else {
        buf.truncate_start(HEADER_LEN);
    }
    Ok(buf.into_bytes())
}

fn encode_value(
    buf: &mut VarBuffer,
    value: &CjsonValue,
    name: u32,
    matcher: &mut TagMatcher,
) -> Result<(), CodecError> {
    match value {
        CjsonValue::Null => {
            buf.put_varuint(Ctag::new(TagType::Null, name).raw());
        }
        CjsonValue::Bool(v) => {
            buf.put_varuint(Ctag::new(TagType::Bool, name).raw())
                .put_varuint(u64::from(*v));
        }
        CjsonValue::Int(v) => {
            buf.put_varuint(Ctag::new(TagType::Varint, name).raw())
                .put_varint(*v);
        }
        CjsonValue::Double(v) => {
            buf.put_varuint(Ctag::new(TagType::Double, name).raw())
                .put_f64(*v);
        }
        CjsonValue::String(v) => {
            buf.put_varuint(Ctag::new(TagType::String, name).raw())
                .put_vstring(v);
        }
        CjsonValue::Array(items) => {
            buf.put_varuint(Ctag::new(TagType::Array, name).raw());
            encode_array(buf, items, matcher)?;
        }
        CjsonValue::Object(fields) => encode_object(buf, fields, name, matcher)?,
    }
    Ok(())
}

fn encode_object(
    buf: &mut VarBuffer,
    fields: &[(String, CjsonValue)],
    name: u32,
    matcher: &mut TagMatcher,
) -> Result<(), CodecError> {
    buf.put_varuint(Ctag::new(TagType::Object, name).raw());
    for (field, value) in fields {
        let index = matcher.index(field)?;
        encode_value(buf, value, index, matcher).map_err(|e| e.in_field(field.as_str()))?;
    }
    buf.put_varuint(Ctag::END.raw());
    Ok(())
}

fn element_type(value: &CjsonValue) -> TagType {
    match value {
        CjsonValue::Null => TagType::Null,
        CjsonValue::Bool(_) => TagType::Bool,
        CjsonValue::Int(_) => TagType::Varint,
        CjsonValue::Double(_) => TagType::Double,
        CjsonValue::String(_) => TagType::String,
        // nested containers carry their own tag per element
        CjsonValue::Array(_) | CjsonValue::Object(_) => TagType::Object,
    }
}

fn encode_array(
    buf: &mut VarBuffer,
    items: &[CjsonValue],
    matcher: &mut TagMatcher,
) -> Result<(), CodecError> {
    let Some(first) = items.first() else {
        buf.put_u32(CarrayTag::new(0, TagType::Object)?.raw());
        return Ok(());
    };

    for item in &items[1..] {
        if std::mem::discriminant(item) != std::mem::discriminant(first) {
            return Err(CodecError::HeterogeneousArray {
                first: first.kind(),
                other: item.kind(),
            });
        }
    }

    let element = element_type(first);
    buf.put_u32(CarrayTag::new(items.len(), element)?.raw());
    for item in items {
        match item {
            CjsonValue::Null => {}
            CjsonValue::Bool(v) => {
                buf.put_varuint(u64::from(*v));
            }
            CjsonValue::Int(v) => {
                buf.put_varint(*v);
            }
            CjsonValue::Double(v) => {
                buf.put_f64(*v);
            }
            CjsonValue::String(v) => {
                buf.put_vstring(v);
            }
            CjsonValue::Array(_) | CjsonValue::Object(_) => encode_value(buf, item, 0, matcher)?,
        }
    }
    Ok(())
}

/// Decodes one cjson payload. A leading `end` tag marks an encoder header
/// whose appended names are learned before the body is read.
pub fn decode(data: &[u8], matcher: &mut TagMatcher) -> Result<CjsonValue, CodecError> {
    let mut buf = VarBuffer::from(data);
    let mut tag = Ctag::from_raw(buf.get_varuint()?);

    if tag.tag_type()? == TagType::End {
        let offset = buf.get_u32()? as usize;
        if offset != 0 {
            let mut names = VarBuffer::from(data.get(offset..).unwrap_or_default());
            let count = names.get_varuint()?;
            let mut learned = Vec::with_capacity(count.min(4096) as usize);
            for _ in 0..count {
                learned.push(names.get_vstring()?);
            }
            matcher.learn(learned);
        }
        tag = Ctag::from_raw(buf.get_varuint()?);
    }

    decode_value(&mut buf, tag.tag_type()?, matcher, 0)
}

fn decode_value(
    buf: &mut VarBuffer,
    tag_type: TagType,
    matcher: &TagMatcher,
    depth: usize,
) -> Result<CjsonValue, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::TooDeep(MAX_DEPTH));
    }
    Ok(match tag_type {
        TagType::Null => CjsonValue::Null,
        TagType::Bool => CjsonValue::Bool(buf.get_varuint()? != 0),
        TagType::Varint => CjsonValue::Int(buf.get_varint()?),
        TagType::Double => CjsonValue::Double(buf.get_f64()?),
        TagType::String => CjsonValue::String(buf.get_vstring()?),
        TagType::Object => decode_object(buf, matcher, depth + 1)?,
        TagType::Array => decode_array(buf, matcher, depth + 1)?,
        other => {
            return Err(CodecError::UnexpectedType {
                found: other as u8,
                context: "value",
            });
        }
    })
}

fn decode_object(
    buf: &mut VarBuffer,
    matcher: &TagMatcher,
    depth: usize,
) -> Result<CjsonValue, CodecError> {
    let mut fields = Vec::new();
    loop {
        let tag = Ctag::from_raw(buf.get_varuint()?);
        let tag_type = tag.tag_type()?;
        if tag_type == TagType::End {
            break;
        }
        let name = matcher.name(tag.name())?;
        let value = match decode_value(buf, tag_type, matcher, depth) {
            Ok(value) => value,
            // one context is enough for a runaway payload
            Err(err @ CodecError::TooDeep(_)) => return Err(err),
            Err(err) => return Err(err.in_field(name)),
        };
        fields.push((name.to_string(), value));
    }
    Ok(CjsonValue::Object(fields))
}

fn decode_array(
    buf: &mut VarBuffer,
    matcher: &TagMatcher,
    depth: usize,
) -> Result<CjsonValue, CodecError> {
    let header = CarrayTag::from_raw(buf.get_u32()?);
    let element = header.element_type()?;
    let mut items = Vec::with_capacity(header.count().min(buf.remaining()));
    for _ in 0..header.count() {
        let item = if element == TagType::Object {
            // each element carries its own tag
            let tag = Ctag::from_raw(buf.get_varuint()?);
            decode_value(buf, tag.tag_type()?, matcher, depth)?
        } else {
            decode_value(buf, element, matcher, depth)?
        };
        items.push(item);
    }
    Ok(CjsonValue::Array(items))
}
