use std::collections::HashMap;

use crate::error::CodecError;

const TYPE0_BITS: u32 = 3;
const NAME_BITS: u32 = 12;
const FIELD_BITS: u32 = 10;
const NAME_SHIFT: u32 = 3;
const FIELD_SHIFT: u32 = 15;
const TYPE1_SHIFT: u32 = 29 - TYPE0_BITS;
const TYPE0_MASK: u64 = (1 << TYPE0_BITS) - 1;
const TYPE1_MASK: u64 = 0b111 << TYPE0_BITS;
const NAME_MASK: u64 = (1 << NAME_BITS) - 1;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;

const COUNT_BITS: u32 = 24;
const COUNT_MASK: u32 = (1 << COUNT_BITS) - 1;

/// Largest number of names a tag dictionary can address.
pub const MAX_TAG_NAMES: usize = NAME_MASK as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TagType {
    Varint = 0,
    Double = 1,
    String = 2,
    Bool = 3,
    Null = 4,
    Array = 5,
    Object = 6,
    End = 7,
    Uuid = 8,
    Float = 9,
}

impl TagType {
    pub fn from_code(code: u8, context: &'static str) -> Result<Self, CodecError> {
        Ok(match code {
            0 => TagType::Varint,
            1 => TagType::Double,
            2 => TagType::String,
            3 => TagType::Bool,
            4 => TagType::Null,
            5 => TagType::Array,
            6 => TagType::Object,
            7 => TagType::End,
            8 => TagType::Uuid,
            9 => TagType::Float,
            found => return Err(CodecError::UnexpectedType { found, context }),
        })
    }
}

/// Per-value tag: `|type1:3|reserved:4|field:10|name:12|type0:3|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ctag(u64);

impl Ctag {
    pub const END: Ctag = Ctag(TagType::End as u64);

    pub fn new(tag_type: TagType, name: u32) -> Self {
        Self::with_field(tag_type, name, 0)
    }

    pub fn with_field(tag_type: TagType, name: u32, field: u32) -> Self {
        let t = tag_type as u64;
        Ctag(
            (t & TYPE0_MASK)
                | ((t & TYPE1_MASK) << TYPE1_SHIFT)
                | ((u64::from(name) & NAME_MASK) << NAME_SHIFT)
                | ((u64::from(field) & FIELD_MASK) << FIELD_SHIFT),
        )
    }

    pub fn from_raw(raw: u64) -> Self {
        Ctag(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn type_code(self) -> u8 {
        ((self.0 & TYPE0_MASK) | ((self.0 >> TYPE1_SHIFT) & TYPE1_MASK)) as u8
    }

    pub fn tag_type(self) -> Result<TagType, CodecError> {
        TagType::from_code(self.type_code(), "ctag")
    }

    pub fn name(self) -> u32 {
        ((self.0 >> NAME_SHIFT) & NAME_MASK) as u32
    }

    pub fn field(self) -> u32 {
        ((self.0 >> FIELD_SHIFT) & FIELD_MASK) as u32
    }
}

/// Array header word: `count | element_type << 24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CarrayTag(u32);

impl CarrayTag {
    pub fn new(count: usize, element: TagType) -> Result<Self, CodecError> {
        if count > COUNT_MASK as usize {
            return Err(CodecError::ArrayTooLong(count));
        }
        Ok(CarrayTag(count as u32 | ((element as u32) << COUNT_BITS)))
    }

    pub fn from_raw(raw: u32) -> Self {
        CarrayTag(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn count(self) -> usize {
        (self.0 & COUNT_MASK) as usize
    }

    pub fn element_type(self) -> Result<TagType, CodecError> {
        TagType::from_code((self.0 >> COUNT_BITS) as u8, "array header")
    }
}

/// Bidirectional name dictionary for one namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagMatcher {
    names: HashMap<String, u32>,
    tags: Vec<String>,
    updated: bool,
}

impl TagMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the dictionary with the names a payload type already knows.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut matcher = Self::default();
        matcher.learn(tags);
        matcher
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Whether [`TagMatcher::index`] added names the server has not seen.
    pub fn is_updated(&self) -> bool {
        self.updated
    }

    /// Name for a 1-based index; 0 is the empty name.
    pub fn name(&self, index: u32) -> Result<&str, CodecError> {
        let index = index & NAME_MASK as u32;
        if index == 0 {
            return Ok("");
        }
        self.tags
            .get(index as usize - 1)
            .map(String::as_str)
            .ok_or(CodecError::UnknownName(index))
    }

    /// 1-based index for `name`, assigning the next one if it is new.
    pub fn index(&mut self, name: &str) -> Result<u32, CodecError> {
        if let Some(pos) = self.names.get(name) {
            return Ok(pos + 1);
        }
        if self.tags.len() >= MAX_TAG_NAMES {
            return Err(CodecError::DictionaryFull(MAX_TAG_NAMES));
        }
        let pos = self.tags.len() as u32;
        self.tags.push(name.to_string());
        self.names.insert(name.to_string(), pos);
        self.updated = true;
        Ok(pos + 1)
    }

    /// Adopts a full dictionary listing; names past the known ones are added
    /// at their listed positions.
    pub fn learn<I, S>(&mut self, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for (pos, name) in tags.into_iter().enumerate() {
            if pos < self.tags.len() || pos >= MAX_TAG_NAMES {
                continue;
            }
            let name = name.into();
            self.names.entry(name.clone()).or_insert(pos as u32);
            self.tags.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ctag_layout() {
        let tag = Ctag::with_field(TagType::String, 5, 3);
        assert_eq!(tag.raw(), 2 | (5 << 3) | (3 << 15));
        assert_eq!(tag.name(), 5);
        assert_eq!(tag.field(), 3);
        assert_eq!(tag.tag_type().unwrap(), TagType::String);
        assert_eq!(Ctag::END.raw(), 7);
    }

    #[test]
    fn high_type_bits() {
        let tag = Ctag::new(TagType::Float, 1);
        assert_eq!(tag.raw(), 1 | (1 << 3) | (1 << 29));
        assert_eq!(tag.type_code(), 9);
    }

    #[test]
    fn carray_word() {
        let tag = CarrayTag::new(3, TagType::Object).unwrap();
        assert_eq!(tag.raw(), 3 | (6 << 24));
        assert_eq!(tag.count(), 3);
        assert_eq!(tag.element_type().unwrap(), TagType::Object);
        assert!(matches!(
            CarrayTag::new(1 << 24, TagType::Varint),
            Err(CodecError::ArrayTooLong(_))
        ));
    }

    #[test]
    fn matcher_indexes() {
        let mut matcher = TagMatcher::from_tags(["id", "name"]);
        assert!(!matcher.is_updated());
        assert_eq!(matcher.index("name").unwrap(), 2);
        assert!(!matcher.is_updated());

        assert_eq!(matcher.index("year").unwrap(), 3);
        assert_eq!(matcher.index("year").unwrap(), 3);
        assert!(matcher.is_updated());

        assert_eq!(matcher.name(0).unwrap(), "");
        assert_eq!(matcher.name(3).unwrap(), "year");
        assert!(matches!(matcher.name(9), Err(CodecError::UnknownName(9))));
    }

    #[test]
    fn learn_appends_only_new_positions() {
        let mut matcher = TagMatcher::from_tags(["a"]);
        matcher.learn(["a", "b", "c"]);
        assert_eq!(matcher.tags(), &["a", "b", "c"]);
        assert_eq!(matcher.index("c").unwrap(), 3);
        assert!(!matcher.is_updated());
    }

    #[test]
    fn dictionary_limit() {
        let mut matcher = TagMatcher::from_tags((0..MAX_TAG_NAMES).map(|i| i.to_string()));
        assert!(matches!(
            matcher.index("overflow"),
            Err(CodecError::DictionaryFull(MAX_TAG_NAMES))
        ));
    }
}
