use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::{buffer::VarBuffer, error::CodecError, schema::PayloadType};

use super::{extra, flags};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetResult {
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub count: i64,
}

/// One aggregation block, as the server reports it in JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: f64,
    #[serde(default)]
    pub facets: Vec<FacetResult>,
    #[serde(default)]
    pub distincts: Vec<String>,
}

/// The decoded envelope of one result page plus its undecoded items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPage {
    pub flags: u64,
    pub total_count: u64,
    /// Items the whole query matched, across all pages.
    pub query_count: u64,
    /// Items in this page.
    pub count: u64,
    pub payload_types: Vec<PayloadType>,
    pub aggregations: Vec<AggregationResult>,
    pub explain: Option<String>,
    pub sharding_version: Option<i64>,
    pub shard_id: Option<u64>,
    pub incarnation_tags: BTreeMap<i64, Vec<i64>>,
    pub rank_format: Option<u64>,
    pub items: Vec<u8>,
}

impl ResultPage {
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut buf = VarBuffer::from(data);
        let mut page = ResultPage {
            flags: buf.get_varuint()?,
            total_count: buf.get_varuint()?,
            query_count: buf.get_varuint()?,
            count: buf.get_varuint()?,
            ..Default::default()
        };

        if page.format() == flags::FORMAT_PTRS {
            return Err(CodecError::UnsupportedFormat(page.flags));
        }

        if page.has(flags::WITH_PAYLOAD_TYPES) {
            let count = buf.get_varuint()?;
            for _ in 0..count {
                page.payload_types.push(PayloadType::read(&mut buf)?);
            }
        }

        loop {
            match buf.get_varuint()? {
                extra::END => break,
                extra::AGGREGATION => {
                    let len = buf.get_u32()? as usize;
                    let json = buf.get_bytes(len)?;
                    page.aggregations.push(serde_json::from_slice(&json)?);
                }
                extra::EXPLAIN => {
                    let len = buf.get_u32()? as usize;
                    let bytes = buf.get_bytes(len)?;
                    page.explain = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                extra::SHARDING_VERSION => page.sharding_version = Some(buf.get_varint()?),
                extra::SHARD_ID => page.shard_id = Some(buf.get_varuint()?),
                extra::INCARNATION_TAGS => {
                    let shards = buf.get_varuint()?;
                    for _ in 0..shards {
                        let shard = buf.get_varint()?;
                        let count = buf.get_varuint()?;
                        let mut tags = Vec::with_capacity(count.min(1024) as usize);
                        for _ in 0..count {
                            tags.push(buf.get_varint()?);
                        }
                        if !tags.is_empty() {
                            page.incarnation_tags.insert(shard, tags);
                        }
                    }
                }
                extra::RANK_FORMAT => {
                    let format = buf.get_varuint()?;
                    if format != extra::RANK_FORMAT_SINGLE_FLOAT {
                        return Err(CodecError::RankFormat(format));
                    }
                    page.rank_format = Some(format);
                }
                other => return Err(CodecError::UnknownExtra(other)),
            }
        }

        page.items = buf.unread().to_vec();
        debug!(
            "result page: {} of {} items, {} payload types, {} aggregations",
            page.count,
            page.query_count,
            page.payload_types.len(),
            page.aggregations.len()
        );
        Ok(page)
    }

    pub fn format(&self) -> u64 {
        self.flags & flags::FORMAT_MASK
    }

    pub fn has(&self, flag: u64) -> bool {
        self.flags & flag != 0
    }
}
