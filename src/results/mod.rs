//! Query results: page envelopes and the cursor-backed item stream.
//!
//! A select answers with one [`ResultPage`] and a server cursor id. The page
//! starts with counters and flags, may carry the schemas of every namespace the
//! query touched, then a list of extra blocks (aggregations, explain output,
//! shard details) and finally the raw item records. [`ResultStream`] walks the
//! items and fetches further pages through the same connection until `qcount`
//! items have been delivered.
mod page;
mod stream;

pub use page::{AggregationResult, FacetResult, ResultPage};
pub use stream::{ItemRecord, ResultStream};

pub mod flags {
    pub const FORMAT_MASK: u64 = 0xF;
    pub const FORMAT_PTRS: u64 = 0x1;
    pub const FORMAT_CJSON: u64 = 0x2;
    pub const FORMAT_JSON: u64 = 0x3;
    pub const WITH_PAYLOAD_TYPES: u64 = 0x10;
    pub const WITH_ITEM_ID: u64 = 0x20;
    pub const WITH_RANK: u64 = 0x40;
    pub const WITH_NS_ID: u64 = 0x80;
    pub const WITH_JOINED: u64 = 0x100;
    pub const WITH_SHARD_ID: u64 = 0x800;

    /// What this client asks for on every cjson select and fetch.
    pub const REQUESTED: u64 = FORMAT_CJSON | WITH_PAYLOAD_TYPES | WITH_ITEM_ID;
    /// Items rendered to JSON by the server; no schemas needed.
    pub const REQUESTED_JSON: u64 = FORMAT_JSON;
}

pub(crate) mod extra {
    pub const END: u64 = 0;
    pub const AGGREGATION: u64 = 1;
    pub const EXPLAIN: u64 = 2;
    pub const SHARDING_VERSION: u64 = 3;
    pub const SHARD_ID: u64 = 4;
    pub const INCARNATION_TAGS: u64 = 5;
    pub const RANK_FORMAT: u64 = 6;

    pub const RANK_FORMAT_SINGLE_FLOAT: u64 = 0;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::{buffer::VarBuffer, schema::PayloadType};

    use super::{extra, flags};

    /// Builds raw result pages the way the server lays them out.
    pub(crate) struct PageFixture {
        flags: u64,
        total: u64,
        qcount: Option<u64>,
        count: u64,
        payload_types: Vec<PayloadType>,
        extras: VarBuffer,
        items: VarBuffer,
    }

    impl PageFixture {
        pub fn new(flags: u64) -> Self {
            Self {
                flags,
                total: 0,
                qcount: None,
                count: 0,
                payload_types: Vec::new(),
                extras: VarBuffer::new(),
                items: VarBuffer::new(),
            }
        }

        pub fn cjson() -> Self {
            Self::new(flags::REQUESTED)
        }

        pub fn totals(mut self, total: u64, qcount: u64) -> Self {
            self.total = total;
            self.qcount = Some(qcount);
            self
        }

        pub fn payload_type(mut self, pt: PayloadType) -> Self {
            self.flags |= flags::WITH_PAYLOAD_TYPES;
            self.payload_types.push(pt);
            self
        }

        pub fn aggregation(mut self, json: &str) -> Self {
            self.extras
                .put_varuint(extra::AGGREGATION)
                .put_u32(json.len() as u32)
                .write_bytes(json.as_bytes());
            self
        }

        pub fn extra(mut self, f: impl FnOnce(&mut VarBuffer)) -> Self {
            f(&mut self.extras);
            self
        }

        /// One item with id `id`, params per the page flags, no sub-results.
        pub fn item(self, id: u64, payload: &[u8]) -> Self {
            let bits = self.flags;
            self.item_with(|buf| {
                if bits & flags::WITH_ITEM_ID != 0 {
                    buf.put_varuint(id).put_varuint(1);
                }
                if bits & flags::WITH_NS_ID != 0 {
                    buf.put_varuint(0);
                }
                if bits & flags::WITH_RANK != 0 {
                    buf.put_varuint(0);
                }
                buf.put_u32(payload.len() as u32).write_bytes(payload);
                if bits & flags::WITH_JOINED != 0 {
                    buf.put_varuint(0);
                }
            })
        }

        pub fn item_with(mut self, f: impl FnOnce(&mut VarBuffer)) -> Self {
            f(&mut self.items);
            self.count += 1;
            self
        }

        pub fn build(self) -> Vec<u8> {
            let mut buf = VarBuffer::new();
            buf.put_varuint(self.flags)
                .put_varuint(self.total)
                .put_varuint(self.qcount.unwrap_or(self.count))
                .put_varuint(self.count);
            if self.flags & flags::WITH_PAYLOAD_TYPES != 0 {
                buf.put_varuint(self.payload_types.len() as u64);
                for pt in &self.payload_types {
                    pt.write(&mut buf);
                }
            }
            buf.write_bytes(self.extras.as_bytes())
                .put_varuint(extra::END)
                .write_bytes(self.items.as_bytes());
            buf.into_bytes()
        }
    }
}
