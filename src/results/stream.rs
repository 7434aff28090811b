use std::collections::{BTreeMap, HashMap};

use log::{debug, error, trace};

use crate::{
    buffer::VarBuffer,
    cjson::{self, CjsonValue, FromCjson, ObjectDescriptor, TagMatcher},
    error::{CodecError, Error, ProtocolError},
    protocol::{Arg, Command, Response, RpcCall},
    query::{CompiledQuery, JoinLayout},
    schema::PayloadType,
};

use super::{AggregationResult, ResultPage, flags};

/// One decoded item and the metadata the page carried for it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemRecord {
    pub value: CjsonValue,
    pub id: Option<u64>,
    pub version: Option<u64>,
    pub ns_id: Option<u64>,
    pub rank: Option<u64>,
    pub shard_id: Option<u64>,
    /// Joined sub-items grouped by join field.
    pub joined: BTreeMap<String, Vec<ItemRecord>>,
}

impl ItemRecord {
    /// Maps the item onto `T`, storing joined items under their join field
    /// when `T` declares it.
    pub fn decode<T: ObjectDescriptor>(&self) -> Result<T, CodecError> {
        let mut item: T = cjson::from_cjson(&self.value)?;
        for (field, records) in &self.joined {
            if !T::list_fields().iter().any(|f| f.name == field.as_str()) {
                trace!("no field `{field}` for join results");
                continue;
            }
            let values = records.iter().map(|r| r.value.clone()).collect();
            item.set(field, &CjsonValue::Array(values))
                .map_err(|e| e.in_field(field.as_str()))?;
        }
        Ok(item)
    }

    pub fn field<T: FromCjson>(&self, name: &str) -> Result<Option<T>, CodecError> {
        self.value
            .get(name)
            .map(T::from_cjson)
            .transpose()
            .map_err(|e| e.in_field(name))
    }
}

/// Schemas and tag dictionaries for one stream, keyed by namespace index.
#[derive(Debug, Default)]
struct SchemaCache {
    entries: HashMap<u64, (PayloadType, TagMatcher)>,
}

impl SchemaCache {
    fn update(&mut self, pt: &PayloadType) {
        let stale = self
            .entries
            .get(&pt.ns_id)
            .is_none_or(|(cached, _)| cached.is_superseded_by(pt));
        if stale {
            debug!(
                "caching schema of {} (ns {}, version {}, state {})",
                pt.ns_name, pt.ns_id, pt.version, pt.state_token
            );
            self.entries.insert(pt.ns_id, (pt.clone(), pt.matcher()));
        }
    }

    fn decode(&mut self, ns_id: u64, data: &[u8]) -> Result<CjsonValue, CodecError> {
        let (_, matcher) = self
            .entries
            .get_mut(&ns_id)
            .ok_or(CodecError::UnknownNamespace(ns_id))?;
        cjson::decode(data, matcher)
    }
}

#[derive(Debug, Default)]
struct ItemParams {
    id: Option<u64>,
    version: Option<u64>,
    ns_id: Option<u64>,
    rank: Option<u64>,
    shard_id: Option<u64>,
}

/// Cursor over the items of one select.
///
/// Pages are fetched lazily over the connection that ran the select, which
/// the stream owns until it is closed. Dropping the stream closes it.
pub struct ResultStream<C: RpcCall> {
    conn: Option<C>,
    page: ResultPage,
    items: VarBuffer,
    cursor_id: i64,
    delivered: u64,
    fetched: u64,
    fetch_count: i32,
    request_flags: u64,
    layout: JoinLayout,
    schemas: SchemaCache,
    closed: bool,
}

fn batch_size(fetch_count: i32) -> i32 {
    if fetch_count <= 0 {
        i32::MAX
    } else {
        fetch_count
    }
}

fn int_arg(value: i64) -> Result<Arg, Error> {
    i32::try_from(value)
        .map(Arg::Int)
        .map_err(|_| ProtocolError::IntOutOfRange(value).into())
}

fn unsigned_arg(value: u64) -> Result<Arg, Error> {
    int_arg(i64::try_from(value).unwrap_or(i64::MAX))
}

impl<C: RpcCall> ResultStream<C> {
    /// Runs a compiled query on `conn`. `known` holds schemas the caller
    /// already has, by namespace index; their state tokens let the server
    /// skip resending them.
    pub fn select(
        conn: C,
        query: CompiledQuery,
        fetch_count: i32,
        known: &HashMap<usize, PayloadType>,
    ) -> Result<Self, Error> {
        Self::run(conn, query, fetch_count, known, flags::REQUESTED)
    }

    /// Like [`ResultStream::select`], but the server renders every item as
    /// JSON. Joined items come embedded in their parent's JSON.
    pub fn select_json(conn: C, query: CompiledQuery, fetch_count: i32) -> Result<Self, Error> {
        Self::run(conn, query, fetch_count, &HashMap::new(), flags::REQUESTED_JSON)
    }

    fn run(
        conn: C,
        query: CompiledQuery,
        fetch_count: i32,
        known: &HashMap<usize, PayloadType>,
        request_flags: u64,
    ) -> Result<Self, Error> {
        let pt_versions: Vec<i64> = (0..query.namespaces.len())
            .map(|i| known.get(&i).map_or(0, |pt| pt.state_token))
            .collect();
        let fetch_count = if query.fetch_count > 0 {
            query.fetch_count
        } else {
            fetch_count
        };

        let response = conn.call(
            Command::Select,
            vec![
                Arg::Bytes(query.data),
                unsigned_arg(request_flags)?,
                Arg::Int(batch_size(fetch_count)),
                Arg::int64_array(&pt_versions),
            ],
        )?;

        let mut schemas = SchemaCache::default();
        for (index, pt) in known {
            let mut pt = pt.clone();
            pt.ns_id = *index as u64;
            schemas.update(&pt);
        }
        Self::start(
            conn,
            response,
            fetch_count,
            request_flags,
            query.layout,
            schemas,
        )
    }

    pub fn select_sql(conn: C, sql: &str, fetch_count: i32) -> Result<Self, Error> {
        Self::run_sql(conn, sql, fetch_count, flags::REQUESTED)
    }

    /// SQL select with items rendered as JSON.
    pub fn select_sql_json(conn: C, sql: &str, fetch_count: i32) -> Result<Self, Error> {
        Self::run_sql(conn, sql, fetch_count, flags::REQUESTED_JSON)
    }

    fn run_sql(conn: C, sql: &str, fetch_count: i32, request_flags: u64) -> Result<Self, Error> {
        let response = conn.call(
            Command::SelectSql,
            vec![
                Arg::from(sql),
                unsigned_arg(request_flags)?,
                Arg::Int(batch_size(fetch_count)),
                Arg::int64_array(&[]),
            ],
        )?;
        Self::start(
            conn,
            response,
            fetch_count,
            request_flags,
            JoinLayout::default(),
            SchemaCache::default(),
        )
    }

    fn start(
        conn: C,
        response: Response,
        fetch_count: i32,
        request_flags: u64,
        layout: JoinLayout,
        schemas: SchemaCache,
    ) -> Result<Self, Error> {
        let mut stream = Self {
            conn: Some(conn),
            page: ResultPage::default(),
            items: VarBuffer::new(),
            cursor_id: -1,
            delivered: 0,
            fetched: 0,
            fetch_count,
            request_flags,
            layout,
            schemas,
            closed: false,
        };
        // on failure the stream drops here and releases the cursor
        stream.apply(&response)?;
        Ok(stream)
    }

    fn apply(&mut self, response: &Response) -> Result<(), Error> {
        if let Ok(cursor) = response.int_arg(1) {
            self.cursor_id = cursor;
        }
        let mut page = ResultPage::decode(response.bytes_arg(0)?)?;
        for pt in &page.payload_types {
            self.schemas.update(pt);
        }
        self.items = VarBuffer::from(std::mem::take(&mut page.items));
        self.fetched += page.count;
        self.page = page;
        Ok(())
    }

    fn fetch(&mut self) -> Result<(), Error> {
        let conn = self.conn.as_ref().ok_or(Error::StreamClosed)?;
        trace!(
            "fetching results of cursor {} from offset {}",
            self.cursor_id, self.delivered
        );
        let response = conn.call(
            Command::FetchResults,
            vec![
                int_arg(self.cursor_id)?,
                unsigned_arg(self.request_flags)?,
                unsigned_arg(self.delivered)?,
                Arg::Int(batch_size(self.fetch_count)),
            ],
        )?;
        self.apply(&response)
    }

    /// Items the query matched, including ones not yet delivered.
    pub fn len(&self) -> u64 {
        self.page.query_count
    }

    pub fn is_empty(&self) -> bool {
        self.page.query_count == 0
    }

    /// The total the server computed for `req_total` queries.
    pub fn total(&self) -> u64 {
        self.page.total_count
    }

    pub fn aggregations(&self) -> &[AggregationResult] {
        &self.page.aggregations
    }

    pub fn explain(&self) -> Option<&str> {
        self.page.explain.as_deref()
    }

    pub fn page(&self) -> &ResultPage {
        &self.page
    }

    pub fn cursor_id(&self) -> i64 {
        self.cursor_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Schema the stream holds for namespace index `ns_id`.
    pub fn payload_type(&self, ns_id: u64) -> Option<&PayloadType> {
        self.schemas.entries.get(&ns_id).map(|(pt, _)| pt)
    }

    /// Drains the remaining items into `{"<root>": [item, ...]}`.
    pub fn into_json(mut self, root: &str) -> Result<serde_json::Value, Error> {
        let mut items = Vec::new();
        while let Some(record) = self.next_item()? {
            items.push(serde_json::Value::from(record.value));
        }
        let mut object = serde_json::Map::new();
        object.insert(root.to_string(), serde_json::Value::Array(items));
        Ok(serde_json::Value::Object(object))
    }

    pub fn has_next(&self) -> bool {
        self.delivered < self.page.query_count
    }

    /// The next item, `Ok(None)` once all matched items were delivered.
    ///
    /// Any error closes the stream; later calls fail with
    /// [`Error::StreamClosed`].
    pub fn next_item(&mut self) -> Result<Option<ItemRecord>, Error> {
        if !self.has_next() {
            self.close();
            return Ok(None);
        }
        if self.closed {
            return Err(Error::StreamClosed);
        }

        match self.read_next() {
            Ok(record) => {
                self.delivered += 1;
                if !self.has_next() {
                    self.close();
                }
                Ok(Some(record))
            }
            Err(err) => {
                debug!("closing result stream after error: {err}");
                if err.is_connection_fatal() {
                    // the cursor dies with the connection
                    self.cursor_id = -1;
                }
                self.close();
                Err(err)
            }
        }
    }

    fn read_next(&mut self) -> Result<ItemRecord, Error> {
        if self.delivered >= self.fetched {
            self.fetch()?;
        }
        let page_flags = self.page.flags;
        let page_shard = self.page.shard_id;
        let record = read_record(
            &mut self.items,
            page_flags,
            page_shard,
            &self.layout,
            &mut self.schemas,
        )?;
        Ok(record)
    }

    /// Releases the server cursor and the connection. Idempotent; failures
    /// are logged, not returned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(conn) = self.conn.take() {
            if self.cursor_id >= 0 {
                trace!("closing cursor {}", self.cursor_id);
                let result = int_arg(self.cursor_id)
                    .and_then(|cursor| conn.call(Command::CloseResults, vec![cursor]));
                if let Err(err) = result {
                    error!("failed to close results cursor {}: {err}", self.cursor_id);
                }
            }
        }
        self.cursor_id = -1;
    }
}

fn read_params(
    buf: &mut VarBuffer,
    page_flags: u64,
    page_shard: Option<u64>,
) -> Result<ItemParams, CodecError> {
    let mut params = ItemParams::default();
    if page_flags & flags::WITH_ITEM_ID != 0 {
        params.id = Some(buf.get_varuint()?);
        params.version = Some(buf.get_varuint()?);
    }
    if page_flags & flags::WITH_NS_ID != 0 {
        params.ns_id = Some(buf.get_varuint()?);
    }
    if page_flags & flags::WITH_RANK != 0 {
        params.rank = Some(buf.get_varuint()?);
    }
    if page_flags & flags::WITH_SHARD_ID != 0 {
        params.shard_id = match page_shard {
            Some(shard) => Some(shard),
            None => Some(buf.get_varuint()?),
        };
    }
    Ok(params)
}

fn read_payload(
    buf: &mut VarBuffer,
    ns_id: u64,
    schemas: &mut SchemaCache,
) -> Result<CjsonValue, CodecError> {
    let len = buf.get_u32()? as usize;
    let data = buf.get_bytes(len)?;
    schemas.decode(ns_id, &data)
}

fn read_json(buf: &mut VarBuffer) -> Result<CjsonValue, CodecError> {
    let len = buf.get_u32()? as usize;
    let data = buf.get_bytes(len)?;
    let json: serde_json::Value = serde_json::from_slice(&data).map_err(CodecError::JsonItem)?;
    Ok(CjsonValue::from(json))
}

fn record(value: CjsonValue, params: ItemParams) -> ItemRecord {
    ItemRecord {
        value,
        id: params.id,
        version: params.version,
        ns_id: params.ns_id,
        rank: params.rank,
        shard_id: params.shard_id,
        joined: BTreeMap::new(),
    }
}

fn read_record(
    buf: &mut VarBuffer,
    page_flags: u64,
    page_shard: Option<u64>,
    layout: &JoinLayout,
    schemas: &mut SchemaCache,
) -> Result<ItemRecord, CodecError> {
    let params = read_params(buf, page_flags, page_shard)?;
    if page_flags & flags::FORMAT_MASK == flags::FORMAT_JSON {
        // joined items are already part of the json
        return Ok(record(read_json(buf)?, params));
    }
    let ns_id = params.ns_id.unwrap_or(0);
    let value = read_payload(buf, ns_id, schemas)?;
    let mut item = record(value, params);

    if page_flags & flags::WITH_JOINED == 0 {
        return Ok(item);
    }

    let sub_results = buf.get_varuint()? as usize;
    for position in 0..sub_results {
        let (ns_index, field) = layout
            .resolve(ns_id as usize, position)
            .ok_or(CodecError::UnknownNamespace(ns_id))?;
        let count = buf.get_varuint()?;
        let joined = item.joined.entry(field.to_string()).or_default();
        for _ in 0..count {
            let params = read_params(buf, page_flags, page_shard)?;
            let value = read_payload(buf, ns_index as u64, schemas)?;
            joined.push(record(value, params));
        }
    }
    Ok(item)
}

impl<C: RpcCall> Iterator for ResultStream<C> {
    type Item = Result<ItemRecord, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed && self.has_next() {
            return None;
        }
        self.next_item().transpose()
    }
}

impl<C: RpcCall> Drop for ResultStream<C> {
    fn drop(&mut self) {
        self.close();
    }
}
