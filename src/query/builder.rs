use log::trace;
use serde::Serialize;

use crate::{
    buffer::VarBuffer,
    error::{Error, QueryError},
};

use super::{AggregationType, Condition, JoinType, Op, VALUE_STRING, Value, opcode};

/// A select, update or delete query under construction.
///
/// Every builder method appends its opcode immediately, so the order of calls
/// is the order the server evaluates them in. Misuse is remembered and
/// reported by [`Query::into_program`].
#[derive(Debug, Clone)]
pub struct Query {
    namespace: String,
    buf: VarBuffer,
    next_op: Op,
    join_type: JoinType,
    joins: Vec<Query>,
    join_fields: Vec<String>,
    merges: Vec<Query>,
    open_brackets: usize,
    fetch_count: i32,
    error: Option<QueryError>,
}

impl Query {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let mut buf = VarBuffer::new();
        buf.put_vstring(&namespace);
        Self {
            namespace,
            buf,
            next_op: Op::And,
            join_type: JoinType::Left,
            joins: Vec::new(),
            join_fields: Vec::new(),
            merges: Vec::new(),
            open_brackets: 0,
            fetch_count: 0,
            error: None,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn fail(&mut self, err: QueryError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn take_op(&mut self) -> Op {
        std::mem::take(&mut self.next_op)
    }

    fn condition(mut self, index: &str, condition: Condition, values: Vec<Value>) -> Self {
        let op = self.take_op();
        self.buf
            .put_varuint(opcode::CONDITION)
            .put_vstring(index)
            .put_varuint(op.code())
            .put_varuint(condition.code())
            .put_varuint(values.len() as u64);
        for value in &values {
            value.encode(&mut self.buf);
        }
        self
    }

    pub fn where_(self, index: &str, condition: Condition, value: impl Into<Value>) -> Self {
        self.condition(index, condition, vec![value.into()])
    }

    pub fn where_values<I, V>(self, index: &str, condition: Condition, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.condition(index, condition, values)
    }

    /// Condition on a composite index; each inner vector is one key tuple.
    pub fn where_composite(self, index: &str, condition: Condition, keys: Vec<Vec<Value>>) -> Self {
        let values = keys.into_iter().map(Value::Tuple).collect();
        self.condition(index, condition, values)
    }

    pub fn is_null(self, index: &str) -> Self {
        self.condition(index, Condition::Empty, Vec::new())
    }

    pub fn is_not_null(self, index: &str) -> Self {
        self.condition(index, Condition::Any, Vec::new())
    }

    pub fn like(self, index: &str, pattern: &str) -> Self {
        self.condition(index, Condition::Like, vec![Value::from(pattern)])
    }

    pub fn where_between_fields(mut self, first: &str, condition: Condition, second: &str) -> Self {
        let op = self.take_op();
        self.buf
            .put_varuint(opcode::BETWEEN_FIELDS_CONDITION)
            .put_varuint(op.code())
            .put_vstring(first)
            .put_varuint(condition.code())
            .put_vstring(second);
        self
    }

    /// The next condition, bracket or inner join is OR'ed with the previous one.
    pub fn or(mut self) -> Self {
        self.next_op = Op::Or;
        self
    }

    pub fn not(mut self) -> Self {
        self.next_op = Op::Not;
        self
    }

    pub fn open_bracket(mut self) -> Self {
        let op = self.take_op();
        self.buf
            .put_varuint(opcode::OPEN_BRACKET)
            .put_varuint(op.code());
        self.open_brackets += 1;
        self
    }

    pub fn close_bracket(mut self) -> Self {
        if self.next_op != Op::And {
            self.fail(QueryError::OperationBeforeClose);
            return self;
        }
        if self.open_brackets == 0 {
            self.fail(QueryError::UnbalancedBracket);
            return self;
        }
        self.open_brackets -= 1;
        self.buf.put_varuint(opcode::CLOSE_BRACKET);
        self
    }

    /// Restricts the returned fields.
    pub fn select(mut self, fields: &[&str]) -> Self {
        for field in fields {
            self.buf
                .put_varuint(opcode::SELECT_FILTER)
                .put_vstring(field);
        }
        self
    }

    pub fn sort(self, index: &str, desc: bool) -> Self {
        self.sort_by_values(index, desc, Vec::<Value>::new())
    }

    /// Sorts with `values` forced to the front, in the given order.
    pub fn sort_by_values<I, V>(mut self, index: &str, desc: bool, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        self.buf
            .put_varuint(opcode::SORT_INDEX)
            .put_vstring(index)
            .put_varuint(u64::from(desc))
            .put_varuint(values.len() as u64);
        for value in &values {
            value.encode(&mut self.buf);
        }
        self
    }

    pub fn limit(mut self, limit: i32) -> Self {
        if limit >= 0 {
            self.buf
                .put_varuint(opcode::LIMIT)
                .put_varuint(limit as u64);
        }
        self
    }

    pub fn offset(mut self, offset: i32) -> Self {
        if offset > 0 {
            self.buf
                .put_varuint(opcode::OFFSET)
                .put_varuint(offset as u64);
        }
        self
    }

    /// Asks the server for the exact total count of matching items.
    pub fn req_total(mut self) -> Self {
        self.buf
            .put_varuint(opcode::REQ_TOTAL)
            .put_varuint(opcode::MODE_ACCURATE_TOTAL);
        self
    }

    fn aggregate(mut self, kind: AggregationType, field: &str) -> Self {
        self.buf
            .put_varuint(opcode::AGGREGATION)
            .put_varuint(kind.code())
            .put_varuint(1)
            .put_vstring(field);
        self
    }

    pub fn aggregate_sum(self, field: &str) -> Self {
        self.aggregate(AggregationType::Sum, field)
    }

    pub fn aggregate_avg(self, field: &str) -> Self {
        self.aggregate(AggregationType::Avg, field)
    }

    pub fn aggregate_min(self, field: &str) -> Self {
        self.aggregate(AggregationType::Min, field)
    }

    pub fn aggregate_max(self, field: &str) -> Self {
        self.aggregate(AggregationType::Max, field)
    }

    pub fn aggregate_distinct(self, field: &str) -> Self {
        self.aggregate(AggregationType::Distinct, field)
    }

    pub fn aggregate_facet(mut self, facet: Facet) -> Self {
        self.buf
            .put_varuint(opcode::AGGREGATION)
            .put_varuint(AggregationType::Facet.code())
            .put_varuint(facet.fields.len() as u64);
        for field in &facet.fields {
            self.buf.put_vstring(field);
        }
        self.buf.write_bytes(facet.tail.as_bytes());
        self
    }

    /// Sets `field` to a single value in an update query.
    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.buf
            .put_varuint(opcode::UPDATE_FIELD)
            .put_vstring(field)
            .put_varuint(1)
            .put_varuint(0);
        value.into().encode(&mut self.buf);
        self
    }

    /// Sets `field` to an array value.
    pub fn set_array<I, V>(mut self, field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.len() <= 1 {
            // the v2 opcode keeps one-element and empty arrays as arrays
            self.buf
                .put_varuint(opcode::UPDATE_FIELD_V2)
                .put_vstring(field)
                .put_varuint(1);
        } else {
            self.buf
                .put_varuint(opcode::UPDATE_FIELD)
                .put_vstring(field);
        }
        self.buf.put_varuint(values.len() as u64);
        for value in &values {
            self.buf.put_varuint(0);
            value.encode(&mut self.buf);
        }
        self
    }

    pub fn set_object_json(self, field: &str, json: &str) -> Self {
        self.update_object(field, &[json], false)
    }

    pub fn set_objects_json(self, field: &str, json: &[&str]) -> Self {
        self.update_object(field, json, true)
    }

    /// Serializes `value` with serde and sets it as an object field.
    pub fn set_object<T: Serialize>(self, field: &str, value: &T) -> Result<Self, Error> {
        let json = serde_json::to_string(value)?;
        Ok(self.update_object(field, &[json.as_str()], false))
    }

    fn update_object(mut self, field: &str, json: &[&str], is_array: bool) -> Self {
        self.buf
            .put_varuint(opcode::UPDATE_OBJECT)
            .put_vstring(field)
            .put_varuint(json.len() as u64)
            .put_varuint(u64::from(is_array));
        for doc in json {
            self.buf
                .put_varuint(0)
                .put_varuint(VALUE_STRING)
                .put_vstring(doc);
        }
        self
    }

    pub fn drop_field(mut self, field: &str) -> Self {
        self.buf
            .put_varuint(opcode::DROP_FIELD)
            .put_vstring(field);
        self
    }

    /// Adds `query` as a join whose results land under `field` in each item.
    pub fn join(mut self, mut query: Query, field: &str, mut join_type: JoinType) -> Self {
        if self.next_op == Op::Or && join_type == JoinType::Inner {
            join_type = JoinType::OrInner;
            self.next_op = Op::And;
        }
        if join_type != JoinType::Left {
            self.buf
                .put_varuint(opcode::JOIN_CONDITION)
                .put_varuint(join_type.code())
                .put_varuint(self.joins.len() as u64);
        }
        trace!(
            "{} join of {} into {} as `{field}`",
            join_type.code(),
            query.namespace,
            self.namespace
        );

        query.join_type = join_type;
        self.joins.push(query);
        self.join_fields.push(field.to_string());
        self
    }

    pub fn inner_join(self, query: Query, field: &str) -> Self {
        self.join(query, field, JoinType::Inner)
    }

    pub fn left_join(self, query: Query, field: &str) -> Self {
        self.join(query, field, JoinType::Left)
    }

    /// Join condition for the most recently added join: `join_field` of the
    /// joined namespace compared with `index` of this one.
    pub fn on(mut self, index: &str, condition: Condition, join_field: &str) -> Self {
        let op = self.take_op();
        let Some(join) = self.joins.last_mut() else {
            self.fail(QueryError::OnWithoutJoin);
            return self;
        };
        join.buf
            .put_varuint(opcode::JOIN_ON)
            .put_varuint(op.code())
            .put_varuint(condition.code())
            .put_vstring(index)
            .put_vstring(join_field);
        self
    }

    pub fn merge(mut self, query: Query) -> Self {
        self.merges.push(query);
        self
    }

    /// Items per network page; zero or negative uses the client default.
    pub fn fetch_count(mut self, fetch_count: i32) -> Self {
        self.fetch_count = fetch_count;
        self
    }

    fn check(&self) -> Result<(), QueryError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.open_brackets > 0 {
            return Err(QueryError::UnclosedBracket(self.open_brackets));
        }
        Ok(())
    }

    fn append_sub(out: &mut VarBuffer, tag: JoinType, sub: &Query) {
        out.put_varuint(tag.code())
            .write_bytes(sub.buf.as_bytes())
            .put_varuint(opcode::END);
    }

    /// Validates and assembles the final program.
    pub fn into_program(self) -> Result<CompiledQuery, QueryError> {
        self.check()?;
        for join in &self.joins {
            join.check()?;
            if !join.joins.is_empty() || !join.merges.is_empty() {
                return Err(QueryError::NestedSubquery);
            }
        }
        for merge in &self.merges {
            merge.check()?;
            if !merge.merges.is_empty() {
                return Err(QueryError::NestedSubquery);
            }
            for join in &merge.joins {
                join.check()?;
                if !join.joins.is_empty() || !join.merges.is_empty() {
                    return Err(QueryError::NestedSubquery);
                }
            }
        }

        let mut out = VarBuffer::with_capacity(self.buf.len() + 1);
        out.write_bytes(self.buf.as_bytes()).put_varuint(opcode::END);
        for join in &self.joins {
            Self::append_sub(&mut out, join.join_type, join);
        }
        for merge in &self.merges {
            Self::append_sub(&mut out, JoinType::Merge, merge);
            for join in &merge.joins {
                Self::append_sub(&mut out, join.join_type, join);
            }
        }

        let mut namespaces = vec![self.namespace.clone()];
        namespaces.extend(self.merges.iter().map(|m| m.namespace.clone()));
        namespaces.extend(self.joins.iter().map(|j| j.namespace.clone()));
        for merge in &self.merges {
            namespaces.extend(merge.joins.iter().map(|j| j.namespace.clone()));
        }

        let layout = JoinLayout {
            root_join_fields: self.join_fields,
            merge_join_fields: self.merges.into_iter().map(|m| m.join_fields).collect(),
        };

        Ok(CompiledQuery {
            data: out.into_bytes(),
            namespaces,
            layout,
            fetch_count: self.fetch_count,
        })
    }
}

/// Facet aggregation over one or more fields.
#[derive(Debug, Clone)]
pub struct Facet {
    fields: Vec<String>,
    tail: VarBuffer,
}

impl Facet {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            tail: VarBuffer::new(),
        }
    }

    pub fn sort(mut self, field: &str, desc: bool) -> Self {
        self.tail
            .put_varuint(opcode::AGGREGATION_SORT)
            .put_vstring(field)
            .put_varuint(u64::from(desc));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.tail
            .put_varuint(opcode::AGGREGATION_LIMIT)
            .put_varuint(u64::from(limit));
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.tail
            .put_varuint(opcode::AGGREGATION_OFFSET)
            .put_varuint(u64::from(offset));
        self
    }
}

/// Which namespace and parent field each joined sub-result belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinLayout {
    pub root_join_fields: Vec<String>,
    /// Join fields of each merged query, in merge order.
    pub merge_join_fields: Vec<Vec<String>>,
}

impl JoinLayout {
    /// Resolves the `position`-th joined sub-result of an item from namespace
    /// `ns_id` (0 is the root, `n` the `n`-th merge) to its index in
    /// [`CompiledQuery::namespaces`] and the field it is stored under.
    pub fn resolve(&self, ns_id: usize, position: usize) -> Option<(usize, &str)> {
        let merges = self.merge_join_fields.len();
        let fields = if ns_id == 0 {
            &self.root_join_fields
        } else {
            self.merge_join_fields.get(ns_id - 1)?
        };
        let field = fields.get(position)?;

        let mut offset = 1 + merges;
        if ns_id > 0 {
            offset += self.root_join_fields.len();
            offset += self.merge_join_fields[..ns_id - 1]
                .iter()
                .map(Vec::len)
                .sum::<usize>();
        }
        Some((offset + position, field.as_str()))
    }
}

/// A validated query program ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub data: Vec<u8>,
    /// Root, merged, root-joined, then merge-joined namespaces.
    pub namespaces: Vec<String>,
    pub layout: JoinLayout,
    pub fetch_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vstr(s: &str) -> Vec<u8> {
        let mut v = vec![s.len() as u8];
        v.extend_from_slice(s.as_bytes());
        v
    }

    fn program(parts: &[&[u8]]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn where_and_limit() {
        let compiled = Query::new("items")
            .where_("id", Condition::Eq, 5)
            .limit(10)
            .into_program()
            .unwrap();

        assert_eq!(
            compiled.data,
            program(&[&vstr("items"), &[0], &vstr("id"), &[2, 1, 1, 8, 10, 4, 10, 11]])
        );
        assert_eq!(compiled.namespaces, vec!["items".to_string()]);
        assert_eq!(compiled.fetch_count, 0);
    }

    #[test]
    fn or_and_not_are_consumed() {
        let compiled = Query::new("n")
            .where_("a", Condition::Gt, 1)
            .or()
            .where_("b", Condition::Lt, 2)
            .not()
            .is_null("c")
            .where_("d", Condition::Eq, true)
            .into_program()
            .unwrap();

        assert_eq!(
            compiled.data,
            program(&[
                &vstr("n"),
                &[0],
                &vstr("a"),
                &[2, 4, 1, 8, 2],
                &[0],
                &vstr("b"),
                &[1, 2, 1, 8, 4],
                &[0],
                &vstr("c"),
                &[3, 9, 0],
                &[0],
                &vstr("d"),
                &[2, 1, 1, 3, 1],
                &[11],
            ])
        );
    }

    #[test]
    fn limit_and_offset_gating() {
        let base = Query::new("n").into_program().unwrap().data;
        let gated = Query::new("n").limit(-1).offset(0).into_program().unwrap();
        assert_eq!(gated.data, base);

        let written = Query::new("n").limit(0).offset(3).into_program().unwrap();
        assert_eq!(written.data, program(&[&vstr("n"), &[4, 0, 5, 3, 11]]));
    }

    #[test]
    fn brackets() {
        let ok = Query::new("n")
            .open_bracket()
            .where_("a", Condition::Eq, 1)
            .close_bracket()
            .into_program()
            .unwrap();
        assert_eq!(
            ok.data,
            program(&[&vstr("n"), &[18, 2, 0], &vstr("a"), &[2, 1, 1, 8, 2, 19, 11]])
        );

        let err = Query::new("n").close_bracket().into_program().unwrap_err();
        assert_eq!(err, QueryError::UnbalancedBracket);

        let err = Query::new("n")
            .open_bracket()
            .or()
            .close_bracket()
            .into_program()
            .unwrap_err();
        assert_eq!(err, QueryError::OperationBeforeClose);

        let err = Query::new("n").open_bracket().into_program().unwrap_err();
        assert_eq!(err, QueryError::UnclosedBracket(1));
    }

    #[test]
    fn on_requires_a_join() {
        let err = Query::new("n")
            .on("id", Condition::Eq, "item_id")
            .into_program()
            .unwrap_err();
        assert_eq!(err, QueryError::OnWithoutJoin);
    }

    #[test]
    fn inner_join_after_or_downgrades() {
        let compiled = Query::new("items")
            .where_("id", Condition::Eq, 1)
            .or()
            .inner_join(Query::new("actors"), "actors")
            .on("actor_id", Condition::Eq, "id")
            .where_("x", Condition::Eq, 2)
            .into_program()
            .unwrap();

        let mut expected = program(&[
            &vstr("items"),
            &[0],
            &vstr("id"),
            &[2, 1, 1, 8, 2],
            &[20, 2, 0],
            &[0],
            &vstr("x"),
            &[2, 1, 1, 8, 4],
            &[11],
        ]);
        expected.push(2);
        expected.extend(program(&[
            &vstr("actors"),
            &[3, 2, 1],
            &vstr("actor_id"),
            &vstr("id"),
            &[11],
        ]));
        assert_eq!(compiled.data, expected);
        assert_eq!(compiled.layout.root_join_fields, vec!["actors".to_string()]);
    }

    #[test]
    fn left_join_has_no_condition_opcode() {
        let compiled = Query::new("a")
            .left_join(Query::new("b"), "bs")
            .into_program()
            .unwrap();
        assert_eq!(
            compiled.data,
            program(&[&vstr("a"), &[11, 0], &vstr("b"), &[11]])
        );
    }

    #[test]
    fn merge_assembly_order() {
        let merged = Query::new("m").inner_join(Query::new("mj"), "mjf");
        let compiled = Query::new("r")
            .left_join(Query::new("rj"), "rjf")
            .merge(merged)
            .into_program()
            .unwrap();

        assert_eq!(
            compiled.data,
            program(&[
                &vstr("r"),
                &[11],
                &[0],
                &vstr("rj"),
                &[11],
                &[3],
                &vstr("m"),
                &[20, 1, 0, 11],
                &[1],
                &vstr("mj"),
                &[11],
            ])
        );
        assert_eq!(compiled.namespaces, vec!["r", "m", "rj", "mj"]);
        assert_eq!(compiled.layout.resolve(0, 0), Some((2, "rjf")));
        assert_eq!(compiled.layout.resolve(1, 0), Some((3, "mjf")));
        assert_eq!(compiled.layout.resolve(0, 1), None);
        assert_eq!(compiled.layout.resolve(2, 0), None);
    }

    #[test]
    fn nested_subqueries_rejected() {
        let nested = Query::new("j").left_join(Query::new("k"), "k");
        let err = Query::new("r")
            .left_join(nested, "j")
            .into_program()
            .unwrap_err();
        assert_eq!(err, QueryError::NestedSubquery);
    }

    #[test]
    fn update_opcodes() {
        let compiled = Query::new("n")
            .set("a", 1)
            .set_array("b", [7])
            .set_array("c", [1, 2])
            .set_object_json("d", "{}")
            .drop_field("e")
            .into_program()
            .unwrap();

        assert_eq!(
            compiled.data,
            program(&[
                &vstr("n"),
                &[14],
                &vstr("a"),
                &[1, 0, 8, 2],
                &[25],
                &vstr("b"),
                &[1, 1, 0, 8, 14],
                &[14],
                &vstr("c"),
                &[2, 0, 8, 2, 0, 8, 4],
                &[22],
                &vstr("d"),
                &[1, 0, 0, 2],
                &vstr("{}"),
                &[21],
                &vstr("e"),
                &[11],
            ])
        );
    }

    #[test]
    fn set_object_serializes_with_serde() {
        #[derive(Serialize)]
        struct Point {
            x: i32,
        }

        let compiled = Query::new("n")
            .set_object("p", &Point { x: 1 })
            .unwrap()
            .into_program()
            .unwrap();
        let json = vstr(r#"{"x":1}"#);
        assert!(compiled.data.windows(json.len()).any(|w| w == json.as_slice()));
    }

    #[test]
    fn aggregations_and_facets() {
        let compiled = Query::new("n")
            .aggregate_max("price")
            .aggregate_facet(Facet::new(&["a", "b"]).sort("a", true).limit(5).offset(1))
            .select(&["a"])
            .req_total()
            .into_program()
            .unwrap();

        assert_eq!(
            compiled.data,
            program(&[
                &vstr("n"),
                &[8, 4, 1],
                &vstr("price"),
                &[8, 2, 2],
                &vstr("a"),
                &vstr("b"),
                &[17],
                &vstr("a"),
                &[1, 15, 5, 16, 1],
                &[9],
                &vstr("a"),
                &[6, 2, 11],
            ])
        );
    }

    #[test]
    fn sort_with_forced_values() {
        let compiled = Query::new("n")
            .sort_by_values("id", true, [3, 1])
            .into_program()
            .unwrap();
        assert_eq!(
            compiled.data,
            program(&[&vstr("n"), &[2], &vstr("id"), &[1, 2, 8, 6, 8, 2, 11]])
        );
    }
}
