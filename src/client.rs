//! The user-facing client: namespaces, queries, metadata and item sessions.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, info};

use crate::{
    config::ClientConfig,
    error::Error,
    item::{FORMAT_CJSON, ModifyMode, SchemaState, ToItem, pack_precepts},
    namespace::{IndexDefinition, NamespaceDefinition, NamespaceDescriptor},
    pool::{ConnectionPool, PooledConnection},
    protocol::{Arg, Command, Response, RpcCall, lock},
    query::Query,
    results::ResultStream,
    schema::PayloadType,
    tx::TransactionContext,
};

pub type Results = ResultStream<PooledConnection>;
pub type Transaction = TransactionContext<PooledConnection>;

#[derive(Clone)]
pub struct Client {
    pool: ConnectionPool,
}

impl Client {
    pub fn connect(config: ClientConfig) -> Result<Self, Error> {
        let pool = ConnectionPool::open(config)?;
        Ok(Self { pool })
    }

    pub fn from_url(url: &str) -> Result<Self, Error> {
        Self::connect(ClientConfig::from_url(url)?)
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Runs `f` on a checked-out connection, which is discarded afterwards
    /// if `f` broke it.
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&PooledConnection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let conn = self.pool.checkout()?;
        let result = f(&conn);
        conn.finish(&result);
        result
    }

    fn exec(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        self.with_connection(|conn| conn.call(command, args))
    }

    pub fn ping(&self) -> Result<(), Error> {
        self.exec(Command::Ping, vec![])?;
        Ok(())
    }

    pub fn open_namespace(&self, definition: &NamespaceDefinition) -> Result<(), Error> {
        let json = serde_json::to_string(definition)?;
        self.exec(Command::OpenNamespace, vec![Arg::from(json)])?;
        info!("opened namespace {}", definition.name);
        Ok(())
    }

    /// Opens the namespace `T` describes, creates its indexes and returns a
    /// session on it.
    pub fn open<T: NamespaceDescriptor>(&self) -> Result<NamespaceHandle, Error> {
        let definition = T::namespace();
        self.open_namespace(&definition)?;
        for index in T::indexes() {
            self.add_index(&definition.name, &index)?;
        }
        Ok(self.namespace(&definition.name))
    }

    pub fn add_index(&self, namespace: &str, index: &IndexDefinition) -> Result<(), Error> {
        self.index_call(Command::AddIndex, namespace, index)
    }

    pub fn update_index(&self, namespace: &str, index: &IndexDefinition) -> Result<(), Error> {
        self.index_call(Command::UpdateIndex, namespace, index)
    }

    fn index_call(
        &self,
        command: Command,
        namespace: &str,
        index: &IndexDefinition,
    ) -> Result<(), Error> {
        let json = serde_json::to_string(index)?;
        self.exec(command, vec![Arg::from(namespace), Arg::from(json)])?;
        debug!("{command:?} {namespace}.{}", index.name);
        Ok(())
    }

    pub fn drop_index(&self, namespace: &str, index: &str) -> Result<(), Error> {
        self.exec(Command::DropIndex, vec![Arg::from(namespace), Arg::from(index)])?;
        Ok(())
    }

    pub fn close_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.exec(Command::CloseNamespace, vec![Arg::from(namespace)])?;
        Ok(())
    }

    pub fn drop_namespace(&self, namespace: &str) -> Result<(), Error> {
        self.exec(Command::DropNamespace, vec![Arg::from(namespace)])?;
        info!("dropped namespace {namespace}");
        Ok(())
    }

    /// Runs `query`. The returned stream holds its connection until it is
    /// exhausted, closed or dropped.
    pub fn select(&self, query: Query) -> Result<Results, Error> {
        let program = query.into_program()?;
        let conn = self.pool.checkout()?;
        ResultStream::select(conn, program, self.fetch_count(), &HashMap::new())
    }

    pub fn select_sql(&self, sql: &str) -> Result<Results, Error> {
        let conn = self.pool.checkout()?;
        ResultStream::select_sql(conn, sql, self.fetch_count())
    }

    /// Runs `query` with items rendered as JSON by the server.
    pub fn select_json(&self, query: Query) -> Result<Results, Error> {
        let program = query.into_program()?;
        let conn = self.pool.checkout()?;
        ResultStream::select_json(conn, program, self.fetch_count())
    }

    pub fn select_sql_json(&self, sql: &str) -> Result<Results, Error> {
        let conn = self.pool.checkout()?;
        ResultStream::select_sql_json(conn, sql, self.fetch_count())
    }

    pub fn delete_query(&self, query: Query) -> Result<(), Error> {
        let program = query.into_program()?;
        self.exec(Command::DeleteQuery, vec![Arg::Bytes(program.data)])?;
        Ok(())
    }

    pub fn update_query(&self, query: Query) -> Result<(), Error> {
        let program = query.into_program()?;
        self.exec(Command::UpdateQuery, vec![Arg::Bytes(program.data)])?;
        Ok(())
    }

    pub fn put_meta(&self, namespace: &str, key: &str, value: &str) -> Result<(), Error> {
        self.exec(
            Command::PutMeta,
            vec![Arg::from(namespace), Arg::from(key), Arg::from(value)],
        )?;
        Ok(())
    }

    pub fn get_meta(&self, namespace: &str, key: &str) -> Result<String, Error> {
        let response = self.exec(Command::GetMeta, vec![Arg::from(namespace), Arg::from(key)])?;
        Ok(String::from_utf8_lossy(response.bytes_arg(0)?).into_owned())
    }

    /// A session for writing items into `namespace`.
    pub fn namespace(&self, namespace: &str) -> NamespaceHandle {
        NamespaceHandle {
            pool: self.pool.clone(),
            fetch_count: self.fetch_count(),
            schema: Arc::new(Mutex::new(SchemaState::new(namespace, None))),
            precepts: Vec::new(),
        }
    }

    pub fn close(&self) {
        self.pool.close();
    }

    fn fetch_count(&self) -> i32 {
        self.pool.config().fetch_count
    }
}

/// Item writes and reads scoped to one namespace.
///
/// The handle keeps the namespace schema it last saw and sends its state
/// token with every write; a stale token makes it reload the schema and
/// retry once. Clones share that schema.
#[derive(Clone)]
pub struct NamespaceHandle {
    pool: ConnectionPool,
    fetch_count: i32,
    schema: Arc<Mutex<SchemaState>>,
    precepts: Vec<String>,
}

impl NamespaceHandle {
    pub fn name(&self) -> String {
        lock(&self.schema).namespace().to_string()
    }

    pub fn payload_type(&self) -> Option<PayloadType> {
        lock(&self.schema).payload_type().cloned()
    }

    /// Precepts such as `id=serial()` evaluated by the server on each write.
    pub fn with_precepts(mut self, precepts: &[&str]) -> Self {
        self.precepts = precepts.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn insert<T: ToItem + ?Sized>(&self, item: &T) -> Result<(), Error> {
        self.modify(item, ModifyMode::Insert)
    }

    pub fn update<T: ToItem + ?Sized>(&self, item: &T) -> Result<(), Error> {
        self.modify(item, ModifyMode::Update)
    }

    pub fn upsert<T: ToItem + ?Sized>(&self, item: &T) -> Result<(), Error> {
        self.modify(item, ModifyMode::Upsert)
    }

    pub fn delete<T: ToItem + ?Sized>(&self, item: &T) -> Result<(), Error> {
        self.modify(item, ModifyMode::Delete)
    }

    pub fn modify<T: ToItem + ?Sized>(&self, item: &T, mode: ModifyMode) -> Result<(), Error> {
        let value = item.to_item();
        let precepts = pack_precepts(&self.precepts);
        let conn = self.pool.checkout()?;
        // work on a copy so concurrent writers do not queue behind this rpc
        let mut schema = lock(&self.schema).clone();
        let before = schema.payload_type().cloned();
        let result = {
            let namespace = schema.namespace().to_string();
            schema.write(&conn, &value, |data, state_token| {
                conn.call(
                    Command::ModifyItem,
                    vec![
                        Arg::from(namespace.as_str()),
                        Arg::Int(FORMAT_CJSON),
                        Arg::Bytes(data),
                        Arg::Int(mode.code()),
                        Arg::Bytes(precepts.clone()),
                        Arg::Int(state_token),
                        Arg::Int(0),
                    ],
                )
            })
        };
        conn.finish(&result);
        if let Some(pt) = schema.payload_type().filter(|pt| Some(*pt) != before.as_ref()) {
            self.adopt(pt);
        }
        result.map(|_| ())
    }

    /// Stores `pt` unless the handle already holds a newer schema.
    fn adopt(&self, pt: &PayloadType) {
        let mut schema = lock(&self.schema);
        if schema.payload_type().is_none_or(|cur| cur.is_superseded_by(pt)) {
            *schema = SchemaState::new(schema.namespace().to_string(), Some(pt.clone()));
        }
    }

    /// Runs `query`, letting the server skip the schema when this handle
    /// already holds the current one.
    pub fn select(&self, query: Query) -> Result<Results, Error> {
        let program = query.into_program()?;
        let (name, known) = {
            let schema = lock(&self.schema);
            (schema.namespace().to_string(), schema.payload_type().cloned())
        };
        let own = program.namespaces.first() == Some(&name);
        let mut seed = HashMap::new();
        if let Some(pt) = known.filter(|_| own) {
            seed.insert(0, pt);
        }

        let conn = self.pool.checkout()?;
        let stream = ResultStream::select(conn, program, self.fetch_count, &seed)?;
        if let Some(pt) = stream.payload_type(0).filter(|_| own) {
            self.adopt(pt);
        }
        Ok(stream)
    }

    /// A transaction on this namespace pinned to its own connection. It is
    /// opened on the server by the first write or an explicit `start`.
    pub fn begin_tx(&self) -> Result<Transaction, Error> {
        let conn = self.pool.checkout()?;
        let schema = lock(&self.schema).clone();
        Ok(TransactionContext::with_schema(conn, schema).with_precepts(self.precepts.clone()))
    }
}
