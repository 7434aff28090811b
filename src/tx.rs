//! Server-side transactions pinned to one connection.
//!
//! A [`TransactionContext`] moves through `created → started` and ends either
//! committed or rolled back. Mutations start the transaction on first use.
//! Once finalized every operation fails with [`Error::TransactionFinalized`].
use std::sync::Mutex;

use log::{debug, warn};

use crate::{
    error::Error,
    item::{FORMAT_CJSON, ModifyMode, SchemaState, ToItem, pack_precepts},
    protocol::{Arg, Command, RpcCall, lock},
    query::Query,
    schema::PayloadType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Created,
    Started(i64),
    Committed,
    RolledBack,
}

impl TxState {
    pub fn is_finalized(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

struct TxInner<C> {
    conn: Option<C>,
    state: TxState,
    schema: SchemaState,
    precepts: Vec<String>,
    changed: usize,
}

pub struct TransactionContext<C: RpcCall> {
    inner: Mutex<TxInner<C>>,
}

impl<C: RpcCall> TransactionContext<C> {
    pub fn new(conn: C, namespace: &str) -> Self {
        Self::with_schema(conn, SchemaState::new(namespace, None))
    }

    pub(crate) fn with_schema(conn: C, schema: SchemaState) -> Self {
        Self {
            inner: Mutex::new(TxInner {
                conn: Some(conn),
                state: TxState::Created,
                schema,
                precepts: Vec::new(),
                changed: 0,
            }),
        }
    }

    /// Precepts applied by the server to every item of this transaction.
    pub fn with_precepts(self, precepts: Vec<String>) -> Self {
        {
            let mut inner = lock(&self.inner);
            inner.precepts = precepts;
        }
        self
    }

    pub fn state(&self) -> TxState {
        lock(&self.inner).state
    }

    pub fn namespace(&self) -> String {
        lock(&self.inner).schema.namespace().to_string()
    }

    pub fn payload_type(&self) -> Option<PayloadType> {
        lock(&self.inner).schema.payload_type().cloned()
    }

    /// Opens the transaction on the server. Does nothing once started.
    pub fn start(&self) -> Result<i64, Error> {
        lock(&self.inner).start()
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
        let mut inner = lock(&self.inner);
        let id = inner.start()?;

        let TxInner {
            conn,
            schema,
            precepts,
            ..
        } = &mut *inner;
        let conn = conn.as_ref().ok_or(Error::ConnectionClosed)?;
        let precepts = pack_precepts(precepts);
        schema.write(conn, &value, |data, state_token| {
            conn.call(
                Command::AddTxItem,
                vec![
                    Arg::Int(FORMAT_CJSON),
                    Arg::Bytes(data),
                    Arg::Int(mode.code()),
                    Arg::Bytes(precepts.clone()),
                    Arg::Int(state_token),
                    Arg::Int64(id),
                ],
            )
        })?;
        inner.changed += 1;
        Ok(())
    }

    /// Queues an update query; `query` must carry `set`/`drop_field` ops.
    pub fn update_query(&self, query: Query) -> Result<(), Error> {
        self.run_query(Command::UpdateQueryTx, query)
    }

    pub fn delete_query(&self, query: Query) -> Result<(), Error> {
        self.run_query(Command::DeleteQueryTx, query)
    }

    fn run_query(&self, command: Command, query: Query) -> Result<(), Error> {
        let program = query.into_program()?;
        let mut inner = lock(&self.inner);
        let id = inner.start()?;
        inner
            .conn()?
            .call(command, vec![Arg::Bytes(program.data), Arg::Int64(id)])?;
        inner.changed += 1;
        Ok(())
    }

    /// Commits and returns how many mutations were applied. The context is
    /// finalized whether or not the server accepts the commit.
    pub fn commit(&self) -> Result<usize, Error> {
        let mut inner = lock(&self.inner);
        let id = match inner.state {
            TxState::Created => {
                inner.finish(TxState::Committed);
                return Ok(0);
            }
            TxState::Started(id) => id,
            _ => return Err(Error::TransactionFinalized),
        };

        let result = inner.conn().and_then(|conn| conn.call(Command::CommitTx, vec![Arg::Int64(id)]));
        inner.finish(TxState::Committed);
        result?;
        debug!("committed transaction {id}: {} changes", inner.changed);
        Ok(inner.changed)
    }

    pub fn rollback(&self) -> Result<(), Error> {
        lock(&self.inner).rollback()
    }
}

impl<C: RpcCall> TxInner<C> {
    fn conn(&self) -> Result<&C, Error> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    fn start(&mut self) -> Result<i64, Error> {
        match self.state {
            TxState::Started(id) => Ok(id),
            TxState::Created => {
                let response = self.conn()?.call(
                    Command::StartTransaction,
                    vec![Arg::from(self.schema.namespace())],
                )?;
                let id = response.int_arg(0)?;
                debug!("started transaction {id} on {}", self.schema.namespace());
                self.state = TxState::Started(id);
                Ok(id)
            }
            _ => Err(Error::TransactionFinalized),
        }
    }

    fn rollback(&mut self) -> Result<(), Error> {
        let id = match self.state {
            TxState::Created => {
                self.finish(TxState::RolledBack);
                return Ok(());
            }
            TxState::Started(id) => id,
            _ => return Err(Error::TransactionFinalized),
        };

        let result = self
            .conn()
            .and_then(|conn| conn.call(Command::RollbackTx, vec![Arg::Int64(id)]));
        self.finish(TxState::RolledBack);
        result?;
        debug!("rolled back transaction {id}");
        Ok(())
    }

    /// Enters a terminal state and gives the connection back.
    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.conn = None;
    }
}

impl<C: RpcCall> Drop for TransactionContext<C> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let TxState::Started(id) = inner.state {
            warn!("transaction {id} dropped while open, rolling back");
            if let Err(err) = inner.rollback() {
                warn!("rollback of transaction {id} failed: {err}");
            }
        }
    }
}
