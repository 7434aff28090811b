pub mod buffer;
pub mod cjson;
pub mod client;
pub mod config;
pub mod error;
pub mod item;
pub mod namespace;
pub mod pool;
pub mod protocol;
pub mod query;
pub mod results;
pub mod schema;
pub mod tx;

pub use buffer::VarBuffer;
pub use cjson::{CjsonValue, ObjectDescriptor};
pub use client::{Client, NamespaceHandle, Results, Transaction};
pub use config::ClientConfig;
pub use error::{CodecError, Error, ProtocolError, QueryError};
pub use item::{ModifyMode, ToItem};
pub use namespace::{IndexDefinition, NamespaceDefinition, NamespaceDescriptor, StorageOptions};
pub use pool::{ConnectionPool, PooledConnection};
pub use query::{AggregationType, Condition, Facet, JoinType, Query, Value};
pub use results::{ItemRecord, ResultStream};
pub use schema::PayloadType;
pub use tx::{TransactionContext, TxState};
