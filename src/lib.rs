//! `mdz` is a schema-aware CRUD engine that fronts a Redis-style key-value
//! store with a uniform entity model: typed, indexed rows behind opaque ids.
//!
//! What the backend store does not give you, this crate does:
//! - secondary and compound lexicographic indexing over typed properties,
//!   with equality, range and prefix query semantics;
//! - consistent entity mutation: the row and every affected index move
//!   together through a three-phase change set on one backend transaction;
//! - TTL expiry and online background repair of dangling index entries.
//!
//! The wire transport, control surface, schema file loading and client code
//! generation are external collaborators; their interfaces (query types,
//! [`SchemaProvider`], [`Config`]) live here, their implementations do not.

pub mod batch;
mod changeset;
pub mod codec;
pub mod config;
pub mod driver;
pub mod error;
mod index;
pub mod normalize;
pub mod pool;
pub mod query;
mod repair;
pub mod resp;
pub mod schema;
mod table;
pub mod value;

pub use config::Config;
pub use driver::{Driver, DumpStream, Stats};
pub use error::{Error, ErrorKind, Result};
pub use query::{
    Change, ChangeOp, DelQuery, DelResponse, Filter, Filters, GetQuery, GetResponse, Operator,
    Ordering, Paging, PingQuery, PingResponse, PutQuery, PutResponse, Response, UpdateQuery,
    UpdateResponse,
};
pub use repair::RepairHandle;
pub use schema::{
    ColumnSpec, ColumnType, IndexKind, IndexSpec, MemoryProvider, PrimarySpec, Schema,
    SchemaProvider, TableSpec,
};
pub use table::TableStats;
pub use value::{Entity, Key, Timestamp, Value, ID_KEY};
