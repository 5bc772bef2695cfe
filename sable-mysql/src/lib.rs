//! Asynchronous MySQL/MariaDB client speaking the text protocol, with a
//! bounded connection pool
//!
//! Queries run through cursors obtained from a [Connection]; connections are
//! either opened directly with [connect] or borrowed from a [Pool] created
//! with [create_pool].
pub mod auth;
pub mod charset;
pub mod connection;
pub mod constants;
pub mod cursor;
pub mod error;
pub mod opts;
pub mod packet;
pub mod pool;
mod stream;
pub mod transaction;
pub mod value;

pub use connection::Connection;
pub use cursor::{
    Cursor, CursorKind, DictCursor, Dicts, Params, ScrollMode, StreamDicts, StreamTuples,
    StreamingDictCursor, StreamingTupleCursor, TupleCursor, Tuples,
};
pub use error::{Error, Result, ServerError};
pub use opts::{ConnectionOptions, TlsOptions};
pub use pool::{Pool, PoolConnection, PoolOptions};
pub use transaction::{Transaction, TransactionKind};
pub use value::{Column, Converters, Date, DateTime, Decimal, Json, Time, Value};

/// Connect to the server with the given options
pub async fn connect(options: ConnectionOptions) -> Result<Connection> {
    Connection::connect(options).await
}

/// Create a connection pool
pub async fn create_pool(
    connection_options: ConnectionOptions,
    pool_options: PoolOptions,
) -> Result<Pool> {
    Pool::connect(connection_options, pool_options).await
}
