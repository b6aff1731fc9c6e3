//! Postgres wire protocol client core.
//!
//! Opens a byte-stream connection to a postgres server, negotiates the
//! session, encodes statements and bound parameters into protocol messages,
//! and decodes server responses back into structured results.
//!
//! # Examples
//!
//! Extended query protocol with a row limit:
//!
//! ```no_run
//! use pglink::Connection;
//!
//! # async fn app() -> pglink::Result<()> {
//! let mut conn = Connection::connect_env().await?;
//!
//! let mut stmt = conn.prepare("SELECT x FROM generate_series(1, 100) x").await?;
//! stmt.limit_mut().set_max_rows(25)?;
//!
//! let portal = conn.bind(&stmt, &[]).await?;
//! let rows = conn.execute(&portal, 0).await?.rows().expect("not a COPY");
//! let rows = rows.collect().await?;
//!
//! assert_eq!(rows.len(), 25);
//! # Ok(())
//! # }
//! ```
//!
//! Bulk load through the COPY sub-protocol:
//!
//! ```no_run
//! # async fn app(mut conn: pglink::Connection) -> pglink::Result<()> {
//! let mut copy = conn.copy_in("COPY foo FROM STDIN").await?;
//! copy.send(b"1\tbar\n").await?;
//! copy.send(b"2\tbaz\n").await?;
//! let rows = copy.finish().await?;
//! assert_eq!(rows, 2);
//! # Ok(())
//! # }
//! ```

pub mod common;
mod ext;

// Protocol
pub mod postgres;

// Encoding
pub mod types;

// Component
pub mod row;
pub mod statement;

// Transport
pub mod net;

// Operation
pub mod fetch;
pub mod copy;
#[cfg(feature = "tokio")]
pub mod executor;
#[cfg(feature = "tokio")]
pub mod transaction;

// Connection
pub mod connection;

mod error;

pub use connection::{Config, SessionState, TransactionStatus};
pub use error::{Error, ErrorKind, Result};
pub use row::Row;
pub use statement::{Portal, RowLimit, Statement};
pub use types::Value;

#[cfg(feature = "tokio")]
pub use connection::{CancelToken, Connection};
#[cfg(feature = "tokio")]
pub use copy::{CopyIn, CopyOut};
#[cfg(feature = "tokio")]
pub use executor::Execution;
#[cfg(feature = "tokio")]
pub use fetch::RowStream;
#[cfg(feature = "tokio")]
pub use transaction::Transaction;
