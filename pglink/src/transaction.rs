//! The [`Transaction`] type.
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Result,
    connection::{Connection, SessionState, TransactionStatus},
    postgres::frontend,
};

/// An RAII implementation of transaction scope.
///
/// To begin a transaction, use [`Connection::begin`].
///
/// To commit, use [`Transaction::commit`]. If not committed, the
/// transaction is rolled back when this structure is dropped.
///
/// # Example
///
/// ```no_run
/// # async fn test(mut conn: pglink::Connection) -> pglink::Result<()> {
/// let mut tx = conn.begin().await?;
///
/// tx.fetch_all("insert into post(name) values($1)", &["foo".into()]).await?;
///
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c, S> {
    conn: &'c mut Connection<S>,
    committed: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Begin a transaction block.
    pub async fn begin(&mut self) -> Result<Transaction<'_, S>> {
        self.simple_query("BEGIN").await?;
        Ok(Transaction { conn: self, committed: false })
    }
}

impl<S> Transaction<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Commit the transaction block.
    pub async fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.conn.simple_query("COMMIT").await?;
        assert_eq!(self.conn.transaction_status(), TransactionStatus::Idle);
        Ok(())
    }

    /// Explicitly roll the transaction block back.
    pub async fn rollback(mut self) -> Result<()> {
        self.committed = true;
        self.conn.simple_query("ROLLBACK").await?;
        Ok(())
    }
}

impl<S> std::ops::Deref for Transaction<'_, S> {
    type Target = Connection<S>;

    fn deref(&self) -> &Self::Target {
        self.conn
    }
}

impl<S> std::ops::DerefMut for Transaction<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
    }
}

impl<S> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if !self.committed {
            self.conn.stream.send(frontend::Query { sql: "ROLLBACK" });
            self.conn.state = SessionState::Simple;
            self.conn.ready_request();
        }
    }
}
