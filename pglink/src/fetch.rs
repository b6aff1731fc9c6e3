//! Result materialization: bounded, single-pass row streams.
use crate::common::unit_error;

unit_error! {
    /// An error when the executed statement was an empty query string.
    pub struct EmptyQueryError("statement is an empty query");
}

#[cfg(feature = "tokio")]
pub use stream::RowStream;

#[cfg(feature = "tokio")]
mod stream {
    use futures_core::Stream;
    use std::{
        pin::Pin,
        sync::Arc,
        task::{Context, Poll, ready},
    };
    use tokio::io::{AsyncRead, AsyncWrite};

    use super::EmptyQueryError;
    use crate::{
        Error, Result,
        connection::{Connection, SessionState},
        postgres::{BackendMessage, ProtocolError, backend, frontend},
        row::{Row, RowDescription},
        statement::PortalName,
    };

    /// A finite, single-pass sequence of [`Row`]s from one `Execute` step.
    ///
    /// The stream must be polled to completion (or dropped, which abandons
    /// the rest of the response sequence) before the connection accepts the
    /// next statement. Column values decode lazily on access, see [`Row`].
    ///
    /// When the server suspends the portal at the row limit, the stream ends
    /// after exactly that many rows and closes the portal explicitly.
    #[derive(Debug)]
    #[must_use = "streams do nothing unless polled"]
    pub struct RowStream<'c, S> {
        conn: &'c mut Connection<S>,
        portal: PortalName,
        desc: Option<Arc<RowDescription>>,
        pending: Option<BackendMessage>,
        phase: Phase,
        suspended: bool,
        yielded: u64,
        rows_affected: Option<u64>,
        /// Error held back until the ReadyForQuery barrier is restored.
        err: Option<Error>,
    }

    #[derive(Debug, PartialEq)]
    enum Phase {
        Rows,
        AwaitReady,
        ClosePortal,
        AwaitCloseComplete,
        AwaitCloseReady,
        Drain,
        Finished,
    }

    impl<'c, S> RowStream<'c, S> {
        pub(crate) fn new(
            conn: &'c mut Connection<S>,
            portal: PortalName,
            desc: Option<Arc<RowDescription>>,
            pending: BackendMessage,
        ) -> Self {
            Self {
                conn,
                portal,
                desc,
                pending: Some(pending),
                phase: Phase::Rows,
                suspended: false,
                yielded: 0,
                rows_affected: None,
                err: None,
            }
        }

        /// The descriptor of this execution, [`None`] when it returns no rows.
        pub fn description(&self) -> Option<&Arc<RowDescription>> {
            self.desc.as_ref()
        }

        /// Rows yielded so far.
        pub fn row_count(&self) -> u64 {
            self.yielded
        }

        /// Affected row count from `CommandComplete`.
        ///
        /// [`None`] until the stream completed, and after a suspension
        /// (a suspended portal never reports a command tag).
        pub fn rows_affected(&self) -> Option<u64> {
            self.rows_affected
        }

        /// Returns `true` if the server suspended the portal at the row
        /// limit, leaving rows behind.
        pub fn is_suspended(&self) -> bool {
            self.suspended
        }

        /// Returns `true` once the response sequence is fully consumed.
        pub fn is_finished(&self) -> bool {
            self.phase == Phase::Finished
        }

        /// A server error arrived mid-cycle: hold it back until the
        /// ReadyForQuery barrier restores the connection, so the caller gets
        /// the failure only once the connection is reusable.
        ///
        /// Returns the terminal output for fatal errors, [`None`] to enter
        /// the drain phase.
        fn begin_drain(&mut self, err: Error) -> Option<Poll<Option<Result<Row>>>> {
            if err.is_fatal() {
                self.phase = Phase::Finished;
                return Some(Poll::Ready(Some(Err(err))));
            }
            self.conn.ready_request();
            self.err = Some(err);
            self.phase = Phase::Drain;
            None
        }
    }

    impl<S> RowStream<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        /// Drive the stream to completion, collecting every row.
        pub async fn collect(mut self) -> Result<Vec<Row>> {
            let mut rows = Vec::new();
            while let Some(row) =
                std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await
            {
                rows.push(row?);
            }
            Ok(rows)
        }

        /// Drive the stream to completion, dropping rows, returning the
        /// affected row count.
        pub async fn finish(mut self) -> Result<u64> {
            while let Some(row) =
                std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await
            {
                row?;
            }
            Ok(self.rows_affected.unwrap_or_default())
        }

        /// Receive the next row, [`None`] when the sequence is complete.
        pub async fn try_next(&mut self) -> Result<Option<Row>> {
            match std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
                Some(row) => row.map(Some),
                None => Ok(None),
            }
        }
    }

    impl<S> Stream for RowStream<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        type Item = Result<Row>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let me = self.get_mut();

            loop {
                match me.phase {
                    Phase::Rows => {
                        let msg = match me.pending.take() {
                            Some(msg) => msg,
                            None => match ready!(me.conn.poll_recv::<BackendMessage>(cx)) {
                                Ok(msg) => msg,
                                Err(err) => match me.begin_drain(err) {
                                    Some(out) => return out,
                                    None => continue,
                                },
                            },
                        };

                        use BackendMessage::*;
                        match msg {
                            DataRow(dr) => {
                                let Some(desc) = &me.desc else {
                                    let err = me.conn.fail_protocol(ProtocolError::unexpected_phase(
                                        backend::DataRow::MSGTYPE,
                                        "execute without row description",
                                    ));
                                    me.phase = Phase::Finished;
                                    return Poll::Ready(Some(Err(err)));
                                };
                                match Row::new(desc.clone(), dr) {
                                    Ok(row) => {
                                        me.yielded += 1;
                                        return Poll::Ready(Some(Ok(row)));
                                    },
                                    Err(err) => {
                                        let err = me.conn.fail_protocol(err);
                                        me.phase = Phase::Finished;
                                        return Poll::Ready(Some(Err(err)));
                                    },
                                }
                            },

                            // `Execute` phase terminations:
                            CommandComplete(cmd) => {
                                me.rows_affected = Some(cmd.rows_affected());
                                me.phase = Phase::AwaitReady;
                            },
                            PortalSuspended(_) => {
                                // row limit reached with rows remaining
                                me.suspended = true;
                                me.phase = Phase::AwaitReady;
                            },
                            EmptyQueryResponse(_) => {
                                me.err = Some(EmptyQueryError.into());
                                me.phase = Phase::AwaitReady;
                            },
                            msg => {
                                let err = me.conn.fail_protocol(msg.unexpected("fetching rows"));
                                me.phase = Phase::Finished;
                                return Poll::Ready(Some(Err(err)));
                            },
                        }
                    },
                    Phase::AwaitReady => {
                        match ready!(me.conn.poll_recv::<backend::ReadyForQuery>(cx)) {
                            Ok(_) => { },
                            Err(err) => match me.begin_drain(err) {
                                Some(out) => return out,
                                None => continue,
                            },
                        }
                        match me.suspended {
                            true => me.phase = Phase::ClosePortal,
                            false => {
                                me.phase = Phase::Finished;
                                if let Some(err) = me.err.take() {
                                    return Poll::Ready(Some(Err(err)));
                                }
                                return Poll::Ready(None);
                            },
                        }
                    },
                    Phase::ClosePortal => {
                        // partial result: the portal was left open, close it
                        // before handing the connection back
                        me.conn.state = SessionState::Extended;
                        me.conn.stream.send(frontend::Close {
                            variant: b'P',
                            name: me.portal.as_str(),
                        });
                        me.conn.stream.send(frontend::Sync);
                        me.phase = Phase::AwaitCloseComplete;
                    },
                    Phase::AwaitCloseComplete => {
                        match ready!(me.conn.poll_recv::<backend::CloseComplete>(cx)) {
                            Ok(_) => me.phase = Phase::AwaitCloseReady,
                            Err(err) => match me.begin_drain(err) {
                                Some(out) => return out,
                                None => continue,
                            },
                        }
                    },
                    Phase::AwaitCloseReady => {
                        match ready!(me.conn.poll_recv::<backend::ReadyForQuery>(cx)) {
                            Ok(_) => {
                                me.phase = Phase::Finished;
                                return Poll::Ready(None);
                            },
                            Err(err) => match me.begin_drain(err) {
                                Some(out) => return out,
                                None => continue,
                            },
                        }
                    },
                    Phase::Drain => {
                        if let Err(err) = ready!(me.conn.poll_ready_for_query(cx)) {
                            me.phase = Phase::Finished;
                            return Poll::Ready(Some(Err(err)));
                        }
                        me.phase = Phase::Finished;
                        if let Some(err) = me.err.take() {
                            return Poll::Ready(Some(Err(err)));
                        }
                        return Poll::Ready(None);
                    },
                    Phase::Finished => return Poll::Ready(None),
                }
            }
        }
    }

    impl<S> Drop for RowStream<'_, S> {
        fn drop(&mut self) {
            if self.phase != Phase::Finished {
                // abandoned mid-sequence: discard the rest of the cycle
                self.conn.ready_request();
            }
        }
    }
}
