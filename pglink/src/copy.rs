//! COPY streaming: the bulk data transfer sub-mode of a connection.
//!
//! A COPY session starts when an executed statement answers with a copy
//! response instead of rows. While it is open the connection accepts no
//! other statement; ending it (CopyDone, CopyFail, or an error) returns the
//! connection to idle at the next ReadyForQuery.
use crate::common::unit_error;

unit_error! {
    /// An error when a copy operation is requested for a statement that
    /// does not trigger COPY.
    ///
    /// Raised locally, without contacting the server.
    pub struct CopyNotSupported("statement does not begin with COPY");
}

/// Validate that the statement text triggers a COPY sub-mode.
pub(crate) fn ensure_copy_statement(sql: &str) -> Result<(), CopyNotSupported> {
    let word = sql.split_whitespace().next().unwrap_or("");
    match word.eq_ignore_ascii_case("copy") {
        true => Ok(()),
        false => Err(CopyNotSupported),
    }
}

#[cfg(feature = "tokio")]
pub use engine::{CopyBoth, CopyIn, CopyOut};

#[cfg(feature = "tokio")]
mod engine {
    use bytes::Bytes;
    use futures_core::Stream;
    use std::{
        pin::Pin,
        task::{Context, Poll, ready},
    };
    use tokio::io::{AsyncRead, AsyncWrite};

    use crate::{
        Error, Result,
        connection::{Connection, SessionState},
        postgres::{BackendMessage, PgFormat, backend, frontend},
    };

    const ABORT_MESSAGE: &str = "copy aborted by client";

    /// Client-to-server bulk load (`COPY … FROM STDIN`).
    ///
    /// The caller supplies row byte-chunks via [`send`][CopyIn::send]; on
    /// source exhaustion [`finish`][CopyIn::finish] commits the load, while
    /// [`fail`][CopyIn::fail] aborts it server-side with zero rows
    /// committed. Dropping the session mid-transfer aborts it the same way.
    #[derive(Debug)]
    pub struct CopyIn<'c, S> {
        conn: &'c mut Connection<S>,
        format: PgFormat,
        column_len: u16,
        done: bool,
    }

    impl<'c, S> CopyIn<'c, S> {
        pub(crate) fn new(conn: &'c mut Connection<S>, resp: backend::CopyInResponse) -> Self {
            Self {
                conn,
                format: resp.format,
                column_len: resp.column_len,
                done: false,
            }
        }

        /// The per-row byte format declared by the server.
        pub fn format(&self) -> PgFormat {
            self.format
        }

        /// The number of columns in the data to be copied.
        pub fn column_len(&self) -> u16 {
            self.column_len
        }
    }

    impl<S> CopyIn<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        /// Frame one chunk of copy data and push it to the transport.
        ///
        /// Chunks need not align with row boundaries. May block on transport
        /// backpressure.
        pub async fn send(&mut self, chunk: &[u8]) -> Result<()> {
            self.conn.stream.send(frontend::CopyData { data: chunk });
            match std::future::poll_fn(|cx| self.conn.stream.poll_flush(cx)).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.done = true;
                    self.conn.state = SessionState::Failed;
                    Err(err.into())
                },
            }
        }

        /// Declare the source exhausted and wait for the server to commit
        /// the load. Returns the number of rows copied.
        pub async fn finish(mut self) -> Result<u64> {
            self.done = true;
            self.conn.stream.send(frontend::CopyDone);

            let mut rows = 0;
            loop {
                match self.conn.recv::<BackendMessage>().await {
                    Ok(BackendMessage::CommandComplete(cmd)) => rows = cmd.rows_affected(),
                    Ok(BackendMessage::ReadyForQuery(_)) => break,
                    Ok(msg) => {
                        return Err(self.conn.fail_protocol(msg.unexpected("copy-in completion")));
                    },
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        self.conn.ready_request();
                        self.conn.synchronize().await?;
                        return Err(err);
                    },
                }
            }
            Ok(rows)
        }

        /// Abort the transfer with a diagnostic message.
        ///
        /// This is the only sanctioned way to abort a copy-in: the server
        /// surfaces `message` as a SQL-level error instead of committing
        /// partial data, and that error is returned here.
        pub async fn fail(mut self, message: &str) -> Result<()> {
            self.done = true;
            self.conn.stream.send(frontend::CopyFail { message });

            loop {
                match self.conn.recv::<BackendMessage>().await {
                    // the server elected to ignore the failed transfer
                    Ok(BackendMessage::ReadyForQuery(_)) => return Ok(()),
                    Ok(msg) => {
                        return Err(self.conn.fail_protocol(msg.unexpected("copy-in abort")));
                    },
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        // the expected outcome: the load failed server-side
                        self.conn.ready_request();
                        self.conn.synchronize().await?;
                        return Err(err);
                    },
                }
            }
        }
    }

    impl<S> Drop for CopyIn<'_, S> {
        fn drop(&mut self) {
            if !self.done {
                self.conn.stream.send(frontend::CopyFail { message: ABORT_MESSAGE });
                self.conn.ready_request();
            }
        }
    }

    /// Server-to-client bulk unload (`COPY … TO STDOUT`).
    ///
    /// A lazy, finite, non-restartable stream of raw row byte-chunks.
    /// Dropping it mid-stream discards the rest of the transfer.
    #[derive(Debug)]
    #[must_use = "streams do nothing unless polled"]
    pub struct CopyOut<'c, S> {
        conn: &'c mut Connection<S>,
        format: PgFormat,
        column_len: u16,
        phase: Phase,
        rows_affected: Option<u64>,
        err: Option<Error>,
    }

    #[derive(Debug, PartialEq)]
    enum Phase {
        Data,
        Tail,
        Drain,
        Finished,
    }

    impl<'c, S> CopyOut<'c, S> {
        pub(crate) fn new(conn: &'c mut Connection<S>, resp: backend::CopyOutResponse) -> Self {
            Self {
                conn,
                format: resp.format,
                column_len: resp.column_len,
                phase: Phase::Data,
                rows_affected: None,
                err: None,
            }
        }

        /// The per-row byte format declared by the server.
        pub fn format(&self) -> PgFormat {
            self.format
        }

        /// The number of columns in the data being copied.
        pub fn column_len(&self) -> u16 {
            self.column_len
        }

        /// Row count reported by the server once the transfer completed.
        pub fn rows_affected(&self) -> Option<u64> {
            self.rows_affected
        }

        fn begin_drain(&mut self, err: Error) -> Option<Poll<Option<Result<Bytes>>>> {
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

    impl<S> CopyOut<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        /// Receive the next data chunk, [`None`] when the transfer is done.
        pub async fn try_next(&mut self) -> Result<Option<Bytes>> {
            match std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
                Some(chunk) => chunk.map(Some),
                None => Ok(None),
            }
        }

        /// Drive the transfer to completion, collecting every chunk.
        pub async fn collect(mut self) -> Result<Vec<Bytes>> {
            let mut chunks = Vec::new();
            while let Some(chunk) =
                std::future::poll_fn(|cx| Pin::new(&mut self).poll_next(cx)).await
            {
                chunks.push(chunk?);
            }
            Ok(chunks)
        }
    }

    impl<S> Stream for CopyOut<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        type Item = Result<Bytes>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let me = self.get_mut();

            loop {
                match me.phase {
                    Phase::Data | Phase::Tail => {
                        let msg = match ready!(me.conn.poll_recv::<BackendMessage>(cx)) {
                            Ok(msg) => msg,
                            Err(err) => match me.begin_drain(err) {
                                Some(out) => return out,
                                None => continue,
                            },
                        };

                        use BackendMessage::*;
                        match (std::mem::replace(&mut me.phase, Phase::Data), msg) {
                            (Phase::Data, CopyData(data)) => {
                                return Poll::Ready(Some(Ok(data.data)));
                            },
                            (Phase::Data, CopyDone(_)) => me.phase = Phase::Tail,
                            (Phase::Tail, CommandComplete(cmd)) => {
                                me.rows_affected = Some(cmd.rows_affected());
                                me.phase = Phase::Tail;
                            },
                            (Phase::Tail, ReadyForQuery(_)) => {
                                me.phase = Phase::Finished;
                                return Poll::Ready(None);
                            },
                            (_, msg) => {
                                let err = me.conn.fail_protocol(msg.unexpected("copy-out"));
                                me.phase = Phase::Finished;
                                return Poll::Ready(Some(Err(err)));
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

    impl<S> Drop for CopyOut<'_, S> {
        fn drop(&mut self) {
            if self.phase != Phase::Finished {
                // abandoned mid-transfer: discard the rest of the cycle
                self.conn.ready_request();
            }
        }
    }

    /// Bidirectional copy (`START_REPLICATION` style sessions).
    ///
    /// Carries both halves of the transfer on one session: frame outgoing
    /// chunks with [`send`][CopyBoth::send], receive incoming chunks with
    /// [`try_next`][CopyBoth::try_next].
    #[derive(Debug)]
    pub struct CopyBoth<'c, S> {
        conn: &'c mut Connection<S>,
        format: PgFormat,
        server_done: bool,
        done: bool,
    }

    impl<'c, S> CopyBoth<'c, S> {
        pub(crate) fn new(conn: &'c mut Connection<S>, resp: backend::CopyBothResponse) -> Self {
            Self {
                conn,
                format: resp.format,
                server_done: false,
                done: false,
            }
        }

        /// The per-row byte format declared by the server.
        pub fn format(&self) -> PgFormat {
            self.format
        }
    }

    impl<S> CopyBoth<'_, S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        /// Frame one chunk of copy data and push it to the transport.
        pub async fn send(&mut self, chunk: &[u8]) -> Result<()> {
            self.conn.stream.send(frontend::CopyData { data: chunk });
            match std::future::poll_fn(|cx| self.conn.stream.poll_flush(cx)).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    self.done = true;
                    self.conn.state = SessionState::Failed;
                    Err(err.into())
                },
            }
        }

        /// Receive the next chunk from the server, [`None`] once the server
        /// finished its half of the transfer.
        pub async fn try_next(&mut self) -> Result<Option<Bytes>> {
            if self.server_done {
                return Ok(None);
            }
            loop {
                match self.conn.recv::<BackendMessage>().await {
                    Ok(BackendMessage::CopyData(data)) => return Ok(Some(data.data)),
                    Ok(BackendMessage::CopyDone(_)) => {
                        self.server_done = true;
                        return Ok(None);
                    },
                    Ok(msg) => {
                        self.done = true;
                        return Err(self.conn.fail_protocol(msg.unexpected("copy-both")));
                    },
                    Err(err) if err.is_fatal() => {
                        self.done = true;
                        return Err(err);
                    },
                    Err(err) => {
                        self.done = true;
                        self.conn.ready_request();
                        self.conn.synchronize().await?;
                        return Err(err);
                    },
                }
            }
        }

        /// Finish the client half and wait for the cycle to complete.
        pub async fn finish(mut self) -> Result<u64> {
            self.done = true;
            self.conn.stream.send(frontend::CopyDone);

            let mut rows = 0;
            loop {
                match self.conn.recv::<BackendMessage>().await {
                    // remaining chunks of the server half are discarded
                    Ok(BackendMessage::CopyData(_)) => { },
                    Ok(BackendMessage::CopyDone(_)) => self.server_done = true,
                    Ok(BackendMessage::CommandComplete(cmd)) => rows = cmd.rows_affected(),
                    Ok(BackendMessage::ReadyForQuery(_)) => break,
                    Ok(msg) => {
                        return Err(self.conn.fail_protocol(msg.unexpected("copy-both completion")));
                    },
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => {
                        self.conn.ready_request();
                        self.conn.synchronize().await?;
                        return Err(err);
                    },
                }
            }
            Ok(rows)
        }
    }

    impl<S> Drop for CopyBoth<'_, S> {
        fn drop(&mut self) {
            if !self.done {
                self.conn.stream.send(frontend::CopyFail { message: ABORT_MESSAGE });
                self.conn.ready_request();
            }
        }
    }
}
