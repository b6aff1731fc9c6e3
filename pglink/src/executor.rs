//! Query executor: the prepare/bind/execute facade over a [`Connection`].
//!
//! Every operation validates the connection state and its arguments before
//! the first wire byte, so an invalid call never leaves the connection in a
//! partially-advanced protocol state.
use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Arc,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    Error, Result,
    connection::{CachedStatement, Connection, SequenceError, SessionState},
    copy::{self, CopyBoth, CopyIn, CopyNotSupported, CopyOut},
    ext::UsizeExt,
    fetch::RowStream,
    postgres::{BackendMessage, Oid, PgFormat, backend, frontend},
    row::{Row, RowDescription},
    statement::{Portal, PortalName, Statement, StatementName},
    types::{self, Value},
};

/// The outcome of an [`execute`][Connection::execute] step: a row sequence,
/// or a COPY session the statement switched the connection into.
#[must_use]
#[derive(Debug)]
pub enum Execution<'c, S> {
    Rows(RowStream<'c, S>),
    CopyIn(CopyIn<'c, S>),
    CopyOut(CopyOut<'c, S>),
    CopyBoth(CopyBoth<'c, S>),
}

impl<'c, S> Execution<'c, S> {
    /// The row sequence, [`None`] when the statement started a COPY session.
    pub fn rows(self) -> Option<RowStream<'c, S>> {
        match self {
            Execution::Rows(rows) => Some(rows),
            _ => None,
        }
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Parse and describe a statement, producing a [`Statement`] handle.
    ///
    /// The handle carries the server-reported parameter type oids and result
    /// column metadata, used by [`bind`][Connection::bind] for validation
    /// and format selection.
    pub async fn prepare(&mut self, sql: &str) -> Result<Statement> {
        self.ensure_ready("prepare").await?;
        let name = StatementName::next();
        let (param_oids, columns) = self.parse_statement(&name, sql).await?;
        Ok(Statement::new(name, param_oids, columns))
    }

    /// Like [`prepare`][Connection::prepare], consulting the connection's
    /// prepared statement cache first.
    pub async fn prepare_cached(&mut self, sql: &str) -> Result<Statement> {
        self.ensure_ready("prepare").await?;

        let hash = {
            let mut hasher = DefaultHasher::new();
            sql.trim().hash(&mut hasher);
            hasher.finish()
        };

        if let Some(cached) = self.stmt_cache.get(&hash) {
            let mut stmt = Statement::new(
                cached.name.clone(),
                cached.param_oids.clone(),
                cached.columns.clone(),
            );
            stmt.sql_hash = Some(hash);
            return Ok(stmt);
        }

        // room for the new entry: retire the least recently used statement
        if self.stmt_cache.len() == self.stmt_cache.cap().get() {
            if let Some((_, evicted)) = self.stmt_cache.pop_lru() {
                self.close_object(b'S', evicted.name.as_str()).await?;
            }
        }

        let name = StatementName::next();
        let (param_oids, columns) = self.parse_statement(&name, sql).await?;
        self.stmt_cache.put(hash, CachedStatement {
            name: name.clone(),
            param_oids: param_oids.clone(),
            columns: columns.clone(),
        });

        let mut stmt = Statement::new(name, param_oids, columns);
        stmt.sql_hash = Some(hash);
        Ok(stmt)
    }

    async fn parse_statement(
        &mut self,
        name: &StatementName,
        sql: &str,
    ) -> Result<(Vec<Oid>, Option<Arc<RowDescription>>)> {
        self.state = SessionState::Extended;
        self.stream.send(frontend::Parse {
            prepare_name: name.as_str(),
            sql,
            // let the server infer every parameter type
            oids_len: 0,
            oids: std::iter::empty(),
        });
        self.stream.send(frontend::Describe { kind: b'S', name: name.as_str() });
        self.stream.send(frontend::Sync);

        if let Err(err) = self.recv::<backend::ParseComplete>().await {
            return Err(self.recover(err).await);
        }
        let params = match self.recv::<backend::ParameterDescription>().await {
            Ok(params) => params,
            Err(err) => return Err(self.recover(err).await),
        };
        let columns = match self.recv::<BackendMessage>().await {
            Ok(BackendMessage::RowDescription(rd)) => {
                let parsed = RowDescription::parse(&rd).map_err(|e| self.fail_protocol(e))?;
                Some(Arc::new(parsed))
            },
            Ok(BackendMessage::NoData(_)) => None,
            Ok(msg) => return Err(self.fail_protocol(msg.unexpected("describe statement"))),
            Err(err) => return Err(self.recover(err).await),
        };
        if let Err(err) = self.recv::<backend::ReadyForQuery>().await {
            return Err(self.recover(err).await);
        }

        Ok((params.to_vec(), columns))
    }

    /// Bind parameter values to a prepared statement, producing a [`Portal`].
    ///
    /// The parameter count is validated and every value is encoded through
    /// the type registry before anything is written to the wire. Result
    /// column formats are chosen per column, binary where the registry
    /// supports it.
    ///
    /// Only one portal may be open at a time; the portal must be consumed by
    /// [`execute`][Connection::execute] or released by
    /// [`close_portal`][Connection::close_portal].
    pub async fn bind(&mut self, stmt: &Statement, params: &[Value]) -> Result<Portal> {
        self.ensure_ready("bind").await?;

        if params.len() != stmt.param_oids().len() {
            return Err(Error::invalid_parameter(format!(
                "statement takes {} parameters, {} bound",
                stmt.param_oids().len(),
                params.len(),
            )));
        }

        let registry = types::global();

        // encode everything first: a codec failure must not leave a
        // half-written cycle behind
        let mut formats = Vec::with_capacity(params.len());
        let mut encoded = Vec::with_capacity(params.len());
        for (value, &oid) in params.iter().zip(stmt.param_oids()) {
            let format = registry.prefer(oid);
            encoded.push(registry.encode_param(value, oid, format)?);
            formats.push(format);
        }

        let result_formats: Vec<PgFormat> = match stmt.columns() {
            Some(desc) => desc
                .columns()
                .iter()
                .map(|column| registry.prefer(column.type_oid()))
                .collect(),
            None => Vec::new(),
        };

        self.state = SessionState::Extended;
        let portal = PortalName::next();
        let params_size_hint = encoded
            .iter()
            .fold(0u32, |acc, e| acc + 4 + e.len().to_u32());

        self.stream.send(frontend::Bind {
            portal_name: portal.as_str(),
            stmt_name: stmt.name().as_str(),
            param_formats_len: formats.len().to_u16(),
            param_formats: formats.iter().copied(),
            params_len: encoded.len().to_u16(),
            params_size_hint,
            params: encoded.into_iter(),
            result_formats_len: result_formats.len().to_u16(),
            result_formats: result_formats.iter().copied(),
        });
        self.stream.send(frontend::Flush);

        if let Err(err) = self.recv::<backend::BindComplete>().await {
            return Err(self.recover_unsynced(err).await);
        }

        let columns = stmt.columns().map(|desc| Arc::new(desc.with_formats(&result_formats)));
        Ok(Portal::new(portal, stmt.name().clone(), columns, *stmt.limit()))
    }

    /// Execute a bound portal.
    ///
    /// `max_rows` caps this execution: zero fetches everything, a positive
    /// value makes the server stop (and suspend the portal) after that many
    /// rows. The effective cap is the smaller of `max_rows` and the
    /// statement's [row limit][crate::statement::RowLimit]. A value beyond
    /// the protocol's 32-bit row-count field is rejected locally.
    pub async fn execute(&mut self, portal: &Portal, max_rows: u64) -> Result<Execution<'_, S>> {
        // reject unrepresentable limits before any message is sent
        let requested = u32::try_from(max_rows)
            .ok()
            .filter(|max| *max <= i32::MAX as u32)
            .ok_or_else(|| {
                Error::invalid_parameter("max_rows exceeds the protocol row-count range")
            })?;

        if self.state != SessionState::Extended {
            return Err(SequenceError { op: "execute", state: self.state.name() }.into());
        }

        // the smaller of the server-applied statement limit and the
        // caller-requested maximum, zero meaning unbounded
        let limit = match (portal.limit.wire_limit(), requested) {
            (0, requested) => requested,
            (stmt_limit, 0) => stmt_limit,
            (stmt_limit, requested) => stmt_limit.min(requested),
        };

        self.stream.send(frontend::Execute {
            portal_name: portal.name().as_str(),
            max_rows: limit,
        });
        self.stream.send(frontend::Sync);

        match self.recv::<BackendMessage>().await {
            Ok(BackendMessage::CopyInResponse(resp)) => {
                self.state = SessionState::Copy;
                Ok(Execution::CopyIn(CopyIn::new(self, resp)))
            },
            Ok(BackendMessage::CopyOutResponse(resp)) => {
                self.state = SessionState::Copy;
                Ok(Execution::CopyOut(CopyOut::new(self, resp)))
            },
            Ok(BackendMessage::CopyBothResponse(resp)) => {
                self.state = SessionState::Copy;
                Ok(Execution::CopyBoth(CopyBoth::new(self, resp)))
            },
            Ok(
                msg @ (BackendMessage::DataRow(_)
                | BackendMessage::CommandComplete(_)
                | BackendMessage::PortalSuspended(_)
                | BackendMessage::EmptyQueryResponse(_)),
            ) => Ok(Execution::Rows(RowStream::new(
                self,
                portal.name().clone(),
                portal.columns().cloned(),
                msg,
            ))),
            Ok(msg) => Err(self.fail_protocol(msg.unexpected("execute"))),
            Err(err) => Err(self.recover(err).await),
        }
    }

    /// Close a prepared statement, releasing its server-side resources.
    pub async fn close_statement(&mut self, stmt: Statement) -> Result<()> {
        self.ensure_ready("close statement").await?;
        if let Some(hash) = stmt.sql_hash {
            self.stmt_cache.pop(&hash);
        }
        self.close_object(b'S', stmt.name().as_str()).await
    }

    /// Close a portal.
    ///
    /// Valid while the portal's cycle is still open (bound but not
    /// executed) and after completion, where it is a server-side no-op.
    pub async fn close_portal(&mut self, portal: Portal) -> Result<()> {
        self.synchronize().await?;
        match self.state() {
            SessionState::Idle | SessionState::Extended => { },
            state => {
                return Err(SequenceError { op: "close portal", state: state.name() }.into());
            },
        }
        self.close_object(b'P', portal.name().as_str()).await
    }

    pub(crate) async fn close_object(&mut self, variant: u8, name: &str) -> Result<()> {
        self.state = SessionState::Extended;
        self.stream.send(frontend::Close { variant, name });
        self.stream.send(frontend::Sync);

        if let Err(err) = self.recv::<backend::CloseComplete>().await {
            return Err(self.recover(err).await);
        }
        match self.recv::<backend::ReadyForQuery>().await {
            Ok(_) => Ok(()),
            Err(err) => Err(self.recover(err).await),
        }
    }

    /// Prepare (through the statement cache), bind, execute unbounded, and
    /// collect every row.
    pub async fn fetch_all(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let stmt = self.prepare_cached(sql).await?;
        let portal = self.bind(&stmt, params).await?;
        let (result, synchronize_after) = {
            let execution = self.execute(&portal, 0).await?;
            match execution {
                Execution::Rows(rows) => (rows.collect().await, false),
                Execution::CopyIn(session) => {
                    let result = match session.fail("COPY is only available through the copy interface").await {
                        Err(err) if err.is_fatal() => Err(err),
                        _ => Err(CopyNotSupported.into()),
                    };
                    (result, false)
                },
                Execution::CopyOut(session) => {
                    drop(session);
                    (Err(CopyNotSupported.into()), true)
                },
                Execution::CopyBoth(session) => {
                    drop(session);
                    (Err(CopyNotSupported.into()), true)
                },
            }
        };
        if synchronize_after {
            self.synchronize().await?;
        }
        result
    }

    /// Start a client-to-server bulk load (`COPY … FROM STDIN`) through the
    /// simple query protocol.
    ///
    /// Statement text that does not trigger COPY is rejected locally,
    /// without contacting the server.
    pub async fn copy_in(&mut self, sql: &str) -> Result<CopyIn<'_, S>> {
        copy::ensure_copy_statement(sql)?;
        self.ensure_ready("copy").await?;
        self.state = SessionState::Simple;
        self.stream.send(frontend::Query { sql });

        match self.recv::<BackendMessage>().await {
            Ok(BackendMessage::CopyInResponse(resp)) => {
                self.state = SessionState::Copy;
                Ok(CopyIn::new(self, resp))
            },
            Ok(BackendMessage::CopyOutResponse(_)) => {
                self.ready_request();
                self.synchronize().await?;
                Err(Error::invalid_parameter("statement is COPY TO, use copy_out"))
            },
            Ok(msg) => Err(self.reject_copy_entry(msg).await),
            Err(err) => Err(self.recover(err).await),
        }
    }

    /// Start a server-to-client bulk unload (`COPY … TO STDOUT`) through the
    /// simple query protocol.
    ///
    /// Statement text that does not trigger COPY is rejected locally,
    /// without contacting the server.
    pub async fn copy_out(&mut self, sql: &str) -> Result<CopyOut<'_, S>> {
        copy::ensure_copy_statement(sql)?;
        self.ensure_ready("copy").await?;
        self.state = SessionState::Simple;
        self.stream.send(frontend::Query { sql });

        match self.recv::<BackendMessage>().await {
            Ok(BackendMessage::CopyOutResponse(resp)) => {
                self.state = SessionState::Copy;
                Ok(CopyOut::new(self, resp))
            },
            Ok(BackendMessage::CopyInResponse(_)) => {
                self.stream.send(frontend::CopyFail {
                    message: "statement is COPY FROM, aborted by client",
                });
                self.ready_request();
                self.synchronize().await?;
                Err(Error::invalid_parameter("statement is COPY FROM, use copy_in"))
            },
            Ok(msg) => Err(self.reject_copy_entry(msg).await),
            Err(err) => Err(self.recover(err).await),
        }
    }

    /// A copy entry point got a non-copy response; abandon the cycle and
    /// reject the statement.
    async fn reject_copy_entry(&mut self, msg: BackendMessage) -> Error {
        if let BackendMessage::ReadyForQuery(_) = &msg {
            // the cycle already completed without entering a copy sub-mode
            return CopyNotSupported.into();
        }
        if let BackendMessage::CopyBothResponse(_) = &msg {
            self.stream.send(frontend::CopyFail {
                message: "bidirectional COPY aborted by client",
            });
        }
        self.ready_request();
        match self.synchronize().await {
            Ok(()) => CopyNotSupported.into(),
            Err(fatal) => fatal,
        }
    }
}
