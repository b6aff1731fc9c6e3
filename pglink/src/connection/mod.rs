//! Postgres connection: exclusive owner of a transport byte-stream and the
//! session state machine.
//!
//! One [`Connection`] is one serialized, half-duplex command stream: after a
//! request is sent the response sequence must be fully consumed (or
//! explicitly abandoned via the discard-until-[`ReadyForQuery`][1] mechanism)
//! before the next request. `&mut` receivers enforce the single-writer
//! discipline at compile time.
//!
//! [1]: crate::postgres::backend::ReadyForQuery
use std::fmt;

mod config;
mod auth;

pub use auth::AuthError;
pub use config::{Config, ParseError};

#[cfg(feature = "tokio")]
use bytes::Bytes;
#[cfg(feature = "tokio")]
use lru::LruCache;
#[cfg(feature = "tokio")]
use std::{
    num::NonZeroUsize,
    sync::Arc,
    task::{Context, Poll, ready},
};
#[cfg(feature = "tokio")]
use tokio::io::{AsyncRead, AsyncWrite};
#[cfg(feature = "tokio")]
use tokio::net::TcpStream;

#[cfg(feature = "tokio")]
use crate::{
    Result,
    common::{ByteStr, trace, warning},
    copy::CopyNotSupported,
    fetch::EmptyQueryError,
    net::PgStream,
    postgres::{
        BackendMessage, BackendProtocol, ProtocolError,
        backend::{self, BackendKeyData},
        frontend,
    },
    row::{Row, RowDescription},
    statement::StatementName,
};

/// Connection lifecycle states.
///
/// ```text
/// Connecting → Authenticating → Idle → {Simple, Extended, Copy} → Idle → …
///                                 └──────────→ Closed | Failed ←┘
/// ```
///
/// `Failed` is terminal: protocol byte boundaries, once lost, cannot be
/// safely rediscovered, so there is no resync path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport opened, startup sent, waiting for the authentication request.
    Connecting,
    /// Authentication exchange in progress.
    Authenticating,
    /// Ready for a new statement.
    Idle,
    /// A simple query cycle is in flight.
    Simple,
    /// An extended query cycle is in flight.
    Extended,
    /// A COPY sub-mode is active.
    Copy,
    /// Gracefully terminated.
    Closed,
    /// Unrecoverable protocol or transport failure; the connection must be
    /// discarded and not reused.
    Failed,
}

impl SessionState {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Idle => "idle",
            Self::Simple => "in a simple query cycle",
            Self::Extended => "in an extended query cycle",
            Self::Copy => "in a copy session",
            Self::Closed => "closed",
            Self::Failed => "failed",
        }
    }
}

/// Transaction status reported by the last `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block, queries rejected until the block ends.
    Failed,
}

impl TransactionStatus {
    fn from_status_byte(byte: u8) -> Option<Self> {
        match byte {
            b'I' => Some(Self::Idle),
            b'T' => Some(Self::InTransaction),
            b'E' => Some(Self::Failed),
            _ => None,
        }
    }
}

/// An operation was attempted in a connection state that cannot accept it.
///
/// Rejected locally, nothing is sent to the server.
pub struct SequenceError {
    pub(crate) op: &'static str,
    pub(crate) state: &'static str,
}

impl std::error::Error for SequenceError { }

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot {} while the connection is {}", self.op, self.state)
    }
}

impl fmt::Debug for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Metadata kept for statements held in the prepared statement cache.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub(crate) struct CachedStatement {
    pub(crate) name: StatementName,
    pub(crate) param_oids: Vec<crate::postgres::Oid>,
    pub(crate) columns: Option<Arc<RowDescription>>,
}

#[cfg(feature = "tokio")]
const STMT_CACHE_CAPACITY: usize = 24;

/// A postgres connection.
///
/// Created by [`connect`][Connection::connect] (TCP) or
/// [`startup`][Connection::startup] (any established byte stream); destroyed
/// by [`close`][Connection::close] or on fatal error.
///
/// At most one statement execution is in flight at any time; the protocol is
/// not multiplexed.
#[cfg(feature = "tokio")]
pub struct Connection<S = TcpStream> {
    pub(crate) stream: PgStream<S>,
    pub(crate) state: SessionState,
    tx_status: TransactionStatus,
    /// Session parameters reported by the server, newest wins.
    params: Vec<(ByteStr, ByteStr)>,
    key_data: Option<BackendKeyData>,
    pub(crate) stmt_cache: LruCache<u64, CachedStatement>,
    config: Config,
    /// When set, incoming messages are discarded until `ReadyForQuery`.
    discarding: bool,
}

#[cfg(feature = "tokio")]
impl Connection<TcpStream> {
    /// Connect and authenticate over TCP using an url config.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with(Config::parse(url)?).await
    }

    /// Connect and authenticate over TCP using environment config.
    ///
    /// See [`Config::from_env`] for the variables read.
    pub async fn connect_env() -> Result<Self> {
        Self::connect_with(Config::from_env()).await
    }

    /// Connect and authenticate over TCP.
    pub async fn connect_with(config: Config) -> Result<Self> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).await?;
        tcp.set_nodelay(true)?;
        Self::startup(tcp, config).await
    }
}

#[cfg(feature = "tokio")]
impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the startup and authentication handshake over an established
    /// byte stream.
    ///
    /// The stream may be plaintext or an already-upgraded encrypted channel;
    /// the connection depends only on read/write/close.
    ///
    /// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
    pub async fn startup(io: S, config: Config) -> Result<Self> {
        let mut conn = Self {
            stream: PgStream::new(io),
            state: SessionState::Connecting,
            tx_status: TransactionStatus::Idle,
            params: Vec::new(),
            key_data: None,
            stmt_cache: LruCache::new(
                NonZeroUsize::new(STMT_CACHE_CAPACITY).expect("nonzero capacity"),
            ),
            config,
            discarding: false,
        };

        conn.stream.send_startup(frontend::Startup {
            user: conn.config.user.as_str(),
            database: Some(conn.config.dbname.as_str()),
            replication: None,
        });

        // The server sends an authentication request message, to which the
        // frontend replies with the matching response. For SASL, multiple
        // exchanges are needed.
        loop {
            let auth = conn.recv::<backend::Authentication>().await?;
            conn.state = SessionState::Authenticating;

            use backend::Authentication::*;
            match auth {
                Ok => break,
                CleartextPassword => {
                    let password = conn.config.pass.clone();
                    conn.stream.send(frontend::PasswordMessage { password: password.as_str() });
                },
                MD5Password { salt } => {
                    let response = auth::md5_password(&conn.config.user, &conn.config.pass, salt);
                    conn.stream.send(frontend::PasswordMessage { password: &response });
                },
                sasl @ SASL { .. } => {
                    if !sasl.offers_mechanism(auth::ScramSha256::MECHANISM) {
                        return Err(AuthError::unsupported("this SASL mechanism").into());
                    }
                    conn.sasl_scram().await?;
                },
                KerberosV5 => return Err(AuthError::unsupported("KerberosV5").into()),
                GSS | GSSContinue { .. } => return Err(AuthError::unsupported("GSSAPI").into()),
                SSPI => return Err(AuthError::unsupported("SSPI").into()),
                SASLContinue { .. } | SASLFinal { .. } => {
                    return Err(ProtocolError::unexpected_phase(
                        backend::Authentication::MSGTYPE,
                        "authentication",
                    )
                    .into());
                },
            }
        }

        // After AuthenticationOk a backend process is being started; the
        // frontend is an interested bystander until ReadyForQuery.
        loop {
            match conn.recv::<BackendMessage>().await? {
                BackendMessage::BackendKeyData(key) => conn.key_data = Some(key),
                BackendMessage::NegotiateProtocolVersion(v) => {
                    warning!("server negotiated protocol minor version {}", v.minor);
                },
                BackendMessage::ReadyForQuery(_) => break,
                msg => return Err(conn.fail_protocol(msg.unexpected("startup"))),
            }
        }

        conn.state = SessionState::Idle;
        trace!("connected to {}:{}", conn.config.host.as_str(), conn.config.port);
        Ok(conn)
    }

    /// Drive one SCRAM-SHA-256 exchange after the server offered SASL.
    async fn sasl_scram(&mut self) -> Result<()> {
        let mut scram = auth::ScramSha256::new(&self.config.user, &self.config.pass);

        let first = scram.client_first();
        self.stream.send(frontend::SaslInitialResponse {
            mechanism: auth::ScramSha256::MECHANISM,
            response: &first,
        });

        let challenge = match self.recv::<backend::Authentication>().await? {
            backend::Authentication::SASLContinue { data } => data,
            _ => {
                return Err(self.fail_protocol(ProtocolError::unexpected_phase(
                    backend::Authentication::MSGTYPE,
                    "sasl exchange",
                )));
            },
        };

        let response = scram.client_final(&challenge)?;
        self.stream.send(frontend::SaslResponse { data: &response });

        match self.recv::<backend::Authentication>().await? {
            backend::Authentication::SASLFinal { data } => scram.verify_server_final(&data)?,
            _ => {
                return Err(self.fail_protocol(ProtocolError::unexpected_phase(
                    backend::Authentication::MSGTYPE,
                    "sasl exchange",
                )));
            },
        }

        // AuthenticationOk follows in the startup loop
        Ok(())
    }

    /// Poll to receive a message.
    ///
    /// Buffered frontend messages are flushed first. Transport-level
    /// messages are handled here and never returned: `NoticeResponse` is
    /// logged, `ParameterStatus` updates the session parameters,
    /// `ErrorResponse` is returned as [`Err`], and `ReadyForQuery` updates
    /// the transaction status before being delivered.
    pub(crate) fn poll_recv<B: BackendProtocol>(&mut self, cx: &mut Context) -> Poll<Result<B>> {
        loop {
            if self.discarding {
                ready!(self.poll_ready_for_query(cx))?;
            }

            let (msgtype, body) = ready!(self.poll_frame(cx))?;

            match msgtype {
                backend::NoticeResponse::MSGTYPE => {
                    let notice = self.decode::<backend::NoticeResponse>(msgtype, body)?;
                    match notice.message() {
                        Some(message) => warning!("{message}"),
                        None => warning!("notice without message"),
                    }
                },
                backend::ParameterStatus::MSGTYPE => {
                    let status = self.decode::<backend::ParameterStatus>(msgtype, body)?;
                    self.set_parameter(status);
                },
                backend::ErrorResponse::MSGTYPE => {
                    let err = self.decode::<backend::ErrorResponse>(msgtype, body)?;
                    return Poll::Ready(Err(err.into()));
                },
                backend::ReadyForQuery::MSGTYPE => {
                    let rfq = self.decode::<backend::ReadyForQuery>(msgtype, body.clone())?;
                    self.observe_ready(rfq.tx_status)?;
                    let msg = self.decode::<B>(msgtype, body)?;
                    return Poll::Ready(Ok(msg));
                },
                _ => {
                    let msg = self.decode::<B>(msgtype, body)?;
                    return Poll::Ready(Ok(msg));
                },
            }
        }
    }

    /// Receive a message. See [`poll_recv`][Self::poll_recv].
    pub(crate) async fn recv<B: BackendProtocol>(&mut self) -> Result<B> {
        std::future::poll_fn(|cx| self.poll_recv(cx)).await
    }

    /// Poll the discard mode: consume everything up to and including the
    /// next `ReadyForQuery`, then return the connection to `Idle`.
    pub(crate) fn poll_ready_for_query(&mut self, cx: &mut Context) -> Poll<Result<()>> {
        while self.discarding {
            let (msgtype, body) = ready!(self.poll_frame(cx))?;
            match msgtype {
                backend::ParameterStatus::MSGTYPE => {
                    let status = self.decode::<backend::ParameterStatus>(msgtype, body)?;
                    self.set_parameter(status);
                },
                backend::ReadyForQuery::MSGTYPE => {
                    let rfq = self.decode::<backend::ReadyForQuery>(msgtype, body)?;
                    self.discarding = false;
                    self.observe_ready(rfq.tx_status)?;
                },
                // the abandoned cycle's responses, errors included
                _ => { },
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Drain an abandoned response sequence if one is pending.
    pub(crate) async fn synchronize(&mut self) -> Result<()> {
        std::future::poll_fn(|cx| self.poll_ready_for_query(cx)).await
    }

    fn poll_frame(&mut self, cx: &mut Context) -> Poll<Result<(u8, Bytes)>> {
        if let Err(err) = ready!(self.stream.poll_flush(cx)) {
            self.state = SessionState::Failed;
            return Poll::Ready(Err(err.into()));
        }
        match ready!(self.stream.poll_frame(cx)) {
            Ok(frame) => Poll::Ready(Ok(frame)),
            Err(err) => {
                self.state = SessionState::Failed;
                Poll::Ready(Err(err))
            },
        }
    }

    fn decode<B: BackendProtocol>(&mut self, msgtype: u8, body: Bytes) -> Result<B> {
        B::decode(msgtype, body).map_err(|err| self.fail_protocol(err))
    }

    /// Perform a simple query cycle: one `Query` message, results collected
    /// eagerly.
    ///
    /// Statements that start a COPY sub-mode are rejected here; use
    /// [`copy_in`][Connection::copy_in] and [`copy_out`][Connection::copy_out].
    ///
    /// <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-SIMPLE-QUERY>
    pub async fn simple_query(&mut self, sql: &str) -> Result<Vec<Row>> {
        self.ensure_ready("query").await?;
        self.state = SessionState::Simple;
        self.stream.send(frontend::Query { sql });

        let mut desc: Option<Arc<RowDescription>> = None;
        let mut rows = Vec::new();
        let mut empty = false;

        loop {
            match self.recv::<BackendMessage>().await {
                Ok(BackendMessage::RowDescription(rd)) => {
                    let parsed = RowDescription::parse(&rd).map_err(|e| self.fail_protocol(e))?;
                    desc = Some(Arc::new(parsed));
                },
                Ok(BackendMessage::DataRow(dr)) => match &desc {
                    Some(desc) => {
                        let row = Row::new(desc.clone(), dr).map_err(|e| self.fail_protocol(e))?;
                        rows.push(row);
                    },
                    None => {
                        let err = ProtocolError::unexpected_phase(
                            backend::DataRow::MSGTYPE,
                            "simple query before row description",
                        );
                        return Err(self.fail_protocol(err));
                    },
                },
                Ok(BackendMessage::CommandComplete(_)) => desc = None,
                Ok(BackendMessage::EmptyQueryResponse(_)) => empty = true,
                Ok(BackendMessage::ReadyForQuery(_)) => break,
                Ok(BackendMessage::CopyInResponse(_) | BackendMessage::CopyBothResponse(_)) => {
                    self.stream.send(frontend::CopyFail {
                        message: "COPY is only available through the copy interface",
                    });
                    self.ready_request();
                    self.synchronize().await?;
                    return Err(CopyNotSupported.into());
                },
                Ok(BackendMessage::CopyOutResponse(_)) => {
                    self.ready_request();
                    self.synchronize().await?;
                    return Err(CopyNotSupported.into());
                },
                Ok(msg) => return Err(self.fail_protocol(msg.unexpected("simple query"))),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    // server error: the cycle still ends with ReadyForQuery,
                    // consume it so the connection is reusable before failing
                    self.ready_request();
                    self.synchronize().await?;
                    return Err(err);
                },
            }
        }

        self.state = SessionState::Idle;
        if empty {
            return Err(EmptyQueryError.into());
        }
        Ok(rows)
    }

    /// Gracefully close the connection with a `Terminate` message.
    pub async fn close(mut self) -> Result<()> {
        if matches!(self.state, SessionState::Failed | SessionState::Closed) {
            return Ok(());
        }
        self.stream.send(frontend::Terminate);
        if let Err(err) = std::future::poll_fn(|cx| self.stream.poll_flush(cx)).await {
            trace!("terminate not delivered: {err}");
        }
        self.state = SessionState::Closed;
        Ok(())
    }

    pub(crate) fn fail_protocol(&mut self, err: ProtocolError) -> crate::Error {
        self.state = SessionState::Failed;
        err.into()
    }

    /// Restore the ReadyForQuery barrier after a failed step whose cycle
    /// already has a `Sync` queued, then hand the original error back.
    pub(crate) async fn recover(&mut self, err: crate::Error) -> crate::Error {
        if err.is_fatal() {
            return err;
        }
        self.ready_request();
        match self.synchronize().await {
            Ok(()) => err,
            Err(fatal) => fatal,
        }
    }

    /// Same as [`recover`][Self::recover] for cycles that were only flushed:
    /// queue the missing `Sync` first.
    pub(crate) async fn recover_unsynced(&mut self, err: crate::Error) -> crate::Error {
        if err.is_fatal() {
            return err;
        }
        self.stream.send(frontend::Sync);
        self.recover(err).await
    }

    /// Drain any abandoned response sequence, then verify the connection can
    /// accept the operation.
    pub(crate) async fn ensure_ready(&mut self, op: &'static str) -> Result<()> {
        if self.discarding {
            self.synchronize().await?;
        }
        self.ensure_idle(op)?;
        Ok(())
    }

    fn observe_ready(&mut self, status_byte: u8) -> Result<()> {
        match TransactionStatus::from_status_byte(status_byte) {
            Some(status) => {
                self.tx_status = status;
                self.state = SessionState::Idle;
                Ok(())
            },
            None => Err(self.fail_protocol(ProtocolError::corrupt(backend::ReadyForQuery::MSGTYPE))),
        }
    }

    fn set_parameter(&mut self, status: backend::ParameterStatus) {
        trace!("parameter {} = {}", status.name.as_str(), status.value.as_str());
        match self.params.iter_mut().find(|(name, _)| *name == status.name) {
            Some((_, value)) => *value = status.value,
            None => self.params.push((status.name, status.value)),
        }
    }
}

#[cfg(feature = "tokio")]
impl<S> Connection<S> {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transaction status from the last `ReadyForQuery`.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    /// A session parameter reported by the server, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(param, _)| param.as_str() == name)
            .map(|(_, value)| value.as_str())
    }

    /// Cancellation key data captured during startup.
    pub fn backend_key(&self) -> Option<BackendKeyData> {
        self.key_data
    }

    /// A token to cancel the in-progress statement out-of-band.
    ///
    /// Returns [`None`] when the server did not send key data.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        let key = self.key_data?;
        Some(CancelToken {
            host: self.config.host.clone(),
            port: self.config.port,
            key,
        })
    }

    pub(crate) fn ensure_idle(&self, op: &'static str) -> Result<(), SequenceError> {
        match self.state {
            SessionState::Idle => Ok(()),
            state => Err(SequenceError { op, state: state.name() }),
        }
    }

    /// Request that all backend messages are ignored until `ReadyForQuery`.
    ///
    /// Only valid when the in-flight cycle is guaranteed to reach one, that
    /// is after `Sync` or within a simple query or copy cycle.
    pub(crate) fn ready_request(&mut self) {
        self.discarding = true;
    }
}

#[cfg(feature = "tokio")]
impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state)
            .field("tx_status", &self.tx_status)
            .finish_non_exhaustive()
    }
}

/// Out-of-band cancellation handle.
///
/// Cancellation does not travel on the session connection: it opens a new,
/// short-lived connection carrying the `BackendKeyData` captured at startup.
/// It is fire-and-forget and best-effort; the in-progress statement still
/// fails asynchronously on its own connection, with SQLSTATE 57014 when the
/// cancel took effect. Issuing it twice is safe.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: ByteStr,
    port: u16,
    key: BackendKeyData,
}

#[cfg(feature = "tokio")]
impl CancelToken {
    /// Send the cancel request over a new TCP side connection.
    pub async fn cancel(&self) -> Result<()> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port)).await?;
        self.cancel_with(tcp).await
    }

    /// Send the cancel request over an already-established side channel.
    pub async fn cancel_with<S>(&self, io: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = PgStream::new(io);
        stream.send_cancel(frontend::CancelRequest {
            process_id: self.key.process_id,
            secret_key: self.key.secret_key,
        });
        std::future::poll_fn(|cx| stream.poll_flush(cx)).await?;
        // no acknowledgement of any kind is sent back
        Ok(())
    }
}
