//! Postgres Backend Messages
use bytes::{Buf, Bytes};

use super::{Oid, PgFormat, ProtocolError};
use crate::{common::ByteStr, ext::BytesExt};

/// A type that can be decoded from a postgres backend message.
///
/// `body` is the message payload *after* the type byte and the length,
/// framed to exactly the declared length. Decoding must never read past it;
/// a short body is a protocol violation, not a panic.
pub trait BackendProtocol: Sized {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError>;
}

/// Postgres backend messages.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    BindComplete(BindComplete),
    CloseComplete(CloseComplete),
    CommandComplete(CommandComplete),
    CopyBothResponse(CopyBothResponse),
    CopyData(CopyData),
    CopyDone(CopyDone),
    CopyInResponse(CopyInResponse),
    CopyOutResponse(CopyOutResponse),
    DataRow(DataRow),
    EmptyQueryResponse(EmptyQueryResponse),
    ErrorResponse(ErrorResponse),
    NegotiateProtocolVersion(NegotiateProtocolVersion),
    NoData(NoData),
    NoticeResponse(NoticeResponse),
    ParameterDescription(ParameterDescription),
    ParameterStatus(ParameterStatus),
    ParseComplete(ParseComplete),
    PortalSuspended(PortalSuspended),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                }
            }

            /// Get message name from message type.
            ///
            /// Returns `"Unknown"` for unknown message type.
            pub fn message_name(msgtype: u8) -> &'static str {
                match msgtype {
                    $($name::MSGTYPE => stringify!($name),)*
                    _ => "Unknown",
                }
            }

            /// Create [`ProtocolError`] for a message which is out of
            /// sequence for the given protocol `phase`.
            pub fn unexpected(&self, phase: &'static str) -> ProtocolError {
                ProtocolError::unexpected_phase(self.msgtype(), phase)
            }
        }
        impl BackendProtocol for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as BackendProtocol>::decode(msgtype, body)?),)*
                    _ => return Err(ProtocolError::unknown(msgtype)),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    BindComplete,
    CloseComplete,
    CommandComplete,
    CopyBothResponse,
    CopyData,
    CopyDone,
    CopyInResponse,
    CopyOutResponse,
    DataRow,
    EmptyQueryResponse,
    ErrorResponse,
    NegotiateProtocolVersion,
    NoData,
    NoticeResponse,
    ParameterDescription,
    ParameterStatus,
    ParseComplete,
    PortalSuspended,
    ReadyForQuery,
    RowDescription,
}

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ))
        }
    };
}

macro_rules! read {
    ($body:ident.$get:ident()) => {
        $body.$get().map_err(|_| ProtocolError::truncated(Self::MSGTYPE))?
    };
}

macro_rules! read_str {
    ($body:ident) => {
        $body.get_nul_bytestr().ok_or(ProtocolError::corrupt(Self::MSGTYPE))?
    };
}

/// Identifies the message as an authentication request.
#[derive(Debug)]
pub enum Authentication {
    /// Specifies that the authentication was successful.
    Ok,
    /// Specifies that Kerberos V5 authentication is required.
    KerberosV5,
    /// Specifies that a clear-text password is required.
    CleartextPassword,
    /// Specifies that an MD5-encrypted password is required.
    MD5Password {
        /// The salt to use when encrypting the password.
        salt: [u8; 4],
    },
    /// Specifies that GSSAPI authentication is required.
    GSS,
    /// GSSAPI or SSPI authentication data.
    GSSContinue {
        data: Bytes,
    },
    /// Specifies that SSPI authentication is required.
    SSPI,
    /// Specifies that SASL authentication is required.
    SASL {
        /// The message body is a list of SASL authentication mechanisms,
        /// in the server's order of preference.
        ///
        /// A zero byte is required as terminator after the last
        /// authentication mechanism name.
        mechanisms: Bytes,
    },
    /// Specifies that this message contains a SASL challenge.
    SASLContinue {
        /// SASL data, specific to the SASL mechanism being used.
        data: Bytes,
    },
    /// Specifies that SASL authentication has completed.
    SASLFinal {
        /// SASL outcome "additional data", specific to the SASL mechanism being used.
        data: Bytes,
    },
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';

    /// Returns `true` if the server offers the given SASL `mechanism`.
    pub fn offers_mechanism(&self, mechanism: &str) -> bool {
        let Authentication::SASL { mechanisms } = self else {
            return false;
        };
        let mut list = mechanisms.clone();
        while let Some(name) = list.get_nul_bytestr() {
            if name.is_empty() {
                break;
            }
            if name == *mechanism {
                return true;
            }
        }
        false
    }
}

impl BackendProtocol for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let auth = match read!(body.try_get_u32()) {
            0 => Authentication::Ok,
            2 => Authentication::KerberosV5,
            3 => Authentication::CleartextPassword,
            5 => Authentication::MD5Password { salt: read!(body.try_get_u32()).to_be_bytes() },
            7 => Authentication::GSS,
            8 => Authentication::GSSContinue { data: body },
            9 => Authentication::SSPI,
            10 => Authentication::SASL { mechanisms: body },
            11 => Authentication::SASLContinue { data: body },
            12 => Authentication::SASLFinal { data: body },
            auth => return Err(ProtocolError::unknown_auth(auth)),
        };
        Ok(auth)
    }
}

/// Identifies the message as cancellation key data.
///
/// The frontend must save these values if it wishes to be able to issue
/// CancelRequest messages later.
#[derive(Debug, Clone, Copy)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl BackendProtocol for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            process_id: read!(body.try_get_u32()),
            secret_key: read!(body.try_get_u32()),
        })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: ByteStr,
    /// The current value of the parameter.
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl BackendProtocol for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: read_str!(body),
            value: read_str!(body),
        })
    }
}

/// A warning message. The frontend should display the message.
#[derive(Debug)]
pub struct NoticeResponse {
    /// Tagged fields, same layout as [`ErrorResponse`].
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';

    /// The human-readable notice message, if any.
    pub fn message(&self) -> Option<ByteStr> {
        let mut fields = self.body.clone();
        while let Ok(tag) = fields.try_get_u8() {
            if tag == 0 {
                break;
            }
            let value = fields.get_nul_bytestr()?;
            if tag == b'M' {
                return Some(value);
            }
        }
        None
    }
}

impl BackendProtocol for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(NoticeResponse { body })
    }
}

/// Identifies the message as an error.
///
/// The message body consists of one or more identified fields, followed by
/// a zero byte as a terminator. Fields can appear in any order.
///
/// Decoded into a structured record: unrecognized field types are silently
/// ignored, as new ones might be added in future.
pub struct ErrorResponse {
    severity: ByteStr,
    code: ByteStr,
    message: ByteStr,
    detail: Option<ByteStr>,
    hint: Option<ByteStr>,
    position: Option<u32>,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    /// The severity: `ERROR`, `FATAL`, or `PANIC`.
    pub fn severity(&self) -> &str {
        &self.severity
    }

    /// The SQLSTATE code for the error, always present.
    ///
    /// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
    pub fn code(&self) -> &str {
        &self.code
    }

    /// The primary human-readable error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Optional secondary error message carrying more detail.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Optional suggestion what to do about the problem.
    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    /// Error cursor position as an index into the original query string,
    /// measured in characters, first character is 1.
    pub fn position(&self) -> Option<u32> {
        self.position
    }

    /// Returns `true` if the error reports a cancelled query
    /// (SQLSTATE [`57014`][super::sqlstate::QUERY_CANCELED]).
    pub fn is_query_canceled(&self) -> bool {
        self.code() == super::sqlstate::QUERY_CANCELED
    }
}

impl BackendProtocol for ErrorResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);

        let mut severity = None;
        let mut code = None;
        let mut message = None;
        let mut detail = None;
        let mut hint = None;
        let mut position = None;

        loop {
            let tag = read!(body.try_get_u8());
            if tag == 0 {
                break;
            }
            let value = read_str!(body);
            match tag {
                // 'S' is the localized severity, 'V' the nonlocalized one
                b'S' => severity = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'D' => detail = Some(value),
                b'H' => hint = Some(value),
                b'P' => position = value.parse().ok(),
                _ => { },
            }
        }

        Ok(Self {
            severity: severity.unwrap_or_else(|| ByteStr::from_static("ERROR")),
            code: code.ok_or(ProtocolError::corrupt(Self::MSGTYPE))?,
            message: message.ok_or(ProtocolError::corrupt(Self::MSGTYPE))?,
            detail,
            hint,
            position,
        })
    }
}

impl std::error::Error for ErrorResponse { }

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (SQLSTATE {}): {}", self.severity, self.code, self.message)?;
        if let Some(detail) = self.detail() {
            write!(f, "\ndetail: {detail}")?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nhint: {hint}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{self}\"")
    }
}

/// Identifies the message as a row description.
#[derive(Debug)]
pub struct RowDescription {
    /// Specifies the number of fields in a row (can be zero).
    pub field_len: u16,
    /// Undecoded per-field metadata.
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl BackendProtocol for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            field_len: read!(body.try_get_u16()),
            body,
        })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub column_len: u16,
    /// Undecoded column value slots.
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl BackendProtocol for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            column_len: read!(body.try_get_u16()),
            body,
        })
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag. This is usually a single word that identifies which
    /// SQL command was completed, followed by the affected row count, e.g.
    /// `SELECT 100` or `INSERT 0 1`.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';

    /// Number of rows the completed command affected or returned.
    pub fn rows_affected(&self) -> u64 {
        let mut words = self.tag.split_whitespace();
        let Some(tag) = words.next() else {
            return 0;
        };
        let Some(rows) = words.next() else {
            return 0;
        };
        match tag {
            // INSERT tag is `INSERT oid rows`
            "INSERT" => words.next().unwrap_or_default(),
            "SELECT" => rows,
            "UPDATE" => rows,
            "DELETE" => rows,
            "MERGE" => rows,
            "FETCH" => rows,
            "MOVE" => rows,
            "COPY" => rows,
            _ => return 0,
        }
        .parse()
        .unwrap_or_default()
    }
}

impl BackendProtocol for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: read_str!(body) })
    }
}

/// Identifies the message as a protocol version negotiation message.
#[derive(Debug)]
pub struct NegotiateProtocolVersion {
    /// Newest minor protocol version supported by the server for the major
    /// protocol version requested by the client.
    pub minor: u32,
    /// Number of protocol options not recognized by the server.
    pub len: u32,
    /// Then, for protocol option not recognized by the server, there is the following:
    pub opt_names: Bytes,
}

impl NegotiateProtocolVersion {
    pub const MSGTYPE: u8 = b'v';
}

impl BackendProtocol for NegotiateProtocolVersion {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            minor: read!(body.try_get_u32()),
            len: read!(body.try_get_u32()),
            opt_names: body,
        })
    }
}

/// Identifies the message as a parameter description.
#[derive(Debug)]
pub struct ParameterDescription {
    /// The number of parameters used by the statement (can be zero).
    pub param_len: u16,
    /// Then, for each parameter, the object ID of the parameter data type.
    pub oids: Bytes,
}

impl ParameterDescription {
    pub const MSGTYPE: u8 = b't';

    /// Collect the parameter type oids.
    pub fn to_vec(&self) -> Vec<Oid> {
        let mut oids = self.oids.clone();
        let mut out = Vec::with_capacity(self.param_len as usize);
        for _ in 0..self.param_len {
            match oids.try_get_u32() {
                Ok(oid) => out.push(oid),
                Err(_) => break,
            }
        }
        out
    }
}

impl BackendProtocol for ParameterDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            param_len: read!(body.try_get_u16()),
            oids: body,
        })
    }
}

/// Identifies the message type. ReadyForQuery is sent whenever the backend
/// is ready for a new query cycle.
///
/// This is the sole synchronization barrier: after an error, no new command
/// may be issued until this message arrives.
#[derive(Debug)]
pub struct ReadyForQuery {
    /// Current backend transaction status indicator: `b'I'` if idle (not in
    /// a transaction block), `b'T'` if in a transaction block, or `b'E'` if
    /// in a failed transaction block.
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';
}

impl BackendProtocol for ReadyForQuery {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tx_status: read!(body.try_get_u8()) })
    }
}

/// Common body of the three `Copy*Response` messages.
fn decode_copy_response(msgtype: u8, mut body: Bytes) -> Result<(PgFormat, u16, Bytes), ProtocolError> {
    // 0 indicates the overall COPY format is textual, 1 indicates binary
    let format = match body.try_get_i8().map_err(|_| ProtocolError::truncated(msgtype))? {
        0 => PgFormat::Text,
        1 => PgFormat::Binary,
        _ => return Err(ProtocolError::corrupt(msgtype)),
    };
    let column_len = body.try_get_u16().map_err(|_| ProtocolError::truncated(msgtype))?;
    Ok((format, column_len, body))
}

macro_rules! copy_response {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// The overall COPY format: text or binary (similar to DataRow format).
            pub format: PgFormat,
            /// The number of columns in the data to be copied.
            pub column_len: u16,
            /// The format codes to be used for each column.
            ///
            /// All must be zero if the overall copy format is textual.
            pub column_formats: Bytes,
        }

        impl $name {
            pub const MSGTYPE: u8 = $ty;
        }

        impl BackendProtocol for $name {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                assert_msgtype!(msgtype);
                let (format, column_len, column_formats) = decode_copy_response(msgtype, body)?;
                Ok(Self { format, column_len, column_formats })
            }
        }
    )*};
}

copy_response! {
    /// Identifies the message as a Start Copy In response.
    ///
    /// The frontend must now send copy-in data (or CopyFail).
    struct CopyInResponse, b'G';

    /// Identifies the message as a Start Copy Out response.
    ///
    /// This message will be followed by copy-out data.
    struct CopyOutResponse, b'H';

    /// Identifies the message as a Start Copy Both response.
    ///
    /// This message is used only for Streaming Replication.
    struct CopyBothResponse, b'W';
}

/// Identifies the message as COPY data.
#[derive(Debug)]
pub struct CopyData {
    /// Data that forms part of a COPY data stream.
    ///
    /// Messages sent from the backend will always correspond to single data rows.
    pub data: Bytes,
}

impl CopyData {
    pub const MSGTYPE: u8 = b'd';
}

impl BackendProtocol for CopyData {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { data: body })
    }
}

macro_rules! unit_msg {
    ($(
        $(#[$doc:meta])* struct $name:ident, $ty:literal;
    )*) => {$(
            $(#[$doc])*
            #[derive(Debug)]
            pub struct $name;

            impl $name {
                pub const MSGTYPE: u8 = $ty;
            }

            impl BackendProtocol for $name {
                fn decode(msgtype: u8, _: Bytes) -> Result<Self, ProtocolError> {
                    if $name::MSGTYPE != msgtype {
                        return Err(ProtocolError::unexpected(Self::MSGTYPE, msgtype))
                    }
                    Ok(Self)
                }
            }
    )*};
}

unit_msg! {
    /// Identifies the message as a Bind-complete indicator.
    struct BindComplete, b'2';

    /// Identifies the message as a Close-complete indicator.
    struct CloseComplete, b'3';

    /// Identifies the message as a COPY-complete indicator.
    struct CopyDone, b'c';

    /// Identifies the message as a response to an empty query string.
    ///
    /// This substitutes for CommandComplete.
    struct EmptyQueryResponse, b'I';

    /// Identifies the message as a no-data indicator.
    struct NoData, b'n';

    /// Identifies the message as a Parse-complete indicator.
    struct ParseComplete, b'1';

    /// Identifies the message as a portal-suspended indicator.
    ///
    /// Note this only appears if an Execute message's row-count limit was reached.
    struct PortalSuspended, b's';
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use crate::ext::BufMutExt;

    fn error_body(fields: &[(u8, &str)]) -> Bytes {
        let mut buf = BytesMut::new();
        for (tag, value) in fields {
            buf.put_u8(*tag);
            buf.put_nul_string(value);
        }
        buf.put_u8(0);
        buf.freeze()
    }

    #[test]
    fn error_response_fields() {
        let body = error_body(&[
            (b'S', "ERROR"),
            (b'C', "42P01"),
            (b'M', "relation \"foo\" does not exist"),
            (b'P', "15"),
            (b'q', "ignored unknown field"),
        ]);
        let err = ErrorResponse::decode(b'E', body).unwrap();

        assert_eq!(err.severity(), "ERROR");
        assert_eq!(err.code(), "42P01");
        assert_eq!(err.message(), "relation \"foo\" does not exist");
        assert_eq!(err.position(), Some(15));
        assert!(err.detail().is_none());
        assert!(!err.is_query_canceled());
    }

    #[test]
    fn error_response_query_canceled() {
        let body = error_body(&[(b'C', "57014"), (b'M', "canceling statement due to user request")]);
        let err = ErrorResponse::decode(b'E', body).unwrap();
        assert!(err.is_query_canceled());
    }

    #[test]
    fn error_response_missing_code_is_protocol_error() {
        let body = error_body(&[(b'M', "message only")]);
        assert!(ErrorResponse::decode(b'E', body).is_err());
    }

    #[test]
    fn truncated_body_is_protocol_error() {
        // BackendKeyData body must carry 8 bytes
        let body = Bytes::from_static(&[0, 0, 1]);
        assert!(BackendKeyData::decode(b'K', body).is_err());
    }

    #[test]
    fn unknown_msgtype_is_protocol_error() {
        assert!(BackendMessage::decode(b'@', Bytes::new()).is_err());
    }

    #[test]
    fn command_complete_rows() {
        let tag = |t: &'static str| CommandComplete { tag: ByteStr::from_static(t) };
        assert_eq!(tag("SELECT 100").rows_affected(), 100);
        assert_eq!(tag("INSERT 0 42").rows_affected(), 42);
        assert_eq!(tag("COPY 3").rows_affected(), 3);
        assert_eq!(tag("CREATE TABLE").rows_affected(), 0);
    }

    #[test]
    fn copy_in_response_formats() {
        let mut buf = BytesMut::new();
        buf.put_i8(0);
        buf.put_u16(2);
        buf.put_u16(0);
        buf.put_u16(0);
        let copy = CopyInResponse::decode(b'G', buf.freeze()).unwrap();
        assert_eq!(copy.format, PgFormat::Text);
        assert_eq!(copy.column_len, 2);
    }

    #[test]
    fn sasl_mechanism_listing() {
        let mut buf = BytesMut::new();
        buf.put_u32(10);
        buf.put_nul_string("SCRAM-SHA-256-PLUS");
        buf.put_nul_string("SCRAM-SHA-256");
        buf.put_u8(0);
        let auth = Authentication::decode(b'R', buf.freeze()).unwrap();
        assert!(auth.offers_mechanism("SCRAM-SHA-256"));
        assert!(!auth.offers_mechanism("PLAIN"));
    }
}
