//! Postgres Frontend and Backend Protocol
//!
//! Docs here mostly quoted from the official postgres documentation.
//!
//! ## Messaging Overview
//!
//! All communication is through a stream of messages. The first byte of a message identifies
//! the message type, and the next four bytes specify the length of the rest of the message
//! (this length count includes itself, but not the message-type byte). The remaining contents
//! of the message are determined by the message type.
//!
//! ```text
//! ┏━━━━┳━━━━━━━━━━━━━━━━━━━┳━━━━━━┓
//! ┃ Ty ┃       Length      ┃ Body ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ u8 ┃        u32        ┃ [u8] ┃
//! ┣━━━━╋━━━━━━━━━━━━━━━━━━━╋━━━━━━┫
//! ┃ 43 ┃ 00 | 00 | 00 | 32 ┃  ..  ┃
//! ┗━━━━┻━━━━━━━━━━━━━━━━━━━┻━━━━━━┛
//! ```
//!
//! For historical reasons, the very first message sent by the client (the startup message)
//! has no initial message-type byte.
//!
//! Message boundaries, once lost, cannot be safely rediscovered, so every decoding failure
//! here is fatal to the connection that produced it.
//!
//! <https://www.postgresql.org/docs/17/protocol-overview.html>

mod pg_type;
mod pg_format;

pub mod frontend;
pub mod backend;

mod error;

pub use pg_type::{Oid, PgType};
pub use pg_format::PgFormat;

pub use frontend::FrontendProtocol;
pub use backend::{BackendMessage, BackendProtocol, ErrorResponse, NoticeResponse};
pub use error::ProtocolError;

/// SQLSTATE codes the driver itself needs to recognize.
///
/// <https://www.postgresql.org/docs/current/errcodes-appendix.html>
pub mod sqlstate {
    /// `query_canceled`, reported after a cancel request took effect.
    pub const QUERY_CANCELED: &str = "57014";

    /// `invalid_parameter_value`
    pub const INVALID_PARAMETER_VALUE: &str = "22023";

    /// `feature_not_supported`
    pub const FEATURE_NOT_SUPPORTED: &str = "0A000";
}
