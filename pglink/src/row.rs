//! Postgres row operation.
//!
//! - [`RowDescription`] — ordered column metadata, immutable per execution
//! - [`Row`] — positional raw column bytes, decoded lazily on access
use bytes::{Buf, Bytes};
use std::{fmt, sync::Arc};

use crate::{
    common::ByteStr,
    ext::{BytesExt, FmtExt},
    postgres::{backend, Oid, PgFormat, ProtocolError},
    types::{self, CodecError, FromValue, Value},
};

/// Metadata of a single result column.
#[derive(Debug, Clone)]
pub struct Column {
    name: ByteStr,
    type_oid: Oid,
    format: PgFormat,
}

impl Column {
    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The object ID of the column's data type.
    pub const fn type_oid(&self) -> Oid {
        self.type_oid
    }

    /// The transmission format of the column values.
    pub const fn format(&self) -> PgFormat {
        self.format
    }
}

/// Ordered sequence of column metadata.
///
/// Produced once per statement or portal execution and immutable for the
/// lifetime of that execution.
#[derive(Debug)]
pub struct RowDescription {
    columns: Vec<Column>,
}

impl RowDescription {
    /// Parse the per-field metadata of a `RowDescription` message.
    pub(crate) fn parse(msg: &backend::RowDescription) -> Result<Self, ProtocolError> {
        const MSGTYPE: u8 = backend::RowDescription::MSGTYPE;

        let mut body = msg.body.clone();
        let mut columns = Vec::with_capacity(msg.field_len as usize);

        for _ in 0..msg.field_len {
            let name = body.get_nul_bytestr().ok_or(ProtocolError::corrupt(MSGTYPE))?;
            let _table_oid = body.try_get_u32().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let _attribute = body.try_get_u16().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let type_oid = body.try_get_u32().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let _type_size = body.try_get_i16().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let _type_modifier = body.try_get_i32().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let format_code = body.try_get_u16().map_err(|_| ProtocolError::truncated(MSGTYPE))?;
            let format = PgFormat::from_format_code(format_code)
                .ok_or(ProtocolError::corrupt(MSGTYPE))?;

            columns.push(Column { name, type_oid, format });
        }

        Ok(Self { columns })
    }

    /// Replace the reported formats with the ones chosen at bind time.
    ///
    /// In a `RowDescription` returned from the statement variant of Describe
    /// the format is not yet known and is always reported as text.
    pub(crate) fn with_formats(&self, formats: &[PgFormat]) -> Self {
        debug_assert_eq!(formats.len(), self.columns.len());
        let columns = self
            .columns
            .iter()
            .zip(formats)
            .map(|(column, format)| Column { format: *format, ..column.clone() })
            .collect();
        Self { columns }
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the execution produces no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The column metadata in result order.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Find a column position by name.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name.as_str() == name)
    }
}

/// A single result row.
///
/// Holds the raw wire bytes; column values are decoded through the type
/// registry only when accessed, so unused large values are never
/// materialized.
#[derive(Clone)]
pub struct Row {
    desc: Arc<RowDescription>,
    /// `DataRow` body: per column an `i32` length (-1 for NULL) then bytes.
    values: Bytes,
}

impl Row {
    pub(crate) fn new(desc: Arc<RowDescription>, data: backend::DataRow) -> Result<Self, ProtocolError> {
        if data.column_len as usize != desc.len() {
            // column count must match the descriptor of this execution
            return Err(ProtocolError::corrupt(backend::DataRow::MSGTYPE));
        }
        Ok(Self { desc, values: data.body })
    }

    /// The descriptor this row was produced under.
    pub fn description(&self) -> &RowDescription {
        &self.desc
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.desc.len()
    }

    /// Returns `true` if row contains no columns.
    pub fn is_empty(&self) -> bool {
        self.desc.is_empty()
    }

    /// Raw wire bytes of the column at `idx`, [`None`] when NULL.
    pub fn raw(&self, idx: usize) -> Result<Option<Bytes>, DecodeError> {
        if idx >= self.len() {
            return Err(DecodeError::IndexOutOfBounds(idx));
        }

        let mut values = self.values.clone();
        let mut i = 0;
        loop {
            let len = values.try_get_i32().map_err(|_| DecodeError::Corrupt)?;
            let value = match len {
                -1 => None,
                len if len >= 0 => {
                    let len = len as usize;
                    if values.remaining() < len {
                        return Err(DecodeError::Corrupt);
                    }
                    Some(values.split_to(len))
                },
                _ => return Err(DecodeError::Corrupt),
            };
            if i == idx {
                return Ok(value);
            }
            i += 1;
        }
    }

    /// Decode the column at `idx` through the type registry.
    pub fn get(&self, idx: usize) -> Result<Value, DecodeError> {
        let raw = self.raw(idx)?;
        let column = &self.desc.columns()[idx];
        types::global()
            .decode(raw, column.type_oid(), column.format())
            .map_err(DecodeError::Codec)
    }

    /// Decode the column named `name` through the type registry.
    pub fn get_named(&self, name: &str) -> Result<Value, DecodeError> {
        match self.desc.position(name) {
            Some(idx) => self.get(idx),
            None => Err(DecodeError::ColumnNotFound(name.into())),
        }
    }

    /// Decode and convert the column at `idx`.
    pub fn try_get<T: FromValue>(&self, idx: usize) -> Result<T, DecodeError> {
        let value = self.get(idx)?;
        T::from_value(value).ok_or(DecodeError::TypeMismatch { column: idx })
    }
}

impl fmt::Debug for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_map();
        for (i, column) in self.desc.columns().iter().enumerate() {
            dbg.key(&column.name());
            match self.raw(i) {
                Ok(Some(raw)) => dbg.value(&raw.lossy()),
                Ok(None) => dbg.value(&format_args!("NULL")),
                Err(_) => dbg.value(&format_args!("<corrupt>")),
            };
        }
        dbg.finish()
    }
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for DecodeError {
            fn from($pat: $ty) -> Self {
                $body
            }
        }
    };
}

from!(<CodecError>e => DecodeError::Codec(e));

/// An error when decoding row value.
pub enum DecodeError {
    /// Index requested is out of bounds.
    IndexOutOfBounds(usize),
    /// Column requested not found.
    ColumnNotFound(String),
    /// Codec rejected the wire value.
    Codec(CodecError),
    /// Row body is inconsistent with its descriptor.
    Corrupt,
    /// Decoded value does not convert to the requested type.
    TypeMismatch { column: usize },
}

impl std::error::Error for DecodeError { }

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to decode row, ")?;
        match self {
            Self::IndexOutOfBounds(idx) => write!(f, "index out of bounds: {idx}"),
            Self::ColumnNotFound(name) => write!(f, "column not found: {name:?}"),
            Self::Codec(e) => write!(f, "{e}"),
            Self::Corrupt => write!(f, "row data inconsistent with row description"),
            Self::TypeMismatch { column } => write!(f, "type mismatch at column {column}"),
        }
    }
}

impl fmt::Debug for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::BackendProtocol;
    use bytes::{BufMut, BytesMut};
    use crate::ext::BufMutExt;

    fn description(columns: &[(&str, Oid, u16)]) -> Arc<RowDescription> {
        let mut buf = BytesMut::new();
        for (name, oid, format) in columns {
            buf.put_nul_string(name);
            buf.put_u32(0); // table oid
            buf.put_u16(0); // attribute number
            buf.put_u32(*oid);
            buf.put_i16(-1); // type size
            buf.put_i32(-1); // type modifier
            buf.put_u16(*format);
        }
        let mut framed = BytesMut::new();
        framed.put_u16(columns.len() as u16);
        framed.extend_from_slice(&buf);
        let msg = backend::RowDescription::decode(b'T', framed.freeze()).unwrap();
        Arc::new(RowDescription::parse(&msg).unwrap())
    }

    fn data_row(columns: &[Option<&[u8]>]) -> backend::DataRow {
        let mut buf = BytesMut::new();
        buf.put_u16(columns.len() as u16);
        for column in columns {
            match column {
                None => buf.put_i32(-1),
                Some(bytes) => {
                    buf.put_i32(bytes.len() as i32);
                    buf.put_slice(bytes);
                },
            }
        }
        backend::DataRow::decode(b'D', buf.freeze()).unwrap()
    }

    #[test]
    fn lazy_column_access() {
        let desc = description(&[("id", 23, 1), ("name", 25, 0), ("blob", 17, 1)]);
        let row = Row::new(
            desc,
            data_row(&[Some(7i32.to_be_bytes().as_slice()), Some(b"foo"), None]),
        )
        .unwrap();

        assert_eq!(row.get(0).unwrap(), Value::Int4(7));
        assert_eq!(row.get_named("name").unwrap().as_str(), Some("foo"));
        assert_eq!(row.get(2).unwrap(), Value::Null);
        assert!(matches!(row.get(3), Err(DecodeError::IndexOutOfBounds(3))));

        let id: i32 = row.try_get(0).unwrap();
        assert_eq!(id, 7);
        let blob: Option<Vec<u8>> = row.try_get(2).unwrap();
        assert!(blob.is_none());
    }

    #[test]
    fn column_count_mismatch_is_protocol_error() {
        let desc = description(&[("id", 23, 1)]);
        assert!(Row::new(desc, data_row(&[None, None])).is_err());
    }

    #[test]
    fn named_lookup_miss() {
        let desc = description(&[("id", 23, 1)]);
        let row = Row::new(desc, data_row(&[None])).unwrap();
        assert!(matches!(row.get_named("nope"), Err(DecodeError::ColumnNotFound(_))));
    }
}
