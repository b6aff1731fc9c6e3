//! Type codec registry.
//!
//! Converts between in-memory [`Value`]s and the text or binary column
//! representation of the wire protocol.
//!
//! The registry is process-wide: built once from the builtin codecs plus any
//! codec staged via [`register`], then frozen behind [`global`]. After the
//! freeze it is read-only and safe to share across connections without
//! synchronization.
//!
//! ```
//! use pglink::types::{PgFormat, Value, global};
//!
//! let registry = global();
//! let encoded = registry.encode_param(&Value::Int4(420), 23, PgFormat::Binary).unwrap();
//! let back = registry.decode(encoded.into_bytes(), 23, PgFormat::Binary).unwrap();
//! assert_eq!(back, Value::Int4(420));
//! ```
use bytes::{Buf, Bytes, BytesMut};
use std::{
    collections::HashMap,
    fmt,
    sync::{Mutex, OnceLock},
};

use crate::{
    common::{ByteStr, unit_error},
    ext::BindParams,
};

pub use crate::postgres::{Oid, PgFormat, PgType};

mod builtin;

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "time")]
mod time;

#[cfg(feature = "json")]
pub use json::Json;

/// An in-memory column or parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(ByteStr),
    Bytea(Bytes),
    #[cfg(feature = "time")]
    Timestamp(::time::PrimitiveDateTime),
    #[cfg(feature = "json")]
    Json(serde_json::Value),
}

impl Value {
    /// The oid of the postgres type this value naturally maps to.
    ///
    /// Returns `0` (unspecified) for [`Value::Null`].
    pub fn oid(&self) -> Oid {
        match self {
            Value::Null => 0,
            Value::Bool(_) => bool::OID,
            Value::Int2(_) => i16::OID,
            Value::Int4(_) => i32::OID,
            Value::Int8(_) => i64::OID,
            Value::Float4(_) => f32::OID,
            Value::Float8(_) => f64::OID,
            Value::Text(_) => str::OID,
            Value::Bytea(_) => <[u8]>::OID,
            #[cfg(feature = "time")]
            Value::Timestamp(_) => <::time::PrimitiveDateTime as PgType>::OID,
            #[cfg(feature = "json")]
            Value::Json(_) => <serde_json::Value as PgType>::OID,
        }
    }

    /// Return `true` if value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            Value::Int2(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int4(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Float4(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float8(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytea(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! from {
    ($($variant:ident($ty:ty) <- $pat:pat => $body:expr;)*) => {$(
        impl From<$ty> for Value {
            fn from($pat: $ty) -> Self {
                Value::$variant($body)
            }
        }
    )*};
}

from! {
    Bool(bool) <- v => v;
    Int2(i16) <- v => v;
    Int4(i32) <- v => v;
    Int8(i64) <- v => v;
    Float4(f32) <- v => v;
    Float8(f64) <- v => v;
    Text(&str) <- v => ByteStr::copy_from_str(v);
    Text(String) <- v => ByteStr::from(v);
    Text(ByteStr) <- v => v;
    Bytea(Vec<u8>) <- v => Bytes::from(v);
    Bytea(Bytes) <- v => v;
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// Conversion out of a decoded [`Value`].
///
/// Returns [`None`] when the value variant does not carry the requested type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! from_value {
    ($($ty:ty => $pat:pat => $body:expr;)*) => {$(
        impl FromValue for $ty {
            fn from_value(value: Value) -> Option<Self> {
                match value {
                    $pat => Some($body),
                    _ => None,
                }
            }
        }
    )*};
}

from_value! {
    bool => Value::Bool(v) => v;
    i16 => Value::Int2(v) => v;
    i32 => Value::Int4(v) => v;
    i64 => Value::Int8(v) => v;
    f32 => Value::Float4(v) => v;
    f64 => Value::Float8(v) => v;
    ByteStr => Value::Text(v) => v;
    String => Value::Text(v) => v.as_str().to_owned();
    Bytes => Value::Bytea(v) => v;
    Vec<u8> => Value::Bytea(v) => v.to_vec();
}

#[cfg(feature = "time")]
impl FromValue for ::time::PrimitiveDateTime {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Timestamp(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(feature = "json")]
impl FromValue for serde_json::Value {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Option<Self> {
        Some(value)
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            value => T::from_value(value).map(Some),
        }
    }
}

/// A codec between [`Value`] and one postgres type's wire representation.
///
/// External collaborators may implement this for additional type oids and
/// stage it via [`register`] before the registry is first used.
pub trait TypeCodec: Send + Sync + 'static {
    /// The type oid this codec handles.
    fn oid(&self) -> Oid;

    /// `true` if the type has a binary wire representation.
    ///
    /// Binary is preferred whenever supported; text is the fallback.
    fn supports_binary(&self) -> bool {
        true
    }

    /// Encode `value` in `format` into `buf`.
    ///
    /// NULL never reaches a codec, it is represented at the protocol layer.
    fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Decode a non-NULL wire value.
    fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError>;
}

/// Registry of [`TypeCodec`] keyed by type oid.
pub struct TypeRegistry {
    codecs: HashMap<Oid, Box<dyn TypeCodec>>,
}

impl TypeRegistry {
    /// Create registry without any codec.
    pub fn empty() -> Self {
        Self { codecs: HashMap::new() }
    }

    /// Create registry with the builtin codecs.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::install(&mut registry);
        #[cfg(feature = "time")]
        time::install(&mut registry);
        #[cfg(feature = "json")]
        json::install(&mut registry);
        registry
    }

    /// Insert a codec, replacing any previous codec for the same oid.
    pub fn insert(&mut self, codec: Box<dyn TypeCodec>) {
        self.codecs.insert(codec.oid(), codec);
    }

    /// Returns `true` if a codec for `oid` is registered.
    pub fn contains(&self, oid: Oid) -> bool {
        self.codecs.contains_key(&oid)
    }

    /// The preferred transmission format for `oid`.
    ///
    /// Binary when a codec exists and supports it, text otherwise.
    pub fn prefer(&self, oid: Oid) -> PgFormat {
        match self.codecs.get(&oid) {
            Some(codec) if codec.supports_binary() => PgFormat::Binary,
            _ => PgFormat::Text,
        }
    }

    /// Encode a parameter value targeting type `oid`.
    ///
    /// [`Value::Null`] encodes to the protocol-level NULL marker.
    pub fn encode_param(
        &self,
        value: &Value,
        oid: Oid,
        format: PgFormat,
    ) -> Result<Encoded, CodecError> {
        if value.is_null() {
            return Ok(Encoded::null());
        }
        let Some(codec) = self.codecs.get(&oid) else {
            return Err(CodecError::UnsupportedType { oid });
        };
        let mut buf = BytesMut::new();
        codec.encode(value, format, &mut buf)?;
        Ok(Encoded::new(buf.freeze()))
    }

    /// Decode a column value of type `oid`.
    ///
    /// `raw` of [`None`] is the protocol-level NULL and decodes to
    /// [`Value::Null`] without consulting any codec.
    pub fn decode(
        &self,
        raw: Option<Bytes>,
        oid: Oid,
        format: PgFormat,
    ) -> Result<Value, CodecError> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        let Some(codec) = self.codecs.get(&oid) else {
            return Err(CodecError::UnsupportedType { oid });
        };
        codec.decode(raw, format)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut oids = self.codecs.keys().collect::<Vec<_>>();
        oids.sort();
        f.debug_tuple("TypeRegistry").field(&oids).finish()
    }
}

static STAGED: Mutex<Option<Vec<Box<dyn TypeCodec>>>> = Mutex::new(Some(Vec::new()));
static REGISTRY: OnceLock<TypeRegistry> = OnceLock::new();

/// Stage an additional codec for the process-wide registry.
///
/// Must happen before the first [`global`] call; afterwards the registry is
/// frozen and this returns [`RegistryFrozen`].
pub fn register(codec: impl TypeCodec) -> Result<(), RegistryFrozen> {
    let mut staged = STAGED.lock().expect("type registry poisoned");
    match staged.as_mut() {
        Some(list) => {
            list.push(Box::new(codec));
            Ok(())
        },
        None => Err(RegistryFrozen),
    }
}

/// The process-wide registry: builtins plus everything [`register`]ed.
///
/// The first call freezes the codec set.
pub fn global() -> &'static TypeRegistry {
    REGISTRY.get_or_init(|| {
        let mut registry = TypeRegistry::with_builtins();
        let staged = STAGED
            .lock()
            .expect("type registry poisoned")
            .take()
            .unwrap_or_default();
        for codec in staged {
            registry.insert(codec);
        }
        registry
    })
}

unit_error! {
    /// An error when [`register`]ing a codec after the registry froze.
    pub struct RegistryFrozen("type registry is already frozen");
}

/// A parameter value encoded for the wire, ready for a `Bind` message.
#[derive(Debug, Clone)]
pub struct Encoded {
    bytes: Option<Bytes>,
}

impl Encoded {
    pub(crate) fn null() -> Self {
        Self { bytes: None }
    }

    pub(crate) fn new(bytes: Bytes) -> Self {
        Self { bytes: Some(bytes) }
    }

    /// Return `true` if this encodes the NULL marker.
    pub fn is_null(&self) -> bool {
        self.bytes.is_none()
    }

    /// Length of the encoded value in bytes, `0` for NULL.
    pub fn len(&self) -> usize {
        self.bytes.as_ref().map_or(0, Bytes::len)
    }

    /// Returns `true` if the encoded value is empty or NULL.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume self into the wire bytes, [`None`] for NULL.
    pub fn into_bytes(self) -> Option<Bytes> {
        self.bytes
    }
}

impl Buf for Encoded {
    fn remaining(&self) -> usize {
        self.bytes.as_ref().map_or(0, Buf::remaining)
    }

    fn chunk(&self) -> &[u8] {
        self.bytes.as_ref().map_or(&[], Buf::chunk)
    }

    fn advance(&mut self, cnt: usize) {
        if let Some(bytes) = self.bytes.as_mut() {
            Buf::advance(bytes, cnt);
        } else {
            assert_eq!(cnt, 0, "advance past end of NULL parameter");
        }
    }
}

impl BindParams for Encoded {
    fn size(&self) -> i32 {
        match self.bytes.as_ref() {
            // NULL parameter, no value bytes follow
            None => -1,
            Some(bytes) => bytes.len() as i32,
        }
    }
}

/// An error from a [`TypeCodec`] or the [`TypeRegistry`].
pub enum CodecError {
    /// No codec registered for the type oid.
    UnsupportedType { oid: Oid },
    /// The [`Value`] variant does not fit the target type.
    TypeMismatch { oid: Oid },
    /// The wire bytes are not a valid representation in the given format.
    Malformed { oid: Oid, format: PgFormat },
}

impl std::error::Error for CodecError { }

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::UnsupportedType { oid } => write!(f, "unsupported type oid {oid}"),
            CodecError::TypeMismatch { oid } => write!(f, "value does not fit type oid {oid}"),
            CodecError::Malformed { oid, format } => {
                write!(f, "malformed {format:?} value for type oid {oid}")
            },
        }
    }
}

impl fmt::Debug for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(registry: &TypeRegistry, value: Value, oid: Oid, format: PgFormat) {
        let encoded = registry
            .encode_param(&value, oid, format)
            .unwrap_or_else(|e| panic!("encode {value:?} as {format:?}: {e}"));
        let back = registry
            .decode(encoded.into_bytes(), oid, format)
            .unwrap_or_else(|e| panic!("decode {value:?} as {format:?}: {e}"));
        assert_eq!(back, value, "{format:?} roundtrip");
    }

    #[test]
    fn roundtrip_all_builtins_both_formats() {
        let registry = TypeRegistry::with_builtins();
        let values = [
            (Value::Bool(true), 16),
            (Value::Bool(false), 16),
            (Value::Int2(-7), 21),
            (Value::Int4(i32::MIN), 23),
            (Value::Int8(i64::MAX), 20),
            (Value::Float4(1.5), 700),
            (Value::Float8(-2.625), 701),
            (Value::Text(ByteStr::from_static("héllo")), 25),
            (Value::Bytea(Bytes::from_static(&[0, 1, 0xfe, 0xff])), 17),
        ];
        for (value, oid) in values {
            roundtrip(&registry, value.clone(), oid, PgFormat::Binary);
            roundtrip(&registry, value, oid, PgFormat::Text);
        }
    }

    #[test]
    fn null_skips_codecs() {
        let registry = TypeRegistry::with_builtins();
        let encoded = registry.encode_param(&Value::Null, 23, PgFormat::Binary).unwrap();
        assert!(encoded.is_null());
        assert_eq!(crate::ext::BindParams::size(&encoded), -1);
        assert_eq!(registry.decode(None, 23, PgFormat::Binary).unwrap(), Value::Null);
    }

    #[test]
    fn unknown_oid_fails() {
        let registry = TypeRegistry::with_builtins();
        let err = registry.decode(Some(Bytes::from_static(b"x")), 999_999, PgFormat::Text);
        assert!(matches!(err, Err(CodecError::UnsupportedType { oid: 999_999 })));

        let err = registry.encode_param(&Value::Int4(1), 999_999, PgFormat::Text);
        assert!(matches!(err, Err(CodecError::UnsupportedType { oid: 999_999 })));
    }

    #[test]
    fn type_mismatch_fails() {
        let registry = TypeRegistry::with_builtins();
        let err = registry.encode_param(&Value::Text(ByteStr::from_static("nope")), 23, PgFormat::Binary);
        assert!(matches!(err, Err(CodecError::TypeMismatch { oid: 23 })));
    }

    #[test]
    fn unknown_oid_prefers_text() {
        let registry = TypeRegistry::with_builtins();
        assert_eq!(registry.prefer(999_999), PgFormat::Text);
        assert_eq!(registry.prefer(23), PgFormat::Binary);
    }

    #[test]
    fn malformed_binary_fails() {
        let registry = TypeRegistry::with_builtins();
        let err = registry.decode(Some(Bytes::from_static(&[1, 2])), 23, PgFormat::Binary);
        assert!(matches!(err, Err(CodecError::Malformed { oid: 23, .. })));
    }

    /// An `inet`-ish text-only codec standing in for an external extension.
    struct UpperCodec;

    impl TypeCodec for UpperCodec {
        fn oid(&self) -> Oid {
            869
        }

        fn supports_binary(&self) -> bool {
            false
        }

        fn encode(&self, value: &Value, _: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
            match value {
                Value::Text(v) => {
                    buf.extend_from_slice(v.as_bytes());
                    Ok(())
                },
                _ => Err(CodecError::TypeMismatch { oid: 869 }),
            }
        }

        fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
            let text = ByteStr::from_utf8(raw).map_err(|_| CodecError::Malformed { oid: 869, format })?;
            Ok(Value::Text(text))
        }
    }

    #[test]
    fn external_codec_extends_a_registry() {
        let mut registry = TypeRegistry::with_builtins();
        assert!(!registry.contains(869));

        registry.insert(Box::new(UpperCodec));
        assert!(registry.contains(869));
        // text-only types fall back to the text format
        assert_eq!(registry.prefer(869), PgFormat::Text);

        let raw = Some(Bytes::from_static(b"127.0.0.1/32"));
        let value = registry.decode(raw, 869, PgFormat::Text).unwrap();
        assert_eq!(value.as_str(), Some("127.0.0.1/32"));
    }

    #[test]
    fn register_fails_after_freeze() {
        // the first use of the process-wide registry freezes the codec set
        let _ = global();
        assert!(register(UpperCodec).is_err());
    }
}
