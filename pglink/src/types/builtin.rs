//! Builtin codecs for the types every session needs.
use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecError, Oid, PgFormat, TypeCodec, TypeRegistry, Value};
use crate::common::ByteStr;

pub(super) fn install(registry: &mut TypeRegistry) {
    registry.insert(Box::new(BoolCodec));
    registry.insert(Box::new(Int2Codec));
    registry.insert(Box::new(Int4Codec));
    registry.insert(Box::new(Int8Codec));
    registry.insert(Box::new(Float4Codec));
    registry.insert(Box::new(Float8Codec));
    registry.insert(Box::new(ByteaCodec));
    // `text`, `varchar` and `bpchar` share the representation
    registry.insert(Box::new(TextCodec { oid: 25 }));
    registry.insert(Box::new(TextCodec { oid: 1043 }));
    registry.insert(Box::new(TextCodec { oid: 1042 }));
}

fn malformed(oid: Oid, format: PgFormat) -> CodecError {
    CodecError::Malformed { oid, format }
}

fn utf8(raw: &Bytes, oid: Oid, format: PgFormat) -> Result<&str, CodecError> {
    std::str::from_utf8(raw).map_err(|_| malformed(oid, format))
}

macro_rules! int_codec {
    ($(
        $(#[$doc:meta])* struct $name:ident($ty:ty, $variant:ident, $oid:literal);
    )*) => {$(
        $(#[$doc])*
        struct $name;

        impl TypeCodec for $name {
            fn oid(&self) -> Oid {
                $oid
            }

            fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
                let Value::$variant(v) = value else {
                    return Err(CodecError::TypeMismatch { oid: $oid });
                };
                match format {
                    PgFormat::Binary => buf.put_slice(&v.to_be_bytes()),
                    PgFormat::Text => buf.put_slice(itoa::Buffer::new().format(*v).as_bytes()),
                }
                Ok(())
            }

            fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
                let v = match format {
                    PgFormat::Binary => {
                        let Ok(be) = <[u8; size_of::<$ty>()]>::try_from(raw.as_ref()) else {
                            return Err(malformed($oid, format));
                        };
                        <$ty>::from_be_bytes(be)
                    },
                    PgFormat::Text => utf8(&raw, $oid, format)?
                        .parse()
                        .map_err(|_| malformed($oid, format))?,
                };
                Ok(Value::$variant(v))
            }
        }
    )*};
}

int_codec! {
    /// `int2` -32 thousand to 32 thousand, 2-byte storage
    struct Int2Codec(i16, Int2, 21);
    /// `int4` -2 billion to 2 billion integer, 4-byte storage
    struct Int4Codec(i32, Int4, 23);
    /// `int8` ~18 digit integer, 8-byte storage
    struct Int8Codec(i64, Int8, 20);
}

macro_rules! float_codec {
    ($(
        $(#[$doc:meta])* struct $name:ident($ty:ty, $variant:ident, $oid:literal);
    )*) => {$(
        $(#[$doc])*
        struct $name;

        impl TypeCodec for $name {
            fn oid(&self) -> Oid {
                $oid
            }

            fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
                let Value::$variant(v) = value else {
                    return Err(CodecError::TypeMismatch { oid: $oid });
                };
                match format {
                    PgFormat::Binary => buf.put_slice(&v.to_be_bytes()),
                    // `Display` for floats is the shortest string that parses back exactly
                    PgFormat::Text => buf.put_slice(v.to_string().as_bytes()),
                }
                Ok(())
            }

            fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
                let v = match format {
                    PgFormat::Binary => {
                        let Ok(be) = <[u8; size_of::<$ty>()]>::try_from(raw.as_ref()) else {
                            return Err(malformed($oid, format));
                        };
                        <$ty>::from_be_bytes(be)
                    },
                    PgFormat::Text => utf8(&raw, $oid, format)?
                        .parse()
                        .map_err(|_| malformed($oid, format))?,
                };
                Ok(Value::$variant(v))
            }
        }
    )*};
}

float_codec! {
    /// `float4` single-precision floating point number, 4-byte storage
    struct Float4Codec(f32, Float4, 700);
    /// `float8` double-precision floating point number, 8-byte storage
    struct Float8Codec(f64, Float8, 701);
}

/// `bool`, 1-byte storage, text representation `t`/`f`
struct BoolCodec;

impl TypeCodec for BoolCodec {
    fn oid(&self) -> Oid {
        16
    }

    fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Bool(v) = value else {
            return Err(CodecError::TypeMismatch { oid: 16 });
        };
        match format {
            PgFormat::Binary => buf.put_u8(*v as u8),
            PgFormat::Text => buf.put_u8(if *v { b't' } else { b'f' }),
        }
        Ok(())
    }

    fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
        let v = match (format, raw.as_ref()) {
            (PgFormat::Binary, [0]) => false,
            (PgFormat::Binary, [1]) => true,
            (PgFormat::Text, b"f") => false,
            (PgFormat::Text, b"t") => true,
            _ => return Err(malformed(16, format)),
        };
        Ok(Value::Bool(v))
    }
}

/// `text` and friends, raw utf8 in both formats
struct TextCodec {
    oid: Oid,
}

impl TypeCodec for TextCodec {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn encode(&self, value: &Value, _: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Text(v) = value else {
            return Err(CodecError::TypeMismatch { oid: self.oid });
        };
        buf.put_slice(v.as_bytes());
        Ok(())
    }

    fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
        let v = ByteStr::from_utf8(raw).map_err(|_| malformed(self.oid, format))?;
        Ok(Value::Text(v))
    }
}

/// `bytea`, raw in binary, `\x` hex in text
struct ByteaCodec;

impl TypeCodec for ByteaCodec {
    fn oid(&self) -> Oid {
        17
    }

    fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Bytea(v) = value else {
            return Err(CodecError::TypeMismatch { oid: 17 });
        };
        match format {
            PgFormat::Binary => buf.put_slice(v),
            PgFormat::Text => {
                buf.put_slice(b"\\x");
                for byte in v.iter() {
                    const HEX: &[u8; 16] = b"0123456789abcdef";
                    buf.put_u8(HEX[(byte >> 4) as usize]);
                    buf.put_u8(HEX[(byte & 0xf) as usize]);
                }
            },
        }
        Ok(())
    }

    fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
        match format {
            PgFormat::Binary => Ok(Value::Bytea(raw)),
            PgFormat::Text => {
                let hex = raw
                    .strip_prefix(b"\\x")
                    .ok_or(malformed(17, format))?;
                if hex.len() % 2 != 0 {
                    return Err(malformed(17, format));
                }
                let mut out = BytesMut::with_capacity(hex.len() / 2);
                for pair in hex.chunks_exact(2) {
                    let digit = |b: u8| -> Result<u8, CodecError> {
                        match b {
                            b'0'..=b'9' => Ok(b - b'0'),
                            b'a'..=b'f' => Ok(b - b'a' + 10),
                            b'A'..=b'F' => Ok(b - b'A' + 10),
                            _ => Err(malformed(17, format)),
                        }
                    };
                    out.put_u8((digit(pair[0])? << 4) | digit(pair[1])?);
                }
                Ok(Value::Bytea(out.freeze()))
            },
        }
    }
}
