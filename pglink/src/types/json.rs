//! `serde` integration: codecs for the `json` and `jsonb` types, and the
//! [`Json`] wrapper for arbitrary serializable values.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CodecError, FromValue, Oid, PgFormat, TypeCodec, TypeRegistry, Value};

const JSON: Oid = 114;
const JSONB: Oid = 3802;

pub(super) fn install(registry: &mut TypeRegistry) {
    registry.insert(Box::new(JsonCodec { oid: JSON }));
    registry.insert(Box::new(JsonCodec { oid: JSONB }));
}

/// `json` (stored as text) and `jsonb` (binary JSON).
///
/// The jsonb binary representation is a one byte version number, currently 1,
/// followed by the json text.
struct JsonCodec {
    oid: Oid,
}

impl TypeCodec for JsonCodec {
    fn oid(&self) -> Oid {
        self.oid
    }

    fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Json(v) = value else {
            return Err(CodecError::TypeMismatch { oid: self.oid });
        };
        if self.oid == JSONB && format == PgFormat::Binary {
            buf.put_u8(1);
        }
        let text = serde_json::to_vec(v)
            .map_err(|_| CodecError::Malformed { oid: self.oid, format })?;
        buf.put_slice(&text);
        Ok(())
    }

    fn decode(&self, mut raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
        if self.oid == JSONB && format == PgFormat::Binary {
            match raw.try_get_u8() {
                Ok(1) => { },
                _ => return Err(CodecError::Malformed { oid: self.oid, format }),
            }
        }
        let v = serde_json::from_slice(&raw)
            .map_err(|_| CodecError::Malformed { oid: self.oid, format })?;
        Ok(Value::Json(v))
    }
}

/// Bind or read any serde type as a `json`/`jsonb` column.
///
/// ```ignore
/// let portal = conn.bind(&stmt, &[Json(payload).try_into_value()?]).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: serde::Serialize> Json<T> {
    /// Serialize into a bindable [`Value`].
    pub fn try_into_value(self) -> Result<Value, CodecError> {
        serde_json::to_value(self.0)
            .map(Value::Json)
            .map_err(|_| CodecError::TypeMismatch { oid: JSONB })
    }
}

impl<T: serde::de::DeserializeOwned> FromValue for Json<T> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Json(v) => serde_json::from_value(v).ok().map(Json),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn jsonb_binary_is_versioned() {
        let codec = JsonCodec { oid: JSONB };
        let value = Value::Json(serde_json::json!({"a": [1, 2, 3]}));

        let mut buf = BytesMut::new();
        codec.encode(&value, PgFormat::Binary, &mut buf).unwrap();
        assert_eq!(buf[0], 1);

        let back = codec.decode(buf.freeze(), PgFormat::Binary).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn json_text_roundtrip() {
        let codec = JsonCodec { oid: JSON };
        let value = Value::Json(serde_json::json!(["x", null, -1.5]));

        let mut buf = BytesMut::new();
        codec.encode(&value, PgFormat::Text, &mut buf).unwrap();
        let back = codec.decode(buf.freeze(), PgFormat::Text).unwrap();
        assert_eq!(back, value);
    }
}
