//! `time` integration: codec for the `timestamp` type.
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write;
use time::{Date, Duration, Month, PrimitiveDateTime, Time};

use super::{CodecError, Oid, PgFormat, TypeCodec, TypeRegistry, Value};

const TIMESTAMP: Oid = 1114;

pub(super) fn install(registry: &mut TypeRegistry) {
    registry.insert(Box::new(TimestampCodec));
}

/// The postgres timestamp epoch, `2000-01-01 00:00:00`.
fn pg_epoch() -> PrimitiveDateTime {
    let date = Date::from_calendar_date(2000, Month::January, 1).expect("valid epoch date");
    PrimitiveDateTime::new(date, Time::MIDNIGHT)
}

fn malformed() -> CodecError {
    CodecError::Malformed { oid: TIMESTAMP, format: PgFormat::Text }
}

/// `timestamp`, date and time without time zone.
///
/// Binary representation is microseconds since the postgres epoch,
/// text representation is `YYYY-MM-DD HH:MM:SS[.ffffff]`.
struct TimestampCodec;

impl TypeCodec for TimestampCodec {
    fn oid(&self) -> Oid {
        TIMESTAMP
    }

    fn encode(&self, value: &Value, format: PgFormat, buf: &mut BytesMut) -> Result<(), CodecError> {
        let Value::Timestamp(v) = value else {
            return Err(CodecError::TypeMismatch { oid: TIMESTAMP });
        };
        match format {
            PgFormat::Binary => {
                let micros = (*v - pg_epoch()).whole_microseconds();
                let micros = i64::try_from(micros)
                    .map_err(|_| CodecError::Malformed { oid: TIMESTAMP, format })?;
                buf.put_i64(micros);
            },
            PgFormat::Text => {
                let mut out = String::new();
                write!(
                    out,
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                    v.year(),
                    u8::from(v.month()),
                    v.day(),
                    v.hour(),
                    v.minute(),
                    v.second(),
                )
                .expect("infallible write to String");
                if v.microsecond() != 0 {
                    write!(out, ".{:06}", v.microsecond()).expect("infallible write to String");
                    while out.ends_with('0') {
                        out.pop();
                    }
                }
                buf.put_slice(out.as_bytes());
            },
        }
        Ok(())
    }

    fn decode(&self, raw: Bytes, format: PgFormat) -> Result<Value, CodecError> {
        let v = match format {
            PgFormat::Binary => {
                let Ok(be) = <[u8; 8]>::try_from(raw.as_ref()) else {
                    return Err(CodecError::Malformed { oid: TIMESTAMP, format });
                };
                let micros = i64::from_be_bytes(be);
                pg_epoch()
                    .checked_add(Duration::microseconds(micros))
                    .ok_or(CodecError::Malformed { oid: TIMESTAMP, format })?
            },
            PgFormat::Text => parse_text(std::str::from_utf8(&raw).map_err(|_| malformed())?)?,
        };
        Ok(Value::Timestamp(v))
    }
}

fn parse_text(text: &str) -> Result<PrimitiveDateTime, CodecError> {
    let (date, time) = text.split_once(' ').ok_or(malformed())?;

    let mut parts = date.splitn(3, '-');
    let mut next = || parts.next().ok_or(malformed());
    let year: i32 = next()?.parse().map_err(|_| malformed())?;
    let month: u8 = next()?.parse().map_err(|_| malformed())?;
    let day: u8 = next()?.parse().map_err(|_| malformed())?;

    let (hms, frac) = match time.split_once('.') {
        Some((hms, frac)) => (hms, Some(frac)),
        None => (time, None),
    };
    let mut parts = hms.splitn(3, ':');
    let mut next = || parts.next().ok_or(malformed());
    let hour: u8 = next()?.parse().map_err(|_| malformed())?;
    let minute: u8 = next()?.parse().map_err(|_| malformed())?;
    let second: u8 = next()?.parse().map_err(|_| malformed())?;

    let micro: u32 = match frac {
        Some(frac) if frac.len() <= 6 && !frac.is_empty() => {
            let parsed: u32 = frac.parse().map_err(|_| malformed())?;
            parsed * 10u32.pow(6 - frac.len() as u32)
        },
        Some(_) => return Err(malformed()),
        None => 0,
    };

    let month = Month::try_from(month).map_err(|_| malformed())?;
    let date = Date::from_calendar_date(year, month, day).map_err(|_| malformed())?;
    let time = Time::from_hms_micro(hour, minute, second, micro).map_err(|_| malformed())?;
    Ok(PrimitiveDateTime::new(date, time))
}

#[cfg(test)]
mod test {
    use super::*;

    fn codec_roundtrip(v: PrimitiveDateTime, format: PgFormat) {
        let codec = TimestampCodec;
        let mut buf = BytesMut::new();
        codec.encode(&Value::Timestamp(v), format, &mut buf).unwrap();
        let back = codec.decode(buf.freeze(), format).unwrap();
        assert_eq!(back, Value::Timestamp(v));
    }

    #[test]
    fn roundtrip() {
        let date = Date::from_calendar_date(2024, Month::October, 19).unwrap();
        let time = Time::from_hms_micro(10, 23, 54, 123_456).unwrap();
        let v = PrimitiveDateTime::new(date, time);
        codec_roundtrip(v, PgFormat::Binary);
        codec_roundtrip(v, PgFormat::Text);
    }

    #[test]
    fn text_without_fraction() {
        let v = parse_text("1999-12-31 23:59:59").unwrap();
        assert_eq!(v.year(), 1999);
        assert_eq!(v.microsecond(), 0);
    }

    #[test]
    fn epoch_is_binary_zero() {
        let codec = TimestampCodec;
        let mut buf = BytesMut::new();
        codec.encode(&Value::Timestamp(pg_epoch()), PgFormat::Binary, &mut buf).unwrap();
        assert_eq!(buf.as_ref(), &0i64.to_be_bytes());
    }
}
