//! Native values, text-protocol decoders and SQL literal escaping
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::charset;
use crate::constants::{column_flag, type_};
use crate::error::{Error, Result};

/// A column definition read from a result set header
#[derive(Debug, Clone)]
pub struct Column {
    /// Catalog, always `def` on current servers
    pub catalog: String,
    /// Schema the column comes from
    pub db: String,
    /// Table alias
    pub table: String,
    /// Real table name
    pub org_table: String,
    /// Column alias, the key used by dict cursors
    pub name: String,
    /// Real column name
    pub org_name: String,
    /// Collation id of the value
    pub charset_id: u16,
    /// Maximum display length
    pub length: u32,
    /// Field type, see [crate::constants::type_]
    pub type_code: u8,
    /// Field flags, see [crate::constants::column_flag]
    pub flags: u16,
    /// Number of decimals for numeric columns
    pub decimals: u8,
}

impl Column {
    /// True when values of this column are raw bytes rather than text
    pub fn is_binary(&self) -> bool {
        self.charset_id == charset::BINARY_ID
    }

    /// True when the column is unsigned
    pub fn is_unsigned(&self) -> bool {
        self.flags & column_flag::UNSIGNED != 0
    }
}

/// A calendar date as stored in a `DATE` column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Date {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl std::fmt::Display for Date {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// A signed duration as stored in a `TIME` column
///
/// Hours are not limited to a day; the server allows up to 838:59:59.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Time {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub microseconds: u32,
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negative {
            f.write_char('-')?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        if self.microseconds != 0 {
            write!(f, ".{:06}", self.microseconds)?;
        }
        Ok(())
    }
}

/// A point in time as stored in `DATETIME` and `TIMESTAMP` columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub microsecond: u32,
}

impl std::fmt::Display for DateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )?;
        if self.microsecond != 0 {
            write!(f, ".{:06}", self.microsecond)?;
        }
        Ok(())
    }
}

/// An exact numeric kept as its decimal text representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decimal(pub String);

impl Decimal {
    /// Construct a new instance
    pub fn new(v: impl Into<String>) -> Self {
        Decimal(v.into())
    }

    /// Return a reference to the contained string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A JSON document kept as its serialized text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json(pub String);

impl Json {
    /// Construct a new instance
    pub fn new(v: impl Into<String>) -> Self {
        Json(v.into())
    }

    /// Return a reference to the contained string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A value decoded from, or bound into, a query
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Double(f64),
    Bytes(Vec<u8>),
    Str(String),
    Date(Date),
    Time(Time),
    DateTime(DateTime),
    Decimal(Decimal),
    Json(Json),
}

/// Decode one raw text-protocol field of the given column into a value
pub type Decoder = fn(&Column, &[u8]) -> Result<Value>;

/// Map from field type code to decoder
///
/// Callers override single entries (or the whole table) through the `conv`
/// connect option; unknown type codes fall back to a string or byte value
/// depending on the column collation.
pub type Converters = HashMap<u8, Decoder>;

/// The decoder table used when the caller does not supply one
pub fn default_converters() -> Converters {
    let mut m: Converters = HashMap::new();
    for t in [type_::TINY, type_::SHORT, type_::LONG, type_::INT24, type_::LONG_LONG] {
        m.insert(t, decode_int);
    }
    m.insert(type_::YEAR, decode_int);
    m.insert(type_::FLOAT, decode_float);
    m.insert(type_::DOUBLE, decode_float);
    m.insert(type_::DECIMAL, decode_decimal);
    m.insert(type_::NEW_DECIMAL, decode_decimal);
    m.insert(type_::DATE, decode_date);
    m.insert(type_::NEWDATE, decode_date);
    m.insert(type_::TIME, decode_time);
    m.insert(type_::DATETIME, decode_datetime);
    m.insert(type_::TIMESTAMP, decode_datetime);
    m.insert(type_::JSON, decode_json);
    m.insert(type_::BIT, decode_bytes);
    m.insert(type_::GEOMETRY, decode_bytes);
    m
}

/// Decode a field through the converter table
pub(crate) fn decode_field(conv: &Converters, column: &Column, raw: Option<&[u8]>) -> Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Null);
    };
    match conv.get(&column.type_code) {
        Some(decoder) => decoder(column, raw),
        None => decode_string(column, raw),
    }
}

fn invalid(what: &str, raw: &[u8]) -> Error {
    Error::data(format!(
        "invalid {what} literal {:?}",
        String::from_utf8_lossy(raw)
    ))
}

/// Decode an integer column, honoring the unsigned flag
pub fn decode_int(column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("integer", raw))?;
    if column.is_unsigned() {
        text.parse().map(Value::UInt).map_err(|_| invalid("integer", raw))
    } else {
        text.parse().map(Value::Int).map_err(|_| invalid("integer", raw))
    }
}

/// Decode a FLOAT or DOUBLE column
pub fn decode_float(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("float", raw))?;
    text.parse().map(Value::Double).map_err(|_| invalid("float", raw))
}

/// Decode a DECIMAL column, keeping the exact text
pub fn decode_decimal(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("decimal", raw))?;
    Ok(Value::Decimal(Decimal::new(text)))
}

/// Split a fractional-seconds suffix and scale it to microseconds
fn parse_micros(frac: &str) -> Option<u32> {
    if frac.is_empty() || frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let micros: u32 = frac.parse().ok()?;
    Some(micros * 10u32.pow(6 - frac.len() as u32))
}

fn parse_date_part(text: &str) -> Option<Date> {
    let mut it = text.splitn(3, '-');
    let year = it.next()?.parse().ok()?;
    let month = it.next()?.parse().ok()?;
    let day = it.next()?.parse().ok()?;
    Some(Date { year, month, day })
}

/// Decode a DATE column; the zero date decodes as NULL
pub fn decode_date(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("date", raw))?;
    if text.starts_with("0000-00-00") {
        return Ok(Value::Null);
    }
    match parse_date_part(text) {
        Some(d) if d.month >= 1 && d.month <= 12 && d.day >= 1 && d.day <= 31 => {
            Ok(Value::Date(d))
        }
        _ => Err(invalid("date", raw)),
    }
}

/// Decode a TIME column into a signed duration
pub fn decode_time(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("time", raw))?;
    let (negative, text) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (hms, frac) = match text.split_once('.') {
        Some((h, f)) => (h, Some(f)),
        None => (text, None),
    };
    let mut it = hms.splitn(3, ':');
    let parsed = (|| {
        let hours = it.next()?.parse().ok()?;
        let minutes: u8 = it.next()?.parse().ok()?;
        let seconds: u8 = it.next()?.parse().ok()?;
        let microseconds = match frac {
            Some(f) => parse_micros(f)?,
            None => 0,
        };
        if minutes > 59 || seconds > 59 {
            return None;
        }
        Some(Time {
            negative,
            hours,
            minutes,
            seconds,
            microseconds,
        })
    })();
    match parsed {
        Some(t) => Ok(Value::Time(t)),
        None => Err(invalid("time", raw)),
    }
}

/// Decode a DATETIME or TIMESTAMP column; the zero timestamp decodes as NULL
pub fn decode_datetime(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("datetime", raw))?;
    if text.starts_with("0000-00-00") {
        return Ok(Value::Null);
    }
    let parsed = (|| {
        let (date, time) = text.split_once(' ')?;
        let d = parse_date_part(date)?;
        let (hms, frac) = match time.split_once('.') {
            Some((h, f)) => (h, Some(f)),
            None => (time, None),
        };
        let mut it = hms.splitn(3, ':');
        let hour: u8 = it.next()?.parse().ok()?;
        let minute: u8 = it.next()?.parse().ok()?;
        let second: u8 = it.next()?.parse().ok()?;
        let microsecond = match frac {
            Some(f) => parse_micros(f)?,
            None => 0,
        };
        if hour > 23 || minute > 59 || second > 59 {
            return None;
        }
        Some(DateTime {
            year: d.year,
            month: d.month,
            day: d.day,
            hour,
            minute,
            second,
            microsecond,
        })
    })();
    match parsed {
        Some(dt) => Ok(Value::DateTime(dt)),
        None => Err(invalid("datetime", raw)),
    }
}

/// Decode a JSON column, keeping the serialized document
pub fn decode_json(_column: &Column, raw: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(raw).map_err(|_| invalid("json", raw))?;
    Ok(Value::Json(Json::new(text)))
}

/// Decode a column as raw bytes
pub fn decode_bytes(_column: &Column, raw: &[u8]) -> Result<Value> {
    Ok(Value::Bytes(raw.to_vec()))
}

/// Decode a string-ish column by its collation: binary columns keep bytes
pub fn decode_string(column: &Column, raw: &[u8]) -> Result<Value> {
    if column.is_binary() {
        Ok(Value::Bytes(raw.to_vec()))
    } else {
        Ok(Value::Str(String::from_utf8_lossy(raw).into_owned()))
    }
}

/// Append the escaped content of a string, without the surrounding quotes
///
/// When the `NO_BACKSLASH_ESCAPES` sql mode is active only the quote
/// character itself is doubled; otherwise the usual backslash escapes are
/// produced.
fn escape_bytes_inner(bytes: &[u8], no_backslash: bool, out: &mut Vec<u8>) {
    for &b in bytes {
        if no_backslash {
            match b {
                b'\'' => out.extend_from_slice(b"''"),
                _ => out.push(b),
            }
            continue;
        }
        match b {
            0 => out.extend_from_slice(b"\\0"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            0x1a => out.extend_from_slice(b"\\Z"),
            b'\'' => out.extend_from_slice(b"\\'"),
            b'"' => out.extend_from_slice(b"\\\""),
            b'\\' => out.extend_from_slice(b"\\\\"),
            _ => out.push(b),
        }
    }
}

/// Append a quoted, escaped string literal
pub fn escape_str(s: &str, no_backslash: bool, out: &mut Vec<u8>) {
    out.push(b'\'');
    escape_bytes_inner(s.as_bytes(), no_backslash, out);
    out.push(b'\'');
}

/// Append a value rendered as a SQL literal
pub fn escape_value(v: &Value, no_backslash: bool, out: &mut Vec<u8>) -> Result<()> {
    match v {
        Value::Null => out.extend_from_slice(b"NULL"),
        Value::Int(v) => {
            let mut s = String::new();
            let _ = write!(s, "{v}");
            out.extend_from_slice(s.as_bytes());
        }
        Value::UInt(v) => {
            let mut s = String::new();
            let _ = write!(s, "{v}");
            out.extend_from_slice(s.as_bytes());
        }
        Value::Double(v) => {
            if !v.is_finite() {
                return Err(Error::programming(format!(
                    "cannot render {v} as a SQL literal"
                )));
            }
            let mut s = String::new();
            let _ = write!(s, "{v:?}");
            out.extend_from_slice(s.as_bytes());
        }
        Value::Str(s) => escape_str(s, no_backslash, out),
        Value::Bytes(b) => {
            out.extend_from_slice(b"_binary'");
            escape_bytes_inner(b, no_backslash, out);
            out.push(b'\'');
        }
        Value::Date(d) => escape_str(&d.to_string(), no_backslash, out),
        Value::Time(t) => escape_str(&t.to_string(), no_backslash, out),
        Value::DateTime(dt) => escape_str(&dt.to_string(), no_backslash, out),
        Value::Decimal(d) => out.extend_from_slice(d.as_str().as_bytes()),
        Value::Json(j) => escape_str(j.as_str(), no_backslash, out),
    }
    Ok(())
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })+
    };
}

impl_from_int!(i8, i16, i32, i64);

macro_rules! impl_from_uint {
    ($($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::UInt(v as u64)
            }
        })+
    };
}

impl_from_uint!(u8, u16, u32, u64);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Double(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Date> for Value {
    fn from(v: Date) -> Self {
        Value::Date(v)
    }
}

impl From<Time> for Value {
    fn from(v: Time) -> Self {
        Value::Time(v)
    }
}

impl From<DateTime> for Value {
    fn from(v: DateTime) -> Self {
        Value::DateTime(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Value::Decimal(v)
    }
}

impl From<Json> for Value {
    fn from(v: Json) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(type_code: u8, flags: u16, charset_id: u16) -> Column {
        Column {
            catalog: "def".into(),
            db: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: "c".into(),
            org_name: "c".into(),
            charset_id,
            length: 255,
            type_code,
            flags,
            decimals: 0,
        }
    }

    fn escaped(v: &Value, no_backslash: bool) -> String {
        let mut out = Vec::new();
        escape_value(v, no_backslash, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn escape_strings() {
        assert_eq!(escaped(&Value::from("plain"), false), "'plain'");
        assert_eq!(escaped(&Value::from("a'b"), false), "'a\\'b'");
        assert_eq!(escaped(&Value::from("a'b"), true), "'a''b'");
        assert_eq!(escaped(&Value::from("line\nbreak"), false), "'line\\nbreak'");
        assert_eq!(escaped(&Value::from("back\\slash"), true), "'back\\slash'");
    }

    #[test]
    fn escape_scalars() {
        assert_eq!(escaped(&Value::Null, false), "NULL");
        assert_eq!(escaped(&Value::from(-7i64), false), "-7");
        assert_eq!(escaped(&Value::from(7u64), false), "7");
        assert_eq!(escaped(&Value::from(1.5f64), false), "1.5");
        assert_eq!(escaped(&Value::from(1.0f64), false), "1.0");
        assert_eq!(escaped(&Value::from(true), false), "1");
        assert_eq!(escaped(&Value::Decimal(Decimal::new("12.50")), false), "12.50");
        let mut out = Vec::new();
        assert!(escape_value(&Value::Double(f64::NAN), false, &mut out).is_err());
    }

    #[test]
    fn escape_bytes_and_temporal() {
        assert_eq!(
            escaped(&Value::from(&b"a\x00b"[..]), false),
            "_binary'a\\0b'"
        );
        let d = Date { year: 2024, month: 2, day: 29 };
        assert_eq!(escaped(&Value::from(d), false), "'2024-02-29'");
        let t = Time { negative: true, hours: 101, minutes: 2, seconds: 3, microseconds: 500 };
        assert_eq!(escaped(&Value::from(t), false), "'-101:02:03.000500'");
        let dt = DateTime { year: 2024, month: 1, day: 2, hour: 3, minute: 4, second: 5, microsecond: 0 };
        assert_eq!(escaped(&Value::from(dt), false), "'2024-01-02 03:04:05'");
    }

    #[test]
    fn decode_integers() {
        let c = column(type_::LONG, 0, 63);
        assert_eq!(decode_int(&c, b"-12").unwrap(), Value::Int(-12));
        let c = column(type_::LONG_LONG, column_flag::UNSIGNED, 63);
        assert_eq!(
            decode_int(&c, b"18446744073709551615").unwrap(),
            Value::UInt(u64::MAX)
        );
        assert!(decode_int(&c, b"x").is_err());
    }

    #[test]
    fn decode_temporal() {
        let c = column(type_::DATE, 0, 63);
        assert_eq!(
            decode_date(&c, b"2024-02-29").unwrap(),
            Value::Date(Date { year: 2024, month: 2, day: 29 })
        );
        assert_eq!(decode_date(&c, b"0000-00-00").unwrap(), Value::Null);
        assert!(decode_date(&c, b"2024-13-01").is_err());

        let c = column(type_::TIME, 0, 63);
        assert_eq!(
            decode_time(&c, b"-34:22:11.5").unwrap(),
            Value::Time(Time {
                negative: true,
                hours: 34,
                minutes: 22,
                seconds: 11,
                microseconds: 500_000,
            })
        );

        let c = column(type_::DATETIME, 0, 63);
        assert_eq!(
            decode_datetime(&c, b"2024-01-02 03:04:05.000001").unwrap(),
            Value::DateTime(DateTime {
                year: 2024,
                month: 1,
                day: 2,
                hour: 3,
                minute: 4,
                second: 5,
                microsecond: 1,
            })
        );
        assert_eq!(
            decode_datetime(&c, b"0000-00-00 00:00:00").unwrap(),
            Value::Null
        );
    }

    #[test]
    fn fallback_by_charset() {
        let conv = default_converters();
        let c = column(type_::VAR_STRING, 0, 45);
        assert_eq!(
            decode_field(&conv, &c, Some(b"hi")).unwrap(),
            Value::Str("hi".into())
        );
        let c = column(type_::VAR_STRING, 0, 63);
        assert_eq!(
            decode_field(&conv, &c, Some(b"\xFF\x00")).unwrap(),
            Value::Bytes(vec![0xFF, 0x00])
        );
        assert_eq!(decode_field(&conv, &c, None).unwrap(), Value::Null);
    }

    #[test]
    fn converter_override() {
        let mut conv = default_converters();
        conv.insert(type_::JSON, |_c, _raw| Ok(Value::Str("override".into())));
        let c = column(type_::JSON, 0, 45);
        assert_eq!(
            decode_field(&conv, &c, Some(b"{}")).unwrap(),
            Value::Str("override".into())
        );
    }
}
