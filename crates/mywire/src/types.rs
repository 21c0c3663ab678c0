//! Column types and value conversion.
//!
//! Text-protocol rows carry every value as a string; binary-protocol rows
//! (prepared statements) use a per-type encoding. Both decode into
//! [`Value`], driven by the column's [`FieldType`], flags and charset.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::{Date, DateTime, Error, ProgrammingErrorKind, Result, Time, Value};

use crate::protocol::{PacketReader, PacketWriter, charset};

/// Field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Parse a type code; unknown codes are treated as strings.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_blob(self) -> bool {
        matches!(
            self,
            FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
                | FieldType::Geometry
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
}

/// Column definition from a result set or a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    /// Column name (or alias)
    pub name: String,
    pub org_name: String,
    /// Collation id; 63 means binary
    pub charset: u16,
    /// Display length
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Minimal definition, mostly useful for tests and synthetic results.
    pub fn new(name: impl Into<String>, column_type: FieldType) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: name.into(),
            org_name: String::new(),
            charset: u16::from(charset::UTF8MB4_GENERAL_CI),
            column_length: 0,
            column_type,
            flags: 0,
            decimals: 0,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }

    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Binary collation: string-ish columns decode to bytes.
    pub fn is_binary(&self) -> bool {
        self.charset == u16::from(charset::BINARY)
    }
}

/// Decode a text-protocol column value.
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    let text = || String::from_utf8_lossy(data).into_owned();

    match column.column_type {
        FieldType::Null => Value::Null,
        t if t.is_integer() => {
            let s = String::from_utf8_lossy(data);
            let parsed = if column.is_unsigned() {
                s.parse::<u64>().ok().map(Value::UInt)
            } else {
                s.parse::<i64>().ok().map(Value::Int)
            };
            parsed.unwrap_or_else(|| Value::Text(s.into_owned()))
        }
        FieldType::Float => String::from_utf8_lossy(data)
            .parse::<f32>()
            .map_or_else(|_| Value::Text(text()), Value::Float),
        FieldType::Double => String::from_utf8_lossy(data)
            .parse::<f64>()
            .map_or_else(|_| Value::Text(text()), Value::Double),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text()),
        FieldType::Date | FieldType::NewDate => {
            let s = text();
            Date::parse(&s).map_or(Value::Text(s), Value::Date)
        }
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => {
            let s = text();
            DateTime::parse(&s).map_or(Value::Text(s), Value::DateTime)
        }
        FieldType::Time | FieldType::Time2 => {
            let s = text();
            Time::parse(&s).map_or(Value::Text(s), Value::Time)
        }
        FieldType::Json => serde_json::from_slice(data).map_or_else(|_| Value::Text(text()), Value::Json),
        FieldType::Bit | FieldType::Geometry => Value::Bytes(data.to_vec()),
        _ if column.is_binary() => Value::Bytes(data.to_vec()),
        _ => Value::Text(text()),
    }
}

/// Decode one binary-protocol value, advancing the reader.
///
/// Returns `None` when the row is truncated.
pub fn decode_binary_value(column: &ColumnDef, reader: &mut PacketReader<'_>) -> Option<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        FieldType::Null => Value::Null,
        FieldType::Tiny => {
            let b = reader.read_u8()?;
            if unsigned {
                Value::UInt(u64::from(b))
            } else {
                Value::Int(i64::from(b as i8))
            }
        }
        FieldType::Short | FieldType::Year => {
            let v = reader.read_u16_le()?;
            if unsigned || column.column_type == FieldType::Year {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i16))
            }
        }
        FieldType::Long | FieldType::Int24 => {
            let v = reader.read_u32_le()?;
            if unsigned {
                Value::UInt(u64::from(v))
            } else {
                Value::Int(i64::from(v as i32))
            }
        }
        FieldType::LongLong => {
            let v = reader.read_u64_le()?;
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        FieldType::Float => Value::Float(f32::from_le_bytes(reader.read_array::<4>()?)),
        FieldType::Double => Value::Double(f64::from_le_bytes(reader.read_array::<8>()?)),
        FieldType::Date | FieldType::NewDate => Value::Date(decode_binary_datetime(reader)?.date),
        FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => Value::DateTime(decode_binary_datetime(reader)?),
        FieldType::Time | FieldType::Time2 => Value::Time(decode_binary_time(reader)?),
        _ => {
            let data = reader.read_lenenc_bytes()?;
            match column.column_type {
                FieldType::Decimal | FieldType::NewDecimal => {
                    Value::Decimal(String::from_utf8_lossy(data).into_owned())
                }
                _ => decode_text_value(column, data),
            }
        }
    };
    Some(value)
}

/// Binary DATE/DATETIME: length byte (0, 4, 7 or 11) then the components.
fn decode_binary_datetime(reader: &mut PacketReader<'_>) -> Option<DateTime> {
    let len = reader.read_u8()?;
    let mut dt = DateTime::default();
    if len >= 4 {
        dt.date = Date::new(reader.read_u16_le()?, reader.read_u8()?, reader.read_u8()?);
    }
    if len >= 7 {
        dt.hour = reader.read_u8()?;
        dt.minute = reader.read_u8()?;
        dt.second = reader.read_u8()?;
    }
    if len >= 11 {
        dt.microsecond = reader.read_u32_le()?;
    }
    Some(dt)
}

/// Binary TIME: length byte (0, 8 or 12) then sign, days, h, m, s, micros.
fn decode_binary_time(reader: &mut PacketReader<'_>) -> Option<Time> {
    let len = reader.read_u8()?;
    let mut time = Time::default();
    if len >= 8 {
        time.negative = reader.read_u8()? != 0;
        time.days = reader.read_u32_le()?;
        time.hours = reader.read_u8()?;
        time.minutes = reader.read_u8()?;
        time.seconds = reader.read_u8()?;
    }
    if len >= 12 {
        time.microseconds = reader.read_u32_le()?;
    }
    Some(time)
}

/// Wire type for a bound parameter and whether the unsigned flag is set.
pub fn value_to_field_type(value: &Value) -> (FieldType, bool) {
    match value {
        Value::Null => (FieldType::Null, false),
        Value::Bool(_) => (FieldType::Tiny, false),
        Value::Int(_) => (FieldType::LongLong, false),
        Value::UInt(_) => (FieldType::LongLong, true),
        Value::Float(_) => (FieldType::Float, false),
        Value::Double(_) => (FieldType::Double, false),
        Value::Decimal(_) => (FieldType::NewDecimal, false),
        Value::Text(_) | Value::Json(_) => (FieldType::VarString, false),
        Value::Bytes(_) => (FieldType::Blob, false),
        Value::Date(_) => (FieldType::Date, false),
        Value::Time(_) => (FieldType::Time, false),
        Value::DateTime(_) => (FieldType::DateTime, false),
    }
}

/// Binary-encode a non-NULL parameter value.
pub fn encode_binary_value(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::Int(i) => writer.write_u64_le(*i as u64),
        Value::UInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Date(d) => {
            writer.write_u8(4);
            writer.write_u16_le(d.year);
            writer.write_u8(d.month);
            writer.write_u8(d.day);
        }
        Value::DateTime(dt) => {
            let len = if dt.microsecond != 0 { 11 } else { 7 };
            writer.write_u8(len);
            writer.write_u16_le(dt.date.year);
            writer.write_u8(dt.date.month);
            writer.write_u8(dt.date.day);
            writer.write_u8(dt.hour);
            writer.write_u8(dt.minute);
            writer.write_u8(dt.second);
            if len == 11 {
                writer.write_u32_le(dt.microsecond);
            }
        }
        Value::Time(t) => {
            let len = if t.microseconds != 0 { 12 } else { 8 };
            writer.write_u8(len);
            writer.write_u8(u8::from(t.negative));
            writer.write_u32_le(t.days);
            writer.write_u8(t.hours);
            writer.write_u8(t.minutes);
            writer.write_u8(t.seconds);
            if len == 12 {
                writer.write_u32_le(t.microseconds);
            }
        }
    }
}

/// Quote and escape a string literal.
pub fn escape_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

fn escape_bytes(data: &[u8]) -> String {
    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        result.push_str(&format!("{byte:02X}"));
    }
    result.push('\'');
    result
}

/// Render a value as an SQL literal for the text protocol.
pub fn format_value_for_sql(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) if f.is_finite() => f.to_string(),
        Value::Double(f) if f.is_finite() => f.to_string(),
        Value::Float(_) | Value::Double(_) => "NULL".to_string(),
        Value::Decimal(s) => escape_string(s),
        Value::Text(s) => escape_string(s),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string()),
        Value::Date(d) => format!("'{d}'"),
        Value::Time(t) => format!("'{t}'"),
        Value::DateTime(dt) => format!("'{dt}'"),
    }
}

/// Count `?` placeholders outside quotes, backticks and comments.
pub fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    scan_placeholders(sql, |_| count += 1);
    count
}

/// Replace `?` placeholders with escaped literals.
///
/// Placeholders inside string literals, quoted identifiers and comments
/// are left alone. The number of placeholders must equal `params.len()`.
pub fn interpolate_params(sql: &str, params: &[Value]) -> Result<String> {
    let expected = count_placeholders(sql);
    if expected != params.len() {
        return Err(Error::programming(
            ProgrammingErrorKind::ParameterCount,
            format!(
                "Statement has {} placeholders but {} parameters were given",
                expected,
                params.len()
            ),
        ));
    }
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut last = 0;
    let mut next = params.iter();
    scan_placeholders(sql, |pos| {
        result.push_str(&sql[last..pos]);
        if let Some(value) = next.next() {
            result.push_str(&format_value_for_sql(value));
        }
        last = pos + 1;
    });
    result.push_str(&sql[last..]);
    Ok(result)
}

/// Call `on_placeholder` with the byte offset of each active `?`.
fn scan_placeholders(sql: &str, mut on_placeholder: impl FnMut(usize)) {
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'?' => {
                on_placeholder(i);
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b'\\' && quote != b'`' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == quote {
                        // doubled quote is an escaped quote
                        if bytes.get(i + 1) == Some(&quote) {
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'#' => i = skip_line(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(u8::is_ascii_whitespace) =>
            {
                i = skip_line(bytes, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
}

fn skip_line(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}
