//! Result set payloads: column definitions, text rows and binary rows.

use mywire_core::{Result, Value};

use super::{EofPacket, PacketReader, error_from_packet, is_eof_packet, is_err_packet, malformed};
use crate::types::{ColumnDef, FieldType, decode_binary_value, decode_text_value};

/// Parse a ColumnDefinition41 packet.
pub fn parse_column_def(data: &[u8]) -> Result<ColumnDef> {
    let mut reader = PacketReader::new(data);
    let mut field = || reader_string(&mut reader);

    let _catalog = field()?;
    let schema = field()?;
    let table = field()?;
    let org_table = field()?;
    let name = field()?;
    let org_name = field()?;

    // length of the fixed-size fields, always 0x0c
    reader
        .read_lenenc_int()
        .ok_or_else(|| malformed("column definition"))?;
    let missing = || malformed("column definition");
    let charset = reader.read_u16_le().ok_or_else(missing)?;
    let column_length = reader.read_u32_le().ok_or_else(missing)?;
    let column_type = FieldType::from_u8(reader.read_u8().ok_or_else(missing)?);
    let flags = reader.read_u16_le().ok_or_else(missing)?;
    let decimals = reader.read_u8().ok_or_else(missing)?;

    Ok(ColumnDef {
        schema,
        table,
        org_table,
        name,
        org_name,
        charset,
        column_length,
        column_type,
        flags,
        decimals,
    })
}

fn reader_string(reader: &mut PacketReader<'_>) -> Result<String> {
    reader
        .read_lenenc_string()
        .ok_or_else(|| malformed("column definition"))
}

/// One packet read while streaming rows.
#[derive(Debug, Clone, PartialEq)]
pub enum RowPacket {
    Row(Vec<Value>),
    /// End of this result set
    Eof(EofPacket),
}

/// Decode a text-protocol row packet (or the terminating EOF).
pub fn parse_text_row(data: &[u8], columns: &[ColumnDef]) -> Result<RowPacket> {
    if let Some(end) = row_terminator(data)? {
        return Ok(end);
    }

    let mut reader = PacketReader::new(data);
    let mut values = Vec::with_capacity(columns.len());
    for column in columns {
        let value = match reader.read_lenenc_nullable() {
            Some(None) => Value::Null,
            Some(Some(bytes)) => decode_text_value(column, bytes),
            None => return Err(malformed("text row")),
        };
        values.push(value);
    }
    Ok(RowPacket::Row(values))
}

/// Text row with every column left as raw bytes.
pub fn parse_raw_text_row(data: &[u8], column_count: usize) -> Result<RowPacket> {
    if let Some(end) = row_terminator(data)? {
        return Ok(end);
    }

    let mut reader = PacketReader::new(data);
    let mut values = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let value = match reader.read_lenenc_nullable() {
            Some(None) => Value::Null,
            Some(Some(bytes)) => Value::Bytes(bytes.to_vec()),
            None => return Err(malformed("text row")),
        };
        values.push(value);
    }
    Ok(RowPacket::Row(values))
}

/// Decode a binary-protocol row packet (or the terminating EOF).
///
/// Layout: 0x00 header, NULL bitmap of `(columns + 7 + 2) / 8` bytes whose
/// first two bits are reserved, then the non-NULL values.
pub fn parse_binary_row(data: &[u8], columns: &[ColumnDef]) -> Result<RowPacket> {
    if let Some(end) = row_terminator(data)? {
        return Ok(end);
    }

    let mut reader = PacketReader::new(data);
    if reader.read_u8() != Some(0x00) {
        return Err(malformed("binary row"));
    }
    let bitmap = reader
        .read_bytes((columns.len() + 7 + 2) / 8)
        .ok_or_else(|| malformed("binary row"))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
            continue;
        }
        let value =
            decode_binary_value(column, &mut reader).ok_or_else(|| malformed("binary row"))?;
        values.push(value);
    }
    Ok(RowPacket::Row(values))
}

fn row_terminator(data: &[u8]) -> Result<Option<RowPacket>> {
    if is_err_packet(data) {
        return Err(error_from_packet(data));
    }
    if is_eof_packet(data) {
        return Ok(Some(RowPacket::Eof(
            PacketReader::new(data).parse_eof_packet(),
        )));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;
    use crate::types::column_flags;

    fn column_def_packet(name: &str, ty: FieldType, flags: u16) -> Vec<u8> {
        let mut w = PacketWriter::new();
        for part in ["def", "shop", "t", "t", name, name] {
            w.write_lenenc_string(part);
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(45);
        w.write_u32_le(11);
        w.write_u8(ty as u8);
        w.write_u16_le(flags);
        w.write_u8(0);
        w.write_zeros(2);
        w.into_bytes()
    }

    #[test]
    fn parses_column_definition() {
        let col = parse_column_def(&column_def_packet("id", FieldType::Long, column_flags::UNSIGNED))
            .unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.schema, "shop");
        assert_eq!(col.column_type, FieldType::Long);
        assert!(col.is_unsigned());
        assert_eq!(col.column_length, 11);

        assert!(parse_column_def(&[0x03, b'd']).is_err());
    }

    #[test]
    fn text_row_with_null() {
        let columns = [
            ColumnDef::new("id", FieldType::LongLong),
            ColumnDef::new("name", FieldType::VarString),
        ];
        let mut w = PacketWriter::new();
        w.write_lenenc_string("42");
        w.write_u8(0xFB);
        let row = parse_text_row(w.as_bytes(), &columns).unwrap();
        assert_eq!(row, RowPacket::Row(vec![Value::Int(42), Value::Null]));

        match parse_text_row(&[0xFE, 0, 0, 0x22, 0], &columns).unwrap() {
            RowPacket::Eof(eof) => assert_eq!(eof.status_flags, 0x22),
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    #[test]
    fn raw_text_row_keeps_bytes() {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("42");
        w.write_u8(0xFB);
        let row = parse_raw_text_row(w.as_bytes(), 2).unwrap();
        assert_eq!(row, RowPacket::Row(vec![Value::Bytes(b"42".to_vec()), Value::Null]));
        assert!(parse_raw_text_row(w.as_bytes(), 3).is_err());
    }

    #[test]
    fn text_row_error_packet() {
        let columns = [ColumnDef::new("id", FieldType::LongLong)];
        let mut data = vec![0xFF, 0x25, 0x05, b'#'];
        data.extend_from_slice(b"HY000query interrupted");
        let err = parse_text_row(&data, &columns).unwrap_err();
        assert_eq!(err.server_code(), Some(1317));
    }

    #[test]
    fn binary_row_bitmap_offset() {
        let columns = [
            ColumnDef::new("a", FieldType::Long),
            ColumnDef::new("b", FieldType::VarString),
            ColumnDef::new("c", FieldType::Tiny),
        ];
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        // column b (index 1) is NULL -> bit 3
        w.write_u8(0b0000_1000);
        w.write_u32_le(7);
        w.write_u8(0xFF);
        let row = parse_binary_row(w.as_bytes(), &columns).unwrap();
        assert_eq!(
            row,
            RowPacket::Row(vec![Value::Int(7), Value::Null, Value::Int(-1)])
        );

        assert!(parse_binary_row(&[0x00, 0x00, 0x01], &columns).is_err());
    }
}
