//! Prepared statement (binary protocol) payloads.
//!
//! 1. **Prepare**: COM_STMT_PREPARE with the SQL text. The server answers
//!    with a PREPARE_OK header, then parameter definitions and result
//!    column definitions, each list terminated by EOF and omitted when
//!    its count is zero.
//! 2. **Long data**: zero or more COM_STMT_SEND_LONG_DATA chunks per
//!    parameter. The server never answers these.
//! 3. **Execute**: COM_STMT_EXECUTE with the NULL bitmap, type tags and
//!    binary values. The response is an OK packet or a binary result set.
//! 4. **Close**: COM_STMT_CLOSE, also unanswered.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::{Result, Value};

use super::{Command, PacketWriter, malformed};
use crate::types::{ColumnDef, FieldType, encode_binary_value, value_to_field_type};

/// Suggested chunk size for COM_STMT_SEND_LONG_DATA.
pub const LONG_DATA_CHUNK_SIZE: usize = 8192;

/// Header of a COM_STMT_PREPARE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

/// A statement prepared on one connection.
///
/// The id is only meaningful on the connection that prepared it; after a
/// reconnect the statement must be prepared again.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    pub statement_id: u32,
    pub sql: String,
    pub params: Vec<ColumnDef>,
    pub columns: Vec<ColumnDef>,
}

impl PreparedStatement {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
}

pub fn build_stmt_prepare(sql: &str) -> Vec<u8> {
    super::writer::command_payload(Command::StmtPrepare, sql.as_bytes())
}

/// Parse the PREPARE_OK header.
///
/// - status 0x00
/// - statement id (4 bytes)
/// - column count (2 bytes)
/// - parameter count (2 bytes)
/// - filler (1 byte)
/// - warning count (2 bytes)
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Result<StmtPrepareOk> {
    if data.len() < 12 || data[0] != 0x00 {
        return Err(malformed("COM_STMT_PREPARE response"));
    }
    Ok(StmtPrepareOk {
        statement_id: u32::from_le_bytes([data[1], data[2], data[3], data[4]]),
        num_columns: u16::from_le_bytes([data[5], data[6]]),
        num_params: u16::from_le_bytes([data[7], data[8]]),
        warnings: u16::from_le_bytes([data[10], data[11]]),
    })
}

/// Build a COM_STMT_EXECUTE payload.
///
/// Parameters whose index appears in `long_data` were already streamed
/// with COM_STMT_SEND_LONG_DATA: they are typed as BLOB and carry no
/// inline value.
pub fn build_stmt_execute(statement_id: u32, params: &[Value], long_data: &[usize]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(64 + params.len() * 16);
    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    // CURSOR_TYPE_NO_CURSOR
    writer.write_u8(0x00);
    // iteration count
    writer.write_u32_le(1);

    if params.is_empty() {
        return writer.into_bytes();
    }

    let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
    for (i, param) in params.iter().enumerate() {
        if param.is_null() && !long_data.contains(&i) {
            null_bitmap[i / 8] |= 1 << (i % 8);
        }
    }
    writer.write_bytes(&null_bitmap);

    // new-params-bound flag
    writer.write_u8(1);
    for (i, param) in params.iter().enumerate() {
        let (field_type, unsigned) = if long_data.contains(&i) {
            (FieldType::Blob, false)
        } else {
            value_to_field_type(param)
        };
        writer.write_u8(field_type as u8);
        writer.write_u8(if unsigned { 0x80 } else { 0x00 });
    }

    for (i, param) in params.iter().enumerate() {
        if !long_data.contains(&i) {
            encode_binary_value(&mut writer, param);
        }
    }
    writer.into_bytes()
}

/// Build one COM_STMT_SEND_LONG_DATA chunk.
pub fn build_send_long_data(statement_id: u32, param_index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(7 + chunk.len());
    writer.write_u8(Command::StmtSendLongData as u8);
    writer.write_u32_le(statement_id);
    writer.write_u16_le(param_index);
    writer.write_bytes(chunk);
    writer.into_bytes()
}

pub fn build_stmt_close(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtClose as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

/// Build COM_STMT_RESET, which discards accumulated long data.
pub fn build_stmt_reset(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(5);
    writer.write_u8(Command::StmtReset as u8);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}
