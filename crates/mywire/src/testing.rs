//! Server-side packet builders for driving the client in unit tests.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{PacketWriter, capabilities, charset, server_status};
use crate::types::FieldType;

pub(crate) const SERVER_CAPS: u32 = capabilities::CLIENT_PROTOCOL_41
    | capabilities::CLIENT_SECURE_CONNECTION
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_TRANSACTIONS
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_MULTI_RESULTS
    | capabilities::CLIENT_PS_MULTI_RESULTS
    | capabilities::CLIENT_LONG_PASSWORD
    | capabilities::CLIENT_LONG_FLAG
    | capabilities::CLIENT_COMPRESS;

pub(crate) const SEED: &[u8; 20] = b"abcdefghijklmnopqrst";

pub(crate) fn greeting(version: &str, plugin: &str) -> Vec<u8> {
    greeting_with_caps(version, plugin, SERVER_CAPS)
}

pub(crate) fn greeting_with_caps(version: &str, plugin: &str, caps: u32) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(version);
    w.write_u32_le(42);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((caps & 0xFFFF) as u16);
    w.write_u8(charset::UTF8MB4_GENERAL_CI);
    w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
    w.write_u16_le((caps >> 16) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string(plugin);
    w.into_bytes()
}

pub(crate) fn ok(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_lenenc_int(affected_rows);
    w.write_lenenc_int(last_insert_id);
    w.write_u16_le(status);
    w.write_u16_le(warnings);
    w.into_bytes()
}

pub(crate) fn ok_plain() -> Vec<u8> {
    ok(0, 0, server_status::SERVER_STATUS_AUTOCOMMIT, 0)
}

pub(crate) fn eof(status: u16, warnings: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFE);
    w.write_u16_le(warnings);
    w.write_u16_le(status);
    w.into_bytes()
}

pub(crate) fn eof_plain() -> Vec<u8> {
    eof(server_status::SERVER_STATUS_AUTOCOMMIT, 0)
}

pub(crate) fn err(code: u16, state: &str, message: &str) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0xFF);
    w.write_u16_le(code);
    w.write_u8(b'#');
    w.write_bytes(state.as_bytes());
    w.write_bytes(message.as_bytes());
    w.into_bytes()
}

pub(crate) fn column_count(count: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_int(count);
    w.into_bytes()
}

pub(crate) fn column_def(name: &str, ty: FieldType, flags: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for part in ["def", "test", "t", "t", name, name] {
        w.write_lenenc_string(part);
    }
    w.write_lenenc_int(0x0c);
    w.write_u16_le(u16::from(charset::UTF8MB4_GENERAL_CI));
    w.write_u32_le(255);
    w.write_u8(ty as u8);
    w.write_u16_le(flags);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

pub(crate) fn text_row(values: &[Option<&str>]) -> Vec<u8> {
    let mut w = PacketWriter::new();
    for value in values {
        match value {
            Some(v) => w.write_lenenc_string(v),
            None => w.write_u8(0xFB),
        }
    }
    w.into_bytes()
}

pub(crate) fn stmt_prepare_ok(statement_id: u32, columns: u16, params: u16) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(0x00);
    w.write_u32_le(statement_id);
    w.write_u16_le(columns);
    w.write_u16_le(params);
    w.write_u8(0);
    w.write_u16_le(0);
    w.into_bytes()
}

/// Split captured client bytes into (sequence, payload) packets.
pub(crate) fn client_packets(bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut packets = Vec::new();
    let mut pos = 0;
    while pos + 4 <= bytes.len() {
        let len = usize::from(bytes[pos])
            | usize::from(bytes[pos + 1]) << 8
            | usize::from(bytes[pos + 2]) << 16;
        let seq = bytes[pos + 3];
        packets.push((seq, bytes[pos + 4..pos + 4 + len].to_vec()));
        pos += 4 + len;
    }
    packets
}
