//! MySQL wire protocol: constants, packet envelopes and codecs.
//!
//! Every packet carries a 4-byte header:
//! - 3 bytes: payload length (little-endian)
//! - 1 byte: sequence number
//!
//! Payloads of 2^24 - 1 bytes or more are split across several packets;
//! framing lives in [`crate::transport`], the modules here only deal with
//! payload contents.

pub mod handshake;
pub mod prepared;
pub mod reader;
pub mod resultset;
pub mod writer;

pub use reader::PacketReader;
pub use writer::PacketWriter;

use mywire_core::{DatabaseError, Error, InterfaceErrorKind, Result};

/// Maximum payload size for a single MySQL packet (2^24 - 1 bytes).
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;

/// Capability flags (client and server).
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u32 = 1 << 22;
    pub const CLIENT_SESSION_TRACK: u32 = 1 << 23;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Default client capabilities.
    ///
    /// `CLIENT_DEPRECATE_EOF` is not requested: result sets are always
    /// terminated by EOF packets.
    pub const DEFAULT_CLIENT_FLAGS: u32 = CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_TRANSACTIONS
        | CLIENT_MULTI_STATEMENTS
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
}

/// Command codes (COM_xxx) used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    ResetConnection = 0x1f,
}

/// Server status flags.
#[allow(dead_code)]
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
}

/// COM_REFRESH option bits.
pub mod refresh {
    pub const GRANT: u8 = 1;
    pub const LOG: u8 = 1 << 1;
    pub const TABLES: u8 = 1 << 2;
    pub const HOSTS: u8 = 1 << 3;
    pub const STATUS: u8 = 1 << 4;
    pub const THREADS: u8 = 1 << 5;
    pub const REPLICA: u8 = 1 << 6;
    pub const SOURCE: u8 = 1 << 7;
}

/// COM_SHUTDOWN levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownLevel {
    #[default]
    Default = 0,
    WaitConnections = 1,
    WaitTransactions = 2,
    WaitUpdates = 8,
    WaitAllBuffers = 16,
    WaitCriticalBuffers = 17,
    KillQuery = 254,
    KillConnection = 255,
}

/// Character set / collation ids.
#[allow(dead_code)]
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;
    pub const UTF8MB4_UNICODE_CI: u8 = 224;

    /// Collation sent in the handshake response.
    pub const DEFAULT_CHARSET: u8 = UTF8MB4_GENERAL_CI;
}

/// A packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    pub const SIZE: usize = 4;

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            (self.payload_length & 0xFF) as u8,
            ((self.payload_length >> 8) & 0xFF) as u8,
            ((self.payload_length >> 16) & 0xFF) as u8,
            self.sequence_id,
        ]
    }
}

/// Parsed OK packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    pub info: String,
}

/// Parsed ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    /// Five-character SQLSTATE; absent for pre-4.1 style errors
    pub sql_state: Option<String>,
    pub error_message: String,
}

impl ErrPacket {
    pub fn into_error(self) -> Error {
        Error::Database(DatabaseError::new(
            self.error_code,
            self.sql_state,
            self.error_message,
        ))
    }
}

/// Parsed EOF packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl OkPacket {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

impl EofPacket {
    pub fn has_more_results(&self) -> bool {
        self.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0
    }
}

/// The first packet of a command response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Statement completed without a result set
    Ok(OkPacket),
    /// Legacy EOF; also used by servers as a bare terminator
    Eof(EofPacket),
    /// A result set with this many columns follows
    ResultSet { column_count: u64 },
    /// `LOAD DATA LOCAL INFILE`: the server wants this client file
    LocalInfile { filename: String },
}

/// Parse the leading packet of a command response.
///
/// Dispatch is by first byte: `0xFF` is always an error, `0x00` an OK
/// packet, `0xFE` in a short packet an EOF and `0xFB` a local file
/// request. Anything else is the length-encoded column count of a result
/// set.
pub fn parse_response(payload: &[u8]) -> Result<Response> {
    let Some(&first) = payload.first() else {
        return Err(Error::interface(
            InterfaceErrorKind::EmptyResponse,
            "Empty response",
        ));
    };
    let mut reader = PacketReader::new(payload);
    match first {
        0xFF => Err(reader
            .parse_err_packet()
            .ok_or_else(|| malformed("ERR"))?
            .into_error()),
        0x00 => Ok(Response::Ok(
            reader.parse_ok_packet().ok_or_else(|| malformed("OK"))?,
        )),
        0xFE if payload.len() < 9 => Ok(Response::Eof(reader.parse_eof_packet())),
        0xFB => Ok(Response::LocalInfile {
            filename: String::from_utf8_lossy(&payload[1..]).into_owned(),
        }),
        _ => {
            let column_count = reader
                .read_lenenc_int()
                .ok_or_else(|| malformed("column count"))?;
            if column_count == 0 {
                return Err(malformed("column count"));
            }
            Ok(Response::ResultSet { column_count })
        }
    }
}

/// Is this packet an EOF terminator?
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

/// Is this packet an ERR packet?
pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

/// Decode an ERR packet payload into an error, falling back to a protocol
/// error if it is truncated.
pub fn error_from_packet(payload: &[u8]) -> Error {
    match PacketReader::new(payload).parse_err_packet() {
        Some(err) => err.into_error(),
        None => malformed("ERR"),
    }
}

pub(crate) fn malformed(what: &str) -> Error {
    Error::interface(
        InterfaceErrorKind::Protocol,
        format!("Malformed {} packet", what),
    )
}
