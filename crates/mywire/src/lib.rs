//! Async MySQL client driver.
//!
//! This crate implements the MySQL client/server protocol directly on top
//! of asupersync's socket, timer and file primitives:
//!
//! - Packet framing with sequence numbers, the zlib-compressed protocol,
//!   optional TLS upgrade (feature `tls`) and Unix domain sockets
//! - Authentication (mysql_native_password, caching_sha2_password,
//!   sha256_password, mysql_clear_password)
//! - Text and binary (prepared statement) query protocols
//! - A connection state machine with unread-result tracking,
//!   multi-statement results, transactions and reconnection
//! - Cursors with buffered/unbuffered fetching and several row shapes
//! - `LOAD DATA LOCAL INFILE`, off unless `allow_local_infile` is set
//!
//! # MySQL Protocol Overview
//!
//! Every packet has a 3-byte payload length and a 1-byte sequence number.
//! Payloads of 16MB or more are split, the last piece being shorter than
//! 0xFFFFFF bytes. The sequence number starts at 0 for each command.
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::{MySqlConfig, MySqlConnection};
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .user("root")
//!     .database("mydb");
//!
//! let mut conn = MySqlConnection::connect(&cx, config).await.unwrap();
//! let mut cursor = conn.cursor();
//! cursor.execute(&cx, "SELECT id FROM users WHERE name = ?", &["ada".into()]).await;
//! let rows = cursor.fetchall(&cx).await;
//! ```

/// Return `Outcome::Cancelled` from the enclosing function if `cx` has a
/// pending cancellation.
macro_rules! cancel_point {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return ::asupersync::Outcome::Cancelled(reason);
        }
    };
}

pub mod auth;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod protocol;
pub mod tls;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use auth::AuthPlugin;
pub use config::{MySqlConfig, SslMode, TlsConfig};
pub use connection::{
    CommandResult, ConnectionState, IsolationLevel, MySqlConnection, TransactionOptions, Warning,
};
pub use cursor::{Buffering, Cursor, CursorRow, RowShape};
pub use protocol::prepared::PreparedStatement;
pub use protocol::{EofPacket, OkPacket, ShutdownLevel};
pub use types::{ColumnDef, FieldType};

pub use mywire_core::{Cx, Error, Outcome, Result, Row, Value};
