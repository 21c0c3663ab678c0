//! Error types for mywire operations.
//!
//! Errors fall into two broad groups that callers care about:
//!
//! - **Retryable on a new connection**: [`Error::Interface`] (malformed or
//!   unexpected packets, desync, unsupported server) and
//!   [`Error::Operational`] (socket failures, dropped connections).
//! - **Rejected by the server or caller misuse**: [`Error::Database`],
//!   [`Error::Programming`], [`Error::NotSupported`].

use std::fmt;

/// The primary error type for all mywire operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed, empty or unexpected packets; protocol desync; unsupported server
    Interface(InterfaceError),
    /// Socket unavailable or connection dropped
    Operational(OperationalError),
    /// Error packet returned by the server
    Database(DatabaseError),
    /// Caller misuse (unread results, wrong arguments, nested transactions)
    Programming(ProgrammingError),
    /// Feature requires a newer server or a different configuration
    NotSupported(String),
    /// Connection pool errors
    Pool(PoolError),
    /// Value conversion errors
    Type(TypeError),
    /// Invalid configuration
    Config(ConfigError),
}

#[derive(Debug)]
pub struct InterfaceError {
    pub kind: InterfaceErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceErrorKind {
    /// Packet could not be decoded
    Protocol,
    /// Server sent an empty packet where a response was expected
    EmptyResponse,
    /// Sequence number mismatch
    Desync,
    /// Server version rejected
    UnsupportedServer,
    /// Stream ended inside a packet
    Framing,
    /// Reconnect attempts exhausted
    Reconnect,
    /// TLS negotiation failed
    Tls,
    /// Statement produced a result the caller did not ask for
    UnexpectedResult,
    /// A `LOAD DATA LOCAL INFILE` request was refused or its file unreadable
    LocalInfile,
}

#[derive(Debug)]
pub struct OperationalError {
    pub kind: OperationalErrorKind,
    pub message: String,
    /// Remote address the failure was observed on
    pub address: Option<String>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationalErrorKind {
    /// Failed to establish a connection
    Connect,
    /// Connect did not finish within the configured timeout
    Timeout,
    /// Connection lost during an operation
    Disconnected,
    /// Command issued on a closed connection
    NotAvailable,
    /// Other socket I/O failure
    Io,
}

/// A server-side error packet.
#[derive(Debug, Clone)]
pub struct DatabaseError {
    pub code: u16,
    pub sql_state: Option<String>,
    pub message: String,
    pub kind: DatabaseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    /// Constraint violations (duplicate key, foreign key)
    Integrity,
    /// Bad data (out of range, truncation)
    Data,
    /// Syntax errors, unknown tables or columns, access denied
    Programming,
    /// Server-side resource problems (too many connections, lock wait timeout)
    Operational,
    /// Deadlocks and rolled-back transactions
    Transaction,
    /// Feature not supported by the server
    NotSupported,
    /// Internal server errors
    Internal,
    /// Anything not covered above
    Other,
}

#[derive(Debug)]
pub struct ProgrammingError {
    pub kind: ProgrammingErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammingErrorKind {
    /// A result stream is still pending on the connection
    UnreadResult,
    /// Fetch called with no result pending
    NoResultSet,
    /// `start_transaction` while a transaction is open
    TransactionInProgress,
    /// Placeholder and parameter counts differ
    ParameterCount,
    /// Invalid argument value
    InvalidArgument,
    /// Operation needs an open connection
    NotConnected,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// No idle connection available
    Exhausted,
    /// Queue already holds `pool_size` connections
    QueueFull,
    /// No connection configuration stored
    NoConfig,
    /// Invalid pool configuration
    Config,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Can the operation be retried on a fresh connection?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Interface(_) | Error::Operational(_))
    }

    /// Does this error mean the connection itself is unusable?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Operational(_) => true,
            Error::Interface(e) => matches!(
                e.kind,
                InterfaceErrorKind::Desync
                    | InterfaceErrorKind::Framing
                    | InterfaceErrorKind::Tls
                    | InterfaceErrorKind::Reconnect
            ),
            _ => false,
        }
    }

    /// The server error, if this came from an error packet.
    pub fn database_error(&self) -> Option<&DatabaseError> {
        match self {
            Error::Database(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE if available (e.g., "23000" for a duplicate key)
    pub fn sql_state(&self) -> Option<&str> {
        self.database_error().and_then(|e| e.sql_state.as_deref())
    }

    /// Server error code if available (e.g., 1062)
    pub fn server_code(&self) -> Option<u16> {
        self.database_error().map(|e| e.code)
    }

    pub fn interface(kind: InterfaceErrorKind, message: impl Into<String>) -> Self {
        Error::Interface(InterfaceError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    pub fn operational(kind: OperationalErrorKind, message: impl Into<String>) -> Self {
        Error::Operational(OperationalError {
            kind,
            message: message.into(),
            address: None,
            source: None,
        })
    }

    pub fn programming(kind: ProgrammingErrorKind, message: impl Into<String>) -> Self {
        Error::Programming(ProgrammingError {
            kind,
            message: message.into(),
        })
    }

    pub fn pool(kind: PoolErrorKind, message: impl Into<String>) -> Self {
        Error::Pool(PoolError {
            kind,
            message: message.into(),
        })
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }

    /// The "unread result" guard error.
    pub fn unread_result() -> Self {
        Error::programming(ProgrammingErrorKind::UnreadResult, "Unread result found")
    }

    /// Attach the remote address to an operational error.
    #[must_use]
    pub fn with_address(self, address: impl Into<String>) -> Self {
        match self {
            Error::Operational(mut e) => {
                e.address = Some(address.into());
                Error::Operational(e)
            }
            other => other,
        }
    }
}

impl DatabaseError {
    /// Build a server error, classifying it from its code and SQLSTATE.
    pub fn new(code: u16, sql_state: Option<String>, message: impl Into<String>) -> Self {
        let kind = DatabaseErrorKind::classify(code, sql_state.as_deref());
        Self {
            code,
            sql_state,
            message: message.into(),
            kind,
        }
    }

    /// Duplicate key (ER_DUP_ENTRY)
    pub fn is_duplicate_key(&self) -> bool {
        self.code == 1062
    }

    /// Foreign key constraint failure
    pub fn is_foreign_key_violation(&self) -> bool {
        self.code == 1451 || self.code == 1452
    }
}

impl DatabaseErrorKind {
    /// Map a server error code / SQLSTATE to an error kind.
    ///
    /// Known codes win over the SQLSTATE class, because many server errors
    /// report the generic state `HY000`.
    pub fn classify(code: u16, sql_state: Option<&str>) -> Self {
        match code {
            1022 | 1048 | 1062 | 1169 | 1216 | 1217 | 1451 | 1452 | 1557 | 1586 | 3819 => {
                return DatabaseErrorKind::Integrity;
            }
            1264 | 1265 | 1292 | 1366 | 1406 | 1416 => return DatabaseErrorKind::Data,
            // 1044 / 1045: access denied, SQLSTATE class 28
            1044 | 1045 | 1046 | 1049 | 1054 | 1064 | 1146 | 1149 | 1182 => {
                return DatabaseErrorKind::Programming;
            }
            1040 | 1053 | 1081 | 1129 | 1130 | 1205 => {
                return DatabaseErrorKind::Operational;
            }
            1213 | 1614 => return DatabaseErrorKind::Transaction,
            1105 | 1815 => return DatabaseErrorKind::Internal,
            1235 => return DatabaseErrorKind::NotSupported,
            _ => {}
        }

        let Some(state) = sql_state else {
            return DatabaseErrorKind::Other;
        };
        match state.get(..2) {
            Some("23") => DatabaseErrorKind::Integrity,
            Some("22") => DatabaseErrorKind::Data,
            Some("42" | "28") => DatabaseErrorKind::Programming,
            Some("08") => DatabaseErrorKind::Operational,
            Some("40") => DatabaseErrorKind::Transaction,
            Some("0A") => DatabaseErrorKind::NotSupported,
            Some("XA") => DatabaseErrorKind::Internal,
            _ => DatabaseErrorKind::Other,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interface(e) => write!(f, "Interface error: {}", e.message),
            Error::Operational(e) => match &e.address {
                Some(addr) => write!(f, "Operational error ({}): {}", addr, e.message),
                None => write!(f, "Operational error: {}", e.message),
            },
            Error::Database(e) => write!(f, "Database error: {}", e),
            Error::Programming(e) => write!(f, "Programming error: {}", e.message),
            Error::NotSupported(msg) => write!(f, "Not supported: {}", msg),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Interface(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Operational(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "{} ({}): {}", self.code, state, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                return Error::Interface(InterfaceError {
                    kind: InterfaceErrorKind::Framing,
                    message: format!("stream closed inside a packet: {}", err),
                    source: Some(Box::new(err)),
                });
            }
            std::io::ErrorKind::TimedOut => OperationalErrorKind::Timeout,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => OperationalErrorKind::Disconnected,
            std::io::ErrorKind::ConnectionRefused => OperationalErrorKind::Connect,
            _ => OperationalErrorKind::Io,
        };
        Error::Operational(OperationalError {
            kind,
            message: err.to_string(),
            address: None,
            source: Some(Box::new(err)),
        })
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        Error::Database(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

/// Result type alias for mywire operations.
pub type Result<T> = std::result::Result<T, Error>;
