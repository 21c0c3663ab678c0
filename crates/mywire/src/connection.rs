//! MySQL connection state machine.
//!
//! A [`MySqlConnection`] owns one [`Transport`] and walks it through
//! `Connecting → Handshaking → Authenticating → Ready`. Once ready it
//! dispatches commands one at a time and tracks two pieces of result
//! state:
//!
//! - an *unread result*: a result set header was read and its rows have
//!   not been drained yet. No other command may be sent until they are.
//! - *more results*: the server flagged further results of a
//!   multi-statement query; [`MySqlConnection::next_result`] reads them.
//!
//! Every public operation takes a [`Cx`] and returns an [`Outcome`],
//! checking for cancellation before touching the network.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use asupersync::io::AsyncRead;
use asupersync::time::{sleep, timeout, wall_now};
use asupersync::{Cx, Outcome};
use mywire_core::{
    ColumnInfo, DatabaseError, Error, InterfaceErrorKind, OperationalError, OperationalErrorKind,
    ProgrammingErrorKind, Result, Row, Value,
};

use crate::auth::{self, AuthPlugin, caching_sha2};
use crate::config::MySqlConfig;
use crate::protocol::handshake::{self, AuthPacket, HandshakeInfo, HandshakeResponse};
use crate::protocol::prepared::{self, LONG_DATA_CHUNK_SIZE, PreparedStatement};
use crate::protocol::resultset::{self, RowPacket};
use crate::protocol::writer::command_payload;
use crate::protocol::{
    Command, EofPacket, OkPacket, Response, ShutdownLevel, capabilities, error_from_packet,
    is_eof_packet, is_err_packet, malformed, parse_response, server_status,
};
use crate::tls;
use crate::transport::{Transport, read_full, timeout_error};

/// Payload size of each packet carrying a local file.
const LOCAL_INFILE_CHUNK_SIZE: usize = 16 * 1024;
use crate::types::{ColumnDef, escape_string, format_value_for_sql};

pub(crate) fn into_outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

fn local_file_error(filename: &str, e: &std::io::Error) -> Error {
    Error::interface(
        InterfaceErrorKind::LocalInfile,
        format!("File '{}' could not be read: {}", filename, e),
    )
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket being opened
    Connecting,
    /// Waiting for / parsing the server greeting
    Handshaking,
    Authenticating,
    Ready,
}

/// What a command produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// No result set
    Ok(OkPacket),
    /// A result set follows; its rows must be read before the next command
    ResultSet(Vec<ColumnDef>),
}

impl CommandResult {
    pub fn columns(&self) -> Option<&[ColumnDef]> {
        match self {
            CommandResult::ResultSet(columns) => Some(columns),
            CommandResult::Ok(_) => None,
        }
    }

    pub fn ok_packet(&self) -> Option<&OkPacket> {
        match self {
            CommandResult::Ok(ok) => Some(ok),
            CommandResult::ResultSet(_) => None,
        }
    }

    pub fn has_rows(&self) -> bool {
        matches!(self, CommandResult::ResultSet(_))
    }
}

/// One row of `SHOW WARNINGS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub level: String,
    pub code: u16,
    pub message: String,
}

impl Warning {
    /// The warning as a server error, for `raise_on_warnings`.
    pub fn into_error(self) -> Error {
        Error::Database(DatabaseError::new(self.code, None, self.message))
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub const fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    /// Case-insensitive; hyphens count as spaces (`read-committed`).
    fn from_str(level: &str) -> Result<Self> {
        let normalized = level.trim().replace('-', " ").to_uppercase();
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            _ => Err(Error::programming(
                ProgrammingErrorKind::InvalidArgument,
                format!("Unknown isolation level \"{}\"", level),
            )),
        }
    }
}

/// Options for [`MySqlConnection::start_transaction`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub consistent_snapshot: bool,
    pub isolation_level: Option<IsolationLevel>,
    /// `Some(true)` for READ ONLY, `Some(false)` for READ WRITE
    pub read_only: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consistent_snapshot(mut self, enabled: bool) -> Self {
        self.consistent_snapshot = enabled;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }
}

#[derive(Debug, Clone)]
struct PendingResult {
    columns: Arc<Vec<ColumnDef>>,
    info: Arc<ColumnInfo>,
    binary: bool,
}

impl PendingResult {
    fn new(columns: Vec<ColumnDef>, binary: bool) -> Self {
        let names = columns.iter().map(|c| c.name.clone()).collect();
        Self {
            columns: Arc::new(columns),
            info: Arc::new(ColumnInfo::new(names)),
            binary,
        }
    }
}

/// A single MySQL connection.
pub struct MySqlConnection {
    config: MySqlConfig,
    transport: Transport,
    state: ConnectionState,
    handshake: Option<HandshakeInfo>,
    client_flags: u32,
    auth_plugin: AuthPlugin,
    status_flags: u16,
    pending: Option<PendingResult>,
    more_results: bool,
    affected_rows: u64,
    last_insert_id: u64,
    warning_count: u16,
    raw: bool,
    /// Bumped on every successful (re)connect
    generation: u64,
    /// Statements whose COM_STMT_CLOSE goes out before the next command
    deferred_closes: Vec<u32>,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("state", &self.state)
            .field("address", &self.transport.address())
            .field("connection_id", &self.connection_id())
            .field("database", &self.config.database)
            .field("unread_result", &self.pending.is_some())
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// A disconnected connection for `config`; call [`Self::reconnect`] or
    /// use [`Self::connect`] instead to open it.
    pub fn new(config: MySqlConfig) -> Self {
        let address = config.address();
        Self {
            config,
            transport: Transport::closed(address),
            state: ConnectionState::Disconnected,
            handshake: None,
            client_flags: 0,
            auth_plugin: AuthPlugin::NativePassword,
            status_flags: 0,
            pending: None,
            more_results: false,
            affected_rows: 0,
            last_insert_id: 0,
            warning_count: 0,
            raw: false,
            generation: 0,
            deferred_closes: Vec::new(),
        }
    }

    /// Open a connection: socket, greeting, optional TLS upgrade,
    /// authentication and session setup.
    #[tracing::instrument(level = "debug", skip(cx, config), fields(address = %config.address()))]
    pub async fn connect(cx: &Cx, config: MySqlConfig) -> Outcome<Self, Error> {
        cancel_point!(cx);
        let mut conn = Self::new(config);
        let opened = conn.open().await;
        into_outcome(opened.map(|()| conn))
    }

    // === Accessors ===

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// Replace the configuration; it takes effect on the next reconnect.
    pub fn reconfigure(&mut self, config: MySqlConfig) {
        self.config = config;
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Ready with an open socket. Does not talk to the server; see
    /// [`Self::is_connected`].
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Ready && self.transport.is_open()
    }

    pub fn handshake(&self) -> Option<&HandshakeInfo> {
        self.handshake.as_ref()
    }

    pub fn server_version(&self) -> Option<(u16, u16, u16)> {
        self.handshake.as_ref().map(|h| h.version)
    }

    pub fn server_version_string(&self) -> Option<&str> {
        self.handshake.as_ref().map(|h| h.server_version.as_str())
    }

    pub fn connection_id(&self) -> Option<u32> {
        self.handshake.as_ref().map(|h| h.connection_id)
    }

    pub fn server_status(&self) -> u16 {
        self.status_flags
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn has_unread_result(&self) -> bool {
        self.pending.is_some()
    }

    pub fn has_more_results(&self) -> bool {
        self.more_results
    }

    pub fn affected_rows(&self) -> u64 {
        self.affected_rows
    }

    pub fn last_insert_id(&self) -> u64 {
        self.last_insert_id
    }

    pub fn warning_count(&self) -> u16 {
        self.warning_count
    }

    pub fn client_flags(&self) -> u32 {
        self.client_flags
    }

    pub fn is_compressed(&self) -> bool {
        self.transport.is_compressed()
    }

    pub fn is_tls(&self) -> bool {
        self.transport.is_tls()
    }

    /// Changes whenever the connection is re-established. Prepared
    /// statements from an older generation are gone on the server.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Return text-protocol rows as undecoded bytes.
    pub fn set_raw(&mut self, raw: bool) {
        self.raw = raw;
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn server_version_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        self.handshake
            .as_ref()
            .is_some_and(|h| h.version_at_least(major, minor, patch))
    }

    // === Connection phase ===

    async fn open(&mut self) -> Result<()> {
        tls::validate_tls_config(self.config.ssl_mode, &self.config.tls)?;
        self.reset_result_state();
        self.state = ConnectionState::Connecting;

        match Transport::open(&self.config).await {
            Ok(transport) => self.transport = transport,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                return Err(e);
            }
        }

        let limit = self.config.connect_timeout;
        let attempt = timeout(wall_now(), limit, self.establish()).await;
        let established = match attempt {
            Ok(result) => result,
            Err(_) => Err(timeout_error(self.transport.address(), limit)),
        };
        if let Err(e) = established {
            tracing::debug!(error = %e, "connection attempt failed");
            self.mark_disconnected();
            return Err(e);
        }
        Ok(())
    }

    /// Run the handshake over an already-open transport.
    async fn establish(&mut self) -> Result<()> {
        self.state = ConnectionState::Handshaking;
        let greeting = self.transport.recv().await?;
        let info = handshake::parse_handshake(&greeting)?;
        tracing::debug!(
            server_version = %info.server_version,
            connection_id = info.connection_id,
            plugin = %info.auth_plugin,
            "server greeting"
        );

        self.client_flags = self.config.capability_flags() & info.capabilities;
        let use_tls = !self.transport.is_unix_socket()
            && tls::validate_ssl_mode(self.config.ssl_mode, info.capabilities)?;

        self.state = ConnectionState::Authenticating;
        if use_tls {
            let request = handshake::build_ssl_request(
                self.client_flags,
                self.config.max_packet_size,
                self.config.charset,
            );
            self.transport.send(&request).await?;
            self.transport.switch_to_tls(&self.config).await?;
            self.client_flags |= capabilities::CLIENT_SSL;
        }
        let secure = use_tls || self.transport.is_unix_socket();

        let plugin = AuthPlugin::from_name(&info.auth_plugin)?;
        let password = self.config.password_str().to_string();
        let auth_response = plugin.initial_response(&password, &info.auth_data, secure)?;
        let response = handshake::build_handshake_response(&HandshakeResponse {
            capabilities: self.client_flags,
            max_packet_size: self.config.max_packet_size,
            charset: self.config.charset,
            user: &self.config.user,
            auth_response: &auth_response,
            database: self.config.database.as_deref(),
            auth_plugin: plugin.name(),
            attributes: &self.config.attributes,
        });
        self.transport.send(&response).await?;

        let seed = info.auth_data.clone();
        self.handshake = Some(info);
        let ok = self.authenticate(plugin, seed, secure, &password).await?;
        self.status_flags = ok.status_flags;

        if self.client_flags & capabilities::CLIENT_COMPRESS != 0 {
            self.transport.enable_compression();
        }
        self.state = ConnectionState::Ready;
        self.generation += 1;
        tracing::debug!(
            connection_id = ?self.connection_id(),
            tls = self.transport.is_tls(),
            compressed = self.transport.is_compressed(),
            "connected"
        );

        self.post_connection().await
    }

    /// Drive the auth exchange until the server accepts or rejects us.
    async fn authenticate(
        &mut self,
        mut plugin: AuthPlugin,
        mut seed: Vec<u8>,
        secure: bool,
        password: &str,
    ) -> Result<OkPacket> {
        loop {
            let packet = self.transport.recv().await?;
            match handshake::parse_auth_packet(&packet)? {
                AuthPacket::Ok(ok) => {
                    self.auth_plugin = plugin;
                    return Ok(ok);
                }
                AuthPacket::OldPassword => {
                    return Err(Error::NotSupported(
                        "Authentication with old (insecure) passwords is not supported"
                            .to_string(),
                    ));
                }
                AuthPacket::Switch { plugin: name, data } => {
                    tracing::debug!(plugin = %name, "auth switch requested");
                    plugin = AuthPlugin::from_name(&name)?;
                    seed = data;
                    let response = plugin.initial_response(password, &seed, secure)?;
                    self.transport.send(&response).await?;
                }
                AuthPacket::MoreData(data) => {
                    if let Some(reply) = continue_auth(plugin, password, &seed, &data, secure)? {
                        self.transport.send(&reply).await?;
                    }
                }
            }
        }
    }

    /// Apply the configured session settings.
    async fn post_connection(&mut self) -> Result<()> {
        self.reset_result_state();
        if let Some(autocommit) = self.config.autocommit {
            let value = if autocommit { "ON" } else { "OFF" };
            self.execute_simple(&format!("SET @@session.autocommit = {}", value))
                .await?;
        }
        if let Some(tz) = self.config.time_zone.clone() {
            self.execute_simple(&format!("SET @@session.time_zone = {}", escape_string(&tz)))
                .await?;
        }
        if let Some(mode) = self.config.sql_mode.clone() {
            self.execute_simple(&format!("SET @@session.sql_mode = {}", escape_string(&mode)))
                .await?;
        }
        if let Some(init) = self.config.init_command.clone() {
            self.execute_simple(&init).await?;
        }
        Ok(())
    }

    fn reset_result_state(&mut self) {
        self.pending = None;
        self.more_results = false;
    }

    fn mark_disconnected(&mut self) {
        self.transport.close();
        self.state = ConnectionState::Disconnected;
        self.reset_result_state();
        // the server frees statements with the session
        self.deferred_closes.clear();
    }

    /// Queue a COM_STMT_CLOSE for a statement whose owner could not await
    /// it. It is sent ahead of the next command.
    pub(crate) fn defer_stmt_close(&mut self, statement_id: u32) {
        if self.is_open() {
            self.deferred_closes.push(statement_id);
        }
    }

    /// Statement closes still waiting for the next command.
    pub fn deferred_stmt_closes(&self) -> &[u32] {
        &self.deferred_closes
    }

    // === Packet I/O ===

    fn check_io<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_error() {
                tracing::warn!(error = %e, address = %self.transport.address(), "connection lost");
                self.mark_disconnected();
            }
        }
        result
    }

    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let result = self.transport.send(payload).await;
        self.check_io(result)
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let result = self.transport.recv().await;
        self.check_io(result)
    }

    fn require_ready(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(Error::operational(
                OperationalErrorKind::NotAvailable,
                "MySQL Connection not available",
            )
            .with_address(self.transport.address()))
        }
    }

    /// Refuse to start a command while results are outstanding, unless
    /// the connection is configured to discard them.
    async fn ensure_no_unread(&mut self) -> Result<()> {
        if self.pending.is_none() && !self.more_results {
            return Ok(());
        }
        if self.config.consume_results {
            self.drain_results().await
        } else {
            Err(Error::unread_result())
        }
    }

    /// Start a new command exchange.
    async fn send_command(&mut self, payload: &[u8]) -> Result<()> {
        self.require_ready()?;
        self.ensure_no_unread().await?;
        self.flush_deferred_closes().await?;
        self.transport.reset_sequence();
        tracing::trace!(
            command = payload.first().copied().unwrap_or_default(),
            len = payload.len(),
            "sending command"
        );
        self.send(payload).await
    }

    /// COM_STMT_CLOSE has no reply, so queued closes are written back to
    /// back.
    async fn flush_deferred_closes(&mut self) -> Result<()> {
        while let Some(statement_id) = self.deferred_closes.pop() {
            self.transport.reset_sequence();
            self.send(&prepared::build_stmt_close(statement_id)).await?;
            tracing::trace!(statement_id, "deferred statement close sent");
        }
        Ok(())
    }

    // === Result handling ===

    fn apply_ok(&mut self, ok: &OkPacket) {
        self.affected_rows = ok.affected_rows;
        self.last_insert_id = ok.last_insert_id;
        self.warning_count = ok.warnings;
        self.status_flags = ok.status_flags;
        self.more_results = ok.has_more_results();
    }

    fn apply_eof(&mut self, eof: &EofPacket) {
        self.warning_count = eof.warnings;
        self.status_flags = eof.status_flags;
        self.more_results = eof.has_more_results();
    }

    /// Interpret the first packet of a command response.
    async fn handle_result(&mut self, packet: Vec<u8>, binary: bool) -> Result<CommandResult> {
        match parse_response(&packet) {
            Ok(Response::Ok(ok)) => {
                self.apply_ok(&ok);
                Ok(CommandResult::Ok(ok))
            }
            Ok(Response::Eof(eof)) => {
                self.apply_eof(&eof);
                Ok(CommandResult::Ok(OkPacket {
                    status_flags: eof.status_flags,
                    warnings: eof.warnings,
                    ..OkPacket::default()
                }))
            }
            Ok(Response::LocalInfile { filename }) => {
                let ok = self.send_local_infile(&filename).await?;
                Ok(CommandResult::Ok(ok))
            }
            Ok(Response::ResultSet { column_count }) => {
                let count =
                    usize::try_from(column_count).map_err(|_| malformed("column count"))?;
                let (columns, eof) = self.read_column_defs(count).await?;
                self.apply_eof(&eof);
                self.affected_rows = 0;
                self.pending = Some(PendingResult::new(columns.clone(), binary));
                Ok(CommandResult::ResultSet(columns))
            }
            Err(e) => {
                self.more_results = false;
                Err(e)
            }
        }
    }

    /// Answer a `LOAD DATA LOCAL INFILE` request with the file's contents
    /// and an empty packet. A refused or unreadable file gets the empty
    /// packet alone; the local error is returned after the server's reply
    /// so the connection stays usable.
    async fn send_local_infile(&mut self, filename: &str) -> Result<OkPacket> {
        let local_error = if self.config.allow_local_infile {
            tracing::debug!(file = %filename, "sending local file");
            match asupersync::fs::File::open(filename).await {
                Ok(mut file) => self.stream_local_file(&mut file, filename).await?,
                Err(e) => Some(local_file_error(filename, &e)),
            }
        } else {
            tracing::warn!(file = %filename, "local file request refused");
            Some(Error::interface(
                InterfaceErrorKind::LocalInfile,
                format!(
                    "LOAD DATA LOCAL INFILE request for '{}' refused; enable allow_local_infile",
                    filename
                ),
            ))
        };
        self.send(&[]).await?;

        let packet = self.recv().await?;
        let reply = parse_response(&packet);
        if let Ok(Response::Ok(ok)) = &reply {
            self.apply_ok(ok);
        }
        if let Some(e) = local_error {
            return Err(e);
        }
        match reply? {
            Response::Ok(ok) => Ok(ok),
            _ => Err(malformed("LOAD DATA LOCAL INFILE reply")),
        }
    }

    /// Send `file` as packets. Transport failures abort; a read failure is
    /// handed back so the exchange can still be finished.
    async fn stream_local_file<R: AsyncRead + Unpin>(
        &mut self,
        file: &mut R,
        filename: &str,
    ) -> Result<Option<Error>> {
        let mut chunk = vec![0; LOCAL_INFILE_CHUNK_SIZE];
        let mut sent = 0usize;
        loop {
            match read_full(file, &mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    self.send(&chunk[..n]).await?;
                    sent += n;
                }
                Err(e) => return Ok(Some(local_file_error(filename, &e))),
            }
        }
        tracing::trace!(file = %filename, bytes = sent, "local file sent");
        Ok(None)
    }

    /// Read `count` column definitions and the EOF that ends them.
    async fn read_column_defs(&mut self, count: usize) -> Result<(Vec<ColumnDef>, EofPacket)> {
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            let packet = self.recv().await?;
            if is_err_packet(&packet) {
                return Err(error_from_packet(&packet));
            }
            columns.push(resultset::parse_column_def(&packet)?);
        }
        let packet = self.recv().await?;
        if !is_eof_packet(&packet) {
            return Err(malformed("column definition EOF"));
        }
        let eof = crate::protocol::PacketReader::new(&packet).parse_eof_packet();
        Ok((columns, eof))
    }

    /// Read up to `count` rows (all if `None`) of the pending result.
    ///
    /// The EOF is returned once the result is exhausted, which also
    /// clears the unread-result state.
    pub(crate) async fn read_rows(
        &mut self,
        count: Option<usize>,
    ) -> Result<(Vec<Row>, Option<EofPacket>)> {
        let Some(pending) = self.pending.clone() else {
            return Err(Error::programming(
                ProgrammingErrorKind::NoResultSet,
                "No result set to fetch from",
            ));
        };

        let mut rows = Vec::new();
        loop {
            if count.is_some_and(|n| rows.len() >= n) {
                return Ok((rows, None));
            }
            let packet = self.recv().await?;
            let parsed = if pending.binary {
                resultset::parse_binary_row(&packet, &pending.columns)
            } else if self.raw {
                resultset::parse_raw_text_row(&packet, pending.columns.len())
            } else {
                resultset::parse_text_row(&packet, &pending.columns)
            };
            match parsed {
                Ok(RowPacket::Row(values)) => {
                    rows.push(Row::with_columns(Arc::clone(&pending.info), values));
                }
                Ok(RowPacket::Eof(eof)) => {
                    self.pending = None;
                    self.apply_eof(&eof);
                    tracing::trace!(rows = rows.len(), more = self.more_results, "result drained");
                    return Ok((rows, Some(eof)));
                }
                Err(e) => {
                    self.reset_result_state();
                    return Err(e);
                }
            }
        }
    }

    /// Discard the pending result and every further result of a
    /// multi-statement query.
    pub(crate) async fn drain_results(&mut self) -> Result<()> {
        loop {
            if self.pending.is_some() {
                self.read_rows(None).await?;
            }
            if !self.more_results {
                return Ok(());
            }
            let packet = self.recv().await?;
            self.handle_result(packet, false).await?;
        }
    }

    pub(crate) async fn query_inner(&mut self, sql: &str) -> Result<CommandResult> {
        self.send_command(&command_payload(Command::Query, sql.as_bytes()))
            .await?;
        let packet = self.recv().await?;
        self.handle_result(packet, false).await
    }

    /// Single-statement query; extra results are an error.
    pub(crate) async fn query_single(&mut self, sql: &str) -> Result<CommandResult> {
        let result = self.query_inner(sql).await?;
        if self.more_results {
            return Err(Error::interface(
                InterfaceErrorKind::UnexpectedResult,
                "Use multi statement execution (cmd_query_many) for statements with multiple results",
            ));
        }
        Ok(result)
    }

    pub(crate) async fn next_result_inner(&mut self) -> Result<Option<CommandResult>> {
        if self.pending.is_some() {
            if self.config.consume_results {
                self.read_rows(None).await?;
            } else {
                return Err(Error::unread_result());
            }
        }
        if !self.more_results {
            return Ok(None);
        }
        let packet = self.recv().await?;
        self.handle_result(packet, false).await.map(Some)
    }

    /// Run a statement and throw away whatever it returns.
    pub(crate) async fn execute_simple(&mut self, sql: &str) -> Result<()> {
        self.query_inner(sql).await?;
        self.drain_results().await
    }

    /// First column of the first row of a query.
    async fn info_query(&mut self, sql: &str) -> Result<Value> {
        self.query_inner(sql).await?;
        let (rows, _) = if self.pending.is_some() {
            self.read_rows(None).await?
        } else {
            (Vec::new(), None)
        };
        self.drain_results().await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.into_values().into_iter().next())
            .unwrap_or(Value::Null))
    }

    async fn simple_command(&mut self, payload: &[u8]) -> Result<OkPacket> {
        self.send_command(payload).await?;
        let packet = self.recv().await?;
        match self.handle_result(packet, false).await? {
            CommandResult::Ok(ok) => Ok(ok),
            CommandResult::ResultSet(_) => {
                self.drain_results().await?;
                Err(Error::interface(
                    InterfaceErrorKind::UnexpectedResult,
                    "Command returned a result set",
                ))
            }
        }
    }

    pub(crate) async fn fetch_warnings(&mut self) -> Result<Vec<Warning>> {
        self.query_inner("SHOW WARNINGS").await?;
        let (rows, _) = if self.pending.is_some() {
            self.read_rows(None).await?
        } else {
            (Vec::new(), None)
        };
        self.drain_results().await?;
        Ok(rows
            .iter()
            .map(|row| Warning {
                level: row.get(0).and_then(value_string).unwrap_or_default(),
                code: row
                    .get(1)
                    .and_then(|v| v.as_u64().or_else(|| value_string(v)?.parse().ok()))
                    .and_then(|c| u16::try_from(c).ok())
                    .unwrap_or_default(),
                message: row.get(2).and_then(value_string).unwrap_or_default(),
            })
            .collect())
    }

    // === Commands ===

    /// Send a single-statement query.
    ///
    /// Returns either the OK packet or the column definitions of a result
    /// set whose rows must then be read with [`Self::get_rows`].
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn cmd_query(&mut self, cx: &Cx, sql: &str) -> Outcome<CommandResult, Error> {
        cancel_point!(cx);
        into_outcome(self.query_single(sql).await)
    }

    /// Send a query that may contain several statements; returns the
    /// first result. Use [`Self::next_result`] for the rest.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn cmd_query_many(&mut self, cx: &Cx, sql: &str) -> Outcome<CommandResult, Error> {
        cancel_point!(cx);
        into_outcome(self.query_inner(sql).await)
    }

    /// Advance to the next result of a multi-statement query.
    ///
    /// Returns `None` once the server reports no more results.
    pub async fn next_result(&mut self, cx: &Cx) -> Outcome<Option<CommandResult>, Error> {
        cancel_point!(cx);
        into_outcome(self.next_result_inner().await)
    }

    /// Read rows of the pending result: `count` of them, or all.
    pub async fn get_rows(
        &mut self,
        cx: &Cx,
        count: Option<usize>,
    ) -> Outcome<(Vec<Row>, Option<EofPacket>), Error> {
        cancel_point!(cx);
        into_outcome(self.read_rows(count).await)
    }

    /// Read the next row of the pending result, `None` at the end.
    pub async fn get_row(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        cancel_point!(cx);
        into_outcome(
            self.read_rows(Some(1))
                .await
                .map(|(rows, _)| rows.into_iter().next()),
        )
    }

    /// Discard any unread result.
    pub async fn consume_results(&mut self, cx: &Cx) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.drain_results().await)
    }

    /// Change the default database.
    pub async fn cmd_init_db(&mut self, cx: &Cx, database: &str) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        let result = self
            .simple_command(&command_payload(Command::InitDb, database.as_bytes()))
            .await;
        if result.is_ok() {
            self.config.database = Some(database.to_string());
        }
        into_outcome(result)
    }

    pub async fn cmd_ping(&mut self, cx: &Cx) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(self.ping_inner().await)
    }

    async fn ping_inner(&mut self) -> Result<OkPacket> {
        self.simple_command(&command_payload(Command::Ping, &[]))
            .await
    }

    /// Server statistics (`Uptime`, `Threads`, ...).
    pub async fn cmd_statistics(&mut self, cx: &Cx) -> Outcome<BTreeMap<String, String>, Error> {
        cancel_point!(cx);
        into_outcome(self.statistics_inner().await)
    }

    async fn statistics_inner(&mut self) -> Result<BTreeMap<String, String>> {
        self.send_command(&command_payload(Command::Statistics, &[]))
            .await?;
        let packet = self.recv().await?;
        if is_err_packet(&packet) {
            return Err(error_from_packet(&packet));
        }
        Ok(parse_statistics(&String::from_utf8_lossy(&packet)))
    }

    /// Flush server caches or logs; `options` is a mask of
    /// [`crate::protocol::refresh`] bits. Needs the RELOAD privilege.
    pub async fn cmd_refresh(&mut self, cx: &Cx, options: u8) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(
            self.simple_command(&command_payload(Command::Refresh, &[options]))
                .await,
        )
    }

    /// Ask the server to shut down. Needs the SHUTDOWN privilege.
    pub async fn cmd_shutdown(
        &mut self,
        cx: &Cx,
        level: Option<ShutdownLevel>,
    ) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        let level = level.unwrap_or_default() as u8;
        into_outcome(
            self.simple_command(&command_payload(Command::Shutdown, &[level]))
                .await,
        )
    }

    /// Make the server dump debug information to its error log. The reply
    /// is an EOF packet.
    pub async fn cmd_debug(&mut self, cx: &Cx) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(
            self.simple_command(&command_payload(Command::Debug, &[]))
                .await,
        )
    }

    /// Ask the server to kill a connection by id.
    pub async fn cmd_process_kill(&mut self, cx: &Cx, connection_id: u32) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(
            self.simple_command(&command_payload(
                Command::ProcessKill,
                &connection_id.to_le_bytes(),
            ))
            .await,
        )
    }

    /// Reset session state without re-authenticating (server 5.7.3+).
    pub async fn cmd_reset_connection(&mut self, cx: &Cx) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(self.reset_connection_inner().await)
    }

    async fn reset_connection_inner(&mut self) -> Result<OkPacket> {
        if !self.server_version_at_least(5, 7, 3) {
            return Err(Error::NotSupported(
                "MySQL version 5.7.2 and earlier does not support COM_RESET_CONNECTION"
                    .to_string(),
            ));
        }
        let ok = self
            .simple_command(&command_payload(Command::ResetConnection, &[]))
            .await?;
        self.post_connection().await?;
        Ok(ok)
    }

    /// Re-authenticate as another user on the same connection.
    #[tracing::instrument(level = "debug", skip(self, cx, password))]
    pub async fn cmd_change_user(
        &mut self,
        cx: &Cx,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(self.change_user_inner(user, password, database).await)
    }

    async fn change_user_inner(
        &mut self,
        user: &str,
        password: &str,
        database: Option<&str>,
    ) -> Result<OkPacket> {
        self.require_ready()?;
        self.ensure_no_unread().await?;
        if self.transport.is_compressed() {
            return Err(Error::NotSupported(
                "Change user is not supported with compression".to_string(),
            ));
        }
        let Some(seed) = self.handshake.as_ref().map(|h| h.auth_data.clone()) else {
            return Err(Error::programming(
                ProgrammingErrorKind::NotConnected,
                "No handshake information available",
            ));
        };

        let secure = self.transport.is_tls() || self.transport.is_unix_socket();
        let plugin = self.auth_plugin;
        let auth_response = plugin.initial_response(password, &seed, secure)?;
        let payload = handshake::build_change_user(
            self.client_flags,
            user,
            &auth_response,
            database,
            self.config.charset,
            plugin.name(),
            &self.config.attributes,
        );
        self.transport.reset_sequence();
        self.send(&payload).await?;

        let authenticated = self.authenticate(plugin, seed, secure, password).await;
        let ok = self.check_io(authenticated)?;
        self.apply_ok(&ok);
        tracing::debug!(user = %user, "changed user");

        self.config.user = user.to_string();
        self.config.password = (!password.is_empty()).then(|| password.to_string());
        self.config.database = database.map(str::to_string);
        if self.client_flags & capabilities::CLIENT_CONNECT_WITH_DB == 0 {
            if let Some(db) = database {
                self.simple_command(&command_payload(Command::InitDb, db.as_bytes()))
                    .await?;
            }
        }
        self.post_connection().await?;
        Ok(ok)
    }

    /// Reset the session, then set the given user and session variables.
    ///
    /// Uses COM_RESET_CONNECTION on 5.7.3+, otherwise re-authenticates as
    /// the current user, which is impossible once compression is active.
    pub async fn reset_session(
        &mut self,
        cx: &Cx,
        user_variables: &[(&str, Value)],
        session_variables: &[(&str, Value)],
    ) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(
            self.reset_session_inner(user_variables, session_variables)
                .await,
        )
    }

    pub(crate) async fn reset_session_inner(
        &mut self,
        user_variables: &[(&str, Value)],
        session_variables: &[(&str, Value)],
    ) -> Result<()> {
        self.require_ready()?;
        match self.reset_connection_inner().await {
            Ok(_) => {}
            Err(Error::NotSupported(_)) => {
                if self.transport.is_compressed() {
                    return Err(Error::NotSupported(
                        "Reset session is not supported with compression for MySQL server version 5.7.2 or earlier"
                            .to_string(),
                    ));
                }
                let user = self.config.user.clone();
                let password = self.config.password_str().to_string();
                let database = self.config.database.clone();
                self.change_user_inner(&user, &password, database.as_deref())
                    .await?;
            }
            Err(e) => return Err(e),
        }

        for (name, value) in user_variables {
            let sql = format!("SET @{} = {}", quote_identifier(name), format_value_for_sql(value));
            self.execute_simple(&sql).await?;
        }
        for (name, value) in session_variables {
            let sql = format!(
                "SET SESSION {} = {}",
                quote_identifier(name),
                format_value_for_sql(value)
            );
            self.execute_simple(&sql).await?;
        }
        Ok(())
    }

    // === Prepared statements ===

    /// Prepare a statement on the server.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn cmd_stmt_prepare(&mut self, cx: &Cx, sql: &str) -> Outcome<PreparedStatement, Error> {
        cancel_point!(cx);
        into_outcome(self.prepare_inner(sql).await)
    }

    pub(crate) async fn prepare_inner(&mut self, sql: &str) -> Result<PreparedStatement> {
        self.send_command(&prepared::build_stmt_prepare(sql))
            .await?;
        let packet = self.recv().await?;
        if is_err_packet(&packet) {
            return Err(error_from_packet(&packet));
        }
        let header = prepared::parse_stmt_prepare_ok(&packet)?;

        let params = if header.num_params > 0 {
            self.read_column_defs(usize::from(header.num_params))
                .await?
                .0
        } else {
            Vec::new()
        };
        let columns = if header.num_columns > 0 {
            self.read_column_defs(usize::from(header.num_columns))
                .await?
                .0
        } else {
            Vec::new()
        };
        tracing::debug!(
            statement_id = header.statement_id,
            params = params.len(),
            columns = columns.len(),
            "statement prepared"
        );
        Ok(PreparedStatement {
            statement_id: header.statement_id,
            sql: sql.to_string(),
            params,
            columns,
        })
    }

    /// Execute a prepared statement.
    ///
    /// `long_data` lists parameter indexes whose data was already streamed
    /// with [`Self::cmd_stmt_send_long_data`].
    pub async fn cmd_stmt_execute(
        &mut self,
        cx: &Cx,
        statement: &PreparedStatement,
        params: &[Value],
        long_data: &[usize],
    ) -> Outcome<CommandResult, Error> {
        cancel_point!(cx);
        into_outcome(self.execute_inner(statement, params, long_data).await)
    }

    pub(crate) async fn execute_inner(
        &mut self,
        statement: &PreparedStatement,
        params: &[Value],
        long_data: &[usize],
    ) -> Result<CommandResult> {
        if params.len() != statement.param_count() {
            return Err(Error::programming(
                ProgrammingErrorKind::ParameterCount,
                format!(
                    "Incorrect number of arguments executing prepared statement: expected {}, got {}",
                    statement.param_count(),
                    params.len()
                ),
            ));
        }
        let payload = prepared::build_stmt_execute(statement.statement_id, params, long_data);
        self.send_command(&payload).await?;
        let packet = self.recv().await?;
        self.handle_result(packet, true).await
    }

    /// Stream data for one parameter in chunks. The server sends no reply;
    /// a failure here only shows up on the following execute.
    pub async fn cmd_stmt_send_long_data(
        &mut self,
        cx: &Cx,
        statement_id: u32,
        param_index: u16,
        data: &[u8],
    ) -> Outcome<usize, Error> {
        cancel_point!(cx);
        let mut source = data;
        into_outcome(
            self.send_long_data_inner(statement_id, param_index, &mut source)
                .await,
        )
    }

    /// Like [`Self::cmd_stmt_send_long_data`], reading the data from
    /// `source` (a file, a socket) one chunk at a time.
    pub async fn cmd_stmt_send_long_data_from<R: AsyncRead + Unpin>(
        &mut self,
        cx: &Cx,
        statement_id: u32,
        param_index: u16,
        source: &mut R,
    ) -> Outcome<usize, Error> {
        cancel_point!(cx);
        into_outcome(
            self.send_long_data_inner(statement_id, param_index, source)
                .await,
        )
    }

    async fn send_long_data_inner<R: AsyncRead + Unpin>(
        &mut self,
        statement_id: u32,
        param_index: u16,
        source: &mut R,
    ) -> Result<usize> {
        let mut chunk = vec![0; LONG_DATA_CHUNK_SIZE];
        let mut total = 0usize;
        loop {
            let n = read_full(source, &mut chunk).await?;
            // an empty source still sends one empty chunk
            if n == 0 && total > 0 {
                break;
            }
            let payload = prepared::build_send_long_data(statement_id, param_index, &chunk[..n]);
            self.send_command(&payload).await?;
            total += n;
            if n < chunk.len() {
                break;
            }
        }
        tracing::trace!(statement_id, param_index, len = total, "long data sent");
        Ok(total)
    }

    /// Deallocate a prepared statement. No reply is sent by the server.
    pub async fn cmd_stmt_close(&mut self, cx: &Cx, statement_id: u32) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.stmt_close_inner(statement_id).await)
    }

    pub(crate) async fn stmt_close_inner(&mut self, statement_id: u32) -> Result<()> {
        self.send_command(&prepared::build_stmt_close(statement_id))
            .await
    }

    /// Clear long data accumulated for a statement.
    pub async fn cmd_stmt_reset(&mut self, cx: &Cx, statement_id: u32) -> Outcome<OkPacket, Error> {
        cancel_point!(cx);
        into_outcome(self.stmt_reset_inner(statement_id).await)
    }

    pub(crate) async fn stmt_reset_inner(&mut self, statement_id: u32) -> Result<OkPacket> {
        self.simple_command(&prepared::build_stmt_reset(statement_id))
            .await
    }

    // === Transactions ===

    /// Start a transaction; fails if one is already in progress.
    pub async fn start_transaction(
        &mut self,
        cx: &Cx,
        options: TransactionOptions,
    ) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.start_transaction_inner(options).await)
    }

    async fn start_transaction_inner(&mut self, options: TransactionOptions) -> Result<()> {
        if self.in_transaction() {
            return Err(Error::programming(
                ProgrammingErrorKind::TransactionInProgress,
                "Transaction already in progress",
            ));
        }
        if let Some(level) = options.isolation_level {
            self.execute_simple(&format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()))
                .await?;
        }
        if let Some(read_only) = options.read_only {
            if !self.server_version_at_least(5, 6, 5) {
                return Err(Error::NotSupported(format!(
                    "MySQL server version {} does not support transaction access modes",
                    self.server_version_string().unwrap_or("unknown")
                )));
            }
            let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
            self.execute_simple(&format!("SET TRANSACTION {}", mode))
                .await?;
        }

        let mut sql = String::from("START TRANSACTION");
        if options.consistent_snapshot {
            sql.push_str(" WITH CONSISTENT SNAPSHOT");
        }
        self.execute_simple(&sql).await?;
        tracing::debug!(?options, "transaction started");
        Ok(())
    }

    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        cancel_point!(cx);
        into_outcome(self.execute_simple("COMMIT").await)
    }

    /// Roll back, draining any unread result first.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        cancel_point!(cx);
        let result = match self.drain_results().await {
            Ok(()) => self.execute_simple("ROLLBACK").await,
            Err(e) => Err(e),
        };
        into_outcome(result)
    }

    // === Session variables ===

    /// Current default database, via `SELECT DATABASE()`.
    pub async fn database(&mut self, cx: &Cx) -> Outcome<Option<String>, Error> {
        cancel_point!(cx);
        into_outcome(
            self.info_query("SELECT DATABASE()")
                .await
                .map(|v| value_string(&v)),
        )
    }

    pub async fn set_database(&mut self, cx: &Cx, database: &str) -> Outcome<(), Error> {
        cancel_point!(cx);
        let result = self
            .execute_simple(&format!("USE {}", quote_identifier(database)))
            .await;
        if result.is_ok() {
            self.config.database = Some(database.to_string());
        }
        into_outcome(result)
    }

    pub async fn time_zone(&mut self, cx: &Cx) -> Outcome<String, Error> {
        cancel_point!(cx);
        into_outcome(
            self.info_query("SELECT @@session.time_zone")
                .await
                .map(|v| value_string(&v).unwrap_or_default()),
        )
    }

    pub async fn set_time_zone(&mut self, cx: &Cx, time_zone: &str) -> Outcome<(), Error> {
        cancel_point!(cx);
        let result = self
            .execute_simple(&format!("SET @@session.time_zone = {}", escape_string(time_zone)))
            .await;
        if result.is_ok() {
            self.config.time_zone = Some(time_zone.to_string());
        }
        into_outcome(result)
    }

    pub async fn sql_mode(&mut self, cx: &Cx) -> Outcome<String, Error> {
        cancel_point!(cx);
        into_outcome(
            self.info_query("SELECT @@session.sql_mode")
                .await
                .map(|v| value_string(&v).unwrap_or_default()),
        )
    }

    pub async fn set_sql_mode(&mut self, cx: &Cx, sql_mode: &str) -> Outcome<(), Error> {
        cancel_point!(cx);
        let result = self
            .execute_simple(&format!("SET @@session.sql_mode = {}", escape_string(sql_mode)))
            .await;
        if result.is_ok() {
            self.config.sql_mode = Some(sql_mode.to_string());
        }
        into_outcome(result)
    }

    pub async fn autocommit(&mut self, cx: &Cx) -> Outcome<bool, Error> {
        cancel_point!(cx);
        into_outcome(self.info_query("SELECT @@session.autocommit").await.map(|v| {
            v.as_i64()
                .map(|n| n == 1)
                .or_else(|| value_string(&v).map(|s| s == "1"))
                .unwrap_or(false)
        }))
    }

    pub async fn set_autocommit(&mut self, cx: &Cx, enabled: bool) -> Outcome<(), Error> {
        cancel_point!(cx);
        let value = if enabled { "ON" } else { "OFF" };
        let result = self
            .execute_simple(&format!("SET @@session.autocommit = {}", value))
            .await;
        if result.is_ok() {
            self.config.autocommit = Some(enabled);
        }
        into_outcome(result)
    }

    /// `SHOW WARNINGS` for the last statement.
    pub async fn warnings(&mut self, cx: &Cx) -> Outcome<Vec<Warning>, Error> {
        cancel_point!(cx);
        into_outcome(self.fetch_warnings().await)
    }

    // === Liveness and reconnection ===

    /// Ping the server; `false` on any failure.
    pub async fn is_connected(&mut self, cx: &Cx) -> bool {
        if cx.cancel_reason().is_some() {
            return false;
        }
        self.ping_inner().await.is_ok()
    }

    /// Check the server is reachable, optionally reconnecting.
    pub async fn ping(
        &mut self,
        cx: &Cx,
        reconnect: bool,
        attempts: u32,
        delay: Duration,
    ) -> Outcome<(), Error> {
        cancel_point!(cx);
        match self.ping_inner().await {
            Ok(_) => Outcome::Ok(()),
            Err(e) if reconnect => {
                tracing::warn!(error = %e, "ping failed, reconnecting");
                self.reconnect(cx, attempts, delay).await
            }
            Err(e) => Outcome::Err(Error::Operational(OperationalError {
                kind: OperationalErrorKind::NotAvailable,
                message: "Connection to MySQL is not available".to_string(),
                address: Some(self.transport.address().to_string()),
                source: Some(Box::new(e)),
            })),
        }
    }

    /// Reconnect, trying up to `attempts` times with `delay` between tries.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(address = %self.transport.address()))]
    pub async fn reconnect(&mut self, cx: &Cx, attempts: u32, delay: Duration) -> Outcome<(), Error> {
        let attempts = attempts.max(1);
        let mut counter = 0;
        loop {
            cancel_point!(cx);
            counter += 1;
            self.disconnect();
            let result = match self.open().await {
                Ok(()) => self.ping_inner().await.map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::info!(attempt = counter, "reconnected");
                    return Outcome::Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt = counter, attempts, error = %e, "reconnect attempt failed");
                    if counter >= attempts {
                        return Outcome::Err(Error::interface(
                            InterfaceErrorKind::Reconnect,
                            format!(
                                "Can not reconnect to MySQL after {} attempt(s): {}",
                                attempts, e
                            ),
                        ));
                    }
                }
            }
            if !delay.is_zero() {
                sleep(wall_now(), delay).await;
            }
        }
    }

    /// Drop the socket without telling the server.
    pub fn disconnect(&mut self) {
        if self.transport.is_open() {
            tracing::debug!(address = %self.transport.address(), "disconnecting");
        }
        self.mark_disconnected();
    }

    /// Tell the server we are leaving; the socket is closed either way.
    pub async fn cmd_quit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        cancel_point!(cx);
        let result = if self.transport.is_open() {
            self.transport.reset_sequence();
            self.transport
                .send(&command_payload(Command::Quit, &[]))
                .await
        } else {
            Ok(())
        };
        self.mark_disconnected();
        into_outcome(result)
    }

    /// Close the connection (best-effort COM_QUIT).
    pub async fn close(mut self, cx: &Cx) -> Result<()> {
        if let Outcome::Err(e) = self.cmd_quit(cx).await {
            tracing::debug!(error = %e, "COM_QUIT failed during close");
        }
        Ok(())
    }
}

/// Reply to plugin-specific continuation data, if one is due.
fn continue_auth(
    plugin: AuthPlugin,
    password: &str,
    seed: &[u8],
    data: &[u8],
    secure: bool,
) -> Result<Option<Vec<u8>>> {
    match (plugin, data.first().copied()) {
        (AuthPlugin::CachingSha2, Some(caching_sha2::FAST_AUTH_SUCCESS)) => {
            tracing::trace!("caching_sha2 fast auth succeeded");
            Ok(None)
        }
        (AuthPlugin::CachingSha2, Some(caching_sha2::PERFORM_FULL_AUTH)) => {
            tracing::debug!(secure, "caching_sha2 full authentication");
            Ok(Some(if secure {
                auth::clear_password(password)
            } else {
                vec![caching_sha2::REQUEST_PUBLIC_KEY]
            }))
        }
        // Anything else is the server's PEM public key
        (AuthPlugin::CachingSha2 | AuthPlugin::Sha256, Some(_)) => {
            auth::sha256_password_rsa(password, seed, data).map(Some)
        }
        _ => Err(Error::interface(
            InterfaceErrorKind::Protocol,
            format!(
                "Unexpected authentication data for plugin {}",
                plugin.name()
            ),
        )),
    }
}

fn parse_statistics(text: &str) -> BTreeMap<String, String> {
    text.split("  ")
        .filter_map(|part| part.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Text(s) | Value::Decimal(s) => Some(s.clone()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(f) => Some(f.to_string()),
        Value::Date(d) => Some(d.to_string()),
        Value::Time(t) => Some(t.to_string()),
        Value::DateTime(dt) => Some(dt.to_string()),
        Value::Json(j) => Some(j.to_string()),
    }
}

#[cfg(test)]
impl MySqlConnection {
    /// Connection whose socket replays `incoming`; the returned buffer
    /// captures what the client writes.
    pub(crate) async fn connect_scripted(
        config: MySqlConfig,
        incoming: Vec<u8>,
    ) -> (Result<Self>, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let (transport, written) = Transport::memory(incoming);
        let mut conn = Self::new(config);
        conn.transport = transport;
        let result = conn.establish().await;
        (result.map(|()| conn), written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::server_status::{
        SERVER_MORE_RESULTS_EXISTS, SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS,
    };
    use crate::testing::{self, client_packets};
    use crate::transport::testing::Script;
    use crate::types::FieldType;
    use asupersync::runtime::RuntimeBuilder;

    fn connected_script(version: &str) -> Script {
        Script::default()
            .packet(0, &testing::greeting(version, "mysql_native_password"))
            .packet(2, &testing::ok_plain())
    }

    fn config() -> MySqlConfig {
        MySqlConfig::new().user("app").password("secret")
    }

    fn select_two_rows(script: Script, status: u16) -> Script {
        script
            .packet(1, &testing::column_count(2))
            .packet(2, &testing::column_def("id", FieldType::LongLong, 0))
            .packet(3, &testing::column_def("name", FieldType::VarString, 0))
            .packet(4, &testing::eof_plain())
            .packet(5, &testing::text_row(&[Some("1"), Some("a")]))
            .packet(6, &testing::text_row(&[Some("2"), None]))
            .packet(7, &testing::eof(status, 0))
    }

    #[test]
    fn handshake_sends_native_scramble() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let (conn, written) =
                MySqlConnection::connect_scripted(config().database("shop"), connected_script("8.0.36").into_bytes())
                    .await;
            let conn = conn.unwrap();
            assert_eq!(conn.state(), ConnectionState::Ready);
            assert_eq!(conn.connection_id(), Some(42));
            assert_eq!(conn.server_version(), Some((8, 0, 36)));
            assert_eq!(conn.generation(), 1);

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets.len(), 1);
            let (seq, payload) = &packets[0];
            assert_eq!(*seq, 1);
            let scramble = auth::mysql_native_password("secret", testing::SEED);
            assert!(payload.windows(scramble.len()).any(|w| w == scramble.as_slice()));
            assert!(payload.windows(5).any(|w| w == b"shop\0"));
        });
    }

    #[test]
    fn unsupported_server_version_is_rejected() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default().packet(0, &testing::greeting("4.0.30", ""));
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            match conn {
                Err(Error::Interface(e)) => {
                    assert_eq!(e.kind, InterfaceErrorKind::UnsupportedServer);
                }
                other => panic!("expected unsupported server, got {other:?}"),
            }
        });
    }

    #[test]
    fn auth_switch_then_ok() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let mut switch = vec![0xFE];
            switch.extend_from_slice(b"mysql_native_password\0");
            switch.extend_from_slice(b"ZYXWVUTSRQPONMLKJIHG\0");
            let script = Script::default()
                .packet(0, &testing::greeting("8.0.36", "caching_sha2_password"))
                .packet(2, &switch)
                .packet(4, &testing::ok_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            assert!(conn.is_ok());

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets.len(), 2);
            assert_eq!(packets[1].0, 3);
            assert_eq!(
                packets[1].1,
                auth::mysql_native_password("secret", b"ZYXWVUTSRQPONMLKJIHG")
            );
        });
    }

    #[test]
    fn caching_sha2_fast_auth() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default()
                .packet(0, &testing::greeting("8.0.36", "caching_sha2_password"))
                .packet(2, &[0x01, caching_sha2::FAST_AUTH_SUCCESS])
                .packet(3, &testing::ok_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            assert!(conn.is_ok());
            assert_eq!(client_packets(&written.lock().unwrap()).len(), 1);
        });
    }

    #[test]
    fn caching_sha2_full_auth_requests_public_key() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default()
                .packet(0, &testing::greeting("8.0.36", "caching_sha2_password"))
                .packet(2, &[0x01, caching_sha2::PERFORM_FULL_AUTH])
                .packet(4, &testing::err(1045, "28000", "Access denied"));
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            assert_eq!(conn.unwrap_err().server_code(), Some(1045));

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets[1], (3, vec![caching_sha2::REQUEST_PUBLIC_KEY]));
        });
    }

    #[test]
    fn old_password_sentinel_is_not_supported() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default()
                .packet(0, &testing::greeting("5.5.60", "mysql_native_password"))
                .packet(2, &[0xFE]);
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            assert!(matches!(conn, Err(Error::NotSupported(_))));
        });
    }

    #[test]
    fn access_denied_surfaces_server_error() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let script = Script::default()
                .packet(0, &testing::greeting("8.0.36", "mysql_native_password"))
                .packet(2, &testing::err(1045, "28000", "Access denied for user 'app'"));
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let err = conn.unwrap_err();
            assert_eq!(err.sql_state(), Some("28000"));
            assert!(!err.is_retryable());
        });
    }

    #[test]
    fn query_rows_and_unread_guard() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = select_two_rows(connected_script("8.0.36"), SERVER_STATUS_AUTOCOMMIT)
                .packet(1, &testing::ok(1, 7, SERVER_STATUS_AUTOCOMMIT, 0));
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let Outcome::Ok(result) = conn.cmd_query(&cx, "SELECT id, name FROM t").await else {
                panic!("query failed");
            };
            assert_eq!(result.columns().map(<[ColumnDef]>::len), Some(2));
            assert!(conn.has_unread_result());

            // every command is refused until the rows are read
            assert!(matches!(
                conn.cmd_ping(&cx).await,
                Outcome::Err(Error::Programming(ref e)) if e.kind == ProgrammingErrorKind::UnreadResult
            ));
            assert!(matches!(
                conn.cmd_query(&cx, "SELECT 1").await,
                Outcome::Err(Error::Programming(_))
            ));

            let Outcome::Ok(Some(first)) = conn.get_row(&cx).await else {
                panic!("expected a row");
            };
            assert_eq!(first.get(0), Some(&Value::Int(1)));
            assert_eq!(first.get_by_name("name"), Some(&Value::Text("a".to_string())));

            let Outcome::Ok((rows, eof)) = conn.get_rows(&cx, None).await else {
                panic!("get_rows failed");
            };
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get(1), Some(&Value::Null));
            assert!(eof.is_some());
            assert!(!conn.has_unread_result());

            let Outcome::Ok(CommandResult::Ok(ok)) =
                conn.cmd_query(&cx, "INSERT INTO t VALUES (3)").await
            else {
                panic!("insert failed");
            };
            assert_eq!(ok.affected_rows, 1);
            assert_eq!(conn.last_insert_id(), 7);
        });
    }

    #[test]
    fn consume_results_config_drains_automatically() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = select_two_rows(connected_script("8.0.36"), SERVER_STATUS_AUTOCOMMIT)
                .packet(1, &testing::ok_plain());
            let (conn, written) = MySqlConnection::connect_scripted(
                config().consume_results(true),
                script.into_bytes(),
            )
            .await;
            let mut conn = conn.unwrap();
            assert!(matches!(conn.cmd_query(&cx, "SELECT id, name FROM t").await, Outcome::Ok(_)));
            assert!(matches!(conn.cmd_ping(&cx).await, Outcome::Ok(_)));

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets.last().map(|p| p.1.clone()), Some(vec![Command::Ping as u8]));
        });
    }

    #[test]
    fn multi_statement_results() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let more = SERVER_STATUS_AUTOCOMMIT | SERVER_MORE_RESULTS_EXISTS;
            let script = connected_script("8.0.36")
                .packet(1, &testing::ok(1, 0, more, 0))
                .packet(2, &testing::column_count(1))
                .packet(3, &testing::column_def("x", FieldType::LongLong, 0))
                .packet(4, &testing::eof(more, 0))
                .packet(5, &testing::text_row(&[Some("5")]))
                .packet(6, &testing::eof(SERVER_STATUS_AUTOCOMMIT, 0));
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let Outcome::Ok(first) = conn.cmd_query_many(&cx, "INSERT ...; SELECT 5").await else {
                panic!("query failed");
            };
            assert!(!first.has_rows());
            assert!(conn.has_more_results());

            let Outcome::Ok(Some(second)) = conn.next_result(&cx).await else {
                panic!("expected second result");
            };
            assert!(second.has_rows());
            let Outcome::Ok((rows, _)) = conn.get_rows(&cx, None).await else {
                panic!("rows");
            };
            assert_eq!(rows[0].get(0), Some(&Value::Int(5)));

            assert!(matches!(conn.next_result(&cx).await, Outcome::Ok(None)));
            assert!(matches!(conn.next_result(&cx).await, Outcome::Ok(None)));
        });
    }

    #[test]
    fn single_query_with_more_results_fails() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let more = SERVER_STATUS_AUTOCOMMIT | SERVER_MORE_RESULTS_EXISTS;
            let script = connected_script("8.0.36")
                .packet(1, &testing::ok(0, 0, more, 0))
                .packet(2, &testing::ok_plain());
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            match conn.cmd_query(&cx, "SET @a = 1; SET @b = 2").await {
                Outcome::Err(Error::Interface(e)) => {
                    assert_eq!(e.kind, InterfaceErrorKind::UnexpectedResult);
                }
                other => panic!("expected interface error, got {other:?}"),
            }
            assert!(matches!(conn.next_result(&cx).await, Outcome::Ok(Some(_))));
            assert!(!conn.has_more_results());
        });
    }

    #[test]
    fn server_error_keeps_connection_usable() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = connected_script("8.0.36")
                .packet(1, &testing::err(1146, "42S02", "Table 'test.nope' doesn't exist"))
                .packet(1, &testing::ok_plain());
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let Outcome::Err(err) = conn.cmd_query(&cx, "SELECT * FROM nope").await else {
                panic!("expected error");
            };
            assert_eq!(err.server_code(), Some(1146));
            assert!(conn.is_open());
            assert!(matches!(conn.cmd_ping(&cx).await, Outcome::Ok(_)));
        });
    }

    #[test]
    fn dropped_socket_disconnects() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let (conn, _) =
                MySqlConnection::connect_scripted(config(), connected_script("8.0.36").into_bytes())
                    .await;
            let mut conn = conn.unwrap();

            let Outcome::Err(err) = conn.cmd_ping(&cx).await else {
                panic!("expected failure");
            };
            assert!(err.is_connection_error());
            assert_eq!(conn.state(), ConnectionState::Disconnected);
            assert!(!conn.is_connected(&cx).await);
        });
    }

    #[test]
    fn start_transaction_twice_fails() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let in_trans = SERVER_STATUS_AUTOCOMMIT | SERVER_STATUS_IN_TRANS;
            let script = connected_script("8.0.36")
                .packet(1, &testing::ok_plain())
                .packet(1, &testing::ok(0, 0, in_trans, 0))
                .packet(1, &testing::ok_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let options = TransactionOptions::new()
                .isolation_level("read-committed".parse().unwrap())
                .consistent_snapshot(true);
            assert!(matches!(conn.start_transaction(&cx, options).await, Outcome::Ok(())));
            assert!(conn.in_transaction());

            match conn.start_transaction(&cx, TransactionOptions::new()).await {
                Outcome::Err(Error::Programming(e)) => {
                    assert_eq!(e.kind, ProgrammingErrorKind::TransactionInProgress);
                }
                other => panic!("expected programming error, got {other:?}"),
            }

            assert!(matches!(conn.commit(&cx).await, Outcome::Ok(())));
            assert!(!conn.in_transaction());

            let sent: Vec<String> = client_packets(&written.lock().unwrap())
                .into_iter()
                .skip(1)
                .map(|(_, p)| String::from_utf8_lossy(&p[1..]).into_owned())
                .collect();
            assert_eq!(
                sent,
                [
                    "SET TRANSACTION ISOLATION LEVEL READ COMMITTED",
                    "START TRANSACTION WITH CONSISTENT SNAPSHOT",
                    "COMMIT"
                ]
            );
        });
    }

    #[test]
    fn read_only_transactions_need_5_6_5() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let (conn, _) =
                MySqlConnection::connect_scripted(config(), connected_script("5.6.4").into_bytes())
                    .await;
            let mut conn = conn.unwrap();
            let options = TransactionOptions::new().read_only(true);
            assert!(matches!(
                conn.start_transaction(&cx, options).await,
                Outcome::Err(Error::NotSupported(_))
            ));
        });
    }

    #[test]
    fn rollback_drains_unread_rows() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = select_two_rows(connected_script("8.0.36"), SERVER_STATUS_AUTOCOMMIT)
                .packet(1, &testing::ok_plain());
            let (conn, _) = MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();
            assert!(matches!(conn.cmd_query(&cx, "SELECT id, name FROM t").await, Outcome::Ok(_)));
            assert!(matches!(conn.rollback(&cx).await, Outcome::Ok(())));
            assert!(!conn.has_unread_result());
        });
    }

    #[test]
    fn reset_connection_requires_5_7_3() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let (conn, _) =
                MySqlConnection::connect_scripted(config(), connected_script("5.7.2").into_bytes())
                    .await;
            let mut conn = conn.unwrap();
            assert!(matches!(
                conn.cmd_reset_connection(&cx).await,
                Outcome::Err(Error::NotSupported(_))
            ));
        });
    }

    #[test]
    fn reset_session_sets_variables() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = connected_script("8.0.36")
                .packet(1, &testing::ok_plain())
                .packet(1, &testing::ok_plain())
                .packet(1, &testing::ok_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();
            let outcome = conn
                .reset_session(
                    &cx,
                    &[("counter", Value::Int(3))],
                    &[("sql_mode", Value::Text("ANSI".to_string()))],
                )
                .await;
            assert!(matches!(outcome, Outcome::Ok(())));

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets[1].1, vec![Command::ResetConnection as u8]);
            assert_eq!(&packets[2].1[1..], b"SET @`counter` = 3");
            assert_eq!(&packets[3].1[1..], b"SET SESSION `sql_mode` = 'ANSI'");
        });
    }

    #[test]
    fn prepared_statement_roundtrip() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let mut binary_row = vec![0x00, 0x00];
            binary_row.extend_from_slice(&9i64.to_le_bytes());
            let script = connected_script("8.0.36")
                .packet(1, &testing::stmt_prepare_ok(5, 1, 1))
                .packet(2, &testing::column_def("?", FieldType::LongLong, 0))
                .packet(3, &testing::eof_plain())
                .packet(4, &testing::column_def("id", FieldType::LongLong, 0))
                .packet(5, &testing::eof_plain())
                .packet(1, &testing::column_count(1))
                .packet(2, &testing::column_def("id", FieldType::LongLong, 0))
                .packet(3, &testing::eof_plain())
                .packet(4, &binary_row)
                .packet(5, &testing::eof_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let Outcome::Ok(stmt) = conn.cmd_stmt_prepare(&cx, "SELECT id FROM t WHERE id = ?").await
            else {
                panic!("prepare failed");
            };
            assert_eq!(stmt.statement_id, 5);
            assert_eq!(stmt.param_count(), 1);

            assert!(matches!(
                conn.cmd_stmt_execute(&cx, &stmt, &[], &[]).await,
                Outcome::Err(Error::Programming(_))
            ));

            let long = vec![b'x'; LONG_DATA_CHUNK_SIZE + 10];
            assert!(matches!(
                conn.cmd_stmt_send_long_data(&cx, 5, 0, &long).await,
                Outcome::Ok(n) if n == long.len()
            ));

            let Outcome::Ok(result) = conn.cmd_stmt_execute(&cx, &stmt, &[Value::Int(9)], &[]).await
            else {
                panic!("execute failed");
            };
            assert!(result.has_rows());
            let Outcome::Ok((rows, _)) = conn.get_rows(&cx, None).await else {
                panic!("rows");
            };
            assert_eq!(rows[0].get(0), Some(&Value::Int(9)));

            assert!(matches!(conn.cmd_stmt_close(&cx, 5).await, Outcome::Ok(())));

            let packets = client_packets(&written.lock().unwrap());
            let long_data: Vec<_> = packets
                .iter()
                .filter(|(_, p)| p[0] == Command::StmtSendLongData as u8)
                .collect();
            assert_eq!(long_data.len(), 2);
            assert!(long_data.iter().all(|(seq, _)| *seq == 0));
            assert_eq!(packets.last().map(|p| p.1[0]), Some(Command::StmtClose as u8));
        });
    }

    #[test]
    fn statistics_are_parsed() {
        let stats = parse_statistics(
            "Uptime: 120  Threads: 2  Questions: 14  Slow queries: 0  Queries per second avg: 0.116",
        );
        assert_eq!(stats.get("Uptime").map(String::as_str), Some("120"));
        assert_eq!(stats.get("Slow queries").map(String::as_str), Some("0"));
        assert_eq!(stats.len(), 5);
    }

    #[test]
    fn isolation_level_parsing() {
        assert_eq!(
            "  repeatable-read ".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            "SERIALIZABLE".parse::<IsolationLevel>().unwrap().as_sql(),
            "SERIALIZABLE"
        );
        assert!("snapshot".parse::<IsolationLevel>().is_err());
    }

    #[test]
    fn reconnect_reports_attempts() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            // nothing listens on port 1
            let mut conn = MySqlConnection::new(
                config()
                    .host("127.0.0.1")
                    .port(1)
                    .connect_timeout(Duration::from_millis(200)),
            );
            match conn.ping(&cx, true, 3, Duration::ZERO).await {
                Outcome::Err(Error::Interface(e)) => {
                    assert_eq!(e.kind, InterfaceErrorKind::Reconnect);
                    assert!(e.message.starts_with("Can not reconnect to MySQL after 3 attempt(s)"));
                }
                other => panic!("expected reconnect failure, got {other:?}"),
            }
            assert_eq!(conn.state(), ConnectionState::Disconnected);
        });
    }

    fn local_infile_request(path: &str) -> Vec<u8> {
        let mut request = vec![0xFB];
        request.extend_from_slice(path.as_bytes());
        request
    }

    #[test]
    fn local_infile_streams_file() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let path = std::env::temp_dir().join(format!("mywire-infile-{}.csv", std::process::id()));
            std::fs::write(&path, b"1,ada\n2,bob\n").unwrap();
            let script = connected_script("8.0.36")
                .packet(1, &local_infile_request(&path.to_string_lossy()))
                .packet(4, &testing::ok(2, 0, SERVER_STATUS_AUTOCOMMIT, 0));
            let (conn, written) = MySqlConnection::connect_scripted(
                config().allow_local_infile(true),
                script.into_bytes(),
            )
            .await;
            let mut conn = conn.unwrap();

            let sql = "LOAD DATA LOCAL INFILE 'people.csv' INTO TABLE people";
            assert!(matches!(conn.cmd_query(&cx, sql).await, Outcome::Ok(CommandResult::Ok(_))));
            assert_eq!(conn.affected_rows(), 2);
            assert!(!conn.has_unread_result());

            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets.len(), 4);
            assert_eq!(packets[2], (2, b"1,ada\n2,bob\n".to_vec()));
            assert_eq!(packets[3], (3, Vec::new()));
            std::fs::remove_file(&path).ok();
        });
    }

    #[test]
    fn local_infile_refused_when_disabled() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = connected_script("8.0.36")
                .packet(1, &local_infile_request("/etc/hostname"))
                .packet(3, &testing::ok_plain())
                .packet(1, &testing::ok_plain());
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            match conn.cmd_query(&cx, "LOAD DATA LOCAL INFILE '/etc/hostname' INTO TABLE t").await {
                Outcome::Err(Error::Interface(e)) => {
                    assert_eq!(e.kind, InterfaceErrorKind::LocalInfile);
                    assert!(e.message.contains("allow_local_infile"));
                }
                other => panic!("expected refusal, got {other:?}"),
            }
            // only the terminating empty packet went out; the connection is still usable
            assert!(matches!(conn.cmd_ping(&cx).await, Outcome::Ok(_)));
            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets[2], (2, Vec::new()));
            assert_eq!(packets[3], (0, vec![Command::Ping as u8]));
        });
    }

    #[test]
    fn local_infile_missing_file() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let missing = std::env::temp_dir().join("mywire-no-such-file.csv");
            let script = connected_script("8.0.36")
                .packet(1, &local_infile_request(&missing.to_string_lossy()))
                .packet(3, &testing::ok_plain());
            let (conn, written) = MySqlConnection::connect_scripted(
                config().allow_local_infile(true),
                script.into_bytes(),
            )
            .await;
            let mut conn = conn.unwrap();

            match conn.cmd_query(&cx, "LOAD DATA LOCAL INFILE 'x' INTO TABLE t").await {
                Outcome::Err(Error::Interface(e)) => {
                    assert_eq!(e.kind, InterfaceErrorKind::LocalInfile);
                    assert!(e.message.contains("could not be read"));
                }
                other => panic!("expected unreadable file, got {other:?}"),
            }
            assert!(conn.is_open());
            let packets = client_packets(&written.lock().unwrap());
            assert_eq!(packets.last(), Some(&(2, Vec::new())));
        });
    }

    #[test]
    fn refresh_shutdown_and_debug_commands() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let script = connected_script("8.0.36")
                .packet(1, &testing::ok_plain())
                .packet(1, &testing::eof_plain())
                .packet(1, &testing::eof_plain())
                .packet(1, &testing::err(1227, "42000", "Access denied; you need the SUPER privilege"));
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), script.into_bytes()).await;
            let mut conn = conn.unwrap();

            let options = crate::protocol::refresh::TABLES | crate::protocol::refresh::LOG;
            assert!(matches!(conn.cmd_refresh(&cx, options).await, Outcome::Ok(_)));
            assert!(matches!(
                conn.cmd_shutdown(&cx, Some(ShutdownLevel::WaitConnections)).await,
                Outcome::Ok(_)
            ));
            assert!(matches!(conn.cmd_debug(&cx).await, Outcome::Ok(_)));
            match conn.cmd_shutdown(&cx, None).await {
                Outcome::Err(e) => assert_eq!(e.server_code(), Some(1227)),
                other => panic!("expected privilege error, got {other:?}"),
            }

            let commands: Vec<(u8, Vec<u8>)> = client_packets(&written.lock().unwrap())
                .into_iter()
                .skip(1)
                .collect();
            assert_eq!(
                commands,
                [
                    (0, vec![Command::Refresh as u8, 0x06]),
                    (0, vec![Command::Shutdown as u8, 1]),
                    (0, vec![Command::Debug as u8]),
                    (0, vec![Command::Shutdown as u8, 0]),
                ]
            );
        });
    }

    #[test]
    fn long_data_from_reader_is_chunked() {
        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let (conn, written) =
                MySqlConnection::connect_scripted(config(), connected_script("8.0.36").into_bytes())
                    .await;
            let mut conn = conn.unwrap();

            let data = vec![b'z'; LONG_DATA_CHUNK_SIZE * 2];
            let mut source = data.as_slice();
            assert!(matches!(
                conn.cmd_stmt_send_long_data_from(&cx, 9, 1, &mut source).await,
                Outcome::Ok(n) if n == data.len()
            ));
            let mut empty: &[u8] = &[];
            assert!(matches!(
                conn.cmd_stmt_send_long_data_from(&cx, 9, 2, &mut empty).await,
                Outcome::Ok(0)
            ));

            // COM_STMT_SEND_LONG_DATA header: command, statement id, param index
            let chunks: Vec<usize> = client_packets(&written.lock().unwrap())
                .iter()
                .skip(1)
                .map(|(_, p)| p.len() - 7)
                .collect();
            assert_eq!(chunks, [LONG_DATA_CHUNK_SIZE, LONG_DATA_CHUNK_SIZE, 0]);
        });
    }

    #[cfg(unix)]
    fn read_client_packet(stream: &mut std::os::unix::net::UnixStream) -> Vec<u8> {
        use std::io::Read;
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).unwrap();
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        let mut payload = vec![0; len];
        stream.read_exact(&mut payload).unwrap();
        payload
    }

    #[cfg(unix)]
    #[test]
    fn reconnect_succeeds_once_server_is_up() {
        use std::io::Write;
        use std::os::unix::net::UnixListener;

        let path = std::env::temp_dir().join(format!("mywire-reconnect-{}.sock", std::process::id()));
        std::fs::remove_file(&path).ok();
        let server_path = path.clone();
        let server = std::thread::spawn(move || {
            // the first attempt finds no socket
            std::thread::sleep(Duration::from_millis(100));
            let listener = UnixListener::bind(&server_path).unwrap();
            let (mut stream, _) = listener.accept().unwrap();
            let greeting = Script::default()
                .packet(0, &testing::greeting("8.0.36", "mysql_native_password"))
                .into_bytes();
            stream.write_all(&greeting).unwrap();
            read_client_packet(&mut stream);
            stream
                .write_all(&Script::default().packet(2, &testing::ok_plain()).into_bytes())
                .unwrap();
            let ping = read_client_packet(&mut stream);
            stream
                .write_all(&Script::default().packet(1, &testing::ok_plain()).into_bytes())
                .unwrap();
            ping
        });

        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let mut conn = MySqlConnection::new(config().unix_socket(&path));
            assert!(matches!(
                conn.reconnect(&cx, 3, Duration::from_millis(300)).await,
                Outcome::Ok(())
            ));
            assert!(conn.is_open());
            assert_eq!(conn.generation(), 1);
            assert_eq!(conn.connection_id(), Some(42));
        });
        assert_eq!(server.join().unwrap(), vec![Command::Ping as u8]);
        std::fs::remove_file(&path).ok();
    }

    #[cfg(unix)]
    #[test]
    fn silent_server_hits_connect_timeout() {
        let path = std::env::temp_dir().join(format!("mywire-silent-{}.sock", std::process::id()));
        std::fs::remove_file(&path).ok();
        // bound but never accepting: the socket connects, the greeting never comes
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let rt = RuntimeBuilder::current_thread().build().expect("runtime");
        rt.block_on(async {
            let cx = Cx::for_testing();
            let config = config()
                .unix_socket(&path)
                .connect_timeout(Duration::from_millis(150));
            match MySqlConnection::connect(&cx, config).await {
                Outcome::Err(Error::Operational(e)) => {
                    assert_eq!(e.kind, OperationalErrorKind::Timeout);
                    assert!(e.message.contains("timed out"));
                }
                other => panic!("expected timeout, got {other:?}"),
            }
        });
        std::fs::remove_file(&path).ok();
    }
}
