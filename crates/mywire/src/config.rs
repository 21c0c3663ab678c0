//! Connection configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::protocol::capabilities;
use crate::protocol::charset;

/// SSL mode for MySQL connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Use SSL if the server offers it
    Preferred,
    /// Require SSL, without certificate checks
    Required,
    /// Require SSL and verify the server certificate
    VerifyCa,
    /// Require SSL, verify the certificate and the host name
    VerifyIdentity,
}

impl SslMode {
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

/// Certificates and verification options for TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    /// SNI / verification name; defaults to the configured host
    pub server_name: Option<String>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }
}

/// MySQL connection configuration.
#[derive(Clone)]
pub struct MySqlConfig {
    pub host: String,
    pub port: u16,
    /// Connect through this local socket instead of TCP
    pub unix_socket: Option<PathBuf>,
    /// Prefer IPv6 addresses when resolving `host`
    pub force_ipv6: bool,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Collation id sent in the handshake (default: utf8mb4_general_ci)
    pub charset: u8,
    pub connect_timeout: Duration,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Request CLIENT_COMPRESS
    pub compression: bool,
    pub max_packet_size: u32,
    /// Connection attributes sent with the handshake
    pub attributes: HashMap<String, String>,
    /// Applied with `SET @@session.autocommit` after connecting
    pub autocommit: Option<bool>,
    pub time_zone: Option<String>,
    pub sql_mode: Option<String>,
    /// Statement run right after connecting
    pub init_command: Option<String>,
    /// Extra capability bits OR-ed into the defaults
    pub client_flags: u32,
    /// Drain unread results automatically instead of failing
    pub consume_results: bool,
    /// Fetch `SHOW WARNINGS` after statements that produced warnings
    pub get_warnings: bool,
    /// Turn fetched warnings into errors
    pub raise_on_warnings: bool,
    /// Answer `LOAD DATA LOCAL INFILE` requests with the named client file
    pub allow_local_infile: bool,
}

impl std::fmt::Debug for MySqlConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("unix_socket", &self.unix_socket)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("ssl_mode", &self.ssl_mode)
            .field("compression", &self.compression)
            .finish_non_exhaustive()
    }
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            unix_socket: None,
            force_ipv6: false,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            compression: false,
            max_packet_size: 1 << 30,
            attributes: HashMap::new(),
            autocommit: None,
            time_zone: None,
            sql_mode: None,
            init_command: None,
            client_flags: 0,
            consume_results: false,
            get_warnings: false,
            raise_on_warnings: false,
            allow_local_infile: false,
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn unix_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.unix_socket = Some(path.into());
        self
    }

    pub fn force_ipv6(mut self, force: bool) -> Self {
        self.force_ipv6 = force;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = Some(enabled);
        self
    }

    pub fn time_zone(mut self, tz: impl Into<String>) -> Self {
        self.time_zone = Some(tz.into());
        self
    }

    pub fn sql_mode(mut self, mode: impl Into<String>) -> Self {
        self.sql_mode = Some(mode.into());
        self
    }

    pub fn init_command(mut self, sql: impl Into<String>) -> Self {
        self.init_command = Some(sql.into());
        self
    }

    pub fn client_flags(mut self, flags: u32) -> Self {
        self.client_flags = flags;
        self
    }

    pub fn consume_results(mut self, enabled: bool) -> Self {
        self.consume_results = enabled;
        self
    }

    pub fn get_warnings(mut self, enabled: bool) -> Self {
        self.get_warnings = enabled;
        self
    }

    pub fn raise_on_warnings(mut self, enabled: bool) -> Self {
        self.raise_on_warnings = enabled;
        if enabled {
            self.get_warnings = true;
        }
        self
    }

    pub fn allow_local_infile(mut self, enabled: bool) -> Self {
        self.allow_local_infile = enabled;
        self
    }

    /// Human-readable address used in error messages.
    pub fn address(&self) -> String {
        match &self.unix_socket {
            Some(path) => path.display().to_string(),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn password_str(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    /// Capability flags requested in the handshake response.
    ///
    /// TLS is negotiated separately, so CLIENT_SSL is never set here.
    pub fn capability_flags(&self) -> u32 {
        let mut flags = capabilities::DEFAULT_CLIENT_FLAGS | self.client_flags;
        if self.database.is_some() {
            flags |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.compression {
            flags |= capabilities::CLIENT_COMPRESS;
        }
        if !self.attributes.is_empty() {
            flags |= capabilities::CLIENT_CONNECT_ATTRS;
        }
        if self.allow_local_infile {
            flags |= capabilities::CLIENT_LOCAL_FILES;
        } else {
            flags &= !capabilities::CLIENT_LOCAL_FILES;
        }
        flags & !capabilities::CLIENT_SSL
    }
}
