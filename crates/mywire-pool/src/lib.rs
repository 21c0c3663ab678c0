//! Fixed-size connection pool for mywire.
//!
//! The pool owns up to `pool_size` connections. [`Pool::get_connection`]
//! never waits: it hands out an idle connection or fails with
//! [`PoolErrorKind::Exhausted`]. A lease ([`PooledConnection`]) derefs to
//! the connection and puts it back in the queue when dropped or released;
//! connections are reused, not closed.
//!
//! The queue and the configuration version share one lock. It is held only
//! for bookkeeping, never while a connection talks to the server.
//!
//! # Example
//!
//! ```rust,ignore
//! use mywire::MySqlConfig;
//! use mywire_pool::{MySqlPool, PoolConfig};
//!
//! let pool = MySqlPool::new(&cx, PoolConfig::new().pool_size(4), MySqlConfig::new().user("app")).await?;
//! let mut conn = pool.get_connection(&cx).await?;
//! conn.cmd_ping(&cx).await?;
//! conn.release(&cx).await;
//! ```

mod mysql;

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use asupersync::{Cx, Outcome};
use mywire_core::{Error, PoolErrorKind, Result};
use parking_lot::Mutex;
use regex::Regex;

pub use mysql::MySqlPool;

/// Largest allowed pool.
pub const MAX_POOL_SIZE: usize = 32;
/// Longest allowed pool name.
pub const MAX_POOL_NAME_LEN: usize = 64;
pub const DEFAULT_POOL_SIZE: usize = 5;

/// What the pool needs from a connection.
pub trait PoolConnection: Send + Sized + 'static {
    /// Settings a connection is opened with.
    type Config: Clone + Send + Sync + 'static;

    /// Open a new connection.
    fn connect(cx: &Cx, config: Self::Config) -> impl Future<Output = Outcome<Self, Error>> + Send;

    /// Replace the settings used by the next reconnect.
    fn reconfigure(&mut self, config: &Self::Config);

    /// Round-trip liveness check.
    fn is_connected(&mut self, cx: &Cx) -> impl Future<Output = bool> + Send;

    fn reconnect(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Clear session state left behind by the previous user.
    fn reset_session(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Close the socket without a round trip.
    fn disconnect(&mut self);

    fn server_version(&self) -> Option<(u16, u16, u16)>;

    /// Whether connections opened with `config` use the compressed protocol.
    fn uses_compression(config: &Self::Config) -> bool;

    /// Reject settings that can never produce a connection.
    fn validate_config(_config: &Self::Config) -> Result<()> {
        Ok(())
    }

    /// Pool name derived from the connection settings.
    fn generate_pool_name(config: &Self::Config) -> Result<String>;
}

/// Pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Generated from the connection settings when `None`
    pub pool_name: Option<String>,
    pub pool_size: usize,
    /// Reset each connection's session before it is reused
    pub reset_session: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_name: None,
            pool_size: DEFAULT_POOL_SIZE,
            reset_session: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_name(mut self, name: impl Into<String>) -> Self {
        self.pool_name = Some(name.into());
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn reset_session(mut self, enabled: bool) -> Self {
        self.reset_session = enabled;
        self
    }

    /// Check size bounds and the pool name, if one is set.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.pool_size > MAX_POOL_SIZE {
            return Err(Error::pool(
                PoolErrorKind::Config,
                format!(
                    "Pool size should be higher than 0 and lower or equal to {}",
                    MAX_POOL_SIZE
                ),
            ));
        }
        if let Some(name) = &self.pool_name {
            validate_pool_name(name)?;
        }
        Ok(())
    }
}

fn invalid_name_chars() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._:\-*$#]").ok())
        .as_ref()
}

/// Names are 1 to 64 characters from `[a-zA-Z0-9._:-*$#]`.
pub fn validate_pool_name(name: &str) -> Result<()> {
    if name.is_empty() || invalid_name_chars().is_some_and(|re| re.is_match(name)) {
        return Err(Error::pool(
            PoolErrorKind::Config,
            format!("Pool name '{}' contains illegal characters", name),
        ));
    }
    if name.chars().count() > MAX_POOL_NAME_LEN {
        return Err(Error::pool(
            PoolErrorKind::Config,
            format!("Pool name '{}' is too long", name),
        ));
    }
    Ok(())
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub pool_size: usize,
    /// Connections waiting in the queue
    pub idle: usize,
    /// Connections currently handed out
    pub leased: usize,
    /// Bumped by every [`Pool::set_config`]
    pub config_version: u64,
}

struct PoolEntry<C> {
    conn: C,
    /// Config version the connection was opened with
    version: u64,
    needs_reset: bool,
    /// Reconnect before the next lease
    stale: bool,
}

struct PoolState<C: PoolConnection> {
    config: Option<C::Config>,
    version: u64,
    idle: VecDeque<PoolEntry<C>>,
    leased: usize,
    /// Connections being opened by `add_connection`
    opening: usize,
}

impl<C: PoolConnection> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.leased + self.opening
    }
}

struct PoolInner<C: PoolConnection> {
    name: String,
    size: usize,
    reset_session: bool,
    state: Mutex<PoolState<C>>,
}

impl<C: PoolConnection> PoolInner<C> {
    /// Put a leased connection back.
    fn requeue(&self, entry: PoolEntry<C>) {
        let mut state = self.state.lock();
        state.leased = state.leased.saturating_sub(1);
        state.idle.push_back(entry);
        tracing::trace!(pool = %self.name, idle = state.idle.len(), "connection returned");
    }
}

/// Capacity reserved by `add_connection` while it connects. Dropping an
/// unfilled slot gives the capacity back.
struct OpeningSlot<'a, C: PoolConnection> {
    pool: &'a PoolInner<C>,
    open: bool,
}

impl<C: PoolConnection> OpeningSlot<'_, C> {
    /// Queue the new connection in place of the reservation.
    fn fill(mut self, conn: C, version: u64) {
        self.open = false;
        let mut state = self.pool.state.lock();
        state.opening = state.opening.saturating_sub(1);
        let current = state.version;
        state.idle.push_back(PoolEntry {
            conn,
            version,
            needs_reset: false,
            stale: version != current,
        });
        tracing::trace!(pool = %self.pool.name, idle = state.idle.len(), "connection added");
    }
}

impl<C: PoolConnection> Drop for OpeningSlot<'_, C> {
    fn drop(&mut self) {
        if self.open {
            let mut state = self.pool.state.lock();
            state.opening = state.opening.saturating_sub(1);
        }
    }
}

/// A connection popped from the queue but not yet handed out. If the lease
/// is abandoned it goes back marked stale, so its state is rebuilt by a
/// reconnect on the next lease.
struct Checkout<C: PoolConnection> {
    entry: Option<PoolEntry<C>>,
    pool: Arc<PoolInner<C>>,
}

impl<C: PoolConnection> Checkout<C> {
    /// Reconnect an outdated or dead connection, or reset a reused one.
    async fn refresh(
        &mut self,
        cx: &Cx,
        version: u64,
        config: Option<&C::Config>,
    ) -> Outcome<(), Error> {
        let Some(entry) = self.entry.as_mut() else {
            return Outcome::Ok(());
        };
        let mut stale = entry.stale || entry.version != version;
        if !stale && entry.needs_reset {
            match entry.conn.reset_session(cx).await {
                Outcome::Ok(()) => entry.needs_reset = false,
                Outcome::Err(e) => {
                    tracing::warn!(pool = %self.pool.name, error = %e, "session reset failed");
                    stale = true;
                }
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }
        } else if !stale && !entry.conn.is_connected(cx).await {
            tracing::warn!(pool = %self.pool.name, "pooled connection is stale");
            stale = true;
        }
        if !stale {
            return Outcome::Ok(());
        }

        if let Some(config) = config {
            entry.conn.reconfigure(config);
        }
        match entry.conn.reconnect(cx).await {
            Outcome::Ok(()) => {
                entry.version = version;
                entry.stale = false;
                entry.needs_reset = false;
                Outcome::Ok(())
            }
            other => other,
        }
    }

    fn into_lease(mut self) -> Option<PooledConnection<C>> {
        let entry = self.entry.take()?;
        Some(PooledConnection {
            conn: Some(entry.conn),
            version: entry.version,
            pool: Arc::clone(&self.pool),
        })
    }
}

impl<C: PoolConnection> Drop for Checkout<C> {
    fn drop(&mut self) {
        if let Some(mut entry) = self.entry.take() {
            entry.stale = true;
            self.pool.requeue(entry);
        }
    }
}

/// A fixed-size pool of connections.
pub struct Pool<C: PoolConnection> {
    inner: Arc<PoolInner<C>>,
}

impl<C: PoolConnection> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: PoolConnection> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .finish_non_exhaustive()
    }
}

impl<C: PoolConnection> Pool<C> {
    /// Create a pool and fill it with `pool_size` connections.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn new(cx: &Cx, pool_config: PoolConfig, config: C::Config) -> Outcome<Self, Error> {
        let name = match &pool_config.pool_name {
            Some(name) => name.clone(),
            None => match C::generate_pool_name(&config) {
                Ok(name) => name,
                Err(e) => return Outcome::Err(e),
            },
        };
        let pool = match Self::build(pool_config, name) {
            Ok(pool) => pool,
            Err(e) => return Outcome::Err(e),
        };
        if let Err(e) = pool.set_config(config) {
            return Outcome::Err(e);
        }
        for _ in 0..pool.inner.size {
            match pool.add_connection(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                Outcome::Panicked(payload) => return Outcome::Panicked(payload),
            }
        }
        tracing::debug!(pool = %pool.inner.name, size = pool.inner.size, "pool ready");
        Outcome::Ok(pool)
    }

    /// An empty pool with no connection settings yet; see
    /// [`Self::set_config`] and [`Self::add_connection`].
    pub fn without_config(pool_config: PoolConfig) -> Result<Self> {
        let Some(name) = pool_config.pool_name.clone() else {
            return Err(Error::pool(
                PoolErrorKind::Config,
                "Failed generating pool name; specify pool_name",
            ));
        };
        Self::build(pool_config, name)
    }

    fn build(pool_config: PoolConfig, name: String) -> Result<Self> {
        pool_config.validate()?;
        validate_pool_name(&name)?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                size: pool_config.pool_size,
                reset_session: pool_config.reset_session,
                state: Mutex::new(PoolState {
                    config: None,
                    version: 0,
                    idle: VecDeque::with_capacity(pool_config.pool_size),
                    leased: 0,
                    opening: 0,
                }),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn pool_size(&self) -> usize {
        self.inner.size
    }

    pub fn reset_session(&self) -> bool {
        self.inner.reset_session
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            name: self.inner.name.clone(),
            pool_size: self.inner.size,
            idle: state.idle.len(),
            leased: state.leased,
            config_version: state.version,
        }
    }

    /// Replace the connection settings. Connections opened with older
    /// settings are reconnected on their next lease.
    pub fn set_config(&self, config: C::Config) -> Result<()> {
        C::validate_config(&config).map_err(|e| {
            Error::pool(
                PoolErrorKind::Config,
                format!("Connection configuration not valid: {}", e),
            )
        })?;
        let mut state = self.inner.state.lock();
        state.config = Some(config);
        state.version += 1;
        tracing::debug!(pool = %self.inner.name, version = state.version, "pool reconfigured");
        Ok(())
    }

    /// Open one more connection and queue it.
    pub async fn add_connection(&self, cx: &Cx) -> Outcome<(), Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let (config, version) = {
            let mut state = self.inner.state.lock();
            let Some(config) = state.config.clone() else {
                return Outcome::Err(Error::pool(
                    PoolErrorKind::NoConfig,
                    "Connection configuration not available",
                ));
            };
            if state.total() >= self.inner.size {
                return Outcome::Err(Error::pool(
                    PoolErrorKind::QueueFull,
                    "Failed adding connection; queue is full",
                ));
            }
            state.opening += 1;
            (config, state.version)
        };

        let slot = OpeningSlot {
            pool: &self.inner,
            open: true,
        };
        match self.open_checked(cx, config).await {
            Outcome::Ok(conn) => {
                slot.fill(conn, version);
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(reason) => Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => Outcome::Panicked(payload),
        }
    }

    async fn open_checked(&self, cx: &Cx, config: C::Config) -> Outcome<C, Error> {
        let compressed = C::uses_compression(&config);
        let mut conn = match C::connect(cx, config).await {
            Outcome::Ok(conn) => conn,
            other => return other,
        };
        let old_server = conn.server_version().is_some_and(|v| v < (5, 7, 3));
        if self.inner.reset_session && compressed && old_server {
            conn.disconnect();
            return Outcome::Err(Error::NotSupported(
                "Pool reset session is not supported with compression for MySQL server version 5.7.2 or earlier"
                    .to_string(),
            ));
        }
        Outcome::Ok(conn)
    }

    /// Lease an idle connection without waiting.
    ///
    /// Connections opened with an outdated config, or that fail their
    /// liveness check or session reset, are reconnected first. If that
    /// fails the connection goes back to the queue and the error is
    /// returned.
    pub async fn get_connection(&self, cx: &Cx) -> Outcome<PooledConnection<C>, Error> {
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        let (entry, version, config) = {
            let mut state = self.inner.state.lock();
            let Some(entry) = state.idle.pop_front() else {
                return Outcome::Err(Error::pool(
                    PoolErrorKind::Exhausted,
                    "Failed getting connection; pool exhausted",
                ));
            };
            state.leased += 1;
            (entry, state.version, state.config.clone())
        };

        let mut checkout = Checkout {
            entry: Some(entry),
            pool: Arc::clone(&self.inner),
        };
        match checkout.refresh(cx, version, config.as_ref()).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
            Outcome::Panicked(payload) => return Outcome::Panicked(payload),
        }
        match checkout.into_lease() {
            Some(lease) => {
                tracing::debug!(pool = %self.inner.name, "connection leased");
                Outcome::Ok(lease)
            }
            None => Outcome::Err(Error::pool(
                PoolErrorKind::Exhausted,
                "Failed getting connection; pool exhausted",
            )),
        }
    }

    /// Disconnect and drop every idle connection. Leased connections are
    /// unaffected and still return to the queue.
    pub fn close_idle(&self) -> usize {
        let drained: Vec<PoolEntry<C>> = self.inner.state.lock().idle.drain(..).collect();
        let count = drained.len();
        for mut entry in drained {
            entry.conn.disconnect();
        }
        tracing::debug!(pool = %self.inner.name, closed = count, "idle connections closed");
        count
    }
}

/// A connection leased from a [`Pool`].
///
/// Dropping the lease returns the connection to the pool; its session is
/// reset on the next lease. [`Self::release`] resets it right away.
pub struct PooledConnection<C: PoolConnection> {
    conn: Option<C>,
    version: u64,
    pool: Arc<PoolInner<C>>,
}

impl<C: PoolConnection> PooledConnection<C> {
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Reset the session (when the pool is configured to) and return the
    /// connection to the pool.
    pub async fn release(mut self, cx: &Cx) {
        let mut stale = false;
        if self.pool.reset_session {
            // an abandoned reset leaves the lease to `Drop`, which flags it
            if let Some(conn) = self.conn.as_mut() {
                match conn.reset_session(cx).await {
                    Outcome::Ok(()) => {}
                    Outcome::Err(e) => {
                        tracing::warn!(pool = %self.pool.name, error = %e, "session reset failed on release");
                        stale = true;
                    }
                    Outcome::Cancelled(_) | Outcome::Panicked(_) => stale = true,
                }
            }
        }
        if let Some(conn) = self.conn.take() {
            self.pool.requeue(PoolEntry {
                conn,
                version: self.version,
                needs_reset: false,
                stale,
            });
        }
    }
}

impl<C: PoolConnection> std::ops::Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_ref()
            .expect("pooled connection is present until the lease ends")
    }
}

impl<C: PoolConnection> std::ops::DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_mut()
            .expect("pooled connection is present until the lease ends")
    }
}

impl<C: PoolConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.requeue(PoolEntry {
                conn,
                version: self.version,
                needs_reset: self.pool.reset_session,
                stale: false,
            });
        }
    }
}

impl<C: PoolConnection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}
