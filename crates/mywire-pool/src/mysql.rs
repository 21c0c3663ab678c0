//! [`PoolConnection`] for [`MySqlConnection`].

use std::future::Future;
use std::time::Duration;

use asupersync::{Cx, Outcome};
use mywire::{MySqlConfig, MySqlConnection};
use mywire_core::{Error, Result};

use crate::{Pool, PoolConnection};

/// A pool of MySQL connections.
pub type MySqlPool = Pool<MySqlConnection>;

impl PoolConnection for MySqlConnection {
    type Config = MySqlConfig;

    fn connect(cx: &Cx, config: MySqlConfig) -> impl Future<Output = Outcome<Self, Error>> + Send {
        MySqlConnection::connect(cx, config)
    }

    fn reconfigure(&mut self, config: &MySqlConfig) {
        MySqlConnection::reconfigure(self, config.clone());
    }

    fn is_connected(&mut self, cx: &Cx) -> impl Future<Output = bool> + Send {
        MySqlConnection::is_connected(self, cx)
    }

    fn reconnect(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        MySqlConnection::reconnect(self, cx, 1, Duration::ZERO)
    }

    fn reset_session(&mut self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        MySqlConnection::reset_session(self, cx, &[], &[])
    }

    fn disconnect(&mut self) {
        MySqlConnection::disconnect(self);
    }

    fn server_version(&self) -> Option<(u16, u16, u16)> {
        MySqlConnection::server_version(self)
    }

    fn uses_compression(config: &MySqlConfig) -> bool {
        config.compression
    }

    fn validate_config(config: &MySqlConfig) -> Result<()> {
        mywire::tls::validate_tls_config(config.ssl_mode, &config.tls)
    }

    /// `host_port_user_database`, skipping an unset database.
    fn generate_pool_name(config: &MySqlConfig) -> Result<String> {
        let port = config.port.to_string();
        let mut parts = vec![config.host.as_str(), port.as_str(), config.user.as_str()];
        if let Some(database) = &config.database {
            parts.push(database);
        }
        let name = parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        if name.is_empty() {
            return Err(Error::pool(
                mywire_core::PoolErrorKind::Config,
                "Failed generating pool name; specify pool_name",
            ));
        }
        Ok(name)
    }
}
