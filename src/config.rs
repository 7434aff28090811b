use std::{str::FromStr, time::Duration};

use crate::error::Error;

pub const URL_SCHEME: &str = "cproto://";

/// Connection and pool settings shared by every connection a client opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub address: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Items requested per page; values `<= 0` fetch everything at once.
    pub fetch_count: i32,
    pub app_name: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6534".to_string(),
            user: String::new(),
            password: String::new(),
            database: String::new(),
            pool_size: 4,
            checkout_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            fetch_count: 100,
            app_name: "cproto-rs".to_string(),
        }
    }
}

impl ClientConfig {
    /// Parses `cproto://[user:password@]host:port/database`.
    pub fn from_url(url: &str) -> Result<Self, Error> {
        let rest = url
            .strip_prefix(URL_SCHEME)
            .ok_or_else(|| Error::Config(format!("url must start with {URL_SCHEME}: {url}")))?;

        let (authority, database) = rest
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("url has no database path: {url}")))?;
        if database.is_empty() || database.contains('/') {
            return Err(Error::Config(format!("invalid database name `{database}`")));
        }

        let (user, password, address) = match authority.rsplit_once('@') {
            Some((userinfo, address)) => {
                let (user, password) = userinfo.split_once(':').ok_or_else(|| {
                    Error::Config("credentials must be given as user:password".to_string())
                })?;
                (user.to_string(), password.to_string(), address)
            }
            None => (String::new(), String::new(), authority),
        };

        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("address `{address}` has no port")))?;
        if host.is_empty() {
            return Err(Error::Config(format!("address `{address}` has no host")));
        }
        port.parse::<u16>()
            .map_err(|_| Error::Config(format!("invalid port `{port}`")))?;

        Ok(Self {
            address: address.to_string(),
            user,
            password,
            database: database.to_string(),
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool size must be at least 1".to_string()));
        }
        if self.database.is_empty() {
            return Err(Error::Config("database name is required".to_string()));
        }
        Ok(())
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fetch_count(mut self, fetch_count: i32) -> Self {
        self.fetch_count = fetch_count;
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }
}

impl FromStr for ClientConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_url(s)
    }
}
