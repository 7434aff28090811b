//! Bounded pool of logged-in connections.
//!
//! The pool is `open` until [`ConnectionPool::close`] and never reopens.
//! Every checked-out [`PooledConnection`] ends in exactly one of
//! [`release`](PooledConnection::release) or
//! [`discard`](PooledConnection::discard); dropping the guard picks one based
//! on the connection's health and on whether any call through the guard failed
//! with a connection-fatal error.
use std::{
    collections::VecDeque,
    sync::{
        Arc, Condvar, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    config::ClientConfig,
    error::Error,
    protocol::{Arg, Command, Connection, Response, RpcCall, lock},
};

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ClientConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Connections that exist, idle or checked out.
    live: usize,
    closed: bool,
}

impl ConnectionPool {
    /// Opens and logs in `config.pool_size` connections up front.
    pub fn open(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;

        let mut idle = VecDeque::with_capacity(config.pool_size);
        for _ in 0..config.pool_size {
            // already-open connections close when `idle` drops
            idle.push_back(Connection::open(&config)?);
        }
        info!(
            "opened pool of {} connections to {}",
            config.pool_size, config.address
        );

        let live = idle.len();
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState {
                    idle,
                    live,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn size(&self) -> usize {
        self.inner.config.pool_size
    }

    pub fn idle(&self) -> usize {
        lock(&self.inner.state).idle.len()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Checks out a connection, waiting up to the configured checkout timeout.
    pub fn checkout(&self) -> Result<PooledConnection, Error> {
        self.checkout_timeout(self.inner.config.checkout_timeout)
    }

    pub fn checkout_timeout(&self, timeout: Duration) -> Result<PooledConnection, Error> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.inner.state);

        loop {
            if state.closed {
                return Err(Error::PoolClosed);
            }

            if let Some(conn) = state.idle.pop_front() {
                if conn.is_healthy() {
                    return Ok(PooledConnection::new(conn, self.clone()));
                }
                state.live -= 1;
                debug!("dropping broken idle connection to {}", conn.peer());
                conn.close();
                continue;
            }

            // replace a previously discarded slot
            if state.live < self.size() {
                state.live += 1;
                drop(state);
                return match Connection::open(&self.inner.config) {
                    Ok(conn) => {
                        debug!("opened replacement connection to {}", conn.peer());
                        Ok(PooledConnection::new(conn, self.clone()))
                    }
                    Err(err) => {
                        let mut state = lock(&self.inner.state);
                        state.live -= 1;
                        self.inner.available.notify_one();
                        Err(err)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("checkout timed out after {timeout:?}");
                return Err(Error::PoolExhausted(timeout));
            }
            state = self
                .inner
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release_connection(&self, conn: Connection) {
        if !conn.is_healthy() {
            self.discard_connection(conn);
            return;
        }

        let mut state = lock(&self.inner.state);
        if state.closed {
            state.live = state.live.saturating_sub(1);
            drop(state);
            conn.close();
            return;
        }
        state.idle.push_back(conn);
        self.inner.available.notify_one();
    }

    fn discard_connection(&self, conn: Connection) {
        {
            let mut state = lock(&self.inner.state);
            state.live = state.live.saturating_sub(1);
            self.inner.available.notify_one();
        }
        warn!(
            "discarding connection to {}{}",
            conn.peer(),
            conn.broken_reason()
                .map(|r| format!(": {r}"))
                .unwrap_or_default()
        );
        conn.close();
    }

    /// Closes every idle connection. Checked-out connections close when
    /// they come back. Idempotent and never fails.
    pub fn close(&self) {
        let idle = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.live -= state.idle.len();
            self.inner.available.notify_all();
            std::mem::take(&mut state.idle)
        };

        info!("closing pool to {}", self.inner.config.address);
        for conn in idle {
            conn.close();
        }
    }
}

/// Exclusive use of one pooled connection.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: ConnectionPool,
    /// Set once a call failed in a way that leaves the socket state unknown.
    fatal: AtomicBool,
}

impl PooledConnection {
    fn new(conn: Connection, pool: ConnectionPool) -> Self {
        Self {
            conn: Some(conn),
            pool,
            fatal: AtomicBool::new(false),
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }

    /// Whether a call through this guard failed with a connection-fatal error.
    pub fn saw_fatal_error(&self) -> bool {
        self.fatal.load(Ordering::Acquire)
    }

    /// Returns the connection to the pool, or discards it after a
    /// connection-fatal error. A second call is a no-op.
    pub fn release(&mut self) {
        if self.saw_fatal_error() {
            return self.discard();
        }
        if let Some(conn) = self.conn.take() {
            self.pool.release_connection(conn);
        }
    }

    /// Closes the connection instead of returning it. A second call is a no-op.
    pub fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard_connection(conn);
        }
    }

    /// Releases after success and discards after a connection-fatal error.
    pub fn finish<T>(mut self, result: &Result<T, Error>) {
        match result {
            Err(err) if err.is_connection_fatal() => self.discard(),
            _ => self.release(),
        }
    }
}

impl RpcCall for PooledConnection {
    fn rpc(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        let conn = self.conn.as_ref().ok_or(Error::ConnectionClosed)?;
        let result = conn.rpc(command, args);
        if matches!(&result, Err(err) if err.is_connection_fatal()) {
            // a late reply may still arrive for the abandoned sequence number
            self.fatal.store(true, Ordering::Release);
        }
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        // broken connections are discarded by the pool on release
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use crate::protocol::testing::{MockServer, Reply};

    use super::*;

    fn config(server: &MockServer, size: usize) -> ClientConfig {
        ClientConfig {
            address: server.addr().to_string(),
            database: "db".to_string(),
            pool_size: size,
            checkout_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn eager_login() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 3)).unwrap();
        assert_eq!(pool.idle(), 3);
        assert_eq!(server.requests_for(Command::Login).len(), 3);
    }

    #[test]
    fn bounded_checkout() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 2)).unwrap();

        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();

        let start = Instant::now();
        let err = pool.checkout().err().unwrap();
        assert!(matches!(err, Error::PoolExhausted(_)));
        assert!(start.elapsed() >= Duration::from_millis(200));

        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn release_wakes_waiter() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 1)).unwrap();
        let mut held = pool.checkout().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                pool.checkout_timeout(Duration::from_secs(10))
                    .map(|mut c| c.release())
                    .is_ok()
            })
        };
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        held.release();
        held.release();
        assert!(waiter.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn discard_is_replaced_lazily() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 1)).unwrap();

        let mut conn = pool.checkout().unwrap();
        conn.discard();
        conn.discard();
        assert!(matches!(
            conn.call(Command::Ping, vec![]),
            Err(Error::ConnectionClosed)
        ));
        assert_eq!(pool.idle(), 0);

        let mut replacement = pool.checkout().unwrap();
        replacement.call(Command::Ping, vec![]).unwrap();
        replacement.release();
        assert_eq!(server.connections(), 2);
    }

    #[test]
    fn broken_connection_discarded_on_drop() {
        let server = MockServer::start(|req| match req.command {
            Command::DropNamespace => Reply::Hangup,
            _ => Reply::ok(vec![]),
        });
        let pool = ConnectionPool::open(config(&server, 1)).unwrap();

        let conn = pool.checkout().unwrap();
        let result = conn.call(Command::DropNamespace, vec![]);
        assert!(result.unwrap_err().is_connection_fatal());
        drop(conn);
        assert_eq!(pool.idle(), 0);

        let conn = pool.checkout().unwrap();
        assert!(conn.call(Command::Ping, vec![]).is_ok());
    }

    #[test]
    fn finish_picks_release_or_discard() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 1)).unwrap();

        let conn = pool.checkout().unwrap();
        conn.finish::<()>(&Err(Error::server(crate::protocol::ErrorCode::Params, "x")));
        assert_eq!(pool.idle(), 1);

        let conn = pool.checkout().unwrap();
        conn.finish::<()>(&Err(Error::Timeout(Duration::from_secs(1))));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn timed_out_guard_is_discarded() {
        let server = MockServer::start(|req| match req.command {
            Command::Select => Reply::Ignore,
            _ => Reply::ok(vec![]),
        });
        let config = ClientConfig {
            request_timeout: Duration::from_millis(200),
            ..config(&server, 1)
        };
        let pool = ConnectionPool::open(config).unwrap();

        let conn = pool.checkout().unwrap();
        assert!(matches!(
            conn.call(Command::Select, vec![]),
            Err(Error::Timeout(_))
        ));
        assert!(conn.saw_fatal_error());
        assert!(conn.connection().unwrap().is_healthy());
        drop(conn);
        assert_eq!(pool.idle(), 0);

        let mut conn = pool.checkout().unwrap();
        conn.call(Command::Ping, vec![]).unwrap();
        assert!(!conn.saw_fatal_error());
        conn.release();
        assert_eq!(pool.idle(), 1);
        assert_eq!(server.connections(), 2);
    }

    #[test]
    fn close_is_idempotent() {
        let server = MockServer::accept_all();
        let pool = ConnectionPool::open(config(&server, 2)).unwrap();
        let held = pool.checkout().unwrap();

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert_eq!(pool.idle(), 0);
        assert!(matches!(pool.checkout(), Err(Error::PoolClosed)));

        drop(held);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn open_fails_without_server() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = ClientConfig {
            address: addr.to_string(),
            database: "db".to_string(),
            ..ClientConfig::default()
        };
        assert!(matches!(
            ConnectionPool::open(config),
            Err(Error::Network(_))
        ));
    }
}
