use std::{
    collections::HashMap,
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use log::{debug, trace, warn};

use crate::{config::ClientConfig, error::Error};

use super::{
    Arg, Command, Frame, ProtocolTransport, Request, Response,
    thread::{Worker, lock},
};

/// Server release the login handshake identifies this client as compatible with.
pub const LOGIN_VERSION: &str = "v5.4.0";

pub const CAPABILITY_RESULTS_WITH_SHARD_IDS: i64 = 1 << 1;
pub const CAPABILITY_COMPLEX_RANK: i64 = 1 << 3;

/// Something that can carry one RPC round trip.
pub trait RpcCall {
    /// Sends `command` and waits for its response, whatever its code.
    fn rpc(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error>;

    /// Like [`RpcCall::rpc`], but a nonzero server code becomes [`Error::Server`].
    fn call(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        self.rpc(command, args)?.into_result()
    }
}

impl<C: RpcCall + ?Sized> RpcCall for &C {
    fn rpc(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        (**self).rpc(command, args)
    }
}

type Slot = mpsc::SyncSender<Result<Response, Error>>;

/// State shared between the caller-facing handle and the I/O loops.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u32, Slot>>,
    broken: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl Shared {
    fn is_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || lock(&self.broken).is_some()
    }

    fn mark_broken(&self, reason: String) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let mut broken = lock(&self.broken);
        if broken.is_none() {
            *broken = Some(reason);
        }
    }

    /// Wakes every waiting caller with a terminal error.
    fn fail_pending(&self) {
        let slots: Vec<Slot> = lock(&self.pending).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let _ = slot.send(Err(Error::ConnectionClosed));
        }
    }
}

/// One physical socket multiplexing concurrent calls by sequence number.
///
/// A writer thread drains the outbound queue onto the socket and a reader
/// thread routes each inbound frame to the slot registered under its
/// sequence number. Callers block only on their own slot.
pub struct Connection {
    peer: SocketAddr,
    stream: TcpStream,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    shared: Arc<Shared>,
    seq: AtomicU32,
    workers: Mutex<Vec<Worker>>,
    request_timeout: Duration,
}

impl Connection {
    /// Connects and performs the login handshake.
    pub fn open(config: &ClientConfig) -> Result<Self, Error> {
        let peer = config
            .address
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Config(format!("address `{}` did not resolve", config.address)))?;

        let stream = TcpStream::connect_timeout(&peer, config.connect_timeout)?;
        stream.set_nodelay(true)?;
        let conn = Self::from_stream(stream, config.request_timeout)?;

        if let Err(err) = conn.call(Command::Login, login_args(config)) {
            warn!("login to {peer} failed: {err}");
            conn.close();
            return Err(err);
        }
        debug!("connected to {peer} as `{}`", config.user);
        Ok(conn)
    }

    fn from_stream(stream: TcpStream, request_timeout: Duration) -> Result<Self, Error> {
        let peer = stream.peer_addr()?;
        let shared = Arc::new(Shared::default());
        let (sender, receiver) = mpsc::channel::<Frame>();

        let mut writer = ProtocolTransport::new(stream.try_clone()?);
        let writer_shared = Arc::clone(&shared);
        let writer_thread = Worker::spawn(format!("cproto-writer-{peer}"), move || {
            while let Ok(frame) = receiver.recv() {
                if let Err(err) = writer.write_frame(&frame) {
                    if !writer_shared.closed.load(Ordering::SeqCst) {
                        warn!("write to {peer} failed: {err}");
                    }
                    writer_shared.mark_broken(err.to_string());
                    let _ = writer.get_ref().shutdown(Shutdown::Both);
                    writer_shared.fail_pending();
                    break;
                }
            }
        })?;

        let mut reader = ProtocolTransport::new(stream.try_clone()?);
        let reader_shared = Arc::clone(&shared);
        let reader_thread = Worker::spawn(format!("cproto-reader-{peer}"), move || {
            loop {
                let frame = match reader.read_frame() {
                    Ok(frame) => frame,
                    Err(err) => {
                        if !reader_shared.closed.load(Ordering::SeqCst) {
                            warn!("read from {peer} failed: {err}");
                        }
                        reader_shared.mark_broken(err.to_string());
                        let _ = reader.get_ref().shutdown(Shutdown::Both);
                        reader_shared.fail_pending();
                        break;
                    }
                };

                let seq = frame.seq();
                let slot = lock(&reader_shared.pending).remove(&seq);
                match slot {
                    Some(slot) => match Response::decode_body(&frame.body) {
                        Ok(response) => {
                            let _ = slot.send(Ok(response));
                        }
                        Err(err) => {
                            // framing can no longer be trusted
                            warn!("undecodable response from {peer}: {err}");
                            reader_shared.mark_broken(err.to_string());
                            let _ = slot.send(Err(Error::from(err)));
                            let _ = reader.get_ref().shutdown(Shutdown::Both);
                            reader_shared.fail_pending();
                            break;
                        }
                    },
                    None => trace!("dropping response for abandoned seq {seq}"),
                }
            }
        })?;

        Ok(Self {
            peer,
            stream,
            outbound: Mutex::new(Some(sender)),
            shared,
            seq: AtomicU32::new(0),
            workers: Mutex::new(vec![writer_thread, reader_thread]),
            request_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_healthy(&self) -> bool {
        !self.shared.is_down()
    }

    pub fn broken_reason(&self) -> Option<String> {
        lock(&self.shared.broken).clone()
    }

    /// Shuts the socket down and wakes every blocked caller. Idempotent.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing connection to {}", self.peer);

        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            trace!("shutdown of {} failed: {err}", self.peer);
        }
        drop(lock(&self.outbound).take());
        self.shared.fail_pending();

        let workers: Vec<Worker> = lock(&self.workers).drain(..).collect();
        drop(workers);
    }

    fn down_error(&self) -> Error {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Error::ConnectionClosed;
        }
        match self.broken_reason() {
            Some(reason) => Error::ConnectionBroken(reason),
            None => Error::ConnectionClosed,
        }
    }
}

impl RpcCall for Connection {
    fn rpc(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        if self.shared.is_down() {
            return Err(self.down_error());
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(command, args);
        let frame = Frame::new(command, seq, request.encode_body())?;
        debug!("rpc {command:?} seq={seq} to {}", self.peer);

        let (slot, response) = mpsc::sync_channel(1);
        lock(&self.shared.pending).insert(seq, slot);
        // a close racing with registration may already have drained the map
        if self.shared.is_down() {
            lock(&self.shared.pending).remove(&seq);
            return Err(self.down_error());
        }

        let sent = match lock(&self.outbound).as_ref() {
            Some(sender) => sender.send(frame).is_ok(),
            None => false,
        };
        if !sent {
            lock(&self.shared.pending).remove(&seq);
            return Err(self.down_error());
        }

        match response.recv_timeout(self.request_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.shared.pending).remove(&seq);
                warn!("rpc {command:?} seq={seq} timed out after {:?}", self.request_timeout);
                Err(Error::Timeout(self.request_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.down_error()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn login_args(config: &ClientConfig) -> Vec<Arg> {
    vec![
        Arg::from(config.user.as_str()),
        Arg::from(config.password.as_str()),
        Arg::from(config.database.as_str()),
        Arg::Bool(false), // create database if missing
        Arg::Bool(false), // check cluster id
        Arg::Int(-1),     // expected cluster id
        Arg::from(LOGIN_VERSION),
        Arg::from(config.app_name.as_str()),
        Arg::Int64(CAPABILITY_RESULTS_WITH_SHARD_IDS | CAPABILITY_COMPLEX_RANK),
    ]
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Instant};

    use crate::{
        error::ProtocolError,
        protocol::{
            ErrorCode,
            testing::{MockServer, Reply},
        },
    };

    use super::*;

    fn config(server: &MockServer) -> ClientConfig {
        ClientConfig {
            address: server.addr().to_string(),
            user: "reader".to_string(),
            password: "pw".to_string(),
            database: "db".to_string(),
            request_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    #[test]
    fn login_handshake() {
        let server = MockServer::accept_all();
        let conn = Connection::open(&config(&server)).unwrap();
        assert!(conn.is_healthy());

        let login = server.requests_for(Command::Login);
        assert_eq!(login.len(), 1);
        assert_eq!(login[0].args[0], Arg::from("reader"));
        assert_eq!(login[0].args[2], Arg::from("db"));
        assert_eq!(login[0].args[5], Arg::Int(-1));
        assert_eq!(login[0].args[7], Arg::from("cproto-rs"));
        assert_eq!(login[0].args[8], Arg::Int64(10));
    }

    #[test]
    fn login_rejected() {
        let server = MockServer::start(|req| match req.command {
            Command::Login => Reply::error(ErrorCode::Forbidden, "denied"),
            _ => Reply::ok(vec![]),
        });
        let err = Connection::open(&config(&server)).err().unwrap();
        assert_eq!(err.server_code(), Some(ErrorCode::Forbidden));
    }

    #[test]
    fn server_error_keeps_connection() {
        let server = MockServer::start(|req| match req.command {
            Command::OpenNamespace => Reply::error(ErrorCode::Params, "bad"),
            _ => Reply::ok(vec![Arg::Int(1)]),
        });
        let conn = Connection::open(&config(&server)).unwrap();

        let err = conn.call(Command::OpenNamespace, vec![]).unwrap_err();
        assert!(!err.is_connection_fatal());
        assert!(conn.is_healthy());
        assert_eq!(conn.call(Command::Ping, vec![]).unwrap().int_arg(0).unwrap(), 1);
    }

    #[test]
    fn rpc_returns_error_responses() {
        let server = MockServer::start(|req| match req.command {
            Command::GetMeta => Reply::error(ErrorCode::NotFound, "no key"),
            _ => Reply::ok(vec![]),
        });
        let conn = Connection::open(&config(&server)).unwrap();

        let resp = conn.rpc(Command::GetMeta, vec![]).unwrap();
        assert_eq!(resp.code, ErrorCode::NotFound);
        assert_eq!(resp.message, "no key");
    }

    #[test]
    fn concurrent_calls_share_socket() {
        let server = MockServer::start(|req| Reply::ok(req.args.clone()));
        let conn = Arc::new(Connection::open(&config(&server)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let conn = Arc::clone(&conn);
                thread::spawn(move || {
                    let resp = conn.call(Command::Ping, vec![Arg::Int(i)]).unwrap();
                    assert_eq!(resp.args, vec![Arg::Int(i)]);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(server.connections(), 1);
    }

    #[test]
    fn timeout_leaves_connection_usable() {
        let server = MockServer::start(|req| match req.command {
            Command::Select => Reply::Ignore,
            _ => Reply::ok(vec![]),
        });
        let conn = Connection::open(&config(&server)).unwrap();

        let start = Instant::now();
        let err = conn.call(Command::Select, vec![]).unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(conn.call(Command::Ping, vec![]).is_ok());
    }

    #[test]
    fn close_wakes_waiters() {
        let server = MockServer::start(|req| match req.command {
            Command::Select => Reply::Ignore,
            _ => Reply::ok(vec![]),
        });
        let mut cfg = config(&server);
        cfg.request_timeout = Duration::from_secs(30);
        let conn = Arc::new(Connection::open(&cfg).unwrap());

        let waiter = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.call(Command::Select, vec![]))
        };
        thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        conn.close();
        conn.close();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            conn.call(Command::Ping, vec![]),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn peer_hangup_marks_broken() {
        let server = MockServer::start(|req| match req.command {
            Command::DropNamespace => Reply::Hangup,
            _ => Reply::ok(vec![]),
        });
        let conn = Connection::open(&config(&server)).unwrap();

        let err = conn.call(Command::DropNamespace, vec![]).unwrap_err();
        assert!(err.is_connection_fatal());
        assert!(!conn.is_healthy());
        assert!(conn.broken_reason().is_some());
        assert!(matches!(
            conn.call(Command::Ping, vec![]),
            Err(Error::ConnectionBroken(_))
        ));
    }

    #[test]
    fn undecodable_response_marks_broken() {
        let server = MockServer::start(|req| match req.command {
            // ok code, empty message, one argument with tag 9
            Command::Select => Reply::Raw(vec![0, 0, 1, 9]),
            _ => Reply::ok(vec![]),
        });
        let conn = Connection::open(&config(&server)).unwrap();

        let err = conn.call(Command::Select, vec![]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnknownArgTag(9))
        ));
        assert!(err.is_connection_fatal());
        assert!(!conn.is_healthy());
        assert!(conn.call(Command::Ping, vec![]).is_err());
    }
}
