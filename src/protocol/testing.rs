//! In-process stand-ins for a cproto server, used by unit tests.
use std::{
    net::{Shutdown, SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
};

use crate::error::Error;

use super::{
    Arg, Command, ErrorCode, Frame, ProtocolTransport, Request, Response, RpcCall, thread::lock,
};

pub(crate) enum Reply {
    Respond(Response),
    /// Read the request but never answer it.
    Ignore,
    /// Drop the socket.
    Hangup,
    /// Answer with a body that is sent as is.
    Raw(Vec<u8>),
}

impl Reply {
    pub fn ok(args: Vec<Arg>) -> Self {
        Reply::Respond(Response::ok(args))
    }

    pub fn error(code: ErrorCode, message: &str) -> Self {
        Reply::Respond(Response::error(code, message))
    }
}

type Handler = dyn Fn(&Request) -> Reply + Send + Sync;

/// TCP server speaking the frame protocol with a scripted handler.
pub(crate) struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Request>>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);

        let log = Arc::clone(&requests);
        let count = Arc::clone(&connections);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                count.fetch_add(1, Ordering::SeqCst);
                let handler = Arc::clone(&handler);
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    let mut transport = ProtocolTransport::new(stream);
                    while let Ok(frame) = transport.read_frame() {
                        let Ok(command) = frame.command() else { break };
                        let Ok(request) = Request::decode_body(command, &frame.body) else {
                            break;
                        };
                        lock(&log).push(request.clone());

                        let body = match handler(&request) {
                            Reply::Respond(response) => response.encode_body(),
                            Reply::Raw(body) => body,
                            Reply::Ignore => continue,
                            Reply::Hangup => {
                                let _ = transport.get_ref().shutdown(Shutdown::Both);
                                break;
                            }
                        };
                        let out = Frame::new(command, frame.seq(), body).unwrap();
                        if transport.write_frame(&out).is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    /// A server that accepts every call with an empty success response.
    pub fn accept_all() -> Self {
        Self::start(|_| Reply::ok(vec![]))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.requests).clone()
    }

    pub fn requests_for(&self, command: Command) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.command == command)
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

type FakeHandler = dyn Fn(&Request) -> Result<Response, Error> + Send + Sync;

/// An [`RpcCall`] answered in memory, recording every request.
pub(crate) struct FakeRpc {
    handler: Box<FakeHandler>,
    calls: Mutex<Vec<Request>>,
}

impl FakeRpc {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&Request) -> Result<Response, Error> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Request> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, command: Command) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|r| r.command == command)
            .count()
    }
}

impl RpcCall for FakeRpc {
    fn rpc(&self, command: Command, args: Vec<Arg>) -> Result<Response, Error> {
        let request = Request::new(command, args);
        lock(&self.calls).push(request.clone());
        (self.handler)(&request)
    }
}
