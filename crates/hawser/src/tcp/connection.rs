use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use mio::{Interest, Token, event::Event, net::TcpStream};
use tracing::{debug, error, warn};

use crate::{
    ConnectionHandle, Endpoint, Error,
    assemble::{DataReadResult, PacketAssemble},
    reactor::{HandlerOutcome, IoCtx, IoHandle, lock},
};

const SEND_QUEUE_CAPACITY: usize = 256;
const RECV_BUF_SIZE: usize = 1024;

/// Completion for one accepted `send`: invoked exactly once, with `Ok(())`
/// once the payload is fully on the wire, or with the error that ended it.
pub type SendCallback = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// Reports a lifecycle failure upstream. Fired at most once per connection.
pub(crate) type ErrorNotify = Box<dyn Fn(Error) + Send + Sync>;
/// Fired when an outbound connect completes.
pub(crate) type ConnectedNotify = Box<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Closed,
}

struct InFlight {
    data: Vec<u8>,
    offset: usize,
    callback: Option<SendCallback>,
}

struct Inner {
    phase: Phase,
    stream: Option<TcpStream>,
    token: Option<Token>,
    pending_addrs: VecDeque<SocketAddr>,
    last_connect_error: Option<Error>,
    assemble: Box<dyn PacketAssemble>,
    send_queue: VecDeque<(Vec<u8>, SendCallback)>,
    in_flight: Option<InFlight>,
    /// True while WRITABLE interest is registered; armed only when a write
    /// blocked, dropped once the queue fully drains.
    writable_armed: bool,
    recv_buf: Vec<u8>,
    remote_address: String,
    remote_port: u16,
    local_address: String,
    local_port: u16,
}

enum ReadStep {
    Parsed(DataReadResult),
    Blocked,
    Retry,
    Failed(io::Error),
}

enum WriteStep {
    Drained,
    Progress,
    Blocked,
    Failed(io::Error),
}

/// One TCP connection: the socket, its bounded send queue, its receive
/// buffer and its parser. Pinned to one transfer thread; every operation is
/// posted there, so the state is never touched concurrently.
pub(crate) struct TcpConnection {
    io: IoHandle,
    endpoint: Endpoint,
    error_notify: Option<ErrorNotify>,
    connected_notify: Option<ConnectedNotify>,
    inner: Mutex<Inner>,
}

impl TcpConnection {
    pub fn new(
        io: IoHandle,
        endpoint: Endpoint,
        assemble: Box<dyn PacketAssemble>,
        error_notify: Option<ErrorNotify>,
        connected_notify: Option<ConnectedNotify>,
    ) -> Arc<Self> {
        let inner = Inner {
            phase: Phase::Idle,
            stream: None,
            token: None,
            pending_addrs: VecDeque::new(),
            last_connect_error: None,
            assemble,
            send_queue: VecDeque::new(),
            in_flight: None,
            writable_armed: false,
            recv_buf: vec![0; RECV_BUF_SIZE],
            remote_address: endpoint.host.clone(),
            remote_port: endpoint.port,
            local_address: String::new(),
            local_port: 0,
        };
        Arc::new(Self { io, endpoint, error_notify, connected_notify, inner: Mutex::new(inner) })
    }

    pub fn remote_address(&self) -> String {
        lock(&self.inner).remote_address.clone()
    }

    pub fn remote_port(&self) -> u16 {
        lock(&self.inner).remote_port
    }

    pub fn local_address(&self) -> String {
        lock(&self.inner).local_address.clone()
    }

    pub fn local_port(&self) -> u16 {
        lock(&self.inner).local_port
    }

    /// Starts connecting to the resolved candidates, trying them in order.
    pub fn start_connect(self: &Arc<Self>, addrs: Vec<SocketAddr>) {
        let conn = self.clone();
        self.io.post(move |ctx| {
            {
                let mut inner = lock(&conn.inner);
                if inner.phase != Phase::Idle {
                    return;
                }
                inner.phase = Phase::Connecting;
                inner.pending_addrs = addrs.into();
            }
            Self::connect_next(&conn, ctx);
        });
    }

    /// Takes ownership of an already-established socket (server accept path).
    pub fn adopt_stream(self: &Arc<Self>, mut stream: TcpStream, peer: SocketAddr) {
        let conn = self.clone();
        self.io.post(move |ctx| {
            let token = conn.io.alloc_token();
            {
                let mut inner = lock(&conn.inner);
                if inner.phase != Phase::Idle {
                    return;
                }
                if let Err(err) = ctx.registry.register(&mut stream, token, Interest::READABLE) {
                    error!(%peer, ?err, "couldn't register accepted connection");
                    return;
                }
                let _ = stream.set_nodelay(true);
                inner.remote_address = peer.ip().to_string();
                inner.remote_port = peer.port();
                if let Ok(local) = stream.local_addr() {
                    inner.local_address = local.ip().to_string();
                    inner.local_port = local.port();
                }
                inner.stream = Some(stream);
                inner.token = Some(token);
                inner.phase = Phase::Connected;
            }
            let handler_conn = conn.clone();
            ctx.set_handler(token, Box::new(move |ctx, ev| Self::on_event(&handler_conn, ctx, ev)));
        });
    }

    /// Reports a failure that happened before any socket existed (resolve
    /// errors) through the regular error path.
    pub fn handle_fail_connection(self: &Arc<Self>, err: Error) {
        let inner = lock(&self.inner);
        let _ = Self::fail(self, inner, err);
    }

    /// Posts the payload into this connection's serialized region. If no
    /// write is in flight it starts draining immediately; otherwise the
    /// payload queues behind it, or is rejected with `SendQueueFull` when
    /// the queue is at capacity.
    pub fn send(self: &Arc<Self>, data: Vec<u8>, callback: SendCallback) {
        let conn = self.clone();
        self.io.post(move |_ctx| {
            let mut inner = lock(&conn.inner);
            if inner.phase != Phase::Connected {
                drop(inner);
                callback(Err(Error::NotConnected));
                return;
            }
            if inner.in_flight.is_some() {
                if inner.send_queue.len() >= SEND_QUEUE_CAPACITY {
                    drop(inner);
                    warn!(remote = %conn.endpoint, "send queue full, dropping payload");
                    callback(Err(Error::SendQueueFull));
                } else {
                    inner.send_queue.push_back((data, callback));
                }
                return;
            }
            inner.in_flight = Some(InFlight { data, offset: 0, callback: Some(callback) });
            let _ = Self::drain(&conn, inner);
        });
    }

    /// Closes the socket, fails every queued completion and resets the
    /// receive state. No error notify fires on this path.
    pub fn disconnect(self: &Arc<Self>) {
        let conn = self.clone();
        self.io.post(move |_ctx| {
            let mut inner = lock(&conn.inner);
            if inner.phase == Phase::Closed {
                return;
            }
            debug!(
                local = %inner.local_address, local_port = inner.local_port,
                remote = %inner.remote_address, remote_port = inner.remote_port,
                "disconnect"
            );
            let callbacks = Self::teardown_locked(&conn, &mut inner);
            drop(inner);
            for callback in callbacks {
                callback(Err(Error::NotConnected));
            }
        });
    }

    fn connect_next(conn: &Arc<Self>, ctx: &mut IoCtx<'_>) {
        let mut inner = lock(&conn.inner);
        if inner.phase != Phase::Connecting {
            return;
        }
        loop {
            let Some(addr) = inner.pending_addrs.pop_front() else {
                let err = inner
                    .last_connect_error
                    .take()
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable).into());
                let _ = Self::fail(conn, inner, err);
                return;
            };
            match TcpStream::connect(addr) {
                Ok(mut stream) => {
                    let token = conn.io.alloc_token();
                    if let Err(err) =
                        ctx.registry.register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
                    {
                        warn!(%addr, ?err, "couldn't register connecting stream");
                        inner.last_connect_error = Some(err.into());
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    inner.stream = Some(stream);
                    inner.token = Some(token);
                    drop(inner);
                    let handler_conn = conn.clone();
                    ctx.set_handler(
                        token,
                        Box::new(move |ctx, ev| Self::on_event(&handler_conn, ctx, ev)),
                    );
                    return;
                }
                Err(err) => {
                    debug!(%addr, ?err, "connect attempt failed");
                    inner.last_connect_error = Some(err.into());
                }
            }
        }
    }

    fn on_event(conn: &Arc<Self>, ctx: &mut IoCtx<'_>, ev: &Event) -> HandlerOutcome {
        let phase = lock(&conn.inner).phase;
        match phase {
            Phase::Connecting => Self::finish_connect(conn, ctx),
            Phase::Connected => {
                // Error and hup conditions surface through read().
                let wants_read = ev.is_readable() || ev.is_error() || ev.is_read_closed();
                if wants_read && Self::on_readable(conn) == HandlerOutcome::Detach {
                    return HandlerOutcome::Detach;
                }
                if ev.is_writable() {
                    let inner = lock(&conn.inner);
                    if inner.phase != Phase::Connected {
                        return HandlerOutcome::Detach;
                    }
                    return Self::drain(conn, inner);
                }
                HandlerOutcome::Keep
            }
            Phase::Idle | Phase::Closed => HandlerOutcome::Detach,
        }
    }

    fn finish_connect(conn: &Arc<Self>, ctx: &mut IoCtx<'_>) -> HandlerOutcome {
        enum Probe {
            Connected(SocketAddr),
            Pending,
            Failed(io::Error),
        }

        let mut inner = lock(&conn.inner);
        let probe = {
            let Some(stream) = inner.stream.as_ref() else {
                return HandlerOutcome::Detach;
            };
            match stream.take_error() {
                Ok(Some(err)) | Err(err) => Probe::Failed(err),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => Probe::Connected(peer),
                    Err(err) if err.kind() == io::ErrorKind::NotConnected => Probe::Pending,
                    Err(err) => Probe::Failed(err),
                },
            }
        };

        match probe {
            Probe::Pending => HandlerOutcome::Keep,
            Probe::Connected(peer) => {
                inner.remote_address = peer.ip().to_string();
                inner.remote_port = peer.port();
                let reregistered = {
                    let Inner { stream, token, local_address, local_port, .. } = &mut *inner;
                    match (stream.as_mut(), *token) {
                        (Some(stream), Some(token)) => {
                            if let Ok(local) = stream.local_addr() {
                                *local_address = local.ip().to_string();
                                *local_port = local.port();
                            }
                            // Connect watched WRITABLE; from here writes arm
                            // it on demand.
                            ctx.registry.reregister(stream, token, Interest::READABLE)
                        }
                        _ => Ok(()),
                    }
                };
                if let Err(err) = reregistered {
                    return Self::fail(conn, inner, err.into());
                }
                inner.phase = Phase::Connected;
                debug!(%peer, remote = %conn.endpoint, "connected");
                drop(inner);
                if let Some(notify) = &conn.connected_notify {
                    notify(conn);
                }
                HandlerOutcome::Keep
            }
            Probe::Failed(err) => {
                debug!(remote = %conn.endpoint, ?err, "connect failed");
                if let Some(mut stream) = inner.stream.take() {
                    let _ = ctx.registry.deregister(&mut stream);
                }
                inner.token = None;
                inner.last_connect_error = Some(err.into());
                drop(inner);
                // This token dies with the failed socket; the next candidate
                // gets a fresh registration.
                Self::connect_next(conn, ctx);
                HandlerOutcome::Detach
            }
        }
    }

    fn on_readable(conn: &Arc<Self>) -> HandlerOutcome {
        let handle = ConnectionHandle::new(Arc::downgrade(conn));
        let mut inner = lock(&conn.inner);
        loop {
            if inner.phase != Phase::Connected {
                return HandlerOutcome::Detach;
            }
            let step = {
                let Inner { stream, recv_buf, assemble, .. } = &mut *inner;
                let Some(stream) = stream.as_mut() else {
                    return HandlerOutcome::Detach;
                };
                match stream.read(recv_buf.as_mut_slice()) {
                    Ok(0) => ReadStep::Failed(io::ErrorKind::UnexpectedEof.into()),
                    Ok(n) => ReadStep::Parsed(assemble.data_received(&handle, &recv_buf[..n])),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => ReadStep::Blocked,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => ReadStep::Retry,
                    Err(err) => ReadStep::Failed(err),
                }
            };
            match step {
                ReadStep::Blocked => return HandlerOutcome::Keep,
                ReadStep::Retry | ReadStep::Parsed(DataReadResult::Success) => {}
                ReadStep::Parsed(DataReadResult::Error) => {
                    error!(remote = %conn.endpoint, "packet assemble returned error, continue reading");
                }
                ReadStep::Parsed(DataReadResult::Disconnect) => {
                    error!(remote = %conn.endpoint, "packet assemble requested disconnect");
                    return Self::fail(conn, inner, Error::RequireDisconnect);
                }
                ReadStep::Failed(err) => {
                    error!(remote = %conn.endpoint, ?err, "read failed");
                    return Self::fail(conn, inner, err.into());
                }
            }
        }
    }

    /// Write-drain protocol: at most one payload is in flight; its bytes go
    /// out until the kernel blocks, then WRITABLE interest carries the rest.
    /// Completions fire in FIFO order, outside the lock.
    fn drain(conn: &Arc<Self>, mut inner: MutexGuard<'_, Inner>) -> HandlerOutcome {
        let mut finished: Vec<SendCallback> = Vec::new();
        loop {
            let step = {
                let Inner { stream, in_flight, .. } = &mut *inner;
                match in_flight.as_mut() {
                    None => WriteStep::Drained,
                    Some(fl) if fl.offset >= fl.data.len() => WriteStep::Progress,
                    Some(fl) => match stream.as_mut() {
                        None => WriteStep::Failed(io::ErrorKind::NotConnected.into()),
                        Some(stream) => match stream.write(&fl.data[fl.offset..]) {
                            Ok(0) => WriteStep::Failed(io::ErrorKind::WriteZero.into()),
                            Ok(n) => {
                                fl.offset += n;
                                WriteStep::Progress
                            }
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                                WriteStep::Blocked
                            }
                            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                                WriteStep::Progress
                            }
                            Err(err) => WriteStep::Failed(err),
                        },
                    },
                }
            };
            match step {
                WriteStep::Progress => {
                    let done = inner.in_flight.as_ref().is_some_and(|fl| fl.offset >= fl.data.len());
                    if done {
                        if let Some(callback) =
                            inner.in_flight.as_mut().and_then(|fl| fl.callback.take())
                        {
                            finished.push(callback);
                        }
                        inner.in_flight = inner.send_queue.pop_front().map(|(data, callback)| {
                            InFlight { data, offset: 0, callback: Some(callback) }
                        });
                    }
                }
                WriteStep::Blocked => {
                    if !inner.writable_armed {
                        match Self::set_interest(
                            conn,
                            &mut inner,
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            Ok(()) => inner.writable_armed = true,
                            Err(err) => return Self::fail_write(conn, inner, err, finished),
                        }
                    }
                    break;
                }
                WriteStep::Drained => {
                    // Drop WRITABLE interest only when fully drained.
                    if inner.writable_armed {
                        match Self::set_interest(conn, &mut inner, Interest::READABLE) {
                            Ok(()) => inner.writable_armed = false,
                            Err(err) => return Self::fail_write(conn, inner, err, finished),
                        }
                    }
                    break;
                }
                WriteStep::Failed(err) => return Self::fail_write(conn, inner, err, finished),
            }
        }
        drop(inner);
        for callback in finished {
            callback(Ok(()));
        }
        HandlerOutcome::Keep
    }

    fn set_interest(conn: &Arc<Self>, inner: &mut Inner, interest: Interest) -> io::Result<()> {
        let Inner { stream, token, .. } = inner;
        match (stream.as_mut(), *token) {
            (Some(stream), Some(token)) => conn.io.registry().reregister(stream, token, interest),
            _ => Ok(()),
        }
    }

    /// Teardown after a write failure: the in-flight completion gets the
    /// real error, everything still queued gets `NotConnected`.
    fn fail_write(
        conn: &Arc<Self>,
        mut inner: MutexGuard<'_, Inner>,
        err: io::Error,
        finished: Vec<SendCallback>,
    ) -> HandlerOutcome {
        error!(remote = %conn.endpoint, ?err, "write failed");
        let err = Error::from(err);
        let failed = inner.in_flight.as_mut().and_then(|fl| fl.callback.take());
        let callbacks = Self::teardown_locked(conn, &mut inner);
        drop(inner);
        for callback in finished {
            callback(Ok(()));
        }
        if let Some(callback) = failed {
            callback(Err(err.clone()));
        }
        for callback in callbacks {
            callback(Err(Error::NotConnected));
        }
        conn.notify_connection_error(err);
        HandlerOutcome::Detach
    }

    /// Teardown with an error notify. Idempotent.
    fn fail(conn: &Arc<Self>, mut inner: MutexGuard<'_, Inner>, err: Error) -> HandlerOutcome {
        if inner.phase == Phase::Closed {
            return HandlerOutcome::Detach;
        }
        let callbacks = Self::teardown_locked(conn, &mut inner);
        drop(inner);
        for callback in callbacks {
            callback(Err(Error::NotConnected));
        }
        conn.notify_connection_error(err);
        HandlerOutcome::Detach
    }

    /// Closes the socket and sweeps out every pending completion. The
    /// dispatch entry for the token is removed via a follow-up task, which
    /// is a no-op when the caller already detached it.
    fn teardown_locked(conn: &Arc<Self>, inner: &mut Inner) -> Vec<SendCallback> {
        inner.phase = Phase::Closed;
        if let Some(mut stream) = inner.stream.take() {
            let _ = conn.io.registry().deregister(&mut stream);
        }
        if let Some(token) = inner.token.take() {
            conn.io.post(move |ctx| ctx.remove_handler(token));
        }
        let mut callbacks: Vec<SendCallback> = Vec::new();
        if let Some(callback) = inner.in_flight.take().and_then(|mut fl| fl.callback.take()) {
            callbacks.push(callback);
        }
        callbacks.extend(inner.send_queue.drain(..).map(|(_, callback)| callback));
        inner.writable_armed = false;
        inner.recv_buf.clear();
        inner.recv_buf.resize(RECV_BUF_SIZE, 0);
        callbacks
    }

    fn notify_connection_error(&self, err: Error) {
        match &self.error_notify {
            Some(notify) => notify(err),
            None => {
                error!(remote = %self.remote_address(), remote_port = self.remote_port(), %err,
                    "connection error");
            }
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // Last owner gone: the socket (if any) closes with the stream.
        debug!(remote = %self.endpoint, "connection released");
    }
}
