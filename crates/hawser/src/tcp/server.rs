use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use mio::{Interest, net::TcpListener};
use tracing::{debug, error};

use crate::{
    Endpoint, Error,
    assemble::AssembleCreator,
    reactor::{HandlerOutcome, IoThread, TransferPool, lock},
    tcp::connection::TcpConnection,
};

/// Inbound TCP facade: binds an acceptor and hands every accepted socket a
/// fresh parser from the configured factory.
///
/// The server keeps no connection registry — an accepted connection lives in
/// its transfer thread's dispatch table and dies with its socket.
pub struct TcpServer {
    listen_ip: Ipv4Addr,
    listen_port: u16,
    transfer_thread_count: u32,
    assemble_creator: Option<AssembleCreator>,
    control: IoThread,
    transfer: OnceLock<Arc<TransferPool>>,
    started: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
            transfer_thread_count: 1,
            assemble_creator: None,
            control: IoThread::spawn("hawser-server-accept"),
            transfer: OnceLock::new(),
            started: AtomicBool::new(false),
            bound_addr: Mutex::new(None),
        }
    }

    /// Address to listen on; defaults to `0.0.0.0`.
    pub fn set_listen_ip_v4(mut self, ip: &str) -> Result<Self, Error> {
        self.listen_ip = ip.parse().map_err(|_| Error::ParseIpAddress)?;
        Ok(self)
    }

    /// Port to listen on; 0 binds an ephemeral port, observable through
    /// [`get_listen_port`](Self::get_listen_port) after `start`.
    pub fn set_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn set_transfer_thread_count(mut self, count: u32) -> Self {
        self.transfer_thread_count = count.max(1);
        self
    }

    /// Parser factory, invoked once per accepted socket.
    pub fn set_assemble_creator(mut self, creator: AssembleCreator) -> Self {
        self.assemble_creator = Some(creator);
        self
    }

    /// Binds the acceptor and starts the accept loop. Fails with
    /// [`Error::AssembleCreatorNotSet`] when no factory is installed and
    /// [`Error::AlreadyStarted`] on a second call; bind errors pass through.
    pub fn start(&self) -> Result<(), Error> {
        let Some(creator) = self.assemble_creator.clone() else {
            return Err(Error::AssembleCreatorNotSet);
        };
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let addr = SocketAddr::from((self.listen_ip, self.listen_port));
        let mut listener = match TcpListener::bind(addr) {
            Ok(listener) => listener,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        let bound = match listener.local_addr() {
            Ok(bound) => bound,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        *lock(&self.bound_addr) = Some(bound);

        let pool = self
            .transfer
            .get_or_init(|| Arc::new(TransferPool::spawn(self.transfer_thread_count)))
            .clone();
        let handle = self.control.handle();
        let token = handle.alloc_token();
        handle.post(move |ctx| {
            if let Err(err) = ctx.registry.register(&mut listener, token, Interest::READABLE) {
                error!(%bound, ?err, "couldn't register acceptor");
                return;
            }
            debug!(%bound, "listening");
            ctx.set_handler(
                token,
                Box::new(move |_ctx, _ev| {
                    accept_pending(&listener, &creator, &pool);
                    // Accepting never terminates voluntarily.
                    HandlerOutcome::Keep
                }),
            );
        });
        Ok(())
    }

    /// Stops accepting and joins both executors. Accepted connections die
    /// with their transfer threads; a stopped server cannot be restarted.
    pub fn stop(&self) {
        self.control.stop();
        if let Some(pool) = self.transfer.get() {
            pool.stop();
        }
    }

    /// The bound listen address after a successful `start`, the configured
    /// one before.
    pub fn get_listen_address(&self) -> String {
        lock(&self.bound_addr)
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| self.listen_ip.to_string())
    }

    pub fn get_listen_port(&self) -> u16 {
        lock(&self.bound_addr).map(|addr| addr.port()).unwrap_or(self.listen_port)
    }
}

impl Default for TcpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts until the kernel has nothing more for us. Errors are logged and
/// accepting resumes on the next readiness event.
fn accept_pending(listener: &TcpListener, creator: &AssembleCreator, pool: &Arc<TransferPool>) {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                let endpoint = Endpoint::new(peer.ip().to_string(), peer.port());
                let conn =
                    TcpConnection::new(pool.assign(), endpoint, creator(), None, None);
                conn.adopt_stream(stream, peer);
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
            Err(err) => {
                error!(?err, "accept failed");
                break;
            }
        }
    }
}
